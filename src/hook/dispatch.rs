//! The C-ABI dispatchers the generated bridges call.
//!
//! `abihook_on_hook_entry` runs the pre callbacks, merges their actions and
//! arranges for the post-bridge to run by swapping the on-stack return
//! address; `abihook_on_hook_exit` restores the entry-time argument and
//! return state, runs the post callbacks and hands the bridge the real
//! return address to resume at.
//!
//! All per-call state (saved arguments, saved return values, the merged
//! pre action, and the swapped return addresses) lives in thread-local
//! LIFO frames keyed by target address, so concurrent entries and nested
//! hooks unwind independently per thread.

use std::cell::RefCell;
use std::collections::HashMap;

use log::error;

use super::{CallbackType, Hook, ReturnAction};
use crate::registers::Register;
use crate::registry;

#[derive(Default)]
struct HookFrames {
    pre_actions: Vec<ReturnAction>,
    saved_returns: Vec<Vec<u8>>,
    saved_args: Vec<Vec<u8>>,
    // (address of the stack slot that held it, return address)
    ret_addrs: Vec<(usize, usize)>,
}

thread_local! {
    static FRAMES: RefCell<HashMap<usize, HookFrames>> = RefCell::new(HashMap::new());
}

fn with_frames<R>(target: usize, f: impl FnOnce(&mut HookFrames) -> R) -> R {
    FRAMES.with(|frames| f(frames.borrow_mut().entry(target).or_default()))
}

pub(crate) fn entry_address() -> usize {
    abihook_on_hook_entry as usize
}

pub(crate) fn exit_address() -> usize {
    abihook_on_hook_exit as usize
}

// The bridges call with the win64 ABI on x86-64 hosts regardless of OS
// (one emitter serves both), and plain cdecl on x86.

#[cfg(target_arch = "x86_64")]
unsafe extern "win64" fn abihook_on_hook_entry(hook: *mut Hook) -> u32 {
    on_entry(&mut *hook) as u32
}

#[cfg(not(target_arch = "x86_64"))]
unsafe extern "C" fn abihook_on_hook_entry(hook: *mut Hook) -> u32 {
    on_entry(&mut *hook) as u32
}

#[cfg(target_arch = "x86_64")]
unsafe extern "win64" fn abihook_on_hook_exit(hook: *mut Hook) -> usize {
    on_exit(&mut *hook)
}

#[cfg(not(target_arch = "x86_64"))]
unsafe extern "C" fn abihook_on_hook_exit(hook: *mut Hook) -> usize {
    on_exit(&mut *hook)
}

unsafe fn on_entry(hook: &mut Hook) -> ReturnAction {
    if registry::lookup(hook.target).is_none() {
        // a running bridge with no registry record is library corruption;
        // keep going on the baked pointer rather than unwind into
        // generated code
        error!(
            "no registry record for running bridge at {:#x}",
            hook.target
        );
    }

    // aggregates returned through a hidden pointer: seed RAX from the
    // carrying register so return_ptr indirects correctly at both stages
    if let Some(reg) = hook.convention.hidden_return_register() {
        if let Ok(ptr) = hook.registers.get::<u64>(reg) {
            let _ = hook.registers.set::<u64>(Register::Rax, ptr);
        }
    }

    let action = run_callbacks(hook, CallbackType::Pre);

    if action < ReturnAction::Supercede {
        // the original will run: arrange the post stage and snapshot the
        // state it must see again
        let stack_ptr = stack_pointer(hook);
        let slot = stack_ptr as *mut usize;
        let return_addr = slot.read();
        slot.write(hook.post_entry());

        // the pushes stay unconditional so every pop at the exit stage
        // matches this entry, even if a serialization failed
        let saved_return = if action >= ReturnAction::Override {
            Some(
                hook.convention
                    .save_return_value(&hook.registers)
                    .unwrap_or_default(),
            )
        } else {
            None
        };
        let saved_args = hook
            .convention
            .save_call_arguments(&hook.registers)
            .unwrap_or_default();

        with_frames(hook.target, |frames| {
            frames.ret_addrs.push((stack_ptr, return_addr));
            frames.pre_actions.push(action);
            if let Some(buf) = saved_return {
                frames.saved_returns.push(buf);
            }
            frames.saved_args.push(saved_args);
        });
    }
    action
}

unsafe fn on_exit(hook: &mut Hook) -> usize {
    let (pre_action, saved_args, saved_return) = with_frames(hook.target, |frames| {
        let action = frames.pre_actions.pop();
        let args = frames.saved_args.pop();
        let ret = match action {
            Some(a) if a >= ReturnAction::Override => frames.saved_returns.pop(),
            _ => None,
        };
        (action, args, ret)
    });

    let Some(pre_action) = pre_action else {
        error!(
            "post stage at {:#x} found no pre-stage frame",
            hook.target
        );
        return recover_return_address(hook);
    };

    // entry-time arguments first, so post callbacks observe them even
    // after the callee reused the space; then an Override value goes back
    // over whatever the original returned
    if let Some(buf) = saved_args {
        let expected = hook.convention.arg_stack_size() + hook.convention.arg_register_size();
        if buf.len() >= expected {
            let _ = hook.convention.restore_call_arguments(&hook.registers, &buf);
        }
    }
    if pre_action >= ReturnAction::Override {
        if let Some(buf) = saved_return {
            let _ = hook.convention.restore_return_value(&hook.registers, &buf);
        } else {
            error!("return-value stack empty on restore at {:#x}", hook.target);
        }
    }

    run_callbacks(hook, CallbackType::Post);
    recover_return_address(hook)
}

unsafe fn run_callbacks(hook: &mut Hook, ty: CallbackType) -> ReturnAction {
    let handlers = match ty {
        CallbackType::Pre => hook.pre.clone(),
        CallbackType::Post => hook.post.clone(),
    };
    let mut merged = ReturnAction::Ignored;
    for handler in handlers {
        let result = handler(ty, hook);
        if result > merged {
            merged = result;
        }
    }
    merged
}

// The frame key is the address of the stack slot the return address lived
// in. At the post stage the callee has popped that slot and its
// callee-clean bytes, so the key is recomputed from the current stack
// pointer.
unsafe fn recover_return_address(hook: &mut Hook) -> usize {
    let width = hook.convention.pointer_width();
    let key = stack_pointer(hook)
        .wrapping_sub(width)
        .wrapping_sub(hook.convention.pop_size());
    let found = with_frames(hook.target, |frames| {
        frames
            .ret_addrs
            .iter()
            .rposition(|&(slot, _)| slot == key)
            .map(|i| frames.ret_addrs.remove(i).1)
    });
    match found {
        Some(addr) => addr,
        None => {
            // resuming at an unknown address would be worse than a clean
            // crash; 0 faults immediately and keeps the stack readable
            error!(
                "no saved return address for stack slot {:#x} at {:#x}",
                key, hook.target
            );
            0
        }
    }
}

unsafe fn stack_pointer(hook: &Hook) -> usize {
    if hook.convention.pointer_width() == 8 {
        hook.registers
            .get::<u64>(Register::Rsp)
            .unwrap_or_default() as usize
    } else {
        hook.registers
            .get::<u32>(Register::Esp)
            .unwrap_or_default() as usize
    }
}

#[cfg(test)]
pub(crate) fn frame_depth(target: usize) -> usize {
    FRAMES.with(|frames| {
        frames.borrow().get(&target).map_or(0, |f| {
            f.pre_actions.len() + f.saved_args.len() + f.saved_returns.len() + f.ret_addrs.len()
        })
    })
}
