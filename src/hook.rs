//! The hook record: detour and vtable hooking, callback lists, and the
//! typed argument/return accessors callbacks use.

pub(crate) mod dispatch;
#[cfg(all(test, target_arch = "x86_64"))]
mod tests;

use std::slice;

use log::{debug, warn};

use crate::bridge::{self, BridgeSpec};
use crate::convention::CallingConvention;
use crate::decoder::Decoder;
use crate::err::HookError;
use crate::exec::{Bound, ExecMemory};
use crate::os::MemoryProtectGuard;
use crate::registers::Registers;
use crate::registry;

const JMP_REL32_SIZE: usize = 5;
const JMP_ABS64_SIZE: usize = 14;

/// Which stage a callback is running in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackType {
    /// Before the original runs
    Pre,
    /// After the original returned (never reached when a pre callback
    /// superceded it)
    Post,
}

/// What a callback tells the dispatcher. Actions from multiple callbacks
/// merge to the largest value.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReturnAction {
    /// No opinion; proceed
    Ignored = 0,
    /// Consumed the event, normal flow unchanged
    Handled = 1,
    /// Replace the return value; the original still runs in the pre stage
    Override = 2,
    /// Skip the original entirely (pre stage only)
    Supercede = 3,
}

/// How the hook reaches its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookMode {
    /// Prologue overwritten with a jump
    DetourJump,
    /// A dispatch-table slot rewritten
    VTableSwap,
}

/// A user callback. Runs inside the hooked call with the register snapshot
/// live; reads and writes flow through the [`Hook`] accessors.
pub type CallbackHandler = unsafe fn(CallbackType, &mut Hook) -> ReturnAction;

enum ModeState {
    Detour {
        // the measured prologue cut; only the first patch_len bytes were
        // overwritten
        original: Vec<u8>,
        patch_len: usize,
    },
    VTable {
        original_ptr: usize,
    },
}

struct BridgeState {
    region: ExecMemory,
    pre_entry: usize,
    post_entry: usize,
    trampoline: usize,
}

/// One hooked address: target, convention, snapshot, callbacks and the
/// generated bridge.
///
/// Create with [`Hook::detour`] or [`Hook::vtable`]; both return the record
/// boxed because the generated code bakes the record's address into its
/// dispatcher calls — it must not move once [`Hook::hook`] has run.
pub struct Hook {
    target: usize,
    convention: Box<dyn CallingConvention>,
    registers: Registers,
    pre: Vec<CallbackHandler>,
    post: Vec<CallbackHandler>,
    mode: ModeState,
    bridge: Option<BridgeState>,
    hooked: bool,
}

impl Hook {
    /// A detour hook: `hook()` overwrites the prologue at `target` with a
    /// jump into the bridge.
    pub fn detour(
        target: usize,
        convention: Box<dyn CallingConvention>,
    ) -> Result<Box<Hook>, HookError> {
        Self::build(target, convention, ModeState::Detour {
            original: Vec::new(),
            patch_len: 0,
        })
    }

    /// A vtable hook: `target` is the address of the table slot whose
    /// pointer `hook()` swaps for the bridge.
    pub fn vtable(
        slot_address: usize,
        convention: Box<dyn CallingConvention>,
    ) -> Result<Box<Hook>, HookError> {
        Self::build(slot_address, convention, ModeState::VTable { original_ptr: 0 })
    }

    fn build(
        target: usize,
        convention: Box<dyn CallingConvention>,
        mode: ModeState,
    ) -> Result<Box<Hook>, HookError> {
        if target == 0 {
            return Err(HookError::NullAddress);
        }
        let registers = Registers::new(convention.registers());
        Ok(Box::new(Hook {
            target,
            convention,
            registers,
            pre: Vec::new(),
            post: Vec::new(),
            mode,
            bridge: None,
            hooked: false,
        }))
    }

    /// The hooked address (function entry or vtable slot).
    #[must_use]
    pub fn address(&self) -> usize {
        self.target
    }

    /// How this hook reaches its target.
    #[must_use]
    pub fn mode(&self) -> HookMode {
        match self.mode {
            ModeState::Detour { .. } => HookMode::DetourJump,
            ModeState::VTable { .. } => HookMode::VTableSwap,
        }
    }

    /// Whether the target is currently patched.
    #[must_use]
    pub fn is_hooked(&self) -> bool {
        self.hooked
    }

    /// The register snapshot. Only meaningful inside a callback.
    #[must_use]
    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    /// The calling convention this hook was built with.
    #[must_use]
    pub fn convention(&self) -> &dyn CallingConvention {
        &*self.convention
    }

    /// A callable address for the original function: the relocated-prologue
    /// trampoline of a detour, or the saved slot pointer of a vtable hook.
    /// `None` before `hook()`.
    #[must_use]
    pub fn original(&self) -> Option<usize> {
        match (&self.mode, &self.bridge) {
            (ModeState::Detour { .. }, Some(b)) => Some(b.trampoline),
            (ModeState::VTable { original_ptr }, _) if *original_ptr != 0 => Some(*original_ptr),
            _ => None,
        }
    }

    /// Register a pre-stage callback. Returns false (and logs) when the
    /// same handler is already registered.
    pub fn add_pre(&mut self, handler: CallbackHandler) -> bool {
        if self.pre.contains(&handler) {
            warn!("pre callback handler was already added");
            return false;
        }
        self.pre.push(handler);
        true
    }

    /// Register a post-stage callback. Returns false (and logs) when the
    /// same handler is already registered.
    pub fn add_post(&mut self, handler: CallbackHandler) -> bool {
        if self.post.contains(&handler) {
            warn!("post callback handler was already added");
            return false;
        }
        self.post.push(handler);
        true
    }

    /// Whether `handler` is registered for the given stage.
    #[must_use]
    pub fn is_callback_registered(&self, ty: CallbackType, handler: CallbackHandler) -> bool {
        match ty {
            CallbackType::Pre => self.pre.contains(&handler),
            CallbackType::Post => self.post.contains(&handler),
        }
    }

    /// Whether any callback is registered for either stage.
    #[must_use]
    pub fn has_callbacks(&self) -> bool {
        !self.pre.is_empty() || !self.post.is_empty()
    }

    /// Drop a previously registered callback. Returns false when it was
    /// not registered.
    pub fn remove_callback(&mut self, ty: CallbackType, handler: CallbackHandler) -> bool {
        let list = match ty {
            CallbackType::Pre => &mut self.pre,
            CallbackType::Post => &mut self.post,
        };
        match list.iter().position(|&h| h == handler) {
            Some(i) => {
                list.remove(i);
                true
            }
            None => {
                warn!("callback handler not registered");
                false
            }
        }
    }

    /// Read argument `index` as `T`.
    ///
    /// # Safety
    ///
    /// Must run inside a callback of this hook, with `T` matching the
    /// declared descriptor.
    pub unsafe fn get_argument<T: Copy>(&self, index: usize) -> Result<T, HookError> {
        let p = self.convention.argument_ptr(index, &self.registers)?;
        Ok(p.cast::<T>().read_unaligned())
    }

    /// Overwrite argument `index`.
    ///
    /// # Safety
    ///
    /// See [`Hook::get_argument`].
    pub unsafe fn set_argument<T: Copy>(&mut self, index: usize, value: T) -> Result<(), HookError> {
        let p = self.convention.argument_ptr(index, &self.registers)?;
        p.cast::<T>().write_unaligned(value);
        self.convention.on_argument_changed(index, &self.registers, p);
        Ok(())
    }

    /// Read the return value as `T`.
    ///
    /// # Safety
    ///
    /// See [`Hook::get_argument`]. Only meaningful in the post stage or
    /// after the callback set it.
    pub unsafe fn get_return<T: Copy>(&self) -> Result<T, HookError> {
        let p = self.convention.return_ptr(&self.registers)?;
        Ok(p.cast::<T>().read_unaligned())
    }

    /// Overwrite the return value. Pair with `Override` or `Supercede` in
    /// the pre stage, or use from a post callback.
    ///
    /// # Safety
    ///
    /// See [`Hook::get_argument`].
    pub unsafe fn set_return<T: Copy>(&mut self, value: T) -> Result<(), HookError> {
        let p = self.convention.return_ptr(&self.registers)?;
        p.cast::<T>().write_unaligned(value);
        self.convention.on_return_changed(&self.registers, p);
        Ok(())
    }

    /// Activate the hook. The target is left byte-for-byte unchanged when
    /// any step fails.
    ///
    /// # Safety
    ///
    /// The target must be a patchable function entry (detour) or a valid
    /// slot (vtable); concurrent execution of the first prologue bytes
    /// during patching is only safe within the single-store window (see
    /// crate docs). The record must not be moved once hooked.
    pub unsafe fn hook(&mut self) -> Result<(), HookError> {
        if self.hooked {
            return Err(HookError::AlreadyHooked);
        }
        // claims the address; everything after must roll back on failure
        registry::register(self.target, self as *mut Hook as usize)?;

        let result = match self.mode() {
            HookMode::DetourJump => self.hook_detour(),
            HookMode::VTableSwap => self.hook_vtable(),
        };
        match result {
            Ok(()) => {
                self.hooked = true;
                debug!(
                    "hooked {:#x} ({:?}), bridge at {:#x}",
                    self.target,
                    self.mode(),
                    self.bridge.as_ref().map_or(0, |b| b.pre_entry)
                );
                Ok(())
            }
            Err(e) => {
                self.bridge = None;
                registry::deregister(self.target);
                Err(e)
            }
        }
    }

    /// Deactivate the hook: restore the original bytes (detour) or the
    /// original slot pointer (vtable) and deregister.
    ///
    /// Threads already inside the bridge finish normally; the executable
    /// region stays alive until the record is dropped, and quiescing such
    /// threads before that is the caller's responsibility.
    ///
    /// # Safety
    ///
    /// See [`Hook::hook`].
    pub unsafe fn unhook(&mut self) -> Result<(), HookError> {
        if !self.hooked {
            return Err(HookError::NotHooked);
        }
        let restore = match &self.mode {
            ModeState::Detour {
                original,
                patch_len,
            } => patch_guard(self.target, *patch_len).run(|| {
                unsafe { write_patch(self.target, &original[..*patch_len]) };
                Ok(())
            }),
            ModeState::VTable { original_ptr } => {
                let slot = self.target as *mut usize;
                let original = *original_ptr;
                MemoryProtectGuard::new(self.target, std::mem::size_of::<usize>()).run(|| {
                    unsafe { slot.write(original) };
                    Ok(())
                })
            }
        };
        // best-effort once entered: the hook counts as removed either way,
        // but a target we could not unpatch still jumps into the bridge,
        // so that region must outlive the record
        if let Err(e) = restore {
            warn!("unhook of {:#x} could not restore the target: {e}", self.target);
            if let Some(state) = self.bridge.take() {
                std::mem::forget(state.region);
            }
        }
        registry::deregister(self.target);
        self.hooked = false;
        debug!("unhooked {:#x}", self.target);
        Ok(())
    }

    unsafe fn hook_detour(&mut self) -> Result<(), HookError> {
        let ptr_width = self.convention.pointer_width();
        let bitness = if ptr_width == 8 { 64 } else { 32 };
        let decoder = Decoder::new(bitness);

        // prefer a region inside every ±2 GiB constraint so a 5-byte
        // jmp rel32 and restricted relocation suffice
        let (region, patch_len, prologue_len, restricted) = if ptr_width == 8 {
            let near_len = decoder.length_of_instructions(self.target, JMP_REL32_SIZE)?;
            let mut bound = Bound::new(self.target as u64);
            for dest in decoder.relative_targets(self.target, near_len)? {
                bound = bound.to_new(dest);
            }
            match ExecMemory::allocate_within(&bound) {
                Ok(region) => (region, JMP_REL32_SIZE, near_len, true),
                Err(_) => {
                    let far_len = decoder.length_of_instructions(self.target, JMP_ABS64_SIZE)?;
                    (ExecMemory::allocate_anywhere()?, JMP_ABS64_SIZE, far_len, false)
                }
            }
        } else {
            let len = decoder.length_of_instructions(self.target, JMP_REL32_SIZE)?;
            (ExecMemory::allocate_anywhere()?, JMP_REL32_SIZE, len, true)
        };

        let bridges = self.emit_bridges(&region)?;

        // trampoline: the relocated prologue, then back into the original
        let mut trampoline = decoder.relocate(
            self.target,
            prologue_len,
            bridges.trampoline_entry,
            restricted,
        )?;
        bridge::write_jmp_abs(
            &mut trampoline,
            bridges.trampoline_entry,
            self.target + prologue_len,
            ptr_width,
        );
        if trampoline.len() > bridges.trampoline_capacity {
            return Err(HookError::BridgeAllocationFailed);
        }
        std::ptr::copy_nonoverlapping(
            trampoline.as_ptr(),
            bridges.trampoline_entry as *mut u8,
            trampoline.len(),
        );

        if log::log_enabled!(log::Level::Debug) {
            let relocated_len = trampoline.len() - bridge::jmp_abs_len(ptr_width);
            if let Ok(listing) = decoder.disassemble(bridges.trampoline_entry, relocated_len) {
                debug!("relocated prologue for {:#x}:\n{}", self.target, listing);
            }
        }

        let original = slice::from_raw_parts(self.target as *const u8, prologue_len).to_vec();
        let patch = patch_bytes(self.target, bridges.pre_entry, patch_len);

        self.bridge = Some(BridgeState {
            region,
            pre_entry: bridges.pre_entry,
            post_entry: bridges.post_entry,
            trampoline: bridges.trampoline_entry,
        });
        patch_guard(self.target, patch_len).run(|| {
            unsafe { write_patch(self.target, &patch) };
            Ok(())
        })?;

        self.mode = ModeState::Detour {
            original,
            patch_len,
        };
        Ok(())
    }

    unsafe fn hook_vtable(&mut self) -> Result<(), HookError> {
        let slot = self.target as *mut usize;
        let original_ptr = slot.read();
        if original_ptr == 0 {
            return Err(HookError::NullAddress);
        }

        let region = ExecMemory::allocate_anywhere()?;
        let bridges = self.emit_bridges(&region)?;

        // no prologue relocation: the continue path calls the original
        // pointer directly
        let ptr_width = self.convention.pointer_width();
        let mut thunk = Vec::new();
        bridge::write_jmp_abs(&mut thunk, bridges.trampoline_entry, original_ptr, ptr_width);
        std::ptr::copy_nonoverlapping(
            thunk.as_ptr(),
            bridges.trampoline_entry as *mut u8,
            thunk.len(),
        );

        let pre_entry = bridges.pre_entry;
        self.bridge = Some(BridgeState {
            region,
            pre_entry: bridges.pre_entry,
            post_entry: bridges.post_entry,
            trampoline: bridges.trampoline_entry,
        });
        MemoryProtectGuard::new(self.target, std::mem::size_of::<usize>()).run(|| {
            unsafe { slot.write(pre_entry) };
            Ok(())
        })?;

        self.mode = ModeState::VTable { original_ptr };
        Ok(())
    }

    unsafe fn emit_bridges(&mut self, region: &ExecMemory) -> Result<bridge::Bridges, HookError> {
        let spec = BridgeSpec {
            hook_ptr: self as *mut Hook as usize,
            on_entry: dispatch::entry_address(),
            on_exit: dispatch::exit_address(),
            regs: &self.registers,
            pop_size: self.convention.pop_size(),
            pointer_width: self.convention.pointer_width(),
        };
        bridge::emit_bridges(region, &spec)
    }

    fn post_entry(&self) -> usize {
        self.bridge.as_ref().map_or(0, |b| b.post_entry)
    }
}

// When the hook drops, it should unhook automatically.
impl Drop for Hook {
    fn drop(&mut self) {
        if self.hooked {
            unsafe { self.unhook().unwrap_or_default() };
        }
    }
}

fn patch_bytes(target: usize, bridge_entry: usize, patch_len: usize) -> Vec<u8> {
    let mut patch = Vec::with_capacity(patch_len);
    if patch_len == JMP_REL32_SIZE {
        // jmp rel32
        let rel = (bridge_entry as i64 - (target as i64 + 5)) as i32;
        patch.push(0xe9);
        patch.extend_from_slice(&rel.to_le_bytes());
    } else {
        // jmp qword ptr [rip+0]
        patch.extend_from_slice(&[0xff, 0x25, 0, 0, 0, 0]);
        patch.extend_from_slice(&(bridge_entry as u64).to_le_bytes());
    }
    patch
}

// The guard must cover the whole qword window write_patch may store to.
fn patch_guard(target: usize, patch_len: usize) -> MemoryProtectGuard {
    let base = target & !7;
    MemoryProtectGuard::new(base, (target - base) + patch_len)
}

// A patch contained in one naturally aligned qword goes in with a single
// volatile store, so a concurrent fetch sees the old or the new prologue,
// never a blend. Wider patches need the caller to quiesce other threads.
unsafe fn write_patch(target: usize, bytes: &[u8]) {
    let qword_base = target & !7;
    if target + bytes.len() <= qword_base + 8 {
        let mut word = (qword_base as *const u64).read_volatile().to_le_bytes();
        word[target - qword_base..target - qword_base + bytes.len()].copy_from_slice(bytes);
        (qword_base as *mut u64).write_volatile(u64::from_le_bytes(word));
    } else {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), target as *mut u8, bytes.len());
    }
}
