//! x86-64 bridge emission.
//!
//! Register saves address the snapshot slots as `[rax+disp32]` off one
//! 64-bit base immediate; RAX itself goes through the direct moffs64 store
//! first so it can serve as the base scratch. The dispatcher is called
//! through the `win64` ABI on every host OS, so one emitter covers both
//! Windows and System V targets.

use super::{BridgeSpec, SUPERCEDE};
use crate::err::HookError;
use crate::registers::Register;

// Emits the pre-bridge; returns the code and the offset of the 8-byte
// trampoline-address cell to patch once the trampoline address is known.
pub(super) fn write_pre_bridge(spec: &BridgeSpec) -> Result<(Vec<u8>, usize), HookError> {
    // rcx carries the return address into its slot after the saves
    if !spec.regs.tracked().contains(&Register::Rcx) {
        return Err(HookError::UnknownRegister(Register::Rcx));
    }

    let mut buf = Vec::with_capacity(512);
    write_save_registers(&mut buf, spec)?;

    // the save sequence leaves the slot base in rax
    let ret_off = (spec.regs.tracked().len() * 16) as u32;
    // mov rcx, [rsp]
    buf.extend_from_slice(&[0x48, 0x8b, 0x0c, 0x24]);
    // mov [rax+ret_off], rcx
    buf.extend_from_slice(&[0x48, 0x89, 0x88]);
    buf.extend_from_slice(&ret_off.to_le_bytes());

    // entry dispatcher, win64 ABI: 0x20 shadow + 8 to realign rsp
    write_dispatch_call(&mut buf, spec.hook_ptr, spec.on_entry, 0x28);

    let restore = restore_registers(spec)?;

    // cmp eax, SUPERCEDE
    buf.extend_from_slice(&[0x83, 0xf8, SUPERCEDE]);
    // je _supercede (over the restore and the trampoline jump)
    buf.extend_from_slice(&[0x0f, 0x84]);
    buf.extend_from_slice(&((restore.len() + 14) as u32).to_le_bytes());

    // continue into the original: the dispatcher already swapped [rsp]
    buf.extend_from_slice(&restore);
    // jmp qword ptr [rip+0]
    buf.extend_from_slice(&[0xff, 0x25, 0, 0, 0, 0]);
    let patch = buf.len();
    buf.extend_from_slice(&0u64.to_le_bytes());

    // _supercede: the return slot already carries the callback's value
    buf.extend_from_slice(&restore);
    write_ret(&mut buf, spec.pop_size);

    Ok((buf, patch))
}

pub(super) fn write_post_bridge(spec: &BridgeSpec) -> Result<Vec<u8>, HookError> {
    let mut buf = Vec::with_capacity(512);
    write_save_registers(&mut buf, spec)?;

    // exit dispatcher; rsp is 16-aligned here, shadow space only
    write_dispatch_call(&mut buf, spec.hook_ptr, spec.on_exit, 0x20);

    // rax carries the caller's return address; park it on the stack where
    // the final ret will consume it
    buf.push(0x50); // push rax
    let restore = restore_registers(spec)?;
    buf.extend_from_slice(&restore);
    buf.push(0xc3); // ret

    Ok(buf)
}

fn write_save_registers(buf: &mut Vec<u8>, spec: &BridgeSpec) -> Result<(), HookError> {
    let tracked = spec.regs.tracked();
    let rax_idx = tracked
        .iter()
        .position(|&r| r == Register::Rax)
        .ok_or(HookError::UnknownRegister(Register::Rax))?;

    // mov [moffs64], rax
    buf.extend_from_slice(&[0x48, 0xa3]);
    buf.extend_from_slice(&(spec.regs.slot_address(rax_idx) as u64).to_le_bytes());
    // mov rax, slot_base
    buf.extend_from_slice(&[0x48, 0xb8]);
    buf.extend_from_slice(&(spec.regs.slot_address(0) as u64).to_le_bytes());

    for (i, &reg) in tracked.iter().enumerate() {
        if reg == Register::Rax {
            continue;
        }
        let disp = (i * 16) as u32;
        let enc = reg.encoding();
        if reg.is_vector() {
            // movaps [rax+disp32], xmmN
            if enc >= 8 {
                buf.push(0x44);
            }
            buf.extend_from_slice(&[0x0f, 0x29, 0x80 | ((enc & 7) << 3)]);
            buf.extend_from_slice(&disp.to_le_bytes());
        } else if reg.width() == 8 {
            // mov [rax+disp32], reg
            let rex = 0x48 | if enc >= 8 { 0x04 } else { 0 };
            buf.extend_from_slice(&[rex, 0x89, 0x80 | ((enc & 7) << 3)]);
            buf.extend_from_slice(&disp.to_le_bytes());
        } else {
            return Err(HookError::UnknownRegister(reg));
        }
    }
    Ok(())
}

fn restore_registers(spec: &BridgeSpec) -> Result<Vec<u8>, HookError> {
    let tracked = spec.regs.tracked();
    let rax_idx = tracked
        .iter()
        .position(|&r| r == Register::Rax)
        .ok_or(HookError::UnknownRegister(Register::Rax))?;

    let mut buf = Vec::with_capacity(256);
    // mov rax, slot_base
    buf.extend_from_slice(&[0x48, 0xb8]);
    buf.extend_from_slice(&(spec.regs.slot_address(0) as u64).to_le_bytes());

    for (i, &reg) in tracked.iter().enumerate() {
        // rax is reloaded last; rsp would tear the frame under us
        if reg == Register::Rax || reg == Register::Rsp {
            continue;
        }
        let disp = (i * 16) as u32;
        let enc = reg.encoding();
        if reg.is_vector() {
            // movaps xmmN, [rax+disp32]
            if enc >= 8 {
                buf.push(0x44);
            }
            buf.extend_from_slice(&[0x0f, 0x28, 0x80 | ((enc & 7) << 3)]);
            buf.extend_from_slice(&disp.to_le_bytes());
        } else {
            // mov reg, [rax+disp32]
            let rex = 0x48 | if enc >= 8 { 0x04 } else { 0 };
            buf.extend_from_slice(&[rex, 0x8b, 0x80 | ((enc & 7) << 3)]);
            buf.extend_from_slice(&disp.to_le_bytes());
        }
    }

    // mov rax, [moffs64]
    buf.extend_from_slice(&[0x48, 0xa1]);
    buf.extend_from_slice(&(spec.regs.slot_address(rax_idx) as u64).to_le_bytes());
    Ok(buf)
}

fn write_dispatch_call(buf: &mut Vec<u8>, hook_ptr: usize, func: usize, frame: u8) {
    // mov rcx, hook_ptr
    buf.extend_from_slice(&[0x48, 0xb9]);
    buf.extend_from_slice(&(hook_ptr as u64).to_le_bytes());
    // sub rsp, frame
    buf.extend_from_slice(&[0x48, 0x83, 0xec, frame]);
    // mov rax, func
    buf.extend_from_slice(&[0x48, 0xb8]);
    buf.extend_from_slice(&(func as u64).to_le_bytes());
    // call rax
    buf.extend_from_slice(&[0xff, 0xd0]);
    // add rsp, frame
    buf.extend_from_slice(&[0x48, 0x83, 0xc4, frame]);
}

fn write_ret(buf: &mut Vec<u8>, pop_size: usize) {
    if pop_size == 0 {
        buf.push(0xc3);
    } else {
        buf.push(0xc2);
        buf.extend_from_slice(&(pop_size as u16).to_le_bytes());
    }
}
