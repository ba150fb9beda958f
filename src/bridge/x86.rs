//! x86 bridge emission.
//!
//! 32-bit mode has direct absolute addressing (`mov [disp32], reg`), so
//! every snapshot slot is stored and loaded in one instruction and no base
//! scratch is needed. The dispatcher is called `cdecl`.

use super::{BridgeSpec, SUPERCEDE};
use crate::err::HookError;
use crate::registers::Register;

// Emits the pre-bridge; returns the code and the offset of the rel32 of
// the trampoline jump to patch once the trampoline address is known.
pub(super) fn write_pre_bridge(spec: &BridgeSpec) -> Result<(Vec<u8>, usize), HookError> {
    // ecx carries the return address into its slot after the saves
    if !spec.regs.tracked().contains(&Register::Ecx) {
        return Err(HookError::UnknownRegister(Register::Ecx));
    }

    let mut buf = Vec::with_capacity(256);
    write_save_registers(&mut buf, spec)?;

    // mov ecx, [esp]
    buf.extend_from_slice(&[0x8b, 0x0c, 0x24]);
    // mov [ret_slot], ecx
    buf.extend_from_slice(&[0x89, 0x0d]);
    buf.extend_from_slice(&(spec.regs.return_address_ptr() as u32).to_le_bytes());

    write_dispatch_call(&mut buf, spec.hook_ptr, spec.on_entry);

    let restore = restore_registers(spec)?;

    // cmp eax, SUPERCEDE
    buf.extend_from_slice(&[0x83, 0xf8, SUPERCEDE]);
    // je _supercede (over the restore and the trampoline jmp)
    buf.extend_from_slice(&[0x0f, 0x84]);
    buf.extend_from_slice(&((restore.len() + 5) as u32).to_le_bytes());

    // continue into the original: the dispatcher already swapped [esp]
    buf.extend_from_slice(&restore);
    // jmp rel32 (trampoline)
    buf.push(0xe9);
    let patch = buf.len();
    buf.extend_from_slice(&0u32.to_le_bytes());

    // _supercede
    buf.extend_from_slice(&restore);
    write_ret(&mut buf, spec.pop_size);

    Ok((buf, patch))
}

pub(super) fn write_post_bridge(spec: &BridgeSpec) -> Result<Vec<u8>, HookError> {
    let mut buf = Vec::with_capacity(256);
    write_save_registers(&mut buf, spec)?;

    write_dispatch_call(&mut buf, spec.hook_ptr, spec.on_exit);

    // eax carries the caller's return address
    buf.push(0x50); // push eax
    let restore = restore_registers(spec)?;
    buf.extend_from_slice(&restore);
    buf.push(0xc3); // ret

    Ok(buf)
}

fn write_save_registers(buf: &mut Vec<u8>, spec: &BridgeSpec) -> Result<(), HookError> {
    for (i, &reg) in spec.regs.tracked().iter().enumerate() {
        if reg.width() != 4 {
            return Err(HookError::UnknownRegister(reg));
        }
        // mov [slot], reg
        buf.extend_from_slice(&[0x89, 0x05 | (reg.encoding() << 3)]);
        buf.extend_from_slice(&(spec.regs.slot_address(i) as u32).to_le_bytes());
    }
    Ok(())
}

fn restore_registers(spec: &BridgeSpec) -> Result<Vec<u8>, HookError> {
    let tracked = spec.regs.tracked();
    let mut buf = Vec::with_capacity(64);
    for (i, &reg) in tracked.iter().enumerate() {
        // eax last (it carries dispatcher results until now), esp never
        if reg == Register::Eax || reg == Register::Esp {
            continue;
        }
        // mov reg, [slot]
        buf.extend_from_slice(&[0x8b, 0x05 | (reg.encoding() << 3)]);
        buf.extend_from_slice(&(spec.regs.slot_address(i) as u32).to_le_bytes());
    }
    if let Some(i) = tracked.iter().position(|&r| r == Register::Eax) {
        buf.extend_from_slice(&[0x8b, 0x05]);
        buf.extend_from_slice(&(spec.regs.slot_address(i) as u32).to_le_bytes());
    }
    Ok(buf)
}

fn write_dispatch_call(buf: &mut Vec<u8>, hook_ptr: usize, func: usize) {
    // push hook_ptr
    buf.push(0x68);
    buf.extend_from_slice(&(hook_ptr as u32).to_le_bytes());
    // mov eax, func
    buf.push(0xb8);
    buf.extend_from_slice(&(func as u32).to_le_bytes());
    // call eax
    buf.extend_from_slice(&[0xff, 0xd0]);
    // add esp, 4
    buf.extend_from_slice(&[0x83, 0xc4, 0x04]);
}

fn write_ret(buf: &mut Vec<u8>, pop_size: usize) {
    if pop_size == 0 {
        buf.push(0xc3);
    } else {
        buf.push(0xc2);
        buf.extend_from_slice(&(pop_size as u16).to_le_bytes());
    }
}
