//! Bridge code generation.
//!
//! Every hook gets two generated entry points in its executable region. The
//! pre-bridge receives the patched jump (or the vtable call), saves the
//! convention's registers into the snapshot slots, captures the return
//! address and calls the entry dispatcher with the hook-record pointer
//! baked in as an immediate. Unless the dispatcher reports `Supercede` it
//! has swapped the on-stack return address to the post-bridge, so the
//! bridge restores registers and tail-jumps into the trampoline; on
//! `Supercede` it restores and returns straight to the caller, popping the
//! callee-clean bytes itself. The post-bridge runs when the original
//! returns: it saves the registers again (that captures the return value),
//! asks the exit dispatcher for the real return address, pushes it,
//! restores and returns.
//!
//! The emitters write raw bytes with the mnemonics alongside; the snapshot
//! slot addresses, dispatcher addresses and the hook pointer are all
//! absolute immediates, so the generated code itself is position-independent
//! apart from the patched trampoline jump.

#[cfg(test)]
mod tests;
pub(crate) mod x64;
pub(crate) mod x86;

use crate::err::HookError;
use crate::exec::ExecMemory;
use crate::registers::Registers;

// Merged-action value the bridges compare against; keep in sync with
// `ReturnAction::Supercede`.
pub(crate) const SUPERCEDE: u8 = 3;

pub(crate) struct BridgeSpec<'a> {
    /// Baked into the generated dispatcher-argument setup.
    pub hook_ptr: usize,
    pub on_entry: usize,
    pub on_exit: usize,
    pub regs: &'a Registers,
    pub pop_size: usize,
    /// 4 selects the x86 emitters, 8 the x86-64 ones.
    pub pointer_width: usize,
}

/// Where the generated pieces landed inside the hook's region.
pub(crate) struct Bridges {
    pub pre_entry: usize,
    pub post_entry: usize,
    /// The hook writes the trampoline (relocated prologue or an absolute
    /// jump to the original) starting here.
    pub trampoline_entry: usize,
    pub trampoline_capacity: usize,
}

/// Emit both bridges into `region` and wire the pre-bridge's continue path
/// to the trampoline slot at the returned address.
///
/// # Safety
///
/// `region` must be writable and executable and stay alive as long as the
/// generated code can run.
pub(crate) unsafe fn emit_bridges(
    region: &ExecMemory,
    spec: &BridgeSpec,
) -> Result<Bridges, HookError> {
    let (mut pre, pre_patch) = if spec.pointer_width == 8 {
        x64::write_pre_bridge(spec)?
    } else {
        x86::write_pre_bridge(spec)?
    };
    let post = if spec.pointer_width == 8 {
        x64::write_post_bridge(spec)?
    } else {
        x86::write_post_bridge(spec)?
    };

    let pre_entry = region.addr;
    let post_entry = align16(pre_entry + pre.len());
    let trampoline_entry = align16(post_entry + post.len());
    if trampoline_entry >= region.addr + region.len {
        return Err(HookError::BridgeAllocationFailed);
    }

    // wire the continue path now that the trampoline address is known
    if spec.pointer_width == 8 {
        pre[pre_patch..pre_patch + 8].copy_from_slice(&(trampoline_entry as u64).to_le_bytes());
    } else {
        let rel = trampoline_entry as i64 - (pre_entry + pre_patch + 4) as i64;
        pre[pre_patch..pre_patch + 4].copy_from_slice(&(rel as i32).to_le_bytes());
    }

    copy_code(pre_entry, &pre);
    copy_code(post_entry, &post);

    Ok(Bridges {
        pre_entry,
        post_entry,
        trampoline_entry,
        trampoline_capacity: region.addr + region.len - trampoline_entry,
    })
}

/// An absolute jump usable anywhere in the address space: `jmp [rip+0]`
/// with the pointer inline on x86-64, `jmp rel32` on x86 (every distance
/// wraps into rel32 there).
pub(crate) fn write_jmp_abs(buf: &mut Vec<u8>, at_addr: usize, dest: usize, ptr_width: usize) {
    if ptr_width == 8 {
        // jmp qword ptr [rip+0]
        buf.extend_from_slice(&[0xff, 0x25, 0, 0, 0, 0]);
        buf.extend_from_slice(&(dest as u64).to_le_bytes());
    } else {
        let rel = (dest as u32).wrapping_sub(at_addr as u32 + buf.len() as u32 + 5);
        buf.push(0xe9);
        buf.extend_from_slice(&rel.to_le_bytes());
    }
}

/// Byte length of [`write_jmp_abs`] output.
pub(crate) fn jmp_abs_len(ptr_width: usize) -> usize {
    if ptr_width == 8 {
        14
    } else {
        5
    }
}

fn align16(addr: usize) -> usize {
    (addr + 15) & !15
}

unsafe fn copy_code(dest: usize, code: &[u8]) {
    std::ptr::copy_nonoverlapping(code.as_ptr(), dest as *mut u8, code.len());
}
