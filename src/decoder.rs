//! Instruction decoding, prologue measurement and relocation.
//!
//! Wraps the `iced_x86` decoder behind the three operations hooking needs:
//! finding a whole-instruction cut of at least N bytes, rewriting a cut so
//! it executes at a new address, and locating the relative operands the
//! allocator must keep within displacement range.

mod islands;

use std::slice;

use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Decoder as InstDecoder, DecoderOptions, FlowControl,
    Formatter, Instruction, InstructionBlock, Mnemonic, NasmFormatter,
};

use crate::err::HookError;

const MAX_INST_LEN: usize = 15;

/// The relative-operand categories reported by
/// [`Decoder::find_relative_instructions_of_type`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelativeInstruction {
    /// Near relative `call`
    Call,
    /// Conditional, loop and unconditional relative branches
    Branch,
    /// A memory operand addressed as `[rip+disp32]`
    RipRelative,
}

/// Decodes and relocates machine code for one bitness (32 or 64).
pub struct Decoder {
    bitness: u32,
}

impl Decoder {
    /// A decoder for the given bitness (32 or 64).
    #[must_use]
    pub fn new(bitness: u32) -> Self {
        debug_assert!(bitness == 32 || bitness == 64);
        Self { bitness }
    }

    /// The smallest byte count >= `min_bytes` covering whole instructions
    /// at `addr`.
    ///
    /// Fails with `DecodeFailure` on an undecodable byte and with
    /// `PrologueTooShort` when the function ends (`ret`, `int3`) before
    /// `min_bytes` are available.
    ///
    /// # Safety
    ///
    /// `addr` must be readable for `min_bytes + 15` bytes.
    pub unsafe fn length_of_instructions(
        &self,
        addr: usize,
        min_bytes: usize,
    ) -> Result<usize, HookError> {
        let insts = self.decode_min(addr, min_bytes)?;
        Ok(insts.iter().map(Instruction::len).sum())
    }

    /// Rewrite `length` bytes of instructions from `source` so they run at
    /// `target` with unchanged semantics.
    ///
    /// With `restricted` set, every displacement must still fit its 32-bit
    /// form after the move; `OutOfRangeRelocation` is reported otherwise.
    /// Unrestricted 64-bit relocation falls back to indirect islands with
    /// 64-bit address material.
    ///
    /// # Safety
    ///
    /// `[source, source+length)` must hold the instructions previously
    /// measured by [`Decoder::length_of_instructions`].
    pub unsafe fn relocate(
        &self,
        source: usize,
        length: usize,
        target: usize,
        restricted: bool,
    ) -> Result<Vec<u8>, HookError> {
        let insts = self.decode_exact(source, length)?;

        match self.encode_in_place(&insts, target as u64) {
            Ok(code) => Ok(code),
            Err(_) if restricted => Err(HookError::OutOfRangeRelocation),
            Err(_) if self.bitness == 64 => islands::encode_with_islands(&insts, target as u64),
            Err(_) => Err(HookError::OutOfRangeRelocation),
        }
    }

    /// Pointers to the displacement bytes of every relative instruction of
    /// `kind` within the first `length` bytes at `start`.
    ///
    /// # Safety
    ///
    /// See [`Decoder::relocate`].
    pub unsafe fn find_relative_instructions_of_type(
        &self,
        start: usize,
        kind: RelativeInstruction,
        length: usize,
    ) -> Result<Vec<*mut u8>, HookError> {
        let insts = self.decode_exact(start, length)?;
        let mut found = Vec::new();
        for inst in &insts {
            let inst_start = inst.ip() as usize;
            match kind {
                RelativeInstruction::Call if is_relative_call(inst) => {
                    found.push((inst_start + inst.len() - branch_disp_width(inst)) as *mut u8);
                }
                RelativeInstruction::Branch if is_relative_branch(inst) => {
                    found.push((inst_start + inst.len() - branch_disp_width(inst)) as *mut u8);
                }
                RelativeInstruction::RipRelative if inst.is_ip_rel_memory_operand() => {
                    let co = self.constant_offsets(inst);
                    found.push((inst_start + co.displacement_offset()) as *mut u8);
                }
                _ => {}
            }
        }
        Ok(found)
    }

    /// The lowest and highest absolute address referenced by a RIP-relative
    /// memory operand in the range, or `None` when there is none.
    ///
    /// The allocator intersects this with the patch displacement to pick a
    /// placement that keeps restricted relocation encodable.
    ///
    /// # Safety
    ///
    /// See [`Decoder::relocate`].
    pub unsafe fn rip_relative_bounds(
        &self,
        source: usize,
        length: usize,
    ) -> Result<Option<(u64, u64)>, HookError> {
        let insts = self.decode_exact(source, length)?;
        let mut bounds: Option<(u64, u64)> = None;
        for inst in &insts {
            if inst.is_ip_rel_memory_operand() {
                let addr = inst.ip_rel_memory_address();
                bounds = Some(match bounds {
                    Some((lo, hi)) => (lo.min(addr), hi.max(addr)),
                    None => (addr, addr),
                });
            }
        }
        Ok(bounds)
    }

    /// Render the instructions in the range as one line per instruction
    /// (`address: mnemonic operands`), for diagnostics and logging.
    ///
    /// # Safety
    ///
    /// See [`Decoder::relocate`].
    pub unsafe fn disassemble(&self, addr: usize, length: usize) -> Result<String, HookError> {
        let insts = self.decode_exact(addr, length)?;
        let mut formatter = NasmFormatter::new();
        let mut out = String::new();
        for inst in &insts {
            let mut text = String::new();
            formatter.format(inst, &mut text);
            out.push_str(&format!("{:#x}: {}\n", inst.ip(), text));
        }
        Ok(out)
    }

    // Every absolute address a relative operand in the range refers to
    // (branch targets and RIP-relative accesses). Used to fold the
    // trampoline placement window.
    pub(crate) unsafe fn relative_targets(
        &self,
        source: usize,
        length: usize,
    ) -> Result<Vec<u64>, HookError> {
        let insts = self.decode_exact(source, length)?;
        let mut targets = Vec::new();
        for inst in &insts {
            if is_relative_call(inst) || is_relative_branch(inst) {
                targets.push(inst.near_branch_target());
            } else if inst.is_ip_rel_memory_operand() {
                targets.push(inst.ip_rel_memory_address());
            }
        }
        Ok(targets)
    }

    // Relocation with every displacement kept in its 32-bit (or shorter)
    // form. Near calls that target their own fall-through address are the
    // position-query idiom; the original return address is materialized as
    // an immediate instead of re-pointing the call.
    fn encode_in_place(&self, insts: &[Instruction], target: u64) -> Result<Vec<u8>, HookError> {
        let mut out: Vec<u8> = Vec::new();
        let mut pending: Vec<Instruction> = Vec::new();
        for inst in insts {
            if is_relative_call(inst) && inst.near_branch_target() == inst.next_ip() {
                self.flush_block(&mut pending, &mut out, target)?;
                push_immediate_address(&mut out, inst.next_ip(), self.bitness);
            } else {
                pending.push(*inst);
            }
        }
        self.flush_block(&mut pending, &mut out, target)?;
        Ok(out)
    }

    fn flush_block(
        &self,
        pending: &mut Vec<Instruction>,
        out: &mut Vec<u8>,
        target: u64,
    ) -> Result<(), HookError> {
        if pending.is_empty() {
            return Ok(());
        }
        let block = InstructionBlock::new(pending, target + out.len() as u64);
        let encoded = BlockEncoder::encode(self.bitness, block, BlockEncoderOptions::NONE)
            .map_err(|_| HookError::OutOfRangeRelocation)?;
        out.extend_from_slice(&encoded.code_buffer);
        pending.clear();
        Ok(())
    }

    fn constant_offsets(&self, inst: &Instruction) -> iced_x86::ConstantOffsets {
        // re-decode the single instruction to recover its operand offsets
        let code = unsafe { slice::from_raw_parts(inst.ip() as *const u8, inst.len()) };
        let mut decoder = InstDecoder::new(self.bitness, code, DecoderOptions::NONE);
        decoder.set_ip(inst.ip());
        let decoded = decoder.decode();
        decoder.get_constant_offsets(&decoded)
    }

    unsafe fn decode_min(
        &self,
        addr: usize,
        min_bytes: usize,
    ) -> Result<Vec<Instruction>, HookError> {
        let code = slice::from_raw_parts(addr as *const u8, min_bytes + MAX_INST_LEN);
        let mut decoder = InstDecoder::new(self.bitness, code, DecoderOptions::NONE);
        decoder.set_ip(addr as u64);

        let mut total = 0;
        let mut insts = Vec::new();
        while total < min_bytes {
            let inst = decoder.decode();
            if inst.is_invalid() {
                return Err(HookError::DecodeFailure);
            }
            total += inst.len();
            insts.push(inst);
            if total < min_bytes && function_ends_at(&inst) {
                return Err(HookError::PrologueTooShort);
            }
        }
        Ok(insts)
    }

    unsafe fn decode_exact(
        &self,
        addr: usize,
        length: usize,
    ) -> Result<Vec<Instruction>, HookError> {
        let code = slice::from_raw_parts(addr as *const u8, length);
        let mut decoder = InstDecoder::new(self.bitness, code, DecoderOptions::NONE);
        decoder.set_ip(addr as u64);

        let mut insts = Vec::new();
        while decoder.can_decode() {
            let inst = decoder.decode();
            if inst.is_invalid() {
                return Err(HookError::DecodeFailure);
            }
            insts.push(inst);
        }
        if decoder.position() != length {
            return Err(HookError::DecodeFailure);
        }
        Ok(insts)
    }
}

fn function_ends_at(inst: &Instruction) -> bool {
    matches!(inst.flow_control(), FlowControl::Return) || inst.mnemonic() == Mnemonic::Int3
}

fn is_relative_call(inst: &Instruction) -> bool {
    matches!(inst.flow_control(), FlowControl::Call) && (inst.is_call_near() || inst.is_call_far())
}

fn is_relative_branch(inst: &Instruction) -> bool {
    match inst.flow_control() {
        FlowControl::UnconditionalBranch => inst.is_jmp_short_or_near(),
        FlowControl::ConditionalBranch => {
            inst.is_jcc_short_or_near() || inst.is_jcx_short() || inst.is_loop() || inst.is_loopcc()
        }
        _ => false,
    }
}

// Relative branch displacements are the trailing bytes of the instruction;
// every 2-byte form carries a rel8.
fn branch_disp_width(inst: &Instruction) -> usize {
    if inst.len() == 2 {
        1
    } else {
        4
    }
}

// push the literal address onto the stack: the replacement for a
// call-to-next-instruction once the code has moved.
fn push_immediate_address(out: &mut Vec<u8>, addr: u64, bitness: u32) {
    if bitness == 32 {
        // push imm32
        out.push(0x68);
        out.extend_from_slice(&(addr as u32).to_le_bytes());
    } else {
        // push imm32 (sign-extended); patch the high dword in place
        out.push(0x68);
        out.extend_from_slice(&((addr & 0xffff_ffff) as u32).to_le_bytes());
        // mov dword ptr [rsp+4], high
        out.extend_from_slice(&[0xc7, 0x44, 0x24, 0x04]);
        out.extend_from_slice(&((addr >> 32) as u32).to_le_bytes());
    }
}
