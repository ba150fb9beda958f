//! Relocation beyond ±2 GiB.
//!
//! Instructions with relative operands cannot keep a 32-bit displacement
//! across such a move. Each one is rewritten as an indirect form (`jmp/call
//! qword ptr [rip+disp]`) whose displacement points into an 8-byte address
//! table appended after the code, or as an inline sequence that
//! materializes the 64-bit address through a scratch register. Branches
//! that stay inside the moved range are re-pointed at their relocated
//! counterparts instead of the table.

use std::io::{Cursor, Seek, SeekFrom, Write};

use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Code, Encoder, FlowControl, Instruction, InstructionBlock,
    MemoryOperand, Mnemonic, Register,
};

use crate::err::HookError;

// Where a rewritten instruction wants an address-table entry: the rel32
// patch site, the address the rel32 is measured from, and the absolute
// destination.
struct TableSlot {
    disp_at: u64,
    rel_from: u64,
    dest: TableDest,
}

enum TableDest {
    Absolute(u64),
    // index of the destination instruction within the moved range
    Internal(usize),
}

struct EmittedInst {
    offset: u64,
    slot: Option<TableSlot>,
}

pub(super) fn encode_with_islands(
    ori_insts: &[Instruction],
    dest_addr: u64,
) -> Result<Vec<u8>, HookError> {
    let first_ip = ori_insts[0].ip();
    let last = ori_insts.last().unwrap();
    let range_end = last.ip() + last.len() as u64;

    let mut emitted: Vec<EmittedInst> = Vec::with_capacity(ori_insts.len());
    let mut buf = Cursor::new(Vec::<u8>::with_capacity(128));

    for inst in ori_insts {
        let cur_pos = buf.stream_position().unwrap();
        let patch = rewrite_inst(inst, dest_addr + cur_pos, &mut buf)?;
        let slot = match patch {
            Some(p) if p.dest_addr >= first_ip && p.dest_addr < range_end => {
                let idx = ori_insts
                    .iter()
                    .position(|i| i.ip() == p.dest_addr)
                    .ok_or(HookError::OutOfRangeRelocation)?;
                Some(TableSlot {
                    disp_at: cur_pos + p.disp_offset,
                    rel_from: cur_pos + p.rel_from_offset,
                    dest: TableDest::Internal(idx),
                })
            }
            Some(p) => Some(TableSlot {
                disp_at: cur_pos + p.disp_offset,
                rel_from: cur_pos + p.rel_from_offset,
                dest: TableDest::Absolute(p.dest_addr),
            }),
            None => None,
        };
        emitted.push(EmittedInst {
            offset: cur_pos,
            slot,
        });
    }

    let slot_count = emitted.iter().filter(|e| e.slot.is_some()).count();
    if slot_count != 0 {
        // 8-byte align the table; 5 bytes for the jmp over it
        let cur_addr = dest_addr + buf.stream_position().unwrap();
        let padding = ((cur_addr + 5 + 7) & !7) - (cur_addr + 5);

        let jmp_over = padding + slot_count as u64 * 8;
        buf.write(&[0xe9])?;
        buf.write(&(jmp_over as u32).to_le_bytes())?;
        buf.write(&vec![0xccu8; padding as usize])?;

        let mut table_offset = buf.stream_position().unwrap();
        for e in &emitted {
            if let Some(slot) = &e.slot {
                buf.seek(SeekFrom::Start(slot.disp_at)).unwrap();
                buf.write(&((table_offset - slot.rel_from) as u32).to_le_bytes())?;
                buf.seek(SeekFrom::Start(table_offset)).unwrap();
                let dest = match slot.dest {
                    TableDest::Absolute(addr) => addr,
                    TableDest::Internal(idx) => dest_addr + emitted[idx].offset,
                };
                buf.write(&dest.to_le_bytes())?;
                table_offset += 8;
            }
        }
    }
    Ok(buf.into_inner())
}

struct RelPatch {
    disp_offset: u64,
    rel_from_offset: u64,
    dest_addr: u64,
}

fn rewrite_inst<T: Write>(
    inst: &Instruction,
    dest_addr: u64,
    buf: &mut T,
) -> Result<Option<RelPatch>, HookError> {
    let mut encoder = Encoder::new(64);
    match inst.flow_control() {
        FlowControl::UnconditionalBranch if inst.is_jmp_short_or_near() => {
            // origin: jmp xxx
            // new: jmp qword ptr [rip+table]
            buf.write(&[0xff, 0x25, 0, 0, 0, 0])?;
            Ok(Some(RelPatch {
                disp_offset: 2,
                rel_from_offset: 6,
                dest_addr: inst.near_branch_target(),
            }))
        }
        FlowControl::IndirectBranch if inst.is_ip_rel_memory_operand() => {
            // origin: jmp qword ptr [rip+xxx]
            // new:
            // mov [rsp-0x10], rax
            // mov rax, xxx
            // push [rax]
            // mov rax, [rsp-8]
            // ret
            buf.write(&[0x48, 0x89, 0x44, 0x24, 0xf0, 0x48, 0xb8])?;
            buf.write(&inst.ip_rel_memory_address().to_le_bytes())?;
            buf.write(&[0xff, 0x30, 0x48, 0x8b, 0x44, 0x24, 0xf8, 0xc3])?;
            Ok(None)
        }
        FlowControl::ConditionalBranch if inst.is_jcc_short_or_near() => {
            // origin: je a
            // new: jne @+6; jmp qword ptr [rip+table]
            let mut cond = *inst;
            cond.negate_condition_code();
            cond.set_near_branch64(dest_addr + 8);
            cond.as_short_branch();
            encoder
                .encode(&cond, dest_addr)
                .map_err(|_| HookError::OutOfRangeRelocation)?;
            buf.write(&encoder.take_buffer())?;
            buf.write(&[0xff, 0x25, 0, 0, 0, 0])?;
            Ok(Some(RelPatch {
                disp_offset: 4,
                rel_from_offset: 8,
                dest_addr: inst.near_branch_target(),
            }))
        }
        FlowControl::ConditionalBranch
            if inst.is_jcx_short() || inst.is_loop() || inst.is_loopcc() =>
        {
            // origin: jrcxz a
            // new: jrcxz @+2; jmp @+6; jmp qword ptr [rip+table]
            let mut cond = *inst;
            cond.set_near_branch64(dest_addr + 4);
            encoder
                .encode(&cond, dest_addr)
                .map_err(|_| HookError::OutOfRangeRelocation)?;
            buf.write(&encoder.take_buffer())?;
            buf.write(&[0xeb, 0x06, 0xff, 0x25, 0, 0, 0, 0])?;
            Ok(Some(RelPatch {
                disp_offset: 6,
                rel_from_offset: 10,
                dest_addr: inst.near_branch_target(),
            }))
        }
        FlowControl::Call if inst.is_call_near() || inst.is_call_far() => {
            // origin: call a
            // new: call qword ptr [rip+table]
            buf.write(&[0xff, 0x15, 0, 0, 0, 0])?;
            Ok(Some(RelPatch {
                disp_offset: 2,
                rel_from_offset: 6,
                dest_addr: inst.near_branch_target(),
            }))
        }
        FlowControl::IndirectCall if inst.is_ip_rel_memory_operand() => {
            // origin: call qword ptr [rip+xxx]
            // new:
            // mov [rsp-0x18], rax
            // mov rax, xxx
            // push @retn_lower
            // mov dword ptr [rsp+4], @retn_higher
            // push qword ptr [rax]
            // mov rax, [rsp-8]
            // ret
            buf.write(&[0x48, 0x89, 0x44, 0x24, 0xe8, 0x48, 0xb8])?;
            buf.write(&inst.ip_rel_memory_address().to_le_bytes())?;
            let retn_addr = dest_addr + 0x24;
            buf.write(&[0x68])?;
            buf.write(&((retn_addr & 0xffff_ffff) as u32).to_le_bytes())?;
            buf.write(&[0xc7, 0x44, 0x24, 0x04])?;
            buf.write(&((retn_addr >> 32) as u32).to_le_bytes())?;
            buf.write(&[0xff, 0x30, 0x48, 0x8b, 0x44, 0x24, 0xf8, 0xc3])?;
            Ok(None)
        }
        _ if inst.is_ip_rel_memory_operand() => {
            if inst.op0_register() == Register::RSP {
                // rewriting through a scratch register cannot preserve an
                // rsp-writing form like `add rsp, [rip+xxx]`
                return Err(HookError::OutOfRangeRelocation);
            }
            let encoded = rewrite_rip_operand(inst, dest_addr);
            buf.write(&encoded)?;
            Ok(None)
        }
        _ => {
            encoder
                .encode(inst, dest_addr)
                .map_err(|_| HookError::OutOfRangeRelocation)?;
            buf.write(&encoder.take_buffer())?;
            Ok(None)
        }
    }
}

fn rewrite_rip_operand(inst: &Instruction, dest_addr: u64) -> Vec<u8> {
    if inst.mnemonic() == Mnemonic::Lea {
        // origin: lea rax, [rip+xxx]
        // new: mov rax, xxx
        let mov = Instruction::with2(
            Code::Mov_r64_imm64,
            inst.op0_register(),
            inst.ip_rel_memory_address(),
        )
        .unwrap();
        let mut encoder = Encoder::new(64);
        encoder.encode(&mov, dest_addr).unwrap();
        encoder.take_buffer()
    } else {
        // origin: add dword ptr [rip+xxx], ebx
        // new:
        // mov [rsp-0x10], r8
        // mov r8, xxx
        // add dword ptr [r8], ebx
        // mov r8, [rsp-0x10]
        let scratch = pick_scratch(inst);
        let spill = Instruction::with2(
            Code::Mov_rm64_r64,
            MemoryOperand::with_base_displ(Register::RSP, -16),
            scratch,
        )
        .unwrap();
        let load = Instruction::with2(Code::Mov_r64_imm64, scratch, inst.ip_rel_memory_address())
            .unwrap();
        let mut body = *inst;
        body.set_memory_base(scratch);
        body.set_memory_displacement32(0);
        body.set_memory_displ_size(0);

        // a push/pop in the body shifts rsp before the reload
        let stack_inc = inst.stack_pointer_increment() as i64;
        let reload = Instruction::with2(
            Code::Mov_r64_rm64,
            scratch,
            MemoryOperand::with_base_displ(Register::RSP, -16 - stack_inc),
        )
        .unwrap();

        let seq = [spill, load, body, reload];
        let block = InstructionBlock::new(&seq, dest_addr);
        BlockEncoder::encode(64, block, BlockEncoderOptions::NONE)
            .unwrap()
            .code_buffer
    }
}

fn pick_scratch(inst: &Instruction) -> Register {
    if !uses_register_family(inst, &[Register::BL, Register::BH, Register::BX, Register::EBX, Register::RBX]) {
        Register::RBX
    } else if !uses_register_family(inst, &[Register::R8L, Register::R8W, Register::R8D, Register::R8]) {
        Register::R8
    } else {
        // an instruction with a rip operand cannot also touch three
        // register families
        Register::R9
    }
}

fn uses_register_family(inst: &Instruction, family: &[Register]) -> bool {
    (0..inst.op_count())
        .map(|i| inst.op_register(i))
        .any(|r| family.contains(&r))
}
