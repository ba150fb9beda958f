use super::*;
use crate::registers::Register;

fn spec_regs() -> Registers {
    Registers::new(&[Register::Rax, Register::Rcx, Register::Rsp])
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[test]
fn x64_pre_bridge_saves_rax_first_and_bakes_the_immediates() {
    let regs = spec_regs();
    let spec = BridgeSpec {
        hook_ptr: 0x1122_3344_5566_7788,
        on_entry: 0x99aa_bbcc_ddee_ff00,
        on_exit: 0,
        regs: &regs,
        pop_size: 0,
        pointer_width: 8,
    };
    let (pre, patch) = x64::write_pre_bridge(&spec).unwrap();

    // mov [moffs64], rax targeting the rax slot
    assert_eq!(&pre[0..2], &[0x48, 0xa3]);
    assert_eq!(
        u64::from_le_bytes(pre[2..10].try_into().unwrap()),
        regs.slot_address(0) as u64
    );
    // mov rax, slot_base
    assert_eq!(&pre[10..12], &[0x48, 0xb8]);
    assert_eq!(
        u64::from_le_bytes(pre[12..20].try_into().unwrap()),
        regs.slot_address(0) as u64
    );
    // mov [rax+0x10], rcx ; mov [rax+0x20], rsp
    assert_eq!(&pre[20..27], &[0x48, 0x89, 0x88, 0x10, 0, 0, 0]);
    assert_eq!(&pre[27..34], &[0x48, 0x89, 0xa0, 0x20, 0, 0, 0]);
    // mov rcx, [rsp] ; mov [rax+0x30], rcx (the return-address slot)
    assert_eq!(&pre[34..38], &[0x48, 0x8b, 0x0c, 0x24]);
    assert_eq!(&pre[38..45], &[0x48, 0x89, 0x88, 0x30, 0, 0, 0]);

    // the dispatcher argument and callee are baked immediates
    let hook_imm = 0x1122_3344_5566_7788u64.to_le_bytes();
    let arg = find(&pre, &[0x48, 0xb9]).unwrap();
    assert_eq!(&pre[arg + 2..arg + 10], &hook_imm);
    let entry_imm = 0x99aa_bbcc_ddee_ff00u64.to_le_bytes();
    assert!(find(&pre, &entry_imm).is_some());

    // supercede comparison against the merged-action encoding
    let cmp = find(&pre, &[0x83, 0xf8, SUPERCEDE]).unwrap();
    assert_eq!(&pre[cmp + 3..cmp + 5], &[0x0f, 0x84]);

    // the patch cell sits right after the rip-relative trampoline jmp
    assert_eq!(&pre[patch - 6..patch], &[0xff, 0x25, 0, 0, 0, 0]);
    assert_eq!(&pre[patch..patch + 8], &[0; 8]);

    // plain return at the end (no callee-clean bytes)
    assert_eq!(*pre.last().unwrap(), 0xc3);
}

#[test]
fn x64_supercede_branch_lands_on_the_second_restore() {
    let regs = spec_regs();
    let spec = BridgeSpec {
        hook_ptr: 1,
        on_entry: 2,
        on_exit: 3,
        regs: &regs,
        pop_size: 0,
        pointer_width: 8,
    };
    let (pre, patch) = x64::write_pre_bridge(&spec).unwrap();

    let je = find(&pre, &[0x0f, 0x84]).unwrap();
    let rel = u32::from_le_bytes(pre[je + 2..je + 6].try_into().unwrap()) as usize;
    let landing = je + 6 + rel;
    // the branch target is the supercede-path restore, just past the
    // 14-byte trampoline jump
    assert_eq!(landing, patch + 8);
    // both restore copies are byte-identical
    let first_restore = &pre[je + 6..patch - 6];
    let second_restore = &pre[landing..pre.len() - 1];
    assert_eq!(first_restore, second_restore);
}

#[test]
fn x64_post_bridge_parks_the_return_address_before_restoring() {
    let regs = spec_regs();
    let spec = BridgeSpec {
        hook_ptr: 1,
        on_entry: 2,
        on_exit: 3,
        regs: &regs,
        pop_size: 0,
        pointer_width: 8,
    };
    let post = x64::write_post_bridge(&spec).unwrap();

    // push rax directly after the dispatcher call frame is torn down
    let teardown = find(&post, &[0x48, 0x83, 0xc4, 0x20]).unwrap();
    assert_eq!(post[teardown + 4], 0x50);
    assert_eq!(*post.last().unwrap(), 0xc3);
}

#[test]
fn x64_callee_clean_supercede_uses_ret_imm16() {
    let regs = spec_regs();
    let spec = BridgeSpec {
        hook_ptr: 1,
        on_entry: 2,
        on_exit: 3,
        regs: &regs,
        pop_size: 12,
        pointer_width: 8,
    };
    let (pre, _) = x64::write_pre_bridge(&spec).unwrap();
    assert_eq!(&pre[pre.len() - 3..], &[0xc2, 0x0c, 0x00]);
}

#[test]
fn x86_bridge_uses_direct_absolute_stores() {
    let regs = Registers::new(&[
        Register::Eax,
        Register::Ecx,
        Register::Edx,
        Register::Esp,
    ]);
    let spec = BridgeSpec {
        hook_ptr: 0x0040_1000,
        on_entry: 0x0040_2000,
        on_exit: 0x0040_3000,
        regs: &regs,
        pop_size: 8,
        pointer_width: 4,
    };
    let (pre, patch) = x86::write_pre_bridge(&spec).unwrap();

    // mov [slot], eax/ecx/edx/esp
    assert_eq!(pre[0], 0x89);
    assert_eq!(pre[1], 0x05);
    assert_eq!(
        u32::from_le_bytes(pre[2..6].try_into().unwrap()),
        regs.slot_address(0) as u32
    );
    assert_eq!(pre[6..8], [0x89, 0x0d]);
    assert_eq!(pre[12..14], [0x89, 0x15]);
    assert_eq!(pre[18..20], [0x89, 0x25]);

    // cdecl dispatcher call: push hook; mov eax, fn; call eax; add esp, 4
    let push = find(&pre, &[0x68, 0x00, 0x10, 0x40, 0x00]).unwrap();
    assert_eq!(pre[push + 5], 0xb8);
    assert!(find(&pre, &[0xff, 0xd0, 0x83, 0xc4, 0x04]).is_some());

    // rel32 patch cell follows an e9
    assert_eq!(pre[patch - 1], 0xe9);
    // callee-clean return: ret 8
    assert_eq!(&pre[pre.len() - 3..], &[0xc2, 0x08, 0x00]);

    let post = x86::write_post_bridge(&spec).unwrap();
    // push eax then plain ret
    assert!(find(&post, &[0x83, 0xc4, 0x04, 0x50]).is_some());
    assert_eq!(*post.last().unwrap(), 0xc3);
}

#[test]
fn emitted_bridges_are_aligned_and_wired() {
    let regs = spec_regs();
    let spec = BridgeSpec {
        hook_ptr: 1,
        on_entry: 2,
        on_exit: 3,
        regs: &regs,
        pop_size: 0,
        pointer_width: 8,
    };
    let region = crate::exec::ExecMemory::allocate_anywhere().unwrap();
    let bridges = unsafe { emit_bridges(&region, &spec).unwrap() };

    assert_eq!(bridges.pre_entry % 16, 0);
    assert_eq!(bridges.post_entry % 16, 0);
    assert_eq!(bridges.trampoline_entry % 16, 0);
    assert!(bridges.trampoline_capacity > 64);

    // the pre-bridge continue path jumps to the trampoline slot
    let (pre, patch) = x64::write_pre_bridge(&spec).unwrap();
    assert!(bridges.pre_entry + pre.len() <= bridges.post_entry);
    let cell = unsafe { ((bridges.pre_entry + patch) as *const u64).read_unaligned() };
    assert_eq!(cell, bridges.trampoline_entry as u64);
}
