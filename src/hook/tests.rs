//! End-to-end hooking scenarios. These patch live code in the test binary,
//! so every test serializes on one lock; run with `--test-threads=1` when
//! in doubt.

use std::mem::transmute;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use lazy_static::lazy_static;
use parking_lot::Mutex;

use super::dispatch;
use super::*;
use crate::convention::x64_microsoft::Microsoft64;
use crate::convention::x64_systemv::SystemV64;
use crate::convention::{DataObject, DataType};

lazy_static! {
    static ref PATCH_LOCK: Mutex<()> = Mutex::new(());
}

fn int_pair_conv() -> Box<SystemV64> {
    Box::new(
        SystemV64::new(
            vec![
                DataObject::new(DataType::ULongLong),
                DataObject::new(DataType::ULongLong),
            ],
            DataObject::new(DataType::ULongLong),
        )
        .unwrap(),
    )
}

static ADD_BODY_RUNS: AtomicUsize = AtomicUsize::new(0);

#[inline(never)]
extern "sysv64" fn add(a: u64, b: u64) -> u64 {
    ADD_BODY_RUNS.fetch_add(1, Ordering::SeqCst);
    a.wrapping_add(b)
}

unsafe fn force_both_args_to_ten(ty: CallbackType, hook: &mut Hook) -> ReturnAction {
    if ty == CallbackType::Pre {
        hook.set_argument::<u64>(0, 10).unwrap();
        hook.set_argument::<u64>(1, 10).unwrap();
    }
    ReturnAction::Ignored
}

unsafe fn observe_only(_: CallbackType, _: &mut Hook) -> ReturnAction {
    ReturnAction::Ignored
}

#[test]
fn pre_callback_rewrites_arguments() {
    let _guard = PATCH_LOCK.lock();
    assert_eq!(add(1, 2), 3);

    let mut hook = Hook::detour(add as usize, int_pair_conv()).unwrap();
    hook.add_pre(force_both_args_to_ten);
    hook.add_post(observe_only);
    unsafe {
        hook.hook().unwrap();
        assert_eq!(add(1, 2), 20);
        assert_eq!(add(30, 4), 20);
        hook.unhook().unwrap();
    }
    assert_eq!(add(1, 2), 3);
}

unsafe fn supercede_with_99(ty: CallbackType, hook: &mut Hook) -> ReturnAction {
    if ty == CallbackType::Pre {
        hook.set_return::<u64>(99).unwrap();
        ReturnAction::Supercede
    } else {
        ReturnAction::Ignored
    }
}

#[test]
fn supercede_skips_the_original_body() {
    let _guard = PATCH_LOCK.lock();
    let mut hook = Hook::detour(add as usize, int_pair_conv()).unwrap();
    hook.add_pre(supercede_with_99);
    unsafe {
        hook.hook().unwrap();
        let before = ADD_BODY_RUNS.load(Ordering::SeqCst);
        assert_eq!(add(1, 2), 99);
        assert_eq!(ADD_BODY_RUNS.load(Ordering::SeqCst), before);
        hook.unhook().unwrap();
    }
    assert_eq!(add(1, 2), 3);
}

unsafe fn override_with_123(ty: CallbackType, hook: &mut Hook) -> ReturnAction {
    if ty == CallbackType::Pre {
        hook.set_return::<u64>(123).unwrap();
        ReturnAction::Override
    } else {
        ReturnAction::Ignored
    }
}

#[test]
fn override_replaces_the_return_but_runs_the_body() {
    let _guard = PATCH_LOCK.lock();
    let mut hook = Hook::detour(add as usize, int_pair_conv()).unwrap();
    hook.add_pre(override_with_123);
    unsafe {
        hook.hook().unwrap();
        let before = ADD_BODY_RUNS.load(Ordering::SeqCst);
        assert_eq!(add(1, 2), 123);
        assert_eq!(ADD_BODY_RUNS.load(Ordering::SeqCst), before + 1);
        hook.unhook().unwrap();
    }
}

#[test]
fn hook_round_trip_restores_the_exact_bytes() {
    let _guard = PATCH_LOCK.lock();
    let before: Vec<u8> =
        unsafe { std::slice::from_raw_parts(add as *const u8, 16).to_vec() };

    let mut hook = Hook::detour(add as usize, int_pair_conv()).unwrap();
    hook.add_pre(observe_only);
    unsafe {
        hook.hook().unwrap();
        assert!(matches!(hook.hook(), Err(HookError::AlreadyHooked)));
        hook.unhook().unwrap();
        assert!(matches!(hook.unhook(), Err(HookError::NotHooked)));
    }

    let after: Vec<u8> =
        unsafe { std::slice::from_raw_parts(add as *const u8, 16).to_vec() };
    assert_eq!(before, after);
}

#[test]
fn two_hooks_on_one_address_are_rejected() {
    let _guard = PATCH_LOCK.lock();
    let mut first = Hook::detour(add as usize, int_pair_conv()).unwrap();
    let mut second = Hook::detour(add as usize, int_pair_conv()).unwrap();
    first.add_pre(observe_only);
    second.add_pre(observe_only);
    unsafe {
        first.hook().unwrap();
        assert!(matches!(second.hook(), Err(HookError::AlreadyHooked)));
        first.unhook().unwrap();
    }
}

#[test]
fn dropping_an_active_hook_unhooks() {
    let _guard = PATCH_LOCK.lock();
    {
        let mut hook = Hook::detour(add as usize, int_pair_conv()).unwrap();
        hook.add_pre(supercede_with_99);
        unsafe {
            hook.hook().unwrap();
            assert_eq!(add(1, 2), 99);
        }
    }
    assert_eq!(add(1, 2), 3);
}

// A synthetic target whose patch window contains a je rel8, exercising
// branch relocation in the trampoline and exact byte restoration.
#[test]
fn relocated_conditional_branch_still_branches() {
    let _guard = PATCH_LOCK.lock();

    // test rdi, rdi
    // je @+6
    // lea rax, [rdi+1]
    // ret
    // mov rax, 7
    // ret
    let body = [
        0x48, 0x85, 0xff, // 0: test rdi, rdi
        0x74, 0x06, // 3: je 0xb
        0x48, 0x8d, 0x47, 0x01, // 5: lea rax, [rdi+1]
        0xc3, // 9: ret
        0x90, // a: nop
        0x48, 0xc7, 0xc0, 0x07, 0x00, 0x00, 0x00, // b: mov rax, 7
        0xc3, // 12: ret
    ];
    let region = crate::exec::ExecMemory::allocate_anywhere().unwrap();
    unsafe {
        std::ptr::copy_nonoverlapping(body.as_ptr(), region.addr as *mut u8, body.len());
    }
    let f: extern "sysv64" fn(u64) -> u64 = unsafe { transmute(region.addr) };
    assert_eq!(f(0), 7);
    assert_eq!(f(4), 5);

    let conv = SystemV64::new(
        vec![DataObject::new(DataType::ULongLong)],
        DataObject::new(DataType::ULongLong),
    )
    .unwrap();
    let mut hook = Hook::detour(region.addr, Box::new(conv)).unwrap();
    hook.add_pre(observe_only);
    unsafe {
        hook.hook().unwrap();
        // both sides of the relocated branch must still work
        assert_eq!(f(0), 7);
        assert_eq!(f(4), 5);
        hook.unhook().unwrap();
    }
    let restored: Vec<u8> =
        unsafe { std::slice::from_raw_parts(region.addr as *const u8, body.len()).to_vec() };
    assert_eq!(restored, body);
}

static VCALLS: AtomicUsize = AtomicUsize::new(0);
static VHOOK_HITS: AtomicUsize = AtomicUsize::new(0);

#[inline(never)]
extern "sysv64" fn virtual_target(this: usize, x: u64) -> u64 {
    VCALLS.fetch_add(1, Ordering::SeqCst);
    this as u64 ^ x
}

unsafe fn count_virtual_entry(ty: CallbackType, _: &mut Hook) -> ReturnAction {
    if ty == CallbackType::Pre {
        VHOOK_HITS.fetch_add(1, Ordering::SeqCst);
    }
    ReturnAction::Ignored
}

#[test]
fn vtable_slot_swap_counts_and_restores() {
    let _guard = PATCH_LOCK.lock();

    // a 4-slot table with the target in slot 3, dispatched like a
    // C++ virtual call: object -> vtable -> slot
    let mut vtable: [usize; 4] = [0, 0, 0, virtual_target as usize];
    let object: *const usize = vtable.as_ptr();

    let conv = SystemV64::new(
        vec![
            DataObject::new(DataType::Pointer),
            DataObject::new(DataType::ULongLong),
        ],
        DataObject::new(DataType::ULongLong),
    )
    .unwrap();
    let slot_addr = unsafe { vtable.as_mut_ptr().add(3) } as usize;
    let mut hook = Hook::vtable(slot_addr, Box::new(conv)).unwrap();
    hook.add_pre(count_virtual_entry);

    let call_slot3 = |obj: *const usize| -> u64 {
        let f: extern "sysv64" fn(usize, u64) -> u64 =
            unsafe { transmute(*obj.add(3)) };
        f(obj as usize, 5)
    };

    unsafe {
        hook.hook().unwrap();
        assert_eq!(hook.mode(), HookMode::VTableSwap);

        let calls = VCALLS.load(Ordering::SeqCst);
        let hits = VHOOK_HITS.load(Ordering::SeqCst);
        assert_eq!(call_slot3(object), object as u64 ^ 5);
        assert_eq!(call_slot3(object), object as u64 ^ 5);
        assert_eq!(VCALLS.load(Ordering::SeqCst), calls + 2);
        assert_eq!(VHOOK_HITS.load(Ordering::SeqCst), hits + 2);

        hook.unhook().unwrap();
    }
    assert_eq!(vtable[3], virtual_target as usize);
}

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Debug)]
struct Triple {
    a: u64,
    b: u64,
    c: u64,
}

static TRIPLES_MADE: AtomicUsize = AtomicUsize::new(0);

#[inline(never)]
extern "win64" fn make_triple(seed: u64) -> Triple {
    TRIPLES_MADE.fetch_add(1, Ordering::SeqCst);
    Triple {
        a: seed,
        b: seed.wrapping_mul(3),
        c: seed.wrapping_add(7),
    }
}

unsafe fn deface_first_field(ty: CallbackType, hook: &mut Hook) -> ReturnAction {
    if ty == CallbackType::Post {
        let mut value = hook.get_return::<[u64; 3]>().unwrap();
        value[0] = 0xdead_beef;
        hook.set_return::<[u64; 3]>(value).unwrap();
    }
    ReturnAction::Ignored
}

#[test]
fn hidden_pointer_aggregate_return_is_writable_in_post() {
    let _guard = PATCH_LOCK.lock();
    // 24-byte aggregate under Microsoft x64: returned through a hidden
    // pointer passed in RCX
    let conv = Microsoft64::new(
        vec![DataObject::new(DataType::ULongLong)],
        DataObject::with_size(DataType::Object, 24),
    )
    .unwrap();
    let mut hook = Hook::detour(make_triple as usize, Box::new(conv)).unwrap();
    hook.add_post(deface_first_field);
    unsafe {
        hook.hook().unwrap();
        let t = make_triple(9);
        assert_eq!(
            t,
            Triple {
                a: 0xdead_beef,
                b: 27,
                c: 16
            }
        );
        hook.unhook().unwrap();
    }
    assert_eq!(make_triple(9).a, 9);
}

static SCALE_CALLS: AtomicUsize = AtomicUsize::new(0);

#[inline(never)]
extern "sysv64" fn scale(a: f64, b: f64) -> f64 {
    SCALE_CALLS.fetch_add(1, Ordering::SeqCst);
    a * b
}

unsafe fn double_first_float(ty: CallbackType, hook: &mut Hook) -> ReturnAction {
    if ty == CallbackType::Pre {
        let a = hook.get_argument::<f64>(0).unwrap();
        hook.set_argument::<f64>(0, a * 2.0).unwrap();
    }
    ReturnAction::Ignored
}

#[test]
fn vector_register_arguments_flow_through_the_snapshot() {
    let _guard = PATCH_LOCK.lock();
    let conv = SystemV64::new(
        vec![
            DataObject::new(DataType::Double),
            DataObject::new(DataType::Double),
        ],
        DataObject::new(DataType::Double),
    )
    .unwrap();
    let mut hook = Hook::detour(scale as usize, Box::new(conv)).unwrap();
    hook.add_pre(double_first_float);
    unsafe {
        hook.hook().unwrap();
        assert_eq!(scale(3.0, 5.0), 30.0);
        hook.unhook().unwrap();
    }
    assert_eq!(scale(3.0, 5.0), 15.0);
}

lazy_static! {
    static ref POST_ORDER: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());
}

static INNER_SINK: AtomicU64 = AtomicU64::new(0);

#[inline(never)]
extern "sysv64" fn inner(x: u64) -> u64 {
    INNER_SINK.fetch_add(x, Ordering::SeqCst);
    x.wrapping_add(1)
}

#[inline(never)]
extern "sysv64" fn outer(x: u64) -> u64 {
    inner(x).wrapping_mul(2)
}

unsafe fn log_outer_post(ty: CallbackType, _: &mut Hook) -> ReturnAction {
    if ty == CallbackType::Post {
        POST_ORDER.lock().push("outer");
    }
    ReturnAction::Ignored
}

unsafe fn log_inner_post(ty: CallbackType, _: &mut Hook) -> ReturnAction {
    if ty == CallbackType::Post {
        POST_ORDER.lock().push("inner");
    }
    ReturnAction::Ignored
}

#[test]
fn nested_hooks_run_posts_in_lifo_order() {
    let _guard = PATCH_LOCK.lock();
    let single = |ty| {
        Box::new(
            SystemV64::new(vec![DataObject::new(ty)], DataObject::new(DataType::ULongLong))
                .unwrap(),
        )
    };
    let mut outer_hook = Hook::detour(outer as usize, single(DataType::ULongLong)).unwrap();
    let mut inner_hook = Hook::detour(inner as usize, single(DataType::ULongLong)).unwrap();
    outer_hook.add_post(log_outer_post);
    inner_hook.add_post(log_inner_post);

    unsafe {
        outer_hook.hook().unwrap();
        inner_hook.hook().unwrap();
        POST_ORDER.lock().clear();
        assert_eq!(outer(4), 10);
        assert_eq!(*POST_ORDER.lock(), vec!["inner", "outer"]);
        inner_hook.unhook().unwrap();
        outer_hook.unhook().unwrap();
    }
}

static CONC_BODY: AtomicUsize = AtomicUsize::new(0);

#[inline(never)]
extern "sysv64" fn conc_add(a: u64, b: u64) -> u64 {
    CONC_BODY.fetch_add(1, Ordering::SeqCst);
    a.wrapping_add(b)
}

unsafe fn call_original_and_bump(ty: CallbackType, hook: &mut Hook) -> ReturnAction {
    if ty != CallbackType::Pre {
        return ReturnAction::Ignored;
    }
    let original: extern "sysv64" fn(u64, u64) -> u64 =
        transmute(hook.original().unwrap());
    let a = hook.get_argument::<u64>(0).unwrap();
    let b = hook.get_argument::<u64>(1).unwrap();
    let result = original(a, b);
    hook.set_return::<u64>(result.wrapping_add(1)).unwrap();
    ReturnAction::Override
}

#[test]
fn concurrent_entries_drain_their_thread_local_frames() {
    let _guard = PATCH_LOCK.lock();
    let mut hook = Hook::detour(conc_add as usize, int_pair_conv()).unwrap();
    hook.add_pre(call_original_and_bump);
    let target = conc_add as usize;

    unsafe {
        hook.hook().unwrap();
    }

    let worker = move || {
        for _ in 0..200 {
            // identical arguments on both threads: the shared snapshot may
            // interleave but every observed value is the same
            assert_eq!(conc_add(7, 35), 43);
        }
        assert_eq!(dispatch::frame_depth(target), 0);
    };
    let t1 = std::thread::spawn(worker);
    let t2 = std::thread::spawn(worker);
    t1.join().unwrap();
    t2.join().unwrap();

    unsafe {
        hook.unhook().unwrap();
    }
    assert_eq!(dispatch::frame_depth(target), 0);
    assert_eq!(conc_add(7, 35), 42);
}

static SUM8_CALLS: AtomicUsize = AtomicUsize::new(0);

#[inline(never)]
extern "sysv64" fn sum8(
    a: u64,
    b: u64,
    c: u64,
    d: u64,
    e: u64,
    f: u64,
    g: u64,
    h: u64,
) -> u64 {
    SUM8_CALLS.fetch_add(1, Ordering::SeqCst);
    a + b + c + d + e + f + g + h
}

unsafe fn scale_seventh_argument(ty: CallbackType, hook: &mut Hook) -> ReturnAction {
    if ty == CallbackType::Pre {
        // argument 6 is the first stack-resident one under System V
        let v = hook.get_argument::<u64>(6).unwrap();
        hook.set_argument::<u64>(6, v * 10).unwrap();
    }
    ReturnAction::Ignored
}

#[test]
fn stack_resident_arguments_are_reachable_through_the_snapshot() {
    let _guard = PATCH_LOCK.lock();
    let conv = SystemV64::new(
        vec![DataObject::new(DataType::ULongLong); 8],
        DataObject::new(DataType::ULongLong),
    )
    .unwrap();
    let mut hook = Hook::detour(sum8 as usize, Box::new(conv)).unwrap();
    hook.add_pre(scale_seventh_argument);
    unsafe {
        hook.hook().unwrap();
        assert_eq!(sum8(1, 1, 1, 1, 1, 1, 2, 3), 6 + 20 + 3);
        hook.unhook().unwrap();
    }
    assert_eq!(sum8(1, 1, 1, 1, 1, 1, 2, 3), 11);
}

static FOO_CALLS: AtomicUsize = AtomicUsize::new(0);

// 5 arguments to ensure using stack instead of registers to pass the last
#[inline(never)]
extern "win64" fn foo(x: u64, _b: u64, _c: u64, _d: u64, y: u64) -> u64 {
    FOO_CALLS.fetch_add(1, Ordering::SeqCst);
    x * x + y
}

unsafe fn rewrite_first_and_fifth(ty: CallbackType, hook: &mut Hook) -> ReturnAction {
    if ty == CallbackType::Pre {
        hook.set_argument::<u64>(0, 7).unwrap();
        // argument 4 sits past the 32-byte shadow space
        hook.set_argument::<u64>(4, 100).unwrap();
    }
    ReturnAction::Ignored
}

#[test]
fn microsoft_positional_and_shadowed_stack_arguments() {
    let _guard = PATCH_LOCK.lock();
    assert_eq!(foo(5, 0, 0, 0, 3), 28);

    let conv = Microsoft64::new(
        vec![DataObject::new(DataType::ULongLong); 5],
        DataObject::new(DataType::ULongLong),
    )
    .unwrap();
    let mut hook = Hook::detour(foo as usize, Box::new(conv)).unwrap();
    hook.add_pre(rewrite_first_and_fifth);
    unsafe {
        hook.hook().unwrap();
        assert_eq!(foo(5, 0, 0, 0, 3), 49 + 100);
        hook.unhook().unwrap();
    }
    assert_eq!(foo(5, 0, 0, 0, 3), 28);
}

#[test]
fn duplicate_callbacks_are_rejected() {
    let mut hook = Hook::detour(add as usize, int_pair_conv()).unwrap();
    assert!(!hook.has_callbacks());
    assert!(hook.add_pre(observe_only));
    assert!(!hook.add_pre(observe_only));
    assert!(hook.has_callbacks());
    assert!(hook.is_callback_registered(CallbackType::Pre, observe_only));
    assert!(!hook.is_callback_registered(CallbackType::Post, observe_only));
    assert!(hook.remove_callback(CallbackType::Pre, observe_only));
    assert!(!hook.remove_callback(CallbackType::Pre, observe_only));
    assert!(!hook.has_callbacks());
}

#[test]
fn null_targets_are_rejected() {
    assert!(matches!(
        Hook::detour(0, int_pair_conv()),
        Err(HookError::NullAddress)
    ));
    assert!(matches!(
        Hook::vtable(0, int_pair_conv()),
        Err(HookError::NullAddress)
    ));
}
