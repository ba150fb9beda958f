/*!
This crate provides ABI-aware runtime function hooking for `x86` and
`x86-64` binaries: prologue detours and vtable swaps that route every call
through user callbacks with full access to the arguments, the return value
and the captured register state.

HOOK is a mechanism that intercepts function calls and handles them by
user-defined code. Unlike a raw inline hook, the hook here carries a
calling-convention descriptor, so callbacks address the call by argument
index instead of by register name.

# Installation

This crate works with Cargo. Add it to your `Cargo.toml` like so:

```toml
[dependencies]
abihook = "0.1"
```

# Hooking a function

Assume a plain C function compiled into your process:

```c
int add(int a, int b) {
    return a + b;
}
```

Build a convention describing it, attach callbacks, and hook:

```rust
use abihook::convention::x64_systemv::SystemV64;
use abihook::{CallbackType, DataObject, DataType, Hook, ReturnAction};

unsafe fn on_add(ty: CallbackType, hook: &mut Hook) -> ReturnAction {
    if ty == CallbackType::Pre {
        // make both arguments 10, whatever the caller passed
        hook.set_argument::<u64>(0, 10).unwrap();
        hook.set_argument::<u64>(1, 10).unwrap();
    }
    ReturnAction::Ignored
}

let convention = SystemV64::new(
    vec![DataObject::new(DataType::Int), DataObject::new(DataType::Int)],
    DataObject::new(DataType::Int),
).unwrap();

let mut hook = Hook::detour(0x40_1000 /* add */, Box::new(convention)).unwrap();
hook.add_pre(on_add);
//unsafe { hook.hook().unwrap() }; //commented as hooking is not supported in doc tests
// add(1, 2) now returns 20; dropping the hook restores the prologue
```

A pre callback can also skip the original entirely:

```rust
use abihook::{CallbackType, Hook, ReturnAction};

unsafe fn short_circuit(_: CallbackType, hook: &mut Hook) -> ReturnAction {
    hook.set_return::<u64>(99).unwrap();
    ReturnAction::Supercede
}
```

`ReturnAction` values from multiple callbacks merge to the strongest:
`Supercede > Override > Handled > Ignored`. `Override` replaces the return
value but still runs the original; `Supercede` (pre stage only) returns the
callback's value without running it.

# Vtable hooking

[`Hook::vtable`] takes the address of a dispatch-table slot instead of a
function entry. `hook()` swaps the slot pointer for the bridge and
`unhook()` puts the original pointer back; the prologue is never touched,
so there is nothing to relocate.

# Calling the original

Inside a pre callback, [`Hook::original`] is a callable address for the
un-hooked function (the relocated-prologue trampoline of a detour, or the
saved slot pointer of a vtable hook). Transmute it to the function's type
and call it; the per-thread argument and return buffers keep nested and
recursive invocations consistent.

# Notes

Hooking rewrites live code. The crate makes the patch itself as atomic as
the hardware allows (a single qword store when the patched bytes sit in one
aligned qword), but quiescing threads that may be executing inside a larger
patch window, and draining threads out of a bridge before dropping its
hook, are the caller's responsibility.

As rust's tests run in parallel, hooking tests may collide on shared pages;
run them with `--test-threads=1`.
*/

#![warn(missing_docs)]

mod bridge;
pub mod convention;
pub mod decoder;
mod err;
mod exec;
mod hook;
mod os;
mod registers;
mod registry;

pub use convention::{CallingConvention, DataObject, DataType};
pub use decoder::{Decoder, RelativeInstruction};
pub use err::HookError;
pub use hook::{CallbackHandler, CallbackType, Hook, HookMode, ReturnAction};
pub use registers::{Register, Registers};
