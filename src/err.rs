use std::io;
use thiserror::Error;

use crate::registers::Register;

/// Hook errors.
#[derive(Error, Debug)]
pub enum HookError {
    /// The target (or vtable slot) address is null
    #[error("null address")]
    NullAddress,

    /// An active hook already exists for the address
    #[error("address is already hooked")]
    AlreadyHooked,

    /// The hook is not active
    #[error("no hook present")]
    NotHooked,

    /// No executable region could be allocated for the bridge
    #[error("bridge allocation failed")]
    BridgeAllocationFailed,

    /// The function ends before the patched jump fits
    #[error("prologue too short")]
    PrologueTooShort,

    /// Can't disassemble at the specified address
    #[error("instruction decode failed")]
    DecodeFailure,

    /// A relative displacement does not fit in 32 bits under restricted relocation
    #[error("relocation target out of 32-bit range")]
    OutOfRangeRelocation,

    /// Error occurs when modifying the memory protection, with the OS error code
    #[error("memory protection change failed, code:{0}")]
    ProtectionChangeFailed(u32),

    /// The register is not tracked by the active calling convention
    #[error("unknown register {0:?}")]
    UnknownRegister(Register),

    /// The data descriptor carries a type the convention cannot place
    #[error("unknown data type")]
    UnknownDataType,

    /// Can't get memory layout from /proc/${PID}/maps (only on linux)
    #[error("memory layout format error")]
    MemoryLayoutFormat,

    /// Some io error
    #[error("io error")]
    Io(#[from] io::Error),
}
