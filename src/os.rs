//! Page-protection primitives.
//!
//! The concrete OS calls live here; everything above works through
//! [`MemoryProtectGuard`], which widens a range to RWX around a patch and
//! puts the old protection back afterwards.

#[cfg(windows)]
use core::ffi::c_void;
#[cfg(unix)]
use libc::{c_void, mprotect, sysconf};
#[cfg(windows)]
use windows_sys::Win32::Foundation::GetLastError;
#[cfg(windows)]
use windows_sys::Win32::System::Memory::VirtualProtect;

use crate::err::HookError;

#[cfg(unix)]
pub(crate) fn page_size() -> usize {
    // _SC_PAGESIZE == 30
    unsafe { sysconf(30) as usize }
}

#[cfg(windows)]
pub(crate) fn modify_mem_protect_to_rwx(addr: usize, len: usize) -> Result<u64, HookError> {
    let mut old_prot: u32 = 0;
    let old_prot_ptr = std::ptr::addr_of_mut!(old_prot);
    // PAGE_EXECUTE_READWRITE = 0x40
    let ret = unsafe { VirtualProtect(addr as *const c_void, len, 0x40, old_prot_ptr) };
    if ret == 0 {
        Err(HookError::ProtectionChangeFailed(unsafe { GetLastError() }))
    } else {
        Ok(u64::from(old_prot))
    }
}

#[cfg(unix)]
pub(crate) fn modify_mem_protect_to_rwx(addr: usize, len: usize) -> Result<u64, HookError> {
    let page = page_size();
    let start = addr & !(page - 1);
    let span = (addr + len + page - 1 & !(page - 1)) - start;
    // (PROT_READ | PROT_WRITE | PROT_EXEC) == 7
    let ret = unsafe { mprotect(start as *mut c_void, span, 7) };
    if ret != 0 {
        let err = unsafe { *libc::__errno_location() };
        Err(HookError::ProtectionChangeFailed(err as u32))
    } else {
        // recovering the exact original protection would need a maps walk
        Ok(7)
    }
}

#[cfg(windows)]
pub(crate) fn recover_mem_protect(addr: usize, len: usize, old: u64) {
    let mut old_prot: u32 = 0;
    let old_prot_ptr = std::ptr::addr_of_mut!(old_prot);
    unsafe { VirtualProtect(addr as *const c_void, len, old as u32, old_prot_ptr) };
}

#[cfg(unix)]
pub(crate) fn recover_mem_protect(addr: usize, len: usize, old: u64) {
    let page = page_size();
    let start = addr & !(page - 1);
    let span = (addr + len + page - 1 & !(page - 1)) - start;
    unsafe { mprotect(start as *mut c_void, span, old as i32) };
}

pub(crate) struct MemoryProtectGuard {
    addr: usize,
    len: usize,
}

impl MemoryProtectGuard {
    pub fn new(addr: usize, len: usize) -> Self {
        Self { addr, len }
    }

    pub fn run<T, F>(self, func: F) -> Result<T, HookError>
    where
        F: FnOnce() -> Result<T, HookError>,
    {
        let old_protect = modify_mem_protect_to_rwx(self.addr, self.len)?;
        let ret = func();
        recover_mem_protect(self.addr, self.len, old_protect);
        ret
    }
}
