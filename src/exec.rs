//! Executable memory for bridges and trampolines.
//!
//! A hook owns one [`ExecMemory`] region holding its pre-bridge,
//! post-bridge and relocated prologue. Detours prefer a region inside the
//! intersection of every ±2 GiB constraint (the patched `jmp rel32`, each
//! RIP-relative operand, each relative branch target) so restricted
//! relocation succeeds; when the window cannot be satisfied the region is
//! placed anywhere and the relocator falls back to 64-bit islands.

#[cfg(unix)]
mod alloc_unix;
#[cfg(windows)]
mod alloc_win;

use std::cmp;

use crate::err::HookError;

/// A page-aligned RWX allocation, freed on drop.
pub(crate) struct ExecMemory {
    pub addr: usize,
    pub len: usize,
}

impl ExecMemory {
    /// Allocate one page inside `bound`.
    pub fn allocate_within(bound: &Bound) -> Result<Self, HookError> {
        bound.check()?;
        #[cfg(unix)]
        return alloc_unix::allocate_within(bound);
        #[cfg(windows)]
        return alloc_win::allocate_within(bound);
    }

    /// Allocate one page with no placement constraint.
    pub fn allocate_anywhere() -> Result<Self, HookError> {
        #[cfg(unix)]
        return alloc_unix::allocate_anywhere();
        #[cfg(windows)]
        return alloc_win::allocate_anywhere();
    }
}

impl Drop for ExecMemory {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::munmap(self.addr as *mut libc::c_void, self.len)
        };
        #[cfg(windows)]
        unsafe {
            // MEM_RELEASE = 0x8000
            windows_sys::Win32::System::Memory::VirtualFree(
                self.addr as *mut core::ffi::c_void,
                0,
                0x8000,
            )
        };
    }
}

/// The address window every ±2 GiB displacement constraint leaves open.
#[derive(Debug, Clone)]
pub(crate) struct Bound {
    pub min: u64,
    pub max: u64,
}

impl Bound {
    pub fn new(init_addr: u64) -> Self {
        Self {
            min: init_addr.saturating_sub(i32::MAX as u64),
            max: init_addr.saturating_add(i32::MAX as u64),
        }
    }

    pub fn to_new(self, dest: u64) -> Self {
        Self {
            min: cmp::max(self.min, dest.saturating_sub(i32::MAX as u64)),
            max: cmp::min(self.max, dest.saturating_add(i32::MAX as u64)),
        }
    }

    pub fn check(&self) -> Result<(), HookError> {
        if self.min > self.max {
            Err(HookError::BridgeAllocationFailed)
        } else {
            Ok(())
        }
    }

    pub fn contains(&self, addr: u64, len: u64) -> bool {
        addr >= self.min && addr.saturating_add(len) <= self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_intersect_and_reject_empty_windows() {
        let b = Bound::new(0x4000_0000).to_new(0x5000_0000);
        assert!(b.check().is_ok());
        assert_eq!(b.max, 0x4000_0000 + i32::MAX as u64);

        let empty = Bound::new(0x4000_0000).to_new(0x2_0000_0000);
        assert!(empty.check().is_err());
    }

    #[test]
    fn anywhere_allocation_is_writable_and_freed() {
        let mem = ExecMemory::allocate_anywhere().unwrap();
        assert_ne!(mem.addr, 0);
        unsafe {
            (mem.addr as *mut u8).write(0xc3);
            assert_eq!((mem.addr as *const u8).read(), 0xc3);
        }
    }

    #[cfg(unix)]
    #[test]
    fn near_allocation_lands_inside_the_window() {
        let anchor = near_allocation_lands_inside_the_window as usize as u64;
        let bound = Bound::new(anchor);
        let mem = ExecMemory::allocate_within(&bound).unwrap();
        assert!(bound.contains(mem.addr as u64, mem.len as u64));
    }
}
