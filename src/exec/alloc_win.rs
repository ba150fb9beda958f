use core::ffi::c_void;
use std::mem::{size_of, MaybeUninit};

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualQuery, MEMORY_BASIC_INFORMATION, MEM_COMMIT, MEM_FREE, MEM_RESERVE,
    PAGE_EXECUTE_READWRITE,
};

use super::{Bound, ExecMemory};
use crate::err::HookError;

const REGION_LEN: usize = 4096;

pub(super) fn allocate_anywhere() -> Result<ExecMemory, HookError> {
    let mem = unsafe {
        VirtualAlloc(
            std::ptr::null(),
            REGION_LEN,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_EXECUTE_READWRITE,
        )
    };
    if mem.is_null() {
        return Err(HookError::BridgeAllocationFailed);
    }
    Ok(ExecMemory {
        addr: mem as usize,
        len: REGION_LEN,
    })
}

enum QueryResult {
    Success(u64),
    NotUsable(u64, u64),
    Fail,
}

fn query_and_alloc(addr: u64) -> QueryResult {
    let mut mbi: MEMORY_BASIC_INFORMATION = unsafe { MaybeUninit::zeroed().assume_init() };
    let ret = unsafe {
        VirtualQuery(
            addr as *const c_void,
            &mut mbi,
            size_of::<MEMORY_BASIC_INFORMATION>(),
        )
    };
    if ret == 0 {
        QueryResult::Fail
    } else if mbi.State == MEM_FREE && mbi.RegionSize >= REGION_LEN {
        let mem = unsafe {
            VirtualAlloc(
                mbi.BaseAddress,
                REGION_LEN,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_EXECUTE_READWRITE,
            )
        };
        if mem.is_null() {
            QueryResult::NotUsable(mbi.BaseAddress as u64, mbi.RegionSize as u64)
        } else {
            QueryResult::Success(mem as u64)
        }
    } else {
        QueryResult::NotUsable(mbi.BaseAddress as u64, mbi.RegionSize as u64)
    }
}

// Walks the address space from the middle of the window outwards, first up
// then down, claiming the first free region that fits.
pub(super) fn allocate_within(bound: &Bound) -> Result<ExecMemory, HookError> {
    let mut cur_addr = bound.min / 2 + bound.max / 2;
    while cur_addr < bound.max {
        match query_and_alloc(cur_addr) {
            QueryResult::Success(addr) => {
                if bound.contains(addr, REGION_LEN as u64) {
                    return Ok(ExecMemory {
                        addr: addr as usize,
                        len: REGION_LEN,
                    });
                }
                return Err(HookError::BridgeAllocationFailed);
            }
            QueryResult::NotUsable(_, size) => {
                cur_addr += if size > 0 { size } else { REGION_LEN as u64 };
            }
            QueryResult::Fail => return Err(HookError::BridgeAllocationFailed),
        }
    }
    cur_addr = bound.min / 2 + bound.max / 2;
    while cur_addr > bound.min {
        match query_and_alloc(cur_addr) {
            QueryResult::Success(addr) => {
                if bound.contains(addr, REGION_LEN as u64) {
                    return Ok(ExecMemory {
                        addr: addr as usize,
                        len: REGION_LEN,
                    });
                }
                return Err(HookError::BridgeAllocationFailed);
            }
            QueryResult::NotUsable(base, _) => {
                cur_addr = base.saturating_sub(REGION_LEN as u64);
            }
            QueryResult::Fail => return Err(HookError::BridgeAllocationFailed),
        }
    }
    Err(HookError::BridgeAllocationFailed)
}
