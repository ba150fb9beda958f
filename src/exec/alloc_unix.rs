use lazy_static::lazy_static;
use regex::Regex;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::process;

use libc::{c_void, mmap, munmap, MAP_ANONYMOUS, MAP_FIXED_NOREPLACE, MAP_PRIVATE};

use super::{Bound, ExecMemory};
use crate::err::HookError;
use crate::os::page_size;

pub(super) fn allocate_anywhere() -> Result<ExecMemory, HookError> {
    let len = page_size();
    let addr = unsafe {
        mmap(
            std::ptr::null_mut(),
            len,
            7,
            MAP_PRIVATE | MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(HookError::BridgeAllocationFailed);
    }
    Ok(ExecMemory {
        addr: addr as usize,
        len,
    })
}

pub(super) fn allocate_within(bound: &Bound) -> Result<ExecMemory, HookError> {
    let len = page_size();
    let block = MemoryLayout::read_self_mem_layout()?.find_gap_within(bound, len)?;
    let addr = unsafe {
        mmap(
            block as *mut c_void,
            len,
            7,
            MAP_PRIVATE | MAP_FIXED_NOREPLACE | MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(HookError::BridgeAllocationFailed);
    }
    let addr = addr as usize;
    // an old kernel without MAP_FIXED_NOREPLACE may place us elsewhere
    if !bound.contains(addr as u64, len as u64) {
        unsafe { munmap(addr as *mut c_void, len) };
        return Err(HookError::BridgeAllocationFailed);
    }
    Ok(ExecMemory { addr, len })
}

struct MemoryLayout(Vec<MemoryBlock>);

impl MemoryLayout {
    fn read_self_mem_layout() -> Result<Self, HookError> {
        let maps = File::open(format!("/proc/{}/maps", process::id()))?;
        BufReader::new(maps)
            .lines()
            .map(|line| {
                line.map_err(|_| HookError::MemoryLayoutFormat)
                    .and_then(MemoryBlock::from_string)
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    // Picks the mapping gap closest to the middle of the window so both
    // edges keep slack for later displacement math.
    fn find_gap_within(&self, bound: &Bound, len: usize) -> Result<u64, HookError> {
        let page = page_size() as u64;
        let blocks = &self.0;
        if blocks.is_empty() {
            return Err(HookError::BridgeAllocationFailed);
        }
        let mid = bound.min / 2 + bound.max / 2;

        let mut best: Option<u64> = None;
        let mut consider = |candidate: u64| {
            if candidate >= page && bound.contains(candidate, len as u64) {
                let better = match best {
                    Some(b) => candidate.abs_diff(mid) < b.abs_diff(mid),
                    None => true,
                };
                if better {
                    best = Some(candidate);
                }
            }
        };

        if blocks[0].begin >= page * 2 {
            consider(blocks[0].begin - page);
        }
        for i in 1..blocks.len() {
            let gap_begin = blocks[i - 1].end;
            let gap_end = blocks[i].begin;
            if gap_end.saturating_sub(gap_begin) >= len as u64 {
                // try both edges of the gap, clamped into the window
                consider(gap_begin);
                consider(gap_end - len as u64);
                if gap_begin < mid && mid + (len as u64) <= gap_end {
                    consider(mid & !(page - 1));
                }
            }
        }
        best.ok_or(HookError::BridgeAllocationFailed)
    }
}

#[derive(Debug)]
struct MemoryBlock {
    begin: u64,
    end: u64,
}

impl MemoryBlock {
    fn from_string(s: String) -> Result<Self, HookError> {
        lazy_static! {
            static ref RE: Regex = Regex::new("^([a-fA-F0-9]+)-([a-fA-F0-9]+)").unwrap();
        }
        RE.captures(&s)
            .ok_or(HookError::MemoryLayoutFormat)
            .and_then(|cap| {
                let begin = cap.get(1).unwrap().as_str();
                let end = cap.get(2).unwrap().as_str();
                Ok(Self {
                    begin: u64::from_str_radix(begin, 16).or(Err(HookError::MemoryLayoutFormat))?,
                    end: u64::from_str_radix(end, 16).or(Err(HookError::MemoryLayoutFormat))?,
                })
            })
    }
}
