use std::cell::UnsafeCell;

use crate::err::HookError;

/// Identifies one CPU register tracked by a calling convention.
///
/// The set covers the registers the built-in x86 and x86-64 conventions
/// need; other registers are rejected with [`HookError::UnknownRegister`]
/// by the snapshot accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    /// The eax register
    Eax,
    /// The ebx register
    Ebx,
    /// The ecx register
    Ecx,
    /// The edx register
    Edx,
    /// The esi register
    Esi,
    /// The edi register
    Edi,
    /// The ebp register
    Ebp,
    /// The esp register
    Esp,
    /// The rax register
    Rax,
    /// The rbx register
    Rbx,
    /// The rcx register
    Rcx,
    /// The rdx register
    Rdx,
    /// The rsi register
    Rsi,
    /// The rdi register
    Rdi,
    /// The rbp register
    Rbp,
    /// The rsp register
    Rsp,
    /// The r8 register
    R8,
    /// The r9 register
    R9,
    /// The r10 register
    R10,
    /// The r11 register
    R11,
    /// The r12 register
    R12,
    /// The r13 register
    R13,
    /// The r14 register
    R14,
    /// The r15 register
    R15,
    /// The xmm0 register
    Xmm0,
    /// The xmm1 register
    Xmm1,
    /// The xmm2 register
    Xmm2,
    /// The xmm3 register
    Xmm3,
    /// The xmm4 register
    Xmm4,
    /// The xmm5 register
    Xmm5,
    /// The xmm6 register
    Xmm6,
    /// The xmm7 register
    Xmm7,
}

impl Register {
    /// Width of the register in bytes.
    #[must_use]
    pub fn width(self) -> usize {
        use Register::*;
        match self {
            Eax | Ebx | Ecx | Edx | Esi | Edi | Ebp | Esp => 4,
            Rax | Rbx | Rcx | Rdx | Rsi | Rdi | Rbp | Rsp | R8 | R9 | R10 | R11 | R12 | R13
            | R14 | R15 => 8,
            Xmm0 | Xmm1 | Xmm2 | Xmm3 | Xmm4 | Xmm5 | Xmm6 | Xmm7 => 16,
        }
    }

    /// True for the xmm registers.
    #[must_use]
    pub fn is_vector(self) -> bool {
        self.width() == 16
    }

    // The 4-bit encoding used in ModRM/REX emission. x86 and x64 general
    // purpose registers share the low 3 bits.
    pub(crate) fn encoding(self) -> u8 {
        use Register::*;
        match self {
            Eax | Rax | Xmm0 => 0,
            Ecx | Rcx | Xmm1 => 1,
            Edx | Rdx | Xmm2 => 2,
            Ebx | Rbx | Xmm3 => 3,
            Esp | Rsp | Xmm4 => 4,
            Ebp | Rbp | Xmm5 => 5,
            Esi | Rsi | Xmm6 => 6,
            Edi | Rdi | Xmm7 => 7,
            R8 => 8,
            R9 => 9,
            R10 => 10,
            R11 => 11,
            R12 => 12,
            R13 => 13,
            R14 => 14,
            R15 => 15,
        }
    }
}

// One snapshot cell. Written by the generated save sequence through the
// cell's absolute address, so the payload must stay 16-byte aligned for
// the movaps stores.
#[repr(C, align(16))]
struct Slot(UnsafeCell<[u8; 16]>);

impl Slot {
    fn zeroed() -> Self {
        Slot(UnsafeCell::new([0u8; 16]))
    }

    fn ptr(&self) -> *mut u8 {
        self.0.get().cast()
    }
}

/// Snapshot of the registers a calling convention tracks, captured by the
/// bridge on every hook entry.
///
/// Slots are laid out contiguously in the order the convention lists its
/// registers, followed by one slot holding the return address pulled from
/// the stack. The generated save sequence stores each register to its
/// slot's absolute address and the restore sequence loads from the same
/// address, so a value written through [`Registers::set`] between the two
/// is what the CPU resumes with.
pub struct Registers {
    tracked: Vec<Register>,
    slots: Box<[Slot]>,
}

impl Registers {
    pub(crate) fn new(tracked: &[Register]) -> Self {
        let slots = (0..tracked.len() + 1).map(|_| Slot::zeroed()).collect();
        Self {
            tracked: tracked.to_vec(),
            slots,
        }
    }

    /// The registers present in this snapshot, in slot order.
    #[must_use]
    pub fn tracked(&self) -> &[Register] {
        &self.tracked
    }

    /// Pointer to the slot holding `reg`.
    ///
    /// Fails with [`HookError::UnknownRegister`] when the active convention
    /// does not track `reg`.
    pub fn slot_ptr(&self, reg: Register) -> Result<*mut u8, HookError> {
        self.tracked
            .iter()
            .position(|&r| r == reg)
            .map(|i| self.slots[i].ptr())
            .ok_or(HookError::UnknownRegister(reg))
    }

    /// Read a value of type `T` from the slot of `reg`.
    ///
    /// # Safety
    ///
    /// `T` must not be wider than the slot (16 bytes) and must be valid for
    /// any bit pattern the bridge may have stored.
    pub unsafe fn get<T: Copy>(&self, reg: Register) -> Result<T, HookError> {
        debug_assert!(std::mem::size_of::<T>() <= 16);
        let p = self.slot_ptr(reg)?;
        Ok(p.cast::<T>().read())
    }

    /// Write a value of type `T` into the slot of `reg`. The bridge's
    /// restore sequence materializes it into the CPU register.
    ///
    /// # Safety
    ///
    /// `T` must not be wider than the slot (16 bytes).
    pub unsafe fn set<T: Copy>(&self, reg: Register, value: T) -> Result<(), HookError> {
        debug_assert!(std::mem::size_of::<T>() <= 16);
        let p = self.slot_ptr(reg)?;
        p.cast::<T>().write(value);
        Ok(())
    }

    /// The return address that was on top of the stack at hook entry.
    ///
    /// # Safety
    ///
    /// Only meaningful while the hook's bridge is live on some thread.
    #[must_use]
    pub unsafe fn return_address(&self) -> usize {
        self.return_address_ptr().cast::<usize>().read()
    }

    // Absolute addresses handed to the bridge emitter.
    pub(crate) fn slot_address(&self, idx: usize) -> usize {
        self.slots[idx].ptr() as usize
    }

    pub(crate) fn return_address_ptr(&self) -> *mut u8 {
        self.slots[self.tracked.len()].ptr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_contiguous_and_aligned() {
        let regs = Registers::new(&[Register::Rax, Register::Rcx, Register::Xmm0]);
        let base = regs.slot_address(0);
        assert_eq!(base % 16, 0);
        assert_eq!(regs.slot_address(1), base + 16);
        assert_eq!(regs.slot_address(2), base + 32);
        assert_eq!(regs.return_address_ptr() as usize, base + 48);
    }

    #[test]
    fn accessors_roundtrip_and_reject_untracked() {
        let regs = Registers::new(&[Register::Rax, Register::Rsp]);
        unsafe {
            regs.set::<u64>(Register::Rax, 0xdead_beef).unwrap();
            assert_eq!(regs.get::<u64>(Register::Rax).unwrap(), 0xdead_beef);
            assert!(matches!(
                regs.get::<u64>(Register::R12),
                Err(HookError::UnknownRegister(Register::R12))
            ));
        }
    }
}
