//! The 32-bit x86 conventions: `cdecl`, `stdcall`, `thiscall` and
//! `fastcall`.
//!
//! All four share one stack discipline (arguments at ESP+4 upward in
//! declaration order) and differ in which leading arguments ride ECX/EDX
//! and whether the callee pops the stack-resident bytes on return.
//!
//! Returns wider than a dword (`long long`, `double`, large aggregates)
//! ride the EDX:EAX pair or the x87 stack, neither of which the 4-byte
//! snapshot slots can restore faithfully, so such descriptors are rejected
//! at construction.

use crate::convention::{
    align, resolve_size, ArgLocation, CallingConvention, DataObject, DataType, Layout,
};
use crate::err::HookError;
use crate::registers::{Register, Registers};

const ALIGNMENT: usize = 4;
const PTR_WIDTH: usize = 4;

const SAVED_REGS: [Register; 4] = [
    Register::Eax,
    Register::Ecx,
    Register::Edx,
    Register::Esp,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Cdecl,
    Stdcall,
    Thiscall,
    Fastcall,
}

/// One of the four built-in 32-bit conventions.
pub struct X86Convention {
    layout: Layout,
    kind: Kind,
}

impl X86Convention {
    /// `cdecl`: every argument on the stack, caller cleans up.
    pub fn cdecl(args: Vec<DataObject>, ret: DataObject) -> Result<Self, HookError> {
        Self::build(args, ret, Kind::Cdecl)
    }

    /// `stdcall`: every argument on the stack, callee cleans up.
    pub fn stdcall(args: Vec<DataObject>, ret: DataObject) -> Result<Self, HookError> {
        Self::build(args, ret, Kind::Stdcall)
    }

    /// `thiscall`: `this` in ECX, remaining arguments on the stack, callee
    /// cleans up.
    pub fn thiscall(args: Vec<DataObject>, ret: DataObject) -> Result<Self, HookError> {
        Self::build(args, ret, Kind::Thiscall)
    }

    /// `fastcall`: the first two dword-or-smaller integer arguments in ECX
    /// and EDX, the rest on the stack, callee cleans up.
    pub fn fastcall(args: Vec<DataObject>, ret: DataObject) -> Result<Self, HookError> {
        Self::build(args, ret, Kind::Fastcall)
    }

    fn build(mut args: Vec<DataObject>, mut ret: DataObject, kind: Kind) -> Result<Self, HookError> {
        for arg in &mut args {
            resolve_size(arg, ALIGNMENT, PTR_WIDTH)?;
        }
        if ret.ty != DataType::Void {
            resolve_size(&mut ret, ALIGNMENT, PTR_WIDTH)?;
            if !fits_in_eax(&ret) {
                return Err(HookError::UnknownDataType);
            }
        }

        let mut reg_args = 0;
        let mut stack_off = 0;
        let mut locations = Vec::with_capacity(args.len());
        for (i, arg) in args.iter().enumerate() {
            let loc = if let Some(reg) = arg.reg {
                ArgLocation::Register(reg)
            } else {
                match kind {
                    Kind::Thiscall if i == 0 => ArgLocation::Register(Register::Ecx),
                    Kind::Fastcall if reg_args < 2 && dword_integer(arg) => {
                        reg_args += 1;
                        ArgLocation::Register(if reg_args == 1 {
                            Register::Ecx
                        } else {
                            Register::Edx
                        })
                    }
                    _ => {
                        let loc = ArgLocation::Stack(stack_off);
                        stack_off += align(arg.size as usize, ALIGNMENT);
                        loc
                    }
                }
            };
            locations.push(loc);
        }

        let layout = Layout::resolve(args, ret, locations, ALIGNMENT, PTR_WIDTH)?;
        Ok(Self { layout, kind })
    }
}

fn fits_in_eax(ret: &DataObject) -> bool {
    match ret.ty {
        DataType::LongLong | DataType::ULongLong | DataType::Double => false,
        t if t.is_float() || t.is_vector() => false,
        DataType::Object => ret.size as usize <= 4,
        _ => true,
    }
}

fn dword_integer(arg: &DataObject) -> bool {
    !arg.ty.is_float() && !arg.ty.is_vector() && arg.ty != DataType::Object && arg.size <= 4
}

impl CallingConvention for X86Convention {
    fn registers(&self) -> &[Register] {
        &SAVED_REGS
    }

    fn arguments(&self) -> &[DataObject] {
        &self.layout.args
    }

    fn return_value(&self) -> &DataObject {
        &self.layout.ret
    }

    fn alignment(&self) -> usize {
        ALIGNMENT
    }

    fn pointer_width(&self) -> usize {
        PTR_WIDTH
    }

    unsafe fn stack_argument_base(&self, regs: &Registers) -> Result<*mut u8, HookError> {
        let esp: u32 = regs.get(Register::Esp)?;
        Ok((esp as usize + PTR_WIDTH) as *mut u8)
    }

    unsafe fn argument_ptr(&self, index: usize, regs: &Registers) -> Result<*mut u8, HookError> {
        match self
            .layout
            .locations
            .get(index)
            .ok_or(HookError::UnknownDataType)?
        {
            ArgLocation::Register(reg) => regs.slot_ptr(*reg),
            ArgLocation::Stack(off) => Ok(self.stack_argument_base(regs)?.add(*off)),
        }
    }

    unsafe fn return_ptr(&self, regs: &Registers) -> Result<*mut u8, HookError> {
        regs.slot_ptr(Register::Eax)
    }

    fn pop_size(&self) -> usize {
        match self.kind {
            Kind::Cdecl => 0,
            // callee-clean conventions pop their stack-resident bytes
            Kind::Stdcall | Kind::Thiscall | Kind::Fastcall => self.layout.stack_size,
        }
    }

    fn arg_stack_size(&self) -> usize {
        self.layout.stack_size
    }

    fn arg_register_size(&self) -> usize {
        self.layout.register_size
    }
}
