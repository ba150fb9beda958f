//! Microsoft x64 calling convention.
//!
//! Argument slots are positional: slot `i` of the first four rides
//! RCX/RDX/R8/R9 for integer-class values and XMMi for floating values.
//! The caller reserves a 32-byte shadow area above the return address, so
//! stack-resident arguments start at RSP+0x28. Aggregates whose size is
//! not 1, 2, 4 or 8 are returned through a hidden pointer passed in RCX
//! (and echoed back in RAX by the callee).

use crate::convention::{
    align, resolve_size, ArgLocation, CallingConvention, DataObject, DataType, Layout,
};
use crate::err::HookError;
use crate::registers::{Register, Registers};

const ALIGNMENT: usize = 8;
const PTR_WIDTH: usize = 8;
const SHADOW_SPACE: usize = 32;

const INT_ARG_REGS: [Register; 4] = [Register::Rcx, Register::Rdx, Register::R8, Register::R9];

const VEC_ARG_REGS: [Register; 4] = [
    Register::Xmm0,
    Register::Xmm1,
    Register::Xmm2,
    Register::Xmm3,
];

const SAVED_REGS: [Register; 10] = [
    Register::Rax,
    Register::Rcx,
    Register::Rdx,
    Register::R8,
    Register::R9,
    Register::Rsp,
    Register::Xmm0,
    Register::Xmm1,
    Register::Xmm2,
    Register::Xmm3,
];

/// The Microsoft x64 ABI.
pub struct Microsoft64 {
    layout: Layout,
    hidden: Option<Register>,
}

impl Microsoft64 {
    /// Build the convention for a function with the given argument and
    /// return descriptors.
    pub fn new(mut args: Vec<DataObject>, mut ret: DataObject) -> Result<Self, HookError> {
        for arg in &mut args {
            resolve_size(arg, ALIGNMENT, PTR_WIDTH)?;
        }
        if ret.ty != DataType::Void {
            resolve_size(&mut ret, ALIGNMENT, PTR_WIDTH)?;
        }

        let hidden = returns_via_hidden_ptr(&ret).then_some(Register::Rcx);
        // the hidden pointer consumes positional slot 0
        let mut pos = usize::from(hidden.is_some());
        let mut stack_off = 0;

        let mut locations = Vec::with_capacity(args.len());
        for arg in &args {
            let loc = if let Some(reg) = arg.reg {
                ArgLocation::Register(reg)
            } else if pos < 4 {
                let slot = pos;
                pos += 1;
                match arg.ty {
                    DataType::Float | DataType::Double | DataType::M128 => {
                        ArgLocation::Register(VEC_ARG_REGS[slot])
                    }
                    // memory-class values travel by reference in the
                    // positional integer register; the pointer is what the
                    // snapshot tracks
                    _ => ArgLocation::Register(INT_ARG_REGS[slot]),
                }
            } else {
                pos += 1;
                let loc = ArgLocation::Stack(stack_off);
                stack_off += align(arg.size as usize, ALIGNMENT);
                loc
            };
            locations.push(loc);
        }

        let layout = Layout::resolve(args, ret, locations, ALIGNMENT, PTR_WIDTH)?;
        Ok(Self { layout, hidden })
    }
}

fn returns_via_hidden_ptr(ret: &DataObject) -> bool {
    match ret.ty {
        DataType::Object => !matches!(ret.size, 1 | 2 | 4 | 8),
        DataType::M256 | DataType::M512 => true,
        _ => false,
    }
}

impl CallingConvention for Microsoft64 {
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
        let rsp: u64 = regs.get(Register::Rsp)?;
        Ok((rsp as usize + PTR_WIDTH) as *mut u8)
    }

    unsafe fn argument_ptr(&self, index: usize, regs: &Registers) -> Result<*mut u8, HookError> {
        match self
            .layout
            .locations
            .get(index)
            .ok_or(HookError::UnknownDataType)?
        {
            ArgLocation::Register(reg) => regs.slot_ptr(*reg),
            // stack arguments live past the shadow area
            ArgLocation::Stack(off) => {
                Ok(self.stack_argument_base(regs)?.add(SHADOW_SPACE + *off))
            }
        }
    }

    unsafe fn return_ptr(&self, regs: &Registers) -> Result<*mut u8, HookError> {
        if self.hidden.is_some() {
            let buf: u64 = regs.get(Register::Rax)?;
            return Ok(buf as *mut u8);
        }
        match self.layout.ret.ty {
            t if t.is_float() || t == DataType::M128 => regs.slot_ptr(Register::Xmm0),
            _ => regs.slot_ptr(Register::Rax),
        }
    }

    fn hidden_return_register(&self) -> Option<Register> {
        self.hidden
    }

    fn arg_stack_size(&self) -> usize {
        self.layout.stack_size
    }

    fn arg_register_size(&self) -> usize {
        self.layout.register_size
    }
}
