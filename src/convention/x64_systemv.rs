//! System V AMD64 calling convention (Linux, macOS, BSD).
//!
//! Integer-class arguments ride RDI, RSI, RDX, RCX, R8, R9; floating and
//! 128-bit vector arguments ride XMM0 through XMM7; everything else spills
//! to the stack in declaration order. Aggregates wider than 16 bytes are
//! returned through a hidden pointer passed in RDI.

use crate::convention::{
    align, resolve_size, ArgLocation, CallingConvention, DataObject, DataType, Layout,
};
use crate::err::HookError;
use crate::registers::{Register, Registers};

const ALIGNMENT: usize = 8;
const PTR_WIDTH: usize = 8;

const INT_ARG_REGS: [Register; 6] = [
    Register::Rdi,
    Register::Rsi,
    Register::Rdx,
    Register::Rcx,
    Register::R8,
    Register::R9,
];

const VEC_ARG_REGS: [Register; 8] = [
    Register::Xmm0,
    Register::Xmm1,
    Register::Xmm2,
    Register::Xmm3,
    Register::Xmm4,
    Register::Xmm5,
    Register::Xmm6,
    Register::Xmm7,
];

// Snapshot order. RAX first so the bridge can spill it through the
// direct-moffs store before using it as the base scratch.
const SAVED_REGS: [Register; 16] = [
    Register::Rax,
    Register::Rdi,
    Register::Rsi,
    Register::Rdx,
    Register::Rcx,
    Register::R8,
    Register::R9,
    Register::Rsp,
    Register::Xmm0,
    Register::Xmm1,
    Register::Xmm2,
    Register::Xmm3,
    Register::Xmm4,
    Register::Xmm5,
    Register::Xmm6,
    Register::Xmm7,
];

/// The System V AMD64 ABI.
pub struct SystemV64 {
    layout: Layout,
    hidden: Option<Register>,
}

impl SystemV64 {
    /// Build the convention for a function with the given argument and
    /// return descriptors.
    pub fn new(mut args: Vec<DataObject>, mut ret: DataObject) -> Result<Self, HookError> {
        for arg in &mut args {
            resolve_size(arg, ALIGNMENT, PTR_WIDTH)?;
        }
        if ret.ty != DataType::Void {
            resolve_size(&mut ret, ALIGNMENT, PTR_WIDTH)?;
        }

        let hidden = returns_via_hidden_ptr(&ret).then_some(Register::Rdi);
        // the hidden pointer occupies the first integer register
        let mut int_idx = usize::from(hidden.is_some());
        let mut vec_idx = 0;
        let mut stack_off = 0;

        let mut locations = Vec::with_capacity(args.len());
        for arg in &args {
            let loc = if let Some(reg) = arg.reg {
                ArgLocation::Register(reg)
            } else {
                match arg.ty {
                    DataType::Float | DataType::Double | DataType::M128 if vec_idx < 8 => {
                        vec_idx += 1;
                        ArgLocation::Register(VEC_ARG_REGS[vec_idx - 1])
                    }
                    // wide vectors and by-value aggregates are memory class
                    DataType::Float | DataType::Double | DataType::M128 => stack(&mut stack_off, arg),
                    DataType::M256 | DataType::M512 | DataType::Object => stack(&mut stack_off, arg),
                    _ if int_idx < 6 => {
                        int_idx += 1;
                        ArgLocation::Register(INT_ARG_REGS[int_idx - 1])
                    }
                    _ => stack(&mut stack_off, arg),
                }
            };
            locations.push(loc);
        }

        let layout = Layout::resolve(args, ret, locations, ALIGNMENT, PTR_WIDTH)?;
        Ok(Self { layout, hidden })
    }
}

fn stack(off: &mut usize, arg: &DataObject) -> ArgLocation {
    let loc = ArgLocation::Stack(*off);
    *off += align(arg.size as usize, ALIGNMENT);
    loc
}

fn returns_via_hidden_ptr(ret: &DataObject) -> bool {
    match ret.ty {
        DataType::Object => ret.size as usize > 16,
        DataType::M256 | DataType::M512 => true,
        _ => false,
    }
}

impl CallingConvention for SystemV64 {
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
            ArgLocation::Stack(off) => Ok(self.stack_argument_base(regs)?.add(*off)),
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
