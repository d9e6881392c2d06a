//! x86-64 register environment and ABI tables.
//!
//! VM state lives in callee-saved registers so it survives the C calls the
//! emitted code makes: the thread context, the register file base, the
//! argument buffer base, and the lexical environment base each get one.
//! C compilers prefer volatile registers, so in the common case a callee
//! never touches these at all.

pub mod emit;
pub(crate) mod encoding;


use crate::isa::CallConv;
use core::fmt;

/// A general-purpose register, identified by its hardware encoding.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Gpr(u8);

/// An SSE register, identified by its hardware encoding.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Xmm(u8);

impl Gpr {
    /// The 4-bit hardware encoding.
    pub const fn enc(self) -> u8 {
        self.0
    }

    /// The low three encoding bits, as used in ModR/M fields.
    pub(crate) const fn low3(self) -> u8 {
        self.0 & 7
    }

    /// Does this register need a REX extension bit?
    pub(crate) const fn is_extended(self) -> bool {
        self.0 >= 8
    }
}

impl Xmm {
    /// The hardware encoding.
    pub const fn enc(self) -> u8 {
        self.0
    }
}

impl fmt::Debug for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        const NAMES: [&str; 16] = [
            "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11",
            "r12", "r13", "r14", "r15",
        ];
        f.write_str(NAMES[self.0 as usize])
    }
}

impl fmt::Debug for Xmm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "xmm{}", self.0)
    }
}

#[allow(missing_docs)]
pub mod regs {
    //! Register constants.

    use super::{Gpr, Xmm};

    pub const RAX: Gpr = Gpr(0);
    pub const RCX: Gpr = Gpr(1);
    pub const RDX: Gpr = Gpr(2);
    pub const RBX: Gpr = Gpr(3);
    pub const RSP: Gpr = Gpr(4);
    pub const RBP: Gpr = Gpr(5);
    pub const RSI: Gpr = Gpr(6);
    pub const RDI: Gpr = Gpr(7);
    pub const R8: Gpr = Gpr(8);
    pub const R9: Gpr = Gpr(9);
    pub const R10: Gpr = Gpr(10);
    pub const R11: Gpr = Gpr(11);
    pub const R12: Gpr = Gpr(12);
    pub const R13: Gpr = Gpr(13);
    pub const R14: Gpr = Gpr(14);
    pub const R15: Gpr = Gpr(15);

    pub const XMM0: Xmm = Xmm(0);
    pub const XMM1: Xmm = Xmm(1);
    pub const XMM2: Xmm = Xmm(2);
    pub const XMM3: Xmm = Xmm(3);
    pub const XMM4: Xmm = Xmm(4);
    pub const XMM5: Xmm = Xmm(5);
    pub const XMM6: Xmm = Xmm(6);
    pub const XMM7: Xmm = Xmm(7);
}

use regs::*;

/// Thread context pointer.
pub const TC: Gpr = R14;
/// Register file base. rbx rather than an extended register keeps the very
/// frequent register-file accesses one REX byte shorter.
pub const WORK: Gpr = RBX;
/// Argument buffer base.
pub const ARGS: Gpr = R12;
/// Lexical environment base.
pub const ENV: Gpr = R13;

/// Scratch registers for intra-operation temporaries.
pub const TMP1: Gpr = RCX;
#[allow(missing_docs)]
pub const TMP2: Gpr = RDX;
#[allow(missing_docs)]
pub const TMP3: Gpr = R8;
#[allow(missing_docs)]
pub const TMP4: Gpr = R9;
#[allow(missing_docs)]
pub const TMP6: Gpr = R11;

/// Call target scratch register: not involved in argument passing and
/// volatile in both calling conventions.
pub const FUNCTION: Gpr = R10;

/// Integer return value register.
pub const RV: Gpr = RAX;
/// Floating-point return value register.
pub const RVF: Xmm = XMM0;

/// Registers the linear-scan allocator may hand out.
///
/// rax stays out: the arithmetic lowerings use it as the accumulator and it
/// carries return values. r10 stays out as the call target scratch.
pub const ALLOCATABLE_GPRS: [u8; 7] = [
    RCX.enc(),
    RDX.enc(),
    RSI.enc(),
    RDI.enc(),
    R8.enc(),
    R9.enc(),
    R11.enc(),
];

/// Bitmap over hardware encodings of the callee-saved registers a
/// register requirement may name without costing an allocation.
pub const NONVOLATILE_GPR_BITMAP: u32 = (1 << RBX.enc())
    | (1 << RBP.enc())
    | (1 << R12.enc())
    | (1 << R13.enc())
    | (1 << R14.enc())
    | (1 << R15.enc());

/// Bytes of shadow space the Windows x64 convention requires the caller to
/// reserve for the callee.
pub const SHADOW_SPACE: i32 = 32;

const SYSV_INT_ARGS: [Gpr; 6] = [RDI, RSI, RDX, RCX, R8, R9];
const WIN64_INT_ARGS: [Gpr; 4] = [RCX, RDX, R8, R9];
const SYSV_FLOAT_ARGS: [Xmm; 8] = [XMM0, XMM1, XMM2, XMM3, XMM4, XMM5, XMM6, XMM7];
const WIN64_FLOAT_ARGS: [Xmm; 4] = [XMM0, XMM1, XMM2, XMM3];

/// The integer argument registers of `call_conv`, in order.
pub fn int_arg_regs(call_conv: CallConv) -> &'static [Gpr] {
    match call_conv {
        CallConv::SystemV => &SYSV_INT_ARGS,
        CallConv::WindowsFastcall => &WIN64_INT_ARGS,
    }
}

/// The floating-point argument registers of `call_conv`, in order.
pub fn float_arg_regs(call_conv: CallConv) -> &'static [Xmm] {
    match call_conv {
        CallConv::SystemV => &SYSV_FLOAT_ARGS,
        CallConv::WindowsFastcall => &WIN64_FLOAT_ARGS,
    }
}

/// Can this build emit code for the machine it is running on?
pub fn supported() -> bool {
    cfg!(target_arch = "x86_64")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_registers_are_nonvolatile() {
        for reg in [TC, WORK, ARGS, ENV] {
            assert!(NONVOLATILE_GPR_BITMAP & (1u32 << reg.enc()) != 0, "{reg:?}");
        }
    }

    #[test]
    fn allocatable_set_avoids_reserved_registers() {
        for enc in ALLOCATABLE_GPRS {
            assert_ne!(enc, RAX.enc());
            assert_ne!(enc, RSP.enc());
            assert_ne!(enc, FUNCTION.enc());
            assert_eq!(NONVOLATILE_GPR_BITMAP & (1u32 << enc), 0);
        }
    }
}
