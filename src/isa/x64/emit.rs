//! x86-64 lowering of primitives, C calls, branches, and frame glue.
//!
//! The emitted code addresses the VM's register file as memory off the
//! `WORK` base register: slot `n` lives at `[WORK + 8*n]`. Values pass
//! through the scratch registers within a single lowering and never across
//! two, so every primitive is independent of its neighbours.

use crate::binemit::{CodeBuffer, Label, Reloc};
use crate::isa::x64::encoding::cond;
use crate::isa::x64::encoding::{
    add_rsp_imm8, call_r, cmp_m_imm8, cmp_r_imm8, cqo, jcc_label, jmp_label, mov_m_imm32,
    mov_r_imm32, mov_r_imm64, mov_r_r, movzx_rax_al, op64_m, op64_r_m, op64_r_mbase, pop_r,
    push_r, ret, setcc_al, sse_x_m, sub_rsp_imm8, test_m16_imm16, test_r_r,
};
use crate::isa::x64::regs::{RBP, RSP};
use crate::isa::x64::{
    float_arg_regs, int_arg_regs, Gpr, Xmm, ARGS, ENV, FUNCTION, RV, RVF, TC, TMP1, TMP2, TMP3,
    WORK,
};
use crate::isa::CallConv;
use crate::offsets::{HostFunctions, VmOffsets};
use crate::result::{CodegenError, CodegenResult};
use crate::tile::Opcode;
use log::trace;

/// A primitive operation: an opcode plus its operands.
///
/// Register-file slot operands sit in `regs` (destination first, in the
/// operand order of the bytecode); immediate payloads (constants, field
/// offsets, argument indexes) ride in `imm`.
#[derive(Clone, Debug)]
pub struct Primitive {
    /// The operation to lower.
    pub op: Opcode,
    /// Register-file slot operands.
    pub regs: [u16; 3],
    /// Immediate payload.
    pub imm: i64,
    /// For `const_s`: the resolved string object's address and header
    /// flags, when the compiler has them. Enables the second-generation
    /// fast path; otherwise the string is fetched through the current
    /// compile unit at run time.
    pub resolved_str: Option<(u64, u16)>,
}

impl Primitive {
    /// A primitive with all operands zeroed.
    pub fn new(op: Opcode) -> Self {
        Self {
            op,
            regs: [0; 3],
            imm: 0,
            resolved_str: None,
        }
    }
}

/// Sources a C call argument can be loaded from.
#[derive(Clone, Copy, Debug)]
pub enum CallArg {
    /// A frame-relative stack slot, addressed as `[rbp - offset]`.
    Stack(i32),
    /// A piece of interpreter state materialised from the thread context.
    Interp(InterpVar),
    /// A register-file slot.
    Reg(u16),
    /// A register-file slot holding a floating-point value.
    RegF(u16),
    /// A 64-bit immediate.
    Literal(i64),
}

/// Interpreter state reachable from the thread context.
#[derive(Clone, Copy, Debug)]
pub enum InterpVar {
    /// The thread context itself.
    Tc,
    /// The currently executing frame.
    Frame,
    /// The current compile unit.
    CompUnit,
}

/// A C call descriptor.
#[derive(Clone, Debug)]
pub struct CallC {
    /// Address of the function to call.
    pub func: u64,
    /// Arguments in call order.
    pub args: Vec<CallArg>,
    /// Variadic calls are not supported and rejected at emission.
    pub variadic: bool,
}

/// What to do with a C call's return value.
#[derive(Clone, Copy, Debug)]
pub enum RvMode {
    /// Store the integer return value into a register-file slot.
    ValToReg,
    /// Store the floating-point return value into a register-file slot.
    ValToRegF,
    /// Dereference the returned pointer and store the pointee.
    RefToReg,
    /// Store a register-file slot through the returned pointer.
    RegToPtr,
}

/// A return-value handling descriptor.
#[derive(Clone, Copy, Debug)]
pub struct RvHandler {
    /// The handling mode.
    pub mode: RvMode,
    /// The register-file slot involved.
    pub slot: u16,
}

/// A branch descriptor: an unconditional `goto` or a conditional test of a
/// register-file slot.
#[derive(Clone, Copy, Debug)]
pub struct BranchSpec {
    /// `goto`, `if_i`, or `unless_i`.
    pub op: Opcode,
    /// The tested register-file slot (ignored for `goto`).
    pub slot: u16,
    /// Where to go.
    pub dest: BranchTarget,
}

/// A branch target in one of the two label spaces.
#[derive(Clone, Copy, Debug)]
pub enum BranchTarget {
    /// The function's global exit label.
    Exit,
    /// A dynamically numbered label.
    Label(Label),
}

/// The machine code emitter.
///
/// Borrows the output buffer and the host layout tables for the duration of
/// one function's emission; the driver walks its JIT graph calling the
/// entry points in program order and finalizes the buffer afterwards.
pub struct Emitter<'a> {
    buf: &'a mut CodeBuffer,
    offsets: &'a VmOffsets,
    host: &'a HostFunctions,
    call_conv: CallConv,
}

/// Byte offset of a register-file slot from the `WORK` base.
fn work(slot: u16) -> i32 {
    i32::from(slot) * 8
}

impl<'a> Emitter<'a> {
    /// Create an emitter writing into `buf`.
    pub fn new(
        buf: &'a mut CodeBuffer,
        offsets: &'a VmOffsets,
        host: &'a HostFunctions,
        call_conv: CallConv,
    ) -> Self {
        Self {
            buf,
            offsets,
            host,
            call_conv,
        }
    }

    /// Emit the function prologue: establish the frame, save the VM state
    /// registers, and load them from the thread context and frame passed in
    /// the first two argument registers.
    pub fn prologue(&mut self) {
        let args = int_arg_regs(self.call_conv);
        push_r(self.buf, RBP);
        mov_r_r(self.buf, RBP, RSP);
        for reg in [TC, WORK, ARGS, ENV] {
            push_r(self.buf, reg);
        }
        mov_r_r(self.buf, TC, args[0]);
        op64_r_m(self.buf, &[0x8b], WORK, args[1], self.offsets.frame_work);
        op64_r_m(self.buf, &[0x8b], ARGS, args[1], self.offsets.frame_args);
        op64_r_m(self.buf, &[0x8b], ENV, args[1], self.offsets.frame_env);
    }

    /// Emit the function epilogue and bind the global exit label to it.
    pub fn epilogue(&mut self) {
        let exit = self.buf.exit_label();
        self.buf.bind_label(exit);
        for reg in [ENV, ARGS, WORK, TC] {
            pop_r(self.buf, reg);
        }
        mov_r_r(self.buf, RSP, RBP);
        pop_r(self.buf, RBP);
        ret(self.buf);
    }

    /// Lower one primitive operation.
    pub fn primitive(&mut self, prim: &Primitive) -> CodegenResult<()> {
        trace!("emit opcode <{}>", prim.op);
        let offs = self.offsets;
        let [r0, r1, r2] = prim.regs;
        match prim.op {
            Opcode::ConstI64Short => {
                let val = prim.imm as i16;
                mov_m_imm32(self.buf, WORK, work(r0), i32::from(val));
            }
            Opcode::ConstI64 | Opcode::ConstN64 => {
                mov_r_imm64(self.buf, TMP1, prim.imm as u64, None);
                op64_r_m(self.buf, &[0x89], TMP1, WORK, work(r0));
            }
            Opcode::ConstStr => {
                if let Some((addr, flags)) = prim.resolved_str {
                    if self.gen2_ref(r0, addr, flags) {
                        return Ok(());
                    }
                }
                // interp_cu is a pointer to a pointer.
                op64_r_m(self.buf, &[0x8b], TMP1, TC, offs.tc_interp_cu);
                op64_r_mbase(self.buf, &[0x8b], TMP1, TMP1);
                op64_r_m(self.buf, &[0x8b], TMP1, TMP1, offs.cu_strings);
                op64_r_m(self.buf, &[0x8b], TMP1, TMP1, prim.imm as i32 * 8);
                op64_r_m(self.buf, &[0x89], TMP1, WORK, work(r0));
            }
            Opcode::GetArg => {
                op64_r_m(self.buf, &[0x8b], TMP1, ARGS, prim.imm as i32 * 8);
                op64_r_m(self.buf, &[0x89], TMP1, WORK, work(r0));
            }
            Opcode::GetField | Opcode::GetFieldObj => {
                let field = prim.imm as i32;
                op64_r_m(self.buf, &[0x8b], TMP1, WORK, work(r1));
                op64_r_m(self.buf, &[0x8d], TMP1, TMP1, offs.obj_body);
                // A non-zero "replaced" pointer redirects the body.
                cmp_m_imm8(self.buf, TMP1, offs.body_replaced, 0);
                let in_place = self.buf.get_label();
                jcc_label(self.buf, cond::E, in_place);
                op64_r_m(self.buf, &[0x8b], TMP1, TMP1, offs.body_replaced);
                self.buf.bind_label(in_place);
                op64_r_m(self.buf, &[0x8b], TMP1, TMP1, field);
                if prim.op == Opcode::GetFieldObj {
                    // A zero object pointer reads as the VM null singleton.
                    cmp_r_imm8(self.buf, TMP1, 0);
                    let not_null = self.buf.get_label();
                    jcc_label(self.buf, cond::NE, not_null);
                    op64_r_m(self.buf, &[0x8b], TMP1, TC, offs.tc_instance);
                    op64_r_m(self.buf, &[0x8b], TMP1, TMP1, offs.instance_vm_null);
                    self.buf.bind_label(not_null);
                }
                op64_r_m(self.buf, &[0x89], TMP1, WORK, work(r0));
            }
            Opcode::BindField | Opcode::BindFieldObj => {
                let field = prim.imm as i32;
                op64_r_m(self.buf, &[0x8b], TMP1, WORK, work(r0));
                op64_r_m(self.buf, &[0x8b], TMP2, WORK, work(r1));
                op64_r_m(self.buf, &[0x8d], TMP3, TMP1, offs.obj_body);
                cmp_m_imm8(self.buf, TMP3, offs.body_replaced, 0);
                let in_place = self.buf.get_label();
                jcc_label(self.buf, cond::E, in_place);
                op64_r_m(self.buf, &[0x8b], TMP3, TMP3, offs.body_replaced);
                self.buf.bind_label(in_place);
                if prim.op == Opcode::BindFieldObj {
                    self.write_barrier(r0);
                }
                op64_r_m(self.buf, &[0x89], TMP2, TMP3, field);
            }
            Opcode::Set => {
                op64_r_m(self.buf, &[0x8b], TMP1, WORK, work(r1));
                op64_r_m(self.buf, &[0x89], TMP1, WORK, work(r0));
            }
            Opcode::AddI | Opcode::SubI | Opcode::MulI | Opcode::DivI | Opcode::ModI => {
                op64_r_m(self.buf, &[0x8b], RV, WORK, work(r1));
                match prim.op {
                    Opcode::AddI => op64_r_m(self.buf, &[0x03], RV, WORK, work(r2)),
                    Opcode::SubI => op64_r_m(self.buf, &[0x2b], RV, WORK, work(r2)),
                    Opcode::MulI => op64_r_m(self.buf, &[0x0f, 0xaf], RV, WORK, work(r2)),
                    Opcode::DivI | Opcode::ModI => {
                        // Sign-extend rax into rdx:rax before dividing.
                        cqo(self.buf);
                        op64_m(self.buf, 0xf7, 7, WORK, work(r2));
                    }
                    _ => unreachable!(),
                }
                if prim.op == Opcode::ModI {
                    // The remainder lands in rdx.
                    op64_r_m(self.buf, &[0x89], TMP2, WORK, work(r0));
                } else {
                    op64_r_m(self.buf, &[0x89], RV, WORK, work(r0));
                }
            }
            Opcode::IncI => op64_m(self.buf, 0xff, 0, WORK, work(r0)),
            Opcode::DecI => op64_m(self.buf, 0xff, 1, WORK, work(r0)),
            Opcode::AddN | Opcode::SubN | Opcode::MulN | Opcode::DivN => {
                sse_x_m(self.buf, 0x10, false, RVF.enc(), WORK, work(r1));
                let op = match prim.op {
                    Opcode::AddN => 0x58,
                    Opcode::SubN => 0x5c,
                    Opcode::MulN => 0x59,
                    Opcode::DivN => 0x5e,
                    _ => unreachable!(),
                };
                sse_x_m(self.buf, op, false, RVF.enc(), WORK, work(r2));
                sse_x_m(self.buf, 0x11, false, RVF.enc(), WORK, work(r0));
            }
            Opcode::CoerceIN => {
                sse_x_m(self.buf, 0x2a, true, RVF.enc(), WORK, work(r1));
                sse_x_m(self.buf, 0x11, false, RVF.enc(), WORK, work(r0));
            }
            Opcode::CoerceNI => {
                sse_x_m(self.buf, 0x2c, true, RV.enc(), WORK, work(r1));
                op64_r_m(self.buf, &[0x89], RV, WORK, work(r0));
            }
            Opcode::EqI
            | Opcode::NeI
            | Opcode::LtI
            | Opcode::LeI
            | Opcode::GtI
            | Opcode::GeI => {
                op64_r_m(self.buf, &[0x8b], RV, WORK, work(r1));
                op64_r_m(self.buf, &[0x3b], RV, WORK, work(r2));
                let cc = match prim.op {
                    Opcode::EqI => cond::E,
                    Opcode::NeI => cond::NE,
                    Opcode::LtI => cond::L,
                    Opcode::LeI => cond::LE,
                    Opcode::GtI => cond::G,
                    Opcode::GeI => cond::GE,
                    _ => unreachable!(),
                };
                setcc_al(self.buf, cc);
                movzx_rax_al(self.buf);
                op64_r_m(self.buf, &[0x89], RV, WORK, work(r0));
            }
            _ => return Err(CodegenError::UnsupportedOpcode(prim.op)),
        }
        Ok(())
    }

    /// If `flags` marks the object at `addr` as second-generation, emit a
    /// direct immediate store of the address into `slot` and return true.
    /// Second-generation objects never move, so the embedded pointer stays
    /// valid (and is still recorded as an `Abs8` relocation).
    pub fn gen2_ref(&mut self, slot: u16, addr: u64, flags: u16) -> bool {
        if flags & self.offsets.second_gen_flag == 0 {
            return false;
        }
        mov_r_imm64(self.buf, TMP1, addr, Some(Reloc::Abs8));
        op64_r_m(self.buf, &[0x89], TMP1, WORK, work(slot));
        true
    }

    /// Emit one C call: marshal the arguments into ABI registers and call
    /// through the function scratch register.
    pub fn call_c(&mut self, call: &CallC) -> CodegenResult<()> {
        trace!("emit c call <{} args>", call.args.len());
        if call.variadic {
            return Err(CodegenError::Nyi("variadic C call"));
        }
        let offs = self.offsets;
        for (i, arg) in call.args.iter().enumerate() {
            match *arg {
                CallArg::Stack(offset) => {
                    let reg = self.int_arg(i)?;
                    op64_r_m(self.buf, &[0x8b], reg, RBP, -offset);
                }
                CallArg::Interp(InterpVar::Tc) => {
                    let reg = self.int_arg(i)?;
                    mov_r_r(self.buf, reg, TC);
                }
                CallArg::Interp(InterpVar::Frame) => {
                    let reg = self.int_arg(i)?;
                    op64_r_m(self.buf, &[0x8b], reg, TC, offs.tc_cur_frame);
                }
                CallArg::Interp(InterpVar::CompUnit) => {
                    let reg = self.int_arg(i)?;
                    op64_r_m(self.buf, &[0x8b], RV, TC, offs.tc_interp_cu);
                    op64_r_mbase(self.buf, &[0x8b], reg, RV);
                }
                CallArg::Reg(slot) => {
                    let reg = self.int_arg(i)?;
                    op64_r_m(self.buf, &[0x8b], reg, WORK, work(slot));
                }
                CallArg::RegF(slot) => {
                    let xmm = self.float_arg(i)?;
                    sse_x_m(self.buf, 0x10, false, xmm.enc(), WORK, work(slot));
                }
                CallArg::Literal(value) => {
                    let reg = self.int_arg(i)?;
                    match i32::try_from(value) {
                        Ok(value) => mov_r_imm32(self.buf, reg, value),
                        Err(_) => mov_r_imm64(self.buf, reg, value as u64, None),
                    }
                }
            }
        }
        self.callp(call.func);
        Ok(())
    }

    /// Emit one branch.
    pub fn branch(&mut self, branch: &BranchSpec) -> CodegenResult<()> {
        let label = match branch.dest {
            BranchTarget::Exit => self.buf.exit_label(),
            BranchTarget::Label(label) => label,
        };
        trace!("emit branch <{}> to {}", branch.op, label);
        match branch.op {
            Opcode::Goto => jmp_label(self.buf, label),
            Opcode::IfI => {
                op64_r_m(self.buf, &[0x8b], RV, WORK, work(branch.slot));
                test_r_r(self.buf, RV, RV);
                jcc_label(self.buf, cond::NZ, label);
            }
            Opcode::UnlessI => {
                op64_r_m(self.buf, &[0x8b], RV, WORK, work(branch.slot));
                test_r_r(self.buf, RV, RV);
                jcc_label(self.buf, cond::Z, label);
            }
            _ => return Err(CodegenError::UnsupportedOpcode(branch.op)),
        }
        Ok(())
    }

    /// Allocate a fresh dynamic label in the output buffer.
    pub fn get_label(&mut self) -> Label {
        self.buf.get_label()
    }

    /// Bind a label point at the current position.
    pub fn label(&mut self, label: Label) {
        self.buf.bind_label(label);
    }

    /// Emit return-value handling for the C call that preceded it.
    pub fn rv_handler(&mut self, rv: &RvHandler) {
        match rv.mode {
            RvMode::ValToReg => {
                op64_r_m(self.buf, &[0x89], RV, WORK, work(rv.slot));
            }
            RvMode::ValToRegF => {
                sse_x_m(self.buf, 0x11, false, RVF.enc(), WORK, work(rv.slot));
            }
            RvMode::RefToReg => {
                op64_r_mbase(self.buf, &[0x8b], TMP1, RV);
                op64_r_m(self.buf, &[0x89], TMP1, WORK, work(rv.slot));
            }
            RvMode::RegToPtr => {
                op64_r_m(self.buf, &[0x8b], TMP1, WORK, work(rv.slot));
                op64_r_mbase(self.buf, &[0x89], TMP1, RV);
            }
        }
    }

    /// The generational write barrier, inlined before an object store.
    ///
    /// Calls out to the host when the target object is second-generation
    /// and the incoming value (in TMP2) is a non-null first-generation
    /// reference. Expects the target object in TMP1 and its body pointer in
    /// TMP3. Only TMP2 and TMP3 are saved around the call; TMP1 aliases an
    /// argument register and is clobbered, so it must not be read after the
    /// barrier.
    fn write_barrier(&mut self, obj_slot: u16) {
        let offs = self.offsets;
        let gen2 = offs.second_gen_flag;
        let skip = self.buf.get_label();
        test_m16_imm16(self.buf, TMP1, offs.collectable_flags, gen2);
        jcc_label(self.buf, cond::Z, skip);
        cmp_r_imm8(self.buf, TMP2, 0);
        jcc_label(self.buf, cond::E, skip);
        test_m16_imm16(self.buf, TMP2, offs.collectable_flags, gen2);
        jcc_label(self.buf, cond::NZ, skip);
        push_r(self.buf, TMP2);
        push_r(self.buf, TMP3);
        let args = int_arg_regs(self.call_conv);
        mov_r_r(self.buf, args[0], TC);
        // Argument registers overlap the temporaries, so the target object
        // is reloaded from the register file rather than copied from TMP1.
        op64_r_m(self.buf, &[0x8b], args[1], WORK, work(obj_slot));
        self.callp(self.host.write_barrier_hit);
        pop_r(self.buf, TMP3);
        pop_r(self.buf, TMP2);
        self.buf.bind_label(skip);
    }

    /// Load `func` into the call scratch register and call it, reserving
    /// shadow space on Windows.
    fn callp(&mut self, func: u64) {
        mov_r_imm64(self.buf, FUNCTION, func, Some(Reloc::Abs8));
        let shadow = self.call_conv == CallConv::WindowsFastcall;
        if shadow {
            sub_rsp_imm8(self.buf, crate::isa::x64::SHADOW_SPACE as i8);
        }
        call_r(self.buf, FUNCTION);
        if shadow {
            add_rsp_imm8(self.buf, crate::isa::x64::SHADOW_SPACE as i8);
        }
    }

    fn int_arg(&self, i: usize) -> CodegenResult<Gpr> {
        let regs = int_arg_regs(self.call_conv);
        regs.get(i).copied().ok_or(CodegenError::TooManyArgs {
            supported: regs.len(),
            requested: i + 1,
        })
    }

    fn float_arg(&self, i: usize) -> CodegenResult<Xmm> {
        let regs = float_arg_regs(self.call_conv);
        regs.get(i).copied().ok_or(CodegenError::TooManyArgs {
            supported: regs.len(),
            requested: i + 1,
        })
    }
}
