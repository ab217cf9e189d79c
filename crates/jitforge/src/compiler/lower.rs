//! Lowering: virtual-register functions to machine code.
//!
//! Runs liveness and linear scan, lays out the stack frame, then replays
//! the block structure through the assembler in program order.  Spilled
//! values are reloaded into the convention's scratch registers right
//! before use and stored back right after definition.

use alloc::format;
use alloc::vec::Vec;

use super::callconv::CallConv;
use super::func::{BinOp, BlockId, CallTarget, Cond, Func, Inst, ShiftOp, Term, VReg};
use super::liveness;
use super::regalloc::{self, Allocation, Loc};
use crate::asm::Assembler;
use crate::error::JitError;
use crate::isa::{Cc, Mnemonic};
use crate::operand::{LabelId, Mem, Operand, Register, Width};
use crate::Mode;

/// Compilation parameters.
#[derive(Debug, Clone, Copy)]
pub struct CompileOptions {
    /// Calling convention for parameters, calls, and the return value.
    pub conv: &'static CallConv,
    /// Upper bound on the stack frame, in bytes.  Exceeding it is
    /// [`JitError::FrameOverflow`] instead of silent unbounded growth.
    pub stack_budget: u64,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            conv: CallConv::systemv(),
            stack_budget: 1024 * 1024,
        }
    }
}

/// Compile `func` into `asm` at the current offset.
///
/// Returns the function's entry label, named after the function so it
/// shows up in the finalized image's symbol table.  The function is
/// validated in full before the first byte is emitted, so a failed
/// compile leaves the assembler exactly as it was.
pub fn compile(
    func: &Func,
    options: &CompileOptions,
    asm: &mut Assembler,
) -> Result<LabelId, JitError> {
    if asm.mode() != Mode::Long64 {
        return Err(JitError::InvalidOperandCombination {
            detail: "the compiler layer targets 64-bit mode".into(),
        });
    }
    let conv = options.conv;
    if func.param_count() > conv.arg_regs.len() {
        return Err(JitError::InvalidOperandCombination {
            detail: format!(
                "function takes {} parameters; convention '{}' passes at most {} in registers",
                func.param_count(),
                conv.name,
                conv.arg_regs.len()
            ),
        });
    }
    for block in &func.blocks {
        for inst in &block.insts {
            if let Inst::Call { args, .. } = inst {
                if args.len() > conv.arg_regs.len() {
                    return Err(JitError::InvalidOperandCombination {
                        detail: format!(
                            "call passes {} arguments; convention '{}' passes at most {} in registers",
                            args.len(),
                            conv.name,
                            conv.arg_regs.len()
                        ),
                    });
                }
            }
        }
    }

    let live = liveness::compute(func)?;
    let alloc = regalloc::allocate(&live, conv, func.vreg_count())?;

    // Frame layout, below the saved registers:
    //   [rbp-8*1 .. rbp-8*saved]          saved callee-saved registers
    //   [.. - 8*spill_slots]              spill slots
    //   [rsp .. rsp+shadow_space]         callee home space (Win64)
    // Padded so RSP is 16-byte aligned at call sites.
    let saved = alloc.used_callee_saved.len() as u64;
    let mut frame = u64::from(alloc.spill_slots) * 8 + conv.shadow_space;
    let align = conv.stack_align;
    frame += (align - (saved * 8 + frame) % align) % align;
    if frame > options.stack_budget {
        return Err(JitError::FrameOverflow {
            requested: frame,
            budget: options.stack_budget,
        });
    }

    let entry = asm.new_named_label(func.name());
    let block_labels: Vec<LabelId> = (0..func.block_count()).map(|_| asm.new_label()).collect();
    let epilogue = asm.new_label();

    let mut lower = Lower {
        asm,
        alloc: &alloc,
        conv,
        saved_bytes: saved * 8,
        frame,
        block_labels,
        epilogue,
    };

    lower.prologue(entry)?;
    lower.param_moves(func)?;
    for (idx, block) in func.blocks.iter().enumerate() {
        lower.asm.bind(lower.block_labels[idx])?;
        for inst in &block.insts {
            lower.inst(inst)?;
        }
        lower.term(&block.term, idx, func.block_count())?;
    }
    lower.epilogue()?;
    Ok(entry)
}

struct Lower<'a> {
    asm: &'a mut Assembler,
    alloc: &'a Allocation,
    conv: &'static CallConv,
    saved_bytes: u64,
    frame: u64,
    block_labels: Vec<LabelId>,
    epilogue: LabelId,
}

impl Lower<'_> {
    fn scratch0(&self) -> Register {
        self.conv.scratch[0]
    }

    fn scratch1(&self) -> Register {
        self.conv.scratch[1]
    }

    fn spill_mem(&self, slot: u32) -> Mem {
        let disp = -((self.saved_bytes + u64::from(slot + 1) * 8) as i32);
        Mem::base_disp(Register::Rbp, disp).expect("rbp+disp is always well-formed")
    }

    /// The value as a register-or-memory operand, usable directly as the
    /// second operand of ALU forms.
    fn rm(&self, vreg: VReg) -> Operand {
        match self.alloc.loc(vreg) {
            Loc::Reg(r) => Operand::Reg(r),
            Loc::Spill(s) => Operand::Mem(self.spill_mem(s)),
        }
    }

    /// The value in a register, reloading spills into `scratch`.
    fn read(&mut self, vreg: VReg, scratch: Register) -> Result<Register, JitError> {
        match self.alloc.loc(vreg) {
            Loc::Reg(r) => Ok(r),
            Loc::Spill(s) => {
                self.mov(Operand::Reg(scratch), Operand::Mem(self.spill_mem(s)))?;
                Ok(scratch)
            }
        }
    }

    /// Store `src` into the value's home location.
    fn write(&mut self, vreg: VReg, src: Register) -> Result<(), JitError> {
        match self.alloc.loc(vreg) {
            Loc::Reg(r) if r == src => Ok(()),
            Loc::Reg(r) => self.mov(Operand::Reg(r), Operand::Reg(src)),
            Loc::Spill(s) => self.mov(Operand::Mem(self.spill_mem(s)), Operand::Reg(src)),
        }
    }

    fn mov(&mut self, dst: Operand, src: Operand) -> Result<(), JitError> {
        self.asm.emit(Mnemonic::Mov, &[dst, src])
    }

    fn prologue(&mut self, entry: LabelId) -> Result<(), JitError> {
        self.asm.bind(entry)?;
        self.asm.emit(Mnemonic::Push, &[Register::Rbp.into()])?;
        self.mov(Register::Rbp.into(), Register::Rsp.into())?;
        for &r in &self.alloc.used_callee_saved {
            self.asm.emit(Mnemonic::Push, &[r.into()])?;
        }
        if self.frame > 0 {
            self.asm.emit(
                Mnemonic::Sub,
                &[Register::Rsp.into(), Operand::Imm(self.frame as i64)],
            )?;
        }
        Ok(())
    }

    fn epilogue(&mut self) -> Result<(), JitError> {
        self.asm.bind(self.epilogue)?;
        if self.frame > 0 {
            let top = Mem::base_disp(Register::Rbp, -(self.saved_bytes as i32))
                .expect("rbp+disp is always well-formed");
            self.asm
                .emit(Mnemonic::Lea, &[Register::Rsp.into(), top.into()])?;
        }
        for &r in self.alloc.used_callee_saved.iter().rev() {
            self.asm.emit(Mnemonic::Pop, &[r.into()])?;
        }
        self.asm.emit(Mnemonic::Pop, &[Register::Rbp.into()])?;
        self.asm.emit(Mnemonic::Ret, &[])
    }

    /// Move incoming arguments to their allocated homes.
    ///
    /// In functions without calls the allocator may have placed a
    /// parameter in another parameter's argument register, so the
    /// register-to-register moves form a parallel assignment; cycles are
    /// broken through scratch.
    fn param_moves(&mut self, func: &Func) -> Result<(), JitError> {
        let mut pending: Vec<(Register, Register)> = Vec::new();
        for (i, &p) in func.params.iter().enumerate() {
            let src = self.conv.arg_regs[i];
            match self.alloc.loc(p) {
                Loc::Reg(dst) if dst == src => {}
                Loc::Reg(dst) => pending.push((src, dst)),
                // Stores clobber no register; do them first.
                Loc::Spill(s) => {
                    self.mov(Operand::Mem(self.spill_mem(s)), Operand::Reg(src))?;
                }
            }
        }
        let scratch = self.scratch0();
        while !pending.is_empty() {
            if let Some(pos) = pending
                .iter()
                .position(|&(_, d)| !pending.iter().any(|&(s, _)| s == d))
            {
                let (src, dst) = pending.remove(pos);
                self.mov(Operand::Reg(dst), Operand::Reg(src))?;
            } else {
                // Every destination is also a pending source: a cycle.
                // Save the first destination's current value and retarget
                // its readers to the scratch copy.
                let (src, dst) = pending.remove(0);
                self.mov(Operand::Reg(scratch), Operand::Reg(dst))?;
                for m in &mut pending {
                    if m.0 == dst {
                        m.0 = scratch;
                    }
                }
                self.mov(Operand::Reg(dst), Operand::Reg(src))?;
            }
        }
        Ok(())
    }

    fn inst(&mut self, inst: &Inst) -> Result<(), JitError> {
        match inst {
            Inst::Const { dst, value } => match self.alloc.loc(*dst) {
                Loc::Reg(r) => self.mov(Operand::Reg(r), Operand::Imm(*value)),
                Loc::Spill(_) => {
                    let s = self.scratch0();
                    self.mov(Operand::Reg(s), Operand::Imm(*value))?;
                    self.write(*dst, s)
                }
            },
            Inst::Copy { dst, src } => match self.alloc.loc(*dst) {
                Loc::Reg(r) => {
                    if self.rm(*src) != Operand::Reg(r) {
                        self.mov(Operand::Reg(r), self.rm(*src))?;
                    }
                    Ok(())
                }
                Loc::Spill(_) => {
                    let s = self.read(*src, self.scratch0())?;
                    self.write(*dst, s)
                }
            },
            Inst::Bin { op, dst, lhs, rhs } => {
                let acc = self.scratch0();
                self.mov(Operand::Reg(acc), self.rm(*lhs))?;
                let mn = match op {
                    BinOp::Add => Mnemonic::Add,
                    BinOp::Sub => Mnemonic::Sub,
                    BinOp::And => Mnemonic::And,
                    BinOp::Or => Mnemonic::Or,
                    BinOp::Xor => Mnemonic::Xor,
                    BinOp::Mul => Mnemonic::Imul,
                };
                self.asm.emit(mn, &[Operand::Reg(acc), self.rm(*rhs)])?;
                self.write(*dst, acc)
            }
            Inst::Shift {
                op,
                dst,
                src,
                amount,
            } => {
                let acc = self.scratch0();
                self.mov(Operand::Reg(acc), self.rm(*src))?;
                let mn = match op {
                    ShiftOp::Shl => Mnemonic::Shl,
                    ShiftOp::Shr => Mnemonic::Shr,
                    ShiftOp::Sar => Mnemonic::Sar,
                };
                self.asm
                    .emit(mn, &[Operand::Reg(acc), Operand::Imm(i64::from(*amount))])?;
                self.write(*dst, acc)
            }
            Inst::SetCond {
                cond,
                dst,
                lhs,
                rhs,
            } => {
                let acc = self.scratch0();
                self.mov(Operand::Reg(acc), self.rm(*lhs))?;
                self.asm
                    .emit(Mnemonic::Cmp, &[Operand::Reg(acc), self.rm(*rhs)])?;
                let low = acc.with_width(Width::Byte);
                self.asm.emit(Mnemonic::Set(cond_cc(*cond)), &[low.into()])?;
                self.asm
                    .emit(Mnemonic::Movzx, &[Operand::Reg(acc), Operand::Reg(low)])?;
                self.write(*dst, acc)
            }
            Inst::Load { dst, base, disp } => {
                let b = self.read(*base, self.scratch0())?;
                let mem = Mem::base_disp(b, *disp)?;
                match self.alloc.loc(*dst) {
                    Loc::Reg(r) => self.mov(Operand::Reg(r), Operand::Mem(mem)),
                    Loc::Spill(_) => {
                        let v = self.scratch1();
                        self.mov(Operand::Reg(v), Operand::Mem(mem))?;
                        self.write(*dst, v)
                    }
                }
            }
            Inst::Store { base, disp, src } => {
                let b = self.read(*base, self.scratch0())?;
                let s = self.read(*src, self.scratch1())?;
                let mem = Mem::base_disp(b, *disp)?;
                self.mov(Operand::Mem(mem), Operand::Reg(s))
            }
            Inst::Call { target, args, ret } => self.call(target, args, *ret),
        }
    }

    fn call(
        &mut self,
        target: &CallTarget,
        args: &[VReg],
        ret: Option<VReg>,
    ) -> Result<(), JitError> {
        // Arity was validated before emission started.
        // Argument sources are callee-saved registers or spill slots (the
        // allocator never hands out argument registers in a function that
        // contains a call), so sequential moves cannot clobber each other.
        for (i, &a) in args.iter().enumerate() {
            let dst = self.conv.arg_regs[i];
            debug_assert!(!matches!(self.rm(a), Operand::Reg(r) if self.conv.arg_regs.contains(&r)));
            self.mov(Operand::Reg(dst), self.rm(a))?;
        }
        match target {
            CallTarget::Addr(addr) => {
                let s = self.scratch0();
                self.mov(Operand::Reg(s), Operand::Imm(*addr as i64))?;
                self.asm.emit(Mnemonic::Call, &[Operand::Reg(s)])?;
            }
            CallTarget::Reg(v) => {
                let r = self.read(*v, self.scratch0())?;
                self.asm.emit(Mnemonic::Call, &[Operand::Reg(r)])?;
            }
        }
        if let Some(dst) = ret {
            self.write(dst, self.conv.ret_reg)?;
        }
        Ok(())
    }

    fn term(&mut self, term: &Term, block_idx: usize, block_count: usize) -> Result<(), JitError> {
        match term {
            Term::Jump(target) => self.jump_unless_fallthrough(*target, block_idx),
            Term::Branch {
                cond,
                lhs,
                rhs,
                then_block,
                else_block,
            } => {
                let acc = self.scratch0();
                self.mov(Operand::Reg(acc), self.rm(*lhs))?;
                self.asm
                    .emit(Mnemonic::Cmp, &[Operand::Reg(acc), self.rm(*rhs)])?;
                self.asm.emit(
                    Mnemonic::J(cond_cc(*cond)),
                    &[self.block_labels[then_block.index()].into()],
                )?;
                self.jump_unless_fallthrough(*else_block, block_idx)
            }
            Term::Ret(value) => {
                if let Some(v) = value {
                    if self.rm(*v) != Operand::Reg(self.conv.ret_reg) {
                        self.mov(Operand::Reg(self.conv.ret_reg), self.rm(*v))?;
                    }
                }
                // The epilogue sits right after the last block.
                if block_idx + 1 != block_count {
                    self.asm.emit(Mnemonic::Jmp, &[self.epilogue.into()])?;
                }
                Ok(())
            }
        }
    }

    fn jump_unless_fallthrough(
        &mut self,
        target: BlockId,
        block_idx: usize,
    ) -> Result<(), JitError> {
        if target.index() != block_idx + 1 {
            self.asm
                .emit(Mnemonic::Jmp, &[self.block_labels[target.index()].into()])?;
        }
        Ok(())
    }
}

fn cond_cc(cond: Cond) -> Cc {
    match cond {
        Cond::Eq => Cc::E,
        Cond::Ne => Cc::Ne,
        Cond::Lt => Cc::L,
        Cond::Le => Cc::Le,
        Cond::Gt => Cc::G,
        Cond::Ge => Cc::Ge,
        Cond::Ult => Cc::B,
        Cond::Ule => Cc::Be,
        Cond::Ugt => Cc::A,
        Cond::Uge => Cc::Ae,
    }
}
