//! The compiler layer: virtual-register functions lowered to machine code.
//!
//! Build a [`Func`] out of basic blocks over unlimited virtual registers,
//! then hand it to [`compile`] together with a [`CallConv`] and an
//! [`Assembler`](crate::Assembler).  The pipeline is:
//!
//! 1. [`liveness`] computes a live interval per virtual register,
//! 2. [`regalloc`] runs linear scan over the intervals, and
//! 3. lowering emits a prologue, the block bodies, and a shared epilogue
//!    through the assembler, spilling through the convention's scratch
//!    registers.
//!
//! ```
//! use jitforge::compiler::{compile, BinOp, CompileOptions, Func, Inst, Term};
//! use jitforge::{Assembler, Mode};
//!
//! let mut f = Func::new("add", 2);
//! let sum = f.new_vreg();
//! let entry = f.entry();
//! f.push(entry, Inst::Bin { op: BinOp::Add, dst: sum, lhs: f.param(0), rhs: f.param(1) });
//! f.set_term(entry, Term::Ret(Some(sum)));
//!
//! let mut asm = Assembler::new(Mode::Long64);
//! compile(&f, &CompileOptions::default(), &mut asm)?;
//! let image = asm.finalize()?;
//! assert_eq!(image.symbol("add"), Some(0));
//! # Ok::<(), jitforge::JitError>(())
//! ```

mod callconv;
mod func;
pub mod liveness;
mod lower;
pub mod regalloc;

pub use callconv::CallConv;
pub use func::{BinOp, Block, BlockId, CallTarget, Cond, Func, Inst, ShiftOp, Term, VReg};
pub use liveness::{LiveInterval, Liveness};
pub use lower::{compile, CompileOptions};
pub use regalloc::{Allocation, Loc};
