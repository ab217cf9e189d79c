//! Virtual-register function representation.
//!
//! A [`Func`] is a control-flow graph of basic blocks over an unbounded
//! supply of 64-bit virtual registers.  It is the input to liveness
//! analysis, register allocation, and lowering; virtual registers never
//! appear in assembler output.

use alloc::string::String;
use alloc::vec::Vec;

/// A virtual register.  Unbounded; mapped to physical registers or spill
/// slots by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VReg(pub(crate) u32);

impl VReg {
    /// The raw register index.
    #[must_use]
    pub fn index(self) -> u32 {
        self.0
    }
}

impl core::fmt::Display for VReg {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Identity of a basic block within one [`Func`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BlockId(pub(crate) u32);

impl BlockId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Two-operand integer operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[allow(missing_docs)]
pub enum BinOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Mul,
}

/// Shift operation with an immediate count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[allow(missing_docs)]
pub enum ShiftOp {
    Shl,
    Shr,
    Sar,
}

/// Integer comparison predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[allow(missing_docs)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Unsigned below.
    Ult,
    /// Unsigned below-or-equal.
    Ule,
    /// Unsigned above.
    Ugt,
    /// Unsigned above-or-equal.
    Uge,
}

/// Call destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CallTarget {
    /// Absolute address of the callee.
    Addr(u64),
    /// Indirect through a virtual register.
    Reg(VReg),
}

/// One pseudo-instruction.  All integer operations are 64-bit.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Inst {
    /// `dst = value`
    Const { dst: VReg, value: i64 },
    /// `dst = src`
    Copy { dst: VReg, src: VReg },
    /// `dst = lhs op rhs`
    Bin {
        op: BinOp,
        dst: VReg,
        lhs: VReg,
        rhs: VReg,
    },
    /// `dst = src op amount` (immediate shift count, masked to 6 bits by
    /// the hardware)
    Shift {
        op: ShiftOp,
        dst: VReg,
        src: VReg,
        amount: u8,
    },
    /// `dst = (lhs cond rhs) ? 1 : 0`
    SetCond {
        cond: Cond,
        dst: VReg,
        lhs: VReg,
        rhs: VReg,
    },
    /// `dst = *(base + disp)` (64-bit load)
    Load { dst: VReg, base: VReg, disp: i32 },
    /// `*(base + disp) = src` (64-bit store)
    Store { base: VReg, disp: i32, src: VReg },
    /// Call with register-class arguments per the calling convention.
    Call {
        target: CallTarget,
        args: Vec<VReg>,
        ret: Option<VReg>,
    },
}

/// Block terminator.  Every block has exactly one.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Term {
    /// Unconditional jump.
    Jump(BlockId),
    /// Two-way conditional branch on `lhs cond rhs`.
    Branch {
        cond: Cond,
        lhs: VReg,
        rhs: VReg,
        then_block: BlockId,
        else_block: BlockId,
    },
    /// Return, optionally with a value.
    Ret(Option<VReg>),
}

impl Term {
    /// Successor blocks of this terminator.
    pub fn successors(&self) -> impl Iterator<Item = BlockId> + '_ {
        let (a, b) = match self {
            Term::Jump(t) => (Some(*t), None),
            Term::Branch {
                then_block,
                else_block,
                ..
            } => (Some(*then_block), Some(*else_block)),
            Term::Ret(_) => (None, None),
        };
        a.into_iter().chain(b)
    }
}

/// A basic block: straight-line instructions plus one terminator.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Block {
    pub(crate) insts: Vec<Inst>,
    pub(crate) term: Term,
}

/// A function under construction: blocks, virtual registers, parameters.
///
/// Block 0 is the entry.  Parameters are ordinary virtual registers that
/// the prologue initializes from the calling convention's argument
/// registers.
///
/// ```
/// use jitforge::compiler::{BinOp, Func, Inst, Term};
///
/// // fn add(a, b) -> a + b
/// let mut f = Func::new("add", 2);
/// let (a, b) = (f.param(0), f.param(1));
/// let sum = f.new_vreg();
/// let entry = f.entry();
/// f.push(entry, Inst::Bin { op: BinOp::Add, dst: sum, lhs: a, rhs: b });
/// f.set_term(entry, Term::Ret(Some(sum)));
/// ```
#[derive(Debug, Clone)]
pub struct Func {
    pub(crate) name: String,
    pub(crate) params: Vec<VReg>,
    pub(crate) blocks: Vec<Block>,
    pub(crate) vreg_count: u32,
}

impl Func {
    /// Create a function with `param_count` parameters and an empty entry
    /// block.  Parameters become virtual registers `v0..vN`.
    #[must_use]
    pub fn new(name: &str, param_count: u32) -> Self {
        Self {
            name: String::from(name),
            params: (0..param_count).map(VReg).collect(),
            blocks: alloc::vec![Block {
                insts: Vec::new(),
                term: Term::Ret(None),
            }],
            vreg_count: param_count,
        }
    }

    /// The function's name (used for the entry symbol).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The entry block.
    #[must_use]
    pub fn entry(&self) -> BlockId {
        BlockId(0)
    }

    /// The `i`-th parameter's virtual register.
    ///
    /// # Panics
    ///
    /// Panics if `i` is out of range.
    #[must_use]
    pub fn param(&self, i: usize) -> VReg {
        self.params[i]
    }

    /// Number of parameters.
    #[must_use]
    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    /// Allocate a fresh virtual register.
    pub fn new_vreg(&mut self) -> VReg {
        let r = VReg(self.vreg_count);
        self.vreg_count += 1;
        r
    }

    /// Append a new, empty block (terminated by `ret` until overwritten).
    pub fn new_block(&mut self) -> BlockId {
        self.blocks.push(Block {
            insts: Vec::new(),
            term: Term::Ret(None),
        });
        BlockId(self.blocks.len() as u32 - 1)
    }

    /// Append an instruction to a block.
    pub fn push(&mut self, block: BlockId, inst: Inst) {
        self.blocks[block.index()].insts.push(inst);
    }

    /// Set a block's terminator.
    pub fn set_term(&mut self, block: BlockId, term: Term) {
        self.blocks[block.index()].term = term;
    }

    /// Number of blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Total number of virtual registers (parameters included).
    #[must_use]
    pub fn vreg_count(&self) -> u32 {
        self.vreg_count
    }
}

/// Visit every virtual register an instruction reads.
pub(crate) fn for_each_use(inst: &Inst, mut f: impl FnMut(VReg)) {
    match inst {
        Inst::Const { .. } => {}
        Inst::Copy { src, .. } => f(*src),
        Inst::Bin { lhs, rhs, .. } => {
            f(*lhs);
            f(*rhs);
        }
        Inst::Shift { src, .. } => f(*src),
        Inst::SetCond { lhs, rhs, .. } => {
            f(*lhs);
            f(*rhs);
        }
        Inst::Load { base, .. } => f(*base),
        Inst::Store { base, src, .. } => {
            f(*base);
            f(*src);
        }
        Inst::Call { target, args, .. } => {
            if let CallTarget::Reg(r) = target {
                f(*r);
            }
            for a in args {
                f(*a);
            }
        }
    }
}

/// The virtual register an instruction defines, if any.
pub(crate) fn inst_def(inst: &Inst) -> Option<VReg> {
    match inst {
        Inst::Const { dst, .. }
        | Inst::Copy { dst, .. }
        | Inst::Bin { dst, .. }
        | Inst::Shift { dst, .. }
        | Inst::SetCond { dst, .. }
        | Inst::Load { dst, .. } => Some(*dst),
        Inst::Store { .. } => None,
        Inst::Call { ret, .. } => *ret,
    }
}

/// Visit every virtual register a terminator reads.
pub(crate) fn for_each_term_use(term: &Term, mut f: impl FnMut(VReg)) {
    if let Term::Branch { lhs, rhs, .. } = term {
        f(*lhs);
        f(*rhs);
    }
    if let Term::Ret(Some(v)) = term {
        f(*v);
    }
}
