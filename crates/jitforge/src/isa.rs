//! Static instruction database for x86/x86-64.
//!
//! Maps each supported mnemonic to its legal operand signatures and their
//! encoding templates.  Pure data plus a pure lookup function — constructed
//! at compile time, never mutated, safe for unsynchronized concurrent reads
//! from any number of threads.
//!
//! ## Best-fit rule
//!
//! When several signatures accept the same concrete operands, [`lookup`]
//! picks the winner by, in order:
//!
//! 1. the narrowest immediate/displacement encoding width,
//! 2. the signature needing no operand-size override prefix (0x66),
//! 3. the signature with fewer legacy prefix bytes,
//! 4. declaration order — first match wins.
//!
//! This tie-break is part of the crate contract: it determines byte-exact
//! output and is pinned by the encoding tests.

use alloc::format;
use core::fmt;

use crate::error::JitError;
use crate::operand::{Mem, Operand, RegClass, Register};
use crate::Mode;

/// x86 condition code, in hardware encoding order (the value is added to
/// the base opcode of the Jcc/SETcc/CMOVcc families).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[allow(missing_docs)]
pub enum Cc {
    O = 0,
    No = 1,
    B = 2,
    Ae = 3,
    E = 4,
    Ne = 5,
    Be = 6,
    A = 7,
    S = 8,
    Ns = 9,
    P = 10,
    Np = 11,
    L = 12,
    Ge = 13,
    Le = 14,
    G = 15,
}

impl Cc {
    /// Hardware condition-code number (0–15).
    #[must_use]
    pub fn code(self) -> u8 {
        self as u8
    }

    /// The inverted condition (`E` ↔ `Ne`, `L` ↔ `Ge`, …).
    #[must_use]
    pub fn invert(self) -> Cc {
        // Flipping the low bit inverts any x86 condition.
        match self.code() ^ 1 {
            0 => Cc::O,
            1 => Cc::No,
            2 => Cc::B,
            3 => Cc::Ae,
            4 => Cc::E,
            5 => Cc::Ne,
            6 => Cc::Be,
            7 => Cc::A,
            8 => Cc::S,
            9 => Cc::Ns,
            10 => Cc::P,
            11 => Cc::Np,
            12 => Cc::L,
            13 => Cc::Ge,
            14 => Cc::Le,
            _ => Cc::G,
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Cc::O => "o",
            Cc::No => "no",
            Cc::B => "b",
            Cc::Ae => "ae",
            Cc::E => "e",
            Cc::Ne => "ne",
            Cc::Be => "be",
            Cc::A => "a",
            Cc::S => "s",
            Cc::Ns => "ns",
            Cc::P => "p",
            Cc::Np => "np",
            Cc::L => "l",
            Cc::Ge => "ge",
            Cc::Le => "le",
            Cc::G => "g",
        }
    }
}

/// Instruction mnemonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[allow(missing_docs)]
pub enum Mnemonic {
    // ALU
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
    // Data movement
    Mov,
    Movzx,
    Movsx,
    Movsxd,
    Lea,
    Xchg,
    Test,
    // Shifts and rotates
    Shl,
    Shr,
    Sar,
    Rol,
    Ror,
    // Unary group
    Inc,
    Dec,
    Not,
    Neg,
    Mul,
    Imul,
    Div,
    Idiv,
    // Stack
    Push,
    Pop,
    // Control flow
    Call,
    Ret,
    Jmp,
    /// Conditional jump.
    J(Cc),
    /// Conditional byte set.
    Set(Cc),
    /// Conditional move.
    Cmov(Cc),
    Int,
    // SSE scalar/vector subset
    Movd,
    Movq,
    Movaps,
    Movsd,
    Addsd,
    Subsd,
    Mulsd,
    Divsd,
    Pxor,
    // Fixed zero-operand encodings
    Nop,
    Int3,
    Hlt,
    Leave,
    Cbw,
    Cwde,
    Cdqe,
    Cwd,
    Cdq,
    Cqo,
    Clc,
    Stc,
    Cmc,
    Cld,
    Std,
    Pause,
    Cpuid,
    Rdtsc,
    Syscall,
    Ud2,
    Lfence,
    Mfence,
    Sfence,
    Endbr64,
}

impl fmt::Display for Mnemonic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Mnemonic::*;
        let name = match self {
            Add => "add",
            Or => "or",
            Adc => "adc",
            Sbb => "sbb",
            And => "and",
            Sub => "sub",
            Xor => "xor",
            Cmp => "cmp",
            Mov => "mov",
            Movzx => "movzx",
            Movsx => "movsx",
            Movsxd => "movsxd",
            Lea => "lea",
            Xchg => "xchg",
            Test => "test",
            Shl => "shl",
            Shr => "shr",
            Sar => "sar",
            Rol => "rol",
            Ror => "ror",
            Inc => "inc",
            Dec => "dec",
            Not => "not",
            Neg => "neg",
            Mul => "mul",
            Imul => "imul",
            Div => "div",
            Idiv => "idiv",
            Push => "push",
            Pop => "pop",
            Call => "call",
            Ret => "ret",
            Jmp => "jmp",
            J(cc) => return write!(f, "j{}", cc.suffix()),
            Set(cc) => return write!(f, "set{}", cc.suffix()),
            Cmov(cc) => return write!(f, "cmov{}", cc.suffix()),
            Int => "int",
            Movd => "movd",
            Movq => "movq",
            Movaps => "movaps",
            Movsd => "movsd",
            Addsd => "addsd",
            Subsd => "subsd",
            Mulsd => "mulsd",
            Divsd => "divsd",
            Pxor => "pxor",
            Nop => "nop",
            Int3 => "int3",
            Hlt => "hlt",
            Leave => "leave",
            Cbw => "cbw",
            Cwde => "cwde",
            Cdqe => "cdqe",
            Cwd => "cwd",
            Cdq => "cdq",
            Cqo => "cqo",
            Clc => "clc",
            Stc => "stc",
            Cmc => "cmc",
            Cld => "cld",
            Std => "std",
            Pause => "pause",
            Cpuid => "cpuid",
            Rdtsc => "rdtsc",
            Syscall => "syscall",
            Ud2 => "ud2",
            Lfence => "lfence",
            Mfence => "mfence",
            Sfence => "sfence",
            Endbr64 => "endbr64",
        };
        f.write_str(name)
    }
}

/// Operand-kind constraint within a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum OpPattern {
    R8,
    R16,
    R32,
    R64,
    Rm8,
    Rm16,
    Rm32,
    Rm64,
    /// Memory of any width (lea).
    M,
    /// XMM register.
    Xmm,
    /// XMM register or 64-bit memory.
    Xm64,
    /// XMM register or 128-bit memory.
    Xm128,
    /// Immediate that fits in one byte at the destination width.
    Imm8,
    /// Immediate in i8 range, sign-extended to the operand width.
    SImm8,
    Imm16,
    /// Immediate in i32 range (sign-extended for 64-bit destinations).
    Imm32,
    Imm64,
    /// Fixed accumulator / counter operands.
    Al,
    Ax,
    Eax,
    Rax,
    Cl,
    /// The literal immediate 1 (shift-by-one forms).
    One,
    /// Label with an 8-bit relative displacement.
    Rel8,
    /// Label with a 32-bit relative displacement.
    Rel32,
}

/// Where the ModRM byte's fields come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModRmKind {
    /// No ModRM byte.
    None,
    /// First operand is the `reg` field, second is `r/m`.
    RegRm,
    /// First operand is `r/m`, second is the `reg` field.
    RmReg,
    /// `reg` field is a fixed opcode extension; `r/m` is the first
    /// register/memory operand.
    Digit(u8),
}

/// Immediate field of an encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ImmKind {
    None,
    Ib,
    Iw,
    Id,
    Iq,
    Rel8,
    Rel32,
}

impl ImmKind {
    /// Encoded width in bits (used by the best-fit rule).
    #[must_use]
    pub fn bits(self) -> u8 {
        match self {
            ImmKind::None => 0,
            ImmKind::Ib | ImmKind::Rel8 => 8,
            ImmKind::Iw => 16,
            ImmKind::Id | ImmKind::Rel32 => 32,
            ImmKind::Iq => 64,
        }
    }
}

/// Binary encoding template for one signature.
#[derive(Debug, Clone, Copy)]
pub struct Encoding {
    /// Mandatory prefix byte (0x66/0xF2/0xF3) or 0.
    pub prefix: u8,
    /// Opcode bytes, including the 0x0F escape where needed.
    pub opcode: &'static [u8],
    /// ModRM requirement.
    pub modrm: ModRmKind,
    /// Immediate field.
    pub imm: ImmKind,
    /// Register number is added to the last opcode byte (`+r` forms).
    pub plus_reg: bool,
    /// REX.W required (64-bit operand size).
    pub rex_w: bool,
    /// Operand-size override prefix (0x66) required.
    pub opsize: bool,
    /// Condition code is added to the last opcode byte (Jcc/SETcc/CMOVcc).
    pub add_cc: bool,
    /// Instruction defaults to 64-bit operands in long mode (push/pop/
    /// call/jmp); its 32-bit form is unencodable there.
    pub def64: bool,
}

impl Encoding {
    const fn new(opcode: &'static [u8]) -> Encoding {
        Encoding {
            prefix: 0,
            opcode,
            modrm: ModRmKind::None,
            imm: ImmKind::None,
            plus_reg: false,
            rex_w: false,
            opsize: false,
            add_cc: false,
            def64: false,
        }
    }

    const fn reg_rm(mut self) -> Encoding {
        self.modrm = ModRmKind::RegRm;
        self
    }

    const fn rm_reg(mut self) -> Encoding {
        self.modrm = ModRmKind::RmReg;
        self
    }

    const fn digit(mut self, d: u8) -> Encoding {
        self.modrm = ModRmKind::Digit(d);
        self
    }

    const fn imm(mut self, k: ImmKind) -> Encoding {
        self.imm = k;
        self
    }

    const fn plus_reg(mut self) -> Encoding {
        self.plus_reg = true;
        self
    }

    const fn rex_w(mut self) -> Encoding {
        self.rex_w = true;
        self
    }

    const fn opsize(mut self) -> Encoding {
        self.opsize = true;
        self
    }

    const fn prefix(mut self, b: u8) -> Encoding {
        self.prefix = b;
        self
    }

    const fn add_cc(mut self) -> Encoding {
        self.add_cc = true;
        self
    }

    const fn def64(mut self) -> Encoding {
        self.def64 = true;
        self
    }

    /// Number of legacy prefix bytes this encoding carries.
    #[must_use]
    pub fn prefix_count(&self) -> u8 {
        u8::from(self.opsize) + u8::from(self.prefix != 0)
    }
}

/// One legal operand signature of a mnemonic, with its encoding template.
#[derive(Debug, Clone, Copy)]
pub struct Signature {
    /// Operand-kind constraints, in operand order.
    pub patterns: &'static [OpPattern],
    /// Binary encoding template.
    pub encoding: Encoding,
}

const fn sig(patterns: &'static [OpPattern], encoding: Encoding) -> Signature {
    Signature { patterns, encoding }
}

// ─── Signature tables ───────────────────────────────────────────────────

use ImmKind::{Ib, Id, Iq, Iw};
use OpPattern::*;

macro_rules! alu_signatures {
    ($name:ident, $b0:literal, $b1:literal, $b2:literal, $b3:literal,
     $b4:literal, $b5:literal, $digit:literal) => {
        const $name: &[Signature] = &[
            sig(&[Al, Imm8], Encoding::new(&[$b4]).imm(Ib)),
            sig(&[Ax, Imm16], Encoding::new(&[$b5]).imm(Iw).opsize()),
            sig(&[Eax, Imm32], Encoding::new(&[$b5]).imm(Id)),
            sig(&[Rax, Imm32], Encoding::new(&[$b5]).imm(Id).rex_w()),
            sig(&[Rm8, R8], Encoding::new(&[$b0]).rm_reg()),
            sig(&[Rm16, R16], Encoding::new(&[$b1]).rm_reg().opsize()),
            sig(&[Rm32, R32], Encoding::new(&[$b1]).rm_reg()),
            sig(&[Rm64, R64], Encoding::new(&[$b1]).rm_reg().rex_w()),
            sig(&[R8, Rm8], Encoding::new(&[$b2]).reg_rm()),
            sig(&[R16, Rm16], Encoding::new(&[$b3]).reg_rm().opsize()),
            sig(&[R32, Rm32], Encoding::new(&[$b3]).reg_rm()),
            sig(&[R64, Rm64], Encoding::new(&[$b3]).reg_rm().rex_w()),
            sig(&[Rm8, Imm8], Encoding::new(&[0x80]).digit($digit).imm(Ib)),
            sig(&[Rm16, SImm8], Encoding::new(&[0x83]).digit($digit).imm(Ib).opsize()),
            sig(&[Rm16, Imm16], Encoding::new(&[0x81]).digit($digit).imm(Iw).opsize()),
            sig(&[Rm32, SImm8], Encoding::new(&[0x83]).digit($digit).imm(Ib)),
            sig(&[Rm32, Imm32], Encoding::new(&[0x81]).digit($digit).imm(Id)),
            sig(&[Rm64, SImm8], Encoding::new(&[0x83]).digit($digit).imm(Ib).rex_w()),
            sig(&[Rm64, Imm32], Encoding::new(&[0x81]).digit($digit).imm(Id).rex_w()),
        ];
    };
}

alu_signatures!(ADD_SIGS, 0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0);
alu_signatures!(OR_SIGS, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 1);
alu_signatures!(ADC_SIGS, 0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 2);
alu_signatures!(SBB_SIGS, 0x18, 0x19, 0x1A, 0x1B, 0x1C, 0x1D, 3);
alu_signatures!(AND_SIGS, 0x20, 0x21, 0x22, 0x23, 0x24, 0x25, 4);
alu_signatures!(SUB_SIGS, 0x28, 0x29, 0x2A, 0x2B, 0x2C, 0x2D, 5);
alu_signatures!(XOR_SIGS, 0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 6);
alu_signatures!(CMP_SIGS, 0x38, 0x39, 0x3A, 0x3B, 0x3C, 0x3D, 7);

const MOV_SIGS: &[Signature] = &[
    sig(&[Rm8, R8], Encoding::new(&[0x88]).rm_reg()),
    sig(&[Rm16, R16], Encoding::new(&[0x89]).rm_reg().opsize()),
    sig(&[Rm32, R32], Encoding::new(&[0x89]).rm_reg()),
    sig(&[Rm64, R64], Encoding::new(&[0x89]).rm_reg().rex_w()),
    sig(&[R8, Rm8], Encoding::new(&[0x8A]).reg_rm()),
    sig(&[R16, Rm16], Encoding::new(&[0x8B]).reg_rm().opsize()),
    sig(&[R32, Rm32], Encoding::new(&[0x8B]).reg_rm()),
    sig(&[R64, Rm64], Encoding::new(&[0x8B]).reg_rm().rex_w()),
    sig(&[R8, Imm8], Encoding::new(&[0xB0]).plus_reg().imm(Ib)),
    sig(&[R16, Imm16], Encoding::new(&[0xB8]).plus_reg().imm(Iw).opsize()),
    sig(&[R32, Imm32], Encoding::new(&[0xB8]).plus_reg().imm(Id)),
    sig(&[Rm64, Imm32], Encoding::new(&[0xC7]).digit(0).imm(Id).rex_w()),
    sig(&[R64, Imm64], Encoding::new(&[0xB8]).plus_reg().imm(Iq).rex_w()),
    sig(&[Rm8, Imm8], Encoding::new(&[0xC6]).digit(0).imm(Ib)),
    sig(&[Rm16, Imm16], Encoding::new(&[0xC7]).digit(0).imm(Iw).opsize()),
    sig(&[Rm32, Imm32], Encoding::new(&[0xC7]).digit(0).imm(Id)),
];

const MOVZX_SIGS: &[Signature] = &[
    sig(&[R16, Rm8], Encoding::new(&[0x0F, 0xB6]).reg_rm().opsize()),
    sig(&[R32, Rm8], Encoding::new(&[0x0F, 0xB6]).reg_rm()),
    sig(&[R64, Rm8], Encoding::new(&[0x0F, 0xB6]).reg_rm().rex_w()),
    sig(&[R32, Rm16], Encoding::new(&[0x0F, 0xB7]).reg_rm()),
    sig(&[R64, Rm16], Encoding::new(&[0x0F, 0xB7]).reg_rm().rex_w()),
];

const MOVSX_SIGS: &[Signature] = &[
    sig(&[R16, Rm8], Encoding::new(&[0x0F, 0xBE]).reg_rm().opsize()),
    sig(&[R32, Rm8], Encoding::new(&[0x0F, 0xBE]).reg_rm()),
    sig(&[R64, Rm8], Encoding::new(&[0x0F, 0xBE]).reg_rm().rex_w()),
    sig(&[R32, Rm16], Encoding::new(&[0x0F, 0xBF]).reg_rm()),
    sig(&[R64, Rm16], Encoding::new(&[0x0F, 0xBF]).reg_rm().rex_w()),
];

const MOVSXD_SIGS: &[Signature] =
    &[sig(&[R64, Rm32], Encoding::new(&[0x63]).reg_rm().rex_w())];

const LEA_SIGS: &[Signature] = &[
    sig(&[R16, M], Encoding::new(&[0x8D]).reg_rm().opsize()),
    sig(&[R32, M], Encoding::new(&[0x8D]).reg_rm()),
    sig(&[R64, M], Encoding::new(&[0x8D]).reg_rm().rex_w()),
];

const XCHG_SIGS: &[Signature] = &[
    sig(&[Eax, R32], Encoding::new(&[0x90]).plus_reg()),
    sig(&[Rax, R64], Encoding::new(&[0x90]).plus_reg().rex_w()),
    sig(&[Rm8, R8], Encoding::new(&[0x86]).rm_reg()),
    sig(&[Rm16, R16], Encoding::new(&[0x87]).rm_reg().opsize()),
    sig(&[Rm32, R32], Encoding::new(&[0x87]).rm_reg()),
    sig(&[Rm64, R64], Encoding::new(&[0x87]).rm_reg().rex_w()),
];

const TEST_SIGS: &[Signature] = &[
    sig(&[Al, Imm8], Encoding::new(&[0xA8]).imm(Ib)),
    sig(&[Ax, Imm16], Encoding::new(&[0xA9]).imm(Iw).opsize()),
    sig(&[Eax, Imm32], Encoding::new(&[0xA9]).imm(Id)),
    sig(&[Rax, Imm32], Encoding::new(&[0xA9]).imm(Id).rex_w()),
    sig(&[Rm8, R8], Encoding::new(&[0x84]).rm_reg()),
    sig(&[Rm16, R16], Encoding::new(&[0x85]).rm_reg().opsize()),
    sig(&[Rm32, R32], Encoding::new(&[0x85]).rm_reg()),
    sig(&[Rm64, R64], Encoding::new(&[0x85]).rm_reg().rex_w()),
    sig(&[Rm8, Imm8], Encoding::new(&[0xF6]).digit(0).imm(Ib)),
    sig(&[Rm16, Imm16], Encoding::new(&[0xF7]).digit(0).imm(Iw).opsize()),
    sig(&[Rm32, Imm32], Encoding::new(&[0xF7]).digit(0).imm(Id)),
    sig(&[Rm64, Imm32], Encoding::new(&[0xF7]).digit(0).imm(Id).rex_w()),
];

macro_rules! shift_signatures {
    ($name:ident, $digit:literal) => {
        const $name: &[Signature] = &[
            sig(&[Rm8, One], Encoding::new(&[0xD0]).digit($digit)),
            sig(&[Rm16, One], Encoding::new(&[0xD1]).digit($digit).opsize()),
            sig(&[Rm32, One], Encoding::new(&[0xD1]).digit($digit)),
            sig(&[Rm64, One], Encoding::new(&[0xD1]).digit($digit).rex_w()),
            sig(&[Rm8, Cl], Encoding::new(&[0xD2]).digit($digit)),
            sig(&[Rm16, Cl], Encoding::new(&[0xD3]).digit($digit).opsize()),
            sig(&[Rm32, Cl], Encoding::new(&[0xD3]).digit($digit)),
            sig(&[Rm64, Cl], Encoding::new(&[0xD3]).digit($digit).rex_w()),
            sig(&[Rm8, Imm8], Encoding::new(&[0xC0]).digit($digit).imm(Ib)),
            sig(&[Rm16, Imm8], Encoding::new(&[0xC1]).digit($digit).imm(Ib).opsize()),
            sig(&[Rm32, Imm8], Encoding::new(&[0xC1]).digit($digit).imm(Ib)),
            sig(&[Rm64, Imm8], Encoding::new(&[0xC1]).digit($digit).imm(Ib).rex_w()),
        ];
    };
}

shift_signatures!(ROL_SIGS, 0);
shift_signatures!(ROR_SIGS, 1);
shift_signatures!(SHL_SIGS, 4);
shift_signatures!(SHR_SIGS, 5);
shift_signatures!(SAR_SIGS, 7);

macro_rules! unary_signatures {
    ($name:ident, $digit:literal) => {
        const $name: &[Signature] = &[
            sig(&[Rm8], Encoding::new(&[0xF6]).digit($digit)),
            sig(&[Rm16], Encoding::new(&[0xF7]).digit($digit).opsize()),
            sig(&[Rm32], Encoding::new(&[0xF7]).digit($digit)),
            sig(&[Rm64], Encoding::new(&[0xF7]).digit($digit).rex_w()),
        ];
    };
}

unary_signatures!(NOT_SIGS, 2);
unary_signatures!(NEG_SIGS, 3);
unary_signatures!(MUL_SIGS, 4);
unary_signatures!(DIV_SIGS, 6);
unary_signatures!(IDIV_SIGS, 7);

const IMUL_SIGS: &[Signature] = &[
    sig(&[Rm8], Encoding::new(&[0xF6]).digit(5)),
    sig(&[Rm16], Encoding::new(&[0xF7]).digit(5).opsize()),
    sig(&[Rm32], Encoding::new(&[0xF7]).digit(5)),
    sig(&[Rm64], Encoding::new(&[0xF7]).digit(5).rex_w()),
    sig(&[R16, Rm16], Encoding::new(&[0x0F, 0xAF]).reg_rm().opsize()),
    sig(&[R32, Rm32], Encoding::new(&[0x0F, 0xAF]).reg_rm()),
    sig(&[R64, Rm64], Encoding::new(&[0x0F, 0xAF]).reg_rm().rex_w()),
    sig(&[R16, Rm16, SImm8], Encoding::new(&[0x6B]).reg_rm().imm(Ib).opsize()),
    sig(&[R16, Rm16, Imm16], Encoding::new(&[0x69]).reg_rm().imm(Iw).opsize()),
    sig(&[R32, Rm32, SImm8], Encoding::new(&[0x6B]).reg_rm().imm(Ib)),
    sig(&[R32, Rm32, Imm32], Encoding::new(&[0x69]).reg_rm().imm(Id)),
    sig(&[R64, Rm64, SImm8], Encoding::new(&[0x6B]).reg_rm().imm(Ib).rex_w()),
    sig(&[R64, Rm64, Imm32], Encoding::new(&[0x69]).reg_rm().imm(Id).rex_w()),
];

macro_rules! incdec_signatures {
    ($name:ident, $digit:literal) => {
        const $name: &[Signature] = &[
            sig(&[Rm8], Encoding::new(&[0xFE]).digit($digit)),
            sig(&[Rm16], Encoding::new(&[0xFF]).digit($digit).opsize()),
            sig(&[Rm32], Encoding::new(&[0xFF]).digit($digit)),
            sig(&[Rm64], Encoding::new(&[0xFF]).digit($digit).rex_w()),
        ];
    };
}

incdec_signatures!(INC_SIGS, 0);
incdec_signatures!(DEC_SIGS, 1);

const PUSH_SIGS: &[Signature] = &[
    sig(&[R64], Encoding::new(&[0x50]).plus_reg().def64()),
    sig(&[R32], Encoding::new(&[0x50]).plus_reg().def64()),
    sig(&[R16], Encoding::new(&[0x50]).plus_reg().opsize().def64()),
    sig(&[Rm64], Encoding::new(&[0xFF]).digit(6).def64()),
    sig(&[Rm32], Encoding::new(&[0xFF]).digit(6).def64()),
    sig(&[Rm16], Encoding::new(&[0xFF]).digit(6).opsize().def64()),
    sig(&[SImm8], Encoding::new(&[0x6A]).imm(Ib).def64()),
    sig(&[Imm32], Encoding::new(&[0x68]).imm(Id).def64()),
];

const POP_SIGS: &[Signature] = &[
    sig(&[R64], Encoding::new(&[0x58]).plus_reg().def64()),
    sig(&[R32], Encoding::new(&[0x58]).plus_reg().def64()),
    sig(&[R16], Encoding::new(&[0x58]).plus_reg().opsize().def64()),
    sig(&[Rm64], Encoding::new(&[0x8F]).digit(0).def64()),
    sig(&[Rm32], Encoding::new(&[0x8F]).digit(0).def64()),
    sig(&[Rm16], Encoding::new(&[0x8F]).digit(0).opsize().def64()),
];

const CALL_SIGS: &[Signature] = &[
    sig(&[Rel32], Encoding::new(&[0xE8]).imm(ImmKind::Rel32).def64()),
    sig(&[Rm64], Encoding::new(&[0xFF]).digit(2).def64()),
    sig(&[Rm32], Encoding::new(&[0xFF]).digit(2).def64()),
];

const RET_SIGS: &[Signature] = &[
    sig(&[], Encoding::new(&[0xC3])),
    sig(&[Imm16], Encoding::new(&[0xC2]).imm(Iw)),
];

const JMP_SIGS: &[Signature] = &[
    sig(&[OpPattern::Rel8], Encoding::new(&[0xEB]).imm(ImmKind::Rel8).def64()),
    sig(&[Rel32], Encoding::new(&[0xE9]).imm(ImmKind::Rel32).def64()),
    sig(&[Rm64], Encoding::new(&[0xFF]).digit(4).def64()),
    sig(&[Rm32], Encoding::new(&[0xFF]).digit(4).def64()),
];

const JCC_SIGS: &[Signature] = &[
    sig(&[OpPattern::Rel8], Encoding::new(&[0x70]).imm(ImmKind::Rel8).add_cc()),
    sig(&[Rel32], Encoding::new(&[0x0F, 0x80]).imm(ImmKind::Rel32).add_cc()),
];

const SETCC_SIGS: &[Signature] =
    &[sig(&[Rm8], Encoding::new(&[0x0F, 0x90]).digit(0).add_cc())];

const CMOVCC_SIGS: &[Signature] = &[
    sig(&[R16, Rm16], Encoding::new(&[0x0F, 0x40]).reg_rm().opsize().add_cc()),
    sig(&[R32, Rm32], Encoding::new(&[0x0F, 0x40]).reg_rm().add_cc()),
    sig(&[R64, Rm64], Encoding::new(&[0x0F, 0x40]).reg_rm().rex_w().add_cc()),
];

const INT_SIGS: &[Signature] = &[sig(&[Imm8], Encoding::new(&[0xCD]).imm(Ib))];

const MOVD_SIGS: &[Signature] = &[
    sig(&[Xmm, Rm32], Encoding::new(&[0x0F, 0x6E]).reg_rm().prefix(0x66)),
    sig(&[Rm32, Xmm], Encoding::new(&[0x0F, 0x7E]).rm_reg().prefix(0x66)),
];

const MOVQ_SIGS: &[Signature] = &[
    sig(&[Xmm, Rm64], Encoding::new(&[0x0F, 0x6E]).reg_rm().prefix(0x66).rex_w()),
    sig(&[Rm64, Xmm], Encoding::new(&[0x0F, 0x7E]).rm_reg().prefix(0x66).rex_w()),
];

const MOVAPS_SIGS: &[Signature] = &[
    sig(&[Xmm, Xm128], Encoding::new(&[0x0F, 0x28]).reg_rm()),
    sig(&[Xm128, Xmm], Encoding::new(&[0x0F, 0x29]).rm_reg()),
];

const MOVSD_SIGS: &[Signature] = &[
    sig(&[Xmm, Xm64], Encoding::new(&[0x0F, 0x10]).reg_rm().prefix(0xF2)),
    sig(&[Xm64, Xmm], Encoding::new(&[0x0F, 0x11]).rm_reg().prefix(0xF2)),
];

macro_rules! sse_sd_signatures {
    ($name:ident, $opc:literal) => {
        const $name: &[Signature] =
            &[sig(&[Xmm, Xm64], Encoding::new(&[0x0F, $opc]).reg_rm().prefix(0xF2))];
    };
}

sse_sd_signatures!(ADDSD_SIGS, 0x58);
sse_sd_signatures!(SUBSD_SIGS, 0x5C);
sse_sd_signatures!(MULSD_SIGS, 0x59);
sse_sd_signatures!(DIVSD_SIGS, 0x5E);

const PXOR_SIGS: &[Signature] =
    &[sig(&[Xmm, Xm128], Encoding::new(&[0x0F, 0xEF]).reg_rm().prefix(0x66))];

/// Fixed-encoding (zero-operand) table.  `long_only` marks encodings that
/// carry a REX.W byte and are therefore unencodable in 32-bit mode.
fn fixed_encoding(mn: Mnemonic) -> Option<(&'static [u8], bool)> {
    use Mnemonic::*;
    Some(match mn {
        Nop => (&[0x90], false),
        Int3 => (&[0xCC], false),
        Hlt => (&[0xF4], false),
        Leave => (&[0xC9], false),
        Cbw => (&[0x66, 0x98], false),
        Cwde => (&[0x98], false),
        Cdqe => (&[0x48, 0x98], true),
        Cwd => (&[0x66, 0x99], false),
        Cdq => (&[0x99], false),
        Cqo => (&[0x48, 0x99], true),
        Clc => (&[0xF8], false),
        Stc => (&[0xF9], false),
        Cmc => (&[0xF5], false),
        Cld => (&[0xFC], false),
        Std => (&[0xFD], false),
        Pause => (&[0xF3, 0x90], false),
        Cpuid => (&[0x0F, 0xA2], false),
        Rdtsc => (&[0x0F, 0x31], false),
        Syscall => (&[0x0F, 0x05], true),
        Ud2 => (&[0x0F, 0x0B], false),
        Lfence => (&[0x0F, 0xAE, 0xE8], false),
        Mfence => (&[0x0F, 0xAE, 0xF0], false),
        Sfence => (&[0x0F, 0xAE, 0xF8], false),
        Endbr64 => (&[0xF3, 0x0F, 0x1E, 0xFA], true),
        _ => return None,
    })
}

/// The zero-operand encoding of `mn` for `mode`, if it has one.
pub fn fixed(mn: Mnemonic, mode: Mode) -> Option<&'static [u8]> {
    let (bytes, long_only) = fixed_encoding(mn)?;
    if long_only && mode != Mode::Long64 {
        return None;
    }
    Some(bytes)
}

/// All signatures of a mnemonic, in declaration (tie-break) order.
#[must_use]
pub fn signatures(mn: Mnemonic) -> &'static [Signature] {
    use Mnemonic::*;
    match mn {
        Add => ADD_SIGS,
        Or => OR_SIGS,
        Adc => ADC_SIGS,
        Sbb => SBB_SIGS,
        And => AND_SIGS,
        Sub => SUB_SIGS,
        Xor => XOR_SIGS,
        Cmp => CMP_SIGS,
        Mov => MOV_SIGS,
        Movzx => MOVZX_SIGS,
        Movsx => MOVSX_SIGS,
        Movsxd => MOVSXD_SIGS,
        Lea => LEA_SIGS,
        Xchg => XCHG_SIGS,
        Test => TEST_SIGS,
        Shl => SHL_SIGS,
        Shr => SHR_SIGS,
        Sar => SAR_SIGS,
        Rol => ROL_SIGS,
        Ror => ROR_SIGS,
        Inc => INC_SIGS,
        Dec => DEC_SIGS,
        Not => NOT_SIGS,
        Neg => NEG_SIGS,
        Mul => MUL_SIGS,
        Imul => IMUL_SIGS,
        Div => DIV_SIGS,
        Idiv => IDIV_SIGS,
        Push => PUSH_SIGS,
        Pop => POP_SIGS,
        Call => CALL_SIGS,
        Ret => RET_SIGS,
        Jmp => JMP_SIGS,
        J(_) => JCC_SIGS,
        Set(_) => SETCC_SIGS,
        Cmov(_) => CMOVCC_SIGS,
        Int => INT_SIGS,
        Movd => MOVD_SIGS,
        Movq => MOVQ_SIGS,
        Movaps => MOVAPS_SIGS,
        Movsd => MOVSD_SIGS,
        Addsd => ADDSD_SIGS,
        Subsd => SUBSD_SIGS,
        Mulsd => MULSD_SIGS,
        Divsd => DIVSD_SIGS,
        Pxor => PXOR_SIGS,
        _ => &[],
    }
}

// ─── Matching ───────────────────────────────────────────────────────────

/// Operand width in bits the signature operates on, derived from its first
/// width-carrying pattern.  0 when no pattern pins a width.
fn sig_width(patterns: &[OpPattern]) -> u16 {
    for p in patterns {
        let w = match p {
            R8 | Rm8 | Al => 8,
            R16 | Rm16 | Ax => 16,
            R32 | Rm32 | Eax => 32,
            R64 | Rm64 | Rax | Xm64 => 64,
            Xmm | Xm128 => 128,
            _ => continue,
        };
        return w;
    }
    0
}

fn gp_reg_matches(op: &Operand, bits: u16) -> bool {
    matches!(op, Operand::Reg(r) if r.class() == RegClass::Gp && r.size_bits() == bits)
}

fn mem_matches(mem: &Mem, bits: u16) -> bool {
    match mem.width {
        None => true,
        Some(w) => w.bits() == bits,
    }
}

fn rm_matches(op: &Operand, bits: u16) -> bool {
    match op {
        Operand::Reg(_) => gp_reg_matches(op, bits),
        Operand::Mem(m) => mem_matches(m, bits),
        _ => false,
    }
}

fn imm_matches(op: &Operand, pattern: OpPattern, dest_bits: u16, mode: Mode) -> bool {
    let v = match op {
        Operand::Imm(v) => *v,
        _ => return false,
    };
    match pattern {
        Imm8 => (-128..=255).contains(&v),
        SImm8 => (-128..=127).contains(&v),
        Imm16 => (-32768..=65535).contains(&v),
        Imm32 => {
            // Destination width 0 means the signature has no register
            // operand (push imm32); in long mode that form still
            // sign-extends the immediate to 64 bits.
            if dest_bits == 64 || (dest_bits == 0 && mode == Mode::Long64) {
                // Sign-extended to 64 bits: must round-trip through i32.
                i32::try_from(v).is_ok()
            } else {
                i32::try_from(v).is_ok() || u32::try_from(v).is_ok()
            }
        }
        Imm64 => true,
        One => v == 1,
        _ => false,
    }
}

fn pattern_matches(
    pattern: OpPattern,
    op: &Operand,
    dest_bits: u16,
    mode: Mode,
    allow_short: bool,
) -> bool {
    match pattern {
        R8 => gp_reg_matches(op, 8),
        R16 => gp_reg_matches(op, 16),
        R32 => gp_reg_matches(op, 32),
        R64 => gp_reg_matches(op, 64),
        Rm8 => rm_matches(op, 8),
        Rm16 => rm_matches(op, 16),
        Rm32 => rm_matches(op, 32),
        Rm64 => rm_matches(op, 64),
        M => matches!(op, Operand::Mem(_)),
        Xmm => matches!(op, Operand::Reg(r) if r.is_xmm()),
        Xm64 => match op {
            Operand::Reg(r) => r.is_xmm(),
            Operand::Mem(m) => mem_matches(m, 64),
            _ => false,
        },
        Xm128 => match op {
            Operand::Reg(r) => r.is_xmm(),
            Operand::Mem(m) => m.width.is_none(),
            _ => false,
        },
        Al => matches!(op, Operand::Reg(Register::Al)),
        Ax => matches!(op, Operand::Reg(Register::Ax)),
        Eax => matches!(op, Operand::Reg(Register::Eax)),
        Rax => matches!(op, Operand::Reg(Register::Rax)),
        Cl => matches!(op, Operand::Reg(Register::Cl)),
        Imm8 | SImm8 | Imm16 | Imm32 | Imm64 | One => imm_matches(op, pattern, dest_bits, mode),
        OpPattern::Rel8 => allow_short && matches!(op, Operand::Label(_)),
        Rel32 => matches!(op, Operand::Label(_)),
    }
}

fn sig_matches(s: &Signature, ops: &[Operand], mode: Mode, allow_short: bool) -> bool {
    if s.patterns.len() != ops.len() {
        return false;
    }
    let width = sig_width(s.patterns);
    // 64-bit GPR operand forms exist only in long mode.  XMM and 64-bit
    // memory operands are data-width constraints and stay legal in 32-bit
    // mode.
    if mode != Mode::Long64 && s.patterns.iter().any(|p| matches!(p, R64 | Rm64 | Rax)) {
        return false;
    }
    // In long mode, default-64 instructions have no 32-bit operand form.
    if mode == Mode::Long64 && s.encoding.def64 && width == 32 {
        return false;
    }
    s.patterns
        .iter()
        .zip(ops.iter())
        .all(|(p, op)| pattern_matches(*p, op, width, mode, allow_short))
}

/// Look up the best-fit signature for `mnemonic` applied to `ops`.
///
/// `allow_short` controls whether rel8 branch forms are eligible; the
/// assembler enables it only when the target label is already bound within
/// ±127 bytes of the would-be instruction end.
///
/// The tie-break order is documented at the module level and is part of
/// the crate contract.
pub fn lookup(
    mnemonic: Mnemonic,
    ops: &[Operand],
    mode: Mode,
    allow_short: bool,
) -> Result<&'static Signature, JitError> {
    let mut best: Option<(&'static Signature, (u8, u8, u8))> = None;
    for s in signatures(mnemonic) {
        if !sig_matches(s, ops, mode, allow_short) {
            continue;
        }
        let key = (
            s.encoding.imm.bits(),
            u8::from(s.encoding.opsize),
            s.encoding.prefix_count(),
        );
        // Strictly-less keeps the first declaration on ties.
        if best.map_or(true, |(_, k)| key < k) {
            best = Some((s, key));
        }
    }
    match best {
        Some((s, _)) => Ok(s),
        None => {
            // An operand shape that fits some signature except for an
            // out-of-range immediate is an overflow, not an unknown form.
            if let Some((value, bits)) = imm_out_of_range(mnemonic, ops, mode, allow_short) {
                return Err(JitError::ImmediateOverflow { value, bits });
            }
            let mut desc = alloc::string::String::new();
            for (i, op) in ops.iter().enumerate() {
                if i > 0 {
                    desc.push_str(", ");
                }
                desc.push_str(&op.describe());
            }
            Err(JitError::UnsupportedOperand {
                mnemonic: format!("{}", mnemonic),
                operands: desc,
            })
        }
    }
}

/// If `ops` would match a signature when the immediate range check is
/// waived, return the immediate and the widest field it missed.
fn imm_out_of_range(
    mnemonic: Mnemonic,
    ops: &[Operand],
    mode: Mode,
    allow_short: bool,
) -> Option<(i64, u8)> {
    let mut widest: Option<(i64, u8)> = None;
    for s in signatures(mnemonic) {
        if s.patterns.len() != ops.len() {
            continue;
        }
        if mode != Mode::Long64 && s.patterns.iter().any(|p| matches!(p, R64 | Rm64 | Rax)) {
            continue;
        }
        let width = sig_width(s.patterns);
        if mode == Mode::Long64 && s.encoding.def64 && width == 32 {
            continue;
        }
        let mut value = None;
        let shape_ok = s
            .patterns
            .iter()
            .zip(ops.iter())
            .all(|(p, op)| match (*p, op) {
                (Imm8 | SImm8 | Imm16 | Imm32 | Imm64 | One, Operand::Imm(v)) => {
                    value = Some(*v);
                    true
                }
                _ => pattern_matches(*p, op, width, mode, allow_short),
            });
        if !shape_ok {
            continue;
        }
        if let Some(v) = value {
            let bits = s.encoding.imm.bits();
            if widest.map_or(true, |(_, b)| bits > b) {
                widest = Some((v, bits));
            }
        }
    }
    widest
}
