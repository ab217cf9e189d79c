//! Operand and register model.
//!
//! Pure value types consumed by both the assembler and the compiler layer.
//! Validation happens at construction: a [`Mem`] that violates the
//! architecture's addressing rules can never be built, so the emitter only
//! has to deal with structurally valid operands.

use alloc::format;
use alloc::string::String;
use core::fmt;

use crate::error::JitError;

/// Operand width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Width {
    /// 8 bits.
    Byte,
    /// 16 bits.
    Word,
    /// 32 bits.
    Dword,
    /// 64 bits.
    Qword,
}

impl Width {
    /// Width in bits.
    #[must_use]
    pub fn bits(self) -> u16 {
        match self {
            Width::Byte => 8,
            Width::Word => 16,
            Width::Dword => 32,
            Width::Qword => 64,
        }
    }

    /// Width in bytes.
    #[must_use]
    pub fn bytes(self) -> u8 {
        (self.bits() / 8) as u8
    }
}

impl fmt::Display for Width {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Width::Byte => write!(f, "byte"),
            Width::Word => write!(f, "word"),
            Width::Dword => write!(f, "dword"),
            Width::Qword => write!(f, "qword"),
        }
    }
}

/// Architectural register class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RegClass {
    /// General-purpose integer registers.
    Gp,
    /// SSE vector registers (XMM0–XMM15).
    Vec,
    /// The instruction pointer (only usable as a memory base).
    Ip,
}

/// x86/x86-64 register.
///
/// Each variant encodes its own width (see [`Register::size_bits`]) and
/// hardware register number (see [`Register::base_code`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[allow(missing_docs)] // variant names are the architectural register names
pub enum Register {
    // 64-bit general-purpose
    Rax, Rcx, Rdx, Rbx, Rsp, Rbp, Rsi, Rdi,
    R8, R9, R10, R11, R12, R13, R14, R15,
    // 32-bit general-purpose
    Eax, Ecx, Edx, Ebx, Esp, Ebp, Esi, Edi,
    R8d, R9d, R10d, R11d, R12d, R13d, R14d, R15d,
    // 16-bit general-purpose
    Ax, Cx, Dx, Bx, Sp, Bp, Si, Di,
    R8w, R9w, R10w, R11w, R12w, R13w, R14w, R15w,
    // 8-bit low
    Al, Cl, Dl, Bl, Spl, Bpl, Sil, Dil,
    R8b, R9b, R10b, R11b, R12b, R13b, R14b, R15b,
    // 8-bit high (legacy, REX-incompatible)
    Ah, Ch, Dh, Bh,
    // SSE
    Xmm0, Xmm1, Xmm2, Xmm3, Xmm4, Xmm5, Xmm6, Xmm7,
    Xmm8, Xmm9, Xmm10, Xmm11, Xmm12, Xmm13, Xmm14, Xmm15,
    // Instruction pointer — valid only as a memory base (RIP-relative).
    Rip,
}

impl Register {
    /// The low three bits of the hardware register number, as used in
    /// ModRM/SIB fields and `+r` opcode encodings.
    #[must_use]
    pub fn base_code(self) -> u8 {
        use Register::*;
        match self {
            Rax | Eax | Ax | Al | R8 | R8d | R8w | R8b | Xmm0 | Xmm8 => 0,
            Rcx | Ecx | Cx | Cl | R9 | R9d | R9w | R9b | Xmm1 | Xmm9 => 1,
            Rdx | Edx | Dx | Dl | R10 | R10d | R10w | R10b | Xmm2 | Xmm10 => 2,
            Rbx | Ebx | Bx | Bl | R11 | R11d | R11w | R11b | Xmm3 | Xmm11 => 3,
            Rsp | Esp | Sp | Spl | Ah | R12 | R12d | R12w | R12b | Xmm4 | Xmm12 => 4,
            Rbp | Ebp | Bp | Bpl | Ch | R13 | R13d | R13w | R13b | Xmm5 | Xmm13 => 5,
            Rsi | Esi | Si | Sil | Dh | R14 | R14d | R14w | R14b | Xmm6 | Xmm14 => 6,
            Rdi | Edi | Di | Dil | Bh | R15 | R15d | R15w | R15b | Xmm7 | Xmm15 => 7,
            // RIP-relative uses the mod=00, rm=101 encoding.
            Rip => 5,
        }
    }

    /// Whether this is an extended register (R8–R15 in any width, or
    /// XMM8–XMM15) requiring REX.R or REX.B.
    #[must_use]
    pub fn is_extended(self) -> bool {
        use Register::*;
        matches!(
            self,
            R8 | R9 | R10 | R11 | R12 | R13 | R14 | R15
                | R8d | R9d | R10d | R11d | R12d | R13d | R14d | R15d
                | R8w | R9w | R10w | R11w | R12w | R13w | R14w | R15w
                | R8b | R9b | R10b | R11b | R12b | R13b | R14b | R15b
                | Xmm8 | Xmm9 | Xmm10 | Xmm11 | Xmm12 | Xmm13 | Xmm14 | Xmm15
        )
    }

    /// Register width in bits.
    #[must_use]
    pub fn size_bits(self) -> u16 {
        use Register::*;
        match self {
            Rax | Rcx | Rdx | Rbx | Rsp | Rbp | Rsi | Rdi | R8 | R9 | R10 | R11 | R12 | R13
            | R14 | R15 | Rip => 64,
            Eax | Ecx | Edx | Ebx | Esp | Ebp | Esi | Edi | R8d | R9d | R10d | R11d | R12d
            | R13d | R14d | R15d => 32,
            Ax | Cx | Dx | Bx | Sp | Bp | Si | Di | R8w | R9w | R10w | R11w | R12w | R13w
            | R14w | R15w => 16,
            Al | Cl | Dl | Bl | Spl | Bpl | Sil | Dil | Ah | Ch | Dh | Bh | R8b | R9b | R10b
            | R11b | R12b | R13b | R14b | R15b => 8,
            Xmm0 | Xmm1 | Xmm2 | Xmm3 | Xmm4 | Xmm5 | Xmm6 | Xmm7 | Xmm8 | Xmm9 | Xmm10
            | Xmm11 | Xmm12 | Xmm13 | Xmm14 | Xmm15 => 128,
        }
    }

    /// Architectural class of this register.
    #[must_use]
    pub fn class(self) -> RegClass {
        use Register::*;
        match self {
            Xmm0 | Xmm1 | Xmm2 | Xmm3 | Xmm4 | Xmm5 | Xmm6 | Xmm7 | Xmm8 | Xmm9 | Xmm10
            | Xmm11 | Xmm12 | Xmm13 | Xmm14 | Xmm15 => RegClass::Vec,
            Rip => RegClass::Ip,
            _ => RegClass::Gp,
        }
    }

    /// Whether this register requires a REX prefix to be addressable as an
    /// 8-bit register (SPL, BPL, SIL, DIL).
    #[must_use]
    pub fn requires_rex_for_byte(self) -> bool {
        use Register::*;
        matches!(self, Spl | Bpl | Sil | Dil)
    }

    /// Whether this is a high-byte register (AH, CH, DH, BH).
    /// These cannot appear in an instruction carrying a REX prefix.
    #[must_use]
    pub fn is_high_byte(self) -> bool {
        use Register::*;
        matches!(self, Ah | Ch | Dh | Bh)
    }

    /// Whether this is an XMM register.
    #[must_use]
    pub fn is_xmm(self) -> bool {
        self.class() == RegClass::Vec
    }

    /// The name of a 64-bit GPR narrowed to `width` (e.g. `Rax` at
    /// [`Width::Dword`] is `Eax`).  Identity for non-64-bit inputs of the
    /// requested width.
    ///
    /// Used by the compiler layer, which tracks physical registers in their
    /// canonical 64-bit form.
    #[must_use]
    pub fn with_width(self, width: Width) -> Register {
        use Register::*;
        if self.class() != RegClass::Gp {
            return self;
        }
        let full = self.to_full();
        const FAMILIES: [[Register; 4]; 16] = [
            [Rax, Ax, Eax, Rax],
            [Rcx, Cx, Ecx, Rcx],
            [Rdx, Dx, Edx, Rdx],
            [Rbx, Bx, Ebx, Rbx],
            [Rsp, Sp, Esp, Rsp],
            [Rbp, Bp, Ebp, Rbp],
            [Rsi, Si, Esi, Rsi],
            [Rdi, Di, Edi, Rdi],
            [R8, R8w, R8d, R8],
            [R9, R9w, R9d, R9],
            [R10, R10w, R10d, R10],
            [R11, R11w, R11d, R11],
            [R12, R12w, R12d, R12],
            [R13, R13w, R13d, R13],
            [R14, R14w, R14d, R14],
            [R15, R15w, R15d, R15],
        ];
        const LOW8: [Register; 16] = [
            Al, Cl, Dl, Bl, Spl, Bpl, Sil, Dil, R8b, R9b, R10b, R11b, R12b, R13b, R14b, R15b,
        ];
        let idx = (full.base_code() as usize) | ((full.is_extended() as usize) << 3);
        match width {
            Width::Byte => LOW8[idx],
            Width::Word => FAMILIES[idx][1],
            Width::Dword => FAMILIES[idx][2],
            Width::Qword => FAMILIES[idx][0],
        }
    }

    /// The canonical 64-bit register of this GPR's family.
    /// High-byte registers map to their family's 64-bit register.
    #[must_use]
    pub fn to_full(self) -> Register {
        use Register::*;
        if self.class() != RegClass::Gp {
            return self;
        }
        const FULL: [Register; 8] = [Rax, Rcx, Rdx, Rbx, Rsp, Rbp, Rsi, Rdi];
        const FULL_EXT: [Register; 8] = [R8, R9, R10, R11, R12, R13, R14, R15];
        // High-byte registers share base codes with SPL/BPL/SIL/DIL but
        // belong to the A/C/D/B families.
        let code = match self {
            Ah => 0,
            Ch => 1,
            Dh => 2,
            Bh => 3,
            other => other.base_code(),
        };
        if self.is_extended() {
            FULL_EXT[code as usize]
        } else {
            FULL[code as usize]
        }
    }

    fn name(self) -> &'static str {
        use Register::*;
        match self {
            Rax => "rax", Rcx => "rcx", Rdx => "rdx", Rbx => "rbx",
            Rsp => "rsp", Rbp => "rbp", Rsi => "rsi", Rdi => "rdi",
            R8 => "r8", R9 => "r9", R10 => "r10", R11 => "r11",
            R12 => "r12", R13 => "r13", R14 => "r14", R15 => "r15",
            Eax => "eax", Ecx => "ecx", Edx => "edx", Ebx => "ebx",
            Esp => "esp", Ebp => "ebp", Esi => "esi", Edi => "edi",
            R8d => "r8d", R9d => "r9d", R10d => "r10d", R11d => "r11d",
            R12d => "r12d", R13d => "r13d", R14d => "r14d", R15d => "r15d",
            Ax => "ax", Cx => "cx", Dx => "dx", Bx => "bx",
            Sp => "sp", Bp => "bp", Si => "si", Di => "di",
            R8w => "r8w", R9w => "r9w", R10w => "r10w", R11w => "r11w",
            R12w => "r12w", R13w => "r13w", R14w => "r14w", R15w => "r15w",
            Al => "al", Cl => "cl", Dl => "dl", Bl => "bl",
            Spl => "spl", Bpl => "bpl", Sil => "sil", Dil => "dil",
            R8b => "r8b", R9b => "r9b", R10b => "r10b", R11b => "r11b",
            R12b => "r12b", R13b => "r13b", R14b => "r14b", R15b => "r15b",
            Ah => "ah", Ch => "ch", Dh => "dh", Bh => "bh",
            Xmm0 => "xmm0", Xmm1 => "xmm1", Xmm2 => "xmm2", Xmm3 => "xmm3",
            Xmm4 => "xmm4", Xmm5 => "xmm5", Xmm6 => "xmm6", Xmm7 => "xmm7",
            Xmm8 => "xmm8", Xmm9 => "xmm9", Xmm10 => "xmm10", Xmm11 => "xmm11",
            Xmm12 => "xmm12", Xmm13 => "xmm13", Xmm14 => "xmm14", Xmm15 => "xmm15",
            Rip => "rip",
        }
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identity of a jump target handed out by [`crate::Assembler::new_label`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LabelId(pub(crate) u32);

impl LabelId {
    /// The raw label index.
    #[must_use]
    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for LabelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// A memory (indirect) operand: `[base + index*scale + disp]`.
///
/// Constructed through the checked builders below; an invalid combination
/// (bad scale, RSP as index, mixed base/index widths, an index next to a
/// RIP base) is a [`JitError::MalformedOperand`] at construction time, not
/// at emit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Mem {
    /// Explicit size qualifier, or `None` to infer from the other operand.
    pub(crate) width: Option<Width>,
    pub(crate) base: Option<Register>,
    pub(crate) index: Option<Register>,
    pub(crate) scale: u8,
    pub(crate) disp: i32,
    /// When present, the displacement is a label reference patched at
    /// finalize (RIP-relative in 64-bit mode, absolute in 32-bit mode).
    pub(crate) label: Option<LabelId>,
}

impl Mem {
    /// `[base]`
    pub fn base(base: Register) -> Result<Mem, JitError> {
        Self::build(Some(base), None, 1, 0, None)
    }

    /// `[base + disp]`
    pub fn base_disp(base: Register, disp: i32) -> Result<Mem, JitError> {
        Self::build(Some(base), None, 1, disp, None)
    }

    /// `[base + index*scale]`
    pub fn base_index(base: Register, index: Register, scale: u8) -> Result<Mem, JitError> {
        Self::build(Some(base), Some(index), scale, 0, None)
    }

    /// `[base + index*scale + disp]`
    pub fn base_index_disp(
        base: Register,
        index: Register,
        scale: u8,
        disp: i32,
    ) -> Result<Mem, JitError> {
        Self::build(Some(base), Some(index), scale, disp, None)
    }

    /// `[index*scale + disp]` — no base register.
    pub fn index_disp(index: Register, scale: u8, disp: i32) -> Result<Mem, JitError> {
        Self::build(None, Some(index), scale, disp, None)
    }

    /// `[disp]` — absolute (32-bit mode) or SIB-encoded absolute (64-bit mode).
    #[must_use]
    pub fn absolute(disp: i32) -> Mem {
        Mem {
            width: None,
            base: None,
            index: None,
            scale: 1,
            disp,
            label: None,
        }
    }

    /// A label-addressed location: RIP-relative in 64-bit mode, absolute
    /// (requiring a base address) in 32-bit mode.
    #[must_use]
    pub fn label(label: LabelId) -> Mem {
        Mem {
            width: None,
            base: None,
            index: None,
            scale: 1,
            disp: 0,
            label: Some(label),
        }
    }

    /// Attach an explicit size qualifier (`byte ptr`, `qword ptr`, …).
    #[must_use]
    pub fn width(mut self, width: Width) -> Mem {
        self.width = Some(width);
        self
    }

    fn build(
        base: Option<Register>,
        index: Option<Register>,
        scale: u8,
        disp: i32,
        label: Option<LabelId>,
    ) -> Result<Mem, JitError> {
        if !matches!(scale, 1 | 2 | 4 | 8) {
            return Err(JitError::MalformedOperand {
                detail: format!("scale must be 1, 2, 4, or 8 (got {})", scale),
            });
        }
        if let Some(idx) = index {
            if idx.class() != RegClass::Gp {
                return Err(JitError::MalformedOperand {
                    detail: format!("index register {} is not general-purpose", idx),
                });
            }
            // RSP/ESP cannot be an index: its SIB encoding means "no index".
            if idx.base_code() == 4 && !idx.is_extended() {
                return Err(JitError::MalformedOperand {
                    detail: format!("{} cannot be used as an index register", idx),
                });
            }
            if !matches!(idx.size_bits(), 32 | 64) {
                return Err(JitError::MalformedOperand {
                    detail: format!("index register {} must be 32 or 64 bits wide", idx),
                });
            }
        }
        if let Some(b) = base {
            if b == Register::Rip {
                if index.is_some() {
                    return Err(JitError::MalformedOperand {
                        detail: "RIP-relative addressing cannot carry an index register".into(),
                    });
                }
            } else {
                if b.class() != RegClass::Gp {
                    return Err(JitError::MalformedOperand {
                        detail: format!("base register {} is not general-purpose", b),
                    });
                }
                if !matches!(b.size_bits(), 32 | 64) {
                    return Err(JitError::MalformedOperand {
                        detail: format!("base register {} must be 32 or 64 bits wide", b),
                    });
                }
            }
        }
        if let (Some(b), Some(i)) = (base, index) {
            if b != Register::Rip && b.size_bits() != i.size_bits() {
                return Err(JitError::MalformedOperand {
                    detail: format!(
                        "base {} and index {} have different addressing widths",
                        b, i
                    ),
                });
            }
        }
        Ok(Mem {
            width: None,
            base,
            index,
            scale,
            disp,
            label,
        })
    }

    /// `[rip + disp]` (64-bit mode only).
    pub fn rip(disp: i32) -> Mem {
        Mem {
            width: None,
            base: Some(Register::Rip),
            index: None,
            scale: 1,
            disp,
            label: None,
        }
    }

    /// Addressing width of the base/index registers, if any are present.
    #[must_use]
    pub(crate) fn addr_bits(&self) -> Option<u16> {
        self.base
            .filter(|b| *b != Register::Rip)
            .or(self.index)
            .map(Register::size_bits)
    }
}

impl fmt::Display for Mem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(w) = self.width {
            write!(f, "{} ptr ", w)?;
        }
        write!(f, "[")?;
        let mut parts = false;
        if let Some(base) = self.base {
            write!(f, "{}", base)?;
            parts = true;
        }
        if let Some(idx) = self.index {
            if parts {
                write!(f, "+")?;
            }
            write!(f, "{}*{}", idx, self.scale)?;
            parts = true;
        }
        if let Some(label) = self.label {
            if parts {
                write!(f, "+")?;
            }
            write!(f, "{}", label)?;
            parts = true;
        }
        if self.disp != 0 || !parts {
            if parts && self.disp >= 0 {
                write!(f, "+")?;
            }
            write!(f, "{:#x}", self.disp)?;
        }
        write!(f, "]")
    }
}

/// An instruction operand.  Immutable once constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Operand {
    /// A register operand.
    Reg(Register),
    /// An immediate value (sign semantics depend on the chosen encoding).
    Imm(i64),
    /// A memory operand.
    Mem(Mem),
    /// A code label (branch target), resolved at finalize.
    Label(LabelId),
}

impl Operand {
    /// Short human-readable description used in error messages.
    #[must_use]
    pub fn describe(&self) -> String {
        format!("{}", self)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(r) => write!(f, "{}", r),
            Operand::Imm(v) => {
                if *v < 0 {
                    write!(f, "-{:#x}", v.wrapping_neg())
                } else {
                    write!(f, "{:#x}", v)
                }
            }
            Operand::Mem(m) => write!(f, "{}", m),
            Operand::Label(l) => write!(f, "{}", l),
        }
    }
}

impl From<Register> for Operand {
    fn from(r: Register) -> Operand {
        Operand::Reg(r)
    }
}

impl From<i64> for Operand {
    fn from(v: i64) -> Operand {
        Operand::Imm(v)
    }
}

impl From<i32> for Operand {
    fn from(v: i32) -> Operand {
        Operand::Imm(v as i64)
    }
}

impl From<Mem> for Operand {
    fn from(m: Mem) -> Operand {
        Operand::Mem(m)
    }
}

impl From<LabelId> for Operand {
    fn from(l: LabelId) -> Operand {
        Operand::Label(l)
    }
}
