//! Error types for code generation.

#[allow(unused_imports)]
use alloc::format;
use alloc::string::String;
#[allow(unused_imports)]
use alloc::vec;
use core::fmt;

use crate::operand::LabelId;

/// Code-generation error.
///
/// Every fallible operation in the engine reports failure through this type;
/// nothing is silently coerced or truncated.  Errors abort only the current
/// session — previously finalized images and the static instruction tables
/// are unaffected.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum JitError {
    /// An operand failed validation at construction time.
    MalformedOperand {
        /// Description of the constraint that was violated.
        detail: String,
    },

    /// No signature of the mnemonic accepts the given operand kinds.
    UnsupportedOperand {
        /// The mnemonic that was being emitted.
        mnemonic: String,
        /// Description of the offending operands.
        operands: String,
    },

    /// The operand combination is structurally invalid for the target mode
    /// (e.g. a 64-bit register in 32-bit mode, or two memory operands).
    InvalidOperandCombination {
        /// Description of why the combination is invalid.
        detail: String,
    },

    /// Immediate value exceeds the range of its encoding width.
    ImmediateOverflow {
        /// The immediate value that overflowed.
        value: i64,
        /// Encoding width in bits.
        bits: u8,
    },

    /// A referenced label was never bound before `finalize`.
    UnresolvedLabel {
        /// The unbound label.
        label: LabelId,
        /// The label's name, if one was assigned.
        name: Option<String>,
    },

    /// A label was bound more than once.
    LabelAlreadyBound {
        /// The label in question.
        label: LabelId,
        /// Buffer offset of the first binding.
        first_offset: u64,
    },

    /// A patched displacement does not fit the width recorded at emit time.
    DisplacementOverflow {
        /// The target label.
        label: LabelId,
        /// The computed displacement.
        disp: i64,
        /// The relocation field width in bits.
        bits: u8,
    },

    /// A virtual register is used on a path where no definition reaches it.
    UseBeforeDef {
        /// Index of the offending virtual register.
        vreg: u32,
    },

    /// Spill-slot assignment exceeded the configured stack budget.
    FrameOverflow {
        /// The frame size that was requested.
        requested: u64,
        /// The configured budget.
        budget: u64,
    },

    /// A register class required by the function has no physical registers
    /// available for allocation at all.
    NoAllocatableRegister {
        /// Name of the register class.
        class: &'static str,
    },

    /// Mapping the finalized image into executable memory failed.
    ExecMap {
        /// Description of the OS-level failure.
        detail: String,
    },
}

impl fmt::Display for JitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JitError::MalformedOperand { detail } => {
                write!(f, "malformed operand: {}", detail)
            }
            JitError::UnsupportedOperand { mnemonic, operands } => {
                write!(
                    f,
                    "no encoding of '{}' accepts operands ({})",
                    mnemonic, operands
                )
            }
            JitError::InvalidOperandCombination { detail } => {
                write!(f, "invalid operand combination: {}", detail)
            }
            JitError::ImmediateOverflow { value, bits } => {
                write!(f, "immediate {} does not fit in {} bits", value, bits)
            }
            JitError::UnresolvedLabel { label, name } => match name {
                Some(n) => write!(f, "unresolved label '{}' ({})", n, label),
                None => write!(f, "unresolved label {}", label),
            },
            JitError::LabelAlreadyBound {
                label,
                first_offset,
            } => {
                write!(
                    f,
                    "label {} already bound at offset {:#x}",
                    label, first_offset
                )
            }
            JitError::DisplacementOverflow { label, disp, bits } => {
                write!(
                    f,
                    "displacement {} to {} does not fit the {}-bit field chosen at emit time",
                    disp, label, bits
                )
            }
            JitError::UseBeforeDef { vreg } => {
                write!(f, "virtual register v{} used before any definition", vreg)
            }
            JitError::FrameOverflow { requested, budget } => {
                write!(
                    f,
                    "stack frame of {} bytes exceeds budget of {} bytes",
                    requested, budget
                )
            }
            JitError::NoAllocatableRegister { class } => {
                write!(
                    f,
                    "calling convention leaves no allocatable register in class {}",
                    class
                )
            }
            JitError::ExecMap { detail } => {
                write!(f, "executable mapping failed: {}", detail)
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for JitError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_operand_display() {
        let err = JitError::MalformedOperand {
            detail: "scale must be 1, 2, 4, or 8 (got 3)".into(),
        };
        assert_eq!(
            format!("{}", err),
            "malformed operand: scale must be 1, 2, 4, or 8 (got 3)"
        );
    }

    #[test]
    fn unsupported_operand_display() {
        let err = JitError::UnsupportedOperand {
            mnemonic: "lea".into(),
            operands: "imm 0x5, imm 0x6".into(),
        };
        assert_eq!(
            format!("{}", err),
            "no encoding of 'lea' accepts operands (imm 0x5, imm 0x6)"
        );
    }

    #[test]
    fn immediate_overflow_display() {
        let err = JitError::ImmediateOverflow {
            value: 300,
            bits: 8,
        };
        assert_eq!(format!("{}", err), "immediate 300 does not fit in 8 bits");
    }

    #[test]
    fn unresolved_label_display() {
        let err = JitError::UnresolvedLabel {
            label: LabelId(3),
            name: Some("loop_head".into()),
        };
        assert_eq!(format!("{}", err), "unresolved label 'loop_head' (L3)");
        let err = JitError::UnresolvedLabel {
            label: LabelId(7),
            name: None,
        };
        assert_eq!(format!("{}", err), "unresolved label L7");
    }

    #[test]
    fn already_bound_display() {
        let err = JitError::LabelAlreadyBound {
            label: LabelId(0),
            first_offset: 0x10,
        };
        assert_eq!(format!("{}", err), "label L0 already bound at offset 0x10");
    }

    #[test]
    fn displacement_overflow_display() {
        let err = JitError::DisplacementOverflow {
            label: LabelId(2),
            disp: 200,
            bits: 8,
        };
        assert_eq!(
            format!("{}", err),
            "displacement 200 to L2 does not fit the 8-bit field chosen at emit time"
        );
    }

    #[test]
    fn use_before_def_display() {
        let err = JitError::UseBeforeDef { vreg: 4 };
        assert_eq!(
            format!("{}", err),
            "virtual register v4 used before any definition"
        );
    }

    #[test]
    fn frame_overflow_display() {
        let err = JitError::FrameOverflow {
            requested: 2 * 1024 * 1024,
            budget: 1024 * 1024,
        };
        assert_eq!(
            format!("{}", err),
            "stack frame of 2097152 bytes exceeds budget of 1048576 bytes"
        );
    }

    #[test]
    fn no_allocatable_register_display() {
        let err = JitError::NoAllocatableRegister { class: "gp" };
        assert_eq!(
            format!("{}", err),
            "calling convention leaves no allocatable register in class gp"
        );
    }
}
