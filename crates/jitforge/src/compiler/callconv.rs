//! Calling-convention descriptors.
//!
//! The allocation and lowering passes consume these as configuration; no
//! register role is hard-coded in the passes themselves.

use crate::operand::Register;

/// An x86-64 calling convention.
///
/// RBP is the frame pointer and RSP the stack pointer in every supported
/// convention; neither appears in any register list here.  The scratch
/// pair is reserved for spill reloads and address materialization and is
/// never handed to the allocator.
#[derive(Debug, Clone, Copy)]
pub struct CallConv {
    /// Convention name, for diagnostics.
    pub name: &'static str,
    /// Integer argument registers, in order.
    pub arg_regs: &'static [Register],
    /// Integer return register.
    pub ret_reg: Register,
    /// Registers the callee must preserve.  The allocator's primary pool.
    pub callee_saved: &'static [Register],
    /// Call-clobbered registers the allocator may additionally use in
    /// functions that make no calls.
    pub caller_saved: &'static [Register],
    /// Reserved scratch registers (call-clobbered, never allocated).
    pub scratch: [Register; 2],
    /// Required stack alignment at call sites, in bytes.
    pub stack_align: u64,
    /// Bytes of shadow/home space the caller reserves below its arguments.
    pub shadow_space: u64,
}

/// The System V AMD64 ABI (Linux, macOS, BSD).
pub const SYSTEM_V: CallConv = CallConv {
    name: "systemv",
    arg_regs: &[
        Register::Rdi,
        Register::Rsi,
        Register::Rdx,
        Register::Rcx,
        Register::R8,
        Register::R9,
    ],
    ret_reg: Register::Rax,
    callee_saved: &[
        Register::Rbx,
        Register::R12,
        Register::R13,
        Register::R14,
        Register::R15,
    ],
    caller_saved: &[
        Register::Rcx,
        Register::Rdx,
        Register::Rsi,
        Register::Rdi,
        Register::R8,
        Register::R9,
    ],
    scratch: [Register::R10, Register::R11],
    stack_align: 16,
    shadow_space: 0,
};

/// The Windows x64 convention.
pub const WINDOWS_64: CallConv = CallConv {
    name: "windows64",
    arg_regs: &[Register::Rcx, Register::Rdx, Register::R8, Register::R9],
    ret_reg: Register::Rax,
    callee_saved: &[
        Register::Rbx,
        Register::Rsi,
        Register::Rdi,
        Register::R12,
        Register::R13,
        Register::R14,
        Register::R15,
    ],
    caller_saved: &[Register::Rcx, Register::Rdx, Register::R8, Register::R9],
    scratch: [Register::R10, Register::R11],
    stack_align: 16,
    shadow_space: 32,
};

impl CallConv {
    /// The System V AMD64 convention.
    #[must_use]
    pub fn systemv() -> &'static CallConv {
        &SYSTEM_V
    }

    /// The Windows x64 convention.
    #[must_use]
    pub fn windows64() -> &'static CallConv {
        &WINDOWS_64
    }

    /// Whether `reg` is preserved across calls under this convention.
    #[must_use]
    pub fn is_callee_saved(&self, reg: Register) -> bool {
        self.callee_saved.contains(&reg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pools_are_disjoint_from_scratch() {
        for conv in [&SYSTEM_V, &WINDOWS_64] {
            for s in conv.scratch {
                assert!(!conv.callee_saved.contains(&s), "{}", conv.name);
                assert!(!conv.caller_saved.contains(&s), "{}", conv.name);
                assert!(!conv.arg_regs.contains(&s), "{}", conv.name);
            }
            assert!(!conv.callee_saved.contains(&conv.ret_reg));
            assert!(!conv.callee_saved.contains(&Register::Rbp));
            assert!(!conv.callee_saved.contains(&Register::Rsp));
        }
    }

    #[test]
    fn caller_saved_pool_never_survives_calls() {
        for conv in [&SYSTEM_V, &WINDOWS_64] {
            for r in conv.caller_saved {
                assert!(!conv.is_callee_saved(*r), "{}", conv.name);
            }
        }
    }
}
