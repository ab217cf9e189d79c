//! # jitforge — Pure Rust x86/x86-64 JIT Code Generation
//!
//! `jitforge` is a pure Rust, zero-C-dependency machine-code generation
//! engine: a table-driven instruction encoder, a low-level assembler with
//! labels and relocations, and a small compiler layer that lowers
//! virtual-register functions through liveness analysis and linear-scan
//! register allocation.
//!
//! ## Quick Start
//!
//! ```rust
//! use jitforge::{Assembler, Mnemonic, Mode, Operand, Register};
//!
//! let mut asm = Assembler::new(Mode::Long64);
//! // mov eax, 42; ret
//! asm.emit(Mnemonic::Mov, &[Register::Eax.into(), Operand::Imm(42)])?;
//! asm.emit(Mnemonic::Ret, &[])?;
//! let image = asm.finalize()?;
//! assert_eq!(image.bytes(), &[0xB8, 42, 0, 0, 0, 0xC3]);
//! # Ok::<(), jitforge::JitError>(())
//! ```
//!
//! ## Features
//!
//! - **Pure Rust** — no C/C++ FFI, no LLVM, no system assembler at runtime.
//! - **Two targets** — 64-bit long mode and 32-bit protected mode
//!   (feature-gated as `x86_64` and `x86`).
//! - **Labels & relocations** — forward references, rel8/rel32 branches,
//!   RIP-relative and absolute data references, named symbols.
//! - **Compiler layer** — unlimited virtual registers, System V and
//!   Windows x64 calling conventions, spilling under a stack budget.
//! - **`no_std` + `alloc`** — the encoder and compiler run without an OS;
//!   only the `jit` feature (executable memory) needs one.

#![cfg_attr(not(feature = "std"), no_std)]
#![cfg_attr(not(feature = "jit"), forbid(unsafe_code))]
// ── Pedantic lint policy ─────────────────────────────────────────────────
// An encoder intentionally performs many narrowing / sign-changing casts
// between integer widths (i64→u8, u8→u32, etc.) and uses dense hex
// literals without separators (0x0FAF, 0xFFD0).  The lints below are
// expected and acceptable in this context.
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_lossless,
    clippy::cast_possible_wrap,
    clippy::unreadable_literal,
    clippy::match_same_arms,
    clippy::bool_to_int_with_if,
    clippy::wildcard_imports,
    clippy::enum_glob_use,
    clippy::must_use_candidate,
    clippy::module_name_repetitions,
    clippy::uninlined_format_args,
    clippy::doc_markdown,
    clippy::similar_names,
    clippy::too_many_lines,
    clippy::single_match_else,
    clippy::unnecessary_wraps,
    clippy::many_single_char_names,
    clippy::return_self_not_must_use,
    clippy::missing_errors_doc
)]

extern crate alloc;

/// The low-level assembler: emit, labels, finalize.
pub mod asm;
/// Output buffers, relocations, and the finalized [`Image`].
pub mod buffer;
/// Virtual-register functions, liveness, linear scan, lowering.
#[cfg(feature = "compiler")]
pub mod compiler;
/// Error types.
pub mod error;
/// Executable memory mapping (W^X page handling).
#[cfg(feature = "jit")]
pub mod exec;
/// The instruction database: mnemonics, signatures, encodings.
pub mod isa;
/// Operand and register model.
pub mod operand;

// Re-exports
pub use asm::Assembler;
pub use buffer::{Image, RelocKind, Relocation};
pub use error::JitError;
#[cfg(feature = "jit")]
pub use exec::ExecMemory;
pub use isa::{Cc, Mnemonic};
pub use operand::{LabelId, Mem, Operand, Register, Width};

/// Target execution mode.
///
/// Selected once per [`Assembler`]; every emitted instruction is checked
/// against it.  At least one of the `x86_64` / `x86` features must be
/// enabled for the corresponding variant to encode anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Mode {
    /// 64-bit long mode (REX prefixes, RIP-relative addressing).
    Long64,
    /// 32-bit protected mode.
    Protected32,
}

impl core::fmt::Display for Mode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Mode::Long64 => f.write_str("64-bit"),
            Mode::Protected32 => f.write_str("32-bit"),
        }
    }
}
