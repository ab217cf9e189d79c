//! Code buffer, relocation records, and the finalized image.

use alloc::string::String;
use alloc::vec::Vec;

use crate::operand::LabelId;

/// Fixed-capacity byte buffer for a single encoded instruction.
///
/// x86 instructions are at most 15 bytes; storing them inline avoids a heap
/// allocation per instruction on the emit path.
#[derive(Debug, Clone, Copy)]
pub(crate) struct InstrBytes {
    data: [u8; 16],
    len: u8,
}

impl InstrBytes {
    #[inline]
    pub const fn new() -> Self {
        Self {
            data: [0; 16],
            len: 0,
        }
    }

    /// Append a single byte.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is already full (16 bytes).
    #[inline]
    pub fn push(&mut self, byte: u8) {
        assert!(
            (self.len as usize) < 16,
            "InstrBytes overflow: cannot push beyond 16 bytes"
        );
        self.data[self.len as usize] = byte;
        self.len += 1;
    }

    #[inline]
    pub fn extend_from_slice(&mut self, src: &[u8]) {
        for &b in src {
            self.push(b);
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// Last byte pushed.  Used to apply `+r` and `+cc` opcode adjustments.
    #[inline]
    pub fn last_mut(&mut self) -> &mut u8 {
        debug_assert!(self.len > 0);
        &mut self.data[self.len as usize - 1]
    }
}

/// How a relocation field is patched at finalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RelocKind {
    /// Signed displacement relative to the end of the instruction
    /// (branches and RIP-relative memory operands).
    Relative,
    /// Absolute address (base address + label offset) written as raw
    /// little-endian bytes.
    Absolute,
}

/// A displacement field awaiting label resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Relocation {
    /// Byte offset of the field within the buffer.
    pub offset: usize,
    /// Width of the field in bytes (1 or 4).
    pub size: u8,
    /// The label whose offset resolves this field.
    pub label: LabelId,
    /// How the resolved value is computed and written.
    pub kind: RelocKind,
    /// Constant added to the resolved value.
    pub addend: i64,
    /// Instruction bytes following the field.  Relative fields are
    /// displacements from the end of the whole instruction, so the patch
    /// target is `offset + size + trailing_bytes`.
    pub trailing_bytes: u8,
}

/// Growable machine-code buffer with pending relocations.
///
/// Owned by the assembler; instructions land here after encoding, with
/// their relocation offsets rebased from instruction-local to
/// buffer-global.
#[derive(Debug, Default)]
pub(crate) struct CodeBuffer {
    bytes: Vec<u8>,
    relocations: Vec<Relocation>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn relocations(&self) -> &[Relocation] {
        &self.relocations
    }

    pub fn push_byte(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    pub fn extend_from_slice(&mut self, src: &[u8]) {
        self.bytes.extend_from_slice(src);
    }

    /// Append an encoded instruction, rebasing its relocations (recorded
    /// relative to the instruction start) onto buffer offsets.
    pub fn push_instr(&mut self, instr: &InstrBytes, relocs: &[Relocation]) {
        let base = self.bytes.len();
        self.bytes.extend_from_slice(instr.as_slice());
        for r in relocs {
            self.relocations.push(Relocation {
                offset: base + r.offset,
                ..*r
            });
        }
    }
}

/// A finalized, position-resolved machine-code image.
///
/// Immutable: all label references have been patched, so the bytes can be
/// copied to the address the image was finalized for (its
/// [`base_address`](Image::base_address)) and executed, or shipped
/// elsewhere together with the retained relocation records.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Image {
    pub(crate) bytes: Vec<u8>,
    pub(crate) base_address: u64,
    /// Offset of every label that was bound, indexed by label id.
    pub(crate) labels: Vec<(LabelId, u64)>,
    /// Named labels, for symbol lookup after mapping.
    pub(crate) symbols: Vec<(String, u64)>,
    /// The relocation sites that were patched, kept so a loader can
    /// re-patch if it places the code at a different address.
    pub(crate) relocations: Vec<Relocation>,
}

impl Image {
    /// The resolved machine code.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume the image, returning the code bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Code size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the image contains no code.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The address the image was resolved for.
    #[must_use]
    pub fn base_address(&self) -> u64 {
        self.base_address
    }

    /// Buffer offset of a bound label.
    #[must_use]
    pub fn label_offset(&self, label: LabelId) -> Option<u64> {
        self.labels
            .iter()
            .find(|(l, _)| *l == label)
            .map(|&(_, off)| off)
    }

    /// Buffer offset of a named label.
    #[must_use]
    pub fn symbol(&self, name: &str) -> Option<u64> {
        self.symbols
            .iter()
            .find(|(n, _)| n == name)
            .map(|&(_, off)| off)
    }

    /// All named labels with their offsets.
    #[must_use]
    pub fn symbols(&self) -> &[(String, u64)] {
        &self.symbols
    }

    /// Every bound label and its offset.
    pub fn labels(&self) -> &[(LabelId, u64)] {
        &self.labels
    }

    /// The relocation sites that were patched into the image.
    #[must_use]
    pub fn relocations(&self) -> &[Relocation] {
        &self.relocations
    }
}
