//! Low-level assembler: instruction emission, labels, and finalization.

use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::buffer::{CodeBuffer, Image, InstrBytes, RelocKind, Relocation};
use crate::error::JitError;
use crate::isa::{self, Encoding, ImmKind, Mnemonic, ModRmKind, OpPattern, Signature};
use crate::operand::{LabelId, Mem, Operand, Register};
use crate::Mode;

#[derive(Debug, Clone, Default)]
struct LabelEntry {
    offset: Option<u64>,
    name: Option<String>,
}

/// Sequential machine-code emitter.
///
/// Append-only: each [`emit`](Assembler::emit) encodes one instruction at
/// the current end of the buffer.  Labels are created up front, referenced
/// freely (including forward), bound once, and resolved by
/// [`finalize`](Assembler::finalize).
///
/// ```
/// use jitforge::{Assembler, Mnemonic, Mode, Operand, Register};
///
/// let mut asm = Assembler::new(Mode::Long64);
/// asm.emit(Mnemonic::Mov, &[Register::Eax.into(), Operand::Imm(42)])?;
/// asm.emit(Mnemonic::Ret, &[])?;
/// let image = asm.finalize()?;
/// assert_eq!(image.bytes(), &[0xB8, 42, 0, 0, 0, 0xC3]);
/// # Ok::<(), jitforge::JitError>(())
/// ```
#[derive(Debug)]
pub struct Assembler {
    mode: Mode,
    buf: CodeBuffer,
    labels: Vec<LabelEntry>,
    base_address: u64,
}

impl Assembler {
    /// Create an empty assembler for the given target mode.
    #[must_use]
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            buf: CodeBuffer::new(),
            labels: Vec::new(),
            base_address: 0,
        }
    }

    /// The target mode this assembler encodes for.
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Set the address the code will run at.  Absolute relocations (label
    /// memory references in 32-bit mode) resolve against it; defaults to 0.
    pub fn set_base_address(&mut self, addr: u64) -> &mut Self {
        self.base_address = addr;
        self
    }

    /// Current end-of-buffer offset, where the next instruction will land.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.buf.len() as u64
    }

    /// The raw (unpatched) code emitted so far.
    #[must_use]
    pub fn code(&self) -> &[u8] {
        self.buf.bytes()
    }

    /// Allocate a fresh, unbound label.
    pub fn new_label(&mut self) -> LabelId {
        self.labels.push(LabelEntry::default());
        LabelId(self.labels.len() as u32 - 1)
    }

    /// Allocate a fresh label carrying a symbol name.  Named labels appear
    /// in the finalized image's symbol table.
    pub fn new_named_label(&mut self, name: &str) -> LabelId {
        self.labels.push(LabelEntry {
            offset: None,
            name: Some(name.to_string()),
        });
        LabelId(self.labels.len() as u32 - 1)
    }

    /// Bind a label to the current offset.  Binding twice is an error, as
    /// is a label this assembler never handed out.
    pub fn bind(&mut self, label: LabelId) -> Result<(), JitError> {
        let off = self.offset();
        let entry = self.labels.get_mut(label.0 as usize).ok_or_else(|| {
            JitError::MalformedOperand {
                detail: format!("{} was not created by this assembler", label),
            }
        })?;
        if let Some(first) = entry.offset {
            return Err(JitError::LabelAlreadyBound {
                label,
                first_offset: first,
            });
        }
        entry.offset = Some(off);
        Ok(())
    }

    /// Offset a label was bound at, if it has been bound.
    #[must_use]
    pub fn label_offset(&self, label: LabelId) -> Option<u64> {
        self.labels.get(label.0 as usize).and_then(|e| e.offset)
    }

    // ─── Data directives ────────────────────────────────────────────

    /// Emit raw bytes.
    pub fn db(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Emit a little-endian 32-bit value.
    pub fn dd(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a little-endian 64-bit value.
    pub fn dq(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Pad with single-byte NOPs up to the next multiple of `align`.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    pub fn align(&mut self, align: usize) {
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        while self.buf.len() % align != 0 {
            self.buf.push_byte(0x90);
        }
    }

    // ─── Emission ───────────────────────────────────────────────────

    /// Encode one instruction at the current offset.
    ///
    /// The signature is chosen from the instruction database by the
    /// documented best-fit rule.  On error nothing is appended.
    pub fn emit(&mut self, mnemonic: Mnemonic, ops: &[Operand]) -> Result<(), JitError> {
        self.check_backend()?;
        if ops.is_empty() {
            if let Some(bytes) = isa::fixed(mnemonic, self.mode) {
                self.buf.extend_from_slice(bytes);
                return Ok(());
            }
        }
        self.check_mode_legality(ops)?;
        self.check_label_ids(ops)?;
        let allow_short = self.rel8_reachable(mnemonic, ops);
        let sig = isa::lookup(mnemonic, ops, self.mode, allow_short)?;

        let mut instr = InstrBytes::new();
        let mut relocs: Vec<Relocation> = Vec::new();
        self.encode(&mut instr, &mut relocs, mnemonic, sig, ops)?;

        // Relative fields are displacements from the end of the whole
        // instruction, which is only known now.
        for r in &mut relocs {
            r.trailing_bytes = (instr.len() - (r.offset + r.size as usize)) as u8;
        }
        self.buf.push_instr(&instr, &relocs);
        Ok(())
    }

    fn check_backend(&self) -> Result<(), JitError> {
        match self.mode {
            #[cfg(feature = "x86_64")]
            Mode::Long64 => Ok(()),
            #[cfg(feature = "x86")]
            Mode::Protected32 => Ok(()),
            #[allow(unreachable_patterns)]
            mode => Err(JitError::InvalidOperandCombination {
                detail: format!("backend for {:?} is not compiled in", mode),
            }),
        }
    }

    /// Relocations are recorded by raw label index, so every referenced
    /// label must have been handed out by this assembler.
    fn check_label_ids(&self, ops: &[Operand]) -> Result<(), JitError> {
        for op in ops {
            let label = match op {
                Operand::Label(l) => Some(*l),
                Operand::Mem(m) => m.label,
                _ => None,
            };
            if let Some(l) = label {
                if self.labels.len() <= l.0 as usize {
                    return Err(JitError::MalformedOperand {
                        detail: format!("{} was not created by this assembler", l),
                    });
                }
            }
        }
        Ok(())
    }

    /// Mode constraints that are independent of the chosen signature.
    fn check_mode_legality(&self, ops: &[Operand]) -> Result<(), JitError> {
        for op in ops {
            match op {
                Operand::Reg(r) if self.mode != Mode::Long64 => {
                    if r.is_extended() || r.requires_rex_for_byte() {
                        return Err(JitError::InvalidOperandCombination {
                            detail: format!("register {} requires 64-bit mode", r),
                        });
                    }
                }
                Operand::Mem(m) => {
                    if m.base == Some(Register::Rip) && self.mode != Mode::Long64 {
                        return Err(JitError::InvalidOperandCombination {
                            detail: "RIP-relative addressing requires 64-bit mode".into(),
                        });
                    }
                    if self.mode != Mode::Long64 {
                        for r in [m.base, m.index].into_iter().flatten() {
                            if r.is_extended() {
                                return Err(JitError::InvalidOperandCombination {
                                    detail: format!("register {} requires 64-bit mode", r),
                                });
                            }
                        }
                    }
                    // Address-size overrides (0x67) are not emitted: the
                    // addressing width must match the mode.
                    if let Some(bits) = m.addr_bits() {
                        let want = match self.mode {
                            Mode::Long64 => 64,
                            Mode::Protected32 => 32,
                        };
                        if bits != want {
                            return Err(JitError::InvalidOperandCombination {
                                detail: format!(
                                    "{}-bit address registers in {}-bit mode",
                                    bits, want
                                ),
                            });
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Whether a rel8 branch form may be used: the target must already be
    /// bound within i8 range of the end of the 2-byte short encoding.
    fn rel8_reachable(&self, mnemonic: Mnemonic, ops: &[Operand]) -> bool {
        if !matches!(mnemonic, Mnemonic::Jmp | Mnemonic::J(_)) {
            return false;
        }
        let target = match ops {
            [Operand::Label(l)] => match self.label_offset(*l) {
                Some(off) => off,
                None => return false,
            },
            _ => return false,
        };
        let disp = target as i64 - (self.offset() as i64 + 2);
        i8::try_from(disp).is_ok()
    }

    fn encode(
        &self,
        instr: &mut InstrBytes,
        relocs: &mut Vec<Relocation>,
        mnemonic: Mnemonic,
        sig: &Signature,
        ops: &[Operand],
    ) -> Result<(), JitError> {
        let enc = &sig.encoding;

        // Operand roles, per the encoding template.
        let plus_reg = plus_reg_operand(sig, ops);
        let (reg_role, rm_role) = modrm_roles(sig, ops);
        let reg_field = match enc.modrm {
            ModRmKind::Digit(d) => d,
            _ => reg_role.map_or(0, Register::base_code),
        };

        // REX requirements.
        let w = enc.rex_w;
        let r = reg_role.is_some_and(Register::is_extended);
        let (mut x, mut b) = (false, false);
        match rm_role {
            Some(RmRole::Reg(reg)) => b = reg.is_extended(),
            Some(RmRole::Mem(m)) => {
                x = m.index.is_some_and(Register::is_extended);
                b = m.base.is_some_and(|r| r != Register::Rip && r.is_extended());
            }
            None => {}
        }
        if let Some(reg) = plus_reg {
            b = reg.is_extended();
        }
        let byte_rex = encoded_regs(reg_role, rm_role, plus_reg)
            .any(|reg| reg.requires_rex_for_byte());
        let need_rex = w || r || x || b || byte_rex;
        if need_rex {
            if self.mode != Mode::Long64 {
                return Err(JitError::InvalidOperandCombination {
                    detail: format!("'{}' needs a REX prefix, unavailable outside 64-bit mode", mnemonic),
                });
            }
            if encoded_regs(reg_role, rm_role, plus_reg).any(Register::is_high_byte) {
                return Err(JitError::InvalidOperandCombination {
                    detail: "high-byte registers cannot appear in an instruction that needs a REX prefix".into(),
                });
            }
        }

        // Prefixes, REX, opcode.
        if enc.opsize {
            instr.push(0x66);
        }
        if enc.prefix != 0 {
            instr.push(enc.prefix);
        }
        if need_rex {
            instr.push(rex(w, r, x, b));
        }
        instr.extend_from_slice(enc.opcode);
        if enc.add_cc {
            let cc = match mnemonic {
                Mnemonic::J(cc) | Mnemonic::Set(cc) | Mnemonic::Cmov(cc) => cc,
                _ => {
                    return Err(JitError::InvalidOperandCombination {
                        detail: format!("'{}' carries no condition code", mnemonic),
                    })
                }
            };
            *instr.last_mut() += cc.code();
        }
        if let Some(reg) = plus_reg {
            *instr.last_mut() += reg.base_code();
        }

        // ModRM / SIB / displacement.
        match rm_role {
            Some(RmRole::Reg(reg)) => {
                instr.push(modrm(0b11, reg_field, reg.base_code()));
            }
            Some(RmRole::Mem(m)) => {
                if let Some(off) = self.emit_mem(instr, reg_field, m) {
                    relocs.push(Relocation {
                        offset: off,
                        size: 4,
                        label: m.label.expect("reloc offset implies a label"),
                        kind: if self.mode == Mode::Long64 {
                            RelocKind::Relative
                        } else {
                            RelocKind::Absolute
                        },
                        addend: i64::from(m.disp),
                        trailing_bytes: 0,
                    });
                }
            }
            None => {}
        }

        // Immediate / branch displacement.
        self.emit_imm(instr, relocs, enc, sig, ops)?;
        Ok(())
    }

    /// ModRM + SIB + displacement for a memory operand.  Returns the
    /// instruction-local offset of the displacement field when it needs a
    /// label relocation.
    fn emit_mem(&self, instr: &mut InstrBytes, reg_field: u8, mem: &Mem) -> Option<usize> {
        // Label-addressed: RIP-relative in 64-bit mode, absolute disp32
        // in 32-bit mode.  Either way: mod=00, r/m=101, disp32.
        if mem.label.is_some() {
            instr.push(modrm(0b00, reg_field, 0b101));
            let off = instr.len();
            instr.extend_from_slice(&[0, 0, 0, 0]);
            return Some(off);
        }

        // [rip + disp32]
        if mem.base == Some(Register::Rip) {
            instr.push(modrm(0b00, reg_field, 0b101));
            instr.extend_from_slice(&mem.disp.to_le_bytes());
            return None;
        }

        // [disp32] with no registers.  In 64-bit mode mod=00/r/m=101 means
        // RIP-relative, so the absolute form needs a no-index SIB.
        if mem.base.is_none() && mem.index.is_none() {
            if self.mode == Mode::Long64 {
                instr.push(modrm(0b00, reg_field, 0b100));
                instr.push(sib(1, 0b100, 0b101));
            } else {
                instr.push(modrm(0b00, reg_field, 0b101));
            }
            instr.extend_from_slice(&mem.disp.to_le_bytes());
            return None;
        }

        // [index*scale + disp32] with no base: SIB base=101 under mod=00.
        if mem.base.is_none() {
            let idx = mem.index.expect("index-only form");
            instr.push(modrm(0b00, reg_field, 0b100));
            instr.push(sib(mem.scale, idx.base_code(), 0b101));
            instr.extend_from_slice(&mem.disp.to_le_bytes());
            return None;
        }

        let base = mem.base.expect("remaining forms have a base");
        // RSP/R12 as base always need a SIB byte.
        let need_sib = mem.index.is_some() || base.base_code() == 4;
        // RBP/R13 have no disp-less form: mod=00 with their code means
        // something else, so force at least a disp8 of zero.
        let (mod_bits, disp_size) = if mem.disp == 0 && base.base_code() != 5 {
            (0b00, 0)
        } else if (-128..=127).contains(&mem.disp) {
            (0b01, 1)
        } else {
            (0b10, 4)
        };

        if need_sib {
            // Index code 100 in a SIB means "no index".
            let idx_code = mem.index.map_or(0b100, Register::base_code);
            instr.push(modrm(mod_bits, reg_field, 0b100));
            instr.push(sib(mem.scale, idx_code, base.base_code()));
        } else {
            instr.push(modrm(mod_bits, reg_field, base.base_code()));
        }
        match disp_size {
            1 => instr.push(mem.disp as i8 as u8),
            4 => instr.extend_from_slice(&mem.disp.to_le_bytes()),
            _ => {}
        }
        None
    }

    fn emit_imm(
        &self,
        instr: &mut InstrBytes,
        relocs: &mut Vec<Relocation>,
        enc: &Encoding,
        sig: &Signature,
        ops: &[Operand],
    ) -> Result<(), JitError> {
        match enc.imm {
            ImmKind::None => Ok(()),
            ImmKind::Rel8 | ImmKind::Rel32 => {
                let label = ops
                    .iter()
                    .find_map(|op| match op {
                        Operand::Label(l) => Some(*l),
                        _ => None,
                    })
                    .expect("rel signature matched a label operand");
                let size = if enc.imm == ImmKind::Rel8 { 1 } else { 4 };
                let off = instr.len();
                for _ in 0..size {
                    instr.push(0);
                }
                relocs.push(Relocation {
                    offset: off,
                    size,
                    label,
                    kind: RelocKind::Relative,
                    addend: 0,
                    trailing_bytes: 0,
                });
                Ok(())
            }
            kind => {
                // The immediate operand is the one matched by an Imm pattern.
                let value = sig
                    .patterns
                    .iter()
                    .zip(ops.iter())
                    .find_map(|(p, op)| match (p, op) {
                        (
                            OpPattern::Imm8
                            | OpPattern::SImm8
                            | OpPattern::Imm16
                            | OpPattern::Imm32
                            | OpPattern::Imm64,
                            Operand::Imm(v),
                        ) => Some(*v),
                        _ => None,
                    })
                    .ok_or_else(|| JitError::InvalidOperandCombination {
                        detail: "encoding expects an immediate operand".into(),
                    })?;
                match kind {
                    ImmKind::Ib => instr.push(value as u8),
                    ImmKind::Iw => instr.extend_from_slice(&(value as u16).to_le_bytes()),
                    ImmKind::Id => instr.extend_from_slice(&(value as u32).to_le_bytes()),
                    ImmKind::Iq => instr.extend_from_slice(&(value as u64).to_le_bytes()),
                    _ => unreachable!("handled above"),
                }
                Ok(())
            }
        }
    }

    // ─── Finalization ───────────────────────────────────────────────

    /// Resolve every relocation and produce the finished [`Image`].
    ///
    /// Validation happens before any patching: if a referenced label is
    /// unbound or a displacement overflows its field, the assembler is
    /// left untouched and can be corrected and finalized again.
    pub fn finalize(&mut self) -> Result<Image, JitError> {
        // Pass 1: validate.
        for r in self.buf.relocations() {
            let entry = &self.labels[r.label.0 as usize];
            let target = entry.offset.ok_or_else(|| JitError::UnresolvedLabel {
                label: r.label,
                name: entry.name.clone(),
            })?;
            self.resolve(r, target)?;
        }

        // Pass 2: patch a copy.
        let mut bytes = self.buf.bytes().to_vec();
        for r in self.buf.relocations() {
            let target = self.labels[r.label.0 as usize]
                .offset
                .expect("validated above");
            let value = self.resolve(r, target)?;
            let field = &mut bytes[r.offset..r.offset + r.size as usize];
            field.copy_from_slice(&value.to_le_bytes()[..r.size as usize]);
        }

        let mut labels = Vec::new();
        let mut symbols = Vec::new();
        for (i, entry) in self.labels.iter().enumerate() {
            if let Some(off) = entry.offset {
                labels.push((LabelId(i as u32), off));
                if let Some(name) = &entry.name {
                    symbols.push((name.clone(), off));
                }
            }
        }
        Ok(Image {
            bytes,
            base_address: self.base_address,
            labels,
            symbols,
            relocations: self.buf.relocations().to_vec(),
        })
    }

    /// Compute a relocation's patched value and range-check it against the
    /// field width chosen at emit time.
    fn resolve(&self, r: &Relocation, target: u64) -> Result<i64, JitError> {
        let bits = r.size * 8;
        let value = match r.kind {
            RelocKind::Relative => {
                let insn_end = r.offset as i64 + i64::from(r.size) + i64::from(r.trailing_bytes);
                target as i64 - insn_end + r.addend
            }
            RelocKind::Absolute => self.base_address as i64 + target as i64 + r.addend,
        };
        let fits = match (r.kind, r.size) {
            (RelocKind::Relative, 1) => i8::try_from(value).is_ok(),
            (RelocKind::Relative, 4) => i32::try_from(value).is_ok(),
            // Absolute 32-bit fields hold unsigned addresses.
            (RelocKind::Absolute, 4) => u32::try_from(value).is_ok(),
            (_, 8) => true,
            _ => false,
        };
        if !fits {
            return Err(JitError::DisplacementOverflow {
                label: r.label,
                disp: value,
                bits,
            });
        }
        Ok(value)
    }
}

// ─── Encoding helpers ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum RmRole<'a> {
    Reg(Register),
    Mem(&'a Mem),
}

fn rex(w: bool, r: bool, x: bool, b: bool) -> u8 {
    let mut val: u8 = 0x40;
    if w {
        val |= 0x08;
    }
    if r {
        val |= 0x04;
    }
    if x {
        val |= 0x02;
    }
    if b {
        val |= 0x01;
    }
    val
}

fn modrm(mod_: u8, reg: u8, rm: u8) -> u8 {
    (mod_ << 6) | ((reg & 7) << 3) | (rm & 7)
}

fn sib(scale: u8, index: u8, base: u8) -> u8 {
    let ss = match scale {
        2 => 1,
        4 => 2,
        8 => 3,
        _ => 0,
    };
    (ss << 6) | ((index & 7) << 3) | (base & 7)
}

/// The register encoded into the opcode's low bits, for `+r` signatures.
fn plus_reg_operand(sig: &Signature, ops: &[Operand]) -> Option<Register> {
    if !sig.encoding.plus_reg {
        return None;
    }
    sig.patterns
        .iter()
        .zip(ops.iter())
        .find_map(|(p, op)| match (p, op) {
            (
                OpPattern::R8 | OpPattern::R16 | OpPattern::R32 | OpPattern::R64,
                Operand::Reg(r),
            ) => Some(*r),
            _ => None,
        })
}

/// The operands feeding the ModRM `reg` and `r/m` fields.
fn modrm_roles<'a>(
    sig: &Signature,
    ops: &'a [Operand],
) -> (Option<Register>, Option<RmRole<'a>>) {
    let as_reg = |op: &Operand| match op {
        Operand::Reg(r) => Some(*r),
        _ => None,
    };
    let as_rm = |op: &'a Operand| match op {
        Operand::Reg(r) => Some(RmRole::Reg(*r)),
        Operand::Mem(m) => Some(RmRole::Mem(m)),
        _ => None,
    };
    match sig.encoding.modrm {
        ModRmKind::None => (None, None),
        ModRmKind::RegRm => (as_reg(&ops[0]), as_rm(&ops[1])),
        ModRmKind::RmReg => (as_reg(&ops[1]), as_rm(&ops[0])),
        ModRmKind::Digit(_) => {
            // The r/m operand is whichever matched a register/memory pattern.
            let rm = sig
                .patterns
                .iter()
                .zip(ops.iter())
                .find_map(|(p, op)| match p {
                    OpPattern::Rm8
                    | OpPattern::Rm16
                    | OpPattern::Rm32
                    | OpPattern::Rm64
                    | OpPattern::M
                    | OpPattern::Xm64
                    | OpPattern::Xm128 => as_rm(op),
                    _ => None,
                });
            (None, rm)
        }
    }
}

/// Registers that end up in REX-sensitive encoding fields.
fn encoded_regs(
    reg_role: Option<Register>,
    rm_role: Option<RmRole<'_>>,
    plus_reg: Option<Register>,
) -> impl Iterator<Item = Register> {
    let rm_reg = match rm_role {
        Some(RmRole::Reg(r)) => Some(r),
        _ => None,
    };
    reg_role.into_iter().chain(rm_reg).chain(plus_reg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::Cc;

    fn asm() -> Assembler {
        Assembler::new(Mode::Long64)
    }

    fn emit_one(mnemonic: Mnemonic, ops: &[Operand]) -> Vec<u8> {
        let mut a = asm();
        a.emit(mnemonic, ops).unwrap();
        a.code().to_vec()
    }

    #[test]
    fn add_reg_reg_is_two_bytes() {
        assert_eq!(
            emit_one(Mnemonic::Add, &[Register::Eax.into(), Register::Ecx.into()]),
            [0x01, 0xC8]
        );
    }

    #[test]
    fn rex_w_for_64_bit_operands() {
        assert_eq!(
            emit_one(Mnemonic::Add, &[Register::Rax.into(), Register::Rcx.into()]),
            [0x48, 0x01, 0xC8]
        );
    }

    #[test]
    fn rex_rb_for_extended_registers() {
        assert_eq!(
            emit_one(Mnemonic::Add, &[Register::R8.into(), Register::R9.into()]),
            [0x4D, 0x01, 0xC8]
        );
    }

    #[test]
    fn mov_imm_forms() {
        assert_eq!(
            emit_one(Mnemonic::Mov, &[Register::Eax.into(), Operand::Imm(1)]),
            [0xB8, 1, 0, 0, 0]
        );
        assert_eq!(
            emit_one(Mnemonic::Mov, &[Register::Rax.into(), Operand::Imm(1)]),
            [0x48, 0xC7, 0xC0, 1, 0, 0, 0]
        );
        assert_eq!(
            emit_one(Mnemonic::Mov, &[Register::Rax.into(), Operand::Imm(0x1_0000_0000)]),
            [0x48, 0xB8, 0, 0, 0, 0, 1, 0, 0, 0]
        );
    }

    #[test]
    fn mem_base_disp_selection() {
        // disp fits i8
        let m = Mem::base_disp(Register::Rax, 8).unwrap();
        assert_eq!(
            emit_one(Mnemonic::Mov, &[Register::Ecx.into(), m.into()]),
            [0x8B, 0x48, 0x08]
        );
        // disp needs 32 bits
        let m = Mem::base_disp(Register::Rax, 0x1000).unwrap();
        assert_eq!(
            emit_one(Mnemonic::Mov, &[Register::Ecx.into(), m.into()]),
            [0x8B, 0x88, 0x00, 0x10, 0, 0]
        );
    }

    #[test]
    fn rbp_and_r13_force_disp8() {
        let m = Mem::base(Register::Rbp).unwrap();
        assert_eq!(
            emit_one(Mnemonic::Mov, &[Register::Eax.into(), m.into()]),
            [0x8B, 0x45, 0x00]
        );
        let m = Mem::base(Register::R13).unwrap();
        assert_eq!(
            emit_one(Mnemonic::Mov, &[Register::Eax.into(), m.into()]),
            [0x41, 0x8B, 0x45, 0x00]
        );
    }

    #[test]
    fn rsp_and_r12_force_sib() {
        let m = Mem::base(Register::Rsp).unwrap();
        assert_eq!(
            emit_one(Mnemonic::Mov, &[Register::Eax.into(), m.into()]),
            [0x8B, 0x04, 0x24]
        );
        let m = Mem::base(Register::R12).unwrap();
        assert_eq!(
            emit_one(Mnemonic::Mov, &[Register::Eax.into(), m.into()]),
            [0x41, 0x8B, 0x04, 0x24]
        );
    }

    #[test]
    fn sib_scaled_index() {
        let m = Mem::base_index_disp(Register::Rbx, Register::Rsi, 4, 8).unwrap();
        assert_eq!(
            emit_one(Mnemonic::Mov, &[Register::Eax.into(), m.into()]),
            [0x8B, 0x44, 0xB3, 0x08]
        );
    }

    #[test]
    fn rip_relative_disp() {
        let m = Mem::rip(0x10);
        assert_eq!(
            emit_one(Mnemonic::Mov, &[Register::Eax.into(), m.into()]),
            [0x8B, 0x05, 0x10, 0, 0, 0]
        );
    }

    #[test]
    fn spl_needs_bare_rex() {
        assert_eq!(
            emit_one(Mnemonic::Mov, &[Register::Spl.into(), Register::Al.into()]),
            [0x40, 0x88, 0xC4]
        );
    }

    #[test]
    fn high_byte_without_rex_ok() {
        assert_eq!(
            emit_one(Mnemonic::Mov, &[Register::Ah.into(), Operand::Imm(1)]),
            [0xB4, 0x01]
        );
    }

    #[test]
    fn high_byte_with_rex_rejected() {
        let mut a = asm();
        let err = a
            .emit(Mnemonic::Mov, &[Register::Ah.into(), Register::Sil.into()])
            .unwrap_err();
        assert!(matches!(err, JitError::InvalidOperandCombination { .. }));
        assert_eq!(a.code().len(), 0);
        let err = a
            .emit(Mnemonic::Mov, &[Register::Ah.into(), Register::R8b.into()])
            .unwrap_err();
        assert!(matches!(err, JitError::InvalidOperandCombination { .. }));
    }

    #[test]
    fn setcc_and_cmovcc_carry_condition() {
        assert_eq!(
            emit_one(Mnemonic::Set(Cc::E), &[Register::Al.into()]),
            [0x0F, 0x94, 0xC0]
        );
        assert_eq!(
            emit_one(
                Mnemonic::Cmov(Cc::L),
                &[Register::Eax.into(), Register::Ecx.into()]
            ),
            [0x0F, 0x4C, 0xC1]
        );
    }

    #[test]
    fn push_pop_plus_reg() {
        assert_eq!(emit_one(Mnemonic::Push, &[Register::Rbp.into()]), [0x55]);
        assert_eq!(emit_one(Mnemonic::Push, &[Register::R12.into()]), [0x41, 0x54]);
        assert_eq!(emit_one(Mnemonic::Pop, &[Register::Rbp.into()]), [0x5D]);
    }

    #[test]
    fn backward_branch_uses_rel8() {
        let mut a = asm();
        let top = a.new_label();
        a.bind(top).unwrap();
        a.emit(Mnemonic::Dec, &[Register::Ecx.into()]).unwrap();
        a.emit(Mnemonic::J(Cc::Ne), &[top.into()]).unwrap();
        let image = a.finalize().unwrap();
        // dec ecx (FF C9), jne -4 (75 FC)
        assert_eq!(image.bytes(), &[0xFF, 0xC9, 0x75, 0xFC]);
    }

    #[test]
    fn forward_branch_uses_rel32() {
        let mut a = asm();
        let end = a.new_label();
        a.emit(Mnemonic::Jmp, &[end.into()]).unwrap();
        a.emit(Mnemonic::Nop, &[]).unwrap();
        a.bind(end).unwrap();
        let image = a.finalize().unwrap();
        assert_eq!(image.bytes(), &[0xE9, 1, 0, 0, 0, 0x90]);
    }

    #[test]
    fn finalize_unbound_label_leaves_buffer_usable() {
        let mut a = asm();
        let l = a.new_named_label("missing");
        a.emit(Mnemonic::Jmp, &[l.into()]).unwrap();
        let before = a.code().to_vec();
        let err = a.finalize().unwrap_err();
        assert_eq!(
            err,
            JitError::UnresolvedLabel {
                label: l,
                name: Some("missing".into())
            }
        );
        assert_eq!(a.code(), &before[..]);
        // Binding afterwards repairs the session.
        a.bind(l).unwrap();
        assert!(a.finalize().is_ok());
    }

    #[test]
    fn double_bind_rejected() {
        let mut a = asm();
        let l = a.new_label();
        a.bind(l).unwrap();
        a.emit(Mnemonic::Nop, &[]).unwrap();
        let err = a.bind(l).unwrap_err();
        assert_eq!(
            err,
            JitError::LabelAlreadyBound {
                label: l,
                first_offset: 0
            }
        );
    }

    #[test]
    fn named_labels_become_symbols() {
        let mut a = asm();
        let entry = a.new_named_label("entry");
        a.emit(Mnemonic::Nop, &[]).unwrap();
        a.bind(entry).unwrap();
        a.emit(Mnemonic::Ret, &[]).unwrap();
        let image = a.finalize().unwrap();
        assert_eq!(image.symbol("entry"), Some(1));
        assert_eq!(image.symbol("absent"), None);
        assert_eq!(image.label_offset(entry), Some(1));
    }

    #[test]
    fn label_memory_operand_is_rip_relative() {
        let mut a = asm();
        let data = a.new_label();
        a.emit(
            Mnemonic::Mov,
            &[Register::Eax.into(), Mem::label(data).into()],
        )
        .unwrap();
        a.emit(Mnemonic::Ret, &[]).unwrap();
        a.bind(data).unwrap();
        a.dd(0x1234_5678);
        let image = a.finalize().unwrap();
        // mov eax, [rip+1]: disp = 7 - 6 = 1 (ret byte in between)
        assert_eq!(
            image.bytes(),
            &[0x8B, 0x05, 1, 0, 0, 0, 0xC3, 0x78, 0x56, 0x34, 0x12]
        );
    }

    #[test]
    fn align_pads_with_nops() {
        let mut a = asm();
        a.db(&[0xCC]);
        a.align(4);
        assert_eq!(a.code(), &[0xCC, 0x90, 0x90, 0x90]);
        a.align(4);
        assert_eq!(a.code().len(), 4);
    }

    #[cfg(feature = "x86")]
    #[test]
    fn protected32_basics() {
        let mut a = Assembler::new(Mode::Protected32);
        a.emit(Mnemonic::Push, &[Register::Ebp.into()]).unwrap();
        a.emit(Mnemonic::Mov, &[Register::Ebp.into(), Register::Esp.into()])
            .unwrap();
        a.emit(Mnemonic::Pop, &[Register::Ebp.into()]).unwrap();
        a.emit(Mnemonic::Ret, &[]).unwrap();
        assert_eq!(a.code(), &[0x55, 0x89, 0xE5, 0x5D, 0xC3]);
    }

    #[cfg(feature = "x86")]
    #[test]
    fn protected32_rejects_long_mode_state() {
        let mut a = Assembler::new(Mode::Protected32);
        assert!(matches!(
            a.emit(Mnemonic::Mov, &[Register::R8d.into(), Operand::Imm(1)]),
            Err(JitError::InvalidOperandCombination { .. })
        ));
        assert!(matches!(
            a.emit(
                Mnemonic::Mov,
                &[Register::Eax.into(), Mem::rip(0).into()]
            ),
            Err(JitError::InvalidOperandCombination { .. })
        ));
        assert!(matches!(
            a.emit(
                Mnemonic::Mov,
                &[
                    Register::Eax.into(),
                    Mem::base(Register::Rax).unwrap().into()
                ]
            ),
            Err(JitError::InvalidOperandCombination { .. })
        ));
    }

    #[cfg(feature = "x86")]
    #[test]
    fn protected32_label_mem_is_absolute() {
        let mut a = Assembler::new(Mode::Protected32);
        a.set_base_address(0x40_0000);
        let data = a.new_label();
        a.emit(
            Mnemonic::Mov,
            &[Register::Eax.into(), Mem::label(data).into()],
        )
        .unwrap();
        a.emit(Mnemonic::Ret, &[]).unwrap();
        a.bind(data).unwrap();
        a.dd(7);
        let image = a.finalize().unwrap();
        // mov eax, [0x400007]
        assert_eq!(
            image.bytes(),
            &[0x8B, 0x05, 0x07, 0x00, 0x40, 0x00, 0xC3, 7, 0, 0, 0]
        );
    }

    #[test]
    fn rel8_window_boundary() {
        let mut a = asm();
        let top = a.new_label();
        a.bind(top).unwrap();
        for _ in 0..126 {
            a.emit(Mnemonic::Nop, &[]).unwrap();
        }
        // disp = 0 - (126 + 2) = -128: still fits.
        a.emit(Mnemonic::Jmp, &[top.into()]).unwrap();
        assert_eq!(a.code()[126], 0xEB);
        // One byte further back the short form no longer matches.
        let mut b = asm();
        let top = b.new_label();
        b.bind(top).unwrap();
        for _ in 0..127 {
            b.emit(Mnemonic::Nop, &[]).unwrap();
        }
        b.emit(Mnemonic::Jmp, &[top.into()]).unwrap();
        assert_eq!(b.code()[127], 0xE9);
    }

    #[test]
    fn lea_and_movzx() {
        let m = Mem::base_index(Register::Rax, Register::Rcx, 8).unwrap();
        assert_eq!(
            emit_one(Mnemonic::Lea, &[Register::Rdx.into(), m.into()]),
            [0x48, 0x8D, 0x14, 0xC8]
        );
        assert_eq!(
            emit_one(Mnemonic::Movzx, &[Register::Eax.into(), Register::Cl.into()]),
            [0x0F, 0xB6, 0xC1]
        );
    }

    #[test]
    fn xmm_moves() {
        assert_eq!(
            emit_one(Mnemonic::Movq, &[Register::Xmm0.into(), Register::Rax.into()]),
            [0x66, 0x48, 0x0F, 0x6E, 0xC0]
        );
        assert_eq!(
            emit_one(
                Mnemonic::Addsd,
                &[Register::Xmm1.into(), Register::Xmm2.into()]
            ),
            [0xF2, 0x0F, 0x58, 0xCA]
        );
    }

    #[test]
    fn imm_sizes_pin_down_trailing_bytes() {
        // jcc rel32 followed by nothing: trailing must be 0 even though
        // the reloc sits mid-instruction for mem labels.
        let mut a = asm();
        let l = a.new_label();
        let m = Mem::label(l);
        // cmp dword [l], 5 : disp32 reloc followed by imm8
        a.emit(Mnemonic::Cmp, &[Operand::Mem(m.width(crate::operand::Width::Dword)), Operand::Imm(5)])
            .unwrap();
        a.bind(l).unwrap();
        a.dd(5);
        let image = a.finalize().unwrap();
        // 83 3D disp32 05; rip = end of instruction = offset 7.
        // target 7 → disp 0.
        assert_eq!(image.bytes(), &[0x83, 0x3D, 0, 0, 0, 0, 0x05, 5, 0, 0, 0]);
    }
}
