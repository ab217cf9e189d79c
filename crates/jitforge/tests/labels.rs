//! Label binding, relocation patching, and finalize semantics.

#![cfg(feature = "x86_64")]

use jitforge::{Assembler, Cc, JitError, Mem, Mnemonic, Mode, Operand, Register, Width};

fn r(reg: Register) -> Operand {
    Operand::Reg(reg)
}

/// Backward conditional branches within range use the 2-byte short form.
#[test]
fn backward_jcc_short_form() {
    let mut asm = Assembler::new(Mode::Long64);
    let l = asm.new_label();
    asm.bind(l).unwrap();
    asm.emit(Mnemonic::Nop, &[]).unwrap();
    asm.emit(Mnemonic::J(Cc::E), &[l.into()]).unwrap();
    // je . - 3
    assert_eq!(asm.finalize().unwrap().into_bytes(), vec![0x90, 0x74, 0xfd]);
}

/// Forward branches cannot prove rel8 reachability and take rel32.
#[test]
fn forward_jcc_long_form() {
    let mut asm = Assembler::new(Mode::Long64);
    let l = asm.new_label();
    asm.emit(Mnemonic::J(Cc::E), &[l.into()]).unwrap();
    asm.emit(Mnemonic::Nop, &[]).unwrap();
    asm.bind(l).unwrap();
    assert_eq!(
        asm.finalize().unwrap().into_bytes(),
        vec![0x0f, 0x84, 0x01, 0x00, 0x00, 0x00, 0x90]
    );
}

/// A counting loop, byte for byte.
#[test]
fn counting_loop() {
    let mut asm = Assembler::new(Mode::Long64);
    let head = asm.new_label();
    asm.bind(head).unwrap();
    asm.emit(Mnemonic::Dec, &[r(Register::Ecx)]).unwrap();
    asm.emit(Mnemonic::J(Cc::Ne), &[head.into()]).unwrap();
    asm.emit(Mnemonic::Ret, &[]).unwrap();
    // dec ecx; jne . - 4; ret
    assert_eq!(
        asm.finalize().unwrap().into_bytes(),
        vec![0xff, 0xc9, 0x75, 0xfc, 0xc3]
    );
}

/// CALL to a label lands rel32 zero when the target follows immediately.
#[test]
fn call_next_instruction() {
    let mut asm = Assembler::new(Mode::Long64);
    let f = asm.new_label();
    asm.emit(Mnemonic::Call, &[f.into()]).unwrap();
    asm.bind(f).unwrap();
    asm.emit(Mnemonic::Ret, &[]).unwrap();
    assert_eq!(
        asm.finalize().unwrap().into_bytes(),
        vec![0xe8, 0x00, 0x00, 0x00, 0x00, 0xc3]
    );
}

/// The rel8 window is decided per emit: 126 padding bytes still fit the
/// short backward form, 127 no longer do.
#[test]
fn rel8_window_boundary() {
    for (nops, expect_short) in [(126usize, true), (127, false)] {
        let mut asm = Assembler::new(Mode::Long64);
        let l = asm.new_label();
        asm.bind(l).unwrap();
        for _ in 0..nops {
            asm.emit(Mnemonic::Nop, &[]).unwrap();
        }
        asm.emit(Mnemonic::Jmp, &[l.into()]).unwrap();
        let bytes = asm.finalize().unwrap().into_bytes();
        if expect_short {
            assert_eq!(&bytes[nops..], &[0xeb, 0x80]);
        } else {
            assert_eq!(bytes[nops], 0xe9);
        }
    }
}

/// RIP-relative data reference to a label bound after the code.
#[test]
fn rip_relative_data() {
    let mut asm = Assembler::new(Mode::Long64);
    let data = asm.new_label();
    asm.emit(Mnemonic::Mov, &[r(Register::Rax), Mem::label(data).into()])
        .unwrap();
    asm.emit(Mnemonic::Ret, &[]).unwrap();
    asm.bind(data).unwrap();
    asm.dq(0x1122334455667788);
    assert_eq!(
        asm.finalize().unwrap().into_bytes(),
        vec![
            0x48, 0x8b, 0x05, 0x01, 0x00, 0x00, 0x00, // mov rax, [rip+1]
            0xc3, // ret
            0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11,
        ]
    );
}

/// An immediate after the memory operand shifts the relocation target;
/// the displacement must still point at the label.
#[test]
fn reloc_with_trailing_immediate() {
    let mut asm = Assembler::new(Mode::Long64);
    let data = asm.new_label();
    asm.bind(data).unwrap();
    // cmp dword ptr [data], 5 at offset 0: opcode, modrm, disp32, imm8.
    let m = Mem::label(data).width(Width::Dword);
    asm.emit(Mnemonic::Cmp, &[m.into(), Operand::Imm(5)]).unwrap();
    let bytes = asm.finalize().unwrap().into_bytes();
    // disp = 0 - 7 (instruction end) = -7
    assert_eq!(bytes, vec![0x83, 0x3d, 0xf9, 0xff, 0xff, 0xff, 0x05]);
}

/// In 32-bit mode a label memory operand patches to an absolute address
/// from the configured base.
#[cfg(feature = "x86")]
#[test]
fn protected32_absolute_data() {
    let mut asm = Assembler::new(Mode::Protected32);
    asm.set_base_address(0x08048000);
    let data = asm.new_label();
    asm.emit(Mnemonic::Mov, &[r(Register::Eax), Mem::label(data).into()])
        .unwrap();
    asm.emit(Mnemonic::Ret, &[]).unwrap();
    asm.bind(data).unwrap();
    asm.dd(42);
    assert_eq!(
        asm.finalize().unwrap().into_bytes(),
        vec![0x8b, 0x05, 0x07, 0x80, 0x04, 0x08, 0xc3, 42, 0, 0, 0]
    );
}

/// An absolute relocation past the 32-bit range is caught at finalize.
#[cfg(feature = "x86")]
#[test]
fn absolute_overflow_detected() {
    let mut asm = Assembler::new(Mode::Protected32);
    asm.set_base_address(0xFFFF_FFF0);
    let data = asm.new_label();
    asm.emit(Mnemonic::Mov, &[r(Register::Eax), Mem::label(data).into()])
        .unwrap();
    asm.bind(data).unwrap();
    asm.dd(0);
    let err = asm.finalize().unwrap_err();
    assert!(matches!(err, JitError::DisplacementOverflow { .. }));
}

/// Data directives and alignment padding.
#[test]
fn data_and_align() {
    let mut asm = Assembler::new(Mode::Long64);
    asm.db(&[1, 2, 3]);
    asm.align(4);
    assert_eq!(asm.offset(), 4);
    asm.dd(0xAABBCCDD);
    asm.dq(1);
    let bytes = asm.finalize().unwrap().into_bytes();
    assert_eq!(
        bytes,
        vec![1, 2, 3, 0x90, 0xdd, 0xcc, 0xbb, 0xaa, 1, 0, 0, 0, 0, 0, 0, 0]
    );
}

/// Named labels surface in the image's symbol table.
#[test]
fn named_symbols() {
    let mut asm = Assembler::new(Mode::Long64);
    let a = asm.new_named_label("start");
    asm.bind(a).unwrap();
    asm.emit(Mnemonic::Nop, &[]).unwrap();
    let b = asm.new_named_label("after");
    asm.bind(b).unwrap();
    asm.emit(Mnemonic::Ret, &[]).unwrap();
    let image = asm.finalize().unwrap();
    assert_eq!(image.symbol("start"), Some(0));
    assert_eq!(image.symbol("after"), Some(1));
    assert_eq!(image.symbol("missing"), None);
    assert_eq!(image.label_offset(a), Some(0));
}

/// Finalize with an unbound label fails and names the label; the session
/// survives, and binding afterwards repairs it.
#[test]
fn unresolved_label_is_recoverable() {
    let mut asm = Assembler::new(Mode::Long64);
    let l = asm.new_named_label("missing_target");
    asm.emit(Mnemonic::Jmp, &[l.into()]).unwrap();
    match asm.finalize().unwrap_err() {
        JitError::UnresolvedLabel { name, .. } => {
            assert_eq!(name.as_deref(), Some("missing_target"));
        }
        other => panic!("unexpected error: {other}"),
    }
    // The buffer was not patched; emitting and binding still works.
    asm.bind(l).unwrap();
    asm.emit(Mnemonic::Ret, &[]).unwrap();
    let image = asm.finalize().unwrap();
    assert_eq!(image.bytes()[5], 0xc3);
}

/// A label from one assembler is meaningless to another; binding or
/// referencing it reports an error instead of panicking.
#[test]
fn foreign_label_rejected() {
    let mut other = Assembler::new(Mode::Long64);
    other.new_label();
    let foreign = other.new_label();

    let mut asm = Assembler::new(Mode::Long64);
    let err = asm.bind(foreign).unwrap_err();
    assert!(matches!(err, JitError::MalformedOperand { .. }));
    let err = asm.emit(Mnemonic::Jmp, &[foreign.into()]).unwrap_err();
    assert!(matches!(err, JitError::MalformedOperand { .. }));
    let err = asm
        .emit(Mnemonic::Mov, &[r(Register::Rax), Mem::label(foreign).into()])
        .unwrap_err();
    assert!(matches!(err, JitError::MalformedOperand { .. }));
    // The session is still usable.
    assert_eq!(asm.offset(), 0);
    let l = asm.new_label();
    asm.bind(l).unwrap();
    asm.emit(Mnemonic::Ret, &[]).unwrap();
    assert_eq!(asm.finalize().unwrap().into_bytes(), vec![0xc3]);
}

/// Double binding is an error.
#[test]
fn double_bind_rejected() {
    let mut asm = Assembler::new(Mode::Long64);
    let l = asm.new_label();
    asm.bind(l).unwrap();
    asm.emit(Mnemonic::Nop, &[]).unwrap();
    let err = asm.bind(l).unwrap_err();
    assert!(matches!(
        err,
        JitError::LabelAlreadyBound { first_offset: 0, .. }
    ));
}

/// Labels referencing other labels across many instructions patch all
/// relocations independently.
#[test]
fn many_branches_one_target() {
    let mut asm = Assembler::new(Mode::Long64);
    let end = asm.new_label();
    for _ in 0..8 {
        asm.emit(Mnemonic::J(Cc::E), &[end.into()]).unwrap();
    }
    asm.bind(end).unwrap();
    asm.emit(Mnemonic::Ret, &[]).unwrap();
    let bytes = asm.finalize().unwrap().into_bytes();
    // Each je is 6 bytes; the i-th displacement is the distance from its
    // own end to the shared target at offset 48.
    for i in 0..8u32 {
        let off = (i * 6) as usize;
        assert_eq!(bytes[off], 0x0f);
        assert_eq!(bytes[off + 1], 0x84);
        let disp = i32::from_le_bytes(bytes[off + 2..off + 6].try_into().unwrap());
        assert_eq!(disp, 48 - (off as i32 + 6));
    }
    assert_eq!(bytes[48], 0xc3);
}

/// The image records its base address and carries the patched relocation
/// list for inspection.
#[test]
fn image_metadata() {
    let mut asm = Assembler::new(Mode::Long64);
    asm.set_base_address(0x1000);
    let l = asm.new_label();
    asm.emit(Mnemonic::Jmp, &[l.into()]).unwrap();
    asm.bind(l).unwrap();
    asm.emit(Mnemonic::Ret, &[]).unwrap();
    let image = asm.finalize().unwrap();
    assert_eq!(image.base_address(), 0x1000);
    assert_eq!(image.relocations().len(), 1);
    assert_eq!(image.relocations()[0].offset, 1);
}
