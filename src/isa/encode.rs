//! Pure encode: `encode_<mnemonic>(write_p, fields…)` (C1). Each function
//! writes its instruction's bytes into the front of the given slice and
//! returns the number of bytes written, or an `EncodeError` if the supplied
//! fields don't fit the form (the caller — emit, C2 — decides whether to
//! retry with a wider encoding).

use super::fields::*;
use crate::error::EncodeError;
use bit_field::BitField;

type Res = Result<usize, EncodeError>;

fn put32(buf: &mut [u8], word: u32) -> Res {
    if buf.len() < 4 {
        return Err(EncodeError::DisplacementOutOfRange);
    }
    buf[0..4].copy_from_slice(&word.to_le_bytes());
    Ok(4)
}

fn put16(buf: &mut [u8], half: u16) -> Res {
    if buf.len() < 2 {
        return Err(EncodeError::DisplacementOutOfRange);
    }
    buf[0..2].copy_from_slice(&half.to_le_bytes());
    Ok(2)
}

fn fits_signed(v: i64, bits: u32) -> bool {
    let lo = -(1i64 << (bits - 1));
    let hi = (1i64 << (bits - 1)) - 1;
    v >= lo && v <= hi
}

fn check_reg(r: Reg) -> Result<(), EncodeError> {
    if r > 31 {
        Err(EncodeError::InvalidRegisterClass)
    } else {
        Ok(())
    }
}

/// Returns `true` if `r` is addressable by the compressed register field
/// (x8..x15), used by C.BEQZ/C.BNEZ.
fn is_compressed_reg(r: Reg) -> bool {
    (8..=15).contains(&r)
}

fn r_type(funct7: u32, rs2: Reg, rs1: Reg, funct3: u32, rd: Reg, opcode: u32) -> u32 {
    let mut w = 0u32;
    w.set_bits(25..32, funct7);
    w.set_bits(20..25, rs2 as u32);
    w.set_bits(15..20, rs1 as u32);
    w.set_bits(12..15, funct3);
    w.set_bits(7..12, rd as u32);
    w.set_bits(0..7, opcode);
    w
}

fn i_type(imm: i64, rs1: Reg, funct3: u32, rd: Reg, opcode: u32) -> Result<u32, EncodeError> {
    if !fits_signed(imm, 12) {
        return Err(EncodeError::DisplacementOutOfRange);
    }
    let mut w = 0u32;
    w.set_bits(20..32, (imm as u32) & 0xFFF);
    w.set_bits(15..20, rs1 as u32);
    w.set_bits(12..15, funct3);
    w.set_bits(7..12, rd as u32);
    w.set_bits(0..7, opcode);
    Ok(w)
}

fn s_type(imm: i64, rs2: Reg, rs1: Reg, funct3: u32, opcode: u32) -> Result<u32, EncodeError> {
    if !fits_signed(imm, 12) {
        return Err(EncodeError::DisplacementOutOfRange);
    }
    let imm = imm as u32;
    let mut w = 0u32;
    w.set_bits(25..32, imm.get_bits(5..12));
    w.set_bits(20..25, rs2 as u32);
    w.set_bits(15..20, rs1 as u32);
    w.set_bits(12..15, funct3);
    w.set_bits(7..12, imm.get_bits(0..5));
    w.set_bits(0..7, opcode);
    Ok(w)
}

fn u_type(imm20: i64, rd: Reg, opcode: u32) -> Result<u32, EncodeError> {
    // Caller passes the already-shifted upper-20-bits value (bits 31..12);
    // the low 12 bits must be zero.
    if imm20 & 0xFFF != 0 {
        return Err(EncodeError::DisplacementOutOfRange);
    }
    let mut w = 0u32;
    w.set_bits(12..32, ((imm20 as u32) >> 12) & 0xFFFFF);
    w.set_bits(7..12, rd as u32);
    w.set_bits(0..7, opcode);
    Ok(w)
}

fn j_type(imm: i64, rd: Reg, opcode: u32) -> Result<u32, EncodeError> {
    if !fits_signed(imm, 21) || imm & 1 != 0 {
        return Err(EncodeError::DisplacementOutOfRange);
    }
    let v = imm as u32;
    let mut w = 0u32;
    w.set_bits(12..20, v.get_bits(12..20));
    w.set_bits(20..21, v.get_bits(11..12));
    w.set_bits(21..31, v.get_bits(1..11));
    w.set_bits(31..32, v.get_bits(20..21));
    w.set_bits(7..12, rd as u32);
    w.set_bits(0..7, opcode);
    Ok(w)
}

fn b_type(imm: i64, rs1: Reg, rs2: Reg, funct3: u32, opcode: u32) -> Result<u32, EncodeError> {
    if !fits_signed(imm, 13) || imm & 1 != 0 {
        return Err(EncodeError::DisplacementOutOfRange);
    }
    let v = imm as u32;
    let mut w = 0u32;
    w.set_bits(7..8, v.get_bits(11..12));
    w.set_bits(8..12, v.get_bits(1..5));
    w.set_bits(25..31, v.get_bits(5..11));
    w.set_bits(31..32, v.get_bits(12..13));
    w.set_bits(20..25, rs2 as u32);
    w.set_bits(15..20, rs1 as u32);
    w.set_bits(12..15, funct3);
    w.set_bits(0..7, opcode);
    Ok(w)
}

/// ADDI x0, x0, 0 — the canonical 4-byte NOP used for reserved placeholders.
pub fn encode_nop(buf: &mut [u8]) -> Res {
    let w = i_type(0, X0, 0, X0, 0b0010011)?;
    put32(buf, w)
}

/// C.NOP — the 2-byte NOP form.
pub fn encode_c_nop(buf: &mut [u8]) -> Res {
    put16(buf, 0x0001)
}

pub fn encode_jal(buf: &mut [u8], rd: Reg, imm: i64) -> Res {
    check_reg(rd)?;
    let w = j_type(imm, rd, 0b1101111)?;
    put32(buf, w)
}

/// C.J: unconditional compressed jump, no link (imm within ±2KiB, even).
pub fn encode_cj(buf: &mut [u8], imm: i64) -> Res {
    if !fits_signed(imm, 12) || imm & 1 != 0 {
        return Err(EncodeError::DisplacementOutOfRange);
    }
    let v = imm as u32;
    let mut w = 0u32;
    w.set_bits(13..16, 0b101);
    w.set_bits(2..3, v.get_bits(5..6));
    w.set_bits(3..6, v.get_bits(1..4));
    w.set_bits(6..7, v.get_bits(7..8));
    w.set_bits(7..8, v.get_bits(6..7));
    w.set_bits(8..9, v.get_bits(10..11));
    w.set_bits(9..11, v.get_bits(8..10));
    w.set_bits(11..12, v.get_bits(4..5));
    w.set_bits(12..13, v.get_bits(11..12));
    w.set_bits(0..2, 0b01);
    put16(buf, w as u16)
}

pub fn encode_jalr(buf: &mut [u8], rd: Reg, rs1: Reg, imm: i64) -> Res {
    check_reg(rd)?;
    check_reg(rs1)?;
    let w = i_type(imm, rs1, 0, rd, 0b1100111)?;
    put32(buf, w)
}

/// C.JR (`imm`/link implied 0, `rd=x0`) or C.JALR (`rd=x1`), chosen by `link`.
pub fn encode_cjr_or_cjalr(buf: &mut [u8], rs1: Reg, link: bool) -> Res {
    if rs1 == 0 {
        return Err(EncodeError::InvalidRegisterClass);
    }
    let mut w = 0u32;
    w.set_bits(13..16, 0b100);
    w.set_bits(12..13, if link { 1 } else { 0 });
    w.set_bits(7..12, rs1 as u32);
    w.set_bits(2..7, 0);
    w.set_bits(0..2, 0b10);
    put16(buf, w as u16)
}

pub fn encode_branch(buf: &mut [u8], cond: BranchCond, rs1: Reg, rs2: Reg, imm: i64) -> Res {
    check_reg(rs1)?;
    check_reg(rs2)?;
    let w = b_type(imm, rs1, rs2, cond.funct3(), 0b1100011)?;
    put32(buf, w)
}

/// C.BEQZ / C.BNEZ. Only `Eq`/`Ne` are valid; `rs1` must be x8..x15.
pub fn encode_compressed_branch_z(buf: &mut [u8], cond: BranchCond, rs1: Reg, imm: i64) -> Res {
    if !matches!(cond, BranchCond::Eq | BranchCond::Ne) {
        return Err(EncodeError::InvalidRegisterClass);
    }
    if !is_compressed_reg(rs1) {
        return Err(EncodeError::InvalidRegisterClass);
    }
    if !fits_signed(imm, 9) || imm & 1 != 0 {
        return Err(EncodeError::DisplacementOutOfRange);
    }
    let v = imm as u32;
    let mut w = 0u32;
    w.set_bits(
        13..16,
        if cond == BranchCond::Eq {
            0b110
        } else {
            0b111
        },
    );
    w.set_bits(10..13, (rs1 as u32) - 8);
    w.set_bits(2..3, v.get_bits(5..6));
    w.set_bits(3..5, v.get_bits(1..3));
    w.set_bits(5..7, v.get_bits(6..8));
    w.set_bits(10..12, v.get_bits(3..5));
    w.set_bits(12..13, v.get_bits(8..9));
    w.set_bits(0..2, 0b01);
    put16(buf, w as u16)
}

pub fn encode_auipc(buf: &mut [u8], rd: Reg, imm20: i64) -> Res {
    check_reg(rd)?;
    let w = u_type(imm20, rd, 0b0010111)?;
    put32(buf, w)
}

pub fn encode_lui(buf: &mut [u8], rd: Reg, imm20: i64) -> Res {
    check_reg(rd)?;
    let w = u_type(imm20, rd, 0b0110111)?;
    put32(buf, w)
}

pub fn encode_addi(buf: &mut [u8], rd: Reg, rs1: Reg, imm: i64) -> Res {
    check_reg(rd)?;
    check_reg(rs1)?;
    let w = i_type(imm, rs1, 0, rd, 0b0010011)?;
    put32(buf, w)
}

pub fn encode_ld(buf: &mut [u8], rd: Reg, rs1: Reg, imm: i64) -> Res {
    check_reg(rd)?;
    check_reg(rs1)?;
    let w = i_type(imm, rs1, 0b011, rd, 0b0000011)?;
    put32(buf, w)
}

/// `LW rd, imm(rs1)` — plain, non-reserving 32-bit sign-extending load.
pub fn encode_lw(buf: &mut [u8], rd: Reg, rs1: Reg, imm: i64) -> Res {
    check_reg(rd)?;
    check_reg(rs1)?;
    let w = i_type(imm, rs1, 0b010, rd, 0b0000011)?;
    put32(buf, w)
}

pub fn encode_sd(buf: &mut [u8], rs2: Reg, rs1: Reg, imm: i64) -> Res {
    check_reg(rs2)?;
    check_reg(rs1)?;
    let w = s_type(imm, rs2, rs1, 0b011, 0b0100011)?;
    put32(buf, w)
}

pub fn encode_add(buf: &mut [u8], rd: Reg, rs1: Reg, rs2: Reg) -> Res {
    check_reg(rd)?;
    check_reg(rs1)?;
    check_reg(rs2)?;
    put32(buf, r_type(0b0000000, rs2, rs1, 0b000, rd, 0b0110011))
}

pub fn encode_and(buf: &mut [u8], rd: Reg, rs1: Reg, rs2: Reg) -> Res {
    check_reg(rd)?;
    check_reg(rs1)?;
    check_reg(rs2)?;
    put32(buf, r_type(0b0000000, rs2, rs1, 0b111, rd, 0b0110011))
}

/// `SLLI rd, rs1, shamt` (RV64: 6-bit shift amount).
pub fn encode_slli(buf: &mut [u8], rd: Reg, rs1: Reg, shamt: u32) -> Res {
    check_reg(rd)?;
    check_reg(rs1)?;
    if shamt >= 64 {
        return Err(EncodeError::DisplacementOutOfRange);
    }
    let mut w = 0u32;
    w.set_bits(26..32, 0);
    w.set_bits(20..26, shamt);
    w.set_bits(15..20, rs1 as u32);
    w.set_bits(12..15, 0b001);
    w.set_bits(7..12, rd as u32);
    w.set_bits(0..7, 0b0010011);
    put32(buf, w)
}

pub fn encode_ecall(buf: &mut [u8]) -> Res {
    put32(buf, 0x0000_0073)
}

fn amo(funct5: u32, width: u32, rs2: Reg, rs1: Reg, rd: Reg) -> u32 {
    // aq=rl=0 for our purposes; the engine's LR/SC rewrite doesn't need the
    // stronger orderings the guest's own aq/rl bits would request, since we
    // preserve the architectural pairing, not raw memory ordering.
    r_type(funct5 << 2, rs2, rs1, width, rd, 0b0101111)
}

pub fn encode_lr_w(buf: &mut [u8], rd: Reg, rs1: Reg) -> Res {
    check_reg(rd)?;
    check_reg(rs1)?;
    put32(buf, amo(0b00010, 0b010, 0, rs1, rd))
}

pub fn encode_lr_d(buf: &mut [u8], rd: Reg, rs1: Reg) -> Res {
    check_reg(rd)?;
    check_reg(rs1)?;
    put32(buf, amo(0b00010, 0b011, 0, rs1, rd))
}

pub fn encode_sc_w(buf: &mut [u8], rd: Reg, rs2: Reg, rs1: Reg) -> Res {
    check_reg(rd)?;
    check_reg(rs2)?;
    check_reg(rs1)?;
    put32(buf, amo(0b00011, 0b010, rs2, rs1, rd))
}

pub fn encode_sc_d(buf: &mut [u8], rd: Reg, rs2: Reg, rs1: Reg) -> Res {
    check_reg(rd)?;
    check_reg(rs2)?;
    check_reg(rs1)?;
    put32(buf, amo(0b00011, 0b011, rs2, rs1, rd))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nop_is_addi_zero() {
        let mut buf = [0u8; 4];
        encode_nop(&mut buf).unwrap();
        assert_eq!(u32::from_le_bytes(buf), 0x0000_0013);
    }

    #[test]
    fn jal_rejects_odd_or_oversized_imm() {
        let mut buf = [0u8; 4];
        assert!(encode_jal(&mut buf, RA, 1).is_err());
        assert!(encode_jal(&mut buf, RA, 1 << 21).is_err());
        assert!(encode_jal(&mut buf, RA, (1 << 20) - 2).is_ok());
    }

    #[test]
    fn compressed_branch_rejects_non_compressed_register() {
        let mut buf = [0u8; 2];
        assert!(encode_compressed_branch_z(&mut buf, BranchCond::Eq, 20, 4).is_err());
        assert!(encode_compressed_branch_z(&mut buf, BranchCond::Eq, 9, 4).is_ok());
    }

    #[test]
    fn auipc_rejects_misaligned_imm20() {
        let mut buf = [0u8; 4];
        assert!(encode_auipc(&mut buf, A0, 0x1001).is_err());
        assert!(encode_auipc(&mut buf, A0, 0x1000).is_ok());
    }
}
