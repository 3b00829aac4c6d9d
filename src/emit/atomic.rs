//! LR/SC and raw-copy helpers (§4.4 "Atomics"). Kept separate from `reg.rs`
//! since these wrap single instructions rather than multi-instruction
//! sequences, but still need `Cursor::emit`'s private bookkeeping.

use super::Cursor;
use crate::error::EncodeError;
use crate::isa::{encode, BranchCond, Reg};

pub fn emit_lr_w(c: &mut Cursor, rd: Reg, rs1: Reg) -> Result<usize, EncodeError> {
    c.emit(|b| encode::encode_lr_w(b, rd, rs1))
}

pub fn emit_lr_d(c: &mut Cursor, rd: Reg, rs1: Reg) -> Result<usize, EncodeError> {
    c.emit(|b| encode::encode_lr_d(b, rd, rs1))
}

pub fn emit_sc_w(c: &mut Cursor, rd: Reg, rs2: Reg, rs1: Reg) -> Result<usize, EncodeError> {
    c.emit(|b| encode::encode_sc_w(b, rd, rs2, rs1))
}

pub fn emit_sc_d(c: &mut Cursor, rd: Reg, rs2: Reg, rs1: Reg) -> Result<usize, EncodeError> {
    c.emit(|b| encode::encode_sc_d(b, rd, rs2, rs1))
}

pub fn emit_addi(c: &mut Cursor, rd: Reg, rs1: Reg, imm: i64) -> Result<usize, EncodeError> {
    c.emit(|b| encode::encode_addi(b, rd, rs1, imm))
}

pub fn emit_add(c: &mut Cursor, rd: Reg, rs1: Reg, rs2: Reg) -> Result<usize, EncodeError> {
    c.emit(|b| encode::encode_add(b, rd, rs1, rs2))
}

pub fn emit_and(c: &mut Cursor, rd: Reg, rs1: Reg, rs2: Reg) -> Result<usize, EncodeError> {
    c.emit(|b| encode::encode_and(b, rd, rs1, rs2))
}

pub fn emit_slli(c: &mut Cursor, rd: Reg, rs1: Reg, shamt: u32) -> Result<usize, EncodeError> {
    c.emit(|b| encode::encode_slli(b, rd, rs1, shamt))
}

pub fn emit_ld(c: &mut Cursor, rd: Reg, rs1: Reg, imm: i64) -> Result<usize, EncodeError> {
    c.emit(|b| encode::encode_ld(b, rd, rs1, imm))
}

/// Plain, non-reserving 32-bit load — what `LR.W` actually translates to
/// (§4.4): the reservation itself is architecturally invisible once the
/// matching `SC` is rewritten into a reloading `LR.W` + guard, so the first
/// half of the pair only needs to read the value.
pub fn emit_lw(c: &mut Cursor, rd: Reg, rs1: Reg, imm: i64) -> Result<usize, EncodeError> {
    c.emit(|b| encode::encode_lw(b, rd, rs1, imm))
}

/// `JALR rd, imm(rs1)`; with `rd=x0` this is an unconditional indirect
/// jump (`jr rs1`), used by the inline hash lookup's hit path.
pub fn emit_jalr(c: &mut Cursor, rd: Reg, rs1: Reg, imm: i64) -> Result<usize, EncodeError> {
    c.emit(|b| encode::encode_jalr(b, rd, rs1, imm))
}

/// `BNE rs1, rs2, +imm` — used by the LR/SC rewrite to guard the SC with a
/// reservation check the scanner reissued the LR for (§4.4).
pub fn emit_branch_guard(
    c: &mut Cursor,
    cond: BranchCond,
    rs1: Reg,
    rs2: Reg,
    imm: i64,
) -> Result<usize, EncodeError> {
    c.emit(|b| encode::encode_branch(b, cond, rs1, rs2, imm))
}

/// Re-emits a decoded instruction's original bytes unchanged, for mnemonics
/// the scanner doesn't need to rewrite.
pub fn emit_raw(c: &mut Cursor, raw: u32, length: u8) -> Result<usize, EncodeError> {
    if length == 4 {
        c.emit(|b| {
            if b.len() < 4 {
                return Err(EncodeError::DisplacementOutOfRange);
            }
            b[0..4].copy_from_slice(&raw.to_le_bytes());
            Ok(4)
        })
    } else {
        c.emit(|b| {
            if b.len() < 2 {
                return Err(EncodeError::DisplacementOutOfRange);
            }
            b[0..2].copy_from_slice(&(raw as u16).to_le_bytes());
            Ok(2)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::{decode, Mnemonic, A0, A1};

    #[test]
    fn lr_w_then_sc_w_round_trip_through_decode() {
        let mut buf = [0u8; 16];
        let mut c = Cursor::new(&mut buf, 0x1000);
        emit_lr_w(&mut c, A0, A1).unwrap();
        emit_sc_w(&mut c, A0, A1, A1).unwrap();
        let d1 = decode::decode(&buf[0..4], 0x1000);
        assert_eq!(d1.mnemonic, Mnemonic::LrW);
        let d2 = decode::decode(&buf[4..8], 0x1004);
        assert_eq!(d2.mnemonic, Mnemonic::ScW);
    }

    #[test]
    fn emit_raw_preserves_original_bytes() {
        let mut buf = [0u8; 8];
        let mut c = Cursor::new(&mut buf, 0x1000);
        emit_raw(&mut c, 0xdead_beef, 4).unwrap();
        assert_eq!(&buf[0..4], &0xdead_beefu32.to_le_bytes());
    }
}
