use super::Cursor;
use crate::error::EncodeError;
use crate::isa::{encode, Reg};

/// Materializes an arbitrary 64-bit constant into `rd`.
///
/// Values that fit a 32-bit sign-extended immediate (the common case for
/// small displacements and guest addresses in the lower 4GiB) use
/// `LUI+ADDI`. Anything wider is laid down as an 8-byte inline literal just
/// past a skip-jump, and loaded with a PC-relative `LD` — the same
/// AUIPC-free trick the scanner also relies on to keep exit stubs
/// position-independent within a code-cache slot (§4.3).
pub fn emit_set_reg(c: &mut Cursor, rd: Reg, imm: i64) -> Result<usize, EncodeError> {
    if fits_lui_addi(imm) {
        return emit_set_reg_32(c, rd, imm);
    }
    emit_set_reg_64(c, rd, imm)
}

/// `rd = rs1 + imm` for a 12-bit signed `imm`, straight through to a single
/// ADDI. Used to recover an effective memory address from a base register
/// and a load/store displacement without disturbing `rs1` itself.
pub fn emit_addi(c: &mut Cursor, rd: Reg, rs1: Reg, imm: i64) -> Result<usize, EncodeError> {
    c.emit(|b| encode::encode_addi(b, rd, rs1, imm))
}

fn fits_lui_addi(imm: i64) -> bool {
    imm >= i32::MIN as i64 && imm <= i32::MAX as i64
}

fn emit_set_reg_32(c: &mut Cursor, rd: Reg, imm: i64) -> Result<usize, EncodeError> {
    let start = c.pos();
    let low = (imm << 52) >> 52; // sign-extended low 12 bits
    let hi = imm - low;
    if hi == 0 {
        c.emit(|b| encode::encode_addi(b, rd, crate::isa::X0, low))?;
    } else {
        c.emit(|b| encode::encode_lui(b, rd, hi))?;
        if low != 0 {
            c.emit(|b| encode::encode_addi(b, rd, rd, low))?;
        }
    }
    Ok(c.pos() - start)
}

/// `AUIPC+LD` over an 8-byte literal, with a `JAL` skipping the literal so
/// control never falls into it as data.
fn emit_set_reg_64(c: &mut Cursor, rd: Reg, imm: i64) -> Result<usize, EncodeError> {
    let start = c.pos();
    // AUIPC rd, 0   (rd now holds the address of this instruction)
    c.emit(|b| encode::encode_auipc(b, rd, 0))?;
    // JAL x0, +16   (skip over the LD and the 8-byte literal)
    c.emit(|b| encode::encode_jal(b, crate::isa::X0, 16))?;
    // LD rd, 8(rd)  (literal sits 8 bytes after the AUIPC, i.e. 4 bytes after
    // this LD)
    c.emit(|b| encode::encode_ld(b, rd, rd, 8))?;
    let lit_at = c.pos();
    c.patch(lit_at, |b| {
        if b.len() < 8 {
            return Err(EncodeError::DisplacementOutOfRange);
        }
        b[0..8].copy_from_slice(&(imm as u64).to_le_bytes());
        Ok(8)
    })?;
    // manually advance past the literal since `patch` doesn't move the cursor
    c.skip(8);
    Ok(c.pos() - start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::A0;

    #[test]
    fn small_immediate_uses_addi_only() {
        let mut buf = [0u8; 32];
        let mut c = Cursor::new(&mut buf, 0x1000);
        let n = emit_set_reg(&mut c, A0, 5).unwrap();
        assert_eq!(n, 4);
    }

    #[test]
    fn mid_range_immediate_uses_lui_addi() {
        let mut buf = [0u8; 32];
        let mut c = Cursor::new(&mut buf, 0x1000);
        let n = emit_set_reg(&mut c, A0, 0x12345678).unwrap();
        assert_eq!(n, 8);
    }

    #[test]
    fn wide_immediate_uses_inline_literal() {
        let mut buf = [0u8; 32];
        let mut c = Cursor::new(&mut buf, 0x1000);
        let n = emit_set_reg(&mut c, A0, 0x1234_5678_9abc_def0u64 as i64).unwrap();
        assert_eq!(n, 20); // auipc + jal + ld + 8-byte literal
        let lit = u64::from_le_bytes(c.bytes_written()[12..20].try_into().unwrap());
        assert_eq!(lit, 0x1234_5678_9abc_def0);
    }
}
