use super::Cursor;
use crate::error::EncodeError;
use crate::isa::{encode, BranchCond, Reg, X0};

/// Chooses the shortest encoding that reaches `target`: C.J (±2KiB) first,
/// then JAL (±1MiB). Returns the emitted size in bytes, or an error if the
/// target is unreachable by either form (the caller should fall back to
/// `emit_large_jump`).
pub fn emit_branch(c: &mut Cursor, target: u64) -> Result<usize, EncodeError> {
    let disp = target as i64 - c.addr() as i64;
    if let Ok(n) = c.emit(|b| encode::encode_cj(b, disp)) {
        return Ok(n);
    }
    c.emit(|b| encode::encode_jal(b, X0, disp))
}

/// Conditional exit. Prefers C.BEQZ/C.BNEZ when `cond` is an equality test
/// against `x0` with a compressed-class register and the short displacement
/// fits; otherwise a 32-bit B-type; otherwise an inverted-condition branch
/// over a large-jump sequence (§8 boundary behaviour), which always reaches.
pub fn emit_branch_cond(
    c: &mut Cursor,
    target: u64,
    cond: BranchCond,
    rs1: Reg,
    rs2: Reg,
) -> Result<usize, EncodeError> {
    let disp = target as i64 - c.addr() as i64;

    if rs2 == X0 && matches!(cond, BranchCond::Eq | BranchCond::Ne) {
        if let Ok(n) = c.emit(|b| encode::encode_compressed_branch_z(b, cond, rs1, disp)) {
            return Ok(n);
        }
    }

    if let Ok(n) = c.emit(|b| encode::encode_branch(b, cond, rs1, rs2, disp)) {
        return Ok(n);
    }

    // Out of B-type range: branch on the inverted condition over a fixed
    // 8-byte large-jump sequence (AUIPC+JALR), landing just past it when
    // the original condition is false, and falling into the large jump
    // when it's true.
    let start = c.pos();
    c.emit(|b| encode::encode_branch(b, cond.inverted(), rs1, rs2, 8))?;
    emit_large_jump(c, target, X0, 5)?;
    Ok(c.pos() - start)
}

/// `reg == 0` exit, preferring the compressed form.
pub fn emit_branch_cbz(c: &mut Cursor, target: u64, reg: Reg) -> Result<usize, EncodeError> {
    emit_branch_cond(c, target, BranchCond::Eq, reg, X0)
}

/// `reg != 0` exit, preferring the compressed form.
pub fn emit_branch_cbnz(c: &mut Cursor, target: u64, reg: Reg) -> Result<usize, EncodeError> {
    emit_branch_cond(c, target, BranchCond::Ne, reg, X0)
}

/// Arbitrary 64-bit-reachable jump: `AUIPC tmp, hi ; JALR link, lo(tmp)`.
/// Valid whenever the PC-relative offset fits in 32 bits after the
/// sign-correcting +0x800 bias (§4.2); fails (emitting nothing) otherwise.
pub fn emit_large_jump(c: &mut Cursor, target: u64, link: Reg, tmp_reg: Reg) -> Result<usize, EncodeError> {
    let disp = target as i64 - c.addr() as i64;
    let biased = disp.wrapping_add(0x800);
    if biased < i32::MIN as i64 || biased > i32::MAX as i64 {
        return Err(EncodeError::DisplacementOutOfRange);
    }
    let hi = (biased as i32) & !0xFFF;
    let lo = disp - hi as i64;
    debug_assert!(lo >= -2048 && lo <= 2047);

    let start = c.pos();
    c.emit(|b| encode::encode_auipc(b, tmp_reg, hi as i64))?;
    c.emit(|b| encode::encode_jalr(b, link, tmp_reg, lo))?;
    Ok(c.pos() - start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::{decode, Mnemonic, A0, RA};

    #[test]
    fn short_forward_branch_uses_compressed_jump() {
        let mut buf = [0u8; 8];
        let mut c = Cursor::new(&mut buf, 0x1000);
        let n = emit_branch(&mut c, 0x1010).unwrap();
        assert_eq!(n, 2);
    }

    #[test]
    fn far_branch_uses_jal() {
        let mut buf = [0u8; 8];
        let mut c = Cursor::new(&mut buf, 0x1000);
        let n = emit_branch(&mut c, 0x1000 + 4000).unwrap();
        assert_eq!(n, 4);
    }

    #[test]
    fn boundary_2046_is_compressed_2048_is_full() {
        let mut buf = [0u8; 8];
        let mut c = Cursor::new(&mut buf, 0x2000);
        assert_eq!(emit_branch(&mut c, 0x2000 + 2046).unwrap(), 2);

        let mut buf2 = [0u8; 8];
        let mut c2 = Cursor::new(&mut buf2, 0x2000);
        assert_eq!(emit_branch(&mut c2, 0x2000 + 2048).unwrap(), 4);
    }

    #[test]
    fn large_jump_round_trips_through_decode() {
        let mut buf = [0u8; 16];
        let target = 0x8000_0000_1234u64;
        let mut c = Cursor::new(&mut buf, 0x8000_0000_0000);
        emit_large_jump(&mut c, target, RA, 5).unwrap();
        let d1 = decode::decode(&buf[0..4], 0);
        assert_eq!(d1.mnemonic, Mnemonic::Auipc);
        let d2 = decode::decode(&buf[4..8], 0);
        assert_eq!(d2.mnemonic, Mnemonic::Jalr);
        assert_eq!(d2.fields.rd, RA);
        let computed = c.pc
            + 0
            + d1.fields.imm as u64
            + d2.fields.imm as u64;
        assert_eq!(computed, target);
    }

    #[test]
    fn far_conditional_branch_falls_back_to_inverted_large_jump() {
        let mut buf = [0u8; 16];
        let mut c = Cursor::new(&mut buf, 0x1000);
        let n = emit_branch_cond(&mut c, 0x1000 + 1_000_000, BranchCond::Eq, A0, X0).unwrap();
        assert_eq!(n, 4 + 8); // inverted branch + auipc + jalr
    }
}
