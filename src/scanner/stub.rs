//! Exit stub builders (§4.4 "Exit stubs"). Every shape ends up
//! observationally equivalent to "ensure {x10=target_spc, x11=block_id},
//! then transfer to the dispatcher"; only the path there differs.

use crate::emit::{
    emit_large_jump, emit_push, emit_set_reg, BranchHandle, Cursor, RegMask, Reservations,
};
use crate::error::EncodeError;
use crate::isa::{encode, BranchCond, Reg, A0, A1, A2, T6, X0};

/// The three scratch registers an exit stub always spills before handing
/// control to the dispatcher.
fn stub_scratch_mask() -> RegMask {
    RegMask::of(&[A0, A1, A2])
}

/// `uncond_imm` exit (§4.4): one reserved placeholder for future linking,
/// then the dispatcher call. Returns the handle the dispatcher later
/// overwrites with a direct jump once it's resolved the target.
pub fn emit_uncond_imm_stub(
    c: &mut Cursor,
    reservations: &mut Reservations,
    target_spc: u64,
    fragment_id: usize,
    dispatcher_addr: u64,
) -> Result<(usize, BranchHandle), EncodeError> {
    let start = c.pos();
    let handle = reservations.reserve(c)?;
    emit_push(c, stub_scratch_mask())?;
    emit_set_reg(c, A0, target_spc as i64)?;
    emit_set_reg(c, A1, fragment_id as i64)?;
    emit_large_jump(c, dispatcher_addr, X0, T6)?;
    Ok((c.pos() - start, handle))
}

/// `cond_imm` exit (§4.4): two reserved placeholders (one per side, linked
/// independently as each side is first taken) around a shared dispatcher
/// tail.
pub struct CondImmStub {
    pub bytes_written: usize,
    /// Placeholder for the fallthrough (condition-false) side.
    pub skipped_handle: BranchHandle,
    /// Placeholder for the taken (condition-true) side.
    pub taken_handle: BranchHandle,
    /// The tail's `large_jump` to the dispatcher, overwritten once both
    /// sides have linked (it is unreachable after that point).
    pub dispatcher_call_handle: BranchHandle,
}

pub fn emit_cond_imm_stub(
    c: &mut Cursor,
    reservations: &mut Reservations,
    cond: BranchCond,
    rs1: Reg,
    rs2: Reg,
    fallthrough_spc: u64,
    taken_spc: u64,
    fragment_id: usize,
    dispatcher_addr: u64,
) -> Result<CondImmStub, EncodeError> {
    let start = c.pos();

    let skipped_handle = reservations.reserve(c)?;
    let taken_handle = reservations.reserve(c)?;

    emit_push(c, stub_scratch_mask())?;

    // Retarget the original condition to skip the next (fallthrough) `li`
    // when true, landing on the taken-side `li` below.
    let branch_at = c.pos();
    c.emit(|b| encode::encode_branch(b, cond, rs1, rs2, 0))?; // patched below once we know the real offset

    emit_set_reg(c, A0, fallthrough_spc as i64)?;
    let to_tail = reservations.reserve(c)?;

    let taken_label = c.addr();
    emit_set_reg(c, A0, taken_spc as i64)?;

    let tail = c.addr();
    reservations.resolve(c, to_tail, tail)?;
    emit_set_reg(c, A1, fragment_id as i64)?;
    let dispatcher_call_handle = BranchHandle::at_pos(c.pos(), c.addr());
    emit_large_jump(c, dispatcher_addr, X0, T6)?;

    // Now that the taken-side `li` address is known, patch the retargeted
    // branch to jump exactly there.
    let branch_target_disp = taken_label as i64 - branch_at as i64;
    c.patch(branch_at, |b| encode::encode_branch(b, cond, rs1, rs2, branch_target_disp))?;

    Ok(CondImmStub {
        bytes_written: c.pos() - start,
        skipped_handle,
        taken_handle,
        dispatcher_call_handle,
    })
}

/// `uncond_reg`, non-inline-hash path (§4.4): no direct linking is
/// possible, so this is just a dispatcher call with the computed target.
pub fn emit_indirect_stub(
    c: &mut Cursor,
    rs1: Reg,
    imm: i64,
    fragment_id: usize,
    dispatcher_addr: u64,
) -> Result<usize, EncodeError> {
    let start = c.pos();
    emit_push(c, stub_scratch_mask())?;
    c.emit(|b| encode::encode_addi(b, A0, rs1, imm))?;
    emit_set_reg(c, A1, fragment_id as i64)?;
    emit_large_jump(c, dispatcher_addr, X0, T6)?;
    Ok(c.pos() - start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::decode;

    #[test]
    fn uncond_imm_stub_reserves_one_placeholder() {
        let mut buf = [0u8; 64];
        let mut c = Cursor::new(&mut buf, 0x1000);
        let mut r = Reservations::new();
        let (n, _handle) = emit_uncond_imm_stub(&mut c, &mut r, 0x9000, 3, 0x4000).unwrap();
        assert!(n > 0);
        assert!(r.seal().is_err()); // still unresolved
    }

    #[test]
    fn cond_imm_stub_reserves_two_placeholders_and_seals_after_resolution() {
        let mut buf = [0u8; 96];
        let mut c = Cursor::new(&mut buf, 0x1000);
        let mut r = Reservations::new();
        let stub = emit_cond_imm_stub(
            &mut c,
            &mut r,
            BranchCond::Eq,
            A0,
            X0,
            0x1010,
            0x2000,
            7,
            0x4000,
        )
        .unwrap();
        assert!(stub.bytes_written > 0);
        r.resolve(&mut c, stub.skipped_handle, 0x5000).unwrap();
        r.resolve(&mut c, stub.taken_handle, 0x5008).unwrap();
        assert!(r.seal().is_ok());
    }

    #[test]
    fn indirect_stub_has_no_reservations() {
        let mut buf = [0u8; 64];
        let mut c = Cursor::new(&mut buf, 0x1000);
        let n = emit_indirect_stub(&mut c, A1, 0, 9, 0x4000).unwrap();
        assert!(n > 0);
        let d = decode::decode(&buf[8..12], 0); // past the 8-byte push
        let _ = d;
    }
}
