use super::{emit_nop, Cursor};
use crate::error::EncodeError;
use crate::isa::{encode, BranchCond, Reg, X0};
use std::collections::HashSet;

/// An outstanding reserved-branch placeholder: a 4-byte NOP sitting at
/// `at` (offset into the slot) whose real target wasn't known yet when the
/// scanner emitted it — typically because it jumps forward to code the
/// scanner hasn't translated yet (§4.2, §4.4).
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub struct BranchHandle {
    at: usize,
    pc: u64,
}

impl BranchHandle {
    /// Absolute address of the placeholder, for callers (the dispatcher)
    /// that need to compute a displacement relative to it without
    /// resolving it immediately.
    pub fn addr(&self) -> u64 {
        self.pc
    }

    /// Wraps an already-emitted instruction's position as a handle, for
    /// patch sites that weren't reserved as a NOP (the `cond_imm` stub's
    /// dispatcher-call tail, overwritten only once both sides are linked).
    pub(crate) fn at_pos(at: usize, pc: u64) -> BranchHandle {
        BranchHandle { at, pc }
    }
}

/// Writes a 4-byte NOP placeholder and returns a handle to it. The caller
/// must eventually pass the handle to exactly one of `resolve_branch` /
/// `resolve_branch_cond`.
pub fn reserve_branch(c: &mut Cursor) -> Result<BranchHandle, EncodeError> {
    let at = c.pos();
    let pc = c.addr();
    emit_nop(c)?;
    Ok(BranchHandle { at, pc })
}

/// Overwrites a reserved placeholder with an unconditional jump to `target`.
pub fn resolve_branch(c: &mut Cursor, handle: BranchHandle, target: u64) -> Result<(), EncodeError> {
    let disp = target as i64 - handle.pc as i64;
    c.patch(handle.at, |b| encode::encode_jal(b, X0, disp))?;
    Ok(())
}

/// Overwrites a reserved placeholder with a conditional branch to `target`.
pub fn resolve_branch_cond(
    c: &mut Cursor,
    handle: BranchHandle,
    cond: BranchCond,
    rs1: Reg,
    rs2: Reg,
    target: u64,
) -> Result<(), EncodeError> {
    let disp = target as i64 - handle.pc as i64;
    c.patch(handle.at, |b| encode::encode_branch(b, cond, rs1, rs2, disp))?;
    Ok(())
}

/// Tracks reserved placeholders for a fragment under construction so the
/// scanner can refuse to seal a fragment with dangling forward references
/// still unresolved.
#[derive(Default)]
pub struct Reservations {
    outstanding: HashSet<BranchHandle>,
}

impl Reservations {
    pub fn new() -> Reservations {
        Reservations::default()
    }

    pub fn reserve(&mut self, c: &mut Cursor) -> Result<BranchHandle, EncodeError> {
        let h = reserve_branch(c)?;
        self.outstanding.insert(h);
        Ok(h)
    }

    pub fn resolve(&mut self, c: &mut Cursor, handle: BranchHandle, target: u64) -> Result<(), EncodeError> {
        resolve_branch(c, handle, target)?;
        self.outstanding.remove(&handle);
        Ok(())
    }

    pub fn resolve_cond(
        &mut self,
        c: &mut Cursor,
        handle: BranchHandle,
        cond: BranchCond,
        rs1: Reg,
        rs2: Reg,
        target: u64,
    ) -> Result<(), EncodeError> {
        resolve_branch_cond(c, handle, cond, rs1, rs2, target)?;
        self.outstanding.remove(&handle);
        Ok(())
    }

    /// Must be called before a fragment is considered complete.
    pub fn seal(&self) -> Result<(), EncodeError> {
        if self.outstanding.is_empty() {
            Ok(())
        } else {
            Err(EncodeError::UnresolvedPlaceholder)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::{decode, Mnemonic, A0};

    #[test]
    fn reserve_then_resolve_round_trips_through_decode() {
        let mut buf = [0u8; 16];
        let mut c = Cursor::new(&mut buf, 0x1000);
        let mut r = Reservations::new();
        let h = r.reserve(&mut c).unwrap();
        r.resolve(&mut c, h, 0x1020).unwrap();
        let d = decode::decode(&buf[0..4], 0x1000);
        assert_eq!(d.mnemonic, Mnemonic::Jal);
        assert_eq!(d.fields.imm, 0x20);
        assert!(r.seal().is_ok());
    }

    #[test]
    fn seal_fails_with_outstanding_reservation() {
        let mut buf = [0u8; 16];
        let mut c = Cursor::new(&mut buf, 0x1000);
        let mut r = Reservations::new();
        let _h = r.reserve(&mut c).unwrap();
        assert!(matches!(r.seal(), Err(EncodeError::UnresolvedPlaceholder)));
    }

    #[test]
    fn resolve_cond_writes_branch_opcode() {
        let mut buf = [0u8; 16];
        let mut c = Cursor::new(&mut buf, 0x1000);
        let mut r = Reservations::new();
        let h = r.reserve(&mut c).unwrap();
        r.resolve_cond(&mut c, h, BranchCond::Eq, A0, X0, 0x1010).unwrap();
        let d = decode::decode(&buf[0..4], 0x1000);
        assert_eq!(d.mnemonic, Mnemonic::Branch);
    }
}
