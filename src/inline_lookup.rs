//! C6 — Inline hash lookup: the dispatcher-bypass sequence emitted at an
//! indirect branch site (§4.6). On a hit, jumps straight to the cached
//! `tpc` without ever calling into the dispatcher; a miss falls into the
//! same calling convention any other exit stub uses.

use crate::emit::{
    emit_add, emit_addi, emit_and, emit_branch_guard, emit_jalr, emit_large_jump, emit_ld,
    emit_pop, emit_push, emit_set_reg, emit_slli, Cursor, RegMask, Reservations,
};
use crate::error::EncodeError;
use crate::isa::{BranchCond, Reg, A0, A1, A2, T6, X0};

/// Entry stride in the hash table: one `u64` key (`spc`) plus one `u64`
/// value (`tpc`), matching `HashTable`'s `#[repr(C)]` layout.
const ENTRY_SIZE_LOG2: u32 = 4;

fn lookup_scratch_mask() -> RegMask {
    RegMask::of(&[A0, A1, A2])
}

/// Result of emitting an inline lookup: its byte length plus the absolute
/// address of the hit path's `jr`, the single instruction an
/// indirect-branch unlink (§4.8) overwrites with `TRAP_IB`.
pub struct InlineLookup {
    pub bytes_written: usize,
    pub hit_jump_addr: u64,
}

/// Emits the probe sequence for an indirect jump through `rs1 + imm`
/// (JALR's addressing mode). `fragment_id` and `dispatcher_addr` are only
/// used on the miss path, where control falls back to the ordinary
/// resolve-or-scan call; `hash_table_addr`/`hash_mask` describe the
/// scanning thread's own table.
pub fn emit_inline_lookup(
    c: &mut Cursor,
    rs1: Reg,
    imm: i64,
    fragment_id: usize,
    dispatcher_addr: u64,
    hash_table_addr: u64,
    hash_mask: usize,
) -> Result<InlineLookup, EncodeError> {
    let start = c.pos();
    let mut reservations = Reservations::new();

    emit_push(c, lookup_scratch_mask())?;
    emit_addi(c, A1, rs1, imm)?; // a1 = target spc
    emit_set_reg(c, A0, hash_table_addr as i64)?; // a0 = entries base
    emit_set_reg(c, A2, hash_mask as i64)?; // a2 = index mask
    emit_and(c, A2, A2, A1)?; // a2 = spc & mask
    emit_slli(c, A2, A2, ENTRY_SIZE_LOG2)?; // a2 = index * entry_size
    emit_add(c, A0, A0, A2)?; // a0 = &entries[index]

    let probe = c.addr();
    emit_ld(c, A2, A0, 0)?; // a2 = entries[i].spc
    emit_addi(c, A0, A0, 16)?; // a0 advances past this entry
    let miss_handle = reservations.reserve(c)?;
    let bne_disp = probe as i64 - c.addr() as i64;
    emit_branch_guard(c, BranchCond::Ne, A2, A1, bne_disp)?; // loop while a2 != a1

    // Hit: a0 now points past the matched entry; tpc sits 8 bytes before
    // that (16-byte entry, spc then tpc).
    emit_ld(c, A0, A0, -8)?;
    emit_pop(c, RegMask::of(&[A2]))?;
    let hit_jump_addr = c.addr();
    emit_jalr(c, X0, A0, 0)?; // jr a0

    let miss = c.addr();
    reservations.resolve_cond(c, miss_handle, BranchCond::Eq, A2, X0, miss)?;
    emit_addi(c, A0, A1, 0)?; // mv a0, a1 (target spc, for the dispatcher)
    emit_set_reg(c, A1, fragment_id as i64)?;
    emit_large_jump(c, dispatcher_addr, X0, T6)?;

    reservations.seal()?;
    Ok(InlineLookup {
        bytes_written: c.pos() - start,
        hit_jump_addr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::HashTable;
    use crate::isa::{decode, Mnemonic};

    #[test]
    fn emits_a_nonempty_probe_sequence() {
        let table = HashTable::with_capacity(16);
        let mut buf = [0u8; 256];
        let mut c = Cursor::new(&mut buf, 0x1000);
        let result = emit_inline_lookup(&mut c, A0, 0, 3, 0x9000, table.base_addr(), table.mask())
            .unwrap();
        assert!(result.bytes_written > 0);
        assert!(result.hit_jump_addr >= 0x1000);
        assert!(result.hit_jump_addr < 0x1000 + result.bytes_written as u64);
    }

    #[test]
    fn probe_loop_contains_a_backward_and_forward_branch() {
        let table = HashTable::with_capacity(16);
        let mut buf = [0u8; 256];
        let mut c = Cursor::new(&mut buf, 0x1000);
        emit_inline_lookup(&mut c, A0, 0, 3, 0x9000, table.base_addr(), table.mask()).unwrap();
        let bytes = c.bytes_written();
        let mut branch_count = 0;
        let mut i = 0;
        while i + 4 <= bytes.len() {
            let d = decode::decode(&bytes[i..i + 4], 0x1000 + i as u64);
            if d.mnemonic == Mnemonic::Branch {
                branch_count += 1;
            }
            i += d.length as usize;
        }
        // one beqz-to-miss, one bne-loop-to-probe
        assert_eq!(branch_count, 2);
    }
}
