//! Cooperative unlinking via trap opcodes (§4.8 "Unlinking").
//!
//! The trap encodings are borrowed from the original tool's own riscv64
//! port: `SRET`/`MRET` are privileged instructions that fault with
//! `SIGILL` when executed from user mode, and the two distinct opcodes let
//! the handler tell which kind of exit was hit without needing a separate
//! side channel (the decoder has no legitimate use for either, so there is
//! no ambiguity with guest code).

use crate::cache::{Arena, BranchType};
use crate::isa::encode;

/// `SRET`, illegal outside S-mode: marks an unlinked `uncond_reg` exit's
/// final indirect jump.
pub const TRAP_IB: u32 = 0x1020_0073;
/// `MRET`, illegal outside M-mode: marks an unlinked direct exit's
/// (`uncond_imm`/`cond_imm`) linked region.
pub const TRAP_DB: u32 = 0x3020_0073;

fn write_trap_word(arena: &mut Arena, id: usize, addr: u64, trap: u32) {
    let slot_addr = arena.slot_addr(id);
    let offset = (addr - slot_addr) as usize;
    let slot = arena.slot_mut(id);
    slot[offset..offset + 4].copy_from_slice(&trap.to_le_bytes());
}

fn write_trap_region(arena: &mut Arena, id: usize, addr: u64, len: usize, trap: u32) {
    let mut at = addr;
    let end = addr + len as u64;
    while at < end {
        write_trap_word(arena, id, at, trap);
        at += 4;
    }
}

/// Overwrites a linked `uncond_imm` exit's direct jump with `TRAP_DB`,
/// first saving the bytes being replaced into `saved_exit` so the handler
/// can restore them once it's interpreted the exit.
pub fn unlink_uncond_imm(arena: &mut Arena, id: usize) {
    let frag = arena.fragment(id).clone();
    if frag.exit_branch_type != BranchType::UncondImm {
        return;
    }
    if let Some(handle) = frag.skipped_link_handle {
        let addr = handle.addr();
        let slot_addr = arena.slot_addr(id);
        let offset = (addr - slot_addr) as usize;
        let backup = arena.slot_mut(id)[offset..offset + 4].to_vec();
        arena.fragment_mut(id).saved_exit = backup;
        write_trap_region(arena, id, addr, 4, TRAP_DB);
    }
}

/// Overwrites a linked `cond_imm` exit's 8-byte patched region (both
/// placeholders) with `TRAP_DB`.
pub fn unlink_cond_imm(arena: &mut Arena, id: usize) {
    let frag = arena.fragment(id).clone();
    if frag.exit_branch_type != BranchType::CondImm {
        return;
    }
    if let Some(handle) = frag.skipped_link_handle {
        let addr = handle.addr();
        let slot_addr = arena.slot_addr(id);
        let offset = (addr - slot_addr) as usize;
        let backup = arena.slot_mut(id)[offset..offset + 8].to_vec();
        arena.fragment_mut(id).saved_exit = backup;
        write_trap_region(arena, id, addr, 8, TRAP_DB);
    }
}

/// Overwrites an inline-hash-lookup hit path's `jr` with `TRAP_IB`. Unlike
/// the direct shapes, no backup is kept: the original `jr rn, 0` is
/// rebuilt directly from `rn` when restoring (see `restore_indirect_jump`).
pub fn unlink_uncond_reg(arena: &mut Arena, id: usize) {
    let frag = arena.fragment(id).clone();
    if frag.exit_branch_type != BranchType::UncondReg {
        return;
    }
    if let Some(addr) = frag.indirect_jump_addr {
        write_trap_word(arena, id, addr, TRAP_IB);
    }
}

/// Restores a direct exit's `saved_exit` bytes, clearing the backup.
pub fn restore_direct(arena: &mut Arena, id: usize) {
    let frag = arena.fragment(id).clone();
    if frag.saved_exit.is_empty() {
        return;
    }
    if let Some(handle) = frag.skipped_link_handle {
        let addr = handle.addr();
        let slot_addr = arena.slot_addr(id);
        let offset = (addr - slot_addr) as usize;
        let len = frag.saved_exit.len();
        arena.slot_mut(id)[offset..offset + len].copy_from_slice(&frag.saved_exit);
    }
    arena.fragment_mut(id).saved_exit.clear();
}

/// Rebuilds the inline hash lookup's hit-path `jr rn` directly, without a
/// backup, since its encoding is fully determined by `rn`.
pub fn restore_indirect_jump(arena: &mut Arena, id: usize) {
    let frag = arena.fragment(id).clone();
    let (addr, rn) = match (frag.indirect_jump_addr, frag.rn) {
        (Some(addr), Some(rn)) => (addr, rn),
        _ => return,
    };
    let mut buf = [0u8; 4];
    encode::encode_jalr(&mut buf, 0, rn, 0).expect("jr rn is always encodable");
    let slot_addr = arena.slot_addr(id);
    let offset = (addr - slot_addr) as usize;
    arena.slot_mut(id)[offset..offset + 4].copy_from_slice(&buf);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Arena, BlockType};
    use crate::emit::Cursor;
    use crate::guest::SliceMemory;
    use crate::isa::{decode, Mnemonic};
    use crate::plugin::PluginRegistry;
    use crate::scanner::{self, ScanRequest};

    fn scan_uncond_imm() -> (Arena, usize) {
        let mut arena = Arena::with_slot_count(4).unwrap();
        let mut plugins = PluginRegistry::new();
        let mut bytes = vec![0x13, 0x00, 0x00, 0x00]; // addi x0,x0,0
        let mut jal = [0u8; 4];
        encode::encode_jal(&mut jal, 0, 0x20).unwrap();
        bytes.extend_from_slice(&jal);
        let guest = SliceMemory::new(0x2000, bytes);
        let id = arena.allocate_bb().unwrap();
        let req = ScanRequest {
            read_p: 0x2000,
            fragment_id: id,
            block_type: BlockType::Bb,
            dispatcher_addr: 0x9000,
            syscall_wrapper_addr: 0x9100,
            hash_table_addr: 0,
            hash_mask: 0,
        };
        scanner::scan_block(&mut arena, &mut plugins, &guest, &req).unwrap();
        (arena, id)
    }

    #[test]
    fn unlink_then_restore_uncond_imm_round_trips_bytes() {
        let (mut arena, id) = scan_uncond_imm();
        let handle = arena.fragment(id).skipped_link_handle.unwrap();
        let slot_addr = arena.slot_addr(id);
        let offset = (handle.addr() - slot_addr) as usize;
        let original = arena.slot_mut(id)[offset..offset + 4].to_vec();

        unlink_uncond_imm(&mut arena, id);
        let trapped = arena.slot_mut(id)[offset..offset + 4].to_vec();
        assert_eq!(u32::from_le_bytes(trapped.try_into().unwrap()), TRAP_DB);

        restore_direct(&mut arena, id);
        let restored = arena.slot_mut(id)[offset..offset + 4].to_vec();
        assert_eq!(restored, original);
    }

    #[test]
    fn restore_indirect_jump_rebuilds_jr_from_rn() {
        let mut arena = Arena::with_slot_count(2).unwrap();
        let id = arena.allocate_bb().unwrap();
        let slot_addr = arena.slot_addr(id);

        let mut c = Cursor::new(arena.slot_mut(id), slot_addr);
        let jump_addr = c.addr();
        c.patch(0, |b| encode::encode_jalr(b, 0, 10, 0)).unwrap();

        arena.fragment_mut(id).exit_branch_type = BranchType::UncondReg;
        arena.fragment_mut(id).indirect_jump_addr = Some(jump_addr);
        arena.fragment_mut(id).rn = Some(10);

        unlink_uncond_reg(&mut arena, id);
        let offset = 0usize;
        let trapped = arena.slot_mut(id)[offset..offset + 4].to_vec();
        assert_eq!(u32::from_le_bytes(trapped.try_into().unwrap()), TRAP_IB);

        restore_indirect_jump(&mut arena, id);
        let restored = arena.slot_mut(id)[offset..offset + 4].to_vec();
        let d = decode::decode(&restored, slot_addr);
        assert_eq!(d.mnemonic, Mnemonic::Jalr);
    }
}
