//! Per-fragment metadata (§3 "Fragment metadata").

use crate::emit::BranchHandle;
use crate::isa::{BranchCond, Reg};

bitflags::bitflags! {
    /// Which side(s) of a fragment's exit have already been patched to jump
    /// straight to their target instead of falling into the dispatcher.
    pub struct BranchCacheStatus: u8 {
        const TAKEN_LINKED = 0b01;
        const SKIPPED_LINKED = 0b10;
        const BOTH_LINKED = Self::TAKEN_LINKED.bits | Self::SKIPPED_LINKED.bits;
    }
}

/// The block-type tag a scan request carries (§4.4): a continuation of a
/// trace, the entry into one, or an ordinary basic block.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum BlockType {
    Bb,
    Trace,
    TraceEntry,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum BranchType {
    UncondImm,
    UncondReg,
    CondImm,
    TraceExit,
    Unknown,
}

/// The condition governing a `CondImm` fragment's exit, captured so the
/// unlink handler can re-evaluate it from a trapped context (§4.8.4).
#[derive(Copy, Clone, Debug)]
pub struct BranchCondition {
    pub r1: Reg,
    pub r2: Reg,
    pub cond: BranchCond,
}

#[derive(Clone, Debug)]
pub struct FragmentMeta {
    pub exit_branch_type: BranchType,
    /// Offset, in bytes, from the start of this fragment's slot to the
    /// first byte of the exit stub.
    pub exit_branch_addr: usize,
    pub branch_taken_addr: u64,
    pub branch_skipped_addr: u64,
    pub branch_condition: Option<BranchCondition>,
    /// Register holding the indirect-branch target, for `UncondReg`.
    pub rn: Option<Reg>,
    /// Absolute address of the inline hash lookup's hit-path `jr`, the
    /// instruction an indirect-branch unlink overwrites with `TRAP_IB`
    /// (§4.8). `None` when the block was scanned without inline hashing.
    pub indirect_jump_addr: Option<u64>,
    pub branch_cache_status: BranchCacheStatus,
    /// If this fragment is an overflow slot allocated mid-emission, the
    /// logical id it continues.
    pub actual_id: Option<usize>,
    /// Original stub bytes, saved before an unlink trap overwrote them.
    pub saved_exit: Vec<u8>,
    /// Bytes still available in this slot, tracked for trace growth.
    pub free_b: usize,
    /// Reserved-placeholder handle for the `UncondImm` shape, or the
    /// fallthrough (condition-false) side of a `CondImm` shape.
    pub skipped_link_handle: Option<BranchHandle>,
    /// Reserved-placeholder handle for the taken (condition-true) side of
    /// a `CondImm` shape. Unused by `UncondImm`.
    pub taken_link_handle: Option<BranchHandle>,
    /// `CondImm`'s tail `large_jump` to the dispatcher, patched to a direct
    /// jump once both sides have linked. `None` for other exit shapes.
    pub dispatcher_call_handle: Option<BranchHandle>,
}

impl FragmentMeta {
    pub fn new(free_b: usize) -> FragmentMeta {
        FragmentMeta {
            exit_branch_type: BranchType::Unknown,
            exit_branch_addr: 0,
            branch_taken_addr: 0,
            branch_skipped_addr: 0,
            branch_condition: None,
            rn: None,
            indirect_jump_addr: None,
            branch_cache_status: BranchCacheStatus::empty(),
            actual_id: None,
            saved_exit: Vec::new(),
            free_b,
            skipped_link_handle: None,
            taken_link_handle: None,
            dispatcher_call_handle: None,
        }
    }

    pub fn is_fully_linked(&self) -> bool {
        match self.exit_branch_type {
            BranchType::CondImm => self.branch_cache_status.contains(BranchCacheStatus::BOTH_LINKED),
            BranchType::UncondImm => self.branch_cache_status.contains(BranchCacheStatus::TAKEN_LINKED),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_linked_is_union_of_both_bits() {
        let mut s = BranchCacheStatus::empty();
        s.insert(BranchCacheStatus::TAKEN_LINKED);
        s.insert(BranchCacheStatus::SKIPPED_LINKED);
        assert_eq!(s, BranchCacheStatus::BOTH_LINKED);
    }

    #[test]
    fn fresh_fragment_is_not_linked() {
        let f = FragmentMeta::new(512);
        assert!(!f.is_fully_linked());
    }
}
