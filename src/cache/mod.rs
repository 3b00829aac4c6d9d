//! C3 — Code cache: the fragment arena, its per-fragment metadata, and the
//! per-thread `spc -> tpc` hash table (§3, §4.3).

pub mod arena;
pub mod fragment;
pub mod hash_table;

pub use arena::Arena;
pub use fragment::{BlockType, BranchCacheStatus, BranchCondition, BranchType, FragmentMeta};
pub use hash_table::HashTable;
