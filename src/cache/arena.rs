//! Code-cache arena (§4.3, §6). Basic-block slots are carved out of a
//! single `mmap`'d region so the engine's own translations are directly
//! executable — there is no separate "stage then copy" step, matching how
//! a same-ISA DBM engine actually has to work.

use crate::cache::fragment::FragmentMeta;
use crate::error::{EngineError, EngineResult};
use crate::flags;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use std::ptr::NonNull;

/// Number of basic-block slots a fresh arena reserves. Chosen generously;
/// `allocate_bb` reports `CacheExhausted` rather than growing, matching I5
/// (fragment slots are never reused or relocated within a thread's
/// lifetime, so the backing region can't be realloc'd out from under live
/// translated pointers).
const DEFAULT_SLOT_COUNT: usize = 4096;

fn bb_size_bytes() -> usize {
    flags::BBSIZE * 2
}

/// The optional second-tier region for trace fragments (§3 `trace_id`,
/// §4.13). Resolved open question: disabled by default, and the default
/// configuration never allocates into it (see DESIGN.md).
pub struct TraceRegion {
    base: Option<NonNull<u8>>,
    len: usize,
}

impl TraceRegion {
    fn disabled() -> TraceRegion {
        TraceRegion { base: None, len: 0 }
    }

    fn enabled(len: usize) -> nix::Result<TraceRegion> {
        let prot = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC;
        let flags = MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS;
        let ptr = unsafe { mmap(std::ptr::null_mut(), len, prot, flags, -1, 0)? };
        Ok(TraceRegion {
            base: NonNull::new(ptr as *mut u8),
            len,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.base.is_some()
    }
}

impl Drop for TraceRegion {
    fn drop(&mut self) {
        if let Some(base) = self.base {
            unsafe {
                let _ = munmap(base.as_ptr() as *mut libc::c_void, self.len);
            }
        }
    }
}

pub struct Arena {
    base: NonNull<u8>,
    len: usize,
    slot_size: usize,
    next_free: usize,
    capacity_slots: usize,
    pub fragments: Vec<FragmentMeta>,
    pub trace: TraceRegion,
}

// The arena is mmap'd PROT_READ|WRITE|EXEC memory, owned exclusively by
// the thread that created it (§5); it's moved into that thread's
// `ThreadState` and never shared afterward.
unsafe impl Send for Arena {}

impl Arena {
    pub fn new() -> EngineResult<Arena> {
        Self::with_slot_count(DEFAULT_SLOT_COUNT)
    }

    pub fn with_slot_count(capacity_slots: usize) -> EngineResult<Arena> {
        let slot_size = bb_size_bytes();
        let len = slot_size * capacity_slots;
        let prot = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC;
        let map_flags = MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS;
        let ptr = unsafe { mmap(std::ptr::null_mut(), len, prot, map_flags, -1, 0) }
            .map_err(|e| EngineError::Fatal(format!("failed to map code cache arena: {}", e)))?;
        let base = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| EngineError::Fatal("mmap returned a null pointer".to_string()))?;

        let f = flags::get();
        let trace = if f.trace_cache_enabled {
            TraceRegion::enabled(len)
                .map_err(|e| EngineError::Fatal(format!("failed to map trace region: {}", e)))?
        } else {
            TraceRegion::disabled()
        };

        Ok(Arena {
            base,
            len,
            slot_size,
            next_free: 0,
            capacity_slots,
            fragments: Vec::new(),
            trace,
        })
    }

    /// Bumps `next_free` and returns the fresh fragment id (I5: never
    /// reused). `CacheExhausted` once the arena is full.
    pub fn allocate_bb(&mut self) -> EngineResult<usize> {
        if self.next_free >= self.capacity_slots {
            return Err(EngineError::CacheExhausted);
        }
        let id = self.next_free;
        self.next_free += 1;
        self.fragments.push(FragmentMeta::new(self.slot_size));
        Ok(id)
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Absolute address of slot `id`'s first byte — the `tpc` a fragment's
    /// translated code begins at.
    pub fn slot_addr(&self, id: usize) -> u64 {
        self.base.as_ptr() as u64 + (id * self.slot_size) as u64
    }

    /// A writable view over slot `id`. Callers write translated
    /// instructions directly into this slice; the memory is already
    /// executable, so no separate flush-to-exec step is needed beyond the
    /// host instruction-cache flush the dispatcher performs after linking.
    pub fn slot_mut(&mut self, id: usize) -> &mut [u8] {
        assert!(id < self.next_free, "slot {} was never allocated", id);
        let offset = id * self.slot_size;
        unsafe {
            std::slice::from_raw_parts_mut(self.base.as_ptr().add(offset), self.slot_size)
        }
    }

    /// Raw pointer to slot `id`'s first byte, for callers (the scanner)
    /// that need a writable view detached from `&mut Arena`'s borrow so
    /// they can still call other arena methods (`allocate_bb`,
    /// `needs_new_slot`) while translating into it.
    pub fn slot_ptr(&self, id: usize) -> *mut u8 {
        assert!(id < self.next_free, "slot {} was never allocated", id);
        unsafe { self.base.as_ptr().add(id * self.slot_size) }
    }

    /// `check_free_space(MIN_FSPACE)` (§4.4 step 3): whether fewer than
    /// `min` bytes remain in slot `id` from `written` onward. Since the
    /// trace region is disabled by default, "data_p meeting write_p"
    /// collapses to this single forward bound — the scanner simply starts
    /// a new slot and branches to it when it would run out of room.
    pub fn needs_new_slot(&self, written: usize, min: usize) -> bool {
        self.slot_size.saturating_sub(written) < min
    }

    pub fn fragment(&self, id: usize) -> &FragmentMeta {
        &self.fragments[id]
    }

    pub fn fragment_mut(&mut self, id: usize) -> &mut FragmentMeta {
        &mut self.fragments[id]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether `addr` falls inside this arena's mapped region at all
    /// (§4.8 "synchronous exceptions outside the cache are fatal").
    pub fn contains(&self, addr: u64) -> bool {
        let base = self.base.as_ptr() as u64;
        addr >= base && addr < base + self.len as u64
    }

    /// The id of the fragment slot `addr` falls within, if any.
    pub fn fragment_id_for_addr(&self, addr: u64) -> Option<usize> {
        if !self.contains(addr) {
            return None;
        }
        let base = self.base.as_ptr() as u64;
        let id = ((addr - base) / self.slot_size as u64) as usize;
        if id < self.next_free {
            Some(id)
        } else {
            None
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.base.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_bb_bumps_next_free_and_never_reuses() {
        let mut arena = Arena::with_slot_count(4).unwrap();
        let a = arena.allocate_bb().unwrap();
        let b = arena.allocate_bb().unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_ne!(arena.slot_addr(a), arena.slot_addr(b));
    }

    #[test]
    fn exhausts_after_capacity_slots() {
        let mut arena = Arena::with_slot_count(2).unwrap();
        arena.allocate_bb().unwrap();
        arena.allocate_bb().unwrap();
        assert!(matches!(arena.allocate_bb(), Err(EngineError::CacheExhausted)));
    }

    #[test]
    fn slot_mut_is_writable_and_distinct_per_slot() {
        let mut arena = Arena::with_slot_count(2).unwrap();
        let a = arena.allocate_bb().unwrap();
        let b = arena.allocate_bb().unwrap();
        arena.slot_mut(a)[0] = 0xAA;
        arena.slot_mut(b)[0] = 0xBB;
        assert_eq!(arena.slot_mut(a)[0], 0xAA);
        assert_eq!(arena.slot_mut(b)[0], 0xBB);
    }

    #[test]
    fn fragment_id_for_addr_finds_the_owning_slot() {
        let mut arena = Arena::with_slot_count(4).unwrap();
        let a = arena.allocate_bb().unwrap();
        let b = arena.allocate_bb().unwrap();
        assert_eq!(arena.fragment_id_for_addr(arena.slot_addr(a)), Some(a));
        assert_eq!(arena.fragment_id_for_addr(arena.slot_addr(b) + 4), Some(b));
        assert!(arena.contains(arena.slot_addr(a)));
        assert!(!arena.contains(arena.slot_addr(a) + arena.len() as u64));
        assert_eq!(arena.fragment_id_for_addr(arena.slot_addr(a) + arena.len() as u64), None);
    }

    #[test]
    fn needs_new_slot_respects_min_fspace() {
        let arena = Arena::with_slot_count(1).unwrap();
        let size = arena.slot_size();
        assert!(!arena.needs_new_slot(size - 100, 68));
        assert!(arena.needs_new_slot(size - 10, 68));
    }
}
