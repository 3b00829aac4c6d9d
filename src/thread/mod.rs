//! C9 — Thread core. Each worker owns one `ThreadState` exclusively; the
//! only shared state it touches is the global registry (`registry.rs`).

pub mod registry;

use crate::cache::{Arena, HashTable};
use crate::error::EngineResult;
use crate::flags;
use std::collections::HashMap;

/// Per-thread counters for asynchronous signals observed while the thread
/// was executing translated code (§4.8.5), indexed by signal number.
pub const NSIG: usize = 65;

pub struct ThreadState {
    tid: u32,
    pub code_cache: Arena,
    pub hash_table: HashTable,
    /// Index above which fragment ids belong to traces rather than basic
    /// blocks; reserved for the (disabled-by-default) trace cache.
    pub trace_id: usize,
    pub dispatcher_addr: u64,
    pub syscall_wrapper_addr: u64,
    pub trace_head_incr_addr: u64,
    pub pending_signals: [u32; NSIG],
    pub is_signal_pending: bool,
    pub active_trace: Option<usize>,
    /// The fragment currently being scanned or dispatched through, kept for
    /// diagnostics (`ed_assert!` messages, crash logging).
    pub current_fragment: Option<usize>,
    /// Guest function addresses intercepted by name, resolved once at
    /// startup by the loader seam (C10) and consulted by the scanner's
    /// `FUNCTION_{PRE,POST}` dispatch.
    pub watched_functions: HashMap<u64, String>,
}

impl ThreadState {
    pub fn new(tid: u32) -> EngineResult<ThreadState> {
        let _ = flags::get();
        Ok(ThreadState {
            tid,
            code_cache: Arena::new()?,
            hash_table: HashTable::new(),
            trace_id: usize::MAX,
            dispatcher_addr: 0,
            syscall_wrapper_addr: 0,
            trace_head_incr_addr: 0,
            pending_signals: [0; NSIG],
            is_signal_pending: false,
            active_trace: None,
            current_fragment: None,
            watched_functions: HashMap::new(),
        })
    }

    pub fn tid(&self) -> u32 {
        self.tid
    }

    /// Records a fresh asynchronous signal, per §4.8.5: the handler doesn't
    /// act on it directly, it arms unlinking so the guest observes the
    /// signal at a translated PC on the fragment's next natural exit.
    pub fn note_pending_signal(&mut self, signum: i32) {
        if (signum as usize) < NSIG {
            self.pending_signals[signum as usize] += 1;
        }
        self.is_signal_pending = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_thread_state_has_no_pending_signals() {
        let t = ThreadState::new(1).unwrap();
        assert!(!t.is_signal_pending);
        assert_eq!(t.tid(), 1);
    }

    #[test]
    fn note_pending_signal_sets_the_flag() {
        let mut t = ThreadState::new(2).unwrap();
        t.note_pending_signal(11);
        assert!(t.is_signal_pending);
        assert_eq!(t.pending_signals[11], 1);
    }
}
