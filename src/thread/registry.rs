//! Global registry (§3 "Global registry"): state shared read-only across
//! worker threads once startup finishes, plus the handful of fields that
//! are written cross-thread (`exit_group`, signal delivery).

use crate::plugin::PluginRegistry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

/// The guest's own signal disposition table, one slot per signal number,
/// recorded so the handler (C8) can redirect delivery to it.
pub const NSIG: usize = super::NSIG;

pub struct Engine {
    pub plugins: RwLock<PluginRegistry>,
    /// Guest-installed handler address per signal number, `0` meaning
    /// default disposition.
    signal_handlers: RwLock<[u64; NSIG]>,
    /// Monotonic abort flag: once set, any thread entering the signal
    /// handler or the dispatcher tears down instead of continuing (§4.8).
    exit_group: AtomicBool,
    /// Guest addresses intercepted by name, resolved once at startup (C10)
    /// from the loader's symbol table.
    watched_functions: RwLock<HashMap<String, u64>>,
}

impl Engine {
    fn new() -> Engine {
        Engine {
            plugins: RwLock::new(PluginRegistry::new()),
            signal_handlers: RwLock::new([0; NSIG]),
            exit_group: AtomicBool::new(false),
            watched_functions: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_signal_handler(&self, signum: usize, addr: u64) {
        if signum < NSIG {
            self.signal_handlers.write().unwrap()[signum] = addr;
        }
    }

    pub fn signal_handler(&self, signum: usize) -> u64 {
        if signum >= NSIG {
            return 0;
        }
        self.signal_handlers.read().unwrap()[signum]
    }

    pub fn request_exit_group(&self) {
        self.exit_group.store(true, Ordering::SeqCst);
    }

    pub fn is_exiting(&self) -> bool {
        self.exit_group.load(Ordering::SeqCst)
    }

    pub fn watch_function(&self, name: String, addr: u64) {
        self.watched_functions.write().unwrap().insert(name, addr);
    }

    pub fn watched_function(&self, name: &str) -> Option<u64> {
        self.watched_functions.read().unwrap().get(name).copied()
    }
}

lazy_static::lazy_static! {
    pub static ref ENGINE: Engine = Engine::new();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_group_starts_clear_and_latches() {
        let e = Engine::new();
        assert!(!e.is_exiting());
        e.request_exit_group();
        assert!(e.is_exiting());
    }

    #[test]
    fn watched_functions_round_trip() {
        let e = Engine::new();
        e.watch_function("malloc".to_string(), 0x4000);
        assert_eq!(e.watched_function("malloc"), Some(0x4000));
        assert_eq!(e.watched_function("free"), None);
    }
}
