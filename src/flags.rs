//! Engine-wide configuration, adapted from the teacher's `Flags`/`init_flags`
//! / `lazy_static! FLAGS` accessor pattern (`examples/isgasho-rd/src/flags.rs`),
//! generalized from rr's recording knobs to this engine's own handful of
//! runtime options.

use std::path::PathBuf;

/// Basic-block slot size, in 16-bit half-words (§4.3).
pub const BBSIZE: usize = 512;

/// Minimum free space, in bytes, the scanner insists on before emitting the
/// next instruction (§4.4 step 3).
pub const MIN_FSPACE: usize = 68;

/// Hash table capacity, a power of two (§3).
pub const HASH_TABLE_CAPACITY: usize = 1 << 19;

/// Trace-entry ring size (§6).
pub const TRACE_BUFFER_ENTRIES: usize = 16384;

#[derive(Clone, Debug)]
pub struct EngineFlags {
    /// Whether indirect branches emit the inline hash-probe sequence (C6)
    /// rather than always falling into the dispatcher.
    pub inline_hash: bool,
    /// Optional path for the line-oriented debug/trace log (§6 file formats).
    pub debug_log_path: Option<PathBuf>,
    /// Optional path for the binary `TraceEntry` trace file (§6).
    pub trace_file_path: Option<PathBuf>,
    /// Whether the optional second-tier trace region may be allocated into.
    /// Disabled by default per the resolved open question in DESIGN.md.
    pub trace_cache_enabled: bool,
    /// Host page size, used to size the arena's mmap request.
    pub page_size: usize,
    /// Force-disable linking, for tests that want to observe every dispatch
    /// going through the dispatcher. Mirrors the teacher's `force_things`.
    pub force_no_linking: bool,
}

impl Default for EngineFlags {
    fn default() -> Self {
        EngineFlags {
            inline_hash: true,
            debug_log_path: None,
            trace_file_path: None,
            trace_cache_enabled: false,
            page_size: 4096,
            force_no_linking: false,
        }
    }
}

impl EngineFlags {
    pub fn from_options(
        no_inline_hash: bool,
        trace_file: Option<PathBuf>,
        debug_log: Option<PathBuf>,
    ) -> EngineFlags {
        EngineFlags {
            inline_hash: !no_inline_hash,
            trace_file_path: trace_file,
            debug_log_path: debug_log,
            ..Default::default()
        }
    }
}

lazy_static! {
    static ref FLAGS: std::sync::RwLock<Option<EngineFlags>> = std::sync::RwLock::new(None);
}

/// Installs the process-wide flags. Must be called exactly once, before any
/// worker thread starts scanning; later calls are ignored (mirrors the
/// teacher's "write once at init, read-only during steady state" discipline
/// for global tables, see `src/thread/registry.rs`).
pub fn install(flags: EngineFlags) {
    let mut slot = FLAGS.write().unwrap();
    if slot.is_none() {
        *slot = Some(flags);
    }
}

/// Read-only accessor, matching the teacher's `Flags::get()`.
pub fn get() -> EngineFlags {
    FLAGS
        .read()
        .unwrap()
        .clone()
        .unwrap_or_else(EngineFlags::default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_inline_hash_and_disable_trace_cache() {
        let f = EngineFlags::default();
        assert!(f.inline_hash);
        assert!(!f.trace_cache_enabled);
        assert!(f.trace_file_path.is_none());
    }

    #[test]
    fn from_options_flips_inline_hash_off() {
        let f = EngineFlags::from_options(true, None, None);
        assert!(!f.inline_hash);
    }
}
