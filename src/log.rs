//! Minimal internal logger. Never guest-visible: all output here goes to the
//! engine's own stderr sink, gated by the `RVDBM_LOG` environment variable,
//! the way the teacher gates its own diagnostics rather than reaching for
//! the `log`/`tracing` ecosystem crates.

use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Debug)]
pub enum LogLevel {
    LogDebug = 0,
    LogInfo = 1,
    LogWarn = 2,
    LogError = 3,
    LogFatal = 4,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::LogDebug => "DEBUG",
            LogLevel::LogInfo => "INFO",
            LogLevel::LogWarn => "WARN",
            LogLevel::LogError => "ERROR",
            LogLevel::LogFatal => "FATAL",
        }
    }
}

static MIN_LEVEL: AtomicUsize = AtomicUsize::new(LogLevel::LogInfo as usize);

/// Reads `RVDBM_LOG` once and caches the resulting threshold. Called lazily
/// from `log!`, so tests that never touch the macro never pay for it.
pub fn init_from_env() {
    let level = match std::env::var("RVDBM_LOG") {
        Ok(v) => match v.to_ascii_lowercase().as_str() {
            "debug" => LogLevel::LogDebug,
            "info" => LogLevel::LogInfo,
            "warn" => LogLevel::LogWarn,
            "error" => LogLevel::LogError,
            _ => LogLevel::LogInfo,
        },
        Err(_) => LogLevel::LogInfo,
    };
    MIN_LEVEL.store(level as usize, Ordering::Relaxed);
}

pub fn enabled(level: LogLevel) -> bool {
    level as usize >= MIN_LEVEL.load(Ordering::Relaxed)
}

#[doc(hidden)]
pub fn write_line(level: LogLevel, args: std::fmt::Arguments) {
    if enabled(level) {
        eprintln!("[rvdbm:{}] {}", level.as_str(), args);
    }
}

/// `log!(LogDebug, "fmt {}", x)` — matches the teacher's `log!(LogDebug, ...)`
/// call sites, but with a self-contained implementation since the defining
/// module wasn't part of the retrieved teacher sources.
#[macro_export]
macro_rules! log {
    ($level:expr, $($arg:tt)+) => {
        $crate::log::write_line($level, format_args!($($arg)+))
    };
}

/// `ed_assert!(thread, cond)` / `ed_assert!(thread, cond, "fmt", args...)`.
/// Named after the teacher's own assertion macro; logs the owning thread's
/// id and current fragment before panicking so an engine-bug crash (an
/// "aborts the process" condition per the error-handling design) carries
/// diagnosable context instead of a bare `assert!` message.
#[macro_export]
macro_rules! ed_assert {
    ($t:expr, $cond:expr) => {
        if !$cond {
            $crate::log::write_line(
                $crate::log::LogLevel::LogFatal,
                format_args!(
                    "assertion failed in thread {}: {}",
                    $t.tid(),
                    stringify!($cond)
                ),
            );
            panic!("ed_assert failed: {}", stringify!($cond));
        }
    };
    ($t:expr, $cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::log::write_line(
                $crate::log::LogLevel::LogFatal,
                format_args!("assertion failed in thread {}: {}", $t.tid(), format_args!($($arg)+)),
            );
            panic!("ed_assert failed: {}", format!($($arg)+));
        }
    };
}

pub use LogLevel::*;
