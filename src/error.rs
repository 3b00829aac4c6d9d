//! Error hierarchy (§7). Emitter-level range failures are kept narrow
//! (`EncodeError`) so the scanner can pattern-match and retry with a larger
//! encoding; everything else funnels into `EngineError`, which the top-level
//! run loop and the signal handler (which cannot unwind across a signal
//! frame) are the only consumers that ever need to react to a `Fatal`.

use std::fmt;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum EncodeError {
    /// The requested branch/jump displacement doesn't fit any available
    /// encoding (compressed, 32-bit, or large-jump).
    DisplacementOutOfRange,
    /// A register index fell outside a form's addressable class (e.g. a
    /// compressed-branch operand outside x8..x15).
    InvalidRegisterClass,
    /// `emit_safe_fcall` was asked for more arguments than the platform ABI
    /// has registers for.
    TooManyArguments,
    /// A reserved-branch handle was never resolved before the block sealed.
    UnresolvedPlaceholder,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            EncodeError::DisplacementOutOfRange => "branch displacement out of range",
            EncodeError::InvalidRegisterClass => "register outside addressable class",
            EncodeError::TooManyArguments => "argno exceeds platform maximum",
            EncodeError::UnresolvedPlaceholder => "reserved branch placeholder left unresolved",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for EncodeError {}

#[derive(Debug)]
pub enum EngineError {
    Encoding(EncodeError),
    CacheExhausted,
    UnknownOpcode { addr: u64, bytes: u32 },
    PluginMisuse(String),
    Fatal(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Encoding(e) => write!(f, "encoding error: {}", e),
            EngineError::CacheExhausted => write!(f, "code cache arena exhausted"),
            EngineError::UnknownOpcode { addr, bytes } => {
                write!(f, "unknown opcode {:#010x} at {:#x}", bytes, addr)
            }
            EngineError::PluginMisuse(msg) => write!(f, "plugin misuse: {}", msg),
            EngineError::Fatal(msg) => write!(f, "fatal engine error: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<EncodeError> for EngineError {
    fn from(e: EncodeError) -> Self {
        EngineError::Encoding(e)
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
