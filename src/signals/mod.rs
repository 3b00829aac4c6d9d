//! C8 — Signal & unlink layer (§4.8): cooperative unlinking via trap
//! opcodes, a minimal `ucontext_t` view, and the handler that ties them
//! together.

pub mod context;
pub mod handler;
pub mod unlink;

pub use context::UContext;
pub use handler::{clear_current_thread, install, set_config, set_current_thread, SignalConfig};
pub use unlink::{TRAP_DB, TRAP_IB};
