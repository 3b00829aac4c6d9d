//! A user-space dynamic binary modification engine for 64-bit RISC-V
//! guests: scans guest basic blocks into an executable code cache,
//! resolves and links control flow between cached fragments, and exposes
//! a plugin ABI for instrumentation (tracing, function interception).

#[macro_use]
extern crate lazy_static;

#[macro_use]
pub mod log;

pub mod cache;
pub mod debug_log;
pub mod dispatcher;
pub mod emit;
pub mod engine;
pub mod error;
pub mod flags;
pub mod guest;
pub mod inline_lookup;
pub mod isa;
pub mod plugin;
pub mod plugins;
pub mod scanner;
pub mod signals;
pub mod thread;
pub mod trace_writer;
