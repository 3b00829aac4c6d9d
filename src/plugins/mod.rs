//! Bundled plugins (§4.13): concrete consumers of the callback ABI defined
//! in `crate::plugin`, built the same way any third-party plugin would be.

pub mod tracer;

pub use tracer::TracerPlugin;
