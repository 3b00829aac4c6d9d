//! The opaque context a plugin callback receives (§4.7).

use crate::cache::BlockType;
use crate::emit::RegMask;
use crate::isa::DecodedInsn;

/// Registration-time event identifiers. Names mirror the original tool's
/// event enum — kept verbatim since plugins (and the bundled tracer, C13)
/// match on them by name.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum PluginEvent {
    PreFragmentC,
    PreBbC,
    PreInstC,
    PostInstC,
    PostBbC,
    PreThread,
    PostThread,
    VmOp,
    FunctionPre,
    FunctionPost,
}

pub struct PluginContext<'a, 'b> {
    /// Current guest read address (the instruction this callback concerns,
    /// for the `*_INST_C` events).
    pub read_p: u64,
    /// Offset into the destination slot the scanner has written up to so
    /// far.
    pub write_pos: usize,
    pub insn: Option<DecodedInsn>,
    pub fragment_id: usize,
    pub block_type: BlockType,
    /// Only honored on `PRE_INST_C`: set by a plugin to suppress the
    /// scanner's own copy/rewrite of the current instruction.
    pub replace: bool,
    /// Registers the plugin has pushed and is responsible for; the core
    /// issues a balancing pop once the callback returns (I6).
    pub pushed_regs: RegMask,
    /// Scratch slice into the slot under construction, exposed so a
    /// callback can call `emit_safe_fcall`/`emit_fcall` to splice helper
    /// calls into the translation (§4.7, used by the tracer plugin, C13).
    pub cursor: &'b mut crate::emit::Cursor<'a>,
}
