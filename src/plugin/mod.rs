//! C7 — Plugin callback core.

pub mod context;

pub use context::{PluginContext, PluginEvent};

use crate::error::{EngineError, EngineResult};
use crate::log::LogLevel::LogWarn;

/// Implemented by anything that wants to observe or rewrite translation.
/// A plugin registers interest in specific events via `events()`; `on_event`
/// is called for each one the core fires.
pub trait Plugin {
    fn name(&self) -> &str;
    fn events(&self) -> &[PluginEvent];
    fn on_event(&mut self, event: PluginEvent, ctx: &mut PluginContext<'_, '_>) -> EngineResult<()>;
}

/// Ordered plugin registrations (§3 "Global registry"), plus the
/// per-instruction `replace` conflict check (§4.7: "exactly one plugin may
/// set `replace` per instruction").
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Box<dyn Plugin + Send>>,
}

impl PluginRegistry {
    pub fn new() -> PluginRegistry {
        PluginRegistry { plugins: Vec::new() }
    }

    pub fn register(&mut self, plugin: Box<dyn Plugin + Send>) {
        self.plugins.push(plugin);
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Fires `event` on every interested plugin in registration order. On
    /// `PRE_INST_C`, if more than one plugin sets `ctx.replace`, the second
    /// and later setters are logged as a conflict and ignored (the first
    /// writer wins) — the engine itself never treats this as fatal.
    pub fn dispatch(&mut self, event: PluginEvent, ctx: &mut PluginContext<'_, '_>) -> EngineResult<()> {
        let mut replace_owner: Option<&str> = None;
        for plugin in self.plugins.iter_mut() {
            if !plugin.events().contains(&event) {
                continue;
            }
            let before = ctx.replace;
            plugin.on_event(event, ctx)?;
            if event == PluginEvent::PreInstC && ctx.replace && !before {
                match replace_owner {
                    None => replace_owner = Some(plugin.name()),
                    Some(owner) => {
                        crate::log::write_line(
                            LogWarn,
                            format_args!(
                                "plugin '{}' tried to set replace after '{}' already claimed it; ignoring",
                                plugin.name(),
                                owner
                            ),
                        );
                        ctx.replace = true; // keep the first claim in effect
                    }
                }
            }
        }
        Ok(())
    }
}

/// Helper for reporting a detected conflict through `EngineError` instead of
/// only a log line, for callers (tests, strict harnesses) that want it to
/// surface as an error.
pub fn check_single_replace_owner(owners: &[&str]) -> EngineResult<()> {
    if owners.len() > 1 {
        return Err(EngineError::PluginMisuse(format!(
            "multiple plugins claimed replace: {}",
            owners.join(", ")
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BlockType;
    use crate::emit::{Cursor, RegMask};

    struct ReplaceAlways;
    impl Plugin for ReplaceAlways {
        fn name(&self) -> &str {
            "replace-always"
        }
        fn events(&self) -> &[PluginEvent] {
            &[PluginEvent::PreInstC]
        }
        fn on_event(&mut self, _event: PluginEvent, ctx: &mut PluginContext<'_, '_>) -> EngineResult<()> {
            ctx.replace = true;
            Ok(())
        }
    }

    #[test]
    fn single_plugin_claims_replace_cleanly() {
        let mut reg = PluginRegistry::new();
        reg.register(Box::new(ReplaceAlways));
        let mut buf = [0u8; 16];
        let mut cursor = Cursor::new(&mut buf, 0x1000);
        let mut ctx = PluginContext {
            read_p: 0x1000,
            write_pos: 0,
            insn: None,
            fragment_id: 0,
            block_type: BlockType::Bb,
            replace: false,
            pushed_regs: RegMask::default(),
            cursor: &mut cursor,
        };
        reg.dispatch(PluginEvent::PreInstC, &mut ctx).unwrap();
        assert!(ctx.replace);
    }

    #[test]
    fn second_claimant_does_not_panic_and_first_wins() {
        let mut reg = PluginRegistry::new();
        reg.register(Box::new(ReplaceAlways));
        reg.register(Box::new(ReplaceAlways));
        let mut buf = [0u8; 16];
        let mut cursor = Cursor::new(&mut buf, 0x1000);
        let mut ctx = PluginContext {
            read_p: 0x1000,
            write_pos: 0,
            insn: None,
            fragment_id: 0,
            block_type: BlockType::Bb,
            replace: false,
            pushed_regs: RegMask::default(),
            cursor: &mut cursor,
        };
        assert!(reg.dispatch(PluginEvent::PreInstC, &mut ctx).is_ok());
        assert!(ctx.replace);
    }
}
