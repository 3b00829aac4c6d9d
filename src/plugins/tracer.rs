//! The bundled tracer plugin (§4.13): a concrete, in-tree consumer of the
//! callback ABI (C7). Recognizes load/store and branch instructions as the
//! scanner walks a guest basic block and splices a call to a small recorder
//! helper that appends `TraceEntry` values to a binary trace file at
//! runtime.
//!
//! The decoded `Mnemonic` (C1) only distinguishes the instruction families
//! the core itself must treat specially; ordinary loads and stores are
//! folded into `Mnemonic::Other` along with arithmetic and FP instructions.
//! This plugin classifies them the way any outside consumer would have to:
//! by inspecting the raw opcode bits of `DecodedInsn.raw` directly. Only
//! the 32-bit load/store encodings are recognized; the compressed
//! C.LW/C.SW/C.LD/C.SD forms are left untraced.

use crate::emit::{caller_saved_mask, emit_addi, emit_fcall, emit_push, emit_pop, emit_set_reg, Cursor};
use crate::error::EngineResult;
use crate::isa::{Mnemonic, Reg, A0, A1, A2, SP};
use crate::plugin::{Plugin, PluginContext, PluginEvent};
use crate::trace_writer::{TraceEntry, TraceEntryType, TraceWriter};
use std::path::Path;
use std::sync::Mutex;

const OPCODE_LOAD: u32 = 0b0000011;
const OPCODE_STORE: u32 = 0b0100011;

fn opcode(raw: u32) -> u32 {
    raw & 0x7f
}

/// Access width in bytes, decoded from the funct3 field shared by every
/// load/store encoding (0=byte, 1=half, 2=word, 3=double; the top bit
/// distinguishes signed from unsigned loads and carries no width info).
fn width_bytes(raw: u32) -> u16 {
    match (raw >> 12) & 0b011 {
        0b00 => 1,
        0b01 => 2,
        0b10 => 4,
        _ => 8,
    }
}

/// Where the recorder should read an event's address from at runtime.
enum AddressSource {
    /// `base + disp`, computed fresh since the guest register's value is
    /// only known once the splice actually runs.
    RegPlusImm(Reg, i64),
    /// A translation-time constant (a direct branch's resolved target).
    Const(u64),
}

lazy_static! {
    static ref TRACE_SINK: Mutex<Option<TraceWriter>> = Mutex::new(None);
}

/// Traces memory accesses and taken branches to a binary trace file.
/// Registers for `PRE_INST_C` (per-instruction classification) and
/// `PRE_BB_C` (one stack-pointer sample per translated block).
pub struct TracerPlugin {
    recorder_addr: u64,
}

impl TracerPlugin {
    /// Opens `path` as the binary trace sink. Only one trace file may be
    /// open per process; a later call replaces the sink the first call
    /// installed.
    pub fn new(path: &Path, recorder_addr: u64) -> std::io::Result<TracerPlugin> {
        let writer = TraceWriter::create(path)?;
        *TRACE_SINK.lock().unwrap() = Some(writer);
        Ok(TracerPlugin { recorder_addr })
    }
}

impl Plugin for TracerPlugin {
    fn name(&self) -> &str {
        "tracer"
    }

    fn events(&self) -> &[PluginEvent] {
        &[PluginEvent::PreInstC, PluginEvent::PreBbC]
    }

    fn on_event(&mut self, event: PluginEvent, ctx: &mut PluginContext<'_, '_>) -> EngineResult<()> {
        match event {
            PluginEvent::PreBbC => self.splice_stack_pointer_sample(ctx),
            PluginEvent::PreInstC => self.splice_instruction_event(ctx),
            _ => Ok(()),
        }
    }
}

impl TracerPlugin {
    fn splice_stack_pointer_sample(&self, ctx: &mut PluginContext<'_, '_>) -> EngineResult<()> {
        splice_record_call(
            ctx.cursor,
            self.recorder_addr,
            TraceEntryType::StackPointerInfo,
            0,
            AddressSource::RegPlusImm(SP, 0),
        )
        .map_err(Into::into)
    }

    fn splice_instruction_event(&self, ctx: &mut PluginContext<'_, '_>) -> EngineResult<()> {
        let insn = match ctx.insn {
            Some(i) => i,
            None => return Ok(()),
        };
        let raw = insn.raw;

        let (entry_type, width, source) = match insn.mnemonic {
            Mnemonic::Other if opcode(raw) == OPCODE_LOAD => (
                TraceEntryType::MemoryRead,
                width_bytes(raw),
                AddressSource::RegPlusImm(insn.fields.rs1, insn.fields.imm),
            ),
            Mnemonic::Other if opcode(raw) == OPCODE_STORE => (
                TraceEntryType::MemoryWrite,
                width_bytes(raw),
                AddressSource::RegPlusImm(insn.fields.rs1, insn.fields.imm),
            ),
            Mnemonic::Jal => (
                TraceEntryType::Branch,
                0,
                AddressSource::Const((ctx.read_p as i64 + insn.fields.imm) as u64),
            ),
            Mnemonic::Jalr => (
                TraceEntryType::Branch,
                0,
                AddressSource::RegPlusImm(insn.fields.rs1, insn.fields.imm),
            ),
            Mnemonic::Branch => (
                TraceEntryType::Branch,
                0,
                AddressSource::Const((ctx.read_p as i64 + insn.fields.imm) as u64),
            ),
            _ => return Ok(()),
        };

        splice_record_call(ctx.cursor, self.recorder_addr, entry_type, width, source).map_err(Into::into)
    }
}

/// Splices a call to `recorder_addr` with `(entry_type, width, address)` in
/// `a0`/`a1`/`a2`, saving and restoring every caller-saved register around
/// it so the instrumented block sees no side effect beyond the recorder's
/// own writes.
fn splice_record_call(
    c: &mut Cursor,
    recorder_addr: u64,
    entry_type: TraceEntryType,
    width: u16,
    source: AddressSource,
) -> Result<usize, crate::error::EncodeError> {
    let mask = caller_saved_mask();
    let start = c.pos();
    emit_push(c, mask)?;
    // Computed first, before a0/a1 are clobbered below, in case the base
    // register the event needs happens to alias one of them.
    match source {
        AddressSource::RegPlusImm(base, disp) => {
            emit_addi(c, A2, base, disp)?;
        }
        AddressSource::Const(addr) => {
            emit_set_reg(c, A2, addr as i64)?;
        }
    }
    emit_set_reg(c, A1, width as i64)?;
    emit_set_reg(c, A0, entry_type as i64)?;
    emit_fcall(c, recorder_addr)?;
    emit_pop(c, mask)?;
    Ok(c.pos() - start)
}

/// Native entry point the splice above calls into: reached from machine
/// code the scanner emitted, not from ordinary Rust callers, so it's a bare
/// `extern "C"` function rather than a method on `TracerPlugin`.
pub extern "C" fn record_event(entry_type: u64, width: u64, addr: u64) {
    let entry_type = match TraceEntryType::from_u32(entry_type as u32) {
        Some(t) => t,
        None => return,
    };
    if let Some(writer) = TRACE_SINK.lock().unwrap().as_mut() {
        let entry = TraceEntry::new(entry_type, 0, width as u16, addr, 0);
        let _ = writer.record(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BlockType;
    use crate::isa::decode;

    fn fresh_cursor(buf: &mut [u8]) -> Cursor {
        Cursor::new(buf, 0x1000)
    }

    fn scratch_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("rvdbm-test-tracer-{}-{}", std::process::id(), name))
    }

    #[test]
    fn width_bytes_matches_funct3_low_bits() {
        // funct3 in bits [14:12]; 0b010 (word) at bit position 12.
        assert_eq!(width_bytes(0b010 << 12), 4);
        assert_eq!(width_bytes(0b011 << 12), 8);
        assert_eq!(width_bytes(0b000 << 12), 1);
        assert_eq!(width_bytes(0b001 << 12), 2);
    }

    #[test]
    fn opcode_mask_isolates_low_seven_bits() {
        assert_eq!(opcode(0x0000_0003), OPCODE_LOAD);
        assert_eq!(opcode(0x0000_0023), OPCODE_STORE);
    }

    #[test]
    fn splice_record_call_balances_push_and_pop() {
        let mut buf = [0u8; 256];
        let mut c = fresh_cursor(&mut buf);
        let n = splice_record_call(&mut c, 0x9000, TraceEntryType::MemoryRead, 8, AddressSource::RegPlusImm(11, 0)).unwrap();
        assert!(n > 0);
        assert_eq!(c.pos(), n);
    }

    #[test]
    fn record_event_appends_to_the_installed_sink() {
        let path = scratch_path("record");
        let _plugin = TracerPlugin::new(&path, 0x1234).unwrap();
        record_event(TraceEntryType::MemoryWrite as u64, 4, 0xdead_beef);
        TRACE_SINK.lock().unwrap().as_mut().unwrap().flush().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 24);
        let param2 = u64::from_le_bytes(bytes[16..24].try_into().unwrap());
        assert_eq!(param2, 0xdead_beef);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn pre_inst_c_recognizes_a_load_and_splices_a_call() {
        let mut code = [0u8; 4];
        crate::isa::encode::encode_ld(&mut code, 5, 11, 16).unwrap();
        let insn = decode(&code, 0x4000);
        assert_eq!(insn.mnemonic, Mnemonic::Other);
        assert_eq!(opcode(insn.raw), OPCODE_LOAD);

        let mut slot = [0u8; 256];
        let mut cursor = Cursor::new(&mut slot, 0x5000);
        let mut pctx = PluginContext {
            read_p: 0x4000,
            write_pos: 0,
            insn: Some(insn),
            fragment_id: 0,
            block_type: BlockType::Bb,
            replace: false,
            pushed_regs: crate::emit::RegMask::default(),
            cursor: &mut cursor,
        };
        let mut plugin = TracerPlugin { recorder_addr: 0x9000 };
        plugin.on_event(PluginEvent::PreInstC, &mut pctx).unwrap();
        assert!(cursor.pos() > 0);
    }
}
