//! C13 — Trace writer: serializes fixed-layout `TraceEntry` records to an
//! optional binary trace file (§6 "Trace writer").

use crate::flags::TRACE_BUFFER_ENTRIES;
use static_assertions::const_assert_eq;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

#[repr(u32)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TraceEntryType {
    MemoryRead = 1,
    MemoryWrite = 2,
    HeapAllocSize = 3,
    HeapAllocReturn = 4,
    HeapFree = 5,
    Branch = 6,
    StackPointerInfo = 7,
    StackPointerModification = 8,
}

impl TraceEntryType {
    pub fn from_u32(v: u32) -> Option<TraceEntryType> {
        Some(match v {
            1 => TraceEntryType::MemoryRead,
            2 => TraceEntryType::MemoryWrite,
            3 => TraceEntryType::HeapAllocSize,
            4 => TraceEntryType::HeapAllocReturn,
            5 => TraceEntryType::HeapFree,
            6 => TraceEntryType::Branch,
            7 => TraceEntryType::StackPointerInfo,
            8 => TraceEntryType::StackPointerModification,
            _ => return None,
        })
    }
}

/// A single traced event: 24 bytes, little-endian, naturally aligned (§6).
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct TraceEntry {
    pub entry_type: u32,
    /// Branch-taken, branch-type, or stack-kind bits, meaning depends on
    /// `entry_type`.
    pub flag: u8,
    _pad: u8,
    /// Memory access size, for `MemoryRead`/`MemoryWrite`.
    pub param0: u16,
    /// Instruction address, or allocation size for the heap events.
    pub param1: u64,
    /// Memory address, or branch/call target address.
    pub param2: u64,
}

const_assert_eq!(std::mem::size_of::<TraceEntry>(), 24);

impl TraceEntry {
    pub fn new(entry_type: TraceEntryType, flag: u8, param0: u16, param1: u64, param2: u64) -> TraceEntry {
        TraceEntry { entry_type: entry_type as u32, flag, _pad: 0, param0, param1, param2 }
    }

    fn to_bytes(self) -> [u8; 24] {
        let mut out = [0u8; 24];
        out[0..4].copy_from_slice(&self.entry_type.to_le_bytes());
        out[4] = self.flag;
        out[5] = self._pad;
        out[6..8].copy_from_slice(&self.param0.to_le_bytes());
        out[8..16].copy_from_slice(&self.param1.to_le_bytes());
        out[16..24].copy_from_slice(&self.param2.to_le_bytes());
        out
    }
}

/// Buffers `TraceEntry` records in a fixed-size ring, flushing to the
/// backing file when full or on an explicit `flush()` (testcase boundary).
pub struct TraceWriter {
    file: File,
    buffer: Vec<TraceEntry>,
}

impl TraceWriter {
    pub fn create(path: &Path) -> io::Result<TraceWriter> {
        Ok(TraceWriter {
            file: File::create(path)?,
            buffer: Vec::with_capacity(TRACE_BUFFER_ENTRIES),
        })
    }

    pub fn record(&mut self, entry: TraceEntry) -> io::Result<()> {
        self.buffer.push(entry);
        if self.buffer.len() >= TRACE_BUFFER_ENTRIES {
            self.flush()?;
        }
        Ok(())
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Forces whatever's buffered out to disk (testcase boundary, §6).
    pub fn flush(&mut self) -> io::Result<()> {
        for entry in self.buffer.drain(..) {
            self.file.write_all(&entry.to_bytes())?;
        }
        self.file.flush()
    }
}

impl Drop for TraceWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("rvdbm-test-{}-{}", std::process::id(), name))
    }

    #[test]
    fn trace_entry_type_round_trips_through_u32() {
        for t in [
            TraceEntryType::MemoryRead,
            TraceEntryType::MemoryWrite,
            TraceEntryType::HeapAllocSize,
            TraceEntryType::HeapAllocReturn,
            TraceEntryType::HeapFree,
            TraceEntryType::Branch,
            TraceEntryType::StackPointerInfo,
            TraceEntryType::StackPointerModification,
        ] {
            assert_eq!(TraceEntryType::from_u32(t as u32), Some(t));
        }
        assert_eq!(TraceEntryType::from_u32(0), None);
    }

    #[test]
    fn record_flushes_once_the_buffer_fills_and_on_explicit_flush() {
        let path = scratch_path("flush");
        let mut w = TraceWriter::create(&path).unwrap();
        let entry = TraceEntry::new(TraceEntryType::MemoryRead, 0, 8, 0x1000, 0x2000);
        for _ in 0..TRACE_BUFFER_ENTRIES - 1 {
            w.record(entry).unwrap();
        }
        assert_eq!(w.buffered_len(), TRACE_BUFFER_ENTRIES - 1);
        w.record(entry).unwrap();
        assert_eq!(w.buffered_len(), 0);

        w.record(entry).unwrap();
        w.flush().unwrap();
        assert_eq!(w.buffered_len(), 0);

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), (TRACE_BUFFER_ENTRIES + 1) * 24);
        let _ = std::fs::remove_file(&path);
    }
}
