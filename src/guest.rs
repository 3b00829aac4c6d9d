//! Guest memory access. This engine runs in-process with the guest — like
//! the original tool, not like a ptrace-based debugger — so "reading guest
//! bytes" ordinarily means dereferencing a raw pointer into the same
//! address space. The `GuestMemory` seam exists so the scanner (C4) and the
//! tracer plugin (C13) can be exercised in tests against an in-process fake
//! byte stream instead of real mapped guest code.

/// A source of guest instruction bytes, addressed by guest virtual address.
pub trait GuestMemory {
    /// Returns up to `len` bytes starting at `addr`. May return fewer than
    /// `len` bytes near the end of a mapped region; callers that need an
    /// exact width should check the returned slice's length.
    fn read(&self, addr: u64, len: usize) -> &[u8];
}

/// The live guest: the engine and the guest share an address space, so
/// reading its code is a direct, unchecked pointer dereference.
pub struct ProcessMemory;

impl GuestMemory for ProcessMemory {
    fn read(&self, addr: u64, len: usize) -> &[u8] {
        unsafe { std::slice::from_raw_parts(addr as *const u8, len) }
    }
}

/// A fixed in-process byte buffer addressed as if it started at `base`,
/// used by scanner/tracer tests in place of a real mapped guest (§4.13).
pub struct SliceMemory {
    base: u64,
    bytes: Vec<u8>,
}

impl SliceMemory {
    pub fn new(base: u64, bytes: Vec<u8>) -> SliceMemory {
        SliceMemory { base, bytes }
    }

    pub fn base(&self) -> u64 {
        self.base
    }
}

impl GuestMemory for SliceMemory {
    fn read(&self, addr: u64, len: usize) -> &[u8] {
        let offset = (addr - self.base) as usize;
        let end = (offset + len).min(self.bytes.len());
        &self.bytes[offset.min(end)..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_memory_reads_at_offset() {
        let m = SliceMemory::new(0x1000, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(m.read(0x1002, 2), &[3, 4]);
    }

    #[test]
    fn slice_memory_truncates_near_the_end() {
        let m = SliceMemory::new(0x1000, vec![1, 2, 3]);
        assert_eq!(m.read(0x1002, 4), &[3]);
    }
}
