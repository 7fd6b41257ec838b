//! Byte provider contract
//!
//! The evaluator walks a random-access byte source through this trait.
//! Reads must fully satisfy the request; the evaluator bounds-checks
//! against `size()` before asking and treats short sources as terminal
//! errors. A `MemoryProvider` double ships with the crate for tests and
//! the CLI.

/// Random-access byte source consumed by the evaluator.
pub trait Provider {
    /// Total number of addressable bytes.
    fn size(&self) -> u64;

    /// Base address the data is nominally mapped at (display only).
    fn base_address(&self) -> u64 {
        0
    }

    /// Fill `buf` with the bytes at `offset`. Callers guarantee
    /// `offset + buf.len() <= size()`.
    fn read(&self, offset: u64, buf: &mut [u8]);
}

/// In-memory provider backed by a byte vector.
#[derive(Debug, Clone, Default)]
pub struct MemoryProvider {
    data: Vec<u8>,
    base_address: u64,
}

impl MemoryProvider {
    pub fn new(data: Vec<u8>) -> Self {
        MemoryProvider {
            data,
            base_address: 0,
        }
    }

    pub fn with_base_address(data: Vec<u8>, base_address: u64) -> Self {
        MemoryProvider { data, base_address }
    }
}

impl Provider for MemoryProvider {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn base_address(&self) -> u64 {
        self.base_address
    }

    fn read(&self, offset: u64, buf: &mut [u8]) {
        let start = offset as usize;
        let end = start + buf.len();
        buf.copy_from_slice(&self.data[start..end]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_provider_read() {
        let provider = MemoryProvider::new(vec![0x11, 0x22, 0x33, 0x44]);
        assert_eq!(provider.size(), 4);

        let mut buf = [0u8; 2];
        provider.read(1, &mut buf);
        assert_eq!(buf, [0x22, 0x33]);
    }

    #[test]
    fn test_memory_provider_base_address() {
        let provider = MemoryProvider::with_base_address(vec![0], 0x8000_0000);
        assert_eq!(provider.base_address(), 0x8000_0000);
    }
}
