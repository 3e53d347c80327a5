//! CRC-32 and MD5 checksum primitives shared by every pack-file backend.

use crc::{CRC_32_ISO_HDLC, Crc};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Computes the CRC-32 (ISO-HDLC) checksum of a byte slice.
#[must_use]
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut digest = CRC32.digest();
    digest.update(bytes);
    digest.finalize()
}

/// Incremental MD5 accumulator. Mirrors the `update`/`finalize` shape the baker needs to hash
/// the tree, the MD5 entry table and the whole file without holding all three in memory twice.
pub struct Md5Accumulator {
    context: md5::Context,
}

impl Default for Md5Accumulator {
    fn default() -> Self {
        Self { context: md5::Context::new() }
    }
}

impl Md5Accumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.context.consume(bytes);
    }

    #[must_use]
    pub fn finalize(self) -> [u8; 16] {
        self.context.compute().0
    }
}

/// One-shot MD5 over a single buffer.
#[must_use]
pub fn md5(bytes: &[u8]) -> [u8; 16] {
    let mut accumulator = Md5Accumulator::new();
    accumulator.update(bytes);
    accumulator.finalize()
}
