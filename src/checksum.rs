// Copyright 2024 Permafrost Project Authors. Licensed under Apache-2.0.

use crate::error::{Error, Result};

/// Incremental CRC32 over everything written to the data file; the final
/// value becomes the Digest component.
#[derive(Default)]
pub struct FullChecksum {
    hasher: crc32fast::Hasher,
}

impl FullChecksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize(self) -> u32 {
        self.hasher.finalize()
    }
}

pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

pub fn verify_crc32(data: &[u8], expected: u32) -> Result<()> {
    let found = crc32fast::hash(data);
    if found != expected {
        return Err(Error::checksum(found, expected));
    }
    Ok(())
}

/// The Digest component is the ASCII decimal rendering of the full-file
/// checksum.
pub fn format_digest(checksum: u32) -> String {
    checksum.to_string()
}

pub fn parse_digest(raw: &[u8]) -> Result<u32> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| Error::malformed("digest is not a decimal checksum"))
}
