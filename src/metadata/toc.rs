// Copyright 2024 Permafrost Project Authors. Licensed under Apache-2.0.

use super::ComponentType;
use crate::error::{Error, Result};

/// The table of contents: one component file name per line. Its presence
/// under the final name is what makes an SSTable sealed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Toc {
    pub components: Vec<ComponentType>,
}

impl Toc {
    /// The component set a writer declares up front: CRC when the data
    /// file is plain, CompressionInfo when it is compressed; Filter only
    /// when a false-positive chance asks for one.
    pub fn for_write(compressed: bool, with_filter: bool) -> Self {
        let mut components = vec![
            ComponentType::Toc,
            ComponentType::Statistics,
            ComponentType::Digest,
            ComponentType::Index,
            ComponentType::Summary,
            ComponentType::Data,
            ComponentType::Scylla,
        ];
        if with_filter {
            components.push(ComponentType::Filter);
        }
        if compressed {
            components.push(ComponentType::CompressionInfo);
        } else {
            components.push(ComponentType::Crc);
        }
        components.sort();
        Self { components }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for component in &self.components {
            out.extend_from_slice(component.file_name().as_bytes());
            out.push(b'\n');
        }
        out
    }

    /// Readers refuse an empty TOC; unknown component names are refused
    /// too rather than silently dropped.
    pub fn deserialize(raw: &[u8]) -> Result<Self> {
        let text =
            std::str::from_utf8(raw).map_err(|_| Error::malformed("TOC is not valid utf-8"))?;
        let mut components = vec![];
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            components.push(ComponentType::from_file_name(line)?);
        }
        if components.is_empty() {
            return Err(Error::malformed("empty TOC"));
        }
        Ok(Self { components })
    }

    pub fn contains(&self, component: ComponentType) -> bool {
        self.components.contains(&component)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let toc = Toc::for_write(true, true);
        let parsed = Toc::deserialize(&toc.serialize()).unwrap();
        assert_eq!(parsed, toc);
        assert!(parsed.contains(ComponentType::CompressionInfo));
        assert!(!parsed.contains(ComponentType::Crc));
    }

    #[test]
    fn empty_toc_is_malformed() {
        assert!(Toc::deserialize(b"").is_err());
        assert!(Toc::deserialize(b"\n\n").is_err());
    }

    #[test]
    fn unknown_component_is_unsupported() {
        assert!(Toc::deserialize(b"Data.db\nWat.db\n").is_err());
    }
}
