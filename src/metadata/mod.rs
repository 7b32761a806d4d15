// Copyright 2024 Permafrost Project Authors. Licensed under Apache-2.0.

//! Metadata components that make a sealed SSTable self-describing: the
//! TOC, summary, filter, statistics, compression info, Scylla extensions
//! and the filename grammar binding them together.

mod compression;
mod filter;
mod scylla;
mod statistics;
mod summary;
mod toc;

use std::path::{Path, PathBuf};

pub use compression::*;
pub use filter::*;
pub use scylla::*;
pub use statistics::*;
pub use summary::*;
pub use toc::*;

use crate::error::{Error, Result};

/// Every file an SSTable can consist of.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ComponentType {
    Data,
    Index,
    Summary,
    Filter,
    Statistics,
    CompressionInfo,
    Crc,
    Digest,
    Scylla,
    Toc,
    TemporaryToc,
}

impl ComponentType {
    pub fn file_name(self) -> &'static str {
        match self {
            ComponentType::Data => "Data.db",
            ComponentType::Index => "Index.db",
            ComponentType::Summary => "Summary.db",
            ComponentType::Filter => "Filter.db",
            ComponentType::Statistics => "Statistics.db",
            ComponentType::CompressionInfo => "CompressionInfo.db",
            ComponentType::Crc => "CRC.db",
            ComponentType::Digest => "Digest.crc32",
            ComponentType::Scylla => "Scylla.db",
            ComponentType::Toc => "TOC.txt",
            ComponentType::TemporaryToc => "TOC.txt.tmp",
        }
    }

    pub fn from_file_name(name: &str) -> Result<Self> {
        Ok(match name {
            "Data.db" => ComponentType::Data,
            "Index.db" => ComponentType::Index,
            "Summary.db" => ComponentType::Summary,
            "Filter.db" => ComponentType::Filter,
            "Statistics.db" => ComponentType::Statistics,
            "CompressionInfo.db" => ComponentType::CompressionInfo,
            "CRC.db" => ComponentType::Crc,
            "Digest.crc32" => ComponentType::Digest,
            "Scylla.db" => ComponentType::Scylla,
            "TOC.txt" => ComponentType::Toc,
            "TOC.txt.tmp" => ComponentType::TemporaryToc,
            other => return Err(Error::unsupported("component", other)),
        })
    }
}

/// On-disk format versions. Only "mc" row encoding is implemented; the
/// parser still recognizes the legacy names so their files can be listed
/// and refused cleanly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Version {
    Ka,
    La,
    Mc,
}

impl Version {
    pub fn as_str(self) -> &'static str {
        match self {
            Version::Ka => "ka",
            Version::La => "la",
            Version::Mc => "mc",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(match raw {
            "ka" => Version::Ka,
            "la" => Version::La,
            "mc" => Version::Mc,
            other => return Err(Error::unsupported("sstable version", other)),
        })
    }
}

/// Identity of one SSTable on disk: directory, version and generation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Descriptor {
    pub dir: PathBuf,
    pub version: Version,
    pub generation: u64,
}

impl Descriptor {
    pub fn new(dir: impl Into<PathBuf>, version: Version, generation: u64) -> Self {
        Self {
            dir: dir.into(),
            version,
            generation,
        }
    }

    /// `<version>-<generation>-big-<component>` under the table directory.
    pub fn path(&self, component: ComponentType) -> PathBuf {
        self.dir.join(format!(
            "{}-{}-big-{}",
            self.version.as_str(),
            self.generation,
            component.file_name()
        ))
    }

    /// Parse a component path. A trailing `staging`, `upload` or
    /// `snapshots/<name>` directory between the table directory and the
    /// file is tolerated.
    pub fn parse_path(path: &Path) -> Result<(Descriptor, ComponentType)> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::malformed(format!("not an sstable path: {path:?}")))?;
        let dir = path.parent().unwrap_or_else(|| Path::new("")).to_path_buf();

        let mut pieces = file_name.splitn(3, '-');
        let (version, generation, rest) = match (pieces.next(), pieces.next(), pieces.next()) {
            (Some(v), Some(g), Some(rest)) if Version::parse(v).is_ok() => {
                (Version::parse(v)?, g, rest)
            }
            _ => {
                // Legacy "ka" names carry keyspace and table up front:
                // `<ks>-<cf>-ka-<gen>-<component>`.
                let parts: Vec<&str> = file_name.splitn(5, '-').collect();
                if parts.len() == 5 && parts[2] == "ka" {
                    let generation = parts[3]
                        .parse()
                        .map_err(|_| Error::malformed(format!("generation in {file_name}")))?;
                    let component = ComponentType::from_file_name(parts[4])?;
                    return Ok((Descriptor::new(dir, Version::Ka, generation), component));
                }
                return Err(Error::malformed(format!("sstable filename {file_name}")));
            }
        };
        let generation = generation
            .parse()
            .map_err(|_| Error::malformed(format!("generation in {file_name}")))?;
        let component_name = rest
            .strip_prefix("big-")
            .ok_or_else(|| Error::malformed(format!("format tag in {file_name}")))?;
        let component = ComponentType::from_file_name(component_name)?;
        Ok((Descriptor::new(dir, version, generation), component))
    }
}

/// Is `dir` one of the auxiliary subdirectories the filename grammar
/// tolerates between a table directory and its sstable files?
pub fn is_auxiliary_dir(dir: &Path) -> bool {
    match dir.file_name().and_then(|n| n.to_str()) {
        Some("staging") | Some("upload") => true,
        Some(_) => dir
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            == Some("snapshots"),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mc_path_roundtrip() {
        let desc = Descriptor::new("/data/ks/cf", Version::Mc, 42);
        let path = desc.path(ComponentType::Data);
        assert!(path.ends_with("mc-42-big-Data.db"));
        let (parsed, component) = Descriptor::parse_path(&path).unwrap();
        assert_eq!(parsed, desc);
        assert_eq!(component, ComponentType::Data);
    }

    #[test]
    fn legacy_ka_names_parse() {
        let path = Path::new("/data/ks/cf/myks-mycf-ka-7-Statistics.db");
        let (desc, component) = Descriptor::parse_path(path).unwrap();
        assert_eq!(desc.version, Version::Ka);
        assert_eq!(desc.generation, 7);
        assert_eq!(component, ComponentType::Statistics);
    }

    #[test]
    fn auxiliary_dirs() {
        assert!(is_auxiliary_dir(Path::new("/data/ks/cf/staging")));
        assert!(is_auxiliary_dir(Path::new("/data/ks/cf/upload")));
        assert!(is_auxiliary_dir(Path::new("/data/ks/cf/snapshots/s1")));
        assert!(!is_auxiliary_dir(Path::new("/data/ks/cf")));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(Descriptor::parse_path(Path::new("/tmp/README.md")).is_err());
        assert!(Descriptor::parse_path(Path::new("/tmp/zz-1-big-Data.db")).is_err());
    }
}
