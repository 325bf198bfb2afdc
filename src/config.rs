//! Partition config file format: two lines, backing file path then cluster
//! count. Kept deliberately small rather than pulling in a config crate for
//! two fields.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("config file must have exactly two non-empty lines: path, cluster count")]
    MalformedLineCount,
    #[error("second line {0:?} is not a valid cluster count")]
    InvalidClusterCount(String),
}

/// Parsed contents of a partition config file.
#[derive(Debug, Clone)]
pub struct PartitionConfig {
    pub file_path: PathBuf,
    pub num_clusters: u64,
}

impl PartitionConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let mut lines = contents.lines().map(str::trim).filter(|l| !l.is_empty());
        let path = lines.next().ok_or(ConfigError::MalformedLineCount)?;
        let count = lines.next().ok_or(ConfigError::MalformedLineCount)?;
        if lines.next().is_some() {
            return Err(ConfigError::MalformedLineCount);
        }
        let num_clusters = count
            .parse()
            .map_err(|_| ConfigError::InvalidClusterCount(count.to_string()))?;
        Ok(Self {
            file_path: PathBuf::from(path),
            num_clusters,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_two_lines() {
        let cfg = PartitionConfig::parse("swap.bin\n4096\n").unwrap();
        assert_eq!(cfg.file_path, PathBuf::from("swap.bin"));
        assert_eq!(cfg.num_clusters, 4096);
    }

    #[test]
    fn rejects_extra_lines() {
        assert!(PartitionConfig::parse("a\n1\nb\n").is_err());
    }

    #[test]
    fn rejects_non_numeric_count() {
        assert!(PartitionConfig::parse("a\nnotanumber\n").is_err());
    }
}
