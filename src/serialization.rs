//! Snapshot artifact serialization

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use crate::error::SerializationError;
use crate::live::AllocatorStats;

/// Suffix of the snapshot written before a scheduled defragmentation
pub const DEFRAGMENT_BEFORE_SUFFIX: &str = "_Defragment_1Before";
/// Suffix of the snapshot written after a scheduled defragmentation
pub const DEFRAGMENT_AFTER_SUFFIX: &str = "_Defragment_2After";

/// Trait for pluggable snapshot serialization
pub trait SnapshotSerializer {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializationError>;

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializationError>;

    /// Name of this serialization method
    fn name(&self) -> &str;

    /// File extension of artifacts, without the dot
    fn extension(&self) -> &str;
}

/// Bincode serialization backend
#[derive(Debug, Clone, Default)]
pub struct BincodeSerializer;

impl BincodeSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl SnapshotSerializer for BincodeSerializer {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializationError> {
        bincode::serialize(value).map_err(|e| SerializationError::SerializationFailed {
            reason: format!("Bincode serialization failed: {}", e),
        })
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializationError> {
        bincode::deserialize(bytes).map_err(|e| SerializationError::DeserializationFailed {
            reason: format!("Bincode deserialization failed: {}", e),
        })
    }

    fn name(&self) -> &str {
        "bincode"
    }

    fn extension(&self) -> &str {
        "bin"
    }
}

/// JSON serialization backend. Snapshots are pretty-printed.
#[derive(Debug, Clone)]
pub struct JsonSerializer {
    pretty: bool,
}

impl JsonSerializer {
    pub fn new() -> Self {
        Self { pretty: false }
    }

    pub fn new_pretty() -> Self {
        Self { pretty: true }
    }
}

impl Default for JsonSerializer {
    fn default() -> Self {
        Self::new_pretty()
    }
}

impl SnapshotSerializer for JsonSerializer {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializationError> {
        let result = if self.pretty {
            serde_json::to_vec_pretty(value)
        } else {
            serde_json::to_vec(value)
        };

        result.map_err(|e| SerializationError::SerializationFailed {
            reason: format!("JSON serialization failed: {}", e),
        })
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializationError> {
        serde_json::from_slice(bytes).map_err(|e| SerializationError::DeserializationFailed {
            reason: format!("JSON deserialization failed: {}", e),
        })
    }

    fn name(&self) -> &str {
        "json"
    }

    fn extension(&self) -> &str {
        "json"
    }
}

/// On-disk format of snapshot artifacts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SnapshotFormat {
    #[default]
    Json,
    Bincode,
}

impl SnapshotFormat {
    pub fn extension(self) -> &'static str {
        match self {
            SnapshotFormat::Json => "json",
            SnapshotFormat::Bincode => "bin",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "json" => Some(SnapshotFormat::Json),
            "bincode" | "bin" => Some(SnapshotFormat::Bincode),
            _ => None,
        }
    }

    fn encode<T: Serialize>(self, value: &T) -> Result<Vec<u8>, SerializationError> {
        match self {
            SnapshotFormat::Json => JsonSerializer::new_pretty().serialize(value),
            SnapshotFormat::Bincode => BincodeSerializer::new().serialize(value),
        }
    }

    /// Decode an artifact previously written in this format
    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, SerializationError> {
        match self {
            SnapshotFormat::Json => JsonSerializer::new().deserialize(bytes),
            SnapshotFormat::Bincode => BincodeSerializer::new().deserialize(bytes),
        }
    }
}

/// Writes allocator statistics snapshots named after trace lines
#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    dir: PathBuf,
    prefix: String,
    format: SnapshotFormat,
}

impl SnapshotWriter {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>, format: SnapshotFormat) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            format,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn format(&self) -> SnapshotFormat {
        self.format
    }

    /// `<dir>/<prefix>_Line<NNNN><suffix>.<ext>`
    pub fn snapshot_path(&self, line: usize, suffix: &str) -> PathBuf {
        self.dir.join(format!(
            "{}_Line{:04}{}.{}",
            self.prefix,
            line,
            suffix,
            self.format.extension()
        ))
    }

    pub fn write(
        &self,
        line: usize,
        suffix: &str,
        stats: &AllocatorStats,
    ) -> Result<PathBuf, SerializationError> {
        let path = self.snapshot_path(line, suffix);
        let bytes = self.format.encode(stats)?;

        let write_failed = |e: std::io::Error| SerializationError::WriteFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        };
        fs::create_dir_all(&self.dir).map_err(write_failed)?;
        fs::write(&path, bytes).map_err(write_failed)?;

        tracing::info!("Wrote snapshot {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::StatInfo;
    use chrono::Utc;

    fn stats() -> AllocatorStats {
        AllocatorStats {
            captured_at: Utc::now(),
            total: StatInfo {
                block_count: 1,
                allocation_count: 2,
                used_bytes: 512,
                unused_bytes: 0,
            },
            memory_heaps: vec![],
            memory_types: vec![],
            pools: vec![],
            allocations: None,
        }
    }

    #[test]
    fn test_snapshot_names() {
        let writer = SnapshotWriter::new("out", "AllocReplay", SnapshotFormat::Json);
        assert_eq!(writer.snapshot_path(5, ""), PathBuf::from("out/AllocReplay_Line0005.json"));
        assert_eq!(
            writer.snapshot_path(12345, DEFRAGMENT_BEFORE_SUFFIX),
            PathBuf::from("out/AllocReplay_Line12345_Defragment_1Before.json")
        );

        let writer = SnapshotWriter::new("out", "X", SnapshotFormat::Bincode);
        assert_eq!(
            writer.snapshot_path(7, DEFRAGMENT_AFTER_SUFFIX),
            PathBuf::from("out/X_Line0007_Defragment_2After.bin")
        );
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let original = stats();
        for format in [SnapshotFormat::Json, SnapshotFormat::Bincode] {
            let writer = SnapshotWriter::new(dir.path(), "Snap", format);
            let path = writer.write(3, "", &original).unwrap();
            let decoded: AllocatorStats = format.decode(&fs::read(path).unwrap()).unwrap();
            assert_eq!(decoded, original);
        }
    }

    #[test]
    fn test_write_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();

        let writer = SnapshotWriter::new(blocker.join("nested"), "Snap", SnapshotFormat::Json);
        assert!(matches!(
            writer.write(1, "", &stats()),
            Err(SerializationError::WriteFailed { .. })
        ));
    }

    #[test]
    fn test_serializer_names() {
        assert_eq!(JsonSerializer::default().name(), "json");
        assert_eq!(BincodeSerializer::new().extension(), "bin");
        assert_eq!(SnapshotFormat::from_name("BINCODE"), Some(SnapshotFormat::Bincode));
        assert_eq!(SnapshotFormat::from_name("xml"), None);
    }
}
