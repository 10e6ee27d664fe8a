//! Durable sync progress ("watermark") for restart.

use ethers::types::Address;
use log::debug;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::MetadataError;

const ADDRESS_SIZE: usize = 20;

/// Progress record persisted after every reconciled batch.
///
/// The chain id and registry address are stored alongside the watermark so a
/// node pointed at a different chain or contract does not resume from a
/// height that means nothing there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RlnMetadata {
    pub last_processed_block: u64,
    pub chain_id: u64,
    pub contract_address: Address,
}

impl RlnMetadata {
    /// Size of the serialized record.
    pub const SIZE: usize = 8 + 8 + ADDRESS_SIZE;

    /// Encodes as `last_processed_block (u64 LE) | chain_id (u64 LE) | address (20 bytes)`.
    pub fn serialize(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..8].copy_from_slice(&self.last_processed_block.to_le_bytes());
        out[8..16].copy_from_slice(&self.chain_id.to_le_bytes());
        out[16..].copy_from_slice(self.contract_address.as_bytes());
        out
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, MetadataError> {
        if bytes.len() != Self::SIZE {
            return Err(MetadataError::Malformed {
                expected: Self::SIZE,
                found: bytes.len(),
            });
        }

        let mut block = [0u8; 8];
        block.copy_from_slice(&bytes[0..8]);
        let mut chain_id = [0u8; 8];
        chain_id.copy_from_slice(&bytes[8..16]);

        Ok(Self {
            last_processed_block: u64::from_le_bytes(block),
            chain_id: u64::from_le_bytes(chain_id),
            contract_address: Address::from_slice(&bytes[16..]),
        })
    }
}

/// Key-value record holding [`RlnMetadata`].
pub trait MetadataStore: Send + Sync {
    /// `Ok(None)` when nothing was persisted yet.
    fn get_metadata(&self) -> Result<Option<RlnMetadata>, MetadataError>;

    fn set_metadata(&self, metadata: &RlnMetadata) -> Result<(), MetadataError>;
}

/// Stores the record in a single file, replaced atomically on each write.
#[derive(Debug, Clone)]
pub struct FileMetadataStore {
    path: PathBuf,
}

impl FileMetadataStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetadataStore for FileMetadataStore {
    fn get_metadata(&self) -> Result<Option<RlnMetadata>, MetadataError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&self.path)?;
        RlnMetadata::deserialize(&bytes).map(Some)
    }

    fn set_metadata(&self, metadata: &RlnMetadata) -> Result<(), MetadataError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, metadata.serialize())?;
        std::fs::rename(&tmp_path, &self.path)?;

        debug!(
            "wrote metadata to {} (lastProcessedBlock={})",
            self.path.display(),
            metadata.last_processed_block
        );
        Ok(())
    }
}

/// Keeps the record in memory only; used by ephemeral nodes and tests.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    record: Mutex<Option<RlnMetadata>>,
}

impl MemoryMetadataStore {
    pub fn with_metadata(metadata: RlnMetadata) -> Self {
        Self {
            record: Mutex::new(Some(metadata)),
        }
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn get_metadata(&self) -> Result<Option<RlnMetadata>, MetadataError> {
        Ok(*self
            .record
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    fn set_metadata(&self, metadata: &RlnMetadata) -> Result<(), MetadataError> {
        *self
            .record
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(*metadata);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> RlnMetadata {
        RlnMetadata {
            last_processed_block: 123_456,
            chain_id: 1337,
            contract_address: Address::repeat_byte(0x42),
        }
    }

    #[test]
    fn test_serialized_layout() {
        let bytes = sample().serialize();

        assert_eq!(bytes.len(), 36);
        assert_eq!(&bytes[0..8], &123_456u64.to_le_bytes());
        assert_eq!(&bytes[8..16], &1337u64.to_le_bytes());
        assert_eq!(&bytes[16..], &[0x42u8; 20]);
        assert_eq!(RlnMetadata::deserialize(&bytes).unwrap(), sample());
    }

    #[test]
    fn test_deserialize_rejects_wrong_length() {
        let result = RlnMetadata::deserialize(&[0u8; 8]);
        assert!(matches!(
            result,
            Err(MetadataError::Malformed {
                expected: 36,
                found: 8
            })
        ));
    }

    #[test]
    fn test_file_store_missing_file_is_none() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = FileMetadataStore::new(temp_dir.path().join("rln_metadata.bin"));

        assert_eq!(store.get_metadata().unwrap(), None);
    }

    #[test]
    fn test_file_store_persists_record() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("nested").join("rln_metadata.bin");
        let store = FileMetadataStore::new(&path);

        store.set_metadata(&sample()).unwrap();

        let reopened = FileMetadataStore::new(&path);
        assert_eq!(reopened.get_metadata().unwrap(), Some(sample()));
    }

    #[test]
    fn test_memory_store_overwrites() {
        let store = MemoryMetadataStore::with_metadata(sample());
        let mut next = sample();
        next.last_processed_block += 10;

        store.set_metadata(&next).unwrap();
        assert_eq!(store.get_metadata().unwrap(), Some(next));
    }
}
