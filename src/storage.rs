use crate::metadata::TorrentMetadata;
use bincode::Options;
use serde::{Deserialize, Serialize};
use sled::Transactional;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use std::path::Path;

const RECORD_MAGIC: [u8; 4] = *b"TRW1";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sled: {0}")]
    Sled(#[from] sled::Error),
    #[error("record codec: {0}")]
    Codec(#[from] bincode::Error),
    #[cfg(test)]
    #[error("record has no magic prefix")]
    BadMagic,
}

impl From<TransactionError<StorageError>> for StorageError {
    fn from(err: TransactionError<StorageError>) -> Self {
        match err {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => StorageError::Sled(e),
        }
    }
}

/// Persistence collaborator of the event loop.
pub trait Database {
    fn does_torrent_exist(&self, info_hash: &[u8; 20]) -> Result<bool, StorageError>;

    /// Inserts the torrent and its files atomically. Returns `false` when
    /// nothing was written (already present, or nothing worth keeping).
    fn add_new_torrent(&self, metadata: &TorrentMetadata) -> Result<bool, StorageError>;

    fn close(&self) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorrentRecord {
    pub name: String,
    pub total_size: u64,
    pub discovered_on: i64,
    pub file_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub size: u64,
}

fn bincode_opts() -> impl bincode::Options {
    bincode::DefaultOptions::new()
        .with_varint_encoding()
        .with_limit(16 * 1024 * 1024)
}

fn encode_record<T: Serialize>(record: &T) -> Result<Vec<u8>, StorageError> {
    let payload = bincode_opts().serialize(record)?;
    let mut out = Vec::with_capacity(RECORD_MAGIC.len() + payload.len());
    out.extend_from_slice(&RECORD_MAGIC);
    out.extend_from_slice(&payload);
    Ok(out)
}

#[cfg(test)]
fn decode_record<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    let payload = bytes
        .strip_prefix(&RECORD_MAGIC[..])
        .ok_or(StorageError::BadMagic)?;
    Ok(bincode_opts().deserialize(payload)?)
}

fn file_key(info_hash: &[u8; 20], index: u32) -> [u8; 24] {
    let mut key = [0u8; 24];
    key[..20].copy_from_slice(info_hash);
    key[20..].copy_from_slice(&index.to_be_bytes());
    key
}

/// sled-backed store: `torrents` keyed by infohash, `files` keyed by
/// infohash || big-endian file index.
pub struct SledDatabase {
    db: sled::Db,
    torrents: sled::Tree,
    files: sled::Tree,
}

impl SledDatabase {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let torrents = db.open_tree("torrents")?;
        let files = db.open_tree("files")?;
        Ok(Self {
            db,
            torrents,
            files,
        })
    }

    #[cfg(test)]
    pub fn get_torrent(&self, info_hash: &[u8; 20]) -> Result<Option<TorrentRecord>, StorageError> {
        let Some(bytes) = self.torrents.get(info_hash)? else {
            return Ok(None);
        };
        Ok(Some(decode_record(&bytes)?))
    }

    #[cfg(test)]
    pub fn get_files(&self, info_hash: &[u8; 20]) -> Result<Vec<FileRecord>, StorageError> {
        let mut out = Vec::new();
        for item in self.files.scan_prefix(info_hash) {
            let (_, v) = item?;
            out.push(decode_record(&v)?);
        }
        Ok(out)
    }

    /// Stored torrents. O(n) in sled, so only called at startup.
    pub fn torrent_count(&self) -> usize {
        self.torrents.len()
    }
}

impl Database for SledDatabase {
    fn does_torrent_exist(&self, info_hash: &[u8; 20]) -> Result<bool, StorageError> {
        Ok(self.torrents.contains_key(info_hash)?)
    }

    fn add_new_torrent(&self, metadata: &TorrentMetadata) -> Result<bool, StorageError> {
        if metadata.total_size == 0 {
            tracing::debug!(hash = %metadata.hex(), "storage: skipping torrent with zero size");
            return Ok(false);
        }

        let record = encode_record(&TorrentRecord {
            name: metadata.name.clone(),
            total_size: metadata.total_size,
            discovered_on: metadata.discovered_on,
            file_count: metadata.files.len() as u32,
        })?;
        let mut file_rows = Vec::with_capacity(metadata.files.len());
        for (i, f) in metadata.files.iter().enumerate() {
            let row = encode_record(&FileRecord {
                path: f.path.clone(),
                size: f.size,
            })?;
            file_rows.push((file_key(&metadata.info_hash, i as u32), row));
        }

        let key = metadata.info_hash;
        let inserted = (&self.torrents, &self.files)
            .transaction(|(torrents, files)| {
                if torrents.get(key)?.is_some() {
                    return Ok(false);
                }
                torrents.insert(&key[..], record.as_slice())?;
                for (k, v) in &file_rows {
                    files.insert(&k[..], v.as_slice())?;
                }
                Ok::<_, ConflictableTransactionError<StorageError>>(true)
            })
            .map_err(StorageError::from)?;
        Ok(inserted)
    }

    fn close(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::File;

    fn metadata(hash: u8, sizes: &[u64]) -> TorrentMetadata {
        let files: Vec<File> = sizes
            .iter()
            .enumerate()
            .map(|(i, s)| File {
                path: format!("dir/file{i}"),
                size: *s,
            })
            .collect();
        TorrentMetadata {
            info_hash: [hash; 20],
            name: format!("torrent {hash}"),
            total_size: sizes.iter().sum(),
            files,
            discovered_on: 1_700_000_000,
        }
    }

    #[test]
    fn insert_then_exists() {
        let dir = tempfile::tempdir().unwrap();
        let db = SledDatabase::open(dir.path().join("db")).unwrap();

        let m = metadata(1, &[10, 20, 30]);
        assert!(!db.does_torrent_exist(&m.info_hash).unwrap());
        assert!(db.add_new_torrent(&m).unwrap());
        assert!(db.does_torrent_exist(&m.info_hash).unwrap());

        let rec = db.get_torrent(&m.info_hash).unwrap().unwrap();
        assert_eq!(
            rec,
            TorrentRecord {
                name: "torrent 1".into(),
                total_size: 60,
                discovered_on: 1_700_000_000,
                file_count: 3,
            }
        );
        let files = db.get_files(&m.info_hash).unwrap();
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["dir/file0", "dir/file1", "dir/file2"]);
        db.close().unwrap();
    }

    #[test]
    fn existing_hash_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let db = SledDatabase::open(dir.path().join("db")).unwrap();

        assert!(db.add_new_torrent(&metadata(2, &[5])).unwrap());
        let mut again = metadata(2, &[7, 8]);
        again.name = "renamed".into();
        assert!(!db.add_new_torrent(&again).unwrap());

        assert_eq!(db.get_torrent(&[2; 20]).unwrap().unwrap().name, "torrent 2");
        assert_eq!(db.get_files(&[2; 20]).unwrap().len(), 1);
        assert_eq!(db.torrent_count(), 1);
    }

    #[test]
    fn zero_size_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let db = SledDatabase::open(dir.path().join("db")).unwrap();
        assert!(!db.add_new_torrent(&metadata(3, &[0, 0])).unwrap());
        assert!(!db.does_torrent_exist(&[3; 20]).unwrap());
        assert!(db.get_files(&[3; 20]).unwrap().is_empty());
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let db = SledDatabase::open(&path).unwrap();
            db.add_new_torrent(&metadata(4, &[1])).unwrap();
            db.close().unwrap();
        }
        let db = SledDatabase::open(&path).unwrap();
        assert!(db.does_torrent_exist(&[4; 20]).unwrap());
    }

    #[test]
    fn records_without_magic_are_rejected() {
        assert!(matches!(decode_record::<FileRecord>(b"nope"), Err(StorageError::BadMagic)));
    }
}
