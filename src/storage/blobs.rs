//! Blob storage for envelope-encrypted file bodies
//!
//! Handles are generated by the store and are the only way back to a blob.

use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Opaque byte storage addressed by handle
pub trait BlobStore: Send + Sync {
    /// Store bytes and return a fresh handle
    fn put(&self, data: &[u8]) -> Result<String>;

    /// Read the bytes behind a handle
    fn get(&self, handle: &str) -> Result<Vec<u8>>;

    /// Remove a blob; removing an absent handle is not an error
    fn delete(&self, handle: &str) -> Result<()>;
}

fn new_handle() -> String {
    format!("{}.enc", Uuid::new_v4().simple())
}

/// Write through a temporary file, then move it into place
fn write_blob(tmp_path: &Path, path: &Path, data: &[u8]) -> Result<()> {
    let mut file = File::create(tmp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    fs::rename(tmp_path, path)?;
    Ok(())
}

/// Blobs as files in one directory
pub struct FsBlobStore {
    /// Blob directory
    blob_dir: PathBuf,
    /// Bytes currently stored
    stored_bytes: AtomicU64,
}

impl FsBlobStore {
    /// Open a blob directory, creating it if needed
    pub fn open<P: AsRef<Path>>(blob_dir: P) -> Result<Self> {
        let blob_dir = blob_dir.as_ref().to_path_buf();
        fs::create_dir_all(&blob_dir)?;

        let mut total = 0u64;
        for entry in fs::read_dir(&blob_dir)?.flatten() {
            if let Ok(metadata) = entry.metadata() {
                if metadata.is_file() {
                    total += metadata.len();
                }
            }
        }

        info!("Blob store at {:?}: {} bytes", blob_dir, total);

        Ok(FsBlobStore {
            blob_dir,
            stored_bytes: AtomicU64::new(total),
        })
    }

    /// Resolve a handle to a path inside the blob directory
    fn blob_path(&self, handle: &str) -> Result<PathBuf> {
        let valid = !handle.is_empty()
            && handle
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
            && !handle.starts_with('.');
        if !valid {
            return Err(Error::NotFound(format!("blob {}", handle)));
        }
        Ok(self.blob_dir.join(handle))
    }

    /// Write a blob under `handle`; a failed write leaves no temporary file
    fn put_at(&self, handle: &str, data: &[u8]) -> Result<()> {
        let path = self.blob_path(handle)?;
        let tmp_path = path.with_extension("tmp");

        if let Err(e) = write_blob(&tmp_path, &path, data) {
            if let Err(cleanup) = fs::remove_file(&tmp_path) {
                if cleanup.kind() != ErrorKind::NotFound {
                    warn!("Failed to remove {:?}: {}", tmp_path, cleanup);
                }
            }
            return Err(e);
        }

        self.stored_bytes
            .fetch_add(data.len() as u64, Ordering::SeqCst);

        debug!("Stored blob {} ({} bytes)", handle, data.len());
        Ok(())
    }

    /// Bytes currently stored
    pub fn size(&self) -> u64 {
        self.stored_bytes.load(Ordering::Relaxed)
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, data: &[u8]) -> Result<String> {
        let handle = new_handle();
        self.put_at(&handle, data)?;
        Ok(handle)
    }

    fn get(&self, handle: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(handle)?;

        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("blob {}", handle)))
            }
            Err(e) => return Err(e.into()),
        };
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        debug!("Read blob {} ({} bytes)", handle, data.len());
        Ok(data)
    }

    fn delete(&self, handle: &str) -> Result<()> {
        let path = self.blob_path(handle)?;

        let size = match fs::metadata(&path) {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        match fs::remove_file(&path) {
            Ok(()) => {
                self.stored_bytes.fetch_sub(size, Ordering::SeqCst);
                debug!("Removed blob {}", handle);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Blobs held in memory (for testing)
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs
    pub fn count(&self) -> usize {
        self.blobs.read().len()
    }

    /// Handles of all stored blobs
    pub fn handles(&self) -> Vec<String> {
        self.blobs.read().keys().cloned().collect()
    }

    /// Overwrite a blob in place
    pub fn replace(&self, handle: &str, data: Vec<u8>) -> bool {
        match self.blobs.write().get_mut(handle) {
            Some(slot) => {
                *slot = data;
                true
            }
            None => false,
        }
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, data: &[u8]) -> Result<String> {
        let handle = new_handle();
        self.blobs.write().insert(handle.clone(), data.to_vec());
        Ok(handle)
    }

    fn get(&self, handle: &str) -> Result<Vec<u8>> {
        self.blobs
            .read()
            .get(handle)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("blob {}", handle)))
    }

    fn delete(&self, handle: &str) -> Result<()> {
        self.blobs.write().remove(handle);
        Ok(())
    }
}
