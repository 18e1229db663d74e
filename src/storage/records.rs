//! Sled-based record store
//!
//! Uniqueness is carried by the key layout: one key per file, per
//! (file, user) grant, per token, and per file in the live-link table. Every
//! multi-tree change goes through a sled transaction.

use crate::error::{Error, Result};
use crate::storage::{AccessEntry, FileId, FileRecord, ShareableLink};
use chrono::{DateTime, Utc};
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult};
use sled::{Db, Transactional, Tree};
use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;

/// Persistent store for files, grants and links
pub struct RecordStore {
    /// Sled database
    db: Db,
    /// File id -> FileRecord
    files: Tree,
    /// owner ++ file id -> ()
    owner_index: Tree,
    /// file id ++ username -> AccessEntry
    accesses: Tree,
    /// username ++ file id -> ()
    grant_index: Tree,
    /// token -> ShareableLink
    links: Tree,
    /// file id -> token of its live link
    link_heads: Tree,
}

impl RecordStore {
    /// Open or create a record store
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        let store = Self::from_db(db)?;
        info!(
            "Record store opened at {:?}, {} files",
            path.as_ref(),
            store.files.len()
        );
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self> {
        Ok(RecordStore {
            files: db.open_tree("files")?,
            owner_index: db.open_tree("owner_index")?,
            accesses: db.open_tree("accesses")?,
            grant_index: db.open_tree("grant_index")?,
            links: db.open_tree("links")?,
            link_heads: db.open_tree("link_heads")?,
            db,
        })
    }

    /// Allocate a new file id
    pub fn next_file_id(&self) -> Result<FileId> {
        Ok(FileId(self.db.generate_id()? + 1))
    }

    /// Username prefix for the per-user index trees
    fn user_key(username: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(4 + username.len());
        key.extend_from_slice(&(username.len() as u32).to_be_bytes());
        key.extend_from_slice(username.as_bytes());
        key
    }

    fn user_file_key(username: &str, file_id: FileId) -> Vec<u8> {
        let mut key = Self::user_key(username);
        key.extend_from_slice(&file_id.to_key());
        key
    }

    fn access_key(file_id: FileId, username: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(8 + username.len());
        key.extend_from_slice(&file_id.to_key());
        key.extend_from_slice(username.as_bytes());
        key
    }

    /// File id stored in the trailing 8 bytes of an index key
    fn trailing_file_id(key: &[u8]) -> Option<FileId> {
        let start = key.len().checked_sub(8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&key[start..]);
        Some(FileId(u64::from_be_bytes(bytes)))
    }

    fn abort<E: Into<Error>>(e: E) -> ConflictableTransactionError<Error> {
        ConflictableTransactionError::Abort(e.into())
    }

    /// Persist a new file record
    pub fn insert_file(&self, file: &FileRecord) -> Result<()> {
        let key = file.id.to_key();
        let value = bincode::serialize(file)?;
        let owner_key = Self::user_file_key(&file.owner, file.id);

        (&self.files, &self.owner_index).transaction(
            |(files, owner_index)| -> ConflictableTransactionResult<(), Error> {
                files.insert(&key[..], value.as_slice())?;
                owner_index.insert(owner_key.as_slice(), Vec::<u8>::new())?;
                Ok(())
            },
        )?;

        debug!("Saved file {} ({})", file.id, file.name);
        Ok(())
    }

    /// Get a file by id
    pub fn get_file(&self, file_id: FileId) -> Result<Option<FileRecord>> {
        match self.files.get(file_id.to_key())? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    /// Get a file, returning an error if not found
    pub fn get_file_required(&self, file_id: FileId) -> Result<FileRecord> {
        self.get_file(file_id)?
            .ok_or_else(|| Error::NotFound(format!("file {}", file_id)))
    }

    /// All files owned by `username`, oldest first
    pub fn files_owned_by(&self, username: &str) -> Result<Vec<FileRecord>> {
        self.files_in_index(&self.owner_index, username)
    }

    /// All files `username` holds a grant on, oldest first
    pub fn files_granted_to(&self, username: &str) -> Result<Vec<FileRecord>> {
        self.files_in_index(&self.grant_index, username)
    }

    fn files_in_index(&self, index: &Tree, username: &str) -> Result<Vec<FileRecord>> {
        let mut files = Vec::new();

        for result in index.scan_prefix(Self::user_key(username)) {
            let (key, _) = result?;
            if let Some(file_id) = Self::trailing_file_id(&key) {
                if let Some(file) = self.get_file(file_id)? {
                    files.push(file);
                }
            }
        }

        Ok(files)
    }

    /// Delete a file together with its grants and link
    pub fn delete_file(&self, file_id: FileId) -> Result<Option<FileRecord>> {
        let Some(file) = self.get_file(file_id)? else {
            return Ok(None);
        };

        let key = file_id.to_key();
        let owner_key = Self::user_file_key(&file.owner, file_id);
        let grants = self.accesses_for(file_id)?;

        (
            &self.files,
            &self.owner_index,
            &self.accesses,
            &self.grant_index,
            &self.links,
            &self.link_heads,
        )
            .transaction(
                |(files, owner_index, accesses, grant_index, links, link_heads)| -> ConflictableTransactionResult<(), Error> {
                    files.remove(&key[..])?;
                    owner_index.remove(owner_key.as_slice())?;

                    for grant in &grants {
                        accesses.remove(Self::access_key(file_id, &grant.username))?;
                        grant_index.remove(Self::user_file_key(&grant.username, file_id))?;
                    }

                    if let Some(token) = link_heads.remove(&key[..])? {
                        links.remove(token)?;
                    }
                    Ok(())
                },
            )?;

        // Grants committed between the scan above and the transaction. Once
        // the file record is gone no new grant can land.
        let stragglers = self.accesses_for(file_id)?;
        for grant in &stragglers {
            self.remove_access(file_id, &grant.username)?;
        }

        debug!(
            "Deleted file {} with {} grants",
            file_id,
            grants.len() + stragglers.len()
        );
        Ok(Some(file))
    }

    /// Insert or update the single grant for (file, user).
    ///
    /// The grant row and its index entry change in one transaction that also
    /// reads the file record, so a grant racing a delete either lands before
    /// it (and is swept with it) or fails with `NotFound`.
    pub fn upsert_access(
        &self,
        file_id: FileId,
        username: &str,
        can_view: bool,
        can_download: bool,
        now: DateTime<Utc>,
    ) -> Result<AccessEntry> {
        let file_key = file_id.to_key();
        let key = Self::access_key(file_id, username);
        let index_key = Self::user_file_key(username, file_id);

        let entry = (&self.files, &self.accesses, &self.grant_index).transaction(
            |(files, accesses, grant_index)| -> ConflictableTransactionResult<AccessEntry, Error> {
                if files.get(&file_key[..])?.is_none() {
                    return Err(Self::abort(Error::NotFound(format!("file {}", file_id))));
                }

                let entry = match accesses.get(key.as_slice())? {
                    Some(bytes) => {
                        let mut existing: AccessEntry =
                            bincode::deserialize(&bytes).map_err(Self::abort)?;
                        existing.can_view = can_view;
                        existing.can_download = can_download;
                        existing
                    }
                    None => AccessEntry {
                        file_id,
                        username: username.to_string(),
                        can_view,
                        can_download,
                        created_at: now,
                    },
                };

                let value = bincode::serialize(&entry).map_err(Self::abort)?;
                accesses.insert(key.as_slice(), value)?;
                grant_index.insert(index_key.as_slice(), Vec::<u8>::new())?;
                Ok(entry)
            },
        )?;

        debug!(
            "Upserted grant on file {} for {} (view={}, download={})",
            file_id, username, entry.can_view, entry.can_download
        );
        Ok(entry)
    }

    /// Get the grant for (file, user)
    pub fn get_access(&self, file_id: FileId, username: &str) -> Result<Option<AccessEntry>> {
        match self.accesses.get(Self::access_key(file_id, username))? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    /// Remove the grant for (file, user); returns whether one existed
    pub fn remove_access(&self, file_id: FileId, username: &str) -> Result<bool> {
        let key = Self::access_key(file_id, username);
        let index_key = Self::user_file_key(username, file_id);

        let removed = (&self.accesses, &self.grant_index).transaction(
            |(accesses, grant_index)| -> ConflictableTransactionResult<bool, Error> {
                let existed = accesses.remove(key.as_slice())?.is_some();
                grant_index.remove(index_key.as_slice())?;
                Ok(existed)
            },
        )?;

        debug!("Removed grant on file {} for {}: {}", file_id, username, removed);
        Ok(removed)
    }

    /// All grants on a file
    pub fn accesses_for(&self, file_id: FileId) -> Result<Vec<AccessEntry>> {
        let mut entries = Vec::new();

        for result in self.accesses.scan_prefix(file_id.to_key()) {
            let (_, data) = result?;
            entries.push(bincode::deserialize(&data)?);
        }

        Ok(entries)
    }

    /// Store `link` as the only link of its file, dropping any previous one.
    ///
    /// Returns the token that was superseded.
    pub fn replace_link(&self, link: &ShareableLink) -> Result<Option<Uuid>> {
        let head_key = link.file_id.to_key();
        let token = *link.token.as_bytes();
        let value = bincode::serialize(link)?;

        let previous = (&self.links, &self.link_heads).transaction(
            |(links, link_heads)| -> ConflictableTransactionResult<Option<Uuid>, Error> {
                let previous = link_heads.insert(&head_key[..], &token[..])?;
                let previous = match previous {
                    Some(old) => {
                        links.remove(old.clone())?;
                        Some(Uuid::from_slice(&old).map_err(|e| {
                            Self::abort(Error::Serialization(e.to_string()))
                        })?)
                    }
                    None => None,
                };
                links.insert(&token[..], value.as_slice())?;
                Ok(previous)
            },
        )?;

        debug!(
            "Stored link for file {} (superseded: {})",
            link.file_id,
            previous.is_some()
        );
        Ok(previous)
    }

    /// Look up a link by token
    pub fn get_link(&self, token: &Uuid) -> Result<Option<ShareableLink>> {
        match self.links.get(token.as_bytes())? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    /// The link currently attached to a file, valid or not
    pub fn link_for_file(&self, file_id: FileId) -> Result<Option<ShareableLink>> {
        match self.link_heads.get(file_id.to_key())? {
            Some(token) => match self.links.get(token)? {
                Some(data) => Ok(Some(bincode::deserialize(&data)?)),
                None => Ok(None),
            },
            None => Ok(None),
        }
    }

    /// Delete a link by token
    pub fn remove_link(&self, token: &Uuid) -> Result<Option<ShareableLink>> {
        let token_key = *token.as_bytes();

        let removed = (&self.links, &self.link_heads).transaction(
            |(links, link_heads)| -> ConflictableTransactionResult<Option<ShareableLink>, Error> {
                let Some(data) = links.remove(&token_key[..])? else {
                    return Ok(None);
                };
                let link: ShareableLink = bincode::deserialize(&data).map_err(Self::abort)?;

                let head_key = link.file_id.to_key();
                if link_heads.get(&head_key[..])?.as_deref() == Some(&token_key[..]) {
                    link_heads.remove(&head_key[..])?;
                }
                Ok(Some(link))
            },
        )?;

        debug!("Removed link {}: {}", token, removed.is_some());
        Ok(removed)
    }

    /// Get store statistics
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            file_count: self.files.len() as u64,
            grant_count: self.accesses.len() as u64,
            link_count: self.links.len() as u64,
        }
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

/// Record store statistics
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub file_count: u64,
    pub grant_count: u64,
    pub link_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;
    use std::thread;

    fn test_file(store: &RecordStore, owner: &str, name: &str) -> FileRecord {
        let file = FileRecord {
            id: store.next_file_id().unwrap(),
            name: name.to_string(),
            blob_handle: format!("{}.enc", name),
            wrapped_client_key: vec![1; 256],
            client_iv: vec![2; 16],
            owner: owner.to_string(),
            size: 10,
            uploaded_at: Utc::now(),
        };
        store.insert_file(&file).unwrap();
        file
    }

    fn test_link(file_id: FileId) -> ShareableLink {
        let created_at = Utc::now();
        ShareableLink {
            file_id,
            token: Uuid::new_v4(),
            expires_at: created_at + Duration::hours(1),
            created_at,
        }
    }

    #[test]
    fn test_file_ids_are_unique() {
        let store = RecordStore::in_memory().unwrap();
        let a = store.next_file_id().unwrap();
        let b = store.next_file_id().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_save_and_get_file() {
        let store = RecordStore::in_memory().unwrap();
        let file = test_file(&store, "alice", "report.pdf");

        let retrieved = store.get_file(file.id).unwrap().unwrap();
        assert_eq!(retrieved, file);

        assert!(store.get_file(FileId(9999)).unwrap().is_none());
        assert!(matches!(
            store.get_file_required(FileId(9999)),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_owner_index_separates_users() {
        let store = RecordStore::in_memory().unwrap();
        test_file(&store, "alice", "a1");
        test_file(&store, "alice", "a2");
        test_file(&store, "alic", "not-alice");

        let names: Vec<_> = store
            .files_owned_by("alice")
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec!["a1", "a2"]);
        assert_eq!(store.files_owned_by("alic").unwrap().len(), 1);
    }

    #[test]
    fn test_upsert_access_keeps_one_row() {
        let store = RecordStore::in_memory().unwrap();
        let file = test_file(&store, "alice", "doc");
        let first_at = Utc::now();

        let first = store
            .upsert_access(file.id, "bob", true, false, first_at)
            .unwrap();
        let second = store
            .upsert_access(file.id, "bob", true, true, first_at + Duration::minutes(5))
            .unwrap();

        assert!(!first.can_download);
        assert!(second.can_download);
        assert_eq!(second.created_at, first_at);
        assert_eq!(store.accesses_for(file.id).unwrap().len(), 1);
        assert_eq!(store.files_granted_to("bob").unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_upserts_converge() {
        let store = Arc::new(RecordStore::in_memory().unwrap());
        let file = test_file(&store, "alice", "doc");

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                thread::spawn(move || {
                    store
                        .upsert_access(file.id, "bob", true, i % 2 == 0, Utc::now())
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.accesses_for(file.id).unwrap().len(), 1);
    }

    #[test]
    fn test_remove_access() {
        let store = RecordStore::in_memory().unwrap();
        let file = test_file(&store, "alice", "doc");
        store
            .upsert_access(file.id, "bob", true, true, Utc::now())
            .unwrap();

        assert!(store.remove_access(file.id, "bob").unwrap());
        assert!(!store.remove_access(file.id, "bob").unwrap());
        assert!(store.get_access(file.id, "bob").unwrap().is_none());
        assert!(store.files_granted_to("bob").unwrap().is_empty());
    }

    #[test]
    fn test_replace_link_keeps_one_per_file() {
        let store = RecordStore::in_memory().unwrap();
        let file = test_file(&store, "alice", "doc");

        let first = test_link(file.id);
        assert!(store.replace_link(&first).unwrap().is_none());

        let second = test_link(file.id);
        assert_eq!(store.replace_link(&second).unwrap(), Some(first.token));

        assert!(store.get_link(&first.token).unwrap().is_none());
        assert_eq!(store.get_link(&second.token).unwrap(), Some(second.clone()));
        assert_eq!(store.link_for_file(file.id).unwrap(), Some(second));
        assert_eq!(store.stats().link_count, 1);
    }

    #[test]
    fn test_remove_link() {
        let store = RecordStore::in_memory().unwrap();
        let file = test_file(&store, "alice", "doc");
        let link = test_link(file.id);
        store.replace_link(&link).unwrap();

        assert_eq!(store.remove_link(&link.token).unwrap(), Some(link.clone()));
        assert!(store.remove_link(&link.token).unwrap().is_none());
        assert!(store.link_for_file(file.id).unwrap().is_none());
    }

    #[test]
    fn test_delete_file_cascades() {
        let store = RecordStore::in_memory().unwrap();
        let file = test_file(&store, "alice", "doc");
        let other = test_file(&store, "alice", "other");
        store
            .upsert_access(file.id, "bob", true, true, Utc::now())
            .unwrap();
        store
            .upsert_access(other.id, "bob", true, false, Utc::now())
            .unwrap();
        let link = test_link(file.id);
        store.replace_link(&link).unwrap();

        let deleted = store.delete_file(file.id).unwrap();
        assert_eq!(deleted.map(|f| f.id), Some(file.id));

        assert!(store.get_file(file.id).unwrap().is_none());
        assert!(store.accesses_for(file.id).unwrap().is_empty());
        assert!(store.get_link(&link.token).unwrap().is_none());
        assert_eq!(store.files_owned_by("alice").unwrap(), vec![other.clone()]);
        assert_eq!(store.files_granted_to("bob").unwrap(), vec![other]);

        assert!(store.delete_file(file.id).unwrap().is_none());
    }

    #[test]
    fn test_grant_on_missing_file_fails() {
        let store = RecordStore::in_memory().unwrap();
        let file = test_file(&store, "alice", "doc");
        store.delete_file(file.id).unwrap();

        assert!(matches!(
            store.upsert_access(file.id, "bob", true, true, Utc::now()),
            Err(Error::NotFound(_))
        ));
        assert!(store.accesses_for(file.id).unwrap().is_empty());
        assert_eq!(store.grant_index.len(), 0);
    }

    #[test]
    fn test_grants_racing_delete_leave_no_rows() {
        for _ in 0..20 {
            let store = Arc::new(RecordStore::in_memory().unwrap());
            let file = test_file(&store, "alice", "doc");

            let granters: Vec<_> = (0..4)
                .map(|i| {
                    let store = store.clone();
                    thread::spawn(move || {
                        let username = format!("user{}", i);
                        for _ in 0..10 {
                            let _ = store.upsert_access(file.id, &username, true, true, Utc::now());
                            let _ = store.remove_access(file.id, &username);
                            let _ = store.upsert_access(file.id, &username, true, false, Utc::now());
                        }
                    })
                })
                .collect();
            store.delete_file(file.id).unwrap();
            for handle in granters {
                handle.join().unwrap();
            }

            assert!(store.accesses_for(file.id).unwrap().is_empty());
            assert_eq!(store.stats().grant_count, 0);
            assert_eq!(store.grant_index.len(), 0);
        }
    }

    #[test]
    fn test_reopen_persists_records() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("db");

        let file_id = {
            let store = RecordStore::open(&path).unwrap();
            let file = test_file(&store, "alice", "doc");
            store.flush().unwrap();
            file.id
        };

        let store = RecordStore::open(&path).unwrap();
        assert!(store.get_file(file_id).unwrap().is_some());
        assert_ne!(store.next_file_id().unwrap(), file_id);
    }
}
