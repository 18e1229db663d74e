//! File vault
//!
//! Upload wraps the client key and seals the client ciphertext in the server
//! envelope before anything is persisted. Download reverses both layers and
//! hands the client everything it needs for its own final decryption.

use crate::access::{AccessLedger, GrantRequest, Permission};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::crypto::{EnvelopeCipher, KeyStore, KeyWrapper};
use crate::error::{Error, Result};
use crate::links::{LinkIssuer, LinkView};
use crate::storage::{
    AccessEntry, BlobStore, FileId, FileRecord, FsBlobStore, RecordStore, ShareableLink,
    StoreStats, User,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Media type used when the file name gives no hint
pub const DEFAULT_MEDIA_TYPE: &str = "application/octet-stream";

/// How the client intends to use a download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DownloadIntent {
    /// Display in place
    Render,
    /// Save to disk
    #[default]
    Save,
}

impl DownloadIntent {
    /// Content-Disposition type for this intent
    pub fn disposition(&self) -> &'static str {
        match self {
            DownloadIntent::Render => "inline",
            DownloadIntent::Save => "attachment",
        }
    }
}

/// Everything the client needs to recover its plaintext
#[derive(Debug, Clone)]
pub struct DownloadBundle {
    pub file_id: FileId,
    /// The client's own ciphertext, server layer removed
    pub client_ciphertext: Vec<u8>,
    pub client_iv: Vec<u8>,
    /// Unwrapped client symmetric key
    pub client_key: Zeroizing<Vec<u8>>,
    pub filename: String,
    pub media_type: String,
    pub intent: DownloadIntent,
}

/// Base64 rendering of a [`DownloadBundle`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadResponse {
    pub encrypted_file: String,
    pub iv: String,
    pub client_key: String,
    pub original_name: String,
    pub media_type: String,
    pub disposition: String,
}

impl DownloadBundle {
    pub fn to_response(&self) -> DownloadResponse {
        DownloadResponse {
            encrypted_file: STANDARD.encode(&self.client_ciphertext),
            iv: STANDARD.encode(&self.client_iv),
            client_key: STANDARD.encode(self.client_key.as_slice()),
            original_name: self.filename.clone(),
            media_type: self.media_type.clone(),
            disposition: self.intent.disposition().to_string(),
        }
    }
}

/// One row of a file listing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileSummary {
    pub id: FileId,
    pub name: String,
    pub size: u64,
    pub owner: String,
    pub uploaded_at: DateTime<Utc>,
    /// Live link, only reported to the owner
    pub link: Option<LinkView>,
}

/// Files visible to a user
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileListing {
    pub owned: Vec<FileSummary>,
    pub shared: Vec<FileSummary>,
}

/// Detail view of one file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDetails {
    pub file_id: FileId,
    pub is_owner: bool,
    pub name: String,
    pub size: u64,
    pub owner: String,
    pub uploaded_at: DateTime<Utc>,
    pub can_download: bool,
    pub is_guest: bool,
    /// Grants on the file; filled for non-guest owners only
    pub shared_with: Vec<AccessEntry>,
    /// Stored link of the file; filled for non-guest owners only
    pub shareable_links: Vec<LinkView>,
}

/// Upload/download orchestration over both encryption layers
pub struct FileVault {
    keys: Arc<KeyStore>,
    cipher: EnvelopeCipher,
    wrapper: KeyWrapper,
    store: Arc<RecordStore>,
    blobs: Arc<dyn BlobStore>,
    ledger: AccessLedger,
    links: LinkIssuer,
    clock: Arc<dyn Clock>,
}

impl FileVault {
    pub fn new(
        keys: Arc<KeyStore>,
        store: Arc<RecordStore>,
        blobs: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
        link_ttl: Duration,
    ) -> Self {
        FileVault {
            cipher: EnvelopeCipher::new(keys.clone()),
            wrapper: KeyWrapper::new(keys.clone()),
            ledger: AccessLedger::new(store.clone(), clock.clone()),
            links: LinkIssuer::new(store.clone(), clock.clone(), link_ttl),
            keys,
            store,
            blobs,
            clock,
        }
    }

    /// Open the vault described by `config` with already initialized keys
    pub fn open(config: &Config, keys: Arc<KeyStore>) -> Result<Self> {
        let store = Arc::new(RecordStore::open(&config.storage.database_path)?);
        let blobs = Arc::new(FsBlobStore::open(&config.storage.blob_dir)?);
        Ok(Self::new(
            keys,
            store,
            blobs,
            Arc::new(SystemClock),
            config.link_ttl(),
        ))
    }

    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    pub fn ledger(&self) -> &AccessLedger {
        &self.ledger
    }

    pub fn links(&self) -> &LinkIssuer {
        &self.links
    }

    pub fn stats(&self) -> StoreStats {
        self.store.stats()
    }

    /// Flush records to disk
    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }

    fn load(&self, file_id: FileId) -> Result<FileRecord> {
        self.store.get_file_required(file_id)
    }

    fn decode_hex_field(name: &str, value: &str) -> Result<Vec<u8>> {
        let value = value.trim();
        if value.is_empty() {
            return Err(Error::Validation(format!("{} is required", name)));
        }
        let bytes = hex::decode(value)
            .map_err(|_| Error::Validation(format!("{} must be hex encoded", name)))?;
        if bytes.is_empty() {
            return Err(Error::Validation(format!("{} is required", name)));
        }
        Ok(bytes)
    }

    /// Store a client-encrypted file.
    ///
    /// The body may be empty; the key and IV must decode to non-empty bytes.
    pub fn upload(
        &self,
        owner: &User,
        filename: &str,
        client_ciphertext: &[u8],
        wrapped_key_hex: &str,
        client_iv_hex: &str,
    ) -> Result<FileId> {
        if !owner.role.can_share() {
            return Err(Error::AccessDenied);
        }

        let filename = filename.trim();
        if filename.is_empty() {
            return Err(Error::Validation("file name is required".to_string()));
        }
        let client_key = Zeroizing::new(Self::decode_hex_field("key", wrapped_key_hex)?);
        let client_iv = Self::decode_hex_field("iv", client_iv_hex)?;

        let wrapped_client_key = self.wrapper.wrap(&client_key)?;
        let server_frame = self.cipher.encrypt(client_ciphertext);

        let id = self.store.next_file_id()?;
        let blob_handle = self.blobs.put(&server_frame)?;
        let record = FileRecord {
            id,
            name: filename.to_string(),
            blob_handle,
            wrapped_client_key,
            client_iv,
            owner: owner.username.clone(),
            size: client_ciphertext.len() as u64,
            uploaded_at: self.clock.now(),
        };

        if let Err(e) = self.store.insert_file(&record) {
            if let Err(cleanup) = self.blobs.delete(&record.blob_handle) {
                warn!(
                    "Failed to remove orphaned blob {}: {}",
                    record.blob_handle, cleanup
                );
            }
            return Err(e);
        }

        info!(
            "{} uploaded file {} ({}, {} bytes)",
            owner.username, record.id, record.name, record.size
        );
        Ok(record.id)
    }

    /// Download as the owner or a grantee with download rights
    pub fn download(
        &self,
        file_id: FileId,
        requester: &User,
        intent: DownloadIntent,
    ) -> Result<DownloadBundle> {
        let file = self.load(file_id)?;

        let permission = self.ledger.effective_permission(&file, requester)?;
        if !permission.can_download() {
            debug!(
                "{} denied download of file {} ({:?})",
                requester.username, file_id, permission
            );
            return Err(Error::AccessDenied);
        }

        let bundle = self.unseal(&file, intent)?;
        info!(
            "{} downloaded file {} ({:?})",
            requester.username, file_id, intent
        );
        Ok(bundle)
    }

    /// Download through a shareable link
    pub fn download_via_link(&self, token: &str, intent: DownloadIntent) -> Result<DownloadBundle> {
        let file = self.links.validate(token)?;
        let bundle = self.unseal(&file, intent)?;
        info!("File {} downloaded via link ({:?})", file.id, intent);
        Ok(bundle)
    }

    fn unseal(&self, file: &FileRecord, intent: DownloadIntent) -> Result<DownloadBundle> {
        let frame = self.blobs.get(&file.blob_handle)?;
        let client_ciphertext = self.cipher.decrypt(&frame)?;
        let client_key = Zeroizing::new(self.wrapper.unwrap(&file.wrapped_client_key)?);

        let media_type = mime_guess::from_path(&file.name)
            .first_raw()
            .unwrap_or(DEFAULT_MEDIA_TYPE)
            .to_string();

        Ok(DownloadBundle {
            file_id: file.id,
            client_ciphertext,
            client_iv: file.client_iv.clone(),
            client_key,
            filename: file.name.clone(),
            media_type,
            intent,
        })
    }

    /// Delete a file, its grants, its link and its blob
    pub fn delete(&self, file_id: FileId, requester: &User) -> Result<()> {
        let file = self.load(file_id)?;
        if !file.is_owned_by(requester) {
            return Err(Error::AccessDenied);
        }

        self.store.delete_file(file_id)?;
        self.blobs.delete(&file.blob_handle)?;

        info!("{} deleted file {} ({})", requester.username, file_id, file.name);
        Ok(())
    }

    /// Owned files plus files shared with view rights
    pub fn list_files(&self, user: &User) -> Result<FileListing> {
        let mut listing = FileListing::default();

        for file in self.store.files_owned_by(&user.username)? {
            let link = self.links.live_link(file.id)?;
            listing.owned.push(Self::summary(&file, link.as_ref()));
        }

        for file in self.store.files_granted_to(&user.username)? {
            let visible = self
                .ledger
                .entry_for(&file, user)?
                .map(|entry| entry.can_view)
                .unwrap_or(false);
            if visible {
                listing.shared.push(Self::summary(&file, None));
            }
        }

        debug!(
            "Listed {} owned and {} shared files for {}",
            listing.owned.len(),
            listing.shared.len(),
            user.username
        );
        Ok(listing)
    }

    fn summary(file: &FileRecord, link: Option<&ShareableLink>) -> FileSummary {
        FileSummary {
            id: file.id,
            name: file.name.clone(),
            size: file.size,
            owner: file.owner.clone(),
            uploaded_at: file.uploaded_at,
            link: link.map(LinkView::from),
        }
    }

    /// Detail view for the owner or a grantee
    pub fn file_details(&self, file_id: FileId, requester: &User) -> Result<FileDetails> {
        let file = self.load(file_id)?;

        if file.is_owned_by(requester) {
            return self.owner_details(&file, requester);
        }

        match self.ledger.entry_for(&file, requester)? {
            Some(entry) => Ok(Self::details(&file, requester, false, entry.can_download)),
            None => Err(Error::AccessDenied),
        }
    }

    /// Detail view reached through a shareable link
    pub fn open_link(&self, token: &str, requester: &User) -> Result<FileDetails> {
        let file = self.links.validate(token)?;
        debug!("{} opened link for file {}", requester.username, file.id);

        if file.is_owned_by(requester) {
            return self.owner_details(&file, requester);
        }
        Ok(Self::details(&file, requester, false, true))
    }

    /// Owner view with grants and links; guests never see sharing state
    fn owner_details(&self, file: &FileRecord, requester: &User) -> Result<FileDetails> {
        let mut details = Self::details(file, requester, true, true);
        if !requester.is_guest() {
            details.shared_with = self.ledger.entries(file)?;
            details.shareable_links = self
                .store
                .link_for_file(file.id)?
                .iter()
                .map(LinkView::from)
                .collect();
        }
        Ok(details)
    }

    fn details(file: &FileRecord, requester: &User, is_owner: bool, can_download: bool) -> FileDetails {
        FileDetails {
            file_id: file.id,
            is_owner,
            name: file.name.clone(),
            size: file.size,
            owner: file.owner.clone(),
            uploaded_at: file.uploaded_at,
            can_download,
            is_guest: requester.is_guest(),
            shared_with: Vec::new(),
            shareable_links: Vec::new(),
        }
    }

    /// Grant access to a file by id
    pub fn grant_access(
        &self,
        file_id: FileId,
        grantor: &User,
        request: &GrantRequest,
    ) -> Result<AccessEntry> {
        let file = self.load(file_id)?;
        self.ledger.grant_request(&file, grantor, request)
    }

    /// Revoke access to a file by id
    pub fn revoke_access(&self, file_id: FileId, grantor: &User, username: &str) -> Result<()> {
        let file = self.load(file_id)?;
        self.ledger.revoke(&file, grantor, username)
    }

    /// Permission of `user` on a file by id
    pub fn permission(&self, file_id: FileId, user: &User) -> Result<Permission> {
        let file = self.load(file_id)?;
        self.ledger.effective_permission(&file, user)
    }

    /// Issue a link for a file by id
    pub fn issue_link(&self, file_id: FileId, requester: &User) -> Result<ShareableLink> {
        let file = self.load(file_id)?;
        self.links.issue(&file, requester)
    }

    /// Remove the link of a file by id
    pub fn revoke_file_link(&self, file_id: FileId, requester: &User) -> Result<bool> {
        let file = self.load(file_id)?;
        self.links.revoke_for_file(&file, requester)
    }
}
