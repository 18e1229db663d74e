//! Storage module
//!
//! Domain records live in a sled database ([`RecordStore`]); encrypted file
//! bodies live in an opaque blob store addressed by handle ([`BlobStore`]).

mod blobs;
mod records;

pub use blobs::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use records::{RecordStore, StoreStats};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Account role, as assigned by the external account service
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Role {
    #[serde(rename = "Admin")]
    Admin,
    #[serde(rename = "Regular User")]
    RegularUser,
    #[serde(rename = "Guest")]
    Guest,
}

impl Role {
    /// Whether this role may upload files and hand out access
    pub fn can_share(&self) -> bool {
        matches!(self, Role::Admin | Role::RegularUser)
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "regular" | "regular user" | "regular-user" | "user" => Ok(Role::RegularUser),
            "guest" => Ok(Role::Guest),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// An authenticated caller
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub username: String,
    pub role: Role,
}

impl User {
    pub fn new(username: impl Into<String>, role: Role) -> Self {
        User {
            username: username.into(),
            role,
        }
    }

    pub fn regular(username: impl Into<String>) -> Self {
        Self::new(username, Role::RegularUser)
    }

    pub fn guest(username: impl Into<String>) -> Self {
        Self::new(username, Role::Guest)
    }

    pub fn is_guest(&self) -> bool {
        self.role == Role::Guest
    }
}

/// Identifier of a stored file
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId(pub u64);

impl FileId {
    pub(crate) fn to_key(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FileId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.trim().parse().map(FileId)
    }
}

/// A stored file. The blob it points to is always double-encrypted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRecord {
    pub id: FileId,
    /// Display name supplied at upload
    pub name: String,
    /// Handle of the envelope-encrypted blob
    pub blob_handle: String,
    /// Client key wrapped with the server public key
    pub wrapped_client_key: Vec<u8>,
    /// IV of the client's own layer, opaque to the server
    pub client_iv: Vec<u8>,
    /// Owner username
    pub owner: String,
    /// Length of the client ciphertext in bytes
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
}

impl FileRecord {
    pub fn is_owned_by(&self, user: &User) -> bool {
        self.owner == user.username
    }
}

/// Per-user grant on a file; at most one per (file, user)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessEntry {
    pub file_id: FileId,
    pub username: String,
    pub can_view: bool,
    pub can_download: bool,
    pub created_at: DateTime<Utc>,
}

/// Time-boxed bearer token for one file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShareableLink {
    pub file_id: FileId,
    pub token: Uuid,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl ShareableLink {
    /// Valid strictly before `expires_at`
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}
