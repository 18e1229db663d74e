//! sealvault - Double-encrypted file vault
//!
//! Clients encrypt files before upload; the server seals that ciphertext again
//! under its own master key and keeps the client key wrapped with its RSA
//! keypair. Owners delegate access through per-user grants or time-boxed
//! shareable links.

pub mod access;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod error;
pub mod links;
pub mod storage;
pub mod vault;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::access::{AccessLedger, GrantRequest, Permission};
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::Config;
    pub use crate::crypto::{EnvelopeCipher, KeyStore, KeyWrapper, MasterKey};
    pub use crate::error::{Error, Result};
    pub use crate::links::{LinkIssuer, LinkView};
    pub use crate::storage::{FileId, FileRecord, Role, User};
    pub use crate::vault::{DownloadBundle, DownloadIntent, FileVault};
}
