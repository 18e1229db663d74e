//! Shareable link issuance and validation
//!
//! Each file has at most one link. Expiry is checked lazily at validation
//! time; expired links stay stored until superseded or revoked.

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::storage::{FileId, FileRecord, RecordStore, ShareableLink, User};
use chrono::{DateTime, Duration, Utc};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Boundary rendering of a link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkView {
    /// Canonical hyphenated token
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<&ShareableLink> for LinkView {
    fn from(link: &ShareableLink) -> Self {
        LinkView {
            token: link.token.hyphenated().to_string(),
            created_at: link.created_at,
            expires_at: link.expires_at,
        }
    }
}

/// Mints and checks time-boxed bearer tokens
pub struct LinkIssuer {
    store: Arc<RecordStore>,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
    rng: SystemRandom,
}

impl LinkIssuer {
    pub fn new(store: Arc<RecordStore>, clock: Arc<dyn Clock>, default_ttl: Duration) -> Self {
        LinkIssuer {
            store,
            clock,
            default_ttl,
            rng: SystemRandom::new(),
        }
    }

    fn new_token(&self) -> Result<Uuid> {
        let mut bytes = [0u8; 16];
        self.rng
            .fill(&mut bytes)
            .map_err(|_| Error::Internal("Failed to generate link token".to_string()))?;
        Ok(Uuid::from_bytes(bytes))
    }

    fn check_owner(file: &FileRecord, requester: &User) -> Result<()> {
        if !file.is_owned_by(requester) || !requester.role.can_share() {
            return Err(Error::AccessDenied);
        }
        Ok(())
    }

    /// Issue a link with the configured lifetime
    pub fn issue(&self, file: &FileRecord, requester: &User) -> Result<ShareableLink> {
        self.issue_with_ttl(file, requester, self.default_ttl)
    }

    /// Issue a link replacing any previous link of the file
    pub fn issue_with_ttl(
        &self,
        file: &FileRecord,
        requester: &User,
        ttl: Duration,
    ) -> Result<ShareableLink> {
        Self::check_owner(file, requester)?;
        if ttl <= Duration::zero() {
            return Err(Error::Validation("link lifetime must be positive".to_string()));
        }

        let created_at = self.clock.now();
        let expires_at = created_at
            .checked_add_signed(ttl)
            .ok_or_else(|| Error::Validation("link lifetime out of range".to_string()))?;
        let link = ShareableLink {
            file_id: file.id,
            token: self.new_token()?,
            expires_at,
            created_at,
        };

        let superseded = self.store.replace_link(&link)?;
        if let Some(old) = superseded {
            debug!("Link {} superseded on file {}", old, file.id);
        }

        info!(
            "{} issued link for file {} expiring {}",
            requester.username, file.id, link.expires_at
        );
        Ok(link)
    }

    /// Resolve a token to its file if the link is still live
    pub fn validate(&self, token: &str) -> Result<FileRecord> {
        let link = self.lookup(token)?;

        let now = self.clock.now();
        if !link.is_valid_at(now) {
            debug!("Link for file {} expired at {}", link.file_id, link.expires_at);
            return Err(Error::ExpiredLink);
        }

        self.store
            .get_file(link.file_id)?
            .ok_or_else(|| Error::NotFound("shared file".to_string()))
    }

    fn lookup(&self, token: &str) -> Result<ShareableLink> {
        let not_found = || Error::NotFound("link".to_string());
        let token = Uuid::parse_str(token.trim()).map_err(|_| not_found())?;
        self.store.get_link(&token)?.ok_or_else(not_found)
    }

    /// Delete a link by token.
    ///
    /// Any authenticated caller holding the token may revoke it. A
    /// well-formed token with no stored link is already revoked.
    pub fn revoke(&self, token: &str, requester: &User) -> Result<()> {
        let token = Uuid::parse_str(token.trim())
            .map_err(|_| Error::NotFound("link".to_string()))?;
        let Some(link) = self.store.remove_link(&token)? else {
            debug!("Revoke of unknown link {} by {}", token, requester.username);
            return Ok(());
        };

        let owner = self
            .store
            .get_file(link.file_id)?
            .map(|f| f.owner)
            .unwrap_or_default();
        if owner != requester.username {
            warn!(
                "Link for file {} revoked by non-owner {}",
                link.file_id, requester.username
            );
        }
        info!("{} revoked link for file {}", requester.username, link.file_id);
        Ok(())
    }

    /// Delete the link of a file, owner only
    pub fn revoke_for_file(&self, file: &FileRecord, requester: &User) -> Result<bool> {
        Self::check_owner(file, requester)?;

        let removed = match self.store.link_for_file(file.id)? {
            Some(link) => self.store.remove_link(&link.token)?.is_some(),
            None => false,
        };
        if removed {
            info!("{} revoked link for file {}", requester.username, file.id);
        }
        Ok(removed)
    }

    /// The link of a file if it is still valid
    pub fn live_link(&self, file_id: FileId) -> Result<Option<ShareableLink>> {
        let now = self.clock.now();
        Ok(self
            .store
            .link_for_file(file_id)?
            .filter(|link| link.is_valid_at(now)))
    }
}
