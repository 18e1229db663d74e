//! Per-file access ledger
//!
//! Owners bypass the ledger entirely. Everyone else needs an [`AccessEntry`]
//! for the (file, user) pair; no entry means no access.

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::storage::{AccessEntry, FileRecord, RecordStore, User};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// What a user may do with a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Permission {
    Owner,
    ViewOnly,
    ViewAndDownload,
    None,
}

impl Permission {
    pub fn can_view(&self) -> bool {
        !matches!(self, Permission::None)
    }

    pub fn can_download(&self) -> bool {
        matches!(self, Permission::Owner | Permission::ViewAndDownload)
    }

    fn from_entry(entry: Option<&AccessEntry>) -> Self {
        match entry {
            Some(e) if e.can_download => Permission::ViewAndDownload,
            Some(e) if e.can_view => Permission::ViewOnly,
            _ => Permission::None,
        }
    }
}

/// Grant request as received at the boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantRequest {
    pub username: String,
    #[serde(default)]
    pub can_download: Option<bool>,
}

impl GrantRequest {
    pub fn new(username: impl Into<String>) -> Self {
        GrantRequest {
            username: username.into(),
            can_download: None,
        }
    }

    pub fn with_download(mut self, can_download: bool) -> Self {
        self.can_download = Some(can_download);
        self
    }
}

/// Owner-managed grants on files
pub struct AccessLedger {
    store: Arc<RecordStore>,
    clock: Arc<dyn Clock>,
}

impl AccessLedger {
    pub fn new(store: Arc<RecordStore>, clock: Arc<dyn Clock>) -> Self {
        AccessLedger { store, clock }
    }

    fn check_owner(file: &FileRecord, grantor: &User) -> Result<()> {
        if !file.is_owned_by(grantor) || !grantor.role.can_share() {
            return Err(Error::AccessDenied);
        }
        Ok(())
    }

    /// Create or update the grant of `target` on `file`
    pub fn grant(
        &self,
        file: &FileRecord,
        grantor: &User,
        target: &str,
        can_view: bool,
        can_download: bool,
    ) -> Result<AccessEntry> {
        Self::check_owner(file, grantor)?;

        let target = target.trim();
        if target.is_empty() {
            return Err(Error::Validation("username is required".to_string()));
        }

        let entry = self.store.upsert_access(
            file.id,
            target,
            can_view,
            can_download,
            self.clock.now(),
        )?;

        info!(
            "{} granted {} on file {} (view={}, download={})",
            grantor.username, target, file.id, entry.can_view, entry.can_download
        );
        Ok(entry)
    }

    /// Apply a boundary grant request: view on, download off unless asked
    pub fn grant_request(
        &self,
        file: &FileRecord,
        grantor: &User,
        request: &GrantRequest,
    ) -> Result<AccessEntry> {
        self.grant(
            file,
            grantor,
            &request.username,
            true,
            request.can_download.unwrap_or(false),
        )
    }

    /// Remove the grant of `target` on `file`, if any
    pub fn revoke(&self, file: &FileRecord, grantor: &User, target: &str) -> Result<()> {
        Self::check_owner(file, grantor)?;

        let removed = self.store.remove_access(file.id, target.trim())?;
        if removed {
            info!(
                "{} revoked {} on file {}",
                grantor.username, target, file.id
            );
        }
        Ok(())
    }

    /// Resolve what `user` may do with `file`
    pub fn effective_permission(&self, file: &FileRecord, user: &User) -> Result<Permission> {
        if file.is_owned_by(user) {
            return Ok(Permission::Owner);
        }
        let entry = self.store.get_access(file.id, &user.username)?;
        Ok(Permission::from_entry(entry.as_ref()))
    }

    /// Grant row for a non-owner, if any
    pub fn entry_for(&self, file: &FileRecord, user: &User) -> Result<Option<AccessEntry>> {
        self.store.get_access(file.id, &user.username)
    }

    /// All grants on a file
    pub fn entries(&self, file: &FileRecord) -> Result<Vec<AccessEntry>> {
        self.store.accesses_for(file.id)
    }
}
