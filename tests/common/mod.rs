//! Shared fixtures for integration tests

#![allow(dead_code)]

use chrono::Duration;
use rsa::RsaPrivateKey;
use sealvault::prelude::*;
use sealvault::storage::{MemoryBlobStore, RecordStore};
use std::sync::{Arc, OnceLock};

/// Client key used by every upload in these tests
pub const CLIENT_KEY_HEX: &str =
    "5f2b0c9e1d3a4b6c7e8f90a1b2c3d4e5f60718293a4b5c6d7e8f9a0b1c2d3e4f";

/// Client IV used by every upload in these tests
pub const CLIENT_IV_HEX: &str = "0f1e2d3c4b5a69788796a5b4c3d2e1f0";

static PRIVATE_KEY: OnceLock<RsaPrivateKey> = OnceLock::new();

/// One RSA keypair per test binary
pub fn key_store() -> Arc<KeyStore> {
    let private_key = PRIVATE_KEY
        .get_or_init(|| {
            RsaPrivateKey::new(&mut rand::rngs::OsRng, sealvault::crypto::RSA_KEY_BITS)
                .expect("Failed to generate test keypair")
        })
        .clone();
    let master_key = MasterKey::generate().expect("Failed to generate master key");
    Arc::new(KeyStore::from_parts(private_key, master_key))
}

/// Vault over an in-memory record store, blob store and clock
pub struct TestVault {
    pub vault: FileVault,
    pub blobs: Arc<MemoryBlobStore>,
    pub clock: Arc<ManualClock>,
}

pub fn test_vault() -> TestVault {
    let store = Arc::new(RecordStore::in_memory().expect("Failed to open record store"));
    let blobs = Arc::new(MemoryBlobStore::new());
    let clock = Arc::new(ManualClock::starting_now());
    let vault = FileVault::new(
        key_store(),
        store,
        blobs.clone(),
        clock.clone(),
        Duration::hours(1),
    );
    TestVault {
        vault,
        blobs,
        clock,
    }
}

pub fn client_key() -> Vec<u8> {
    hex::decode(CLIENT_KEY_HEX).expect("valid hex")
}

pub fn client_iv() -> Vec<u8> {
    hex::decode(CLIENT_IV_HEX).expect("valid hex")
}

/// Upload with the shared client key and IV
pub fn upload(vault: &FileVault, owner: &User, name: &str, body: &[u8]) -> FileId {
    vault
        .upload(owner, name, body, CLIENT_KEY_HEX, CLIENT_IV_HEX)
        .expect("Failed to upload")
}
