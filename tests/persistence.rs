//! On-disk key material, records and blobs survive a restart

mod common;

use common::{client_key, CLIENT_IV_HEX, CLIENT_KEY_HEX};
use sealvault::prelude::*;
use std::sync::Arc;
use tempfile::TempDir;

#[test]
fn test_vault_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let config = Config::with_data_dir(dir.path());
    config.validate().unwrap();
    config.ensure_directories().unwrap();

    let alice = User::regular("alice");
    let bob = User::guest("bob");

    let (file_id, token, fingerprint) = {
        let keys = Arc::new(KeyStore::initialize(&config.keys).unwrap());
        let vault = FileVault::open(&config, keys.clone()).unwrap();

        let file_id = vault
            .upload(&alice, "kept.txt", b"client bytes", CLIENT_KEY_HEX, CLIENT_IV_HEX)
            .unwrap();
        vault
            .grant_access(file_id, &alice, &GrantRequest::new("bob").with_download(true))
            .unwrap();
        let token = vault.issue_link(file_id, &alice).unwrap().token.to_string();
        vault.flush().unwrap();

        (file_id, token, keys.public_key_fingerprint().unwrap())
    };

    // Second start: nothing is regenerated
    let keys = Arc::new(KeyStore::initialize(&config.keys).unwrap());
    assert_eq!(keys.public_key_fingerprint().unwrap(), fingerprint);

    let vault = FileVault::open(&config, keys).unwrap();
    let bundle = vault.download(file_id, &bob, DownloadIntent::Save).unwrap();
    assert_eq!(bundle.client_ciphertext, b"client bytes");
    assert_eq!(bundle.client_key.as_slice(), client_key().as_slice());

    assert_eq!(vault.open_link(&token, &bob).unwrap().file_id, file_id);
    assert_eq!(vault.list_files(&bob).unwrap().shared.len(), 1);
}

#[test]
fn test_blob_is_not_client_ciphertext_at_rest() {
    let dir = TempDir::new().unwrap();
    let config = Config::with_data_dir(dir.path());
    config.ensure_directories().unwrap();

    let keys = Arc::new(KeyStore::initialize(&config.keys).unwrap());
    let vault = FileVault::open(&config, keys).unwrap();
    let body = b"recognisable client ciphertext".to_vec();
    vault
        .upload(&User::regular("alice"), "a.bin", &body, CLIENT_KEY_HEX, CLIENT_IV_HEX)
        .unwrap();

    let blobs: Vec<_> = std::fs::read_dir(&config.storage.blob_dir)
        .unwrap()
        .flatten()
        .collect();
    assert_eq!(blobs.len(), 1);

    let stored = std::fs::read(blobs[0].path()).unwrap();
    assert_eq!(stored.len(), EnvelopeCipher::framed_len(body.len()));
    assert!(!stored.windows(body.len()).any(|w| w == body.as_slice()));
}

#[test]
fn test_missing_keys_are_unavailable() {
    let dir = TempDir::new().unwrap();
    let config = Config::with_data_dir(dir.path());

    let err = KeyStore::load(&config.keys).unwrap_err();
    assert!(matches!(err, Error::KeyUnavailable(_)));
    assert_eq!(err.status_code(), 500);
}
