//! Key custody for sealvault
//!
//! The server holds two long-lived secrets, both created on first start and
//! never rotated:
//! - Master Key: 256-bit AES key protecting every stored blob
//! - Server Keypair: RSA-2048, the public half wraps client keys and the
//!   private half never leaves this process
//!
//! Both are loaded once by [`KeyStore::initialize`] and are immutable afterwards,
//! so a shared `Arc<KeyStore>` can be read from any number of request handlers.

use crate::config::KeyConfig;
use crate::crypto::{KEY_SIZE, RSA_KEY_BITS};
use crate::error::{Error, Result};
use ring::digest::{digest, SHA256};
use ring::rand::{SecureRandom, SystemRandom};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Server master key for the envelope layer
pub struct MasterKey {
    key: Zeroizing<[u8; KEY_SIZE]>,
}

impl MasterKey {
    /// Generate a fresh random key
    pub fn generate() -> Result<Self> {
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        SystemRandom::new()
            .fill(&mut key[..])
            .map_err(|_| Error::KeyUnavailable("Failed to generate master key".to_string()))?;
        Ok(MasterKey { key })
    }

    /// Build from persisted key material
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(Error::KeyUnavailable(format!(
                "Master key has wrong length: expected {}, got {}",
                KEY_SIZE,
                bytes.len()
            )));
        }

        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        key.copy_from_slice(bytes);
        Ok(MasterKey { key })
    }

    /// Get the raw key bytes
    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

/// Generate and persist the server keypair unless both halves already exist.
///
/// Safe to call on every start; existing files are never touched.
pub fn ensure_keypair(private_path: &Path, public_path: &Path) -> Result<()> {
    if private_path.exists() && public_path.exists() {
        debug!("Server keypair present at {:?}", private_path);
        return Ok(());
    }

    info!("Generating {}-bit server keypair", RSA_KEY_BITS);
    let private_key = RsaPrivateKey::new(&mut rand::rngs::OsRng, RSA_KEY_BITS)
        .map_err(|e| Error::KeyUnavailable(format!("RSA key generation failed: {}", e)))?;
    let public_key = RsaPublicKey::from(&private_key);

    let private_pem = private_key
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| Error::KeyUnavailable(format!("Failed to encode private key: {}", e)))?;
    let public_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| Error::KeyUnavailable(format!("Failed to encode public key: {}", e)))?;

    write_key_file(private_path, private_pem.as_bytes(), true)?;
    write_key_file(public_path, public_pem.as_bytes(), false)?;

    info!("Server keypair written to {:?} and {:?}", private_path, public_path);
    Ok(())
}

/// Load the master key, creating it if the file was never written.
///
/// An existing file with the wrong length is an error: replacing it would
/// orphan every blob already encrypted under the old key.
pub fn ensure_master_key(path: &Path) -> Result<MasterKey> {
    if path.exists() {
        return read_master_key(path);
    }

    let master = MasterKey::generate()?;
    write_key_file(path, master.key(), true)?;
    info!("Master key created at {:?}", path);
    Ok(master)
}

fn read_master_key(path: &Path) -> Result<MasterKey> {
    let bytes = Zeroizing::new(fs::read(path).map_err(|e| {
        Error::KeyUnavailable(format!("Failed to read master key {:?}: {}", path, e))
    })?);
    MasterKey::from_bytes(&bytes)
}

fn read_private_key(path: &Path) -> Result<RsaPrivateKey> {
    let pem = Zeroizing::new(fs::read_to_string(path).map_err(|e| {
        Error::KeyUnavailable(format!("Failed to read private key {:?}: {}", path, e))
    })?);

    RsaPrivateKey::from_pkcs1_pem(&pem)
        .or_else(|_| RsaPrivateKey::from_pkcs8_pem(&pem))
        .map_err(|_| Error::KeyUnavailable(format!("Malformed private key {:?}", path)))
}

fn read_public_key(path: &Path) -> Result<RsaPublicKey> {
    let pem = fs::read_to_string(path).map_err(|e| {
        Error::KeyUnavailable(format!("Failed to read public key {:?}: {}", path, e))
    })?;

    RsaPublicKey::from_public_key_pem(&pem)
        .map_err(|_| Error::KeyUnavailable(format!("Malformed public key {:?}", path)))
}

fn write_key_file(path: &Path, contents: &[u8], secret: bool) -> Result<()> {
    let unavailable =
        |e: std::io::Error| Error::KeyUnavailable(format!("Failed to write {:?}: {}", path, e));

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(unavailable)?;
    }

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    restrict_permissions(&mut options, secret);

    let mut file = options.open(path).map_err(unavailable)?;
    file.write_all(contents).map_err(unavailable)?;
    file.sync_all().map_err(unavailable)?;
    Ok(())
}

#[cfg(unix)]
fn restrict_permissions(options: &mut fs::OpenOptions, secret: bool) {
    use std::os::unix::fs::OpenOptionsExt;
    if secret {
        options.mode(0o600);
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_options: &mut fs::OpenOptions, _secret: bool) {}

/// Process-wide key material
pub struct KeyStore {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
    master_key: MasterKey,
}

impl KeyStore {
    /// Startup initialization: create whatever is missing, then load everything.
    ///
    /// The process must not serve requests if this fails.
    pub fn initialize(config: &KeyConfig) -> Result<Self> {
        ensure_keypair(&config.private_key_path, &config.public_key_path)?;
        let master_key = ensure_master_key(&config.master_key_path)?;
        let store = Self::load_keypair(config, master_key)?;

        info!(
            "Key store initialized, public key fingerprint {}",
            store.public_key_fingerprint()?
        );
        Ok(store)
    }

    /// Load existing key material without generating anything
    pub fn load(config: &KeyConfig) -> Result<Self> {
        let master_key = read_master_key(&config.master_key_path)?;
        Self::load_keypair(config, master_key)
    }

    fn load_keypair(config: &KeyConfig, master_key: MasterKey) -> Result<Self> {
        let private_key = read_private_key(&config.private_key_path)?;
        let public_key = read_public_key(&config.public_key_path)?;

        if RsaPublicKey::from(&private_key) != public_key {
            warn!(
                "Public key {:?} does not belong to private key {:?}",
                config.public_key_path, config.private_key_path
            );
            return Err(Error::KeyUnavailable(
                "Keypair halves do not match".to_string(),
            ));
        }

        Ok(KeyStore {
            private_key,
            public_key,
            master_key,
        })
    }

    /// Assemble from keys already in memory
    pub fn from_parts(private_key: RsaPrivateKey, master_key: MasterKey) -> Self {
        let public_key = RsaPublicKey::from(&private_key);
        KeyStore {
            private_key,
            public_key,
            master_key,
        }
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    pub fn master_key(&self) -> &MasterKey {
        &self.master_key
    }

    /// SHA-256 of the DER-encoded public key, hex encoded
    pub fn public_key_fingerprint(&self) -> Result<String> {
        let der = self
            .public_key
            .to_public_key_der()
            .map_err(|e| Error::KeyUnavailable(format!("Failed to encode public key: {}", e)))?;
        Ok(hex::encode(digest(&SHA256, der.as_bytes())))
    }
}

impl fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_keys;
    use tempfile::TempDir;

    fn key_config(dir: &TempDir) -> KeyConfig {
        KeyConfig {
            private_key_path: dir.path().join("keys/private.pem"),
            public_key_path: dir.path().join("keys/public.pem"),
            master_key_path: dir.path().join("keys/master.key"),
        }
    }

    fn write_test_keypair(config: &KeyConfig) {
        let private_key = test_keys::private_key();
        let public_key = RsaPublicKey::from(&private_key);
        let private_pem = private_key.to_pkcs1_pem(LineEnding::LF).unwrap();
        let public_pem = public_key.to_public_key_pem(LineEnding::LF).unwrap();
        write_key_file(&config.private_key_path, private_pem.as_bytes(), true).unwrap();
        write_key_file(&config.public_key_path, public_pem.as_bytes(), false).unwrap();
    }

    #[test]
    fn test_master_key_created_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("master.key");

        let first = ensure_master_key(&path).unwrap();
        assert_eq!(fs::read(&path).unwrap().len(), KEY_SIZE);

        let second = ensure_master_key(&path).unwrap();
        assert_eq!(first.key(), second.key());
    }

    #[test]
    fn test_corrupt_master_key_is_not_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("master.key");
        fs::write(&path, b"short").unwrap();

        let result = ensure_master_key(&path);
        assert!(matches!(result, Err(Error::KeyUnavailable(_))));
        assert_eq!(fs::read(&path).unwrap(), b"short");
    }

    #[test]
    fn test_master_key_debug_is_redacted() {
        let master = MasterKey::from_bytes(&[7u8; KEY_SIZE]).unwrap();
        assert_eq!(format!("{:?}", master), "MasterKey(<redacted>)");
    }

    #[test]
    fn test_ensure_keypair_generates_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let config = key_config(&dir);

        ensure_keypair(&config.private_key_path, &config.public_key_path).unwrap();
        let private_pem = fs::read(&config.private_key_path).unwrap();
        let public_pem = fs::read(&config.public_key_path).unwrap();
        assert!(String::from_utf8_lossy(&private_pem).contains("BEGIN RSA PRIVATE KEY"));
        assert!(String::from_utf8_lossy(&public_pem).contains("BEGIN PUBLIC KEY"));

        ensure_keypair(&config.private_key_path, &config.public_key_path).unwrap();
        assert_eq!(fs::read(&config.private_key_path).unwrap(), private_pem);
        assert_eq!(fs::read(&config.public_key_path).unwrap(), public_pem);
    }

    fn assert_regenerated_after_removing(remove: fn(&KeyConfig) -> &Path) {
        let dir = TempDir::new().unwrap();
        let config = key_config(&dir);
        write_test_keypair(&config);
        let old_private = fs::read(&config.private_key_path).unwrap();
        let old_public = fs::read(&config.public_key_path).unwrap();

        fs::remove_file(remove(&config)).unwrap();
        ensure_keypair(&config.private_key_path, &config.public_key_path).unwrap();

        assert!(config.private_key_path.exists());
        assert!(config.public_key_path.exists());
        assert_ne!(fs::read(&config.private_key_path).unwrap(), old_private);
        assert_ne!(fs::read(&config.public_key_path).unwrap(), old_public);

        let store = KeyStore::initialize(&config).unwrap();
        let private_key = read_private_key(&config.private_key_path).unwrap();
        assert_eq!(store.public_key(), &RsaPublicKey::from(&private_key));
    }

    #[test]
    fn test_missing_public_half_regenerates_both() {
        assert_regenerated_after_removing(|config| config.public_key_path.as_path());
    }

    #[test]
    fn test_missing_private_half_regenerates_both() {
        assert_regenerated_after_removing(|config| config.private_key_path.as_path());
    }

    #[test]
    fn test_initialize_then_load() {
        let dir = TempDir::new().unwrap();
        let config = key_config(&dir);
        write_test_keypair(&config);

        let initialized = KeyStore::initialize(&config).unwrap();
        let loaded = KeyStore::load(&config).unwrap();

        assert_eq!(initialized.master_key().key(), loaded.master_key().key());
        assert_eq!(initialized.public_key(), loaded.public_key());
        assert_eq!(
            initialized.public_key_fingerprint().unwrap(),
            loaded.public_key_fingerprint().unwrap()
        );
    }

    #[test]
    fn test_load_without_files_fails() {
        let dir = TempDir::new().unwrap();
        let config = key_config(&dir);

        let result = KeyStore::load(&config);
        assert!(matches!(result, Err(Error::KeyUnavailable(_))));
    }

    #[test]
    fn test_malformed_private_key_fails() {
        let dir = TempDir::new().unwrap();
        let config = key_config(&dir);
        write_test_keypair(&config);
        fs::write(&config.private_key_path, "not a pem").unwrap();

        let result = KeyStore::initialize(&config);
        assert!(matches!(result, Err(Error::KeyUnavailable(_))));
    }

    #[test]
    fn test_mismatched_halves_fail() {
        let dir = TempDir::new().unwrap();
        let config = key_config(&dir);
        write_test_keypair(&config);

        let other = RsaPrivateKey::new(&mut rand::rngs::OsRng, 1024).unwrap();
        let other_pem = RsaPublicKey::from(&other)
            .to_public_key_pem(LineEnding::LF)
            .unwrap();
        fs::write(&config.public_key_path, other_pem).unwrap();

        let result = KeyStore::initialize(&config);
        assert!(matches!(result, Err(Error::KeyUnavailable(_))));
    }
}
