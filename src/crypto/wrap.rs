//! RSA-OAEP key wrapping
//!
//! Client symmetric keys are stored only in wrapped form. OAEP uses SHA-256
//! for both the label digest and MGF1, which caps a 2048-bit modulus at
//! 190 bytes of payload.

use crate::crypto::KeyStore;
use crate::error::{Error, Result};
use rsa::traits::PublicKeyParts;
use rsa::Oaep;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::warn;

/// Asymmetric wrap/unwrap with the server keypair
#[derive(Clone)]
pub struct KeyWrapper {
    keys: Arc<KeyStore>,
}

impl KeyWrapper {
    pub fn new(keys: Arc<KeyStore>) -> Self {
        KeyWrapper { keys }
    }

    /// Largest secret that fits one OAEP block under the server key
    pub fn max_payload(&self) -> usize {
        let hash_len = <Sha256 as Digest>::output_size();
        self.keys
            .public_key()
            .size()
            .saturating_sub(2 * hash_len + 2)
    }

    /// Wrap a secret with the public key
    pub fn wrap(&self, secret: &[u8]) -> Result<Vec<u8>> {
        let limit = self.max_payload();
        if secret.len() > limit {
            return Err(Error::PayloadTooLarge {
                size: secret.len(),
                limit,
            });
        }

        self.keys
            .public_key()
            .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), secret)
            .map_err(|e| {
                warn!("OAEP wrap failed: {}", e);
                Error::Wrap("OAEP encryption failed".to_string())
            })
    }

    /// Recover a secret wrapped by [`KeyWrapper::wrap`]
    pub fn unwrap(&self, wrapped: &[u8]) -> Result<Vec<u8>> {
        self.keys
            .private_key()
            .decrypt(Oaep::new::<Sha256>(), wrapped)
            .map_err(|_| {
                warn!("OAEP unwrap failed ({} wrapped bytes)", wrapped.len());
                Error::Unwrap
            })
    }
}
