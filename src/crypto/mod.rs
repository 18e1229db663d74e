//! Cryptography module for sealvault
//!
//! Two layers protect every stored file:
//! - AES-256-CBC envelope under a server master key (symmetric layer)
//! - RSA-2048 OAEP wrapping of the client's own key (asymmetric layer)

mod envelope;
mod keys;
mod wrap;

pub use envelope::EnvelopeCipher;
pub use keys::{ensure_keypair, ensure_master_key, KeyStore, MasterKey};
pub use wrap::KeyWrapper;

/// Size of AES-256 key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of the AES block, and of the CBC IV
pub const BLOCK_SIZE: usize = 16;

/// Size of the IV prefix of an envelope frame
pub const IV_SIZE: usize = BLOCK_SIZE;

/// Size of the little-endian length trailer of an envelope frame
pub const LENGTH_TRAILER_SIZE: usize = 8;

/// Modulus size of the server keypair
pub const RSA_KEY_BITS: usize = 2048;

#[cfg(test)]
pub(crate) mod test_keys {
    //! One keypair per test binary; RSA generation is too slow to repeat.

    use super::{KeyStore, MasterKey, RSA_KEY_BITS};
    use rsa::RsaPrivateKey;
    use std::sync::{Arc, OnceLock};

    static PRIVATE_KEY: OnceLock<RsaPrivateKey> = OnceLock::new();

    pub fn private_key() -> RsaPrivateKey {
        PRIVATE_KEY
            .get_or_init(|| {
                RsaPrivateKey::new(&mut rand::rngs::OsRng, RSA_KEY_BITS)
                    .expect("test key generation")
            })
            .clone()
    }

    pub fn key_store() -> Arc<KeyStore> {
        Arc::new(KeyStore::from_parts(private_key(), MasterKey::generate().unwrap()))
    }
}
