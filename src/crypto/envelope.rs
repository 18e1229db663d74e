//! AES-256-CBC envelope layer
//!
//! Frame layout, as stored at rest:
//!
//! ```text
//! | IV (16) | ciphertext (N, multiple of 16) | original length (8, LE u64) |
//! ```
//!
//! Padding is PKCS#7, so N is always at least one block. There is no MAC: a
//! corrupted frame is only rejected when its padding is structurally invalid.
//! The length trailer is applied as a truncation after unpadding and is not
//! itself verified.

use crate::crypto::{KeyStore, BLOCK_SIZE, IV_SIZE, LENGTH_TRAILER_SIZE};
use crate::error::{Error, Result};
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use std::sync::Arc;
use tracing::warn;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Symmetric envelope under the server master key
#[derive(Clone)]
pub struct EnvelopeCipher {
    keys: Arc<KeyStore>,
}

impl EnvelopeCipher {
    pub fn new(keys: Arc<KeyStore>) -> Self {
        EnvelopeCipher { keys }
    }

    /// Size of the frame produced for a payload of `len` bytes
    pub fn framed_len(len: usize) -> usize {
        IV_SIZE + (len / BLOCK_SIZE + 1) * BLOCK_SIZE + LENGTH_TRAILER_SIZE
    }

    /// Encrypt a payload of any length into a self-describing frame
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut iv = [0u8; IV_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);

        let ciphertext = Aes256CbcEnc::new(
            GenericArray::from_slice(self.keys.master_key().key()),
            GenericArray::from_slice(&iv),
        )
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut framed = Vec::with_capacity(IV_SIZE + ciphertext.len() + LENGTH_TRAILER_SIZE);
        framed.extend_from_slice(&iv);
        framed.extend_from_slice(&ciphertext);
        framed.extend_from_slice(&(plaintext.len() as u64).to_le_bytes());
        framed
    }

    /// Decrypt a frame produced by [`EnvelopeCipher::encrypt`]
    pub fn decrypt(&self, framed: &[u8]) -> Result<Vec<u8>> {
        if framed.len() < IV_SIZE + LENGTH_TRAILER_SIZE {
            return Err(Error::MalformedEnvelope(format!(
                "Frame too short: {} bytes",
                framed.len()
            )));
        }

        let (iv, rest) = framed.split_at(IV_SIZE);
        let (ciphertext, trailer) = rest.split_at(rest.len() - LENGTH_TRAILER_SIZE);

        if ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(Error::MalformedEnvelope(format!(
                "Ciphertext length {} is not a multiple of {}",
                ciphertext.len(),
                BLOCK_SIZE
            )));
        }

        let mut length_bytes = [0u8; LENGTH_TRAILER_SIZE];
        length_bytes.copy_from_slice(trailer);
        let original_length = u64::from_le_bytes(length_bytes);

        let mut plaintext = Aes256CbcDec::new(
            GenericArray::from_slice(self.keys.master_key().key()),
            GenericArray::from_slice(iv),
        )
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| {
            warn!(
                "Envelope padding invalid ({} ciphertext bytes)",
                ciphertext.len()
            );
            Error::Decryption("Invalid padding".to_string())
        })?;

        plaintext.truncate(usize::try_from(original_length).unwrap_or(usize::MAX));
        Ok(plaintext)
    }
}
