use aes::Aes256;
use base64::{
    engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD},
    Engine as _,
};
use bytes::Bytes;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::content::{EncryptionInfo, JsonWebKey};
use crate::errors::{AppError, AppResult};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;
/// Version tag of the attachment encryption scheme.
pub const ATTACHMENT_VERSION: &str = "v2";

#[derive(Debug, Clone)]
pub struct EncryptedAttachment {
    pub data: Bytes,
    pub info: EncryptionInfo,
}

/// Turns plaintext attachment bytes into ciphertext plus the key material to read it.
pub trait AttachmentEncryptor: Send + Sync {
    /// Always produces fresh key material.
    fn encrypt(&self, data: &[u8]) -> AppResult<EncryptedAttachment>;
}

/// AES-256-CTR with a random key per attachment.
///
/// The upper 8 bytes of the IV are random and the lower 8 (the block counter)
/// start at zero, so a single attachment can never wrap the counter.
#[derive(Debug, Clone, Default)]
pub struct AesCtrEncryptor;

impl AttachmentEncryptor for AesCtrEncryptor {
    fn encrypt(&self, data: &[u8]) -> AppResult<EncryptedAttachment> {
        let mut key = [0u8; KEY_LEN];
        let mut iv = [0u8; IV_LEN];
        OsRng
            .try_fill_bytes(&mut key)
            .and_then(|_| OsRng.try_fill_bytes(&mut iv[..8]))
            .map_err(|e| AppError::Encryption(format!("No randomness available: {}", e)))?;

        let mut ciphertext = data.to_vec();
        let mut cipher = Aes256Ctr::new(&key.into(), &iv.into());
        cipher.apply_keystream(&mut ciphertext);

        let mut hashes = BTreeMap::new();
        hashes.insert(
            "sha256".to_string(),
            STANDARD_NO_PAD.encode(Sha256::digest(&ciphertext)),
        );

        Ok(EncryptedAttachment {
            data: Bytes::from(ciphertext),
            info: EncryptionInfo {
                key: JsonWebKey {
                    kty: "oct".to_string(),
                    key_ops: vec!["encrypt".to_string(), "decrypt".to_string()],
                    alg: "A256CTR".to_string(),
                    k: URL_SAFE_NO_PAD.encode(key),
                    ext: true,
                },
                iv: STANDARD_NO_PAD.encode(iv),
                hashes,
                v: ATTACHMENT_VERSION.to_string(),
            },
        })
    }
}

/// Reverse of [`AesCtrEncryptor::encrypt`]; verifies the ciphertext hash first.
pub fn decrypt_attachment(ciphertext: &[u8], info: &EncryptionInfo) -> AppResult<Vec<u8>> {
    if info.v != ATTACHMENT_VERSION {
        return Err(AppError::Encryption(format!(
            "Unsupported attachment version {}",
            info.v
        )));
    }
    if info.key.alg != "A256CTR" {
        return Err(AppError::Encryption(format!(
            "Unsupported key algorithm {}",
            info.key.alg
        )));
    }

    let expected_hash = info
        .hashes
        .get("sha256")
        .ok_or_else(|| AppError::Encryption("Missing sha256 hash".to_string()))?;
    if &STANDARD_NO_PAD.encode(Sha256::digest(ciphertext)) != expected_hash {
        return Err(AppError::Encryption("Ciphertext hash mismatch".to_string()));
    }

    let key: [u8; KEY_LEN] = URL_SAFE_NO_PAD
        .decode(&info.key.k)
        .map_err(|e| AppError::Encryption(format!("Failed to decode key: {}", e)))?
        .try_into()
        .map_err(|_| AppError::Encryption("Key must be 32 bytes".to_string()))?;
    let iv: [u8; IV_LEN] = STANDARD_NO_PAD
        .decode(&info.iv)
        .map_err(|e| AppError::Encryption(format!("Failed to decode iv: {}", e)))?
        .try_into()
        .map_err(|_| AppError::Encryption("IV must be 16 bytes".to_string()))?;

    let mut plaintext = ciphertext.to_vec();
    let mut cipher = Aes256Ctr::new(&key.into(), &iv.into());
    cipher.apply_keystream(&mut plaintext);
    Ok(plaintext)
}
