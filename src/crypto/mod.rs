//! Wallet secret encryption and password verification
//!
//! This module provides:
//! - PBKDF2 key derivation for password-based encryption
//! - AES-256-GCM encryption/decryption of wallet secrets
//! - The password check token scheme
//!
//! The stored representation is `hex(salt || nonce || ciphertext)` with
//! fixed-length salt and nonce segments sliced back off on decrypt. The
//! wallet never persists the password itself: it stores only
//! `encrypt("secret", password)` and verifies a password attempt by
//! decrypting and comparing against the literal.

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use log::info;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;

use crate::error::WalletError;

/// Salt length in bytes, hex-encoded to 32 characters in storage.
const SALT_LEN: usize = 16;
/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;
/// PBKDF2 iteration count.
const ITERATIONS: u32 = 100_000;

/// The constant encrypted by the password check token. Never used to derive
/// key material.
pub const SECRET_TOKEN: &str = "secret";

/// Symmetric encryption for the password check token and exported keys.
pub struct WalletCrypto {
    iterations: u32,
}

impl Default for WalletCrypto {
    fn default() -> Self {
        Self::new()
    }
}

impl WalletCrypto {
    pub fn new() -> Self {
        Self {
            iterations: ITERATIONS,
        }
    }

    fn derive_key(&self, password: &str, salt: &[u8]) -> [u8; 32] {
        let mut key = [0u8; 32];
        pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, self.iterations, &mut key);
        key
    }

    /// Encrypt a message under a password. Output is
    /// `hex(salt || nonce || ciphertext)`.
    pub fn encrypt(&self, message: &str, password: &str) -> Result<String, WalletError> {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut nonce_bytes);

        let key_bytes = self.derive_key(password, &salt);
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        let cipher = Aes256Gcm::new(key);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, message.as_bytes())
            .map_err(|e| WalletError::Crypto(format!("encryption failed: {e}")))?;

        let mut out = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&salt);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(hex::encode(out))
    }

    /// Decrypt a `hex(salt || nonce || ciphertext)` message. Fails on a wrong
    /// password: the authenticated mode rejects the ciphertext.
    pub fn decrypt(&self, transit: &str, password: &str) -> Result<String, WalletError> {
        let bytes = hex::decode(transit)
            .map_err(|e| WalletError::Crypto(format!("malformed ciphertext hex: {e}")))?;
        if bytes.len() < SALT_LEN + NONCE_LEN {
            return Err(WalletError::Crypto("ciphertext too short".into()));
        }
        let (salt, rest) = bytes.split_at(SALT_LEN);
        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);

        let key_bytes = self.derive_key(password, salt);
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        let cipher = Aes256Gcm::new(key);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| WalletError::Crypto("decryption failed (incorrect password?)".into()))?;

        String::from_utf8(plaintext)
            .map_err(|e| WalletError::Crypto(format!("decrypted data is not UTF-8: {e}")))
    }

    /// Build the password check token stored in place of the password.
    pub fn make_check_token(&self, password: &str) -> Result<String, WalletError> {
        info!("rotating wallet password check token");
        self.encrypt(SECRET_TOKEN, password)
    }

    /// Verify a password attempt against a stored check token.
    pub fn verify_check_token(&self, token: &str, password: &str) -> bool {
        match self.decrypt(token, password) {
            Ok(plain) => plain == SECRET_TOKEN,
            Err(_) => false,
        }
    }
}
