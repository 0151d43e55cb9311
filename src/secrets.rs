// =============================================================================
// Token Vault — AES-256-GCM encryption for bearer tokens at rest
// =============================================================================
//
// SECURITY: decrypted tokens exist only in memory. The persisted `sessions`
// row stores `hex(nonce):hex(ciphertext)`; the key is derived from a
// server-held passphrase (SHA-256) and never written anywhere.
// =============================================================================

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, KeyInit, Nonce};
use sha2::{Digest, Sha256};

use crate::errors::EngineError;

/// Encrypts and decrypts account tokens with a server-held key.
pub struct TokenVault {
    cipher: Aes256Gcm,
}

impl TokenVault {
    /// Derive the AEAD key from a passphrase via SHA-256.
    pub fn from_passphrase(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(digest.as_slice());
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Encrypt a token for storage. Output format: `hex(nonce):hex(ct)`.
    pub fn encrypt(&self, token: &str) -> Result<String, EngineError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, token.as_bytes())
            .map_err(|_| EngineError::Auth("token encryption failed".to_string()))?;

        Ok(format!("{}:{}", hex::encode(nonce), hex::encode(ciphertext)))
    }

    /// Decrypt a stored token. Fails if the key is wrong or the blob was
    /// tampered with (GCM authentication).
    pub fn decrypt(&self, stored: &str) -> Result<String, EngineError> {
        let (nonce_hex, ct_hex) = stored
            .split_once(':')
            .ok_or_else(|| EngineError::Auth("malformed stored token".to_string()))?;

        let nonce_bytes = hex::decode(nonce_hex)
            .map_err(|_| EngineError::Auth("malformed stored token nonce".to_string()))?;
        if nonce_bytes.len() != 12 {
            return Err(EngineError::Auth("bad stored token nonce length".to_string()));
        }
        let ciphertext = hex::decode(ct_hex)
            .map_err(|_| EngineError::Auth("malformed stored token ciphertext".to_string()))?;

        let nonce = Nonce::from_slice(&nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|_| EngineError::Auth("token decryption failed".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|_| EngineError::Auth("decrypted token is not UTF-8".to_string()))
    }
}

impl std::fmt::Debug for TokenVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVault").field("key", &"<redacted>").finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
