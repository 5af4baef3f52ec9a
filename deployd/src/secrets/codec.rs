//! Authenticated encryption of deployment credentials
//!
//! AES-256-GCM with the owning application's id as associated data. Output
//! layout is `base64url(nonce || ciphertext || tag)` with a fresh random
//! 96-bit nonce per call.

use std::fmt;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use secrecy::{ExposeSecret, SecretSlice};

use crate::errors::DeployError;
use crate::secrets::env::DeployEnv;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// AES-256-GCM codec bound to one master key
pub struct SecretCodec {
    cipher: Aes256Gcm,
}

impl SecretCodec {
    /// Build from a 64 character hex key
    pub fn from_hex_key(hex_key: &str) -> Result<Self, DeployError> {
        let key = SecretSlice::from(
            hex::decode(hex_key.trim())
                .map_err(|e| DeployError::ConfigError(format!("Invalid key encoding: {}", e)))?,
        );
        Self::from_key(key.expose_secret())
    }

    /// Build from raw key bytes
    pub fn from_key(key: &[u8]) -> Result<Self, DeployError> {
        if key.len() != KEY_LEN {
            return Err(DeployError::ConfigError(format!(
                "Key must be {} bytes for AES-256, got {}",
                KEY_LEN,
                key.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| DeployError::ConfigError(format!("Invalid key: {}", e)))?;
        Ok(Self { cipher })
    }

    /// Encrypt `plaintext` for `app_id`
    pub fn encrypt(&self, plaintext: &[u8], app_id: &str) -> Result<String, DeployError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: app_id.as_bytes(),
                },
            )
            .map_err(|_| DeployError::Internal("Encryption failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(URL_SAFE.encode(out))
    }

    /// Decrypt `ciphertext` that must have been produced for `app_id`.
    ///
    /// Any tampering, truncation or app id mismatch is an `IntegrityError`.
    pub fn decrypt(&self, ciphertext: &str, app_id: &str) -> Result<SecretSlice<u8>, DeployError> {
        let data = URL_SAFE
            .decode(ciphertext)
            .map_err(|_| DeployError::IntegrityError("Ciphertext is not valid base64".to_string()))?;

        if data.len() < NONCE_LEN {
            return Err(DeployError::IntegrityError("Ciphertext too short".to_string()));
        }
        let (nonce, sealed) = data.split_at(NONCE_LEN);

        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: sealed,
                    aad: app_id.as_bytes(),
                },
            )
            .map_err(|_| {
                DeployError::IntegrityError(format!(
                    "Credentials failed authentication for app {}",
                    app_id
                ))
            })?;

        Ok(SecretSlice::from(plaintext))
    }

    /// Encrypt an environment map as JSON
    pub fn encrypt_env(&self, env: &DeployEnv, app_id: &str) -> Result<String, DeployError> {
        let json = env.to_json()?;
        self.encrypt(json.expose_secret(), app_id)
    }

    /// Decrypt and parse an environment map
    pub fn decrypt_env(&self, ciphertext: &str, app_id: &str) -> Result<DeployEnv, DeployError> {
        let plaintext = self.decrypt(ciphertext, app_id)?;
        DeployEnv::from_json(plaintext.expose_secret())
    }
}

impl fmt::Debug for SecretCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretCodec([REDACTED])")
    }
}
