use std::fs;
use std::path::{Path, PathBuf};

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;

use crate::error::SyncError;
use crate::model::AccountConfig;

const KEY_FILE: &str = ".encryption_key";

fn get_encryption_key(data_dir: &Path) -> Result<Aes256Gcm, SyncError> {
    let key_path: PathBuf = data_dir.join(KEY_FILE);
    let key = if key_path.exists() {
        // Read existing key
        let key_bytes = fs::read(key_path)?;
        Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|e| SyncError::Config(format!("Failed to create cipher from key: {}", e)))?
    } else {
        // Generate new key
        let mut key_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key_bytes);
        fs::write(key_path, key_bytes)?;
        Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|e| SyncError::Config(format!("Failed to create cipher from new key: {}", e)))?
    };
    Ok(key)
}

fn encrypt_blob(data_dir: &Path, plaintext: &[u8]) -> Result<String, SyncError> {
    let cipher = get_encryption_key(data_dir)?;
    let mut nonce_bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| SyncError::Config(format!("Failed to encrypt credentials: {}", e)))?;

    let mut combined = Vec::new();
    combined.extend_from_slice(&nonce_bytes);
    combined.extend_from_slice(&ciphertext);

    Ok(BASE64.encode(&combined))
}

fn decrypt_blob(data_dir: &Path, encrypted: &str) -> Result<Vec<u8>, SyncError> {
    let cipher = get_encryption_key(data_dir)?;
    let combined = BASE64
        .decode(encrypted)
        .map_err(|e| SyncError::Config(format!("Failed to decode base64: {}", e)))?;

    if combined.len() < 12 {
        return Err(SyncError::Config("Credentials blob too short".to_string()));
    }
    let (nonce_bytes, ciphertext) = combined.split_at(12);
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| SyncError::Config(format!("Failed to decrypt credentials: {}", e)))
}

/// Encrypt one account's connection config for storage at rest.
pub fn encrypt_credentials(data_dir: &Path, config: &AccountConfig) -> Result<String, SyncError> {
    let plaintext = serde_json::to_vec(config)?;
    encrypt_blob(data_dir, &plaintext)
}

pub fn decrypt_credentials(data_dir: &Path, encrypted: &str) -> Result<AccountConfig, SyncError> {
    let plaintext = decrypt_blob(data_dir, encrypted)?;
    Ok(serde_json::from_slice(&plaintext)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> AccountConfig {
        AccountConfig {
            host: Some("imap.example.com".into()),
            port: Some(993),
            username: Some("user@example.com".into()),
            password: Some("hunter2".into()),
            oauth_token: None,
            refresh_token: None,
            client_id: None,
            client_secret: None,
        }
    }

    #[test]
    fn credentials_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = sample_config();
        let blob = encrypt_credentials(dir.path(), &config).unwrap();
        assert!(!blob.contains("hunter2"));
        let restored = decrypt_credentials(dir.path(), &blob).unwrap();
        assert_eq!(restored.password.as_deref(), Some("hunter2"));
        assert_eq!(restored.host, config.host);
    }

    #[test]
    fn blob_is_nondeterministic() {
        let dir = tempfile::tempdir().unwrap();
        let config = sample_config();
        let a = encrypt_credentials(dir.path(), &config).unwrap();
        let b = encrypt_credentials(dir.path(), &config).unwrap();
        // Fresh nonce per encryption
        assert_ne!(a, b);
    }
}
