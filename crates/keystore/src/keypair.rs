//! ed25519 signing keys on disk

use std::path::{Path, PathBuf};

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use stellar_strkey::{ed25519, Strkey};
use thiserror::Error;
use tracing::{debug, info};

use crate::paths::default_config_dir;

#[derive(Error, Debug)]
pub enum KeystoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid secret key in {0}")]
    InvalidKey(String),

    #[error("Key file {0} already exists")]
    AlreadyExists(PathBuf),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> KeystoreError + '_ {
    move |source| KeystoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// `~/.sharecraft/admin.key`
pub fn default_key_path() -> PathBuf {
    default_config_dir().join("admin.key")
}

/// Stellar secret seed (`S...`) for a signing key
pub fn encode_secret(key: &SigningKey) -> String {
    Strkey::PrivateKeyEd25519(ed25519::PrivateKey(key.to_bytes())).to_string()
}

/// Parse an `S...` secret seed or 64 hex characters
pub fn decode_secret(text: &str) -> Option<SigningKey> {
    let text = text.trim();
    if let Ok(Strkey::PrivateKeyEd25519(secret)) = Strkey::from_string(text) {
        return Some(SigningKey::from_bytes(&secret.0));
    }
    let bytes: [u8; 32] = hex::decode(text).ok()?.try_into().ok()?;
    Some(SigningKey::from_bytes(&bytes))
}

pub fn load_signing_key(path: &Path) -> Result<SigningKey, KeystoreError> {
    let text = std::fs::read_to_string(path).map_err(io_error(path))?;
    let key = decode_secret(&text).ok_or_else(|| KeystoreError::InvalidKey(path.display().to_string()))?;
    debug!("Loaded signing key from {}", path.display());
    Ok(key)
}

/// Write a key file readable only by its owner. Refuses to overwrite.
pub fn save_signing_key(path: &Path, key: &SigningKey) -> Result<(), KeystoreError> {
    if path.exists() {
        return Err(KeystoreError::AlreadyExists(path.to_path_buf()));
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_error(parent))?;
    }
    std::fs::write(path, format!("{}\n", encode_secret(key))).map_err(io_error(path))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(io_error(path))?;
    }
    Ok(())
}

/// Load the key at `path`, generating and saving a new one if absent
pub fn load_or_generate_signing_key(path: &Path) -> Result<SigningKey, KeystoreError> {
    if path.exists() {
        return load_signing_key(path);
    }
    let key = SigningKey::generate(&mut OsRng);
    save_signing_key(path, &key)?;
    info!(
        "Generated new signing key at {} ({})",
        path.display(),
        hex::encode(&key.verifying_key().to_bytes()[..8])
    );
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generate_then_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys").join("admin.key");

        let generated = load_or_generate_signing_key(&path).unwrap();
        let loaded = load_or_generate_signing_key(&path).unwrap();
        assert_eq!(generated.to_bytes(), loaded.to_bytes());

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with('S'));
    }

    #[test]
    fn test_decode_accepts_hex_and_strkey() {
        let key = SigningKey::from_bytes(&[5u8; 32]);
        let from_strkey = decode_secret(&encode_secret(&key)).unwrap();
        let from_hex = decode_secret(&hex::encode([5u8; 32])).unwrap();
        assert_eq!(from_strkey.to_bytes(), key.to_bytes());
        assert_eq!(from_hex.to_bytes(), key.to_bytes());
        assert!(decode_secret("not a key").is_none());
        assert!(decode_secret(&hex::encode([5u8; 16])).is_none());
    }

    #[test]
    fn test_save_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("admin.key");
        let key = SigningKey::from_bytes(&[1u8; 32]);
        save_signing_key(&path, &key).unwrap();
        assert!(matches!(
            save_signing_key(&path, &key),
            Err(KeystoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_garbage_key_file_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("admin.key");
        std::fs::write(&path, "garbage").unwrap();
        assert!(matches!(load_signing_key(&path), Err(KeystoreError::InvalidKey(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("admin.key");
        save_signing_key(&path, &SigningKey::from_bytes(&[2u8; 32])).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
