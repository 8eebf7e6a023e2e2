use super::{BackupError, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File header identifying an encrypted artifact
const MAGIC: &[u8; 8] = b"CDXBAK01";
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;
pub const ENCRYPTED_EXTENSION: &str = "enc";

/// Result of encrypting an artifact in place
#[derive(Debug, Clone)]
pub struct EncryptedFile {
    pub path: PathBuf,
    pub iv: String,
}

/// AES-256-GCM over whole artifact files. Every call draws a fresh nonce,
/// which is written after the magic header so each file is
/// self-describing.
#[derive(Clone)]
pub struct ArtifactCipher {
    key: [u8; 32],
}

impl fmt::Debug for ArtifactCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ArtifactCipher { key: *** }")
    }
}

impl ArtifactCipher {
    /// Derive the 256-bit key from a passphrase with SHA-256
    pub fn from_passphrase(passphrase: &str) -> Result<Self> {
        if passphrase.is_empty() {
            return Err(BackupError::Encryption {
                message: "Encryption key must not be empty".to_string(),
            });
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&Sha256::digest(passphrase.as_bytes()));
        Ok(Self { key })
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key).map_err(|e| BackupError::Encryption {
            message: format!("Invalid key: {e}"),
        })
    }

    /// Returns `magic | nonce | ciphertext+tag` and the nonce used
    pub fn encrypt_bytes(&self, plaintext: &[u8]) -> Result<(Vec<u8>, [u8; NONCE_SIZE])> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| BackupError::Encryption {
                message: format!("Encryption failed: {e}"),
            })?;

        let mut framed = Vec::with_capacity(MAGIC.len() + NONCE_SIZE + ciphertext.len());
        framed.extend_from_slice(MAGIC);
        framed.extend_from_slice(&nonce_bytes);
        framed.extend_from_slice(&ciphertext);
        Ok((framed, nonce_bytes))
    }

    pub fn decrypt_bytes(&self, framed: &[u8]) -> Result<Vec<u8>> {
        let nonce = read_nonce(framed)?;
        let ciphertext = &framed[MAGIC.len() + NONCE_SIZE..];
        self.cipher()?
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| BackupError::Encryption {
                message: "Decryption failed: wrong key or corrupted artifact".to_string(),
            })
    }

    /// Encrypt `path` into `path.enc` and remove the plaintext
    pub async fn encrypt_file_in_place(&self, path: &Path) -> Result<EncryptedFile> {
        let cipher = self.clone();
        let source = path.to_path_buf();
        let target = encrypted_path(path);

        let result = tokio::task::spawn_blocking(move || -> Result<EncryptedFile> {
            let plaintext = fs::read(&source)?;
            let (framed, nonce) = cipher.encrypt_bytes(&plaintext)?;
            write_synced(&target, &framed)?;
            fs::remove_file(&source)?;
            Ok(EncryptedFile {
                path: target,
                iv: hex::encode(nonce),
            })
        })
        .await??;

        debug!("Encrypted artifact {}", result.path.display());
        Ok(result)
    }

    pub async fn decrypt_file(&self, source: &Path, target: &Path) -> Result<()> {
        let cipher = self.clone();
        let source = source.to_path_buf();
        let target = target.to_path_buf();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let framed = fs::read(&source)?;
            let plaintext = cipher.decrypt_bytes(&framed)?;
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            write_synced(&target, &plaintext)
        })
        .await?
    }
}

/// Nonce embedded in an encrypted artifact's header
pub fn read_nonce(framed: &[u8]) -> Result<[u8; NONCE_SIZE]> {
    if framed.len() < MAGIC.len() + NONCE_SIZE + TAG_SIZE || &framed[..MAGIC.len()] != MAGIC {
        return Err(BackupError::Encryption {
            message: "Not an encrypted backup artifact".to_string(),
        });
    }
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&framed[MAGIC.len()..MAGIC.len() + NONCE_SIZE]);
    Ok(nonce)
}

pub fn encrypted_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(ENCRYPTED_EXTENSION);
    PathBuf::from(name)
}

/// Inverse of [`encrypted_path`]
pub fn decrypted_file_name(file_name: &str) -> &str {
    file_name
        .strip_suffix(".enc")
        .unwrap_or(file_name)
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn every_encryption_uses_a_fresh_nonce() {
        let cipher = ArtifactCipher::from_passphrase("correct horse").unwrap();
        let (first, nonce_a) = cipher.encrypt_bytes(b"same payload").unwrap();
        let (second, nonce_b) = cipher.encrypt_bytes(b"same payload").unwrap();

        assert_ne!(nonce_a, nonce_b);
        assert_ne!(first, second);
        assert_eq!(cipher.decrypt_bytes(&first).unwrap(), b"same payload");
        assert_eq!(cipher.decrypt_bytes(&second).unwrap(), b"same payload");
    }

    #[test]
    fn wrong_key_or_tampering_fails() {
        let cipher = ArtifactCipher::from_passphrase("key-one").unwrap();
        let other = ArtifactCipher::from_passphrase("key-two").unwrap();
        let (mut framed, _) = cipher.encrypt_bytes(b"payload").unwrap();

        assert!(matches!(
            other.decrypt_bytes(&framed),
            Err(BackupError::Encryption { .. })
        ));

        let last = framed.len() - 1;
        framed[last] ^= 0xff;
        assert!(cipher.decrypt_bytes(&framed).is_err());

        assert!(cipher.decrypt_bytes(b"short").is_err());
    }

    #[test]
    fn empty_passphrase_is_rejected() {
        assert!(ArtifactCipher::from_passphrase("").is_err());
        let cipher = ArtifactCipher::from_passphrase("x").unwrap();
        assert!(!format!("{cipher:?}").contains('x'));
    }

    #[tokio::test]
    async fn file_round_trip_replaces_plaintext() {
        let dir = TempDir::new().unwrap();
        let plain = dir.path().join("dump.sql");
        fs::write(&plain, b"CREATE TABLE t();").unwrap();

        let cipher = ArtifactCipher::from_passphrase("secret").unwrap();
        let encrypted = cipher.encrypt_file_in_place(&plain).await.unwrap();

        assert!(!plain.exists());
        assert_eq!(encrypted.path, dir.path().join("dump.sql.enc"));
        assert_eq!(encrypted.iv.len(), NONCE_SIZE * 2);

        let header = fs::read(&encrypted.path).unwrap();
        assert_eq!(hex::encode(read_nonce(&header).unwrap()), encrypted.iv);

        let restored = dir.path().join("out/dump.sql");
        cipher.decrypt_file(&encrypted.path, &restored).await.unwrap();
        assert_eq!(fs::read(&restored).unwrap(), b"CREATE TABLE t();");
        assert_eq!(decrypted_file_name("dump.sql.enc"), "dump.sql");
    }
}
