//! `StorageFacade`: an identity-scoped, encrypted content-addressed KV
//! store. The real network-backed implementation is an external
//! collaborator (spec.md §1 non-goals); `FsStorageFacade` is a filesystem
//! stand-in that honors the same contract: confidentiality by encryption,
//! not access control, and durable writes before `put` returns.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use async_trait::async_trait;
use hkdf::Hkdf;
use sha2::Sha256;
use tokio::sync::Mutex;

use crate::error::{CoreError, Result};
use crate::identity::SeedPhrase;

const HKDF_INFO: &[u8] = b"infermesh-storage-aes256gcm";
const NONCE_LEN: usize = 12;

#[derive(Debug, Clone)]
pub struct StorageMetadata {
    pub size_bytes: u64,
    pub modified_unix_ms: i64,
}

/// Content-addressed file system scoped to an identity.
#[async_trait]
pub trait StorageFacade: Send + Sync {
    async fn put(&self, path: &str, value: &[u8]) -> Result<()>;
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>>;
    async fn metadata(&self, path: &str) -> Result<Option<StorageMetadata>>;
    async fn delete(&self, path: &str) -> Result<()>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Filesystem-backed `StorageFacade`. Each identity gets its own root
/// directory, derived from the seed phrase, so two identities never share a
/// path on disk even when the logical path is identical.
pub struct FsStorageFacade {
    root: PathBuf,
    cipher: Aes256Gcm,
    // Per-path lock striping: a single identity serializes writes to the
    // same path; concurrent writes to different paths proceed in parallel.
    path_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FsStorageFacade {
    /// `connect(seed)`: derives the encryption key and root directory from
    /// the seed phrase. The root directory name is itself a SHA-256 of the
    /// phrase so a cross-identity reader who only knows another identity's
    /// path cannot even enumerate this identity's files.
    pub fn connect(seed: &SeedPhrase, storage_root: &Path) -> Result<Self> {
        let phrase_bytes = seed.to_string_space_separated().into_bytes();

        let hk = Hkdf::<Sha256>::new(None, &phrase_bytes);
        let mut key_bytes = [0u8; 32];
        hk.expand(HKDF_INFO, &mut key_bytes)
            .map_err(|_| CoreError::Internal {
                message: "hkdf expand failed".to_string(),
            })?;
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        let cipher = Aes256Gcm::new(key);

        let dir_hash = {
            use sha2::Digest;
            let mut hasher = Sha256::new();
            hasher.update(&phrase_bytes);
            hex::encode(hasher.finalize())
        };
        let root = storage_root.join(dir_hash);

        Ok(Self {
            root,
            cipher,
            path_locks: Mutex::new(HashMap::new()),
        })
    }

    fn file_path(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    async fn lock_for(&self, path: &str) -> Arc<Mutex<()>> {
        let mut locks = self.path_locks.lock().await;
        locks
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let mut ciphertext =
            self.cipher
                .encrypt(&nonce, plaintext)
                .map_err(|_| CoreError::Internal {
                    message: "encryption failed".to_string(),
                })?;
        let mut out = nonce.to_vec();
        out.append(&mut ciphertext);
        Ok(out)
    }

    fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>> {
        if blob.len() < NONCE_LEN {
            return Err(CoreError::Internal {
                message: "storage blob shorter than nonce".to_string(),
            });
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CoreError::Internal {
                message: "decryption failed: wrong identity or corrupted data".to_string(),
            })
    }
}

#[async_trait]
impl StorageFacade for FsStorageFacade {
    async fn put(&self, path: &str, value: &[u8]) -> Result<()> {
        let lock = self.lock_for(path).await;
        let _guard = lock.lock().await;

        let file_path = self.file_path(path);
        if let Some(parent) = file_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let encrypted = self.encrypt(value)?;
        // Write-then-rename so a reader never observes a partial write.
        let tmp_path = file_path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &encrypted).await?;
        tokio::fs::rename(&tmp_path, &file_path).await?;
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let file_path = self.file_path(path);
        match tokio::fs::read(&file_path).await {
            Ok(blob) => Ok(Some(self.decrypt(&blob)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn metadata(&self, path: &str) -> Result<Option<StorageMetadata>> {
        let file_path = self.file_path(path);
        match tokio::fs::metadata(&file_path).await {
            Ok(meta) => {
                let modified_unix_ms = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as i64)
                    .unwrap_or(0);
                Ok(Some(StorageMetadata {
                    size_bytes: meta.len(),
                    modified_unix_ms,
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let lock = self.lock_for(path).await;
        let _guard = lock.lock().await;

        let file_path = self.file_path(path);
        match tokio::fs::remove_file(&file_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.file_path(prefix);
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                out.push(format!("{prefix}/{name}"));
            }
        }
        out.sort();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityKeyDerivation;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let derivation = IdentityKeyDerivation::new();
        let seed = derivation.derive_seed_from_address("0xAAAA", 84532);
        let facade = FsStorageFacade::connect(&seed, tmp.path()).unwrap();

        facade.put("conversations/s1/manifest", b"hello").await.unwrap();
        let value = facade.get("conversations/s1/manifest").await.unwrap();
        assert_eq!(value, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn missing_path_returns_none() {
        let tmp = tempfile::tempdir().unwrap();
        let derivation = IdentityKeyDerivation::new();
        let seed = derivation.derive_seed_from_address("0xAAAA", 84532);
        let facade = FsStorageFacade::connect(&seed, tmp.path()).unwrap();

        assert_eq!(facade.get("nothing/here").await.unwrap(), None);
    }

    #[tokio::test]
    async fn cross_identity_read_never_succeeds() {
        let tmp = tempfile::tempdir().unwrap();
        let derivation = IdentityKeyDerivation::new();
        let seed_a = derivation.derive_seed_from_address("0xAAAA", 84532);
        let seed_b = derivation.derive_seed_from_address("0xBBBB", 84532);

        let facade_a = FsStorageFacade::connect(&seed_a, tmp.path()).unwrap();
        let facade_b = FsStorageFacade::connect(&seed_b, tmp.path()).unwrap();

        facade_a.put("shared/path", b"secret").await.unwrap();
        assert_eq!(facade_b.get("shared/path").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_then_get_returns_none() {
        let tmp = tempfile::tempdir().unwrap();
        let derivation = IdentityKeyDerivation::new();
        let seed = derivation.derive_seed_from_address("0xAAAA", 84532);
        let facade = FsStorageFacade::connect(&seed, tmp.path()).unwrap();

        facade.put("a/b", b"v").await.unwrap();
        facade.delete("a/b").await.unwrap();
        assert_eq!(facade.get("a/b").await.unwrap(), None);
    }
}
