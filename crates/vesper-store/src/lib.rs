pub mod key_provider;

pub use key_provider::{KeyProvider, MasterKey};

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const NONCE_LEN: usize = 24;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io")]
    Io,
    #[error("codec")]
    Codec,
    #[error("sealed data unreadable")]
    Sealed,
    #[error("invalid key")]
    InvalidKey,
}

#[derive(Serialize, Deserialize, Default)]
struct Stored {
    entries: HashMap<String, Vec<u8>>,
}

/// Namespaced key/value store persisted as one AEAD-sealed file.
/// File layout: nonce (24 bytes) || XChaCha20-Poly1305 ciphertext of
/// the JSON entry map.
pub struct EncryptedStore {
    path: PathBuf,
    data: Stored,
    namespace: String,
    key: MasterKey,
}

impl EncryptedStore {
    pub fn open(
        path: impl AsRef<Path>,
        namespace: &str,
        key_provider: &dyn KeyProvider,
    ) -> Result<Self, StoreError> {
        let mut base = path.as_ref().to_path_buf();
        fs::create_dir_all(&base).map_err(|_| StoreError::Io)?;
        base.push(format!("{}-store.bin", namespace));
        let key = key_provider.get_or_create_master_key()?;
        let data = if base.exists() {
            let sealed = fs::read(&base).map_err(|_| StoreError::Io)?;
            Self::unseal(&key, &sealed)?
        } else {
            Stored::default()
        };
        Ok(Self {
            path: base,
            data,
            namespace: namespace.to_string(),
            key,
        })
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.data.entries.get(key).cloned())
    }

    pub fn put(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.data.entries.insert(key.to_string(), value.to_vec());
        self.persist()
    }

    pub fn delete(&mut self, key: &str) -> Result<(), StoreError> {
        self.data.entries.remove(key);
        self.persist()
    }

    pub fn clear(&mut self) -> Result<(), StoreError> {
        self.data.entries.clear();
        self.persist()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn persist(&self) -> Result<(), StoreError> {
        let plaintext = serde_json::to_vec(&self.data).map_err(|_| StoreError::Codec)?;
        let cipher = XChaCha20Poly1305::new_from_slice(self.key.as_bytes())
            .map_err(|_| StoreError::InvalidKey)?;
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|_| StoreError::Sealed)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        fs::write(&self.path, out).map_err(|_| StoreError::Io)
    }

    fn unseal(key: &MasterKey, sealed: &[u8]) -> Result<Stored, StoreError> {
        if sealed.len() < NONCE_LEN {
            return Err(StoreError::Sealed);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
            .map_err(|_| StoreError::InvalidKey)?;
        let plaintext = cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| StoreError::Sealed)?;
        serde_json::from_slice(&plaintext).map_err(|_| StoreError::Codec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    struct FixedKey;

    impl KeyProvider for FixedKey {
        fn get_or_create_master_key(&self) -> Result<MasterKey, StoreError> {
            Ok(MasterKey::new([7u8; 32]))
        }
    }

    struct OtherKey;

    impl KeyProvider for OtherKey {
        fn get_or_create_master_key(&self) -> Result<MasterKey, StoreError> {
            Ok(MasterKey::new([8u8; 32]))
        }
    }

    fn temp_path() -> String {
        format!("/tmp/vesper-store-{}", Uuid::new_v4())
    }

    #[test]
    fn put_get_delete_survive_reopen() {
        let path = temp_path();
        {
            let mut store = EncryptedStore::open(&path, "test", &FixedKey).expect("open");
            store.put("a", b"one").expect("put");
            store.put("b", b"two").expect("put");
            store.delete("a").expect("delete");
        }
        let store = EncryptedStore::open(&path, "test", &FixedKey).expect("reopen");
        assert_eq!(store.get("a").expect("get"), None);
        assert_eq!(store.get("b").expect("get"), Some(b"two".to_vec()));
    }

    #[test]
    fn wrong_key_cannot_unseal() {
        let path = temp_path();
        {
            let mut store = EncryptedStore::open(&path, "test", &FixedKey).expect("open");
            store.put("a", b"secret").expect("put");
        }
        let err = EncryptedStore::open(&path, "test", &OtherKey);
        assert!(matches!(err, Err(StoreError::Sealed)));
    }

    #[test]
    fn namespaces_are_isolated() {
        let path = temp_path();
        let mut left = EncryptedStore::open(&path, "left", &FixedKey).expect("open");
        left.put("k", b"left").expect("put");
        let right = EncryptedStore::open(&path, "right", &FixedKey).expect("open");
        assert_eq!(right.get("k").expect("get"), None);
    }
}
