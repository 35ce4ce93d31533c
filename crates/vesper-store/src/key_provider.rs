use crate::StoreError;
use zeroize::Zeroizing;

/// 32-byte master key sealing the on-disk store.
#[derive(Clone)]
pub struct MasterKey {
    bytes: Zeroizing<[u8; 32]>,
}

impl MasterKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self {
            bytes: Zeroizing::new(bytes),
        }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

pub trait KeyProvider: Send + Sync {
    fn get_or_create_master_key(&self) -> Result<MasterKey, StoreError>;
}
