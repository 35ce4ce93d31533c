use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

const WRAP_CONTEXT: &[u8] = b"vesper:hybrid:key-wrap:v1";
const NONCE_LEN: usize = 24;
const EPHEMERAL_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("derive")]
    Derive,
    #[error("aead")]
    Aead,
    #[error("key unwrap")]
    KeyUnwrap,
    #[error("invalid key")]
    InvalidKey,
    #[error("signature")]
    Signature,
}

/// x25519 keypair for hybrid encryption. Key material distinct from
/// the signing keypair by construction.
#[derive(Clone)]
pub struct EncryptionKeypair {
    pub public: [u8; 32],
    secret: Zeroizing<[u8; 32]>,
}

impl EncryptionKeypair {
    pub fn from_secret_bytes(secret: [u8; 32]) -> Self {
        let secret = Zeroizing::new(secret);
        let public = PublicKey::from(&StaticSecret::from(*secret)).to_bytes();
        Self { public, secret }
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret
    }
}

/// ed25519 keypair for detached signatures.
#[derive(Clone)]
pub struct SigningKeypair {
    pub public: [u8; 32],
    secret: Zeroizing<[u8; 32]>,
}

impl SigningKeypair {
    pub fn from_secret_bytes(secret: [u8; 32]) -> Self {
        let secret = Zeroizing::new(secret);
        let public = SigningKey::from_bytes(&secret).verifying_key().to_bytes();
        Self { public, secret }
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret
    }

    fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.secret)
    }
}

/// Hybrid ciphertext pair: the wrapped symmetric key travels next to
/// the sealed payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HybridCiphertext {
    pub encrypted_symmetric_key: Vec<u8>,
    pub encrypted_data: Vec<u8>,
}

pub fn generate_encryption_keys() -> EncryptionKeypair {
    let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let public = PublicKey::from(&secret).to_bytes();
    EncryptionKeypair {
        public,
        secret: Zeroizing::new(secret.to_bytes()),
    }
}

pub fn generate_signing_keys() -> SigningKeypair {
    let mut secret = Zeroizing::new([0u8; 32]);
    rand::rngs::OsRng.fill_bytes(secret.as_mut());
    let signing = SigningKey::from_bytes(&secret);
    SigningKeypair {
        public: signing.verifying_key().to_bytes(),
        secret,
    }
}

fn derive_wrap_key(shared_secret: [u8; 32]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let hkdf = Hkdf::<Sha256>::new(None, &shared_secret);
    let mut out = Zeroizing::new([0u8; 32]);
    hkdf.expand(WRAP_CONTEXT, out.as_mut())
        .map_err(|_| CryptoError::Derive)?;
    Ok(out)
}

/// Hybrid encryption: fresh random symmetric key seals the plaintext,
/// then an ephemeral ECDH against the recipient's public key wraps the
/// symmetric key. Wire layout of the wrapped key:
/// `ephemeral_public(32) || nonce(24) || sealed key`; of the data:
/// `nonce(24) || ciphertext`.
pub fn encrypt(
    recipient_public: &[u8; 32],
    plaintext: &[u8],
) -> Result<HybridCiphertext, CryptoError> {
    let mut symmetric = Zeroizing::new([0u8; 32]);
    rand::rngs::OsRng.fill_bytes(symmetric.as_mut());

    let cipher =
        XChaCha20Poly1305::new_from_slice(symmetric.as_ref()).map_err(|_| CryptoError::InvalidKey)?;
    let data_nonce = XChaCha20Poly1305::generate_nonce(&mut AeadOsRng);
    let sealed = cipher
        .encrypt(&data_nonce, plaintext)
        .map_err(|_| CryptoError::Aead)?;
    let mut encrypted_data = Vec::with_capacity(NONCE_LEN + sealed.len());
    encrypted_data.extend_from_slice(&data_nonce);
    encrypted_data.extend_from_slice(&sealed);

    let ephemeral = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let shared = ephemeral
        .diffie_hellman(&PublicKey::from(*recipient_public))
        .to_bytes();
    let wrap_key = derive_wrap_key(shared)?;
    let wrap_cipher =
        XChaCha20Poly1305::new_from_slice(wrap_key.as_ref()).map_err(|_| CryptoError::InvalidKey)?;
    let wrap_nonce = XChaCha20Poly1305::generate_nonce(&mut AeadOsRng);
    let wrapped = wrap_cipher
        .encrypt(&wrap_nonce, symmetric.as_slice())
        .map_err(|_| CryptoError::Aead)?;

    let ephemeral_public = PublicKey::from(&ephemeral).to_bytes();
    let mut encrypted_symmetric_key =
        Vec::with_capacity(EPHEMERAL_LEN + NONCE_LEN + wrapped.len());
    encrypted_symmetric_key.extend_from_slice(&ephemeral_public);
    encrypted_symmetric_key.extend_from_slice(&wrap_nonce);
    encrypted_symmetric_key.extend_from_slice(&wrapped);

    Ok(HybridCiphertext {
        encrypted_symmetric_key,
        encrypted_data,
    })
}

/// Reverses `encrypt`. Fails whole or not at all: a bad wrap, a bad
/// tag or truncated input all surface as `CryptoError`.
pub fn decrypt(
    recipient_secret: &[u8; 32],
    encrypted_symmetric_key: &[u8],
    encrypted_data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if encrypted_symmetric_key.len() < EPHEMERAL_LEN + NONCE_LEN {
        return Err(CryptoError::KeyUnwrap);
    }
    let (ephemeral_bytes, rest) = encrypted_symmetric_key.split_at(EPHEMERAL_LEN);
    let (wrap_nonce, wrapped) = rest.split_at(NONCE_LEN);
    let mut ephemeral_public = [0u8; 32];
    ephemeral_public.copy_from_slice(ephemeral_bytes);

    let secret = StaticSecret::from(*recipient_secret);
    let shared = secret
        .diffie_hellman(&PublicKey::from(ephemeral_public))
        .to_bytes();
    let wrap_key = derive_wrap_key(shared)?;
    let wrap_cipher =
        XChaCha20Poly1305::new_from_slice(wrap_key.as_ref()).map_err(|_| CryptoError::InvalidKey)?;
    let symmetric = Zeroizing::new(
        wrap_cipher
            .decrypt(XNonce::from_slice(wrap_nonce), wrapped)
            .map_err(|_| CryptoError::KeyUnwrap)?,
    );
    if symmetric.len() != 32 {
        return Err(CryptoError::KeyUnwrap);
    }

    if encrypted_data.len() < NONCE_LEN {
        return Err(CryptoError::Aead);
    }
    let (data_nonce, ciphertext) = encrypted_data.split_at(NONCE_LEN);
    let cipher = XChaCha20Poly1305::new_from_slice(symmetric.as_slice())
        .map_err(|_| CryptoError::InvalidKey)?;
    cipher
        .decrypt(XNonce::from_slice(data_nonce), ciphertext)
        .map_err(|_| CryptoError::Aead)
}

pub fn sign(keys: &SigningKeypair, bytes: &[u8]) -> Vec<u8> {
    keys.signing_key().sign(bytes).to_bytes().to_vec()
}

/// Boolean check, never an error: an unverifiable envelope is
/// untrusted data, not a crash.
pub fn verify(public: &[u8; 32], bytes: &[u8], signature: &[u8]) -> bool {
    let Ok(verifying) = VerifyingKey::from_bytes(public) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(signature) else {
        return false;
    };
    verifying.verify(bytes, &sig).is_ok()
}
