//! Collaboration keys: signing and sealing of delta payloads.
//!
//! A sealed payload is `encrypt(msgpack([data, signature]))`. Opening it
//! decrypts, checks the signature and hands back `data`. Without keys, or in
//! replicate-only mode, payloads pass through untouched.

use crate::config::KeysConfig;
use crate::error::CryptoError;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use meshsync_proto::DeltaRecord;
use meshsync_proto::codec::{from_slice, to_vec};
use ring::aead::{Aad, CHACHA20_POLY1305, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};
use ring::signature::{ED25519, Ed25519KeyPair, KeyPair, UnparsedPublicKey};

/// Key provider consumed by the push and pull protocols.
#[async_trait]
pub trait Keys: Send + Sync + 'static {
    async fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// `Ok(false)` for a well-formed but wrong signature.
    async fn verify(&self, data: &[u8], signature: &[u8]) -> Result<bool, CryptoError>;

    async fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError>;

    async fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Ed25519 signatures and ChaCha20-Poly1305 sealing.
///
/// Ciphertext layout: 12-byte random nonce, then ciphertext with tag.
pub struct RingKeys {
    signing: Ed25519KeyPair,
    cipher: LessSafeKey,
    rng: SystemRandom,
}

impl RingKeys {
    /// Build from a PKCS#8 Ed25519 document and a 32-byte cipher key.
    pub fn from_parts(pkcs8: &[u8], cipher_key: &[u8]) -> Result<Self, CryptoError> {
        let signing = Ed25519KeyPair::from_pkcs8(pkcs8)
            .map_err(|e| CryptoError::InvalidKey(format!("signing key: {e}")))?;
        let unbound = UnboundKey::new(&CHACHA20_POLY1305, cipher_key)
            .map_err(|_| CryptoError::InvalidKey("cipher key must be 32 bytes".to_string()))?;
        Ok(Self {
            signing,
            cipher: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Build from base64 configuration.
    pub fn from_config(config: &KeysConfig) -> Result<Self, CryptoError> {
        let pkcs8 = STANDARD
            .decode(&config.signing_key)
            .map_err(|e| CryptoError::InvalidKey(format!("signing_key base64: {e}")))?;
        let cipher_key = STANDARD
            .decode(&config.cipher_key)
            .map_err(|e| CryptoError::InvalidKey(format!("cipher_key base64: {e}")))?;
        Self::from_parts(&pkcs8, &cipher_key)
    }

    /// Generate fresh key material, base64 encoded for a config file.
    pub fn generate_config() -> Result<KeysConfig, CryptoError> {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng)
            .map_err(|_| CryptoError::InvalidKey("key generation failed".to_string()))?;
        let mut cipher_key = [0u8; 32];
        rng.fill(&mut cipher_key)
            .map_err(|_| CryptoError::InvalidKey("random source failed".to_string()))?;
        Ok(KeysConfig {
            signing_key: STANDARD.encode(pkcs8.as_ref()),
            cipher_key: STANDARD.encode(cipher_key),
        })
    }

    pub fn public_key(&self) -> &[u8] {
        self.signing.public_key().as_ref()
    }
}

impl std::fmt::Debug for RingKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingKeys")
            .field("public_key", &STANDARD.encode(self.public_key()))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Keys for RingKeys {
    async fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(self.signing.sign(data).as_ref().to_vec())
    }

    async fn verify(&self, data: &[u8], signature: &[u8]) -> Result<bool, CryptoError> {
        let public = UnparsedPublicKey::new(&ED25519, self.public_key());
        Ok(public.verify(data, signature).is_ok())
    }

    async fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        self.rng.fill(&mut nonce).map_err(|_| CryptoError::Encrypt)?;

        let mut in_out = data.to_vec();
        self.cipher
            .seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::Encrypt)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&in_out);
        Ok(sealed)
    }

    async fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() < NONCE_LEN {
            return Err(CryptoError::Decrypt);
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce).map_err(|_| CryptoError::Decrypt)?;

        let mut in_out = ciphertext.to_vec();
        let plain = self
            .cipher
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::Decrypt)?;
        Ok(plain.to_vec())
    }
}

/// Sign and encrypt the state carried by a record.
pub async fn seal_record(
    keys: Option<&dyn Keys>,
    replicate_only: bool,
    record: DeltaRecord,
) -> Result<DeltaRecord, CryptoError> {
    let Some(keys) = keys.filter(|_| !replicate_only) else {
        return Ok(record);
    };
    let data = record.payload.state.clone();
    let signature = Bytes::from(keys.sign(&data).await?);
    let packed = to_vec(&(data, signature))?;
    let sealed = keys.encrypt(&packed).await?;
    Ok(record.with_state(Bytes::from(sealed)))
}

/// Decrypt and verify the state carried by a record.
pub async fn open_record(
    keys: Option<&dyn Keys>,
    replicate_only: bool,
    record: DeltaRecord,
) -> Result<DeltaRecord, CryptoError> {
    let Some(keys) = keys.filter(|_| !replicate_only) else {
        return Ok(record);
    };
    let plain = keys.decrypt(&record.payload.state).await?;
    let (data, signature): (Bytes, Bytes) = from_slice(&plain)?;
    if !keys.verify(&data, &signature).await? {
        return Err(CryptoError::InvalidSignature);
    }
    Ok(record.with_state(data))
}
