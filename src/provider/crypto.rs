//! RSA/AES session crypto for the Interactsh handshake
//!
//! The server wraps a per-poll AES-256 key with the client's RSA public
//! key (OAEP with SHA-256) and prefixes each ciphertext with a 16-byte
//! CFB initialization vector. The keypair lives as long as the session
//! and is generated lazily, exactly once.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use parking_lot::RwLock;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::error::CryptoError;

type Aes256CfbDec = cfb_mode::Decryptor<aes::Aes256>;

const RSA_KEY_BITS: usize = 2048;
const AES_IV_LENGTH: usize = 16;
const AES_KEY_LENGTH: usize = 32;

struct KeyPair {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

/// Holds the session keypair and performs the unwrap-then-decrypt dance
/// for polled interactions.
pub struct CryptoSession {
    keys: RwLock<Option<KeyPair>>,
}

impl CryptoSession {
    /// Create a session with no keypair yet
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(None),
        }
    }

    /// Restore a session from a PKCS#8 PEM private key
    pub fn from_private_key_pem(pem: &str) -> Result<Self, CryptoError> {
        let private_key =
            RsaPrivateKey::from_pkcs8_pem(pem).map_err(|e| CryptoError::Key(e.to_string()))?;
        let public_key = RsaPublicKey::from(&private_key);

        Ok(Self {
            keys: RwLock::new(Some(KeyPair {
                private_key,
                public_key,
            })),
        })
    }

    /// Generate the 2048-bit keypair if it does not exist yet
    pub fn ensure_keys(&self) -> Result<(), CryptoError> {
        if self.keys.read().is_some() {
            return Ok(());
        }

        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        let public_key = RsaPublicKey::from(&private_key);

        let mut keys = self.keys.write();
        if keys.is_none() {
            *keys = Some(KeyPair {
                private_key,
                public_key,
            });
        }

        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.keys.read().is_some()
    }

    /// Public key as base64 over the SPKI PEM, the encoding the
    /// Interactsh register endpoint expects
    pub fn encode_public_key(&self) -> Result<String, CryptoError> {
        Ok(BASE64.encode(self.public_key_pem()?))
    }

    /// Public key as SPKI PEM
    pub fn public_key_pem(&self) -> Result<String, CryptoError> {
        let keys = self.keys.read();
        let pair = keys.as_ref().ok_or(CryptoError::Uninitialized)?;

        pair.public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::Key(e.to_string()))
    }

    /// Private key as PKCS#8 PEM, for session persistence
    pub fn private_key_pem(&self) -> Result<String, CryptoError> {
        let keys = self.keys.read();
        let pair = keys.as_ref().ok_or(CryptoError::Uninitialized)?;

        pair.private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map(|pem| pem.to_string())
            .map_err(|e| CryptoError::Key(e.to_string()))
    }

    /// Decrypt one polled interaction: RSA-unwrap the AES key, split off
    /// the IV, CFB-decrypt the rest, require valid UTF-8.
    pub fn decrypt_message(
        &self,
        aes_key_encrypted: &str,
        data_encrypted: &str,
    ) -> Result<String, CryptoError> {
        let aes_key = self.decrypt_rsa(aes_key_encrypted)?;

        let data = BASE64.decode(data_encrypted)?;
        if data.len() < AES_IV_LENGTH {
            return Err(CryptoError::Malformed(format!(
                "ciphertext is too short ({} bytes)",
                data.len()
            )));
        }

        let iv = &data[..AES_IV_LENGTH];
        let mut buffer = data[AES_IV_LENGTH..].to_vec();
        Aes256CfbDec::new_from_slices(&aes_key, iv)
            .map_err(|_| {
                CryptoError::Malformed(format!(
                    "unwrapped AES key has {} bytes, expected {}",
                    aes_key.len(),
                    AES_KEY_LENGTH
                ))
            })?
            .decrypt(&mut buffer);

        Ok(String::from_utf8(buffer)?)
    }

    /// RSA-unwrap a base64 ciphertext with the session private key
    pub fn decrypt_rsa(&self, data_b64: &str) -> Result<Vec<u8>, CryptoError> {
        let ciphertext = BASE64.decode(data_b64)?;
        let keys = self.keys.read();
        let pair = keys.as_ref().ok_or(CryptoError::Uninitialized)?;

        pair.private_key
            .decrypt(Oaep::new::<Sha256>(), &ciphertext)
            .map_err(|e| CryptoError::Decrypt(e.to_string()))
    }
}

impl Default for CryptoSession {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CryptoSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoSession")
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Server-side encryption, used to build poll fixtures in tests

    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
    use rand::RngCore;
    use rsa::pkcs8::DecodePublicKey;
    use rsa::{Oaep, RsaPublicKey};
    use sha2::Sha256;

    type Aes256CfbEnc = cfb_mode::Encryptor<aes::Aes256>;

    /// Encrypt a batch the way the Interactsh server does: one fresh AES
    /// key wrapped with the client public key, each message carrying its
    /// own IV prefix. Returns (wrapped key, messages), all base64.
    pub fn encrypt_interactions(
        public_key_pem: &str,
        plaintexts: &[&str],
    ) -> (String, Vec<String>) {
        let public_key = RsaPublicKey::from_public_key_pem(public_key_pem).unwrap();

        let mut rng = rand::thread_rng();
        let mut aes_key = [0u8; 32];
        rng.fill_bytes(&mut aes_key);

        let messages = plaintexts
            .iter()
            .map(|plaintext| {
                let mut iv = [0u8; 16];
                rng.fill_bytes(&mut iv);

                let mut body = plaintext.as_bytes().to_vec();
                Aes256CfbEnc::new((&aes_key).into(), (&iv).into()).encrypt(&mut body);

                let mut message = iv.to_vec();
                message.extend_from_slice(&body);
                BASE64.encode(message)
            })
            .collect();

        let wrapped = public_key
            .encrypt(&mut rng, Oaep::new::<Sha256>(), &aes_key)
            .unwrap();

        (BASE64.encode(wrapped), messages)
    }

    /// Single-message convenience over `encrypt_interactions`
    pub fn encrypt_interaction(public_key_pem: &str, plaintext: &str) -> (String, String) {
        let (key, mut messages) = encrypt_interactions(public_key_pem, &[plaintext]);
        (key, messages.remove(0))
    }
}
