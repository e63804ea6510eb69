//! Pluggable payload transforms.
//!
//! The transport never interprets compressed or encrypted bytes; it only
//! applies `(bytes) -> bytes` transforms, sets the corresponding header
//! flag before the checksum is computed, and reverses the transforms in
//! the opposite order on receive (decrypt, then decompress).

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit};

use crate::error::ProtocolError;

/// Payload compression seam.
pub trait Compressor: Send {
    /// Compress a payload.
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, ProtocolError>;
    /// Reverse [`Compressor::compress`].
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, ProtocolError>;
}

/// Payload encryption seam.
pub trait Encryptor: Send {
    /// Encrypt a payload.
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, ProtocolError>;
    /// Reverse [`Encryptor::encrypt`].
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, ProtocolError>;
}

/// Identity compressor used when no codec is installed.
pub struct NoCompression;

impl Compressor for NoCompression {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        Ok(data.to_vec())
    }
}

/// Identity encryptor used when no cipher is installed.
pub struct NoEncryption;

impl Encryptor for NoEncryption {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        Ok(data.to_vec())
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        Ok(data.to_vec())
    }
}

const NONCE_LEN: usize = 12;

/// AES-256-GCM sealer with a random nonce prefixed to each ciphertext.
pub struct AesGcmSealer {
    cipher: Aes256Gcm,
}

impl AesGcmSealer {
    /// Create a sealer from a 256-bit symmetric key.
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new_from_slice(key).expect("32-byte key"),
        }
    }
}

impl Encryptor for AesGcmSealer {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let ciphertext = self
            .cipher
            .encrypt(&nonce_bytes.into(), Payload { msg: data, aad: &[] })
            .map_err(|_| ProtocolError::TransformFailure)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        if data.len() < NONCE_LEN {
            return Err(ProtocolError::TransformFailure);
        }
        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(&data[..NONCE_LEN]);
        self.cipher
            .decrypt(
                &nonce_bytes.into(),
                Payload {
                    msg: &data[NONCE_LEN..],
                    aad: &[],
                },
            )
            .map_err(|_| ProtocolError::TransformFailure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_transforms_roundtrip() {
        let data = b"payload bytes".to_vec();
        assert_eq!(NoCompression.compress(&data).unwrap(), data);
        assert_eq!(NoCompression.decompress(&data).unwrap(), data);
        assert_eq!(NoEncryption.encrypt(&data).unwrap(), data);
        assert_eq!(NoEncryption.decrypt(&data).unwrap(), data);
    }

    #[test]
    fn aes_gcm_roundtrip() {
        let sealer = AesGcmSealer::new(&[0x42; 32]);
        let sealed = sealer.encrypt(b"secret").unwrap();
        assert_ne!(sealed, b"secret");
        assert_eq!(sealer.decrypt(&sealed).unwrap(), b"secret");
    }

    #[test]
    fn aes_gcm_rejects_tampering() {
        let sealer = AesGcmSealer::new(&[0x42; 32]);
        let mut sealed = sealer.encrypt(b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert_eq!(
            sealer.decrypt(&sealed),
            Err(ProtocolError::TransformFailure)
        );
    }

    #[test]
    fn aes_gcm_rejects_truncated_input() {
        let sealer = AesGcmSealer::new(&[0x42; 32]);
        assert_eq!(
            sealer.decrypt(&[0u8; NONCE_LEN - 1]),
            Err(ProtocolError::TransformFailure)
        );
    }
}
