// Hashing and signing primitives
// SHA-256 block hashes, Ed25519 multi-sig material, key file parsing

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;

pub const PRIVATE_KEY_LEN: usize = 32;
pub const PUBLIC_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("failed to read key file {path}: {source}")]
    KeyFileRead {
        path: String,
        source: std::io::Error,
    },
    #[error("key file {0} is neither 32 raw bytes nor 64 hex characters")]
    KeyFileFormat(String),
    #[error("failed to write key file {path}: {source}")]
    KeyFileWrite {
        path: String,
        source: std::io::Error,
    },
}

/// SHA-256 digest as a lowercase hex string.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Ed25519 key pair used for signing transactions and blocks.
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let mut csprng = rand::thread_rng();
        KeyPair {
            signing_key: SigningKey::generate(&mut csprng),
        }
    }

    pub fn from_seed(seed: [u8; PRIVATE_KEY_LEN]) -> Self {
        KeyPair {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }

    pub fn public_key(&self) -> Vec<u8> {
        self.signing_key.verifying_key().to_bytes().to_vec()
    }

    pub fn seed(&self) -> [u8; PRIVATE_KEY_LEN] {
        self.signing_key.to_bytes()
    }
}

/// Verify a detached Ed25519 signature.
///
/// Malformed keys or signatures (wrong length, invalid curve points)
/// verify as false rather than erroring.
pub fn ed25519_verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(key_bytes) = <[u8; PUBLIC_KEY_LEN]>::try_from(public_key) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; SIGNATURE_LEN]>::try_from(signature) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let sig = Signature::from_bytes(&sig_bytes);
    verifying_key.verify(message, &sig).is_ok()
}

/// Load a private key seed from disk.
///
/// The file holds either 32 raw bytes or 64 ASCII hex characters with an
/// optional `0x` prefix and surrounding whitespace.
pub fn load_private_key(path: &Path) -> Result<[u8; PRIVATE_KEY_LEN], CryptoError> {
    let contents = std::fs::read(path).map_err(|source| CryptoError::KeyFileRead {
        path: path.display().to_string(),
        source,
    })?;

    if contents.len() == PRIVATE_KEY_LEN {
        let mut seed = [0u8; PRIVATE_KEY_LEN];
        seed.copy_from_slice(&contents);
        return Ok(seed);
    }

    let text = String::from_utf8(contents)
        .map_err(|_| CryptoError::KeyFileFormat(path.display().to_string()))?;
    let text = text.trim();
    let text = text.strip_prefix("0x").unwrap_or(text);
    if text.len() != 2 * PRIVATE_KEY_LEN {
        return Err(CryptoError::KeyFileFormat(path.display().to_string()));
    }
    let decoded =
        hex::decode(text).map_err(|_| CryptoError::KeyFileFormat(path.display().to_string()))?;
    let mut seed = [0u8; PRIVATE_KEY_LEN];
    seed.copy_from_slice(&decoded);
    Ok(seed)
}

/// Write a private key seed as 32 raw bytes.
pub fn save_private_key(path: &Path, seed: &[u8; PRIVATE_KEY_LEN]) -> Result<(), CryptoError> {
    std::fs::write(path, seed).map_err(|source| CryptoError::KeyFileWrite {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sign_verify_round_trip() {
        let keypair = KeyPair::generate();
        let message = b"slot 42";
        let signature = keypair.sign(message);
        assert!(ed25519_verify(&keypair.public_key(), message, &signature));
        assert!(!ed25519_verify(&keypair.public_key(), b"slot 43", &signature));
    }

    #[test]
    fn test_verify_rejects_malformed_material() {
        let keypair = KeyPair::generate();
        let signature = keypair.sign(b"msg");
        assert!(!ed25519_verify(&[0u8; 5], b"msg", &signature));
        assert!(!ed25519_verify(&keypair.public_key(), b"msg", &[0u8; 10]));
    }

    #[test]
    fn test_seed_round_trip_is_deterministic() {
        let keypair = KeyPair::generate();
        let restored = KeyPair::from_seed(keypair.seed());
        assert_eq!(keypair.public_key(), restored.public_key());
        assert_eq!(keypair.sign(b"x"), restored.sign(b"x"));
    }

    #[test]
    fn test_key_file_raw_and_hex() {
        let dir = tempfile::tempdir().unwrap();
        let keypair = KeyPair::generate();
        let seed = keypair.seed();

        let raw_path = dir.path().join("key.raw");
        save_private_key(&raw_path, &seed).unwrap();
        assert_eq!(load_private_key(&raw_path).unwrap(), seed);

        let hex_path = dir.path().join("key.hex");
        std::fs::write(&hex_path, format!("0x{}\n", hex::encode(seed))).unwrap();
        assert_eq!(load_private_key(&hex_path).unwrap(), seed);

        let bad_path = dir.path().join("key.bad");
        std::fs::write(&bad_path, "not a key").unwrap();
        assert!(load_private_key(&bad_path).is_err());
    }
}
