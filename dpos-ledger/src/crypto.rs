//! Cryptographic operations for the ledger
//!
//! This module provides:
//! - Ed25519 key pair generation, signing, and verification
//! - SHA-256 hashing for transactions and blocks
//! - Address derivation from public keys

use crate::{Error, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

/// Suffix appended to every base58 address
pub const ADDRESS_SUFFIX: char = 'L';

/// Length of a hex-encoded public key
pub const PUBLIC_KEY_HEX_LEN: usize = 64;

/// Length of a hex-encoded signature
pub const SIGNATURE_HEX_LEN: usize = 128;

/// Ed25519 key pair for forging
#[derive(Debug, Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        Self::from_seed(&rand::random::<[u8; 32]>())
    }

    /// Create from seed (32 bytes) - deterministic generation
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Derive a key pair from a passphrase: the seed is SHA-256 of its bytes
    pub fn from_passphrase(secret: &str) -> Self {
        Self::from_seed(&hash_bytes(secret.as_bytes()))
    }

    /// Get public key bytes
    pub fn public_key(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// Public key as lowercase hex
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key())
    }

    /// Address owned by this key pair
    pub fn address(&self) -> String {
        address_from_key_bytes(&self.public_key())
    }

    /// Sign a message (already hashed by the caller)
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

/// Verify a detached signature with a public key
///
/// Returns false for a signature that does not verify or a key that is not a
/// valid curve point.
pub fn verify_signature(message: &[u8], signature: &[u8; 64], public_key: &[u8; 32]) -> bool {
    let signature = Signature::from_bytes(signature);

    let verifying_key = match VerifyingKey::from_bytes(public_key) {
        Ok(key) => key,
        Err(_) => return false,
    };

    verifying_key.verify(message, &signature).is_ok()
}

/// Hash arbitrary bytes using SHA-256
pub fn hash_bytes(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Decode a fixed-width hex field
pub fn decode_hex_array<const N: usize>(field: &str, value: &str) -> Result<[u8; N]> {
    let bytes = hex::decode(value)
        .map_err(|e| Error::Encoding(format!("{} is not valid hex: {}", field, e)))?;
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        Error::Encoding(format!(
            "{} must be {} bytes, got {}",
            field,
            N,
            bytes.len()
        ))
    })
}

/// Check that a public key is a 64-character hex string
pub fn check_public_key(public_key: &str) -> Result<()> {
    if public_key.len() != PUBLIC_KEY_HEX_LEN {
        return Err(Error::InvalidPublicKey(format!(
            "must be {} characters long",
            PUBLIC_KEY_HEX_LEN
        )));
    }
    if !public_key.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::InvalidPublicKey("must be a hex string".to_string()));
    }
    Ok(())
}

/// Derive an address: base58(RIPEMD160(SHA256(public key))) followed by `L`
pub fn address_from_key_bytes(public_key: &[u8]) -> String {
    let sha = Sha256::digest(public_key);
    let ripe = Ripemd160::digest(sha);
    let mut address = bs58::encode(ripe).into_string();
    address.push(ADDRESS_SUFFIX);
    address
}

/// Derive an address from a hex-encoded public key
pub fn address_from_public_key(public_key: &str) -> Result<String> {
    let bytes = hex::decode(public_key)
        .map_err(|e| Error::Encoding(format!("publicKey is not valid hex: {}", e)))?;
    Ok(address_from_key_bytes(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_from_seed() {
        let seed = [42u8; 32];
        let keypair1 = KeyPair::from_seed(&seed);
        let keypair2 = KeyPair::from_seed(&seed);

        assert_eq!(keypair1.public_key(), keypair2.public_key());
        assert_eq!(keypair1.address(), keypair2.address());
    }

    #[test]
    fn test_sign_and_verify() {
        let keypair = KeyPair::generate();
        let message = hash_bytes(b"block header");

        let signature = keypair.sign(&message);
        assert!(verify_signature(&message, &signature, &keypair.public_key()));

        let other = KeyPair::generate();
        assert!(!verify_signature(&message, &signature, &other.public_key()));
    }

    #[test]
    fn test_known_signature_vector() {
        // RFC 8032 test vector 1
        let seed = [
            0x9d, 0x61, 0xb1, 0x9d, 0xef, 0xfd, 0x5a, 0x60,
            0xba, 0x84, 0x4a, 0xf4, 0x92, 0xec, 0x2c, 0xc4,
            0x44, 0x49, 0xc5, 0x69, 0x7b, 0x32, 0x69, 0x19,
            0x70, 0x3b, 0xac, 0x03, 0x1c, 0xae, 0x7f, 0x60,
        ];

        let keypair = KeyPair::from_seed(&seed);
        assert_eq!(
            keypair.public_key_hex(),
            "d75a980182b10ab7d54bfed3c964073a0ee172f3daa62325af021a68f707511a"
        );
        let signature = keypair.sign(b"");
        assert!(verify_signature(b"", &signature, &keypair.public_key()));
    }

    #[test]
    fn test_address_shape() {
        let keypair = KeyPair::from_seed(&[7u8; 32]);
        let address = keypair.address();

        assert!(address.ends_with(ADDRESS_SUFFIX));
        assert_eq!(
            address_from_public_key(&keypair.public_key_hex()).unwrap(),
            address
        );
        // 20-byte digest plus suffix
        assert!(address.len() > 20 && address.len() <= 29);
    }

    #[test]
    fn test_check_public_key() {
        assert!(check_public_key(&"ab".repeat(32)).is_ok());
        assert!(matches!(
            check_public_key("abcd"),
            Err(Error::InvalidPublicKey(_))
        ));
        assert!(matches!(
            check_public_key(&"zz".repeat(32)),
            Err(Error::InvalidPublicKey(_))
        ));
    }

    #[test]
    fn test_decode_hex_array_length() {
        let ok: [u8; 4] = decode_hex_array("field", "01020304").unwrap();
        assert_eq!(ok, [1, 2, 3, 4]);
        assert!(matches!(
            decode_hex_array::<4>("field", "0102"),
            Err(Error::Encoding(_))
        ));
        assert!(matches!(
            decode_hex_array::<1>("field", "g0"),
            Err(Error::Encoding(_))
        ));
    }
}
