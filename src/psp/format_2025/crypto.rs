//! Cryptographic seal primitives for PSPF/2025
//!
//! The integrity seal is an Ed25519 signature over the compressed metadata
//! region bytes. Signing happens once per build; verification once per
//! reader-open at the configured tier.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

/// Generate an ephemeral Ed25519 key pair
pub fn generate_ephemeral_keypair() -> (SigningKey, VerifyingKey) {
    use rand::RngCore;
    use rand::rngs::OsRng;

    let mut secret_key = [0u8; 32];
    OsRng.fill_bytes(&mut secret_key);
    let signing_key = SigningKey::from_bytes(&secret_key);
    let verifying_key = signing_key.verifying_key();
    (signing_key, verifying_key)
}

/// Derive a deterministic key pair from a seed string
///
/// The 32 signing-key bytes are the SHA-256 of the UTF-8 seed, so the pair is
/// reproducible from the seed alone.
pub fn keypair_from_seed(seed: &str) -> (SigningKey, VerifyingKey) {
    let seed_hash: [u8; 32] = Sha256::digest(seed.as_bytes()).into();
    let signing_key = SigningKey::from_bytes(&seed_hash);
    let verifying_key = signing_key.verifying_key();
    (signing_key, verifying_key)
}

/// Sign the compressed metadata region
pub fn sign_metadata(signing_key: &SigningKey, metadata_bytes: &[u8]) -> [u8; 64] {
    let signature: Signature = signing_key.sign(metadata_bytes);
    signature.to_bytes()
}

/// Verify an integrity seal against the compressed metadata region
pub fn verify_metadata(
    verifying_key: &VerifyingKey,
    metadata_bytes: &[u8],
    signature: &[u8; 64],
) -> bool {
    let sig = Signature::from_bytes(signature);
    verifying_key.verify(metadata_bytes, &sig).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_round_trip() {
        let (signing, verifying) = generate_ephemeral_keypair();
        let data = b"compressed metadata bytes";
        let sig = sign_metadata(&signing, data);
        assert!(verify_metadata(&verifying, data, &sig));
        assert!(!verify_metadata(&verifying, b"tampered", &sig));
    }

    #[test]
    fn test_seeded_keys_are_deterministic() {
        let (a_sign, a_verify) = keypair_from_seed("test-seed-123");
        let (b_sign, b_verify) = keypair_from_seed("test-seed-123");
        assert_eq!(a_sign.to_bytes(), b_sign.to_bytes());
        assert_eq!(a_verify.as_bytes(), b_verify.as_bytes());

        let (c_sign, _) = keypair_from_seed("another-seed");
        assert_ne!(a_sign.to_bytes(), c_sign.to_bytes());
    }

    #[test]
    fn test_wrong_key_rejects() {
        let (signing, _) = keypair_from_seed("signer");
        let (_, other_verifying) = keypair_from_seed("someone-else");
        let sig = sign_metadata(&signing, b"data");
        assert!(!verify_metadata(&other_verifying, b"data", &sig));
    }
}
