//! Key resolution and on-disk key management for PSPF/2025 packages

use ed25519_dalek::{SigningKey, VerifyingKey};
use log::{debug, info, warn};
use pem::Pem;
use std::fs;
use std::path::{Path, PathBuf};

use super::crypto::{generate_ephemeral_keypair, keypair_from_seed};
use crate::exceptions::{FlavorError, Result};

/// Key material selection for a build
///
/// Resolution priority: explicit bytes, then seed, then on-disk PEM files,
/// then a fresh ephemeral pair.
#[derive(Debug, Clone, Default)]
pub struct KeyConfig {
    /// Explicit 32-byte private key
    pub private_key: Option<[u8; 32]>,
    /// Explicit 32-byte public key (paired with `private_key`)
    pub public_key: Option<[u8; 32]>,
    /// Seed string for deterministic key derivation
    pub seed: Option<String>,
    /// Path to a PEM private key file (Ed25519 PKCS#8)
    pub private_key_path: Option<PathBuf>,
    /// Path to a PEM public key file (Ed25519 SubjectPublicKeyInfo)
    pub public_key_path: Option<PathBuf>,
}

/// Resolve the signing key pair for a build
pub fn resolve_keys(config: &KeyConfig) -> Result<(SigningKey, VerifyingKey)> {
    if let Some(private_bytes) = config.private_key {
        debug!("Using explicit key material");
        let signing_key = SigningKey::from_bytes(&private_bytes);
        let verifying_key = signing_key.verifying_key();
        if let Some(expected_public) = config.public_key {
            if verifying_key.as_bytes() != &expected_public {
                return Err(FlavorError::InvalidInput(
                    "Explicit public key does not match the private key".into(),
                ));
            }
        }
        return Ok((signing_key, verifying_key));
    }

    if let Some(ref seed) = config.seed {
        info!("Using seed-based key generation");
        return Ok(keypair_from_seed(seed));
    }

    if let Some(ref private_path) = config.private_key_path {
        let public_path = config.public_key_path.as_ref().ok_or_else(|| {
            FlavorError::BuildError("Public key path required when private key provided".into())
        })?;

        info!("Loading keys from files");
        return load_keys_from_files(private_path, public_path);
    }

    warn!("No keys provided, generating ephemeral keys (not recommended for production)");
    Ok(generate_ephemeral_keypair())
}

// DER framing for Ed25519 key files. PKCS#8 wraps the 32-byte seed; SPKI
// wraps the 32-byte public point.
const PKCS8_ED25519_PREFIX: [u8; 16] = [
    0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x04, 0x22, 0x04,
    0x20,
];
const SPKI_ED25519_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
];

// Algorithm OIDs that get rejected with a regeneration directive
const OID_ED25519: &[u8] = &[0x06, 0x03, 0x2b, 0x65, 0x70];
const OID_RSA: &[u8] = &[0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x01];
const OID_EC: &[u8] = &[0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01];
const OID_DSA: &[u8] = &[0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x38, 0x04, 0x01];

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn reject_foreign_algorithm(contents: &[u8], tag: &str, what: &str) -> Result<()> {
    let algorithm = if tag.starts_with("RSA") || contains(contents, OID_RSA) {
        Some("RSA")
    } else if tag.starts_with("EC") || contains(contents, OID_EC) {
        Some("EC")
    } else if tag.starts_with("DSA") || contains(contents, OID_DSA) {
        Some("DSA")
    } else {
        None
    };

    if let Some(algorithm) = algorithm {
        return Err(FlavorError::InvalidInput(format!(
            "{what} uses {algorithm}, but PSPF/2025 seals are Ed25519 only; \
             regenerate the key pair as Ed25519"
        )));
    }

    if !contains(contents, OID_ED25519) {
        return Err(FlavorError::InvalidInput(format!(
            "{what} is not an Ed25519 key; regenerate the key pair as Ed25519"
        )));
    }

    Ok(())
}

/// Load a signing key pair from PEM files
fn load_keys_from_files(
    private_key_path: &Path,
    public_key_path: &Path,
) -> Result<(SigningKey, VerifyingKey)> {
    let private_pem = fs::read_to_string(private_key_path)
        .map_err(|e| FlavorError::BuildError(format!("Failed to read private key: {e}")))?;
    let private_parsed = pem::parse(&private_pem)
        .map_err(|e| FlavorError::BuildError(format!("Failed to parse private key PEM: {e}")))?;

    let private_bytes: [u8; 32] = match private_parsed.tag() {
        "PRIVATE KEY" => {
            let contents = private_parsed.contents();
            reject_foreign_algorithm(contents, private_parsed.tag(), "Private key")?;
            if contents.len() >= 48 && contents[..16] == PKCS8_ED25519_PREFIX {
                contents[16..48]
                    .try_into()
                    .map_err(|_| FlavorError::InvalidInput("Invalid private key length".into()))?
            } else {
                return Err(FlavorError::InvalidInput(
                    "Private key is not PKCS#8 Ed25519".into(),
                ));
            }
        }
        other => {
            reject_foreign_algorithm(private_parsed.contents(), other, "Private key")?;
            return Err(FlavorError::InvalidInput(format!(
                "Unsupported private key PEM tag: {other}"
            )));
        }
    };

    let signing_key = SigningKey::from_bytes(&private_bytes);

    let public_pem = fs::read_to_string(public_key_path)
        .map_err(|e| FlavorError::BuildError(format!("Failed to read public key: {e}")))?;
    let public_parsed = pem::parse(&public_pem)
        .map_err(|e| FlavorError::BuildError(format!("Failed to parse public key PEM: {e}")))?;

    let public_bytes: [u8; 32] = match public_parsed.tag() {
        "PUBLIC KEY" => {
            let contents = public_parsed.contents();
            reject_foreign_algorithm(contents, public_parsed.tag(), "Public key")?;
            if contents.len() >= 44 && contents[..12] == SPKI_ED25519_PREFIX {
                contents[12..44]
                    .try_into()
                    .map_err(|_| FlavorError::InvalidInput("Invalid public key length".into()))?
            } else {
                return Err(FlavorError::InvalidInput(
                    "Public key is not SubjectPublicKeyInfo Ed25519".into(),
                ));
            }
        }
        other => {
            reject_foreign_algorithm(public_parsed.contents(), other, "Public key")?;
            return Err(FlavorError::InvalidInput(format!(
                "Unsupported public key PEM tag: {other}"
            )));
        }
    };

    let verifying_key = VerifyingKey::from_bytes(&public_bytes)
        .map_err(|e| FlavorError::InvalidInput(format!("Invalid public key: {e}")))?;

    if signing_key.verifying_key() != verifying_key {
        return Err(FlavorError::InvalidInput(
            "Public key file does not match the private key".into(),
        ));
    }

    debug!("Loaded Ed25519 key pair from files");
    Ok((signing_key, verifying_key))
}

/// Write a key pair under `dir` as `{flavor}-private.key` / `{flavor}-public.key`
///
/// The private half gets owner-only mode; the public half is world-readable.
pub fn save_keypair(
    dir: &Path,
    flavor: &str,
    signing_key: &SigningKey,
    verifying_key: &VerifyingKey,
) -> Result<(PathBuf, PathBuf)> {
    fs::create_dir_all(dir)?;

    let mut pkcs8 = Vec::with_capacity(48);
    pkcs8.extend_from_slice(&PKCS8_ED25519_PREFIX);
    pkcs8.extend_from_slice(&signing_key.to_bytes());

    let mut spki = Vec::with_capacity(44);
    spki.extend_from_slice(&SPKI_ED25519_PREFIX);
    spki.extend_from_slice(verifying_key.as_bytes());

    let private_path = dir.join(format!("{flavor}-private.key"));
    let public_path = dir.join(format!("{flavor}-public.key"));

    fs::write(
        &private_path,
        pem::encode(&Pem::new("PRIVATE KEY", pkcs8)),
    )?;
    fs::write(&public_path, pem::encode(&Pem::new("PUBLIC KEY", spki)))?;

    #[cfg(unix)]
    {
        use super::defaults::{DEFAULT_FILE_PERMS, DEFAULT_PUBLIC_KEY_PERMS};
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&private_path, fs::Permissions::from_mode(DEFAULT_FILE_PERMS))?;
        fs::set_permissions(
            &public_path,
            fs::Permissions::from_mode(DEFAULT_PUBLIC_KEY_PERMS),
        )?;
    }

    info!("Wrote key pair to {}", dir.display());
    Ok((private_path, public_path))
}
