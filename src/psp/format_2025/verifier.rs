//! PSPF/2025 tiered integrity verification
//!
//! The validation dispatcher routes each check through the policy for the
//! selected tier: strict fails hard, standard logs and degrades, relaxed
//! skips signatures, minimal skips checksums too, none skips everything.

use ed25519_dalek::VerifyingKey;
use log::{debug, error, warn};

use super::crypto::verify_metadata;
use super::defaults::ValidationLevel;
use super::reader::Reader;
use crate::exceptions::Result;

/// Outcome of a tiered integrity check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IntegrityReport {
    /// No check that the tier treats as fatal failed
    pub valid: bool,
    /// Ed25519 verification outcome; `true` when the tier skips it
    pub signature_valid: bool,
    /// A check raised a condition the tier treats as fatal
    pub tamper_detected: bool,
}

/// Verify a package at an explicit validation level
///
/// Always returns the report; callers that need hard-fail semantics (the
/// launcher under strict) act on `valid`/`tamper_detected`.
pub fn verify_integrity_with_level(
    reader: &mut Reader,
    level: ValidationLevel,
) -> Result<IntegrityReport> {
    if matches!(level, ValidationLevel::None) {
        warn!("VALIDATION DISABLED: skipping all integrity verification");
        eprintln!("WARNING: package integrity verification skipped (validation level: none)");
        return Ok(IntegrityReport {
            valid: true,
            signature_valid: true,
            tamper_detected: false,
        });
    }

    let mut valid = true;
    let mut signature_valid = true;
    let mut tamper_detected = false;

    if level.checks_signature() {
        match check_signature(reader) {
            Ok(true) => {
                debug!("Integrity seal verified");
            }
            Ok(false) => {
                signature_valid = false;
                if level.fails_hard() {
                    error!("Integrity seal verification failed");
                    valid = false;
                    tamper_detected = true;
                } else {
                    warn!("Integrity seal verification failed, continuing at {:?}", level);
                }
            }
            Err(e) => {
                signature_valid = false;
                if level.fails_hard() {
                    error!("Integrity check raised: {e}");
                    valid = false;
                    tamper_detected = true;
                } else {
                    warn!("Integrity check raised ({e}), continuing at {:?}", level);
                }
            }
        }
    }

    if level.checks_slot_checksums() {
        match reader.verify_all_checksums() {
            Ok(true) => {
                debug!("All slot checksums verified");
            }
            Ok(false) => {
                if level.fails_hard() {
                    error!("Slot checksum mismatch");
                    valid = false;
                    tamper_detected = true;
                } else {
                    warn!("Slot checksum mismatch, continuing at {:?}", level);
                }
            }
            Err(e) => {
                if level.fails_hard() {
                    error!("Checksum sweep raised: {e}");
                    valid = false;
                    tamper_detected = true;
                } else {
                    warn!("Checksum sweep raised ({e}), continuing at {:?}", level);
                }
            }
        }
    }

    Ok(IntegrityReport {
        valid,
        signature_valid,
        tamper_detected,
    })
}

/// Ed25519 check of the compressed metadata bytes against the trailer seal
fn check_signature(reader: &mut Reader) -> Result<bool> {
    let trailer = reader.read_trailer()?.clone();

    if trailer.integrity_signature.iter().all(|&b| b == 0) {
        debug!("No signature present in package");
        return Ok(false);
    }
    if trailer.public_key.iter().all(|&b| b == 0) {
        debug!("No public key present in package");
        return Ok(false);
    }

    let verifying_key = match VerifyingKey::from_bytes(&trailer.public_key) {
        Ok(key) => key,
        Err(e) => {
            debug!("Trailer public key is not a valid Ed25519 point: {e}");
            return Ok(false);
        }
    };

    let metadata_bytes = reader.read_metadata_bytes()?;
    Ok(verify_metadata(
        &verifying_key,
        &metadata_bytes,
        &trailer.signature_bytes(),
    ))
}
