//! PSPF/2025 metadata document: structures, canonical JSON, gzip framing

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};

use crate::exceptions::{FlavorError, Result};

/// Literal value of the `format` key
pub const METADATA_FORMAT: &str = "PSPF/2025";

/// Main metadata structure for a PSPF package
///
/// Field order is the canonical serialization order; string maps are
/// `BTreeMap` so two builds with identical inputs serialize identically.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Metadata {
    pub format: String,
    pub package: PackageInfo,
    pub build: BuildInfo,
    pub execution: ExecutionInfo,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub slots: Vec<SlotMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_validation: Option<CacheValidationInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub setup_commands: Vec<SetupCommand>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeInfo>,
}

/// Package identity
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PackageInfo {
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Build provenance (timestamps are RFC 3339 UTC; deterministic builds zero them)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BuildInfo {
    pub builder: String,
    pub timestamp: String,
    pub host: String,
}

/// Execution configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionInfo {
    pub command: String,
    pub primary_slot: usize,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
}

/// Per-slot metadata, parallel to the descriptor table by index
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SlotMetadata {
    #[serde(rename = "slot")]
    pub index: usize,
    pub id: String,
    pub operations: String,
    pub purpose: String,
    pub lifecycle: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// Integrity requirements
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VerificationInfo {
    pub integrity_seal: IntegritySealInfo,
}

/// Integrity seal configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IntegritySealInfo {
    pub required: bool,
    pub algorithm: String,
}

/// Cache validation marker declaration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheValidationInfo {
    pub check_file: String,
    pub expected_content: String,
}

/// Post-extraction setup actions, dispatched by `type`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SetupCommand {
    /// Atomically write a file (placeholders substituted in both fields)
    WriteFile { path: String, content: String },
    /// Run one command; non-zero exit is fatal
    Execute {
        command: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },
    /// Glob under the workenv and run the command per match; failures are
    /// logged and processing continues
    EnumerateAndExecute { pattern: String, command: String },
}

/// Runtime configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuntimeInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<RuntimeEnv>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub isolated: Option<bool>,
}

/// Runtime environment spec: unset -> map -> set, gated by pass
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeEnv {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unset: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub map: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set: Option<BTreeMap<String, String>>,
}

impl Metadata {
    /// Resolve a slot's workenv subpath name by index
    pub fn slot_id(&self, index: usize) -> String {
        self.slots
            .get(index)
            .map(|s| s.id.clone())
            .unwrap_or_else(|| format!("slot_{index}"))
    }
}

/// Serialize to the canonical UTF-8 JSON form
///
/// Stable key order (struct order plus sorted maps), two-space indent, no
/// trailing newline.
pub fn to_canonical_json(metadata: &Metadata) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(metadata)?)
}

/// Gzip the canonical JSON with a deterministic filter
///
/// No embedded filename and a zero mtime, so identical documents give
/// byte-identical metadata regions.
pub fn compress_metadata(json_bytes: &[u8]) -> Result<Vec<u8>> {
    use flate2::Compression;
    use flate2::write::GzEncoder;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(json_bytes)?;
    Ok(encoder.finish()?)
}

/// Decode a compressed metadata region back into the document
pub fn decode_metadata(compressed: &[u8]) -> Result<Metadata> {
    use flate2::read::GzDecoder;

    let mut decoder = GzDecoder::new(compressed);
    let mut json_data = String::new();
    decoder
        .read_to_string(&mut json_data)
        .map_err(|e| FlavorError::FormatViolation(format!("Metadata region is not gzip: {e}")))?;

    let metadata: Metadata = serde_json::from_str(&json_data)?;
    if metadata.format != METADATA_FORMAT {
        return Err(FlavorError::UnsupportedFormat(format!(
            "Unexpected metadata format marker: {}",
            metadata.format
        )));
    }
    Ok(metadata)
}
