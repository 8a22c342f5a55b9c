//! Build manifest: the JSON contract between manifest front-ends and the builder

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::builder::{PackageBuilder, SlotSpec};
use super::keys::KeyConfig;
use super::metadata::{CacheValidationInfo, RuntimeInfo, SetupCommand};
use super::operations::{string_to_operations, unpack_operations};
use crate::exceptions::{FlavorError, Result};

/// Top-level build manifest document
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BuildManifest {
    pub package: ManifestPackage,
    pub execution: ManifestExecution,
    #[serde(default)]
    pub slots: Vec<ManifestSlot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_validation: Option<CacheValidationInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub setup_commands: Vec<SetupCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeInfo>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ManifestPackage {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ManifestExecution {
    pub command: String,
    #[serde(default)]
    pub primary_slot: usize,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ManifestSlot {
    pub id: String,
    /// Source path, relative to the manifest's directory unless absolute
    pub source: String,
    /// Operation chain, e.g. "gzip" or "tar|gzip"
    #[serde(default)]
    pub operations: String,
    #[serde(default = "default_purpose")]
    pub purpose: String,
    #[serde(default = "default_lifecycle")]
    pub lifecycle: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<String>,
}

fn default_purpose() -> String {
    "payload".to_string()
}

fn default_lifecycle() -> String {
    "runtime".to_string()
}

/// Parse a JSON manifest file
pub fn read_manifest(path: &Path) -> Result<BuildManifest> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| FlavorError::BuildError(format!("Failed to read manifest: {e}")))?;
    serde_json::from_str(&data)
        .map_err(|e| FlavorError::BuildError(format!("Failed to parse manifest: {e}")))
}

/// Turn a manifest into a configured builder
///
/// Relative slot sources resolve against `base_dir` (normally the manifest's
/// directory). The launcher and keys are supplied by the caller.
pub fn builder_from_manifest(
    manifest: &BuildManifest,
    base_dir: &Path,
    key_config: KeyConfig,
) -> Result<PackageBuilder> {
    let mut builder = PackageBuilder::new(&manifest.package.name, &manifest.package.version)
        .command(&manifest.execution.command)
        .primary_slot(manifest.execution.primary_slot)
        .keys(key_config);

    if let Some(ref description) = manifest.package.description {
        builder = builder.description(description);
    }
    for (key, value) in &manifest.execution.environment {
        builder = builder.env(key, value);
    }

    for slot in &manifest.slots {
        let operations = unpack_operations(string_to_operations(&slot.operations)?);

        let source_path = {
            let p = PathBuf::from(&slot.source);
            if p.is_absolute() { p } else { base_dir.join(p) }
        };

        let mut spec = if source_path.is_dir() {
            SlotSpec::from_directory(&slot.id, source_path, operations)
        } else {
            SlotSpec::from_file(&slot.id, source_path, operations)
        };
        spec = spec.purpose(&slot.purpose).lifecycle(&slot.lifecycle);
        if let Some(ref target) = slot.target {
            spec = spec.target(target);
        }
        if let Some(ref permissions) = slot.permissions {
            spec = spec.permissions(permissions);
        }
        builder = builder.add_slot(spec);
    }

    if let Some(ref validation) = manifest.cache_validation {
        builder = builder.cache_validation(&validation.check_file, &validation.expected_content);
    }
    for command in &manifest.setup_commands {
        builder = builder.setup_command(command.clone());
    }
    if let Some(ref runtime) = manifest.runtime {
        builder = builder.runtime(runtime.clone());
    }

    Ok(builder)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "package": {"name": "demo", "version": "1.0.0"},
        "execution": {"command": "{workenv}/payload", "primary_slot": 0},
        "slots": [
            {"id": "payload", "source": "payload.bin", "operations": "gzip"}
        ],
        "setup_commands": [
            {"type": "write_file", "path": "{workenv}/.initialized", "content": "{version}"}
        ]
    }"#;

    #[test]
    fn test_parse_manifest() {
        let manifest: BuildManifest = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(manifest.package.name, "demo");
        assert_eq!(manifest.slots.len(), 1);
        assert_eq!(manifest.slots[0].operations, "gzip");
        assert_eq!(manifest.slots[0].lifecycle, "runtime");
        assert_eq!(manifest.setup_commands.len(), 1);
    }

    #[test]
    fn test_manifest_builds_package() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("payload.bin"), b"manifest payload").unwrap();

        let manifest: BuildManifest = serde_json::from_str(SAMPLE).unwrap();
        let key_config = KeyConfig {
            seed: Some("manifest-test".to_string()),
            ..KeyConfig::default()
        };
        let builder = builder_from_manifest(&manifest, dir.path(), key_config)
            .unwrap()
            .launcher_bytes(b"#!/bin/sh\nexit 0\n".to_vec());

        let out = dir.path().join("demo.psp");
        let report = builder.build(&out).unwrap();
        assert_eq!(report.slot_count, 1);

        let mut reader = super::super::reader::Reader::open(&out).unwrap();
        assert_eq!(reader.read_slot_data(0).unwrap(), b"manifest payload");
    }

    #[test]
    fn test_bad_operations_string_rejected() {
        let manifest = BuildManifest {
            package: ManifestPackage {
                name: "x".into(),
                version: "1".into(),
                description: None,
            },
            execution: ManifestExecution {
                command: "true".into(),
                primary_slot: 0,
                environment: BTreeMap::new(),
            },
            slots: vec![ManifestSlot {
                id: "bad".into(),
                source: "whatever".into(),
                operations: "lz77".into(),
                purpose: default_purpose(),
                lifecycle: default_lifecycle(),
                target: None,
                permissions: None,
            }],
            cache_validation: None,
            setup_commands: vec![],
            runtime: None,
        };
        assert!(
            builder_from_manifest(&manifest, Path::new("."), KeyConfig::default()).is_err()
        );
    }
}
