//! Metadata document creation for the package builder

use std::collections::BTreeMap;

use super::super::metadata::{
    BuildInfo, CacheValidationInfo, ExecutionInfo, IntegritySealInfo, METADATA_FORMAT, Metadata,
    PackageInfo, RuntimeInfo, SetupCommand, SlotMetadata, VerificationInfo,
};

/// Build timestamp and host identity for the document
///
/// Deterministic builds zero the timestamp and omit the hostname;
/// SOURCE_DATE_EPOCH pins the timestamp for reproducible packaging.
pub(super) fn build_stamp(deterministic: bool) -> (String, String) {
    let os_arch = format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH);

    if deterministic {
        return ("1970-01-01T00:00:00Z".to_string(), os_arch);
    }

    if let Ok(epoch) = std::env::var("SOURCE_DATE_EPOCH") {
        if let Ok(secs) = epoch.parse::<i64>() {
            if let Some(dt) = chrono::DateTime::from_timestamp(secs, 0) {
                return (
                    dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                    os_arch,
                );
            }
        }
    }

    let hostname = gethostname::gethostname().to_string_lossy().to_string();
    (
        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        format!("{os_arch} {hostname}"),
    )
}

#[allow(clippy::too_many_arguments)]
pub(super) fn create_metadata(
    name: &str,
    version: &str,
    description: Option<String>,
    command: &str,
    primary_slot: usize,
    environment: BTreeMap<String, String>,
    slots: Vec<SlotMetadata>,
    cache_validation: Option<CacheValidationInfo>,
    setup_commands: Vec<SetupCommand>,
    runtime: Option<RuntimeInfo>,
    deterministic: bool,
) -> Metadata {
    let (timestamp, host) = build_stamp(deterministic);

    Metadata {
        format: METADATA_FORMAT.to_string(),
        package: PackageInfo {
            name: name.to_string(),
            version: version.to_string(),
            description,
        },
        build: BuildInfo {
            builder: format!("flavorpack {}", crate::version::VERSION),
            timestamp,
            host,
        },
        execution: ExecutionInfo {
            command: command.to_string(),
            primary_slot,
            environment,
        },
        slots,
        verification: Some(VerificationInfo {
            integrity_seal: IntegritySealInfo {
                required: true,
                algorithm: "ed25519".to_string(),
            },
        }),
        cache_validation,
        setup_commands,
        runtime,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic_stamp_is_zeroed() {
        let (timestamp, host) = build_stamp(true);
        assert_eq!(timestamp, "1970-01-01T00:00:00Z");
        // No hostname component when deterministic
        assert!(!host.contains(' '));
    }

    #[test]
    fn test_live_stamp_is_rfc3339() {
        let (timestamp, _) = build_stamp(false);
        assert!(chrono::DateTime::parse_from_rfc3339(&timestamp).is_ok());
    }
}
