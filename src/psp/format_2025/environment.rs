//! Environment isolation for PSPF/2025 payloads
//!
//! The launcher presents the payload with a predictable process environment,
//! independent of how the invoking shell was configured. A `runtime.env`
//! spec applies unset -> map -> set, gated by pass patterns; composition then
//! layers workenv variables, execution overrides, and finally the
//! un-overridable platform layer.

use glob::Pattern;
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::path::Path;

use super::defaults::DEFAULT_ISOLATION_UNSET;
use super::metadata::{Metadata, RuntimeEnv};

/// Pattern matcher for `pass` lists
///
/// Exact names double as required-variable declarations; glob patterns
/// (`*` / `?`) only filter.
struct PassPatterns {
    globs: Vec<Pattern>,
    exact: Vec<String>,
}

impl PassPatterns {
    fn new(patterns: &[String]) -> Self {
        let mut globs = Vec::new();
        let mut exact = Vec::new();

        for pattern in patterns {
            if pattern.contains('*') || pattern.contains('?') {
                match Pattern::new(pattern) {
                    Ok(p) => globs.push(p),
                    Err(e) => {
                        warn!("Invalid pass pattern '{pattern}': {e}");
                        exact.push(pattern.clone());
                    }
                }
            } else {
                exact.push(pattern.clone());
            }
        }

        Self { globs, exact }
    }

    fn protects(&self, key: &str) -> bool {
        if self.exact.iter().any(|name| name == key) {
            return true;
        }
        self.globs.iter().any(|glob| glob.matches(key))
    }

    /// Exact-name patterns absent from the environment log a warning
    /// (non-fatal at every tier).
    fn warn_missing(&self, env: &HashMap<String, String>) {
        for name in &self.exact {
            if !env.contains_key(name) {
                warn!("Required environment variable not present: {name}");
            }
        }
    }
}

fn matches_pattern(pattern: &str, key: &str) -> bool {
    if pattern.contains('*') || pattern.contains('?') {
        Pattern::new(pattern).map(|p| p.matches(key)).unwrap_or(false)
    } else {
        pattern == key
    }
}

/// Apply a runtime env spec: unset -> map -> set, gated by pass
///
/// Applying the same spec twice yields the same environment (idempotent).
pub fn apply_runtime_env(env: &mut HashMap<String, String>, spec: &RuntimeEnv) {
    let pass = PassPatterns::new(spec.pass.as_deref().unwrap_or(&[]));

    if let Some(unset_patterns) = &spec.unset {
        for pattern in unset_patterns {
            let victims: Vec<String> = env
                .keys()
                .filter(|key| matches_pattern(pattern, key) && !pass.protects(key))
                .cloned()
                .collect();
            for key in victims {
                trace!("unset {key}");
                env.remove(&key);
            }
        }
    }

    if let Some(map) = &spec.map {
        for (old_key, new_key) in map {
            if pass.protects(old_key) {
                trace!("map {old_key} skipped (protected by pass)");
                continue;
            }
            if let Some(value) = env.remove(old_key) {
                debug!("map {old_key} -> {new_key}");
                env.insert(new_key.clone(), value);
            }
        }
    }

    if let Some(set) = &spec.set {
        for (key, value) in set {
            trace!("set {key}");
            env.insert(key.clone(), value.clone());
        }
    }

    pass.warn_missing(env);
}

/// Remove the host-tooling variables the default isolation covers
pub fn apply_default_isolation(env: &mut HashMap<String, String>) {
    for name in DEFAULT_ISOLATION_UNSET {
        if env.remove(*name).is_some() {
            trace!("isolation unset {name}");
        }
    }
}

/// Normalize an OS name to the format's vocabulary
pub fn normalize_os(os: &str) -> String {
    match os {
        "Darwin" | "darwin" | "macos" => "darwin".to_string(),
        "Linux" | "linux" => "linux".to_string(),
        "Windows" | "windows" => "windows".to_string(),
        other => other.to_lowercase(),
    }
}

/// Normalize a CPU architecture name to the format's vocabulary
pub fn normalize_arch(arch: &str) -> String {
    match arch {
        "x86_64" | "AMD64" | "amd64" => "amd64".to_string(),
        "aarch64" | "arm64" => "arm64".to_string(),
        "i686" | "i586" | "i486" => "x86".to_string(),
        "i386" => "i386".to_string(),
        other => other.to_lowercase(),
    }
}

/// Best-effort host OS version (kernel release on Linux)
fn os_version() -> Option<String> {
    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/proc/sys/kernel/osrelease")
            .ok()
            .map(|s| s.trim().to_string())
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

/// Apply the platform layer: always last, never overridable
pub fn apply_platform_layer(env: &mut HashMap<String, String>) {
    let os = normalize_os(std::env::consts::OS);
    let arch = normalize_arch(std::env::consts::ARCH);

    env.insert("FLAVOR_OS".to_string(), os.clone());
    env.insert("FLAVOR_ARCH".to_string(), arch.clone());
    env.insert("FLAVOR_PLATFORM".to_string(), format!("{os}_{arch}"));

    if let Some(version) = os_version() {
        env.insert("FLAVOR_OS_VERSION".to_string(), version);
    }
    env.insert(
        "FLAVOR_CPU_TYPE".to_string(),
        std::env::consts::ARCH.to_string(),
    );
}

/// Compose the effective payload environment from all layers
///
/// base inherited env -> runtime spec (or default isolation) -> workenv
/// variables -> execution overrides -> platform layer.
pub fn compose_environment(
    base: HashMap<String, String>,
    metadata: &Metadata,
    workenv: &Path,
    package_path: &Path,
) -> HashMap<String, String> {
    let mut env = base;

    let isolated = metadata
        .runtime
        .as_ref()
        .and_then(|r| r.isolated)
        .unwrap_or(true);
    if isolated {
        apply_default_isolation(&mut env);
    }

    if let Some(spec) = metadata.runtime.as_ref().and_then(|r| r.env.as_ref()) {
        apply_runtime_env(&mut env, spec);
    }

    // Workenv layer
    let workenv_str = workenv.to_string_lossy().to_string();
    env.insert("FLAVOR_WORKENV".to_string(), workenv_str.clone());
    match env.get("PATH") {
        Some(path) => {
            let joined = format!("{workenv_str}/bin{}{path}", path_separator());
            env.insert("PATH".to_string(), joined);
        }
        None => {
            env.insert("PATH".to_string(), format!("{workenv_str}/bin"));
        }
    }

    // Execution layer
    for (key, value) in &metadata.execution.environment {
        env.insert(key.clone(), value.clone());
    }

    let command_name = package_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| package_path.to_string_lossy().to_string());
    env.insert("FLAVOR_COMMAND_NAME".to_string(), command_name);
    env.insert(
        "FLAVOR_ORIGINAL_COMMAND".to_string(),
        package_path.to_string_lossy().to_string(),
    );

    // Platform layer wins over everything
    apply_platform_layer(&mut env);

    env
}

fn path_separator() -> char {
    if cfg!(windows) { ';' } else { ':' }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn base_env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn spec(
        pass: &[&str],
        unset: &[&str],
        map: &[(&str, &str)],
        set: &[(&str, &str)],
    ) -> RuntimeEnv {
        RuntimeEnv {
            pass: Some(pass.iter().map(|s| s.to_string()).collect()),
            unset: Some(unset.iter().map(|s| s.to_string()).collect()),
            map: Some(
                map.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<BTreeMap<_, _>>(),
            ),
            set: Some(
                set.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<BTreeMap<_, _>>(),
            ),
        }
    }

    #[test]
    fn test_spec_scenario_pass_unset_map_set() {
        // Base {PATH, HOME, OLD, TEMP, KEEP}; pass [HOME, KEEP*];
        // unset [TEMP, OLD]; map {OLD->NEW}; set {X=1}
        let mut env = base_env(&[
            ("PATH", "/usr/bin"),
            ("HOME", "/h"),
            ("OLD", "v1"),
            ("TEMP", "t"),
            ("KEEP", "k"),
        ]);
        let s = spec(
            &["HOME", "KEEP*"],
            &["TEMP", "OLD"],
            &[("OLD", "NEW")],
            &[("X", "1")],
        );
        apply_runtime_env(&mut env, &s);

        assert_eq!(env.get("PATH").map(String::as_str), Some("/usr/bin"));
        assert_eq!(env.get("HOME").map(String::as_str), Some("/h"));
        assert_eq!(env.get("KEEP").map(String::as_str), Some("k"));
        assert_eq!(env.get("X").map(String::as_str), Some("1"));
        // NEW absent because OLD was unset before map ran
        assert!(!env.contains_key("TEMP"));
        assert!(!env.contains_key("OLD"));
        assert!(!env.contains_key("NEW"));
    }

    #[test]
    fn test_apply_is_idempotent() {
        let mut env = base_env(&[("A", "1"), ("B", "2"), ("HOME", "/h")]);
        let s = spec(&["HOME"], &["A"], &[("B", "C")], &[("D", "4")]);

        apply_runtime_env(&mut env, &s);
        let once = env.clone();
        apply_runtime_env(&mut env, &s);
        assert_eq!(env, once);
    }

    #[test]
    fn test_pass_protects_from_unset_glob() {
        let mut env = base_env(&[("SECRET_A", "1"), ("SECRET_B", "2")]);
        let s = spec(&["SECRET_B"], &["SECRET_*"], &[], &[]);
        apply_runtime_env(&mut env, &s);
        assert!(!env.contains_key("SECRET_A"));
        assert_eq!(env.get("SECRET_B").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_unset_star_clears_everything_unprotected() {
        let mut env = base_env(&[("A", "1"), ("B", "2"), ("HOME", "/h")]);
        let s = spec(&["HOME"], &["*"], &[], &[]);
        apply_runtime_env(&mut env, &s);
        assert_eq!(env.len(), 1);
        assert!(env.contains_key("HOME"));
    }

    #[test]
    fn test_map_renames_value() {
        let mut env = base_env(&[("OLD_NAME", "value")]);
        let s = spec(&[], &[], &[("OLD_NAME", "NEW_NAME")], &[]);
        apply_runtime_env(&mut env, &s);
        assert!(!env.contains_key("OLD_NAME"));
        assert_eq!(env.get("NEW_NAME").map(String::as_str), Some("value"));
    }

    #[test]
    fn test_set_overwrites() {
        let mut env = base_env(&[("K", "old")]);
        let s = spec(&[], &[], &[], &[("K", "new")]);
        apply_runtime_env(&mut env, &s);
        assert_eq!(env.get("K").map(String::as_str), Some("new"));
    }

    #[test]
    fn test_default_isolation_unsets_host_tooling() {
        let mut env = base_env(&[
            ("PYTHONPATH", "/x"),
            ("VIRTUAL_ENV", "/venv"),
            ("HOME", "/h"),
        ]);
        apply_default_isolation(&mut env);
        assert!(!env.contains_key("PYTHONPATH"));
        assert!(!env.contains_key("VIRTUAL_ENV"));
        assert!(env.contains_key("HOME"));
    }

    #[test]
    fn test_normalization() {
        assert_eq!(normalize_os("Darwin"), "darwin");
        assert_eq!(normalize_os("macos"), "darwin");
        assert_eq!(normalize_os("Linux"), "linux");
        assert_eq!(normalize_os("Windows"), "windows");
        assert_eq!(normalize_arch("x86_64"), "amd64");
        assert_eq!(normalize_arch("AMD64"), "amd64");
        assert_eq!(normalize_arch("aarch64"), "arm64");
        assert_eq!(normalize_arch("i686"), "x86");
        assert_eq!(normalize_arch("i386"), "i386");
    }

    #[test]
    fn test_platform_layer_is_unoverridable() {
        use super::super::metadata::{
            BuildInfo, ExecutionInfo, METADATA_FORMAT, Metadata, PackageInfo, RuntimeInfo,
        };

        let mut overrides = BTreeMap::new();
        overrides.insert("FLAVOR_OS".to_string(), "bogus".to_string());

        let metadata = Metadata {
            format: METADATA_FORMAT.to_string(),
            package: PackageInfo {
                name: "demo".to_string(),
                version: "1.0.0".to_string(),
                description: None,
            },
            build: BuildInfo {
                builder: "test".to_string(),
                timestamp: "1970-01-01T00:00:00Z".to_string(),
                host: "test".to_string(),
            },
            execution: ExecutionInfo {
                command: "true".to_string(),
                primary_slot: 0,
                environment: overrides,
            },
            slots: vec![],
            verification: None,
            cache_validation: None,
            setup_commands: vec![],
            runtime: Some(RuntimeInfo {
                env: None,
                isolated: Some(false),
            }),
        };

        let env = compose_environment(
            HashMap::new(),
            &metadata,
            Path::new("/tmp/we"),
            Path::new("/tmp/demo.psp"),
        );

        let expected_os = normalize_os(std::env::consts::OS);
        assert_eq!(env.get("FLAVOR_OS"), Some(&expected_os));
        assert!(env.get("FLAVOR_PLATFORM").unwrap().contains('_'));
        assert_eq!(
            env.get("FLAVOR_COMMAND_NAME").map(String::as_str),
            Some("demo.psp")
        );
        assert!(env.get("PATH").unwrap().starts_with("/tmp/we/bin"));
    }
}
