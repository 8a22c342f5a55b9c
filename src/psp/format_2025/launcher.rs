//! PSPF/2025 package launcher glue
//!
//! Ties the run-side pipeline together: open the reader, verify at the
//! configured tier, populate the workenv, compose the payload environment,
//! and hand control to the payload command.

use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::Ordering;

use super::defaults::{ValidationLevel, get_validation_level};
use super::environment::compose_environment;
use super::execution::{substitute_placeholders, substitute_slot_references, tokenize};
use super::metadata::Metadata;
use super::reader::Reader;
use super::workenv::setup_workenv;
use crate::CHILD_PID;
use crate::api::LaunchOptions;
use crate::exceptions::{FlavorError, Result};

/// Launch a PSPF/2025 package
///
/// On Unix the payload replaces this process unless `FLAVOR_EXEC_MODE=spawn`;
/// otherwise the child's exit code is propagated.
pub fn launch(package_path: &Path, args: &[String], options: &LaunchOptions) -> Result<i32> {
    debug!("Reading PSPF package {:?}", package_path);

    let mut reader = Reader::open(package_path)?;

    let level = get_validation_level();
    if matches!(level, ValidationLevel::None) {
        eprintln!("WARNING: skipping all integrity verification (FLAVOR_VALIDATION=none)");
        eprintln!("WARNING: this is NOT RECOMMENDED for production use");
        warn!("VALIDATION DISABLED: skipping integrity verification");
    } else {
        debug!("Verifying package integrity (level: {level:?})");
        let report = reader.verify_integrity_at(level)?;
        if report.valid {
            debug!("Package integrity verified");
        } else if level.fails_hard() {
            error!("Package integrity verification failed");
            return Err(FlavorError::VerificationFailed(
                "Package signature verification failed".to_string(),
            ));
        }
        if !report.signature_valid && !level.fails_hard() {
            eprintln!("WARNING: package signature verification failed");
            eprintln!("WARNING: package may be corrupted or tampered with");
            eprintln!("WARNING: continuing due to validation level: {level:?}");
            warn!("Package signature verification failed, continuing at {level:?}");
        }
    }

    let metadata = reader.read_metadata()?.clone();
    info!(
        "Package: {} v{}",
        metadata.package.name, metadata.package.version
    );
    debug!("Primary slot: {}", metadata.execution.primary_slot);
    debug!("Command: {}", metadata.execution.command);

    let workdir = options.workdir.as_ref().map(PathBuf::from);
    let workenv = setup_workenv(&mut reader, package_path, workdir.as_deref())?;
    info!("Work environment: {workenv:?}");

    let (executable, cmd_args, env_map) =
        prepare_command(&metadata, &workenv, package_path, args)?;

    let exec_mode = env::var("FLAVOR_EXEC_MODE").unwrap_or_else(|_| "exec".to_string());
    let use_exec = exec_mode.to_lowercase() != "spawn";

    #[cfg(unix)]
    if use_exec {
        use std::os::unix::process::CommandExt;

        let mut cmd = Command::new(&executable);
        cmd.args(&cmd_args);
        cmd.env_clear();
        cmd.envs(&env_map);
        cmd.current_dir(env::current_dir()?);

        // argv[0] rewriting breaks shebang scripts; only rename binaries
        if is_shebang_script(Path::new(&executable)) {
            info!("Executing script: {executable}");
        } else if let Some(binary_name) = package_path.file_name().and_then(|n| n.to_str()) {
            cmd.arg0(binary_name);
            info!("Executing binary: {executable} with argv[0]={binary_name}");
        }

        debug!("exec() replacing process: {executable} {cmd_args:?}");
        let error = cmd.exec();
        return Err(FlavorError::LaunchError(format!(
            "Failed to exec {executable}: {error}"
        )));
    }

    #[cfg(not(unix))]
    if use_exec {
        debug!("exec() not available on this platform, using spawn mode");
    }

    debug!("Using spawn mode");
    let mut cmd = Command::new(&executable);
    cmd.args(&cmd_args);
    cmd.env_clear();
    cmd.envs(&env_map);
    cmd.current_dir(env::current_dir()?);

    info!("Spawning: {executable}");
    let mut child = cmd.spawn().map_err(|e| {
        FlavorError::LaunchError(format!("Failed to spawn {executable}: {e}"))
    })?;

    CHILD_PID.store(child.id(), Ordering::SeqCst);

    let status = child.wait()?;
    Ok(status.code().unwrap_or(1))
}

/// Resolve the payload command line and its effective environment
fn prepare_command(
    metadata: &Metadata,
    workenv: &Path,
    package_path: &Path,
    args: &[String],
) -> Result<(String, Vec<String>, HashMap<String, String>)> {
    let command = substitute_slot_references(&metadata.execution.command, workenv, metadata);
    let command = substitute_placeholders(&command, workenv, metadata);
    debug!("Payload command: {command}");

    let mut tokens = tokenize(&command)?;
    if tokens.is_empty() {
        return Err(FlavorError::LaunchError("No command specified".to_string()));
    }

    let executable = resolve_executable(&tokens.remove(0), workenv)?;

    let mut all_args = tokens;
    all_args.extend_from_slice(args);

    let base: HashMap<String, String> = env::vars().collect();
    let env_map = compose_environment(base, metadata, workenv, package_path);

    Ok((executable, all_args, env_map))
}

/// Resolve the payload executable, preferring workenv-relative paths
///
/// Missing payloads are reported distinctly so the binary can exit 127.
fn resolve_executable(executable: &str, workenv: &Path) -> Result<String> {
    let as_path = Path::new(executable);
    if as_path.is_absolute() {
        if as_path.exists() {
            return Ok(executable.to_string());
        }
        return Err(FlavorError::LaunchError(format!(
            "Payload not found: {executable}"
        )));
    }

    let in_workenv = workenv.join(executable);
    if in_workenv.exists() {
        return Ok(in_workenv.to_string_lossy().to_string());
    }

    let bin_candidate = workenv.join("bin").join(executable);
    if bin_candidate.exists() {
        return Ok(bin_candidate.to_string_lossy().to_string());
    }

    match which::which(executable) {
        Ok(resolved) => {
            let resolved = resolved.to_string_lossy().to_string();
            debug!("Resolved executable '{executable}' to '{resolved}'");
            Ok(resolved)
        }
        Err(_) => Err(FlavorError::LaunchError(format!(
            "Payload not found: {executable}"
        ))),
    }
}

/// Check whether a file begins with a shebang line
#[cfg(unix)]
fn is_shebang_script(path: &Path) -> bool {
    use std::io::Read;

    let Ok(mut file) = std::fs::File::open(path) else {
        return false;
    };
    let mut prefix = [0u8; 2];
    matches!(file.read_exact(&mut prefix), Ok(())) && &prefix == b"#!"
}
