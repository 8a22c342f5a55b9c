//! Setup command execution and placeholder substitution
//!
//! Setup commands run after slot extraction, sequentially in declared order,
//! under the isolated environment. Commands are tokenized with shell-safe
//! quoting rules; no shell ever interposes.

use glob::glob;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use super::metadata::{Metadata, SetupCommand};
use crate::exceptions::{FlavorError, Result};

/// Substitute `{workenv}`, `{package_name}`, and `{version}` in text
pub fn substitute_placeholders(text: &str, workenv: &Path, metadata: &Metadata) -> String {
    let workenv_str = workenv.to_string_lossy();
    text.replace("{workenv}", &workenv_str)
        .replace("{package_name}", &metadata.package.name)
        .replace("{version}", &metadata.package.version)
}

/// Substitute `{slot:N}` references with `{workenv}/{slots[N].id}`
pub fn substitute_slot_references(command: &str, workenv: &Path, metadata: &Metadata) -> String {
    let mut command = command.to_string();
    let slot_count = metadata.slots.len().max(1);
    for i in 0..slot_count {
        let placeholder = format!("{{slot:{i}}}");
        if command.contains(&placeholder) {
            let slot_path = workenv.join(metadata.slot_id(i));
            command = command.replace(&placeholder, &slot_path.to_string_lossy());
        }
    }
    command
}

/// Split a command line into argv with shell-safe quoting rules
///
/// Handles single quotes (literal), double quotes (backslash escapes), and
/// bare backslash escapes. No variable expansion, no globbing, no shell.
pub fn tokenize(command: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = command.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            ' ' | '\t' | '\n' => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            '\'' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(inner) => current.push(inner),
                        None => {
                            return Err(FlavorError::InvalidInput(
                                "Unterminated single quote in command".into(),
                            ));
                        }
                    }
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped @ ('"' | '\\' | '$' | '`')) => current.push(escaped),
                            Some(other) => {
                                current.push('\\');
                                current.push(other);
                            }
                            None => {
                                return Err(FlavorError::InvalidInput(
                                    "Trailing backslash in command".into(),
                                ));
                            }
                        },
                        Some(inner) => current.push(inner),
                        None => {
                            return Err(FlavorError::InvalidInput(
                                "Unterminated double quote in command".into(),
                            ));
                        }
                    }
                }
            }
            '\\' => {
                in_token = true;
                match chars.next() {
                    Some(escaped) => current.push(escaped),
                    None => {
                        return Err(FlavorError::InvalidInput(
                            "Trailing backslash in command".into(),
                        ));
                    }
                }
            }
            other => {
                in_token = true;
                current.push(other);
            }
        }
    }

    if in_token {
        tokens.push(current);
    }

    Ok(tokens)
}

/// Execute all setup commands in declared order
pub fn execute_setup_commands(
    metadata: &Metadata,
    workenv: &Path,
    env: &HashMap<String, String>,
) -> Result<()> {
    let commands = &metadata.setup_commands;
    for (i, command) in commands.iter().enumerate() {
        debug!("Executing setup command {}/{}", i + 1, commands.len());

        match command {
            SetupCommand::WriteFile { path, content } => {
                run_write_file(path, content, workenv, metadata)?;
            }
            SetupCommand::Execute {
                command,
                timeout_secs,
            } => {
                let line = substitute_slot_references(command, workenv, metadata);
                let line = substitute_placeholders(&line, workenv, metadata);
                // Single execute: non-zero exit is fatal
                run_command_line(&line, workenv, env, *timeout_secs)?;
            }
            SetupCommand::EnumerateAndExecute { pattern, command } => {
                run_enumerate_and_execute(pattern, command, workenv, metadata, env)?;
            }
        }
    }

    Ok(())
}

fn run_write_file(path: &str, content: &str, workenv: &Path, metadata: &Metadata) -> Result<()> {
    let path = substitute_placeholders(path, workenv, metadata);
    let content = substitute_placeholders(content, workenv, metadata);

    let mut file_path = PathBuf::from(&path);
    // Writing "into" an existing directory drops a marker file inside it
    if file_path.is_dir() {
        file_path = file_path.join(".extracted");
    }

    let parent = file_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| workenv.to_path_buf());
    std::fs::create_dir_all(&parent)?;

    debug!("Writing file: {}", file_path.display());
    let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
    use std::io::Write;
    tmp.write_all(content.as_bytes())?;
    tmp.flush()?;
    tmp.persist(&file_path)
        .map_err(|e| FlavorError::IoError(e.error))?;

    Ok(())
}

fn run_enumerate_and_execute(
    pattern: &str,
    command_template: &str,
    workenv: &Path,
    metadata: &Metadata,
    env: &HashMap<String, String>,
) -> Result<()> {
    let glob_pattern = workenv.join(pattern).to_string_lossy().to_string();
    debug!("Enumerating files matching: {glob_pattern}");

    let entries =
        glob(&glob_pattern).map_err(|e| FlavorError::InvalidInput(format!("Bad glob pattern '{pattern}': {e}")))?;

    let mut matched = 0usize;
    for entry in entries {
        let file_path = match entry {
            Ok(path) => path,
            Err(e) => {
                warn!("Skipping unreadable glob match: {e}");
                continue;
            }
        };
        matched += 1;

        let line = command_template
            .replace("{file}", &file_path.to_string_lossy())
            .replace("{workenv}", &workenv.to_string_lossy());
        let line = substitute_slot_references(&line, workenv, metadata);
        let line = substitute_placeholders(&line, workenv, metadata);

        // Per-match failures are logged; processing continues
        if let Err(e) = run_command_line(&line, workenv, env, None) {
            error!("Command failed for {}: {e}", file_path.display());
        }
    }

    debug!("Enumerated {matched} match(es) for '{pattern}'");
    Ok(())
}

/// Tokenize and run one command with cwd = workenv and the given environment
fn run_command_line(
    line: &str,
    workenv: &Path,
    env: &HashMap<String, String>,
    timeout_secs: Option<u64>,
) -> Result<()> {
    let tokens = tokenize(line)?;
    if tokens.is_empty() {
        return Ok(());
    }

    info!("Running setup command: {line}");

    let mut command = Command::new(&tokens[0]);
    command.args(&tokens[1..]);
    command.current_dir(workenv);
    command.env_clear();
    command.envs(env);

    let output = match timeout_secs {
        Some(secs) => run_with_timeout(command, secs, &tokens[0])?,
        None => command.output().map_err(|e| {
            FlavorError::Generic(format!("Failed to spawn '{}': {e}", tokens[0]))
        })?,
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.is_empty() {
            info!("Command stdout:\n{stdout}");
        }
        return Err(FlavorError::Generic(format!(
            "Command failed with status {}: {}\n{}",
            output.status.code().unwrap_or(-1),
            tokens[0],
            stderr
        )));
    }

    Ok(())
}

/// Spawn with a deadline, polling completion
fn run_with_timeout(
    mut command: Command,
    timeout_secs: u64,
    name: &str,
) -> Result<std::process::Output> {
    use std::process::Stdio;
    use std::time::{Duration, Instant};

    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    let mut child = command
        .spawn()
        .map_err(|e| FlavorError::Generic(format!("Failed to spawn '{name}': {e}")))?;

    let deadline = Instant::now() + Duration::from_secs(timeout_secs);
    loop {
        match child.try_wait()? {
            Some(_) => {
                return Ok(child.wait_with_output()?);
            }
            None if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(FlavorError::Generic(format!(
                    "Command '{name}' timed out after {timeout_secs}s"
                )));
            }
            None => std::thread::sleep(Duration::from_millis(50)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::metadata::{
        BuildInfo, ExecutionInfo, METADATA_FORMAT, Metadata, PackageInfo, SlotMetadata,
    };
    use super::*;
    use std::collections::BTreeMap;

    fn test_metadata() -> Metadata {
        Metadata {
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
                environment: BTreeMap::new(),
            },
            slots: vec![SlotMetadata {
                index: 0,
                id: "payload".to_string(),
                operations: "raw".to_string(),
                purpose: "payload".to_string(),
                lifecycle: "runtime".to_string(),
                target: None,
                content_type: None,
                permissions: None,
                checksum: None,
            }],
            verification: None,
            cache_validation: None,
            setup_commands: vec![],
            runtime: None,
        }
    }

    #[test]
    fn test_placeholder_substitution() {
        let metadata = test_metadata();
        let out = substitute_placeholders(
            "{workenv}/bin of {package_name} v{version}",
            Path::new("/we"),
            &metadata,
        );
        assert_eq!(out, "/we/bin of demo v1.0.0");
    }

    #[test]
    fn test_slot_reference_substitution() {
        let metadata = test_metadata();
        let out = substitute_slot_references("cat {slot:0}", Path::new("/we"), &metadata);
        assert_eq!(out, "cat /we/payload");
    }

    #[test]
    fn test_tokenize_plain() {
        assert_eq!(tokenize("a b c").unwrap(), vec!["a", "b", "c"]);
        assert_eq!(tokenize("  a   b ").unwrap(), vec!["a", "b"]);
        assert!(tokenize("").unwrap().is_empty());
    }

    #[test]
    fn test_tokenize_quotes() {
        assert_eq!(
            tokenize("echo 'hello world'").unwrap(),
            vec!["echo", "hello world"]
        );
        assert_eq!(
            tokenize(r#"echo "a b" c"#).unwrap(),
            vec!["echo", "a b", "c"]
        );
        assert_eq!(
            tokenize(r#"echo "with \"inner\" quotes""#).unwrap(),
            vec!["echo", r#"with "inner" quotes"#]
        );
        assert_eq!(tokenize(r"a\ b").unwrap(), vec!["a b"]);
    }

    #[test]
    fn test_tokenize_errors() {
        assert!(tokenize("echo 'open").is_err());
        assert!(tokenize("echo \"open").is_err());
        assert!(tokenize("echo trailing\\").is_err());
    }

    #[test]
    fn test_write_file_command() {
        let dir = tempfile::tempdir().unwrap();
        let mut metadata = test_metadata();
        metadata.setup_commands = vec![SetupCommand::WriteFile {
            path: "{workenv}/.initialized".to_string(),
            content: "{version}".to_string(),
        }];

        execute_setup_commands(&metadata, dir.path(), &HashMap::new()).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join(".initialized")).unwrap(),
            "1.0.0"
        );
    }

    #[test]
    fn test_write_file_into_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("marker-target");
        std::fs::create_dir(&sub).unwrap();

        let mut metadata = test_metadata();
        metadata.setup_commands = vec![SetupCommand::WriteFile {
            path: "{workenv}/marker-target".to_string(),
            content: "done".to_string(),
        }];

        execute_setup_commands(&metadata, dir.path(), &HashMap::new()).unwrap();
        assert_eq!(
            std::fs::read_to_string(sub.join(".extracted")).unwrap(),
            "done"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_execute_nonzero_exit_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut metadata = test_metadata();
        metadata.setup_commands = vec![SetupCommand::Execute {
            command: "/bin/sh -c 'exit 3'".to_string(),
            timeout_secs: None,
        }];

        let mut env = HashMap::new();
        env.insert("PATH".to_string(), "/usr/bin:/bin".to_string());
        assert!(execute_setup_commands(&metadata, dir.path(), &env).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_enumerate_continues_past_failures() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("one.txt"), b"1").unwrap();
        std::fs::write(dir.path().join("two.txt"), b"2").unwrap();

        let mut metadata = test_metadata();
        // `false` fails for every match, but the run still succeeds
        metadata.setup_commands = vec![SetupCommand::EnumerateAndExecute {
            pattern: "*.txt".to_string(),
            command: "false {file}".to_string(),
        }];

        let mut env = HashMap::new();
        env.insert("PATH".to_string(), "/usr/bin:/bin".to_string());
        assert!(execute_setup_commands(&metadata, dir.path(), &env).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_execute_runs_in_workenv_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let mut metadata = test_metadata();
        metadata.setup_commands = vec![SetupCommand::Execute {
            command: "/bin/sh -c 'pwd > cwd.txt'".to_string(),
            timeout_secs: None,
        }];

        let mut env = HashMap::new();
        env.insert("PATH".to_string(), "/usr/bin:/bin".to_string());
        execute_setup_commands(&metadata, dir.path(), &env).unwrap();

        let recorded = std::fs::read_to_string(dir.path().join("cwd.txt")).unwrap();
        let recorded = recorded.trim();
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(
            std::path::Path::new(recorded).canonicalize().unwrap(),
            expected
        );
    }
}
