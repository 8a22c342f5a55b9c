//! flavorpack launcher binary
//!
//! The launcher locates its own trailer (the package file IS this binary plus
//! the appended container) and drives verification, extraction, and exec.

use flavorpack::exit_codes::{
    EXIT_EXECUTION_ERROR, EXIT_EXTRACTION_ERROR, EXIT_INVALID_ARGS, EXIT_IO_ERROR, EXIT_PANIC,
    EXIT_PAYLOAD_NOT_FOUND, EXIT_PSPF_ERROR, EXIT_SIGNATURE_ERROR,
};
use flavorpack::{FlavorError, LaunchOptions, launch_package};
use std::{env, panic, path::Path, process};

fn main() {
    panic::set_hook(Box::new(|panic_info| {
        eprintln!("PANIC: {}", panic_info);
        process::exit(EXIT_PANIC);
    }));

    let result = panic::catch_unwind(run);

    match result {
        Ok(exit_code) => process::exit(exit_code),
        Err(_) => {
            eprintln!("Fatal: Unhandled panic in launcher");
            process::exit(EXIT_PANIC);
        }
    }
}

/// Forward SIGINT to a spawned payload and exit 130 ourselves
///
/// Only relevant in spawn mode; exec mode replaces this process entirely.
#[cfg(unix)]
fn install_sigint_handler() {
    use flavorpack::exit_codes::EXIT_SIGINT;
    use signal_hook::consts::SIGINT;
    use signal_hook::iterator::Signals;
    use std::sync::atomic::Ordering;

    match Signals::new([SIGINT]) {
        Ok(mut signals) => {
            std::thread::spawn(move || {
                if signals.forever().next().is_some() {
                    let child = flavorpack::CHILD_PID.load(Ordering::SeqCst);
                    if child != 0 {
                        let _ = process::Command::new("kill")
                            .args(["-INT", &child.to_string()])
                            .status();
                    }
                    process::exit(EXIT_SIGINT);
                }
            });
        }
        Err(e) => log::debug!("Failed to install SIGINT handler: {e}"),
    }
}

#[cfg(not(unix))]
fn install_sigint_handler() {}

fn run() -> i32 {
    if let Ok(level) = env::var("FLAVOR_LAUNCHER_LOG_LEVEL") {
        flavorpack::logger::JsonLogger::init_with_level(&level, "FLAVOR_LAUNCHER_LOG_LEVEL");
    } else if let Ok(level) = env::var("FLAVOR_LOG_LEVEL") {
        flavorpack::logger::JsonLogger::init_with_level(&level, "FLAVOR_LOG_LEVEL");
    } else {
        flavorpack::logger::JsonLogger::init();
    }

    log::debug!("Launcher process started");

    let args: Vec<String> = env::args().collect();

    let exe_path = match env::current_exe() {
        Ok(path) => path,
        Err(e) => {
            log::error!("Failed to get executable path: {e}");
            return EXIT_IO_ERROR;
        }
    };

    install_sigint_handler();

    // CLI mode is opt-in via environment only; otherwise every argument
    // belongs to the packaged application and must pass through untouched.
    let cli_mode =
        env::var("FLAVOR_LAUNCHER_CLI").is_ok_and(|v| v == "1" || v.to_lowercase() == "true");

    if cli_mode {
        return run_cli(&exe_path, &args);
    }

    let remaining_args = args[1..].to_vec();
    launch_and_map(&exe_path, &remaining_args)
}

fn launch_and_map(package: &Path, args: &[String]) -> i32 {
    match launch_package(package, args, LaunchOptions::default()) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Failed to launch package: {e}");
            map_error(&e)
        }
    }
}

fn map_error(e: &FlavorError) -> i32 {
    match e {
        FlavorError::FormatViolation(_) | FlavorError::UnsupportedFormat(_) => EXIT_PSPF_ERROR,
        FlavorError::VerificationFailed(_) => EXIT_SIGNATURE_ERROR,
        FlavorError::LockError(_) => EXIT_EXTRACTION_ERROR,
        FlavorError::IoError(_) => EXIT_IO_ERROR,
        FlavorError::LaunchError(msg) if msg.contains("Payload not found") => {
            EXIT_PAYLOAD_NOT_FOUND
        }
        _ => EXIT_EXECUTION_ERROR,
    }
}

fn run_cli(exe_path: &Path, args: &[String]) -> i32 {
    let command_args = &args[1..];
    let command = if command_args.is_empty() {
        "info"
    } else {
        command_args[0].as_str()
    };

    match command {
        "info" => show_info(exe_path),
        "verify" => verify(exe_path),
        "metadata" => show_metadata(exe_path),
        "extract" => {
            if command_args.len() < 3 {
                eprintln!("Usage: {} extract <slot_index> <output_dir>", args[0]);
                EXIT_INVALID_ARGS
            } else {
                extract(exe_path, &command_args[1], &command_args[2])
            }
        }
        "run" => {
            let remaining = if command_args.len() > 1 {
                command_args[1..].to_vec()
            } else {
                vec![]
            };
            launch_and_map(exe_path, &remaining)
        }
        "help" | "--help" => {
            println!("PSPF/2025 Package Launcher - CLI Mode");
            println!();
            println!("Available commands:");
            println!("  info              Show package information (default)");
            println!("  verify            Verify package integrity");
            println!("  metadata          Show raw package metadata");
            println!("  extract INDEX DIR Extract slot to directory");
            println!("  run [args...]     Execute package with arguments");
            println!("  help              Show this help message");
            println!();
            println!("Usage:");
            println!("  FLAVOR_LAUNCHER_CLI=1 ./package.psp <command>");
            0
        }
        other => {
            eprintln!("Error: Unknown command '{other}'");
            eprintln!("Available commands: info, verify, metadata, extract, run, help");
            EXIT_INVALID_ARGS
        }
    }
}

fn show_info(package: &Path) -> i32 {
    match flavorpack::verify_package(package) {
        Ok(result) => {
            println!("Package:   {} v{}", result.package_name, result.package_version);
            println!("Format:    {} ({})", result.format, result.version);
            println!("Slots:     {}", result.slot_count);
            println!(
                "Integrity: {}",
                if result.signature_valid { "sealed" } else { "UNVERIFIED" }
            );
            0
        }
        Err(e) => {
            eprintln!("Cannot read package: {e}");
            EXIT_PSPF_ERROR
        }
    }
}

fn verify(package: &Path) -> i32 {
    match flavorpack::verify_package(package) {
        Ok(result) if result.valid && result.signature_valid => {
            println!("OK: package integrity verified");
            0
        }
        Ok(_) => {
            eprintln!("FAILED: package integrity could not be verified");
            EXIT_SIGNATURE_ERROR
        }
        Err(e) => {
            eprintln!("Verification error: {e}");
            EXIT_PSPF_ERROR
        }
    }
}

fn show_metadata(package: &Path) -> i32 {
    let mut reader = match flavorpack::format_2025::Reader::open(package) {
        Ok(reader) => reader,
        Err(e) => {
            eprintln!("Cannot open package: {e}");
            return EXIT_PSPF_ERROR;
        }
    };
    match reader.read_metadata() {
        Ok(metadata) => match serde_json::to_string_pretty(metadata) {
            Ok(json) => {
                println!("{json}");
                0
            }
            Err(e) => {
                eprintln!("Cannot serialize metadata: {e}");
                EXIT_PSPF_ERROR
            }
        },
        Err(e) => {
            eprintln!("Cannot read metadata: {e}");
            EXIT_PSPF_ERROR
        }
    }
}

fn extract(package: &Path, index_arg: &str, dest_arg: &str) -> i32 {
    let Ok(slot_index) = index_arg.parse::<usize>() else {
        eprintln!("Invalid slot index: {index_arg}");
        return EXIT_INVALID_ARGS;
    };

    let mut reader = match flavorpack::format_2025::Reader::open(package) {
        Ok(reader) => reader,
        Err(e) => {
            eprintln!("Cannot open package: {e}");
            return EXIT_PSPF_ERROR;
        }
    };

    match reader.extract_slot(slot_index, Path::new(dest_arg)) {
        Ok(path) => {
            println!("Extracted slot {slot_index} to {}", path.display());
            0
        }
        Err(e) => {
            eprintln!("Extraction failed: {e}");
            EXIT_EXTRACTION_ERROR
        }
    }
}
