//! flavorpack builder binary

use clap::Parser;
use flavorpack::exit_codes::{
    EXIT_BUILD_ERROR, EXIT_CONFIG_ERROR, EXIT_IO_ERROR, EXIT_PANIC, EXIT_PSPF_ERROR,
    EXIT_SIGNATURE_ERROR, EXIT_SUCCESS,
};
use flavorpack::{BuildOptions, build_package};
use std::{panic, path::PathBuf, process};

const VERSION: &str = flavorpack::version::VERSION;

#[derive(Parser, Debug)]
#[command(version = VERSION, about = "Build PSPF/2025 packages")]
struct Args {
    /// Path to manifest.json
    #[arg(short, long)]
    manifest: PathBuf,

    /// Output path for the package
    #[arg(short, long)]
    output: PathBuf,

    /// Path to launcher binary
    #[arg(long)]
    launcher_bin: Option<PathBuf>,

    /// Path to private key (PEM format)
    #[arg(long)]
    private_key: Option<PathBuf>,

    /// Path to public key (PEM format)
    #[arg(long)]
    public_key: Option<PathBuf>,

    /// Seed for deterministic key generation
    #[arg(long)]
    key_seed: Option<String>,

    /// Produce byte-identical output for identical inputs
    #[arg(long)]
    deterministic: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

fn main() {
    panic::set_hook(Box::new(|panic_info| {
        eprintln!("PANIC: {}", panic_info);
        process::exit(EXIT_PANIC);
    }));

    let result = panic::catch_unwind(run);

    match result {
        Ok(exit_code) => process::exit(exit_code),
        Err(_) => {
            eprintln!("Fatal: Unhandled panic in builder");
            process::exit(EXIT_PANIC);
        }
    }
}

fn run() -> i32 {
    let args = Args::parse();

    if let Some(ref level) = args.log_level {
        flavorpack::logger::JsonLogger::init_with_level(level, "CLI --log-level");
    } else {
        flavorpack::logger::JsonLogger::init();
    }

    let options = BuildOptions {
        launcher_bin: args.launcher_bin,
        private_key_path: args.private_key,
        public_key_path: args.public_key,
        key_seed: args.key_seed,
        deterministic: args.deterministic,
    };

    match build_package(&args.manifest, &args.output, options) {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("Build error: {}", e);
            match e.to_string() {
                s if s.contains("manifest") || s.contains("config") => EXIT_CONFIG_ERROR,
                s if s.contains("format") || s.contains("PSPF") => EXIT_PSPF_ERROR,
                s if s.contains("key") || s.contains("signature") => EXIT_SIGNATURE_ERROR,
                s if s.contains("IO error") || s.contains("read") || s.contains("write") => {
                    EXIT_IO_ERROR
                }
                _ => EXIT_BUILD_ERROR,
            }
        }
    }
}
