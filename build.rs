use std::env;
use std::fs;
use std::path::Path;

fn main() {
    // Version comes from the environment when packaging, else the VERSION
    // file at the repo root, else the crate fallback.
    let version = if let Ok(v) = env::var("FLAVOR_VERSION") {
        v
    } else {
        let version_file = Path::new("VERSION");
        if version_file.exists() {
            fs::read_to_string(version_file)
                .unwrap_or_else(|_| "0.0.1".to_string())
                .trim()
                .to_string()
        } else {
            env!("CARGO_PKG_VERSION").to_string()
        }
    };

    println!("cargo:rustc-env=FLAVOR_VERSION={}", version);
    println!("cargo:rerun-if-changed=VERSION");
    println!("cargo:rerun-if-env-changed=FLAVOR_VERSION");
}
