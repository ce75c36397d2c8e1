//! Build script to stamp the binaries with a version and git SHA.
//!
//! Environment variables (set by CI or fall back to defaults):
//! - MPDL_VERSION: Version string (defaults to CARGO_PKG_VERSION)
//! - MPDL_GIT_SHA: Git commit SHA (defaults to git rev-parse, then "unknown")

use std::process::Command;

fn main() {
    let version = std::env::var("MPDL_VERSION").unwrap_or_else(|_| {
        std::env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "unknown".into())
    });
    println!("cargo:rustc-env=MPDL_VERSION={}", version);

    let git_sha = std::env::var("MPDL_GIT_SHA").unwrap_or_else(|_| short_git_sha());
    println!("cargo:rustc-env=MPDL_GIT_SHA={}", git_sha);

    println!("cargo:rerun-if-env-changed=MPDL_VERSION");
    println!("cargo:rerun-if-env-changed=MPDL_GIT_SHA");
}

fn short_git_sha() -> String {
    Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".into())
}
