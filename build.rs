// SPDX-License-Identifier: AGPL-3.0-only

// Stamps the compiler and source revision into the binary so
// `--version` can identify exactly what a capture was produced with.
// CI provides HTTPSPOOL_COMMIT; local builds fall back to asking git.

use std::process::Command;

fn main() {
    println!("cargo:rustc-env=RUSTC_VERSION={}", rustc());
    println!("cargo:rustc-env=HTTPSPOOL_COMMIT={}", commit());
}

fn rustc() -> String {
    rustc_version::version().map_or_else(|_| "unknown".to_string(), |v| v.to_string())
}

fn commit() -> String {
    if let Ok(tag) = std::env::var("HTTPSPOOL_COMMIT") {
        if !tag.is_empty() {
            return tag;
        }
    }
    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output();
    match output {
        Ok(out) if out.status.success() => {
            let rev = String::from_utf8_lossy(&out.stdout).trim().to_string();
            if rev.is_empty() { "unreleased".to_string() } else { rev }
        }
        _ => "unreleased".to_string(),
    }
}
