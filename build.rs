// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Build script for the RF-A PSCI affinity crate.

use std::env;

/// Platforms which can be selected with `--cfg platform="..."`.
const PLATFORMS: [&str; 2] = ["fvp", "qemu"];

/// Platform used when the build doesn't name one.
const DEFAULT_PLATFORM: &str = "fvp";

fn main() {
    println!(
        "cargo::rustc-check-cfg=cfg(platform, values(\"{}\"))",
        PLATFORMS.join("\", \""),
    );
    println!("cargo::rerun-if-env-changed=LOG_LEVEL");

    match env::var("CARGO_CFG_PLATFORM") {
        Ok(platform) => {
            if !PLATFORMS.contains(&platform.as_str()) {
                panic!("Unsupported platform {platform:?}, expected one of {PLATFORMS:?}");
            }
        }
        Err(_) => println!("cargo::rustc-cfg=platform=\"{DEFAULT_PLATFORM}\""),
    }
}
