// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

fn main() {
    println!("cargo:rerun-if-env-changed=AXON_LINKER_SCRIPT");
    // Host test binaries link with the system defaults.
    let bare_metal = std::env::var("CARGO_CFG_TARGET_OS").is_ok_and(|os| os == "none");
    if let (true, Ok(script)) = (bare_metal, std::env::var("AXON_LINKER_SCRIPT")) {
        println!("cargo:rustc-link-arg=-T{script}");
    }
}
