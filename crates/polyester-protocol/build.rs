// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Fall back to the vendored protoc when the host has none configured.
    if std::env::var_os("PROTOC").is_none() {
        let protoc = protoc_bin_vendored::protoc_bin_path()?;
        // SAFETY: build scripts run single-threaded
        unsafe { std::env::set_var("PROTOC", protoc) };
    }

    // Control-plane API (sessions, inputs, outputs, task results)
    prost_build::compile_protos(&["proto/api.proto"], &["proto/"])?;

    println!("cargo:rerun-if-changed=proto/");
    Ok(())
}
