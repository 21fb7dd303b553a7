// Centralized version information

// Protocol revision this server speaks, shown in the startup banner
pub const PROTOCOL_REVISION: &str = "ota-cluster-r23";

// Cargo package version from Cargo.toml
pub const CARGO_VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn full_version() -> String {
    format!("v{} ({})", CARGO_VERSION, PROTOCOL_REVISION)
}

// Version info string for logging
pub fn version_info() -> String {
    format!(
        "mesh-ota {}, protocol {}, header formats {:04x}/{:04x}",
        CARGO_VERSION,
        PROTOCOL_REVISION,
        ota_core::HeaderVersion::Zigbee.raw(),
        ota_core::HeaderVersion::Thread.raw()
    )
}
