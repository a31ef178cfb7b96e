//! Tunable paths and topology constants, env-overridable the way the teacher's
//! `const ROCKER_*` block in `main.rs` was hardcoded — generalized here so a
//! host can relocate image/container storage or the egress interface without
//! a rebuild.

use std::env;

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

pub fn image_dir() -> String {
    env_or("BOXRUN_IMAGE_DIR", "/var/opt/app/image")
}

pub fn container_dir() -> String {
    env_or("BOXRUN_CONTAINER_DIR", "/var/opt/app/container")
}

pub fn bridge_name() -> String {
    env_or("BOXRUN_BRIDGE_NAME", "br-container")
}

pub fn bridge_addr() -> String {
    env_or("BOXRUN_BRIDGE_ADDR", "192.168.0.1")
}

pub fn network_prefix() -> u8 {
    24
}

pub fn egress_iface() -> String {
    env_or("BOXRUN_EGRESS_IFACE", "eth1")
}

pub const NETNS_PREFIX: &str = "container-ns-";
