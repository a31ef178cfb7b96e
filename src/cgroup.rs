//! Cgroup Binding: creates a cgroup named after the container id, applies
//! CPU/memory limits, and attaches a PID — as a transient systemd scope
//! unit over the system D-Bus, carried over unchanged from the teacher's
//! `cgroup.rs`. This delegates the cgroup v1-vs-v2 controller choice to
//! systemd, satisfying §4.4's "this spec does not mandate which" without
//! hand-rolling cgroupfs writes.

use std::time::Duration;

use anyhow::{anyhow, Result};
use dbus::{
    arg::{self, Variant},
    blocking::Connection,
};
use regex::Regex;

use crate::dbus_systemd::OrgFreedesktopSystemd1Manager;

/// `mem` is a human-readable size (`"512M"`); `cpus` is a fractional core
/// count (`0.5` = half a core).
pub fn create_cgroup(container_id: &str, target_pid: u32, mem: Option<String>, cpus: Option<f32>) -> Result<()> {
    let conn = Connection::new_system()?;
    let proxy = conn.with_proxy(
        "org.freedesktop.systemd1",
        "/org/freedesktop/systemd1",
        Duration::new(5, 0),
    );

    let properties = build_properties(target_pid, mem, cpus, container_id)?;
    proxy.start_transient_unit(&format!("boxrun-{}.scope", container_id), "replace", properties, Vec::new())?;

    Ok(())
}

fn build_properties(
    target_pid: u32,
    mem: Option<String>,
    cpus: Option<f32>,
    container_id: &str,
) -> Result<Vec<(&'static str, arg::Variant<Box<dyn arg::RefArg>>)>> {
    let mut props: Vec<(&str, arg::Variant<Box<dyn arg::RefArg>>)> = Vec::new();
    props.push(("PIDs", Variant(Box::new(vec![target_pid]))));
    props.push(("Description", Variant(Box::new(format!("boxrun container: {}", container_id)))));

    if let Some(mem) = mem {
        props.push(("MemoryAccounting", Variant(Box::new(true))));
        let mem_bytes = parse_memory_limit(&mem)?;
        props.push(("MemoryMax", Variant(Box::new(mem_bytes))));
    }

    if let Some(cpus) = cpus {
        props.push(("CPUAccounting", Variant(Box::new(true))));
        props.push(("CPUQuotaPerSecUSec", Variant(Box::new((cpus * 1_000_000.0).round() as u64))));
    }

    Ok(props)
}

fn parse_memory_limit(mem: &str) -> Result<u64> {
    let re = Regex::new(r"^(\d+)([a-zA-Z]*)$").unwrap();
    let caps = re.captures(mem).ok_or_else(|| anyhow!("memory limit format invalid: {}", mem))?;

    let bytes: u64 = caps[1].parse()?;
    let unit = &caps[2];

    match unit {
        "" => Ok(bytes),
        "K" | "KB" | "k" | "kb" => Ok(bytes * 1_000),
        "M" | "MB" | "m" | "mb" => Ok(bytes * 1_000_000),
        "G" | "GB" | "g" | "gb" => Ok(bytes * 1_000_000_000),
        "T" | "TB" | "t" | "tb" => Ok(bytes * 1_000_000_000_000),
        other => Err(anyhow!("invalid memory unit: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_bytes() {
        assert_eq!(parse_memory_limit("512").unwrap(), 512);
    }

    #[test]
    fn parses_megabytes() {
        assert_eq!(parse_memory_limit("256M").unwrap(), 256_000_000);
        assert_eq!(parse_memory_limit("256MB").unwrap(), 256_000_000);
        assert_eq!(parse_memory_limit("256mb").unwrap(), 256_000_000);
    }

    #[test]
    fn parses_gigabytes() {
        assert_eq!(parse_memory_limit("2G").unwrap(), 2_000_000_000);
    }

    #[test]
    fn rejects_missing_digits() {
        assert!(parse_memory_limit("M").is_err());
    }

    #[test]
    fn rejects_unknown_unit() {
        assert!(parse_memory_limit("10Q").is_err());
    }
}
