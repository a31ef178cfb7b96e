//! Cleanup: unmounts every overlay mount still live on the host, then
//! delegates network teardown to the fabric's clean sweep.
//!
//! Grounded on `commands/clean.py`'s `_umount_overlayfs`, which shells out
//! to `mount -t overlay` and parses its stdout for mount points. Per
//! Design Note §9 ("replace ad-hoc subprocess shell-outs with direct
//! kernel interfaces where the ecosystem has them"), this reads
//! `/proc/mounts` directly instead of spawning `mount`.

use std::fs;

use anyhow::Result;
use nix::mount::{umount2, MntFlags};

use crate::network;

/// Unmounts every currently mounted overlay filesystem, lazily. Does not
/// remove the underlying `root_dir` trees — overlay artifacts are left for
/// forensic inspection, per §4.6.
fn unmount_overlays() -> Result<()> {
    for mount_point in overlay_mount_points()? {
        println!("  u: {}", mount_point);
        if let Err(e) = umount2(mount_point.as_str(), MntFlags::MNT_DETACH) {
            eprintln!("failed to unmount {}: {}", mount_point, e);
        }
    }
    Ok(())
}

/// Parses `/proc/mounts` (`device mountpoint fstype options dump pass`)
/// for entries whose filesystem type is `overlay`.
fn overlay_mount_points() -> Result<Vec<String>> {
    let contents = fs::read_to_string("/proc/mounts")?;
    Ok(parse_overlay_mount_points(&contents))
}

fn parse_overlay_mount_points(proc_mounts: &str) -> Vec<String> {
    proc_mounts
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _device = fields.next()?;
            let mount_point = fields.next()?;
            let fstype = fields.next()?;
            if fstype == "overlay" {
                Some(mount_point.to_string())
            } else {
                None
            }
        })
        .collect()
}

pub async fn run_clean() -> Result<()> {
    println!("umount all overlayfs");
    unmount_overlays()?;
    network::clean().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_only_overlay_entries() {
        let proc_mounts = "\
overlay /var/opt/app/container/c1 overlay rw,relatime 0 0
tmpfs /dev/shm tmpfs rw,nosuid,nodev 0 0
overlay /var/opt/app/container/c2 overlay rw,relatime,lowerdir=/a 0 0
";
        let points = parse_overlay_mount_points(proc_mounts);
        assert_eq!(points, vec!["/var/opt/app/container/c1".to_string(), "/var/opt/app/container/c2".to_string()]);
    }

    #[test]
    fn no_overlay_entries_yields_empty() {
        let proc_mounts = "tmpfs /dev/shm tmpfs rw 0 0\n";
        assert!(parse_overlay_mount_points(proc_mounts).is_empty());
    }
}
