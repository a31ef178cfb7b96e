//! Network Fabric: the shared bridge + veth + netns + iptables topology.
//!
//! Grounded on the teacher's `network.rs` for the `rtnetlink`/`nix` call
//! shapes (bridge creation, veth creation + `setns_by_fd`, the
//! fork-then-setns trick for running netlink calls from inside a target
//! netns) and on `commands/network.py` for the exact allocation algorithm:
//! indices are derived by *counting live kernel state* (netns list, bridge
//! port count) rather than the teacher's random-IP-plus-`sled`-db scheme,
//! per the data model's "not persisted" invariant.

use std::fs;
use std::net::Ipv4Addr;
use std::os::unix::io::IntoRawFd;
use std::path::Path;
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use futures::TryStreamExt;
use nix::fcntl::{open, OFlag};
use nix::sched::{setns, CloneFlags};
use nix::sys::stat::Mode;
use nix::unistd::close;
use rtnetlink::packet::rtnl::link::nlas::Nla;
use rtnetlink::{new_connection, Handle, NetworkNamespace};

use crate::config;
use crate::error::RuntimeError;
use crate::fork::fork_fn;

const NETNS_DIR: &str = "/var/run/netns";

pub struct ContainerPeer {
    pub netns_name: String,
    pub veth_bridge: String,
    pub veth_container: String,
    pub container_ip: Ipv4Addr,
}

// --- pure arithmetic, factored out for testing without a kernel ---

fn netns_name_for_index(k: usize) -> String {
    format!("{}{}", config::NETNS_PREFIX, k)
}

fn veth_names_for_index(n: u8) -> (String, String) {
    (format!("v{}br", n), format!("v{}p", n))
}

fn container_ip_for_index(n: u8) -> Ipv4Addr {
    Ipv4Addr::new(192, 168, 0, n)
}

fn next_netns_index(current_count: usize) -> usize {
    current_count + 1
}

fn next_veth_index(bridge_port_count: usize) -> u8 {
    (bridge_port_count + 2) as u8
}

/// Counts entries under the netns directory whose name starts with `prefix`
/// — the live-state equivalent of `pyroute2.netns.listnetns()`.
fn count_netns_with_prefix(dir: &Path, prefix: &str) -> Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(0),
    };
    let mut count = 0;
    for entry in entries {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with(prefix) {
            count += 1;
        }
    }
    Ok(count)
}

fn list_netns_with_prefix(dir: &Path, prefix: &str) -> Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(Vec::new()),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(prefix) {
            names.push(name);
        }
    }
    Ok(names)
}

// --- netlink helpers ---

async fn get_link_index(handle: &Handle, name: &str) -> Result<Option<u32>> {
    let mut links = handle.link().get().set_name_filter(name.to_string()).execute();
    if let Some(link) = links.try_next().await? {
        Ok(Some(link.header.index))
    } else {
        Ok(None)
    }
}

async fn set_link_up_by_name(handle: &Handle, name: &str) -> Result<()> {
    let index = get_link_index(handle, name)
        .await?
        .ok_or_else(|| anyhow!("link not found: {}", name))?;
    handle.link().set(index).up().execute().await?;
    Ok(())
}

/// Counts interfaces whose master is `bridge_index` — the live-state
/// equivalent of `ndb.interfaces` filtered on `slave_kind == 'bridge'`.
async fn count_bridge_ports(handle: &Handle, bridge_index: u32) -> Result<usize> {
    Ok(bridge_port_names(handle, bridge_index).await?.len())
}

async fn bridge_port_names(handle: &Handle, bridge_index: u32) -> Result<Vec<String>> {
    let mut links = handle.link().get().execute();
    let mut names = Vec::new();
    while let Some(msg) = links.try_next().await? {
        let is_port = msg.nlas.iter().any(|nla| matches!(nla, Nla::Master(idx) if *idx == bridge_index));
        if !is_port {
            continue;
        }
        for nla in msg.nlas.iter() {
            if let Nla::IfName(name) = nla {
                names.push(name.clone());
            }
        }
    }
    Ok(names)
}

async fn move_link_to_netns(handle: &Handle, link_name: &str, netns_name: &str) -> Result<()> {
    let index = get_link_index(handle, link_name)
        .await?
        .ok_or_else(|| anyhow!("link not found: {}", link_name))?;
    let netns_fd = std::fs::OpenOptions::new()
        .read(true)
        .open(format!("{}/{}", NETNS_DIR, netns_name))
        .with_context(|| format!("opening netns {}", netns_name))?
        .into_raw_fd();
    handle.link().set(index).setns_by_fd(netns_fd).execute().await?;
    Ok(())
}

/// Forks, enters `netns_name`, assigns `ip/24` to `veth_name`, brings it
/// up, and gives the namespace's loopback an address — mirroring the
/// teacher's `run_in_network_namespace` fork-then-setns pattern, since the
/// `rtnetlink` handle always operates on the *current* process's netns.
///
/// The child reports success or failure through its exit status (via
/// `fork_fn`'s blocking wait) rather than silently falling off the end of
/// the closure — a failure here means the container-end veth never got an
/// address inside its netns, which is a `FabricFailure` fatal to the caller.
fn configure_peer_in_netns(netns_name: &str, veth_name: &str, ip: Ipv4Addr) -> Result<()> {
    let netns_name_owned = netns_name.to_string();
    let veth_name_owned = veth_name.to_string();

    let ok = fork_fn(
        move || -> bool {
            let ns_path = format!("{}/{}", NETNS_DIR, netns_name_owned);
            let fd = match open(ns_path.as_str(), OFlag::O_RDONLY, Mode::empty()) {
                Ok(fd) => fd,
                Err(e) => {
                    eprintln!("failed to open netns {}: {}", ns_path, e);
                    return false;
                }
            };
            if let Err(e) = setns(fd, CloneFlags::CLONE_NEWNET) {
                eprintln!("failed to setns into {}: {}", ns_path, e);
                let _ = close(fd);
                return false;
            }
            let _ = close(fd);

            let rt = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    eprintln!("failed to build runtime inside netns: {}", e);
                    return false;
                }
            };
            rt.block_on(async move {
                let result: std::result::Result<(), anyhow::Error> = async {
                    let (connection, handle, _) = new_connection()?;
                    tokio::spawn(connection);

                    let index = get_link_index(&handle, &veth_name_owned)
                        .await?
                        .ok_or_else(|| anyhow!("link not found inside netns: {}", veth_name_owned))?;
                    handle.address().add(index, std::net::IpAddr::V4(ip), config::network_prefix()).execute().await?;
                    handle.link().set(index).up().execute().await?;

                    if let Some(lo_index) = get_link_index(&handle, "lo").await? {
                        handle
                            .address()
                            .add(lo_index, std::net::IpAddr::V4(Ipv4Addr::LOCALHOST), 8)
                            .execute()
                            .await?;
                        handle.link().set(lo_index).up().execute().await?;
                    }

                    Ok(())
                }
                .await;

                match result {
                    Ok(()) => true,
                    Err(e) => {
                        eprintln!("failed to configure peer inside netns: {}", e);
                        false
                    }
                }
            })
        },
        true,
    )
    .map_err(|e| RuntimeError::FabricFailure(format!("forking to configure peer in netns {}: {}", netns_name, e)))?;

    if !ok {
        return Err(RuntimeError::FabricFailure(format!(
            "configuring veth {} inside netns {} failed, see logged cause above",
            veth_name, netns_name
        ))
        .into());
    }

    Ok(())
}

fn add_default_route_in_netns(netns_name: &str, gateway: &str) -> Result<()> {
    run_argv(&["ip", "netns", "exec", netns_name, "ip", "route", "add", "default", "via", gateway])
}

fn run_argv(argv: &[&str]) -> Result<()> {
    let status = Command::new(argv[0])
        .args(&argv[1..])
        .status()
        .with_context(|| format!("spawning {:?}", argv))?;
    if !status.success() {
        return Err(RuntimeError::FabricFailure(format!("{:?} exited with {}", argv, status)).into());
    }
    Ok(())
}

fn reset_iptables() -> Result<()> {
    println!("flush iptable");
    run_argv(&["iptables", "--table", "nat", "--flush"])?;

    println!("add ip masquerade from container subnet");
    run_argv(&[
        "iptables",
        "--table",
        "nat",
        "--append",
        "POSTROUTING",
        "--source",
        "192.168.0.0/24",
        "--jump",
        "MASQUERADE",
    ])
}

// --- bridge lifecycle ---

pub async fn is_bridge_up() -> Result<bool> {
    let (connection, handle, _) = new_connection()?;
    tokio::spawn(connection);
    Ok(get_link_index(&handle, &config::bridge_name()).await?.is_some())
}

/// Idempotent: a no-op if the bridge already exists.
pub async fn init_bridge() -> Result<()> {
    let (connection, handle, _) = new_connection()?;
    tokio::spawn(connection);

    let bridge_name = config::bridge_name();

    if get_link_index(&handle, &bridge_name).await?.is_some() {
        println!("{} (bridge) is already up", bridge_name);
        return Ok(());
    }

    println!("create bridge for container network \"{}\"", bridge_name);
    handle
        .link()
        .add()
        .bridge(bridge_name.clone())
        .execute()
        .await
        .map_err(|e| RuntimeError::FabricFailure(format!("creating bridge {}: {}", bridge_name, e)))?;

    let bridge_index = get_link_index(&handle, &bridge_name)
        .await?
        .ok_or_else(|| RuntimeError::FabricFailure(format!("bridge {} missing right after creation", bridge_name)))?;

    let gw: Ipv4Addr = config::bridge_addr().parse()?;
    handle
        .address()
        .add(bridge_index, std::net::IpAddr::V4(gw), config::network_prefix())
        .execute()
        .await?;
    set_link_up_by_name(&handle, &bridge_name).await?;

    reset_iptables()?;

    Ok(())
}

/// Steps 1-6 of per-container peer allocation.
pub async fn allocate_peer(gateway: &Ipv4Addr) -> Result<ContainerPeer> {
    let (connection, handle, _) = new_connection()?;
    tokio::spawn(connection);

    // Step 1: fresh netns.
    let existing = count_netns_with_prefix(Path::new(NETNS_DIR), config::NETNS_PREFIX)?;
    let netns_name = netns_name_for_index(next_netns_index(existing));
    println!("create network namespace \"{}\"", netns_name);
    NetworkNamespace::add(netns_name.clone())
        .await
        .map_err(|e| RuntimeError::FabricFailure(format!("creating netns {}: {}", netns_name, e)))?;

    // Step 2: compute n and derive veth names.
    let bridge_name = config::bridge_name();
    let bridge_index = get_link_index(&handle, &bridge_name)
        .await?
        .ok_or_else(|| RuntimeError::FabricFailure(format!("bridge {} not found", bridge_name)))?;
    let port_count = count_bridge_ports(&handle, bridge_index).await?;
    let n = next_veth_index(port_count);
    let (veth_bridge, veth_container) = veth_names_for_index(n);
    println!(
        "create virtual ethernet between [BRIDGE]({}) ~ [{}]({})",
        veth_bridge, netns_name, veth_container
    );

    // Step 3: create veth pair, move the container end into the netns.
    handle
        .link()
        .add()
        .veth(veth_bridge.clone(), veth_container.clone())
        .execute()
        .await
        .map_err(|e| RuntimeError::FabricFailure(format!("creating veth pair: {}", e)))?;
    move_link_to_netns(&handle, &veth_container, &netns_name).await?;

    // Step 4: bring up host end; bring up + address the container end.
    set_link_up_by_name(&handle, &veth_bridge).await?;
    let container_ip = container_ip_for_index(n);
    println!("set ip address {}/{}", container_ip, config::network_prefix());
    configure_peer_in_netns(&netns_name, &veth_container, container_ip)?;

    // Step 5: attach the host end as a bridge port.
    let veth_bridge_index = get_link_index(&handle, &veth_bridge)
        .await?
        .ok_or_else(|| anyhow!("link not found: {}", veth_bridge))?;
    handle.link().set(veth_bridge_index).master(bridge_index).execute().await?;

    // Step 6: default route inside the netns.
    add_default_route_in_netns(&netns_name, &gateway.to_string())?;

    Ok(ContainerPeer {
        netns_name,
        veth_bridge,
        veth_container,
        container_ip,
    })
}

/// Appends a PREROUTING DNAT rule forwarding `source` on the egress
/// interface to `dest` on the container's address.
pub fn add_port_forward(container_ip: &Ipv4Addr, source: u16, dest: u16) -> Result<()> {
    println!("set port forward from {} to {}", source, dest);
    run_argv(&[
        "iptables",
        "--table",
        "nat",
        "--append",
        "PREROUTING",
        "-i",
        &config::egress_iface(),
        "-p",
        "tcp",
        "--dport",
        &source.to_string(),
        "--jump",
        "DNAT",
        "--to",
        &format!("{}:{}", container_ip, dest),
    ])
}

/// Destroys every `container-ns-*` netns and every bridge port, removes the
/// bridge, then flushes and reinstalls NAT. Idempotent: running it with no
/// bridge and no netns present succeeds without modifying kernel state.
pub async fn clean() -> Result<()> {
    let (connection, handle, _) = new_connection()?;
    tokio::spawn(connection);

    let bridge_name = config::bridge_name();
    if get_link_index(&handle, &bridge_name).await?.is_none() {
        // Ensure the bridge exists so this pass can remove it like any other.
        init_bridge().await.ok();
    }

    if let Some(bridge_index) = get_link_index(&handle, &bridge_name).await? {
        for ifname in bridge_port_names(&handle, bridge_index).await? {
            println!("delete [veth]({}) in bridge", ifname);
            if let Some(idx) = get_link_index(&handle, &ifname).await? {
                handle.link().del(idx).execute().await.ok();
            }
        }

        println!("delete bridge \"{}\"", bridge_name);
        handle.link().del(bridge_index).execute().await.ok();
    }

    for ns in list_netns_with_prefix(Path::new(NETNS_DIR), config::NETNS_PREFIX)? {
        println!("delete netns \"{}\"", ns);
        NetworkNamespace::del(ns).await.ok();
    }

    reset_iptables()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn netns_index_grows_by_one() {
        assert_eq!(next_netns_index(0), 1);
        assert_eq!(next_netns_index(1), 2);
        assert_eq!(next_netns_index(5), 6);
    }

    #[test]
    fn veth_index_starts_at_two() {
        assert_eq!(next_veth_index(0), 2);
        assert_eq!(next_veth_index(1), 3);
    }

    #[test]
    fn netns_name_uses_prefix() {
        assert_eq!(netns_name_for_index(1), "container-ns-1");
        assert_eq!(netns_name_for_index(12), "container-ns-12");
    }

    #[test]
    fn veth_names_follow_br_and_p_suffixes() {
        assert_eq!(veth_names_for_index(2), ("v2br".to_string(), "v2p".to_string()));
        assert_eq!(veth_names_for_index(3), ("v3br".to_string(), "v3p".to_string()));
    }

    #[test]
    fn container_ips_are_distinct_and_in_range() {
        let a = container_ip_for_index(2);
        let b = container_ip_for_index(3);
        assert_ne!(a, b);
        assert_eq!(a, Ipv4Addr::new(192, 168, 0, 2));
        assert_eq!(b, Ipv4Addr::new(192, 168, 0, 3));
    }

    #[test]
    fn counts_only_matching_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("container-ns-1"), "").unwrap();
        fs::write(tmp.path().join("container-ns-2"), "").unwrap();
        fs::write(tmp.path().join("unrelated-ns"), "").unwrap();

        assert_eq!(count_netns_with_prefix(tmp.path(), "container-ns-").unwrap(), 2);
    }

    #[test]
    fn counts_zero_when_dir_absent() {
        assert_eq!(count_netns_with_prefix(Path::new("/nonexistent-boxrun-netns-dir"), "container-ns-").unwrap(), 0);
    }

    #[test]
    fn lists_matching_netns_names_only() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("container-ns-1"), "").unwrap();
        fs::write(tmp.path().join("other"), "").unwrap();

        let names = list_netns_with_prefix(tmp.path(), "container-ns-").unwrap();
        assert_eq!(names, vec!["container-ns-1".to_string()]);
    }
}
