use std::net::Ipv4Addr;

use anyhow::{anyhow, Result};
use clap::Clap;

mod cgroup;
mod cleanup;
mod config;
mod container;
mod dbus_systemd;
mod error;
mod fork;
mod image;
mod launcher;
mod network;

use error::RuntimeError;

#[derive(Clap)]
struct Opts {
    #[clap(subcommand)]
    subcmd: SubCommand,
}

#[derive(Clap)]
enum SubCommand {
    Run(Run),
    Images,
    Clean,
}

#[derive(Clap)]
struct Run {
    #[clap(long)]
    cpus: Option<f32>,
    #[clap(short, long)]
    memory: Option<String>,
    #[clap(short, long)]
    publish: Option<String>,
    /// `<registry>/<image>:<tag>`, e.g. `library/alpine:3`
    reference: String,
    /// Overrides `image.cmd` when non-empty.
    #[clap(last = true)]
    command: Vec<String>,
}

fn main() -> Result<()> {
    let opts: Opts = Opts::parse();

    if !nix::unistd::getuid().is_root() {
        return Err(anyhow!("boxrun needs root privileges to manipulate namespaces, mounts, and network interfaces."));
    }

    let rt = tokio::runtime::Runtime::new()?;

    match opts.subcmd {
        SubCommand::Run(r) => {
            let code = rt.block_on(run_command(r))?;
            std::process::exit(code);
        }
        SubCommand::Images => image::print_available_images()?,
        SubCommand::Clean => rt.block_on(cleanup::run_clean())?,
    }

    Ok(())
}

async fn run_command(r: Run) -> Result<i32> {
    let (registry, name, tag) = image::parse_reference(&r.reference)?;
    println!("Start running {}/{}:{} ...", registry, name, tag);
    println!("cpus={:?}, memory={:?}", r.cpus, r.memory);

    let image = image::find(&registry, &name, &tag)?.ok_or_else(|| RuntimeError::NotFound {
        registry: registry.clone(),
        name: name.clone(),
        tag: tag.clone(),
    })?;

    println!("initialize required host bridge network");
    if !network::is_bridge_up().await? {
        network::init_bridge().await?;
    }

    let container = container::init(&image, &tag)?;

    println!("initialize container network");
    let gateway: Ipv4Addr = config::bridge_addr().parse()?;
    let peer = network::allocate_peer(&gateway).await?;

    if let Some(publish) = &r.publish {
        let (source, dest) = parse_publish(publish)?;
        network::add_port_forward(&peer.container_ip, source, dest)?;
    }

    let cfg = launcher::LaunchConfig {
        container_id: container.id.clone(),
        root_dir: container.root_dir.clone(),
        netns_name: peer.netns_name.clone(),
        image_cmd: image.cmd.clone(),
        working_dir: image.working_dir.clone(),
        override_argv: r.command,
        mem: r.memory,
        cpus: r.cpus,
    };

    launcher::launch(cfg)
}

fn parse_publish(spec: &str) -> Result<(u16, u16)> {
    let (host, container) = spec
        .split_once(':')
        .ok_or_else(|| anyhow!("--publish expects host:container, got {}", spec))?;
    Ok((host.parse()?, container.parse()?))
}
