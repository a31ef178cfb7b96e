//! Launcher: clones a child into new PID/UTS/mount/net namespaces, performs
//! the post-clone setup in the child, execs the resolved command, and waits
//! for it in the parent.
//!
//! Grounded on `commands/run.py`'s `_run_in_process` for the exact setup
//! order (hostname, netns attach, cgroup join, system mounts, chroot,
//! chdir, exec) and on the teacher's `run.rs` for the `nix::sched::clone`
//! call shape. The teacher's clone flags (`CLONE_NEWNS | CLONE_NEWPID |
//! CLONE_NEWUTS | CLONE_NEWIPC`) are corrected to the spec's `CLONE_NEWPID
//! | CLONE_NEWUTS | CLONE_NEWNS | CLONE_NEWNET` — the teacher never
//! actually isolates networking via the clone flag at all, relying
//! entirely on the post-clone `setns` into the fabric-allocated namespace.

use std::ffi::CString;
use std::path::{Path, PathBuf};

use anyhow::Result;
use nix::fcntl::{open, OFlag};
use nix::mount::{mount, MsFlags};
use nix::sched::{clone, setns, CloneFlags};
use nix::sys::signal::Signal;
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chdir, chroot, close, execvp, getpid, sethostname};

use crate::cgroup;
use crate::error::RuntimeError;

const NETNS_DIR: &str = "/var/run/netns";
const STACK_SIZE: usize = 1024 * 1024;

pub struct LaunchConfig {
    pub container_id: String,
    pub root_dir: PathBuf,
    pub netns_name: String,
    pub image_cmd: Vec<String>,
    pub working_dir: Option<String>,
    pub override_argv: Vec<String>,
    pub mem: Option<String>,
    pub cpus: Option<f32>,
}

/// Clones the child, waits for it, and returns its exit code. The parent
/// prints the child's PID and final status, matching §4.5.
pub fn launch(cfg: LaunchConfig) -> Result<i32> {
    let mut stack = vec![0u8; STACK_SIZE];

    let cb = Box::new(move || -> isize {
        match run_child(&cfg) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("{}\n{:?}", e, e);
                1
            }
        }
    });

    let flags = CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWUTS | CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWNET;

    let pid = unsafe { clone(cb, &mut stack, flags, Some(Signal::SIGCHLD as i32)) }?;
    println!("container process ID: {}", pid);

    let status = waitpid(pid, None)?;
    let code = match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
        other => {
            println!("{} exited with unexpected status {:?}", pid, other);
            1
        }
    };
    println!("{} exited with status {}", pid, code);

    Ok(code)
}

/// Runs entirely inside the cloned child. Any error here is fatal: the
/// caller prints the diagnostic and the child process exits non-zero —
/// it must never unwind back across the clone boundary.
fn run_child(cfg: &LaunchConfig) -> Result<()> {
    sethostname(&cfg.container_id)?;

    attach_netns(&cfg.netns_name)?;

    let pid = getpid();
    cgroup::create_cgroup(&cfg.container_id, pid.as_raw() as u32, cfg.mem.clone(), cfg.cpus)?;

    mount_system_dirs(&cfg.root_dir)?;

    chroot(&cfg.root_dir).map_err(|e| RuntimeError::MountFailure(format!("chroot to {}: {}", cfg.root_dir.display(), e)))?;

    match &cfg.working_dir {
        Some(wd) => chdir(Path::new(wd)),
        None => chdir("/"),
    }
    .map_err(|e| RuntimeError::MountFailure(format!("chdir: {}", e)))?;

    let argv = if !cfg.override_argv.is_empty() {
        cfg.override_argv.clone()
    } else {
        cfg.image_cmd.clone()
    };
    if argv.is_empty() {
        return Err(RuntimeError::ExecFailure("no command to execute: override argv and image cmd are both empty".to_string()).into());
    }

    println!("executing {}", argv[0]);
    exec(&argv)
}

/// Discards the blank netns the clone's `CLONE_NEWNET` flag produced and
/// enters the fabric-allocated one by name — the bridge plumbing was set up
/// pointing at that specific namespace.
fn attach_netns(netns_name: &str) -> Result<()> {
    let ns_path = format!("{}/{}", NETNS_DIR, netns_name);
    let fd = open(ns_path.as_str(), OFlag::O_RDONLY | OFlag::O_EXCL, Mode::empty())
        .map_err(|e| RuntimeError::FabricFailure(format!("opening netns {}: {}", ns_path, e)))?;
    setns(fd, CloneFlags::CLONE_NEWNET).map_err(|e| RuntimeError::FabricFailure(format!("setns into {}: {}", ns_path, e)))?;
    close(fd).ok();
    Ok(())
}

/// `proc` at `root_dir/proc`, `sysfs` at `root_dir/sys`. Device nodes and
/// `/dev/pts` are out of scope for this core; `dev/` is still created so a
/// later extension can mount into it.
fn mount_system_dirs(root_dir: &Path) -> Result<()> {
    for name in ["proc", "sys", "dev"] {
        std::fs::create_dir_all(root_dir.join(name))?;
    }

    mount(Some("proc"), &root_dir.join("proc"), Some("proc"), MsFlags::empty(), None::<&str>)
        .map_err(|e| RuntimeError::MountFailure(format!("mounting proc: {}", e)))?;

    mount(Some("sysfs"), &root_dir.join("sys"), Some("sysfs"), MsFlags::empty(), None::<&str>)
        .map_err(|e| RuntimeError::MountFailure(format!("mounting sysfs: {}", e)))?;

    Ok(())
}

/// `execvp`, never returning on success. A failure here is an `ExecFailure`
/// — including an argv element with an embedded NUL byte (reachable from a
/// manifest's `config.Cmd`), which must surface as a clean child-side error
/// rather than unwind across the `clone()` boundary.
fn exec(argv: &[String]) -> Result<()> {
    let cargv: Vec<CString> = argv
        .iter()
        .map(|a| CString::new(a.as_str()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| RuntimeError::ExecFailure(format!("argv element contains an embedded NUL byte: {}", e)))?;
    let program = &cargv[0];

    let err = execvp(program, &cargv).unwrap_err();
    Err(RuntimeError::ExecFailure(format!("{}: {}", argv[0], err)).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_argv_wins_when_non_empty() {
        let cfg = LaunchConfig {
            container_id: "c1".to_string(),
            root_dir: PathBuf::from("/tmp/c1"),
            netns_name: "container-ns-1".to_string(),
            image_cmd: vec!["/bin/sh".to_string()],
            working_dir: None,
            override_argv: vec!["/bin/true".to_string()],
            mem: None,
            cpus: None,
        };

        let resolved = if !cfg.override_argv.is_empty() { cfg.override_argv.clone() } else { cfg.image_cmd.clone() };
        assert_eq!(resolved, vec!["/bin/true".to_string()]);
    }

    #[test]
    fn empty_override_falls_back_to_image_cmd() {
        let cfg = LaunchConfig {
            container_id: "c1".to_string(),
            root_dir: PathBuf::from("/tmp/c1"),
            netns_name: "container-ns-1".to_string(),
            image_cmd: vec!["/bin/sh".to_string(), "-c".to_string(), "echo hi".to_string()],
            working_dir: None,
            override_argv: vec![],
            mem: None,
            cpus: None,
        };

        let resolved = if !cfg.override_argv.is_empty() { cfg.override_argv.clone() } else { cfg.image_cmd.clone() };
        assert_eq!(resolved, vec!["/bin/sh".to_string(), "-c".to_string(), "echo hi".to_string()]);
    }

    #[test]
    fn exec_rejects_argv_with_embedded_nul_instead_of_panicking() {
        let argv = vec!["/bin/sh\0-c".to_string()];
        let result = exec(&argv);
        assert!(result.is_err());
    }
}
