use std::process::exit;

use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::fork;
use nix::unistd::ForkResult;
use nix::Result;

/// Forks and runs `fun` in the child; `fun` returns whether it succeeded,
/// which becomes the child's exit code (`0` on success, `1` otherwise). When
/// `blocking`, the parent waits and reports whether the child exited
/// successfully; callers that need to know the outcome of the forked work
/// must pass `blocking = true`.
pub fn fork_fn(fun: impl FnOnce() -> bool, blocking: bool) -> Result<bool> {
    match unsafe { fork() }? {
        ForkResult::Parent { child, .. } => {
            if blocking {
                let status = waitpid(child, None)?;
                Ok(matches!(status, WaitStatus::Exited(_, 0)))
            } else {
                Ok(true)
            }
        }
        ForkResult::Child => {
            let ok = fun();
            exit(if ok { 0 } else { 1 });
        }
    }
}
