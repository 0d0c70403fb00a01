//! Spawning the init-mode child (§4.8 step 6 / §4.9).
//!
//! The parent creates three pipes before cloning: one for the child's merged stdout/stderr, one
//! to pass the serialized job spec down to the child, and one the child can use to report an
//! `execve` failure before the process image is replaced (grounded on the `meticulous-worker`
//! executor's own exec-result pipe, which exists for exactly this reason — once `execve`
//! succeeds there is no longer any process to report through, so a failure has to be signaled
//! before that point).
//!
//! The clone callback runs in the child's (copy-on-write) address space without `CLONE_VM`, so
//! capturing owned values into the closure is safe, unlike a bare `clone(2)` with shared memory.

use crate::clone::CloneFlags;
use joblet_base::error::{JobletError, ResourceErrorKind, Result};
use nix::sched::clone;
use nix::sys::signal::Signal;
use nix::unistd::{self, close, dup2, pipe, Pid};
use std::ffi::CString;
use std::os::fd::{IntoRawFd, OwnedFd, RawFd};

pub struct SpawnHandles {
    pub pid: Pid,
    /// Read end of the child's merged stdout/stderr pipe, owned by the parent.
    pub output_read: OwnedFd,
    /// Write end of the job-spec pipe; the parent writes the serialized spec and then drops this.
    pub spec_write: OwnedFd,
    /// Read end of the exec-result pipe. Empty (immediate EOF) on a successful exec; otherwise
    /// contains a UTF-8 error message.
    pub exec_result_read: OwnedFd,
}

fn to_resource_error(op: &str, err: nix::Error) -> JobletError {
    JobletError::resource(ResourceErrorKind::Mount, format!("{op}: {err}"))
}

/// Clones a child into `flags`' namespaces, which immediately `execve`s `reexec_path` (expected
/// to be `/proc/self/exe`) with `JOBLET_INIT_MODE=1` set, plus the fd numbers of the spec-read
/// and exec-result-write pipe ends so the init-mode entry point (`joblet-init`) can find them.
pub fn spawn_init(flags: CloneFlags, reexec_path: &str) -> Result<SpawnHandles> {
    let (output_read, output_write) = pipe().map_err(|e| to_resource_error("output pipe", e))?;
    let (spec_read, spec_write) = pipe().map_err(|e| to_resource_error("spec pipe", e))?;
    let (exec_result_read, exec_result_write) =
        pipe().map_err(|e| to_resource_error("exec-result pipe", e))?;

    let program = CString::new(reexec_path)
        .map_err(|_| JobletError::validation("reexec path contains a NUL byte"))?;

    let spec_read_raw = spec_read.into_raw_fd();
    let exec_result_write_raw = exec_result_write.into_raw_fd();
    let output_write_raw = output_write.into_raw_fd();

    let mut child_fn = {
        let program = program.clone();
        move || -> isize {
            // WARNING: between here and `execve`, only async-signal-safe operations are
            // permitted: no allocation beyond what was already prepared above, no locks.
            let _ = dup2(output_write_raw, libc::STDOUT_FILENO);
            let _ = dup2(output_write_raw, libc::STDERR_FILENO);
            if output_write_raw != libc::STDOUT_FILENO && output_write_raw != libc::STDERR_FILENO {
                let _ = close(output_write_raw);
            }
            clear_cloexec(spec_read_raw);
            clear_cloexec(exec_result_write_raw);

            let env_spec = CString::new(format!("JOBLET_SPEC_FD={spec_read_raw}")).unwrap();
            let env_result = CString::new(format!(
                "JOBLET_EXEC_RESULT_FD={exec_result_write_raw}"
            ))
            .unwrap();
            let env_mode = CString::new("JOBLET_INIT_MODE=1").unwrap();
            let argv = [program.clone()];
            let envp = [env_mode, env_spec, env_result];

            match unistd::execve(&program, &argv, &envp) {
                Ok(_) => unreachable!("execve only returns on error"),
                Err(errno) => {
                    let msg = format!("execve failed: {errno}");
                    unsafe {
                        libc::write(
                            exec_result_write_raw,
                            msg.as_ptr() as *const libc::c_void,
                            msg.len(),
                        );
                    }
                    unsafe { libc::_exit(127) }
                }
            }
        }
    };

    const STACK_SIZE: usize = 1024 * 1024;
    let mut stack = vec![0u8; STACK_SIZE];
    let pid = unsafe {
        clone(
            Box::new(&mut child_fn),
            &mut stack,
            flags.to_nix(),
            Some(libc::SIGCHLD),
        )
    }
    .map_err(|e| to_resource_error("clone", e))?;

    // Parent side: close the ends the child owns now.
    let _ = close(spec_read_raw);
    let _ = close(exec_result_write_raw);
    let _ = close(output_write_raw);

    Ok(SpawnHandles {
        pid,
        output_read,
        spec_write,
        exec_result_read,
    })
}

fn clear_cloexec(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC);
        }
    }
}

/// Sends `signal` to the process group led by `pid`, the first half of the stop protocol in
/// §4.8 (SIGTERM, then SIGKILL after the timer fires).
pub fn signal_process_group(pid: Pid, signal: Signal) -> Result<()> {
    nix::sys::signal::killpg(pid, signal).map_err(|e| to_resource_error("killpg", e))
}
