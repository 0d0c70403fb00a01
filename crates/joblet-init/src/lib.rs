//! PID-1 init-mode entry point (C9, §4.9). Invoked by `joblet-daemon`'s `main()` when
//! `JOBLET_INIT_MODE` is set; never returns on the success path, since step 10 replaces this
//! process image entirely.

pub mod env;

use camino::Utf8Path;
use joblet_base::job::NetworkMode;
use joblet_base::InitSpec;
use joblet_linux::{LinuxPlatform, Platform};
use slog::{info, Logger};
use std::ffi::CString;
use std::io::Read;
use std::os::fd::{FromRawFd, RawFd};
use std::time::{Duration, Instant};

const NETWORK_READY_TIMEOUT: Duration = Duration::from_secs(10);
const SENTINEL_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Reads `JOBLET_SPEC_FD` / `JOBLET_EXEC_RESULT_FD`, runs every step of §4.9 in order, and execs
/// the job's command. Returns only if setup fails before the point of no return; on success this
/// function's caller never regains control.
pub fn run(logger: Logger) -> ! {
    let exec_result_fd = read_fd_env("JOBLET_EXEC_RESULT_FD");

    match run_inner(&logger, exec_result_fd) {
        Ok(never) => match never {},
        Err(message) => fail(exec_result_fd, &message, 1),
    }
}

fn run_inner(logger: &Logger, exec_result_fd: RawFd) -> Result<std::convert::Infallible, String> {
    let spec_fd = read_fd_env("JOBLET_SPEC_FD");
    let spec = read_spec(spec_fd)?;
    info!(logger, "init mode starting"; "job" => %spec.job_uuid);

    // Opened before `chroot` so the write in step 7 still reaches the right file even though the
    // path is no longer resolvable by then.
    let cgroup_procs_path = spec.cgroup_path.join("cgroup.procs");
    let cgroup_procs = std::fs::OpenOptions::new()
        .write(true)
        .open(&cgroup_procs_path)
        .map_err(|e| format!("opening {cgroup_procs_path}: {e}"))?;

    wait_for_network_ready(&spec)?;

    nix::unistd::setsid().map_err(|e| format!("setsid: {e}"))?;

    let platform = LinuxPlatform;
    platform
        .make_private_recursive(Utf8Path::new("/"))
        .map_err(|e| e.to_string())?;

    platform.chroot(&spec.chroot_root).map_err(|e| e.to_string())?;
    platform.chdir(&spec.workdir).map_err(|e| e.to_string())?;

    platform
        .bind_mount(Utf8Path::new("/proc"), Utf8Path::new("/proc"), false)
        .map_err(|e| e.to_string())?;

    reattach_cgroup(cgroup_procs)?;

    let environment = env::assemble(&spec);

    set_cloexec(spec_fd);
    set_cloexec(exec_result_fd);

    exec_command(&spec, &environment, exec_result_fd)
}

fn read_fd_env(name: &str) -> RawFd {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<RawFd>().ok())
        .unwrap_or_else(|| panic!("{name} not set or not a valid fd number"))
}

fn read_spec(fd: RawFd) -> Result<InitSpec, String> {
    let mut file = unsafe { std::fs::File::from_raw_fd(fd) };
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)
        .map_err(|e| format!("reading job spec from fd {fd}: {e}"))?;
    serde_json::from_slice(&buf).map_err(|e| format!("parsing job spec: {e}"))
}

/// Step 2: blocks on the network-ready sentinel unless the mode needs no host-side plumbing.
fn wait_for_network_ready(spec: &InitSpec) -> Result<(), String> {
    if matches!(spec.network_mode, NetworkMode::Host | NetworkMode::None) {
        return Ok(());
    }
    let sentinel = format!("/tmp/joblet-network-ready-{}", spec.job_uuid);
    let deadline = Instant::now() + NETWORK_READY_TIMEOUT;
    while !std::path::Path::new(&sentinel).exists() {
        if Instant::now() >= deadline {
            return Err(format!(
                "timed out after {:?} waiting for {sentinel}",
                NETWORK_READY_TIMEOUT
            ));
        }
        std::thread::sleep(SENTINEL_POLL_INTERVAL);
    }
    Ok(())
}

fn reattach_cgroup(mut cgroup_procs: std::fs::File) -> Result<(), String> {
    use std::io::Write;
    let pid = nix::unistd::getpid();
    write!(cgroup_procs, "{pid}").map_err(|e| format!("re-attaching to cgroup: {e}"))
}

fn set_cloexec(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
        }
    }
}

/// Step 10. Resolves a bare command name via `PATH` (relative to the now-chrooted filesystem),
/// per §4.9's "if the path contains no `/`, resolve via PATH inside the chroot".
fn exec_command(
    spec: &InitSpec,
    environment: &std::collections::BTreeMap<String, String>,
    exec_result_fd: RawFd,
) -> Result<std::convert::Infallible, String> {
    let resolved = if spec.command.contains('/') {
        spec.command.clone()
    } else {
        resolve_via_path(&spec.command, environment).unwrap_or_else(|| spec.command.clone())
    };

    let program = CString::new(resolved.clone())
        .map_err(|_| "command path contains a NUL byte".to_string())?;
    let mut argv = vec![program.clone()];
    for arg in &spec.args {
        argv.push(CString::new(arg.as_str()).map_err(|_| "argument contains a NUL byte".to_string())?);
    }
    let envp: Vec<CString> = environment
        .iter()
        .map(|(k, v)| CString::new(format!("{k}={v}")).expect("env var contains a NUL byte"))
        .collect();

    match nix::unistd::execvpe(&program, &argv, &envp) {
        Ok(_) => unreachable!("execve only returns on error"),
        Err(errno) => {
            let message = format!("execve {resolved}: {errno}");
            fail(exec_result_fd, &message, 127);
        }
    }
}

fn resolve_via_path(command: &str, environment: &std::collections::BTreeMap<String, String>) -> Option<String> {
    let path = environment.get("PATH")?;
    for dir in path.split(':') {
        let candidate = format!("{dir}/{command}");
        if std::path::Path::new(&candidate).is_file() {
            return Some(candidate);
        }
    }
    None
}

fn fail(exec_result_fd: RawFd, message: &str, code: i32) -> ! {
    unsafe {
        libc::write(
            exec_result_fd,
            message.as_ptr() as *const libc::c_void,
            message.len(),
        );
        libc::_exit(code);
    }
}
