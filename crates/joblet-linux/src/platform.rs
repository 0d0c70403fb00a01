//! The `Platform` capability interface (§4.1): the single seam through which every other
//! component touches the kernel. Nothing outside this crate calls `nix`/`libc` mount, chroot, or
//! signal functions directly.

use crate::mount;
use camino::Utf8Path;
use joblet_base::error::{JobletError, ResourceErrorKind, Result};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::time::Instant;

pub trait Platform: Send + Sync {
    fn bind_mount(&self, source: &Utf8Path, target: &Utf8Path, read_only: bool) -> Result<()>;
    fn make_private_recursive(&self, path: &Utf8Path) -> Result<()>;
    fn unmount_lazy(&self, path: &Utf8Path) -> Result<()>;
    fn chroot(&self, path: &Utf8Path) -> Result<()>;
    fn chdir(&self, path: &Utf8Path) -> Result<()>;
    fn create_dir_all(&self, path: &Utf8Path) -> Result<()>;
    fn remove_dir_all(&self, path: &Utf8Path) -> Result<()>;
    fn signal_process_group(&self, pgid: i32, signal: Signal) -> Result<()>;
    fn write_file(&self, path: &Utf8Path, contents: &[u8]) -> Result<()>;
    fn read_file(&self, path: &Utf8Path) -> Result<String>;
    fn monotonic_now(&self) -> Instant;
}

/// The real implementation, backed by actual syscalls. Only ever constructed by the daemon
/// binary and the init-mode entry point.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxPlatform;

impl Platform for LinuxPlatform {
    fn bind_mount(&self, source: &Utf8Path, target: &Utf8Path, read_only: bool) -> Result<()> {
        mount::bind_mount(source.as_std_path(), target.as_std_path(), read_only)
    }

    fn make_private_recursive(&self, path: &Utf8Path) -> Result<()> {
        mount::make_private_recursive(path.as_std_path())
    }

    fn unmount_lazy(&self, path: &Utf8Path) -> Result<()> {
        mount::unmount_lazy(path.as_std_path())
    }

    fn chroot(&self, path: &Utf8Path) -> Result<()> {
        mount::chroot(path.as_std_path())
    }

    fn chdir(&self, path: &Utf8Path) -> Result<()> {
        mount::chdir(path.as_std_path())
    }

    fn create_dir_all(&self, path: &Utf8Path) -> Result<()> {
        std::fs::create_dir_all(path).map_err(JobletError::from)
    }

    fn remove_dir_all(&self, path: &Utf8Path) -> Result<()> {
        match std::fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(JobletError::from(e)),
        }
    }

    fn signal_process_group(&self, pgid: i32, signal: Signal) -> Result<()> {
        killpg(Pid::from_raw(pgid), signal).map_err(|e| {
            JobletError::resource(
                ResourceErrorKind::Mount,
                format!("signal process group {pgid}: {e}"),
            )
        })
    }

    fn write_file(&self, path: &Utf8Path, contents: &[u8]) -> Result<()> {
        std::fs::write(path, contents).map_err(JobletError::from)
    }

    fn read_file(&self, path: &Utf8Path) -> Result<String> {
        std::fs::read_to_string(path).map_err(JobletError::from)
    }

    fn monotonic_now(&self) -> Instant {
        Instant::now()
    }
}
