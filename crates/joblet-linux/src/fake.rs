//! An in-memory `Platform` test double, so `joblet-fs`/`joblet-cgroup`/`joblet-network` can be
//! unit-tested without a container or root privileges. Real file I/O still goes to the real
//! filesystem (tests use `tempfile` for that) but mounts, chroot, and signals are merely recorded.

use crate::Platform;
use camino::{Utf8Path, Utf8PathBuf};
use joblet_base::error::Result;
use nix::sys::signal::Signal;
use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCall {
    BindMount {
        source: Utf8PathBuf,
        target: Utf8PathBuf,
        read_only: bool,
    },
    MakePrivateRecursive(Utf8PathBuf),
    UnmountLazy(Utf8PathBuf),
    Chroot(Utf8PathBuf),
    Chdir(Utf8PathBuf),
    Signal { pgid: i32, signal: Signal },
}

#[derive(Default)]
pub struct FakePlatform {
    pub calls: Mutex<Vec<RecordedCall>>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl Platform for FakePlatform {
    fn bind_mount(&self, source: &Utf8Path, target: &Utf8Path, read_only: bool) -> Result<()> {
        self.calls.lock().unwrap().push(RecordedCall::BindMount {
            source: source.to_owned(),
            target: target.to_owned(),
            read_only,
        });
        std::fs::create_dir_all(target).ok();
        Ok(())
    }

    fn make_private_recursive(&self, path: &Utf8Path) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(RecordedCall::MakePrivateRecursive(path.to_owned()));
        Ok(())
    }

    fn unmount_lazy(&self, path: &Utf8Path) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(RecordedCall::UnmountLazy(path.to_owned()));
        Ok(())
    }

    fn chroot(&self, path: &Utf8Path) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(RecordedCall::Chroot(path.to_owned()));
        Ok(())
    }

    fn chdir(&self, path: &Utf8Path) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(RecordedCall::Chdir(path.to_owned()));
        Ok(())
    }

    fn create_dir_all(&self, path: &Utf8Path) -> Result<()> {
        std::fs::create_dir_all(path).map_err(joblet_base::error::JobletError::from)
    }

    fn remove_dir_all(&self, path: &Utf8Path) -> Result<()> {
        match std::fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(joblet_base::error::JobletError::from(e)),
        }
    }

    fn signal_process_group(&self, pgid: i32, signal: Signal) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(RecordedCall::Signal { pgid, signal });
        Ok(())
    }

    fn write_file(&self, path: &Utf8Path, contents: &[u8]) -> Result<()> {
        std::fs::write(path, contents).map_err(joblet_base::error::JobletError::from)
    }

    fn read_file(&self, path: &Utf8Path) -> Result<String> {
        std::fs::read_to_string(path).map_err(joblet_base::error::JobletError::from)
    }

    fn monotonic_now(&self) -> Instant {
        Instant::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_bind_mounts() {
        let platform = FakePlatform::new();
        let tmp = tempfile::tempdir().unwrap();
        let target = Utf8PathBuf::from_path_buf(tmp.path().join("target")).unwrap();
        platform
            .bind_mount(Utf8Path::new("/src"), &target, true)
            .unwrap();
        assert_eq!(
            platform.calls(),
            vec![RecordedCall::BindMount {
                source: Utf8PathBuf::from("/src"),
                target: target.clone(),
                read_only: true,
            }]
        );
    }
}
