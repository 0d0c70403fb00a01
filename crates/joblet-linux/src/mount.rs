//! Mount-table operations: bind mounts, private propagation, lazy unmount, chroot/pivot_root
//! (§4.1).

use bitflags::bitflags;
use joblet_base::error::{JobletError, ResourceErrorKind, Result};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use std::path::Path;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MountFlags: u32 {
        const RDONLY  = 1 << 0;
        const BIND    = 1 << 1;
        const REC     = 1 << 2;
        const PRIVATE = 1 << 3;
    }
}

impl MountFlags {
    fn to_ms_flags(self) -> MsFlags {
        let mut flags = MsFlags::empty();
        if self.contains(MountFlags::RDONLY) {
            flags |= MsFlags::MS_RDONLY;
        }
        if self.contains(MountFlags::BIND) {
            flags |= MsFlags::MS_BIND;
        }
        if self.contains(MountFlags::REC) {
            flags |= MsFlags::MS_REC;
        }
        if self.contains(MountFlags::PRIVATE) {
            flags |= MsFlags::MS_PRIVATE;
        }
        flags
    }
}

fn to_resource_error(op: &str, err: nix::Error) -> JobletError {
    JobletError::resource(ResourceErrorKind::Mount, format!("{op}: {err}"))
}

/// Bind-mounts `source` at `target`. The kernel ignores `MS_RDONLY` on the initial `MS_BIND`
/// call, so a read-only bind mount is always two syscalls: bind, then remount read-only.
pub fn bind_mount(source: &Path, target: &Path, read_only: bool) -> Result<()> {
    mount(
        Some(source),
        target,
        None::<&str>,
        MountFlags::BIND.to_ms_flags(),
        None::<&str>,
    )
    .map_err(|e| to_resource_error("bind mount", e))?;
    if read_only {
        mount(
            Some(source),
            target,
            None::<&str>,
            MountFlags::BIND.to_ms_flags() | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|e| to_resource_error("remount read-only", e))?;
    }
    Ok(())
}

/// Makes every mount under `path` propagate-private, recursively, so a job can never leak mount
/// events to the host (§4.3).
pub fn make_private_recursive(path: &Path) -> Result<()> {
    mount(
        None::<&str>,
        path,
        None::<&str>,
        MountFlags::PRIVATE.to_ms_flags() | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| to_resource_error("make private", e))
}

/// Lazily unmounts (`MNT_DETACH`): the mount disappears from the namespace's view immediately,
/// and the kernel cleans it up once nothing still references it. Tolerant of "already unmounted".
pub fn unmount_lazy(path: &Path) -> Result<()> {
    match umount2(path, MntFlags::MNT_DETACH) {
        Ok(()) => Ok(()),
        Err(nix::Error::EINVAL) => Ok(()),
        Err(e) => Err(to_resource_error("lazy unmount", e)),
    }
}

pub fn chroot(path: &Path) -> Result<()> {
    nix::unistd::chroot(path).map_err(|e| {
        JobletError::resource(ResourceErrorKind::Chroot, format!("chroot {path:?}: {e}"))
    })
}

pub fn chdir(path: &Path) -> Result<()> {
    nix::unistd::chdir(path).map_err(|e| {
        JobletError::resource(ResourceErrorKind::Chroot, format!("chdir {path:?}: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_ms_flags_combines_bits() {
        let flags = MountFlags::RDONLY | MountFlags::BIND | MountFlags::REC;
        let ms = flags.to_ms_flags();
        assert!(ms.contains(MsFlags::MS_RDONLY));
        assert!(ms.contains(MsFlags::MS_BIND));
        assert!(ms.contains(MsFlags::MS_REC));
        assert!(!ms.contains(MsFlags::MS_PRIVATE));
    }
}
