//! Platform abstraction over the raw Linux syscalls (component C1 of the design doc): mounts,
//! namespaces, chroot, signal delivery, and cgroup file I/O. No other crate in the workspace
//! calls `nix`/`libc` mount, clone, or signal functions directly; everything goes through
//! [`Platform`].

pub mod clone;
pub mod fake;
pub mod mount;
pub mod platform;
pub mod spawn;

pub use clone::CloneFlags;
pub use fake::FakePlatform;
pub use platform::{LinuxPlatform, Platform};
pub use spawn::{spawn_init, SpawnHandles};
