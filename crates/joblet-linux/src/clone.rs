//! `CLONE_NEW*` flag selection for spawning the init-mode child (§4.8 step 6).

use bitflags::bitflags;

bitflags! {
    /// Which new namespaces `spawn_init` should place the child into. `NET` is omitted by the
    /// caller whenever the job's network mode is `host` (§4.8).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CloneFlags: u64 {
        const NEWPID = libc::CLONE_NEWPID as u64;
        const NEWNS  = libc::CLONE_NEWNS as u64;
        const NEWUTS = libc::CLONE_NEWUTS as u64;
        const NEWIPC = libc::CLONE_NEWIPC as u64;
        const NEWNET = libc::CLONE_NEWNET as u64;
    }
}

impl CloneFlags {
    /// The flag set every job gets regardless of network mode, per §4.8 step 6.
    pub fn base() -> Self {
        CloneFlags::NEWPID | CloneFlags::NEWNS | CloneFlags::NEWUTS | CloneFlags::NEWIPC
    }

    pub fn to_nix(self) -> nix::sched::CloneFlags {
        nix::sched::CloneFlags::from_bits_truncate(self.bits() as i32)
    }
}
