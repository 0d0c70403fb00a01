//! The ordered rollback list (§9: "rollback is an explicit ordered teardown list built during
//! setup and drained on any failure"). Pushed in acquisition order, drained in reverse, so a
//! reverse pop walks `KillChild -> TeardownFs -> ReleaseNetwork -> DestroyCgroup` — the same
//! order the normal-completion teardown in §4.8 specifies.

use nix::unistd::Pid;

pub enum TeardownStep {
    DestroyCgroup(joblet_cgroup::Handle),
    ReleaseNetwork(joblet_network::Reservation),
    TeardownFs(joblet_fs::JobFs),
    KillChild(Pid),
}
