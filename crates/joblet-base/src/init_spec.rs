//! The serialized blob passed from the parent to the init-mode child over the spec pipe (§4.8
//! step 6, §4.9 step 1). Deliberately flatter than [`crate::job::JobSpec`]: everything here is
//! already resolved (chroot root, cgroup path, final environment overlays) so the init process
//! does no lookups of its own before `execve`.

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::job::NetworkMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitSpec {
    pub job_uuid: Uuid,
    pub command: String,
    pub args: Vec<String>,
    pub workdir: Utf8PathBuf,
    /// §4.9 step 8's overlay order: runtime env, then job env, then secret env are already
    /// merged into this single map by the time the parent serializes it, since the allowlist
    /// base (`PATH`, `HOME`, `TERM`) is assembled by the init process itself.
    pub env: BTreeMap<String, String>,
    pub chroot_root: Utf8PathBuf,
    pub cgroup_path: Utf8PathBuf,
    pub network_mode: NetworkMode,
}
