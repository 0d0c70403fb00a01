//! Environment assembly (§4.9 step 8): minimal allowlist overlaid by the spec's already-merged
//! `runtime.yml` / job / secret environment.

use joblet_base::InitSpec;
use std::collections::BTreeMap;

const ALLOWLIST: &[(&str, &str)] = &[("PATH", "/usr/bin:/bin"), ("HOME", "/work"), ("TERM", "dumb")];

pub fn assemble(spec: &InitSpec) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = ALLOWLIST
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    for (key, value) in &spec.env {
        env.insert(key.clone(), value.clone());
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use joblet_base::job::NetworkMode;
    use uuid::Uuid;

    fn base_spec() -> InitSpec {
        InitSpec {
            job_uuid: Uuid::new_v4(),
            command: "/bin/echo".into(),
            args: vec![],
            workdir: Utf8PathBuf::from("/work"),
            env: BTreeMap::new(),
            chroot_root: Utf8PathBuf::from("/opt/joblet/jobs/x"),
            cgroup_path: Utf8PathBuf::from("/sys/fs/cgroup/joblet.slice/joblet.service/job-x"),
            network_mode: NetworkMode::Bridge,
        }
    }

    #[test]
    fn allowlist_defaults_present() {
        let env = assemble(&base_spec());
        assert_eq!(env.get("HOME").unwrap(), "/work");
        assert_eq!(env.get("TERM").unwrap(), "dumb");
    }

    #[test]
    fn job_env_overrides_allowlist() {
        let mut spec = base_spec();
        spec.env.insert("HOME".into(), "/custom".into());
        spec.env.insert("MY_VAR".into(), "1".into());
        let env = assemble(&spec);
        assert_eq!(env.get("HOME").unwrap(), "/custom");
        assert_eq!(env.get("MY_VAR").unwrap(), "1");
    }
}
