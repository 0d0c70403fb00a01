//! Chroot assembly (§4.3). Two flavors: `standard`, for ordinary jobs, and `runtime-build`, used
//! only by the privileged jobs that build runtime trees themselves.

use crate::runtime::RuntimeManifest;
use camino::{Utf8Path, Utf8PathBuf};
use joblet_base::error::{JobletError, Result};
use joblet_base::job::{JobSpec, Upload};
use joblet_linux::Platform;
use slog::{info, o, warn, Logger};
use std::sync::Arc;
use uuid::Uuid;

/// The minimal base filesystem every standard job's chroot gets, per §4.3.
const BASE_DIRS: &[&str] = &[
    "bin", "lib", "lib64", "usr", "etc/ssl", "etc/ca-certificates", "proc", "tmp", "work",
];

/// Device nodes bind-mounted from the host rather than `mknod`-created, since bind-mounting an
/// existing node needs no extra capability beyond `CAP_SYS_ADMIN` (which the daemon already
/// holds to do every other mount here).
const BASE_DEV_NODES: &[&str] = &["null", "zero", "random", "urandom", "tty"];

/// The one directory name that must never appear among a runtime-build job's mounts (§4.3's
/// `/opt/joblet` exclusion invariant).
const EXCLUDED_TOP_LEVEL_ENTRY: &str = "joblet";

#[derive(Debug, Clone)]
pub struct JobFs {
    pub job_uuid: Uuid,
    pub root: Utf8PathBuf,
}

pub struct FsIsolator {
    /// `/opt/joblet` — parent of `jobs/`, `runtimes/`, `volumes/`.
    state_root: Utf8PathBuf,
    platform: Arc<dyn Platform>,
    logger: Logger,
}

impl FsIsolator {
    pub fn new(state_root: Utf8PathBuf, platform: Arc<dyn Platform>, logger: Logger) -> Self {
        FsIsolator {
            state_root,
            platform,
            logger,
        }
    }

    fn jobs_root(&self) -> Utf8PathBuf {
        self.state_root.join("jobs")
    }

    pub fn runtimes_root(&self) -> Utf8PathBuf {
        self.state_root.join("runtimes")
    }

    pub fn volumes_root(&self) -> Utf8PathBuf {
        self.state_root.join("volumes")
    }

    /// Assembles a standard job's chroot: base tree, optional runtime mounts, named volumes,
    /// unpacked uploads. Idempotent: re-running against an already-prepared root is a no-op for
    /// directories that already exist.
    pub fn prepare(&self, job_uuid: Uuid, spec: &JobSpec) -> Result<JobFs> {
        let root = self.jobs_root().join(job_uuid.to_string());
        self.platform.create_dir_all(&root)?;

        for dir in BASE_DIRS {
            self.platform.create_dir_all(&root.join(dir))?;
        }
        for node in BASE_DEV_NODES {
            let target = root.join("dev").join(node);
            self.platform.create_dir_all(target.parent().unwrap())?;
            self.touch(&target)?;
            let source = Utf8PathBuf::from("/dev").join(node);
            self.platform.bind_mount(&source, &target, false)?;
        }
        let resolv_target = root.join("etc/resolv.conf");
        self.touch(&resolv_target)?;
        self.platform
            .bind_mount(Utf8Path::new("/etc/resolv.conf"), &resolv_target, true)?;

        if let Some(runtime_name) = &spec.runtime {
            self.mount_runtime(&root, runtime_name)?;
        }

        self.mount_volumes(&root, &spec.volumes)?;
        self.unpack_uploads(&root, &spec.uploads)?;

        let work_dir = root.join("work");
        self.platform.create_dir_all(&work_dir)?;

        let job_tmp = root.join(format!("tmp/job-{job_uuid}"));
        self.platform.create_dir_all(&job_tmp)?;

        info!(self.logger, "prepared job filesystem"; "job" => %job_uuid, "root" => %root);
        Ok(JobFs { job_uuid, root })
    }

    fn touch(&self, path: &Utf8Path) -> Result<()> {
        if !path.exists() {
            self.platform.write_file(path, b"")?;
        }
        Ok(())
    }

    fn mount_runtime(&self, root: &Utf8Path, runtime_name: &str) -> Result<()> {
        let runtime_dir = self.runtimes_root().join(runtime_name);
        let manifest = RuntimeManifest::load(&runtime_dir)?;
        for (source, target, readonly) in manifest.resolved_mounts(&runtime_dir)? {
            let target_in_root = join_absolute(root, &target);
            self.platform.create_dir_all(&target_in_root)?;
            self.platform.bind_mount(&source, &target_in_root, readonly)?;
        }
        Ok(())
    }

    fn mount_volumes(&self, root: &Utf8Path, volumes: &[String]) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for name in volumes {
            if !seen.insert(name.clone()) {
                warn!(self.logger, "duplicate volume name ignored"; "volume" => name);
                continue;
            }
            let source = self.volumes_root().join(name);
            let target = root.join("volumes").join(name);
            self.platform.create_dir_all(&target)?;
            self.platform.bind_mount(&source, &target, false)?;
        }
        Ok(())
    }

    fn unpack_uploads(&self, root: &Utf8Path, uploads: &[Upload]) -> Result<()> {
        let work_dir = root.join("work");
        // Last-writer-wins when two uploads target the same path, per the Open Question decision
        // recorded in DESIGN.md.
        for upload in uploads {
            if upload
                .relative_path
                .components()
                .any(|c| c.as_str() == "..")
            {
                return Err(JobletError::validation(format!(
                    "upload path escapes job root: {}",
                    upload.relative_path
                )));
            }
            let target = work_dir.join(&upload.relative_path);
            if let Some(parent) = target.parent() {
                self.platform.create_dir_all(parent)?;
            }
            self.platform.write_file(&target, &upload.bytes)?;
        }
        Ok(())
    }

    /// Remounts `/proc` inside the new PID namespace, called by init mode after `chroot` (§4.3).
    pub fn remount_proc(&self, job_fs: &JobFs) -> Result<()> {
        let proc_path = job_fs.root.join("proc");
        self.platform.create_dir_all(&proc_path)?;
        self.platform
            .bind_mount(Utf8Path::new("/proc"), &proc_path, false)
    }

    /// Lazily unmounts everything under the job's root, then recursively removes it. Tolerant of
    /// missing files (§4.3).
    pub fn teardown(&self, job_fs: &JobFs) {
        self.platform.unmount_lazy(&job_fs.root).ok();
        if let Err(err) = self.platform.remove_dir_all(&job_fs.root) {
            warn!(self.logger, "failed to remove job root"; "job" => %job_fs.job_uuid, "error" => %err);
        }
    }

    /// Assembles the build tree for a runtime-installer job: the host's root bind-mounted
    /// read-write, except the `/opt/joblet` top-level entry, which must never be mounted
    /// (§4.3/property 5 in §8).
    pub fn prepare_runtime_build(&self, job_uuid: Uuid, host_root: &Utf8Path) -> Result<JobFs> {
        let root = self.jobs_root().join(format!("{job_uuid}-build"));
        self.platform.create_dir_all(&root)?;

        let entries = std::fs::read_dir(host_root).map_err(|e| {
            JobletError::isolation(format!("enumerating host root {host_root}: {e}"))
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| JobletError::isolation(e.to_string()))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name == EXCLUDED_TOP_LEVEL_ENTRY {
                // Fatal configuration error if anything upstream already tried to include it;
                // skipping it here is the enforcement point, and we still surface the skip in
                // the log so operators can see the invariant held.
                info!(self.logger, "skipped excluded top-level entry"; "entry" => %name);
                continue;
            }
            let source = host_root.join(&*name);
            let target = root.join(&*name);
            self.platform.create_dir_all(&target)?;
            self.platform.bind_mount(&source, &target, false)?;
        }

        if root.join(EXCLUDED_TOP_LEVEL_ENTRY).exists() {
            return Err(JobletError::isolation(
                "/opt/joblet must never be mounted into a runtime-build chroot",
            ));
        }

        Ok(JobFs { job_uuid, root })
    }
}

/// Joins an absolute-looking manifest `target` (e.g. `/usr/lib/python`) onto `root`, stripping
/// the leading `/` so `Utf8Path::join` doesn't treat it as replacing `root` entirely.
fn join_absolute(root: &Utf8Path, target: &Utf8Path) -> Utf8PathBuf {
    let stripped = target.as_str().trim_start_matches('/');
    root.join(stripped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use joblet_linux::FakePlatform;

    fn isolator() -> (FsIsolator, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let state_root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        let platform = Arc::new(FakePlatform::new());
        let logger = Logger::root(slog::Discard, o!());
        (FsIsolator::new(state_root, platform, logger), tmp)
    }

    #[test]
    fn prepare_creates_base_tree() {
        let (iso, _tmp) = isolator();
        let spec = JobSpec {
            command: "/bin/echo".into(),
            ..Default::default()
        };
        let job_fs = iso.prepare(Uuid::new_v4(), &spec).unwrap();
        for dir in BASE_DIRS {
            assert!(job_fs.root.join(dir).exists(), "missing {dir}");
        }
    }

    #[test]
    fn upload_path_with_dotdot_is_rejected() {
        let (iso, _tmp) = isolator();
        let spec = JobSpec {
            command: "/bin/echo".into(),
            uploads: vec![Upload {
                relative_path: "../../etc/passwd".into(),
                bytes: b"x".to_vec(),
            }],
            ..Default::default()
        };
        let err = iso.prepare(Uuid::new_v4(), &spec).unwrap_err();
        assert!(matches!(err, JobletError::Validation(_)));
    }

    #[test]
    fn duplicate_volume_is_ignored_not_fatal() {
        let (iso, _tmp) = isolator();
        let spec = JobSpec {
            command: "/bin/echo".into(),
            volumes: vec!["data".into(), "data".into()],
            ..Default::default()
        };
        iso.prepare(Uuid::new_v4(), &spec).unwrap();
    }

    #[test]
    fn runtime_build_excludes_opt_joblet() {
        let (iso, tmp) = isolator();
        let host_root = tmp.path().join("host");
        std::fs::create_dir_all(host_root.join("joblet")).unwrap();
        std::fs::create_dir_all(host_root.join("usr")).unwrap();
        let host_root = Utf8PathBuf::from_path_buf(host_root).unwrap();
        let job_fs = iso
            .prepare_runtime_build(Uuid::new_v4(), &host_root)
            .unwrap();
        assert!(!job_fs.root.join("joblet").exists());
        assert!(job_fs.root.join("usr").exists());
    }
}
