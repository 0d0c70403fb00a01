//! `runtime.yml` manifest parsing (consumed by C3, per §6 of the design doc).

use camino::{Utf8Path, Utf8PathBuf};
use joblet_base::error::{JobletError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeMount {
    pub source: Utf8PathBuf,
    pub target: Utf8PathBuf,
    #[serde(default)]
    pub readonly: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub mounts: Vec<RuntimeMount>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl RuntimeManifest {
    pub fn parse(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| JobletError::validation(format!("invalid runtime.yml: {e}")))
    }

    pub fn load(runtime_dir: &Utf8Path) -> Result<Self> {
        let manifest_path = runtime_dir.join("runtime.yml");
        let text = std::fs::read_to_string(&manifest_path)
            .map_err(|e| JobletError::validation(format!("reading {manifest_path}: {e}")))?;
        Self::parse(&text)
    }

    /// Resolves every mount's `source` against `runtime_dir`, rejecting any that would escape it
    /// (§4.3: "runtime mount sources must lie strictly inside the runtime directory").
    pub fn resolved_mounts(&self, runtime_dir: &Utf8Path) -> Result<Vec<(Utf8PathBuf, Utf8PathBuf, bool)>> {
        self.mounts
            .iter()
            .map(|m| {
                let resolved = resolve_within(runtime_dir, &m.source)?;
                Ok((resolved, m.target.clone(), m.readonly))
            })
            .collect()
    }
}

/// Lexically resolves `relative` against `base` and checks the result still lies inside `base`,
/// without requiring the path to exist on disk (so this also works against a `runtime_dir` that
/// is assembled fresh in tests).
pub fn resolve_within(base: &Utf8Path, relative: &Utf8Path) -> Result<Utf8PathBuf> {
    use camino::Utf8Component;

    let mut stack: Vec<Utf8Component> = Vec::new();
    for component in base.components().chain(relative.components()) {
        match component {
            Utf8Component::ParentDir => {
                if stack.pop().is_none() {
                    return Err(JobletError::isolation(format!(
                        "path {relative} escapes base directory {base}"
                    )));
                }
            }
            Utf8Component::CurDir => {}
            other => stack.push(other),
        }
    }
    let mut resolved = Utf8PathBuf::new();
    for component in &stack {
        resolved.push(component.as_str());
    }

    if !resolved.starts_with(base) {
        return Err(JobletError::isolation(format!(
            "path {relative} escapes base directory {base}"
        )));
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_manifest() {
        let yaml = "name: python\nversion: \"3.11\"\nmounts:\n  - source: isolated\n    target: /usr/lib/python\n    readonly: true\nenvironment:\n  PYTHONHOME: /usr/lib/python\n";
        let manifest = RuntimeManifest::parse(yaml).unwrap();
        assert_eq!(manifest.name, "python");
        assert_eq!(manifest.mounts.len(), 1);
        assert!(manifest.mounts[0].readonly);
    }

    #[test]
    fn rejects_source_escaping_runtime_dir() {
        let base = Utf8Path::new("/opt/joblet/runtimes/python");
        let err = resolve_within(base, Utf8Path::new("../../etc")).unwrap_err();
        assert!(matches!(err, JobletError::Isolation(_)));
    }

    #[test]
    fn accepts_source_inside_runtime_dir() {
        let base = Utf8Path::new("/opt/joblet/runtimes/python");
        let resolved = resolve_within(base, Utf8Path::new("isolated/lib")).unwrap();
        assert_eq!(resolved, Utf8PathBuf::from("/opt/joblet/runtimes/python/isolated/lib"));
    }
}
