//! Resource/limit value types and validation (component C5 of the design doc).
//!
//! Validation never has side effects: a [`Limits`] is either accepted whole, or rejected with a
//! `JobletError::Validation` describing every violation found, before anything downstream (the
//! cgroup manager, the network manager) ever sees it.

use crate::error::{JobletError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What `cgroup.max` math needs to know about the host running the daemon.
#[derive(Debug, Clone, Copy)]
pub struct HostInfo {
    pub cpu_cores: u32,
    pub memory_bytes: u64,
    pub gpu_count: u32,
    pub gpu_memory_mb: u64,
}

impl HostInfo {
    pub fn detect() -> Self {
        HostInfo {
            cpu_cores: num_cpus::get() as u32,
            memory_bytes: system_memory_bytes(),
            gpu_count: 0,
            gpu_memory_mb: 0,
        }
    }
}

#[cfg(target_os = "linux")]
fn system_memory_bytes() -> u64 {
    // `sysconf(_SC_PHYS_PAGES) * sysconf(_SC_PAGE_SIZE)` is the standard way to ask the kernel
    // for total RAM without parsing /proc/meminfo.
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if pages <= 0 || page_size <= 0 {
        0
    } else {
        pages as u64 * page_size as u64
    }
}

#[cfg(not(target_os = "linux"))]
fn system_memory_bytes() -> u64 {
    0
}

/// A set of CPU cores, parsed from `"0-3"` (range) or `"1,3,5"` (list) syntax.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuCores(pub Vec<u32>);

impl CpuCores {
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Ok(CpuCores(Vec::new()));
        }
        if let Some((lo, hi)) = spec.split_once('-') {
            let lo: u32 = lo
                .trim()
                .parse()
                .map_err(|_| JobletError::validation(format!("invalid cpu core range: {spec}")))?;
            let hi: u32 = hi
                .trim()
                .parse()
                .map_err(|_| JobletError::validation(format!("invalid cpu core range: {spec}")))?;
            if lo > hi {
                return Err(JobletError::validation(format!(
                    "invalid cpu core range: {spec}"
                )));
            }
            return Ok(CpuCores((lo..=hi).collect()));
        }
        let mut cores = Vec::new();
        for part in spec.split(',') {
            let core: u32 = part.trim().parse().map_err(|_| {
                JobletError::validation(format!("invalid cpu core list: {spec}"))
            })?;
            cores.push(core);
        }
        Ok(CpuCores(cores))
    }

    /// Renders back to the `cpuset.cpus` wire format (e.g. `"0,1,2,3"`).
    pub fn to_cgroup_value(&self) -> String {
        self.0
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for CpuCores {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_cgroup_value())
    }
}

/// Resource limits for a single job. `0` means "unlimited" for every numeric field, per §3.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Limits {
    pub max_cpu_percent: u32,
    pub cpu_cores: Option<CpuCores>,
    pub max_memory_mb: u64,
    pub max_io_bps: u64,
    pub gpu_count: u32,
    pub gpu_memory_mb: u64,
}

const MAX_CPU_PERCENT: u32 = 10_000;
/// §4.5: memory limits are capped at 95% of host RAM.
const MEMORY_CAP_NUMERATOR: u64 = 95;
const MEMORY_CAP_DENOMINATOR: u64 = 100;

impl Limits {
    /// Validates every field, accumulating every violation rather than stopping at the first, so
    /// the caller sees the whole picture in one `ValidationError` (matching the pattern §4.11
    /// specifies for workflow validation).
    pub fn validate(&self, host: &HostInfo) -> Result<()> {
        let mut problems = Vec::new();

        if self.max_cpu_percent > MAX_CPU_PERCENT {
            problems.push(format!(
                "maxCPUPercent {} exceeds maximum {}",
                self.max_cpu_percent, MAX_CPU_PERCENT
            ));
        }

        if let Some(cores) = &self.cpu_cores {
            for &core in &cores.0 {
                if host.cpu_cores > 0 && core >= host.cpu_cores {
                    problems.push(format!(
                        "cpu core {} is not less than host core count {}",
                        core, host.cpu_cores
                    ));
                }
            }
        }

        if self.max_memory_mb > 0 && host.memory_bytes > 0 {
            let cap_mb =
                (host.memory_bytes / (1024 * 1024)) * MEMORY_CAP_NUMERATOR / MEMORY_CAP_DENOMINATOR;
            if self.max_memory_mb > cap_mb {
                problems.push(format!(
                    "maxMemoryMB {} exceeds 95% of host RAM ({} MB)",
                    self.max_memory_mb, cap_mb
                ));
            }
        }

        if self.gpu_count > 0 && host.gpu_count > 0 && self.gpu_count > host.gpu_count {
            problems.push(format!(
                "gpuCount {} exceeds available GPU count {}",
                self.gpu_count, host.gpu_count
            ));
        }

        if host.gpu_memory_mb > 0 {
            let requested = self.gpu_count as u64 * self.gpu_memory_mb;
            if requested > host.gpu_memory_mb {
                problems.push(format!(
                    "gpuCount * gpuMemoryMB ({}) exceeds total available GPU memory ({})",
                    requested, host.gpu_memory_mb
                ));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(JobletError::validation(problems.join("; ")))
        }
    }

    /// `cpu.max` period, per §4.2: always 100ms in microseconds.
    pub const CPU_PERIOD_US: u64 = 100_000;

    /// Computes the `cpu.max` quota in microseconds, or `None` for `"max"` (unlimited).
    pub fn cpu_quota_us(&self) -> Option<u64> {
        if self.max_cpu_percent == 0 {
            None
        } else {
            Some(self.max_cpu_percent as u64 * Self::CPU_PERIOD_US / 100)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> HostInfo {
        HostInfo {
            cpu_cores: 4,
            memory_bytes: 16 * 1024 * 1024 * 1024,
            gpu_count: 0,
            gpu_memory_mb: 0,
        }
    }

    #[test]
    fn parses_range() {
        assert_eq!(CpuCores::parse("0-3").unwrap().0, vec![0, 1, 2, 3]);
    }

    #[test]
    fn parses_list() {
        assert_eq!(CpuCores::parse("1,3,5").unwrap().0, vec![1, 3, 5]);
    }

    #[test]
    fn rejects_core_past_host_count() {
        let limits = Limits {
            cpu_cores: Some(CpuCores(vec![7])),
            ..Default::default()
        };
        assert!(limits.validate(&host()).is_err());
    }

    #[test]
    fn hundred_percent_is_one_full_core_quota() {
        let limits = Limits {
            max_cpu_percent: 100,
            ..Default::default()
        };
        assert_eq!(limits.cpu_quota_us(), Some(100_000));
    }

    #[test]
    fn zero_percent_is_unlimited() {
        let limits = Limits::default();
        assert_eq!(limits.cpu_quota_us(), None);
    }

    #[test]
    fn memory_cap_is_enforced() {
        let limits = Limits {
            max_memory_mb: 16_000_000,
            ..Default::default()
        };
        assert!(limits.validate(&host()).is_err());
    }

    #[test]
    fn gpu_memory_product_is_checked() {
        let host = HostInfo {
            gpu_count: 2,
            gpu_memory_mb: 8_000,
            ..host()
        };
        let limits = Limits {
            gpu_count: 2,
            gpu_memory_mb: 5_000,
            ..Default::default()
        };
        assert!(limits.validate(&host).is_err());
    }
}
