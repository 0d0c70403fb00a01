//! Overflow policies from §4.7. Exactly one is active per writer.

use joblet_base::error::{JobletError, Result};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Switch the ring to storing gzipped batches of chunks, trading CPU for headroom.
    Compress,
    /// Write evicted chunks to a spill file on disk, referenced from the ring by sequence range.
    Spill,
    /// Drop every Nth incoming chunk outright; keep a counter.
    Sample,
    /// Drop the newest chunk, increment a counter, and bracket the overflow window with a
    /// control-stream alert chunk.
    Alert,
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        OverflowPolicy::Alert
    }
}

/// Every Nth chunk dropped under `Sample`.
pub const SAMPLE_RATE: u64 = 10;

impl FromStr for OverflowPolicy {
    type Err = JobletError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "compress" => Ok(OverflowPolicy::Compress),
            "spill" => Ok(OverflowPolicy::Spill),
            "sample" => Ok(OverflowPolicy::Sample),
            "alert" => Ok(OverflowPolicy::Alert),
            other => Err(JobletError::validation(format!(
                "unknown overflow policy: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_policies() {
        assert_eq!(OverflowPolicy::from_str("spill").unwrap(), OverflowPolicy::Spill);
        assert!(OverflowPolicy::from_str("bogus").is_err());
    }
}
