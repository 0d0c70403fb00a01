//! Per-network IP address pools (§4.4, §5's "IP pools are per-network, each guarded by one
//! mutex").

use joblet_base::error::{JobletError, ResourceErrorKind, Result};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Mutex;

/// A `/16`-or-narrower IPv4 pool. `joblet0`'s default is `172.20.0.0/16`; custom bridges bring
/// their own CIDR.
pub struct IpPool {
    network: Ipv4Addr,
    prefix_len: u8,
    allocated: Mutex<BTreeSet<Ipv4Addr>>,
}

impl IpPool {
    pub fn new(network: Ipv4Addr, prefix_len: u8) -> Self {
        IpPool {
            network,
            prefix_len,
            allocated: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn default_bridge_pool() -> Self {
        IpPool::new(Ipv4Addr::new(172, 20, 0, 0), 16)
    }

    fn host_count(&self) -> u32 {
        1u32 << (32 - self.prefix_len as u32)
    }

    /// Allocates the lowest unused address in the range, skipping the network and broadcast
    /// addresses and `.1` (reserved for the bridge itself).
    pub fn allocate(&self) -> Result<Ipv4Addr> {
        let base = u32::from(self.network);
        let host_count = self.host_count();
        let mut allocated = self.allocated.lock().unwrap();
        for offset in 2..host_count - 1 {
            let candidate = Ipv4Addr::from(base + offset);
            if !allocated.contains(&candidate) {
                allocated.insert(candidate);
                return Ok(candidate);
            }
        }
        Err(JobletError::resource(
            ResourceErrorKind::IpAlloc,
            "network address pool exhausted",
        ))
    }

    pub fn release(&self, addr: Ipv4Addr) {
        self.allocated.lock().unwrap().remove(&addr);
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_distinct_addresses() {
        let pool = IpPool::new(Ipv4Addr::new(10, 0, 0, 0), 30);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn exhausted_pool_is_ip_alloc_error() {
        // A /30 has 2 usable hosts, minus the gateway leaves exactly 1.
        let pool = IpPool::new(Ipv4Addr::new(10, 0, 0, 0), 30);
        pool.allocate().unwrap();
        let err = pool.allocate().unwrap_err();
        assert!(matches!(
            err,
            JobletError::Resource {
                kind: ResourceErrorKind::IpAlloc,
                ..
            }
        ));
    }

    #[test]
    fn release_makes_address_available_again() {
        let pool = IpPool::new(Ipv4Addr::new(10, 0, 0, 0), 30);
        let a = pool.allocate().unwrap();
        pool.release(a);
        let b = pool.allocate().unwrap();
        assert_eq!(a, b);
    }
}
