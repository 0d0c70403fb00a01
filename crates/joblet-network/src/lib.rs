//! Network namespace / bridge manager (C4, §4.4).
//!
//! Reservation is split in two because the veth peer can only move into the job's network
//! namespace once that namespace exists, which means once the init process has been cloned and
//! its PID is known — one step later than `Reserve` in the setup ordering. `reserve` does
//! everything that doesn't need a PID (IP allocation, veth pair creation, host-side bridge
//! attachment); `attach_to_pid` does the rest and writes the sentinel.

pub mod pool;
pub mod veth;

use camino::Utf8PathBuf;
use joblet_base::error::Result;
use joblet_base::job::NetworkMode;
use pool::IpPool;
use slog::{info, Logger};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use uuid::Uuid;
use veth::VethControl;

#[derive(Debug, Clone)]
pub struct Reservation {
    pub job_uuid: Uuid,
    pub mode: NetworkMode,
    pub address: Option<Ipv4Addr>,
    pub host_veth: Option<String>,
    pub peer_veth: Option<String>,
    pub sentinel_path: Utf8PathBuf,
    /// `None` until `attach_to_pid` has run (or immediately for modes that need no veth at all).
    attached: bool,
}

fn sentinel_path(job_uuid: Uuid) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("/tmp/joblet-network-ready-{job_uuid}"))
}

fn veth_names(job_uuid: Uuid) -> (String, String) {
    let short = job_uuid.simple().to_string();
    (format!("jh{}", &short[..10]), format!("jp{}", &short[..10]))
}

struct BridgeNetwork {
    bridge_name: String,
    pool: IpPool,
}

/// Owns every bridge's IP pool and the veth control seam. One process-wide instance, shared via
/// `Arc` the same way `joblet-store::JobStore` is.
pub struct NetworkManager {
    veth: Box<dyn VethControl>,
    networks: Mutex<HashMap<String, BridgeNetwork>>,
    logger: Logger,
}

impl NetworkManager {
    pub fn new(veth: Box<dyn VethControl>, logger: Logger) -> Self {
        let mut networks = HashMap::new();
        networks.insert(
            "joblet0".to_string(),
            BridgeNetwork {
                bridge_name: "joblet0".to_string(),
                pool: IpPool::default_bridge_pool(),
            },
        );
        NetworkManager {
            veth,
            networks: Mutex::new(networks),
            logger,
        }
    }

    /// Whether `name` resolves to a registered bridge network. Used by workflow validation to
    /// reject `network:` references before any job is created.
    pub fn known_network(&self, name: &str) -> bool {
        self.networks.lock().unwrap().contains_key(name)
    }

    /// Registers a custom bridge network with its own CIDR, so `NetworkMode::Custom(name)` can
    /// resolve against it later.
    pub fn register_custom_network(&self, name: &str, network: Ipv4Addr, prefix_len: u8) {
        self.networks.lock().unwrap().insert(
            name.to_string(),
            BridgeNetwork {
                bridge_name: name.to_string(),
                pool: IpPool::new(network, prefix_len),
            },
        );
    }

    /// Stage A step 3: allocates an address and creates the veth pair, but does not yet touch any
    /// PID namespace. `host`/`none`/`isolated` need none of this and the sentinel is written
    /// immediately, since nothing here depends on the child's PID for those modes.
    pub fn reserve(&self, job_uuid: Uuid, mode: &NetworkMode) -> Result<Reservation> {
        match mode {
            NetworkMode::Host | NetworkMode::None | NetworkMode::Isolated => {
                let sentinel = sentinel_path(job_uuid);
                std::fs::write(&sentinel, b"").ok();
                Ok(Reservation {
                    job_uuid,
                    mode: mode.clone(),
                    address: None,
                    host_veth: None,
                    peer_veth: None,
                    sentinel_path: sentinel,
                    attached: true,
                })
            }
            NetworkMode::Bridge => self.reserve_bridged(job_uuid, "joblet0"),
            NetworkMode::Custom(name) => self.reserve_bridged(job_uuid, name),
        }
    }

    fn reserve_bridged(&self, job_uuid: Uuid, network_name: &str) -> Result<Reservation> {
        let (address, gateway, prefix_len, bridge_name) = {
            let networks = self.networks.lock().unwrap();
            let net = networks.get(network_name).ok_or_else(|| {
                joblet_base::error::JobletError::validation(format!(
                    "unknown network {network_name}"
                ))
            })?;
            let address = net.pool.allocate()?;
            (address, net.pool.gateway(), net.pool.prefix_len(), net.bridge_name.clone())
        };

        let (host_veth, peer_veth) = veth_names(job_uuid);
        self.veth.ensure_bridge(&bridge_name, gateway, prefix_len)?;
        self.veth.create_veth_pair(&host_veth, &peer_veth)?;
        self.veth.attach_to_bridge(&bridge_name, &host_veth)?;
        self.veth.set_up(&host_veth, None)?;

        info!(self.logger, "allocated network reservation"; "job" => %job_uuid, "network" => network_name, "address" => %address);

        Ok(Reservation {
            job_uuid,
            mode: if network_name == "joblet0" {
                NetworkMode::Bridge
            } else {
                NetworkMode::Custom(network_name.to_string())
            },
            address: Some(address),
            host_veth: Some(host_veth),
            peer_veth: Some(peer_veth),
            sentinel_path: sentinel_path(job_uuid),
            attached: false,
        })
    }

    /// Stage A step 8: moves the veth peer into the now-known child's netns, assigns its
    /// address and default route, and only then writes the sentinel the init process is blocked
    /// on (§4.4's ordering requirement).
    pub fn attach_to_pid(&self, reservation: &mut Reservation, child_pid: i32) -> Result<()> {
        if reservation.attached {
            return Ok(());
        }
        let (Some(peer_veth), Some(address)) = (&reservation.peer_veth, reservation.address) else {
            reservation.attached = true;
            std::fs::write(&reservation.sentinel_path, b"").ok();
            return Ok(());
        };
        let network_name = match &reservation.mode {
            NetworkMode::Bridge => "joblet0",
            NetworkMode::Custom(name) => name.as_str(),
            _ => unreachable!("bridged reservation always carries Bridge or Custom"),
        };
        let (gateway, prefix_len) = {
            let networks = self.networks.lock().unwrap();
            let net = networks
                .get(network_name)
                .expect("network present at reserve time");
            (net.pool.gateway(), net.pool.prefix_len())
        };

        self.veth.move_to_netns(peer_veth, child_pid)?;
        self.veth.set_up(peer_veth, Some(child_pid))?;
        self.veth.assign_address(peer_veth, address, prefix_len, child_pid)?;
        self.veth.set_default_route(gateway, child_pid)?;

        std::fs::write(&reservation.sentinel_path, b"").ok();
        reservation.attached = true;
        info!(self.logger, "network reservation attached to pid"; "job" => %reservation.job_uuid, "pid" => child_pid);
        Ok(())
    }

    pub fn release(&self, reservation: Reservation) {
        std::fs::remove_file(&reservation.sentinel_path).ok();
        if let Some(host_veth) = &reservation.host_veth {
            self.veth.delete_link(host_veth).ok();
        }
        if let Some(address) = reservation.address {
            let network_name = match &reservation.mode {
                NetworkMode::Bridge => "joblet0",
                NetworkMode::Custom(name) => name.as_str(),
                _ => return,
            };
            if let Some(net) = self.networks.lock().unwrap().get(network_name) {
                net.pool.release(address);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veth::FakeVethControl;

    fn manager() -> NetworkManager {
        let logger = Logger::root(slog::Discard, slog::o!());
        NetworkManager::new(Box::new(FakeVethControl::new()), logger)
    }

    #[test]
    fn host_mode_skips_veth_plumbing() {
        let mgr = manager();
        let reservation = mgr.reserve(Uuid::new_v4(), &NetworkMode::Host).unwrap();
        assert!(reservation.address.is_none());
        assert!(reservation.attached);
        std::fs::remove_file(&reservation.sentinel_path).ok();
    }

    #[test]
    fn bridge_mode_allocates_address_but_defers_sentinel() {
        let mgr = manager();
        let job_uuid = Uuid::new_v4();
        let reservation = mgr.reserve(job_uuid, &NetworkMode::Bridge).unwrap();
        assert!(reservation.address.is_some());
        assert!(!reservation.attached);
        assert!(!reservation.sentinel_path.exists());
    }

    #[test]
    fn attach_to_pid_writes_sentinel() {
        let mgr = manager();
        let job_uuid = Uuid::new_v4();
        let mut reservation = mgr.reserve(job_uuid, &NetworkMode::Bridge).unwrap();
        mgr.attach_to_pid(&mut reservation, 4242).unwrap();
        assert!(reservation.attached);
        assert!(reservation.sentinel_path.exists());
        std::fs::remove_file(&reservation.sentinel_path).ok();
    }

    #[test]
    fn unknown_custom_network_is_validation_error() {
        let mgr = manager();
        let err = mgr
            .reserve(Uuid::new_v4(), &NetworkMode::Custom("missing".into()))
            .unwrap_err();
        assert!(matches!(err, joblet_base::error::JobletError::Validation(_)));
    }

    #[test]
    fn release_returns_address_to_pool() {
        let mgr = manager();
        let job_uuid = Uuid::new_v4();
        let mut reservation = mgr.reserve(job_uuid, &NetworkMode::Bridge).unwrap();
        mgr.attach_to_pid(&mut reservation, 1).unwrap();
        let address = reservation.address.unwrap();
        mgr.release(reservation);
        let second = mgr.reserve(Uuid::new_v4(), &NetworkMode::Bridge).unwrap();
        assert!(second.address.is_some());
        let _ = address;
    }
}
