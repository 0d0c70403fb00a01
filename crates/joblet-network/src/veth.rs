//! The `ip`-shelling veth/bridge control seam (§4.4). Kept as a small capability interface, the
//! same pattern `joblet-linux::Platform` uses for mount syscalls, so reservation logic is
//! testable without a real network namespace.

use joblet_base::error::{JobletError, ResourceErrorKind, Result};
use std::net::Ipv4Addr;
use std::process::Command;
use std::sync::Mutex;

pub trait VethControl: Send + Sync {
    fn ensure_bridge(&self, bridge: &str, gateway: Ipv4Addr, prefix_len: u8) -> Result<()>;
    fn create_veth_pair(&self, host_side: &str, peer_side: &str) -> Result<()>;
    fn attach_to_bridge(&self, bridge: &str, host_side: &str) -> Result<()>;
    fn move_to_netns(&self, peer_side: &str, pid: i32) -> Result<()>;
    fn set_up(&self, iface: &str, netns_pid: Option<i32>) -> Result<()>;
    fn assign_address(&self, iface: &str, addr: Ipv4Addr, prefix_len: u8, netns_pid: i32) -> Result<()>;
    fn set_default_route(&self, gateway: Ipv4Addr, netns_pid: i32) -> Result<()>;
    fn delete_link(&self, iface: &str) -> Result<()>;
}

/// Shells out to `ip`, the same pragmatic approach real host network managers take instead of
/// linking directly against the kernel's netlink protocol for every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct IpCommandVeth;

impl IpCommandVeth {
    fn run(&self, args: &[&str]) -> Result<()> {
        let output = Command::new("ip").args(args).output().map_err(|e| {
            JobletError::resource(ResourceErrorKind::Veth, format!("spawning ip {args:?}: {e}"))
        })?;
        if !output.status.success() {
            return Err(JobletError::resource(
                ResourceErrorKind::Veth,
                format!(
                    "ip {args:?} failed: {}",
                    String::from_utf8_lossy(&output.stderr)
                ),
            ));
        }
        Ok(())
    }
}

impl VethControl for IpCommandVeth {
    fn ensure_bridge(&self, bridge: &str, gateway: Ipv4Addr, prefix_len: u8) -> Result<()> {
        // Idempotent: "link add" on an existing bridge fails, so first check for its presence.
        let exists = Command::new("ip")
            .args(["link", "show", bridge])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);
        if !exists {
            self.run(&["link", "add", "name", bridge, "type", "bridge"])?;
            self.run(&[
                "addr", "add", &format!("{gateway}/{prefix_len}"), "dev", bridge,
            ])?;
        }
        self.run(&["link", "set", bridge, "up"])
    }

    fn create_veth_pair(&self, host_side: &str, peer_side: &str) -> Result<()> {
        self.run(&[
            "link", "add", host_side, "type", "veth", "peer", "name", peer_side,
        ])
    }

    fn attach_to_bridge(&self, bridge: &str, host_side: &str) -> Result<()> {
        self.run(&["link", "set", host_side, "master", bridge])?;
        self.run(&["link", "set", host_side, "up"])
    }

    fn move_to_netns(&self, peer_side: &str, pid: i32) -> Result<()> {
        self.run(&["link", "set", peer_side, "netns", &pid.to_string()])
    }

    fn set_up(&self, iface: &str, netns_pid: Option<i32>) -> Result<()> {
        match netns_pid {
            Some(pid) => self.run(&[
                "netns", "exec", &pid.to_string(), "ip", "link", "set", iface, "up",
            ]),
            None => self.run(&["link", "set", iface, "up"]),
        }
    }

    fn assign_address(&self, iface: &str, addr: Ipv4Addr, prefix_len: u8, netns_pid: i32) -> Result<()> {
        self.run(&[
            "netns",
            "exec",
            &netns_pid.to_string(),
            "ip",
            "addr",
            "add",
            &format!("{addr}/{prefix_len}"),
            "dev",
            iface,
        ])
    }

    fn set_default_route(&self, gateway: Ipv4Addr, netns_pid: i32) -> Result<()> {
        self.run(&[
            "netns",
            "exec",
            &netns_pid.to_string(),
            "ip",
            "route",
            "add",
            "default",
            "via",
            &gateway.to_string(),
        ])
    }

    fn delete_link(&self, iface: &str) -> Result<()> {
        match self.run(&["link", "delete", iface]) {
            Ok(()) => Ok(()),
            // Already gone (e.g. the netns that held the peer end was torn down first).
            Err(_) => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedVethCall {
    EnsureBridge(String),
    CreateVethPair(String, String),
    AttachToBridge(String, String),
    MoveToNetns(String, i32),
    SetUp(String, Option<i32>),
    AssignAddress(String, Ipv4Addr, u8, i32),
    SetDefaultRoute(Ipv4Addr, i32),
    DeleteLink(String),
}

#[derive(Default)]
pub struct FakeVethControl {
    pub calls: Mutex<Vec<RecordedVethCall>>,
}

impl FakeVethControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<RecordedVethCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl VethControl for FakeVethControl {
    fn ensure_bridge(&self, bridge: &str, _gateway: Ipv4Addr, _prefix_len: u8) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(RecordedVethCall::EnsureBridge(bridge.to_string()));
        Ok(())
    }

    fn create_veth_pair(&self, host_side: &str, peer_side: &str) -> Result<()> {
        self.calls.lock().unwrap().push(RecordedVethCall::CreateVethPair(
            host_side.to_string(),
            peer_side.to_string(),
        ));
        Ok(())
    }

    fn attach_to_bridge(&self, bridge: &str, host_side: &str) -> Result<()> {
        self.calls.lock().unwrap().push(RecordedVethCall::AttachToBridge(
            bridge.to_string(),
            host_side.to_string(),
        ));
        Ok(())
    }

    fn move_to_netns(&self, peer_side: &str, pid: i32) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(RecordedVethCall::MoveToNetns(peer_side.to_string(), pid));
        Ok(())
    }

    fn set_up(&self, iface: &str, netns_pid: Option<i32>) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(RecordedVethCall::SetUp(iface.to_string(), netns_pid));
        Ok(())
    }

    fn assign_address(&self, iface: &str, addr: Ipv4Addr, prefix_len: u8, netns_pid: i32) -> Result<()> {
        self.calls.lock().unwrap().push(RecordedVethCall::AssignAddress(
            iface.to_string(),
            addr,
            prefix_len,
            netns_pid,
        ));
        Ok(())
    }

    fn set_default_route(&self, gateway: Ipv4Addr, netns_pid: i32) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(RecordedVethCall::SetDefaultRoute(gateway, netns_pid));
        Ok(())
    }

    fn delete_link(&self, iface: &str) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(RecordedVethCall::DeleteLink(iface.to_string()));
        Ok(())
    }
}
