//! Interface and route programming.
//!
//! The device backend abstracts the kernel calls an endpoint actor makes:
//! - Per-interface sysctls (proxy ARP / proxy NDP)
//! - Host routes for the endpoint's addresses
//! - ARP entry resets when the workload MAC changes
//! - Interface presence and admin-up queries
//!
//! Every call may fail. Callers treat a failure as "not in sync" and retry on
//! the next batch; nothing here is fatal.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv6Addr};
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, info};

use crate::model::IpFamily;

/// Errors from device operations.
#[derive(Debug, Error)]
pub enum SystemCallError {
    #[error("`{command}` failed (exit code {code:?}): {stderr}")]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("command execution failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Kernel interface/route operations used by endpoint actors.
pub trait DeviceBackend: Send + Sync {
    /// Prepare an interface for IPv4 workloads (proxy ARP, local routing).
    fn configure_interface_v4(&self, name: &str) -> Result<(), SystemCallError>;

    /// Prepare an interface for IPv6 workloads, answering NDP for the gateway.
    fn configure_interface_v6(
        &self,
        name: &str,
        gateway: Option<Ipv6Addr>,
    ) -> Result<(), SystemCallError>;

    /// Make the routes via `name` exactly `ips`.
    ///
    /// `mac` may only be `None` when `ips` is empty. With `reset_arp`, static
    /// ARP entries are rewritten even for routes that already exist.
    fn set_routes(
        &self,
        family: IpFamily,
        ips: &BTreeSet<IpAddr>,
        name: &str,
        mac: Option<&str>,
        reset_arp: bool,
    ) -> Result<(), SystemCallError>;

    /// Whether the interface is administratively up.
    fn interface_up(&self, name: &str) -> Result<bool, SystemCallError>;

    /// Whether the interface exists.
    fn interface_exists(&self, name: &str) -> Result<bool, SystemCallError>;
}

// =============================================================================
// Linux implementation
// =============================================================================

const IFF_UP: u32 = 0x1;

/// Device backend that shells out to `ip`/`arp` and writes `/proc/sys`.
#[derive(Debug, Default)]
pub struct LinuxDevices;

impl LinuxDevices {
    pub fn new() -> Self {
        Self
    }

    fn list_routes(
        &self,
        family: IpFamily,
        name: &str,
    ) -> Result<BTreeSet<IpAddr>, SystemCallError> {
        let output = run("ip", &[family_flag(family), "route", "list", "dev", name])?;
        Ok(parse_route_list(&output))
    }
}

impl DeviceBackend for LinuxDevices {
    fn configure_interface_v4(&self, name: &str) -> Result<(), SystemCallError> {
        write_sysctl(&format!("/proc/sys/net/ipv4/conf/{}/route_localnet", name), "1")?;
        write_sysctl(&format!("/proc/sys/net/ipv4/conf/{}/proxy_arp", name), "1")?;
        write_sysctl(&format!("/proc/sys/net/ipv4/neigh/{}/proxy_delay", name), "0")?;
        debug!(iface = %name, "Configured interface for IPv4");
        Ok(())
    }

    fn configure_interface_v6(
        &self,
        name: &str,
        gateway: Option<Ipv6Addr>,
    ) -> Result<(), SystemCallError> {
        write_sysctl(&format!("/proc/sys/net/ipv6/conf/{}/proxy_ndp", name), "1")?;
        if let Some(gateway) = gateway {
            run(
                "ip",
                &["-6", "neigh", "replace", "proxy", &gateway.to_string(), "dev", name],
            )?;
        }
        debug!(iface = %name, gateway = ?gateway, "Configured interface for IPv6");
        Ok(())
    }

    fn set_routes(
        &self,
        family: IpFamily,
        ips: &BTreeSet<IpAddr>,
        name: &str,
        mac: Option<&str>,
        reset_arp: bool,
    ) -> Result<(), SystemCallError> {
        if !ips.is_empty() && mac.is_none() {
            return Err(SystemCallError::InvalidArgument(format!(
                "routes for {} need a MAC address",
                name
            )));
        }

        let current = self.list_routes(family, name)?;
        let flag = family_flag(family);

        for ip in ips.difference(&current) {
            let ip = ip.to_string();
            if let (IpFamily::V4, Some(mac)) = (family, mac) {
                run("arp", &["-s", &ip, mac, "-i", name])?;
            }
            run("ip", &[flag, "route", "replace", &ip, "dev", name])?;
        }

        for ip in current.difference(ips) {
            let ip = ip.to_string();
            run("ip", &[flag, "route", "del", &ip, "dev", name])?;
            if family == IpFamily::V4 {
                // Entry may already be gone.
                let _ = run("arp", &["-d", &ip, "-i", name]);
            }
        }

        if reset_arp && family == IpFamily::V4 {
            if let Some(mac) = mac {
                for ip in ips.intersection(&current) {
                    run("arp", &["-s", &ip.to_string(), mac, "-i", name])?;
                }
            }
        }

        info!(
            iface = %name,
            family = %family,
            routes = ips.len(),
            reset_arp,
            "Programmed routes"
        );
        Ok(())
    }

    fn interface_up(&self, name: &str) -> Result<bool, SystemCallError> {
        let flags = std::fs::read_to_string(format!("/sys/class/net/{}/flags", name))?;
        let flags = u32::from_str_radix(flags.trim().trim_start_matches("0x"), 16)
            .map_err(|e| SystemCallError::InvalidArgument(format!("flags for {}: {}", name, e)))?;
        Ok(flags & IFF_UP != 0)
    }

    fn interface_exists(&self, name: &str) -> Result<bool, SystemCallError> {
        Ok(Path::new(&format!("/sys/class/net/{}", name)).exists())
    }
}

fn family_flag(family: IpFamily) -> &'static str {
    match family {
        IpFamily::V4 => "-4",
        IpFamily::V6 => "-6",
    }
}

/// Extract host-route destinations from `ip route list dev X` output.
fn parse_route_list(output: &str) -> BTreeSet<IpAddr> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter_map(|dest| dest.parse::<IpAddr>().ok())
        .collect()
}

fn write_sysctl(path: &str, value: &str) -> Result<(), SystemCallError> {
    std::fs::write(path, value)?;
    Ok(())
}

/// Run a command and return its stdout.
fn run(program: &str, args: &[&str]) -> Result<String, SystemCallError> {
    let output = Command::new(program).args(args).output()?;

    if !output.status.success() {
        return Err(SystemCallError::Failed {
            command: format!("{} {}", program, args.join(" ")),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

// =============================================================================
// Mock implementation
// =============================================================================

/// A mutating call recorded by [`MockDevices`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    ConfigureV4 {
        name: String,
    },
    ConfigureV6 {
        name: String,
        gateway: Option<Ipv6Addr>,
    },
    SetRoutes {
        family: IpFamily,
        ips: BTreeSet<IpAddr>,
        name: String,
        mac: Option<String>,
        reset_arp: bool,
    },
}

#[derive(Debug, Default)]
struct MockDeviceState {
    calls: Vec<DeviceCall>,
    fail_configure: bool,
    fail_routes: bool,
    missing: BTreeSet<String>,
    down: BTreeSet<String>,
}

/// Recording device backend for tests and dry runs.
///
/// Interfaces exist and are up unless told otherwise.
#[derive(Debug, Default)]
pub struct MockDevices {
    state: Mutex<MockDeviceState>,
}

impl MockDevices {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockDeviceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Calls recorded so far.
    pub fn calls(&self) -> Vec<DeviceCall> {
        self.lock().calls.clone()
    }

    /// Return and clear recorded calls.
    pub fn take_calls(&self) -> Vec<DeviceCall> {
        std::mem::take(&mut self.lock().calls)
    }

    /// Make interface configuration fail.
    pub fn set_fail_configure(&self, fail: bool) {
        self.lock().fail_configure = fail;
    }

    /// Make route programming fail.
    pub fn set_fail_routes(&self, fail: bool) {
        self.lock().fail_routes = fail;
    }

    /// Control what `interface_exists` / `interface_up` report for `name`.
    pub fn set_interface(&self, name: &str, exists: bool, up: bool) {
        let mut state = self.lock();
        if exists {
            state.missing.remove(name);
        } else {
            state.missing.insert(name.to_string());
        }
        if up {
            state.down.remove(name);
        } else {
            state.down.insert(name.to_string());
        }
    }
}

fn injected(command: &str) -> SystemCallError {
    SystemCallError::Failed {
        command: command.to_string(),
        code: Some(1),
        stderr: "injected failure".to_string(),
    }
}

impl DeviceBackend for MockDevices {
    fn configure_interface_v4(&self, name: &str) -> Result<(), SystemCallError> {
        let mut state = self.lock();
        state.calls.push(DeviceCall::ConfigureV4 {
            name: name.to_string(),
        });
        if state.fail_configure {
            return Err(injected("configure_interface_v4"));
        }
        Ok(())
    }

    fn configure_interface_v6(
        &self,
        name: &str,
        gateway: Option<Ipv6Addr>,
    ) -> Result<(), SystemCallError> {
        let mut state = self.lock();
        state.calls.push(DeviceCall::ConfigureV6 {
            name: name.to_string(),
            gateway,
        });
        if state.fail_configure {
            return Err(injected("configure_interface_v6"));
        }
        Ok(())
    }

    fn set_routes(
        &self,
        family: IpFamily,
        ips: &BTreeSet<IpAddr>,
        name: &str,
        mac: Option<&str>,
        reset_arp: bool,
    ) -> Result<(), SystemCallError> {
        let mut state = self.lock();
        state.calls.push(DeviceCall::SetRoutes {
            family,
            ips: ips.clone(),
            name: name.to_string(),
            mac: mac.map(str::to_string),
            reset_arp,
        });
        if state.fail_routes {
            return Err(injected("set_routes"));
        }
        Ok(())
    }

    fn interface_up(&self, name: &str) -> Result<bool, SystemCallError> {
        let state = self.lock();
        Ok(!state.missing.contains(name) && !state.down.contains(name))
    }

    fn interface_exists(&self, name: &str) -> Result<bool, SystemCallError> {
        Ok(!self.lock().missing.contains(name))
    }
}
