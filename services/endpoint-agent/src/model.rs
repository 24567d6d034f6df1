//! Endpoint desired-state model.
//!
//! Descriptors arrive from the control plane as JSON. They are trusted to
//! have been validated upstream; parsing here only enforces types.

use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use warden_id::EndpointId;
use warden_reconcile::AdminState;

// =============================================================================
// IP Family
// =============================================================================

/// IP family an actor, manager, or backend call is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    /// Host prefix length for this family.
    pub fn host_prefix_len(self) -> u8 {
        match self {
            IpFamily::V4 => 32,
            IpFamily::V6 => 128,
        }
    }

    /// Family of an address.
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }
}

impl std::fmt::Display for IpFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpFamily::V4 => f.write_str("ipv4"),
            IpFamily::V6 => f.write_str("ipv6"),
        }
    }
}

// =============================================================================
// Networks
// =============================================================================

/// Errors parsing an [`IpNetwork`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkParseError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),
}

/// An address with a prefix length, e.g. `10.0.0.1/32`.
///
/// Bare addresses parse as host networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IpNetwork {
    /// Address as configured (not masked).
    pub addr: IpAddr,

    /// Prefix length.
    pub prefix_len: u8,
}

impl IpNetwork {
    /// Host network for a single address.
    pub fn host(addr: IpAddr) -> Self {
        Self {
            addr,
            prefix_len: IpFamily::of(&addr).host_prefix_len(),
        }
    }

    /// Family of the network.
    pub fn family(&self) -> IpFamily {
        IpFamily::of(&self.addr)
    }
}

impl FromStr for IpNetwork {
    type Err = NetworkParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_str, prefix_str) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };

        let addr = IpAddr::from_str(addr_str)
            .map_err(|_| NetworkParseError::InvalidAddress(addr_str.to_string()))?;
        let max = IpFamily::of(&addr).host_prefix_len();

        let prefix_len = match prefix_str {
            None => max,
            Some(p) => p
                .parse::<u8>()
                .ok()
                .filter(|len| *len <= max)
                .ok_or_else(|| NetworkParseError::InvalidPrefix(p.to_string()))?,
        };

        Ok(Self { addr, prefix_len })
    }
}

impl std::fmt::Display for IpNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl Serialize for IpNetwork {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IpNetwork {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One NAT mapping: traffic to `out_ip` is translated to `in_ip`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NatMapping {
    /// Address inside the workload.
    pub in_ip: IpAddr,

    /// Externally visible address.
    pub out_ip: IpAddr,
}

// =============================================================================
// Endpoint Descriptor
// =============================================================================

/// Desired state for one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    /// Administrative state.
    pub state: AdminState,

    /// Host-side interface name.
    pub name: String,

    /// Workload MAC address.
    pub mac: String,

    /// Profiles applied in order.
    #[serde(default)]
    pub profile_ids: Vec<String>,

    #[serde(default)]
    pub ipv4_nets: Vec<IpNetwork>,

    #[serde(default)]
    pub ipv6_nets: Vec<IpNetwork>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_gateway: Option<Ipv4Addr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6_gateway: Option<Ipv6Addr>,

    #[serde(default)]
    pub ipv4_nat: Vec<NatMapping>,

    #[serde(default)]
    pub ipv6_nat: Vec<NatMapping>,
}

impl EndpointDescriptor {
    /// Create an active descriptor with no addresses or profiles.
    pub fn new(name: impl Into<String>, mac: impl Into<String>) -> Self {
        Self {
            state: AdminState::Active,
            name: name.into(),
            mac: mac.into(),
            profile_ids: Vec::new(),
            ipv4_nets: Vec::new(),
            ipv6_nets: Vec::new(),
            ipv4_gateway: None,
            ipv6_gateway: None,
            ipv4_nat: Vec::new(),
            ipv6_nat: Vec::new(),
        }
    }

    /// Set the administrative state.
    pub fn with_state(mut self, state: AdminState) -> Self {
        self.state = state;
        self
    }

    /// Set the profile list.
    pub fn with_profiles<I, S>(mut self, profile_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.profile_ids = profile_ids.into_iter().map(Into::into).collect();
        self
    }

    /// Add a network to the list matching its family.
    pub fn with_net(mut self, net: IpNetwork) -> Self {
        match net.family() {
            IpFamily::V4 => self.ipv4_nets.push(net),
            IpFamily::V6 => self.ipv6_nets.push(net),
        }
        self
    }

    /// Add a NAT mapping to the list matching its inside address family.
    pub fn with_nat(mut self, mapping: NatMapping) -> Self {
        match IpFamily::of(&mapping.in_ip) {
            IpFamily::V4 => self.ipv4_nat.push(mapping),
            IpFamily::V6 => self.ipv6_nat.push(mapping),
        }
        self
    }

    /// Set the IPv6 gateway.
    pub fn with_ipv6_gateway(mut self, gateway: Ipv6Addr) -> Self {
        self.ipv6_gateway = Some(gateway);
        self
    }

    /// Networks for one family.
    pub fn nets(&self, family: IpFamily) -> &[IpNetwork] {
        match family {
            IpFamily::V4 => &self.ipv4_nets,
            IpFamily::V6 => &self.ipv6_nets,
        }
    }

    /// NAT mappings for one family.
    pub fn nat(&self, family: IpFamily) -> &[NatMapping] {
        match family {
            IpFamily::V4 => &self.ipv4_nat,
            IpFamily::V6 => &self.ipv6_nat,
        }
    }

    /// Gateway for one family.
    pub fn gateway(&self, family: IpFamily) -> Option<IpAddr> {
        match family {
            IpFamily::V4 => self.ipv4_gateway.map(IpAddr::V4),
            IpFamily::V6 => self.ipv6_gateway.map(IpAddr::V6),
        }
    }

    /// Addresses to route to the interface: configured networks plus every
    /// NAT inside address.
    pub fn route_ips(&self, family: IpFamily) -> BTreeSet<IpAddr> {
        self.nets(family)
            .iter()
            .map(|net| net.addr)
            .chain(self.nat(family).iter().map(|m| m.in_ip))
            .collect()
    }
}

// =============================================================================
// Snapshots
// =============================================================================

/// Full desired state for a host, keyed by endpoint path.
pub type EndpointSnapshot = HashMap<EndpointId, EndpointDescriptor>;

/// Load a snapshot from a JSON file.
///
/// The file is an object mapping `host/orchestrator/workload/endpoint` to a
/// descriptor.
pub fn load_snapshot(path: &Path) -> Result<EndpointSnapshot> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read endpoints file {}", path.display()))?;
    let snapshot: EndpointSnapshot = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse endpoints file {}", path.display()))?;
    Ok(snapshot)
}
