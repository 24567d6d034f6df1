//! Firewall rule chains for workload endpoints.
//!
//! This library provides:
//! - The chain naming convention shared with the dispatch chains and the
//!   profile rule manager
//! - Interface name to chain suffix mapping
//! - The per-endpoint rule chain compiler
//!
//! Chain names and rule text are an external format. Operators grep for the
//! comments, and other components derive the same names independently, so
//! any change here is a compatibility break.

use std::collections::{BTreeMap, BTreeSet};

// ============================================================================
// Naming
// ============================================================================

/// Prefix shared by every chain this agent owns.
pub const CHAIN_PREFIX: &str = "felix-";

/// Prefix of the per-endpoint ingress chain.
pub const CHAIN_TO_PREFIX: &str = "felix-to-";

/// Prefix of the per-endpoint egress chain.
pub const CHAIN_FROM_PREFIX: &str = "felix-from-";

/// Prefix of profile chains.
pub const CHAIN_PROFILE_PREFIX: &str = "felix-p-";

/// Mark bit a profile chain sets when it accepts a packet.
pub const PROFILE_ACCEPT_MARK: &str = "1/1";

/// Traffic direction relative to the workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Traffic leaving the workload ("from" chain, outbound profile rules).
    Egress,
    /// Traffic arriving at the workload ("to" chain, inbound profile rules).
    Ingress,
}

impl Direction {
    /// Both directions, egress first.
    pub const ALL: [Direction; 2] = [Direction::Egress, Direction::Ingress];

    /// Name of the endpoint chain for this direction.
    pub fn endpoint_chain(self, suffix: &str) -> String {
        match self {
            Direction::Egress => format!("{}{}", CHAIN_FROM_PREFIX, suffix),
            Direction::Ingress => format!("{}{}", CHAIN_TO_PREFIX, suffix),
        }
    }

    /// Name of the profile chain this direction jumps to.
    pub fn profile_chain(self, profile_id: &str) -> String {
        let marker = match self {
            Direction::Egress => 'o',
            Direction::Ingress => 'i',
        };
        format!("{}{}-{}", CHAIN_PROFILE_PREFIX, profile_id, marker)
    }
}

/// Names of both endpoint chains for a suffix, egress first.
pub fn chain_names(suffix: &str) -> Vec<String> {
    Direction::ALL
        .iter()
        .map(|d| d.endpoint_chain(suffix))
        .collect()
}

/// Strip the configured interface prefix from an interface name.
///
/// Only the first occurrence is removed, so `tap` + `taptap1` gives `tap1`.
pub fn interface_to_suffix(iface_prefix: &str, iface_name: &str) -> String {
    if iface_prefix.is_empty() {
        return iface_name.to_string();
    }
    iface_name.replacen(iface_prefix, "", 1)
}

// ============================================================================
// Compiler
// ============================================================================

/// Rules per chain, in `iptables-restore` append form.
pub type ChainUpdates = BTreeMap<String, Vec<String>>;

/// Profile chains each endpoint chain jumps to.
pub type ChainDependencies = BTreeMap<String, BTreeSet<String>>;

/// Output of [`compile_rules`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledChains {
    /// Ordered rules for each endpoint chain.
    pub updates: ChainUpdates,

    /// Profile chains referenced by each endpoint chain.
    pub dependencies: ChainDependencies,
}

impl CompiledChains {
    /// Names of the chains that were compiled.
    pub fn chain_names(&self) -> impl Iterator<Item = &str> {
        self.updates.keys().map(String::as_str)
    }
}

/// Compile the ingress and egress chains for one endpoint.
///
/// Each chain zeroes the mark, runs the profile chains in list order
/// returning as soon as one sets the accept bit, and drops anything that
/// falls off the end. The egress chain also drops packets whose source MAC
/// is not the endpoint's.
pub fn compile_rules(
    endpoint_id: &str,
    suffix: &str,
    mac: &str,
    profile_ids: &[String],
) -> CompiledChains {
    let mut compiled = CompiledChains::default();

    for direction in Direction::ALL {
        let chain = direction.endpoint_chain(suffix);
        let mut rules = Vec::with_capacity(3 + 2 * profile_ids.len());
        let mut deps = BTreeSet::new();

        rules.push(format!("--append {} --jump MARK --set-mark 0", chain));

        if direction == Direction::Egress {
            rules.push(format!(
                "--append {} --match mac ! --mac-source {} --jump DROP \
                 --match comment --comment \"Incorrect source MAC\"",
                chain, mac
            ));
        }

        for profile_id in profile_ids {
            let profile_chain = direction.profile_chain(profile_id);
            rules.push(format!("--append {} --jump {}", chain, profile_chain));
            rules.push(format!(
                "--append {} --match mark --mark {} --match comment \
                 --comment \"Profile accepted packet\" --jump RETURN",
                chain, PROFILE_ACCEPT_MARK
            ));
            deps.insert(profile_chain);
        }

        rules.push(format!(
            "--append {} --jump DROP -m comment --comment \
             \"Default DROP if no match (endpoint {}):\"",
            chain, endpoint_id
        ));

        compiled.updates.insert(chain.clone(), rules);
        compiled.dependencies.insert(chain, deps);
    }

    compiled
}
