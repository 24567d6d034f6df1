//! Convergence bookkeeping for endpoint reconciliation.
//!
//! An endpoint converges along two independent axes:
//!
//! - **Device**: interface configuration and routes.
//! - **Firewall**: the endpoint's rule chains.
//!
//! Each axis has a sync flag. Status is a pure function of those flags plus
//! the endpoint's administrative state, and is only reported when it changes.
//!
//! # Invariants
//!
//! - `device_has_been_in_sync` only moves false → true while the endpoint
//!   exists; only deleting the endpoint clears it
//! - Status derivation is deterministic given the same inputs
//! - A status is reported at most once per transition

use serde::{Deserialize, Serialize};

/// Administrative state requested by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdminState {
    Active,
    Inactive,
}

/// Observed endpoint status reported back to the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointStatus {
    Up,
    Down,
    Error,
}

impl EndpointStatus {
    /// Returns the wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointStatus::Up => "up",
            EndpointStatus::Down => "down",
            EndpointStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Convergence flags for one endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncFlags {
    /// Firewall chains reflect the applied descriptor.
    pub iptables_in_sync: bool,

    /// Interface and routes reflect the applied descriptor.
    pub device_in_sync: bool,

    /// Kernel reports the interface as up.
    pub device_is_up: bool,

    /// Sticky: the device has converged at least once since creation.
    device_has_been_in_sync: bool,
}

impl SyncFlags {
    /// Whether the device has ever converged for this endpoint.
    pub fn device_has_been_in_sync(&self) -> bool {
        self.device_has_been_in_sync
    }

    /// Record a successful device programming pass.
    pub fn mark_device_synced(&mut self) {
        self.device_in_sync = true;
        self.device_has_been_in_sync = true;
    }

    /// Mark both axes as needing reprogramming.
    pub fn invalidate(&mut self) {
        self.iptables_in_sync = false;
        self.device_in_sync = false;
    }

    /// Reset after the endpoint is deleted.
    ///
    /// The only path that clears `device_has_been_in_sync`.
    pub fn forget_device(&mut self) {
        self.invalidate();
        self.device_has_been_in_sync = false;
    }

    /// Both axes converged.
    pub fn fully_in_sync(&self) -> bool {
        self.iptables_in_sync && self.device_in_sync
    }
}

/// Derive the endpoint status from its flags.
///
/// `admin` is `None` when no descriptor is applied.
pub fn derive_status(admin: Option<AdminState>, flags: &SyncFlags) -> EndpointStatus {
    let Some(admin) = admin else {
        return EndpointStatus::Down;
    };

    if !flags.iptables_in_sync {
        return EndpointStatus::Error;
    }

    if !flags.device_in_sync {
        // Never came up is "down"; came up and then failed is "error".
        return if flags.device_has_been_in_sync {
            EndpointStatus::Error
        } else {
            EndpointStatus::Down
        };
    }

    match (admin, flags.device_is_up) {
        (AdminState::Active, true) => EndpointStatus::Up,
        _ => EndpointStatus::Down,
    }
}

/// Remembers the last reported status so that only transitions are sent.
#[derive(Debug, Clone, Default)]
pub struct StatusTracker {
    /// `None` until the first report; `Some(None)` after a withdrawal.
    last_reported: Option<Option<EndpointStatus>>,
}

impl StatusTracker {
    /// Create a tracker that has reported nothing yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `next` and return true if it differs from the last report.
    ///
    /// The first call always counts as a transition, including a first
    /// withdrawal (`None`).
    pub fn update(&mut self, next: Option<EndpointStatus>) -> bool {
        if self.last_reported == Some(next) {
            return false;
        }
        self.last_reported = Some(next);
        true
    }

    /// Last reported value, if any report was made.
    pub fn last_reported(&self) -> Option<Option<EndpointStatus>> {
        self.last_reported
    }
}
