//! Fire-and-forget collaborators driven by endpoint actors.
//!
//! Dispatch chains route traffic from the top-level chains to each endpoint's
//! chains by interface name; the NAT manager programs floating IPs. Both are
//! owned elsewhere; actors only tell them what changed.

use std::sync::Mutex;

use warden_id::EndpointId;

use crate::model::{IpFamily, NatMapping};

/// Maintains the dispatch chains that jump to per-endpoint chains.
pub trait DispatchChains: Send + Sync {
    /// An endpoint interface appeared.
    fn on_endpoint_added(&self, iface_name: &str);

    /// An endpoint interface went away.
    fn on_endpoint_removed(&self, iface_name: &str);
}

/// Programs NAT for floating IPs.
pub trait NatManager: Send + Sync {
    /// Replace the endpoint's mappings for one family. Empty clears them.
    fn update_endpoint(&self, id: &EndpointId, family: IpFamily, mappings: &[NatMapping]);
}

/// Dispatch collaborator that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDispatch;

impl DispatchChains for NoopDispatch {
    fn on_endpoint_added(&self, _iface_name: &str) {}

    fn on_endpoint_removed(&self, _iface_name: &str) {}
}

/// NAT collaborator that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNat;

impl NatManager for NoopNat {
    fn update_endpoint(&self, _id: &EndpointId, _family: IpFamily, _mappings: &[NatMapping]) {}
}

/// Dispatch event recorded by [`RecordingDispatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchEvent {
    Added(String),
    Removed(String),
}

/// Dispatch collaborator that records events.
#[derive(Debug, Default)]
pub struct RecordingDispatch {
    events: Mutex<Vec<DispatchEvent>>,
}

impl RecordingDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DispatchEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn take_events(&self) -> Vec<DispatchEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn push(&self, event: DispatchEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

impl DispatchChains for RecordingDispatch {
    fn on_endpoint_added(&self, iface_name: &str) {
        self.push(DispatchEvent::Added(iface_name.to_string()));
    }

    fn on_endpoint_removed(&self, iface_name: &str) {
        self.push(DispatchEvent::Removed(iface_name.to_string()));
    }
}

/// NAT update recorded by [`RecordingNat`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatUpdate {
    pub id: EndpointId,
    pub family: IpFamily,
    pub mappings: Vec<NatMapping>,
}

/// NAT collaborator that records updates.
#[derive(Debug, Default)]
pub struct RecordingNat {
    updates: Mutex<Vec<NatUpdate>>,
}

impl RecordingNat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> Vec<NatUpdate> {
        self.updates.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl NatManager for RecordingNat {
    fn update_endpoint(&self, id: &EndpointId, family: IpFamily, mappings: &[NatMapping]) {
        self.updates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(NatUpdate {
                id: id.clone(),
                family,
                mappings: mappings.to_vec(),
            });
    }
}
