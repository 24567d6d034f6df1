//! Endpoint status reporting.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;
use warden_id::EndpointId;
use warden_reconcile::EndpointStatus;

use crate::model::IpFamily;

/// Receives status transitions from endpoint actors.
///
/// Shared by every actor; implementations must tolerate concurrent calls.
pub trait StatusReporter: Send + Sync {
    /// `status` is `None` when the endpoint's status is withdrawn.
    fn on_endpoint_status_changed(
        &self,
        id: &EndpointId,
        family: IpFamily,
        status: Option<EndpointStatus>,
    );
}

/// A status transition as published to the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub endpoint_id: EndpointId,
    pub family: IpFamily,
    pub status: Option<EndpointStatus>,
}

/// Publishes status updates on a channel.
#[derive(Debug, Clone)]
pub struct ChannelStatusReporter {
    tx: mpsc::UnboundedSender<StatusUpdate>,
}

impl ChannelStatusReporter {
    /// Create a reporter and the receiving end of its channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StatusUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StatusReporter for ChannelStatusReporter {
    fn on_endpoint_status_changed(
        &self,
        id: &EndpointId,
        family: IpFamily,
        status: Option<EndpointStatus>,
    ) {
        let update = StatusUpdate {
            endpoint_id: id.clone(),
            family,
            status,
        };
        if self.tx.send(update).is_err() {
            warn!(endpoint_id = %id, "Status receiver dropped, update lost");
        }
    }
}

/// Reporter that keeps every update, for tests.
#[derive(Debug, Default)]
pub struct RecordingStatusReporter {
    updates: Mutex<Vec<StatusUpdate>>,
}

impl RecordingStatusReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> Vec<StatusUpdate> {
        self.updates.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn take_updates(&self) -> Vec<StatusUpdate> {
        std::mem::take(&mut *self.updates.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Statuses reported so far, in order.
    pub fn statuses(&self) -> Vec<Option<EndpointStatus>> {
        self.updates().into_iter().map(|u| u.status).collect()
    }
}

impl StatusReporter for RecordingStatusReporter {
    fn on_endpoint_status_changed(
        &self,
        id: &EndpointId,
        family: IpFamily,
        status: Option<EndpointStatus>,
    ) {
        self.updates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(StatusUpdate {
                endpoint_id: id.clone(),
                family,
                status,
            });
    }
}
