//! Endpoint manager - owns the endpoint actors for one IP family.
//!
//! The manager:
//! - Spawns an actor on the first non-null descriptor for an endpoint
//! - Routes endpoint and interface updates to the right actor
//! - Retires actors on deletion and waits for their cleanup notice
//! - Parks a recreate until the previous actor has finished cleaning up, so
//!   two actors never program the same endpoint at once
//!
//! ## Lifecycle
//!
//! ```text
//! (absent) --descriptor--> live --null--> cleaning --notice--> (absent)
//!                                            |
//!                                 descriptor | parked, spawned on notice
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use warden_id::EndpointId;

use super::endpoint::{Backends, CleanupListener, EndpointHandle, EndpointSettings, LocalEndpoint};
use super::framework::{spawn, ActorError, ActorRef, Completion, MailboxConfig};
use crate::model::{EndpointDescriptor, EndpointSnapshot, IpFamily};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Cleanup notices
// =============================================================================

/// An actor finished tearing down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupNotice {
    pub id: EndpointId,
    pub actor_id: String,
}

/// Cleanup listener that forwards notices to the manager over a channel.
#[derive(Debug, Clone)]
pub struct CleanupNotifier {
    tx: mpsc::UnboundedSender<CleanupNotice>,
}

impl CleanupNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CleanupNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl CleanupListener for CleanupNotifier {
    fn on_object_cleanup_complete(&self, id: &EndpointId, actor_id: &str) {
        let notice = CleanupNotice {
            id: id.clone(),
            actor_id: actor_id.to_string(),
        };
        if self.tx.send(notice).is_err() {
            debug!(endpoint_id = %id, "Manager gone, dropping cleanup notice");
        }
    }
}

// =============================================================================
// Manager
// =============================================================================

struct ManagedEndpoint {
    handle: EndpointHandle,
    actor_ref: ActorRef,
    iface: Option<String>,
}

/// A recreate waiting for the previous actor's cleanup.
struct ParkedUpdate {
    descriptor: EndpointDescriptor,
    force_reprogram: bool,
}

/// Owns every endpoint actor of one family.
pub struct EndpointManager {
    settings: EndpointSettings,
    backends: Backends,
    mailbox: MailboxConfig,
    notifier: CleanupNotifier,
    cleanups: mpsc::UnboundedReceiver<CleanupNotice>,

    /// Actors for endpoints that currently exist.
    live: HashMap<EndpointId, ManagedEndpoint>,

    /// Retired actors still tearing down.
    cleaning: HashMap<EndpointId, ManagedEndpoint>,

    parked: HashMap<EndpointId, ParkedUpdate>,

    /// Interface name to endpoint, for kernel interface events.
    iface_index: HashMap<String, EndpointId>,
}

impl EndpointManager {
    pub fn new(settings: EndpointSettings, backends: Backends, mailbox: MailboxConfig) -> Self {
        let (notifier, cleanups) = CleanupNotifier::new();
        Self {
            settings,
            backends,
            mailbox,
            notifier,
            cleanups,
            live: HashMap::new(),
            cleaning: HashMap::new(),
            parked: HashMap::new(),
            iface_index: HashMap::new(),
        }
    }

    pub fn family(&self) -> IpFamily {
        self.settings.family
    }

    /// Number of endpoints with a live actor.
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Number of retired actors that have not reported cleanup yet.
    pub fn cleaning_count(&self) -> usize {
        self.cleaning.len()
    }

    pub fn is_parked(&self, id: &EndpointId) -> bool {
        self.parked.contains_key(id)
    }

    /// Actor ID of the live actor for `id`.
    pub fn actor_id(&self, id: &EndpointId) -> Option<&str> {
        self.live.get(id).map(|e| e.handle.actor_id())
    }

    /// Apply a new descriptor, or delete the endpoint when `None`.
    ///
    /// Returns a completion for the batch that will process it, or `None`
    /// if nothing was sent (unknown deletion, or a parked recreate).
    pub fn on_endpoint_update(
        &mut self,
        id: EndpointId,
        descriptor: Option<EndpointDescriptor>,
        force_reprogram: bool,
    ) -> Result<Option<Completion>, ActorError> {
        match descriptor {
            Some(descriptor) => self.update_endpoint(id, descriptor, force_reprogram),
            None => self.remove_endpoint(&id),
        }
    }

    fn update_endpoint(
        &mut self,
        id: EndpointId,
        descriptor: EndpointDescriptor,
        force_reprogram: bool,
    ) -> Result<Option<Completion>, ActorError> {
        if self.cleaning.contains_key(&id) {
            debug!(endpoint_id = %id, "Previous actor still cleaning up, parking update");
            self.parked.insert(
                id,
                ParkedUpdate {
                    descriptor,
                    force_reprogram,
                },
            );
            return Ok(None);
        }

        if !self.live.contains_key(&id) {
            let managed = self.spawn_endpoint(&id);
            self.live.insert(id.clone(), managed);
        }
        self.index_interface(&id, &descriptor.name);

        let Some(managed) = self.live.get(&id) else {
            return Ok(None);
        };
        let completion = managed
            .handle
            .on_endpoint_update(Some(descriptor), force_reprogram)?;
        Ok(Some(completion))
    }

    fn remove_endpoint(&mut self, id: &EndpointId) -> Result<Option<Completion>, ActorError> {
        if self.parked.remove(id).is_some() {
            debug!(endpoint_id = %id, "Dropped parked update for deleted endpoint");
        }

        let Some(managed) = self.live.remove(id) else {
            return Ok(None);
        };
        if let Some(iface) = &managed.iface {
            self.release_interface(iface, id);
        }

        info!(endpoint_id = %id, actor_id = %managed.handle.actor_id(), "Retiring endpoint actor");
        let completion = managed.handle.on_unreferenced()?;
        self.cleaning.insert(id.clone(), managed);
        Ok(Some(completion))
    }

    /// Route a kernel interface event to the endpoint using that interface.
    pub fn on_interface_update(
        &self,
        iface: &str,
        admin_up: bool,
    ) -> Result<Option<Completion>, ActorError> {
        let Some(managed) = self
            .iface_index
            .get(iface)
            .and_then(|id| self.live.get(id))
        else {
            debug!(iface = %iface, "Interface update for unknown endpoint");
            return Ok(None);
        };
        managed.handle.on_interface_update(admin_up).map(Some)
    }

    /// Converge on a full snapshot; endpoints missing from it are deleted.
    pub fn apply_snapshot(
        &mut self,
        snapshot: EndpointSnapshot,
    ) -> Result<Vec<Completion>, ActorError> {
        let stale: Vec<EndpointId> = self
            .live
            .keys()
            .chain(self.parked.keys())
            .filter(|id| !snapshot.contains_key(*id))
            .cloned()
            .collect();

        info!(
            family = %self.family(),
            endpoints = snapshot.len(),
            stale = stale.len(),
            "Applying endpoint snapshot"
        );

        let mut completions = Vec::new();
        for id in stale {
            completions.extend(self.on_endpoint_update(id, None, false)?);
        }
        for (id, descriptor) in snapshot {
            completions.extend(self.on_endpoint_update(id, Some(descriptor), false)?);
        }
        Ok(completions)
    }

    /// Handle every cleanup notice already delivered.
    pub fn process_cleanups(&mut self) -> Result<Vec<Completion>, ActorError> {
        let mut completions = Vec::new();
        while let Ok(notice) = self.cleanups.try_recv() {
            completions.extend(self.handle_cleanup(notice)?);
        }
        Ok(completions)
    }

    /// Wait for the next cleanup notice.
    pub async fn next_cleanup(&mut self) -> Option<CleanupNotice> {
        self.cleanups.recv().await
    }

    /// Forget a retired actor and start any recreate parked behind it.
    pub fn handle_cleanup(
        &mut self,
        notice: CleanupNotice,
    ) -> Result<Option<Completion>, ActorError> {
        let matches = self
            .cleaning
            .get(&notice.id)
            .is_some_and(|m| m.actor_ref.actor_id == notice.actor_id);
        if !matches {
            debug!(
                endpoint_id = %notice.id,
                actor_id = %notice.actor_id,
                "Ignoring stale cleanup notice"
            );
            return Ok(None);
        }

        self.cleaning.remove(&notice.id);
        debug!(endpoint_id = %notice.id, actor_id = %notice.actor_id, "Endpoint actor cleaned up");

        match self.parked.remove(&notice.id) {
            Some(parked) => {
                self.update_endpoint(notice.id, parked.descriptor, parked.force_reprogram)
            }
            None => Ok(None),
        }
    }

    /// Stop every actor, aborting any that do not exit in time.
    pub async fn shutdown(&mut self) {
        let refs: Vec<ActorRef> = self
            .live
            .drain()
            .chain(self.cleaning.drain())
            .map(|(_, managed)| managed.actor_ref)
            .collect();
        self.parked.clear();
        self.iface_index.clear();

        info!(family = %self.family(), count = refs.len(), "Stopping endpoint actors");
        for actor_ref in &refs {
            actor_ref.stop();
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            if refs.iter().all(|r| !r.is_running()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        for actor_ref in &refs {
            if actor_ref.is_running() {
                warn!(actor_id = %actor_ref.actor_id, "Force aborting actor");
                actor_ref.abort();
            }
        }
    }

    fn spawn_endpoint(&self, id: &EndpointId) -> ManagedEndpoint {
        let actor = LocalEndpoint::new(
            id.clone(),
            self.settings.clone(),
            self.backends.clone(),
            Arc::new(self.notifier.clone()),
        );
        let (handle, actor_ref) = spawn(actor, self.mailbox.clone());
        info!(
            endpoint_id = %id,
            actor_id = %actor_ref.actor_id,
            family = %self.family(),
            "Spawned endpoint actor"
        );
        ManagedEndpoint {
            handle: EndpointHandle::new(handle),
            actor_ref,
            iface: None,
        }
    }

    fn index_interface(&mut self, id: &EndpointId, iface: &str) {
        let Some(managed) = self.live.get_mut(id) else {
            return;
        };
        if managed.iface.as_deref() == Some(iface) {
            return;
        }
        if let Some(old) = managed.iface.replace(iface.to_string()) {
            self.release_interface(&old, id);
        }
        self.iface_index.insert(iface.to_string(), id.clone());
    }

    /// Drop an index entry, unless another endpoint has since claimed the name.
    fn release_interface(&mut self, iface: &str, id: &EndpointId) {
        if self.iface_index.get(iface) == Some(id) {
            self.iface_index.remove(iface);
        }
    }
}
