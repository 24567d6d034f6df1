//! Endpoint actor - converges one workload endpoint for one IP family.
//!
//! The actor keeps the most recently requested descriptor (`pending`) and the
//! one it last applied (`endpoint`). Each batch diffs the two, marks the
//! affected subsystems out of sync, and reprograms only those.
//!
//! ## Sync axes
//!
//! Device (interface and routes) and firewall (endpoint chains) converge
//! independently. A failure on one axis leaves the other untouched and is
//! retried on the next batch.
//!
//! ## Teardown
//!
//! A null descriptor removes routes and tells the collaborators the interface
//! is gone. After `Unreferenced`, the final batch also deletes the endpoint
//! chains, withdraws status, and reports cleanup to the listener. No batch
//! may follow.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use warden_id::EndpointId;
use warden_reconcile::{derive_status, EndpointStatus, StatusTracker, SyncFlags};
use warden_rules::{chain_names, compile_rules, interface_to_suffix};

use super::framework::{Actor, ActorContext, ActorError, ActorHandle, BatchOutcome, Completion};
use crate::collaborators::{DispatchChains, NatManager};
use crate::devices::{DeviceBackend, SystemCallError};
use crate::firewall::FirewallBackend;
use crate::model::{EndpointDescriptor, IpFamily};
use crate::status::StatusReporter;

/// Messages handled by the endpoint actor.
#[derive(Debug)]
pub enum EndpointMessage {
    /// New desired state; `None` means the endpoint should not exist.
    EndpointUpdate {
        descriptor: Option<EndpointDescriptor>,
        force_reprogram: bool,
    },

    /// The kernel reported an interface state change.
    InterfaceUpdate { admin_up: bool },

    /// The manager no longer references this actor.
    Unreferenced,
}

/// Told when an actor has finished tearing down.
pub trait CleanupListener: Send + Sync {
    /// Called once per actor, from its final batch.
    fn on_object_cleanup_complete(&self, id: &EndpointId, actor_id: &str);
}

/// Collaborators shared by every endpoint actor of a family.
#[derive(Clone)]
pub struct Backends {
    pub devices: Arc<dyn DeviceBackend>,
    pub firewall: Arc<dyn FirewallBackend>,
    pub dispatch: Arc<dyn DispatchChains>,
    pub nat: Arc<dyn NatManager>,
    pub status: Arc<dyn StatusReporter>,
}

/// Per-family actor settings.
#[derive(Debug, Clone)]
pub struct EndpointSettings {
    pub family: IpFamily,
    pub iface_prefix: String,
    pub report_status: bool,
}

/// Actor that owns one endpoint's applied state.
pub struct LocalEndpoint {
    id: EndpointId,
    settings: EndpointSettings,
    backends: Backends,
    cleanup: Arc<dyn CleanupListener>,

    /// Latest requested descriptor.
    pending: Option<EndpointDescriptor>,

    /// Descriptor last applied.
    endpoint: Option<EndpointDescriptor>,

    force_reprogram: bool,
    interface_update: Option<bool>,
    flags: SyncFlags,
    unreferenced: bool,
    cleaned_up: bool,

    /// Suffix whose chains were last written.
    programmed_suffix: Option<String>,

    tracker: StatusTracker,
}

impl LocalEndpoint {
    pub fn new(
        id: EndpointId,
        settings: EndpointSettings,
        backends: Backends,
        cleanup: Arc<dyn CleanupListener>,
    ) -> Self {
        Self {
            id,
            settings,
            backends,
            cleanup,
            pending: None,
            endpoint: None,
            force_reprogram: false,
            interface_update: None,
            flags: SyncFlags::default(),
            unreferenced: false,
            cleaned_up: false,
            programmed_suffix: None,
            tracker: StatusTracker::new(),
        }
    }

    pub fn id(&self) -> &EndpointId {
        &self.id
    }

    /// Descriptor currently applied.
    pub fn endpoint(&self) -> Option<&EndpointDescriptor> {
        self.endpoint.as_ref()
    }

    pub fn flags(&self) -> &SyncFlags {
        &self.flags
    }

    fn family(&self) -> IpFamily {
        self.settings.family
    }

    fn suffix(&self, iface_name: &str) -> String {
        interface_to_suffix(&self.settings.iface_prefix, iface_name)
    }

    // -------------------------------------------------------------------------
    // Diffing
    // -------------------------------------------------------------------------

    fn apply_pending(&mut self) {
        let force = std::mem::take(&mut self.force_reprogram);
        if self.pending == self.endpoint && !force {
            return;
        }

        let old = self.endpoint.take();
        match self.pending.clone() {
            Some(new) => {
                self.apply_descriptor(old.as_ref(), &new, force);
                self.endpoint = Some(new);
            }
            None => {
                if let Some(old) = old {
                    self.remove_endpoint(&old);
                }
            }
        }
    }

    fn apply_descriptor(
        &mut self,
        old: Option<&EndpointDescriptor>,
        new: &EndpointDescriptor,
        force: bool,
    ) {
        let family = self.family();

        if old.map_or(true, |old| old.name != new.name) {
            if let Some(old) = old {
                info!(
                    endpoint_id = %self.id,
                    old_iface = %old.name,
                    iface = %new.name,
                    "Endpoint moved to a new interface"
                );
                self.clear_routes(&old.name);
                self.backends.dispatch.on_endpoint_removed(&old.name);
                if self.suffix(&old.name) != self.suffix(&new.name) {
                    self.delete_programmed_chains();
                }
            }

            self.flags.device_is_up = match self.backends.devices.interface_up(&new.name) {
                Ok(up) => up,
                Err(e) => {
                    debug!(iface = %new.name, error = %e, "Could not read interface state");
                    false
                }
            };
            self.backends.dispatch.on_endpoint_added(&new.name);
        }

        let Some(old) = old.filter(|_| !force) else {
            self.flags.invalidate();
            return;
        };

        if old.state != new.state || old.name != new.name || old.mac != new.mac {
            self.flags.invalidate();
        }
        if old.profile_ids != new.profile_ids {
            self.flags.iptables_in_sync = false;
        }
        if old.nat(family) != new.nat(family) {
            self.flags.invalidate();
        }
        if old.nets(family) != new.nets(family) || old.gateway(family) != new.gateway(family) {
            self.flags.device_in_sync = false;
        }
    }

    fn remove_endpoint(&mut self, old: &EndpointDescriptor) {
        info!(endpoint_id = %self.id, iface = %old.name, family = %self.family(), "Removing endpoint");
        self.clear_routes(&old.name);
        self.backends.dispatch.on_endpoint_removed(&old.name);
        self.backends
            .nat
            .update_endpoint(&self.id, self.family(), &[]);
        self.flags.forget_device();
    }

    // -------------------------------------------------------------------------
    // Programming
    // -------------------------------------------------------------------------

    fn update_chains(&mut self, endpoint: &EndpointDescriptor) {
        let family = self.family();
        let suffix = self.suffix(&endpoint.name);
        let compiled = compile_rules(
            self.id.endpoint.as_str(),
            &suffix,
            &endpoint.mac,
            &endpoint.profile_ids,
        );

        match self.backends.firewall.rewrite_chains(&compiled) {
            Ok(()) => {
                self.flags.iptables_in_sync = true;
                self.programmed_suffix = Some(suffix);
                self.backends
                    .nat
                    .update_endpoint(&self.id, family, endpoint.nat(family));
            }
            Err(e) => {
                error!(endpoint_id = %self.id, family = %family, error = %e, "Failed to program chains");
                self.flags.iptables_in_sync = false;
            }
        }
    }

    fn update_device(&mut self, endpoint: &EndpointDescriptor) {
        match self.program_device(endpoint) {
            Ok(()) => {
                debug!(endpoint_id = %self.id, iface = %endpoint.name, "Device in sync");
                self.flags.mark_device_synced();
            }
            Err(e) => {
                self.flags.device_in_sync = false;
                self.diagnose_device_failure(&endpoint.name, &e);
            }
        }
    }

    fn program_device(&self, endpoint: &EndpointDescriptor) -> Result<(), SystemCallError> {
        let family = self.family();
        let devices = &self.backends.devices;
        let ips = endpoint.route_ips(family);

        match family {
            IpFamily::V4 => {
                devices.configure_interface_v4(&endpoint.name)?;
                devices.set_routes(family, &ips, &endpoint.name, Some(&endpoint.mac), true)?;
            }
            IpFamily::V6 => {
                devices.configure_interface_v6(&endpoint.name, endpoint.ipv6_gateway)?;
                devices.set_routes(family, &ips, &endpoint.name, Some(&endpoint.mac), false)?;
            }
        }
        Ok(())
    }

    fn diagnose_device_failure(&self, iface: &str, err: &SystemCallError) {
        let devices = &self.backends.devices;
        if !devices.interface_exists(iface).unwrap_or(false) {
            info!(endpoint_id = %self.id, iface = %iface, "Interface missing, will retry when it appears");
        } else if !devices.interface_up(iface).unwrap_or(false) {
            info!(endpoint_id = %self.id, iface = %iface, "Interface down, will retry when it comes up");
        } else {
            error!(endpoint_id = %self.id, iface = %iface, error = %err, "Failed to configure interface");
        }
    }

    fn clear_routes(&self, iface: &str) {
        let result = self
            .backends
            .devices
            .set_routes(self.family(), &BTreeSet::new(), iface, None, false);
        if let Err(e) = result {
            warn!(endpoint_id = %self.id, iface = %iface, error = %e, "Failed to remove routes");
        }
    }

    fn delete_programmed_chains(&mut self) {
        let Some(suffix) = self.programmed_suffix.take() else {
            return;
        };
        if let Err(e) = self.backends.firewall.delete_chains(&chain_names(&suffix)) {
            warn!(endpoint_id = %self.id, suffix = %suffix, error = %e, "Failed to delete chains");
        }
    }

    // -------------------------------------------------------------------------
    // Status
    // -------------------------------------------------------------------------

    fn current_status(&self) -> Option<EndpointStatus> {
        if self.unreferenced {
            return None;
        }
        let admin = self.endpoint.as_ref().map(|e| e.state);
        Some(derive_status(admin, &self.flags))
    }

    fn maybe_update_status(&mut self) {
        if !self.settings.report_status {
            return;
        }
        let status = self.current_status();
        if self.tracker.update(status) {
            debug!(endpoint_id = %self.id, status = ?status, "Endpoint status changed");
            self.backends
                .status
                .on_endpoint_status_changed(&self.id, self.family(), status);
        }
    }
}

impl Actor for LocalEndpoint {
    type Message = EndpointMessage;

    fn name(&self) -> &str {
        "endpoint"
    }

    fn handle(&mut self, msg: EndpointMessage, _ctx: &mut ActorContext) {
        match msg {
            EndpointMessage::EndpointUpdate {
                descriptor,
                force_reprogram,
            } => {
                self.pending = descriptor;
                self.force_reprogram |= force_reprogram;
            }
            EndpointMessage::InterfaceUpdate { admin_up } => {
                self.interface_update = Some(admin_up);
            }
            EndpointMessage::Unreferenced => {
                self.unreferenced = true;
            }
        }
    }

    fn finish_batch(&mut self, batch_len: usize, ctx: &mut ActorContext) -> BatchOutcome {
        assert!(
            !self.cleaned_up,
            "batch delivered to endpoint {} after cleanup",
            self.id
        );
        assert!(
            batch_len > 0 || self.unreferenced,
            "empty batch for referenced endpoint {}",
            self.id
        );

        if let Some(admin_up) = self.interface_update.take() {
            self.flags.device_is_up = admin_up;
            self.flags.device_in_sync = false;
        }

        if self.unreferenced {
            self.pending = None;
        }
        self.apply_pending();

        if let Some(endpoint) = self.endpoint.clone() {
            if !self.flags.iptables_in_sync {
                self.update_chains(&endpoint);
            }
            if !self.flags.device_in_sync {
                self.update_device(&endpoint);
            }
        }

        self.maybe_update_status();

        if !self.unreferenced {
            return BatchOutcome::Continue;
        }

        self.delete_programmed_chains();
        self.cleaned_up = true;
        info!(endpoint_id = %self.id, family = %self.family(), "Endpoint cleaned up");
        self.cleanup
            .on_object_cleanup_complete(&self.id, &ctx.actor_id);
        BatchOutcome::Stop
    }
}

/// Typed handle to a running endpoint actor.
#[derive(Debug, Clone)]
pub struct EndpointHandle {
    inner: ActorHandle<EndpointMessage>,
}

impl EndpointHandle {
    pub fn new(inner: ActorHandle<EndpointMessage>) -> Self {
        Self { inner }
    }

    pub fn actor_id(&self) -> &str {
        self.inner.actor_id()
    }

    /// Replace the desired state.
    pub fn on_endpoint_update(
        &self,
        descriptor: Option<EndpointDescriptor>,
        force_reprogram: bool,
    ) -> Result<Completion, ActorError> {
        self.inner.send(EndpointMessage::EndpointUpdate {
            descriptor,
            force_reprogram,
        })
    }

    /// Report an interface state change.
    pub fn on_interface_update(&self, admin_up: bool) -> Result<Completion, ActorError> {
        self.inner
            .send(EndpointMessage::InterfaceUpdate { admin_up })
    }

    /// Start teardown.
    pub fn on_unreferenced(&self) -> Result<Completion, ActorError> {
        self.inner.send(EndpointMessage::Unreferenced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv6Addr};
    use std::sync::Mutex;

    use tokio::sync::watch;
    use warden_reconcile::AdminState;

    use crate::collaborators::{DispatchEvent, RecordingDispatch, RecordingNat};
    use crate::devices::{DeviceCall, MockDevices};
    use crate::firewall::{FirewallCall, MockFirewall};
    use crate::model::{IpNetwork, NatMapping};
    use crate::status::RecordingStatusReporter;

    const MAC: &str = "aa:bb:cc:dd:ee:ff";

    #[derive(Default)]
    struct RecordingCleanup {
        calls: Mutex<Vec<(EndpointId, String)>>,
    }

    impl CleanupListener for RecordingCleanup {
        fn on_object_cleanup_complete(&self, id: &EndpointId, actor_id: &str) {
            self.calls
                .lock()
                .unwrap()
                .push((id.clone(), actor_id.to_string()));
        }
    }

    struct Harness {
        actor: LocalEndpoint,
        ctx: ActorContext,
        devices: Arc<MockDevices>,
        firewall: Arc<MockFirewall>,
        dispatch: Arc<RecordingDispatch>,
        nat: Arc<RecordingNat>,
        status: Arc<RecordingStatusReporter>,
        cleanup: Arc<RecordingCleanup>,
        _shutdown: watch::Sender<bool>,
    }

    impl Harness {
        fn new(family: IpFamily) -> Self {
            let devices = Arc::new(MockDevices::new());
            let firewall = Arc::new(MockFirewall::new());
            let dispatch = Arc::new(RecordingDispatch::new());
            let nat = Arc::new(RecordingNat::new());
            let status = Arc::new(RecordingStatusReporter::new());
            let cleanup = Arc::new(RecordingCleanup::default());

            let backends = Backends {
                devices: devices.clone(),
                firewall: firewall.clone(),
                dispatch: dispatch.clone(),
                nat: nat.clone(),
                status: status.clone(),
            };
            let settings = EndpointSettings {
                family,
                iface_prefix: "tap".to_string(),
                report_status: true,
            };
            let id = EndpointId::new("host_id", "orchestrator_id", "workload_id", "endpoint_id")
                .unwrap();
            let actor = LocalEndpoint::new(id, settings, backends, cleanup.clone());
            let (shutdown_tx, shutdown_rx) = watch::channel(false);

            Self {
                actor,
                ctx: ActorContext::new("endpoint_test".to_string(), shutdown_rx),
                devices,
                firewall,
                dispatch,
                nat,
                status,
                cleanup,
                _shutdown: shutdown_tx,
            }
        }

        fn step(&mut self, msgs: Vec<EndpointMessage>) -> BatchOutcome {
            let batch_len = msgs.len();
            for msg in msgs {
                self.actor.handle(msg, &mut self.ctx);
            }
            self.actor.finish_batch(batch_len, &mut self.ctx)
        }

        fn update(&mut self, descriptor: Option<EndpointDescriptor>) -> BatchOutcome {
            self.step(vec![EndpointMessage::EndpointUpdate {
                descriptor,
                force_reprogram: false,
            }])
        }

        fn clear_recordings(&self) {
            self.devices.take_calls();
            self.firewall.take_calls();
            self.dispatch.take_events();
            self.status.take_updates();
        }
    }

    fn v4_descriptor() -> EndpointDescriptor {
        EndpointDescriptor::new("tapabcdef", MAC)
            .with_profiles(["prof1"])
            .with_net("10.0.0.1/32".parse().unwrap())
    }

    fn v6_descriptor() -> EndpointDescriptor {
        EndpointDescriptor::new("tapabcdef", MAC)
            .with_profiles(["prof1"])
            .with_net("2001::1/128".parse().unwrap())
            .with_ipv6_gateway("2001::ffff".parse().unwrap())
    }

    fn ips(addrs: &[&str]) -> BTreeSet<IpAddr> {
        addrs.iter().map(|a| a.parse().unwrap()).collect()
    }

    fn set_routes(family: IpFamily, addrs: &[&str], mac: Option<&str>, reset_arp: bool) -> DeviceCall {
        DeviceCall::SetRoutes {
            family,
            ips: ips(addrs),
            name: "tapabcdef".to_string(),
            mac: mac.map(str::to_string),
            reset_arp,
        }
    }

    #[test]
    fn test_fresh_actor_reports_down() {
        let mut h = Harness::new(IpFamily::V4);
        h.update(None);

        assert!(h.devices.calls().is_empty());
        assert!(h.firewall.calls().is_empty());
        assert_eq!(h.status.statuses(), vec![Some(EndpointStatus::Down)]);
    }

    #[test]
    fn test_interface_update_before_descriptor_is_inert() {
        let mut h = Harness::new(IpFamily::V4);
        h.step(vec![EndpointMessage::InterfaceUpdate { admin_up: true }]);

        assert!(h.devices.calls().is_empty());
        assert!(h.firewall.calls().is_empty());
        assert!(h.dispatch.events().is_empty());
        assert_eq!(h.status.statuses(), vec![Some(EndpointStatus::Down)]);
    }

    #[test]
    fn test_on_endpoint_update_v4() {
        let mut h = Harness::new(IpFamily::V4);
        assert_eq!(h.update(Some(v4_descriptor())), BatchOutcome::Continue);

        assert_eq!(
            h.devices.calls(),
            vec![
                DeviceCall::ConfigureV4 {
                    name: "tapabcdef".to_string()
                },
                set_routes(IpFamily::V4, &["10.0.0.1"], Some(MAC), true),
            ]
        );
        let rewritten: Vec<String> = match h.firewall.calls().as_slice() {
            [FirewallCall::Rewrite(compiled)] => compiled.chain_names().map(str::to_string).collect(),
            other => panic!("unexpected firewall calls: {other:?}"),
        };
        assert_eq!(rewritten, vec!["felix-from-abcdef", "felix-to-abcdef"]);
        assert_eq!(h.dispatch.events(), vec![DispatchEvent::Added("tapabcdef".to_string())]);
        assert!(h.actor.flags().fully_in_sync());
        assert_eq!(h.status.statuses(), vec![Some(EndpointStatus::Up)]);
    }

    #[test]
    fn test_unchanged_update_is_noop() {
        let mut h = Harness::new(IpFamily::V4);
        h.update(Some(v4_descriptor()));
        h.clear_recordings();

        h.update(Some(v4_descriptor()));

        assert!(h.devices.calls().is_empty());
        assert!(h.firewall.calls().is_empty());
        assert!(h.dispatch.events().is_empty());
        assert!(h.status.updates().is_empty());
    }

    #[test]
    fn test_updates_in_one_batch_coalesce() {
        let mut h = Harness::new(IpFamily::V4);
        let first = v4_descriptor();
        let second = v4_descriptor().with_net("10.0.0.2/32".parse().unwrap());

        h.step(vec![
            EndpointMessage::EndpointUpdate {
                descriptor: Some(first),
                force_reprogram: false,
            },
            EndpointMessage::EndpointUpdate {
                descriptor: Some(second),
                force_reprogram: false,
            },
        ]);

        let route_calls: Vec<DeviceCall> = h
            .devices
            .calls()
            .into_iter()
            .filter(|c| matches!(c, DeviceCall::SetRoutes { .. }))
            .collect();
        assert_eq!(
            route_calls,
            vec![set_routes(IpFamily::V4, &["10.0.0.1", "10.0.0.2"], Some(MAC), true)]
        );
        assert_eq!(h.firewall.calls().len(), 1);
    }

    #[test]
    fn test_mac_change_resets_arp_v4() {
        let mut h = Harness::new(IpFamily::V4);
        h.update(Some(v4_descriptor()));
        h.clear_recordings();

        let new_mac = "11:22:33:44:55:66";
        let mut changed = v4_descriptor();
        changed.mac = new_mac.to_string();
        h.update(Some(changed));

        assert_eq!(
            h.devices.calls(),
            vec![
                DeviceCall::ConfigureV4 {
                    name: "tapabcdef".to_string()
                },
                set_routes(IpFamily::V4, &["10.0.0.1"], Some(new_mac), true),
            ]
        );
        // The MAC guard lives in the egress chain.
        assert_eq!(h.firewall.calls().len(), 1);
    }

    #[test]
    fn test_mac_change_never_resets_arp_v6() {
        let mut h = Harness::new(IpFamily::V6);
        h.update(Some(v6_descriptor()));

        let gateway: Ipv6Addr = "2001::ffff".parse().unwrap();
        assert_eq!(
            h.devices.take_calls(),
            vec![
                DeviceCall::ConfigureV6 {
                    name: "tapabcdef".to_string(),
                    gateway: Some(gateway),
                },
                set_routes(IpFamily::V6, &["2001::1"], Some(MAC), false),
            ]
        );

        let new_mac = "11:22:33:44:55:66";
        let mut changed = v6_descriptor();
        changed.mac = new_mac.to_string();
        h.update(Some(changed));

        assert_eq!(
            h.devices.calls(),
            vec![
                DeviceCall::ConfigureV6 {
                    name: "tapabcdef".to_string(),
                    gateway: Some(gateway),
                },
                set_routes(IpFamily::V6, &["2001::1"], Some(new_mac), false),
            ]
        );
    }

    #[test]
    fn test_nat_change_refreshes_routes_and_chains() {
        let mut h = Harness::new(IpFamily::V4);
        h.update(Some(v4_descriptor()));
        h.clear_recordings();

        let with_nat = v4_descriptor().with_nat(NatMapping {
            in_ip: "1.2.3.4".parse().unwrap(),
            out_ip: "5.6.7.8".parse().unwrap(),
        });
        h.update(Some(with_nat.clone()));

        assert!(h
            .devices
            .calls()
            .contains(&set_routes(IpFamily::V4, &["1.2.3.4", "10.0.0.1"], Some(MAC), true)));
        assert_eq!(h.firewall.calls().len(), 1);

        let last_nat = h.nat.updates().pop().unwrap();
        assert_eq!(last_nat.mappings, with_nat.ipv4_nat);
    }

    #[test]
    fn test_profile_change_only_touches_firewall() {
        let mut h = Harness::new(IpFamily::V4);
        h.update(Some(v4_descriptor()));
        h.clear_recordings();

        h.update(Some(v4_descriptor().with_profiles(["prof2"])));

        assert!(h.devices.calls().is_empty());
        match h.firewall.calls().as_slice() {
            [FirewallCall::Rewrite(compiled)] => {
                let deps = &compiled.dependencies["felix-from-abcdef"];
                assert!(deps.contains("felix-p-prof2-o"));
                assert!(!deps.contains("felix-p-prof1-o"));
            }
            other => panic!("unexpected firewall calls: {other:?}"),
        }
    }

    #[test]
    fn test_network_change_only_touches_device() {
        let mut h = Harness::new(IpFamily::V4);
        h.update(Some(v4_descriptor()));
        h.clear_recordings();

        let mut changed = v4_descriptor();
        changed.ipv4_nets = vec![IpNetwork::host("10.0.0.2".parse().unwrap())];
        h.update(Some(changed));

        assert!(h.firewall.calls().is_empty());
        assert!(h
            .devices
            .calls()
            .contains(&set_routes(IpFamily::V4, &["10.0.0.2"], Some(MAC), true)));
    }

    #[test]
    fn test_admin_state_change_reprograms_both() {
        let mut h = Harness::new(IpFamily::V4);
        h.update(Some(v4_descriptor()));
        h.clear_recordings();

        h.update(Some(v4_descriptor().with_state(AdminState::Inactive)));

        assert_eq!(h.devices.calls().len(), 2);
        assert_eq!(h.firewall.calls().len(), 1);
        assert_eq!(h.status.statuses(), vec![Some(EndpointStatus::Down)]);
    }

    #[test]
    fn test_force_reprogram() {
        let mut h = Harness::new(IpFamily::V4);
        h.update(Some(v4_descriptor()));
        h.clear_recordings();

        h.step(vec![EndpointMessage::EndpointUpdate {
            descriptor: Some(v4_descriptor()),
            force_reprogram: true,
        }]);

        assert_eq!(h.devices.calls().len(), 2);
        assert_eq!(h.firewall.calls().len(), 1);
        assert!(h.status.updates().is_empty());
    }

    #[test]
    fn test_interface_update_reprograms_device() {
        let mut h = Harness::new(IpFamily::V4);
        h.devices.set_interface("tapabcdef", true, false);
        h.update(Some(v4_descriptor()));
        assert!(h.actor.flags().device_in_sync);
        assert_eq!(h.status.take_updates().len(), 1);
        assert_eq!(h.actor.current_status(), Some(EndpointStatus::Down));
        h.clear_recordings();

        h.step(vec![EndpointMessage::InterfaceUpdate { admin_up: true }]);

        assert_eq!(
            h.devices.calls(),
            vec![
                DeviceCall::ConfigureV4 {
                    name: "tapabcdef".to_string()
                },
                set_routes(IpFamily::V4, &["10.0.0.1"], Some(MAC), true),
            ]
        );
        assert!(h.firewall.calls().is_empty());
        assert!(h.actor.flags().device_in_sync);
        assert_eq!(h.status.statuses(), vec![Some(EndpointStatus::Up)]);
    }

    #[test]
    fn test_device_failure_before_first_sync_is_down() {
        let mut h = Harness::new(IpFamily::V6);
        h.devices.set_fail_configure(true);
        h.update(Some(v6_descriptor()));

        assert!(!h.actor.flags().device_in_sync);
        assert!(h.actor.flags().iptables_in_sync);
        assert_eq!(h.status.statuses(), vec![Some(EndpointStatus::Down)]);
    }

    #[test]
    fn test_device_failure_after_sync_is_error_and_retries() {
        let mut h = Harness::new(IpFamily::V6);
        h.update(Some(v6_descriptor()));
        h.clear_recordings();

        h.devices.set_fail_configure(true);
        h.step(vec![EndpointMessage::InterfaceUpdate { admin_up: false }]);
        assert!(h.actor.flags().device_has_been_in_sync());
        assert_eq!(h.status.statuses(), vec![Some(EndpointStatus::Error)]);

        // Interface missing, then down, then present and up again.
        h.devices.set_interface("tapabcdef", false, false);
        h.step(vec![EndpointMessage::InterfaceUpdate { admin_up: true }]);
        h.devices.set_interface("tapabcdef", true, false);
        h.step(vec![EndpointMessage::InterfaceUpdate { admin_up: true }]);
        assert!(!h.actor.flags().device_in_sync);

        h.devices.set_fail_configure(false);
        h.step(vec![EndpointMessage::InterfaceUpdate { admin_up: true }]);
        assert!(h.actor.flags().device_in_sync);
        assert_eq!(
            h.status.statuses(),
            vec![Some(EndpointStatus::Error), Some(EndpointStatus::Up)]
        );
    }

    #[test]
    fn test_firewall_failure_is_error_and_independent() {
        let mut h = Harness::new(IpFamily::V4);
        h.firewall.set_fail(true);
        h.update(Some(v4_descriptor()));

        assert!(!h.actor.flags().iptables_in_sync);
        assert!(h.actor.flags().device_in_sync);
        assert_eq!(h.status.statuses(), vec![Some(EndpointStatus::Error)]);
        assert!(h.nat.updates().is_empty());

        h.firewall.set_fail(false);
        h.step(vec![EndpointMessage::InterfaceUpdate { admin_up: true }]);
        assert!(h.actor.flags().fully_in_sync());
        assert_eq!(
            h.status.statuses(),
            vec![Some(EndpointStatus::Error), Some(EndpointStatus::Up)]
        );
    }

    #[test]
    fn test_delete_clears_routes_and_flags() {
        let mut h = Harness::new(IpFamily::V4);
        h.update(Some(v4_descriptor()));
        h.clear_recordings();

        h.update(None);

        assert_eq!(
            h.devices.calls(),
            vec![set_routes(IpFamily::V4, &[], None, false)]
        );
        assert_eq!(
            h.dispatch.events(),
            vec![DispatchEvent::Removed("tapabcdef".to_string())]
        );
        assert!(h.firewall.calls().is_empty());
        assert!(h.actor.endpoint().is_none());
        assert!(!h.actor.flags().iptables_in_sync);
        assert!(!h.actor.flags().device_in_sync);
        assert!(!h.actor.flags().device_has_been_in_sync());
        assert!(h.nat.updates().last().unwrap().mappings.is_empty());
        assert_eq!(h.status.statuses(), vec![Some(EndpointStatus::Down)]);
    }

    #[test]
    fn test_interface_rename_moves_routes_and_chains() {
        let mut h = Harness::new(IpFamily::V4);
        h.update(Some(v4_descriptor()));
        h.clear_recordings();

        let mut renamed = v4_descriptor();
        renamed.name = "tap123456".to_string();
        h.update(Some(renamed));

        let calls = h.devices.calls();
        assert_eq!(calls[0], set_routes(IpFamily::V4, &[], None, false));
        assert_eq!(
            h.dispatch.events(),
            vec![
                DispatchEvent::Removed("tapabcdef".to_string()),
                DispatchEvent::Added("tap123456".to_string()),
            ]
        );
        let firewall_calls = h.firewall.calls();
        assert_eq!(
            firewall_calls[0],
            FirewallCall::Delete(chain_names("abcdef"))
        );
        assert!(matches!(firewall_calls[1], FirewallCall::Rewrite(_)));
        assert!(h.firewall.table().is_programmed("felix-to-123456"));
        assert!(!h.firewall.table().is_programmed("felix-to-abcdef"));
    }

    #[test]
    fn test_unreferenced_tears_down_and_notifies_once() {
        let mut h = Harness::new(IpFamily::V6);
        h.update(Some(v6_descriptor()));
        h.clear_recordings();

        let outcome = h.step(vec![
            EndpointMessage::EndpointUpdate {
                descriptor: None,
                force_reprogram: false,
            },
            EndpointMessage::Unreferenced,
        ]);

        assert_eq!(outcome, BatchOutcome::Stop);
        assert_eq!(
            h.devices.calls(),
            vec![set_routes(IpFamily::V6, &[], None, false)]
        );
        assert_eq!(
            h.firewall.calls(),
            vec![FirewallCall::Delete(chain_names("abcdef"))]
        );
        assert_eq!(h.status.statuses(), vec![None]);

        let cleanups = h.cleanup.calls.lock().unwrap().clone();
        assert_eq!(cleanups.len(), 1);
        assert_eq!(cleanups[0].0, *h.actor.id());
        assert_eq!(cleanups[0].1, "endpoint_test");
    }

    #[test]
    fn test_unreferenced_without_descriptor_withdraws_status() {
        let mut h = Harness::new(IpFamily::V4);
        h.step(vec![EndpointMessage::Unreferenced]);

        assert_eq!(h.status.statuses(), vec![None]);
        assert!(h.devices.calls().is_empty());
        assert!(h.firewall.calls().is_empty());
        assert_eq!(h.cleanup.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_empty_final_batch_after_unreferenced() {
        let mut h = Harness::new(IpFamily::V4);
        h.update(Some(v4_descriptor()));
        h.actor.handle(EndpointMessage::Unreferenced, &mut h.ctx);

        assert_eq!(h.actor.finish_batch(0, &mut h.ctx), BatchOutcome::Stop);
        assert_eq!(h.cleanup.calls.lock().unwrap().len(), 1);
    }

    #[test]
    #[should_panic(expected = "after cleanup")]
    fn test_batch_after_cleanup_panics() {
        let mut h = Harness::new(IpFamily::V4);
        h.step(vec![EndpointMessage::Unreferenced]);
        h.actor.finish_batch(0, &mut h.ctx);
    }

    #[test]
    #[should_panic(expected = "empty batch")]
    fn test_empty_batch_while_referenced_panics() {
        let mut h = Harness::new(IpFamily::V4);
        h.actor.finish_batch(0, &mut h.ctx);
    }

    #[test]
    fn test_status_reporting_disabled() {
        let mut h = Harness::new(IpFamily::V4);
        h.actor.settings.report_status = false;
        h.update(Some(v4_descriptor()));
        h.step(vec![EndpointMessage::Unreferenced]);

        assert!(h.status.updates().is_empty());
        assert_eq!(h.cleanup.calls.lock().unwrap().len(), 1);
    }
}
