//! Integration tests: status transition reporting.
//!
//! Endpoints report status only on transitions, withdraw it on teardown, and
//! stay silent when reporting is disabled.

use std::sync::Arc;

use warden_agent::actors::{Backends, EndpointManager, EndpointSettings, MailboxConfig};
use warden_agent::collaborators::{NoopDispatch, NoopNat};
use warden_agent::devices::MockDevices;
use warden_agent::firewall::MockFirewall;
use warden_agent::model::{EndpointDescriptor, IpFamily};
use warden_agent::status::{ChannelStatusReporter, StatusReporter, StatusUpdate};
use warden_id::EndpointId;
use warden_reconcile::{AdminState, EndpointStatus};

fn manager(
    reporter: Arc<dyn StatusReporter>,
    firewall: Arc<MockFirewall>,
    report_status: bool,
) -> EndpointManager {
    let backends = Backends {
        devices: Arc::new(MockDevices::new()),
        firewall,
        dispatch: Arc::new(NoopDispatch),
        nat: Arc::new(NoopNat),
        status: reporter,
    };
    let settings = EndpointSettings {
        family: IpFamily::V4,
        iface_prefix: "tap".to_string(),
        report_status,
    };
    EndpointManager::new(settings, backends, MailboxConfig::default())
}

fn endpoint_id() -> EndpointId {
    EndpointId::new("host1", "k8s", "default.pod", "eth0").unwrap()
}

fn descriptor(state: AdminState) -> EndpointDescriptor {
    EndpointDescriptor::new("tap1234", "aa:bb:cc:dd:ee:ff")
        .with_state(state)
        .with_net("10.0.0.5/32".parse().unwrap())
}

fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<StatusUpdate>) -> Vec<Option<EndpointStatus>> {
    let mut statuses = Vec::new();
    while let Ok(update) = rx.try_recv() {
        assert_eq!(update.endpoint_id, endpoint_id());
        assert_eq!(update.family, IpFamily::V4);
        statuses.push(update.status);
    }
    statuses
}

#[tokio::test]
async fn test_status_follows_transitions() {
    let (reporter, mut rx) = ChannelStatusReporter::new();
    let firewall = Arc::new(MockFirewall::new());
    let mut manager = manager(Arc::new(reporter), firewall.clone(), true);

    let steps = [
        (descriptor(AdminState::Active), Some(EndpointStatus::Up)),
        (descriptor(AdminState::Active), None),
        (descriptor(AdminState::Inactive), Some(EndpointStatus::Down)),
        (descriptor(AdminState::Active), Some(EndpointStatus::Up)),
    ];

    for (descriptor, expected) in steps {
        manager
            .on_endpoint_update(endpoint_id(), Some(descriptor), false)
            .unwrap()
            .unwrap()
            .wait()
            .await
            .unwrap();
        let expected: Vec<Option<EndpointStatus>> = expected.into_iter().map(Some).collect();
        assert_eq!(drain(&mut rx), expected);
    }

    firewall.set_fail(true);
    manager
        .on_endpoint_update(endpoint_id(), Some(descriptor(AdminState::Active)), true)
        .unwrap()
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(drain(&mut rx), vec![Some(EndpointStatus::Error)]);

    manager
        .on_endpoint_update(endpoint_id(), None, false)
        .unwrap()
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(drain(&mut rx), vec![None]);
}

#[tokio::test]
async fn test_status_disabled_reports_nothing() {
    let (reporter, mut rx) = ChannelStatusReporter::new();
    let mut manager = manager(Arc::new(reporter), Arc::new(MockFirewall::new()), false);

    manager
        .on_endpoint_update(endpoint_id(), Some(descriptor(AdminState::Active)), false)
        .unwrap()
        .unwrap()
        .wait()
        .await
        .unwrap();
    manager
        .on_endpoint_update(endpoint_id(), None, false)
        .unwrap()
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert!(drain(&mut rx).is_empty());
    assert!(manager.next_cleanup().await.is_some());
}
