//! Warden Endpoint Agent
//!
//! Converges local workload endpoints and reports their status.
//!
//! ## Architecture
//!
//! - **Managers**: one per IP family, each owning one actor per endpoint
//! - **Backends**: kernel calls in production, recording mocks in dry-run mode
//! - **Status loop**: logs every status transition published by the actors

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use warden_agent::actors::{Backends, EndpointManager, EndpointSettings, MailboxConfig};
use warden_agent::collaborators::{NoopDispatch, NoopNat};
use warden_agent::config::Config;
use warden_agent::devices::{DeviceBackend, LinuxDevices, MockDevices};
use warden_agent::firewall::{FirewallBackend, IptablesUpdater, MockFirewall};
use warden_agent::model::{load_snapshot, IpFamily};
use warden_agent::status::{ChannelStatusReporter, StatusReporter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting warden endpoint agent");
    info!(
        iface_prefix = %config.iface_prefix,
        ipv6_enabled = config.ipv6_enabled,
        report_endpoint_status = config.report_endpoint_status,
        dry_run = config.dry_run,
        "Configuration loaded"
    );

    let (reporter, mut status_rx) = ChannelStatusReporter::new();
    let reporter: Arc<dyn StatusReporter> = Arc::new(reporter);
    let devices: Arc<dyn DeviceBackend> = if config.dry_run {
        Arc::new(MockDevices::new())
    } else {
        Arc::new(LinuxDevices::new())
    };

    let build_manager = |family: IpFamily| {
        let firewall: Arc<dyn FirewallBackend> = if config.dry_run {
            Arc::new(MockFirewall::new())
        } else {
            Arc::new(IptablesUpdater::new(family))
        };
        let backends = Backends {
            devices: Arc::clone(&devices),
            firewall,
            dispatch: Arc::new(NoopDispatch),
            nat: Arc::new(NoopNat),
            status: Arc::clone(&reporter),
        };
        let settings = EndpointSettings {
            family,
            iface_prefix: config.iface_prefix.clone(),
            report_status: config.report_endpoint_status,
        };
        let mailbox = MailboxConfig {
            max_batch_size: config.max_batch_size,
        };
        EndpointManager::new(settings, backends, mailbox)
    };

    let mut v4 = build_manager(IpFamily::V4);
    let mut v6 = config.ipv6_enabled.then(|| build_manager(IpFamily::V6));

    if let Some(path) = &config.endpoints_file {
        let snapshot = load_snapshot(path)?;
        info!(path = %path.display(), endpoints = snapshot.len(), "Loaded endpoint snapshot");
        v4.apply_snapshot(snapshot.clone())?;
        if let Some(v6) = v6.as_mut() {
            v6.apply_snapshot(snapshot)?;
        }
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
            Some(update) = status_rx.recv() => {
                info!(
                    endpoint_id = %update.endpoint_id,
                    family = %update.family,
                    status = update.status.map(|s| s.as_str()).unwrap_or("none"),
                    "Endpoint status changed"
                );
            }
            Some(notice) = v4.next_cleanup() => {
                if let Err(e) = v4.handle_cleanup(notice) {
                    error!(error = %e, "Failed to resume endpoint after cleanup");
                }
            }
            Some(notice) = next_cleanup(v6.as_mut()) => {
                if let Some(v6) = v6.as_mut() {
                    if let Err(e) = v6.handle_cleanup(notice) {
                        error!(error = %e, "Failed to resume endpoint after cleanup");
                    }
                }
            }
        }
    }

    v4.shutdown().await;
    if let Some(v6) = v6.as_mut() {
        v6.shutdown().await;
    }

    info!("Endpoint agent shutdown complete");
    Ok(())
}

async fn next_cleanup(
    manager: Option<&mut EndpointManager>,
) -> Option<warden_agent::actors::CleanupNotice> {
    match manager {
        Some(manager) => manager.next_cleanup().await,
        None => std::future::pending().await,
    }
}
