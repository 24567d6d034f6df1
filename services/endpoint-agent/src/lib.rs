//! Warden Endpoint Agent Library
//!
//! The endpoint agent runs on each host and converges the kernel state of
//! every local workload endpoint: interface configuration, routes, and the
//! endpoint's firewall chains. It reports the observed status of each
//! endpoint back to the control plane.
//!
//! ## Architecture
//!
//! ```text
//! EndpointManager(family)
//! └── LocalEndpoint(endpoint_id)   (one actor per endpoint)
//!     ├── DeviceBackend            (interfaces, routes, ARP)
//!     ├── FirewallBackend          (iptables-restore transactions)
//!     ├── DispatchChains / NatManager
//!     └── StatusReporter
//! ```
//!
//! ## Modules
//!
//! - `actors`: Actor framework, endpoint actor, and manager
//! - `devices`: Interface and route programming
//! - `firewall`: Chain programming with reference-tracked profile stubs
//! - `status`: Status reporting

pub mod actors;
pub mod collaborators;
pub mod config;
pub mod devices;
pub mod firewall;
pub mod model;
pub mod status;

// Re-export commonly used types
pub use actors::{Backends, EndpointManager, EndpointSettings, LocalEndpoint};
pub use config::Config;
pub use model::{EndpointDescriptor, EndpointSnapshot, IpFamily, IpNetwork, NatMapping};
