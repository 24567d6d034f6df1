//! # warden-id
//!
//! Endpoint identity types, parsing, and validation.
//!
//! ## Design Principles
//!
//! - An endpoint is identified by where it lives and who owns it, not by a
//!   generated token: `{host}/{orchestrator}/{workload}/{endpoint}`
//! - Every segment is typed so a workload name can never be passed where a
//!   host name is expected
//! - The path form roundtrips exactly (parse → format → parse)
//!
//! ## ID Format
//!
//! Examples:
//! - `compute-01/openstack/instance-7/ep-a1b2`
//! - `node-3/k8s/default.nginx/eth0`
//!
//! Segments are non-empty and may not contain `/`.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;
