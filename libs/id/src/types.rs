//! Typed identity definitions for workload endpoints.
//!
//! Each segment type carries its own label so validation errors name the
//! offending part of the path.

use crate::define_segment;
use crate::IdError;

// =============================================================================
// Segments
// =============================================================================

define_segment!(HostId, "host");
define_segment!(OrchestratorId, "orchestrator");
define_segment!(WorkloadId, "workload");
define_segment!(EndpointName, "endpoint");

// =============================================================================
// Endpoint ID
// =============================================================================

/// Identity of one workload endpoint on one host.
///
/// Used as the correlation key for status reports and cleanup callbacks.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointId {
    pub host: HostId,
    pub orchestrator: OrchestratorId,
    pub workload: WorkloadId,
    pub endpoint: EndpointName,
}

impl EndpointId {
    /// Number of segments in the path form.
    pub const SEGMENTS: usize = 4;

    /// Builds an ID from raw segment strings, validating each one.
    pub fn new(
        host: &str,
        orchestrator: &str,
        workload: &str,
        endpoint: &str,
    ) -> Result<Self, IdError> {
        Ok(Self {
            host: HostId::parse(host)?,
            orchestrator: OrchestratorId::parse(orchestrator)?,
            workload: WorkloadId::parse(workload)?,
            endpoint: EndpointName::parse(endpoint)?,
        })
    }

    /// Parses the path form `{host}/{orchestrator}/{workload}/{endpoint}`.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        let parts: Vec<&str> = s.split('/').collect();
        let [host, orchestrator, workload, endpoint] = parts.as_slice() else {
            return Err(IdError::WrongSegmentCount {
                count: parts.len(),
                actual: s.to_string(),
            });
        };

        Self::new(host, orchestrator, workload, endpoint)
    }
}

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.host, self.orchestrator, self.workload, self.endpoint
        )
    }
}

impl std::str::FromStr for EndpointId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for EndpointId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for EndpointId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================
