//! Actor framework and endpoint actors.
//!
//! ## Design Principles
//!
//! - **One actor per endpoint and family**: each actor owns the applied state
//!   and side effects for a single endpoint
//! - **Message coalescing**: updates queued while an actor is busy are applied
//!   in a single reconciliation pass
//! - **No shared per-endpoint state**: actors only meet at the backends, the
//!   status reporter, and the manager's cleanup channel
//!
//! ## Actor Types
//!
//! - `LocalEndpoint`: converges one endpoint's interface, routes and chains
//! - `EndpointManager`: owns the actors of one family (not itself an actor)

mod endpoint;
mod framework;
mod manager;

pub use endpoint::{
    Backends, CleanupListener, EndpointHandle, EndpointMessage, EndpointSettings, LocalEndpoint,
};
pub use framework::{
    spawn, Actor, ActorContext, ActorError, ActorHandle, ActorRef, ActorState, BatchOutcome,
    Completion, MailboxConfig, Message,
};
pub use manager::{CleanupNotice, CleanupNotifier, EndpointManager};
