//! Node connection collaborators
//!
//! Transport and node discovery live outside this crate. The ledger only needs
//! a way to follow the atoms of one address and to submit an atom, both
//! exposed as streams.

use crate::atom::Atom;
use crate::channel::EventStream;
use crate::types::{Address, AtomStatus};
use crate::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Item of an address subscription
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// The node reports `atom` with `status`
    Atom {
        /// Reported atom
        atom: Arc<Atom>,
        /// Status reported with it
        status: AtomStatus,
    },

    /// Backlog for the subscription has been delivered
    Head,
}

/// Why a node refused or dropped a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionFailure {
    /// Atom failed validation
    ValidationError,
    /// Atom collides with another atom
    Collision,
    /// Node is in a state that cannot accept the atom
    IllegalState,
    /// Node does not serve the atom's shards
    UnsuitablePeer,
    /// No final answer within the connection's timeout
    Timeout,
}

impl fmt::Display for SubmissionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubmissionFailure::ValidationError => "VALIDATION_ERROR",
            SubmissionFailure::Collision => "COLLISION",
            SubmissionFailure::IllegalState => "ILLEGAL_STATE",
            SubmissionFailure::UnsuitablePeer => "UNSUITABLE_PEER",
            SubmissionFailure::Timeout => "TIMEOUT",
        };
        f.write_str(name)
    }
}

/// Item of a submission stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionEvent {
    /// Regular status transition
    Status(AtomStatus),

    /// Terminal failure
    Failed(SubmissionFailure),
}

impl SubmissionEvent {
    /// Status to record for this event
    pub fn status(&self) -> AtomStatus {
        match self {
            SubmissionEvent::Status(status) => *status,
            SubmissionEvent::Failed(_) => AtomStatus::SubmissionError,
        }
    }
}

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connection is usable
    Open,
    /// Connection went away, subscriptions must be reopened
    Closed,
}

/// Connection to one node
#[async_trait]
pub trait NodeConnection: Send + Sync {
    /// Follow every atom concerning `address`
    async fn subscribe(&self, address: &Address) -> Result<EventStream<NodeEvent>>;

    /// Submit `atom` and follow its progress
    async fn submit_atom(&self, atom: Arc<Atom>) -> Result<EventStream<SubmissionEvent>>;

    /// Lifecycle transitions from now on
    fn lifecycle(&self) -> EventStream<ConnectionState>;
}

/// Finds a node serving an address
#[async_trait]
pub trait NodeConnectionProvider: Send + Sync {
    /// Connection able to serve `address`
    async fn connection_for(&self, address: &Address) -> Result<Arc<dyn NodeConnection>>;
}
