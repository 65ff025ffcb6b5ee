//! Single-writer actor behind the atom store
//!
//! This module implements the single-writer pattern using Tokio actors:
//! - One task owns the persistence backend, so every write is atomic per AID
//! - Every event is published after its write, from the same task
//! - Async message passing with backpressure
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │      Ledger / Accounts / submitters (many tasks)      │
//! └─────────────────────┬────────────────────────────────┘
//!                       │
//!                       │ AtomStore (Clone)
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │               mpsc::channel (bounded)                 │
//! └─────────────────────┬────────────────────────────────┘
//!                       │
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │             AtomStoreActor (Single Task)              │
//! │   persistence.insert / update_status                  │
//! │                   │                                   │
//! │                   ▼                                   │
//! │   broadcast AtomObservation (after the write)         │
//! └──────────────────────────────────────────────────────┘
//! ```

use crate::atom::{Atom, AtomObservation};
use crate::channel::{EventChannel, Snapshot};
use crate::metrics::Metrics;
use crate::storage::{AtomEntry, AtomPersistence};
use crate::types::{Address, Aid, AtomStatus};
use crate::{Error, Result};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Message sent to the atom store actor
pub enum AtomStoreMessage {
    /// Insert a new atom (write-once per AID)
    Insert {
        atom: Arc<Atom>,
        status: AtomStatus,
        response: oneshot::Sender<Result<bool>>,
    },

    /// Change the status of a stored atom
    UpdateStatus {
        aid: Aid,
        status: AtomStatus,
        response: oneshot::Sender<Result<bool>>,
    },

    /// Change the status only if it is still `expected`
    Promote {
        aid: Aid,
        expected: AtomStatus,
        target: AtomStatus,
        response: oneshot::Sender<Result<bool>>,
    },

    /// Get one row
    GetEntry {
        aid: Aid,
        response: oneshot::Sender<Result<Option<AtomEntry>>>,
    },

    /// Get persisted observations, optionally for one address
    GetStored {
        address: Option<Address>,
        response: oneshot::Sender<Result<Vec<AtomObservation>>>,
    },

    /// Snapshot persisted observations and attach a live receiver atomically
    SnapshotAndSubscribe {
        address: Option<Address>,
        response: oneshot::Sender<Result<Snapshot<AtomObservation>>>,
    },

    /// Current observation of an AID plus a live receiver, atomically
    StatusAndSubscribe {
        aid: Aid,
        response: oneshot::Sender<Result<Snapshot<AtomObservation>>>,
    },

    /// Delete one row
    Remove {
        aid: Aid,
        response: oneshot::Sender<Result<bool>>,
    },

    /// Count rows
    Len {
        response: oneshot::Sender<Result<usize>>,
    },

    /// Shutdown actor
    Shutdown,
}

/// Actor that owns the persistence backend
pub struct AtomStoreActor {
    /// Storage backend
    persistence: Box<dyn AtomPersistence>,

    /// Mailbox for incoming messages
    mailbox: mpsc::Receiver<AtomStoreMessage>,

    /// Live observation channel
    events: Arc<EventChannel<AtomObservation>>,

    /// Metrics
    metrics: Metrics,
}

impl AtomStoreActor {
    /// Create new actor
    pub fn new(
        persistence: Box<dyn AtomPersistence>,
        mailbox: mpsc::Receiver<AtomStoreMessage>,
        events: Arc<EventChannel<AtomObservation>>,
        metrics: Metrics,
    ) -> Self {
        Self {
            persistence,
            mailbox,
            events,
            metrics,
        }
    }

    /// Run the actor event loop
    pub async fn run(mut self) {
        while let Some(msg) = self.mailbox.recv().await {
            if let AtomStoreMessage::Shutdown = msg {
                break;
            }
            self.handle_message(msg);
        }
        tracing::debug!("Atom store actor stopped");
    }

    /// Handle a single message
    fn handle_message(&mut self, msg: AtomStoreMessage) {
        match msg {
            AtomStoreMessage::Insert {
                atom,
                status,
                response,
            } => {
                let _ = response.send(self.insert(atom, status));
            }

            AtomStoreMessage::UpdateStatus {
                aid,
                status,
                response,
            } => {
                let _ = response.send(self.update_status(aid, status));
            }

            AtomStoreMessage::Promote {
                aid,
                expected,
                target,
                response,
            } => {
                let _ = response.send(self.promote(aid, expected, target));
            }

            AtomStoreMessage::GetEntry { aid, response } => {
                let _ = response.send(self.persistence.find(&aid));
            }

            AtomStoreMessage::GetStored { address, response } => {
                let _ = response.send(self.stored(address.as_ref()));
            }

            AtomStoreMessage::SnapshotAndSubscribe { address, response } => {
                let result = self
                    .stored(address.as_ref())
                    .map(|history| (history, self.events.receiver()));
                let _ = response.send(result);
            }

            AtomStoreMessage::StatusAndSubscribe { aid, response } => {
                let result = self
                    .persistence
                    .find(&aid)
                    .map(|entry| {
                        let current = entry.iter().map(AtomEntry::to_observation).collect();
                        (current, self.events.receiver())
                    });
                let _ = response.send(result);
            }

            AtomStoreMessage::Remove { aid, response } => {
                let _ = response.send(self.persistence.remove(&aid));
            }

            AtomStoreMessage::Len { response } => {
                let _ = response.send(self.persistence.len());
            }

            AtomStoreMessage::Shutdown => {
                // Handled in main loop
            }
        }
    }

    fn insert(&mut self, atom: Arc<Atom>, status: AtomStatus) -> Result<bool> {
        let aid = atom.aid();
        if self.persistence.find(&aid)?.is_some() {
            tracing::trace!(aid = %aid, status = %status, "Duplicate insert dropped");
            return Ok(false);
        }

        let entry = AtomEntry::new(atom, status);
        self.persistence.insert(&entry)?;
        self.metrics.record_atom_inserted();

        tracing::debug!(aid = %aid, status = %status, "Atom inserted");
        self.events.publish(entry.to_observation());
        Ok(true)
    }

    fn update_status(&mut self, aid: Aid, status: AtomStatus) -> Result<bool> {
        let entry = self
            .persistence
            .find(&aid)?
            .ok_or_else(|| Error::AtomNotFound(aid.to_string()))?;

        if entry.status == status {
            return Ok(false);
        }

        let updated_at = Utc::now();
        self.persistence.update_status(&aid, status, updated_at)?;
        self.metrics.record_status_update();

        tracing::debug!(aid = %aid, from = %entry.status, to = %status, "Atom status updated");
        self.events.publish(AtomObservation {
            atom: entry.atom,
            status,
            timestamp: updated_at,
        });
        Ok(true)
    }

    fn promote(&mut self, aid: Aid, expected: AtomStatus, target: AtomStatus) -> Result<bool> {
        match self.persistence.find(&aid)? {
            Some(entry) if entry.status == expected => self.update_status(aid, target),
            Some(entry) => {
                tracing::debug!(aid = %aid, status = %entry.status, target = %target, "Stale promotion skipped");
                Ok(false)
            }
            None => Err(Error::AtomNotFound(aid.to_string())),
        }
    }

    fn stored(&self, address: Option<&Address>) -> Result<Vec<AtomObservation>> {
        let entries = match address {
            Some(address) => self.persistence.find_by_address(address)?,
            None => self.persistence.find_all()?,
        };
        Ok(entries.iter().map(AtomEntry::to_observation).collect())
    }
}

/// Spawn the atom store actor
pub fn spawn_atom_store_actor(
    persistence: Box<dyn AtomPersistence>,
    events: Arc<EventChannel<AtomObservation>>,
    metrics: Metrics,
    mailbox_capacity: usize,
) -> mpsc::Sender<AtomStoreMessage> {
    let (tx, rx) = mpsc::channel(mailbox_capacity.max(1)); // Bounded channel for backpressure
    let actor = AtomStoreActor::new(persistence, rx, events, metrics);

    tokio::spawn(async move {
        actor.run().await;
    });

    tx
}
