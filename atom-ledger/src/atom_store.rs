//! Status-tracked record of every observed atom
//!
//! `AtomStore` is a cloneable handle to the single-writer actor in
//! [`crate::actor`]. `insert` and `update_status` are the only write paths;
//! both publish an [`AtomObservation`] after the write is durable.
//!
//! # Example
//!
//! ```no_run
//! use atom_ledger::{AtomStatus, AtomStore, Config};
//! use atom_ledger::atom::Atom;
//!
//! #[tokio::main]
//! async fn main() -> atom_ledger::Result<()> {
//!     let store = AtomStore::open(&Config::default())?;
//!     let atom = Atom::new(vec![]);
//!
//!     assert!(store.insert(atom.clone(), AtomStatus::Stored).await?);
//!     assert!(!store.insert(atom, AtomStatus::Stored).await?);
//!     Ok(())
//! }
//! ```

use crate::actor::{spawn_atom_store_actor, AtomStoreMessage};
use crate::atom::{Atom, AtomObservation};
use crate::channel::{resyncing_stream, EventChannel, EventStream, Snapshot};
use crate::metrics::Metrics;
use crate::storage::{open_persistence, AtomEntry, AtomPersistence, MemoryPersistence};
use crate::types::{Address, Aid, AtomStatus};
use crate::{Config, Error, Result};
use futures::future;
use futures::stream::StreamExt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Handle to the atom store
#[derive(Clone)]
pub struct AtomStore {
    sender: mpsc::Sender<AtomStoreMessage>,
    events: Arc<EventChannel<AtomObservation>>,
    metrics: Metrics,
}

impl AtomStore {
    /// Spawn a store over `persistence`. Must be called inside a Tokio runtime.
    pub fn new(persistence: Box<dyn AtomPersistence>, config: &Config, metrics: Metrics) -> Self {
        let events = Arc::new(EventChannel::new("atom-store", config.channel_capacity));
        let sender = spawn_atom_store_actor(
            persistence,
            events.clone(),
            metrics.clone(),
            config.mailbox_capacity,
        );

        Self {
            sender,
            events,
            metrics,
        }
    }

    /// Open the backend selected by `config`
    pub fn open(config: &Config) -> Result<Self> {
        let persistence = open_persistence(config)?;
        Ok(Self::new(persistence, config, Metrics::new()?))
    }

    /// Volatile store with default configuration
    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(
            Box::new(MemoryPersistence::new()),
            &Config::default(),
            Metrics::new()?,
        ))
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> AtomStoreMessage,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| Error::Concurrency("Atom store mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Insert a new atom.
    ///
    /// Returns `false` without error if the AID is already stored; later
    /// observations for that AID go through [`AtomStore::update_status`].
    pub async fn insert(&self, atom: impl Into<Arc<Atom>>, status: AtomStatus) -> Result<bool> {
        let atom = atom.into();
        self.request(|response| AtomStoreMessage::Insert {
            atom,
            status,
            response,
        })
        .await
    }

    /// Replace the status of a stored atom.
    ///
    /// Returns `false` if the status is unchanged (nothing is published).
    pub async fn update_status(&self, aid: Aid, status: AtomStatus) -> Result<bool> {
        self.request(|response| AtomStoreMessage::UpdateStatus {
            aid,
            status,
            response,
        })
        .await
    }

    /// Promote `aid` to `target` if its status is still `expected`.
    ///
    /// Returns `false` when the status moved on in the meantime.
    pub async fn promote(&self, aid: Aid, expected: AtomStatus, target: AtomStatus) -> Result<bool> {
        self.request(|response| AtomStoreMessage::Promote {
            aid,
            expected,
            target,
            response,
        })
        .await
    }

    /// Persisted row for `aid`
    pub async fn get_entry(&self, aid: Aid) -> Result<Option<AtomEntry>> {
        self.request(|response| AtomStoreMessage::GetEntry { aid, response })
            .await
    }

    /// Atom for `aid`
    pub async fn get_atom(&self, aid: Aid) -> Result<Option<Arc<Atom>>> {
        Ok(self.get_entry(aid).await?.map(|entry| entry.atom))
    }

    /// Latest status for `aid`
    pub async fn get_status(&self, aid: Aid) -> Result<Option<AtomStatus>> {
        Ok(self.get_entry(aid).await?.map(|entry| entry.status))
    }

    /// Live observations, optionally limited to atoms concerning `address`.
    ///
    /// Nothing published before the call is delivered. A subscriber that
    /// falls behind the channel buffer receives the persisted observations
    /// again and continues from there.
    pub fn get_atom_observations(&self, address: Option<&Address>) -> EventStream<AtomObservation> {
        let receiver = self.events.receiver();
        self.follow(Vec::new(), receiver, address.cloned())
    }

    /// Everything currently persisted, filtered like the live channel
    pub async fn get_stored_atom_observations(
        &self,
        address: Option<&Address>,
    ) -> Result<Vec<AtomObservation>> {
        let address = address.cloned();
        self.request(|response| AtomStoreMessage::GetStored { address, response })
            .await
    }

    /// Persisted observations plus a live stream attached at the same instant.
    ///
    /// Nothing published after the snapshot is missed, and nothing in the
    /// snapshot is delivered again by the live stream.
    pub async fn snapshot_and_subscribe(
        &self,
        address: Option<&Address>,
    ) -> Result<(Vec<AtomObservation>, EventStream<AtomObservation>)> {
        let (history, receiver) = self.snapshot(address.cloned()).await?;
        Ok((history, self.follow(Vec::new(), receiver, address.cloned())))
    }

    /// Status changes of one atom: the current status (if stored) then every
    /// later transition, consecutive duplicates suppressed.
    pub async fn get_atom_status_updates(&self, aid: Aid) -> Result<EventStream<AtomStatus>> {
        let (current, receiver) = self
            .request(|response| AtomStoreMessage::StatusAndSubscribe { aid, response })
            .await?;

        let store = self.clone();
        let statuses = resyncing_stream("atom-status", current, receiver, move || {
            let store = store.clone();
            async move {
                store
                    .request(|response| AtomStoreMessage::StatusAndSubscribe { aid, response })
                    .await
            }
        });

        Ok(statuses
            .filter(move |observation| future::ready(observation.aid() == aid))
            .map(|observation| observation.status)
            .scan(None, |last: &mut Option<AtomStatus>, status| {
                let changed = *last != Some(status);
                *last = Some(status);
                future::ready(Some(changed.then_some(status)))
            })
            .filter_map(future::ready)
            .boxed())
    }

    async fn snapshot(&self, address: Option<Address>) -> Result<Snapshot<AtomObservation>> {
        self.request(|response| AtomStoreMessage::SnapshotAndSubscribe { address, response })
            .await
    }

    /// `history` then `receiver`, re-seeded from a new snapshot on lag
    fn follow(
        &self,
        history: Vec<AtomObservation>,
        receiver: broadcast::Receiver<AtomObservation>,
        address: Option<Address>,
    ) -> EventStream<AtomObservation> {
        let store = self.clone();
        let resync_address = address.clone();
        let stream = resyncing_stream("atom-store", history, receiver, move || {
            let store = store.clone();
            let address = resync_address.clone();
            async move { store.snapshot(address).await }
        });
        filter_by_address(stream, address)
    }

    /// Delete an atom without publishing anything
    pub async fn remove(&self, aid: Aid) -> Result<bool> {
        self.request(|response| AtomStoreMessage::Remove { aid, response })
            .await
    }

    /// Number of stored atoms
    pub async fn len(&self) -> Result<usize> {
        self.request(|response| AtomStoreMessage::Len { response })
            .await
    }

    /// Whether the store is empty
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Metrics shared with the actor
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Shutdown actor
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(AtomStoreMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency("Atom store mailbox closed".to_string()))?;
        Ok(())
    }
}

fn filter_by_address(
    stream: EventStream<AtomObservation>,
    address: Option<Address>,
) -> EventStream<AtomObservation> {
    match address {
        None => stream,
        Some(address) => stream
            .filter(move |observation| {
                future::ready(observation.atom.addresses().contains(&address))
            })
            .boxed(),
    }
}
