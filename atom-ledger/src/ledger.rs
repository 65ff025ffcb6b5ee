//! Per-address orchestration layer
//!
//! The ledger ties the atom store to the network:
//! - one network subscription per address, opened on first demand and kept
//!   until the node closes it
//! - every node notification is written into the store, which drives the
//!   store's live channel
//! - a per-AID finality timer promotes settled statuses to their FINAL form
//!
//! # Example
//!
//! ```no_run
//! use atom_ledger::{AtomStore, Config, Ledger};
//! use atom_ledger::network::NodeConnectionProvider;
//! use atom_ledger::types::Address;
//! use futures::StreamExt;
//! use std::sync::Arc;
//!
//! async fn follow(provider: Arc<dyn NodeConnectionProvider>) -> atom_ledger::Result<()> {
//!     let config = Config::default();
//!     let store = AtomStore::open(&config)?;
//!     let ledger = Ledger::open(&config, store, provider).await?;
//!
//!     let mut observations = ledger.get_atom_observations(&Address::new("alice")).await?;
//!     while let Some(observation) = observations.next().await {
//!         println!("{} {}", observation.aid(), observation.status);
//!     }
//!     Ok(())
//! }
//! ```

use crate::atom::{Atom, AtomObservation};
use crate::channel::{replay_then_live, EventStream};
use crate::metrics::Metrics;
use crate::network::{ConnectionState, NodeConnection, NodeConnectionProvider, NodeEvent, SubmissionEvent};
use crate::types::{Address, Aid, AtomStatus};
use crate::{AtomStore, Config, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Open network subscription for one address
struct Subscription {
    id: u64,
    task: JoinHandle<()>,
}

/// Pending finality promotion for one AID
struct FinalityTimer {
    generation: u64,
    target: AtomStatus,
    task: JoinHandle<()>,
}

struct LedgerInner {
    store: AtomStore,
    provider: Arc<dyn NodeConnectionProvider>,
    finality_time: Duration,
    subscriptions: DashMap<Address, Subscription>,
    heads: DashMap<Address, watch::Sender<bool>>,
    timers: DashMap<Aid, FinalityTimer>,
    next_id: AtomicU64,
    monitor: Mutex<Option<JoinHandle<()>>>,
    metrics: Metrics,
}

/// Main ledger interface
#[derive(Clone)]
pub struct Ledger {
    inner: Arc<LedgerInner>,
}

impl Ledger {
    /// Open ledger with configuration
    pub async fn open(
        config: &Config,
        store: AtomStore,
        provider: Arc<dyn NodeConnectionProvider>,
    ) -> Result<Self> {
        Self::new(store, provider, config.finality_time()).await
    }

    /// Ledger promoting settled atoms after `finality_time` of quiet.
    ///
    /// Atoms already persisted as STORED or EVICTED_CONFLICT_LOSER get a
    /// fresh timer.
    pub async fn new(
        store: AtomStore,
        provider: Arc<dyn NodeConnectionProvider>,
        finality_time: Duration,
    ) -> Result<Self> {
        let metrics = store.metrics().clone();
        let inner = Arc::new(LedgerInner {
            store,
            provider,
            finality_time,
            subscriptions: DashMap::new(),
            heads: DashMap::new(),
            timers: DashMap::new(),
            next_id: AtomicU64::new(0),
            monitor: Mutex::new(None),
            metrics,
        });

        // History and the live feed are taken in one store step; the feed
        // replays the store if the monitor ever falls behind
        let (history, mut live) = inner.store.snapshot_and_subscribe(None).await?;

        let mut rearmed = 0usize;
        for observation in &history {
            if finality_target(observation.status).is_some() {
                inner.monitor_atom_finality(observation);
                rearmed += 1;
            }
        }
        if rearmed > 0 {
            tracing::info!(count = rearmed, "Finality timers re-armed");
        }

        let weak = Arc::downgrade(&inner);
        let monitor = tokio::spawn(async move {
            while let Some(observation) = live.next().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.monitor_atom_finality(&observation);
            }
        });
        *inner.monitor.lock() = Some(monitor);

        Ok(Self { inner })
    }

    /// Stored observations concerning `address`, then live ones.
    ///
    /// Opens the network subscription for `address` unless one is already
    /// open.
    pub async fn get_atom_observations(&self, address: &Address) -> Result<EventStream<AtomObservation>> {
        self.inner.ensure_subscription(address);
        let (history, live) = self.inner.store.snapshot_and_subscribe(Some(address)).await?;
        Ok(replay_then_live(history, live))
    }

    /// Submit `atom` through `connection`.
    ///
    /// The atom is recorded as PENDING first; the returned stream carries its
    /// status transitions from there on.
    pub async fn submit_atom(
        &self,
        atom: impl Into<Arc<Atom>>,
        connection: Arc<dyn NodeConnection>,
    ) -> Result<EventStream<AtomStatus>> {
        let atom = atom.into();
        let aid = atom.aid();
        let store = self.inner.store.clone();

        if !store.insert(atom.clone(), AtomStatus::Pending).await? {
            tracing::debug!(aid = %aid, "Resubmitting known atom");
        }
        let updates = store.get_atom_status_updates(aid).await?;

        tokio::spawn(async move {
            if let Err(e) = forward_submission(&store, connection.as_ref(), atom).await {
                tracing::warn!(aid = %aid, error = %e, "Atom submission aborted");
                if let Err(e) = store.update_status(aid, AtomStatus::SubmissionError).await {
                    tracing::error!(aid = %aid, error = %e, "Failed to record submission error");
                }
            }
        });

        Ok(updates)
    }

    /// Cancel the pending timer for the observed AID, and start a new one if
    /// the status is STORED or EVICTED_CONFLICT_LOSER.
    ///
    /// A timer already pending for the same FINAL status is kept, so replayed
    /// observations do not postpone finality.
    pub fn monitor_atom_finality(&self, observation: &AtomObservation) {
        self.inner.monitor_atom_finality(observation);
    }

    /// Whether a finality promotion is pending for `aid`
    pub fn is_finality_pending(&self, aid: &Aid) -> bool {
        self.inner.timers.contains_key(aid)
    }

    /// `true` once the node delivered the backlog for `address`.
    ///
    /// Resets to `false` when the subscription closes.
    pub fn is_synced(&self, address: &Address) -> watch::Receiver<bool> {
        self.inner.head(address).subscribe()
    }

    /// Whether a network subscription is open for `address`
    pub fn is_subscribed(&self, address: &Address) -> bool {
        self.inner.subscriptions.contains_key(address)
    }

    /// Underlying store
    pub fn store(&self) -> &AtomStore {
        &self.inner.store
    }

    /// Metrics
    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    /// Stop the monitor, every subscription and every pending timer.
    ///
    /// The store keeps running; it may be shared with other ledgers.
    pub fn shutdown(&self) {
        if let Some(monitor) = self.inner.monitor.lock().take() {
            monitor.abort();
        }

        let addresses: Vec<Address> = self.inner.subscriptions.iter().map(|s| s.key().clone()).collect();
        for address in addresses {
            if let Some((_, subscription)) = self.inner.subscriptions.remove(&address) {
                subscription.task.abort();
                self.inner.metrics.subscription_closed();
            }
            self.inner.head(&address).send_replace(false);
        }

        let aids: Vec<Aid> = self.inner.timers.iter().map(|t| *t.key()).collect();
        for aid in aids {
            if let Some((_, timer)) = self.inner.timers.remove(&aid) {
                timer.task.abort();
            }
        }

        tracing::info!("Ledger shut down");
    }
}

impl LedgerInner {
    fn head(&self, address: &Address) -> watch::Sender<bool> {
        self.heads
            .entry(address.clone())
            .or_insert_with(|| watch::channel(false).0)
            .clone()
    }

    fn ensure_subscription(self: &Arc<Self>, address: &Address) {
        if let Entry::Vacant(slot) = self.subscriptions.entry(address.clone()) {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let task = tokio::spawn(run_subscription(
                Arc::downgrade(self),
                self.store.clone(),
                self.provider.clone(),
                self.head(address),
                address.clone(),
                id,
            ));
            slot.insert(Subscription { id, task });
            self.metrics.subscription_opened();
            tracing::debug!(address = %address, "Network subscription opened");
        }
    }

    fn monitor_atom_finality(self: &Arc<Self>, observation: &AtomObservation) {
        let aid = observation.aid();

        // The entry lock is held until the new timer is recorded
        match (self.timers.entry(aid), finality_target(observation.status)) {
            (Entry::Occupied(slot), None) => {
                slot.remove().task.abort();
            }
            (Entry::Vacant(_), None) => {}
            (Entry::Occupied(pending), Some(target)) if pending.get().target == target => {}
            (slot, Some(target)) => {
                if let Entry::Occupied(pending) = &slot {
                    pending.get().task.abort();
                }
                let generation = self.next_id.fetch_add(1, Ordering::Relaxed);
                let task = tokio::spawn(promote_after(
                    Arc::downgrade(self),
                    self.store.clone(),
                    self.finality_time,
                    aid,
                    observation.status,
                    generation,
                ));
                slot.insert(FinalityTimer {
                    generation,
                    target,
                    task,
                });
                tracing::trace!(aid = %aid, target = %target, "Finality timer armed");
            }
        }
    }
}

/// FINAL status a settled status is promoted to
fn finality_target(status: AtomStatus) -> Option<AtomStatus> {
    match status {
        AtomStatus::Stored => Some(AtomStatus::StoredFinal),
        AtomStatus::EvictedConflictLoser => Some(AtomStatus::EvictedConflictLoserFinal),
        _ => None,
    }
}

async fn promote_after(
    ledger: Weak<LedgerInner>,
    store: AtomStore,
    delay: Duration,
    aid: Aid,
    settled: AtomStatus,
    generation: u64,
) {
    tokio::time::sleep(delay).await;

    let Some(inner) = ledger.upgrade() else { return };
    inner.timers.remove_if(&aid, |_, timer| timer.generation == generation);
    let Some(target) = finality_target(settled) else { return };

    // Conditional on the settled status, a transition that raced the timer wins
    match store.promote(aid, settled, target).await {
        Ok(true) => {
            inner.metrics.record_finality_promotion();
            tracing::debug!(aid = %aid, status = %target, "Atom promoted to final");
        }
        Ok(false) => {}
        Err(e) => tracing::warn!(aid = %aid, error = %e, "Finality promotion failed"),
    }
}

async fn run_subscription(
    ledger: Weak<LedgerInner>,
    store: AtomStore,
    provider: Arc<dyn NodeConnectionProvider>,
    head: watch::Sender<bool>,
    address: Address,
    id: u64,
) {
    if let Err(e) = follow_node(&store, provider.as_ref(), &head, &address).await {
        tracing::warn!(address = %address, error = %e, "Network subscription failed");
    }

    head.send_replace(false);
    if let Some(inner) = ledger.upgrade() {
        if inner
            .subscriptions
            .remove_if(&address, |_, subscription| subscription.id == id)
            .is_some()
        {
            inner.metrics.subscription_closed();
        }
    }
    tracing::debug!(address = %address, "Network subscription closed");
}

async fn follow_node(
    store: &AtomStore,
    provider: &dyn NodeConnectionProvider,
    head: &watch::Sender<bool>,
    address: &Address,
) -> Result<()> {
    let connection = provider.connection_for(address).await?;
    // An ended lifecycle stream carries no information, only Closed does
    let mut lifecycle = connection.lifecycle().chain(stream::pending()).boxed();
    let mut events = connection.subscribe(address).await?;

    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(NodeEvent::Atom { atom, status }) => record(store, atom, status).await?,
                Some(NodeEvent::Head) => {
                    head.send_replace(true);
                }
                None => return Ok(()),
            },
            state = lifecycle.next() => {
                if state == Some(ConnectionState::Closed) {
                    return Ok(());
                }
            }
        }
    }
}

/// Write-once insert, falling back to a status update for known atoms
async fn record(store: &AtomStore, atom: Arc<Atom>, status: AtomStatus) -> Result<()> {
    let aid = atom.aid();
    if !store.insert(atom, status).await? {
        store.update_status(aid, status).await?;
    }
    Ok(())
}

async fn forward_submission(
    store: &AtomStore,
    connection: &dyn NodeConnection,
    atom: Arc<Atom>,
) -> Result<()> {
    let aid = atom.aid();
    store.update_status(aid, AtomStatus::Submitting).await?;

    let mut events = connection.submit_atom(atom).await?;
    while let Some(event) = events.next().await {
        if let SubmissionEvent::Failed(failure) = event {
            tracing::warn!(aid = %aid, failure = %failure, "Atom submission failed");
        }
        store.update_status(aid, event.status()).await?;
    }
    Ok(())
}
