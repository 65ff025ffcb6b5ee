//! Accounts and the account system contract
//!
//! An [`Account`] follows the observations of one address and hands each one to
//! its registered [`AccountSystem`]s, one after the other, in registration
//! order. Observations are processed strictly one at a time.

use crate::atom::AtomObservation;
use crate::channel::EventStream;
use crate::ledger::Ledger;
use crate::metrics::Metrics;
use crate::systems::{
    DataAccountSystem, DecryptedData, DecryptionAccountSystem, Decryptor, MessagingAccountSystem,
    TokenDefinitionAccountSystem, TransferAccountSystem,
};
use crate::types::Address;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::future;
use futures::stream::{self, StreamExt};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;

/// Values derived by earlier systems for later ones, fresh per observation
#[derive(Debug, Clone, Default)]
pub struct ProcessedData {
    /// Message payload after decryption
    pub decrypted_data: Option<DecryptedData>,
}

/// Pluggable projection of the observation stream of one address
#[async_trait]
pub trait AccountSystem: Send + Sync + 'static {
    /// Unique name within an account
    fn name(&self) -> &str;

    /// Apply or retract `observation`.
    ///
    /// Called with every observation for the address, duplicates and
    /// retractions included. Observations without relevant particles must be
    /// ignored.
    async fn process_atom_update(
        &self,
        observation: &AtomObservation,
        processed: &mut ProcessedData,
    ) -> Result<()>;

    /// Upcast for typed lookup
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

struct AccountInner {
    address: Address,
    systems: RwLock<IndexMap<String, Arc<dyn AccountSystem>>>,
    in_flight: watch::Sender<usize>,
    processing: tokio::sync::Mutex<()>,
    ledger_synced: Mutex<Option<watch::Receiver<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    metrics: Mutex<Option<Metrics>>,
}

/// One address and its account systems
#[derive(Clone)]
pub struct Account {
    inner: Arc<AccountInner>,
}

impl Account {
    /// Account without systems and without a subscription
    pub fn plain(address: Address) -> Self {
        let (in_flight, _) = watch::channel(0);
        Self {
            inner: Arc::new(AccountInner {
                address,
                systems: RwLock::new(IndexMap::new()),
                in_flight,
                processing: tokio::sync::Mutex::new(()),
                ledger_synced: Mutex::new(None),
                task: Mutex::new(None),
                metrics: Mutex::new(None),
            }),
        }
    }

    /// Account with the default systems registered, not subscribed.
    ///
    /// Decryption runs first so that messaging and transfer see the
    /// decrypted payload.
    pub fn with_default_systems(address: Address, decryptor: Arc<dyn Decryptor>) -> Result<Self> {
        let account = Self::plain(address.clone());
        account.add_account_system(Arc::new(DecryptionAccountSystem::new(decryptor)))?;
        account.add_account_system(Arc::new(TransferAccountSystem::new(address.clone())))?;
        account.add_account_system(Arc::new(TokenDefinitionAccountSystem::new()))?;
        account.add_account_system(Arc::new(DataAccountSystem::new()))?;
        account.add_account_system(Arc::new(MessagingAccountSystem::new(address)))?;
        Ok(account)
    }

    /// Account with the default systems, following `ledger`
    pub async fn open(address: Address, ledger: &Ledger, decryptor: Arc<dyn Decryptor>) -> Result<Self> {
        let account = Self::with_default_systems(address, decryptor)?;
        account.subscribe_to(ledger).await?;
        Ok(account)
    }

    /// Tracked address
    pub fn address(&self) -> &Address {
        &self.inner.address
    }

    /// Register `system`.
    ///
    /// Fails if a system with the same name is already registered.
    pub fn add_account_system(&self, system: Arc<dyn AccountSystem>) -> Result<()> {
        let mut systems = self.inner.systems.write();
        let name = system.name().to_string();
        if systems.contains_key(&name) {
            return Err(Error::DuplicateSystem(name));
        }
        tracing::debug!(address = %self.inner.address, system = %name, "Account system added");
        systems.insert(name, system);
        Ok(())
    }

    /// Unregister a system, keeping the order of the others
    pub fn remove_account_system(&self, name: &str) -> Option<Arc<dyn AccountSystem>> {
        self.inner.systems.write().shift_remove(name)
    }

    /// Registered system by name
    pub fn get_system(&self, name: &str) -> Result<Arc<dyn AccountSystem>> {
        self.inner
            .systems
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::SystemNotFound(name.to_string()))
    }

    /// Registered system by name, as its concrete type
    pub fn get_system_as<T: AccountSystem>(&self, name: &str) -> Result<Arc<T>> {
        self.get_system(name)?
            .into_any()
            .downcast::<T>()
            .map_err(|_| Error::SystemTypeMismatch(name.to_string()))
    }

    /// Names of registered systems, in processing order
    pub fn system_names(&self) -> Vec<String> {
        self.inner.systems.read().keys().cloned().collect()
    }

    /// Follow the observations of this account's address on `ledger`.
    ///
    /// Replaces any previous subscription.
    pub async fn subscribe_to(&self, ledger: &Ledger) -> Result<()> {
        let mut observations = ledger.get_atom_observations(&self.inner.address).await?;
        let weak = Arc::downgrade(&self.inner);

        let task = tokio::spawn(async move {
            while let Some(observation) = observations.next().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.process(&observation).await;
            }
        });

        if let Some(previous) = self.inner.task.lock().replace(task) {
            previous.abort();
        }
        *self.inner.ledger_synced.lock() = Some(ledger.is_synced(&self.inner.address));
        *self.inner.metrics.lock() = Some(ledger.metrics().clone());
        Ok(())
    }

    /// Hand `observation` to every system in registration order.
    ///
    /// A failing system is logged and skipped; the others still run.
    pub async fn process_atom_observation(&self, observation: &AtomObservation) {
        self.inner.process(observation).await;
    }

    /// Observations currently being processed
    pub fn in_flight(&self) -> usize {
        *self.inner.in_flight.borrow()
    }

    /// Emits `true` each time the account becomes caught up: the ledger
    /// delivered the backlog for this address and no observation is being
    /// processed.
    ///
    /// An account already caught up emits at once. Falling behind emits
    /// nothing; the next `true` follows once it catches up again.
    pub fn is_synced(&self) -> EventStream<bool> {
        let head = match self.inner.ledger_synced.lock().clone() {
            Some(receiver) => WatchStream::new(receiver).boxed(),
            None => stream::once(future::ready(true)).boxed(),
        };
        let idle = WatchStream::new(self.inner.in_flight.subscribe()).map(|count| count == 0);

        stream::select(head.map(SyncSignal::Head), idle.map(SyncSignal::Idle))
            .scan(SyncState::default(), |state, signal| {
                future::ready(Some(state.apply(signal)))
            })
            .filter_map(future::ready)
            .boxed()
    }

    /// Stop following the ledger
    pub fn close(&self) {
        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
        }
        self.inner.ledger_synced.lock().take();
    }
}

impl AccountInner {
    async fn process(&self, observation: &AtomObservation) {
        let _turn = self.processing.lock().await;
        self.in_flight.send_modify(|count| *count += 1);
        let started = Instant::now();

        let systems: Vec<Arc<dyn AccountSystem>> = self.systems.read().values().cloned().collect();
        let metrics = self.metrics.lock().clone();
        let mut processed = ProcessedData::default();

        for system in systems {
            if let Err(e) = system.process_atom_update(observation, &mut processed).await {
                tracing::error!(
                    address = %self.address,
                    system = system.name(),
                    aid = %observation.aid(),
                    error = %e,
                    "Account system failed to process atom"
                );
                if let Some(metrics) = &metrics {
                    metrics.record_account_system_error();
                }
            }
        }

        if let Some(metrics) = &metrics {
            metrics.record_observation_duration(started.elapsed().as_secs_f64());
        }
        self.in_flight.send_modify(|count| *count -= 1);
    }
}

enum SyncSignal {
    Head(bool),
    Idle(bool),
}

#[derive(Default)]
struct SyncState {
    head: Option<bool>,
    idle: Option<bool>,
    last: Option<bool>,
}

impl SyncState {
    /// `Some(true)` when the combined value turns true
    fn apply(&mut self, signal: SyncSignal) -> Option<bool> {
        match signal {
            SyncSignal::Head(value) => self.head = Some(value),
            SyncSignal::Idle(value) => self.idle = Some(value),
        }
        let synced = self.head? && self.idle?;
        let turned_true = synced && self.last != Some(true);
        self.last = Some(synced);
        turned_true.then_some(true)
    }
}
