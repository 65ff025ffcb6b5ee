//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use atom_ledger::channel::{live_stream, EventStream};
use atom_ledger::network::{
    ConnectionState, NodeConnection, NodeConnectionProvider, NodeEvent, SubmissionEvent,
};
use atom_ledger::particle::{Particle, SpunParticle, TimestampParticle, TransferrableTokensParticle};
use atom_ledger::{Address, Atom, AtomStatus, ParticleGroup, Result, Rri};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;

/// In-process node: tests push events into address feeds by hand
pub struct MockNode {
    feeds: Mutex<HashMap<Address, mpsc::UnboundedSender<NodeEvent>>>,
    subscribe_calls: AtomicUsize,
    submissions: Mutex<Vec<Arc<Atom>>>,
    submission_script: Mutex<Vec<SubmissionEvent>>,
    lifecycle: broadcast::Sender<ConnectionState>,
}

impl MockNode {
    pub fn new() -> Arc<Self> {
        let (lifecycle, _) = broadcast::channel(16);
        Arc::new(Self {
            feeds: Mutex::new(HashMap::new()),
            subscribe_calls: AtomicUsize::new(0),
            submissions: Mutex::new(Vec::new()),
            submission_script: Mutex::new(Vec::new()),
            lifecycle,
        })
    }

    /// Deliver `event` on the feed of `address`, false if nobody subscribed
    pub fn push(&self, address: &Address, event: NodeEvent) -> bool {
        match self.feeds.lock().get(address) {
            Some(feed) => feed.send(event).is_ok(),
            None => false,
        }
    }

    /// Deliver an atom with `status`
    pub fn push_atom(&self, address: &Address, atom: &Atom, status: AtomStatus) -> bool {
        self.push(
            address,
            NodeEvent::Atom {
                atom: Arc::new(atom.clone()),
                status,
            },
        )
    }

    /// End the feed of `address`
    pub fn end_feed(&self, address: &Address) {
        self.feeds.lock().remove(address);
    }

    /// Broadcast a lifecycle transition
    pub fn set_state(&self, state: ConnectionState) {
        let _ = self.lifecycle.send(state);
    }

    /// Events every later submission reports
    pub fn script_submission(&self, events: Vec<SubmissionEvent>) {
        *self.submission_script.lock() = events;
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn submissions(&self) -> Vec<Arc<Atom>> {
        self.submissions.lock().clone()
    }
}

#[async_trait]
impl NodeConnection for MockNode {
    async fn subscribe(&self, address: &Address) -> Result<EventStream<NodeEvent>> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds.lock().insert(address.clone(), tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn submit_atom(&self, atom: Arc<Atom>) -> Result<EventStream<SubmissionEvent>> {
        self.submissions.lock().push(atom);
        let script = self.submission_script.lock().clone();
        Ok(stream::iter(script).boxed())
    }

    fn lifecycle(&self) -> EventStream<ConnectionState> {
        live_stream("mock-lifecycle", self.lifecycle.subscribe())
    }
}

/// Provider always handing out the same mock node
pub struct MockProvider {
    pub node: Arc<MockNode>,
}

#[async_trait]
impl NodeConnectionProvider for MockProvider {
    async fn connection_for(&self, _address: &Address) -> Result<Arc<dyn NodeConnection>> {
        let connection: Arc<dyn NodeConnection> = self.node.clone();
        Ok(connection)
    }
}

pub fn xrd() -> Rri {
    Rri::token(Address::new("issuer"), "XRD")
}

pub fn tokens(owner: &str, amount: i64, nonce: u64) -> Particle {
    Particle::TransferrableTokens(TransferrableTokensParticle {
        address: Address::new(owner),
        token_definition_reference: xrd(),
        amount: Decimal::from(amount),
        granularity: Decimal::ONE,
        nonce,
        planck: 0,
        token_permissions: BTreeMap::new(),
    })
}

/// Atom with the given particles and a timestamp making it unique
pub fn atom_of(particles: Vec<SpunParticle>, timestamp_ms: i64) -> Atom {
    Atom::new(vec![
        ParticleGroup::new(particles),
        ParticleGroup::new(vec![SpunParticle::up(Particle::Timestamp(
            TimestampParticle { timestamp_ms },
        ))]),
    ])
}

/// Let spawned tasks run
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
