//! Balances and the spendable particle set
//!
//! Every transferrable-tokens particle owned by the tracked address moves the
//! balance of its token. UP particles become unspent consumables until a DOWN
//! particle with the same identity spends them. Both are counted per particle
//! identity, and retraction takes the counts back and subtracts the deltas
//! again, so a DOWN seen without its UP never leaves an unspent particle
//! behind.
//!
//! Amounts are checked before anything is written, an atom whose amounts
//! overflow is rejected as a whole.

use crate::account::{AccountSystem, ProcessedData};
use crate::atom::{Atom, AtomObservation};
use crate::channel::{replaying_stream, EventChannel, EventStream};
use crate::particle::{Particle, TransferrableTokensParticle};
use crate::systems::{DecryptionState, TRANSFER, UPDATE_CHANNEL_CAPACITY};
use crate::types::{Address, Aid, AtomOperation, ParticleId, Rri, Spin};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Token amounts keyed by token
pub type BalanceUpdate = HashMap<Rri, Decimal>;

/// Effect of one atom on the tracked address
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    /// Atom identifier
    pub aid: Aid,
    /// Per-token change, fee excluded
    pub balance: HashMap<Rri, Decimal>,
    /// Per-token fee paid
    pub fee: HashMap<Rri, Decimal>,
    /// Other owners of tokens moved by the atom
    pub participants: BTreeSet<Address>,
    /// Atom timestamp, or observation time if the atom carries none
    pub timestamp: DateTime<Utc>,
    /// Attached message, if it could be read
    pub message: Option<String>,
}

/// Transaction applied or retracted
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionUpdate {
    /// STORE when applied, DELETE when retracted
    pub action: AtomOperation,
    /// Atom identifier
    pub aid: Aid,
    /// The transaction
    pub transaction: Transaction,
}

/// How often applied transactions received and spent one particle
struct Consumable {
    particle: TransferrableTokensParticle,
    received: usize,
    spends: usize,
}

impl Consumable {
    fn is_unspent(&self) -> bool {
        self.received > 0 && self.spends == 0
    }

    fn is_spent(&self) -> bool {
        self.spends > 0
    }
}

#[derive(Default)]
struct TransferState {
    transactions: IndexMap<Aid, Transaction>,
    balance: HashMap<Rri, Decimal>,
    consumables: HashMap<ParticleId, Consumable>,
}

/// Balance tracking for one address
pub struct TransferAccountSystem {
    address: Address,
    state: Arc<Mutex<TransferState>>,
    transaction_updates: Arc<EventChannel<TransactionUpdate>>,
    balance_updates: Arc<EventChannel<BalanceUpdate>>,
}

impl TransferAccountSystem {
    /// System tracking `address`
    pub fn new(address: Address) -> Self {
        Self {
            address,
            state: Arc::new(Mutex::new(TransferState::default())),
            transaction_updates: Arc::new(EventChannel::new("transactions", UPDATE_CHANNEL_CAPACITY)),
            balance_updates: Arc::new(EventChannel::new("balance", UPDATE_CHANNEL_CAPACITY)),
        }
    }

    /// Tracked address
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Every known transaction as a STORE update, then live updates
    pub fn get_all_transactions(&self) -> EventStream<TransactionUpdate> {
        let state = self.state.clone();
        let channel = self.transaction_updates.clone();
        replaying_stream("transactions", move || {
            let state = state.lock();
            let history = state
                .transactions
                .values()
                .map(|transaction| TransactionUpdate {
                    action: AtomOperation::Store,
                    aid: transaction.aid,
                    transaction: transaction.clone(),
                })
                .collect();
            (history, channel.receiver())
        })
    }

    /// Known transaction for `aid`
    pub fn get_transaction(&self, aid: &Aid) -> Option<Transaction> {
        self.state.lock().transactions.get(aid).cloned()
    }

    /// Current balance of every token held
    pub fn get_balance(&self) -> BalanceUpdate {
        self.state.lock().balance.clone()
    }

    /// Current balance of one token, zero if never held
    pub fn get_token_balance(&self, rri: &Rri) -> Decimal {
        self.state
            .lock()
            .balance
            .get(rri)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Current balance, then every later balance
    pub fn get_balance_updates(&self) -> EventStream<BalanceUpdate> {
        let state = self.state.clone();
        let channel = self.balance_updates.clone();
        replaying_stream("balance", move || {
            let state = state.lock();
            (vec![state.balance.clone()], channel.receiver())
        })
    }

    /// Particles the address may spend
    pub fn get_unspent_consumables(&self) -> Vec<TransferrableTokensParticle> {
        self.consumables(Consumable::is_unspent)
    }

    /// Particles already spent
    pub fn get_spent_consumables(&self) -> Vec<TransferrableTokensParticle> {
        self.consumables(Consumable::is_spent)
    }

    fn consumables(&self, wanted: fn(&Consumable) -> bool) -> Vec<TransferrableTokensParticle> {
        self.state
            .lock()
            .consumables
            .values()
            .filter(|consumable| wanted(consumable))
            .map(|consumable| consumable.particle.clone())
            .collect()
    }

    fn apply(&self, observation: &AtomObservation, processed: &ProcessedData) -> Result<()> {
        let mut state = self.state.lock();
        let aid = observation.aid();
        if state.transactions.contains_key(&aid) {
            return Ok(());
        }

        let mut transaction = Transaction {
            aid,
            balance: HashMap::new(),
            fee: HashMap::new(),
            participants: BTreeSet::new(),
            timestamp: observation.atom.timestamp().unwrap_or(observation.timestamp),
            message: readable_message(processed),
        };
        self.tally(&observation.atom, &mut transaction)?;
        let balance = rebalanced(&state.balance, &transaction, AtomOperation::Store)?;

        self.move_consumables(&mut state, &observation.atom, AtomOperation::Store);
        state.balance = balance;
        state.transactions.insert(aid, transaction.clone());

        tracing::debug!(address = %self.address, aid = %aid, "Transaction stored");
        self.balance_updates.publish(state.balance.clone());
        self.transaction_updates.publish(TransactionUpdate {
            action: AtomOperation::Store,
            aid,
            transaction,
        });
        Ok(())
    }

    fn retract(&self, observation: &AtomObservation) -> Result<()> {
        let mut state = self.state.lock();
        let aid = observation.aid();
        let balance = match state.transactions.get(&aid) {
            Some(applied) => rebalanced(&state.balance, applied, AtomOperation::Delete)?,
            None => return Ok(()),
        };

        self.move_consumables(&mut state, &observation.atom, AtomOperation::Delete);
        state.balance = balance;
        let Some(applied) = state.transactions.shift_remove(&aid) else {
            return Ok(());
        };

        tracing::debug!(address = %self.address, aid = %aid, "Transaction deleted");
        self.balance_updates.publish(state.balance.clone());
        self.transaction_updates.publish(TransactionUpdate {
            action: AtomOperation::Delete,
            aid,
            transaction: applied,
        });
        Ok(())
    }

    /// Per-token deltas and participants of `atom`, nothing else touched
    fn tally(&self, atom: &Atom, transaction: &mut Transaction) -> Result<()> {
        for group in &atom.particle_groups {
            let is_fee = group.is_fee_group();
            for spun in &group.particles {
                let Particle::TransferrableTokens(tokens) = &spun.particle else {
                    continue;
                };
                if tokens.address != self.address {
                    transaction.participants.insert(tokens.address.clone());
                    continue;
                }

                let rri = &tokens.token_definition_reference;
                let deltas = if is_fee {
                    &mut transaction.fee
                } else {
                    &mut transaction.balance
                };
                let delta = deltas.entry(rri.clone()).or_default();
                *delta = match spun.spin {
                    Spin::Up => delta.checked_add(tokens.amount),
                    Spin::Down => delta.checked_sub(tokens.amount),
                }
                .ok_or_else(|| overflow(rri))?;
            }
        }
        Ok(())
    }

    /// Spent/unspent bookkeeping for the particles of `atom` owned by the
    /// tracked address
    fn move_consumables(&self, state: &mut TransferState, atom: &Atom, operation: AtomOperation) {
        for spun in atom.particle_groups.iter().flat_map(|group| &group.particles) {
            let Particle::TransferrableTokens(tokens) = &spun.particle else {
                continue;
            };
            if tokens.address != self.address {
                continue;
            }

            let id = spun.particle.identity();
            let consumable = state.consumables.entry(id).or_insert_with(|| Consumable {
                particle: tokens.clone(),
                received: 0,
                spends: 0,
            });
            match (spun.spin, operation) {
                (Spin::Up, AtomOperation::Store) => consumable.received += 1,
                (Spin::Up, AtomOperation::Delete) => {
                    consumable.received = consumable.received.saturating_sub(1)
                }
                (Spin::Down, AtomOperation::Store) => consumable.spends += 1,
                (Spin::Down, AtomOperation::Delete) => {
                    consumable.spends = consumable.spends.saturating_sub(1)
                }
            }

            let forgotten = consumable.received == 0 && consumable.spends == 0;
            if forgotten {
                state.consumables.remove(&id);
            }
        }
    }
}

#[async_trait]
impl AccountSystem for TransferAccountSystem {
    fn name(&self) -> &str {
        TRANSFER
    }

    async fn process_atom_update(
        &self,
        observation: &AtomObservation,
        processed: &mut ProcessedData,
    ) -> Result<()> {
        if !observation
            .atom
            .contains(|p| matches!(p, Particle::TransferrableTokens(_)))
        {
            return Ok(());
        }

        match observation.status.operation() {
            AtomOperation::Store => self.apply(observation, processed),
            AtomOperation::Delete => self.retract(observation),
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// `balance` with the deltas of `transaction` added (STORE) or taken back
/// (DELETE), zero entries dropped
fn rebalanced(
    balance: &BalanceUpdate,
    transaction: &Transaction,
    operation: AtomOperation,
) -> Result<BalanceUpdate> {
    let mut next = balance.clone();
    for (rri, delta) in transaction.balance.iter().chain(transaction.fee.iter()) {
        let current = next.get(rri).copied().unwrap_or(Decimal::ZERO);
        let amount = match operation {
            AtomOperation::Store => current.checked_add(*delta),
            AtomOperation::Delete => current.checked_sub(*delta),
        }
        .ok_or_else(|| overflow(rri))?;

        if amount.is_zero() {
            next.remove(rri);
        } else {
            next.insert(rri.clone(), amount);
        }
    }
    Ok(next)
}

fn overflow(rri: &Rri) -> Error {
    Error::InvalidParticle(format!("{} amount out of range", rri))
}

fn readable_message(processed: &ProcessedData) -> Option<String> {
    let decrypted = processed.decrypted_data.as_ref()?;
    match decrypted.state {
        DecryptionState::CannotDecrypt(_) => None,
        _ => Some(String::from_utf8_lossy(&decrypted.data).into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::ParticleGroup;
    use crate::particle::{SpunParticle, TimestampParticle};
    use crate::systems::DecryptedData;
    use crate::types::AtomStatus;
    use futures::StreamExt;
    use std::collections::BTreeMap;

    fn xrd() -> Rri {
        Rri::token(Address::new("issuer"), "XRD")
    }

    fn tokens(owner: &str, amount: i64, nonce: u64) -> Particle {
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

    fn observe(groups: Vec<ParticleGroup>, status: AtomStatus) -> AtomObservation {
        AtomObservation::new(Arc::new(Atom::new(groups)), status)
    }

    async fn process(system: &TransferAccountSystem, observation: &AtomObservation) {
        system
            .process_atom_update(observation, &mut ProcessedData::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_receive_then_spend_with_change() {
        let system = TransferAccountSystem::new(Address::new("alice"));

        let receive = observe(
            vec![ParticleGroup::new(vec![SpunParticle::up(tokens("alice", 50, 1))])],
            AtomStatus::Stored,
        );
        process(&system, &receive).await;
        assert_eq!(system.get_token_balance(&xrd()), Decimal::from(50));
        assert_eq!(system.get_unspent_consumables().len(), 1);

        let spend = observe(
            vec![ParticleGroup::new(vec![
                SpunParticle::down(tokens("alice", 50, 1)),
                SpunParticle::up(tokens("bob", 30, 2)),
                SpunParticle::up(tokens("alice", 20, 3)),
            ])],
            AtomStatus::Stored,
        );
        process(&system, &spend).await;

        assert_eq!(system.get_token_balance(&xrd()), Decimal::from(20));
        let unspent = system.get_unspent_consumables();
        assert_eq!(unspent.len(), 1);
        assert_eq!(unspent[0].amount, Decimal::from(20));
        let spent = system.get_spent_consumables();
        assert_eq!(spent.len(), 1);
        assert_eq!(spent[0].amount, Decimal::from(50));

        let transaction = system.get_transaction(&spend.aid()).unwrap();
        assert_eq!(transaction.balance[&xrd()], Decimal::from(-30));
        assert!(transaction.participants.contains(&Address::new("bob")));
    }

    #[tokio::test]
    async fn test_duplicate_store_applied_once() {
        let system = TransferAccountSystem::new(Address::new("alice"));
        let receive = observe(
            vec![ParticleGroup::new(vec![SpunParticle::up(tokens("alice", 50, 1))])],
            AtomStatus::Stored,
        );
        process(&system, &receive).await;
        process(&system, &receive).await;

        let finalised = AtomObservation::new(receive.atom.clone(), AtomStatus::StoredFinal);
        process(&system, &finalised).await;

        assert_eq!(system.get_token_balance(&xrd()), Decimal::from(50));
    }

    #[tokio::test]
    async fn test_retraction_restores_previous_state() {
        let system = TransferAccountSystem::new(Address::new("alice"));
        let receive = observe(
            vec![ParticleGroup::new(vec![SpunParticle::up(tokens("alice", 50, 1))])],
            AtomStatus::Stored,
        );
        process(&system, &receive).await;

        let spend = observe(
            vec![ParticleGroup::new(vec![
                SpunParticle::down(tokens("alice", 50, 1)),
                SpunParticle::up(tokens("alice", 20, 3)),
            ])],
            AtomStatus::Stored,
        );
        process(&system, &spend).await;

        let evicted = AtomObservation::new(spend.atom.clone(), AtomStatus::EvictedConflictLoser);
        process(&system, &evicted).await;
        // A second retraction is a no-op
        process(&system, &evicted).await;

        assert_eq!(system.get_token_balance(&xrd()), Decimal::from(50));
        assert!(system.get_spent_consumables().is_empty());
        let unspent = system.get_unspent_consumables();
        assert_eq!(unspent.len(), 1);
        assert_eq!(unspent[0].amount, Decimal::from(50));
        assert!(system.get_transaction(&spend.aid()).is_none());
    }

    #[tokio::test]
    async fn test_retracted_spend_of_unknown_particle_leaves_nothing_unspent() {
        let system = TransferAccountSystem::new(Address::new("alice"));
        // The UP of this particle was never observed
        let spend = observe(
            vec![ParticleGroup::new(vec![SpunParticle::down(tokens("alice", 50, 1))])],
            AtomStatus::Stored,
        );
        process(&system, &spend).await;
        assert_eq!(system.get_token_balance(&xrd()), Decimal::from(-50));
        assert_eq!(system.get_spent_consumables().len(), 1);

        let evicted = AtomObservation::new(spend.atom.clone(), AtomStatus::EvictedConflictLoser);
        process(&system, &evicted).await;

        assert!(system.get_balance().is_empty());
        assert!(system.get_unspent_consumables().is_empty());
        assert!(system.get_spent_consumables().is_empty());
    }

    #[tokio::test]
    async fn test_spend_seen_before_receive_is_undone_cleanly() {
        let system = TransferAccountSystem::new(Address::new("alice"));
        let spend = observe(
            vec![ParticleGroup::new(vec![SpunParticle::down(tokens("alice", 50, 1))])],
            AtomStatus::Stored,
        );
        let receive = observe(
            vec![ParticleGroup::new(vec![SpunParticle::up(tokens("alice", 50, 1))])],
            AtomStatus::Stored,
        );
        process(&system, &spend).await;
        process(&system, &receive).await;
        assert!(system.get_unspent_consumables().is_empty());

        // With the UP known, undoing the spend makes the particle spendable
        let evicted = AtomObservation::new(spend.atom.clone(), AtomStatus::EvictedConflictLoser);
        process(&system, &evicted).await;
        assert_eq!(system.get_unspent_consumables().len(), 1);
        assert_eq!(system.get_token_balance(&xrd()), Decimal::from(50));
    }

    #[tokio::test]
    async fn test_overflowing_amount_rejected_without_side_effects() {
        let system = TransferAccountSystem::new(Address::new("alice"));
        let huge = |nonce| {
            Particle::TransferrableTokens(TransferrableTokensParticle {
                address: Address::new("alice"),
                token_definition_reference: xrd(),
                amount: Decimal::MAX,
                granularity: Decimal::ONE,
                nonce,
                planck: 0,
                token_permissions: BTreeMap::new(),
            })
        };

        let first = observe(
            vec![ParticleGroup::new(vec![SpunParticle::up(huge(1))])],
            AtomStatus::Stored,
        );
        process(&system, &first).await;

        let second = observe(
            vec![ParticleGroup::new(vec![SpunParticle::up(huge(2))])],
            AtomStatus::Stored,
        );
        let result = system
            .process_atom_update(&second, &mut ProcessedData::default())
            .await;
        assert!(matches!(result, Err(Error::InvalidParticle(_))));

        assert_eq!(system.get_token_balance(&xrd()), Decimal::MAX);
        assert_eq!(system.get_unspent_consumables().len(), 1);
        assert!(system.get_transaction(&second.aid()).is_none());

        // Both UP and DOWN of the same huge amount in one atom cancel out
        let churn = observe(
            vec![ParticleGroup::new(vec![
                SpunParticle::down(huge(1)),
                SpunParticle::up(huge(3)),
            ])],
            AtomStatus::Stored,
        );
        process(&system, &churn).await;
        assert_eq!(system.get_token_balance(&xrd()), Decimal::MAX);
    }

    #[tokio::test]
    async fn test_retraction_of_unknown_atom_ignored() {
        let system = TransferAccountSystem::new(Address::new("alice"));
        let evicted = observe(
            vec![ParticleGroup::new(vec![SpunParticle::up(tokens("alice", 50, 1))])],
            AtomStatus::ConflictLoser,
        );
        process(&system, &evicted).await;
        assert!(system.get_balance().is_empty());
        assert!(system.get_unspent_consumables().is_empty());
    }

    #[tokio::test]
    async fn test_fee_reported_separately() {
        let system = TransferAccountSystem::new(Address::new("alice"));
        let observation = observe(
            vec![
                ParticleGroup::new(vec![SpunParticle::up(tokens("alice", 10, 1))]),
                ParticleGroup::fee(vec![SpunParticle::down(tokens("alice", 10, 1))]),
            ],
            AtomStatus::Stored,
        );
        process(&system, &observation).await;

        let transaction = system.get_transaction(&observation.aid()).unwrap();
        assert_eq!(transaction.balance[&xrd()], Decimal::from(10));
        assert_eq!(transaction.fee[&xrd()], Decimal::from(-10));
        assert_eq!(system.get_token_balance(&xrd()), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_irrelevant_atom_ignored() {
        let system = TransferAccountSystem::new(Address::new("alice"));
        let observation = observe(
            vec![ParticleGroup::new(vec![SpunParticle::up(Particle::Timestamp(
                TimestampParticle { timestamp_ms: 1 },
            ))])],
            AtomStatus::Stored,
        );
        process(&system, &observation).await;
        assert!(system.get_transaction(&observation.aid()).is_none());
    }

    #[tokio::test]
    async fn test_message_attached_from_processed_data() {
        let system = TransferAccountSystem::new(Address::new("alice"));
        let observation = observe(
            vec![ParticleGroup::new(vec![SpunParticle::up(tokens("alice", 5, 1))])],
            AtomStatus::Stored,
        );
        let mut processed = ProcessedData {
            decrypted_data: Some(DecryptedData {
                data: b"for lunch".to_vec(),
                state: DecryptionState::Decrypted,
            }),
        };
        system
            .process_atom_update(&observation, &mut processed)
            .await
            .unwrap();

        let transaction = system.get_transaction(&observation.aid()).unwrap();
        assert_eq!(transaction.message.as_deref(), Some("for lunch"));
    }

    #[tokio::test]
    async fn test_new_subscriber_gets_history_then_live() {
        let system = TransferAccountSystem::new(Address::new("alice"));
        let first = observe(
            vec![ParticleGroup::new(vec![SpunParticle::up(tokens("alice", 5, 1))])],
            AtomStatus::Stored,
        );
        process(&system, &first).await;

        let mut updates = system.get_all_transactions();
        let evicted = AtomObservation::new(first.atom.clone(), AtomStatus::SubmissionError);
        process(&system, &evicted).await;

        let replayed = updates.next().await.unwrap();
        assert_eq!(replayed.action, AtomOperation::Store);
        assert_eq!(replayed.aid, first.aid());

        let live = updates.next().await.unwrap();
        assert_eq!(live.action, AtomOperation::Delete);
        assert_eq!(live.aid, first.aid());
    }

    #[tokio::test]
    async fn test_balance_updates_start_with_current_balance() {
        let system = TransferAccountSystem::new(Address::new("alice"));
        let mut updates = system.get_balance_updates();
        assert!(updates.next().await.unwrap().is_empty());

        let receive = observe(
            vec![ParticleGroup::new(vec![SpunParticle::up(tokens("alice", 7, 1))])],
            AtomStatus::Stored,
        );
        process(&system, &receive).await;
        assert_eq!(updates.next().await.unwrap()[&xrd()], Decimal::from(7));
    }
}
