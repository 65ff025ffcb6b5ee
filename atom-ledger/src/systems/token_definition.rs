//! Token definitions and supply
//!
//! Particle groups are reduced by kind:
//!
//! | group contains                         | reducer     |
//! |----------------------------------------|-------------|
//! | fixed supply definition                | FIXED       |
//! | mutable supply definition              | MUTABLE     |
//! | unallocated and transferrable tokens   | UNALLOCATED |
//!
//! The UNALLOCATED reducer tells MINT from BURN with the valid-operation
//! table: `(UP, STORE)` and `(DOWN, DELETE)` put a particle into the pool and
//! take its amount out of the supply, the two other pairings do the opposite.
//! Retracting an atom runs the same reducers with the operation flipped.
//! An atom is reduced into a staged copy of the definitions it touches, so a
//! supply that leaves the decimal range rejects the atom without changing
//! anything.

use crate::account::{AccountSystem, ProcessedData};
use crate::atom::{AtomObservation, ParticleGroup};
use crate::channel::{replaying_stream, EventChannel, EventStream};
use crate::particle::{
    FixedSupplyTokenDefinitionParticle, MutableSupplyTokenDefinitionParticle, Particle,
    UnallocatedTokensParticle,
};
use crate::systems::{TOKEN_DEFINITION, UPDATE_CHANNEL_CAPACITY};
use crate::types::{Address, Aid, AtomOperation, ParticleId, Spin};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::future;
use futures::StreamExt;
use indexmap::IndexMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// How the supply of a token evolves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSupplyType {
    /// Issued once at creation
    Fixed,
    /// Minted and burned over time
    Mutable,
}

/// Known state of one token
#[derive(Debug, Clone, PartialEq)]
pub struct TokenDefinition {
    /// Owner of the token RRI
    pub address: Address,
    /// Unique part of the RRI
    pub symbol: String,
    /// Display name
    pub name: String,
    /// Free text description
    pub description: String,
    /// Tokens in circulation
    pub total_supply: Decimal,
    /// Unknown until the defining particle arrives
    pub supply_type: Option<TokenSupplyType>,
    /// Smallest divisible amount
    pub granularity: Decimal,
    /// Pool of unissued tokens, mutable supply only
    pub unallocated_tokens: HashMap<ParticleId, UnallocatedTokensParticle>,
    /// Optional icon location
    pub icon_url: Option<String>,
}

impl TokenDefinition {
    fn empty(address: Address, symbol: String) -> Self {
        Self {
            address,
            symbol,
            name: String::new(),
            description: String::new(),
            total_supply: Decimal::ZERO,
            supply_type: None,
            granularity: Decimal::ZERO,
            unallocated_tokens: HashMap::new(),
            icon_url: None,
        }
    }

    /// Sum of the unissued pool, `None` if it does not fit a decimal
    pub fn unallocated_supply(&self) -> Option<Decimal> {
        self.unallocated_tokens
            .values()
            .try_fold(Decimal::ZERO, |sum, p| sum.checked_add(p.amount))
    }

    fn clear_fields(&mut self) {
        self.name.clear();
        self.description.clear();
        self.supply_type = None;
        self.granularity = Decimal::ZERO;
        self.icon_url = None;
    }

    fn is_blank(&self) -> bool {
        self.supply_type.is_none()
            && self.name.is_empty()
            && self.description.is_empty()
            && self.total_supply.is_zero()
            && self.unallocated_tokens.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupKind {
    Fixed,
    Mutable,
    Unallocated,
}

impl GroupKind {
    fn of(group: &ParticleGroup) -> Option<Self> {
        if group.contains(|p| matches!(p, Particle::FixedSupplyTokenDefinition(_))) {
            Some(GroupKind::Fixed)
        } else if group.contains(|p| matches!(p, Particle::MutableSupplyTokenDefinition(_))) {
            Some(GroupKind::Mutable)
        } else if group.contains(|p| matches!(p, Particle::UnallocatedTokens(_)))
            && group.contains(|p| matches!(p, Particle::TransferrableTokens(_)))
        {
            Some(GroupKind::Unallocated)
        } else {
            None
        }
    }
}

#[derive(Default)]
struct TokenState {
    definitions: HashMap<String, TokenDefinition>,
    processed_aids: HashSet<Aid>,
}

/// Definitions touched by one atom, committed only once every group reduced
struct Staged<'a> {
    committed: &'a HashMap<String, TokenDefinition>,
    changes: IndexMap<String, TokenDefinition>,
}

impl<'a> Staged<'a> {
    fn new(committed: &'a HashMap<String, TokenDefinition>) -> Self {
        Self {
            committed,
            changes: IndexMap::new(),
        }
    }

    fn definition(&mut self, address: &Address, symbol: &str) -> &mut TokenDefinition {
        let committed = self.committed;
        self.changes.entry(symbol.to_string()).or_insert_with(|| {
            committed
                .get(symbol)
                .cloned()
                .unwrap_or_else(|| TokenDefinition::empty(address.clone(), symbol.to_string()))
        })
    }

    fn apply_fixed(
        &mut self,
        particle: &FixedSupplyTokenDefinitionParticle,
        operation: AtomOperation,
    ) -> Result<()> {
        let definition = self.definition(particle.rri.address(), particle.rri.unique());
        match operation {
            AtomOperation::Store => {
                definition.name = particle.name.clone();
                definition.description = particle.description.clone();
                definition.granularity = particle.granularity;
                definition.icon_url = particle.icon_url.clone();
                definition.supply_type = Some(TokenSupplyType::Fixed);
                definition.total_supply = checked(
                    definition.total_supply.checked_add(particle.supply),
                    &definition.symbol,
                )?;
            }
            AtomOperation::Delete => {
                definition.clear_fields();
                definition.total_supply = checked(
                    definition.total_supply.checked_sub(particle.supply),
                    &definition.symbol,
                )?;
            }
        }
        Ok(())
    }

    fn apply_mutable(&mut self, particle: &MutableSupplyTokenDefinitionParticle, operation: AtomOperation) {
        let definition = self.definition(particle.rri.address(), particle.rri.unique());
        match operation {
            AtomOperation::Store => {
                definition.name = particle.name.clone();
                definition.description = particle.description.clone();
                definition.granularity = particle.granularity;
                definition.icon_url = particle.icon_url.clone();
                definition.supply_type = Some(TokenSupplyType::Mutable);
            }
            AtomOperation::Delete => definition.clear_fields(),
        }
    }

    /// Initial pool of a mutable token, supply untouched
    fn seed_pool(&mut self, particle: &UnallocatedTokensParticle, operation: AtomOperation) {
        let rri = &particle.token_definition_reference;
        let id = Particle::UnallocatedTokens(particle.clone()).identity();
        let definition = self.definition(rri.address(), rri.unique());
        match operation {
            AtomOperation::Store => {
                definition.unallocated_tokens.insert(id, particle.clone());
            }
            AtomOperation::Delete => {
                definition.unallocated_tokens.remove(&id);
            }
        }
    }

    /// Mint or burn through the valid-operation table
    fn apply_unallocated(
        &mut self,
        particle: &UnallocatedTokensParticle,
        spin: Spin,
        operation: AtomOperation,
    ) -> Result<()> {
        let rri = &particle.token_definition_reference;
        let id = Particle::UnallocatedTokens(particle.clone()).identity();
        let definition = self.definition(rri.address(), rri.unique());
        let into_pool = matches!(
            (spin, operation),
            (Spin::Up, AtomOperation::Store) | (Spin::Down, AtomOperation::Delete)
        );
        if into_pool {
            definition.total_supply = checked(
                definition.total_supply.checked_sub(particle.amount),
                &definition.symbol,
            )?;
            definition.unallocated_tokens.insert(id, particle.clone());
        } else {
            definition.total_supply = checked(
                definition.total_supply.checked_add(particle.amount),
                &definition.symbol,
            )?;
            definition.unallocated_tokens.remove(&id);
        }
        Ok(())
    }

    /// Reduce one group into the staged definitions
    fn reduce(&mut self, group: &ParticleGroup, operation: AtomOperation) -> Result<()> {
        let Some(kind) = GroupKind::of(group) else {
            return Ok(());
        };

        for spun in &group.particles {
            match (kind, &spun.particle) {
                (GroupKind::Fixed, Particle::FixedSupplyTokenDefinition(p)) if spun.spin == Spin::Up => {
                    self.apply_fixed(p, operation)?;
                }
                (GroupKind::Mutable, Particle::MutableSupplyTokenDefinition(p))
                    if spun.spin == Spin::Up =>
                {
                    self.apply_mutable(p, operation);
                }
                (GroupKind::Mutable, Particle::UnallocatedTokens(p)) if spun.spin == Spin::Up => {
                    self.seed_pool(p, operation);
                }
                (GroupKind::Unallocated, Particle::UnallocatedTokens(p)) => {
                    self.apply_unallocated(p, spun.spin, operation)?;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn checked(amount: Option<Decimal>, symbol: &str) -> Result<Decimal> {
    amount.ok_or_else(|| Error::InvalidParticle(format!("{} supply out of range", symbol)))
}

/// Token definitions seen by one account
pub struct TokenDefinitionAccountSystem {
    state: Arc<Mutex<TokenState>>,
    updates: Arc<EventChannel<TokenDefinition>>,
}

impl TokenDefinitionAccountSystem {
    /// Empty system
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TokenState::default())),
            updates: Arc::new(EventChannel::new("token-definitions", UPDATE_CHANNEL_CAPACITY)),
        }
    }

    /// Current definition of `symbol`
    pub fn get_token_definition(&self, symbol: &str) -> Option<TokenDefinition> {
        self.state.lock().definitions.get(symbol).cloned()
    }

    /// Every known definition
    pub fn get_all_token_definitions(&self) -> Vec<TokenDefinition> {
        self.state.lock().definitions.values().cloned().collect()
    }

    /// Current definition of `symbol` if known, then every later change
    pub fn get_token_definition_observable(&self, symbol: &str) -> EventStream<TokenDefinition> {
        let state = self.state.clone();
        let channel = self.updates.clone();
        let wanted = symbol.to_string();
        let stream = replaying_stream("token-definitions", move || {
            let state = state.lock();
            let current = state.definitions.get(&wanted).cloned().into_iter().collect();
            (current, channel.receiver())
        });

        let symbol = symbol.to_string();
        stream
            .filter(move |definition| future::ready(definition.symbol == symbol))
            .boxed()
    }

    /// Every known definition, then every later change
    pub fn get_all_token_definition_observable(&self) -> EventStream<TokenDefinition> {
        let state = self.state.clone();
        let channel = self.updates.clone();
        replaying_stream("token-definitions", move || {
            let state = state.lock();
            (state.definitions.values().cloned().collect(), channel.receiver())
        })
    }

    fn process(&self, observation: &AtomObservation) -> Result<()> {
        let aid = observation.aid();
        let operation = observation.status.operation();
        let mut state = self.state.lock();

        let processed = state.processed_aids.contains(&aid);
        match operation {
            AtomOperation::Store if processed => return Ok(()),
            AtomOperation::Delete if !processed => return Ok(()),
            _ => {}
        }

        let mut staged = Staged::new(&state.definitions);
        for group in &observation.atom.particle_groups {
            staged.reduce(group, operation)?;
        }
        let changes = staged.changes;

        match operation {
            AtomOperation::Store => state.processed_aids.insert(aid),
            AtomOperation::Delete => state.processed_aids.remove(&aid),
        };
        for (symbol, definition) in changes {
            if definition.is_blank() {
                state.definitions.remove(&symbol);
            } else {
                state.definitions.insert(symbol.clone(), definition.clone());
            }
            tracing::debug!(
                aid = %aid,
                symbol = %symbol,
                supply = %definition.total_supply,
                "Token definition updated"
            );
            self.updates.publish(definition);
        }
        Ok(())
    }
}

impl Default for TokenDefinitionAccountSystem {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AccountSystem for TokenDefinitionAccountSystem {
    fn name(&self) -> &str {
        TOKEN_DEFINITION
    }

    async fn process_atom_update(
        &self,
        observation: &AtomObservation,
        _processed: &mut ProcessedData,
    ) -> Result<()> {
        let relevant = observation.atom.contains(|p| {
            matches!(
                p,
                Particle::FixedSupplyTokenDefinition(_)
                    | Particle::MutableSupplyTokenDefinition(_)
                    | Particle::UnallocatedTokens(_)
            )
        });
        if relevant {
            self.process(observation)?;
        }
        Ok(())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
