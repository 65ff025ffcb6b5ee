//! Particle catalogue
//!
//! A particle is one immutable fact about ledger state. Particles are compared
//! by value; the spin lives beside the particle in [`SpunParticle`] so that an
//! UP particle and the DOWN particle consuming it hash to the same
//! [`ParticleId`].

use crate::crypto::hash_bytes;
use crate::types::{Address, ParticleId, Rri, Spin};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metadata key naming the application a message belongs to
pub const APPLICATION_KEY: &str = "application";

/// Application id of encrypted-key protector messages
pub const ENCRYPTOR_APPLICATION: &str = "encryptor";

/// Application id of chat/transfer messages
pub const MESSAGE_APPLICATION: &str = "message";

/// Token supply transitions guarded by permissions
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TokenTransition {
    /// Unallocated → transferrable
    Mint,
    /// Transferrable → unallocated
    Burn,
}

/// Who may perform a token transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenPermission {
    /// Only the RRI owner
    TokenOwnerOnly,
    /// Anyone
    All,
    /// Nobody
    None,
}

/// Ownership of N units of a token (the consumable)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferrableTokensParticle {
    /// Owner
    pub address: Address,
    /// Token the units belong to
    pub token_definition_reference: Rri,
    /// Units owned
    pub amount: Decimal,
    /// Smallest divisible amount
    pub granularity: Decimal,
    /// Disambiguates otherwise identical particles
    pub nonce: u64,
    /// Coarse time bucket
    pub planck: u64,
    /// Token permissions copied from the definition
    pub token_permissions: BTreeMap<TokenTransition, TokenPermission>,
}

/// Units of a mutable-supply token not yet in circulation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnallocatedTokensParticle {
    /// Token the units belong to
    pub token_definition_reference: Rri,
    /// Units in the pool
    pub amount: Decimal,
    /// Smallest divisible amount
    pub granularity: Decimal,
    /// Disambiguates otherwise identical particles
    pub nonce: u64,
    /// Token permissions copied from the definition
    pub token_permissions: BTreeMap<TokenTransition, TokenPermission>,
}

/// Definition of a token with a fixed supply issued at creation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FixedSupplyTokenDefinitionParticle {
    /// Token identifier (the unique part is the symbol)
    pub rri: Rri,
    /// Display name
    pub name: String,
    /// Free text description
    pub description: String,
    /// Total supply
    pub supply: Decimal,
    /// Smallest divisible amount
    pub granularity: Decimal,
    /// Optional icon location
    pub icon_url: Option<String>,
}

/// Definition of a token whose supply changes through mint and burn
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MutableSupplyTokenDefinitionParticle {
    /// Token identifier (the unique part is the symbol)
    pub rri: Rri,
    /// Display name
    pub name: String,
    /// Free text description
    pub description: String,
    /// Smallest divisible amount
    pub granularity: Decimal,
    /// Optional icon location
    pub icon_url: Option<String>,
    /// Mint/burn permissions
    pub token_permissions: BTreeMap<TokenTransition, TokenPermission>,
}

/// Claim on a resource name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RriParticle {
    /// Claimed resource
    pub rri: Rri,
    /// Disambiguates otherwise identical particles
    pub nonce: u64,
}

/// Arbitrary payload sent from one address to another
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageParticle {
    /// Sender
    pub from: Address,
    /// Recipient
    pub to: Address,
    /// Payload, possibly encrypted
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    /// Free-form metadata, `application` selects the consumer
    pub metadata: BTreeMap<String, String>,
    /// Disambiguates otherwise identical particles
    pub nonce: u64,
}

impl MessageParticle {
    /// Application id from metadata
    pub fn application(&self) -> Option<&str> {
        self.metadata.get(APPLICATION_KEY).map(String::as_str)
    }
}

/// Carries the atom timestamp
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimestampParticle {
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: i64,
}

/// Every particle type an atom may carry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Particle {
    /// Token ownership
    TransferrableTokens(TransferrableTokensParticle),
    /// Unissued pool of a mutable-supply token
    UnallocatedTokens(UnallocatedTokensParticle),
    /// Fixed supply token definition
    FixedSupplyTokenDefinition(FixedSupplyTokenDefinitionParticle),
    /// Mutable supply token definition
    MutableSupplyTokenDefinition(MutableSupplyTokenDefinitionParticle),
    /// Resource name claim
    Rri(RriParticle),
    /// Message
    Message(MessageParticle),
    /// Atom timestamp
    Timestamp(TimestampParticle),
}

impl Particle {
    /// Create canonical bytes for hashing
    pub fn canonical_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("serialization cannot fail")
    }

    /// Content identity, shared by the UP and DOWN instance
    pub fn identity(&self) -> ParticleId {
        ParticleId::from_bytes(hash_bytes(&self.canonical_bytes()))
    }

    /// Addresses this particle concerns
    pub fn addresses(&self) -> Vec<Address> {
        match self {
            Particle::TransferrableTokens(p) => vec![p.address.clone()],
            Particle::UnallocatedTokens(p) => vec![p.token_definition_reference.address().clone()],
            Particle::FixedSupplyTokenDefinition(p) => vec![p.rri.address().clone()],
            Particle::MutableSupplyTokenDefinition(p) => vec![p.rri.address().clone()],
            Particle::Rri(p) => vec![p.rri.address().clone()],
            Particle::Message(p) => {
                if p.from == p.to {
                    vec![p.from.clone()]
                } else {
                    vec![p.from.clone(), p.to.clone()]
                }
            }
            Particle::Timestamp(_) => Vec::new(),
        }
    }
}

/// A particle together with its spin
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpunParticle {
    /// UP asserts, DOWN consumes
    pub spin: Spin,
    /// Content
    pub particle: Particle,
}

impl SpunParticle {
    /// UP instance
    pub fn up(particle: Particle) -> Self {
        Self {
            spin: Spin::Up,
            particle,
        }
    }

    /// DOWN instance
    pub fn down(particle: Particle) -> Self {
        Self {
            spin: Spin::Down,
            particle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(owner: &str, amount: i64) -> Particle {
        Particle::TransferrableTokens(TransferrableTokensParticle {
            address: Address::new(owner),
            token_definition_reference: Rri::token(Address::new("issuer"), "XRD"),
            amount: Decimal::from(amount),
            granularity: Decimal::ONE,
            nonce: 1,
            planck: 0,
            token_permissions: BTreeMap::new(),
        })
    }

    #[test]
    fn test_identity_ignores_spin() {
        let up = SpunParticle::up(tokens("alice", 10));
        let down = SpunParticle::down(tokens("alice", 10));
        assert_eq!(up.particle.identity(), down.particle.identity());
    }

    #[test]
    fn test_identity_depends_on_content() {
        assert_ne!(tokens("alice", 10).identity(), tokens("alice", 11).identity());
        assert_ne!(tokens("alice", 10).identity(), tokens("bob", 10).identity());
    }

    #[test]
    fn test_message_addresses() {
        let message = Particle::Message(MessageParticle {
            from: Address::new("alice"),
            to: Address::new("bob"),
            data: b"hi".to_vec(),
            metadata: BTreeMap::from([(APPLICATION_KEY.to_string(), "message".to_string())]),
            nonce: 0,
        });
        assert_eq!(
            message.addresses(),
            vec![Address::new("alice"), Address::new("bob")]
        );
    }
}
