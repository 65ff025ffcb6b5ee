//! Core identifier and status types
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Cheap cloning and hashing (used as map keys by every account system)
//! - Exact arithmetic (Decimal for token amounts)

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Ledger address (owner of particles, tracked by an account)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(String);

impl Address {
    /// Create new address
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Derive the address owned by an Ed25519 public key
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        let digest = crate::crypto::hash_bytes(public_key);
        Self(hex::encode(&digest[..20]))
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resource identifier: `/address/type/unique`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rri {
    address: Address,
    kind: String,
    unique: String,
}

impl Rri {
    /// Create new resource identifier
    pub fn new(address: Address, kind: impl Into<String>, unique: impl Into<String>) -> Self {
        Self {
            address,
            kind: kind.into(),
            unique: unique.into(),
        }
    }

    /// Token resource of `address` named `symbol`
    pub fn token(address: Address, symbol: impl Into<String>) -> Self {
        Self::new(address, "tokens", symbol)
    }

    /// Owning address
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Resource type (e.g. `tokens`)
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Unique name within the address (the token symbol for tokens)
    pub fn unique(&self) -> &str {
        &self.unique
    }
}

impl fmt::Display for Rri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}/{}", self.address, self.kind, self.unique)
    }
}

impl FromStr for Rri {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            ["", address, kind, unique]
                if !address.is_empty() && !kind.is_empty() && !unique.is_empty() =>
            {
                Ok(Rri::new(Address::new(*address), *kind, *unique))
            }
            _ => Err(crate::Error::InvalidRri(s.to_string())),
        }
    }
}

/// Content-derived atom identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Aid([u8; 32]);

impl Aid {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Aid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Content hash of a particle, spin excluded.
///
/// An UP particle and the DOWN particle consuming it share the same identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParticleId([u8; 32]);

impl ParticleId {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for ParticleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Particle spin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Spin {
    /// Asserts existence
    Up,
    /// Consumes a previously UP particle with identical content
    Down,
}

/// Whether an observation applies or retracts an atom's effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AtomOperation {
    /// Apply
    Store,
    /// Undo
    Delete,
}

impl AtomOperation {
    /// The opposite operation
    pub fn flip(self) -> Self {
        match self {
            AtomOperation::Store => AtomOperation::Delete,
            AtomOperation::Delete => AtomOperation::Store,
        }
    }
}

/// Status of an atom as reported by the network or the local submitter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AtomStatus {
    /// Created locally, not yet handed to a node
    Pending = 1,
    /// Being sent to a node
    Submitting = 2,
    /// Accepted by a node for processing
    Submitted = 3,
    /// Stored by the network
    Stored = 4,
    /// Stored and past the finality quiet period
    StoredFinal = 5,
    /// Lost a conflict after being stored
    EvictedConflictLoser = 6,
    /// Conflict loss past the finality quiet period
    EvictedConflictLoserFinal = 7,
    /// Failed conflict manager verification
    EvictedFailedCmVerification = 8,
    /// Depends on an atom the node does not know
    MissingDependency = 9,
    /// Lost a conflict before being stored
    ConflictLoser = 10,
    /// Submission failed (validation, collision, timeout, ...)
    SubmissionError = 11,
}

impl AtomStatus {
    /// All statuses, in declaration order
    pub const ALL: [AtomStatus; 11] = [
        AtomStatus::Pending,
        AtomStatus::Submitting,
        AtomStatus::Submitted,
        AtomStatus::Stored,
        AtomStatus::StoredFinal,
        AtomStatus::EvictedConflictLoser,
        AtomStatus::EvictedConflictLoserFinal,
        AtomStatus::EvictedFailedCmVerification,
        AtomStatus::MissingDependency,
        AtomStatus::ConflictLoser,
        AtomStatus::SubmissionError,
    ];

    /// Insert-like statuses apply an atom, every other status retracts it.
    ///
    /// This is the only place the partition is defined.
    pub fn operation(&self) -> AtomOperation {
        match self {
            AtomStatus::Pending
            | AtomStatus::Submitting
            | AtomStatus::Submitted
            | AtomStatus::Stored
            | AtomStatus::StoredFinal => AtomOperation::Store,
            AtomStatus::EvictedConflictLoser
            | AtomStatus::EvictedConflictLoserFinal
            | AtomStatus::EvictedFailedCmVerification
            | AtomStatus::MissingDependency
            | AtomStatus::ConflictLoser
            | AtomStatus::SubmissionError => AtomOperation::Delete,
        }
    }

    /// Final statuses never change again
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            AtomStatus::StoredFinal | AtomStatus::EvictedConflictLoserFinal
        )
    }
}

impl fmt::Display for AtomStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AtomStatus::Pending => "PENDING",
            AtomStatus::Submitting => "SUBMITTING",
            AtomStatus::Submitted => "SUBMITTED",
            AtomStatus::Stored => "STORED",
            AtomStatus::StoredFinal => "STORED_FINAL",
            AtomStatus::EvictedConflictLoser => "EVICTED_CONFLICT_LOSER",
            AtomStatus::EvictedConflictLoserFinal => "EVICTED_CONFLICT_LOSER_FINAL",
            AtomStatus::EvictedFailedCmVerification => "EVICTED_FAILED_CM_VERIFICATION",
            AtomStatus::MissingDependency => "MISSING_DEPENDENCY",
            AtomStatus::ConflictLoser => "CONFLICT_LOSER",
            AtomStatus::SubmissionError => "SUBMISSION_ERROR",
        };
        f.write_str(name)
    }
}

/// Digital signature (Ed25519)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Signature bytes (64 bytes)
    #[serde(with = "serde_bytes")]
    bytes: [u8; 64],
}

impl Signature {
    /// Create from bytes
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self { bytes }
    }

    /// Get bytes
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.bytes
    }

    /// Verify signature
    pub fn verify(&self, message: &[u8], public_key: &[u8; 32]) -> bool {
        crate::crypto::verify_signature(message, self, public_key)
    }
}
