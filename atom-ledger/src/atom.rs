//! Atoms, particle groups and observations

use crate::crypto::{double_hash, KeyPair};
use crate::particle::{Particle, SpunParticle};
use crate::types::{Address, Aid, AtomStatus, Signature, Spin};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Group metadata key marking a fee group
pub const FEE_GROUP_KEY: &str = "fee";

/// All-or-nothing unit of a transaction
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticleGroup {
    /// Particles with their spins
    pub particles: Vec<SpunParticle>,
    /// Free-form metadata
    pub metadata: BTreeMap<String, String>,
}

impl ParticleGroup {
    /// Group of the given particles
    pub fn new(particles: Vec<SpunParticle>) -> Self {
        Self {
            particles,
            metadata: BTreeMap::new(),
        }
    }

    /// Group whose transferrable particles pay the atom fee
    pub fn fee(particles: Vec<SpunParticle>) -> Self {
        Self::new(particles).with_metadata(FEE_GROUP_KEY, "true")
    }

    /// Attach a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Whether this group pays the fee
    pub fn is_fee_group(&self) -> bool {
        self.metadata.get(FEE_GROUP_KEY).map(String::as_str) == Some("true")
    }

    /// Whether any particle matches
    pub fn contains(&self, predicate: impl Fn(&Particle) -> bool) -> bool {
        self.particles.iter().any(|p| predicate(&p.particle))
    }
}

/// Immutable unit of ledger change
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Atom {
    /// Ordered particle groups
    pub particle_groups: Vec<ParticleGroup>,
    /// Signatures keyed by signer address
    pub signatures: BTreeMap<String, Signature>,
}

impl Atom {
    /// Atom of the given groups, unsigned
    pub fn new(particle_groups: Vec<ParticleGroup>) -> Self {
        Self {
            particle_groups,
            signatures: BTreeMap::new(),
        }
    }

    /// Hash over the particle groups (what signers sign)
    pub fn hash(&self) -> [u8; 32] {
        let bytes = bincode::serialize(&self.particle_groups).expect("serialization cannot fail");
        double_hash(&bytes)
    }

    /// Content-derived identifier
    pub fn aid(&self) -> Aid {
        Aid::from_bytes(self.hash())
    }

    /// Add the signature of `key_pair` over the atom hash
    pub fn sign(&mut self, key_pair: &KeyPair) {
        let signature = key_pair.sign(&self.hash());
        self.signatures
            .insert(key_pair.address().to_string(), signature);
    }

    /// Whether the holder of `public_key` signed this atom
    pub fn verify_signature(&self, public_key: &[u8; 32]) -> bool {
        let signer = Address::from_public_key(public_key);
        match self.signatures.get(signer.as_str()) {
            Some(signature) => signature.verify(&self.hash(), public_key),
            None => false,
        }
    }

    /// Every particle with its spin, in group order
    pub fn spun_particles(&self) -> impl Iterator<Item = &SpunParticle> {
        self.particle_groups.iter().flat_map(|g| g.particles.iter())
    }

    /// Particles matching `predicate`, with spins
    pub fn particles_where<'a>(
        &'a self,
        predicate: impl Fn(&Particle) -> bool + 'a,
    ) -> impl Iterator<Item = (Spin, &'a Particle)> + 'a {
        self.spun_particles()
            .filter(move |p| predicate(&p.particle))
            .map(|p| (p.spin, &p.particle))
    }

    /// Whether any particle matches
    pub fn contains(&self, predicate: impl Fn(&Particle) -> bool) -> bool {
        self.spun_particles().any(|p| predicate(&p.particle))
    }

    /// Timestamp from the timestamp particle
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.spun_particles().find_map(|p| match &p.particle {
            Particle::Timestamp(t) => DateTime::from_timestamp_millis(t.timestamp_ms),
            _ => None,
        })
    }

    /// Every address any particle concerns
    pub fn addresses(&self) -> BTreeSet<Address> {
        self.spun_particles()
            .flat_map(|p| p.particle.addresses())
            .collect()
    }

    /// Export as JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Import from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// The unit flowing through the system
#[derive(Debug, Clone)]
pub struct AtomObservation {
    /// Observed atom
    pub atom: Arc<Atom>,
    /// Latest known status
    pub status: AtomStatus,
    /// When the status was recorded
    pub timestamp: DateTime<Utc>,
}

impl AtomObservation {
    /// Observation of `atom` with `status`, stamped now
    pub fn new(atom: Arc<Atom>, status: AtomStatus) -> Self {
        Self {
            atom,
            status,
            timestamp: Utc::now(),
        }
    }

    /// Identifier of the observed atom
    pub fn aid(&self) -> Aid {
        self.atom.aid()
    }
}
