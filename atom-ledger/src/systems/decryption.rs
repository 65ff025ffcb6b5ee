//! Message payload decryption
//!
//! Finds the `message` application payload of an atom and leaves it, decrypted
//! when possible, in [`ProcessedData::decrypted_data`] for the systems that
//! run after this one. A payload is encrypted when the atom also carries an
//! `encryptor` particle holding the key protectors.

use crate::account::{AccountSystem, ProcessedData};
use crate::atom::AtomObservation;
use crate::particle::{MessageParticle, Particle, ENCRYPTOR_APPLICATION, MESSAGE_APPLICATION};
use crate::systems::DECRYPTION;
use crate::{Error, Result};
use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;

/// Outcome of decryption
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptionState {
    /// Payload was sent in the clear
    Unencrypted,
    /// Payload was decrypted
    Decrypted,
    /// Payload is encrypted and could not be decrypted
    CannotDecrypt(String),
}

/// Payload handed to later systems
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedData {
    /// Plain payload, or the raw payload if it could not be decrypted
    pub data: Vec<u8>,
    /// How `data` was obtained
    pub state: DecryptionState,
}

/// Key material able to open encrypted payloads
#[async_trait]
pub trait Decryptor: Send + Sync {
    /// Decrypt `payload` using the `protectors` carried by the atom
    async fn decrypt(&self, payload: &[u8], protectors: &[u8]) -> Result<Vec<u8>>;
}

/// Decryptor without keys, every encrypted payload stays closed
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDecryptor;

#[async_trait]
impl Decryptor for NoDecryptor {
    async fn decrypt(&self, _payload: &[u8], _protectors: &[u8]) -> Result<Vec<u8>> {
        Err(Error::Decryption("no key available".to_string()))
    }
}

/// Decrypts message payloads for later systems
pub struct DecryptionAccountSystem {
    decryptor: Arc<dyn Decryptor>,
}

impl DecryptionAccountSystem {
    /// System decrypting with `decryptor`
    pub fn new(decryptor: Arc<dyn Decryptor>) -> Self {
        Self { decryptor }
    }
}

fn application_payload<'a>(
    observation: &'a AtomObservation,
    application: &str,
) -> Option<&'a MessageParticle> {
    observation.atom.spun_particles().find_map(|spun| match &spun.particle {
        Particle::Message(message) if message.application() == Some(application) => Some(message),
        _ => None,
    })
}

#[async_trait]
impl AccountSystem for DecryptionAccountSystem {
    fn name(&self) -> &str {
        DECRYPTION
    }

    async fn process_atom_update(
        &self,
        observation: &AtomObservation,
        processed: &mut ProcessedData,
    ) -> Result<()> {
        let Some(payload) = application_payload(observation, MESSAGE_APPLICATION) else {
            return Ok(());
        };

        let decrypted = match application_payload(observation, ENCRYPTOR_APPLICATION) {
            None => DecryptedData {
                data: payload.data.clone(),
                state: DecryptionState::Unencrypted,
            },
            Some(encryptor) => match self.decryptor.decrypt(&payload.data, &encryptor.data).await {
                Ok(data) => DecryptedData {
                    data,
                    state: DecryptionState::Decrypted,
                },
                Err(e) => {
                    tracing::debug!(aid = %observation.aid(), error = %e, "Payload left encrypted");
                    DecryptedData {
                        data: payload.data.clone(),
                        state: DecryptionState::CannotDecrypt(e.to_string()),
                    }
                }
            },
        };

        processed.decrypted_data = Some(decrypted);
        Ok(())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::{Atom, ParticleGroup};
    use crate::particle::{SpunParticle, APPLICATION_KEY};
    use crate::types::{Address, AtomStatus};
    use std::collections::BTreeMap;

    /// XORs the payload with the first protector byte
    struct XorDecryptor;

    #[async_trait]
    impl Decryptor for XorDecryptor {
        async fn decrypt(&self, payload: &[u8], protectors: &[u8]) -> Result<Vec<u8>> {
            let key = protectors
                .first()
                .ok_or_else(|| Error::Decryption("empty protectors".to_string()))?;
            Ok(payload.iter().map(|b| b ^ key).collect())
        }
    }

    fn message(application: &str, data: &[u8]) -> SpunParticle {
        SpunParticle::up(Particle::Message(MessageParticle {
            from: Address::new("alice"),
            to: Address::new("bob"),
            data: data.to_vec(),
            metadata: BTreeMap::from([(APPLICATION_KEY.to_string(), application.to_string())]),
            nonce: 0,
        }))
    }

    fn observe(particles: Vec<SpunParticle>) -> AtomObservation {
        AtomObservation::new(
            Arc::new(Atom::new(vec![ParticleGroup::new(particles)])),
            AtomStatus::Stored,
        )
    }

    async fn run(decryptor: Arc<dyn Decryptor>, observation: &AtomObservation) -> ProcessedData {
        let system = DecryptionAccountSystem::new(decryptor);
        let mut processed = ProcessedData::default();
        system
            .process_atom_update(observation, &mut processed)
            .await
            .unwrap();
        processed
    }

    #[tokio::test]
    async fn test_plain_payload_passes_through() {
        let observation = observe(vec![message(MESSAGE_APPLICATION, b"hi")]);
        let processed = run(Arc::new(NoDecryptor), &observation).await;

        let data = processed.decrypted_data.unwrap();
        assert_eq!(data.data, b"hi");
        assert_eq!(data.state, DecryptionState::Unencrypted);
    }

    #[tokio::test]
    async fn test_encrypted_payload_decrypted() {
        let secret: Vec<u8> = b"hi".iter().map(|b| b ^ 7).collect();
        let observation = observe(vec![
            message(MESSAGE_APPLICATION, &secret),
            message(ENCRYPTOR_APPLICATION, &[7]),
        ]);
        let processed = run(Arc::new(XorDecryptor), &observation).await;

        let data = processed.decrypted_data.unwrap();
        assert_eq!(data.data, b"hi");
        assert_eq!(data.state, DecryptionState::Decrypted);
    }

    #[tokio::test]
    async fn test_missing_key_reported() {
        let observation = observe(vec![
            message(MESSAGE_APPLICATION, b"????"),
            message(ENCRYPTOR_APPLICATION, &[7]),
        ]);
        let processed = run(Arc::new(NoDecryptor), &observation).await;

        let data = processed.decrypted_data.unwrap();
        assert_eq!(data.data, b"????");
        assert!(matches!(data.state, DecryptionState::CannotDecrypt(_)));
    }

    #[tokio::test]
    async fn test_atom_without_message_untouched() {
        let observation = observe(vec![message("chess", b"e4")]);
        let processed = run(Arc::new(NoDecryptor), &observation).await;
        assert!(processed.decrypted_data.is_none());
    }
}
