//! Application payloads keyed by application id

use crate::account::{AccountSystem, ProcessedData};
use crate::atom::AtomObservation;
use crate::channel::{replaying_stream, EventChannel, EventStream};
use crate::particle::Particle;
use crate::systems::{DATA, UPDATE_CHANNEL_CAPACITY};
use crate::types::{Address, Aid, AtomOperation};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future;
use futures::StreamExt;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// One message particle of an application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationPayload {
    /// Atom carrying the payload
    pub aid: Aid,
    /// Application id from the particle metadata
    pub application: String,
    /// Sender
    pub from: Address,
    /// Recipient
    pub to: Address,
    /// Raw payload
    pub data: Vec<u8>,
    /// Particle metadata
    pub metadata: BTreeMap<String, String>,
    /// Atom timestamp, or observation time if the atom carries none
    pub timestamp: DateTime<Utc>,
}

/// Payload added or removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUpdate {
    /// STORE when added, DELETE when retracted
    pub action: AtomOperation,
    /// The payload
    pub payload: ApplicationPayload,
}

#[derive(Default)]
struct DataState {
    /// application → aid → payloads of that atom
    applications: HashMap<String, IndexMap<Aid, Vec<ApplicationPayload>>>,
    /// applications each stored atom contributed to
    stored: HashMap<Aid, Vec<String>>,
}

/// Application data seen by one account
pub struct DataAccountSystem {
    state: Arc<Mutex<DataState>>,
    updates: Arc<EventChannel<DataUpdate>>,
}

impl DataAccountSystem {
    /// Empty system
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DataState::default())),
            updates: Arc::new(EventChannel::new("application-data", UPDATE_CHANNEL_CAPACITY)),
        }
    }

    /// Payloads of `application`, in arrival order
    pub fn get_application_data(&self, application: &str) -> Vec<ApplicationPayload> {
        self.state
            .lock()
            .applications
            .get(application)
            .map(|atoms| atoms.values().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Payloads of `application` as STORE updates, then live updates
    pub fn get_application_data_updates(&self, application: &str) -> EventStream<DataUpdate> {
        let state = self.state.clone();
        let channel = self.updates.clone();
        let wanted = application.to_string();
        let stream = replaying_stream("application-data", move || {
            let state = state.lock();
            let history = state
                .applications
                .get(&wanted)
                .map(|atoms| {
                    atoms
                        .values()
                        .flatten()
                        .map(|payload| DataUpdate {
                            action: AtomOperation::Store,
                            payload: payload.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default();
            (history, channel.receiver())
        });

        let application = application.to_string();
        stream
            .filter(move |update| future::ready(update.payload.application == application))
            .boxed()
    }

    fn store(&self, observation: &AtomObservation, payloads: Vec<ApplicationPayload>) {
        let aid = observation.aid();
        let mut state = self.state.lock();
        if state.stored.contains_key(&aid) {
            return;
        }

        let mut applications = Vec::new();
        for payload in payloads {
            if !applications.contains(&payload.application) {
                applications.push(payload.application.clone());
            }
            state
                .applications
                .entry(payload.application.clone())
                .or_default()
                .entry(aid)
                .or_default()
                .push(payload.clone());
            self.updates.publish(DataUpdate {
                action: AtomOperation::Store,
                payload,
            });
        }
        state.stored.insert(aid, applications);
    }

    fn delete(&self, observation: &AtomObservation) {
        let aid = observation.aid();
        let mut state = self.state.lock();
        let Some(applications) = state.stored.remove(&aid) else {
            return;
        };

        for application in applications {
            let (removed, emptied) = match state.applications.get_mut(&application) {
                Some(atoms) => (atoms.shift_remove(&aid).unwrap_or_default(), atoms.is_empty()),
                None => continue,
            };
            if emptied {
                state.applications.remove(&application);
            }
            for payload in removed {
                self.updates.publish(DataUpdate {
                    action: AtomOperation::Delete,
                    payload,
                });
            }
        }
    }
}

impl Default for DataAccountSystem {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AccountSystem for DataAccountSystem {
    fn name(&self) -> &str {
        DATA
    }

    async fn process_atom_update(
        &self,
        observation: &AtomObservation,
        _processed: &mut ProcessedData,
    ) -> Result<()> {
        let timestamp = observation.atom.timestamp().unwrap_or(observation.timestamp);
        let payloads: Vec<ApplicationPayload> = observation
            .atom
            .spun_particles()
            .filter_map(|spun| match &spun.particle {
                Particle::Message(message) => message.application().map(|application| {
                    ApplicationPayload {
                        aid: observation.aid(),
                        application: application.to_string(),
                        from: message.from.clone(),
                        to: message.to.clone(),
                        data: message.data.clone(),
                        metadata: message.metadata.clone(),
                        timestamp,
                    }
                }),
                _ => None,
            })
            .collect();
        if payloads.is_empty() {
            return Ok(());
        }

        match observation.status.operation() {
            AtomOperation::Store => self.store(observation, payloads),
            AtomOperation::Delete => self.delete(observation),
        }
        Ok(())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
