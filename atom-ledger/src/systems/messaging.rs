//! Chat messages per counterparty

use crate::account::{AccountSystem, ProcessedData};
use crate::atom::AtomObservation;
use crate::channel::{replaying_stream, EventChannel, EventStream};
use crate::particle::{MessageParticle, Particle, MESSAGE_APPLICATION};
use crate::systems::{DecryptionState, MESSAGING, UPDATE_CHANNEL_CAPACITY};
use crate::types::{Address, Aid, AtomOperation};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// One message sent or received by the tracked address
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    /// Atom carrying the message
    pub aid: Aid,
    /// Sender
    pub from: Address,
    /// Recipient
    pub to: Address,
    /// Text, lossy UTF-8 of the payload
    pub content: String,
    /// How the payload was obtained
    pub state: DecryptionState,
    /// Atom timestamp, or observation time if the atom carries none
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    /// The other side of the conversation, seen from `me`
    pub fn counterparty(&self, me: &Address) -> &Address {
        if &self.from == me {
            &self.to
        } else {
            &self.from
        }
    }
}

/// Message added or removed
#[derive(Debug, Clone, PartialEq)]
pub struct MessageUpdate {
    /// STORE when added, DELETE when retracted
    pub action: AtomOperation,
    /// The message
    pub message: ChatMessage,
}

#[derive(Default)]
struct MessagingState {
    messages: IndexMap<Aid, ChatMessage>,
    chats: HashMap<Address, IndexMap<Aid, ChatMessage>>,
}

/// Conversations of one address
pub struct MessagingAccountSystem {
    address: Address,
    state: Arc<Mutex<MessagingState>>,
    updates: Arc<EventChannel<MessageUpdate>>,
}

impl MessagingAccountSystem {
    /// System tracking `address`
    pub fn new(address: Address) -> Self {
        Self {
            address,
            state: Arc::new(Mutex::new(MessagingState::default())),
            updates: Arc::new(EventChannel::new("messages", UPDATE_CHANNEL_CAPACITY)),
        }
    }

    /// Messages exchanged with `counterparty`, in arrival order
    pub fn get_chat(&self, counterparty: &Address) -> Vec<ChatMessage> {
        self.state
            .lock()
            .chats
            .get(counterparty)
            .map(|chat| chat.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Addresses with at least one message
    pub fn get_counterparties(&self) -> Vec<Address> {
        self.state.lock().chats.keys().cloned().collect()
    }

    /// Every known message as a STORE update, then live updates
    pub fn get_all_messages(&self) -> EventStream<MessageUpdate> {
        let state = self.state.clone();
        let channel = self.updates.clone();
        replaying_stream("messages", move || {
            let state = state.lock();
            let history = state
                .messages
                .values()
                .map(|message| MessageUpdate {
                    action: AtomOperation::Store,
                    message: message.clone(),
                })
                .collect();
            (history, channel.receiver())
        })
    }

    fn store(&self, observation: &AtomObservation, particle: &MessageParticle, processed: &ProcessedData) {
        let aid = observation.aid();
        let mut state = self.state.lock();
        if state.messages.contains_key(&aid) {
            return;
        }

        let (data, decryption) = match &processed.decrypted_data {
            Some(decrypted) => (decrypted.data.as_slice(), decrypted.state.clone()),
            None => (particle.data.as_slice(), DecryptionState::Unencrypted),
        };
        let message = ChatMessage {
            aid,
            from: particle.from.clone(),
            to: particle.to.clone(),
            content: String::from_utf8_lossy(data).into_owned(),
            state: decryption,
            timestamp: observation.atom.timestamp().unwrap_or(observation.timestamp),
        };

        let counterparty = message.counterparty(&self.address).clone();
        state.messages.insert(aid, message.clone());
        state
            .chats
            .entry(counterparty)
            .or_default()
            .insert(aid, message.clone());

        self.updates.publish(MessageUpdate {
            action: AtomOperation::Store,
            message,
        });
    }

    fn delete(&self, observation: &AtomObservation) {
        let aid = observation.aid();
        let mut state = self.state.lock();
        let Some(message) = state.messages.shift_remove(&aid) else {
            return;
        };

        let counterparty = message.counterparty(&self.address).clone();
        let emptied = match state.chats.get_mut(&counterparty) {
            Some(chat) => {
                chat.shift_remove(&aid);
                chat.is_empty()
            }
            None => false,
        };
        if emptied {
            state.chats.remove(&counterparty);
        }

        self.updates.publish(MessageUpdate {
            action: AtomOperation::Delete,
            message,
        });
    }
}

#[async_trait]
impl AccountSystem for MessagingAccountSystem {
    fn name(&self) -> &str {
        MESSAGING
    }

    async fn process_atom_update(
        &self,
        observation: &AtomObservation,
        processed: &mut ProcessedData,
    ) -> Result<()> {
        let particle = observation.atom.spun_particles().find_map(|spun| match &spun.particle {
            Particle::Message(message) if message.application() == Some(MESSAGE_APPLICATION) => {
                Some(message)
            }
            _ => None,
        });
        let Some(particle) = particle else {
            return Ok(());
        };

        match observation.status.operation() {
            AtomOperation::Store => self.store(observation, particle, processed),
            AtomOperation::Delete => self.delete(observation),
        }
        Ok(())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
