//! Atom Ledger
//!
//! Client-side reconstruction of account state from a stream of atom
//! observations.
//!
//! # Architecture
//!
//! - **AtomStore**: single-writer, status-tracked record of every observed atom
//! - **Ledger**: per-address network subscriptions merged with stored history,
//!   plus finality promotion
//! - **Account**: fans each observation out to its account systems in order
//! - **Account systems**: reducers for balances, token definitions, messages
//!   and application data
//!
//! # Invariants
//!
//! - Insert is write-once per AID; later observations only change the status
//! - An account system applies an atom at most once and undoes it at most once
//! - Undoing an atom restores exactly the state before it was applied
//! - Stored history for an address is delivered before any live update

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod account;
pub mod actor;
pub mod atom;
pub mod atom_store;
pub mod channel;
pub mod config;
pub mod crypto;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod metrics;
pub mod network;
pub mod particle;
pub mod storage;
pub mod systems;
pub mod types;

// Re-exports
pub use account::{Account, AccountSystem, ProcessedData};
pub use atom::{Atom, AtomObservation, ParticleGroup};
pub use atom_store::AtomStore;
pub use config::Config;
pub use error::{Error, Result};
pub use ledger::Ledger;
pub use metrics::Metrics;
pub use types::{Address, Aid, AtomOperation, AtomStatus, Rri, Spin};
