//! Default account systems
//!
//! Each system is a reducer over the observation stream of one address. The
//! STORE/DELETE decision always comes from
//! [`AtomStatus::operation`](crate::types::AtomStatus::operation), and every
//! reducer undoes exactly what it applied.

pub mod data;
pub mod decryption;
pub mod messaging;
pub mod token_definition;
pub mod transfer;

pub use data::{ApplicationPayload, DataAccountSystem, DataUpdate};
pub use decryption::{DecryptedData, DecryptionAccountSystem, DecryptionState, Decryptor, NoDecryptor};
pub use messaging::{ChatMessage, MessageUpdate, MessagingAccountSystem};
pub use token_definition::{TokenDefinition, TokenDefinitionAccountSystem, TokenSupplyType};
pub use transfer::{BalanceUpdate, Transaction, TransactionUpdate, TransferAccountSystem};

/// Name of [`TransferAccountSystem`]
pub const TRANSFER: &str = "TRANSFER";

/// Name of [`TokenDefinitionAccountSystem`]
pub const TOKEN_DEFINITION: &str = "TOKEN_DEFINITION";

/// Name of [`DataAccountSystem`]
pub const DATA: &str = "DATA";

/// Name of [`MessagingAccountSystem`]
pub const MESSAGING: &str = "MESSAGING";

/// Name of [`DecryptionAccountSystem`]
pub const DECRYPTION: &str = "DECRYPTION";

/// Buffer of each system's update channel
pub(crate) const UPDATE_CHANNEL_CAPACITY: usize = 1024;
