// Two-Layer Architecture
pub mod data_sync; // Data Layer: RPC reads, push subscriptions, bulk loading
pub mod accounts; // Account Layer: typed subscribers and orchestrators

// Record schemas and decoding
pub mod coder;
pub mod types;

// Common utilities
pub mod utils;

// Re-export key components from each layer
pub use accounts::{
    AccountContext, AccountPoller, AccountSubscriber, ClearingHouseAccountEvent, ClearingHouseAccountSubscriber, DataAndSlot,
    OptionalClearingHouseAccount, PollingAccountSubscriber, SubscriberError, SubscriptionMode, UserAccountEvent, UserAccountSubscriber,
    WebSocketAccountSubscriber, bulk_polling_user_subscribe,
};
pub use coder::{AccountCoder, AnchorAccountCoder, DecodeError, ProgramAccount};
pub use data_sync::{
    AccountPubsub, AccountReader, AccountSyncConfig, BufferAndSlot, BulkAccountLoader, Commitment, RpcAccountReader, SubscriptionType,
    WebSocketAccountPubsub,
};
pub use types::{AccountKind, Pubkey};
