//! Account Layer
//!
//! Typed snapshots on top of [`crate::data_sync`]:
//!
//! - single-account subscribers, push-backed or registered with a shared loader
//! - per-record fetch timers ([`AccountPoller`])
//! - orchestrators for the protocol-global records and for one user
//!
//! Orchestrators publish their changes on a broadcast channel and expose the
//! last decoded value of each record through getters.

pub mod bulk_user_subscription;
pub mod clearing_house;
pub mod context;
pub mod error;
mod lifecycle;
pub mod poller;
pub mod polling_subscriber;
pub mod subscriber;
pub mod user;
pub mod websocket_subscriber;

#[cfg(test)]
mod tests;

pub use bulk_user_subscription::bulk_polling_user_subscribe;
pub use clearing_house::{AccountHandle, ClearingHouseAccountEvent, ClearingHouseAccountSubscriber, OptionalAccountHandles, OptionalClearingHouseAccount};
pub use context::{AccountContext, DEFAULT_EVENT_CHANNEL_CAPACITY, SubscriptionMode};
pub use error::SubscriberError;
pub use poller::{AccountPoller, ManagedAccount, OnFetch};
pub use polling_subscriber::PollingAccountSubscriber;
pub use subscriber::{AccountSubscriber, DataAndSlot, OnAccountUpdate, OnSubscriberError};
pub use user::{UserAccountEvent, UserAccountSubscriber};
pub use websocket_subscriber::WebSocketAccountSubscriber;
