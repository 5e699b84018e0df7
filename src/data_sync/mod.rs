//! Data Synchronization Layer
//!
//! Raw account transport, below any decoding:
//!
//! - `getMultipleAccounts` / `getAccountInfo` reads over HTTP JSON-RPC
//! - `accountSubscribe` push notifications over WebSocket
//! - a shared bulk loader that refreshes many accounts with chunked reads
//!
//! Everything here deals in raw bytes and slots; typed snapshots live in
//! [`crate::accounts`].

pub mod bulk_loader;
pub mod config;
pub mod mock;
pub mod rpc;
pub mod websocket;


pub use bulk_loader::{BulkAccountLoader, CallbackId, ChunkLoadError, LoadStats, LoaderError, OnAccountChange, OnLoadError, WeakAccountLoader};
pub use config::{AccountSyncConfig, AccountSyncConfigRoot, SubscriptionType};
pub use mock::{MockAccountPubsub, MockAccountReader};
pub use rpc::{AccountReader, BufferAndSlot, Commitment, GET_MULTIPLE_ACCOUNTS_CHUNK_SIZE, MultipleAccounts, RpcAccountReader, RpcError};
pub use websocket::{AccountPubsub, AccountSubscription, PubsubError, WebSocketAccountPubsub};
