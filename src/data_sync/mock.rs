//! In-memory doubles for the remote ledger, used by tests and benchmarks.

use super::rpc::{AccountReader, BufferAndSlot, Commitment, GET_MULTIPLE_ACCOUNTS_CHUNK_SIZE, MultipleAccounts, RpcError};
use super::websocket::{AccountPubsub, AccountSubscription, PubsubError};
use crate::coder::{AnchorAccountCoder, ProgramAccount};
use crate::types::Pubkey;
use alloy_primitives::Bytes;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// Ledger held in memory. Every read returns the current slot and contents.
pub struct MockAccountReader {
    accounts: DashMap<Pubkey, Bytes>,
    slot: AtomicU64,
    fail_all: AtomicBool,
    failing_keys: DashSet<Pubkey>,
    requests: Mutex<Vec<Vec<Pubkey>>>,
    single_reads: AtomicUsize,
    max_accounts_per_request: usize,
    latency: Option<Duration>,
}

impl Default for MockAccountReader {
    fn default() -> Self {
        Self {
            accounts: DashMap::new(),
            slot: AtomicU64::new(1),
            fail_all: AtomicBool::new(false),
            failing_keys: DashSet::new(),
            requests: Mutex::new(Vec::new()),
            single_reads: AtomicUsize::new(0),
            max_accounts_per_request: GET_MULTIPLE_ACCOUNTS_CHUNK_SIZE,
            latency: None,
        }
    }
}

impl MockAccountReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_accounts_per_request(mut self, max_accounts_per_request: usize) -> Self {
        self.max_accounts_per_request = max_accounts_per_request;
        self
    }

    /// Every read sleeps for `latency` before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn set_slot(&self, slot: u64) {
        self.slot.store(slot, Ordering::SeqCst);
    }

    pub fn slot(&self) -> u64 {
        self.slot.load(Ordering::SeqCst)
    }

    pub fn set_account_data(&self, key: Pubkey, data: impl Into<Bytes>) {
        self.accounts.insert(key, data.into());
    }

    /// Store `account` encoded the way [`AnchorAccountCoder`] expects it.
    pub fn set_account<T: ProgramAccount>(&self, key: Pubkey, account: &T) {
        self.set_account_data(key, AnchorAccountCoder::encode(account));
    }

    pub fn remove_account(&self, key: &Pubkey) {
        self.accounts.remove(key);
    }

    /// Fail every request until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.fail_all.store(failing, Ordering::SeqCst);
    }

    /// Fail every request that includes `key`.
    pub fn fail_requests_containing(&self, key: Pubkey) {
        self.failing_keys.insert(key);
    }

    pub fn clear_failures(&self) {
        self.fail_all.store(false, Ordering::SeqCst);
        self.failing_keys.clear();
    }

    /// Keys of every batched request in arrival order.
    pub fn requests(&self) -> Vec<Vec<Pubkey>> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn single_read_count(&self) -> usize {
        self.single_reads.load(Ordering::SeqCst)
    }

    /// Total number of round trips served.
    pub fn total_reads(&self) -> usize {
        self.request_count() + self.single_read_count()
    }

    fn check_failure(&self, keys: &[Pubkey]) -> Result<(), RpcError> {
        if self.fail_all.load(Ordering::SeqCst) || keys.iter().any(|key| self.failing_keys.contains(key)) {
            return Err(RpcError::Node { code: -32005, message: "mock node unavailable".to_string() });
        }
        Ok(())
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl AccountReader for MockAccountReader {
    async fn get_multiple_accounts(&self, keys: &[Pubkey], _commitment: Commitment) -> Result<MultipleAccounts, RpcError> {
        self.requests.lock().push(keys.to_vec());
        if keys.len() > self.max_accounts_per_request {
            return Err(RpcError::InvalidResponse(format!("too many accounts requested: {}", keys.len())));
        }

        // the slot and the contents are captured together, like a node would
        let slot = self.slot();
        let values = keys.iter().map(|key| self.accounts.get(key).map(|data| data.clone())).collect();
        self.simulate_latency().await;
        self.check_failure(keys)?;

        Ok(MultipleAccounts { slot, values })
    }

    async fn get_account(&self, key: &Pubkey, _commitment: Commitment) -> Result<BufferAndSlot, RpcError> {
        self.single_reads.fetch_add(1, Ordering::SeqCst);
        let slot = self.slot();
        let buffer = self.accounts.get(key).map(|data| data.clone());
        self.simulate_latency().await;
        self.check_failure(std::slice::from_ref(key))?;

        Ok(BufferAndSlot { slot, buffer })
    }

    fn max_accounts_per_request(&self) -> usize {
        self.max_accounts_per_request
    }
}

/// Push channel whose notifications are driven by the test through [`MockAccountPubsub::push`].
#[derive(Default)]
pub struct MockAccountPubsub {
    subscribers: DashMap<Pubkey, Vec<mpsc::Sender<BufferAndSlot>>>,
    subscribe_calls: AtomicUsize,
}

impl MockAccountPubsub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `update` to every open subscription of `key`. Returns how many received it.
    pub async fn push(&self, key: &Pubkey, update: BufferAndSlot) -> usize {
        let senders = self.subscribers.get(key).map(|senders| senders.clone()).unwrap_or_default();
        let mut delivered = 0;
        for sender in senders {
            if sender.send(update.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    pub async fn push_account<T: ProgramAccount>(&self, key: &Pubkey, slot: u64, account: &T) -> usize {
        self.push(key, BufferAndSlot { slot, buffer: Some(AnchorAccountCoder::encode(account).into()) }).await
    }

    /// Drop the sending side of every subscription of `key`, the way a
    /// listener that ran out of reconnect attempts does. Returns how many closed.
    pub fn close_subscriptions(&self, key: &Pubkey) -> usize {
        self.subscribers.remove(key).map(|(_, senders)| senders.len()).unwrap_or(0)
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Subscriptions for `key` whose receiving side is still open.
    pub fn open_subscriptions(&self, key: &Pubkey) -> usize {
        self.subscribers.get(key).map(|senders| senders.iter().filter(|sender| !sender.is_closed()).count()).unwrap_or(0)
    }

    pub fn total_open_subscriptions(&self) -> usize {
        self.subscribers.iter().map(|entry| entry.value().iter().filter(|sender| !sender.is_closed()).count()).sum()
    }
}

#[async_trait]
impl AccountPubsub for MockAccountPubsub {
    async fn account_subscribe(&self, key: Pubkey, _commitment: Commitment) -> Result<AccountSubscription, PubsubError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let (update_tx, update_rx) = mpsc::channel(64);
        let (shutdown_tx, _shutdown_rx) = mpsc::channel(1);
        self.subscribers.entry(key).or_default().push(update_tx);
        Ok(AccountSubscription::new(update_rx, shutdown_tx))
    }
}
