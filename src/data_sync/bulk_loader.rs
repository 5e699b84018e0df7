use super::config::AccountSyncConfig;
use super::rpc::{AccountReader, BufferAndSlot, Commitment, RpcError};
use crate::types::Pubkey;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

pub type CallbackId = u64;

/// Invoked with the new raw contents whenever a registered account changes.
pub type OnAccountChange = Arc<dyn Fn(&BufferAndSlot) + Send + Sync>;

/// Invoked once per failed chunk of a load.
pub type OnLoadError = Arc<dyn Fn(Arc<ChunkLoadError>) + Send + Sync>;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("callback {callback_id} is already registered for account {key}")]
    DuplicateCallback { key: Pubkey, callback_id: CallbackId },
}

/// A batched read that failed. Other chunks of the same load are unaffected.
#[derive(Debug, Error)]
#[error("failed to load chunk {chunk_index} ({} accounts): {source}", .keys.len())]
pub struct ChunkLoadError {
    pub chunk_index: usize,
    pub keys: Vec<Pubkey>,
    #[source]
    pub source: RpcError,
}

/// Summary of a single [`BulkAccountLoader::load`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub accounts: usize,
    pub chunks: usize,
    pub failed_chunks: usize,
    /// Accounts whose contents changed
    pub changed: usize,
}

struct Listener {
    callback_id: CallbackId,
    on_change: OnAccountChange,
    /// Deliver the next newer observation even if the bytes did not change.
    redeliver: bool,
}

#[derive(Default)]
struct AccountToLoad {
    /// Fired in registration order
    listeners: Vec<Listener>,
    last: Option<BufferAndSlot>,
}

struct PollingTask {
    shutdown_tx: mpsc::Sender<()>,
    _task: JoinHandle<()>,
}

struct LoaderInner {
    reader: Arc<dyn AccountReader>,
    commitment: Commitment,
    polling_frequency: Duration,
    chunk_size: usize,
    accounts: DashMap<Pubkey, AccountToLoad>,
    error_callbacks: DashMap<CallbackId, OnLoadError>,
    next_callback_id: AtomicU64,
    polling: Mutex<Option<PollingTask>>,
}

/// Keeps a set of accounts fresh with batched `getMultipleAccounts` reads.
///
/// Handles are cheap to clone and share one registry. Each registered address
/// keeps the last bytes and slot it was seen at; a callback only fires when a
/// strictly newer slot carries different bytes, or on the first observation.
#[derive(Clone)]
pub struct BulkAccountLoader {
    inner: Arc<LoaderInner>,
}

/// Handle that does not keep the loader alive.
#[derive(Clone)]
pub struct WeakAccountLoader {
    inner: Weak<LoaderInner>,
}

impl WeakAccountLoader {
    pub fn upgrade(&self) -> Option<BulkAccountLoader> {
        self.inner.upgrade().map(|inner| BulkAccountLoader { inner })
    }
}

impl std::fmt::Debug for BulkAccountLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkAccountLoader")
            .field("commitment", &self.inner.commitment)
            .field("polling_frequency", &self.inner.polling_frequency)
            .field("chunk_size", &self.inner.chunk_size)
            .field("accounts", &self.inner.accounts.len())
            .field("polling", &self.is_polling())
            .finish()
    }
}

impl BulkAccountLoader {
    pub fn new(reader: Arc<dyn AccountReader>, commitment: Commitment, polling_frequency: Duration) -> Self {
        let chunk_size = reader.max_accounts_per_request();
        Self::with_chunk_size(reader, commitment, polling_frequency, chunk_size)
    }

    pub fn from_config(reader: Arc<dyn AccountReader>, config: &AccountSyncConfig) -> Self {
        Self::with_chunk_size(reader, config.commitment, config.polling_frequency(), config.max_accounts_per_request)
    }

    /// `chunk_size` is capped by what the reader accepts per request.
    pub fn with_chunk_size(reader: Arc<dyn AccountReader>, commitment: Commitment, polling_frequency: Duration, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.min(reader.max_accounts_per_request()).max(1);
        Self {
            inner: Arc::new(LoaderInner {
                reader,
                commitment,
                polling_frequency,
                chunk_size,
                accounts: DashMap::new(),
                error_callbacks: DashMap::new(),
                next_callback_id: AtomicU64::new(1),
                polling: Mutex::new(None),
            }),
        }
    }

    pub fn commitment(&self) -> Commitment {
        self.inner.commitment
    }

    pub fn polling_frequency(&self) -> Duration {
        self.inner.polling_frequency
    }

    pub fn chunk_size(&self) -> usize {
        self.inner.chunk_size
    }

    /// Number of registered addresses.
    pub fn len(&self) -> usize {
        self.inner.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.accounts.is_empty()
    }

    pub fn contains(&self, key: &Pubkey) -> bool {
        self.inner.accounts.contains_key(key)
    }

    /// Last observed contents of `key`, if it has been loaded.
    pub fn get_account_data(&self, key: &Pubkey) -> Option<BufferAndSlot> {
        self.inner.accounts.get(key).and_then(|account| account.last.clone())
    }

    pub fn downgrade(&self) -> WeakAccountLoader {
        WeakAccountLoader { inner: Arc::downgrade(&self.inner) }
    }

    /// Allocate a callback id that no other listener of this loader will get,
    /// for use with [`BulkAccountLoader::add_account_with_id`].
    pub fn reserve_callback_id(&self) -> CallbackId {
        self.inner.next_callback_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a listener for `key`. Does not trigger a load.
    pub fn add_account(&self, key: Pubkey, on_change: OnAccountChange) -> CallbackId {
        let callback_id = self.reserve_callback_id();
        self.inner.accounts.entry(key).or_default().listeners.push(Listener { callback_id, on_change, redeliver: false });
        callback_id
    }

    pub fn add_account_with_id(&self, key: Pubkey, callback_id: CallbackId, on_change: OnAccountChange) -> Result<(), LoaderError> {
        let mut account = self.inner.accounts.entry(key).or_default();
        if account.listeners.iter().any(|listener| listener.callback_id == callback_id) {
            return Err(LoaderError::DuplicateCallback { key, callback_id });
        }
        account.listeners.push(Listener { callback_id, on_change, redeliver: false });
        Ok(())
    }

    /// Ask for the next observation of `key` at a newer slot to be delivered
    /// to this listener even when the bytes are unchanged. Used by listeners
    /// that failed to consume the previous delivery.
    pub fn request_redelivery(&self, key: &Pubkey, callback_id: CallbackId) {
        if let Some(mut account) = self.inner.accounts.get_mut(key) {
            if let Some(listener) = account.listeners.iter_mut().find(|listener| listener.callback_id == callback_id) {
                listener.redeliver = true;
            }
        }
    }

    /// Remove one listener. The address and its cached contents are dropped
    /// with the last listener. Unknown keys or ids are ignored.
    pub fn remove_account(&self, key: &Pubkey, callback_id: CallbackId) {
        let now_empty = match self.inner.accounts.get_mut(key) {
            Some(mut account) => {
                account.listeners.retain(|listener| listener.callback_id != callback_id);
                account.listeners.is_empty()
            }
            None => return,
        };

        if now_empty {
            self.inner.accounts.remove_if(key, |_, account| account.listeners.is_empty());
            debug!("Account {} no longer loaded", key);
        }
    }

    pub fn add_error_callback(&self, on_error: OnLoadError) -> CallbackId {
        let callback_id = self.reserve_callback_id();
        self.inner.error_callbacks.insert(callback_id, on_error);
        callback_id
    }

    pub fn remove_error_callback(&self, callback_id: CallbackId) {
        self.inner.error_callbacks.remove(&callback_id);
    }

    /// Read every registered address once, chunks in parallel.
    ///
    /// A failed chunk is reported to the error callbacks and leaves its
    /// accounts untouched; it never fails the whole load.
    pub async fn load(&self) -> LoadStats {
        let keys: Vec<Pubkey> = self.inner.accounts.iter().map(|entry| *entry.key()).collect();
        if keys.is_empty() {
            return LoadStats::default();
        }

        let load_start = Instant::now();
        let chunks: Vec<&[Pubkey]> = keys.chunks(self.inner.chunk_size).collect();
        let results = join_all(chunks.iter().enumerate().map(|(chunk_index, chunk)| self.load_chunk(chunk_index, chunk))).await;

        let mut stats = LoadStats { accounts: keys.len(), chunks: chunks.len(), ..LoadStats::default() };
        for result in results {
            match result {
                Some(changed) => stats.changed += changed,
                None => stats.failed_chunks += 1,
            }
        }

        debug!(
            "Loaded {} accounts in {} chunks ({} failed, {} changed) in {:?}",
            stats.accounts,
            stats.chunks,
            stats.failed_chunks,
            stats.changed,
            load_start.elapsed()
        );
        stats
    }

    /// Returns the number of changed accounts, or `None` if the chunk failed.
    async fn load_chunk(&self, chunk_index: usize, keys: &[Pubkey]) -> Option<usize> {
        let chunk_start = Instant::now();
        let response = match self.inner.reader.get_multiple_accounts(keys, self.inner.commitment).await {
            Ok(response) if response.values.len() == keys.len() => response,
            Ok(response) => {
                let source = RpcError::LengthMismatch { expected: keys.len(), actual: response.values.len() };
                self.report_error(ChunkLoadError { chunk_index, keys: keys.to_vec(), source });
                return None;
            }
            Err(source) => {
                self.report_error(ChunkLoadError { chunk_index, keys: keys.to_vec(), source });
                return None;
            }
        };

        debug!("Chunk {} ({} accounts) at slot {} read in {:?}", chunk_index, keys.len(), response.slot, chunk_start.elapsed());

        let mut changed = 0;
        for (key, buffer) in keys.iter().zip(response.values) {
            if self.handle_account_response(key, BufferAndSlot { slot: response.slot, buffer }) {
                changed += 1;
            }
        }
        Some(changed)
    }

    /// Apply one observation. Returns true if the contents changed.
    fn handle_account_response(&self, key: &Pubkey, response: BufferAndSlot) -> bool {
        let (callbacks, changed): (Vec<OnAccountChange>, bool) = {
            // removed while the read was in flight
            let Some(mut entry) = self.inner.accounts.get_mut(key) else {
                return false;
            };
            let account = &mut *entry;

            match account.last.as_mut() {
                Some(last) if response.slot <= last.slot => return false,
                Some(last) if last.buffer == response.buffer => {
                    last.slot = response.slot;
                    let callbacks = account
                        .listeners
                        .iter_mut()
                        .filter(|listener| listener.redeliver)
                        .map(|listener| {
                            listener.redeliver = false;
                            listener.on_change.clone()
                        })
                        .collect();
                    (callbacks, false)
                }
                _ => {
                    account.last = Some(response.clone());
                    let callbacks = account
                        .listeners
                        .iter_mut()
                        .map(|listener| {
                            listener.redeliver = false;
                            listener.on_change.clone()
                        })
                        .collect();
                    (callbacks, true)
                }
            }
        };

        // the registry guard is released so listeners may re-enter the loader
        for callback in callbacks {
            callback(&response);
        }
        changed
    }

    fn report_error(&self, error: ChunkLoadError) {
        error!("{}", error);
        let error = Arc::new(error);
        let callbacks: Vec<OnLoadError> = self.inner.error_callbacks.iter().map(|entry| entry.value().clone()).collect();
        for callback in callbacks {
            callback(error.clone());
        }
    }

    /// Start the periodic load. No-op if already polling.
    ///
    /// Must be called from within a tokio runtime. The first load happens one
    /// period after the call; a slow load delays the next tick instead of
    /// overlapping with it.
    pub fn start_polling(&self) {
        let mut polling = self.inner.polling.lock();
        if polling.is_some() {
            debug!("Bulk account loader already polling");
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let weak = self.downgrade();
        let period = self.inner.polling_frequency;

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let Some(loader) = weak.upgrade() else {
                            break;
                        };
                        loader.load().await;
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("Bulk account loader polling task exited");
        });

        info!("Bulk account loader polling every {:?}", period);
        *polling = Some(PollingTask { shutdown_tx, _task: task });
    }

    /// Stop the periodic load. No-op if not polling. A load already in
    /// progress is allowed to finish.
    pub fn stop_polling(&self) {
        if let Some(polling) = self.inner.polling.lock().take() {
            let _ = polling.shutdown_tx.try_send(());
            info!("Bulk account loader polling stopped");
        }
    }

    pub fn is_polling(&self) -> bool {
        self.inner.polling.lock().is_some()
    }
}

impl Drop for LoaderInner {
    fn drop(&mut self) {
        if let Some(polling) = self.polling.get_mut().take() {
            let _ = polling.shutdown_tx.try_send(());
        }
    }
}
