use super::error::SubscriberError;
use super::subscriber::{AccountCache, AccountSubscriber, DataAndSlot, OnAccountUpdate, UpdateListener};
use crate::coder::{AccountCoder, ProgramAccount};
use crate::data_sync::{BufferAndSlot, BulkAccountLoader, CallbackId, OnAccountChange};
use crate::types::Pubkey;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

/// Account subscriber registered with a shared [`BulkAccountLoader`].
///
/// The loader decides when the account is read; this subscriber decodes
/// whatever the loader reports as changed.
pub struct PollingAccountSubscriber<T: ProgramAccount> {
    key: Pubkey,
    loader: BulkAccountLoader,
    coder: Arc<dyn AccountCoder>,
    cache: Arc<AccountCache<T>>,
    listener: Arc<UpdateListener<T>>,
    callback_id: Mutex<Option<CallbackId>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl<T: ProgramAccount> PollingAccountSubscriber<T> {
    pub fn new(key: Pubkey, loader: BulkAccountLoader, coder: Arc<dyn AccountCoder>) -> Self {
        Self {
            key,
            loader,
            coder,
            cache: Arc::new(AccountCache::new()),
            listener: Arc::new(UpdateListener::new()),
            callback_id: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    fn loader_callback(&self, callback_id: CallbackId) -> OnAccountChange {
        let key = self.key;
        let loader = self.loader.downgrade();
        let coder = self.coder.clone();
        let cache = self.cache.clone();
        let listener = self.listener.clone();

        Arc::new(move |update: &BufferAndSlot| {
            let Some(raw) = &update.buffer else {
                debug!("{} account {} does not exist at slot {}", T::KIND, key, update.slot);
                return;
            };

            match cache.apply(coder.as_ref(), update.slot, raw) {
                Ok(Some(data)) => listener.notify(data),
                Ok(None) => {}
                Err(e) => {
                    warn!("Failed to decode {} account {} at slot {}, keeping last known value: {}", T::KIND, key, update.slot, e);
                    // decode again on the next load even if the bytes stay the same
                    if let Some(loader) = loader.upgrade() {
                        loader.request_redelivery(&key, callback_id);
                    }
                }
            }
        })
    }

    /// Decode the loader's latest bytes for this account.
    fn apply_loaded(&self) -> Result<(), SubscriberError> {
        let Some(loaded) = self.loader.get_account_data(&self.key) else {
            return Err(SubscriberError::AccountNotLoaded(T::KIND));
        };
        let Some(raw) = loaded.buffer else {
            return Err(SubscriberError::AccountNotFound { kind: T::KIND, key: self.key });
        };

        if let Some(data) = self.cache.apply(self.coder.as_ref(), loaded.slot, &raw)? {
            self.listener.notify(data);
        }
        Ok(())
    }
}

#[async_trait]
impl<T: ProgramAccount> AccountSubscriber<T> for PollingAccountSubscriber<T> {
    fn key(&self) -> Pubkey {
        self.key
    }

    /// Registers with the loader. When the loader already holds the account
    /// no read is issued, otherwise the loader runs one pass.
    async fn subscribe(&self, on_change: OnAccountUpdate<T>) -> Result<(), SubscriberError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_subscribed() {
            return Ok(());
        }

        self.listener.set(on_change);
        let callback_id = self.loader.reserve_callback_id();
        self.loader.add_account_with_id(self.key, callback_id, self.loader_callback(callback_id))?;

        if self.loader.get_account_data(&self.key).is_none() {
            self.loader.load().await;
        }
        if let Err(e) = self.apply_loaded() {
            self.loader.remove_account(&self.key, callback_id);
            self.listener.clear();
            return Err(e);
        }

        *self.callback_id.lock() = Some(callback_id);
        debug!("{} account {} registered with bulk loader", T::KIND, self.key);
        Ok(())
    }

    async fn fetch(&self) -> Result<(), SubscriberError> {
        if !self.is_subscribed() {
            return Err(SubscriberError::NotSubscribed);
        }
        self.loader.load().await;
        self.apply_loaded()
    }

    fn apply_latest(&self) -> Result<(), SubscriberError> {
        if !self.is_subscribed() {
            return Err(SubscriberError::NotSubscribed);
        }
        self.apply_loaded()
    }

    async fn unsubscribe(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(callback_id) = self.callback_id.lock().take() else {
            return;
        };

        self.loader.remove_account(&self.key, callback_id);
        self.listener.clear();
        self.cache.clear();
        debug!("{} account {} removed from bulk loader", T::KIND, self.key);
    }

    fn is_subscribed(&self) -> bool {
        self.callback_id.lock().is_some()
    }

    fn data_and_slot(&self) -> Option<DataAndSlot<T>> {
        self.cache.get()
    }
}
