use super::error::SubscriberError;
use super::subscriber::{AccountCache, AccountSubscriber, DataAndSlot, OnAccountUpdate, OnSubscriberError, UpdateListener};
use crate::coder::{AccountCoder, ProgramAccount};
use crate::data_sync::{AccountPubsub, AccountReader, AccountSubscription, Commitment};
use crate::types::Pubkey;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Account subscriber fed by `accountSubscribe` push notifications.
///
/// Subscribing reads the account once, then opens the push channel. Pushed
/// updates replace the snapshot unconditionally since the node delivers
/// them in slot order. If the channel closes without `unsubscribe`, the
/// subscriber stops reporting itself subscribed and the error callback gets
/// [`SubscriberError::ChannelClosed`].
pub struct WebSocketAccountSubscriber<T: ProgramAccount> {
    key: Pubkey,
    reader: Arc<dyn AccountReader>,
    pubsub: Arc<dyn AccountPubsub>,
    coder: Arc<dyn AccountCoder>,
    commitment: Commitment,
    cache: Arc<AccountCache<T>>,
    listener: Arc<UpdateListener<T>>,
    forward_task: Mutex<Option<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl<T: ProgramAccount> WebSocketAccountSubscriber<T> {
    pub fn new(key: Pubkey, reader: Arc<dyn AccountReader>, pubsub: Arc<dyn AccountPubsub>, coder: Arc<dyn AccountCoder>, commitment: Commitment) -> Self {
        Self {
            key,
            reader,
            pubsub,
            coder,
            commitment,
            cache: Arc::new(AccountCache::new()),
            listener: Arc::new(UpdateListener::new()),
            forward_task: Mutex::new(None),
            closed: Arc::new(AtomicBool::new(false)),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    async fn forward_updates(
        key: Pubkey,
        mut subscription: AccountSubscription,
        coder: Arc<dyn AccountCoder>,
        cache: Arc<AccountCache<T>>,
        listener: Arc<UpdateListener<T>>,
        closed: Arc<AtomicBool>,
    ) {
        while let Some(update) = subscription.updates.recv().await {
            let Some(raw) = update.buffer else {
                warn!("{} account {} was removed at slot {}", T::KIND, key, update.slot);
                continue;
            };

            match cache.replace(coder.as_ref(), update.slot, &raw) {
                Ok(data) => listener.notify(data),
                Err(e) => warn!("Failed to decode {} account {} at slot {}, keeping last known value: {}", T::KIND, key, update.slot, e),
            }
        }
        // only reached when the sending side gave up, `unsubscribe` aborts the task instead
        closed.store(true, Ordering::SeqCst);
        warn!("Push channel for {} account {} closed, no further updates", T::KIND, key);
        listener.notify_error(SubscriberError::ChannelClosed { kind: T::KIND, key });
    }
}

#[async_trait]
impl<T: ProgramAccount> AccountSubscriber<T> for WebSocketAccountSubscriber<T> {
    fn key(&self) -> Pubkey {
        self.key
    }

    async fn subscribe(&self, on_change: OnAccountUpdate<T>) -> Result<(), SubscriberError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_subscribed() {
            return Ok(());
        }
        // a task left behind by a closed channel has already finished
        self.forward_task.lock().take();
        self.closed.store(false, Ordering::SeqCst);

        self.listener.set(on_change);
        let subscription = match self.fetch().await {
            Ok(()) => self.pubsub.account_subscribe(self.key, self.commitment).await.map_err(SubscriberError::from),
            Err(e) => Err(e),
        };
        let subscription = match subscription {
            Ok(subscription) => subscription,
            Err(e) => {
                self.listener.clear();
                return Err(e);
            }
        };

        let task = tokio::spawn(Self::forward_updates(
            self.key,
            subscription,
            self.coder.clone(),
            self.cache.clone(),
            self.listener.clone(),
            self.closed.clone(),
        ));
        *self.forward_task.lock() = Some(task);
        info!("Subscribed to {} account {}", T::KIND, self.key);
        Ok(())
    }

    async fn fetch(&self) -> Result<(), SubscriberError> {
        let response = self.reader.get_account(&self.key, self.commitment).await?;
        let Some(raw) = response.buffer else {
            return Err(SubscriberError::AccountNotFound { kind: T::KIND, key: self.key });
        };

        if let Some(data) = self.cache.apply(self.coder.as_ref(), response.slot, &raw)? {
            self.listener.notify(data);
        }
        Ok(())
    }

    async fn unsubscribe(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(task) = self.forward_task.lock().take() else {
            return;
        };

        // dropping the subscription inside the task closes the push channel
        task.abort();
        let _ = task.await;
        self.listener.clear();
        self.cache.clear();
        debug!("Unsubscribed from {} account {}", T::KIND, self.key);
    }

    fn is_subscribed(&self) -> bool {
        self.forward_task.lock().is_some() && !self.closed.load(Ordering::SeqCst)
    }

    fn set_error_callback(&self, on_error: OnSubscriberError) {
        self.listener.set_on_error(on_error);
    }

    fn data_and_slot(&self) -> Option<DataAndSlot<T>> {
        self.cache.get()
    }
}
