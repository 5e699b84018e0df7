use super::error::SubscriberError;
use crate::coder::{AccountCoder, DecodeError, ProgramAccount, decode_account};
use crate::types::Pubkey;
use alloy_primitives::Bytes;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Called with the new snapshot every time a subscribed account changes.
pub type OnAccountUpdate<T> = Arc<dyn Fn(Arc<T>) + Send + Sync>;

/// Called when a subscription fails after `subscribe` returned.
pub type OnSubscriberError = Arc<dyn Fn(SubscriberError) + Send + Sync>;

/// A decoded snapshot and the slot it was read at.
#[derive(Debug)]
pub struct DataAndSlot<T> {
    pub data: Arc<T>,
    pub slot: u64,
}

impl<T> Clone for DataAndSlot<T> {
    fn clone(&self) -> Self {
        Self { data: self.data.clone(), slot: self.slot }
    }
}

/// Keeps the decoded snapshot of a single account up to date, whether the
/// updates are pushed by the node or pulled through a shared loader.
#[async_trait]
pub trait AccountSubscriber<T: ProgramAccount>: Send + Sync {
    fn key(&self) -> Pubkey;

    /// Start receiving updates. The current contents are loaded before this
    /// returns. No-op when already subscribed.
    async fn subscribe(&self, on_change: OnAccountUpdate<T>) -> Result<(), SubscriberError>;

    /// Force one fresh read; `on_change` fires only if the contents differ
    /// from the cached snapshot.
    async fn fetch(&self) -> Result<(), SubscriberError>;

    /// Stop receiving updates. No-op when not subscribed.
    async fn unsubscribe(&self);

    fn is_subscribed(&self) -> bool;

    /// Register a callback for failures that surface in the background, such
    /// as the push channel closing for good. Set it before `subscribe`.
    fn set_error_callback(&self, _on_error: OnSubscriberError) {}

    /// Decode the latest bytes already read for this account without issuing
    /// a read. Only subscribers fed by a shared loader have such bytes.
    fn apply_latest(&self) -> Result<(), SubscriberError> {
        Ok(())
    }

    fn data_and_slot(&self) -> Option<DataAndSlot<T>>;

    fn data(&self) -> Option<Arc<T>> {
        self.data_and_slot().map(|data_and_slot| data_and_slot.data)
    }
}

/// The callbacks of a subscriber, shared with background tasks.
pub(crate) struct UpdateListener<T> {
    on_change: Mutex<Option<OnAccountUpdate<T>>>,
    on_error: Mutex<Option<OnSubscriberError>>,
}

impl<T> UpdateListener<T> {
    pub(crate) fn new() -> Self {
        Self { on_change: Mutex::new(None), on_error: Mutex::new(None) }
    }

    pub(crate) fn set_on_error(&self, on_error: OnSubscriberError) {
        *self.on_error.lock() = Some(on_error);
    }

    pub(crate) fn notify_error(&self, error: SubscriberError) {
        let on_error = self.on_error.lock().clone();
        if let Some(on_error) = on_error {
            on_error(error);
        }
    }

    pub(crate) fn set(&self, on_change: OnAccountUpdate<T>) {
        *self.on_change.lock() = Some(on_change);
    }

    pub(crate) fn clear(&self) {
        *self.on_change.lock() = None;
    }

    pub(crate) fn notify(&self, data: Arc<T>) {
        let on_change = self.on_change.lock().clone();
        if let Some(on_change) = on_change {
            on_change(data);
        }
    }
}

/// An update callback that sends `event(data)` followed by `update` on an
/// orchestrator's event channel.
pub(crate) fn broadcast_update<T, E>(event_tx: &broadcast::Sender<E>, event: fn(Arc<T>) -> E, update: E) -> OnAccountUpdate<T>
where
    T: ProgramAccount,
    E: Clone + Send + Sync + 'static,
{
    let event_tx = event_tx.clone();
    Arc::new(move |data: Arc<T>| {
        // no receivers is fine
        let _ = event_tx.send(event(data));
        let _ = event_tx.send(update.clone());
    })
}

/// An error callback that sends `event(error)` on an orchestrator's event channel.
pub(crate) fn broadcast_error<E>(event_tx: &broadcast::Sender<E>, event: fn(SubscriberError) -> E) -> OnSubscriberError
where
    E: Clone + Send + Sync + 'static,
{
    let event_tx = event_tx.clone();
    Arc::new(move |error: SubscriberError| {
        let _ = event_tx.send(event(error));
    })
}

struct CachedAccount<T> {
    slot: u64,
    raw: Bytes,
    data: Arc<T>,
}

/// Last successfully decoded snapshot of one account.
///
/// A failed decode never replaces the cached value; the caller gets the
/// error and the previous snapshot stays readable.
pub(crate) struct AccountCache<T> {
    cached: Mutex<Option<CachedAccount<T>>>,
}

impl<T: ProgramAccount> AccountCache<T> {
    pub(crate) fn new() -> Self {
        Self { cached: Mutex::new(None) }
    }

    pub(crate) fn get(&self) -> Option<DataAndSlot<T>> {
        self.cached.lock().as_ref().map(|cached| DataAndSlot { data: cached.data.clone(), slot: cached.slot })
    }

    pub(crate) fn clear(&self) {
        *self.cached.lock() = None;
    }

    /// Apply bytes read at `slot`. A slot no newer than the cached one is
    /// ignored and identical bytes only advance the slot. Returns the new
    /// snapshot if it was replaced.
    pub(crate) fn apply(&self, coder: &dyn AccountCoder, slot: u64, raw: &Bytes) -> Result<Option<Arc<T>>, DecodeError> {
        let mut cached = self.cached.lock();
        if let Some(current) = cached.as_mut() {
            if slot <= current.slot {
                return Ok(None);
            }
            if current.raw == *raw {
                current.slot = slot;
                return Ok(None);
            }
        }

        let data = Arc::new(decode_account::<T>(coder, raw)?);
        *cached = Some(CachedAccount { slot, raw: raw.clone(), data: data.clone() });
        Ok(Some(data))
    }

    /// Replace the snapshot regardless of slot or contents.
    pub(crate) fn replace(&self, coder: &dyn AccountCoder, slot: u64, raw: &Bytes) -> Result<Arc<T>, DecodeError> {
        let data = Arc::new(decode_account::<T>(coder, raw)?);
        *self.cached.lock() = Some(CachedAccount { slot, raw: raw.clone(), data: data.clone() });
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coder::AnchorAccountCoder;
    use crate::types::UserAccount;

    fn encoded(collateral: u128) -> Bytes {
        AnchorAccountCoder::encode(&UserAccount { collateral, ..Default::default() }).into()
    }

    #[test]
    fn test_apply_ignores_older_slots_and_same_bytes() {
        let cache = AccountCache::<UserAccount>::new();
        assert!(cache.apply(&AnchorAccountCoder, 10, &encoded(1)).unwrap().is_some());

        assert!(cache.apply(&AnchorAccountCoder, 9, &encoded(2)).unwrap().is_none());
        // a second read at the same slot does not overwrite what is cached
        assert!(cache.apply(&AnchorAccountCoder, 10, &encoded(3)).unwrap().is_none());
        assert_eq!(cache.get().unwrap().data.collateral, 1);

        assert!(cache.apply(&AnchorAccountCoder, 12, &encoded(1)).unwrap().is_none());
        let current = cache.get().unwrap();
        assert_eq!(current.slot, 12);
        assert_eq!(current.data.collateral, 1);

        let updated = cache.apply(&AnchorAccountCoder, 13, &encoded(2)).unwrap().unwrap();
        assert_eq!(updated.collateral, 2);
    }

    #[test]
    fn test_decode_failure_keeps_last_known_good() {
        let cache = AccountCache::<UserAccount>::new();
        cache.apply(&AnchorAccountCoder, 1, &encoded(7)).unwrap();

        let garbage = Bytes::from(vec![0u8; 4]);
        assert!(cache.apply(&AnchorAccountCoder, 2, &garbage).is_err());
        assert!(cache.replace(&AnchorAccountCoder, 3, &garbage).is_err());

        let current = cache.get().unwrap();
        assert_eq!(current.slot, 1);
        assert_eq!(current.data.collateral, 7);

        // the same bad bytes are decoded again next time rather than remembered
        assert!(cache.apply(&AnchorAccountCoder, 4, &garbage).is_err());
    }

    #[test]
    fn test_replace_is_unconditional() {
        let cache = AccountCache::<UserAccount>::new();
        cache.apply(&AnchorAccountCoder, 10, &encoded(1)).unwrap();
        let replaced = cache.replace(&AnchorAccountCoder, 8, &encoded(3)).unwrap();
        assert_eq!(replaced.collateral, 3);
        assert_eq!(cache.get().unwrap().slot, 8);

        cache.clear();
        assert!(cache.get().is_none());
    }
}
