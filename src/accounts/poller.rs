use super::error::SubscriberError;
use super::subscriber::{AccountSubscriber, DataAndSlot, OnAccountUpdate, OnSubscriberError};
use crate::coder::ProgramAccount;
use crate::types::{AccountKind, Pubkey};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Called with the record kind after every successful timed fetch.
pub type OnFetch = Arc<dyn Fn(AccountKind) + Send + Sync>;

struct PollingTask {
    shutdown_tx: mpsc::Sender<()>,
    _task: JoinHandle<()>,
}

/// Adds an independent fetch timer to any [`AccountSubscriber`].
///
/// The timer only forces `fetch` on the wrapped subscriber; it does not
/// touch the shared loader cadence.
pub struct AccountPoller<T: ProgramAccount> {
    inner: Arc<dyn AccountSubscriber<T>>,
    polling_rate: Mutex<Duration>,
    polling: Mutex<Option<PollingTask>>,
}

impl<T: ProgramAccount> AccountPoller<T> {
    pub fn new(inner: Arc<dyn AccountSubscriber<T>>, polling_rate: Duration) -> Self {
        Self { inner, polling_rate: Mutex::new(polling_rate), polling: Mutex::new(None) }
    }

    pub fn kind(&self) -> AccountKind {
        T::KIND
    }

    pub fn polling_rate(&self) -> Duration {
        *self.polling_rate.lock()
    }

    /// Takes effect on the next [`AccountPoller::start_polling`].
    pub fn set_polling_rate(&self, polling_rate: Duration) {
        *self.polling_rate.lock() = polling_rate;
    }

    pub fn is_polling(&self) -> bool {
        self.polling.lock().is_some()
    }

    pub fn start_polling(&self, on_fetch: OnFetch) -> Result<(), SubscriberError> {
        if !self.inner.is_subscribed() {
            return Err(SubscriberError::NotSubscribed);
        }

        let mut polling = self.polling.lock();
        if polling.is_some() {
            return Err(SubscriberError::AlreadyPolling(T::KIND));
        }

        let period = self.polling_rate();
        let subscriber = Arc::downgrade(&self.inner);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let Some(subscriber) = subscriber.upgrade() else {
                            break;
                        };
                        match subscriber.fetch().await {
                            Ok(()) => on_fetch(T::KIND),
                            Err(e) => warn!("Timed fetch of {} account {} failed: {}", T::KIND, subscriber.key(), e),
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        debug!("Polling {} account {} every {:?}", T::KIND, self.inner.key(), period);
        *polling = Some(PollingTask { shutdown_tx, _task: task });
        Ok(())
    }

    pub fn stop_polling(&self) -> Result<(), SubscriberError> {
        let Some(polling) = self.polling.lock().take() else {
            return Err(SubscriberError::NotPolling(T::KIND));
        };
        let _ = polling.shutdown_tx.try_send(());
        debug!("Stopped polling {} account {}", T::KIND, self.inner.key());
        Ok(())
    }
}

#[async_trait]
impl<T: ProgramAccount> AccountSubscriber<T> for AccountPoller<T> {
    fn key(&self) -> Pubkey {
        self.inner.key()
    }

    async fn subscribe(&self, on_change: OnAccountUpdate<T>) -> Result<(), SubscriberError> {
        self.inner.subscribe(on_change).await
    }

    async fn fetch(&self) -> Result<(), SubscriberError> {
        self.inner.fetch().await
    }

    /// Stops the timer before unsubscribing the wrapped subscriber.
    async fn unsubscribe(&self) {
        let _ = self.stop_polling();
        self.inner.unsubscribe().await;
    }

    fn is_subscribed(&self) -> bool {
        self.inner.is_subscribed()
    }

    fn set_error_callback(&self, on_error: OnSubscriberError) {
        self.inner.set_error_callback(on_error)
    }

    fn apply_latest(&self) -> Result<(), SubscriberError> {
        self.inner.apply_latest()
    }

    fn data_and_slot(&self) -> Option<DataAndSlot<T>> {
        self.inner.data_and_slot()
    }
}

/// Type-erased view of an [`AccountPoller`], for orchestrators that manage
/// records of different types uniformly.
#[async_trait]
pub trait ManagedAccount: Send + Sync {
    fn kind(&self) -> AccountKind;

    fn key(&self) -> Pubkey;

    async fn fetch(&self) -> Result<(), SubscriberError>;

    /// See [`AccountSubscriber::apply_latest`].
    fn apply_latest(&self) -> Result<(), SubscriberError>;

    async fn unsubscribe(&self);

    fn start_polling(&self, on_fetch: OnFetch) -> Result<(), SubscriberError>;

    fn stop_polling(&self) -> Result<(), SubscriberError>;

    fn set_polling_rate(&self, polling_rate: Duration);
}

#[async_trait]
impl<T: ProgramAccount> ManagedAccount for AccountPoller<T> {
    fn kind(&self) -> AccountKind {
        T::KIND
    }

    fn key(&self) -> Pubkey {
        self.inner.key()
    }

    async fn fetch(&self) -> Result<(), SubscriberError> {
        self.inner.fetch().await
    }

    fn apply_latest(&self) -> Result<(), SubscriberError> {
        self.inner.apply_latest()
    }

    async fn unsubscribe(&self) {
        AccountSubscriber::unsubscribe(self).await
    }

    fn start_polling(&self, on_fetch: OnFetch) -> Result<(), SubscriberError> {
        AccountPoller::start_polling(self, on_fetch)
    }

    fn stop_polling(&self) -> Result<(), SubscriberError> {
        AccountPoller::stop_polling(self)
    }

    fn set_polling_rate(&self, polling_rate: Duration) {
        AccountPoller::set_polling_rate(self, polling_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::PollingAccountSubscriber;
    use crate::coder::AnchorAccountCoder;
    use crate::data_sync::{BulkAccountLoader, Commitment, MockAccountReader};
    use crate::types::UserAccount;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn poller(reader: &Arc<MockAccountReader>, key: Pubkey) -> AccountPoller<UserAccount> {
        let loader = BulkAccountLoader::new(reader.clone(), Commitment::Confirmed, Duration::from_secs(60));
        AccountPoller::new(Arc::new(PollingAccountSubscriber::new(key, loader, Arc::new(AnchorAccountCoder))), Duration::from_millis(100))
    }

    fn on_fetch() -> (OnFetch, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = count.clone();
        let on_fetch: OnFetch = Arc::new(move |kind: AccountKind| {
            assert_eq!(kind, AccountKind::User);
            inner.fetch_add(1, Ordering::SeqCst);
        });
        (on_fetch, count)
    }

    #[tokio::test]
    async fn test_polling_requires_subscription() {
        let reader = Arc::new(MockAccountReader::new());
        let poller = poller(&reader, Pubkey::new_unique());
        let (callback, _) = on_fetch();
        assert!(matches!(poller.start_polling(callback), Err(SubscriberError::NotSubscribed)));
        assert!(matches!(poller.stop_polling(), Err(SubscriberError::NotPolling(AccountKind::User))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fetches_and_reports() {
        let reader = Arc::new(MockAccountReader::new());
        let key = Pubkey::new_unique();
        reader.set_account(key, &UserAccount::default());
        let poller = poller(&reader, key);
        poller.subscribe(Arc::new(|_: Arc<UserAccount>| {})).await.unwrap();
        assert_eq!(reader.request_count(), 1);

        let (callback, count) = on_fetch();
        poller.start_polling(callback.clone()).unwrap();
        assert!(matches!(poller.start_polling(callback), Err(SubscriberError::AlreadyPolling(AccountKind::User))));

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(reader.request_count(), 4);

        poller.stop_polling().unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_change_applies_on_restart() {
        let reader = Arc::new(MockAccountReader::new());
        let key = Pubkey::new_unique();
        reader.set_account(key, &UserAccount::default());
        let poller = poller(&reader, key);
        poller.subscribe(Arc::new(|_: Arc<UserAccount>| {})).await.unwrap();

        let (callback, count) = on_fetch();
        poller.set_polling_rate(Duration::from_millis(500));
        poller.start_polling(callback).unwrap();
        tokio::time::sleep(Duration::from_millis(450)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_stops_timer() {
        let reader = Arc::new(MockAccountReader::new());
        let key = Pubkey::new_unique();
        reader.set_account(key, &UserAccount::default());
        let poller = poller(&reader, key);
        poller.subscribe(Arc::new(|_: Arc<UserAccount>| {})).await.unwrap();
        let (callback, count) = on_fetch();
        poller.start_polling(callback).unwrap();

        AccountSubscriber::unsubscribe(&poller).await;
        assert!(!poller.is_polling());
        assert!(!poller.is_subscribed());
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
