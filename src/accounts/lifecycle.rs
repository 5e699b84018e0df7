use super::error::SubscriberError;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;

type PendingSubscribe = Shared<BoxFuture<'static, Result<(), SubscriberError>>>;

enum SubscriptionState {
    Unsubscribed,
    /// Every caller that arrives while subscribing awaits this same future.
    Subscribing(PendingSubscribe),
    Subscribed,
}

/// Subscribe state machine shared by the orchestrators.
///
/// `Unsubscribed -> Subscribing -> Subscribed`, back to `Unsubscribed` on
/// unsubscribe or when the subscribe fails. Concurrent subscribe calls share a
/// single run. The run is spawned, so it completes and settles the state even
/// if every caller stops waiting.
pub(crate) struct SubscriptionLifecycle {
    state: Mutex<SubscriptionState>,
}

impl SubscriptionLifecycle {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self { state: Mutex::new(SubscriptionState::Unsubscribed) })
    }

    pub(crate) fn is_subscribed(&self) -> bool {
        matches!(*self.state.lock(), SubscriptionState::Subscribed)
    }

    /// Run `subscribe` unless already subscribed or another run is in flight.
    pub(crate) async fn subscribe<F, Fut>(self: &Arc<Self>, subscribe: F) -> Result<bool, SubscriberError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), SubscriberError>> + Send + 'static,
    {
        let pending = {
            let mut state = self.state.lock();
            match &*state {
                SubscriptionState::Subscribed => return Ok(true),
                SubscriptionState::Subscribing(pending) => pending.clone(),
                SubscriptionState::Unsubscribed => {
                    let run = subscribe();
                    let lifecycle = self.clone();
                    let task = tokio::spawn(async move {
                        let result = run.await;
                        *lifecycle.state.lock() = match result {
                            Ok(()) => SubscriptionState::Subscribed,
                            Err(_) => SubscriptionState::Unsubscribed,
                        };
                        result
                    });

                    let lifecycle = self.clone();
                    let pending = async move {
                        task.await.unwrap_or_else(|e| {
                            *lifecycle.state.lock() = SubscriptionState::Unsubscribed;
                            Err(SubscriberError::Interrupted(e.to_string()))
                        })
                    }
                    .boxed()
                    .shared();
                    *state = SubscriptionState::Subscribing(pending.clone());
                    pending
                }
            }
        };

        pending.await.map(|()| true)
    }

    /// Move to `Unsubscribed`, first waiting out a subscribe in flight.
    /// Returns true when there was a subscription to tear down.
    pub(crate) async fn unsubscribe(&self) -> bool {
        let pending = match &*self.state.lock() {
            SubscriptionState::Unsubscribed => return false,
            SubscriptionState::Subscribing(pending) => Some(pending.clone()),
            SubscriptionState::Subscribed => None,
        };
        if let Some(pending) = pending {
            if pending.await.is_err() {
                return false;
            }
        }

        let mut state = self.state.lock();
        match *state {
            SubscriptionState::Subscribed => {
                *state = SubscriptionState::Unsubscribed;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_subscribe_runs_once() {
        let lifecycle = SubscriptionLifecycle::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let subscribe = || {
            let runs = runs.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(())
            }
        };
        let (first, second) = tokio::join!(lifecycle.subscribe(subscribe), lifecycle.subscribe(subscribe));

        assert!(first.unwrap());
        assert!(second.unwrap());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(lifecycle.is_subscribed());

        // already subscribed
        assert!(lifecycle.subscribe(subscribe).await.unwrap());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_is_shared_and_resets_state() {
        let lifecycle = SubscriptionLifecycle::new();
        let failing = || async { Err(SubscriberError::AccountNotLoaded(crate::types::AccountKind::State)) };

        let (first, second) = tokio::join!(lifecycle.subscribe(failing), lifecycle.subscribe(failing));
        assert!(matches!(first, Err(SubscriberError::AccountNotLoaded(_))));
        assert!(matches!(second, Err(SubscriberError::AccountNotLoaded(_))));
        assert!(!lifecycle.is_subscribed());

        // back to unsubscribed, so a new run starts
        assert!(lifecycle.subscribe(|| async { Ok(()) }).await.unwrap());
    }

    #[tokio::test]
    async fn test_unsubscribe_waits_for_pending_subscribe() {
        let lifecycle = SubscriptionLifecycle::new();
        let slow = || async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(())
        };

        let (subscribed, unsubscribed) = tokio::join!(lifecycle.subscribe(slow), async {
            tokio::task::yield_now().await;
            lifecycle.unsubscribe().await
        });
        assert!(subscribed.unwrap());
        assert!(unsubscribed);
        assert!(!lifecycle.is_subscribed());
        assert!(!lifecycle.unsubscribe().await);
    }
}
