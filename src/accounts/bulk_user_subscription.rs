use super::error::SubscriberError;
use super::user::UserAccountSubscriber;
use crate::coder::decode_account;
use crate::data_sync::{BufferAndSlot, BulkAccountLoader, CallbackId, OnAccountChange};
use crate::types::{Pubkey, UserAccount};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Keeps addresses registered with the loader until the real subscribers
/// have added their own listeners.
struct Prefetch<'a> {
    loader: &'a BulkAccountLoader,
    registered: Vec<(Pubkey, CallbackId)>,
}

impl<'a> Prefetch<'a> {
    fn new(loader: &'a BulkAccountLoader) -> Self {
        Self { loader, registered: Vec::new() }
    }

    fn add(&mut self, key: Pubkey) {
        let noop: OnAccountChange = Arc::new(|_: &BufferAndSlot| {});
        let callback_id = self.loader.add_account(key, noop);
        self.registered.push((key, callback_id));
    }
}

impl Drop for Prefetch<'_> {
    fn drop(&mut self) {
        for (key, callback_id) in self.registered.drain(..) {
            self.loader.remove_account(&key, callback_id);
        }
    }
}

/// Subscribe many users that share `loader` in a fixed number of reads.
///
/// The user records are loaded in one pass and the positions records they
/// point to in a second; every `subscribe` then finds its records cached.
/// With no users this runs a single pass. Every user is attempted; the first
/// failure is returned.
pub async fn bulk_polling_user_subscribe(users: &[UserAccountSubscriber], loader: &BulkAccountLoader) -> Result<(), SubscriberError> {
    if users.is_empty() {
        loader.load().await;
        return Ok(());
    }

    let started = Instant::now();
    let mut prefetch = Prefetch::new(loader);
    for user in users {
        prefetch.add(user.user_key());
    }
    loader.load().await;

    for user in users {
        let Some(raw) = loader.get_account_data(&user.user_key()).and_then(|loaded| loaded.buffer) else {
            continue;
        };
        match decode_account::<UserAccount>(user.context().coder.as_ref(), &raw) {
            Ok(account) => prefetch.add(account.positions),
            // the user's own subscribe reports it
            Err(e) => warn!("Failed to decode user {} during bulk subscribe: {}", user.user_key(), e),
        }
    }
    loader.load().await;

    let results = join_all(users.iter().map(|user| user.subscribe())).await;
    drop(prefetch);

    let failed = results.iter().filter(|result| result.is_err()).count();
    info!("Bulk subscribed {} users ({} failed) in {:?}", users.len() - failed, failed, started.elapsed());
    results.into_iter().find_map(Result::err).map_or(Ok(()), Err)
}
