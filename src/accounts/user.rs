use super::context::AccountContext;
use super::error::SubscriberError;
use super::lifecycle::SubscriptionLifecycle;
use super::poller::{AccountPoller, ManagedAccount, OnFetch};
use super::subscriber::{AccountSubscriber, OnAccountUpdate, broadcast_error, broadcast_update};
use crate::coder::ProgramAccount;
use crate::data_sync::{CallbackId, ChunkLoadError};
use crate::types::{AccountKind, Pubkey, UserAccount, UserPositionsAccount};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub enum UserAccountEvent {
    UserAccountData(Arc<UserAccount>),
    UserPositionsData(Arc<UserPositionsAccount>),
    Update,
    Fetched,
    FetchedAccount(AccountKind),
    Error(Arc<ChunkLoadError>),
    SubscriptionError(SubscriberError),
}

struct UserAccounts {
    user: Arc<AccountPoller<UserAccount>>,
    positions: Arc<AccountPoller<UserPositionsAccount>>,
}

impl UserAccounts {
    fn all(&self) -> [Arc<dyn ManagedAccount>; 2] {
        [self.user.clone(), self.positions.clone()]
    }
}

fn poller<T: ProgramAccount>(context: &AccountContext, key: Pubkey, event_tx: &broadcast::Sender<UserAccountEvent>) -> Arc<AccountPoller<T>> {
    let poller = context.account_poller::<T>(key);
    poller.set_error_callback(broadcast_error(event_tx, UserAccountEvent::SubscriptionError));
    Arc::new(poller)
}

fn on_update<T: ProgramAccount>(event_tx: &broadcast::Sender<UserAccountEvent>, event: fn(Arc<T>) -> UserAccountEvent) -> OnAccountUpdate<T> {
    broadcast_update(event_tx, event, UserAccountEvent::Update)
}

/// Keeps one user's root record and the positions record it points to in sync.
pub struct UserAccountSubscriber {
    context: AccountContext,
    user_key: Pubkey,
    lifecycle: Arc<SubscriptionLifecycle>,
    accounts: Arc<RwLock<Option<UserAccounts>>>,
    event_tx: broadcast::Sender<UserAccountEvent>,
    error_callback_id: Arc<Mutex<Option<CallbackId>>>,
}

impl UserAccountSubscriber {
    pub fn new(context: AccountContext, user_key: Pubkey) -> Self {
        let (event_tx, _) = broadcast::channel(context.event_channel_capacity.max(1));
        Self {
            context,
            user_key,
            lifecycle: SubscriptionLifecycle::new(),
            accounts: Arc::new(RwLock::new(None)),
            event_tx,
            error_callback_id: Arc::new(Mutex::new(None)),
        }
    }

    pub fn user_key(&self) -> Pubkey {
        self.user_key
    }

    pub fn context(&self) -> &AccountContext {
        &self.context
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<UserAccountEvent> {
        self.event_tx.subscribe()
    }

    pub fn is_subscribed(&self) -> bool {
        self.lifecycle.is_subscribed()
    }

    /// Subscribe to the user record, then to the positions record it names.
    pub async fn subscribe(&self) -> Result<bool, SubscriberError> {
        let context = self.context.clone();
        let user_key = self.user_key;
        let accounts = self.accounts.clone();
        let event_tx = self.event_tx.clone();
        let error_callback_id = self.error_callback_id.clone();

        self.lifecycle
            .subscribe(move || Self::subscribe_accounts(context, user_key, accounts, event_tx, error_callback_id))
            .await
    }

    async fn subscribe_accounts(
        context: AccountContext,
        user_key: Pubkey,
        accounts: Arc<RwLock<Option<UserAccounts>>>,
        event_tx: broadcast::Sender<UserAccountEvent>,
        error_callback_id: Arc<Mutex<Option<CallbackId>>>,
    ) -> Result<(), SubscriberError> {
        debug!("Subscribing to user {}", user_key);

        let user = poller::<UserAccount>(&context, user_key, &event_tx);
        user.subscribe(on_update(&event_tx, UserAccountEvent::UserAccountData)).await?;
        let Some(user_account) = user.data() else {
            AccountSubscriber::unsubscribe(user.as_ref()).await;
            return Err(SubscriberError::AccountNotLoaded(AccountKind::User));
        };

        let positions = poller::<UserPositionsAccount>(&context, user_account.positions, &event_tx);
        if let Err(e) = positions.subscribe(on_update(&event_tx, UserAccountEvent::UserPositionsData)).await {
            warn!("Failed to subscribe to positions {} of user {}: {}", user_account.positions, user_key, e);
            AccountSubscriber::unsubscribe(user.as_ref()).await;
            return Err(e);
        }

        if let Some(loader) = context.bulk_loader() {
            let event_tx = event_tx.clone();
            let callback_id = loader.add_error_callback(Arc::new(move |error: Arc<ChunkLoadError>| {
                let _ = event_tx.send(UserAccountEvent::Error(error));
            }));
            *error_callback_id.lock() = Some(callback_id);
        }

        info!("Subscribed to user {} with positions {}", user_key, user_account.positions);
        *accounts.write() = Some(UserAccounts { user, positions });
        Ok(())
    }

    /// Read both records once. No-op when not subscribed.
    pub async fn fetch(&self) -> Result<(), SubscriberError> {
        if !self.is_subscribed() {
            return Ok(());
        }

        let accounts = self.accounts.read().as_ref().map(|accounts| accounts.all().to_vec()).unwrap_or_default();
        let results = match self.context.bulk_loader() {
            Some(loader) => {
                loader.load().await;
                accounts.iter().map(|account| account.apply_latest()).collect::<Vec<_>>()
            }
            None => join_all(accounts.iter().map(|account| account.fetch())).await,
        };

        let _ = self.event_tx.send(UserAccountEvent::Fetched);
        results.into_iter().find_map(Result::err).map_or(Ok(()), Err)
    }

    pub async fn unsubscribe(&self) {
        if !self.lifecycle.unsubscribe().await {
            return;
        }

        let records = self.accounts.write().take();
        if let (Some(loader), Some(callback_id)) = (self.context.bulk_loader(), self.error_callback_id.lock().take()) {
            loader.remove_error_callback(callback_id);
        }
        if let Some(records) = records {
            join_all(records.all().iter().map(|account| account.unsubscribe())).await;
        }
        debug!("Unsubscribed from user {}", self.user_key);
    }

    fn with_accounts<R>(&self, read: impl FnOnce(&UserAccounts) -> Result<R, SubscriberError>) -> Result<R, SubscriberError> {
        if !self.is_subscribed() {
            return Err(SubscriberError::NotSubscribed);
        }
        match self.accounts.read().as_ref() {
            Some(accounts) => read(accounts),
            None => Err(SubscriberError::NotSubscribed),
        }
    }

    pub fn get_user_account(&self) -> Result<Arc<UserAccount>, SubscriberError> {
        self.with_accounts(|accounts| accounts.user.data().ok_or(SubscriberError::AccountNotLoaded(AccountKind::User)))
    }

    pub fn get_user_positions_account(&self) -> Result<Arc<UserPositionsAccount>, SubscriberError> {
        self.with_accounts(|accounts| accounts.positions.data().ok_or(SubscriberError::AccountNotLoaded(AccountKind::UserPositions)))
    }

    fn managed_account(&self, kind: AccountKind) -> Result<Arc<dyn ManagedAccount>, SubscriberError> {
        self.with_accounts(|accounts| {
            accounts.all().into_iter().find(|account| account.kind() == kind).ok_or(SubscriberError::OptionalNotSubscribed(kind))
        })
    }

    pub fn start_polling(&self, kind: AccountKind) -> Result<(), SubscriberError> {
        let event_tx = self.event_tx.clone();
        let on_fetch: OnFetch = Arc::new(move |kind: AccountKind| {
            let _ = event_tx.send(UserAccountEvent::FetchedAccount(kind));
        });
        self.managed_account(kind)?.start_polling(on_fetch)
    }

    pub fn stop_polling(&self, kind: AccountKind) -> Result<(), SubscriberError> {
        self.managed_account(kind)?.stop_polling()
    }

    pub fn set_polling_rate(&self, kind: AccountKind, polling_rate: Duration) -> Result<(), SubscriberError> {
        self.managed_account(kind)?.set_polling_rate(polling_rate);
        Ok(())
    }
}
