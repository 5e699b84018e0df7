use super::context::AccountContext;
use super::error::SubscriberError;
use super::lifecycle::SubscriptionLifecycle;
use super::poller::{AccountPoller, ManagedAccount, OnFetch};
use super::subscriber::{AccountSubscriber, OnAccountUpdate, broadcast_error, broadcast_update};
use crate::coder::ProgramAccount;
use crate::data_sync::{CallbackId, ChunkLoadError};
use crate::types::{
    AccountKind, CurveHistoryAccount, DepositHistoryAccount, FundingPaymentHistoryAccount, FundingRateHistoryAccount, LiquidationHistoryAccount,
    MarketsAccount, Pubkey, StateAccount, TradeHistoryAccount,
};
use futures::future::{BoxFuture, join_all};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use strum_macros::{Display, EnumIter, EnumString};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Protocol records a caller may add to the required state and markets.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, Hash, EnumString, EnumIter, Serialize, Deserialize)]
#[strum(serialize_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum OptionalClearingHouseAccount {
    TradeHistory,
    DepositHistory,
    FundingPaymentHistory,
    FundingRateHistory,
    CurveHistory,
    LiquidationHistory,
}

impl OptionalClearingHouseAccount {
    pub fn kind(&self) -> AccountKind {
        match self {
            OptionalClearingHouseAccount::TradeHistory => AccountKind::TradeHistory,
            OptionalClearingHouseAccount::DepositHistory => AccountKind::DepositHistory,
            OptionalClearingHouseAccount::FundingPaymentHistory => AccountKind::FundingPaymentHistory,
            OptionalClearingHouseAccount::FundingRateHistory => AccountKind::FundingRateHistory,
            OptionalClearingHouseAccount::CurveHistory => AccountKind::CurveHistory,
            OptionalClearingHouseAccount::LiquidationHistory => AccountKind::LiquidationHistory,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ClearingHouseAccountEvent {
    StateAccountUpdate(Arc<StateAccount>),
    MarketsAccountUpdate(Arc<MarketsAccount>),
    TradeHistoryAccountUpdate(Arc<TradeHistoryAccount>),
    DepositHistoryAccountUpdate(Arc<DepositHistoryAccount>),
    FundingPaymentHistoryAccountUpdate(Arc<FundingPaymentHistoryAccount>),
    FundingRateHistoryAccountUpdate(Arc<FundingRateHistoryAccount>),
    CurveHistoryAccountUpdate(Arc<CurveHistoryAccount>),
    LiquidationHistoryAccountUpdate(Arc<LiquidationHistoryAccount>),
    /// Sent after every record specific update
    Update,
    /// Sent once per completed `fetch`
    Fetched,
    /// A per-record timer completed a fetch
    FetchedAccount(AccountKind),
    /// A chunk of the shared loader failed
    Error(Arc<ChunkLoadError>),
    /// A record stopped receiving updates, e.g. its push channel closed
    SubscriptionError(SubscriberError),
}

type Poller<T> = Arc<AccountPoller<T>>;

struct ClearingHouseAccounts {
    state: Poller<StateAccount>,
    markets: Poller<MarketsAccount>,
    trade_history: Option<Poller<TradeHistoryAccount>>,
    deposit_history: Option<Poller<DepositHistoryAccount>>,
    funding_payment_history: Option<Poller<FundingPaymentHistoryAccount>>,
    funding_rate_history: Option<Poller<FundingRateHistoryAccount>>,
    curve_history: Option<Poller<CurveHistoryAccount>>,
    liquidation_history: Option<Poller<LiquidationHistoryAccount>>,
}

fn managed<T: ProgramAccount>(poller: &Poller<T>) -> Arc<dyn ManagedAccount> {
    poller.clone()
}

impl ClearingHouseAccounts {
    /// Every subscribed record, required ones first.
    fn all(&self) -> Vec<Arc<dyn ManagedAccount>> {
        let mut accounts = vec![managed(&self.state), managed(&self.markets)];
        accounts.extend(self.trade_history.as_ref().map(managed));
        accounts.extend(self.deposit_history.as_ref().map(managed));
        accounts.extend(self.funding_payment_history.as_ref().map(managed));
        accounts.extend(self.funding_rate_history.as_ref().map(managed));
        accounts.extend(self.curve_history.as_ref().map(managed));
        accounts.extend(self.liquidation_history.as_ref().map(managed));
        accounts
    }

    fn get(&self, kind: AccountKind) -> Option<Arc<dyn ManagedAccount>> {
        self.all().into_iter().find(|account| account.kind() == kind)
    }
}

async fn unsubscribe_all(accounts: Vec<Arc<dyn ManagedAccount>>) {
    join_all(accounts.iter().map(|account| account.unsubscribe())).await;
}

fn poller<T: ProgramAccount>(context: &AccountContext, key: Pubkey, event_tx: &broadcast::Sender<ClearingHouseAccountEvent>) -> Poller<T> {
    let poller = context.account_poller::<T>(key);
    poller.set_error_callback(broadcast_error(event_tx, ClearingHouseAccountEvent::SubscriptionError));
    Arc::new(poller)
}

fn on_update<T: ProgramAccount>(
    event_tx: &broadcast::Sender<ClearingHouseAccountEvent>,
    event: fn(Arc<T>) -> ClearingHouseAccountEvent,
) -> OnAccountUpdate<T> {
    broadcast_update(event_tx, event, ClearingHouseAccountEvent::Update)
}

/// Keeps the protocol-global records in sync: the state account, the markets
/// account it points to, and any of the history accounts chosen at subscribe.
pub struct ClearingHouseAccountSubscriber {
    context: AccountContext,
    state_key: Pubkey,
    lifecycle: Arc<SubscriptionLifecycle>,
    accounts: Arc<RwLock<Option<ClearingHouseAccounts>>>,
    event_tx: broadcast::Sender<ClearingHouseAccountEvent>,
    error_callback_id: Arc<Mutex<Option<CallbackId>>>,
}

impl ClearingHouseAccountSubscriber {
    pub fn new(context: AccountContext, state_key: Pubkey) -> Self {
        let (event_tx, _) = broadcast::channel(context.event_channel_capacity.max(1));
        Self {
            context,
            state_key,
            lifecycle: SubscriptionLifecycle::new(),
            accounts: Arc::new(RwLock::new(None)),
            event_tx,
            error_callback_id: Arc::new(Mutex::new(None)),
        }
    }

    pub fn state_key(&self) -> Pubkey {
        self.state_key
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClearingHouseAccountEvent> {
        self.event_tx.subscribe()
    }

    pub fn is_subscribed(&self) -> bool {
        self.lifecycle.is_subscribed()
    }

    /// Subscribe to the required records plus `optional`. Concurrent calls
    /// share one run; once subscribed this returns immediately.
    pub async fn subscribe(&self, optional: &[OptionalClearingHouseAccount]) -> Result<bool, SubscriberError> {
        let context = self.context.clone();
        let state_key = self.state_key;
        let optional: HashSet<OptionalClearingHouseAccount> = optional.iter().copied().collect();
        let accounts = self.accounts.clone();
        let event_tx = self.event_tx.clone();
        let error_callback_id = self.error_callback_id.clone();

        self.lifecycle
            .subscribe(move || Self::subscribe_accounts(context, state_key, optional, accounts, event_tx, error_callback_id))
            .await
    }

    async fn subscribe_accounts(
        context: AccountContext,
        state_key: Pubkey,
        optional: HashSet<OptionalClearingHouseAccount>,
        accounts: Arc<RwLock<Option<ClearingHouseAccounts>>>,
        event_tx: broadcast::Sender<ClearingHouseAccountEvent>,
        error_callback_id: Arc<Mutex<Option<CallbackId>>>,
    ) -> Result<(), SubscriberError> {
        info!("Subscribing to clearing house accounts, state {} with {} optional", state_key, optional.len());

        // the state account holds every other address
        let state = poller::<StateAccount>(&context, state_key, &event_tx);
        state.subscribe(on_update(&event_tx, ClearingHouseAccountEvent::StateAccountUpdate)).await?;
        let Some(state_account) = state.data() else {
            AccountSubscriber::unsubscribe(state.as_ref()).await;
            return Err(SubscriberError::AccountNotLoaded(AccountKind::State));
        };

        let wanted = |account: OptionalClearingHouseAccount, key: Pubkey| optional.contains(&account).then_some(key);
        let records = ClearingHouseAccounts {
            state,
            markets: poller(&context, state_account.markets, &event_tx),
            trade_history: wanted(OptionalClearingHouseAccount::TradeHistory, state_account.trade_history)
                .map(|key| poller(&context, key, &event_tx)),
            deposit_history: wanted(OptionalClearingHouseAccount::DepositHistory, state_account.deposit_history)
                .map(|key| poller(&context, key, &event_tx)),
            funding_payment_history: wanted(OptionalClearingHouseAccount::FundingPaymentHistory, state_account.funding_payment_history)
                .map(|key| poller(&context, key, &event_tx)),
            funding_rate_history: wanted(OptionalClearingHouseAccount::FundingRateHistory, state_account.funding_rate_history)
                .map(|key| poller(&context, key, &event_tx)),
            curve_history: wanted(OptionalClearingHouseAccount::CurveHistory, state_account.curve_history)
                .map(|key| poller(&context, key, &event_tx)),
            liquidation_history: wanted(OptionalClearingHouseAccount::LiquidationHistory, state_account.liquidation_history)
                .map(|key| poller(&context, key, &event_tx)),
        };

        let mut subscriptions: Vec<BoxFuture<'_, Result<(), SubscriberError>>> =
            vec![records.markets.subscribe(on_update(&event_tx, ClearingHouseAccountEvent::MarketsAccountUpdate))];
        if let Some(poller) = &records.trade_history {
            subscriptions.push(poller.subscribe(on_update(&event_tx, ClearingHouseAccountEvent::TradeHistoryAccountUpdate)));
        }
        if let Some(poller) = &records.deposit_history {
            subscriptions.push(poller.subscribe(on_update(&event_tx, ClearingHouseAccountEvent::DepositHistoryAccountUpdate)));
        }
        if let Some(poller) = &records.funding_payment_history {
            subscriptions.push(poller.subscribe(on_update(&event_tx, ClearingHouseAccountEvent::FundingPaymentHistoryAccountUpdate)));
        }
        if let Some(poller) = &records.funding_rate_history {
            subscriptions.push(poller.subscribe(on_update(&event_tx, ClearingHouseAccountEvent::FundingRateHistoryAccountUpdate)));
        }
        if let Some(poller) = &records.curve_history {
            subscriptions.push(poller.subscribe(on_update(&event_tx, ClearingHouseAccountEvent::CurveHistoryAccountUpdate)));
        }
        if let Some(poller) = &records.liquidation_history {
            subscriptions.push(poller.subscribe(on_update(&event_tx, ClearingHouseAccountEvent::LiquidationHistoryAccountUpdate)));
        }

        let results = join_all(subscriptions).await;
        if let Some(e) = results.into_iter().find_map(Result::err) {
            warn!("Clearing house subscribe failed, releasing accounts: {}", e);
            unsubscribe_all(records.all()).await;
            return Err(e);
        }

        if let Some(loader) = context.bulk_loader() {
            let event_tx = event_tx.clone();
            let callback_id = loader.add_error_callback(Arc::new(move |error: Arc<ChunkLoadError>| {
                let _ = event_tx.send(ClearingHouseAccountEvent::Error(error));
            }));
            *error_callback_id.lock() = Some(callback_id);
        }

        info!("Subscribed to {} clearing house accounts", records.all().len());
        *accounts.write() = Some(records);
        Ok(())
    }

    /// Read every subscribed record once. In polling mode this is a single
    /// pass of the shared loader. Every record is attempted and the first
    /// failure is returned. No-op when not subscribed.
    pub async fn fetch(&self) -> Result<(), SubscriberError> {
        if !self.is_subscribed() {
            return Ok(());
        }

        let accounts = self.accounts.read().as_ref().map(ClearingHouseAccounts::all).unwrap_or_default();
        let results = match self.context.bulk_loader() {
            Some(loader) => {
                loader.load().await;
                // decode failures during the pass only reach the loader callbacks
                accounts.iter().map(|account| account.apply_latest()).collect::<Vec<_>>()
            }
            None => join_all(accounts.iter().map(|account| account.fetch())).await,
        };

        let _ = self.event_tx.send(ClearingHouseAccountEvent::Fetched);
        results.into_iter().find_map(Result::err).map_or(Ok(()), Err)
    }

    /// Release every record. Safe to call repeatedly; waits for a subscribe
    /// in flight first.
    pub async fn unsubscribe(&self) {
        if !self.lifecycle.unsubscribe().await {
            return;
        }

        let records = self.accounts.write().take();
        if let (Some(loader), Some(callback_id)) = (self.context.bulk_loader(), self.error_callback_id.lock().take()) {
            loader.remove_error_callback(callback_id);
        }
        if let Some(records) = records {
            unsubscribe_all(records.all()).await;
        }
        debug!("Unsubscribed from clearing house accounts");
    }

    fn with_accounts<R>(&self, read: impl FnOnce(&ClearingHouseAccounts) -> Result<R, SubscriberError>) -> Result<R, SubscriberError> {
        if !self.is_subscribed() {
            return Err(SubscriberError::NotSubscribed);
        }
        match self.accounts.read().as_ref() {
            Some(accounts) => read(accounts),
            None => Err(SubscriberError::NotSubscribed),
        }
    }

    fn loaded<T: ProgramAccount>(poller: &AccountPoller<T>) -> Result<Arc<T>, SubscriberError> {
        poller.data().ok_or(SubscriberError::AccountNotLoaded(T::KIND))
    }

    fn optional<T: ProgramAccount>(poller: Option<&Poller<T>>) -> Result<Arc<T>, SubscriberError> {
        match poller {
            Some(poller) => Self::loaded(poller),
            None => Err(SubscriberError::OptionalNotSubscribed(T::KIND)),
        }
    }

    pub fn get_state_account(&self) -> Result<Arc<StateAccount>, SubscriberError> {
        self.with_accounts(|accounts| Self::loaded(&accounts.state))
    }

    pub fn get_markets_account(&self) -> Result<Arc<MarketsAccount>, SubscriberError> {
        self.with_accounts(|accounts| Self::loaded(&accounts.markets))
    }

    pub fn get_trade_history_account(&self) -> Result<Arc<TradeHistoryAccount>, SubscriberError> {
        self.with_accounts(|accounts| Self::optional(accounts.trade_history.as_ref()))
    }

    pub fn get_deposit_history_account(&self) -> Result<Arc<DepositHistoryAccount>, SubscriberError> {
        self.with_accounts(|accounts| Self::optional(accounts.deposit_history.as_ref()))
    }

    pub fn get_funding_payment_history_account(&self) -> Result<Arc<FundingPaymentHistoryAccount>, SubscriberError> {
        self.with_accounts(|accounts| Self::optional(accounts.funding_payment_history.as_ref()))
    }

    pub fn get_funding_rate_history_account(&self) -> Result<Arc<FundingRateHistoryAccount>, SubscriberError> {
        self.with_accounts(|accounts| Self::optional(accounts.funding_rate_history.as_ref()))
    }

    pub fn get_curve_history_account(&self) -> Result<Arc<CurveHistoryAccount>, SubscriberError> {
        self.with_accounts(|accounts| Self::optional(accounts.curve_history.as_ref()))
    }

    pub fn get_liquidation_history_account(&self) -> Result<Arc<LiquidationHistoryAccount>, SubscriberError> {
        self.with_accounts(|accounts| Self::optional(accounts.liquidation_history.as_ref()))
    }

    /// Readers for the optional records requested at subscribe time. Records
    /// that were not requested have no handle.
    pub fn optional_accounts(&self) -> Result<OptionalAccountHandles, SubscriberError> {
        self.with_accounts(|accounts| {
            Ok(OptionalAccountHandles {
                trade_history: accounts.trade_history.as_ref().map(|poller| self.handle(poller)),
                deposit_history: accounts.deposit_history.as_ref().map(|poller| self.handle(poller)),
                funding_payment_history: accounts.funding_payment_history.as_ref().map(|poller| self.handle(poller)),
                funding_rate_history: accounts.funding_rate_history.as_ref().map(|poller| self.handle(poller)),
                curve_history: accounts.curve_history.as_ref().map(|poller| self.handle(poller)),
                liquidation_history: accounts.liquidation_history.as_ref().map(|poller| self.handle(poller)),
            })
        })
    }

    fn handle<T: ProgramAccount>(&self, poller: &Poller<T>) -> AccountHandle<T> {
        AccountHandle { poller: poller.clone(), lifecycle: self.lifecycle.clone() }
    }

    fn managed_account(&self, kind: AccountKind) -> Result<Arc<dyn ManagedAccount>, SubscriberError> {
        self.with_accounts(|accounts| accounts.get(kind).ok_or(SubscriberError::OptionalNotSubscribed(kind)))
    }

    /// Start the per-record timer of `kind`, reported as `FetchedAccount`.
    pub fn start_polling(&self, kind: AccountKind) -> Result<(), SubscriberError> {
        let event_tx = self.event_tx.clone();
        let on_fetch: OnFetch = Arc::new(move |kind: AccountKind| {
            let _ = event_tx.send(ClearingHouseAccountEvent::FetchedAccount(kind));
        });
        self.managed_account(kind)?.start_polling(on_fetch)
    }

    pub fn stop_polling(&self, kind: AccountKind) -> Result<(), SubscriberError> {
        self.managed_account(kind)?.stop_polling()
    }

    /// Applies from the next `start_polling` of `kind`.
    pub fn set_polling_rate(&self, kind: AccountKind, polling_rate: Duration) -> Result<(), SubscriberError> {
        self.managed_account(kind)?.set_polling_rate(polling_rate);
        Ok(())
    }
}

/// Reader for one record of a subscribed orchestrator.
pub struct AccountHandle<T: ProgramAccount> {
    poller: Poller<T>,
    lifecycle: Arc<SubscriptionLifecycle>,
}

impl<T: ProgramAccount> Clone for AccountHandle<T> {
    fn clone(&self) -> Self {
        Self { poller: self.poller.clone(), lifecycle: self.lifecycle.clone() }
    }
}

impl<T: ProgramAccount> AccountHandle<T> {
    pub fn key(&self) -> Pubkey {
        AccountSubscriber::key(self.poller.as_ref())
    }

    /// Fails once the orchestrator that issued the handle unsubscribes.
    pub fn get(&self) -> Result<Arc<T>, SubscriberError> {
        if !self.lifecycle.is_subscribed() {
            return Err(SubscriberError::NotSubscribed);
        }
        self.poller.data().ok_or(SubscriberError::AccountNotLoaded(T::KIND))
    }
}

#[derive(Clone, Default)]
pub struct OptionalAccountHandles {
    pub trade_history: Option<AccountHandle<TradeHistoryAccount>>,
    pub deposit_history: Option<AccountHandle<DepositHistoryAccount>>,
    pub funding_payment_history: Option<AccountHandle<FundingPaymentHistoryAccount>>,
    pub funding_rate_history: Option<AccountHandle<FundingRateHistoryAccount>>,
    pub curve_history: Option<AccountHandle<CurveHistoryAccount>>,
    pub liquidation_history: Option<AccountHandle<LiquidationHistoryAccount>>,
}
