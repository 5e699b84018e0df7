use super::poller::AccountPoller;
use super::polling_subscriber::PollingAccountSubscriber;
use super::subscriber::AccountSubscriber;
use super::websocket_subscriber::WebSocketAccountSubscriber;
use crate::coder::{AccountCoder, AnchorAccountCoder, ProgramAccount};
use crate::data_sync::{
    AccountPubsub, AccountReader, AccountSyncConfig, BulkAccountLoader, Commitment, RpcAccountReader, SubscriptionType, WebSocketAccountPubsub,
};
use crate::types::Pubkey;
use eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Default capacity of an orchestrator's event channel.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Where single-account updates come from.
#[derive(Clone)]
pub enum SubscriptionMode {
    WebSocket(Arc<dyn AccountPubsub>),
    Polling(BulkAccountLoader),
}

/// Collaborators handed to every orchestrator at construction.
#[derive(Clone)]
pub struct AccountContext {
    pub reader: Arc<dyn AccountReader>,
    pub coder: Arc<dyn AccountCoder>,
    pub commitment: Commitment,
    pub mode: SubscriptionMode,
    /// Interval of the per-account timers started through `start_polling`
    pub polling_rate: Duration,
    pub event_channel_capacity: usize,
}

impl std::fmt::Debug for AccountContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match &self.mode {
            SubscriptionMode::WebSocket(_) => "websocket",
            SubscriptionMode::Polling(_) => "polling",
        };
        f.debug_struct("AccountContext")
            .field("commitment", &self.commitment)
            .field("mode", &mode)
            .field("polling_rate", &self.polling_rate)
            .field("event_channel_capacity", &self.event_channel_capacity)
            .finish()
    }
}

impl AccountContext {
    pub fn websocket(reader: Arc<dyn AccountReader>, pubsub: Arc<dyn AccountPubsub>, commitment: Commitment) -> Self {
        Self {
            reader,
            coder: Arc::new(AnchorAccountCoder),
            commitment,
            mode: SubscriptionMode::WebSocket(pubsub),
            polling_rate: Duration::from_secs(1),
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }

    /// Accounts are kept fresh by `loader`; its commitment and frequency apply.
    pub fn polling(reader: Arc<dyn AccountReader>, loader: BulkAccountLoader) -> Self {
        Self {
            reader,
            coder: Arc::new(AnchorAccountCoder),
            commitment: loader.commitment(),
            polling_rate: loader.polling_frequency(),
            mode: SubscriptionMode::Polling(loader),
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }

    pub fn with_coder(mut self, coder: Arc<dyn AccountCoder>) -> Self {
        self.coder = coder;
        self
    }

    pub fn with_polling_rate(mut self, polling_rate: Duration) -> Self {
        self.polling_rate = polling_rate;
        self
    }

    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    /// Build the HTTP reader and either the push channel or a shared loader.
    /// The loader is returned stopped; call `start_polling` on it.
    pub fn from_config(config: &AccountSyncConfig) -> Result<Self> {
        config.validate()?;
        let reader = RpcAccountReader::new(config.rpc_http_url.clone(), config.http_timeout())
            .map_err(|e| eyre::eyre!("Failed to create RPC reader: {}", e))?
            .with_max_accounts_per_request(config.max_accounts_per_request);
        let reader: Arc<dyn AccountReader> = Arc::new(reader);

        let context = match config.subscription_type {
            SubscriptionType::Websocket => {
                let pubsub = WebSocketAccountPubsub::new(
                    config.rpc_wss_url.clone(),
                    config.ws_connection_timeout(),
                    config.max_reconnect_attempts,
                    config.reconnect_delay(),
                    config.update_channel_capacity,
                );
                Self::websocket(reader, Arc::new(pubsub), config.commitment).with_polling_rate(config.polling_frequency())
            }
            SubscriptionType::Polling => {
                let loader = BulkAccountLoader::from_config(reader.clone(), config);
                Self::polling(reader, loader)
            }
        };

        info!("Account context: {} subscriptions at {} commitment via {}", config.subscription_type, config.commitment, config.rpc_http_url);
        Ok(context.with_event_channel_capacity(config.event_channel_capacity))
    }

    pub fn bulk_loader(&self) -> Option<&BulkAccountLoader> {
        match &self.mode {
            SubscriptionMode::Polling(loader) => Some(loader),
            SubscriptionMode::WebSocket(_) => None,
        }
    }

    /// A subscriber for `key` matching the subscription mode.
    pub fn account_subscriber<T: ProgramAccount>(&self, key: Pubkey) -> Arc<dyn AccountSubscriber<T>> {
        match &self.mode {
            SubscriptionMode::WebSocket(pubsub) => {
                Arc::new(WebSocketAccountSubscriber::new(key, self.reader.clone(), pubsub.clone(), self.coder.clone(), self.commitment))
            }
            SubscriptionMode::Polling(loader) => Arc::new(PollingAccountSubscriber::new(key, loader.clone(), self.coder.clone())),
        }
    }

    pub fn account_poller<T: ProgramAccount>(&self, key: Pubkey) -> AccountPoller<T> {
        AccountPoller::new(self.account_subscriber(key), self.polling_rate)
    }
}
