use super::rpc::{Commitment, GET_MULTIPLE_ACCOUNTS_CHUNK_SIZE};
use crate::utils::config_loader::{ConfigSectionLoader, ConfigSectionLoaderSync, LoadConfigError, load_from_file, load_from_file_sync};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum_macros::{Display, EnumString};
use url::Url;

/// How individual accounts receive updates.
#[derive(Copy, Clone, Debug, Default, Display, PartialEq, Eq, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionType {
    /// Server push through `accountSubscribe`.
    #[default]
    Websocket,
    /// Batched reads through a shared [`crate::BulkAccountLoader`].
    Polling,
}

/// Configuration for the account synchronization layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountSyncConfig {
    /// HTTP RPC URL used for batched and single account reads
    pub rpc_http_url: String,
    /// WebSocket RPC URL used for account push subscriptions
    pub rpc_wss_url: String,
    pub commitment: Commitment,
    pub subscription_type: SubscriptionType,
    /// Interval of the shared bulk loader in milliseconds
    pub polling_frequency_ms: u64,
    /// Maximum number of accounts in a single `getMultipleAccounts` call
    pub max_accounts_per_request: usize,
    /// Timeout for HTTP requests in seconds
    pub http_timeout_secs: u64,
    /// WebSocket connection timeout in seconds
    pub ws_connection_timeout_secs: u64,
    /// Maximum number of consecutive reconnection attempts per subscription
    pub max_reconnect_attempts: u32,
    /// Delay between reconnection attempts in seconds
    pub reconnect_delay_secs: u64,
    /// Buffer size of each account push channel
    pub update_channel_capacity: usize,
    /// Buffer size of each orchestrator's event channel
    pub event_channel_capacity: usize,
}

impl Default for AccountSyncConfig {
    fn default() -> Self {
        Self {
            rpc_http_url: "https://api.mainnet-beta.solana.com".to_string(),
            rpc_wss_url: "wss://api.mainnet-beta.solana.com".to_string(),
            commitment: Commitment::Confirmed,
            subscription_type: SubscriptionType::Websocket,
            polling_frequency_ms: 1000,
            max_accounts_per_request: GET_MULTIPLE_ACCOUNTS_CHUNK_SIZE,
            http_timeout_secs: 10,
            ws_connection_timeout_secs: 30,
            max_reconnect_attempts: 5,
            reconnect_delay_secs: 2,
            update_channel_capacity: 100,
            event_channel_capacity: 256,
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> eyre::Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) => value.parse().map(Some).map_err(|e| eyre::eyre!("Invalid {}: {}", name, e)),
        Err(_) => Ok(None),
    }
}

impl AccountSyncConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> eyre::Result<Self> {
        let mut config = Self::default();

        if let Ok(rpc_http_url) = std::env::var("RPC_HTTP_URL") {
            Url::parse(&rpc_http_url).map_err(|e| eyre::eyre!("Invalid RPC_HTTP_URL: {}", e))?;
            config.rpc_http_url = rpc_http_url;
        }

        if let Ok(rpc_wss_url) = std::env::var("RPC_WSS_URL") {
            Url::parse(&rpc_wss_url).map_err(|e| eyre::eyre!("Invalid RPC_WSS_URL: {}", e))?;
            config.rpc_wss_url = rpc_wss_url;
        }

        if let Some(commitment) = parse_env("COMMITMENT")? {
            config.commitment = commitment;
        }
        if let Some(subscription_type) = parse_env("SUBSCRIPTION_TYPE")? {
            config.subscription_type = subscription_type;
        }
        if let Some(polling_frequency_ms) = parse_env("POLLING_FREQUENCY_MS")? {
            config.polling_frequency_ms = polling_frequency_ms;
        }
        if let Some(max_accounts) = parse_env("MAX_ACCOUNTS_PER_REQUEST")? {
            config.max_accounts_per_request = max_accounts;
        }
        if let Some(timeout) = parse_env("HTTP_TIMEOUT_SECS")? {
            config.http_timeout_secs = timeout;
        }
        if let Some(timeout) = parse_env("WS_CONNECTION_TIMEOUT_SECS")? {
            config.ws_connection_timeout_secs = timeout;
        }
        if let Some(attempts) = parse_env("MAX_RECONNECT_ATTEMPTS")? {
            config.max_reconnect_attempts = attempts;
        }
        if let Some(delay) = parse_env("RECONNECT_DELAY_SECS")? {
            config.reconnect_delay_secs = delay;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> eyre::Result<()> {
        if self.polling_frequency_ms == 0 {
            return Err(eyre::eyre!("polling_frequency_ms must be greater than 0"));
        }
        if self.max_accounts_per_request == 0 {
            return Err(eyre::eyre!("max_accounts_per_request must be greater than 0"));
        }
        Ok(())
    }

    pub fn polling_frequency(&self) -> Duration {
        Duration::from_millis(self.polling_frequency_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn ws_connection_timeout(&self) -> Duration {
        Duration::from_secs(self.ws_connection_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

#[derive(Clone, Deserialize, Debug)]
pub struct AccountSyncConfigRoot {
    pub account_sync: AccountSyncConfig,
}

#[async_trait]
impl ConfigSectionLoader for AccountSyncConfig {
    type SectionType = AccountSyncConfig;

    async fn load_section_from_file(file_name: String) -> Result<Self::SectionType, LoadConfigError> {
        let root: AccountSyncConfigRoot = load_from_file(file_name).await?;
        Ok(root.account_sync)
    }
}

impl ConfigSectionLoaderSync for AccountSyncConfig {
    type SectionType = AccountSyncConfig;

    fn load_section_from_file_sync(file_name: String) -> Result<Self::SectionType, LoadConfigError> {
        let root: AccountSyncConfigRoot = load_from_file_sync(file_name)?;
        Ok(root.account_sync)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AccountSyncConfig::default();
        assert_eq!(config.max_accounts_per_request, 99);
        assert_eq!(config.commitment, Commitment::Confirmed);
        assert_eq!(config.subscription_type, SubscriptionType::Websocket);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_durations() {
        let config = AccountSyncConfig::default();
        assert_eq!(config.polling_frequency(), Duration::from_millis(1000));
        assert_eq!(config.http_timeout(), Duration::from_secs(10));
        assert_eq!(config.ws_connection_timeout(), Duration::from_secs(30));
        assert_eq!(config.reconnect_delay(), Duration::from_secs(2));
    }

    #[test]
    fn test_parse_toml_section() {
        let raw = r#"
            [account_sync]
            rpc_http_url = "http://127.0.0.1:8899"
            subscription_type = "polling"
            commitment = "finalized"
            polling_frequency_ms = 400
        "#;
        let root: AccountSyncConfigRoot = toml::from_str(raw).unwrap();
        let config = root.account_sync;

        assert_eq!(config.rpc_http_url, "http://127.0.0.1:8899");
        assert_eq!(config.subscription_type, SubscriptionType::Polling);
        assert_eq!(config.commitment, Commitment::Finalized);
        assert_eq!(config.polling_frequency(), Duration::from_millis(400));
        // untouched fields keep their defaults
        assert_eq!(config.max_accounts_per_request, 99);
    }

    #[test]
    fn test_validate_rejects_zero_chunk() {
        let config = AccountSyncConfig { max_accounts_per_request: 0, ..AccountSyncConfig::default() };
        assert!(config.validate().is_err());
    }
}
