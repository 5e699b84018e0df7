use super::rpc::{BufferAndSlot, Commitment, UiAccount, WithContext};
use crate::types::Pubkey;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

#[derive(Debug, Error)]
pub enum PubsubError {
    #[error("invalid websocket url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("websocket connection timeout")]
    ConnectTimeout,
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("subscription rejected: {0}")]
    Rejected(String),
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),
    #[error("websocket closed during subscription")]
    Closed,
    #[error("malformed notification: {0}")]
    Json(#[from] serde_json::Error),
}

/// Live push subscription to one account.
///
/// Dropping the handle or calling [`AccountSubscription::unsubscribe`] closes it.
pub struct AccountSubscription {
    pub updates: mpsc::Receiver<BufferAndSlot>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl AccountSubscription {
    pub fn new(updates: mpsc::Receiver<BufferAndSlot>, shutdown_tx: mpsc::Sender<()>) -> Self {
        Self { updates, shutdown_tx: Some(shutdown_tx) }
    }

    pub fn unsubscribe(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.try_send(());
        }
        self.updates.close();
    }
}

impl Drop for AccountSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Server-push notification channel for account changes.
#[async_trait]
pub trait AccountPubsub: Send + Sync {
    async fn account_subscribe(&self, key: Pubkey, commitment: Commitment) -> Result<AccountSubscription, PubsubError>;
}

#[derive(Deserialize)]
struct AccountNotification {
    params: NotificationParams,
}

#[derive(Deserialize)]
struct NotificationParams {
    result: WithContext<Option<UiAccount>>,
}

/// Consecutive connection failures a subscription tolerates. A connection
/// that got its `accountSubscribe` confirmed starts the count over.
#[derive(Debug)]
struct ReconnectBudget {
    max_attempts: u32,
    failures: u32,
}

impl ReconnectBudget {
    fn new(max_attempts: u32) -> Self {
        Self { max_attempts, failures: 0 }
    }

    /// Record a failed connection. Returns false once the budget is spent.
    fn record_failure(&mut self, established: bool) -> bool {
        if established {
            self.failures = 0;
        }
        self.failures += 1;
        self.failures < self.max_attempts
    }

    fn failures(&self) -> u32 {
        self.failures
    }
}

/// [`AccountPubsub`] over the node's JSON-RPC websocket (`accountSubscribe`).
///
/// Every subscription gets its own connection task, reconnecting with a fixed
/// delay until `max_reconnect_attempts` consecutive failures.
#[derive(Debug, Clone)]
pub struct WebSocketAccountPubsub {
    rpc_url: String,
    connection_timeout: Duration,
    max_reconnect_attempts: u32,
    reconnect_delay: Duration,
    channel_buffer_size: usize,
}

impl WebSocketAccountPubsub {
    pub fn new(
        rpc_url: String,
        connection_timeout: Duration,
        max_reconnect_attempts: u32,
        reconnect_delay: Duration,
        channel_buffer_size: usize,
    ) -> Self {
        Self { rpc_url, connection_timeout, max_reconnect_attempts, reconnect_delay, channel_buffer_size: channel_buffer_size.max(1) }
    }

    /// Connect to WebSocket and forward notifications until shutdown or disconnect.
    /// Sets `established` once the node confirms the subscription.
    async fn connect_and_subscribe(
        rpc_url: &str,
        key: Pubkey,
        commitment: Commitment,
        connection_timeout: Duration,
        update_tx: &mpsc::Sender<BufferAndSlot>,
        shutdown_rx: &mut mpsc::Receiver<()>,
        established: &mut bool,
    ) -> Result<(), PubsubError> {
        let url = Url::parse(rpc_url)?;
        debug!("Connecting to WebSocket: {} for account {}", url, key);

        let (ws_stream, _) = timeout(connection_timeout, connect_async(url.as_str())).await.map_err(|_| PubsubError::ConnectTimeout)??;

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let subscribe_request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "accountSubscribe",
            "params": [key.to_base58(), { "commitment": commitment, "encoding": "base64" }]
        });
        ws_sender.send(Message::Text(subscribe_request.to_string().into())).await?;

        let subscription_id = match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                let response: Value = serde_json::from_str(text.as_str())?;
                if let Some(result) = response.get("result") {
                    result.as_u64().ok_or_else(|| PubsubError::UnexpectedMessage(format!("invalid subscription id {result}")))?
                } else if let Some(error) = response.get("error") {
                    return Err(PubsubError::Rejected(error.to_string()));
                } else {
                    return Err(PubsubError::UnexpectedMessage(text.as_str().to_string()));
                }
            }
            Some(Ok(msg)) => return Err(PubsubError::UnexpectedMessage(format!("{msg:?}"))),
            Some(Err(e)) => return Err(e.into()),
            None => return Err(PubsubError::Closed),
        };

        info!("Subscribed to account {} with id {}", key, subscription_id);
        *established = true;

        loop {
            tokio::select! {
                ws_msg = ws_receiver.next() => {
                    match ws_msg {
                        Some(Ok(Message::Text(text))) => {
                            match Self::handle_message(text.as_str()) {
                                Ok(Some(update)) => {
                                    if update_tx.send(update).await.is_err() {
                                        debug!("Update receiver for {} dropped", key);
                                        break;
                                    }
                                }
                                Ok(None) => {}
                                Err(e) => warn!("Failed to handle notification for {}: {}", key, e),
                            }
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!("WebSocket closed by server");
                            return Err(PubsubError::Closed);
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(PubsubError::Closed),
                    }
                }

                _ = shutdown_rx.recv() => {
                    let unsubscribe_request = serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": 2,
                        "method": "accountUnsubscribe",
                        "params": [subscription_id]
                    });
                    let _ = ws_sender.send(Message::Text(unsubscribe_request.to_string().into())).await;
                    let _ = ws_sender.close().await;
                    break;
                }
            }
        }

        Ok(())
    }

    /// Returns `Ok(None)` for messages that are not account notifications.
    fn handle_message(text: &str) -> Result<Option<BufferAndSlot>, PubsubError> {
        let message: Value = serde_json::from_str(text)?;
        if message.get("method").and_then(Value::as_str) != Some("accountNotification") {
            return Ok(None);
        }

        let notification: AccountNotification = serde_json::from_value(message)?;
        let result = notification.params.result;
        let buffer = result.value.as_ref().map(UiAccount::decode_data).transpose().map_err(|e| PubsubError::UnexpectedMessage(e.to_string()))?;

        Ok(Some(BufferAndSlot { slot: result.context.slot, buffer }))
    }
}

#[async_trait]
impl AccountPubsub for WebSocketAccountPubsub {
    async fn account_subscribe(&self, key: Pubkey, commitment: Commitment) -> Result<AccountSubscription, PubsubError> {
        Url::parse(&self.rpc_url)?;

        let (update_tx, update_rx) = mpsc::channel(self.channel_buffer_size);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

        let rpc_url = self.rpc_url.clone();
        let connection_timeout = self.connection_timeout;
        let max_reconnect_attempts = self.max_reconnect_attempts;
        let reconnect_delay = self.reconnect_delay;

        tokio::spawn(async move {
            let mut budget = ReconnectBudget::new(max_reconnect_attempts);

            loop {
                let mut established = false;
                match Self::connect_and_subscribe(&rpc_url, key, commitment, connection_timeout, &update_tx, &mut shutdown_rx, &mut established).await {
                    Ok(()) => {
                        debug!("Account subscription for {} ended", key);
                        break;
                    }
                    Err(e) => {
                        error!("Account subscription for {} failed: {}", key, e);
                        if !budget.record_failure(established) {
                            error!("Max reconnection attempts reached for {}, giving up", key);
                            break;
                        }

                        warn!("Attempting reconnection #{} for {} in {:?}", budget.failures(), key, reconnect_delay);
                        tokio::select! {
                            _ = sleep(reconnect_delay) => {}
                            _ = shutdown_rx.recv() => break,
                        }
                    }
                }
            }
        });

        Ok(AccountSubscription::new(update_rx, shutdown_tx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::Bytes;

    #[test]
    fn test_handle_account_notification() {
        let text = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "accountNotification",
            "params": {
                "result": {
                    "context": { "slot": 5199307 },
                    "value": { "data": ["AAEC", "base64"], "executable": false, "lamports": 33594, "owner": "11111111111111111111111111111111", "rentEpoch": 635 }
                },
                "subscription": 23784
            }
        })
        .to_string();

        let update = WebSocketAccountPubsub::handle_message(&text).unwrap().unwrap();
        assert_eq!(update.slot, 5199307);
        assert_eq!(update.buffer, Some(Bytes::from(vec![0u8, 1, 2])));
    }

    #[test]
    fn test_ignores_other_messages() {
        let text = r#"{"jsonrpc":"2.0","result":true,"id":2}"#;
        assert!(WebSocketAccountPubsub::handle_message(text).unwrap().is_none());
    }

    #[test]
    fn test_pubsub_creation() {
        let pubsub = WebSocketAccountPubsub::new("ws://127.0.0.1:8900".to_string(), Duration::from_secs(30), 5, Duration::from_secs(2), 0);

        assert_eq!(pubsub.rpc_url, "ws://127.0.0.1:8900");
        assert_eq!(pubsub.max_reconnect_attempts, 5);
        assert_eq!(pubsub.channel_buffer_size, 1);
    }

    #[test]
    fn test_reconnect_budget_resets_after_established_subscription() {
        let mut budget = ReconnectBudget::new(3);
        assert!(budget.record_failure(false));
        assert!(budget.record_failure(false));
        // the third failed connect in a row gives up
        assert!(!budget.record_failure(false));

        let mut budget = ReconnectBudget::new(3);
        for _ in 0..10 {
            // every attempt got subscribed before dropping
            assert!(budget.record_failure(true));
            assert_eq!(budget.failures(), 1);
        }
        assert!(budget.record_failure(false));
        assert!(!budget.record_failure(false));
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        let pubsub = WebSocketAccountPubsub::new("not a url".to_string(), Duration::from_secs(1), 1, Duration::from_secs(1), 8);
        let result = pubsub.account_subscribe(Pubkey::new_unique(), Commitment::Confirmed).await;
        assert!(matches!(result, Err(PubsubError::InvalidUrl(_))));
    }
}
