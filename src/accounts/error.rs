use crate::coder::DecodeError;
use crate::data_sync::{LoaderError, PubsubError, RpcError};
use crate::types::{AccountKind, Pubkey};
use std::sync::Arc;
use thiserror::Error;

/// Errors of account subscribers and orchestrators.
///
/// Transport and decode failures are shared behind `Arc` so one failed
/// subscribe can be handed to every caller waiting on it.
#[derive(Debug, Clone, Error)]
pub enum SubscriberError {
    #[error("You must call `subscribe` before using this function")]
    NotSubscribed,
    #[error("You must subscribe to the optional {0} account before using it")]
    OptionalNotSubscribed(AccountKind),
    #[error("{0} account has not been loaded yet")]
    AccountNotLoaded(AccountKind),
    #[error("{kind} account {key} does not exist")]
    AccountNotFound { kind: AccountKind, key: Pubkey },
    #[error("already polling {0} account")]
    AlreadyPolling(AccountKind),
    #[error("not polling {0} account")]
    NotPolling(AccountKind),
    #[error(transparent)]
    Rpc(Arc<RpcError>),
    #[error(transparent)]
    Pubsub(Arc<PubsubError>),
    #[error(transparent)]
    Decode(Arc<DecodeError>),
    #[error(transparent)]
    Loader(Arc<LoaderError>),
    #[error("push channel for {kind} account {key} closed")]
    ChannelClosed { kind: AccountKind, key: Pubkey },
    #[error("subscribe task did not complete: {0}")]
    Interrupted(String),
}

impl From<RpcError> for SubscriberError {
    fn from(error: RpcError) -> Self {
        SubscriberError::Rpc(Arc::new(error))
    }
}

impl From<PubsubError> for SubscriberError {
    fn from(error: PubsubError) -> Self {
        SubscriberError::Pubsub(Arc::new(error))
    }
}

impl From<DecodeError> for SubscriberError {
    fn from(error: DecodeError) -> Self {
        SubscriberError::Decode(Arc::new(error))
    }
}

impl From<LoaderError> for SubscriberError {
    fn from(error: LoaderError) -> Self {
        SubscriberError::Loader(Arc::new(error))
    }
}

impl SubscriberError {
    /// Caller contract violations, as opposed to transient remote failures.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            SubscriberError::NotSubscribed
                | SubscriberError::OptionalNotSubscribed(_)
                | SubscriberError::AlreadyPolling(_)
                | SubscriberError::NotPolling(_)
        )
    }
}
