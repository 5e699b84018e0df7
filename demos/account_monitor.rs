use account_sync::accounts::{
    AccountContext, ClearingHouseAccountEvent, ClearingHouseAccountSubscriber, OptionalClearingHouseAccount, UserAccountSubscriber,
    bulk_polling_user_subscribe,
};
use account_sync::data_sync::AccountSyncConfig;
use account_sync::types::Pubkey;
use eyre::{Result, WrapErr};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

/// Follows the protocol-global accounts, plus any users listed in
/// `USER_ACCOUNTS`, and prints every event for `RUN_SECS` seconds.
///
/// Required: `STATE_ACCOUNT` (base58). Connection settings come from the
/// usual `RPC_HTTP_URL` / `RPC_WSS_URL` / `SUBSCRIPTION_TYPE` variables.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    dotenvy::dotenv().ok();

    let config = AccountSyncConfig::from_env()?;
    let state_key = Pubkey::from_str(&std::env::var("STATE_ACCOUNT").wrap_err("STATE_ACCOUNT is not set")?)?;
    let run_for = Duration::from_secs(std::env::var("RUN_SECS").ok().and_then(|secs| secs.parse().ok()).unwrap_or(60));

    println!("Account monitor");
    println!("  rpc:          {}", config.rpc_http_url);
    println!("  subscription: {}", config.subscription_type);
    println!("  state:        {}", state_key);

    let context = AccountContext::from_config(&config)?;
    let clearing_house = ClearingHouseAccountSubscriber::new(context.clone(), state_key);
    let mut events = clearing_house.subscribe_events();
    clearing_house.subscribe(&[OptionalClearingHouseAccount::TradeHistory, OptionalClearingHouseAccount::FundingRateHistory]).await?;

    let state = clearing_house.get_state_account()?;
    let markets = clearing_house.get_markets_account()?;
    println!("Subscribed: exchange paused {}, {} initialized markets", state.exchange_paused, markets.initialized_markets().count());

    let users: Vec<UserAccountSubscriber> = match std::env::var("USER_ACCOUNTS") {
        Ok(keys) => keys
            .split(',')
            .filter(|key| !key.trim().is_empty())
            .map(|key| Pubkey::from_str(key.trim()).map(|key| UserAccountSubscriber::new(context.clone(), key)))
            .collect::<Result<_, _>>()?,
        Err(_) => Vec::new(),
    };
    match context.bulk_loader() {
        Some(loader) => {
            bulk_polling_user_subscribe(&users, loader).await?;
            loader.start_polling();
        }
        None => {
            for user in &users {
                user.subscribe().await?;
            }
        }
    }
    for user in &users {
        let account = user.get_user_account()?;
        let positions = user.get_user_positions_account()?;
        println!("User {}: collateral {}, {} open positions", user.user_key(), account.collateral, positions.open_positions().count());
    }

    let deadline = tokio::time::sleep(run_for);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ClearingHouseAccountEvent::Update) => {}
                Ok(ClearingHouseAccountEvent::StateAccountUpdate(state)) => {
                    println!("state: paused {} deposits {}", state.exchange_paused, state.collateral_deposits);
                }
                Ok(ClearingHouseAccountEvent::MarketsAccountUpdate(markets)) => {
                    let open_interest: u128 = markets.initialized_markets().map(|(_, market)| market.open_interest).sum();
                    println!("markets: total open interest {}", open_interest);
                }
                Ok(ClearingHouseAccountEvent::TradeHistoryAccountUpdate(history)) => println!("trades: head {}", history.head),
                Ok(ClearingHouseAccountEvent::Error(error)) => println!("load error: {}", error),
                Ok(ClearingHouseAccountEvent::SubscriptionError(error)) => println!("subscription lost: {}", error),
                Ok(event) => println!("{:?}", event),
                Err(RecvError::Lagged(skipped)) => println!("skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            },
            _ = &mut deadline => break,
        }
    }

    if let Some(loader) = context.bulk_loader() {
        loader.stop_polling();
    }
    for user in &users {
        user.unsubscribe().await;
    }
    clearing_house.unsubscribe().await;
    println!("Done");
    Ok(())
}
