#[cfg(test)]
mod integration_tests {
    use crate::accounts::{
        AccountContext, ClearingHouseAccountEvent, ClearingHouseAccountSubscriber, OptionalClearingHouseAccount, SubscriberError, UserAccountEvent,
        UserAccountSubscriber, bulk_polling_user_subscribe,
    };
    use crate::data_sync::{BulkAccountLoader, Commitment, MockAccountPubsub, MockAccountReader};
    use crate::types::{
        AccountKind, MarketsAccount, Pubkey, StateAccount, TradeHistoryAccount, TradeRecord, UserAccount, UserPositionsAccount,
    };
    use alloy_primitives::Bytes;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast;

    struct Protocol {
        state: Pubkey,
        markets: Pubkey,
        trade_history: Pubkey,
    }

    fn markets(open_interest: u128) -> MarketsAccount {
        let mut account = MarketsAccount::default();
        account.markets[0].initialized = true;
        account.markets[0].open_interest = open_interest;
        account
    }

    fn setup_protocol(reader: &MockAccountReader) -> Protocol {
        let protocol = Protocol { state: Pubkey::new_unique(), markets: Pubkey::new_unique(), trade_history: Pubkey::new_unique() };
        let state = StateAccount {
            markets: protocol.markets,
            trade_history: protocol.trade_history,
            deposit_history: Pubkey::new_unique(),
            funding_payment_history: Pubkey::new_unique(),
            funding_rate_history: Pubkey::new_unique(),
            liquidation_history: Pubkey::new_unique(),
            curve_history: Pubkey::new_unique(),
            ..Default::default()
        };
        reader.set_account(protocol.state, &state);
        reader.set_account(protocol.markets, &markets(100));
        reader.set_account(protocol.trade_history, &TradeHistoryAccount { head: 1, trade_records: vec![TradeRecord::default()] });
        protocol
    }

    fn websocket_context(reader: &Arc<MockAccountReader>, pubsub: &Arc<MockAccountPubsub>) -> AccountContext {
        AccountContext::websocket(reader.clone(), pubsub.clone(), Commitment::Confirmed)
    }

    fn polling_context(reader: &Arc<MockAccountReader>) -> (AccountContext, BulkAccountLoader) {
        let loader = BulkAccountLoader::new(reader.clone(), Commitment::Confirmed, Duration::from_secs(60));
        (AccountContext::polling(reader.clone(), loader.clone()), loader)
    }

    fn drain<E: Clone>(events: &mut broadcast::Receiver<E>) -> Vec<E> {
        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }
        received
    }

    async fn next_event<E: Clone>(events: &mut broadcast::Receiver<E>) -> E {
        tokio::time::timeout(Duration::from_secs(1), events.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_subscribe_resolves_once() {
        let reader = Arc::new(MockAccountReader::new());
        let pubsub = Arc::new(MockAccountPubsub::new());
        let protocol = setup_protocol(&reader);
        let clearing_house = ClearingHouseAccountSubscriber::new(websocket_context(&reader, &pubsub), protocol.state);

        let (first, second) = tokio::join!(clearing_house.subscribe(&[]), clearing_house.subscribe(&[]));
        assert!(first.unwrap());
        assert!(second.unwrap());

        // state and markets, each read once and subscribed once
        assert_eq!(pubsub.subscribe_calls(), 2);
        assert_eq!(reader.single_read_count(), 2);
        assert!(clearing_house.subscribe(&[]).await.unwrap());
        assert_eq!(pubsub.subscribe_calls(), 2);

        assert_eq!(clearing_house.get_markets_account().unwrap().markets[0].open_interest, 100);
    }

    #[tokio::test]
    async fn test_getters_require_subscription() {
        let reader = Arc::new(MockAccountReader::new());
        let pubsub = Arc::new(MockAccountPubsub::new());
        let protocol = setup_protocol(&reader);
        let clearing_house = ClearingHouseAccountSubscriber::new(websocket_context(&reader, &pubsub), protocol.state);

        assert!(matches!(clearing_house.get_state_account(), Err(SubscriberError::NotSubscribed)));
        assert!(matches!(clearing_house.start_polling(AccountKind::State), Err(SubscriberError::NotSubscribed)));
        // fetch before subscribe does nothing
        clearing_house.fetch().await.unwrap();
        assert_eq!(reader.total_reads(), 0);
    }

    #[tokio::test]
    async fn test_unrequested_optional_record_is_rejected() {
        let reader = Arc::new(MockAccountReader::new());
        let pubsub = Arc::new(MockAccountPubsub::new());
        let protocol = setup_protocol(&reader);
        let clearing_house = ClearingHouseAccountSubscriber::new(websocket_context(&reader, &pubsub), protocol.state);
        clearing_house.subscribe(&[]).await.unwrap();

        assert_eq!(clearing_house.get_state_account().unwrap().markets, protocol.markets);
        assert!(matches!(
            clearing_house.get_trade_history_account(),
            Err(SubscriberError::OptionalNotSubscribed(AccountKind::TradeHistory))
        ));
        assert!(matches!(
            clearing_house.start_polling(AccountKind::TradeHistory),
            Err(SubscriberError::OptionalNotSubscribed(AccountKind::TradeHistory))
        ));
        assert!(clearing_house.optional_accounts().unwrap().trade_history.is_none());
    }

    #[tokio::test]
    async fn test_optional_record_updates_are_published() {
        let reader = Arc::new(MockAccountReader::new());
        let pubsub = Arc::new(MockAccountPubsub::new());
        let protocol = setup_protocol(&reader);
        let clearing_house = ClearingHouseAccountSubscriber::new(websocket_context(&reader, &pubsub), protocol.state);
        clearing_house.subscribe(&[OptionalClearingHouseAccount::TradeHistory]).await.unwrap();

        let handles = clearing_house.optional_accounts().unwrap();
        let trade_history = handles.trade_history.unwrap();
        assert_eq!(trade_history.key(), protocol.trade_history);
        assert_eq!(trade_history.get().unwrap().head, 1);
        assert!(handles.deposit_history.is_none());

        let mut events = clearing_house.subscribe_events();
        let updated = TradeHistoryAccount { head: 2, trade_records: vec![TradeRecord::default(); 2] };
        assert_eq!(pubsub.push_account(&protocol.trade_history, 5, &updated).await, 1);

        match next_event(&mut events).await {
            ClearingHouseAccountEvent::TradeHistoryAccountUpdate(account) => assert_eq!(account.head, 2),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(next_event(&mut events).await, ClearingHouseAccountEvent::Update));
        assert_eq!(clearing_house.get_trade_history_account().unwrap().head, 2);

        clearing_house.unsubscribe().await;
        assert_eq!(pubsub.total_open_subscriptions(), 0);
        assert!(matches!(trade_history.get(), Err(SubscriberError::NotSubscribed)));
    }

    #[tokio::test]
    async fn test_double_unsubscribe_and_resubscribe() {
        let reader = Arc::new(MockAccountReader::new());
        let protocol = setup_protocol(&reader);
        let (context, loader) = polling_context(&reader);
        let clearing_house = ClearingHouseAccountSubscriber::new(context, protocol.state);

        clearing_house.subscribe(&[OptionalClearingHouseAccount::TradeHistory]).await.unwrap();
        assert_eq!(loader.len(), 3);

        clearing_house.unsubscribe().await;
        clearing_house.unsubscribe().await;
        assert!(loader.is_empty());
        assert!(!clearing_house.is_subscribed());
        assert!(matches!(clearing_house.get_state_account(), Err(SubscriberError::NotSubscribed)));

        // addresses are resolved again
        let moved = Pubkey::new_unique();
        reader.set_slot(2);
        reader.set_account(moved, &markets(7));
        reader.set_account(protocol.state, &StateAccount { markets: moved, ..Default::default() });
        clearing_house.subscribe(&[]).await.unwrap();
        assert_eq!(clearing_house.get_markets_account().unwrap().markets[0].open_interest, 7);
        assert!(loader.contains(&moved));
        assert!(!loader.contains(&protocol.markets));
    }

    #[tokio::test]
    async fn test_failed_subscribe_releases_accounts() {
        let reader = Arc::new(MockAccountReader::new());
        let protocol = setup_protocol(&reader);
        reader.remove_account(&protocol.markets);
        let (context, loader) = polling_context(&reader);
        let clearing_house = ClearingHouseAccountSubscriber::new(context, protocol.state);

        let (first, second) = tokio::join!(clearing_house.subscribe(&[]), clearing_house.subscribe(&[]));
        assert!(matches!(first, Err(SubscriberError::AccountNotFound { kind: AccountKind::Markets, .. })));
        assert!(matches!(second, Err(SubscriberError::AccountNotFound { kind: AccountKind::Markets, .. })));
        assert!(!clearing_house.is_subscribed());
        assert!(loader.is_empty());

        reader.set_account(protocol.markets, &markets(1));
        assert!(clearing_house.subscribe(&[]).await.unwrap());
    }

    #[tokio::test]
    async fn test_fetch_publishes_changes_then_fetched() {
        let reader = Arc::new(MockAccountReader::new());
        let protocol = setup_protocol(&reader);
        let (context, _loader) = polling_context(&reader);
        let clearing_house = ClearingHouseAccountSubscriber::new(context, protocol.state);
        clearing_house.subscribe(&[]).await.unwrap();
        let mut events = clearing_house.subscribe_events();

        // nothing changed
        clearing_house.fetch().await.unwrap();
        assert!(matches!(drain(&mut events).as_slice(), [ClearingHouseAccountEvent::Fetched]));

        reader.set_slot(3);
        reader.set_account(protocol.markets, &markets(250));
        clearing_house.fetch().await.unwrap();
        let received = drain(&mut events);
        assert_eq!(received.len(), 3);
        assert!(matches!(&received[0], ClearingHouseAccountEvent::MarketsAccountUpdate(account) if account.markets[0].open_interest == 250));
        assert!(matches!(received[1], ClearingHouseAccountEvent::Update));
        assert!(matches!(received[2], ClearingHouseAccountEvent::Fetched));
    }

    #[tokio::test]
    async fn test_chunk_failure_becomes_error_event() {
        let reader = Arc::new(MockAccountReader::new());
        let protocol = setup_protocol(&reader);
        let (context, loader) = polling_context(&reader);
        let clearing_house = ClearingHouseAccountSubscriber::new(context, protocol.state);
        clearing_house.subscribe(&[]).await.unwrap();
        let mut events = clearing_house.subscribe_events();

        reader.set_failing(true);
        clearing_house.fetch().await.unwrap();
        let received = drain(&mut events);
        assert!(matches!(&received[0], ClearingHouseAccountEvent::Error(error) if error.keys.len() == 2));
        assert!(matches!(received[1], ClearingHouseAccountEvent::Fetched));
        // last known value is still served
        assert_eq!(clearing_house.get_markets_account().unwrap().markets[0].open_interest, 100);

        clearing_house.unsubscribe().await;
        reader.set_failing(false);
        let stats = loader.load().await;
        assert_eq!(stats.accounts, 0);
    }

    #[tokio::test]
    async fn test_decode_error_keeps_last_known_good() {
        let reader = Arc::new(MockAccountReader::new());
        let protocol = setup_protocol(&reader);
        let (context, _loader) = polling_context(&reader);
        let clearing_house = ClearingHouseAccountSubscriber::new(context, protocol.state);
        clearing_house.subscribe(&[]).await.unwrap();
        let mut events = clearing_house.subscribe_events();

        reader.set_slot(2);
        reader.set_account_data(protocol.markets, Bytes::from(vec![3u8; 12]));
        assert!(matches!(clearing_house.fetch().await, Err(SubscriberError::Decode(_))));
        assert_eq!(clearing_house.get_markets_account().unwrap().markets[0].open_interest, 100);
        assert!(matches!(drain(&mut events).as_slice(), [ClearingHouseAccountEvent::Fetched]));

        reader.set_slot(3);
        reader.set_account(protocol.markets, &markets(300));
        clearing_house.fetch().await.unwrap();
        assert_eq!(clearing_house.get_markets_account().unwrap().markets[0].open_interest, 300);
    }

    #[tokio::test]
    async fn test_decode_error_fails_fetch_in_both_modes() {
        let reader = Arc::new(MockAccountReader::new());
        let pubsub = Arc::new(MockAccountPubsub::new());
        let protocol = setup_protocol(&reader);
        let pushed = ClearingHouseAccountSubscriber::new(websocket_context(&reader, &pubsub), protocol.state);
        let (context, _loader) = polling_context(&reader);
        let polled = ClearingHouseAccountSubscriber::new(context, protocol.state);
        pushed.subscribe(&[]).await.unwrap();
        polled.subscribe(&[]).await.unwrap();

        reader.set_slot(2);
        reader.set_account_data(protocol.markets, Bytes::from(vec![3u8; 12]));
        assert!(matches!(pushed.fetch().await, Err(SubscriberError::Decode(_))));
        assert!(matches!(polled.fetch().await, Err(SubscriberError::Decode(_))));
        assert_eq!(pushed.get_markets_account().unwrap().markets[0].open_interest, 100);
        assert_eq!(polled.get_markets_account().unwrap().markets[0].open_interest, 100);
    }

    #[tokio::test]
    async fn test_closed_push_channel_becomes_subscription_error() {
        let reader = Arc::new(MockAccountReader::new());
        let pubsub = Arc::new(MockAccountPubsub::new());
        let protocol = setup_protocol(&reader);
        let clearing_house = ClearingHouseAccountSubscriber::new(websocket_context(&reader, &pubsub), protocol.state);
        clearing_house.subscribe(&[]).await.unwrap();
        let mut events = clearing_house.subscribe_events();

        assert_eq!(pubsub.close_subscriptions(&protocol.markets), 1);
        match next_event(&mut events).await {
            ClearingHouseAccountEvent::SubscriptionError(SubscriberError::ChannelClosed { kind, key }) => {
                assert_eq!(kind, AccountKind::Markets);
                assert_eq!(key, protocol.markets);
            }
            other => panic!("unexpected event {other:?}"),
        }
        // the last value is still served
        assert_eq!(clearing_house.get_markets_account().unwrap().markets[0].open_interest, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_record_polling_controls() {
        let reader = Arc::new(MockAccountReader::new());
        let protocol = setup_protocol(&reader);
        let (context, _loader) = polling_context(&reader);
        let clearing_house = ClearingHouseAccountSubscriber::new(context, protocol.state);
        clearing_house.subscribe(&[]).await.unwrap();
        let mut events = clearing_house.subscribe_events();

        clearing_house.set_polling_rate(AccountKind::State, Duration::from_millis(100)).unwrap();
        clearing_house.start_polling(AccountKind::State).unwrap();
        assert!(matches!(clearing_house.start_polling(AccountKind::State), Err(SubscriberError::AlreadyPolling(AccountKind::State))));

        assert!(matches!(next_event(&mut events).await, ClearingHouseAccountEvent::FetchedAccount(AccountKind::State)));

        clearing_house.stop_polling(AccountKind::State).unwrap();
        assert!(matches!(clearing_house.stop_polling(AccountKind::State), Err(SubscriberError::NotPolling(AccountKind::State))));
        assert!(matches!(clearing_house.stop_polling(AccountKind::Markets), Err(SubscriberError::NotPolling(AccountKind::Markets))));

        clearing_house.start_polling(AccountKind::Markets).unwrap();
        clearing_house.unsubscribe().await;
        let reads = reader.total_reads();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(reader.total_reads(), reads);
    }

    fn setup_user(reader: &MockAccountReader, collateral: u128) -> (Pubkey, Pubkey) {
        let (user_key, positions_key) = (Pubkey::new_unique(), Pubkey::new_unique());
        reader.set_account(user_key, &UserAccount { collateral, positions: positions_key, ..Default::default() });
        reader.set_account(positions_key, &UserPositionsAccount { user: user_key, ..Default::default() });
        (user_key, positions_key)
    }

    #[tokio::test]
    async fn test_user_subscriber_follows_positions() {
        let reader = Arc::new(MockAccountReader::new());
        let pubsub = Arc::new(MockAccountPubsub::new());
        let (user_key, positions_key) = setup_user(&reader, 1_000);
        let user = UserAccountSubscriber::new(websocket_context(&reader, &pubsub), user_key);

        assert!(matches!(user.get_user_account(), Err(SubscriberError::NotSubscribed)));
        assert!(user.subscribe().await.unwrap());
        assert_eq!(user.get_user_account().unwrap().collateral, 1_000);
        assert_eq!(user.get_user_positions_account().unwrap().user, user_key);
        assert_eq!(pubsub.open_subscriptions(&positions_key), 1);

        let mut events = user.subscribe_events();
        let mut positions = UserPositionsAccount { user: user_key, ..Default::default() };
        positions.positions[0].base_asset_amount = 10;
        pubsub.push_account(&positions_key, 9, &positions).await;

        match next_event(&mut events).await {
            UserAccountEvent::UserPositionsData(account) => assert_eq!(account.open_positions().count(), 1),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(next_event(&mut events).await, UserAccountEvent::Update));

        user.unsubscribe().await;
        user.unsubscribe().await;
        assert_eq!(pubsub.total_open_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_user_fetch_reports_decode_error_when_polling() {
        let reader = Arc::new(MockAccountReader::new());
        let (context, _loader) = polling_context(&reader);
        let (user_key, positions_key) = setup_user(&reader, 50);
        let user = UserAccountSubscriber::new(context, user_key);
        user.subscribe().await.unwrap();
        let mut events = user.subscribe_events();

        user.fetch().await.unwrap();
        assert!(matches!(drain(&mut events).as_slice(), [UserAccountEvent::Fetched]));

        reader.set_slot(2);
        reader.set_account_data(positions_key, Bytes::from(vec![1u8; 8]));
        assert!(matches!(user.fetch().await, Err(SubscriberError::Decode(_))));
        assert!(matches!(drain(&mut events).as_slice(), [UserAccountEvent::Fetched]));
        assert_eq!(user.get_user_account().unwrap().collateral, 50);
        assert_eq!(user.get_user_positions_account().unwrap().user, user_key);
    }

    #[tokio::test]
    async fn test_closed_user_channel_becomes_subscription_error() {
        let reader = Arc::new(MockAccountReader::new());
        let pubsub = Arc::new(MockAccountPubsub::new());
        let (user_key, _) = setup_user(&reader, 1);
        let user = UserAccountSubscriber::new(websocket_context(&reader, &pubsub), user_key);
        user.subscribe().await.unwrap();
        let mut events = user.subscribe_events();

        pubsub.close_subscriptions(&user_key);
        assert!(matches!(
            next_event(&mut events).await,
            UserAccountEvent::SubscriptionError(SubscriberError::ChannelClosed { kind: AccountKind::User, .. })
        ));
    }

    #[tokio::test]
    async fn test_bulk_user_subscribe_uses_constant_reads() {
        let reader = Arc::new(MockAccountReader::new().with_max_accounts_per_request(10));
        let (context, loader) = polling_context(&reader);
        let users: Vec<UserAccountSubscriber> = (0..30u128)
            .map(|collateral| {
                let (user_key, _) = setup_user(&reader, collateral);
                UserAccountSubscriber::new(context.clone(), user_key)
            })
            .collect();

        bulk_polling_user_subscribe(&users, &loader).await.unwrap();

        // 30 user records in 3 chunks, then 60 records in 6 chunks
        assert_eq!(reader.request_count(), 9);
        assert_eq!(reader.single_read_count(), 0);
        assert_eq!(loader.len(), 60);
        for (collateral, user) in users.iter().enumerate() {
            assert!(user.is_subscribed());
            assert_eq!(user.get_user_account().unwrap().collateral, collateral as u128);
            assert!(user.get_user_positions_account().is_ok());
        }

        for user in &users {
            user.unsubscribe().await;
        }
        assert!(loader.is_empty());
    }

    #[tokio::test]
    async fn test_bulk_user_subscribe_reports_missing_user() {
        let reader = Arc::new(MockAccountReader::new());
        let (context, loader) = polling_context(&reader);
        let (user_key, _) = setup_user(&reader, 5);
        let users = vec![UserAccountSubscriber::new(context.clone(), user_key), UserAccountSubscriber::new(context, Pubkey::new_unique())];

        let result = bulk_polling_user_subscribe(&users, &loader).await;
        assert!(matches!(result, Err(SubscriberError::AccountNotFound { kind: AccountKind::User, .. })));
        assert!(users[0].is_subscribed());
        assert!(!users[1].is_subscribed());
        assert_eq!(loader.len(), 2);
    }

    #[tokio::test]
    async fn test_bulk_user_subscribe_without_users() {
        let reader = Arc::new(MockAccountReader::new());
        let (_context, loader) = polling_context(&reader);
        bulk_polling_user_subscribe(&[], &loader).await.unwrap();
        assert_eq!(reader.total_reads(), 0);
    }
}
