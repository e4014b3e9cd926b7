use anyhow::{Result, anyhow};
use robin_texts::commands::Command;
use robin_texts::config::CommandTriggers;
use robin_texts::connection::{AccountProfile, Holding, MockBroker, PortfolioProfile, Quote};
use robin_texts::mail::MockMailbox;
use robin_texts::message::InboundMessage;
use robin_texts::order_types::{OrderSide, OrderType, PlacedOrder, TimeInForce};
use robin_texts::routes::{RouteOutcome, Router};
use robin_texts::security_types::SecurityType;

#[cfg(test)]
mod router_tests {
    use super::*;

    const PHONE: &str = "5551234567@vtext.com";
    const BOT: &str = "bot@gmail.com";

    fn router(mark_unmatched_read: bool) -> Router {
        let triggers = CommandTriggers {
            mark_unmatched_read,
            ..CommandTriggers::default()
        };
        Router::new(PHONE, BOT, &triggers)
    }

    fn text(id: u32, body: &str) -> InboundMessage {
        InboundMessage::new(id, PHONE, "", body)
    }

    fn broker_with_holdings() -> MockBroker {
        let mut broker = MockBroker::new();
        broker.expect_account_profile().returning(|| {
            Ok(AccountProfile {
                account_url: "https://api.example.com/accounts/1/".into(),
                account_number: "1".into(),
                buying_power: 1_000.0,
            })
        });
        broker
            .expect_portfolio_profile()
            .returning(|| Ok(PortfolioProfile { equity: 3_000.0, previous_close_equity: 2_900.0 }));
        broker.expect_holdings().returning(|| {
            Ok(vec![Holding {
                symbol: "MSFT".into(),
                instrument: SecurityType::Equity,
                price: 200.0,
                quantity: 10.0,
                cost: 150.0,
                pct_change: 1.2,
                multiplier: 1.0,
                description: None,
            }])
        });
        broker
    }

    #[tokio::test]
    async fn test_unauthorized_sender_triggers_nothing() -> Result<()> {
        // Mocks without expectations panic on any call.
        let mut mail = MockMailbox::new();
        let broker = MockBroker::new();

        let msg = InboundMessage::new(9, "stranger@example.com", "", "Cancel all orders\ncurrent holdings");
        let outcome = router(true).route(&msg, &mut mail, &broker).await?;
        assert_eq!(outcome, RouteOutcome::Ignored);
        Ok(())
    }

    #[tokio::test]
    async fn test_holdings_report_marks_read_once_and_mails_bot() -> Result<()> {
        let mut mail = MockMailbox::new();
        mail.expect_mark_read().withf(|id| *id == 4).times(1).returning(|_| Ok(()));
        mail.expect_send_html()
            .withf(|to, subject, _| to == BOT && subject == "[Current]")
            .times(1)
            .returning(|_, _, _| Ok(()));
        let broker = broker_with_holdings();

        let outcome = router(true).route(&text(4, "Current holdings"), &mut mail, &broker).await?;
        assert_eq!(outcome, RouteOutcome::Dispatched(vec![Command::CurrentHoldings]));
        Ok(())
    }

    #[tokio::test]
    async fn test_multiple_triggers_all_fire() -> Result<()> {
        let mut mail = MockMailbox::new();
        mail.expect_mark_read().times(1).returning(|_| Ok(()));
        mail.expect_send_html().times(1).returning(|_, _, _| Ok(()));
        let mut broker = broker_with_holdings();
        broker.expect_cancel_all_orders().times(3).returning(|_| Ok(0));

        let outcome = router(true)
            .route(&text(5, "cancel everything then show current holdings"), &mut mail, &broker)
            .await?;
        assert_eq!(
            outcome,
            RouteOutcome::Dispatched(vec![Command::CurrentHoldings, Command::CancelOrders])
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_equity_limit_order_places_adjusted_gtc_limit() -> Result<()> {
        let mut mail = MockMailbox::new();
        mail.expect_mark_read().times(1).returning(|_| Ok(()));
        let mut broker = MockBroker::new();
        broker.expect_quote().returning(|_| {
            Ok(Quote {
                symbol: "AAPL".into(),
                last_trade_price: 100.0,
                last_extended_hours_trade_price: None,
                previous_close: 98.0,
                updated_at: String::new(),
            })
        });
        broker
            .expect_place_order()
            .withf(|order| {
                order.symbol == "AAPL"
                    && order.side == OrderSide::Buy
                    && order.quantity == 10.0
                    && order.order_type == OrderType::Limit { price: 100.5 }
                    && order.time_in_force == TimeInForce::Gtc
            })
            .times(1)
            .returning(|_| Ok(PlacedOrder { id: "ord-1".into(), state: "queued".into() }));

        let outcome = router(true)
            .route(&text(6, "Limit buy stock\n10 AAPL max 0.5"), &mut mail, &broker)
            .await?;
        assert_eq!(
            outcome,
            RouteOutcome::Dispatched(vec![Command::LimitOrder { instrument: Some(SecurityType::Equity) }])
        );
        Ok(())
    }

    fn broker_expecting_aapl_buy() -> MockBroker {
        let mut broker = MockBroker::new();
        broker.expect_quote().withf(|s| s.eq_ignore_ascii_case("aapl")).returning(|_| {
            Ok(Quote {
                symbol: "AAPL".into(),
                last_trade_price: 100.0,
                last_extended_hours_trade_price: None,
                previous_close: 98.0,
                updated_at: String::new(),
            })
        });
        broker
            .expect_place_order()
            .withf(|order| order.quantity == 10.0 && order.order_type == OrderType::Limit { price: 100.5 })
            .times(1)
            .returning(|_| Ok(PlacedOrder { id: "ord-2".into(), state: "queued".into() }));
        broker
    }

    #[tokio::test]
    async fn test_punctuated_order_text_still_places_order() -> Result<()> {
        let mut mail = MockMailbox::new();
        mail.expect_mark_read().times(1).returning(|_| Ok(()));
        let broker = broker_expecting_aapl_buy();

        let outcome = router(true)
            .route(&text(11, "Limit buy stock.\n10 AAPL, max 0.5."), &mut mail, &broker)
            .await?;
        assert_eq!(
            outcome,
            RouteOutcome::Dispatched(vec![Command::LimitOrder { instrument: Some(SecurityType::Equity) }])
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_order_after_greeting_line_uses_trigger_line() -> Result<()> {
        let mut mail = MockMailbox::new();
        mail.expect_mark_read().times(1).returning(|_| Ok(()));
        let broker = broker_expecting_aapl_buy();

        let outcome = router(true)
            .route(&text(12, "Hey bot\nLIMIT BUY STOCK\n10 AAPL MAX 0.5"), &mut mail, &broker)
            .await?;
        assert_eq!(
            outcome,
            RouteOutcome::Dispatched(vec![Command::LimitOrder { instrument: Some(SecurityType::Equity) }])
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_with_trailing_period_cancels() -> Result<()> {
        let mut mail = MockMailbox::new();
        mail.expect_mark_read().withf(|id| *id == 13).times(1).returning(|_| Ok(()));
        let mut broker = MockBroker::new();
        broker.expect_cancel_all_orders().times(3).returning(|_| Ok(1));

        let outcome = router(true).route(&text(13, "Cancel."), &mut mail, &broker).await?;
        assert_eq!(outcome, RouteOutcome::Dispatched(vec![Command::CancelOrders]));
        Ok(())
    }

    #[tokio::test]
    async fn test_option_order_is_marked_read_without_broker_calls() -> Result<()> {
        let mut mail = MockMailbox::new();
        mail.expect_mark_read().times(1).returning(|_| Ok(()));
        let broker = MockBroker::new();

        let outcome = router(true)
            .route(&text(7, "LIMIT BUY OPTIONS\n1 SPY MAX 1"), &mut mail, &broker)
            .await?;
        assert_eq!(
            outcome,
            RouteOutcome::Dispatched(vec![Command::LimitOrder { instrument: Some(SecurityType::Option) }])
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_unmatched_message_policy() -> Result<()> {
        let mut mail = MockMailbox::new();
        mail.expect_mark_read().withf(|id| *id == 8).times(1).returning(|_| Ok(()));
        let broker = MockBroker::new();
        let outcome = router(true).route(&text(8, "good morning"), &mut mail, &broker).await?;
        assert_eq!(outcome, RouteOutcome::Unmatched);

        let mut mail = MockMailbox::new();
        mail.expect_mark_read().never();
        let outcome = router(false).route(&text(8, "good morning"), &mut mail, &broker).await?;
        assert_eq!(outcome, RouteOutcome::Unmatched);
        Ok(())
    }

    #[tokio::test]
    async fn test_failing_handler_still_leaves_message_read() {
        let mut mail = MockMailbox::new();
        mail.expect_mark_read().times(1).returning(|_| Ok(()));
        let mut broker = MockBroker::new();
        broker.expect_quote().returning(|_| Err(anyhow!("quote service down")));
        broker.expect_place_order().never();

        let result = router(true)
            .route(&text(10, "LIMIT SELL E\n1 F MIN 2"), &mut mail, &broker)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_batch_skips_foreign_senders() -> Result<()> {
        let mut mail = MockMailbox::new();
        mail.expect_mark_read().withf(|id| *id == 2).times(1).returning(|_| Ok(()));
        let broker = MockBroker::new();

        let messages = vec![
            InboundMessage::new(1, "newsletter@example.com", "Weekly", "open orders"),
            text(2, "open orders"),
        ];
        let dispatched = router(true).process_unread(&messages, &mut mail, &broker).await?;
        assert_eq!(dispatched, 1);
        Ok(())
    }
}
