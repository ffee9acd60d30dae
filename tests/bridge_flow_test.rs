use file_bridge_rs::agent::Agent;
use file_bridge_rs::config::Settings;
use file_bridge_rs::context::{BridgeContext, SimulatedTimeProvider};
use file_bridge_rs::controller::{BridgeClient, OrderParams};
use file_bridge_rs::model::{PendingOrderRecord, ResultQualifier, Side, TradeAction, TradeCommand, TradeOutcome};
use file_bridge_rs::venue::PaperVenue;
use file_bridge_rs::venue::adapter::retcode;
use rust_decimal_macros::dec;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const START_MS: i64 = 1_723_200_000_000;

struct Harness {
    dir: PathBuf,
    clock: Arc<SimulatedTimeProvider>,
    paper: Arc<PaperVenue>,
    agent: Agent,
    client: BridgeClient,
}

impl Harness {
    fn new() -> Self {
        let dir = std::env::temp_dir().join(format!("bridge_flow_{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();

        let (ctx, clock) = BridgeContext::new_simulated(START_MS);
        let mut settings = Settings::default();
        settings.bridge.files_dir = Some(dir.clone());
        settings.agent.protection.enabled = false;

        let paper = Arc::new(PaperVenue::new(ctx.clone(), &settings.paper));
        let agent = Agent::new(ctx.clone(), paper.clone(), &dir, &settings);
        let client = BridgeClient::new(ctx, settings.bridge.clone()).unwrap();

        Self {
            dir,
            clock,
            paper,
            agent,
            client,
        }
    }

    /// Advances past the command interval and runs one agent tick.
    async fn tick(&mut self) -> usize {
        self.clock.advance(500);
        self.agent.on_timer().await
    }

    fn command_slot(&self) -> String {
        fs::read_to_string(self.dir.join("commands.json")).unwrap()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

#[tokio::test]
async fn test_buy_then_close_round_trip() {
    let mut h = Harness::new();
    assert!(h.agent.on_timer().await > 0);

    h.client.connect().unwrap();
    assert!(h.client.is_connected());
    assert_eq!(h.client.resolved_symbol(), "XAUUSD");
    let price = h.client.market_data().unwrap();
    assert_eq!(price.bid, dec!(2310.12));
    assert_eq!(h.client.positions(), Some(vec![]));

    let trade_id = h
        .client
        .place_buy(
            dec!(0.10),
            OrderParams {
                trade_id: Some("T-1".to_string()),
                ..OrderParams::default()
            },
        )
        .unwrap();
    assert_eq!(trade_id, "T-1");

    h.tick().await;
    assert_eq!(h.command_slot(), "{}");

    let row = h
        .client
        .wait_for_result("T-1", Duration::from_millis(10))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.outcome, TradeOutcome::Success);
    assert_eq!(row.action, "buy");
    assert_eq!(row.symbol, "XAUUSD");
    assert_eq!(row.qualifier, ResultQualifier::Volume(dec!(0.10)));

    // The trade forces a positions refresh on the following tick.
    h.tick().await;
    let positions = h.client.positions().unwrap();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].side, Side::Buy);
    assert_eq!(positions[0].volume, dec!(0.10));
    assert_eq!(positions[0].price_open, dec!(2310.42));
    let ticket = positions[0].ticket;

    let close_id = h.client.close_position(ticket, None, "done").unwrap();
    h.tick().await;
    h.tick().await;

    let row = h
        .client
        .wait_for_result(&close_id, Duration::from_millis(10))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.outcome, TradeOutcome::Success);
    assert_eq!(row.qualifier, ResultQualifier::Ticket(ticket));
    assert_eq!(h.client.positions(), Some(vec![]));

    let closed = h.client.closed_trades(10).unwrap();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].side, Side::Buy);
    assert_eq!(closed[0].volume, dec!(0.10));
    assert_eq!(closed[0].entry_price, dec!(2310.42));
    assert_eq!(closed[0].exit_price, dec!(2310.12));

    let history = h.client.trade_history(10).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].action, "close");
}

#[tokio::test]
async fn test_duplicate_trade_id_is_not_resubmitted() {
    let mut h = Harness::new();
    h.agent.on_timer().await;

    let mut cmd = TradeCommand::new(TradeAction::Sell, "XAUUSD", dec!(0.05));
    cmd.trade_id = Some("dup-7".to_string());

    let first = h.agent.process_command(&cmd).await;
    h.clock.advance(60_000);
    let second = h.agent.process_command(&cmd).await;

    assert_eq!(first, second);
    assert_eq!(h.paper.requests().len(), 1);

    let log = fs::read_to_string(h.dir.join("trade_results.txt")).unwrap();
    let lines: Vec<&str> = log.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], lines[1]);
}

#[tokio::test]
async fn test_rejected_command_leaves_log_untouched() {
    let mut h = Harness::new();
    h.agent.on_timer().await;

    fs::write(h.dir.join("commands.json"), r#"{"action":"buy","symbol":"XAUUSD","#).unwrap();
    h.tick().await;
    h.tick().await;

    assert!(!h.dir.join("trade_results.txt").exists());
    assert!(h.paper.requests().is_empty());
}

#[tokio::test]
async fn test_unknown_position_fails_without_submission() {
    let mut h = Harness::new();
    h.agent.on_timer().await;
    h.client.connect().unwrap();

    let id = h.client.modify_position(424242, Some(dec!(2300)), None).unwrap();
    h.tick().await;

    let rows = h.client.trade_results().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].trade_id, id);
    assert_eq!(rows[0].outcome, TradeOutcome::Fail);
    assert_eq!(rows[0].qualifier, ResultQualifier::Ticket(424242));
    assert!(h.paper.requests().is_empty());
    assert_eq!(h.command_slot(), "{}");
}

#[tokio::test]
async fn test_failed_venue_code_writes_fail_and_clears_slot() {
    let mut h = Harness::new();
    h.agent.on_timer().await;
    h.client.connect().unwrap();
    h.paper.force_retcode(retcode::DONE_PARTIAL);

    let id = h.client.place_buy(dec!(0.10), OrderParams::default()).unwrap();
    h.tick().await;

    assert_eq!(h.command_slot(), "{}");
    let rows = h.client.trade_results().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].trade_id, id);
    assert_eq!(rows[0].outcome, TradeOutcome::Fail);
    assert_eq!(rows[0].qualifier, ResultQualifier::Volume(dec!(0.10)));
    assert_eq!(h.paper.requests().len(), 1);
}

#[tokio::test]
async fn test_forged_trade_id_cannot_inject_result_rows() {
    let mut h = Harness::new();
    h.agent.on_timer().await;
    h.client.connect().unwrap();

    let raw = r#"{"action":"close","ticket":999,"trade_id":"x\n2024.08.09 10:40 | buy | SUCCESS | 5.00 | XAUUSD | forged"}"#;
    fs::write(h.dir.join("commands.json"), raw).unwrap();
    h.tick().await;
    h.tick().await;

    assert!(!h.dir.join("trade_results.txt").exists());
    assert!(h.client.trade_results().unwrap().is_empty());
    assert!(h.client.wait_for_result("forged", Duration::from_millis(1)).await.unwrap().is_none());
    assert_eq!(h.command_slot(), raw);
    assert!(h.paper.requests().is_empty());
}

#[tokio::test]
async fn test_idle_quote_keeps_heartbeat_fresh() {
    let mut h = Harness::new();
    h.agent.on_timer().await;
    h.client.connect().unwrap();

    // 45 seconds of ticks with the quote never moving.
    for _ in 0..90 {
        h.tick().await;
    }
    assert!(h.client.heartbeat_age().unwrap() <= 1);
    assert!(h.client.is_connected());
    assert!(h.client.test_connection().ok);
    assert_eq!(h.client.market_data().unwrap().bid, dec!(2310.12));
}

#[tokio::test]
async fn test_heartbeat_goes_stale_without_agent_ticks() {
    let mut h = Harness::new();
    h.agent.on_timer().await;
    h.client.connect().unwrap();
    assert_eq!(h.client.heartbeat_age(), Some(0));

    h.clock.advance(45_000);
    assert_eq!(h.client.heartbeat_age(), Some(45));
    assert!(!h.client.is_connected());
    assert!(!h.client.check_heartbeat());

    // A fresh quote rewritten by the agent revives the connection.
    h.paper.set_quote("XAUUSD", dec!(2311.00), dec!(2311.30));
    h.tick().await;
    assert!(h.client.is_connected());
    assert_eq!(h.client.market_data().unwrap().bid, dec!(2311.00));
}

#[tokio::test]
async fn test_connect_skips_results_from_earlier_sessions() {
    let mut h = Harness::new();
    h.agent.on_timer().await;

    let mut cmd = TradeCommand::new(TradeAction::Buy, "XAUUSD", dec!(0.01));
    cmd.trade_id = Some("old".to_string());
    h.agent.process_command(&cmd).await;

    h.client.connect().unwrap();
    assert!(h.client.trade_results().unwrap().is_empty());
    assert_eq!(h.client.trade_history(10).unwrap().len(), 1);
}

#[tokio::test]
async fn test_poll_reads_every_entity() {
    let mut h = Harness::new();
    h.paper.insert_pending_order(PendingOrderRecord {
        ticket: 777,
        symbol: "XAUUSD".to_string(),
        order_type: 2,
        price_open: dec!(2290.00),
        sl: dec!(2280.00),
        tp: dec!(2320.00),
        volume_current: dec!(0.02),
        time_setup: 1_723_199_000,
        time_expiration: 0,
        magic: 12345,
        comment: "limit".to_string(),
    });
    h.agent.on_timer().await;
    h.client.connect().unwrap();

    let state = h.client.poll();
    assert_eq!(state.price.map(|p| p.ask), Some(dec!(2310.42)));
    assert!(state.tick.is_some());
    assert!(state.order_book.map(|b| !b.levels.is_empty()).unwrap_or(false));
    assert_eq!(state.account.map(|a| a.balance), Some(dec!(10000)));
    assert_eq!(state.positions, Some(vec![]));
    assert_eq!(state.orders.map(|o| o[0].ticket), Some(777));
    assert_eq!(state.closed_trades, Some(vec![]));
    assert_eq!(state.symbol_info.map(|s| s.digits), Some(2));
    // No quote has moved yet, so there are no bars to publish.
    assert!(state.rates.is_none());
}
