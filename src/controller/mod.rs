//! Controller-side client: polls the agent's state files, writes commands into the slot
//! and follows the result log.

pub mod discovery;

use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::context::BridgeContext;
use crate::error::BridgeError;
use crate::health::{FreshnessMonitor, heartbeat_age, is_fresh};
use crate::ipc::command::{CommandChannel, CommandError, validate};
use crate::ipc::result_log::ResultLogTail;
use crate::ipc::snapshot::{modified_secs, read_json};
use crate::ipc::{
    ACCOUNT_FILE, CLOSED_TRADES_FILE, FileError, ORDERS_FILE, POSITIONS_FILE, RATES_FILE,
    SYMBOL_INFO_FILE, order_book_file_name, tick_file_name,
};
use crate::model::{
    AccountSnapshot, ClosedTradeRecord, ClosedTradesFile, OrderBookSnapshot, OrdersFile,
    PendingOrderRecord, PositionRecord, PositionsFile, PriceSnapshot, RatesSnapshot, SymbolSpec,
    TickSnapshot, TradeAction, TradeCommand, TradeResultRecord,
};
use discovery::{PriceSource, resolve_price_file};

/// In-memory price history cap.
pub const PRICE_HISTORY_LIMIT: usize = 1000;

/// Age beyond which `test_connection` calls the price feed stale.
pub const TEST_CONNECTION_MAX_AGE_SECS: i64 = 60;

const PRICE_KEY: &str = "price";

/// Everything one poll could read. Each entity is independent; `None` means missing or
/// unreadable this cycle.
#[derive(Debug, Clone, Default)]
pub struct StatePoll {
    pub price: Option<PriceSnapshot>,
    pub tick: Option<TickSnapshot>,
    pub order_book: Option<OrderBookSnapshot>,
    pub account: Option<AccountSnapshot>,
    pub positions: Option<Vec<PositionRecord>>,
    pub orders: Option<Vec<PendingOrderRecord>>,
    pub closed_trades: Option<Vec<ClosedTradeRecord>>,
    pub rates: Option<RatesSnapshot>,
    pub symbol_info: Option<SymbolSpec>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub connected: bool,
    pub files_dir: PathBuf,
    pub primary_symbol: String,
    pub resolved_symbol: String,
    pub price_file: Option<PathBuf>,
    pub heartbeat_age_secs: Option<i64>,
    pub heartbeat_timeout_secs: u64,
    pub last_heartbeat: Option<i64>,
    pub command_pending: bool,
    pub result_log_offset: u64,
    pub price_history_len: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionTest {
    pub ok: bool,
    pub message: String,
}

/// Optional fields of an opening order.
#[derive(Debug, Clone, Default)]
pub struct OrderParams {
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub comment: String,
    pub magic_number: Option<i64>,
    pub trade_id: Option<String>,
}

pub struct BridgeClient {
    ctx: BridgeContext,
    cfg: BridgeConfig,
    dir: PathBuf,
    channel: CommandChannel,
    tail: ResultLogTail,
    price_source: Option<PriceSource>,
    history: VecDeque<PriceSnapshot>,
    unclaimed: VecDeque<TradeResultRecord>,
    connected: bool,
    freshness: FreshnessMonitor,
}

impl BridgeClient {
    pub fn new(ctx: BridgeContext, cfg: BridgeConfig) -> Result<Self, BridgeError> {
        let dir = cfg.require_files_dir()?;
        let freshness = FreshnessMonitor::new(ctx.time.clone());
        Ok(Self {
            channel: CommandChannel::new(&dir),
            tail: ResultLogTail::new(&dir, &cfg.primary_symbol),
            price_source: None,
            history: VecDeque::new(),
            unclaimed: VecDeque::new(),
            connected: false,
            freshness,
            dir,
            cfg,
            ctx,
        })
    }

    pub fn files_dir(&self) -> &Path {
        &self.dir
    }

    /// Verifies the directory, resolves the price file and, unless configured otherwise,
    /// skips result rows written before this session.
    pub fn connect(&mut self) -> Result<(), BridgeError> {
        info!(dir = %self.dir.display(), "Connecting to bridge directory...");
        if !self.dir.is_dir() {
            return Err(FileError::MissingDirectory(self.dir.clone()).into());
        }

        self.refresh_price_source();
        match self.market_data() {
            Some(p) => info!(symbol = %p.symbol, bid = %p.bid, "✅ Price data available"),
            None => warn!("No readable price file yet"),
        }

        if self.cfg.skip_history_on_connect {
            self.tail.seek_to_end()?;
            debug!(offset = self.tail.offset(), "Result log positioned at end");
        }

        self.connected = true;
        info!("Bridge connection established");
        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.connected = false;
        info!("Bridge disconnected");
    }

    /// Connected iff `connect` succeeded and the price heartbeat is within the timeout.
    pub fn is_connected(&self) -> bool {
        self.connected && self.heartbeat_fresh()
    }

    fn refresh_price_source(&mut self) {
        let resolved = resolve_price_file(
            &self.dir,
            &self.cfg.primary_symbol,
            self.cfg.price_file.as_deref(),
        );
        if resolved != self.price_source {
            if let Some(src) = &resolved {
                self.tail.set_default_symbol(&src.symbol);
                debug!(symbol = %src.symbol, "Price source changed");
            }
            self.price_source = resolved;
        }
    }

    /// Broker symbol in use: the one encoded in the resolved price file, else the
    /// configured primary symbol.
    pub fn resolved_symbol(&self) -> String {
        self.price_source
            .as_ref()
            .map(|s| s.symbol.clone())
            .unwrap_or_else(|| self.cfg.primary_symbol.clone())
    }

    pub fn price_file(&self) -> Option<&Path> {
        self.price_source.as_ref().map(|s| s.path.as_path())
    }

    // --- State reads ---

    /// Latest price. Each successful read is appended to the in-memory history.
    pub fn market_data(&mut self) -> Option<PriceSnapshot> {
        if self.price_source.as_ref().map(|s| !s.path.is_file()).unwrap_or(true) {
            self.refresh_price_source();
        }
        let path = self.price_source.as_ref()?.path.clone();
        let price: PriceSnapshot = read_json(&path)?;

        self.freshness.update_at(PRICE_KEY, price.timestamp);
        self.history.push_back(price.clone());
        while self.history.len() > PRICE_HISTORY_LIMIT {
            self.history.pop_front();
        }
        Some(price)
    }

    /// Most recent `limit` prices, oldest first.
    pub fn price_history(&self, limit: usize) -> Vec<PriceSnapshot> {
        let skip = self.history.len().saturating_sub(limit);
        self.history.iter().skip(skip).cloned().collect()
    }

    fn read<T: serde::de::DeserializeOwned>(&self, name: &str) -> Option<T> {
        read_json(&self.dir.join(name))
    }

    pub fn tick(&self) -> Option<TickSnapshot> {
        self.read(&tick_file_name(&self.resolved_symbol()))
    }

    pub fn order_book(&self) -> Option<OrderBookSnapshot> {
        self.read(&order_book_file_name(&self.resolved_symbol()))
    }

    pub fn account(&self) -> Option<AccountSnapshot> {
        self.read(ACCOUNT_FILE)
    }

    pub fn positions(&self) -> Option<Vec<PositionRecord>> {
        self.read::<PositionsFile>(POSITIONS_FILE).map(|f| f.positions)
    }

    pub fn pending_orders(&self) -> Option<Vec<PendingOrderRecord>> {
        self.read::<OrdersFile>(ORDERS_FILE).map(|f| f.orders)
    }

    pub fn closed_trades(&self, limit: usize) -> Option<Vec<ClosedTradeRecord>> {
        self.read::<ClosedTradesFile>(CLOSED_TRADES_FILE)
            .map(|f| f.trades.into_iter().take(limit).collect())
    }

    pub fn rates(&self) -> Option<RatesSnapshot> {
        self.read(RATES_FILE)
    }

    pub fn symbol_info(&self) -> Option<SymbolSpec> {
        self.read(SYMBOL_INFO_FILE)
    }

    pub fn poll(&mut self) -> StatePoll {
        StatePoll {
            price: self.market_data(),
            tick: self.tick(),
            order_book: self.order_book(),
            account: self.account(),
            positions: self.positions(),
            orders: self.pending_orders(),
            closed_trades: self.closed_trades(usize::MAX),
            rates: self.rates(),
            symbol_info: self.symbol_info(),
        }
    }

    // --- Heartbeat ---

    pub fn heartbeat_age(&self) -> Option<i64> {
        let path = self.price_source.as_ref()?.path.as_path();
        let embedded = read_json::<PriceSnapshot>(path).map(|p| p.timestamp);
        heartbeat_age(self.ctx.now_secs(), embedded, modified_secs(path))
    }

    fn heartbeat_fresh(&self) -> bool {
        let path = match self.price_source.as_ref() {
            Some(s) => s.path.as_path(),
            None => return false,
        };
        let embedded = read_json::<PriceSnapshot>(path).map(|p| p.timestamp);
        is_fresh(
            self.ctx.now_secs(),
            embedded,
            modified_secs(path),
            self.cfg.heartbeat_timeout_secs,
        )
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            connected: self.is_connected(),
            files_dir: self.dir.clone(),
            primary_symbol: self.cfg.primary_symbol.clone(),
            resolved_symbol: self.resolved_symbol(),
            price_file: self.price_source.as_ref().map(|s| s.path.clone()),
            heartbeat_age_secs: self.heartbeat_age(),
            heartbeat_timeout_secs: self.cfg.heartbeat_timeout_secs,
            last_heartbeat: self.freshness.last_update(PRICE_KEY),
            command_pending: self.channel.is_pending(),
            result_log_offset: self.tail.offset(),
            price_history_len: self.history.len(),
        }
    }

    pub fn test_connection(&mut self) -> ConnectionTest {
        let fail = |message: String| ConnectionTest { ok: false, message };

        if !self.dir.is_dir() {
            return fail(format!("files directory not found: {}", self.dir.display()));
        }
        self.refresh_price_source();
        if self.price_file().map(|p| !p.is_file()).unwrap_or(true) {
            return fail("price file not found, is the agent running?".to_string());
        }
        let price = match self.market_data() {
            Some(p) => p,
            None => return fail("unable to parse price data".to_string()),
        };
        let age = self.ctx.now_secs() - price.timestamp;
        if age > TEST_CONNECTION_MAX_AGE_SECS {
            return fail(format!("price data is stale ({} seconds old)", age));
        }
        ConnectionTest {
            ok: true,
            message: format!("connection OK, {} @ {}", price.symbol, price.bid),
        }
    }

    // --- Commands ---

    fn stamp(&self, mut cmd: TradeCommand) -> TradeCommand {
        cmd.timestamp = Some(self.ctx.now_secs());
        cmd
    }

    /// Validates and writes a command. Returns true when an unconsumed command was
    /// overwritten.
    pub fn send_command(&self, cmd: &TradeCommand) -> Result<bool, BridgeError> {
        validate(cmd)?;
        if cmd.action.side().is_some() && cmd.lot_size <= Decimal::ZERO {
            return Err(CommandError::Invalid(format!(
                "lot size must be positive, got {}",
                cmd.lot_size
            ))
            .into());
        }
        Ok(self.channel.submit(cmd)?)
    }

    fn place(&self, action: TradeAction, lot_size: Decimal, params: OrderParams) -> Result<String, BridgeError> {
        let trade_id = params
            .trade_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| self.ctx.id.new_id());

        let mut cmd = TradeCommand::new(action, self.resolved_symbol(), lot_size);
        cmd.stop_loss = params.stop_loss.filter(|v| !v.is_zero());
        cmd.take_profit = params.take_profit.filter(|v| !v.is_zero());
        cmd.comment = params.comment;
        cmd.magic_number = params.magic_number;
        cmd.trade_id = Some(trade_id.clone());

        self.send_command(&self.stamp(cmd))?;
        Ok(trade_id)
    }

    /// Queues a market buy on the resolved symbol. Returns the trade id to wait on.
    pub fn place_buy(&self, lot_size: Decimal, params: OrderParams) -> Result<String, BridgeError> {
        self.place(TradeAction::Buy, lot_size, params)
    }

    pub fn place_sell(&self, lot_size: Decimal, params: OrderParams) -> Result<String, BridgeError> {
        self.place(TradeAction::Sell, lot_size, params)
    }

    pub fn modify_position(
        &self,
        ticket: u64,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<String, BridgeError> {
        if ticket == 0 {
            return Err(CommandError::Invalid("ticket is required".to_string()).into());
        }
        let trade_id = self.ctx.id.new_id();
        let mut cmd = TradeCommand::for_position(TradeAction::Modify, ticket);
        cmd.stop_loss = stop_loss.filter(|v| !v.is_zero());
        cmd.take_profit = take_profit.filter(|v| !v.is_zero());
        cmd.trade_id = Some(trade_id.clone());
        self.send_command(&self.stamp(cmd))?;
        Ok(trade_id)
    }

    pub fn close_position(&self, ticket: u64, volume: Option<Decimal>, comment: &str) -> Result<String, BridgeError> {
        if ticket == 0 {
            return Err(CommandError::Invalid("ticket is required".to_string()).into());
        }
        let trade_id = self.ctx.id.new_id();
        let mut cmd = TradeCommand::for_position(TradeAction::Close, ticket);
        cmd.close_volume = volume.filter(|v| *v > Decimal::ZERO);
        cmd.comment = comment.to_string();
        cmd.trade_id = Some(trade_id.clone());
        self.send_command(&self.stamp(cmd))?;
        Ok(trade_id)
    }

    pub fn clear_command_file(&self) -> Result<(), BridgeError> {
        self.channel.clear()?;
        info!("Command file cleared");
        Ok(())
    }

    // --- Results ---

    /// Result rows appended since the previous call.
    pub fn trade_results(&mut self) -> Result<Vec<TradeResultRecord>, BridgeError> {
        let mut out: Vec<TradeResultRecord> = self.unclaimed.drain(..).collect();
        out.extend(self.tail.read_new()?);
        Ok(out)
    }

    /// Whole result log, newest first.
    pub fn trade_history(&self, limit: usize) -> Result<Vec<TradeResultRecord>, BridgeError> {
        let mut all = self.tail.read_all()?;
        all.reverse();
        all.truncate(limit);
        Ok(all)
    }

    /// Follows the log until the row for `trade_id` appears or `timeout` passes. Rows for
    /// other trade ids stay queued for the next `trade_results` call.
    pub async fn wait_for_result(
        &mut self,
        trade_id: &str,
        timeout: Duration,
    ) -> Result<Option<TradeResultRecord>, BridgeError> {
        let poll = Duration::from_millis(self.cfg.poll_interval_ms.max(10));
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(pos) = self.unclaimed.iter().position(|r| r.trade_id == trade_id) {
                return Ok(self.unclaimed.remove(pos));
            }
            let fresh = self.tail.read_new()?;
            self.unclaimed.extend(fresh);
            if let Some(pos) = self.unclaimed.iter().position(|r| r.trade_id == trade_id) {
                return Ok(self.unclaimed.remove(pos));
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(trade_id = %trade_id, "⏱️ No result before timeout");
                return Ok(None);
            }
            tokio::time::sleep(poll).await;
        }
    }

    // --- Monitoring ---

    /// One freshness check. Returns whether the heartbeat is within the timeout.
    pub fn check_heartbeat(&mut self) -> bool {
        let fresh = self.heartbeat_fresh();
        match self.heartbeat_age() {
            Some(age) if fresh => {
                self.freshness.update(PRICE_KEY);
                debug!(age, "Heartbeat ok");
            }
            Some(age) => warn!(age, timeout = self.cfg.heartbeat_timeout_secs, "No price updates within timeout"),
            None => {
                self.refresh_price_source();
                warn!("Price file does not exist");
            }
        }
        fresh
    }

    /// Periodic heartbeat checks until `shutdown` flips to true.
    pub async fn monitor(&mut self, mut shutdown: watch::Receiver<bool>, every: Duration) {
        let mut interval = tokio::time::interval(every);
        info!(every_ms = every.as_millis() as u64, "Connection monitoring started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.check_heartbeat();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Connection monitoring stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::fs;
    use uuid::Uuid;

    fn client(now_ms: i64) -> (BridgeClient, PathBuf) {
        let dir = std::env::temp_dir().join(format!("bridge_client_{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let (ctx, _) = BridgeContext::new_simulated(now_ms);
        let cfg = BridgeConfig {
            files_dir: Some(dir.clone()),
            ..BridgeConfig::default()
        };
        (BridgeClient::new(ctx, cfg).unwrap(), dir)
    }

    fn write_price(dir: &Path, symbol: &str, ts: i64) {
        let body = format!(
            r#"{{"symbol":"{}","bid":2310.12,"ask":2310.42,"spread":0.30,"volume":7,"timestamp":{},"server_time":""}}"#,
            symbol, ts
        );
        fs::write(dir.join(format!("{}_price.json", symbol)), body).unwrap();
    }

    #[test]
    fn test_stale_heartbeat_means_disconnected() {
        let (mut client, dir) = client(1_723_200_045_000);
        write_price(&dir, "XAUUSD", 1_723_200_000);

        client.connect().unwrap();
        assert_eq!(client.heartbeat_age(), Some(45));
        assert!(!client.is_connected());

        let (mut fresh, dir2) = client_with_price(1_723_200_010_000, 1_723_200_000);
        fresh.connect().unwrap();
        assert!(fresh.is_connected());
        fresh.disconnect();
        assert!(!fresh.is_connected());

        let _ = fs::remove_dir_all(dir);
        let _ = fs::remove_dir_all(dir2);
    }

    fn client_with_price(now_ms: i64, ts: i64) -> (BridgeClient, PathBuf) {
        let (c, dir) = client(now_ms);
        write_price(&dir, "XAUUSD", ts);
        (c, dir)
    }

    #[test]
    fn test_buy_uses_resolved_broker_symbol() {
        let (mut client, dir) = client_with_price(1_723_200_000_000, 1_723_200_000);
        fs::rename(dir.join("XAUUSD_price.json"), dir.join("XAUUSD!_price.json")).unwrap();
        client.connect().unwrap();
        assert_eq!(client.resolved_symbol(), "XAUUSD!");

        let id = client
            .place_buy(dec!(0.1), OrderParams { stop_loss: Some(Decimal::ZERO), ..OrderParams::default() })
            .unwrap();
        assert_eq!(id, "00000000-0000-0000-0000-000000000001");

        let raw = fs::read_to_string(dir.join("commands.json")).unwrap();
        let cmd: TradeCommand = serde_json::from_str(&raw).unwrap();
        assert_eq!(cmd.symbol, "XAUUSD!");
        assert_eq!(cmd.stop_loss, None);
        assert_eq!(cmd.timestamp, Some(1_723_200_000));
        assert!(!raw.contains(' '));

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_builders_validate_input() {
        let (client, dir) = client(1_723_200_000_000);
        assert!(client.place_sell(Decimal::ZERO, OrderParams::default()).is_err());
        assert!(client.close_position(0, None, "").is_err());
        assert!(client.modify_position(0, Some(dec!(1)), None).is_err());
        assert!(!dir.join("commands.json").exists());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_price_history_is_capped() {
        let (mut client, dir) = client_with_price(1_723_200_000_000, 1_723_200_000);
        for _ in 0..(PRICE_HISTORY_LIMIT + 5) {
            assert!(client.market_data().is_some());
        }
        assert_eq!(client.price_history(10).len(), 10);
        assert_eq!(client.price_history(usize::MAX).len(), PRICE_HISTORY_LIMIT);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_connection_check_flags_stale_price() {
        let (mut client, dir) = client_with_price(1_723_200_100_000, 1_723_200_000);
        let res = client.test_connection();
        assert!(!res.ok);
        assert!(res.message.contains("stale"));

        write_price(&dir, "XAUUSD", 1_723_200_090);
        assert!(client.test_connection().ok);
        let _ = fs::remove_dir_all(dir);
    }
}
