use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::context::BridgeContext;
use crate::health::FreshnessMonitor;
use crate::ipc::snapshot::write_atomic;
use crate::ipc::{
    ACCOUNT_FILE, CLOSED_TRADES_FILE, ORDERS_FILE, POSITIONS_FILE, RATES_FILE, SYMBOL_INFO_FILE,
    order_book_file_name, price_file_name, tick_file_name,
};
use crate::metrics;
use crate::model::{
    ClosedTradesFile, OrderBookSnapshot, OrdersFile, PositionsFile, PriceSnapshot, RatesSnapshot,
    TickSnapshot, Timeframe, format_server_time,
};
use crate::reconciler;
use crate::scheduler::TaskKind;
use crate::venue::adapter::{Quote, Venue};

/// Produces the agent's state files. Each call writes a complete snapshot or nothing.
pub struct StateWriter {
    venue: Arc<dyn Venue>,
    ctx: BridgeContext,
    dir: PathBuf,
    symbols: Vec<String>,
    primary: String,
    bars: usize,
    history_days: i64,
    freshness: FreshnessMonitor,
}

impl StateWriter {
    pub fn new(
        venue: Arc<dyn Venue>,
        ctx: BridgeContext,
        dir: &Path,
        symbols: Vec<String>,
        primary: &str,
        bars: usize,
        history_days: i64,
    ) -> Self {
        let freshness = FreshnessMonitor::new(ctx.time.clone());
        Self {
            venue,
            ctx,
            dir: dir.to_path_buf(),
            symbols,
            primary: primary.to_string(),
            bars,
            history_days,
            freshness,
        }
    }

    pub fn freshness(&self) -> &FreshnessMonitor {
        &self.freshness
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    /// Runs one scheduled writer task. Returns the number of files written.
    pub async fn run(&self, kind: TaskKind) -> usize {
        match kind {
            TaskKind::Commands => 0,
            TaskKind::Price => self.per_symbol(kind).await,
            TaskKind::Tick => self.per_symbol(kind).await,
            TaskKind::OrderBook => self.per_symbol(kind).await,
            TaskKind::Account => usize::from(self.write_account().await),
            TaskKind::Positions => usize::from(self.write_positions().await),
            TaskKind::Orders => usize::from(self.write_orders().await),
            TaskKind::ClosedTrades => usize::from(self.write_closed_trades().await),
            TaskKind::Rates => usize::from(self.write_rates().await),
            TaskKind::SymbolInfo => usize::from(self.write_symbol_info().await),
        }
    }

    async fn per_symbol(&self, kind: TaskKind) -> usize {
        let mut written = 0;
        for symbol in &self.symbols {
            let ok = match kind {
                TaskKind::Price => self.write_price(symbol).await,
                TaskKind::Tick => self.write_tick(symbol).await,
                TaskKind::OrderBook => self.write_order_book(symbol).await,
                _ => false,
            };
            written += usize::from(ok);
        }
        written
    }

    fn persist<T: Serialize>(&self, name: &str, value: &T) -> bool {
        match write_atomic(&self.dir, name, value) {
            Ok(_) => {
                metrics::inc_snapshot_writes(name);
                self.freshness.update(name);
                debug!(file = %name, "Snapshot written");
                true
            }
            Err(e) => {
                error!(file = %name, error = %e, "❌ Snapshot write failed");
                false
            }
        }
    }

    fn skip(&self, name: &str, reason: &str) -> bool {
        metrics::inc_snapshot_skips(name);
        debug!(file = %name, reason, "Snapshot skipped");
        false
    }

    async fn two_sided_quote(&self, symbol: &str, name: &str) -> Option<Quote> {
        match self.venue.quote(symbol).await {
            Ok(Some(q)) if q.is_two_sided() => Some(q),
            Ok(_) => {
                self.skip(name, "no quote");
                None
            }
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "Quote query failed");
                self.skip(name, "venue error");
                None
            }
        }
    }

    pub async fn write_price(&self, symbol: &str) -> bool {
        let name = price_file_name(symbol);
        let quote = match self.two_sided_quote(symbol, &name).await {
            Some(q) => q,
            None => return false,
        };
        // Stamped with the write time: the controller reads it as the heartbeat,
        // which must stay fresh while the agent runs even if the quote is idle.
        let timestamp = self.ctx.now_secs();
        let snapshot = PriceSnapshot {
            symbol: symbol.to_string(),
            bid: quote.bid,
            ask: quote.ask,
            spread: Some(quote.ask - quote.bid),
            volume: quote.volume.to_u64().unwrap_or(0),
            timestamp,
            server_time: format_server_time(timestamp),
        };
        self.persist(&name, &snapshot)
    }

    pub async fn write_tick(&self, symbol: &str) -> bool {
        let name = tick_file_name(symbol);
        let quote = match self.venue.quote(symbol).await {
            Ok(Some(q)) if q.bid > Decimal::ZERO || q.ask > Decimal::ZERO => q,
            Ok(_) => return self.skip(&name, "no tick"),
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "Tick query failed");
                return self.skip(&name, "venue error");
            }
        };
        let snapshot = TickSnapshot {
            symbol: symbol.to_string(),
            bid: quote.bid,
            ask: quote.ask,
            last: quote.last,
            volume_real: quote.volume,
            spread: TickSnapshot::derive_spread(quote.bid, quote.ask),
            time: quote.time_secs(),
            time_msc: quote.time_msc,
            flags: quote.flags,
        };
        self.persist(&name, &snapshot)
    }

    pub async fn write_order_book(&self, symbol: &str) -> bool {
        let name = order_book_file_name(symbol);
        match self.venue.order_book(symbol).await {
            Ok(Some(levels)) if !levels.is_empty() => {
                let snapshot = OrderBookSnapshot {
                    symbol: symbol.to_string(),
                    timestamp: self.ctx.now_secs(),
                    levels,
                };
                self.persist(&name, &snapshot)
            }
            Ok(_) => self.skip(&name, "no depth of market"),
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "Order book query failed");
                self.skip(&name, "venue error")
            }
        }
    }

    pub async fn write_account(&self) -> bool {
        match self.venue.account().await {
            Ok(Some(mut account)) => {
                let now = self.ctx.now_secs();
                account.timestamp = now;
                account.server_time = format_server_time(now);
                account.connected = self.venue.is_connected().await;
                self.persist(ACCOUNT_FILE, &account)
            }
            Ok(None) => self.skip(ACCOUNT_FILE, "no account"),
            Err(e) => {
                warn!(error = %e, "Account query failed");
                self.skip(ACCOUNT_FILE, "venue error")
            }
        }
    }

    pub async fn write_positions(&self) -> bool {
        match self.venue.positions().await {
            Ok(positions) => {
                metrics::set_open_positions(positions.len() as i64);
                let file = PositionsFile {
                    positions,
                    timestamp: self.ctx.now_secs(),
                };
                self.persist(POSITIONS_FILE, &file)
            }
            Err(e) => {
                warn!(error = %e, "Positions query failed");
                self.skip(POSITIONS_FILE, "venue error")
            }
        }
    }

    pub async fn write_orders(&self) -> bool {
        match self.venue.pending_orders().await {
            Ok(orders) => {
                let file = OrdersFile {
                    orders,
                    timestamp: self.ctx.now_secs(),
                };
                self.persist(ORDERS_FILE, &file)
            }
            Err(e) => {
                warn!(error = %e, "Pending orders query failed");
                self.skip(ORDERS_FILE, "venue error")
            }
        }
    }

    pub async fn write_closed_trades(&self) -> bool {
        let now = self.ctx.now_secs();
        match reconciler::closed_trades(self.venue.as_ref(), now, self.history_days).await {
            Ok(trades) => {
                let file = ClosedTradesFile {
                    trades,
                    timestamp: now,
                };
                self.persist(CLOSED_TRADES_FILE, &file)
            }
            Err(e) => {
                warn!(error = %e, "History query failed");
                self.skip(CLOSED_TRADES_FILE, "venue error")
            }
        }
    }

    pub async fn write_rates(&self) -> bool {
        match self.venue.bars(&self.primary, Timeframe::M1, self.bars).await {
            Ok(bars) if !bars.is_empty() => {
                let snapshot = RatesSnapshot {
                    symbol: self.primary.clone(),
                    timeframe: Timeframe::M1,
                    bars,
                };
                self.persist(RATES_FILE, &snapshot)
            }
            Ok(_) => self.skip(RATES_FILE, "no bars"),
            Err(e) => {
                warn!(symbol = %self.primary, error = %e, "Bar query failed");
                self.skip(RATES_FILE, "venue error")
            }
        }
    }

    pub async fn write_symbol_info(&self) -> bool {
        match self.venue.symbol_spec(&self.primary).await {
            Ok(Some(spec)) => self.persist(SYMBOL_INFO_FILE, &spec),
            Ok(None) => self.skip(SYMBOL_INFO_FILE, "unknown symbol"),
            Err(e) => {
                warn!(symbol = %self.primary, error = %e, "Symbol query failed");
                self.skip(SYMBOL_INFO_FILE, "venue error")
            }
        }
    }
}
