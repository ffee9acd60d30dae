use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::{info, warn};

use super::adapter::{Quote, RequestAction, TradeRequest, TradeResponse, Venue, VenueError, retcode};
use crate::config::PaperConfig;
use crate::context::BridgeContext;
use crate::model::{
    AccountSnapshot, BarRecord, BookLevel, BookSide, DealEntry, DealKind, DealRecord,
    HistoryOrderRecord, PendingOrderRecord, PositionRecord, Side, SymbolSpec, Timeframe,
    format_server_time,
};

/// One week of M1 bars.
const MAX_M1_BARS: usize = 10_080;

struct Instrument {
    spec: SymbolSpec,
    bid: Decimal,
    ask: Decimal,
    quote_time_msc: i64,
    ticks: u64,
    bars: VecDeque<BarRecord>,
}

impl Instrument {
    fn quote(&self) -> Option<Quote> {
        if self.bid <= Decimal::ZERO || self.ask <= Decimal::ZERO {
            return None;
        }
        Some(Quote {
            bid: self.bid,
            ask: self.ask,
            last: self.bid,
            volume: Decimal::from(self.ticks),
            time_msc: self.quote_time_msc,
            flags: 6,
        })
    }

    /// Price an open position of `side` would be closed at.
    fn exit_price(&self, side: Side) -> Decimal {
        match side {
            Side::Buy => self.bid,
            Side::Sell => self.ask,
        }
    }

    fn record_bar(&mut self, now_secs: i64) {
        let bucket = now_secs - now_secs.rem_euclid(60);
        let spread = ((self.ask - self.bid) / self.spec.point)
            .round()
            .to_i64()
            .unwrap_or(0);
        match self.bars.back_mut() {
            Some(bar) if bar.time == bucket => {
                bar.high = bar.high.max(self.bid);
                bar.low = bar.low.min(self.bid);
                bar.close = self.bid;
                bar.tick_volume += 1;
                bar.spread = spread;
            }
            _ => {
                self.bars.push_back(BarRecord {
                    time: bucket,
                    open: self.bid,
                    high: self.bid,
                    low: self.bid,
                    close: self.bid,
                    tick_volume: 1,
                    real_volume: 0,
                    spread,
                });
                while self.bars.len() > MAX_M1_BARS {
                    self.bars.pop_front();
                }
            }
        }
    }
}

struct PaperState {
    instruments: HashMap<String, Instrument>,
    balance: Decimal,
    positions: BTreeMap<u64, PositionRecord>,
    pending: Vec<PendingOrderRecord>,
    deals: Vec<DealRecord>,
    orders: Vec<HistoryOrderRecord>,
    next_ticket: u64,
    forced: VecDeque<u32>,
    connected: bool,
    journal: Vec<TradeRequest>,
}

impl PaperState {
    fn next_ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }
}

/// In-memory venue. Fills market orders at the current quote, keeps deal and order
/// history, and closes positions whose protective levels are crossed by a new quote.
pub struct PaperVenue {
    ctx: BridgeContext,
    cfg: PaperConfig,
    state: Mutex<PaperState>,
}

fn position_pnl(side: Side, entry: Decimal, exit: Decimal, volume: Decimal, contract: Decimal) -> Decimal {
    let diff = match side {
        Side::Buy => exit - entry,
        Side::Sell => entry - exit,
    };
    (diff * volume * contract).round_dp(2)
}

fn side_code(side: Side) -> i32 {
    match side {
        Side::Buy => 0,
        Side::Sell => 1,
    }
}

fn volume_valid(spec: &SymbolSpec, volume: Decimal) -> bool {
    if volume < spec.volume_min || volume > spec.volume_max {
        return false;
    }
    spec.volume_step <= Decimal::ZERO || (volume % spec.volume_step).is_zero()
}

/// Protective levels must sit on the correct side of `reference`, at least the stops
/// distance away.
fn stops_valid(spec: &SymbolSpec, side: Side, reference: Decimal, sl: Decimal, tp: Decimal) -> bool {
    let dist = spec.min_stop_distance();
    let sl_ok = sl.is_zero()
        || match side {
            Side::Buy => sl <= reference - dist,
            Side::Sell => sl >= reference + dist,
        };
    let tp_ok = tp.is_zero()
        || match side {
            Side::Buy => tp >= reference + dist,
            Side::Sell => tp <= reference - dist,
        };
    sl_ok && tp_ok
}

/// Rolls M1 bars up into `timeframe` buckets.
pub fn aggregate_bars(bars: &[BarRecord], timeframe: Timeframe) -> Vec<BarRecord> {
    let span = timeframe.seconds();
    let mut out: Vec<BarRecord> = Vec::new();
    for bar in bars {
        let bucket = bar.time - bar.time.rem_euclid(span);
        match out.last_mut() {
            Some(agg) if agg.time == bucket => {
                agg.high = agg.high.max(bar.high);
                agg.low = agg.low.min(bar.low);
                agg.close = bar.close;
                agg.tick_volume += bar.tick_volume;
                agg.real_volume += bar.real_volume;
                agg.spread = bar.spread;
            }
            _ => {
                let mut first = bar.clone();
                first.time = bucket;
                out.push(first);
            }
        }
    }
    out
}

/// Simple-average true range over the last `period` bars. Needs `period + 1` bars.
pub fn average_true_range(bars: &[BarRecord], period: usize) -> Option<Decimal> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }
    let window = &bars[bars.len() - period - 1..];
    let total: Decimal = window
        .windows(2)
        .map(|pair| {
            let prev_close = pair[0].close;
            let bar = &pair[1];
            (bar.high - bar.low)
                .max((bar.high - prev_close).abs())
                .max((bar.low - prev_close).abs())
        })
        .sum();
    Some(total / Decimal::from(period))
}

impl PaperVenue {
    pub fn new(ctx: BridgeContext, cfg: &PaperConfig) -> Self {
        let now_ms = ctx.time.now_millis();
        let instruments = cfg
            .instruments
            .iter()
            .map(|inst| {
                (
                    inst.symbol.clone(),
                    Instrument {
                        spec: inst.spec(),
                        bid: inst.bid,
                        ask: inst.ask,
                        quote_time_msc: now_ms,
                        ticks: 0,
                        bars: VecDeque::new(),
                    },
                )
            })
            .collect();

        info!(
            instruments = cfg.instruments.len(),
            balance = %cfg.balance,
            "🧪 Paper venue initialized"
        );

        Self {
            ctx,
            cfg: cfg.clone(),
            state: Mutex::new(PaperState {
                instruments,
                balance: cfg.balance,
                positions: BTreeMap::new(),
                pending: Vec::new(),
                deals: Vec::new(),
                orders: Vec::new(),
                next_ticket: 100_000,
                forced: VecDeque::new(),
                connected: true,
                journal: Vec::new(),
            }),
        }
    }

    /// Moves the market. Records the tick into the current M1 bar and fires any
    /// stop-loss / take-profit the new price crosses.
    pub fn set_quote(&self, symbol: &str, bid: Decimal, ask: Decimal) {
        let now_ms = self.ctx.time.now_millis();
        let mut state = self.state.lock();
        match state.instruments.get_mut(symbol) {
            Some(inst) => {
                inst.bid = bid;
                inst.ask = ask;
                inst.quote_time_msc = now_ms;
                inst.ticks += 1;
                if bid > Decimal::ZERO && ask > Decimal::ZERO {
                    inst.record_bar(now_ms.div_euclid(1000));
                }
            }
            None => {
                warn!(symbol = %symbol, "Quote for unknown paper instrument ignored");
                return;
            }
        }
        Self::trigger_protection(&mut state, symbol, now_ms.div_euclid(1000));
    }

    /// Random step of up to `random_walk_points` for every instrument, spread preserved.
    pub fn random_walk(&self) {
        let max_points = i64::from(self.cfg.random_walk_points);
        if max_points == 0 {
            return;
        }
        let moves: Vec<(String, Decimal, Decimal)> = {
            let state = self.state.lock();
            let mut rng = rand::thread_rng();
            state
                .instruments
                .iter()
                .filter(|(_, inst)| inst.bid > Decimal::ZERO)
                .map(|(symbol, inst)| {
                    let steps = rng.gen_range(-max_points..=max_points);
                    let delta = inst.spec.point * Decimal::from(steps);
                    (symbol.clone(), inst.bid + delta, inst.ask + delta)
                })
                .collect()
        };
        for (symbol, bid, ask) in moves {
            self.set_quote(&symbol, bid, ask);
        }
    }

    /// Drops both sides of the quote, as a terminal does outside trading hours.
    pub fn clear_quote(&self, symbol: &str) {
        self.set_quote(symbol, Decimal::ZERO, Decimal::ZERO);
    }

    /// Next `send` returns `code` without touching state.
    pub fn force_retcode(&self, code: u32) {
        self.state.lock().forced.push_back(code);
    }

    pub fn set_connected(&self, connected: bool) {
        self.state.lock().connected = connected;
    }

    pub fn seed_bars(&self, symbol: &str, bars: Vec<BarRecord>) {
        if let Some(inst) = self.state.lock().instruments.get_mut(symbol) {
            inst.bars = bars.into_iter().collect();
        }
    }

    pub fn insert_pending_order(&self, order: PendingOrderRecord) {
        self.state.lock().pending.push(order);
    }

    /// Every request that reached `send`, in order.
    pub fn requests(&self) -> Vec<TradeRequest> {
        self.state.lock().journal.clone()
    }

    pub fn balance(&self) -> Decimal {
        self.state.lock().balance
    }

    fn trigger_protection(state: &mut PaperState, symbol: &str, now: i64) {
        let hits: Vec<(u64, Decimal, String)> = {
            let inst = match state.instruments.get(symbol) {
                Some(i) if i.bid > Decimal::ZERO && i.ask > Decimal::ZERO => i,
                _ => return,
            };
            let digits = inst.spec.digits;
            state
                .positions
                .values()
                .filter(|p| p.symbol == symbol)
                .filter_map(|p| {
                    let price = inst.exit_price(p.side);
                    let sl_hit = !p.sl.is_zero()
                        && match p.side {
                            Side::Buy => price <= p.sl,
                            Side::Sell => price >= p.sl,
                        };
                    let tp_hit = !p.tp.is_zero()
                        && match p.side {
                            Side::Buy => price >= p.tp,
                            Side::Sell => price <= p.tp,
                        };
                    if sl_hit {
                        Some((p.ticket, price, format!("[sl {}]", p.sl.round_dp(digits))))
                    } else if tp_hit {
                        Some((p.ticket, price, format!("[tp {}]", p.tp.round_dp(digits))))
                    } else {
                        None
                    }
                })
                .collect()
        };

        for (ticket, price, comment) in hits {
            let volume = match state.positions.get(&ticket) {
                Some(p) => p.volume,
                None => continue,
            };
            info!(ticket, price = %price, reason = %comment, "🛑 Protective level hit");
            Self::close_part(state, ticket, volume, price, comment, now);
        }
    }

    /// Books an exit deal and shrinks or removes the position. Returns (deal, order).
    fn close_part(
        state: &mut PaperState,
        ticket: u64,
        volume: Decimal,
        price: Decimal,
        comment: String,
        now: i64,
    ) -> Option<(u64, u64)> {
        let position = state.positions.get(&ticket)?.clone();
        let contract = state
            .instruments
            .get(&position.symbol)
            .map(|i| i.spec.contract_size)
            .unwrap_or(Decimal::ONE);
        let profit = position_pnl(position.side, position.price_open, price, volume, contract);

        let order = state.next_ticket();
        let deal = state.next_ticket();
        let exit_side = position.side.opposite();

        state.orders.push(HistoryOrderRecord {
            ticket: order,
            position_id: ticket,
            symbol: position.symbol.clone(),
            order_type: side_code(exit_side),
            price,
            sl: position.sl,
            tp: position.tp,
            time_setup: now,
            time_done: now,
            comment: comment.clone(),
            magic: position.magic,
        });
        state.deals.push(DealRecord {
            ticket: deal,
            order,
            position_id: ticket,
            symbol: position.symbol.clone(),
            kind: if exit_side == Side::Buy { DealKind::Buy } else { DealKind::Sell },
            entry: DealEntry::Out,
            volume,
            price,
            profit,
            swap: Decimal::ZERO,
            commission: Decimal::ZERO,
            sl: position.sl,
            tp: position.tp,
            time: now,
            comment,
            magic: position.magic,
        });
        state.balance += profit;

        let remaining = position.volume - volume;
        if remaining <= Decimal::ZERO {
            state.positions.remove(&ticket);
        } else if let Some(p) = state.positions.get_mut(&ticket) {
            p.volume = remaining;
        }
        Some((deal, order))
    }

    fn used_margin(&self, state: &PaperState) -> Decimal {
        let leverage = Decimal::from(self.cfg.leverage.max(1));
        state
            .positions
            .values()
            .map(|p| {
                let contract = state
                    .instruments
                    .get(&p.symbol)
                    .map(|i| i.spec.contract_size)
                    .unwrap_or(Decimal::ONE);
                p.volume * contract * p.price_open / leverage
            })
            .sum()
    }

    fn position_view(state: &PaperState, position: &PositionRecord) -> PositionRecord {
        let mut view = position.clone();
        if let Some(inst) = state.instruments.get(&position.symbol) {
            let price = inst.exit_price(position.side);
            if price > Decimal::ZERO {
                view.price_current = price;
                view.profit = position_pnl(
                    position.side,
                    position.price_open,
                    price,
                    position.volume,
                    inst.spec.contract_size,
                );
            }
        }
        view
    }

    fn floating_profit(state: &PaperState) -> Decimal {
        state
            .positions
            .values()
            .map(|p| Self::position_view(state, p).profit)
            .sum()
    }

    fn execute(&self, state: &mut PaperState, request: &TradeRequest) -> TradeResponse {
        let now = self.ctx.time.now_secs();
        match request.action {
            RequestAction::SlTp => self.modify_levels(state, request),
            RequestAction::Deal => match request.position {
                Some(ticket) => self.close_position(state, request, ticket, now),
                None => self.open_position(state, request, now),
            },
        }
    }

    fn open_position(&self, state: &mut PaperState, request: &TradeRequest, now: i64) -> TradeResponse {
        let (spec, quote) = match state.instruments.get(&request.symbol) {
            Some(inst) => (inst.spec.clone(), inst.quote()),
            None => return TradeResponse::rejected(retcode::INVALID),
        };
        let quote = match quote {
            Some(q) => q,
            None => return TradeResponse::rejected(retcode::PRICE_OFF),
        };
        if !volume_valid(&spec, request.volume) {
            return TradeResponse::rejected(retcode::INVALID_VOLUME);
        }

        let price = quote.entry_price(request.side);
        let tolerance = spec.point * Decimal::from(request.deviation);
        if request.price > Decimal::ZERO && (request.price - price).abs() > tolerance {
            return TradeResponse::rejected(retcode::REQUOTE);
        }
        if !stops_valid(&spec, request.side, price, request.sl, request.tp) {
            return TradeResponse::rejected(retcode::INVALID_STOPS);
        }

        let leverage = Decimal::from(self.cfg.leverage.max(1));
        let required = request.volume * spec.contract_size * price / leverage;
        let equity = state.balance + Self::floating_profit(state);
        let free = equity - self.used_margin(state);
        if required > free {
            return TradeResponse::rejected(retcode::NO_MONEY);
        }

        let ticket = state.next_ticket();
        let deal = state.next_ticket();

        state.orders.push(HistoryOrderRecord {
            ticket,
            position_id: ticket,
            symbol: request.symbol.clone(),
            order_type: side_code(request.side),
            price,
            sl: request.sl,
            tp: request.tp,
            time_setup: now,
            time_done: now,
            comment: request.comment.clone(),
            magic: request.magic,
        });
        state.deals.push(DealRecord {
            ticket: deal,
            order: ticket,
            position_id: ticket,
            symbol: request.symbol.clone(),
            kind: if request.side == Side::Buy { DealKind::Buy } else { DealKind::Sell },
            entry: DealEntry::In,
            volume: request.volume,
            price,
            profit: Decimal::ZERO,
            swap: Decimal::ZERO,
            commission: Decimal::ZERO,
            sl: request.sl,
            tp: request.tp,
            time: now,
            comment: request.comment.clone(),
            magic: request.magic,
        });
        state.positions.insert(
            ticket,
            PositionRecord {
                ticket,
                symbol: request.symbol.clone(),
                side: request.side,
                volume: request.volume,
                price_open: price,
                price_current: price,
                sl: request.sl,
                tp: request.tp,
                profit: Decimal::ZERO,
                swap: Decimal::ZERO,
                magic: request.magic,
                comment: request.comment.clone(),
                time_open: format_server_time(now),
                time_open_timestamp: now,
            },
        );

        TradeResponse {
            retcode: retcode::DONE,
            deal,
            order: ticket,
            price,
            volume: request.volume,
            comment: retcode::describe(retcode::DONE).to_string(),
        }
    }

    fn close_position(
        &self,
        state: &mut PaperState,
        request: &TradeRequest,
        ticket: u64,
        now: i64,
    ) -> TradeResponse {
        let position = match state.positions.get(&ticket) {
            Some(p) => p.clone(),
            None => return TradeResponse::rejected(retcode::INVALID),
        };
        if request.side != position.side.opposite() {
            return TradeResponse::rejected(retcode::INVALID);
        }
        let (spec, quote) = match state.instruments.get(&position.symbol) {
            Some(inst) => (inst.spec.clone(), inst.quote()),
            None => return TradeResponse::rejected(retcode::INVALID),
        };
        let quote = match quote {
            Some(q) => q,
            None => return TradeResponse::rejected(retcode::PRICE_OFF),
        };
        if request.volume <= Decimal::ZERO
            || request.volume > position.volume
            || (spec.volume_step > Decimal::ZERO && !(request.volume % spec.volume_step).is_zero())
        {
            return TradeResponse::rejected(retcode::INVALID_VOLUME);
        }

        let price = quote.entry_price(request.side);
        let tolerance = spec.point * Decimal::from(request.deviation);
        if request.price > Decimal::ZERO && (request.price - price).abs() > tolerance {
            return TradeResponse::rejected(retcode::REQUOTE);
        }

        match Self::close_part(state, ticket, request.volume, price, request.comment.clone(), now) {
            Some((deal, order)) => TradeResponse {
                retcode: retcode::DONE,
                deal,
                order,
                price,
                volume: request.volume,
                comment: retcode::describe(retcode::DONE).to_string(),
            },
            None => TradeResponse::rejected(retcode::INVALID),
        }
    }

    fn modify_levels(&self, state: &mut PaperState, request: &TradeRequest) -> TradeResponse {
        let ticket = match request.position {
            Some(t) => t,
            None => return TradeResponse::rejected(retcode::INVALID),
        };
        let position = match state.positions.get(&ticket) {
            Some(p) => p.clone(),
            None => return TradeResponse::rejected(retcode::INVALID),
        };
        let (spec, reference) = match state.instruments.get(&position.symbol) {
            Some(inst) if inst.quote().is_some() => (inst.spec.clone(), inst.exit_price(position.side)),
            Some(_) => return TradeResponse::rejected(retcode::PRICE_OFF),
            None => return TradeResponse::rejected(retcode::INVALID),
        };
        if !stops_valid(&spec, position.side, reference, request.sl, request.tp) {
            return TradeResponse::rejected(retcode::INVALID_STOPS);
        }

        if let Some(p) = state.positions.get_mut(&ticket) {
            p.sl = request.sl;
            p.tp = request.tp;
        }
        TradeResponse {
            retcode: retcode::DONE,
            deal: 0,
            order: 0,
            price: Decimal::ZERO,
            volume: Decimal::ZERO,
            comment: retcode::describe(retcode::DONE).to_string(),
        }
    }
}

#[async_trait]
impl Venue for PaperVenue {
    fn name(&self) -> &str {
        "paper"
    }

    async fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    async fn symbol_spec(&self, symbol: &str) -> Result<Option<SymbolSpec>, VenueError> {
        Ok(self
            .state
            .lock()
            .instruments
            .get(symbol)
            .map(|i| i.spec.clone()))
    }

    async fn quote(&self, symbol: &str) -> Result<Option<Quote>, VenueError> {
        let state = self.state.lock();
        if !state.connected {
            return Err(VenueError::Disconnected);
        }
        Ok(state.instruments.get(symbol).and_then(Instrument::quote))
    }

    async fn order_book(&self, symbol: &str) -> Result<Option<Vec<BookLevel>>, VenueError> {
        let depth = self.cfg.book_depth;
        if depth == 0 {
            return Ok(None);
        }
        let state = self.state.lock();
        let inst = match state.instruments.get(symbol) {
            Some(i) => i,
            None => return Ok(None),
        };
        let quote = match inst.quote() {
            Some(q) => q,
            None => return Ok(None),
        };

        let point = inst.spec.point;
        let mut levels = Vec::with_capacity(depth * 2);
        for i in (0..depth).rev() {
            let offset = point * Decimal::from(i as u64 * 10);
            levels.push(BookLevel {
                side: BookSide::Sell,
                price: quote.ask + offset,
                volume: Decimal::from(i as u64 + 1),
            });
        }
        for i in 0..depth {
            let offset = point * Decimal::from(i as u64 * 10);
            levels.push(BookLevel {
                side: BookSide::Buy,
                price: quote.bid - offset,
                volume: Decimal::from(i as u64 + 1),
            });
        }
        Ok(Some(levels))
    }

    async fn bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<BarRecord>, VenueError> {
        let state = self.state.lock();
        let inst = state
            .instruments
            .get(symbol)
            .ok_or_else(|| VenueError::UnknownSymbol(symbol.to_string()))?;
        let m1: Vec<BarRecord> = inst.bars.iter().cloned().collect();
        let mut bars = aggregate_bars(&m1, timeframe);
        if bars.len() > count {
            bars.drain(..bars.len() - count);
        }
        Ok(bars)
    }

    async fn volatility(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        period: usize,
    ) -> Result<Option<Decimal>, VenueError> {
        let bars = self.bars(symbol, timeframe, period + 1).await?;
        Ok(average_true_range(&bars, period))
    }

    async fn account(&self) -> Result<Option<AccountSnapshot>, VenueError> {
        let state = self.state.lock();
        if !state.connected {
            return Ok(None);
        }
        let now = self.ctx.time.now_secs();
        let profit = Self::floating_profit(&state);
        let margin = self.used_margin(&state);
        let equity = state.balance + profit;

        Ok(Some(AccountSnapshot {
            login: self.cfg.login,
            name: self.cfg.name.clone(),
            server: self.cfg.server.clone(),
            company: self.cfg.company.clone(),
            currency: self.cfg.currency.clone(),
            leverage: self.cfg.leverage,
            trade_mode: 0,
            balance: state.balance,
            equity,
            margin: margin.round_dp(2),
            free_margin: (equity - margin).round_dp(2),
            profit,
            credit: Decimal::ZERO,
            connected: true,
            ping_ms: 0,
            build: 0,
            timestamp: now,
            server_time: format_server_time(now),
        }))
    }

    async fn positions(&self) -> Result<Vec<PositionRecord>, VenueError> {
        let state = self.state.lock();
        Ok(state
            .positions
            .values()
            .map(|p| Self::position_view(&state, p))
            .collect())
    }

    async fn pending_orders(&self) -> Result<Vec<PendingOrderRecord>, VenueError> {
        Ok(self.state.lock().pending.clone())
    }

    async fn history_deals(&self, from: i64, to: i64) -> Result<Vec<DealRecord>, VenueError> {
        Ok(self
            .state
            .lock()
            .deals
            .iter()
            .filter(|d| d.time >= from && d.time <= to)
            .cloned()
            .collect())
    }

    async fn history_orders(
        &self,
        from: i64,
        to: i64,
    ) -> Result<Vec<HistoryOrderRecord>, VenueError> {
        Ok(self
            .state
            .lock()
            .orders
            .iter()
            .filter(|o| o.time_done >= from && o.time_done <= to)
            .cloned()
            .collect())
    }

    async fn send(&self, request: TradeRequest) -> Result<TradeResponse, VenueError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(VenueError::Disconnected);
        }
        state.journal.push(request.clone());

        if let Some(code) = state.forced.pop_front() {
            return Ok(TradeResponse::rejected(code));
        }
        Ok(self.execute(&mut state, &request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn venue() -> (PaperVenue, std::sync::Arc<crate::context::SimulatedTimeProvider>) {
        let (ctx, clock) = BridgeContext::new_simulated(1_723_200_000_000);
        (PaperVenue::new(ctx, &PaperConfig::default()), clock)
    }

    fn bar(time: i64, high: Decimal, low: Decimal, close: Decimal) -> BarRecord {
        BarRecord {
            time,
            open: close,
            high,
            low,
            close,
            tick_volume: 1,
            real_volume: 0,
            spread: 30,
        }
    }

    #[tokio::test]
    async fn test_market_buy_opens_position_and_deal() {
        let (venue, _) = venue();
        let mut req = TradeRequest::market("XAUUSD", Side::Buy, dec!(0.10), dec!(2310.42));
        req.deviation = 10;

        let res = venue.send(req).await.unwrap();
        assert!(res.is_done());
        assert_eq!(res.price, dec!(2310.42));

        let positions = venue.positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].ticket, res.order);
        assert_eq!(positions[0].price_current, dec!(2310.12));
        // (2310.12 - 2310.42) * 0.1 * 100
        assert_eq!(positions[0].profit, dec!(-3.00));

        let deals = venue.history_deals(0, i64::MAX).await.unwrap();
        assert_eq!(deals.len(), 1);
        assert_eq!(deals[0].entry, DealEntry::In);
    }

    #[tokio::test]
    async fn test_validation_codes() {
        let (venue, _) = venue();

        let bad_volume = TradeRequest::market("XAUUSD", Side::Buy, dec!(0.015), Decimal::ZERO);
        assert_eq!(venue.send(bad_volume).await.unwrap().retcode, retcode::INVALID_VOLUME);

        let mut tight = TradeRequest::market("XAUUSD", Side::Buy, dec!(0.1), Decimal::ZERO);
        tight.sl = dec!(2310.30);
        assert_eq!(venue.send(tight).await.unwrap().retcode, retcode::INVALID_STOPS);

        let far = TradeRequest::market("XAUUSD", Side::Sell, dec!(0.1), dec!(2300.00));
        assert_eq!(venue.send(far).await.unwrap().retcode, retcode::REQUOTE);

        let huge = TradeRequest::market("XAUUSD", Side::Buy, dec!(100), Decimal::ZERO);
        assert_eq!(venue.send(huge).await.unwrap().retcode, retcode::NO_MONEY);

        venue.force_retcode(retcode::MARKET_CLOSED);
        let ok = TradeRequest::market("XAUUSD", Side::Buy, dec!(0.1), Decimal::ZERO);
        assert_eq!(venue.send(ok).await.unwrap().retcode, retcode::MARKET_CLOSED);

        venue.clear_quote("XAUUSD");
        let no_quote = TradeRequest::market("XAUUSD", Side::Buy, dec!(0.1), Decimal::ZERO);
        assert_eq!(venue.send(no_quote).await.unwrap().retcode, retcode::PRICE_OFF);
        assert!(venue.quote("XAUUSD").await.unwrap().is_none());
        assert_eq!(venue.requests().len(), 6);
    }

    #[tokio::test]
    async fn test_stop_loss_trigger_annotates_exit() {
        let (venue, clock) = venue();
        let mut req = TradeRequest::market("XAUUSD", Side::Buy, dec!(0.10), Decimal::ZERO);
        req.sl = dec!(2300.00);
        req.comment = "breakout".into();
        let opened = venue.send(req).await.unwrap();
        assert!(opened.is_done());

        clock.advance(60_000);
        venue.set_quote("XAUUSD", dec!(2299.80), dec!(2300.10));

        assert!(venue.positions().await.unwrap().is_empty());
        let deals = venue.history_deals(0, i64::MAX).await.unwrap();
        assert_eq!(deals.len(), 2);
        assert_eq!(deals[1].entry, DealEntry::Out);
        assert_eq!(deals[1].comment, "[sl 2300.00]");
        assert_eq!(deals[1].position_id, opened.order);
        // (2299.80 - 2310.42) * 0.1 * 100
        assert_eq!(deals[1].profit, dec!(-106.20));
        assert_eq!(venue.balance(), dec!(9893.80));
    }

    #[tokio::test]
    async fn test_partial_close_keeps_remainder() {
        let (venue, _) = venue();
        let opened = venue
            .send(TradeRequest::market("XAUUSD", Side::Sell, dec!(0.30), Decimal::ZERO))
            .await
            .unwrap();

        let mut close = TradeRequest::market("XAUUSD", Side::Buy, dec!(0.10), Decimal::ZERO);
        close.position = Some(opened.order);
        assert!(venue.send(close).await.unwrap().is_done());

        let pos = venue.position(opened.order).await.unwrap().unwrap();
        assert_eq!(pos.volume, dec!(0.20));
    }

    #[tokio::test]
    async fn test_atr_over_aggregated_bars() {
        let (venue, _) = venue();
        let base = 1_723_190_400; // aligned to 15 minutes
        let bars: Vec<BarRecord> = (0..45)
            .map(|i| bar(base + i * 60, dec!(2311), dec!(2309), dec!(2310)))
            .collect();
        venue.seed_bars("XAUUSD", bars);

        let m15 = venue.bars("XAUUSD", Timeframe::M15, 10).await.unwrap();
        assert_eq!(m15.len(), 3);
        assert_eq!(m15[0].tick_volume, 15);

        let atr = venue.volatility("XAUUSD", Timeframe::M15, 2).await.unwrap();
        assert_eq!(atr, Some(dec!(2)));
        assert_eq!(venue.volatility("XAUUSD", Timeframe::M15, 14).await.unwrap(), None);
    }

    #[test]
    fn test_true_range_uses_previous_close() {
        let bars = vec![
            bar(0, dec!(10), dec!(9), dec!(9)),
            bar(60, dec!(12), dec!(11), dec!(11.5)),
        ];
        // gap up: high - prev close = 3
        assert_eq!(average_true_range(&bars, 1), Some(dec!(3)));
    }
}
