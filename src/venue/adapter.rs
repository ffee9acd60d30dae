use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::model::{
    AccountSnapshot, BarRecord, BookLevel, DealRecord, HistoryOrderRecord, PendingOrderRecord,
    PositionRecord, Side, SymbolSpec, Timeframe,
};

#[derive(Error, Debug)]
pub enum VenueError {
    #[error("Terminal not connected")]
    Disconnected,
    #[error("Unknown symbol: {0}")]
    UnknownSymbol(String),
    #[error("Venue error: {0}")]
    Api(String),
}

/// Terminal trade-server return codes.
pub mod retcode {
    pub const REQUOTE: u32 = 10004;
    pub const REJECT: u32 = 10006;
    pub const DONE: u32 = 10009;
    pub const DONE_PARTIAL: u32 = 10010;
    pub const INVALID: u32 = 10013;
    pub const INVALID_VOLUME: u32 = 10014;
    pub const INVALID_PRICE: u32 = 10015;
    pub const INVALID_STOPS: u32 = 10016;
    pub const MARKET_CLOSED: u32 = 10018;
    pub const NO_MONEY: u32 = 10019;
    pub const PRICE_OFF: u32 = 10021;

    pub fn describe(code: u32) -> &'static str {
        match code {
            REQUOTE => "requote",
            REJECT => "request rejected",
            DONE => "request completed",
            DONE_PARTIAL => "request partially completed",
            INVALID => "invalid request",
            INVALID_VOLUME => "invalid volume",
            INVALID_PRICE => "invalid price",
            INVALID_STOPS => "invalid stops",
            MARKET_CLOSED => "market closed",
            NO_MONEY => "not enough money",
            PRICE_OFF => "no quotes",
            _ => "unknown return code",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Quote {
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
    pub volume: Decimal,
    pub time_msc: i64,
    pub flags: u32,
}

impl Quote {
    pub fn time_secs(&self) -> i64 {
        self.time_msc.div_euclid(1000)
    }

    /// Both sides quoted.
    pub fn is_two_sided(&self) -> bool {
        self.bid > Decimal::ZERO && self.ask > Decimal::ZERO
    }

    /// Price a market order on `side` executes at.
    pub fn entry_price(&self, side: Side) -> Decimal {
        match side {
            Side::Buy => self.ask,
            Side::Sell => self.bid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestAction {
    /// Market deal: opens a position, or closes one when `position` is set.
    Deal,
    /// Protective-level change on an open position.
    SlTp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TradeRequest {
    pub action: RequestAction,
    pub symbol: String,
    pub side: Side,
    pub volume: Decimal,
    pub price: Decimal,
    /// Zero means no level.
    pub sl: Decimal,
    pub tp: Decimal,
    pub deviation: u32,
    pub magic: i64,
    pub comment: String,
    pub position: Option<u64>,
}

impl TradeRequest {
    pub fn market(symbol: &str, side: Side, volume: Decimal, price: Decimal) -> Self {
        Self {
            action: RequestAction::Deal,
            symbol: symbol.to_string(),
            side,
            volume,
            price,
            sl: Decimal::ZERO,
            tp: Decimal::ZERO,
            deviation: 0,
            magic: 0,
            comment: String::new(),
            position: None,
        }
    }

    pub fn sl_tp(position: &PositionRecord, sl: Decimal, tp: Decimal) -> Self {
        Self {
            action: RequestAction::SlTp,
            symbol: position.symbol.clone(),
            side: position.side,
            volume: Decimal::ZERO,
            price: Decimal::ZERO,
            sl,
            tp,
            deviation: 0,
            magic: position.magic,
            comment: String::new(),
            position: Some(position.ticket),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TradeResponse {
    pub retcode: u32,
    pub deal: u64,
    pub order: u64,
    pub price: Decimal,
    pub volume: Decimal,
    pub comment: String,
}

impl TradeResponse {
    pub fn rejected(retcode: u32) -> Self {
        Self {
            retcode,
            deal: 0,
            order: 0,
            price: Decimal::ZERO,
            volume: Decimal::ZERO,
            comment: self::retcode::describe(retcode).to_string(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.retcode == retcode::DONE
    }
}

/// Everything the agent needs from the trading terminal. `Ok(None)` means the venue has
/// nothing to report right now (no quote, no depth, no account); `Err` is a call failure.
#[async_trait]
pub trait Venue: Send + Sync {
    fn name(&self) -> &str;

    async fn is_connected(&self) -> bool;

    async fn symbol_spec(&self, symbol: &str) -> Result<Option<SymbolSpec>, VenueError>;

    async fn quote(&self, symbol: &str) -> Result<Option<Quote>, VenueError>;

    async fn order_book(&self, symbol: &str) -> Result<Option<Vec<BookLevel>>, VenueError>;

    /// Most recent `count` bars, oldest first.
    async fn bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<BarRecord>, VenueError>;

    /// Average true range over `period` bars of `timeframe`.
    async fn volatility(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        period: usize,
    ) -> Result<Option<Decimal>, VenueError>;

    async fn account(&self) -> Result<Option<AccountSnapshot>, VenueError>;

    async fn positions(&self) -> Result<Vec<PositionRecord>, VenueError>;

    async fn position(&self, ticket: u64) -> Result<Option<PositionRecord>, VenueError> {
        Ok(self
            .positions()
            .await?
            .into_iter()
            .find(|p| p.ticket == ticket))
    }

    async fn pending_orders(&self) -> Result<Vec<PendingOrderRecord>, VenueError>;

    /// Deals executed in `[from, to]` (unix seconds).
    async fn history_deals(&self, from: i64, to: i64) -> Result<Vec<DealRecord>, VenueError>;

    /// Orders completed in `[from, to]` (unix seconds).
    async fn history_orders(
        &self,
        from: i64,
        to: i64,
    ) -> Result<Vec<HistoryOrderRecord>, VenueError>;

    async fn send(&self, request: TradeRequest) -> Result<TradeResponse, VenueError>;
}
