use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

pub const DEFAULT_MAGIC_NUMBER: i64 = 12345;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum Timeframe {
    #[default]
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
}

impl Timeframe {
    pub fn seconds(&self) -> i64 {
        match self {
            Timeframe::M1 => 60,
            Timeframe::M5 => 300,
            Timeframe::M15 => 900,
            Timeframe::M30 => 1800,
            Timeframe::H1 => 3600,
            Timeframe::H4 => 14_400,
            Timeframe::D1 => 86_400,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "M1",
            Timeframe::M5 => "M5",
            Timeframe::M15 => "M15",
            Timeframe::M30 => "M30",
            Timeframe::H1 => "H1",
            Timeframe::H4 => "H4",
            Timeframe::D1 => "D1",
        }
    }
}

// --- State snapshots (agent -> controller) ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceSnapshot {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spread: Option<Decimal>,
    #[serde(default)]
    pub volume: u64,
    pub timestamp: i64,
    #[serde(default)]
    pub server_time: String,
}

impl PriceSnapshot {
    pub fn spread(&self) -> Decimal {
        self.spread.unwrap_or(self.ask - self.bid)
    }

    pub fn mid_price(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }

    /// Gold quotes one pip as 0.1, everything else is reported in raw price units.
    pub fn spread_pips(&self) -> Decimal {
        if self.symbol.starts_with("XAUUSD") {
            self.spread() * Decimal::TEN
        } else {
            self.spread()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TickSnapshot {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    #[serde(default)]
    pub last: Decimal,
    #[serde(default)]
    pub volume_real: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spread: Option<Decimal>,
    pub time: i64,
    #[serde(default)]
    pub time_msc: i64,
    #[serde(default)]
    pub flags: u32,
}

impl TickSnapshot {
    /// Spread only exists when both sides of the book are quoted.
    pub fn derive_spread(bid: Decimal, ask: Decimal) -> Option<Decimal> {
        if bid > Decimal::ZERO && ask > Decimal::ZERO {
            Some(ask - bid)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BookSide {
    Buy,
    Sell,
    BuyMarket,
    SellMarket,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BookLevel {
    #[serde(rename = "type")]
    pub side: BookSide,
    pub price: Decimal,
    pub volume: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderBookSnapshot {
    pub symbol: String,
    pub timestamp: i64,
    #[serde(default, deserialize_with = "lenient_list")]
    pub levels: Vec<BookLevel>,
}

impl OrderBookSnapshot {
    pub fn best_bid(&self) -> Option<Decimal> {
        self.levels
            .iter()
            .filter(|l| matches!(l.side, BookSide::Buy | BookSide::BuyMarket))
            .map(|l| l.price)
            .max()
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.levels
            .iter()
            .filter(|l| matches!(l.side, BookSide::Sell | BookSide::SellMarket))
            .map(|l| l.price)
            .min()
    }
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_leverage() -> u32 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountSnapshot {
    #[serde(default)]
    pub login: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub company: String,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    #[serde(default)]
    pub trade_mode: i32,
    pub balance: Decimal,
    pub equity: Decimal,
    #[serde(default)]
    pub margin: Decimal,
    pub free_margin: Decimal,
    pub profit: Decimal,
    #[serde(default)]
    pub credit: Decimal,
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub ping_ms: u64,
    #[serde(default)]
    pub build: u32,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub server_time: String,
}

impl AccountSnapshot {
    pub fn margin_level(&self) -> Decimal {
        if self.margin <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.equity / self.margin * Decimal::ONE_HUNDRED
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PositionRecord {
    pub ticket: u64,
    pub symbol: String,
    #[serde(rename = "type")]
    pub side: Side,
    pub volume: Decimal,
    pub price_open: Decimal,
    pub price_current: Decimal,
    #[serde(default)]
    pub sl: Decimal,
    #[serde(default)]
    pub tp: Decimal,
    pub profit: Decimal,
    #[serde(default)]
    pub swap: Decimal,
    #[serde(default)]
    pub magic: i64,
    #[serde(default)]
    pub comment: String,
    pub time_open: String,
    pub time_open_timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingOrderRecord {
    pub ticket: u64,
    pub symbol: String,
    #[serde(rename = "type")]
    pub order_type: i32,
    pub price_open: Decimal,
    #[serde(default)]
    pub sl: Decimal,
    #[serde(default)]
    pub tp: Decimal,
    pub volume_current: Decimal,
    #[serde(default)]
    pub time_setup: i64,
    #[serde(default)]
    pub time_expiration: i64,
    #[serde(default)]
    pub magic: i64,
    #[serde(default)]
    pub comment: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClosedTradeRecord {
    pub ticket: u64,
    pub symbol: String,
    #[serde(rename = "type")]
    pub side: Side,
    pub volume: Decimal,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    #[serde(default)]
    pub sl: Decimal,
    #[serde(default)]
    pub tp: Decimal,
    pub profit: Decimal,
    pub change_percent: Decimal,
    #[serde(default)]
    pub comment: String,
    pub close_time: String,
    pub close_timestamp: i64,
}

impl ClosedTradeRecord {
    pub fn formatted_profit(&self) -> String {
        if self.profit >= Decimal::ZERO {
            format!("${:.2}", self.profit)
        } else {
            format!("-${:.2}", self.profit.abs())
        }
    }

    pub fn formatted_change(&self) -> String {
        if self.change_percent >= Decimal::ZERO {
            format!("+{:.2}%", self.change_percent)
        } else {
            format!("{:.2}%", self.change_percent)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SymbolSpec {
    pub symbol: String,
    pub digits: u32,
    pub point: Decimal,
    #[serde(default)]
    pub contract_size: Decimal,
    pub volume_min: Decimal,
    pub volume_max: Decimal,
    pub volume_step: Decimal,
    #[serde(default)]
    pub tick_size: Decimal,
    #[serde(default)]
    pub tick_value: Decimal,
    #[serde(default)]
    pub stops_level: u32,
    #[serde(default)]
    pub freeze_level: u32,
    #[serde(default)]
    pub swap_type: i32,
    #[serde(default)]
    pub swap_long: Decimal,
    #[serde(default)]
    pub swap_short: Decimal,
    #[serde(default)]
    pub trade_mode: i32,
}

impl SymbolSpec {
    /// Minimum distance between an order price and its protective levels.
    pub fn min_stop_distance(&self) -> Decimal {
        self.point * Decimal::from(self.stops_level)
    }

    pub fn price_grid(&self) -> Decimal {
        if self.tick_size > Decimal::ZERO {
            self.tick_size
        } else {
            self.point
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BarRecord {
    pub time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    #[serde(default)]
    pub tick_volume: u64,
    #[serde(default)]
    pub real_volume: u64,
    #[serde(default)]
    pub spread: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RatesSnapshot {
    pub symbol: String,
    pub timeframe: Timeframe,
    #[serde(deserialize_with = "lenient_list")]
    pub bars: Vec<BarRecord>,
}

// --- Collection envelopes ---

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PositionsFile {
    #[serde(deserialize_with = "lenient_list")]
    pub positions: Vec<PositionRecord>,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OrdersFile {
    #[serde(deserialize_with = "lenient_list")]
    pub orders: Vec<PendingOrderRecord>,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClosedTradesFile {
    #[serde(deserialize_with = "lenient_list")]
    pub trades: Vec<ClosedTradeRecord>,
    #[serde(default)]
    pub timestamp: i64,
}

/// Decodes an array element by element, dropping entries that do not match the schema
/// instead of rejecting the whole file.
fn lenient_list<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let raw = Vec::<serde_json::Value>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<T>(item) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!(error = %e, "Skipping malformed record");
                None
            }
        })
        .collect())
}

// --- Venue history (reconciler input) ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DealKind {
    Buy,
    Sell,
    Balance,
    Credit,
    Other,
}

impl DealKind {
    pub fn side(&self) -> Option<Side> {
        match self {
            DealKind::Buy => Some(Side::Buy),
            DealKind::Sell => Some(Side::Sell),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DealEntry {
    In,
    Out,
    InOut,
    OutBy,
}

impl DealEntry {
    pub fn is_exit(&self) -> bool {
        matches!(self, DealEntry::Out | DealEntry::OutBy)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DealRecord {
    pub ticket: u64,
    pub order: u64,
    pub position_id: u64,
    pub symbol: String,
    pub kind: DealKind,
    pub entry: DealEntry,
    pub volume: Decimal,
    pub price: Decimal,
    pub profit: Decimal,
    pub swap: Decimal,
    pub commission: Decimal,
    pub sl: Decimal,
    pub tp: Decimal,
    pub time: i64,
    pub comment: String,
    pub magic: i64,
}

impl DealRecord {
    pub fn net(&self) -> Decimal {
        self.profit + self.swap + self.commission
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryOrderRecord {
    pub ticket: u64,
    pub position_id: u64,
    pub symbol: String,
    pub order_type: i32,
    pub price: Decimal,
    pub sl: Decimal,
    pub tp: Decimal,
    pub time_setup: i64,
    pub time_done: i64,
    pub comment: String,
    pub magic: i64,
}

// --- Command slot (controller -> agent) ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TradeAction {
    Buy,
    Sell,
    Modify,
    Close,
}

impl TradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Buy => "buy",
            TradeAction::Sell => "sell",
            TradeAction::Modify => "modify",
            TradeAction::Close => "close",
        }
    }

    pub fn side(&self) -> Option<Side> {
        match self {
            TradeAction::Buy => Some(Side::Buy),
            TradeAction::Sell => Some(Side::Sell),
            _ => None,
        }
    }

    pub fn targets_position(&self) -> bool {
        matches!(self, TradeAction::Modify | TradeAction::Close)
    }
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single pending command. Unknown keys in the file are ignored; zero, `null` and
/// missing values all mean "unset" for the optional levels, ticket and close volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradeCommand {
    pub action: TradeAction,
    #[serde(default)]
    pub symbol: String,
    #[serde(default, deserialize_with = "lenient::decimal")]
    pub lot_size: Decimal,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient::unset_decimal"
    )]
    pub stop_loss: Option<Decimal>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient::unset_decimal"
    )]
    pub take_profit: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient::string")]
    pub comment: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient::integer"
    )]
    pub magic_number: Option<i64>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient::trade_id"
    )]
    pub trade_id: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient::ticket"
    )]
    pub ticket: Option<u64>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient::unset_decimal"
    )]
    pub close_volume: Option<Decimal>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient::integer"
    )]
    pub timestamp: Option<i64>,
}

impl TradeCommand {
    pub fn new(action: TradeAction, symbol: impl Into<String>, lot_size: Decimal) -> Self {
        Self {
            action,
            symbol: symbol.into(),
            lot_size,
            stop_loss: None,
            take_profit: None,
            comment: String::new(),
            magic_number: None,
            trade_id: None,
            ticket: None,
            close_volume: None,
            timestamp: None,
        }
    }

    pub fn for_position(action: TradeAction, ticket: u64) -> Self {
        let mut cmd = Self::new(action, "", Decimal::ZERO);
        cmd.ticket = Some(ticket);
        cmd
    }
}

mod lenient {
    use rust_decimal::Decimal;
    use serde::{Deserialize, Deserializer};
    use std::str::FromStr;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Int(i64),
        Float(f64),
        Text(String),
    }

    fn scalar_decimal<E: serde::de::Error>(scalar: Scalar) -> Result<Decimal, E> {
        match scalar {
            Scalar::Int(v) => Ok(Decimal::from(v)),
            Scalar::Float(v) => Decimal::from_str(&v.to_string())
                .map_err(|_| E::custom(format!("invalid number {}", v))),
            Scalar::Text(s) if s.trim().is_empty() => Ok(Decimal::ZERO),
            Scalar::Text(s) => Decimal::from_str(s.trim())
                .map_err(|_| E::custom(format!("invalid number '{}'", s))),
        }
    }

    pub fn decimal<'de, D: Deserializer<'de>>(d: D) -> Result<Decimal, D::Error> {
        match Option::<Scalar>::deserialize(d)? {
            Some(s) => scalar_decimal(s),
            None => Ok(Decimal::ZERO),
        }
    }

    pub fn unset_decimal<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Decimal>, D::Error> {
        let value = decimal(d)?;
        Ok(if value.is_zero() { None } else { Some(value) })
    }

    pub fn integer<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
        match Option::<Scalar>::deserialize(d)? {
            Some(Scalar::Int(v)) => Ok(Some(v)),
            Some(Scalar::Float(v)) if v.fract() == 0.0 => Ok(Some(v as i64)),
            Some(Scalar::Text(s)) if s.trim().is_empty() => Ok(None),
            Some(Scalar::Text(s)) => s
                .trim()
                .parse::<i64>()
                .map(Some)
                .map_err(|_| serde::de::Error::custom(format!("invalid integer '{}'", s))),
            Some(Scalar::Float(v)) => Err(serde::de::Error::custom(format!(
                "expected integer, got {}",
                v
            ))),
            None => Ok(None),
        }
    }

    pub fn ticket<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
        match integer(d)? {
            Some(v) if v > 0 => Ok(Some(v as u64)),
            Some(v) if v < 0 => Err(serde::de::Error::custom(format!("invalid ticket {}", v))),
            _ => Ok(None),
        }
    }

    pub fn string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        Ok(match Option::<Scalar>::deserialize(d)? {
            Some(Scalar::Text(s)) => s,
            Some(Scalar::Int(v)) => v.to_string(),
            Some(Scalar::Float(v)) => v.to_string(),
            None => String::new(),
        })
    }

    pub fn trade_id<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        let s = string(d)?;
        let trimmed = s.trim();
        Ok(if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        })
    }
}

// --- Result log (agent -> controller) ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TradeOutcome {
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAIL")]
    Fail,
}

impl TradeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeOutcome::Success => "SUCCESS",
            TradeOutcome::Fail => "FAIL",
        }
    }
}

impl fmt::Display for TradeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "SUCCESS" => Ok(TradeOutcome::Success),
            "FAIL" => Ok(TradeOutcome::Fail),
            other => Err(format!("unknown outcome '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResultQualifier {
    Ticket(u64),
    Volume(Decimal),
    Raw(String),
}

impl fmt::Display for ResultQualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultQualifier::Ticket(t) => write!(f, "ticket:{}", t),
            ResultQualifier::Volume(v) => write!(f, "{:.2}", v),
            ResultQualifier::Raw(s) => f.write_str(s),
        }
    }
}

impl ResultQualifier {
    pub fn parse(field: &str) -> Self {
        let field = field.trim();
        if let Some(rest) = field.strip_prefix("ticket:") {
            if let Ok(ticket) = rest.trim().parse::<u64>() {
                return ResultQualifier::Ticket(ticket);
            }
        }
        match Decimal::from_str(field) {
            Ok(v) => ResultQualifier::Volume(v),
            Err(_) => ResultQualifier::Raw(field.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeResultRecord {
    pub timestamp: String,
    pub action: String,
    pub outcome: TradeOutcome,
    pub qualifier: ResultQualifier,
    pub symbol: String,
    pub trade_id: String,
}

impl TradeResultRecord {
    pub fn is_success(&self) -> bool {
        self.outcome == TradeOutcome::Success
    }

    pub fn ticket(&self) -> Option<u64> {
        match self.qualifier {
            ResultQualifier::Ticket(t) => Some(t),
            _ => None,
        }
    }

    pub fn to_line(&self) -> String {
        format!(
            "{} | {} | {} | {} | {} | {}",
            self.timestamp, self.action, self.outcome, self.qualifier, self.symbol, self.trade_id
        )
    }
}

// --- Time formatting shared by both sides ---

pub const SERVER_TIME_FORMAT: &str = "%Y.%m.%d %H:%M:%S";
pub const RESULT_LOG_TIME_FORMAT: &str = "%Y.%m.%d %H:%M";

pub fn format_unix(ts: i64, fmt: &str) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format(fmt).to_string())
        .unwrap_or_default()
}

pub fn format_server_time(ts: i64) -> String {
    format_unix(ts, SERVER_TIME_FORMAT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn command_treats_zero_and_null_as_unset() {
        let cmd: TradeCommand = serde_json::from_value(json!({
            "action": "buy",
            "symbol": "XAUUSD",
            "lot_size": 0.1,
            "stop_loss": 0,
            "take_profit": null,
            "trade_id": "",
            "ticket": 0,
            "unexpected": {"nested": true}
        }))
        .unwrap();

        assert_eq!(cmd.lot_size, dec!(0.1));
        assert_eq!(cmd.stop_loss, None);
        assert_eq!(cmd.take_profit, None);
        assert_eq!(cmd.trade_id, None);
        assert_eq!(cmd.ticket, None);
    }

    #[test]
    fn command_accepts_numeric_strings() {
        let cmd: TradeCommand = serde_json::from_value(json!({
            "action": "close",
            "ticket": "123456789",
            "close_volume": "0.1"
        }))
        .unwrap();

        assert_eq!(cmd.ticket, Some(123456789));
        assert_eq!(cmd.close_volume, Some(dec!(0.1)));
        assert!(cmd.symbol.is_empty());
    }

    #[test]
    fn command_rejects_unknown_action() {
        let res = serde_json::from_value::<TradeCommand>(json!({"action": "hedge"}));
        assert!(res.is_err());
    }

    #[test]
    fn positions_file_skips_bad_entries() {
        let file: PositionsFile = serde_json::from_value(json!({
            "positions": [
                {"ticket": 1, "symbol": "XAUUSD", "type": "buy", "volume": 0.1,
                 "price_open": 2300.5, "price_current": 2301.0, "profit": 5.0,
                 "time_open": "2024.08.09 10:00:00", "time_open_timestamp": 1723197600},
                {"ticket": 2, "symbol": "XAUUSD"}
            ]
        }))
        .unwrap();

        assert_eq!(file.positions.len(), 1);
        assert_eq!(file.positions[0].sl, Decimal::ZERO);
    }

    #[test]
    fn qualifier_parses_ticket_and_volume() {
        assert_eq!(ResultQualifier::parse("ticket:42"), ResultQualifier::Ticket(42));
        assert_eq!(ResultQualifier::parse(" 0.10 "), ResultQualifier::Volume(dec!(0.10)));
        assert_eq!(
            ResultQualifier::parse("n/a"),
            ResultQualifier::Raw("n/a".to_string())
        );
        assert_eq!(ResultQualifier::Volume(dec!(0.1)).to_string(), "0.10");
    }

    #[test]
    fn gold_spread_is_reported_in_pips() {
        let price = PriceSnapshot {
            symbol: "XAUUSD!".into(),
            bid: dec!(2310.12),
            ask: dec!(2310.42),
            spread: None,
            volume: 0,
            timestamp: 1723200000,
            server_time: String::new(),
        };
        assert_eq!(price.spread(), dec!(0.30));
        assert_eq!(price.spread_pips(), dec!(3.00));
        assert_eq!(price.mid_price(), dec!(2310.27));
    }

    #[test]
    fn account_margin_level_is_equity_over_margin() {
        let mut account: AccountSnapshot = serde_json::from_value(json!({
            "balance": 10000.0,
            "equity": 10500.0,
            "margin": 2100.0,
            "free_margin": 8400.0,
            "profit": 500.0
        }))
        .unwrap();
        assert_eq!(account.margin_level(), dec!(500));

        account.margin = Decimal::ZERO;
        assert_eq!(account.margin_level(), Decimal::ZERO);
    }

    #[test]
    fn order_book_best_levels_ignore_the_other_side() {
        let book: OrderBookSnapshot = serde_json::from_value(json!({
            "symbol": "XAUUSD",
            "timestamp": 1723200000,
            "levels": [
                {"type": "sell", "price": 2310.62, "volume": 1.0},
                {"type": "sell", "price": 2310.42, "volume": 2.0},
                {"type": "buy", "price": 2310.12, "volume": 2.0},
                {"type": "buy_market", "price": 2309.92, "volume": 1.0}
            ]
        }))
        .unwrap();
        assert_eq!(book.best_bid(), Some(dec!(2310.12)));
        assert_eq!(book.best_ask(), Some(dec!(2310.42)));

        let empty = OrderBookSnapshot {
            levels: vec![],
            ..book
        };
        assert_eq!(empty.best_bid(), None);
    }

    #[test]
    fn closed_trade_formats_signed_profit_and_change() {
        let mut trade: ClosedTradeRecord = serde_json::from_value(json!({
            "ticket": 9,
            "symbol": "XAUUSD",
            "type": "buy",
            "volume": 0.1,
            "entry_price": 2310.42,
            "exit_price": 2312.0,
            "profit": 15.8,
            "change_percent": 0.0684,
            "close_time": "2024.08.09 10:45:00",
            "close_timestamp": 1723200300
        }))
        .unwrap();
        assert_eq!(trade.formatted_profit(), "$15.80");
        assert_eq!(trade.formatted_change(), "+0.07%");

        trade.profit = dec!(-12.5);
        trade.change_percent = dec!(-0.5);
        assert_eq!(trade.formatted_profit(), "-$12.50");
        assert_eq!(trade.formatted_change(), "-0.50%");
    }
}
