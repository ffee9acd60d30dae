use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::ProtectionConfig;
use crate::model::{
    ResultQualifier, Side, SymbolSpec, TradeAction, TradeCommand, TradeOutcome,
    TradeResultRecord,
};
use crate::venue::adapter::{Quote, TradeRequest, TradeResponse, Venue, retcode};

/// Outcome of one processed command, before it is rendered into a result-log row.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub action: TradeAction,
    pub outcome: TradeOutcome,
    pub qualifier: ResultQualifier,
    pub symbol: String,
    pub trade_id: String,
    /// Venue return code, absent when nothing was submitted or the call itself failed.
    pub retcode: Option<u32>,
    /// Position (buy/sell) or target ticket (modify/close).
    pub ticket: Option<u64>,
    pub message: String,
}

impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        self.outcome == TradeOutcome::Success
    }

    pub fn to_record(&self, timestamp: String) -> TradeResultRecord {
        TradeResultRecord {
            timestamp,
            action: self.action.as_str().to_string(),
            outcome: self.outcome,
            qualifier: self.qualifier.clone(),
            symbol: self.symbol.clone(),
            trade_id: self.trade_id.clone(),
        }
    }
}

/// Volume actually sent for a close: the requested part (or everything when unset),
/// clamped to the symbol limits, floored to the volume step and never above what is open.
/// `None` means there is nothing valid to send.
pub fn close_volume(requested: Option<Decimal>, full: Decimal, spec: &SymbolSpec) -> Option<Decimal> {
    let mut volume = match requested {
        Some(r) if r > Decimal::ZERO => r.min(full),
        _ => full,
    };
    volume = volume.max(spec.volume_min).min(spec.volume_max);
    volume = floor_to(volume, spec.volume_step).min(full);

    let on_grid = spec.volume_step <= Decimal::ZERO || (volume % spec.volume_step).is_zero();
    if volume <= Decimal::ZERO || volume < spec.volume_min || !on_grid {
        return None;
    }
    Some(volume)
}

fn floor_to(value: Decimal, grid: Decimal) -> Decimal {
    if grid <= Decimal::ZERO {
        return value;
    }
    (value / grid).floor() * grid
}

fn ceil_to(value: Decimal, grid: Decimal) -> Decimal {
    if grid <= Decimal::ZERO {
        return value;
    }
    (value / grid).ceil() * grid
}

/// Pushes a protective level out to the minimum stop distance on its correct side of
/// `price`, then snaps it to the tick grid away from the price.
pub fn clamp_level(level: Decimal, price: Decimal, side: Side, is_stop_loss: bool, spec: &SymbolSpec) -> Decimal {
    let dist = spec.min_stop_distance();
    let grid = spec.price_grid();
    let below = matches!((side, is_stop_loss), (Side::Buy, true) | (Side::Sell, false));

    let snapped = if below {
        floor_to(level.min(price - dist), grid)
    } else {
        ceil_to(level.max(price + dist), grid)
    };
    snapped.round_dp(spec.digits)
}

/// Derives stop-loss and take-profit from volatility. Both levels are derived together;
/// callers replace any level that was supplied.
pub fn derive_protection(
    policy: &ProtectionConfig,
    side: Side,
    price: Decimal,
    volatility: Decimal,
) -> (Decimal, Decimal) {
    let sl_distance = volatility * policy.sl_multiplier;
    let tp_distance = match policy.reward_ratio {
        Some(ratio) => sl_distance * ratio,
        None => volatility * policy.tp_multiplier,
    };
    match side {
        Side::Buy => (price - sl_distance, price + tp_distance),
        Side::Sell => (price + sl_distance, price - tp_distance),
    }
}

/// Turns commands into venue requests. Never returns an error: every failure becomes a
/// FAIL report.
pub struct TradeExecutor {
    venue: Arc<dyn Venue>,
    protection: ProtectionConfig,
    deviation: u32,
    default_magic: i64,
}

impl TradeExecutor {
    pub fn new(venue: Arc<dyn Venue>, protection: ProtectionConfig, deviation: u32, default_magic: i64) -> Self {
        info!(
            venue = venue.name(),
            protection = protection.enabled,
            deviation,
            "TradeExecutor initialized"
        );
        Self {
            venue,
            protection,
            deviation,
            default_magic,
        }
    }

    pub async fn execute(&self, cmd: &TradeCommand, trade_id: &str) -> ExecutionReport {
        match cmd.action {
            TradeAction::Buy | TradeAction::Sell => self.open(cmd, trade_id).await,
            TradeAction::Modify => self.modify(cmd, trade_id).await,
            TradeAction::Close => self.close(cmd, trade_id).await,
        }
    }

    fn report(
        cmd: &TradeCommand,
        trade_id: &str,
        symbol: &str,
        qualifier: ResultQualifier,
    ) -> ExecutionReport {
        ExecutionReport {
            action: cmd.action,
            outcome: TradeOutcome::Fail,
            qualifier,
            symbol: symbol.to_string(),
            trade_id: trade_id.to_string(),
            retcode: None,
            ticket: cmd.ticket,
            message: String::new(),
        }
    }

    fn fail(mut report: ExecutionReport, message: impl Into<String>) -> ExecutionReport {
        report.message = message.into();
        warn!(
            action = %report.action,
            symbol = %report.symbol,
            trade_id = %report.trade_id,
            reason = %report.message,
            "❌ Command failed before submission"
        );
        report
    }

    async fn submit(&self, mut report: ExecutionReport, request: TradeRequest) -> ExecutionReport {
        match self.venue.send(request).await {
            Ok(response) => Self::apply_response(report, &response),
            Err(e) => {
                error!(
                    action = %report.action,
                    trade_id = %report.trade_id,
                    error = %e,
                    "❌ Venue call failed"
                );
                report.message = e.to_string();
                report
            }
        }
    }

    fn apply_response(mut report: ExecutionReport, response: &TradeResponse) -> ExecutionReport {
        report.retcode = Some(response.retcode);
        report.message = response.comment.clone();
        if response.is_done() {
            report.outcome = TradeOutcome::Success;
            if report.ticket.is_none() && response.order > 0 {
                report.ticket = Some(response.order);
            }
            info!(
                action = %report.action,
                symbol = %report.symbol,
                trade_id = %report.trade_id,
                retcode = response.retcode,
                price = %response.price,
                "✅ Command executed"
            );
        } else {
            warn!(
                action = %report.action,
                symbol = %report.symbol,
                trade_id = %report.trade_id,
                retcode = response.retcode,
                reason = retcode::describe(response.retcode),
                "❌ Venue rejected request"
            );
        }
        report
    }

    async fn quote(&self, symbol: &str) -> Option<Quote> {
        match self.venue.quote(symbol).await {
            Ok(Some(q)) if q.is_two_sided() => Some(q),
            Ok(_) => None,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "Quote unavailable");
                None
            }
        }
    }

    async fn spec(&self, symbol: &str) -> Option<SymbolSpec> {
        match self.venue.symbol_spec(symbol).await {
            Ok(spec) => spec,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "Symbol spec unavailable");
                None
            }
        }
    }

    async fn open(&self, cmd: &TradeCommand, trade_id: &str) -> ExecutionReport {
        let symbol = cmd.symbol.trim();
        let mut report = Self::report(cmd, trade_id, symbol, ResultQualifier::Volume(cmd.lot_size));
        report.ticket = None;

        let side = match cmd.action.side() {
            Some(s) => s,
            None => return Self::fail(report, "not an opening action"),
        };
        if cmd.lot_size <= Decimal::ZERO {
            return Self::fail(report, "lot size must be positive");
        }
        let spec = match self.spec(symbol).await {
            Some(s) => s,
            None => return Self::fail(report, "unknown symbol"),
        };
        let quote = match self.quote(symbol).await {
            Some(q) => q,
            None => return Self::fail(report, "no quote"),
        };
        let price = quote.entry_price(side);

        let (mut sl, mut tp) = (cmd.stop_loss, cmd.take_profit);
        if self.protection.enabled && (sl.is_none() || tp.is_none()) {
            match self
                .venue
                .volatility(symbol, self.protection.timeframe, self.protection.period)
                .await
            {
                Ok(Some(vol)) if vol > Decimal::ZERO => {
                    let (derived_sl, derived_tp) = derive_protection(&self.protection, side, price, vol);
                    debug!(
                        symbol = %symbol,
                        volatility = %vol,
                        sl = %derived_sl,
                        tp = %derived_tp,
                        "Protection derived"
                    );
                    (sl, tp) = (Some(derived_sl), Some(derived_tp));
                }
                Ok(_) => warn!(symbol = %symbol, "No volatility reading, protection not derived"),
                Err(e) => warn!(symbol = %symbol, error = %e, "Volatility query failed"),
            }
        }
        let sl = sl.map(|l| clamp_level(l, price, side, true, &spec));
        let tp = tp.map(|l| clamp_level(l, price, side, false, &spec));

        let mut request = TradeRequest::market(symbol, side, cmd.lot_size, price);
        request.sl = sl.unwrap_or(Decimal::ZERO);
        request.tp = tp.unwrap_or(Decimal::ZERO);
        request.deviation = self.deviation;
        request.magic = cmd.magic_number.unwrap_or(self.default_magic);
        request.comment = cmd.comment.clone();

        info!(
            action = %cmd.action,
            symbol = %symbol,
            volume = %cmd.lot_size,
            price = %price,
            sl = %request.sl,
            tp = %request.tp,
            trade_id = %trade_id,
            "📨 Submitting market order"
        );
        report.message.clear();
        self.submit(report, request).await
    }

    async fn modify(&self, cmd: &TradeCommand, trade_id: &str) -> ExecutionReport {
        let ticket = cmd.ticket.unwrap_or(0);
        let report = Self::report(cmd, trade_id, &cmd.symbol, ResultQualifier::Ticket(ticket));

        let position = match self.venue.position(ticket).await {
            Ok(Some(p)) => p,
            Ok(None) => return Self::fail(report, "position not found"),
            Err(e) => return Self::fail(report, e.to_string()),
        };
        let mut report = report;
        report.symbol = position.symbol.clone();

        let digits = self.spec(&position.symbol).await.map(|s| s.digits);
        let normalize = |v: Decimal| digits.map(|d| v.round_dp(d)).unwrap_or(v);
        let sl = normalize(cmd.stop_loss.unwrap_or(position.sl));
        let tp = normalize(cmd.take_profit.unwrap_or(position.tp));

        info!(ticket, sl = %sl, tp = %tp, trade_id = %trade_id, "📨 Submitting sl/tp change");
        self.submit(report, TradeRequest::sl_tp(&position, sl, tp)).await
    }

    async fn close(&self, cmd: &TradeCommand, trade_id: &str) -> ExecutionReport {
        let ticket = cmd.ticket.unwrap_or(0);
        let report = Self::report(cmd, trade_id, &cmd.symbol, ResultQualifier::Ticket(ticket));

        let position = match self.venue.position(ticket).await {
            Ok(Some(p)) => p,
            Ok(None) => return Self::fail(report, "position not found"),
            Err(e) => return Self::fail(report, e.to_string()),
        };
        let mut report = report;
        report.symbol = position.symbol.clone();

        let spec = match self.spec(&position.symbol).await {
            Some(s) => s,
            None => return Self::fail(report, "unknown symbol"),
        };
        let volume = match close_volume(cmd.close_volume, position.volume, &spec) {
            Some(v) => v,
            None => return Self::fail(report, "no volume to close"),
        };
        let quote = match self.quote(&position.symbol).await {
            Some(q) => q,
            None => return Self::fail(report, "no quote"),
        };

        let exit_side = position.side.opposite();
        let mut request = TradeRequest::market(&position.symbol, exit_side, volume, quote.entry_price(exit_side));
        request.position = Some(ticket);
        request.deviation = self.deviation;
        request.magic = position.magic;
        request.comment = cmd.comment.clone();

        info!(ticket, volume = %volume, full = %position.volume, trade_id = %trade_id, "📨 Submitting close");
        self.submit(report, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PaperConfig;
    use crate::context::BridgeContext;
    use crate::model::{BarRecord, Timeframe};
    use crate::venue::PaperVenue;
    use crate::venue::adapter::RequestAction;
    use rust_decimal_macros::dec;

    fn gold() -> SymbolSpec {
        SymbolSpec {
            symbol: "XAUUSD".into(),
            digits: 2,
            point: dec!(0.01),
            contract_size: dec!(100),
            volume_min: dec!(0.01),
            volume_max: dec!(100),
            volume_step: dec!(0.01),
            tick_size: dec!(0.01),
            tick_value: dec!(1),
            stops_level: 50,
            freeze_level: 0,
            swap_type: 1,
            swap_long: Decimal::ZERO,
            swap_short: Decimal::ZERO,
            trade_mode: 4,
        }
    }

    #[test]
    fn test_close_volume_rules() {
        let spec = gold();
        assert_eq!(close_volume(Some(dec!(0.1)), dec!(0.3), &spec), Some(dec!(0.10)));
        assert_eq!(close_volume(Some(dec!(0.1)), dec!(0.05), &spec), Some(dec!(0.05)));
        assert_eq!(close_volume(Some(dec!(0.5)), dec!(0.3), &spec), Some(dec!(0.3)));
        assert_eq!(close_volume(None, dec!(0.3), &spec), Some(dec!(0.3)));
        assert_eq!(close_volume(Some(dec!(0.127)), dec!(0.3), &spec), Some(dec!(0.12)));
        assert_eq!(close_volume(None, Decimal::ZERO, &spec), None);
    }

    #[test]
    fn test_close_volume_below_minimum_is_not_sent() {
        let spec = gold();
        assert_eq!(close_volume(None, dec!(0.005), &spec), None);
        assert_eq!(close_volume(Some(dec!(0.01)), dec!(0.005), &spec), None);
        // Off-grid remainder larger than the step still floors onto the grid.
        assert_eq!(close_volume(None, dec!(0.015), &spec), Some(dec!(0.01)));

        let coarse = SymbolSpec {
            volume_min: dec!(0.1),
            volume_step: dec!(0.1),
            ..gold()
        };
        assert_eq!(close_volume(None, dec!(0.15), &coarse), Some(dec!(0.1)));
        assert_eq!(close_volume(None, dec!(0.05), &coarse), None);
    }

    #[test]
    fn test_clamp_pushes_levels_out_to_stop_distance() {
        let spec = gold();
        let price = dec!(2310.42);

        // Buy sl too close is pushed down to price - 0.50
        assert_eq!(clamp_level(dec!(2310.30), price, Side::Buy, true, &spec), dec!(2309.92));
        // Buy tp on the wrong side is pushed up
        assert_eq!(clamp_level(dec!(2300.00), price, Side::Buy, false, &spec), dec!(2310.92));
        // Far levels only snap to the grid, away from price
        assert_eq!(clamp_level(dec!(2305.123), price, Side::Buy, true, &spec), dec!(2305.12));
        assert_eq!(clamp_level(dec!(2320.001), price, Side::Buy, false, &spec), dec!(2320.01));
        assert_eq!(clamp_level(dec!(2320.001), price, Side::Sell, true, &spec), dec!(2320.01));
        assert_eq!(clamp_level(dec!(2300.009), price, Side::Sell, false, &spec), dec!(2300.00));
    }

    #[test]
    fn test_derived_levels_sit_on_loss_and_profit_sides() {
        let policy = ProtectionConfig {
            enabled: true,
            timeframe: Timeframe::M15,
            period: 14,
            sl_multiplier: dec!(1.5),
            tp_multiplier: dec!(3),
            reward_ratio: None,
        };
        let price = dec!(2310);

        let (sl, tp) = derive_protection(&policy, Side::Buy, price, dec!(2));
        assert_eq!(sl, dec!(2307));
        assert_eq!(tp, dec!(2316));

        let (sl, tp) = derive_protection(&policy, Side::Sell, price, dec!(2));
        assert_eq!(sl, dec!(2313));
        assert_eq!(tp, dec!(2304));

        let ratio = ProtectionConfig {
            reward_ratio: Some(dec!(2)),
            ..policy
        };
        let (_, tp) = derive_protection(&ratio, Side::Buy, price, dec!(2));
        assert_eq!(tp, dec!(2316));
    }

    fn executor(protection: ProtectionConfig) -> (TradeExecutor, Arc<PaperVenue>) {
        let (ctx, _clock) = BridgeContext::new_simulated(1_723_200_000_000);
        let paper = Arc::new(PaperVenue::new(ctx, &PaperConfig::default()));
        let executor = TradeExecutor::new(paper.clone(), protection, 20, 12345);
        (executor, paper)
    }

    fn protection_off() -> ProtectionConfig {
        ProtectionConfig {
            enabled: false,
            ..ProtectionConfig::default()
        }
    }

    fn flat_bar(time: i64) -> BarRecord {
        BarRecord {
            time,
            open: dec!(2310.10),
            high: dec!(2310.15),
            low: dec!(2310.05),
            close: dec!(2310.10),
            tick_volume: 1,
            real_volume: 0,
            spread: 30,
        }
    }

    #[tokio::test]
    async fn test_open_derives_and_clamps_protection_from_volatility() {
        let policy = ProtectionConfig {
            enabled: true,
            timeframe: Timeframe::M15,
            period: 2,
            ..ProtectionConfig::default()
        };
        let (executor, paper) = executor(policy);
        // One bar per M15 bucket, each with a 0.10 true range.
        let start = 1_723_200_000 - 2_700;
        paper.seed_bars("XAUUSD", (0..3).map(|i| flat_bar(start + i * 900)).collect());

        // A supplied take-profit is replaced once the stop-loss has to be derived.
        let mut cmd = TradeCommand::new(TradeAction::Buy, "XAUUSD", dec!(0.10));
        cmd.take_profit = Some(dec!(2400));
        let report = executor.execute(&cmd, "p-1").await;

        assert!(report.is_success(), "{:?}", report);
        let request = paper.requests().pop().unwrap();
        // ask 2310.42 - 1.5 * 0.10 = 2310.27, pushed out to the 0.20 stop distance
        assert_eq!(request.sl, dec!(2310.22));
        // ask 2310.42 + 3 * 0.10
        assert_eq!(request.tp, dec!(2310.72));
    }

    #[tokio::test]
    async fn test_open_without_volatility_keeps_supplied_levels() {
        let (executor, paper) = executor(ProtectionConfig::default());

        let mut cmd = TradeCommand::new(TradeAction::Sell, "XAUUSD", dec!(0.05));
        cmd.take_profit = Some(dec!(2290));
        assert!(executor.execute(&cmd, "p-2").await.is_success());

        let request = paper.requests().pop().unwrap();
        assert_eq!(request.sl, Decimal::ZERO);
        assert_eq!(request.tp, dec!(2290));
    }

    #[tokio::test]
    async fn test_non_done_retcode_is_fail() {
        let (executor, paper) = executor(protection_off());
        paper.force_retcode(retcode::DONE_PARTIAL);

        let cmd = TradeCommand::new(TradeAction::Buy, "XAUUSD", dec!(0.10));
        let report = executor.execute(&cmd, "r-1").await;

        assert_eq!(report.outcome, TradeOutcome::Fail);
        assert_eq!(report.retcode, Some(retcode::DONE_PARTIAL));
        assert_eq!(report.qualifier, ResultQualifier::Volume(dec!(0.10)));
        assert_eq!(paper.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_modify_keeps_current_level_when_unset() {
        let (executor, paper) = executor(protection_off());
        let mut open = TradeCommand::new(TradeAction::Buy, "XAUUSD", dec!(0.10));
        open.stop_loss = Some(dec!(2300));
        open.take_profit = Some(dec!(2320));
        let ticket = executor.execute(&open, "m-1").await.ticket.unwrap();

        let mut modify = TradeCommand::for_position(TradeAction::Modify, ticket);
        modify.take_profit = Some(dec!(2330.004));
        let report = executor.execute(&modify, "m-2").await;

        assert!(report.is_success(), "{:?}", report);
        assert_eq!(report.qualifier, ResultQualifier::Ticket(ticket));
        assert_eq!(report.symbol, "XAUUSD");
        let request = paper.requests().pop().unwrap();
        assert_eq!(request.action, RequestAction::SlTp);
        assert_eq!(request.sl, dec!(2300));
        assert_eq!(request.tp, dec!(2330.00));

        let position = paper.position(ticket).await.unwrap().unwrap();
        assert_eq!(position.sl, dec!(2300));
        assert_eq!(position.tp, dec!(2330));
    }

    #[tokio::test]
    async fn test_partial_close_below_minimum_closes_minimum_lot() {
        let (executor, paper) = executor(protection_off());
        let open = TradeCommand::new(TradeAction::Buy, "XAUUSD", dec!(0.01));
        let ticket = executor.execute(&open, "c-1").await.ticket.unwrap();

        let mut close = TradeCommand::for_position(TradeAction::Close, ticket);
        close.close_volume = Some(dec!(0.005));
        let report = executor.execute(&close, "c-2").await;
        assert!(report.is_success());
        assert_eq!(paper.requests().pop().unwrap().volume, dec!(0.01));
    }
}
