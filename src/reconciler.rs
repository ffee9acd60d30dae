//! Rebuilds closed trades from raw venue history.
//!
//! Deals are grouped by position. Each exit deal of a position becomes one
//! [`ClosedTradeRecord`], priced against the position's entry deal.

use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::debug;

use crate::model::{ClosedTradeRecord, DealEntry, DealRecord, HistoryOrderRecord, Side, format_server_time};
use crate::venue::adapter::{Venue, VenueError};

pub const SECONDS_PER_DAY: i64 = 86_400;

/// Comments the terminal generates when a protective level closes a position.
pub fn is_annotation(comment: &str) -> bool {
    let c = comment.trim_start();
    c.starts_with("[sl") || c.starts_with("[tp")
}

fn usable_comment(comment: &str) -> Option<&str> {
    let c = comment.trim();
    (!c.is_empty() && !is_annotation(c)).then_some(c)
}

pub fn change_percent(side: Side, entry: Decimal, exit: Decimal) -> Decimal {
    if entry.is_zero() {
        return Decimal::ZERO;
    }
    let diff = match side {
        Side::Buy => exit - entry,
        Side::Sell => entry - exit,
    };
    (diff / entry * Decimal::ONE_HUNDRED).round_dp(2)
}

fn protective_levels(
    entry: &DealRecord,
    exit: &DealRecord,
    orders: &[HistoryOrderRecord],
) -> (Decimal, Decimal) {
    let latest = orders
        .iter()
        .filter(|o| o.position_id == exit.position_id)
        .filter(|o| !o.sl.is_zero() || !o.tp.is_zero())
        .filter(|o| o.time_done <= exit.time)
        .max_by_key(|o| (o.time_done, o.ticket));

    if let Some(order) = latest {
        return (order.sl, order.tp);
    }
    if !exit.sl.is_zero() || !exit.tp.is_zero() {
        return (exit.sl, exit.tp);
    }
    (entry.sl, entry.tp)
}

fn trade_comment(entry: &DealRecord, exit: &DealRecord, orders: &[HistoryOrderRecord]) -> String {
    orders
        .iter()
        .find(|o| o.ticket == entry.order)
        .and_then(|o| usable_comment(&o.comment))
        .or_else(|| usable_comment(&entry.comment))
        .unwrap_or(exit.comment.trim())
        .to_string()
}

/// Pure reconciliation over deals and orders already fetched from the venue.
///
/// Every record of a position carries the same `profit`: the sum of profit, swap and
/// commission over all of that position's deals. With several partial exits the total
/// is therefore repeated on each record; consumers summing `profit` across records will
/// count it more than once.
pub fn reconcile(
    deals: &[DealRecord],
    orders: &[HistoryOrderRecord],
    now: i64,
    window_secs: i64,
) -> Vec<ClosedTradeRecord> {
    let from = now - window_secs;

    let mut by_position: BTreeMap<u64, Vec<&DealRecord>> = BTreeMap::new();
    for deal in deals {
        if deal.kind.side().is_none() || deal.time < from || deal.time > now {
            continue;
        }
        by_position.entry(deal.position_id).or_default().push(deal);
    }

    let mut trades = Vec::new();
    for (position_id, group) in &by_position {
        let entry = match group
            .iter()
            .filter(|d| d.entry == DealEntry::In)
            .min_by_key(|d| (d.time, d.ticket))
        {
            Some(e) => *e,
            None => {
                debug!(position_id, "No entry deal in window, skipping position");
                continue;
            }
        };
        let side = match entry.kind.side() {
            Some(s) => s,
            None => continue,
        };
        let aggregate: Decimal = group.iter().map(|d| d.net()).sum();

        for exit in group.iter().filter(|d| d.entry.is_exit()) {
            let (sl, tp) = protective_levels(entry, exit, orders);
            trades.push(ClosedTradeRecord {
                ticket: exit.ticket,
                symbol: exit.symbol.clone(),
                side,
                volume: exit.volume,
                entry_price: entry.price,
                exit_price: exit.price,
                sl,
                tp,
                profit: aggregate,
                change_percent: change_percent(side, entry.price, exit.price),
                comment: trade_comment(entry, exit, orders),
                close_time: format_server_time(exit.time),
                close_timestamp: exit.time,
            });
        }
    }

    trades.sort_by(|a, b| {
        b.close_timestamp
            .cmp(&a.close_timestamp)
            .then(b.ticket.cmp(&a.ticket))
    });
    trades
}

/// Fetches the last `window_days` of history from the venue and reconciles it.
pub async fn closed_trades(
    venue: &dyn Venue,
    now: i64,
    window_days: i64,
) -> Result<Vec<ClosedTradeRecord>, VenueError> {
    let window = window_days * SECONDS_PER_DAY;
    let from = now - window;
    let deals = venue.history_deals(from, now).await?;
    let orders = venue.history_orders(from, now).await?;
    Ok(reconcile(&deals, &orders, now, window))
}
