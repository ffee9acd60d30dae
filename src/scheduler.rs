use std::collections::BTreeMap;
use std::fmt;

use crate::config::IntervalConfig;

/// Periodic agent jobs. Each one owns a state file (or, for `Commands`, the command slot).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskKind {
    Commands,
    Price,
    Tick,
    Account,
    Positions,
    Orders,
    OrderBook,
    ClosedTrades,
    Rates,
    SymbolInfo,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Commands => "commands",
            TaskKind::Price => "price",
            TaskKind::Tick => "tick",
            TaskKind::Account => "account",
            TaskKind::Positions => "positions",
            TaskKind::Orders => "orders",
            TaskKind::OrderBook => "order_book",
            TaskKind::ClosedTrades => "closed_trades",
            TaskKind::Rates => "rates",
            TaskKind::SymbolInfo => "symbol_info",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
struct Task {
    interval_ms: i64,
    last_run_ms: Option<i64>,
}

/// Named interval timers driven by a single tick. A task that has never run is due
/// immediately, so every file is produced on startup.
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    tasks: BTreeMap<TaskKind, Task>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_intervals(command_ms: u64, intervals: &IntervalConfig) -> Self {
        let mut s = Self::new();
        s.register(TaskKind::Commands, command_ms);
        s.register(TaskKind::Price, intervals.price_ms);
        s.register(TaskKind::Tick, intervals.tick_ms);
        s.register(TaskKind::Account, intervals.account_ms);
        s.register(TaskKind::Positions, intervals.positions_ms);
        s.register(TaskKind::Orders, intervals.orders_ms);
        s.register(TaskKind::OrderBook, intervals.order_book_ms);
        s.register(TaskKind::ClosedTrades, intervals.closed_trades_ms);
        s.register(TaskKind::Rates, intervals.rates_ms);
        s.register(TaskKind::SymbolInfo, intervals.symbol_info_ms);
        s
    }

    pub fn register(&mut self, kind: TaskKind, interval_ms: u64) {
        self.tasks.insert(
            kind,
            Task {
                interval_ms: i64::try_from(interval_ms).unwrap_or(i64::MAX),
                last_run_ms: None,
            },
        );
    }

    /// Tasks whose interval has elapsed at `now_ms`, in a fixed order.
    pub fn due(&self, now_ms: i64) -> Vec<TaskKind> {
        self.tasks
            .iter()
            .filter(|(_, t)| match t.last_run_ms {
                None => true,
                Some(last) => now_ms.saturating_sub(last) >= t.interval_ms,
            })
            .map(|(k, _)| *k)
            .collect()
    }

    pub fn mark(&mut self, kind: TaskKind, now_ms: i64) {
        if let Some(t) = self.tasks.get_mut(&kind) {
            t.last_run_ms = Some(now_ms);
        }
    }

    /// Makes `kind` due on the next tick, e.g. positions right after a trade.
    pub fn force(&mut self, kind: TaskKind) {
        if let Some(t) = self.tasks.get_mut(&kind) {
            t.last_run_ms = None;
        }
    }

    pub fn last_run(&self, kind: TaskKind) -> Option<i64> {
        self.tasks.get(&kind).and_then(|t| t.last_run_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_tasks_due_on_startup() {
        let s = Scheduler::from_intervals(500, &IntervalConfig::default());
        assert_eq!(s.due(0).len(), 10);
    }

    #[test]
    fn test_intervals_are_independent() {
        let mut s = Scheduler::new();
        s.register(TaskKind::Price, 1_000);
        s.register(TaskKind::ClosedTrades, 10_000);
        for k in s.due(0) {
            s.mark(k, 0);
        }

        assert!(s.due(999).is_empty());
        assert_eq!(s.due(1_000), vec![TaskKind::Price]);
        s.mark(TaskKind::Price, 1_000);

        assert_eq!(s.due(10_000), vec![TaskKind::Price, TaskKind::ClosedTrades]);

        s.force(TaskKind::ClosedTrades);
        assert_eq!(s.due(1_500), vec![TaskKind::ClosedTrades]);
        assert_eq!(s.last_run(TaskKind::Price), Some(1_000));
    }
}
