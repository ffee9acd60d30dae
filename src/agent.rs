use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::context::BridgeContext;
use crate::executor::TradeExecutor;
use crate::health::{AgentStatus, LastCommand, SharedStatus};
use crate::ipc::command::{CommandChannel, CommandPoll};
use crate::ipc::result_log::ResultLog;
use crate::metrics;
use crate::model::{RESULT_LOG_TIME_FORMAT, TradeCommand, TradeResultRecord, format_unix};
use crate::scheduler::{Scheduler, TaskKind};
use crate::venue::adapter::Venue;
use crate::writer::StateWriter;

struct RememberedOutcome {
    expires_at_ms: i64,
    record: TradeResultRecord,
}

/// Terminal-side service: publishes state on its schedule and executes commands from
/// the slot, one per tick at most.
pub struct Agent {
    ctx: BridgeContext,
    writer: StateWriter,
    executor: TradeExecutor,
    channel: CommandChannel,
    log: ResultLog,
    scheduler: Scheduler,
    outcomes: HashMap<String, RememberedOutcome>,
    idempotency_ttl_ms: i64,
    timer: Duration,
    status: SharedStatus,
}

impl Agent {
    pub fn new(ctx: BridgeContext, venue: Arc<dyn Venue>, dir: &Path, settings: &Settings) -> Self {
        let agent_cfg = &settings.agent;
        let primary = settings.bridge.primary_symbol.as_str();

        let writer = StateWriter::new(
            venue.clone(),
            ctx.clone(),
            dir,
            agent_cfg.symbols_or(primary),
            primary,
            agent_cfg.bars,
            agent_cfg.history_days,
        );
        let executor = TradeExecutor::new(
            venue,
            agent_cfg.protection.clone(),
            agent_cfg.deviation_points,
            agent_cfg.default_magic,
        );
        let status = Arc::new(RwLock::new(AgentStatus {
            started_at: ctx.now_secs(),
            ..AgentStatus::default()
        }));

        Self {
            writer,
            executor,
            channel: CommandChannel::new(dir),
            log: ResultLog::new(dir),
            scheduler: Scheduler::from_intervals(agent_cfg.timer_ms, &agent_cfg.intervals),
            outcomes: HashMap::new(),
            idempotency_ttl_ms: i64::try_from(agent_cfg.idempotency_ttl_secs)
                .unwrap_or(i64::MAX / 1000)
                * 1000,
            timer: Duration::from_millis(agent_cfg.timer_ms.max(1)),
            status,
            ctx,
        }
    }

    pub fn status(&self) -> SharedStatus {
        self.status.clone()
    }

    pub fn writer(&self) -> &StateWriter {
        &self.writer
    }

    /// One timer tick: every due task runs once, the command slot first.
    pub async fn on_timer(&mut self) -> usize {
        let now_ms = self.ctx.time.now_millis();
        let mut written = 0;

        for kind in self.scheduler.due(now_ms) {
            match kind {
                TaskKind::Commands => self.poll_commands().await,
                other => written += self.writer.run(other).await,
            }
            self.scheduler.mark(kind, now_ms);
        }

        let mut status = self.status.write();
        status.last_tick = now_ms.div_euclid(1000);
        status.ticks += 1;
        written
    }

    async fn poll_commands(&mut self) {
        let cmd = match self.channel.poll() {
            Ok(CommandPoll::Pending(cmd)) => cmd,
            Ok(CommandPoll::Empty) | Ok(CommandPoll::Rejected) => return,
            Err(e) => {
                warn!(error = %e, "Command slot unreadable this tick");
                return;
            }
        };

        let record = self.process_command(&cmd).await;
        if let Err(e) = self.channel.acknowledge() {
            error!(error = %e, trade_id = %record.trade_id, "❌ Failed to reset command slot");
        }

        // Publish the effect of the trade on the next tick instead of waiting a full interval.
        self.scheduler.force(TaskKind::Positions);
        self.scheduler.force(TaskKind::Account);
        if cmd.action.targets_position() {
            self.scheduler.force(TaskKind::ClosedTrades);
        }
    }

    fn purge_outcomes(&mut self, now_ms: i64) {
        self.outcomes.retain(|_, o| o.expires_at_ms > now_ms);
    }

    /// Executes a command and appends exactly one row to the result log. A buy or sell
    /// whose controller-supplied trade id was executed within the TTL is not resubmitted;
    /// the remembered row is appended again instead.
    pub async fn process_command(&mut self, cmd: &TradeCommand) -> TradeResultRecord {
        let started = Instant::now();
        let now_ms = self.ctx.time.now_millis();
        let now = now_ms.div_euclid(1000);
        let opening = cmd.action.side().is_some();

        self.purge_outcomes(now_ms);

        let supplied_id = cmd.trade_id.clone().filter(|_| opening);
        if let Some(id) = &supplied_id {
            if let Some(prev) = self.outcomes.get(id) {
                let record = prev.record.clone();
                info!(trade_id = %id, outcome = %record.outcome, "♻️ Duplicate trade id, replaying outcome");
                metrics::inc_idempotent_replays();
                self.append(&record);
                return record;
            }
        }

        let trade_id = cmd.trade_id.clone().unwrap_or_else(|| now.to_string());
        info!(action = %cmd.action, symbol = %cmd.symbol, trade_id = %trade_id, "📥 Command received");

        let report = self.executor.execute(cmd, &trade_id).await;
        let record = report.to_record(format_unix(now, RESULT_LOG_TIME_FORMAT));
        self.append(&record);

        metrics::inc_commands_processed(cmd.action.as_str(), record.outcome.as_str());
        metrics::observe_command_latency(started.elapsed().as_secs_f64());

        if let Some(id) = supplied_id {
            self.outcomes.insert(
                id,
                RememberedOutcome {
                    expires_at_ms: now_ms.saturating_add(self.idempotency_ttl_ms),
                    record: record.clone(),
                },
            );
        }

        let mut status = self.status.write();
        status.commands_processed += 1;
        status.last_command = Some(LastCommand {
            action: record.action.clone(),
            outcome: record.outcome.to_string(),
            trade_id: record.trade_id.clone(),
            at: now,
        });
        drop(status);

        record
    }

    fn append(&self, record: &TradeResultRecord) {
        if let Err(e) = self.log.append(record) {
            error!(error = %e, trade_id = %record.trade_id, "❌ Failed to append result row");
        }
    }

    /// Ticks until `shutdown` flips to true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.timer);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            timer_ms = self.timer.as_millis() as u64,
            symbols = ?self.writer.symbols(),
            "🚀 Agent loop started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let written = self.on_timer().await;
                    debug!(written, "Tick complete");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("🛑 Agent loop stopped");
    }
}
