use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

// --- Command Metrics ---

pub static COMMANDS_PROCESSED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "file_bridge_commands_processed_total",
        "Commands consumed from the command slot",
        &["action", "outcome"]
    )
    .expect("commands_processed counter")
});

pub static COMMAND_PARSE_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "file_bridge_command_parse_failures_total",
        "Distinct command payloads that could not be decoded"
    )
    .expect("command_parse_failures counter")
});

pub static IDEMPOTENT_REPLAYS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "file_bridge_idempotent_replays_total",
        "Repeated trade ids answered from the outcome cache"
    )
    .expect("idempotent_replays counter")
});

pub static COMMAND_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "file_bridge_command_latency_seconds",
        "Time from command pickup to result row",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("command_latency histogram")
});

// --- Snapshot Metrics ---

pub static SNAPSHOT_WRITES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "file_bridge_snapshot_writes_total",
        "State files replaced",
        &["file"]
    )
    .expect("snapshot_writes counter")
});

pub static SNAPSHOT_SKIPS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "file_bridge_snapshot_skips_total",
        "Snapshot cycles skipped for lack of venue data",
        &["file"]
    )
    .expect("snapshot_skips counter")
});

pub static OPEN_POSITIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "file_bridge_open_positions",
        "Positions in the last positions snapshot"
    )
    .expect("open_positions gauge")
});

pub fn inc_commands_processed(action: &str, outcome: &str) {
    COMMANDS_PROCESSED.with_label_values(&[action, outcome]).inc();
}

pub fn inc_command_parse_failures() {
    COMMAND_PARSE_FAILURES.inc();
}

pub fn inc_idempotent_replays() {
    IDEMPOTENT_REPLAYS.inc();
}

pub fn observe_command_latency(duration_sec: f64) {
    COMMAND_LATENCY.observe(duration_sec);
}

pub fn inc_snapshot_writes(file: &str) {
    SNAPSHOT_WRITES.with_label_values(&[file]).inc();
}

pub fn inc_snapshot_skips(file: &str) {
    SNAPSHOT_SKIPS.with_label_values(&[file]).inc();
}

pub fn set_open_positions(count: i64) {
    OPEN_POSITIONS.set(count);
}

/// Text exposition of the default registry.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_labelled_counters() {
        inc_commands_processed("buy", "SUCCESS");
        inc_snapshot_skips("XAUUSD_orderbook.json");

        let text = render();
        assert!(text.contains("file_bridge_commands_processed_total"));
        assert!(text.contains("file=\"XAUUSD_orderbook.json\""));
    }
}
