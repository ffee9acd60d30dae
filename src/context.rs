use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Trait for providing the current time.
/// Staleness checks, scheduling and history windows all read the clock through this.
pub trait TimeProvider: Send + Sync {
    fn now_millis(&self) -> i64;

    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.now_millis())
            .single()
            .unwrap_or_default()
    }

    fn now_secs(&self) -> i64 {
        self.now_millis().div_euclid(1000)
    }
}

/// Trait for generating correlation ids (controller-side trade ids).
pub trait IdProvider: Send + Sync {
    fn new_id(&self) -> String;
}

/// Context holding the providers.
/// Passed down to the agent, the controller and the paper venue.
#[derive(Clone)]
pub struct BridgeContext {
    pub time: Arc<dyn TimeProvider>,
    pub id: Arc<dyn IdProvider>,
}

impl BridgeContext {
    pub fn new_system() -> Self {
        Self {
            time: Arc::new(SystemTimeProvider),
            id: Arc::new(RandomIdProvider),
        }
    }

    /// Simulated clock plus deterministic ids. The clock handle is returned so tests can
    /// advance it.
    pub fn new_simulated(start_time_ms: i64) -> (Self, Arc<SimulatedTimeProvider>) {
        let clock = Arc::new(SimulatedTimeProvider::new(start_time_ms));
        let ctx = Self {
            time: clock.clone(),
            id: Arc::new(DeterministicIdProvider::new()),
        };
        (ctx, clock)
    }

    pub fn now_secs(&self) -> i64 {
        self.time.now_secs()
    }
}

// --- Live Implementations ---

pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub struct RandomIdProvider;

impl IdProvider for RandomIdProvider {
    fn new_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

// --- Simulated Implementations ---

pub struct SimulatedTimeProvider {
    current_time_ms: AtomicI64,
}

impl SimulatedTimeProvider {
    pub fn new(start_time_ms: i64) -> Self {
        Self {
            current_time_ms: AtomicI64::new(start_time_ms),
        }
    }

    pub fn set_time(&self, time_ms: i64) {
        self.current_time_ms.store(time_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, duration_ms: i64) {
        self.current_time_ms.fetch_add(duration_ms, Ordering::SeqCst);
    }
}

impl TimeProvider for SimulatedTimeProvider {
    fn now_millis(&self) -> i64 {
        self.current_time_ms.load(Ordering::SeqCst)
    }
}

pub struct DeterministicIdProvider {
    counter: AtomicU64,
}

impl DeterministicIdProvider {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }
}

impl Default for DeterministicIdProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl IdProvider for DeterministicIdProvider {
    fn new_id(&self) -> String {
        let num = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("00000000-0000-0000-0000-{:012x}", num)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_clock_advances() {
        let (ctx, clock) = BridgeContext::new_simulated(1_723_200_000_000);
        assert_eq!(ctx.now_secs(), 1_723_200_000);
        clock.advance(45_000);
        assert_eq!(ctx.now_secs(), 1_723_200_045);
        assert_eq!(ctx.time.now().timestamp(), 1_723_200_045);

        clock.set_time(1_723_100_000_000);
        assert_eq!(ctx.now_secs(), 1_723_100_000);
    }

    #[test]
    fn deterministic_ids_are_sequential() {
        let ids = DeterministicIdProvider::new();
        assert_eq!(ids.new_id(), "00000000-0000-0000-0000-000000000001");
        assert_eq!(ids.new_id(), "00000000-0000-0000-0000-000000000002");
    }
}
