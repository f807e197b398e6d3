use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

const MAX_BACKOFF_EXPONENT: u32 = 6;
const MIN_TICK_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PullTrigger {
    Startup,
    Tick,
    Manual,
    PostMutation,
    Retry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullDecision {
    Start,
    Coalesced,
}

/// At most one pull in flight; triggers arriving meanwhile collapse into one follow-up.
#[derive(Debug, Default)]
pub struct PullGate {
    in_flight: bool,
    queued: Option<PullTrigger>,
    issued: u64,
}

impl PullGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_tick(&mut self) -> PullDecision {
        self.on_demand(PullTrigger::Tick)
    }

    pub fn on_demand(&mut self, trigger: PullTrigger) -> PullDecision {
        if self.in_flight {
            self.queued.get_or_insert(trigger);
            return PullDecision::Coalesced;
        }
        self.in_flight = true;
        self.issued += 1;
        PullDecision::Start
    }

    pub fn on_pull_complete(&mut self) -> Option<PullTrigger> {
        self.in_flight = false;
        let next = self.queued.take()?;
        self.in_flight = true;
        self.issued += 1;
        Some(next)
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn has_queued(&self) -> bool {
        self.queued.is_some()
    }

    pub fn issued(&self) -> u64 {
        self.issued
    }
}

#[derive(Debug)]
pub struct RetryPolicy {
    base: Duration,
    cap: Duration,
    failures: u32,
    rng: StdRng,
}

impl RetryPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self::with_rng(base, cap, StdRng::from_entropy())
    }

    pub fn with_rng(base: Duration, cap: Duration, rng: StdRng) -> Self {
        Self {
            base,
            cap: cap.max(base),
            failures: 0,
            rng,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let exponent = (self.failures - 1).min(MAX_BACKOFF_EXPONENT);
        let base_ms = self.base.as_millis() as u64;
        let backoff = Duration::from_millis(base_ms.saturating_mul(1 << exponent));
        let jitter_ceiling = (base_ms / 2).max(1);
        let jitter = Duration::from_millis(self.rng.gen_range(0..jitter_ceiling));
        (backoff + jitter).min(self.cap)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }
}

pub fn spawn_ticker<F>(period: Duration, on_tick: F) -> JoinHandle<()>
where
    F: Fn() -> bool + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticks = interval(period.max(MIN_TICK_PERIOD));
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticks.tick().await;
        loop {
            ticks.tick().await;
            if !on_tick() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn first_trigger_starts_a_pull() {
        let mut gate = PullGate::new();
        assert_eq!(gate.on_demand(PullTrigger::Startup), PullDecision::Start);
        assert!(gate.is_in_flight());
        assert_eq!(gate.issued(), 1);
    }

    #[test]
    fn overlapping_triggers_coalesce_into_one_follow_up() {
        let mut gate = PullGate::new();
        gate.on_demand(PullTrigger::Startup);
        assert_eq!(gate.on_tick(), PullDecision::Coalesced);
        assert_eq!(gate.on_demand(PullTrigger::Manual), PullDecision::Coalesced);
        assert_eq!(
            gate.on_demand(PullTrigger::PostMutation),
            PullDecision::Coalesced
        );
        assert_eq!(gate.issued(), 1);

        assert_eq!(gate.on_pull_complete(), Some(PullTrigger::Tick));
        assert!(gate.is_in_flight());
        assert!(!gate.has_queued());
        assert_eq!(gate.issued(), 2);

        assert_eq!(gate.on_pull_complete(), None);
        assert!(!gate.is_in_flight());
    }

    #[test]
    fn gate_reopens_after_completion() {
        let mut gate = PullGate::new();
        gate.on_tick();
        gate.on_pull_complete();
        assert_eq!(gate.on_demand(PullTrigger::Manual), PullDecision::Start);
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let mut policy = RetryPolicy::with_rng(
            Duration::from_millis(100),
            Duration::from_millis(1_000),
            StdRng::seed_from_u64(7),
        );
        let first = policy.next_delay();
        let second = policy.next_delay();
        assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(150));
        assert!(second >= Duration::from_millis(200) && second < Duration::from_millis(250));
        for _ in 0..10 {
            assert!(policy.next_delay() <= Duration::from_millis(1_000));
        }
        assert_eq!(policy.consecutive_failures(), 12);

        policy.reset();
        assert_eq!(policy.consecutive_failures(), 0);
        assert!(policy.next_delay() < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn ticker_stops_when_callback_declines() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let task = spawn_ticker(Duration::from_millis(5), move || {
            seen.fetch_add(1, Ordering::SeqCst) < 2
        });
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("ticker finished")
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn zero_period_ticker_still_runs() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let task = spawn_ticker(Duration::ZERO, move || seen.fetch_add(1, Ordering::SeqCst) < 1);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("ticker finished")
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
