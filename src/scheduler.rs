//! Precise interval scheduler.
//!
//! Fires a callback at exact wall-clock multiples of an interval, not
//! merely "interval after the last run". Overruns skip boundaries instead
//! of queueing them; a clock jump larger than 30 s re-aligns the schedule
//! without counting the jump as drift.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{info, warn};

/// A clock jump above this is treated as an NTP sync / suspend-resume and
/// re-aligns the schedule rather than accumulating drift.
const CLOCK_JUMP_THRESHOLD_S: f64 = 30.0;

#[derive(Debug, Default, Clone, Serialize)]
pub struct SchedulerStats {
    pub name: String,
    pub interval_s: f64,
    pub execution_count: u64,
    pub drift_total_s: f64,
    pub drift_last_ms: f64,
    pub skipped_count: u64,
    pub last_execution_s: f64,
}

#[derive(Default)]
struct Metrics {
    execution_count: u64,
    drift_total_s: f64,
    drift_last_ms: f64,
    skipped_count: u64,
    last_execution_s: f64,
}

/// Wall-clock aligned interval loop shared by all periodic work.
pub struct ScheduledLoop {
    name: String,
    interval_s: f64,
    running: Arc<AtomicBool>,
    metrics: Arc<Mutex<Metrics>>,
}

fn wall_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl ScheduledLoop {
    pub fn new(name: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            interval_s: interval.as_secs_f64(),
            running: Arc::new(AtomicBool::new(false)),
            metrics: Arc::new(Mutex::new(Metrics::default())),
        }
    }

    /// Cooperative stop: an in-flight callback completes, then the loop
    /// exits at the next boundary check.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> SchedulerStats {
        let m = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
        SchedulerStats {
            name: self.name.clone(),
            interval_s: self.interval_s,
            execution_count: m.execution_count,
            drift_total_s: m.drift_total_s,
            drift_last_ms: m.drift_last_ms,
            skipped_count: m.skipped_count,
            last_execution_s: m.last_execution_s,
        }
    }

    /// Run the loop until stopped. The first fire is aligned to the next
    /// wall-clock multiple of the interval. A callback error is logged and
    /// does not skip the next boundary.
    pub async fn run<F, Fut>(&self, mut callback: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        self.running.store(true, Ordering::SeqCst);

        let interval = self.interval_s;
        let mut next_run = ((wall_now() / interval).floor() + 1.0) * interval;

        while self.running.load(Ordering::SeqCst) {
            let sleep_for = next_run - wall_now();
            if sleep_for > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(sleep_for)).await;
            }

            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            // Drift: how late this boundary actually fired.
            let drift = wall_now() - next_run;
            if drift > CLOCK_JUMP_THRESHOLD_S {
                info!(
                    scheduler = %self.name,
                    jump_s = drift as i64,
                    "clock jump detected, realigning"
                );
                if let Ok(mut m) = self.metrics.lock() {
                    m.drift_last_ms = 0.0;
                }
            } else if let Ok(mut m) = self.metrics.lock() {
                m.drift_total_s += drift.max(0.0);
                m.drift_last_ms = drift * 1000.0;
            }

            let started = wall_now();
            callback().await;
            let took = wall_now() - started;

            if let Ok(mut m) = self.metrics.lock() {
                m.last_execution_s = took;
                m.execution_count += 1;
            }

            // Advance past every boundary we already missed; only the one
            // we just executed is expected.
            let now = wall_now();
            let mut advanced: u64 = 0;
            while next_run <= now {
                next_run += interval;
                advanced += 1;
            }
            if advanced > 1 {
                let skipped = advanced - 1;
                if let Ok(mut m) = self.metrics.lock() {
                    m.skipped_count += skipped;
                }
                warn!(
                    scheduler = %self.name,
                    skipped,
                    execution_s = took,
                    "callback overran interval, skipping boundaries"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn fires_and_stops_cooperatively() {
        let looper = Arc::new(ScheduledLoop::new("test", Duration::from_millis(50)));
        let count = Arc::new(AtomicU32::new(0));

        let l = looper.clone();
        let c = count.clone();
        let handle = tokio::spawn(async move {
            l.run(|| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;
        });

        tokio::time::sleep(Duration::from_millis(180)).await;
        looper.stop();
        let _ = handle.await;

        let fired = count.load(Ordering::SeqCst);
        assert!(fired >= 2, "expected at least 2 fires, got {fired}");
        let stats = looper.stats();
        assert_eq!(stats.execution_count as u32, fired);
    }

    #[tokio::test]
    async fn overrun_skips_boundaries_instead_of_queueing() {
        let looper = Arc::new(ScheduledLoop::new("slow", Duration::from_millis(30)));
        let count = Arc::new(AtomicU32::new(0));

        let l = looper.clone();
        let c = count.clone();
        let handle = tokio::spawn(async move {
            l.run(|| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    // Overrun several boundaries.
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            })
            .await;
        });

        tokio::time::sleep(Duration::from_millis(260)).await;
        looper.stop();
        let _ = handle.await;

        let stats = looper.stats();
        assert!(stats.skipped_count >= 1, "skipped={}", stats.skipped_count);
        // Missed boundaries were skipped, not replayed back-to-back.
        assert!(count.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn drift_is_monotonically_non_decreasing() {
        let looper = Arc::new(ScheduledLoop::new("drift", Duration::from_millis(20)));
        let l = looper.clone();
        let observed = Arc::new(Mutex::new(Vec::new()));
        let o = observed.clone();
        let l2 = looper.clone();
        let handle = tokio::spawn(async move {
            l.run(move || {
                let o = o.clone();
                let stats = l2.stats();
                async move {
                    o.lock().unwrap().push(stats.drift_total_s);
                }
            })
            .await;
        });

        tokio::time::sleep(Duration::from_millis(120)).await;
        looper.stop();
        let _ = handle.await;

        let drifts = observed.lock().unwrap().clone();
        for pair in drifts.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
    }
}
