//! Router metrics: counters, per-agent timing, and a health-check snapshot.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashMap;

/// Number of recent per-agent durations kept for the timing summary.
const TIMING_WINDOW: usize = 200;

/// Timing summary for one agent.
#[derive(Debug, Clone, Copy, Default)]
pub struct AgentTimingSummary {
    /// How many invocations contributed to this summary.
    pub count: u64,
    /// Average duration in milliseconds.
    pub avg_ms: f64,
    /// Maximum observed duration in milliseconds.
    pub max_ms: u64,
    /// Minimum observed duration in milliseconds.
    pub min_ms: u64,
}

#[derive(Default)]
struct AgentTimings {
    durations_ms: VecDeque<u64>,
    count: u64,
}

/// Process-global counters and per-agent timing windows, safe for
/// concurrent append/read from every patient worker.
pub struct RouterMetrics {
    events_processed: AtomicU64,
    events_failed: AtomicU64,
    events_rate_limited: AtomicU64,
    diary_save_failures: AtomicU64,
    dispatch_failures: AtomicU64,
    agent_timings: DashMap<String, Mutex<AgentTimings>>,
}

impl Default for RouterMetrics {
    fn default() -> Self {
        Self {
            events_processed: AtomicU64::new(0),
            events_failed: AtomicU64::new(0),
            events_rate_limited: AtomicU64::new(0),
            diary_save_failures: AtomicU64::new(0),
            dispatch_failures: AtomicU64::new(0),
            agent_timings: DashMap::new(),
        }
    }
}

impl RouterMetrics {
    /// Records one successfully processed event.
    pub fn record_processed(&self) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one failed (agent exception) event.
    pub fn record_failed(&self) {
        self.events_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one rate-limited event.
    pub fn record_rate_limited(&self) {
        self.events_rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    /// Bumps the diary-save-hard-failure counter.
    pub fn record_diary_save_failure(&self) {
        self.diary_save_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Bumps the outbound-dispatch-failure counter.
    pub fn record_dispatch_failure(&self) {
        self.dispatch_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one agent invocation's duration.
    pub fn record_agent_duration(&self, agent_name: &str, duration: Duration) {
        let entry = self
            .agent_timings
            .entry(agent_name.to_string())
            .or_insert_with(|| Mutex::new(AgentTimings::default()));
        let mut timings = entry.lock().expect("agent timings mutex poisoned");
        timings.count += 1;
        timings.durations_ms.push_back(duration.as_millis() as u64);
        while timings.durations_ms.len() > TIMING_WINDOW {
            timings.durations_ms.pop_front();
        }
    }

    /// Snapshot of counters and per-agent timing summaries.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut per_agent = std::collections::HashMap::new();
        for entry in &self.agent_timings {
            let timings = entry.value().lock().expect("agent timings mutex poisoned");
            if timings.durations_ms.is_empty() {
                continue;
            }
            let sum: u64 = timings.durations_ms.iter().sum();
            let avg_ms = sum as f64 / timings.durations_ms.len() as f64;
            let max_ms = *timings.durations_ms.iter().max().unwrap();
            let min_ms = *timings.durations_ms.iter().min().unwrap();
            per_agent.insert(
                entry.key().clone(),
                AgentTimingSummary {
                    count: timings.count,
                    avg_ms,
                    max_ms,
                    min_ms,
                },
            );
        }

        MetricsSnapshot {
            events_processed: self.events_processed.load(Ordering::Relaxed),
            events_failed: self.events_failed.load(Ordering::Relaxed),
            events_rate_limited: self.events_rate_limited.load(Ordering::Relaxed),
            diary_save_failures: self.diary_save_failures.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            per_agent,
        }
    }
}

/// Point-in-time metrics snapshot.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Total events successfully processed.
    pub events_processed: u64,
    /// Total events that failed with an agent exception.
    pub events_failed: u64,
    /// Total events rejected by the rate limiter.
    pub events_rate_limited: u64,
    /// Total hard failures persisting a diary after retries were exhausted.
    pub diary_save_failures: u64,
    /// Total outbound responses that failed dispatch (no dispatcher or send error).
    pub dispatch_failures: u64,
    /// Timing summary per agent name.
    pub per_agent: std::collections::HashMap<String, AgentTimingSummary>,
}

/// Aggregate health-check result.
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Number of registered agents.
    pub agents_registered: usize,
    /// Names of registered agents.
    pub agent_names: Vec<String>,
    /// Number of registered channels.
    pub channels_registered: usize,
    /// Names of registered channels.
    pub channel_names: Vec<String>,
    /// `true` if the diary store responded to a liveness probe.
    pub diary_store_available: bool,
    /// `true` iff every sub-check passed.
    pub overall_healthy: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timing_summary_tracks_min_max_avg() {
        let metrics = RouterMetrics::default();
        metrics.record_agent_duration("intake", Duration::from_millis(10));
        metrics.record_agent_duration("intake", Duration::from_millis(30));
        let snapshot = metrics.snapshot();
        let summary = snapshot.per_agent.get("intake").unwrap();
        assert_eq!(summary.count, 2);
        assert_eq!(summary.min_ms, 10);
        assert_eq!(summary.max_ms, 30);
        assert!((summary.avg_ms - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn timing_window_caps_at_200_samples() {
        let metrics = RouterMetrics::default();
        for i in 0..250 {
            metrics.record_agent_duration("clinical", Duration::from_millis(i));
        }
        let snapshot = metrics.snapshot();
        let summary = snapshot.per_agent.get("clinical").unwrap();
        assert_eq!(summary.count, 250);
        assert_eq!(summary.min_ms, 50);
    }
}
