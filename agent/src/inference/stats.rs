//! Routing and aggregation statistics
//!
//! Every degradation the engine tolerates (retries, skips, deadlines,
//! duplicates) is counted here so it stays visible.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Statistics for MoE forward passes
#[derive(Debug)]
pub struct MoeStats {
    /// Layers that produced an output (complete or partial)
    pub layers_completed: AtomicU64,

    /// Layers that failed fatally or were rejected by the partial policy
    pub layers_failed: AtomicU64,

    /// Tokens routed across all layers
    pub tokens_routed: AtomicU64,

    /// Dispatch requests sent (first attempts and retries)
    pub requests_sent: AtomicU64,

    /// Requests that failed at the transport or timed out
    pub request_failures: AtomicU64,

    /// Requests re-sent to an alternate replica
    pub retries: AtomicU64,

    /// (token, expert) pairs replaced by a zero-weight skip
    pub fallback_skips: AtomicU64,

    /// Requests that ran past `request_timeout_ms`
    pub request_deadlines: AtomicU64,

    /// Batches whose `batch_timeout_ms` elapsed with experts missing
    pub batch_deadlines: AtomicU64,

    /// Partials dropped because the pair was already accumulated
    pub duplicate_partials: AtomicU64,

    /// Partials dropped because their batch was already closed
    pub late_partials: AtomicU64,

    /// Partials dropped for a width or token mismatch
    pub malformed_partials: AtomicU64,

    /// Combined outputs flagged `Partial`
    pub partial_batches: AtomicU64,

    /// Times `dispatch` waited for a full per-node window
    pub backpressure_waits: AtomicU64,

    /// Forward passes cancelled by their caller
    pub cancellations: AtomicU64,

    /// Total round-trip time of successful requests in milliseconds
    pub total_request_time_ms: AtomicU64,

    /// Total wall time of completed layers in milliseconds
    pub total_layer_time_ms: AtomicU64,

    /// Start time for uptime tracking
    pub start_time: Instant,
}

impl Default for MoeStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable copy of the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MoeStatsSnapshot {
    pub layers_completed: u64,
    pub layers_failed: u64,
    pub tokens_routed: u64,
    pub requests_sent: u64,
    pub request_failures: u64,
    pub retries: u64,
    pub fallback_skips: u64,
    pub request_deadlines: u64,
    pub batch_deadlines: u64,
    pub duplicate_partials: u64,
    pub late_partials: u64,
    pub malformed_partials: u64,
    pub partial_batches: u64,
    pub backpressure_waits: u64,
    pub cancellations: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl MoeStats {
    pub fn new() -> Self {
        Self {
            layers_completed: AtomicU64::new(0),
            layers_failed: AtomicU64::new(0),
            tokens_routed: AtomicU64::new(0),
            requests_sent: AtomicU64::new(0),
            request_failures: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            fallback_skips: AtomicU64::new(0),
            request_deadlines: AtomicU64::new(0),
            batch_deadlines: AtomicU64::new(0),
            duplicate_partials: AtomicU64::new(0),
            late_partials: AtomicU64::new(0),
            malformed_partials: AtomicU64::new(0),
            partial_batches: AtomicU64::new(0),
            backpressure_waits: AtomicU64::new(0),
            cancellations: AtomicU64::new(0),
            total_request_time_ms: AtomicU64::new(0),
            total_layer_time_ms: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a finished layer
    pub fn record_layer(&self, tokens: usize, elapsed_ms: u64, partial: bool) {
        bump(&self.layers_completed);
        self.tokens_routed
            .fetch_add(tokens as u64, Ordering::Relaxed);
        self.total_layer_time_ms
            .fetch_add(elapsed_ms, Ordering::Relaxed);
        if partial {
            bump(&self.partial_batches);
        }
    }

    pub fn record_layer_failure(&self) {
        bump(&self.layers_failed);
    }

    pub fn record_request(&self) {
        bump(&self.requests_sent);
    }

    /// Record a successful request round trip
    pub fn record_request_latency(&self, elapsed_ms: u64) {
        self.total_request_time_ms
            .fetch_add(elapsed_ms, Ordering::Relaxed);
    }

    pub fn record_request_failure(&self, deadline: bool) {
        bump(&self.request_failures);
        if deadline {
            bump(&self.request_deadlines);
        }
    }

    pub fn record_retry(&self) {
        bump(&self.retries);
    }

    pub fn record_skips(&self, pairs: usize) {
        self.fallback_skips
            .fetch_add(pairs as u64, Ordering::Relaxed);
    }

    pub fn record_batch_deadline(&self) {
        bump(&self.batch_deadlines);
    }

    pub fn record_duplicate(&self) {
        bump(&self.duplicate_partials);
    }

    pub fn record_late(&self) {
        bump(&self.late_partials);
    }

    pub fn record_malformed(&self) {
        bump(&self.malformed_partials);
    }

    pub fn record_backpressure(&self) {
        bump(&self.backpressure_waits);
    }

    pub fn record_cancellation(&self) {
        bump(&self.cancellations);
    }

    /// Fraction of sent requests that succeeded (0.0 - 1.0)
    pub fn success_rate(&self) -> f64 {
        let sent = self.requests_sent.load(Ordering::Relaxed);
        if sent == 0 {
            return 0.0;
        }
        let failed = self.request_failures.load(Ordering::Relaxed);
        sent.saturating_sub(failed) as f64 / sent as f64
    }

    pub fn avg_request_latency_ms(&self) -> f64 {
        let ok = self
            .requests_sent
            .load(Ordering::Relaxed)
            .saturating_sub(self.request_failures.load(Ordering::Relaxed));
        if ok == 0 {
            return 0.0;
        }
        self.total_request_time_ms.load(Ordering::Relaxed) as f64 / ok as f64
    }

    pub fn avg_layer_time_ms(&self) -> f64 {
        let layers = self.layers_completed.load(Ordering::Relaxed);
        if layers == 0 {
            return 0.0;
        }
        self.total_layer_time_ms.load(Ordering::Relaxed) as f64 / layers as f64
    }

    /// Tokens routed per second of layer time
    pub fn tokens_per_second(&self) -> f64 {
        let secs = self.total_layer_time_ms.load(Ordering::Relaxed) as f64 / 1000.0;
        if secs == 0.0 {
            return 0.0;
        }
        self.tokens_routed.load(Ordering::Relaxed) as f64 / secs
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Format uptime as human-readable string
    pub fn uptime_string(&self) -> String {
        let seconds = self.uptime_seconds();
        let hours = seconds / 3600;
        let minutes = (seconds % 3600) / 60;
        let secs = seconds % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, minutes, secs)
        } else if minutes > 0 {
            format!("{}m {}s", minutes, secs)
        } else {
            format!("{}s", secs)
        }
    }

    pub fn snapshot(&self) -> MoeStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MoeStatsSnapshot {
            layers_completed: load(&self.layers_completed),
            layers_failed: load(&self.layers_failed),
            tokens_routed: load(&self.tokens_routed),
            requests_sent: load(&self.requests_sent),
            request_failures: load(&self.request_failures),
            retries: load(&self.retries),
            fallback_skips: load(&self.fallback_skips),
            request_deadlines: load(&self.request_deadlines),
            batch_deadlines: load(&self.batch_deadlines),
            duplicate_partials: load(&self.duplicate_partials),
            late_partials: load(&self.late_partials),
            malformed_partials: load(&self.malformed_partials),
            partial_batches: load(&self.partial_batches),
            backpressure_waits: load(&self.backpressure_waits),
            cancellations: load(&self.cancellations),
        }
    }

    /// Print statistics summary
    pub fn print_summary(&self) {
        let s = self.snapshot();
        info!(
            layers_completed = s.layers_completed,
            layers_failed = s.layers_failed,
            tokens_routed = s.tokens_routed,
            requests_sent = s.requests_sent,
            retries = s.retries,
            fallback_skips = s.fallback_skips,
            partial_batches = s.partial_batches,
            duplicates = s.duplicate_partials,
            success_rate = format!("{:.1}%", self.success_rate() * 100.0),
            avg_request_latency_ms = format!("{:.2}", self.avg_request_latency_ms()),
            uptime = %self.uptime_string(),
            "MoE routing statistics"
        );
    }

    /// Display formatted metrics (for CLI)
    pub fn display(&self) {
        use colored::Colorize;

        let s = self.snapshot();
        println!("\n{}", "MoE Routing Metrics".bold().cyan());
        println!("{}", "===================".cyan());

        println!("\n{}", "Layers:".bold());
        println!(
            "  Completed:           {}",
            s.layers_completed.to_string().green()
        );
        println!("  Failed:              {}", s.layers_failed.to_string().red());
        println!(
            "  Partial Outputs:     {}",
            s.partial_batches.to_string().yellow()
        );
        println!("  Tokens Routed:       {}", s.tokens_routed);
        println!("  Avg Layer Time:      {:.2}ms", self.avg_layer_time_ms());
        println!("  Tokens/sec:          {:.2}", self.tokens_per_second());

        println!("\n{}", "Dispatch:".bold());
        println!("  Requests Sent:       {}", s.requests_sent);
        println!("  Success Rate:        {:.1}%", self.success_rate() * 100.0);
        println!(
            "  Avg Latency:         {:.2}ms",
            self.avg_request_latency_ms()
        );
        println!("  Backpressure Waits:  {}", s.backpressure_waits);

        println!("\n{}", "Fault Tolerance:".bold());
        println!("  Retries:             {}", s.retries);
        println!(
            "  Fallback Skips:      {}",
            s.fallback_skips.to_string().yellow()
        );
        println!("  Request Deadlines:   {}", s.request_deadlines);
        println!("  Batch Deadlines:     {}", s.batch_deadlines);
        println!("  Duplicate Partials:  {}", s.duplicate_partials);
        println!("  Late Partials:       {}", s.late_partials);
        println!("  Cancellations:       {}", s.cancellations);

        println!("\n{}", "System:".bold());
        println!("  Uptime:              {}", self.uptime_string());
        println!();
    }

    /// Serialize to JSON, stamped with the current local time
    pub fn to_json(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self.snapshot()).unwrap_or_default();
        if let Some(map) = value.as_object_mut() {
            map.insert("success_rate".into(), self.success_rate().into());
            map.insert(
                "avg_request_latency_ms".into(),
                self.avg_request_latency_ms().into(),
            );
            map.insert("avg_layer_time_ms".into(), self.avg_layer_time_ms().into());
            map.insert("uptime".into(), self.uptime_string().into());
            map.insert(
                "last_updated".into(),
                chrono::Local::now().to_rfc3339().into(),
            );
        }
        value
    }

    /// Save statistics as pretty JSON
    pub fn save_to_file(&self, path: &std::path::Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(&self.to_json())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

        std::fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_new() {
        let stats = MoeStats::new();
        assert_eq!(stats.success_rate(), 0.0);
        assert_eq!(stats.avg_request_latency_ms(), 0.0);
        assert_eq!(stats.tokens_per_second(), 0.0);
    }

    #[test]
    fn test_request_accounting() {
        let stats = MoeStats::new();
        for _ in 0..4 {
            stats.record_request();
        }
        stats.record_request_failure(true);
        stats.record_request_latency(30);
        stats.record_request_latency(30);
        stats.record_request_latency(30);

        assert_eq!(stats.success_rate(), 0.75);
        assert_eq!(stats.avg_request_latency_ms(), 30.0);
        assert_eq!(stats.request_deadlines.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_layer_accounting() {
        let stats = MoeStats::new();
        stats.record_layer(10, 500, false);
        stats.record_layer(10, 1500, true);

        let snap = stats.snapshot();
        assert_eq!(snap.layers_completed, 2);
        assert_eq!(snap.partial_batches, 1);
        assert_eq!(snap.tokens_routed, 20);
        assert_eq!(stats.tokens_per_second(), 10.0);
        assert_eq!(stats.avg_layer_time_ms(), 1000.0);
    }

    #[test]
    fn test_stats_to_json() {
        let stats = MoeStats::new();
        stats.record_skips(3);
        stats.record_duplicate();

        let json = stats.to_json();
        assert_eq!(json["fallback_skips"], 3);
        assert_eq!(json["duplicate_partials"], 1);
        assert!(json["last_updated"].is_string());
    }

    #[test]
    fn test_save_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats").join("moe_stats.json");
        let stats = MoeStats::new();
        stats.record_retry();
        stats.save_to_file(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["retries"], 1);
    }
}
