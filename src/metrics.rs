//! Engine counters and Prometheus text rendering

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Process-wide engine counters
pub struct EngineMetrics {
    start_time: Instant,
    draws_total: AtomicU64,
    forced_positions_total: AtomicU64,
    fallback_positions_total: AtomicU64,
    draws_replaced_total: AtomicU64,
    bets_settled_total: AtomicU64,
    bets_won_total: AtomicU64,
    payout_total: AtomicU64,
    settlement_failures_total: AtomicU64,
    lease_contention_total: AtomicU64,
    rebate_entries_total: AtomicU64,
    rebate_amount_total: AtomicU64,
    duplicate_rebate_attempts_total: AtomicU64,
    rebate_retained_total: AtomicU64,
    sweep_runs_total: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub draws_total: u64,
    pub forced_positions_total: u64,
    pub fallback_positions_total: u64,
    pub draws_replaced_total: u64,
    pub bets_settled_total: u64,
    pub bets_won_total: u64,
    pub payout_total: u64,
    pub settlement_failures_total: u64,
    pub lease_contention_total: u64,
    pub rebate_entries_total: u64,
    pub rebate_amount_total: u64,
    pub duplicate_rebate_attempts_total: u64,
    pub rebate_retained_total: u64,
    pub sweep_runs_total: u64,
    pub uptime_seconds: u64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            draws_total: AtomicU64::new(0),
            forced_positions_total: AtomicU64::new(0),
            fallback_positions_total: AtomicU64::new(0),
            draws_replaced_total: AtomicU64::new(0),
            bets_settled_total: AtomicU64::new(0),
            bets_won_total: AtomicU64::new(0),
            payout_total: AtomicU64::new(0),
            settlement_failures_total: AtomicU64::new(0),
            lease_contention_total: AtomicU64::new(0),
            rebate_entries_total: AtomicU64::new(0),
            rebate_amount_total: AtomicU64::new(0),
            duplicate_rebate_attempts_total: AtomicU64::new(0),
            rebate_retained_total: AtomicU64::new(0),
            sweep_runs_total: AtomicU64::new(0),
        }
    }

    pub fn record_draw(&self, forced: usize, fallbacks: usize) {
        self.draws_total.fetch_add(1, Ordering::SeqCst);
        self.forced_positions_total.fetch_add(forced as u64, Ordering::SeqCst);
        self.fallback_positions_total.fetch_add(fallbacks as u64, Ordering::SeqCst);
    }

    pub fn record_draw_replaced(&self) {
        self.draws_replaced_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_bet_settled(&self, won: bool, payout: u64) {
        self.bets_settled_total.fetch_add(1, Ordering::SeqCst);
        if won {
            self.bets_won_total.fetch_add(1, Ordering::SeqCst);
            self.payout_total.fetch_add(payout, Ordering::SeqCst);
        }
    }

    pub fn record_settlement_failure(&self) {
        self.settlement_failures_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_lease_contention(&self) {
        self.lease_contention_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_rebate_entry(&self, amount: u64) {
        self.rebate_entries_total.fetch_add(1, Ordering::SeqCst);
        self.rebate_amount_total.fetch_add(amount, Ordering::SeqCst);
    }

    pub fn record_duplicate_rebate(&self) {
        self.duplicate_rebate_attempts_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_rebate_retained(&self, amount: u64) {
        self.rebate_retained_total.fetch_add(amount, Ordering::SeqCst);
    }

    pub fn record_sweep_run(&self) {
        self.sweep_runs_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn total_runtime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            draws_total: self.draws_total.load(Ordering::SeqCst),
            forced_positions_total: self.forced_positions_total.load(Ordering::SeqCst),
            fallback_positions_total: self.fallback_positions_total.load(Ordering::SeqCst),
            draws_replaced_total: self.draws_replaced_total.load(Ordering::SeqCst),
            bets_settled_total: self.bets_settled_total.load(Ordering::SeqCst),
            bets_won_total: self.bets_won_total.load(Ordering::SeqCst),
            payout_total: self.payout_total.load(Ordering::SeqCst),
            settlement_failures_total: self.settlement_failures_total.load(Ordering::SeqCst),
            lease_contention_total: self.lease_contention_total.load(Ordering::SeqCst),
            rebate_entries_total: self.rebate_entries_total.load(Ordering::SeqCst),
            rebate_amount_total: self.rebate_amount_total.load(Ordering::SeqCst),
            duplicate_rebate_attempts_total: self.duplicate_rebate_attempts_total.load(Ordering::SeqCst),
            rebate_retained_total: self.rebate_retained_total.load(Ordering::SeqCst),
            sweep_runs_total: self.sweep_runs_total.load(Ordering::SeqCst),
            uptime_seconds: self.total_runtime().as_secs(),
        }
    }

    /// Render all counters in Prometheus text exposition format
    pub fn to_prometheus_format(&self) -> String {
        let snapshot = self.snapshot();
        let mut output = String::new();

        let counters: [(&str, &str, u64); 14] = [
            ("racedraw_draws_total", "Draws published", snapshot.draws_total),
            ("racedraw_forced_positions_total", "Positions placed by a forced override", snapshot.forced_positions_total),
            ("racedraw_fallback_positions_total", "Positions sampled uniformly after a zero weight total", snapshot.fallback_positions_total),
            ("racedraw_draws_replaced_total", "Audited draw replacements", snapshot.draws_replaced_total),
            ("racedraw_bets_settled_total", "Bets settled", snapshot.bets_settled_total),
            ("racedraw_bets_won_total", "Bets settled as wins", snapshot.bets_won_total),
            ("racedraw_payout_total", "Payout credited in minor units", snapshot.payout_total),
            ("racedraw_settlement_failures_total", "Per-bet settlement failures", snapshot.settlement_failures_total),
            ("racedraw_lease_contention_total", "Lease acquisitions that found the lease held", snapshot.lease_contention_total),
            ("racedraw_rebate_entries_total", "Rebate ledger entries written", snapshot.rebate_entries_total),
            ("racedraw_rebate_amount_total", "Rebate credited in minor units", snapshot.rebate_amount_total),
            ("racedraw_duplicate_rebate_attempts_total", "Rebate writes skipped as duplicates", snapshot.duplicate_rebate_attempts_total),
            ("racedraw_rebate_retained_total", "Rebate pool retained by the platform in minor units", snapshot.rebate_retained_total),
            ("racedraw_sweep_runs_total", "Recovery sweep passes", snapshot.sweep_runs_total),
        ];

        for (name, help, value) in counters {
            output.push_str(&format!(
                "# HELP {name} {help}\n\
                 # TYPE {name} counter\n\
                 {name} {value}\n\n"
            ));
        }

        output.push_str(&format!(
            "# HELP racedraw_uptime_seconds Engine uptime\n\
             # TYPE racedraw_uptime_seconds gauge\n\
             racedraw_uptime_seconds {}\n",
            snapshot.uptime_seconds
        ));

        output
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = EngineMetrics::new();
        metrics.record_draw(2, 0);
        metrics.record_draw(0, 1);
        metrics.record_bet_settled(true, 985);
        metrics.record_bet_settled(false, 0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.draws_total, 2);
        assert_eq!(snapshot.forced_positions_total, 2);
        assert_eq!(snapshot.fallback_positions_total, 1);
        assert_eq!(snapshot.bets_settled_total, 2);
        assert_eq!(snapshot.bets_won_total, 1);
        assert_eq!(snapshot.payout_total, 985);
    }

    #[test]
    fn test_prometheus_rendering() {
        let metrics = EngineMetrics::new();
        metrics.record_rebate_entry(500);
        let text = metrics.to_prometheus_format();
        assert!(text.contains("# TYPE racedraw_rebate_entries_total counter"));
        assert!(text.contains("racedraw_rebate_amount_total 500"));
        assert!(text.contains("racedraw_uptime_seconds"));
    }
}
