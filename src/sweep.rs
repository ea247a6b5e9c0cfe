//! Recovery sweep
//!
//! Background worker that converges periods the normal path left behind.
//! Periods that never got a draw are closed and drawn once they stall; drawn
//! periods still holding unsettled bets past the settle deadline are settled
//! again, and settled periods whose rebate run never completed get rebates.
//! Every retry goes through the same leases and idempotent writes as the
//! first attempt.

use crate::common::config::SweepConfig;
use crate::common::types::current_timestamp_ms;
use crate::engine::DrawEngine;
use crate::errors::EngineResult;
use crate::games::types::{Period, PeriodPhase};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What one sweep pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepSummary {
    pub candidates: usize,
    pub draws_recovered: usize,
    pub settlements_retried: usize,
    pub rebates_retried: usize,
    pub errors: usize,
}

pub struct RecoverySweep {
    engine: Arc<DrawEngine>,
    config: SweepConfig,
    running: Arc<AtomicBool>,
}

impl RecoverySweep {
    pub fn new(engine: Arc<DrawEngine>, config: SweepConfig) -> Self {
        Self {
            engine,
            config,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Start the periodic worker
    pub fn spawn(engine: Arc<DrawEngine>, config: SweepConfig) -> Arc<Self> {
        let sweep = Arc::new(Self::new(engine, config));
        sweep.clone().spawn_task();
        sweep
    }

    fn spawn_task(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(self.config.interval_ms.max(1)));
            info!(interval_ms = self.config.interval_ms, "Recovery sweep started");

            while self.running.load(Ordering::SeqCst) {
                tick.tick().await;
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }
                match self.run_once().await {
                    Ok(summary) if summary.candidates > 0 => debug!(?summary, "Sweep pass finished"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Sweep pass failed"),
                }
            }
            info!("Recovery sweep stopped");
        });
    }

    fn is_due(&self, period: &Period, now: u64) -> bool {
        let stalled = period.opened_at.saturating_add(self.config.stalled_period_ms) <= now;
        match (period.phase, period.drawn_at) {
            (PeriodPhase::Betting, _) | (PeriodPhase::Drawing, None) => stalled,
            (PeriodPhase::Drawing, Some(drawn)) => drawn.saturating_add(self.config.settle_deadline_ms) <= now,
            (PeriodPhase::Settled, _) => period.rebates_completed_at.is_none(),
        }
    }

    /// One pass over the recovery candidates
    pub async fn run_once(&self) -> EngineResult<SweepSummary> {
        self.engine.metrics().record_sweep_run();
        let now = current_timestamp_ms();
        let candidates = self.engine.recovery_candidates().await?;
        let mut summary = SweepSummary::default();

        for period in candidates.iter().filter(|p| self.is_due(p, now)) {
            summary.candidates += 1;
            let outcome = match (period.phase, period.drawn_at) {
                (PeriodPhase::Betting, _) | (PeriodPhase::Drawing, None) => {
                    summary.draws_recovered += 1;
                    warn!(period = %period.id, phase = %period.phase, "Stalled period, drawing it now");
                    match self.engine.recover_draw(period.id).await {
                        Ok(_) => self.engine.settle_and_distribute(period.id).await.map(|_| ()),
                        Err(e) => Err(e),
                    }
                }
                (PeriodPhase::Drawing, Some(_)) => {
                    summary.settlements_retried += 1;
                    info!(period = %period.id, "Retrying settlement");
                    self.engine.settle_and_distribute(period.id).await.map(|_| ())
                }
                _ => {
                    summary.rebates_retried += 1;
                    info!(period = %period.id, "Retrying rebates");
                    self.engine.retry_rebates(period.id).await.map(|_| ())
                }
            };
            match outcome {
                Ok(()) => {}
                Err(e) if e.is_retryable() => {
                    summary.errors += 1;
                    warn!(period = %period.id, error = %e, "Recovery attempt failed, will retry");
                }
                Err(e) => {
                    summary.errors += 1;
                    error!(period = %period.id, error = %e, "Recovery attempt failed");
                }
            }
        }

        Ok(summary)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::EngineConfig;
    use crate::common::traits::{BalanceLedger, BetRepository, PeriodStore};
    use crate::common::types::{BetId, MemberId, Odds};
    use crate::games::ingest::RawBet;
    use crate::scheduler::GameState;
    use crate::store::MemoryStore;
    use crate::games::types::BalanceReason;

    #[tokio::test]
    async fn test_sweep_settles_failed_bet_on_retry() {
        let config = EngineConfig::for_testing();
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(DrawEngine::new(store.clone(), config.clone()).unwrap());
        let mut state = GameState::default();
        let period = crate::common::types::PeriodId(20260101_0001);
        let alice = MemberId::from("alice");

        store
            .credit(&alice, 10_000, BalanceReason::Adjustment { note: "deposit".into() })
            .await
            .unwrap();
        engine.open_period(&mut state, period).await.unwrap();
        for (id, value) in [(1u64, "big"), (2, "small")] {
            engine
                .place_bet(
                    BetId(id),
                    period,
                    alice.clone(),
                    &RawBet::new("two_sided", Some("1"), value),
                    1_000,
                    Odds::from_decimal(1.98),
                )
                .await
                .unwrap();
        }
        engine.on_period_drawing(&mut state, period).await.unwrap();

        store.fail_settlement_for(BetId(2));
        let (report, rebates) = engine.settle_and_distribute(period).await.unwrap();
        assert_eq!(report.failures.len(), 1);
        assert!(rebates.is_none());
        assert_eq!(store.unsettled_bets(period).await.unwrap().len(), 1);

        store.clear_settlement_failures();
        let sweep = RecoverySweep::new(engine.clone(), config.sweep.clone());
        let summary = sweep.run_once().await.unwrap();
        assert_eq!(summary.settlements_retried, 1);
        assert_eq!(summary.errors, 0);

        let row = store.period(period).await.unwrap().unwrap();
        assert_eq!(row.phase, PeriodPhase::Settled);
        assert!(row.rebates_completed_at.is_some());

        // Nothing left to do
        assert_eq!(sweep.run_once().await.unwrap().candidates, 0);
    }

    #[tokio::test]
    async fn test_sweep_draws_period_whose_publish_failed() {
        let config = EngineConfig::for_testing();
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(DrawEngine::new(store.clone(), config.clone()).unwrap());
        let mut state = GameState::default();
        let period = crate::common::types::PeriodId(20260101_0002);
        let alice = MemberId::from("alice");

        store
            .credit(&alice, 10_000, BalanceReason::Adjustment { note: "deposit".into() })
            .await
            .unwrap();
        engine.open_period(&mut state, period).await.unwrap();
        engine
            .place_bet(
                BetId(1),
                period,
                alice.clone(),
                &RawBet::new("number", Some("3"), "3"),
                1_000,
                Odds::from_decimal(9.85),
            )
            .await
            .unwrap();

        store.fail_draw_for(period);
        let err = engine.on_period_drawing(&mut state, period).await.unwrap_err();
        assert!(err.is_retryable());
        let row = store.period(period).await.unwrap().unwrap();
        assert_eq!(row.phase, PeriodPhase::Drawing);
        assert!(row.drawn_at.is_none());

        store.clear_draw_failures();
        let mut sweep_config = config.sweep.clone();
        sweep_config.stalled_period_ms = 0;
        let sweep = RecoverySweep::new(engine.clone(), sweep_config);
        let summary = sweep.run_once().await.unwrap();
        assert_eq!(summary.draws_recovered, 1);
        assert_eq!(summary.errors, 0);

        let row = store.period(period).await.unwrap().unwrap();
        assert_eq!(row.phase, PeriodPhase::Settled);
        assert!(store.draw(period).await.unwrap().is_some());
        assert!(store.unsettled_bets(period).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_leaves_fresh_betting_window_alone() {
        let config = EngineConfig::for_testing();
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(DrawEngine::new(store.clone(), config.clone()).unwrap());
        let mut state = GameState::default();
        let period = crate::common::types::PeriodId(20260101_0003);
        engine.open_period(&mut state, period).await.unwrap();

        let mut sweep_config = config.sweep.clone();
        sweep_config.stalled_period_ms = 60_000;
        let patient = RecoverySweep::new(engine.clone(), sweep_config.clone());
        assert_eq!(patient.run_once().await.unwrap().candidates, 0);
        assert_eq!(store.period(period).await.unwrap().unwrap().phase, PeriodPhase::Betting);

        // Abandoned window: closed, drawn and settled
        sweep_config.stalled_period_ms = 0;
        let eager = RecoverySweep::new(engine.clone(), sweep_config);
        assert_eq!(eager.run_once().await.unwrap().draws_recovered, 1);
        let row = store.period(period).await.unwrap().unwrap();
        assert_eq!(row.phase, PeriodPhase::Settled);
        assert!(row.rebates_completed_at.is_some());
    }
}
