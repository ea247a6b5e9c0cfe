//! Period scheduler
//!
//! Drives periods on a fixed cadence: open for betting, close after the
//! betting window, draw synchronously, hand settlement to a background task,
//! then wait out the rest of the interval. The scheduler owns the only
//! `GameState` and lends it to the engine; there is no shared game state.

use crate::common::config::SchedulerConfig;
use crate::common::types::PeriodId;
use crate::engine::DrawEngine;
use crate::errors::{EngineError, EngineResult, StorageError};
use crate::games::types::{DrawResult, PeriodPhase};
use crate::games::weights::RiskState;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Attempts at finding a free period id before giving up
const OPEN_ATTEMPTS: u32 = 16;

/// Scheduler-owned game state
#[derive(Debug, Clone)]
pub struct GameState {
    pub current: Option<PeriodId>,
    /// Phase of `current`. Settlement finishes in the background, so the move
    /// to `Settled` is picked up from the store by `sync_phase`.
    pub phase: PeriodPhase,
    /// Auto-risk hysteresis, carried across periods
    pub risk: RiskState,
    pub last_draw: Option<(PeriodId, DrawResult)>,
    pub periods_run: u64,
}

impl Default for GameState {
    fn default() -> Self {
        Self {
            current: None,
            phase: PeriodPhase::Settled,
            risk: RiskState::default(),
            last_draw: None,
            periods_run: 0,
        }
    }
}

/// Open period announcements; `None` while betting is closed
pub type OpenPeriodReceiver = watch::Receiver<Option<PeriodId>>;

pub struct PeriodScheduler {
    engine: Arc<DrawEngine>,
    config: SchedulerConfig,
    state: GameState,
    open_tx: watch::Sender<Option<PeriodId>>,
    running: Arc<AtomicBool>,
    settlements: Vec<JoinHandle<()>>,
}

impl PeriodScheduler {
    pub fn new(engine: Arc<DrawEngine>, config: SchedulerConfig) -> Self {
        let (open_tx, _) = watch::channel(None);
        Self {
            engine,
            config,
            state: GameState::default(),
            open_tx,
            running: Arc::new(AtomicBool::new(true)),
            settlements: Vec::new(),
        }
    }

    pub fn state(&self) -> &GameState {
        &self.state
    }

    /// Subscribe to open-period announcements
    pub fn subscribe(&self) -> OpenPeriodReceiver {
        self.open_tx.subscribe()
    }

    /// Handle that stops the loop after the current period
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    fn next_candidate(&self) -> PeriodId {
        let today = Utc::now().date_naive();
        match self.state.current {
            Some(current) => current.next_on(today),
            None => PeriodId::first_of(today),
        }
    }

    /// Open the next free period id
    pub async fn open_next(&mut self) -> EngineResult<PeriodId> {
        let mut candidate = self.next_candidate();
        for _ in 0..OPEN_ATTEMPTS {
            match self.engine.open_period(&mut self.state, candidate).await {
                Ok(_) => {
                    self.open_tx.send_replace(Some(candidate));
                    return Ok(candidate);
                }
                Err(EngineError::Storage(StorageError::PeriodExists(_))) => {
                    warn!(period = %candidate, "Period id already used, trying next");
                    candidate = candidate.next();
                }
                Err(e) => return Err(e),
            }
        }
        Err(StorageError::PeriodExists(candidate).into())
    }

    /// Close betting on the current period and draw it
    pub async fn close_and_draw(&mut self, period: PeriodId) -> EngineResult<DrawResult> {
        self.open_tx.send_replace(None);
        self.engine.on_period_drawing(&mut self.state, period).await
    }

    /// Refresh `GameState::phase` from the stored row of the current period
    pub async fn sync_phase(&mut self) -> EngineResult<PeriodPhase> {
        if let Some(current) = self.state.current {
            if let Some(row) = self.engine.period(current).await? {
                self.state.phase = row.phase;
            }
        }
        Ok(self.state.phase)
    }

    /// One full period: open, betting window, draw, background settlement
    pub async fn run_period(&mut self) -> EngineResult<(PeriodId, DrawResult)> {
        if let Err(e) = self.sync_phase().await {
            warn!(error = %e, "Could not refresh period phase");
        }
        let period = self.open_next().await?;
        tokio::time::sleep(Duration::from_millis(self.config.betting_window_ms)).await;

        let draw = self.close_and_draw(period).await?;
        self.settlements.push(self.engine.on_period_settle(period));
        self.settlements.retain(|h| !h.is_finished());
        self.state.periods_run += 1;

        let rest = self
            .config
            .period_interval_ms
            .saturating_sub(self.config.betting_window_ms);
        tokio::time::sleep(Duration::from_millis(rest)).await;
        Ok((period, draw))
    }

    /// Run `limit` periods, or until stopped. A fatal error halts the loop;
    /// anything else is logged and the next period opens.
    pub async fn run(&mut self, limit: Option<u64>) -> EngineResult<()> {
        let mut completed = 0u64;
        while self.running.load(Ordering::SeqCst) && limit.map_or(true, |n| completed < n) {
            match self.run_period().await {
                Ok((period, draw)) => info!(period = %period, result = %draw, "Period complete"),
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "Fatal error, halting period progression");
                    return Err(e);
                }
                Err(e) => warn!(error = %e, "Period failed"),
            }
            completed += 1;
        }
        self.drain().await;
        Ok(())
    }

    /// Wait for outstanding background settlements
    pub async fn drain(&mut self) {
        for handle in self.settlements.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "Settlement task panicked");
            }
        }
        if let Err(e) = self.sync_phase().await {
            warn!(error = %e, "Could not refresh period phase");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::EngineConfig;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_scheduler_runs_and_settles_periods() {
        let config = EngineConfig::for_testing();
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(DrawEngine::new(store.clone(), config.clone()).unwrap());
        let mut scheduler = PeriodScheduler::new(engine.clone(), config.scheduler.clone());

        scheduler.run(Some(2)).await.unwrap();

        assert_eq!(scheduler.state().periods_run, 2);
        assert_eq!(scheduler.state().phase, PeriodPhase::Settled);
        let (last, _) = scheduler.state().last_draw.unwrap();
        let period = crate::common::traits::PeriodStore::period(store.as_ref(), last)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(period.phase, PeriodPhase::Settled);
        assert!(period.rebates_completed_at.is_some());
        assert_eq!(engine.metrics().snapshot().draws_total, 2);
    }

    #[tokio::test]
    async fn test_subscribers_see_open_window() {
        let config = EngineConfig::for_testing();
        let engine = Arc::new(DrawEngine::new(Arc::new(MemoryStore::new()), config.clone()).unwrap());
        let mut scheduler = PeriodScheduler::new(engine, config.scheduler.clone());
        let rx = scheduler.subscribe();

        let period = scheduler.open_next().await.unwrap();
        assert_eq!(*rx.borrow(), Some(period));

        scheduler.close_and_draw(period).await.unwrap();
        assert_eq!(*rx.borrow(), None);
        assert_eq!(scheduler.state().phase, PeriodPhase::Drawing);

        scheduler.engine.settle_and_distribute(period).await.unwrap();
        assert_eq!(scheduler.sync_phase().await.unwrap(), PeriodPhase::Settled);
        assert_eq!(scheduler.state().phase, PeriodPhase::Settled);
    }
}
