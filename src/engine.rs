//! Engine facade
//!
//! `DrawEngine` wires the collaborators from one store into the draw
//! controller, the settlement engine and the rebate distributor, and exposes
//! the period-clock hooks the scheduler drives.

use crate::common::config::{ConfigLoader, EngineConfig};
use crate::common::traits::{BetRepository, DirectiveStore, PeriodStore};
use crate::common::types::{current_timestamp_ms, Amount, BetId, MemberId, Odds, PeriodId};
use crate::coordinator::{ConsistencyCoordinator, LeaseScope};
use crate::errors::{DrawError, EngineError, EngineResult, StorageError};
use crate::games::draw::{fresh_seed, DrawController};
use crate::games::ingest::RawBet;
use crate::games::rebate::{RebateDistributor, RebateReport};
use crate::games::settlement::{SettlementEngine, SettlementReport};
use crate::games::types::{Bet, DrawAudit, DrawResult, Period, PeriodPhase};
use crate::games::weights::BetAggregate;
use crate::metrics::EngineMetrics;
use crate::scheduler::GameState;
use crate::store::EngineStore;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct DrawEngine {
    periods: Arc<dyn PeriodStore>,
    bets: Arc<dyn BetRepository>,
    directives: Arc<dyn DirectiveStore>,
    controller: DrawController,
    settlement: SettlementEngine,
    rebates: RebateDistributor,
    coordinator: ConsistencyCoordinator,
    metrics: Arc<EngineMetrics>,
    config: EngineConfig,
}

impl DrawEngine {
    /// Wire an engine over `store`. The configuration is validated the same
    /// way the loader validates a file.
    pub fn new<S: EngineStore>(store: Arc<S>, config: EngineConfig) -> EngineResult<Self> {
        ConfigLoader::new().validate(&config)?;
        let coordinator = ConsistencyCoordinator::new();
        let metrics = Arc::new(EngineMetrics::new());

        let settlement = SettlementEngine::new(
            store.clone(),
            store.clone(),
            coordinator.clone(),
            metrics.clone(),
            config.settlement.clone(),
        );
        let rebates = RebateDistributor::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            coordinator.clone(),
            metrics.clone(),
            config.rebate.clone(),
        );

        Ok(Self {
            periods: store.clone(),
            bets: store.clone(),
            directives: store,
            controller: DrawController::new(config.draw.clone()),
            settlement,
            rebates,
            coordinator,
            metrics,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    pub fn coordinator(&self) -> &ConsistencyCoordinator {
        &self.coordinator
    }

    /// Open `id` for betting and make it the scheduler's current period
    pub async fn open_period(&self, state: &mut GameState, id: PeriodId) -> EngineResult<Period> {
        let period = Period::open(id);
        self.periods.open_period(period.clone()).await?;
        state.current = Some(id);
        state.phase = PeriodPhase::Betting;
        info!(period = %id, "Betting open");
        Ok(period)
    }

    /// Parse a front-end wager and place it on an open period
    pub async fn place_bet(
        &self,
        id: BetId,
        period: PeriodId,
        member: MemberId,
        raw: &RawBet,
        stake: Amount,
        odds: Odds,
    ) -> EngineResult<Bet> {
        let kind = raw.parse()?;
        let bet = Bet::new(id, period, member, kind, stake, odds);
        self.bets.place_bet(bet.clone()).await?;
        debug!(period = %period, bet_id = %id, member = %bet.member, stake, "Bet placed");
        Ok(bet)
    }

    /// Period clock: betting closed. Moves the period to `drawing` and draws
    /// synchronously; the next period must not open until this returns.
    pub async fn on_period_drawing(&self, state: &mut GameState, period: PeriodId) -> EngineResult<DrawResult> {
        let row = self
            .periods
            .period(period)
            .await?
            .ok_or(StorageError::PeriodNotFound(period))?;
        if row.phase == PeriodPhase::Betting {
            self.periods.advance_phase(period, PeriodPhase::Drawing).await?;
        }
        state.phase = PeriodPhase::Drawing;
        self.compute_draw(state, period).await
    }

    /// Generate, validate and publish the period's draw. A period that
    /// already has a published draw returns it unchanged.
    pub async fn compute_draw(&self, state: &mut GameState, period: PeriodId) -> EngineResult<DrawResult> {
        if let Some(existing) = self.periods.draw(period).await? {
            debug!(period = %period, "Draw already published");
            return Ok(existing.result);
        }

        let bets = self.bets.unsettled_bets(period).await?;
        let aggregate = BetAggregate::from_bets(&bets);
        let directives = self.directives.active_directives(period).await?;

        let outcome = match self
            .controller
            .generate(period, &directives, &aggregate, &mut state.risk, fresh_seed())
        {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(period = %period, error = %e, "Draw generation failed, period halted");
                return Err(e.into());
            }
        };

        let result = outcome.record.result;
        match self.periods.publish_draw(outcome.record).await {
            Ok(()) => {}
            Err(EngineError::Draw(DrawError::AlreadyPublished(_))) => {
                // Lost a race with another drawer; the stored draw wins
                let stored = self.periods.draw(period).await?.ok_or(DrawError::NotPublished(period))?;
                return Ok(stored.result);
            }
            Err(e) => return Err(e),
        }

        self.metrics
            .record_draw(outcome.plan.forced.len(), outcome.uniform_fallbacks);
        state.last_draw = Some((period, result));
        info!(
            period = %period,
            result = %result,
            bets = bets.len(),
            directives = directives.len(),
            forced = outcome.plan.forced.len(),
            "Draw published"
        );
        Ok(result)
    }

    pub async fn settle_period(&self, period: PeriodId, draw: &DrawResult) -> EngineResult<SettlementReport> {
        self.settlement.settle_period(period, draw).await
    }

    pub async fn distribute_rebates(&self, period: PeriodId, report: &SettlementReport) -> EngineResult<RebateReport> {
        self.rebates.distribute_rebates(period, report).await
    }

    /// Settle against the published draw, then distribute rebates once the
    /// settlement has fully committed. Returns `None` for rebates when the
    /// period is not settled yet.
    pub async fn settle_and_distribute(
        &self,
        period: PeriodId,
    ) -> EngineResult<(SettlementReport, Option<RebateReport>)> {
        let draw = self.periods.draw(period).await?.ok_or(DrawError::NotPublished(period))?;
        let report = self.settle_period(period, &draw.result).await?;

        let settled = self
            .periods
            .period(period)
            .await?
            .map_or(false, |p| p.phase == PeriodPhase::Settled);
        if !settled {
            return Ok((report, None));
        }

        let rebates = self.distribute_rebates(period, &report).await?;
        Ok((report, Some(rebates)))
    }

    /// Period clock: settle. Runs off the scheduler path.
    pub fn on_period_settle(self: &Arc<Self>, period: PeriodId) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            match engine.settle_and_distribute(period).await {
                Ok((report, rebates)) => {
                    if !report.failures.is_empty() {
                        warn!(
                            period = %period,
                            failures = report.failures.len(),
                            "Settlement left bets for the recovery sweep"
                        );
                    }
                    if let Some(rebates) = rebates {
                        debug!(period = %period, status = ?rebates.status, "Rebates processed");
                    }
                }
                Err(e) if e.is_fatal() => error!(period = %period, error = %e, "Settlement halted"),
                Err(e) => warn!(period = %period, error = %e, "Settlement failed, sweep will retry"),
            }
        })
    }

    /// Operator correction of a published draw. Only allowed before any bet
    /// of the period is settled, and always leaves an audit entry. Holds the
    /// settlement lease for the duration so no settlement run can start
    /// against the old result.
    pub async fn replace_draw(
        &self,
        period: PeriodId,
        replacement: DrawResult,
        operator: &str,
        reason: &str,
    ) -> EngineResult<DrawAudit> {
        DrawResult::validate(replacement.values())?;
        let _lease = self
            .coordinator
            .try_acquire(LeaseScope::Settlement, period, self.config.settlement.lease_ttl())
            .map_err(|e| {
                self.metrics.record_lease_contention();
                warn!(period = %period, error = %e, "Settlement in progress, draw not replaced");
                e
            })?;
        let previous = self.periods.draw(period).await?.ok_or(DrawError::NotPublished(period))?;

        let audit = DrawAudit {
            period,
            previous_digest: previous.digest.clone(),
            previous: previous.result,
            replacement_digest: replacement.digest(),
            replacement,
            operator: operator.to_string(),
            reason: reason.to_string(),
            replaced_at: current_timestamp_ms(),
        };
        self.periods.replace_draw(period, replacement, audit.clone()).await?;
        self.metrics.record_draw_replaced();
        warn!(
            period = %period,
            operator,
            previous = %previous.result,
            replacement = %replacement,
            "Draw replaced"
        );
        Ok(audit)
    }

    pub async fn draw_audits(&self, period: PeriodId) -> EngineResult<Vec<DrawAudit>> {
        self.periods.draw_audits(period).await
    }

    pub async fn period(&self, id: PeriodId) -> EngineResult<Option<Period>> {
        self.periods.period(id).await
    }

    /// Periods the recovery sweep should revisit
    pub async fn recovery_candidates(&self) -> EngineResult<Vec<Period>> {
        self.periods.recovery_candidates().await
    }

    /// Close and draw a period the scheduler left behind. Auto-risk
    /// hysteresis lives in the scheduler's state, so this draw starts from a
    /// neutral risk state.
    pub async fn recover_draw(&self, period: PeriodId) -> EngineResult<DrawResult> {
        let mut state = GameState::default();
        self.on_period_drawing(&mut state, period).await
    }

    /// Re-run rebates for a settled period without a settlement report
    pub async fn retry_rebates(&self, period: PeriodId) -> EngineResult<RebateReport> {
        self.distribute_rebates(period, &SettlementReport::skipped(period)).await
    }
}
