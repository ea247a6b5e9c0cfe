//! Settlement Module
//!
//! Classifies every unsettled bet of a period against its published draw and
//! writes each result as its own atomic unit (status, payout credit, journal
//! row). One failing bet never blocks the rest; it stays unsettled and the
//! recovery sweep picks it up. Running settlement twice is a no-op for bets
//! that already settled.

use crate::common::config::SettlementConfig;
use crate::common::traits::{BetRepository, MarkOutcome, PeriodStore};
use crate::common::types::{Amount, BetId, MemberId, PeriodId};
use crate::coordinator::{ConsistencyCoordinator, LeaseScope};
use crate::errors::{DrawError, EngineResult, LeaseError, SettlementError, StorageError};
use crate::games::types::{Bet, BetKind, BetOutcome, DragonTigerPick, DrawResult, PeriodPhase, SumPick};
use crate::metrics::EngineMetrics;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How far a settlement run got
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    /// Every bet of the period is settled and the period is marked settled
    Completed,
    /// Some bets remain unsettled (per-bet failures or a lost lease)
    Partial,
    /// Another run holds the lease; nothing was done
    Skipped,
}

/// A bet left unsettled by this run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BetFailure {
    pub bet_id: BetId,
    pub reason: String,
}

/// Result of one `settle_period` run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SettlementReport {
    pub period: PeriodId,
    pub status: SettlementStatus,
    /// Bets settled by this run
    pub settled: usize,
    /// Bets a previous run had already settled
    pub already_settled: usize,
    pub wins: usize,
    pub losses: usize,
    pub payout_total: Amount,
    pub failures: Vec<BetFailure>,
    pub remaining_unsettled: usize,
    /// Settled stake per member across the whole period, the rebate base
    pub member_stakes: BTreeMap<MemberId, Amount>,
}

impl SettlementReport {
    pub(crate) fn skipped(period: PeriodId) -> Self {
        Self {
            period,
            status: SettlementStatus::Skipped,
            settled: 0,
            already_settled: 0,
            wins: 0,
            losses: 0,
            payout_total: 0,
            failures: Vec::new(),
            remaining_unsettled: 0,
            member_stakes: BTreeMap::new(),
        }
    }

    /// True once every bet of the period is settled
    pub fn is_committed(&self) -> bool {
        self.status == SettlementStatus::Completed
    }
}

/// Win or loss of `kind` under `draw`. A dragon/tiger tie is a loss for both
/// sides; it cannot occur between two distinct positions of a valid draw.
pub fn classify(kind: &BetKind, draw: &DrawResult, sum_big_threshold: u8) -> BetOutcome {
    let won = match *kind {
        BetKind::Number { position, value } => draw.at(position) == value,
        BetKind::TwoSided { position, pick } => pick.matches(draw.at(position)),
        BetKind::Sum { pick } => {
            let sum = draw.leading_sum();
            match pick {
                SumPick::Value(v) => sum == v,
                SumPick::Big => sum >= sum_big_threshold,
                SumPick::Small => sum < sum_big_threshold,
                SumPick::Odd => sum % 2 == 1,
                SumPick::Even => sum % 2 == 0,
            }
        }
        BetKind::DragonTiger { first, second, pick } => {
            let (a, b) = (draw.at(first), draw.at(second));
            match pick {
                DragonTigerPick::Dragon => a > b,
                DragonTigerPick::Tiger => a < b,
            }
        }
    };

    if won {
        BetOutcome::Win
    } else {
        BetOutcome::Lose
    }
}

/// Sum of settled stake per member
pub fn member_stakes<'a>(bets: impl IntoIterator<Item = &'a Bet>) -> BTreeMap<MemberId, Amount> {
    let mut stakes = BTreeMap::new();
    for bet in bets.into_iter().filter(|b| b.is_settled()) {
        let entry = stakes.entry(bet.member.clone()).or_insert(0);
        *entry += bet.stake;
    }
    stakes
}

/// Period settlement over the bet repository
pub struct SettlementEngine {
    bets: Arc<dyn BetRepository>,
    periods: Arc<dyn PeriodStore>,
    coordinator: ConsistencyCoordinator,
    metrics: Arc<EngineMetrics>,
    config: SettlementConfig,
}

impl SettlementEngine {
    pub fn new(
        bets: Arc<dyn BetRepository>,
        periods: Arc<dyn PeriodStore>,
        coordinator: ConsistencyCoordinator,
        metrics: Arc<EngineMetrics>,
        config: SettlementConfig,
    ) -> Self {
        Self {
            bets,
            periods,
            coordinator,
            metrics,
            config,
        }
    }

    /// Settle every unsettled bet of `period` against `draw`, which must be
    /// the published result. Returns a `Skipped` report when another run
    /// holds the period's settlement lease.
    pub async fn settle_period(&self, period: PeriodId, draw: &DrawResult) -> EngineResult<SettlementReport> {
        let row = self
            .periods
            .period(period)
            .await?
            .ok_or(StorageError::PeriodNotFound(period))?;
        if row.phase == PeriodPhase::Betting {
            return Err(DrawError::NotPublished(period).into());
        }

        let published = self.periods.draw(period).await?.ok_or(DrawError::NotPublished(period))?;
        if published.result != *draw {
            warn!(period = %period, given = %draw, published = %published.result, "Settlement draw does not match");
            return Err(DrawError::Mismatch(period).into());
        }

        let lease = match self
            .coordinator
            .try_acquire(LeaseScope::Settlement, period, self.config.lease_ttl())
        {
            Ok(lease) => lease,
            Err(LeaseError::LeaseUnavailable(key)) => {
                self.metrics.record_lease_contention();
                info!(period = %period, lease = %key, "Settlement already running elsewhere, skipping");
                return Ok(SettlementReport::skipped(period));
            }
            Err(e) => return Err(e.into()),
        };

        let pending = self.bets.unsettled_bets(period).await?;
        let mut report = SettlementReport::skipped(period);
        report.status = SettlementStatus::Partial;
        let mut lease_lost = false;

        for (i, bet) in pending.iter().enumerate() {
            if i > 0 && i % self.config.lease_check_every.max(1) == 0 && lease.renew().is_err() {
                warn!(period = %period, "{}", SettlementError::LeaseLost(period));
                lease_lost = true;
                break;
            }
            self.settle_bet(period, bet, draw, &mut report).await;
        }

        let remaining = self.bets.unsettled_bets(period).await?;
        report.remaining_unsettled = remaining.len();

        if remaining.is_empty() && !lease_lost {
            let current = self
                .periods
                .period(period)
                .await?
                .ok_or(StorageError::PeriodNotFound(period))?;
            if current.phase == PeriodPhase::Drawing {
                self.periods.advance_phase(period, PeriodPhase::Settled).await?;
            }
            report.status = SettlementStatus::Completed;
        }
        drop(lease);

        let settled = self.bets.settled_bets(period).await?;
        report.member_stakes = member_stakes(&settled);

        info!(
            period = %period,
            status = ?report.status,
            settled = report.settled,
            already_settled = report.already_settled,
            wins = report.wins,
            payout = report.payout_total,
            failures = report.failures.len(),
            remaining = report.remaining_unsettled,
            "Settlement run finished"
        );

        Ok(report)
    }

    async fn settle_bet(&self, period: PeriodId, bet: &Bet, draw: &DrawResult, report: &mut SettlementReport) {
        if bet.period != period {
            self.fail(report, bet.id, SettlementError::WrongPeriod(bet.id).to_string());
            return;
        }

        let outcome = classify(&bet.kind, draw, self.config.sum_big_threshold);
        let payout = match outcome {
            BetOutcome::Win => bet.odds.payout(bet.stake),
            BetOutcome::Lose => 0,
        };

        match self.bets.mark_settled(bet.id, outcome, payout).await {
            Ok(MarkOutcome::Applied) => {
                report.settled += 1;
                match outcome {
                    BetOutcome::Win => {
                        report.wins += 1;
                        report.payout_total += payout;
                    }
                    BetOutcome::Lose => report.losses += 1,
                }
                self.metrics.record_bet_settled(outcome == BetOutcome::Win, payout);
                debug!(period = %period, bet_id = %bet.id, ?outcome, payout, "Bet settled");
            }
            Ok(MarkOutcome::AlreadySettled) => {
                report.already_settled += 1;
                debug!(period = %period, bet_id = %bet.id, "Bet already settled, skipping");
            }
            Err(e) => {
                let failure = SettlementError::PerBetSettlementFailure {
                    bet_id: bet.id,
                    reason: e.to_string(),
                };
                self.fail(report, bet.id, failure.to_string());
            }
        }
    }

    fn fail(&self, report: &mut SettlementReport, bet_id: BetId, reason: String) {
        warn!(period = %report.period, bet_id = %bet_id, reason = %reason, "Bet left unsettled");
        self.metrics.record_settlement_failure();
        report.failures.push(BetFailure { bet_id, reason });
    }
}
