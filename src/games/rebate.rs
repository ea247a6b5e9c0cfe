//! Rebate distribution
//!
//! After a period's settlement has fully committed, each member's settled
//! stake funds a rebate pool of `stake * market cap`. The member's agent
//! chain is walked nearest first; every agent receives only the part of its
//! assigned rate not already paid out below it, and an agent assigned at or
//! above the cap claims everything left in the pool. Whatever nobody claims
//! stays with the platform.

use crate::common::config::RebateConfig;
use crate::common::traits::{AgentHierarchy, BetRepository, PeriodStore, RebateLedger, RecordOutcome};
use crate::common::types::{current_timestamp_ms, Amount, BasisPoints, MemberId, PeriodId};
use crate::coordinator::{ConsistencyCoordinator, LeaseScope};
use crate::errors::{EngineResult, LeaseError, RebateError, StorageError};
use crate::games::settlement::{member_stakes, SettlementReport};
use crate::games::types::{AgentChainLink, PeriodPhase, RebateKey, RebateLedgerEntry};
use crate::metrics::EngineMetrics;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One agent's cut of a member's stake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebateShare {
    pub agent: MemberId,
    /// Rate actually paid to this agent (assigned minus what was paid below)
    pub rate: BasisPoints,
    pub amount: Amount,
}

/// Outcome of walking one member's chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebateSplit {
    pub pool: Amount,
    pub shares: Vec<RebateShare>,
    pub retained: Amount,
}

/// Walk `chain` nearest to farthest and split `stake * cap` between agents.
///
/// Each amount is the difference of floored running totals, so the shares
/// plus the retained remainder always add up to the pool exactly.
pub fn split_rebate(stake: Amount, chain: &[AgentChainLink], cap: BasisPoints) -> RebateSplit {
    let pool = cap.apply(stake);
    let mut shares = Vec::new();
    let mut distributed = BasisPoints::ZERO;
    let mut paid: Amount = 0;

    for link in chain {
        if distributed >= cap {
            break;
        }

        if link.rebate >= cap {
            let amount = pool - paid;
            shares.push(RebateShare {
                agent: link.agent.clone(),
                rate: cap.saturating_sub(distributed),
                amount,
            });
            paid = pool;
            break;
        }

        let actual = link.rebate.saturating_sub(distributed);
        if actual == BasisPoints::ZERO {
            continue;
        }
        let actual = actual.min(cap.saturating_sub(distributed));
        let reached = BasisPoints(distributed.0 + actual.0);
        let amount = reached.apply(stake) - distributed.apply(stake);
        distributed = reached;
        paid += amount;
        shares.push(RebateShare {
            agent: link.agent.clone(),
            rate: actual,
            amount,
        });
    }

    RebateSplit {
        pool,
        shares,
        retained: pool - paid,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RebateStatus {
    Completed,
    /// Some members were skipped and are left for the sweep
    Partial,
    /// Another run holds the lease
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemberFailure {
    pub member: MemberId,
    pub reason: String,
}

/// Result of one `distribute_rebates` run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RebateReport {
    pub period: PeriodId,
    pub status: RebateStatus,
    pub members: usize,
    pub entries_written: usize,
    pub duplicates_skipped: usize,
    pub total_rebated: Amount,
    pub platform_retained: Amount,
    pub failures: Vec<MemberFailure>,
}

impl RebateReport {
    fn empty(period: PeriodId, status: RebateStatus) -> Self {
        Self {
            period,
            status,
            members: 0,
            entries_written: 0,
            duplicates_skipped: 0,
            total_rebated: 0,
            platform_retained: 0,
            failures: Vec::new(),
        }
    }
}

pub struct RebateDistributor {
    periods: Arc<dyn PeriodStore>,
    bets: Arc<dyn BetRepository>,
    hierarchy: Arc<dyn AgentHierarchy>,
    ledger: Arc<dyn RebateLedger>,
    coordinator: ConsistencyCoordinator,
    metrics: Arc<EngineMetrics>,
    config: RebateConfig,
}

impl RebateDistributor {
    pub fn new(
        periods: Arc<dyn PeriodStore>,
        bets: Arc<dyn BetRepository>,
        hierarchy: Arc<dyn AgentHierarchy>,
        ledger: Arc<dyn RebateLedger>,
        coordinator: ConsistencyCoordinator,
        metrics: Arc<EngineMetrics>,
        config: RebateConfig,
    ) -> Self {
        Self {
            periods,
            bets,
            hierarchy,
            ledger,
            coordinator,
            metrics,
            config,
        }
    }

    /// Distribute rebates for a settled period. Safe to call any number of
    /// times: entries already in the ledger are skipped, never rewritten.
    pub async fn distribute_rebates(&self, period: PeriodId, report: &SettlementReport) -> EngineResult<RebateReport> {
        let row = self
            .periods
            .period(period)
            .await?
            .ok_or(StorageError::PeriodNotFound(period))?;
        if row.phase != PeriodPhase::Settled {
            return Err(RebateError::SettlementNotCommitted(period).into());
        }
        if row.rebates_completed_at.is_some() {
            debug!(period = %period, "Rebates already completed");
            return Ok(RebateReport::empty(period, RebateStatus::Completed));
        }

        let _lease = match self
            .coordinator
            .try_acquire(LeaseScope::Rebate, period, self.config.lease_ttl())
        {
            Ok(lease) => lease,
            Err(LeaseError::LeaseUnavailable(key)) => {
                self.metrics.record_lease_contention();
                info!(period = %period, lease = %key, "Rebate run already in progress, skipping");
                return Ok(RebateReport::empty(period, RebateStatus::Skipped));
            }
            Err(e) => return Err(e.into()),
        };

        // A skipped or partial report carries no usable stake totals
        let stakes: BTreeMap<MemberId, Amount> = if report.period == period && report.is_committed() {
            report.member_stakes.clone()
        } else {
            member_stakes(&self.bets.settled_bets(period).await?)
        };

        let mut out = RebateReport::empty(period, RebateStatus::Completed);
        for (member, stake) in stakes.iter().filter(|(_, stake)| **stake > 0) {
            out.members += 1;
            if let Err(e) = self.distribute_member(period, member, *stake, &mut out).await {
                warn!(period = %period, member = %member, error = %e, "Member rebate skipped");
                out.failures.push(MemberFailure {
                    member: member.clone(),
                    reason: e.to_string(),
                });
            }
        }

        if out.failures.is_empty() {
            self.periods.mark_rebates_completed(period).await?;
        } else {
            out.status = RebateStatus::Partial;
        }
        self.metrics.record_rebate_retained(out.platform_retained);

        info!(
            period = %period,
            status = ?out.status,
            members = out.members,
            entries = out.entries_written,
            duplicates = out.duplicates_skipped,
            rebated = out.total_rebated,
            retained = out.platform_retained,
            "Rebate run finished"
        );

        Ok(out)
    }

    async fn distribute_member(
        &self,
        period: PeriodId,
        member: &MemberId,
        stake: Amount,
        out: &mut RebateReport,
    ) -> EngineResult<()> {
        let chain = self
            .hierarchy
            .chain_for(member)
            .await
            .map_err(|e| RebateError::AgentChainIncomplete {
                member: member.clone(),
                reason: e.to_string(),
            })?;

        let Some(nearest) = chain.first() else {
            debug!(period = %period, member = %member, "Member has no agents, nothing to distribute");
            return Ok(());
        };
        let cap = self.config.cap_for(nearest.market);
        let split = split_rebate(stake, &chain, cap);
        out.platform_retained += split.retained;

        for share in split.shares.into_iter().filter(|s| s.amount > 0) {
            let key = RebateKey {
                period,
                member: member.clone(),
                agent: share.agent.clone(),
            };
            if self.ledger.contains(&key).await? {
                self.skip_duplicate(&key, out);
                continue;
            }

            let entry = RebateLedgerEntry {
                period,
                member: member.clone(),
                agent: share.agent,
                amount: share.amount,
                rate: share.rate,
                stake,
                created_at: current_timestamp_ms(),
            };
            match self.ledger.record(entry).await? {
                RecordOutcome::Inserted => {
                    out.entries_written += 1;
                    out.total_rebated += share.amount;
                    self.metrics.record_rebate_entry(share.amount);
                    debug!(period = %period, member = %member, agent = %key.agent, amount = share.amount, "Rebate credited");
                }
                RecordOutcome::Duplicate => self.skip_duplicate(&key, out),
            }
        }

        Ok(())
    }

    fn skip_duplicate(&self, key: &RebateKey, out: &mut RebateReport) {
        let attempt = RebateError::DuplicateRebateAttempt {
            period: key.period,
            member: key.member.clone(),
            agent: key.agent.clone(),
        };
        debug!("{}, skipping", attempt);
        out.duplicates_skipped += 1;
        self.metrics.record_duplicate_rebate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::games::types::MarketType;

    fn link(agent: &str, bps: u32, market: MarketType) -> AgentChainLink {
        AgentChainLink {
            agent: MemberId::from(agent),
            rebate: BasisPoints(bps),
            market,
        }
    }

    #[test]
    fn test_worked_market_d_example() {
        // $1000 stake, chain 0.5% then 1.1% under a 4.1% cap
        let chain = vec![link("a1", 50, MarketType::D), link("a2", 110, MarketType::D)];
        let split = split_rebate(100_000, &chain, BasisPoints(410));

        assert_eq!(split.pool, 4_100);
        assert_eq!(split.shares[0].amount, 500);
        assert_eq!(split.shares[1].amount, 600);
        assert_eq!(split.shares[1].rate, BasisPoints(60));
        assert_eq!(split.retained, 3_000);
    }

    #[test]
    fn test_full_claim_stops_the_walk() {
        let chain = vec![
            link("a1", 30, MarketType::A),
            link("a2", 110, MarketType::A),
            link("a3", 110, MarketType::A),
        ];
        let split = split_rebate(100_000, &chain, BasisPoints(110));
        assert_eq!(split.shares.len(), 2);
        assert_eq!(split.shares[0].amount, 300);
        assert_eq!(split.shares[1].amount, 800);
        assert_eq!(split.retained, 0);
    }

    #[test]
    fn test_lower_rate_above_gets_nothing() {
        let chain = vec![link("a1", 80, MarketType::A), link("a2", 50, MarketType::A)];
        let split = split_rebate(100_000, &chain, BasisPoints(110));
        assert_eq!(split.shares.len(), 1);
        assert_eq!(split.retained, 300);
    }

    #[test]
    fn test_market_a_never_exceeds_cap() {
        let chains = [
            vec![link("a1", 10, MarketType::A)],
            vec![link("a1", 60, MarketType::A), link("a2", 100, MarketType::A)],
            vec![link("a1", 100, MarketType::A), link("a2", 500, MarketType::A)],
            vec![link("a1", 200, MarketType::A)],
        ];
        for stake in [1, 99, 12_345, 100_000, 7_777_777] {
            for chain in &chains {
                let split = split_rebate(stake, chain, BasisPoints(110));
                let total: Amount = split.shares.iter().map(|s| s.amount).sum();
                assert!(total <= BasisPoints(110).apply(stake));
                assert_eq!(total + split.retained, split.pool);
                let reaches_cap = chain.iter().any(|l| l.rebate >= BasisPoints(110));
                if reaches_cap {
                    assert_eq!(split.retained, 0);
                }
            }
        }
    }

    #[test]
    fn test_floors_never_lose_a_cent() {
        let chain = vec![link("a1", 33, MarketType::D), link("a2", 77, MarketType::D)];
        let split = split_rebate(999, &chain, BasisPoints(410));
        let total: Amount = split.shares.iter().map(|s| s.amount).sum();
        assert_eq!(total, BasisPoints(77).apply(999));
    }
}
