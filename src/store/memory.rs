//! In-memory store backed by DashMap tables
//!
//! Row-level locking comes from DashMap entry guards: a unit of work holds
//! the guard of the row it transitions (bet, rebate key, period) while it
//! writes the dependent balance and journal rows, so two callers racing on
//! the same row serialize and the loser observes the winner's write.

use super::{walk_chain, AgentNode, StoreAdmin};
use crate::common::traits::{
    AgentHierarchy, BalanceLedger, BetRepository, DirectiveStore, MarkOutcome, PeriodStore, RebateLedger,
    RecordOutcome,
};
use crate::common::types::{current_timestamp_ms, Amount, BetId, MemberId, PeriodId};
use crate::errors::{DrawError, EngineResult, StorageError};
use crate::games::types::{
    AgentChainLink, BalanceEntry, BalanceReason, Bet, BetOutcome, BetStatus, ControlDirective, DrawAudit,
    DrawRecord, DrawResult, Period, PeriodPhase, RebateKey, RebateLedgerEntry,
};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use tracing::debug;

#[derive(Default)]
pub struct MemoryStore {
    periods: DashMap<PeriodId, Period>,
    draws: DashMap<PeriodId, DrawRecord>,
    audits: DashMap<PeriodId, Vec<DrawAudit>>,
    bets: DashMap<BetId, Bet>,
    period_bets: DashMap<PeriodId, Vec<BetId>>,
    balances: DashMap<MemberId, i64>,
    journals: DashMap<MemberId, Vec<BalanceEntry>>,
    rebates: DashMap<RebateKey, RebateLedgerEntry>,
    agents: DashMap<MemberId, AgentNode>,
    member_agents: DashMap<MemberId, MemberId>,
    directives: DashMap<u64, ControlDirective>,
    failing_bets: DashSet<BetId>,
    failing_draws: DashSet<PeriodId>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `mark_settled` fail for `bet_id` until cleared. Used to exercise
    /// per-bet failure isolation and the recovery sweep.
    pub fn fail_settlement_for(&self, bet_id: BetId) {
        self.failing_bets.insert(bet_id);
    }

    pub fn clear_settlement_failures(&self) {
        self.failing_bets.clear();
    }

    /// Make `publish_draw` fail for `period` until cleared
    pub fn fail_draw_for(&self, period: PeriodId) {
        self.failing_draws.insert(period);
    }

    pub fn clear_draw_failures(&self) {
        self.failing_draws.clear();
    }

    /// Apply a signed balance change and journal it. Callers hold whatever
    /// row guard makes the change part of their unit of work.
    fn apply_delta(&self, account: &MemberId, delta: i64, reason: BalanceReason) -> EngineResult<i64> {
        let mut balance = self.balances.entry(account.clone()).or_insert(0);
        let next = *balance + delta;
        if next < 0 {
            return Err(StorageError::InsufficientBalance {
                account: account.to_string(),
                needed: delta.unsigned_abs(),
                available: *balance,
            }
            .into());
        }
        *balance = next;
        self.journals.entry(account.clone()).or_default().push(BalanceEntry {
            account: account.clone(),
            delta,
            balance_after: next,
            reason,
            at: current_timestamp_ms(),
        });
        Ok(next)
    }

    fn bets_where(&self, period: PeriodId, keep: impl Fn(&Bet) -> bool) -> Vec<Bet> {
        let ids = self.period_bets.get(&period).map(|ids| ids.clone()).unwrap_or_default();
        let mut bets: Vec<Bet> = ids
            .iter()
            .filter_map(|id| self.bets.get(id).map(|b| b.clone()))
            .filter(|b| keep(b))
            .collect();
        bets.sort_by_key(|b| b.id);
        bets
    }
}

fn signed(amount: Amount) -> i64 {
    i64::try_from(amount).unwrap_or(i64::MAX)
}

#[async_trait]
impl PeriodStore for MemoryStore {
    async fn open_period(&self, period: Period) -> EngineResult<()> {
        match self.periods.entry(period.id) {
            Entry::Occupied(_) => Err(StorageError::PeriodExists(period.id).into()),
            Entry::Vacant(vacant) => {
                debug!(period = %period.id, "Period opened");
                vacant.insert(period);
                Ok(())
            }
        }
    }

    async fn period(&self, id: PeriodId) -> EngineResult<Option<Period>> {
        Ok(self.periods.get(&id).map(|p| p.clone()))
    }

    async fn advance_phase(&self, id: PeriodId, next: PeriodPhase) -> EngineResult<Period> {
        let mut period = self.periods.get_mut(&id).ok_or(StorageError::PeriodNotFound(id))?;
        if !period.phase.can_advance_to(next) {
            return Err(StorageError::InvalidTransition {
                period: id,
                from: period.phase.to_string(),
                to: next.to_string(),
            }
            .into());
        }
        period.phase = next;
        if next == PeriodPhase::Settled {
            period.settled_at = Some(current_timestamp_ms());
        }
        Ok(period.clone())
    }

    async fn publish_draw(&self, record: DrawRecord) -> EngineResult<()> {
        let mut period = self
            .periods
            .get_mut(&record.period)
            .ok_or(StorageError::PeriodNotFound(record.period))?;
        if period.phase != PeriodPhase::Drawing {
            return Err(StorageError::InvalidTransition {
                period: record.period,
                from: period.phase.to_string(),
                to: "drawn".to_string(),
            }
            .into());
        }
        DrawResult::validate(record.result.values())?;
        if self.failing_draws.contains(&record.period) {
            return Err(StorageError::WriteFailed(format!("injected failure for draw {}", record.period)).into());
        }

        match self.draws.entry(record.period) {
            Entry::Occupied(_) => Err(DrawError::AlreadyPublished(record.period).into()),
            Entry::Vacant(vacant) => {
                period.drawn_at = Some(record.drawn_at);
                vacant.insert(record);
                Ok(())
            }
        }
    }

    async fn draw(&self, id: PeriodId) -> EngineResult<Option<DrawRecord>> {
        Ok(self.draws.get(&id).map(|d| d.clone()))
    }

    async fn replace_draw(&self, id: PeriodId, result: DrawResult, audit: DrawAudit) -> EngineResult<()> {
        let settled = self.bets_where(id, |b| b.is_settled()).len();
        if settled > 0 {
            return Err(DrawError::SettlementStarted { period: id, settled }.into());
        }
        let period = self.periods.get(&id).ok_or(StorageError::PeriodNotFound(id))?;
        if period.phase != PeriodPhase::Drawing {
            return Err(DrawError::ReplaceRejected {
                period: id,
                phase: period.phase.to_string(),
            }
            .into());
        }
        DrawResult::validate(result.values())?;

        let mut record = self.draws.get_mut(&id).ok_or(DrawError::NotPublished(id))?;
        record.result = result;
        record.digest = result.digest();
        record.forced.clear();
        self.audits.entry(id).or_default().push(audit);
        Ok(())
    }

    async fn draw_audits(&self, id: PeriodId) -> EngineResult<Vec<DrawAudit>> {
        Ok(self.audits.get(&id).map(|a| a.clone()).unwrap_or_default())
    }

    async fn mark_rebates_completed(&self, id: PeriodId) -> EngineResult<()> {
        let mut period = self.periods.get_mut(&id).ok_or(StorageError::PeriodNotFound(id))?;
        if period.rebates_completed_at.is_none() {
            period.rebates_completed_at = Some(current_timestamp_ms());
        }
        Ok(())
    }

    async fn recovery_candidates(&self) -> EngineResult<Vec<Period>> {
        let mut candidates: Vec<Period> = self
            .periods
            .iter()
            .filter(|p| p.phase != PeriodPhase::Settled || p.rebates_completed_at.is_none())
            .map(|p| p.clone())
            .collect();
        candidates.sort_by_key(|p| p.id);
        Ok(candidates)
    }
}

#[async_trait]
impl BetRepository for MemoryStore {
    async fn place_bet(&self, bet: Bet) -> EngineResult<()> {
        // Held for the whole unit so the window cannot close mid-placement
        let period = self.periods.get(&bet.period).ok_or(StorageError::PeriodNotFound(bet.period))?;
        if period.phase != PeriodPhase::Betting {
            return Err(StorageError::BettingClosed(bet.period).into());
        }

        match self.bets.entry(bet.id) {
            Entry::Occupied(_) => Err(StorageError::DuplicateBet(bet.id).into()),
            Entry::Vacant(vacant) => {
                self.apply_delta(&bet.member, -signed(bet.stake), BalanceReason::BetStake { bet_id: bet.id })?;
                self.period_bets.entry(bet.period).or_default().push(bet.id);
                vacant.insert(bet);
                Ok(())
            }
        }
    }

    async fn bet(&self, id: BetId) -> EngineResult<Option<Bet>> {
        Ok(self.bets.get(&id).map(|b| b.clone()))
    }

    async fn unsettled_bets(&self, period: PeriodId) -> EngineResult<Vec<Bet>> {
        Ok(self.bets_where(period, |b| !b.is_settled()))
    }

    async fn settled_bets(&self, period: PeriodId) -> EngineResult<Vec<Bet>> {
        Ok(self.bets_where(period, |b| b.is_settled()))
    }

    async fn mark_settled(&self, bet_id: BetId, outcome: BetOutcome, payout: Amount) -> EngineResult<MarkOutcome> {
        let mut bet = self.bets.get_mut(&bet_id).ok_or(StorageError::BetNotFound(bet_id))?;
        if bet.is_settled() {
            return Ok(MarkOutcome::AlreadySettled);
        }
        if self.failing_bets.contains(&bet_id) {
            return Err(StorageError::WriteFailed(format!("injected failure for bet {}", bet_id)).into());
        }

        if payout > 0 {
            self.apply_delta(&bet.member, signed(payout), BalanceReason::BetPayout { bet_id })?;
        }
        bet.status = BetStatus::Settled {
            outcome,
            payout,
            settled_at: current_timestamp_ms(),
        };
        Ok(MarkOutcome::Applied)
    }

    async fn bets_for_period(&self, period: PeriodId) -> EngineResult<Vec<Bet>> {
        Ok(self.bets_where(period, |_| true))
    }
}

#[async_trait]
impl BalanceLedger for MemoryStore {
    async fn credit(&self, account: &MemberId, amount: Amount, reason: BalanceReason) -> EngineResult<i64> {
        self.apply_delta(account, signed(amount), reason)
    }

    async fn debit(&self, account: &MemberId, amount: Amount, reason: BalanceReason) -> EngineResult<i64> {
        self.apply_delta(account, -signed(amount), reason)
    }

    async fn balance(&self, account: &MemberId) -> EngineResult<i64> {
        Ok(self.balances.get(account).map(|b| *b).unwrap_or(0))
    }

    async fn journal(&self, account: &MemberId) -> EngineResult<Vec<BalanceEntry>> {
        Ok(self.journals.get(account).map(|j| j.clone()).unwrap_or_default())
    }
}

#[async_trait]
impl RebateLedger for MemoryStore {
    async fn contains(&self, key: &RebateKey) -> EngineResult<bool> {
        Ok(self.rebates.contains_key(key))
    }

    async fn record(&self, entry: RebateLedgerEntry) -> EngineResult<RecordOutcome> {
        match self.rebates.entry(entry.key()) {
            Entry::Occupied(_) => Ok(RecordOutcome::Duplicate),
            Entry::Vacant(vacant) => {
                let reason = BalanceReason::Rebate {
                    period: entry.period,
                    member: entry.member.clone(),
                };
                self.apply_delta(&entry.agent, signed(entry.amount), reason)?;
                vacant.insert(entry);
                Ok(RecordOutcome::Inserted)
            }
        }
    }

    async fn entries_for_period(&self, period: PeriodId) -> EngineResult<Vec<RebateLedgerEntry>> {
        let mut entries: Vec<RebateLedgerEntry> = self
            .rebates
            .iter()
            .filter(|e| e.period == period)
            .map(|e| e.clone())
            .collect();
        entries.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(entries)
    }
}

#[async_trait]
impl AgentHierarchy for MemoryStore {
    async fn chain_for(&self, member: &MemberId) -> EngineResult<Vec<AgentChainLink>> {
        let first = self.member_agents.get(member).map(|a| a.clone());
        walk_chain(member, first, |agent| Ok(self.agents.get(agent).map(|n| n.clone())))
    }
}

#[async_trait]
impl DirectiveStore for MemoryStore {
    async fn active_directives(&self, period: PeriodId) -> EngineResult<Vec<ControlDirective>> {
        let mut active: Vec<ControlDirective> = self
            .directives
            .iter()
            .filter(|d| d.is_active_for(period))
            .map(|d| d.clone())
            .collect();
        active.sort_by_key(|d| d.id);
        Ok(active)
    }
}

#[async_trait]
impl StoreAdmin for MemoryStore {
    async fn upsert_agent(&self, node: AgentNode) -> EngineResult<()> {
        self.agents.insert(node.agent.clone(), node);
        Ok(())
    }

    async fn assign_member(&self, member: &MemberId, agent: &MemberId) -> EngineResult<()> {
        self.member_agents.insert(member.clone(), agent.clone());
        Ok(())
    }

    async fn put_directive(&self, directive: ControlDirective) -> EngineResult<()> {
        self.directives.insert(directive.id, directive);
        Ok(())
    }

    async fn remove_directive(&self, id: u64) -> EngineResult<bool> {
        Ok(self.directives.remove(&id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::{BasisPoints, Odds, Position};
    use crate::games::types::{BetKind, MarketType};

    fn bet(id: u64, member: &str, stake: Amount) -> Bet {
        Bet::new(
            BetId(id),
            PeriodId(1),
            MemberId::from(member),
            BetKind::Number {
                position: Position::FIRST,
                value: 1,
            },
            stake,
            Odds::from_decimal(9.8),
        )
    }

    async fn funded(member: &str, amount: Amount) -> MemoryStore {
        let store = MemoryStore::new();
        store.open_period(Period::open(PeriodId(1))).await.unwrap();
        store
            .credit(&MemberId::from(member), amount, BalanceReason::Adjustment { note: "deposit".into() })
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_place_bet_debits_and_closes_with_window() {
        let store = funded("alice", 1_000).await;
        store.place_bet(bet(1, "alice", 400)).await.unwrap();
        assert_eq!(store.balance(&MemberId::from("alice")).await.unwrap(), 600);

        let err = store.place_bet(bet(2, "alice", 700)).await.unwrap_err();
        assert!(matches!(err, crate::errors::EngineError::Storage(StorageError::InsufficientBalance { .. })));
        assert!(store.bet(BetId(2)).await.unwrap().is_none());

        store.advance_phase(PeriodId(1), PeriodPhase::Drawing).await.unwrap();
        let err = store.place_bet(bet(3, "alice", 100)).await.unwrap_err();
        assert!(matches!(err, crate::errors::EngineError::Storage(StorageError::BettingClosed(_))));
    }

    #[tokio::test]
    async fn test_mark_settled_once() {
        let store = funded("alice", 1_000).await;
        store.place_bet(bet(1, "alice", 100)).await.unwrap();

        assert_eq!(
            store.mark_settled(BetId(1), BetOutcome::Win, 980).await.unwrap(),
            MarkOutcome::Applied
        );
        assert_eq!(
            store.mark_settled(BetId(1), BetOutcome::Win, 980).await.unwrap(),
            MarkOutcome::AlreadySettled
        );
        assert_eq!(store.balance(&MemberId::from("alice")).await.unwrap(), 1_880);
        assert_eq!(store.journal(&MemberId::from("alice")).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_draw_is_insert_only() {
        let store = MemoryStore::new();
        store.open_period(Period::open(PeriodId(1))).await.unwrap();
        store.advance_phase(PeriodId(1), PeriodPhase::Drawing).await.unwrap();

        let result = DrawResult::new([1, 2, 3, 4, 5, 6, 7, 8, 9, 10]).unwrap();
        let record = DrawRecord {
            period: PeriodId(1),
            result,
            seed: String::new(),
            forced: Vec::new(),
            digest: result.digest(),
            drawn_at: 1,
        };
        store.publish_draw(record.clone()).await.unwrap();
        let err = store.publish_draw(record).await.unwrap_err();
        assert!(matches!(err, crate::errors::EngineError::Draw(DrawError::AlreadyPublished(_))));
        assert_eq!(store.period(PeriodId(1)).await.unwrap().unwrap().drawn_at, Some(1));
    }

    #[tokio::test]
    async fn test_rebate_record_is_unique() {
        let store = MemoryStore::new();
        let entry = RebateLedgerEntry {
            period: PeriodId(1),
            member: MemberId::from("alice"),
            agent: MemberId::from("agent"),
            amount: 500,
            rate: BasisPoints(50),
            stake: 100_000,
            created_at: 0,
        };
        assert_eq!(store.record(entry.clone()).await.unwrap(), RecordOutcome::Inserted);
        assert_eq!(store.record(entry.clone()).await.unwrap(), RecordOutcome::Duplicate);
        assert!(store.contains(&entry.key()).await.unwrap());
        assert_eq!(store.balance(&MemberId::from("agent")).await.unwrap(), 500);
    }

    #[tokio::test]
    async fn test_chain_walk() {
        let store = MemoryStore::new();
        store
            .upsert_agent(AgentNode {
                agent: "root".into(),
                parent: None,
                rebate: BasisPoints(410),
                market: MarketType::D,
            })
            .await
            .unwrap();
        store
            .upsert_agent(AgentNode {
                agent: "sub".into(),
                parent: Some("root".into()),
                rebate: BasisPoints(50),
                market: MarketType::D,
            })
            .await
            .unwrap();
        store.assign_member(&"alice".into(), &"sub".into()).await.unwrap();

        let chain = store.chain_for(&"alice".into()).await.unwrap();
        let agents: Vec<&str> = chain.iter().map(|l| l.agent.as_str()).collect();
        assert_eq!(agents, vec!["sub", "root"]);
        assert!(store.chain_for(&"nobody".into()).await.unwrap().is_empty());

        store.assign_member(&"bob".into(), &"ghost".into()).await.unwrap();
        assert!(store.chain_for(&"bob".into()).await.is_err());
    }

    #[tokio::test]
    async fn test_directive_window_and_removal() {
        let store = MemoryStore::new();
        store
            .put_directive(ControlDirective {
                id: 7,
                scope: crate::games::types::DirectiveScope::Global,
                mode: crate::games::types::DirectiveMode::Loss,
                intensity: 100,
                active_from: PeriodId(10),
                active_until: Some(PeriodId(12)),
            })
            .await
            .unwrap();

        assert!(store.active_directives(PeriodId(9)).await.unwrap().is_empty());
        assert_eq!(store.active_directives(PeriodId(11)).await.unwrap().len(), 1);
        assert!(store.active_directives(PeriodId(13)).await.unwrap().is_empty());

        assert!(store.remove_directive(7).await.unwrap());
        assert!(!store.remove_directive(7).await.unwrap());
        assert!(store.active_directives(PeriodId(11)).await.unwrap().is_empty());
    }
}
