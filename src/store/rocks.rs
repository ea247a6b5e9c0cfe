//! RocksDB-backed store
//!
//! Rows are serde_json values under string key prefixes. Every unit of work
//! (bet placement, bet settlement, rebate record) is one `WriteBatch`, built
//! while holding the store's write lock so read-modify-write sequences on
//! balances never interleave.

use super::{walk_chain, AgentNode, StoreAdmin};
use crate::common::traits::{
    AgentHierarchy, BalanceLedger, BetRepository, DirectiveStore, MarkOutcome, PeriodStore, RebateLedger,
    RecordOutcome,
};
use crate::common::types::{current_timestamp_ms, Amount, BetId, MemberId, PeriodId};
use crate::errors::{DrawError, EngineError, EngineResult, StorageError};
use crate::games::types::{
    AgentChainLink, BalanceEntry, BalanceReason, Bet, BetOutcome, BetStatus, ControlDirective, DrawAudit,
    DrawRecord, DrawResult, Period, PeriodPhase, RebateKey, RebateLedgerEntry,
};
use crate::storage::OptimizedStorage;
use async_trait::async_trait;
use rocksdb::WriteBatch;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::sync::Mutex;
use tracing::info;

const PERIOD_PREFIX: &str = "period:";
const DRAW_PREFIX: &str = "draw:";
const AUDIT_PREFIX: &str = "draw:audit:";
const BET_PREFIX: &str = "bet:row:";
const BET_INDEX_PREFIX: &str = "bet:period:";
const ACCOUNT_PREFIX: &str = "account:";
const JOURNAL_PREFIX: &str = "journal:";
const REBATE_PREFIX: &str = "rebate:";
const AGENT_PREFIX: &str = "agent:node:";
const MEMBER_AGENT_PREFIX: &str = "agent:member:";
const DIRECTIVE_PREFIX: &str = "directive:";

fn period_key(id: PeriodId) -> String {
    format!("{}{:020}", PERIOD_PREFIX, id.0)
}

fn draw_key(id: PeriodId) -> String {
    format!("{}{:020}", DRAW_PREFIX, id.0)
}

fn audit_prefix(id: PeriodId) -> String {
    format!("{}{:020}:", AUDIT_PREFIX, id.0)
}

fn bet_key(id: BetId) -> String {
    format!("{}{:020}", BET_PREFIX, id.0)
}

fn bet_index_prefix(period: PeriodId) -> String {
    format!("{}{:020}:", BET_INDEX_PREFIX, period.0)
}

fn account_key(account: &MemberId) -> String {
    format!("{}{}", ACCOUNT_PREFIX, account)
}

fn journal_prefix(account: &MemberId) -> String {
    format!("{}{}:", JOURNAL_PREFIX, account)
}

fn rebate_prefix(period: PeriodId) -> String {
    format!("{}{:020}:", REBATE_PREFIX, period.0)
}

fn rebate_key(key: &RebateKey) -> String {
    format!("{}{}\u{1f}{}", rebate_prefix(key.period), key.member, key.agent)
}

/// Balance row; `entries` numbers the journal keys
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct AccountRow {
    balance: i64,
    entries: u64,
}

pub struct RocksStore {
    storage: OptimizedStorage,
    write_lock: Mutex<()>,
}

impl RocksStore {
    pub fn open<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;
        let storage = OptimizedStorage::new(path)
            .map_err(|e| StorageError::DatabaseOpenFailed(format!("{}: {}", path.display(), e)))?;
        info!(path = %path.display(), "RocksDB store opened");
        Ok(Self {
            storage,
            write_lock: Mutex::new(()),
        })
    }

    /// Open after removing any existing data under `path`
    pub fn open_clean<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            std::fs::remove_dir_all(path)?;
        }
        Self::open(path)
    }

    pub fn flush(&self) -> EngineResult<()> {
        Ok(self.storage.flush()?)
    }

    fn load<T: DeserializeOwned>(&self, key: &str) -> EngineResult<Option<T>> {
        let Some(bytes) = self
            .storage
            .get(key.as_bytes())
            .map_err(|e| StorageError::ReadFailed(format!("{}: {}", key, e)))?
        else {
            return Ok(None);
        };
        let value = serde_json::from_slice(&bytes)
            .map_err(|e| StorageError::CorruptedData(format!("Failed to decode {}: {}", key, e)))?;
        Ok(Some(value))
    }

    fn load_prefix<T: DeserializeOwned>(&self, prefix: &str) -> EngineResult<Vec<T>> {
        let rows = self
            .storage
            .scan_prefix(prefix.as_bytes())
            .map_err(|e| StorageError::ReadFailed(format!("{}: {}", prefix, e)))?;
        rows.into_iter()
            .map(|(key, bytes)| {
                serde_json::from_slice(&bytes).map_err(|e| {
                    EngineError::from(StorageError::CorruptedData(format!(
                        "Failed to decode {}: {}",
                        String::from_utf8_lossy(&key),
                        e
                    )))
                })
            })
            .collect()
    }

    fn stage<T: Serialize>(batch: &mut WriteBatch, key: &str, value: &T) -> EngineResult<()> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| StorageError::WriteFailed(format!("Failed to encode {}: {}", key, e)))?;
        batch.put(key.as_bytes(), bytes);
        Ok(())
    }

    fn commit(&self, batch: WriteBatch) -> EngineResult<()> {
        self.storage
            .write(batch)
            .map_err(|e| StorageError::WriteFailed(e.to_string()).into())
    }

    /// Stage a balance change and its journal row into `batch`
    fn stage_delta(
        &self,
        batch: &mut WriteBatch,
        account: &MemberId,
        delta: i64,
        reason: BalanceReason,
    ) -> EngineResult<i64> {
        let key = account_key(account);
        let mut row: AccountRow = self.load(&key)?.unwrap_or_default();
        let next = row.balance + delta;
        if next < 0 {
            return Err(StorageError::InsufficientBalance {
                account: account.to_string(),
                needed: delta.unsigned_abs(),
                available: row.balance,
            }
            .into());
        }

        let entry = BalanceEntry {
            account: account.clone(),
            delta,
            balance_after: next,
            reason,
            at: current_timestamp_ms(),
        };
        let journal_key = format!("{}{:020}", journal_prefix(account), row.entries);
        Self::stage(batch, &journal_key, &entry)?;

        row.balance = next;
        row.entries += 1;
        Self::stage(batch, &key, &row)?;
        Ok(next)
    }

    async fn apply_delta(&self, account: &MemberId, delta: i64, reason: BalanceReason) -> EngineResult<i64> {
        let _guard = self.write_lock.lock().await;
        let mut batch = WriteBatch::default();
        let balance = self.stage_delta(&mut batch, account, delta, reason)?;
        self.commit(batch)?;
        Ok(balance)
    }

    fn bets_where(&self, period: PeriodId, keep: impl Fn(&Bet) -> bool) -> EngineResult<Vec<Bet>> {
        let ids: Vec<BetId> = self.load_prefix(&bet_index_prefix(period))?;
        let mut bets = Vec::with_capacity(ids.len());
        for id in ids {
            let bet: Bet = self
                .load(&bet_key(id))?
                .ok_or_else(|| StorageError::CorruptedData(format!("index points at missing bet {}", id)))?;
            if keep(&bet) {
                bets.push(bet);
            }
        }
        Ok(bets)
    }
}

fn signed(amount: Amount) -> i64 {
    i64::try_from(amount).unwrap_or(i64::MAX)
}

#[async_trait]
impl PeriodStore for RocksStore {
    async fn open_period(&self, period: Period) -> EngineResult<()> {
        let _guard = self.write_lock.lock().await;
        let key = period_key(period.id);
        if self.load::<Period>(&key)?.is_some() {
            return Err(StorageError::PeriodExists(period.id).into());
        }
        let mut batch = WriteBatch::default();
        Self::stage(&mut batch, &key, &period)?;
        self.commit(batch)
    }

    async fn period(&self, id: PeriodId) -> EngineResult<Option<Period>> {
        self.load(&period_key(id))
    }

    async fn advance_phase(&self, id: PeriodId, next: PeriodPhase) -> EngineResult<Period> {
        let _guard = self.write_lock.lock().await;
        let key = period_key(id);
        let mut period: Period = self.load(&key)?.ok_or(StorageError::PeriodNotFound(id))?;
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
        let mut batch = WriteBatch::default();
        Self::stage(&mut batch, &key, &period)?;
        self.commit(batch)?;
        Ok(period)
    }

    async fn publish_draw(&self, record: DrawRecord) -> EngineResult<()> {
        let _guard = self.write_lock.lock().await;
        let key = period_key(record.period);
        let mut period: Period = self.load(&key)?.ok_or(StorageError::PeriodNotFound(record.period))?;
        if period.phase != PeriodPhase::Drawing {
            return Err(StorageError::InvalidTransition {
                period: record.period,
                from: period.phase.to_string(),
                to: "drawn".to_string(),
            }
            .into());
        }
        DrawResult::validate(record.result.values())?;
        if self.load::<DrawRecord>(&draw_key(record.period))?.is_some() {
            return Err(DrawError::AlreadyPublished(record.period).into());
        }

        period.drawn_at = Some(record.drawn_at);
        let mut batch = WriteBatch::default();
        Self::stage(&mut batch, &draw_key(record.period), &record)?;
        Self::stage(&mut batch, &key, &period)?;
        self.commit(batch)
    }

    async fn draw(&self, id: PeriodId) -> EngineResult<Option<DrawRecord>> {
        self.load(&draw_key(id))
    }

    async fn replace_draw(&self, id: PeriodId, result: DrawResult, audit: DrawAudit) -> EngineResult<()> {
        let _guard = self.write_lock.lock().await;
        let period: Period = self.load(&period_key(id))?.ok_or(StorageError::PeriodNotFound(id))?;
        if period.phase != PeriodPhase::Drawing {
            return Err(DrawError::ReplaceRejected {
                period: id,
                phase: period.phase.to_string(),
            }
            .into());
        }
        let settled = self.bets_where(id, |b| b.is_settled())?.len();
        if settled > 0 {
            return Err(DrawError::SettlementStarted { period: id, settled }.into());
        }
        DrawResult::validate(result.values())?;
        let mut record: DrawRecord = self.load(&draw_key(id))?.ok_or(DrawError::NotPublished(id))?;
        record.result = result;
        record.digest = result.digest();
        record.forced.clear();

        let existing = self.load_prefix::<DrawAudit>(&audit_prefix(id))?.len();
        let mut batch = WriteBatch::default();
        Self::stage(&mut batch, &draw_key(id), &record)?;
        Self::stage(&mut batch, &format!("{}{:06}", audit_prefix(id), existing), &audit)?;
        self.commit(batch)
    }

    async fn draw_audits(&self, id: PeriodId) -> EngineResult<Vec<DrawAudit>> {
        self.load_prefix(&audit_prefix(id))
    }

    async fn mark_rebates_completed(&self, id: PeriodId) -> EngineResult<()> {
        let _guard = self.write_lock.lock().await;
        let key = period_key(id);
        let mut period: Period = self.load(&key)?.ok_or(StorageError::PeriodNotFound(id))?;
        if period.rebates_completed_at.is_some() {
            return Ok(());
        }
        period.rebates_completed_at = Some(current_timestamp_ms());
        let mut batch = WriteBatch::default();
        Self::stage(&mut batch, &key, &period)?;
        self.commit(batch)
    }

    async fn recovery_candidates(&self) -> EngineResult<Vec<Period>> {
        let periods: Vec<Period> = self.load_prefix(PERIOD_PREFIX)?;
        Ok(periods
            .into_iter()
            .filter(|p| p.phase != PeriodPhase::Settled || p.rebates_completed_at.is_none())
            .collect())
    }
}

#[async_trait]
impl BetRepository for RocksStore {
    async fn place_bet(&self, bet: Bet) -> EngineResult<()> {
        let _guard = self.write_lock.lock().await;
        let period: Period = self
            .load(&period_key(bet.period))?
            .ok_or(StorageError::PeriodNotFound(bet.period))?;
        if period.phase != PeriodPhase::Betting {
            return Err(StorageError::BettingClosed(bet.period).into());
        }
        if self.load::<Bet>(&bet_key(bet.id))?.is_some() {
            return Err(StorageError::DuplicateBet(bet.id).into());
        }

        let mut batch = WriteBatch::default();
        self.stage_delta(&mut batch, &bet.member, -signed(bet.stake), BalanceReason::BetStake { bet_id: bet.id })?;
        Self::stage(&mut batch, &bet_key(bet.id), &bet)?;
        let index_key = format!("{}{:020}", bet_index_prefix(bet.period), bet.id.0);
        Self::stage(&mut batch, &index_key, &bet.id)?;
        self.commit(batch)
    }

    async fn bet(&self, id: BetId) -> EngineResult<Option<Bet>> {
        self.load(&bet_key(id))
    }

    async fn unsettled_bets(&self, period: PeriodId) -> EngineResult<Vec<Bet>> {
        self.bets_where(period, |b| !b.is_settled())
    }

    async fn settled_bets(&self, period: PeriodId) -> EngineResult<Vec<Bet>> {
        self.bets_where(period, |b| b.is_settled())
    }

    async fn mark_settled(&self, bet_id: BetId, outcome: BetOutcome, payout: Amount) -> EngineResult<MarkOutcome> {
        let _guard = self.write_lock.lock().await;
        let key = bet_key(bet_id);
        let mut bet: Bet = self.load(&key)?.ok_or(StorageError::BetNotFound(bet_id))?;
        if bet.is_settled() {
            return Ok(MarkOutcome::AlreadySettled);
        }

        let mut batch = WriteBatch::default();
        if payout > 0 {
            self.stage_delta(&mut batch, &bet.member, signed(payout), BalanceReason::BetPayout { bet_id })?;
        }
        bet.status = BetStatus::Settled {
            outcome,
            payout,
            settled_at: current_timestamp_ms(),
        };
        Self::stage(&mut batch, &key, &bet)?;
        self.commit(batch)?;
        Ok(MarkOutcome::Applied)
    }

    async fn bets_for_period(&self, period: PeriodId) -> EngineResult<Vec<Bet>> {
        self.bets_where(period, |_| true)
    }
}

#[async_trait]
impl BalanceLedger for RocksStore {
    async fn credit(&self, account: &MemberId, amount: Amount, reason: BalanceReason) -> EngineResult<i64> {
        self.apply_delta(account, signed(amount), reason).await
    }

    async fn debit(&self, account: &MemberId, amount: Amount, reason: BalanceReason) -> EngineResult<i64> {
        self.apply_delta(account, -signed(amount), reason).await
    }

    async fn balance(&self, account: &MemberId) -> EngineResult<i64> {
        Ok(self
            .load::<AccountRow>(&account_key(account))?
            .map(|row| row.balance)
            .unwrap_or(0))
    }

    async fn journal(&self, account: &MemberId) -> EngineResult<Vec<BalanceEntry>> {
        self.load_prefix(&journal_prefix(account))
    }
}

#[async_trait]
impl RebateLedger for RocksStore {
    async fn contains(&self, key: &RebateKey) -> EngineResult<bool> {
        Ok(self.load::<RebateLedgerEntry>(&rebate_key(key))?.is_some())
    }

    async fn record(&self, entry: RebateLedgerEntry) -> EngineResult<RecordOutcome> {
        let _guard = self.write_lock.lock().await;
        let key = rebate_key(&entry.key());
        if self.load::<RebateLedgerEntry>(&key)?.is_some() {
            return Ok(RecordOutcome::Duplicate);
        }

        let mut batch = WriteBatch::default();
        let reason = BalanceReason::Rebate {
            period: entry.period,
            member: entry.member.clone(),
        };
        self.stage_delta(&mut batch, &entry.agent, signed(entry.amount), reason)?;
        Self::stage(&mut batch, &key, &entry)?;
        self.commit(batch)?;
        Ok(RecordOutcome::Inserted)
    }

    async fn entries_for_period(&self, period: PeriodId) -> EngineResult<Vec<RebateLedgerEntry>> {
        self.load_prefix(&rebate_prefix(period))
    }
}

#[async_trait]
impl AgentHierarchy for RocksStore {
    async fn chain_for(&self, member: &MemberId) -> EngineResult<Vec<AgentChainLink>> {
        let first: Option<MemberId> = self.load(&format!("{}{}", MEMBER_AGENT_PREFIX, member))?;
        walk_chain(member, first, |agent| self.load(&format!("{}{}", AGENT_PREFIX, agent)))
    }
}

#[async_trait]
impl DirectiveStore for RocksStore {
    async fn active_directives(&self, period: PeriodId) -> EngineResult<Vec<ControlDirective>> {
        let all: Vec<ControlDirective> = self.load_prefix(DIRECTIVE_PREFIX)?;
        Ok(all.into_iter().filter(|d| d.is_active_for(period)).collect())
    }
}

#[async_trait]
impl StoreAdmin for RocksStore {
    async fn upsert_agent(&self, node: AgentNode) -> EngineResult<()> {
        let mut batch = WriteBatch::default();
        Self::stage(&mut batch, &format!("{}{}", AGENT_PREFIX, node.agent), &node)?;
        self.commit(batch)
    }

    async fn assign_member(&self, member: &MemberId, agent: &MemberId) -> EngineResult<()> {
        let mut batch = WriteBatch::default();
        Self::stage(&mut batch, &format!("{}{}", MEMBER_AGENT_PREFIX, member), agent)?;
        self.commit(batch)
    }

    async fn put_directive(&self, directive: ControlDirective) -> EngineResult<()> {
        let mut batch = WriteBatch::default();
        Self::stage(&mut batch, &format!("{}{:020}", DIRECTIVE_PREFIX, directive.id), &directive)?;
        self.commit(batch)
    }

    async fn remove_directive(&self, id: u64) -> EngineResult<bool> {
        let key = format!("{}{:020}", DIRECTIVE_PREFIX, id);
        let existed = self.load::<ControlDirective>(&key)?.is_some();
        self.storage
            .delete(key.as_bytes())
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::{Odds, Position};
    use crate::games::types::BetKind;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_bet_lifecycle_on_disk() {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path().join("db")).unwrap();
        let alice = MemberId::from("alice");

        store.open_period(Period::open(PeriodId(1))).await.unwrap();
        store
            .credit(&alice, 1_000, BalanceReason::Adjustment { note: "deposit".into() })
            .await
            .unwrap();
        let bet = Bet::new(
            BetId(1),
            PeriodId(1),
            alice.clone(),
            BetKind::Number {
                position: Position::FIRST,
                value: 4,
            },
            100,
            Odds::from_decimal(9.8),
        );
        store.place_bet(bet).await.unwrap();
        assert_eq!(store.unsettled_bets(PeriodId(1)).await.unwrap().len(), 1);

        assert_eq!(
            store.mark_settled(BetId(1), BetOutcome::Win, 980).await.unwrap(),
            MarkOutcome::Applied
        );
        assert_eq!(
            store.mark_settled(BetId(1), BetOutcome::Win, 980).await.unwrap(),
            MarkOutcome::AlreadySettled
        );
        assert_eq!(store.balance(&alice).await.unwrap(), 1_880);
        assert_eq!(store.journal(&alice).await.unwrap().len(), 3);
        assert_eq!(store.settled_bets(PeriodId(1)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_periods_are_listed_in_order() {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        for id in [20260101_0002u64, 20260101_0001, 20251231_0288] {
            store.open_period(Period::open(PeriodId(id))).await.unwrap();
            store.advance_phase(PeriodId(id), PeriodPhase::Drawing).await.unwrap();
            store.advance_phase(PeriodId(id), PeriodPhase::Settled).await.unwrap();
        }
        let ids: Vec<u64> = store
            .recovery_candidates()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id.0)
            .collect();
        assert_eq!(ids, vec![20251231_0288, 20260101_0001, 20260101_0002]);
    }
}
