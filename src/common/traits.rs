//! Collaborator interfaces consumed by the engine
//!
//! The engine never talks to a database directly. Everything it reads or
//! writes goes through these traits, implemented by `store::MemoryStore` and
//! `store::RocksStore`.

use crate::common::types::{Amount, BetId, MemberId, PeriodId};
use crate::errors::EngineResult;
use crate::games::types::{
    AgentChainLink, BalanceEntry, BalanceReason, Bet, BetOutcome, ControlDirective, DrawAudit, DrawRecord,
    DrawResult, Period, PeriodPhase, RebateKey, RebateLedgerEntry,
};
use async_trait::async_trait;

/// Outcome of an atomic per-bet settlement write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// Status, credit and journal written
    Applied,
    /// A previous run already settled this bet; nothing written
    AlreadySettled,
}

/// Outcome of an atomic rebate ledger write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Entry inserted and agent credited
    Inserted,
    /// Entry for this (period, member, agent) already exists; nothing written
    Duplicate,
}

/// Period lifecycle and draw persistence
#[async_trait]
pub trait PeriodStore: Send + Sync {
    /// Create a period in the betting phase
    async fn open_period(&self, period: Period) -> EngineResult<()>;

    async fn period(&self, id: PeriodId) -> EngineResult<Option<Period>>;

    /// Move a period one phase forward; stamps the matching timestamp
    async fn advance_phase(&self, id: PeriodId, next: PeriodPhase) -> EngineResult<Period>;

    /// Insert-only: fails with `DrawError::AlreadyPublished` if a draw exists
    async fn publish_draw(&self, record: DrawRecord) -> EngineResult<()>;

    async fn draw(&self, id: PeriodId) -> EngineResult<Option<DrawRecord>>;

    /// Explicit audited correction; only valid while the period is drawing
    /// and none of its bets are settled
    async fn replace_draw(&self, id: PeriodId, result: DrawResult, audit: DrawAudit) -> EngineResult<()>;

    async fn draw_audits(&self, id: PeriodId) -> EngineResult<Vec<DrawAudit>>;

    async fn mark_rebates_completed(&self, id: PeriodId) -> EngineResult<()>;

    /// Every period not fully done: still betting, drawing (with or without a
    /// published draw), or settled without completed rebates. The sweep
    /// decides which of them are due.
    async fn recovery_candidates(&self) -> EngineResult<Vec<Period>>;
}

/// Bet rows
#[async_trait]
pub trait BetRepository: Send + Sync {
    /// Rejects bets on periods that are not in the betting phase; debits the
    /// stake from the member in the same unit of work
    async fn place_bet(&self, bet: Bet) -> EngineResult<()>;

    async fn bet(&self, id: BetId) -> EngineResult<Option<Bet>>;

    async fn unsettled_bets(&self, period: PeriodId) -> EngineResult<Vec<Bet>>;

    async fn settled_bets(&self, period: PeriodId) -> EngineResult<Vec<Bet>>;

    /// Settle one bet atomically: status transition, payout credit to the
    /// owner and journal row, or nothing at all. Already-settled bets are
    /// reported, not rewritten.
    async fn mark_settled(&self, bet_id: BetId, outcome: BetOutcome, payout: Amount) -> EngineResult<MarkOutcome>;

    /// Bets on the period (any status)
    async fn bets_for_period(&self, period: PeriodId) -> EngineResult<Vec<Bet>>;
}

/// Member and agent balances with a journal
#[async_trait]
pub trait BalanceLedger: Send + Sync {
    async fn credit(&self, account: &MemberId, amount: Amount, reason: BalanceReason) -> EngineResult<i64>;

    /// Fails with `StorageError::InsufficientBalance` instead of going negative
    async fn debit(&self, account: &MemberId, amount: Amount, reason: BalanceReason) -> EngineResult<i64>;

    async fn balance(&self, account: &MemberId) -> EngineResult<i64>;

    async fn journal(&self, account: &MemberId) -> EngineResult<Vec<BalanceEntry>>;
}

/// Rebate ledger with a uniqueness constraint on (period, member, agent)
#[async_trait]
pub trait RebateLedger: Send + Sync {
    async fn contains(&self, key: &RebateKey) -> EngineResult<bool>;

    /// Insert the entry and credit the agent atomically. A second entry for
    /// the same key is rejected as `RecordOutcome::Duplicate`.
    async fn record(&self, entry: RebateLedgerEntry) -> EngineResult<RecordOutcome>;

    async fn entries_for_period(&self, period: PeriodId) -> EngineResult<Vec<RebateLedgerEntry>>;
}

/// Agent hierarchy lookups
#[async_trait]
pub trait AgentHierarchy: Send + Sync {
    /// Chain from the member's direct agent up to the market root
    async fn chain_for(&self, member: &MemberId) -> EngineResult<Vec<AgentChainLink>>;
}

/// Control directive lookups
#[async_trait]
pub trait DirectiveStore: Send + Sync {
    async fn active_directives(&self, period: PeriodId) -> EngineResult<Vec<ControlDirective>>;
}
