use crate::common::types::{
    current_timestamp_ms, Amount, BasisPoints, BetId, MemberId, Odds, PeriodId, Position,
    POSITION_COUNT,
};
use crate::errors::DrawError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Canonical draw result: the permutation of 1..=10 across the ten positions.
///
/// Serialized as a bare array (`[1,2,...,10]`) and nothing else. A wrapped
/// object such as `{"positions": [...]}` is rejected on deserialization, as is
/// any array that is not a permutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct DrawResult([u8; POSITION_COUNT]);

impl DrawResult {
    pub fn new(values: [u8; POSITION_COUNT]) -> Result<Self, DrawError> {
        Self::validate(&values)?;
        Ok(Self(values))
    }

    /// Permutation check: exactly ten values, each of 1..=10 exactly once
    pub fn validate(values: &[u8]) -> Result<(), DrawError> {
        if values.len() != POSITION_COUNT {
            return Err(DrawError::InvalidDrawResult(format!(
                "expected {} values, got {}",
                POSITION_COUNT,
                values.len()
            )));
        }
        let mut seen = [false; POSITION_COUNT + 1];
        for &value in values {
            if !(1..=POSITION_COUNT as u8).contains(&value) {
                return Err(DrawError::InvalidDrawResult(format!(
                    "value {} out of range 1..=10",
                    value
                )));
            }
            if seen[value as usize] {
                return Err(DrawError::InvalidDrawResult(format!("duplicate value {}", value)));
            }
            seen[value as usize] = true;
        }
        Ok(())
    }

    /// Value drawn at a 1-indexed position
    pub fn at(&self, position: Position) -> u8 {
        self.0[position.index()]
    }

    pub fn values(&self) -> &[u8; POSITION_COUNT] {
        &self.0
    }

    /// Sum of the first and second place values
    pub fn leading_sum(&self) -> u8 {
        self.0[0] + self.0[1]
    }

    pub fn to_canonical_json(&self) -> String {
        let parts: Vec<String> = self.0.iter().map(|v| v.to_string()).collect();
        format!("[{}]", parts.join(","))
    }

    pub fn from_canonical_json(raw: &str) -> Result<Self, DrawError> {
        serde_json::from_str(raw).map_err(|e| DrawError::InvalidDrawResult(e.to_string()))
    }

    /// SHA-256 of the canonical form, hex encoded
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.to_canonical_json().as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl TryFrom<Vec<u8>> for DrawResult {
    type Error = DrawError;

    fn try_from(values: Vec<u8>) -> Result<Self, Self::Error> {
        Self::validate(&values)?;
        let mut out = [0u8; POSITION_COUNT];
        out.copy_from_slice(&values);
        Ok(Self(out))
    }
}

impl From<DrawResult> for Vec<u8> {
    fn from(result: DrawResult) -> Vec<u8> {
        result.0.to_vec()
    }
}

impl fmt::Display for DrawResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_canonical_json())
    }
}

/// Big/small/odd/even pick on a single position
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TwoSidedPick {
    Big,
    Small,
    Odd,
    Even,
}

impl TwoSidedPick {
    /// Numbers 1..=10 this pick covers on a position
    pub fn numbers(&self) -> impl Iterator<Item = u8> + '_ {
        (1..=POSITION_COUNT as u8).filter(move |n| self.matches(*n))
    }

    pub fn matches(&self, value: u8) -> bool {
        match self {
            TwoSidedPick::Big => value >= 6,
            TwoSidedPick::Small => value < 6,
            TwoSidedPick::Odd => value % 2 == 1,
            TwoSidedPick::Even => value % 2 == 0,
        }
    }
}

/// Pick on the first-plus-second place sum (3..=19)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SumPick {
    Value(u8),
    Big,
    Small,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DragonTigerPick {
    Dragon,
    Tiger,
}

/// Closed set of wager kinds. Raw bet-type strings are parsed into this at
/// the ingestion boundary (see `games::ingest`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BetKind {
    Number {
        position: Position,
        value: u8,
    },
    TwoSided {
        position: Position,
        pick: TwoSidedPick,
    },
    Sum {
        pick: SumPick,
    },
    DragonTiger {
        first: Position,
        second: Position,
        pick: DragonTigerPick,
    },
}

impl BetKind {
    /// Position this bet is scoped to, if it is a single-position bet
    pub fn position(&self) -> Option<Position> {
        match self {
            BetKind::Number { position, .. } | BetKind::TwoSided { position, .. } => Some(*position),
            BetKind::Sum { .. } | BetKind::DragonTiger { .. } => None,
        }
    }

    /// Numbers at `position()` that make this bet win. Empty for bets that
    /// are not scoped to one position.
    pub fn covered_numbers(&self) -> Vec<u8> {
        match self {
            BetKind::Number { value, .. } => vec![*value],
            BetKind::TwoSided { pick, .. } => pick.numbers().collect(),
            BetKind::Sum { .. } | BetKind::DragonTiger { .. } => Vec::new(),
        }
    }
}

/// Settled outcome of a bet
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BetOutcome {
    Win,
    Lose,
}

/// One-way settlement status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum BetStatus {
    Unsettled,
    Settled {
        outcome: BetOutcome,
        payout: Amount,
        settled_at: u64,
    },
}

/// A wager placed by a member on a period
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bet {
    pub id: BetId,
    pub period: PeriodId,
    pub member: MemberId,
    pub kind: BetKind,
    pub stake: Amount,
    pub odds: Odds,
    pub status: BetStatus,
    pub placed_at: u64,
}

impl Bet {
    pub fn new(id: BetId, period: PeriodId, member: MemberId, kind: BetKind, stake: Amount, odds: Odds) -> Self {
        Self {
            id,
            period,
            member,
            kind,
            stake,
            odds,
            status: BetStatus::Unsettled,
            placed_at: current_timestamp_ms(),
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(self.status, BetStatus::Settled { .. })
    }

    pub fn outcome(&self) -> Option<BetOutcome> {
        match self.status {
            BetStatus::Settled { outcome, .. } => Some(outcome),
            BetStatus::Unsettled => None,
        }
    }

    pub fn payout(&self) -> Option<Amount> {
        match self.status {
            BetStatus::Settled { payout, .. } => Some(payout),
            BetStatus::Unsettled => None,
        }
    }
}

/// Period lifecycle phase
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PeriodPhase {
    Betting,
    Drawing,
    Settled,
}

impl PeriodPhase {
    /// Phases only move forward, one step at a time
    pub fn can_advance_to(&self, next: PeriodPhase) -> bool {
        matches!(
            (self, next),
            (PeriodPhase::Betting, PeriodPhase::Drawing) | (PeriodPhase::Drawing, PeriodPhase::Settled)
        )
    }
}

impl fmt::Display for PeriodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeriodPhase::Betting => write!(f, "betting"),
            PeriodPhase::Drawing => write!(f, "drawing"),
            PeriodPhase::Settled => write!(f, "settled"),
        }
    }
}

/// Persisted period row
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Period {
    pub id: PeriodId,
    pub phase: PeriodPhase,
    pub opened_at: u64,
    #[serde(default)]
    pub drawn_at: Option<u64>,
    #[serde(default)]
    pub settled_at: Option<u64>,
    /// Set once every member's rebate walk completed without errors
    #[serde(default)]
    pub rebates_completed_at: Option<u64>,
}

impl Period {
    pub fn open(id: PeriodId) -> Self {
        Self {
            id,
            phase: PeriodPhase::Betting,
            opened_at: current_timestamp_ms(),
            drawn_at: None,
            settled_at: None,
            rebates_completed_at: None,
        }
    }
}

/// Why a position was forced instead of sampled
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ForceReason {
    /// One or two numbers carry extreme weight
    WinControl,
    /// Suppressed numbers must be avoided with certainty
    LossControl,
}

/// A (position, number) pair honored exactly by the draw controller
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForcedOverride {
    pub position: Position,
    pub number: u8,
    pub reason: ForceReason,
}

/// Published draw with the inputs needed to audit it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DrawRecord {
    pub period: PeriodId,
    pub result: DrawResult,
    /// Hex RNG seed the result was sampled with
    pub seed: String,
    pub forced: Vec<ForcedOverride>,
    pub digest: String,
    pub drawn_at: u64,
}

/// Audit row written for every explicit draw replacement
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DrawAudit {
    pub period: PeriodId,
    pub previous_digest: String,
    pub previous: DrawResult,
    pub replacement_digest: String,
    pub replacement: DrawResult,
    pub operator: String,
    pub reason: String,
    pub replaced_at: u64,
}

/// Control directive mode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DirectiveMode {
    Win,
    Loss,
}

/// Scope of a control directive, with its target
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum DirectiveScope {
    /// Every member's bets, every position
    Global,
    /// One member's bets, optionally restricted to one position
    SingleMember {
        member: MemberId,
        #[serde(default)]
        position: Option<Position>,
    },
    /// Every member's bets at one position
    SinglePosition { position: Position },
    /// Exposure-driven suppression, no explicit target
    AutoRisk,
}

/// Operator-issued rule biasing or forcing an outcome. Read-only to the core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControlDirective {
    pub id: u64,
    #[serde(flatten)]
    pub scope: DirectiveScope,
    pub mode: DirectiveMode,
    /// 0..=100, chance the directive engages for a given period
    pub intensity: u8,
    pub active_from: PeriodId,
    #[serde(default)]
    pub active_until: Option<PeriodId>,
}

impl ControlDirective {
    pub fn is_active_for(&self, period: PeriodId) -> bool {
        period >= self.active_from && self.active_until.map_or(true, |until| period <= until)
    }

    /// Intensity as a probability in [0, 1]
    pub fn engage_probability(&self) -> f64 {
        self.intensity.min(100) as f64 / 100.0
    }
}

/// Rebate market type, each with its own maximum rebate
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MarketType {
    A,
    D,
}

impl MarketType {
    pub fn default_cap(&self) -> BasisPoints {
        match self {
            MarketType::A => BasisPoints(110),
            MarketType::D => BasisPoints(410),
        }
    }
}

/// One agent in a member's chain, nearest first
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentChainLink {
    pub agent: MemberId,
    pub rebate: BasisPoints,
    pub market: MarketType,
}

/// Uniqueness key of a rebate ledger entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RebateKey {
    pub period: PeriodId,
    pub member: MemberId,
    pub agent: MemberId,
}

/// One agent's rebate for one member's stake in one period
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RebateLedgerEntry {
    pub period: PeriodId,
    pub member: MemberId,
    pub agent: MemberId,
    pub amount: Amount,
    pub rate: BasisPoints,
    pub stake: Amount,
    pub created_at: u64,
}

impl RebateLedgerEntry {
    pub fn key(&self) -> RebateKey {
        RebateKey {
            period: self.period,
            member: self.member.clone(),
            agent: self.agent.clone(),
        }
    }
}

/// Reason recorded against every balance movement
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BalanceReason {
    BetStake { bet_id: BetId },
    BetPayout { bet_id: BetId },
    Rebate { period: PeriodId, member: MemberId },
    Adjustment { note: String },
}

/// Balance journal row
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BalanceEntry {
    pub account: MemberId,
    pub delta: i64,
    pub balance_after: i64,
    pub reason: BalanceReason,
    pub at: u64,
}
