//! Error types for the racedraw engine
//!
//! One root error with per-area sub-errors. Errors are scoped as narrowly as
//! possible: a failed bet or a member with a broken agent chain never aborts
//! the rest of the period. Only draw errors are fatal.

use std::fmt;

use crate::common::types::{BetId, MemberId, PeriodId};
use crate::games::ingest::BetParseError;

/// Root error type for all engine operations
#[derive(Debug)]
pub enum EngineError {
    /// Configuration related errors
    Configuration(ConfigurationError),

    /// Persistence and collaborator errors
    Storage(StorageError),

    /// Draw generation and publication errors
    Draw(DrawError),

    /// Bet settlement errors
    Settlement(SettlementError),

    /// Rebate distribution errors
    Rebate(RebateError),

    /// Lease / idempotency coordination errors
    Lease(LeaseError),

    /// Rejected at the ingestion boundary
    Ingest(BetParseError),
}

/// Configuration and validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Missing required field: {0}")]
    MissingRequired(String),

    #[error("Invalid value for {field}: '{value}' ({reason})")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("Failed to save configuration: {0}")]
    SaveFailed(String),
}

/// Storage system errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database open failed: {0}")]
    DatabaseOpenFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Corrupted data: {0}")]
    CorruptedData(String),

    #[error("Period {0} not found")]
    PeriodNotFound(PeriodId),

    #[error("Period {0} already exists")]
    PeriodExists(PeriodId),

    #[error("Bet {0} not found")]
    BetNotFound(BetId),

    #[error("Duplicate bet id {0}")]
    DuplicateBet(BetId),

    #[error("Betting is closed for period {0}")]
    BettingClosed(PeriodId),

    #[error("Insufficient balance for {account}: needs {needed}, has {available}")]
    InsufficientBalance {
        account: String,
        needed: u64,
        available: i64,
    },

    #[error("Invalid period transition for {period}: {from} -> {to}")]
    InvalidTransition {
        period: PeriodId,
        from: String,
        to: String,
    },
}

/// Draw generation errors
#[derive(Debug, thiserror::Error)]
pub enum DrawError {
    /// Cardinality or duplicate violation. Never published.
    #[error("Invalid draw result: {0}")]
    InvalidDrawResult(String),

    #[error("Draw for period {0} is already published")]
    AlreadyPublished(PeriodId),

    #[error("No draw published for period {0}")]
    NotPublished(PeriodId),

    #[error("Draw for period {0} does not match the published result")]
    Mismatch(PeriodId),

    #[error("Draw for period {period} cannot be replaced in phase {phase}")]
    ReplaceRejected { period: PeriodId, phase: String },

    #[error("Draw for period {period} cannot be replaced, {settled} bets already settled against it")]
    SettlementStarted { period: PeriodId, settled: usize },
}

/// Bet settlement errors
#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    #[error("Settlement of bet {bet_id} failed: {reason}")]
    PerBetSettlementFailure { bet_id: BetId, reason: String },

    #[error("Bet {0} belongs to a different period")]
    WrongPeriod(BetId),

    #[error("Settlement lease for period {0} lost mid-run")]
    LeaseLost(PeriodId),
}

/// Rebate distribution errors
#[derive(Debug, thiserror::Error)]
pub enum RebateError {
    #[error("Agent chain lookup failed for member {member}: {reason}")]
    AgentChainIncomplete { member: MemberId, reason: String },

    #[error("Settlement for period {0} has not fully committed")]
    SettlementNotCommitted(PeriodId),

    #[error("Rebate entry already exists for period {period}, member {member}, agent {agent}")]
    DuplicateRebateAttempt {
        period: PeriodId,
        member: MemberId,
        agent: MemberId,
    },
}

/// Lease coordination errors
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("Lease {0} is held by another worker")]
    LeaseUnavailable(String),

    #[error("Lease {0} expired before release")]
    Expired(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Configuration(e) => write!(f, "Configuration error: {}", e),
            EngineError::Storage(e) => write!(f, "Storage error: {}", e),
            EngineError::Draw(e) => write!(f, "Draw error: {}", e),
            EngineError::Settlement(e) => write!(f, "Settlement error: {}", e),
            EngineError::Rebate(e) => write!(f, "Rebate error: {}", e),
            EngineError::Lease(e) => write!(f, "Lease error: {}", e),
            EngineError::Ingest(e) => write!(f, "Bet rejected: {}", e),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Configuration(e) => Some(e),
            EngineError::Storage(e) => Some(e),
            EngineError::Draw(e) => Some(e),
            EngineError::Settlement(e) => Some(e),
            EngineError::Rebate(e) => Some(e),
            EngineError::Lease(e) => Some(e),
            EngineError::Ingest(e) => Some(e),
        }
    }
}

impl EngineError {
    /// Fatal errors halt the period's progression and need an operator.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Draw(DrawError::InvalidDrawResult(_)) | EngineError::Draw(DrawError::Mismatch(_))
        )
    }

    /// Errors the recovery sweep is expected to clear on a later pass.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Storage(StorageError::ReadFailed(_))
            | EngineError::Storage(StorageError::WriteFailed(_)) => true,
            EngineError::Settlement(_) => true,
            EngineError::Rebate(RebateError::AgentChainIncomplete { .. })
            | EngineError::Rebate(RebateError::SettlementNotCommitted(_)) => true,
            EngineError::Lease(_) => true,
            _ => false,
        }
    }
}

// From implementations for easy conversion
impl From<ConfigurationError> for EngineError {
    fn from(e: ConfigurationError) -> Self {
        EngineError::Configuration(e)
    }
}

impl From<StorageError> for EngineError {
    fn from(e: StorageError) -> Self {
        EngineError::Storage(e)
    }
}

impl From<DrawError> for EngineError {
    fn from(e: DrawError) -> Self {
        EngineError::Draw(e)
    }
}

impl From<SettlementError> for EngineError {
    fn from(e: SettlementError) -> Self {
        EngineError::Settlement(e)
    }
}

impl From<RebateError> for EngineError {
    fn from(e: RebateError) -> Self {
        EngineError::Rebate(e)
    }
}

impl From<LeaseError> for EngineError {
    fn from(e: LeaseError) -> Self {
        EngineError::Lease(e)
    }
}

impl From<BetParseError> for EngineError {
    fn from(e: BetParseError) -> Self {
        EngineError::Ingest(e)
    }
}

// External error conversions
impl From<rocksdb::Error> for EngineError {
    fn from(e: rocksdb::Error) -> Self {
        EngineError::Storage(StorageError::WriteFailed(e.to_string()))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Storage(StorageError::ReadFailed(e.to_string()))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Storage(StorageError::CorruptedData(e.to_string()))
    }
}

// Convenience type alias for Results
pub type EngineResult<T> = Result<T, EngineError>;
