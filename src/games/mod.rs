pub mod draw;
pub mod ingest;
pub mod rebate;
pub mod settlement;
pub mod types;
pub mod weights;

pub use draw::{fresh_seed, DrawController, DrawOutcome};
pub use ingest::{BetParseError, RawBet};
pub use rebate::{RebateDistributor, RebateReport, RebateStatus};
pub use settlement::{classify, SettlementEngine, SettlementReport, SettlementStatus};
pub use types::*;
pub use weights::{BetAggregate, RiskState, WeightCalculator, WeightPlan};
