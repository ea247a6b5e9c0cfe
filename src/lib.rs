//! racedraw - draw control, settlement and rebate engine
//!
//! Ten-position ranked draws, one permutation of 1..=10 per period. Operators
//! steer outcomes through control directives; bets are settled against the
//! published draw and agent rebates are paid out of each member's stake.

pub mod common;
pub mod coordinator;
pub mod engine;
pub mod errors;
pub mod games;
pub mod metrics;
pub mod scheduler;
pub mod storage;
pub mod store;
pub mod sweep;

pub use common::config::{ConfigBuilder, ConfigLoader, EngineConfig};
pub use coordinator::{ConsistencyCoordinator, LeaseGuard, LeaseScope};
pub use engine::DrawEngine;
pub use errors::{EngineError, EngineResult};
pub use metrics::EngineMetrics;
pub use scheduler::{GameState, PeriodScheduler};
pub use store::{EngineStore, MemoryStore, RocksStore};
pub use sweep::RecoverySweep;
