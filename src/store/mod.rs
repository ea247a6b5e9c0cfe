//! Store implementations of the collaborator traits
//!
//! `MemoryStore` keeps everything in DashMap tables and is what tests and the
//! default binary use. `RocksStore` persists the same rows in RocksDB.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::RocksStore;

use crate::common::traits::{AgentHierarchy, BalanceLedger, BetRepository, DirectiveStore, PeriodStore, RebateLedger};
use crate::common::types::{BasisPoints, MemberId};
use crate::errors::{EngineResult, StorageError};
use crate::games::types::{AgentChainLink, ControlDirective, MarketType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Upper bound on chain depth; a longer walk means a cycle
const MAX_CHAIN_DEPTH: usize = 32;

/// One agent in the hierarchy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentNode {
    pub agent: MemberId,
    /// Next agent up, `None` at the market root
    pub parent: Option<MemberId>,
    pub rebate: BasisPoints,
    pub market: MarketType,
}

impl AgentNode {
    pub fn link(&self) -> AgentChainLink {
        AgentChainLink {
            agent: self.agent.clone(),
            rebate: self.rebate,
            market: self.market,
        }
    }
}

/// Operator-side writes: hierarchy and directives
#[async_trait]
pub trait StoreAdmin: Send + Sync {
    async fn upsert_agent(&self, node: AgentNode) -> EngineResult<()>;

    /// Attach a member to its direct agent
    async fn assign_member(&self, member: &MemberId, agent: &MemberId) -> EngineResult<()>;

    async fn put_directive(&self, directive: ControlDirective) -> EngineResult<()>;

    async fn remove_directive(&self, id: u64) -> EngineResult<bool>;
}

/// Everything the engine needs from one backing store
pub trait EngineStore:
    PeriodStore + BetRepository + BalanceLedger + RebateLedger + AgentHierarchy + DirectiveStore + StoreAdmin + 'static
{
}

impl<T> EngineStore for T where
    T: PeriodStore + BetRepository + BalanceLedger + RebateLedger + AgentHierarchy + DirectiveStore + StoreAdmin + 'static
{
}

/// Walk from a member's direct agent to the root using `lookup`
pub(crate) fn walk_chain<F>(member: &MemberId, first: Option<MemberId>, mut lookup: F) -> EngineResult<Vec<AgentChainLink>>
where
    F: FnMut(&MemberId) -> EngineResult<Option<AgentNode>>,
{
    let mut chain = Vec::new();
    let mut next = first;
    while let Some(agent) = next {
        if chain.len() >= MAX_CHAIN_DEPTH {
            return Err(StorageError::CorruptedData(format!("agent chain of {} does not terminate", member)).into());
        }
        let node = lookup(&agent)?
            .ok_or_else(|| StorageError::ReadFailed(format!("agent {} above {} is not registered", agent, member)))?;
        chain.push(node.link());
        next = node.parent;
    }
    Ok(chain)
}
