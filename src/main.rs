//! racedraw binary
//!
//! Runs the period scheduler with the recovery sweep against the configured
//! store, optionally feeding simulated bets into every betting window.

use clap::Parser;
use racedraw::common::config::{generate_sample_config, StorageBackend};
use racedraw::common::traits::BalanceLedger;
use racedraw::common::types::{current_timestamp_ms, BasisPoints, BetId, MemberId, Odds, PeriodId};
use racedraw::errors::{EngineError, StorageError};
use racedraw::games::ingest::RawBet;
use racedraw::games::types::{BalanceReason, MarketType};
use racedraw::scheduler::OpenPeriodReceiver;
use racedraw::store::{AgentNode, EngineStore, StoreAdmin};
use racedraw::{ConfigLoader, DrawEngine, EngineConfig, MemoryStore, PeriodScheduler, RecoverySweep, RocksStore};
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Opening balance for each demo member, in cents
const DEMO_DEPOSIT: u64 = 1_000_000;

#[derive(Parser, Debug)]
#[command(name = "racedraw")]
#[command(about = "Ten-position draw engine with controlled draws, settlement and agent rebates", long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<String>,

    /// Number of periods to run (runs until Ctrl-C when omitted)
    #[arg(long)]
    periods: Option<u64>,

    /// Place random bets from demo members during every betting window
    #[arg(long)]
    simulate_bets: bool,

    /// Number of demo members to create
    #[arg(long, default_value = "20")]
    members: usize,

    /// Write a sample configuration to this path and exit
    #[arg(long)]
    generate_config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "racedraw=info".into()),
        )
        .init();

    let args = Args::parse();

    if let Some(path) = &args.generate_config {
        generate_sample_config(path)?;
        println!("Sample configuration written to {}", path);
        return Ok(());
    }

    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.with_path(path);
    }
    let config = loader.load()?;

    match config.storage.backend {
        StorageBackend::Memory => run(Arc::new(MemoryStore::new()), config, args).await,
        StorageBackend::Rocksdb => {
            let store = if config.storage.clear_on_start {
                RocksStore::open_clean(&config.storage.data_dir)?
            } else {
                RocksStore::open(&config.storage.data_dir)?
            };
            run(Arc::new(store), config, args).await
        }
    }
}

async fn run<S: EngineStore>(store: Arc<S>, config: EngineConfig, args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let members = seed_demo_hierarchy(store.as_ref(), args.members).await?;
    info!(members = members.len(), backend = ?config.storage.backend, "Demo hierarchy ready");

    let engine = Arc::new(DrawEngine::new(store, config.clone())?);
    let sweep = config
        .sweep
        .enabled
        .then(|| RecoverySweep::spawn(engine.clone(), config.sweep.clone()));

    let mut scheduler = PeriodScheduler::new(engine.clone(), config.scheduler.clone());
    if args.simulate_bets {
        tokio::spawn(simulate_bets(engine.clone(), scheduler.subscribe(), members));
    }

    let stop = scheduler.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested, finishing current period");
            stop.store(false, Ordering::SeqCst);
        }
    });

    let outcome = scheduler.run(args.periods).await;
    if let Some(sweep) = sweep {
        sweep.stop();
    }

    let snapshot = engine.metrics().snapshot();
    info!(
        draws = snapshot.draws_total,
        bets_settled = snapshot.bets_settled_total,
        payout = snapshot.payout_total,
        rebated = snapshot.rebate_amount_total,
        retained = snapshot.rebate_retained_total,
        "Engine stopped"
    );
    debug!("\n{}", engine.metrics().to_prometheus_format());

    outcome.map_err(Into::into)
}

/// Three agents under one market-D root, members spread across them
async fn seed_demo_hierarchy<S: EngineStore>(store: &S, count: usize) -> Result<Vec<MemberId>, EngineError> {
    let root = MemberId::from("agent-root");
    let agents = [
        AgentNode {
            agent: root.clone(),
            parent: None,
            rebate: BasisPoints(410),
            market: MarketType::D,
        },
        AgentNode {
            agent: MemberId::from("agent-east"),
            parent: Some(root.clone()),
            rebate: BasisPoints(110),
            market: MarketType::D,
        },
        AgentNode {
            agent: MemberId::from("agent-west"),
            parent: Some(MemberId::from("agent-east")),
            rebate: BasisPoints(50),
            market: MarketType::D,
        },
    ];
    for node in agents.iter().cloned() {
        store.upsert_agent(node).await?;
    }

    let mut members = Vec::with_capacity(count);
    for i in 0..count {
        let member = MemberId::new(format!("member-{:03}", i + 1));
        let agent = &agents[1 + i % 2].agent;
        store.assign_member(&member, agent).await?;
        if store.balance(&member).await? == 0 {
            store
                .credit(&member, DEMO_DEPOSIT, BalanceReason::Adjustment { note: "demo deposit".into() })
                .await?;
        }
        members.push(member);
    }
    Ok(members)
}

fn random_bet<R: Rng>(rng: &mut R) -> (RawBet, Odds) {
    let position = rng.gen_range(1..=10u8).to_string();
    match rng.gen_range(0..4) {
        0 => {
            let value = rng.gen_range(1..=10u8).to_string();
            (RawBet::new("number", Some(&position), &value), Odds::from_decimal(9.85))
        }
        1 => {
            let pick = ["big", "small", "odd", "even"].choose(rng).copied().unwrap_or("big");
            (RawBet::new("two_sided", Some(&position), pick), Odds::from_decimal(1.98))
        }
        2 => {
            let pick = ["big", "small", "odd", "even"].choose(rng).copied().unwrap_or("odd");
            (RawBet::new("sum", None, pick), Odds::from_decimal(2.0))
        }
        _ => {
            let pick = ["dragon", "tiger"].choose(rng).copied().unwrap_or("dragon");
            let first = rng.gen_range(1..=5u8).to_string();
            (RawBet::new("dragon_tiger", Some(&first), pick), Odds::from_decimal(1.98))
        }
    }
}

/// Place a burst of random bets in each open window
async fn simulate_bets(engine: Arc<DrawEngine>, mut open: OpenPeriodReceiver, members: Vec<MemberId>) {
    let next_id = AtomicU64::new(current_timestamp_ms() * 1_000);

    while open.changed().await.is_ok() {
        let Some(period) = *open.borrow() else {
            continue;
        };

        let bets: Vec<(MemberId, RawBet, Odds, u64)> = {
            let mut rng = rand::thread_rng();
            let mut bets = Vec::new();
            for member in &members {
                if !rng.gen_bool(0.6) {
                    continue;
                }
                let (raw, odds) = random_bet(&mut rng);
                let stake = rng.gen_range(1..=50u64) * 100;
                bets.push((member.clone(), raw, odds, stake));
            }
            bets
        };

        place_all(&engine, period, &next_id, bets).await;
    }
}

async fn place_all(
    engine: &DrawEngine,
    period: PeriodId,
    next_id: &AtomicU64,
    bets: Vec<(MemberId, RawBet, Odds, u64)>,
) {
    let mut placed = 0;
    for (member, raw, odds, stake) in bets {
        let id = BetId(next_id.fetch_add(1, Ordering::SeqCst));
        match engine.place_bet(id, period, member, &raw, stake, odds).await {
            Ok(_) => placed += 1,
            Err(EngineError::Storage(StorageError::BettingClosed(_))) => break,
            Err(e) => warn!(period = %period, error = %e, "Simulated bet rejected"),
        }
    }
    info!(period = %period, placed, "Simulated bets placed");
}
