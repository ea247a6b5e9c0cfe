//! Periods, draws, balances and rebates survive a RocksDB restart

use racedraw::common::config::EngineConfig;
use racedraw::common::traits::{BalanceLedger, BetRepository, PeriodStore, RebateLedger};
use racedraw::common::types::{BasisPoints, BetId, MemberId, Odds, PeriodId};
use racedraw::games::ingest::RawBet;
use racedraw::games::types::{BalanceReason, MarketType, PeriodPhase};
use racedraw::store::{AgentNode, StoreAdmin};
use racedraw::{DrawEngine, GameState, RocksStore};
use std::sync::Arc;
use tempfile::TempDir;

const PERIOD: PeriodId = PeriodId(20260301_0002);

#[tokio::test]
async fn test_settled_period_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("racedraw");
    let alice = MemberId::from("alice");

    let (draw, balance, entries) = {
        let store = Arc::new(RocksStore::open(&path).unwrap());
        store
            .upsert_agent(AgentNode {
                agent: "upper".into(),
                parent: None,
                rebate: BasisPoints(410),
                market: MarketType::D,
            })
            .await
            .unwrap();
        store.assign_member(&alice, &"upper".into()).await.unwrap();
        store
            .credit(&alice, 50_000, BalanceReason::Adjustment { note: "deposit".into() })
            .await
            .unwrap();

        let engine = DrawEngine::new(store.clone(), EngineConfig::for_testing()).unwrap();
        let mut state = GameState::default();
        engine.open_period(&mut state, PERIOD).await.unwrap();
        engine
            .place_bet(
                BetId(1),
                PERIOD,
                alice.clone(),
                &RawBet::new("sum", None, "odd"),
                10_000,
                Odds::from_decimal(2.0),
            )
            .await
            .unwrap();
        let draw = engine.on_period_drawing(&mut state, PERIOD).await.unwrap();
        let (report, rebates) = engine.settle_and_distribute(PERIOD).await.unwrap();
        assert_eq!(report.settled, 1);
        // Full claim by a single agent at the cap
        assert_eq!(rebates.unwrap().total_rebated, 410);

        store.flush().unwrap();
        let balance = store.balance(&alice).await.unwrap();
        let entries = store.entries_for_period(PERIOD).await.unwrap();
        (draw, balance, entries)
    };

    let store = RocksStore::open(&path).unwrap();
    let period = store.period(PERIOD).await.unwrap().unwrap();
    assert_eq!(period.phase, PeriodPhase::Settled);
    assert!(period.rebates_completed_at.is_some());

    let record = store.draw(PERIOD).await.unwrap().unwrap();
    assert_eq!(record.result, draw);
    assert_eq!(record.digest, draw.digest());

    assert_eq!(store.balance(&alice).await.unwrap(), balance);
    assert_eq!(store.balance(&"upper".into()).await.unwrap(), 410);
    assert_eq!(store.entries_for_period(PERIOD).await.unwrap(), entries);
    assert!(store.unsettled_bets(PERIOD).await.unwrap().is_empty());
    assert!(store.bet(BetId(1)).await.unwrap().unwrap().is_settled());
    assert!(store.recovery_candidates().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_open_clean_discards_previous_data() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("racedraw");

    {
        let store = RocksStore::open(&path).unwrap();
        store
            .credit(&"bob".into(), 1_000, BalanceReason::Adjustment { note: "deposit".into() })
            .await
            .unwrap();
        store.flush().unwrap();
    }

    let store = RocksStore::open_clean(&path).unwrap();
    assert_eq!(store.balance(&"bob".into()).await.unwrap(), 0);
}
