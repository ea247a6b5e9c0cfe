//! Draw generation
//!
//! Produces a period's result one position at a time from a shrinking pool,
//! honoring forced overrides exactly and sampling every other position by
//! weight. The result is validated as a permutation before it leaves this
//! module; an invalid result is a fatal error and is never published.

use crate::common::config::DrawConfig;
use crate::common::types::{current_timestamp_ms, PeriodId, Position, POSITION_COUNT};
use crate::errors::DrawError;
use crate::games::types::{ControlDirective, DrawRecord, DrawResult};
use crate::games::weights::{BetAggregate, RiskState, WeightCalculator, WeightPlan};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_core::{OsRng, RngCore};
use tracing::{debug, warn};

/// Seed width for the per-draw RNG
pub type DrawSeed = [u8; 32];

/// Fresh seed from the operating system
pub fn fresh_seed() -> DrawSeed {
    let mut seed = [0u8; 32];
    OsRng.fill_bytes(&mut seed);
    seed
}

/// A generated draw plus what it took to produce it
#[derive(Debug, Clone)]
pub struct DrawOutcome {
    pub record: DrawRecord,
    pub plan: WeightPlan,
    /// Positions that fell back to uniform choice on zero total weight
    pub uniform_fallbacks: usize,
}

/// Draw controller
#[derive(Debug, Clone)]
pub struct DrawController {
    calculator: WeightCalculator,
}

impl DrawController {
    pub fn new(config: DrawConfig) -> Self {
        Self {
            calculator: WeightCalculator::new(config),
        }
    }

    /// Generate a draw for `period`. The same inputs and seed always yield
    /// the same record, so a published draw can be reproduced from its audit
    /// trail.
    pub fn generate(
        &self,
        period: PeriodId,
        directives: &[ControlDirective],
        aggregate: &BetAggregate,
        risk: &mut RiskState,
        seed: DrawSeed,
    ) -> Result<DrawOutcome, DrawError> {
        let mut rng = StdRng::from_seed(seed);
        let plan = self.calculator.calculate(directives, aggregate, risk, &mut rng);
        let (result, uniform_fallbacks) = Self::sample(&plan, &mut rng)?;

        debug!(
            period = %period,
            result = %result,
            forced = plan.forced.len(),
            "Draw generated"
        );

        let record = DrawRecord {
            period,
            result,
            seed: hex::encode(seed),
            forced: plan.forced.clone(),
            digest: result.digest(),
            drawn_at: current_timestamp_ms(),
        };

        Ok(DrawOutcome {
            record,
            plan,
            uniform_fallbacks,
        })
    }

    /// Place positions 1 through 10. Numbers claimed by a forced override are
    /// held back from every other position so the override can always be
    /// honored.
    pub fn sample<R: Rng + ?Sized>(plan: &WeightPlan, rng: &mut R) -> Result<(DrawResult, usize), DrawError> {
        let mut pool: Vec<u8> = (1..=POSITION_COUNT as u8).collect();
        let mut placed = Vec::with_capacity(POSITION_COUNT);
        let mut fallbacks = 0;

        for position in Position::all() {
            if let Some(forced) = plan.forced_at(position) {
                if let Some(idx) = pool.iter().position(|n| *n == forced.number) {
                    placed.push(pool.swap_remove(idx));
                    continue;
                }
                warn!(
                    position = position.get(),
                    number = forced.number,
                    "Forced number already placed, sampling instead"
                );
            }

            let reserved_later: Vec<u8> = plan
                .forced
                .iter()
                .filter(|f| f.position > position)
                .map(|f| f.number)
                .collect();
            let candidates: Vec<u8> = pool
                .iter()
                .copied()
                .filter(|n| !reserved_later.contains(n))
                .collect();
            // Reservations never exceed the positions still open, so the
            // candidate list is non-empty; guard anyway.
            let candidates = if candidates.is_empty() { pool.clone() } else { candidates };

            let (number, fell_back) = weighted_pick(&candidates, plan.weights_at(position), rng);
            if fell_back {
                fallbacks += 1;
                warn!(position = position.get(), "Zero total weight, uniform choice over pool");
            }
            if let Some(idx) = pool.iter().position(|n| *n == number) {
                pool.swap_remove(idx);
            }
            placed.push(number);
        }

        let result = DrawResult::try_from(placed)?;
        Ok((result, fallbacks))
    }
}

/// Cumulative-weight selection over `candidates`: draw `r` uniformly in
/// `[0, total)` and take the first number whose running total exceeds it.
/// Returns `(number, true)` when the total is zero and the choice was uniform.
pub fn weighted_pick<R: Rng + ?Sized>(candidates: &[u8], weights: &[f64; POSITION_COUNT], rng: &mut R) -> (u8, bool) {
    let weight_of = |n: u8| {
        let w = weights[(n - 1) as usize];
        if w.is_finite() && w > 0.0 {
            w
        } else {
            0.0
        }
    };

    let total: f64 = candidates.iter().map(|n| weight_of(*n)).sum();
    if !(total > 0.0 && total.is_finite()) {
        let number = candidates.choose(rng).copied().unwrap_or(candidates[0]);
        return (number, true);
    }

    let r = rng.gen_range(0.0..total);
    let mut cumulative = 0.0;
    let mut last_positive = candidates[0];
    for &number in candidates {
        let w = weight_of(number);
        if w > 0.0 {
            last_positive = number;
        }
        cumulative += w;
        if cumulative > r {
            return (number, false);
        }
    }
    // Float rounding can leave r at the very top of the range
    (last_positive, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::{BetId, MemberId, Odds};
    use crate::games::types::{Bet, BetKind, DirectiveMode, DirectiveScope, ForceReason, ForcedOverride};

    fn pos(n: u8) -> Position {
        Position::new(n).unwrap()
    }

    fn directive(scope: DirectiveScope, mode: DirectiveMode) -> ControlDirective {
        ControlDirective {
            id: 1,
            scope,
            mode,
            intensity: 100,
            active_from: PeriodId(0),
            active_until: None,
        }
    }

    fn bet(member: &str, position: u8, value: u8) -> Bet {
        Bet::new(
            BetId(value as u64),
            PeriodId(1),
            MemberId::from(member),
            BetKind::Number { position: pos(position), value },
            100,
            Odds::from_decimal(9.8),
        )
    }

    #[test]
    fn test_neutral_draws_are_permutations() {
        let controller = DrawController::new(DrawConfig::default());
        for _ in 0..200 {
            let outcome = controller
                .generate(PeriodId(1), &[], &BetAggregate::default(), &mut RiskState::default(), fresh_seed())
                .unwrap();
            assert!(DrawResult::validate(outcome.record.result.values()).is_ok());
            assert_eq!(outcome.uniform_fallbacks, 0);
        }
    }

    #[test]
    fn test_same_seed_same_draw() {
        let controller = DrawController::new(DrawConfig::default());
        let seed = [42u8; 32];
        let a = controller
            .generate(PeriodId(1), &[], &BetAggregate::default(), &mut RiskState::default(), seed)
            .unwrap();
        let b = controller
            .generate(PeriodId(1), &[], &BetAggregate::default(), &mut RiskState::default(), seed)
            .unwrap();
        assert_eq!(a.record.result, b.record.result);
        assert_eq!(a.record.seed, hex::encode(seed));
    }

    #[test]
    fn test_win_directive_is_deterministic() {
        let controller = DrawController::new(DrawConfig::default());
        let aggregate = BetAggregate::from_bets(&[bet("alice", 7, 3)]);
        let win = directive(
            DirectiveScope::SingleMember { member: "alice".into(), position: Some(pos(7)) },
            DirectiveMode::Win,
        );

        for _ in 0..200 {
            let outcome = controller
                .generate(PeriodId(1), &[win.clone()], &aggregate, &mut RiskState::default(), fresh_seed())
                .unwrap();
            assert_eq!(outcome.record.result.at(pos(7)), 3);
        }
    }

    #[test]
    fn test_loss_directive_avoids_every_bet_number() {
        let controller = DrawController::new(DrawConfig::default());
        // Nine of ten numbers at the last position: only 10 can land there
        let bets: Vec<Bet> = (1..=9).map(|v| bet("alice", 10, v)).collect();
        let aggregate = BetAggregate::from_bets(&bets);
        let loss = directive(
            DirectiveScope::SingleMember { member: "alice".into(), position: None },
            DirectiveMode::Loss,
        );

        for _ in 0..200 {
            let outcome = controller
                .generate(PeriodId(1), &[loss.clone()], &aggregate, &mut RiskState::default(), fresh_seed())
                .unwrap();
            assert_eq!(outcome.record.result.at(pos(10)), 10);
        }
    }

    #[test]
    fn test_single_number_loss_at_last_position() {
        let controller = DrawController::new(DrawConfig::default());
        let aggregate = BetAggregate::from_bets(&[bet("alice", 10, 4)]);
        let loss = directive(DirectiveScope::SinglePosition { position: pos(10) }, DirectiveMode::Loss);

        for _ in 0..300 {
            let outcome = controller
                .generate(PeriodId(1), &[loss.clone()], &aggregate, &mut RiskState::default(), fresh_seed())
                .unwrap();
            assert_ne!(outcome.record.result.at(pos(10)), 4);
        }
    }

    #[test]
    fn test_member_loss_holds_on_two_constrained_positions() {
        let controller = DrawController::new(DrawConfig::default());
        let mut bets = vec![bet("alice", 1, 1)];
        bets.extend((1..=9).map(|v| bet("alice", 10, v)));
        let aggregate = BetAggregate::from_bets(&bets);
        let loss = directive(
            DirectiveScope::SingleMember { member: "alice".into(), position: None },
            DirectiveMode::Loss,
        );

        for i in 0..1000u64 {
            let mut seed = [0u8; 32];
            seed[..8].copy_from_slice(&i.to_le_bytes());
            let outcome = controller
                .generate(PeriodId(1), &[loss.clone()], &aggregate, &mut RiskState::default(), seed)
                .unwrap();
            assert_eq!(outcome.record.result.at(pos(10)), 10);
            assert_ne!(outcome.record.result.at(pos(1)), 1);
        }
    }

    #[test]
    fn test_reserved_numbers_are_held_back() {
        let mut plan = WeightPlan::neutral();
        // Make 5 overwhelmingly likely everywhere, but reserve it for position 10
        for row in plan.weights.iter_mut() {
            row[4] = 1e9;
        }
        plan.forced.push(ForcedOverride {
            position: pos(10),
            number: 5,
            reason: ForceReason::WinControl,
        });

        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..100 {
            let (result, _) = DrawController::sample(&plan, &mut rng).unwrap();
            assert_eq!(result.at(pos(10)), 5);
        }
    }

    #[test]
    fn test_zero_weights_fall_back_to_uniform() {
        let mut plan = WeightPlan::neutral();
        plan.weights = [[0.0; POSITION_COUNT]; POSITION_COUNT];

        let mut rng = StdRng::seed_from_u64(8);
        let (result, fallbacks) = DrawController::sample(&plan, &mut rng).unwrap();
        assert!(DrawResult::validate(result.values()).is_ok());
        assert_eq!(fallbacks, POSITION_COUNT);
    }

    #[test]
    fn test_weighted_pick_skips_zero_weights() {
        let mut weights = [0.0; POSITION_COUNT];
        weights[2] = 1.0;
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..100 {
            assert_eq!(weighted_pick(&[1, 2, 3, 4], &weights, &mut rng), (3, false));
        }
    }
}
