//! Weight calculation for controlled draws
//!
//! Turns the period's active control directives and its bet aggregate into a
//! weight vector per position plus a list of forced overrides. Weighted
//! sampling alone cannot guarantee a directive (a suppressed number can still
//! be the last one left in the pool), so positions whose weights are
//! conclusive are forced instead of sampled.

use crate::common::config::DrawConfig;
use crate::common::types::{Amount, MemberId, Position, POSITION_COUNT};
use crate::games::types::{Bet, ControlDirective, DirectiveMode, DirectiveScope, ForceReason, ForcedOverride};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

const NEUTRAL_WEIGHT: f64 = 1.0;

/// Per-position, per-number view of a period's bets
#[derive(Debug, Clone, Default)]
pub struct BetAggregate {
    /// Stake riding on each number, `[position][number - 1]`
    stake: [[Amount; POSITION_COUNT]; POSITION_COUNT],
    /// Payout owed if the number lands at the position
    exposure: [[Amount; POSITION_COUNT]; POSITION_COUNT],
    /// Bitmask of numbers each member bet at each position
    members: HashMap<MemberId, [u16; POSITION_COUNT]>,
    total_stake: Amount,
}

impl BetAggregate {
    pub fn from_bets<'a>(bets: impl IntoIterator<Item = &'a Bet>) -> Self {
        let mut aggregate = Self::default();
        for bet in bets {
            aggregate.add(bet);
        }
        aggregate
    }

    /// Only unsettled single-position bets shape weights. Sum and
    /// dragon/tiger bets count toward total stake.
    pub fn add(&mut self, bet: &Bet) {
        self.total_stake = self.total_stake.saturating_add(bet.stake);
        let Some(position) = bet.kind.position() else {
            return;
        };
        let payout = bet.odds.payout(bet.stake);
        let masks = self.members.entry(bet.member.clone()).or_insert([0; POSITION_COUNT]);
        for number in bet.kind.covered_numbers() {
            let slot = (number - 1) as usize;
            self.stake[position.index()][slot] = self.stake[position.index()][slot].saturating_add(bet.stake);
            self.exposure[position.index()][slot] = self.exposure[position.index()][slot].saturating_add(payout);
            masks[position.index()] |= 1 << slot;
        }
    }

    pub fn total_stake(&self) -> Amount {
        self.total_stake
    }

    pub fn stake_at(&self, position: Position, number: u8) -> Amount {
        self.stake[position.index()][(number - 1) as usize]
    }

    pub fn exposure_at(&self, position: Position, number: u8) -> Amount {
        self.exposure[position.index()][(number - 1) as usize]
    }

    /// Numbers any member has stake on at the position
    pub fn numbers_bet_at(&self, position: Position) -> Vec<u8> {
        (1..=POSITION_COUNT as u8)
            .filter(|n| self.stake_at(position, *n) > 0)
            .collect()
    }

    /// Numbers the member has bet at the position
    pub fn member_numbers(&self, member: &MemberId, position: Position) -> Vec<u8> {
        let mask = self.members.get(member).map(|m| m[position.index()]).unwrap_or(0);
        (1..=POSITION_COUNT as u8)
            .filter(|n| mask & (1 << (n - 1)) != 0)
            .collect()
    }

    /// Largest payout at the position relative to the period's total stake
    pub fn risk_ratio(&self, position: Position) -> f64 {
        if self.total_stake == 0 {
            return 0.0;
        }
        let worst = self.exposure[position.index()].iter().copied().max().unwrap_or(0);
        worst as f64 / self.total_stake as f64
    }
}

/// Auto-risk engagement per position, carried across periods so the middle
/// band keeps whatever the previous period decided
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RiskState {
    engaged: [bool; POSITION_COUNT],
}

impl RiskState {
    pub fn is_engaged(&self, position: Position) -> bool {
        self.engaged[position.index()]
    }
}

/// Output of the weight calculation
#[derive(Debug, Clone, PartialEq)]
pub struct WeightPlan {
    /// `[position][number - 1]`
    pub weights: [[f64; POSITION_COUNT]; POSITION_COUNT],
    pub forced: Vec<ForcedOverride>,
    /// Positions with range-style bias that were deliberately not forced
    pub range_controlled: Vec<Position>,
}

impl WeightPlan {
    pub fn neutral() -> Self {
        Self {
            weights: [[NEUTRAL_WEIGHT; POSITION_COUNT]; POSITION_COUNT],
            forced: Vec::new(),
            range_controlled: Vec::new(),
        }
    }

    pub fn weights_at(&self, position: Position) -> &[f64; POSITION_COUNT] {
        &self.weights[position.index()]
    }

    pub fn forced_at(&self, position: Position) -> Option<&ForcedOverride> {
        self.forced.iter().find(|f| f.position == position)
    }
}

/// Computes weight plans from directives and bets
#[derive(Debug, Clone)]
pub struct WeightCalculator {
    config: DrawConfig,
}

impl WeightCalculator {
    pub fn new(config: DrawConfig) -> Self {
        Self { config }
    }

    /// Build the period's weight plan. `rng` decides which directives engage
    /// (per their intensity) and which candidate a forced position takes.
    pub fn calculate<R: Rng + ?Sized>(
        &self,
        directives: &[ControlDirective],
        aggregate: &BetAggregate,
        risk: &mut RiskState,
        rng: &mut R,
    ) -> WeightPlan {
        let mut plan = WeightPlan::neutral();
        let mut hard_loss = [false; POSITION_COUNT];

        let engaged: Vec<&ControlDirective> = directives
            .iter()
            .filter(|d| {
                let p = d.engage_probability();
                let on = p >= 1.0 || (p > 0.0 && rng.gen_bool(p));
                if !on {
                    debug!(directive = d.id, intensity = d.intensity, "Directive did not engage this period");
                }
                on
            })
            .collect();

        if engaged.iter().any(|d| d.scope == DirectiveScope::AutoRisk) {
            self.apply_auto_risk(&mut plan, aggregate, risk);
        }

        // Wins first so a conflicting loss on the same number takes precedence
        let explicit = engaged.iter().filter(|d| d.scope != DirectiveScope::AutoRisk);
        let (wins, losses): (Vec<_>, Vec<_>) = explicit.partition(|d| d.mode == DirectiveMode::Win);
        for directive in wins.into_iter().chain(losses) {
            for (position, numbers) in Self::targets(directive, aggregate) {
                let row = &mut plan.weights[position.index()];
                for number in numbers {
                    let slot = &mut row[(number - 1) as usize];
                    match directive.mode {
                        DirectiveMode::Win => *slot = slot.max(self.config.high_weight),
                        DirectiveMode::Loss => {
                            *slot = slot.min(self.config.low_weight);
                            hard_loss[position.index()] = true;
                        }
                    }
                }
            }
        }

        self.detect_forced(&mut plan, &hard_loss, rng);
        plan
    }

    /// Positions and numbers a directive reaches, given who bet what
    fn targets(directive: &ControlDirective, aggregate: &BetAggregate) -> Vec<(Position, Vec<u8>)> {
        let mut targets = Vec::new();
        match &directive.scope {
            DirectiveScope::Global => {
                for position in Position::all() {
                    targets.push((position, aggregate.numbers_bet_at(position)));
                }
            }
            DirectiveScope::SingleMember { member, position } => {
                let positions: Vec<Position> = match position {
                    Some(p) => vec![*p],
                    None => Position::all().collect(),
                };
                for position in positions {
                    targets.push((position, aggregate.member_numbers(member, position)));
                }
            }
            DirectiveScope::SinglePosition { position } => {
                targets.push((*position, aggregate.numbers_bet_at(*position)));
            }
            DirectiveScope::AutoRisk => {}
        }
        targets.retain(|(_, numbers)| !numbers.is_empty());
        targets
    }

    /// Hysteresis on the exposure ratio: engage above `auto_risk_high`,
    /// release below `auto_risk_low`, keep the previous state in between.
    fn apply_auto_risk(&self, plan: &mut WeightPlan, aggregate: &BetAggregate, risk: &mut RiskState) {
        let total = aggregate.total_stake();
        for position in Position::all() {
            let ratio = aggregate.risk_ratio(position);
            let slot = &mut risk.engaged[position.index()];
            if ratio >= self.config.auto_risk_high {
                *slot = true;
            } else if ratio <= self.config.auto_risk_low {
                *slot = false;
            }
            if !*slot {
                continue;
            }

            let row = &mut plan.weights[position.index()];
            for number in 1..=POSITION_COUNT as u8 {
                // A number whose payout exceeds everything staked this period
                if aggregate.exposure_at(position, number) > total {
                    let w = &mut row[(number - 1) as usize];
                    *w = w.min(self.config.auto_risk_suppressed_weight);
                }
            }
            debug!(position = position.get(), ratio, "Auto-risk suppression engaged");
        }
    }

    fn detect_forced<R: Rng + ?Sized>(&self, plan: &mut WeightPlan, hard_loss: &[bool; POSITION_COUNT], rng: &mut R) {
        let mut demands: Vec<ForceDemand> = Vec::new();

        for position in Position::all() {
            let row = plan.weights[position.index()];
            let numbers = 1..=POSITION_COUNT as u8;
            let high: Vec<u8> = numbers
                .clone()
                .filter(|n| row[(*n - 1) as usize] >= self.config.high_threshold)
                .collect();
            let low: Vec<u8> = numbers
                .clone()
                .filter(|n| row[(*n - 1) as usize] <= self.config.low_threshold)
                .collect();

            let many_low = low.len() >= self.config.loss_force_min_low;
            if high.len() > 2 || (!high.is_empty() && many_low) {
                debug!(position = position.get(), high = high.len(), low = low.len(), "Range control, sampling only");
                plan.range_controlled.push(position);
                continue;
            }

            let (mut candidates, reason): (Vec<u8>, ForceReason) = if !high.is_empty() {
                (high, ForceReason::WinControl)
            } else if !low.is_empty() && (many_low || hard_loss[position.index()]) {
                let allowed = numbers.filter(|n| !low.contains(n)).collect();
                (allowed, ForceReason::LossControl)
            } else {
                continue;
            };

            candidates.shuffle(rng);
            demands.push(ForceDemand {
                position,
                candidates,
                reason,
            });
        }

        // Tightest positions first; ties broken randomly
        let mut order: Vec<usize> = (0..demands.len()).collect();
        order.shuffle(rng);
        order.sort_by_key(|&i| demands[i].candidates.len());

        let mut owner: [Option<usize>; POSITION_COUNT + 1] = [None; POSITION_COUNT + 1];
        for &i in &order {
            let mut seen = [false; POSITION_COUNT + 1];
            if !augment(i, &demands, &mut owner, &mut seen) {
                warn!(
                    position = demands[i].position.get(),
                    reason = ?demands[i].reason,
                    "No candidate left for forced position, falling back to sampling"
                );
            }
        }

        for (number, slot) in owner.iter().enumerate() {
            if let Some(i) = slot {
                plan.forced.push(ForcedOverride {
                    position: demands[*i].position,
                    number: number as u8,
                    reason: demands[*i].reason,
                });
            }
        }
        plan.forced.sort_by_key(|f| f.position);
    }
}

/// A position that wants one of `candidates` placed on it
struct ForceDemand {
    position: Position,
    candidates: Vec<u8>,
    reason: ForceReason,
}

/// Kuhn's augmenting path: give demand `i` a number, moving earlier owners
/// to their other candidates when needed. `owner` is indexed by number.
fn augment(
    i: usize,
    demands: &[ForceDemand],
    owner: &mut [Option<usize>; POSITION_COUNT + 1],
    seen: &mut [bool; POSITION_COUNT + 1],
) -> bool {
    for &number in &demands[i].candidates {
        let n = number as usize;
        if seen[n] {
            continue;
        }
        seen[n] = true;
        let free = match owner[n] {
            None => true,
            Some(j) => augment(j, demands, owner, seen),
        };
        if free {
            owner[n] = Some(i);
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::{BetId, Odds, PeriodId};
    use crate::games::types::{BetKind, TwoSidedPick};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn pos(n: u8) -> Position {
        Position::new(n).unwrap()
    }

    fn number_bet(id: u64, member: &str, position: u8, value: u8, stake: Amount) -> Bet {
        Bet::new(
            BetId(id),
            PeriodId(1),
            MemberId::from(member),
            BetKind::Number { position: pos(position), value },
            stake,
            Odds::from_decimal(9.8),
        )
    }

    fn directive(scope: DirectiveScope, mode: DirectiveMode) -> ControlDirective {
        ControlDirective {
            id: 7,
            scope,
            mode,
            intensity: 100,
            active_from: PeriodId(0),
            active_until: None,
        }
    }

    #[test]
    fn test_aggregate_tracks_members_and_exposure() {
        let bets = vec![
            number_bet(1, "alice", 3, 4, 100),
            number_bet(2, "alice", 3, 9, 50),
            number_bet(3, "bob", 3, 4, 10),
        ];
        let aggregate = BetAggregate::from_bets(&bets);

        assert_eq!(aggregate.total_stake(), 160);
        assert_eq!(aggregate.member_numbers(&"alice".into(), pos(3)), vec![4, 9]);
        assert_eq!(aggregate.member_numbers(&"bob".into(), pos(3)), vec![4]);
        assert_eq!(aggregate.stake_at(pos(3), 4), 110);
        assert_eq!(aggregate.exposure_at(pos(3), 4), 980 + 98);
        assert_eq!(aggregate.numbers_bet_at(pos(1)), Vec::<u8>::new());
    }

    #[test]
    fn test_member_win_forces_single_number() {
        let aggregate = BetAggregate::from_bets(&[number_bet(1, "alice", 5, 7, 100)]);
        let calc = WeightCalculator::new(DrawConfig::default());
        let win = directive(
            DirectiveScope::SingleMember { member: "alice".into(), position: Some(pos(5)) },
            DirectiveMode::Win,
        );

        let mut rng = StdRng::seed_from_u64(1);
        let plan = calc.calculate(&[win], &aggregate, &mut RiskState::default(), &mut rng);

        let forced = plan.forced_at(pos(5)).expect("position 5 forced");
        assert_eq!(forced.number, 7);
        assert_eq!(forced.reason, ForceReason::WinControl);
        assert_eq!(plan.forced.len(), 1);
    }

    #[test]
    fn test_member_loss_forces_outside_bet_set() {
        let aggregate = BetAggregate::from_bets(&[
            number_bet(1, "alice", 2, 1, 100),
            number_bet(2, "alice", 2, 2, 100),
        ]);
        let calc = WeightCalculator::new(DrawConfig::default());
        let loss = directive(
            DirectiveScope::SingleMember { member: "alice".into(), position: None },
            DirectiveMode::Loss,
        );

        for seed in 0..50 {
            let mut rng = StdRng::seed_from_u64(seed);
            let plan = calc.calculate(&[loss.clone()], &aggregate, &mut RiskState::default(), &mut rng);
            let forced = plan.forced_at(pos(2)).expect("targeted loss is always forced");
            assert!(![1, 2].contains(&forced.number));
            assert_eq!(forced.reason, ForceReason::LossControl);
        }
    }

    #[test]
    fn test_tight_position_keeps_its_only_number() {
        // Position 10 can only take 10; position 1 must not take it first
        let mut bets = vec![number_bet(1, "alice", 1, 1, 100)];
        bets.extend((1..=9).map(|v| number_bet(10 + v as u64, "alice", 10, v, 100)));
        let aggregate = BetAggregate::from_bets(&bets);
        let calc = WeightCalculator::new(DrawConfig::default());
        let loss = directive(
            DirectiveScope::SingleMember { member: "alice".into(), position: None },
            DirectiveMode::Loss,
        );

        for seed in 0..500 {
            let mut rng = StdRng::seed_from_u64(seed);
            let plan = calc.calculate(&[loss.clone()], &aggregate, &mut RiskState::default(), &mut rng);
            assert_eq!(plan.forced_at(pos(10)).map(|f| f.number), Some(10));
            let first = plan.forced_at(pos(1)).expect("both positions are forced");
            assert_ne!(first.number, 1);
            assert_ne!(first.number, 10);
        }
    }

    #[test]
    fn test_range_bias_is_not_forced() {
        let mut bet = number_bet(1, "alice", 1, 1, 100);
        bet.kind = BetKind::TwoSided { position: pos(1), pick: TwoSidedPick::Big };
        let aggregate = BetAggregate::from_bets(&[bet]);
        let calc = WeightCalculator::new(DrawConfig::default());
        let win = directive(
            DirectiveScope::SingleMember { member: "alice".into(), position: None },
            DirectiveMode::Win,
        );

        let mut rng = StdRng::seed_from_u64(3);
        let plan = calc.calculate(&[win], &aggregate, &mut RiskState::default(), &mut rng);

        assert!(plan.forced.is_empty());
        assert_eq!(plan.range_controlled, vec![pos(1)]);
        assert!(plan.weights_at(pos(1))[5] >= 100.0);
    }

    #[test]
    fn test_forced_numbers_never_collide() {
        // Same number won at two positions: only one can get it
        let aggregate = BetAggregate::from_bets(&[
            number_bet(1, "alice", 1, 4, 100),
            number_bet(2, "alice", 2, 4, 100),
        ]);
        let calc = WeightCalculator::new(DrawConfig::default());
        let win = directive(
            DirectiveScope::SingleMember { member: "alice".into(), position: None },
            DirectiveMode::Win,
        );

        let mut rng = StdRng::seed_from_u64(9);
        let plan = calc.calculate(&[win], &aggregate, &mut RiskState::default(), &mut rng);
        assert_eq!(plan.forced.len(), 1);
        assert_eq!(plan.forced[0].position, pos(1));
    }

    #[test]
    fn test_zero_intensity_never_engages() {
        let aggregate = BetAggregate::from_bets(&[number_bet(1, "alice", 5, 7, 100)]);
        let calc = WeightCalculator::new(DrawConfig::default());
        let mut win = directive(DirectiveScope::SinglePosition { position: pos(5) }, DirectiveMode::Win);
        win.intensity = 0;

        let mut rng = StdRng::seed_from_u64(11);
        let plan = calc.calculate(&[win], &aggregate, &mut RiskState::default(), &mut rng);
        assert_eq!(plan, WeightPlan::neutral());
    }

    #[test]
    fn test_auto_risk_hysteresis() {
        let calc = WeightCalculator::new(DrawConfig::default());
        let auto = directive(DirectiveScope::AutoRisk, DirectiveMode::Loss);
        let mut risk = RiskState::default();
        let mut rng = StdRng::seed_from_u64(5);

        // One heavy number bet: exposure 9.8x total stake, engages
        let heavy = BetAggregate::from_bets(&[number_bet(1, "alice", 4, 3, 1_000)]);
        let plan = calc.calculate(&[auto.clone()], &heavy, &mut risk, &mut rng);
        assert!(risk.is_engaged(pos(4)));
        assert!(plan.weights_at(pos(4))[2] < 1.0);
        assert!(plan.forced.is_empty());

        // Middle band (ratio 2.0): state kept, still suppressing
        let middle = BetAggregate::from_bets(&[
            number_bet(1, "alice", 4, 3, 1_000),
            number_bet(2, "bob", 4, 5, 1_000),
            number_bet(3, "carol", 9, 1, 2_900),
        ]);
        assert!(middle.risk_ratio(pos(4)) > 1.0 && middle.risk_ratio(pos(4)) < 3.0);
        let plan = calc.calculate(&[auto.clone()], &middle, &mut risk, &mut rng);
        assert!(risk.is_engaged(pos(4)));
        assert!(plan.weights_at(pos(4))[2] < 1.0);

        // Low risk: released, neutral again
        let calm = BetAggregate::from_bets(&[number_bet(1, "alice", 4, 3, 10), number_bet(2, "bob", 9, 1, 5_000)]);
        let plan = calc.calculate(&[auto], &calm, &mut risk, &mut rng);
        assert!(!risk.is_engaged(pos(4)));
        assert_eq!(plan.weights_at(pos(4)), &[1.0; POSITION_COUNT]);
    }
}
