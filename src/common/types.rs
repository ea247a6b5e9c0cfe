//! Shared type definitions for the racedraw engine
//!
//! Identifiers, money and rate units used across the draw, settlement and
//! rebate paths. Money is always integer minor units (cents); rates are basis
//! points; odds are fixed-point with four decimals.

use chrono::{Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Amount in minor currency units (cents)
pub type Amount = u64;

/// Number of distinct positions (and numbers) in a draw
pub const POSITION_COUNT: usize = 10;

/// Sequence slots per calendar day in a period id
const PERIOD_SEQ_SLOTS: u64 = 10_000;

/// Period identifier: `YYYYMMDD * 10_000 + sequence`, monotonic across days
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct PeriodId(pub u64);

impl PeriodId {
    /// First period of the given day has sequence 1
    pub fn new(date: NaiveDate, seq: u32) -> Self {
        let day = date.year() as u64 * 10_000 + date.month() as u64 * 100 + date.day() as u64;
        Self(day * PERIOD_SEQ_SLOTS + seq as u64)
    }

    pub fn first_of(date: NaiveDate) -> Self {
        Self::new(date, 1)
    }

    pub fn date_part(&self) -> u64 {
        self.0 / PERIOD_SEQ_SLOTS
    }

    pub fn sequence(&self) -> u32 {
        (self.0 % PERIOD_SEQ_SLOTS) as u32
    }

    /// Next period id; rolls over to the first period of `today` when the
    /// date prefix changes.
    pub fn next_on(&self, today: NaiveDate) -> Self {
        let candidate = Self::first_of(today);
        if candidate.date_part() > self.date_part() {
            candidate
        } else {
            Self(self.0 + 1)
        }
    }

    pub fn next(&self) -> Self {
        self.next_on(Utc::now().date_naive())
    }
}

impl fmt::Display for PeriodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Member or agent account identifier
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct MemberId(pub String);

impl MemberId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MemberId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Bet identifier
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct BetId(pub u64);

impl fmt::Display for BetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A rate in basis points (1 bp = 0.01%)
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(transparent)]
pub struct BasisPoints(pub u32);

impl BasisPoints {
    pub const ZERO: BasisPoints = BasisPoints(0);

    /// `amount * rate`, rounded down and saturating at `Amount::MAX`
    pub fn apply(&self, amount: Amount) -> Amount {
        Amount::try_from(amount as u128 * self.0 as u128 / 10_000).unwrap_or(Amount::MAX)
    }

    pub fn saturating_sub(self, other: BasisPoints) -> BasisPoints {
        BasisPoints(self.0.saturating_sub(other.0))
    }

    pub fn as_percent(&self) -> f64 {
        self.0 as f64 / 100.0
    }
}

impl fmt::Display for BasisPoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}%", self.as_percent())
    }
}

/// Decimal odds with four fixed decimals (9.85 == `Odds(98_500)`)
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct Odds(pub u32);

impl Odds {
    const SCALE: u128 = 10_000;

    pub fn from_decimal(odds: f64) -> Self {
        Self((odds * Self::SCALE as f64).round() as u32)
    }

    /// `stake * odds`, rounded down and saturating at `Amount::MAX`
    pub fn payout(&self, stake: Amount) -> Amount {
        Amount::try_from(stake as u128 * self.0 as u128 / Self::SCALE).unwrap_or(Amount::MAX)
    }
}

/// One of the ten ranked slots, 1-indexed
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(try_from = "u8", into = "u8")]
pub struct Position(u8);

impl Position {
    pub const FIRST: Position = Position(1);
    pub const SECOND: Position = Position(2);

    pub fn new(position: u8) -> Option<Self> {
        (1..=POSITION_COUNT as u8).contains(&position).then_some(Self(position))
    }

    pub fn get(&self) -> u8 {
        self.0
    }

    /// Zero-based slot index
    pub fn index(&self) -> usize {
        (self.0 - 1) as usize
    }

    pub fn all() -> impl Iterator<Item = Position> {
        (1..=POSITION_COUNT as u8).map(Position)
    }
}

impl TryFrom<u8> for Position {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Position::new(value).ok_or_else(|| format!("position {} out of range 1..=10", value))
    }
}

impl From<Position> for u8 {
    fn from(p: Position) -> u8 {
        p.0
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current Unix timestamp in milliseconds
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_money_math_saturates() {
        assert_eq!(Odds::from_decimal(9.85).payout(1_000), 9_850);
        assert_eq!(Odds::from_decimal(9.85).payout(Amount::MAX), Amount::MAX);
        assert_eq!(BasisPoints(410).apply(100_000), 4_100);
        assert_eq!(BasisPoints(20_000).apply(Amount::MAX), Amount::MAX);
    }

    #[test]
    fn test_period_id_layout() {
        let date = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap();
        let id = PeriodId::new(date, 42);
        assert_eq!(id.0, 202610160042);
        assert_eq!(id.date_part(), 20261016);
        assert_eq!(id.sequence(), 42);
    }

    #[test]
    fn test_period_id_monotonic_across_days() {
        let day1 = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap();
        let day2 = NaiveDate::from_ymd_opt(2026, 10, 17).unwrap();
        let last = PeriodId::new(day1, 1152);

        assert_eq!(last.next_on(day1).sequence(), 1153);
        let rolled = last.next_on(day2);
        assert_eq!(rolled, PeriodId::first_of(day2));
        assert!(rolled > last);
    }

    #[test]
    fn test_basis_points_round_down() {
        assert_eq!(BasisPoints(50).apply(100_000), 500);
        assert_eq!(BasisPoints(110).apply(99), 1);
        assert_eq!(BasisPoints(410).apply(0), 0);
    }

    #[test]
    fn test_odds_payout() {
        let odds = Odds::from_decimal(9.85);
        assert_eq!(odds, Odds(98_500));
        assert_eq!(odds.payout(1_000), 9_850);
    }

    #[test]
    fn test_position_bounds() {
        assert!(Position::new(0).is_none());
        assert!(Position::new(11).is_none());
        assert_eq!(Position::new(10).unwrap().index(), 9);
        assert_eq!(Position::all().count(), POSITION_COUNT);
    }
}
