//! Ingestion boundary for wagers.
//!
//! Bet types arrive as loosely typed strings, in English or Chinese, from the
//! betting front end. They are parsed exactly once, here, into a closed
//! [`BetKind`]. Nothing downstream matches on raw strings.

use crate::common::types::{Position, POSITION_COUNT};
use crate::games::types::{BetKind, DragonTigerPick, SumPick, TwoSidedPick};
use serde::{Deserialize, Serialize};

/// Smallest and largest first-plus-second sum
const SUM_MIN: u8 = 3;
const SUM_MAX: u8 = 19;

/// Bet as submitted by the front end
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawBet {
    pub bet_type: String,
    #[serde(default)]
    pub position: Option<String>,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BetParseError {
    #[error("Unknown bet type: {0}")]
    UnknownBetType(String),

    #[error("Unknown position: {0}")]
    UnknownPosition(String),

    #[error("Missing position for bet type {0}")]
    MissingPosition(String),

    #[error("Invalid value '{value}' for bet type {bet_type}")]
    InvalidValue { bet_type: String, value: String },

    #[error("Dragon/tiger positions must differ, got {0} twice")]
    SamePositions(u8),
}

enum Family {
    Number,
    TwoSided,
    Sum,
    DragonTiger,
}

fn family(bet_type: &str) -> Option<Family> {
    match normalize(bet_type).as_str() {
        "number" | "position" | "号码" | "定位" | "定位胆" => Some(Family::Number),
        "twosided" | "two_sided" | "bigsmall" | "oddeven" | "两面" | "大小" | "单双" => Some(Family::TwoSided),
        "sum" | "sumvalue" | "冠亚和" | "冠亚和值" | "冠亚" => Some(Family::Sum),
        "dragontiger" | "dragon_tiger" | "龙虎" => Some(Family::DragonTiger),
        _ => None,
    }
}

fn normalize(raw: &str) -> String {
    raw.trim().to_lowercase().replace(['-', ' '], "")
}

/// Accepts `1`..`10`, English place names, and Chinese place names
pub fn parse_position(raw: &str) -> Result<Position, BetParseError> {
    let key = normalize(raw);
    let number = match key.as_str() {
        "champion" | "first" | "冠军" | "第一名" => Some(1),
        "runnerup" | "second" | "亚军" | "第二名" => Some(2),
        "third" | "季军" | "第三名" => Some(3),
        "fourth" | "第四名" => Some(4),
        "fifth" | "第五名" => Some(5),
        "sixth" | "第六名" => Some(6),
        "seventh" | "第七名" => Some(7),
        "eighth" | "第八名" => Some(8),
        "ninth" | "第九名" => Some(9),
        "tenth" | "第十名" => Some(10),
        other => other.parse::<u8>().ok(),
    };
    number
        .and_then(Position::new)
        .ok_or_else(|| BetParseError::UnknownPosition(raw.to_string()))
}

fn parse_two_sided(raw: &str) -> Option<TwoSidedPick> {
    match normalize(raw).as_str() {
        "big" | "大" => Some(TwoSidedPick::Big),
        "small" | "小" => Some(TwoSidedPick::Small),
        "odd" | "单" => Some(TwoSidedPick::Odd),
        "even" | "双" => Some(TwoSidedPick::Even),
        _ => None,
    }
}

fn parse_dragon_tiger(raw: &str) -> Option<DragonTigerPick> {
    match normalize(raw).as_str() {
        "dragon" | "龙" => Some(DragonTigerPick::Dragon),
        "tiger" | "虎" => Some(DragonTigerPick::Tiger),
        _ => None,
    }
}

/// Dragon/tiger position pairs are written `1v10`, `1-10` or `1,10`. A single
/// position `n` pairs with its mirror `11 - n`.
fn parse_pair(raw: &str) -> Result<(Position, Position), BetParseError> {
    let trimmed = raw.trim();
    let parts: Vec<&str> = trimmed
        .split(|c: char| c == 'v' || c == 'V' || c == ',' || c == '-' || c == '|')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    match parts.as_slice() {
        [single] => {
            let first = parse_position(single)?;
            let mirror = POSITION_COUNT as u8 + 1 - first.get();
            let second = Position::new(mirror).ok_or_else(|| BetParseError::UnknownPosition(raw.to_string()))?;
            Ok((first, second))
        }
        [a, b] => Ok((parse_position(a)?, parse_position(b)?)),
        _ => Err(BetParseError::UnknownPosition(raw.to_string())),
    }
}

impl RawBet {
    pub fn new(bet_type: &str, position: Option<&str>, value: &str) -> Self {
        Self {
            bet_type: bet_type.to_string(),
            position: position.map(str::to_string),
            value: value.to_string(),
        }
    }

    /// Parse into the closed bet kind
    pub fn parse(&self) -> Result<BetKind, BetParseError> {
        let family = family(&self.bet_type).ok_or_else(|| BetParseError::UnknownBetType(self.bet_type.clone()))?;
        let invalid = || BetParseError::InvalidValue {
            bet_type: self.bet_type.clone(),
            value: self.value.clone(),
        };

        match family {
            Family::Number => {
                let position = self.required_position()?;
                let value: u8 = self.value.trim().parse().map_err(|_| invalid())?;
                if !(1..=POSITION_COUNT as u8).contains(&value) {
                    return Err(invalid());
                }
                Ok(BetKind::Number { position, value })
            }
            Family::TwoSided => {
                let position = self.required_position()?;
                let pick = parse_two_sided(&self.value).ok_or_else(invalid)?;
                Ok(BetKind::TwoSided { position, pick })
            }
            Family::Sum => {
                let pick = match parse_two_sided(&self.value) {
                    Some(TwoSidedPick::Big) => SumPick::Big,
                    Some(TwoSidedPick::Small) => SumPick::Small,
                    Some(TwoSidedPick::Odd) => SumPick::Odd,
                    Some(TwoSidedPick::Even) => SumPick::Even,
                    None => {
                        let value: u8 = self.value.trim().parse().map_err(|_| invalid())?;
                        if !(SUM_MIN..=SUM_MAX).contains(&value) {
                            return Err(invalid());
                        }
                        SumPick::Value(value)
                    }
                };
                Ok(BetKind::Sum { pick })
            }
            Family::DragonTiger => {
                let raw_pair = self
                    .position
                    .as_deref()
                    .ok_or_else(|| BetParseError::MissingPosition(self.bet_type.clone()))?;
                let (first, second) = parse_pair(raw_pair)?;
                if first == second {
                    return Err(BetParseError::SamePositions(first.get()));
                }
                let pick = parse_dragon_tiger(&self.value).ok_or_else(invalid)?;
                Ok(BetKind::DragonTiger { first, second, pick })
            }
        }
    }

    fn required_position(&self) -> Result<Position, BetParseError> {
        let raw = self
            .position
            .as_deref()
            .ok_or_else(|| BetParseError::MissingPosition(self.bet_type.clone()))?;
        parse_position(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(n: u8) -> Position {
        Position::new(n).unwrap()
    }

    #[test]
    fn test_number_bet_aliases() {
        let en = RawBet::new("number", Some("3"), "7").parse().unwrap();
        let zh = RawBet::new("定位胆", Some("第三名"), "7").parse().unwrap();
        assert_eq!(en, BetKind::Number { position: pos(3), value: 7 });
        assert_eq!(en, zh);
    }

    #[test]
    fn test_two_sided_aliases() {
        let kind = RawBet::new("两面", Some("冠军"), "大").parse().unwrap();
        assert_eq!(kind, BetKind::TwoSided { position: pos(1), pick: TwoSidedPick::Big });

        let kind = RawBet::new("oddEven", Some("tenth"), "even").parse().unwrap();
        assert_eq!(kind, BetKind::TwoSided { position: pos(10), pick: TwoSidedPick::Even });
    }

    #[test]
    fn test_sum_bets() {
        assert_eq!(
            RawBet::new("冠亚和", None, "3").parse().unwrap(),
            BetKind::Sum { pick: SumPick::Value(3) }
        );
        assert_eq!(
            RawBet::new("sum", None, "小").parse().unwrap(),
            BetKind::Sum { pick: SumPick::Small }
        );
        assert!(RawBet::new("sum", None, "2").parse().is_err());
        assert!(RawBet::new("sum", None, "20").parse().is_err());
    }

    #[test]
    fn test_dragon_tiger_pairs() {
        let kind = RawBet::new("龙虎", Some("1v2"), "虎").parse().unwrap();
        assert_eq!(
            kind,
            BetKind::DragonTiger { first: pos(1), second: pos(2), pick: DragonTigerPick::Tiger }
        );

        let mirrored = RawBet::new("dragonTiger", Some("3"), "dragon").parse().unwrap();
        assert_eq!(
            mirrored,
            BetKind::DragonTiger { first: pos(3), second: pos(8), pick: DragonTigerPick::Dragon }
        );

        assert_eq!(
            RawBet::new("dragonTiger", Some("4v4"), "dragon").parse(),
            Err(BetParseError::SamePositions(4))
        );
    }

    #[test]
    fn test_rejects_unknown_and_out_of_range() {
        assert!(matches!(
            RawBet::new("lucky", Some("1"), "1").parse(),
            Err(BetParseError::UnknownBetType(_))
        ));
        assert!(matches!(
            RawBet::new("number", Some("11"), "1").parse(),
            Err(BetParseError::UnknownPosition(_))
        ));
        assert!(matches!(
            RawBet::new("number", Some("1"), "0").parse(),
            Err(BetParseError::InvalidValue { .. })
        ));
        assert!(matches!(
            RawBet::new("number", None, "1").parse(),
            Err(BetParseError::MissingPosition(_))
        ));
    }
}
