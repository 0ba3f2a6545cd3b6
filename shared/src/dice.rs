use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const MAX_DICE: u32 = 100;
pub const MIN_SIDES: u32 = 2;
pub const MAX_SIDES: u32 = 1000;
pub const MAX_MODIFIER: i32 = 1000;

/// A dice expression of the form `NdS+M`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiceFormula {
    pub count: u32,
    pub sides: u32,
    pub modifier: i32,
}

impl DiceFormula {
    pub fn new(count: u32, sides: u32, modifier: i32) -> Self {
        Self {
            count,
            sides,
            modifier,
        }
    }

    /// Rejects formulas outside the supported ranges.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.count == 0 || self.count > MAX_DICE {
            return Err(SyncError::malformed(format!(
                "dice count must be between 1 and {}",
                MAX_DICE
            )));
        }
        if self.sides < MIN_SIDES || self.sides > MAX_SIDES {
            return Err(SyncError::malformed(format!(
                "dice sides must be between {} and {}",
                MIN_SIDES, MAX_SIDES
            )));
        }
        if self.modifier.unsigned_abs() > MAX_MODIFIER.unsigned_abs() {
            return Err(SyncError::malformed(format!(
                "modifier must be within +/-{}",
                MAX_MODIFIER
            )));
        }
        Ok(())
    }

    /// Smallest and largest totals this formula can produce.
    pub fn bounds(&self) -> (i64, i64) {
        let count = self.count as i64;
        let modifier = self.modifier as i64;
        (count + modifier, count * self.sides as i64 + modifier)
    }

    pub fn total(&self, rolls: &[u32]) -> i64 {
        rolls.iter().map(|r| *r as i64).sum::<i64>() + self.modifier as i64
    }
}

impl fmt::Display for DiceFormula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}d{}", self.count, self.sides)?;
        match self.modifier {
            0 => Ok(()),
            m if m > 0 => write!(f, "+{}", m),
            m => write!(f, "{}", m),
        }
    }
}

impl FromStr for DiceFormula {
    type Err = SyncError;

    /// Parses `d20`, `3d6`, `2d8+3`, `1d12-1` (whitespace and case ignored).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let compact: String = s
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_lowercase();
        let invalid = || SyncError::malformed(format!("invalid dice formula '{}'", s));

        let (count, rest) = compact.split_once('d').ok_or_else(invalid)?;
        let count = if count.is_empty() {
            1
        } else {
            count.parse::<u32>().map_err(|_| invalid())?
        };

        let (sides, modifier) = match rest.find(['+', '-']) {
            Some(idx) => {
                let (sides, modifier) = rest.split_at(idx);
                let modifier = modifier.parse::<i32>().map_err(|_| invalid())?;
                (sides, modifier)
            }
            None => (rest, 0),
        };
        let sides = sides.parse::<u32>().map_err(|_| invalid())?;

        let formula = DiceFormula::new(count, sides, modifier);
        formula.validate()?;
        Ok(formula)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_formulas() {
        assert_eq!("d20".parse::<DiceFormula>(), Ok(DiceFormula::new(1, 20, 0)));
        assert_eq!("3d6".parse::<DiceFormula>(), Ok(DiceFormula::new(3, 6, 0)));
        assert_eq!(
            "2D8 + 3".parse::<DiceFormula>(),
            Ok(DiceFormula::new(2, 8, 3))
        );
        assert_eq!(
            "1d12-1".parse::<DiceFormula>(),
            Ok(DiceFormula::new(1, 12, -1))
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for input in ["", "20", "xd6", "2d", "2d6+", "2d6*2", "0d6", "1d1", "101d6"] {
            assert!(
                matches!(
                    input.parse::<DiceFormula>(),
                    Err(SyncError::MalformedPayload(_))
                ),
                "should reject '{}'",
                input
            );
        }
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        for formula in [
            DiceFormula::new(1, 20, 0),
            DiceFormula::new(4, 6, 2),
            DiceFormula::new(2, 10, -3),
        ] {
            assert_eq!(formula.to_string().parse::<DiceFormula>(), Ok(formula));
        }
    }

    #[test]
    fn test_bounds_and_total() {
        let formula = DiceFormula::new(2, 6, 3);
        assert_eq!(formula.bounds(), (5, 15));
        assert_eq!(formula.total(&[4, 6]), 13);
    }

    #[test]
    fn test_modifier_limit() {
        assert!(DiceFormula::new(1, 20, MAX_MODIFIER + 1).validate().is_err());
        assert!(DiceFormula::new(1, 20, -MAX_MODIFIER).validate().is_ok());
    }

    #[test]
    fn test_extreme_modifiers_rejected() {
        for modifier in [i32::MIN, i32::MIN + 1, i32::MAX] {
            assert!(matches!(
                DiceFormula::new(1, 20, modifier).validate(),
                Err(SyncError::MalformedPayload(_))
            ));
        }
        assert!(matches!(
            "1d20-2147483648".parse::<DiceFormula>(),
            Err(SyncError::MalformedPayload(_))
        ));
        assert!(matches!(
            "1d20+2147483647".parse::<DiceFormula>(),
            Err(SyncError::MalformedPayload(_))
        ));
    }
}
