//! Server-side dice resolution.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::{DiceFormula, DiceRoll, RollVisibility, SyncError, UserId};

/// The single authoritative RNG of one session.
#[derive(Debug)]
pub struct DiceRoller {
    rng: StdRng,
}

impl DiceRoller {
    /// Seeded rollers produce the same sequence every run.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }

    pub fn roll(
        &mut self,
        requester_id: UserId,
        formula: DiceFormula,
        label: Option<String>,
        visibility: RollVisibility,
    ) -> Result<DiceRoll, SyncError> {
        formula.validate()?;
        let rolls: Vec<u32> = (0..formula.count)
            .map(|_| self.rng.gen_range(1..=formula.sides))
            .collect();
        let total = formula.total(&rolls);
        Ok(DiceRoll {
            requester_id,
            formula,
            label,
            visibility,
            rolls,
            total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rolls_stay_in_bounds() {
        let mut roller = DiceRoller::new(Some(42));
        let formula: DiceFormula = "3d6+2".parse().unwrap();
        let (low, high) = formula.bounds();

        for _ in 0..500 {
            let roll = roller
                .roll("alice".into(), formula, None, RollVisibility::Public)
                .unwrap();
            assert_eq!(roll.rolls.len(), 3);
            assert!(roll.rolls.iter().all(|r| (1..=6).contains(r)));
            assert!(roll.total >= low && roll.total <= high);
        }
    }

    #[test]
    fn test_seeded_rollers_agree() {
        let formula = DiceFormula::new(4, 20, 0);
        let mut a = DiceRoller::new(Some(7));
        let mut b = DiceRoller::new(Some(7));
        for _ in 0..10 {
            let x = a.roll("gm".into(), formula, None, RollVisibility::Public).unwrap();
            let y = b.roll("gm".into(), formula, None, RollVisibility::Public).unwrap();
            assert_eq!(x.rolls, y.rolls);
        }
    }

    #[test]
    fn test_d20_covers_every_face() {
        let mut roller = DiceRoller::new(Some(1));
        let mut seen = [false; 20];
        for _ in 0..2000 {
            let roll = roller
                .roll("alice".into(), DiceFormula::new(1, 20, 0), None, RollVisibility::Public)
                .unwrap();
            seen[(roll.rolls[0] - 1) as usize] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn test_invalid_formula_rejected() {
        let mut roller = DiceRoller::new(None);
        let result = roller.roll(
            "alice".into(),
            DiceFormula::new(0, 6, 0),
            None,
            RollVisibility::Public,
        );
        assert!(matches!(result, Err(SyncError::MalformedPayload(_))));
    }
}
