use super::{BranchInstruction, MAX_CODE_LENGTH};
use crate::jvm::Error;

/// Builder for multi-way branches, picking between `tableswitch` and `lookupswitch`
///
/// A `tableswitch` is faster and (for dense keys) smaller, but needs an entry for every value in
/// its range. Keys are sorted, and as long as no two consecutive keys have more than `max_gap`
/// missing values between them, a `tableswitch` is built with the holes jumping to the default.
/// Otherwise (or if the table could never fit in a method), a `lookupswitch` is built.
///
/// ```
/// # use jvm_insnlist::jvm::code::{BranchInstruction, SwitchBuilder};
/// let switch = SwitchBuilder::new(&[5, 0, 1, 2], &["five", "zero", "one", "two"], "default")?
///     .max_gap(2)
///     .build();
/// assert_eq!(
///     switch,
///     BranchInstruction::TableSwitch {
///         default: "default",
///         low: 0,
///         targets: vec!["zero", "one", "two", "default", "default", "five"],
///     }
/// );
/// # Ok::<(), jvm_insnlist::jvm::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct SwitchBuilder<Lbl> {
    /// Cases sorted by key
    cases: Vec<(i32, Lbl)>,
    default: Lbl,
    max_gap: u32,
}

impl<Lbl: Copy> SwitchBuilder<Lbl> {
    pub fn new(
        matches: &[i32],
        targets: &[Lbl],
        default: Lbl,
    ) -> Result<SwitchBuilder<Lbl>, Error> {
        if matches.len() != targets.len() {
            return Err(Error::MismatchedSwitchTargets {
                keys: matches.len(),
                targets: targets.len(),
            });
        }
        let mut cases: Vec<(i32, Lbl)> = matches
            .iter()
            .copied()
            .zip(targets.iter().copied())
            .collect();
        cases.sort_by_key(|(key, _)| *key);
        for window in cases.windows(2) {
            if window[0].0 == window[1].0 {
                return Err(Error::DuplicateSwitchKey(window[0].0));
            }
        }
        Ok(SwitchBuilder {
            cases,
            default,
            max_gap: 1,
        })
    }

    /// Largest number of consecutive missing keys tolerated in a `tableswitch`
    pub fn max_gap(mut self, max_gap: u32) -> SwitchBuilder<Lbl> {
        self.max_gap = max_gap;
        self
    }

    /// Would the keys be lowered into a `tableswitch`?
    pub fn is_dense(&self) -> bool {
        let (low, high) = match (self.cases.first(), self.cases.last()) {
            (Some((low, _)), Some((high, _))) => (*low as i64, *high as i64),
            _ => return false,
        };
        high - low < (MAX_CODE_LENGTH / 4) as i64
            && self.cases.windows(2).all(|window| {
                let missing = window[1].0 as i64 - window[0].0 as i64 - 1;
                missing <= self.max_gap as i64
            })
    }

    pub fn build(self) -> BranchInstruction<Lbl> {
        if !self.is_dense() {
            log::trace!("Lowering {} switch cases into `lookupswitch`", self.cases.len());
            return BranchInstruction::LookupSwitch {
                default: self.default,
                targets: self.cases,
            };
        }

        let low = self.cases[0].0;
        let mut targets = Vec::with_capacity(self.cases.len());
        let mut next_key = low as i64;
        for (key, target) in self.cases {
            while next_key < key as i64 {
                targets.push(self.default);
                next_key += 1;
            }
            targets.push(target);
            next_key += 1;
        }
        log::trace!(
            "Lowering switch into `tableswitch` with {} entries",
            targets.len()
        );
        BranchInstruction::TableSwitch {
            default: self.default,
            low,
            targets,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dense_keys() {
        let switch = SwitchBuilder::new(&[0, 1, 2, 5], &[10, 11, 12, 15], 99)
            .unwrap()
            .max_gap(2)
            .build();
        assert_eq!(
            switch,
            BranchInstruction::TableSwitch {
                default: 99,
                low: 0,
                targets: vec![10, 11, 12, 99, 99, 15],
            }
        );
        assert_eq!(switch.width_at(0, false), 1 + 3 + 12 + 4 * 6);
    }

    #[test]
    fn sparse_keys() {
        let switch = SwitchBuilder::new(&[5, 0, 2, 1], &[15, 10, 12, 11], 99)
            .unwrap()
            .max_gap(0)
            .build();
        assert_eq!(
            switch,
            BranchInstruction::LookupSwitch {
                default: 99,
                targets: vec![(0, 10), (1, 11), (2, 12), (5, 15)],
            }
        );
        assert_eq!(switch.width_at(0, false), 1 + 3 + 8 + 8 * 4);
        assert_eq!(switch.width_at(3, false), 1 + 8 + 8 * 4);
    }

    #[test]
    fn extreme_keys() {
        let switch = SwitchBuilder::new(&[i32::MIN, i32::MAX], &[1, 2], 0)
            .unwrap()
            .max_gap(u32::MAX)
            .build();
        assert!(matches!(switch, BranchInstruction::LookupSwitch { .. }));

        let single = SwitchBuilder::new(&[7], &[1], 0).unwrap().build();
        assert_eq!(
            single,
            BranchInstruction::TableSwitch {
                default: 0,
                low: 7,
                targets: vec![1],
            }
        );

        let empty = SwitchBuilder::<u8>::new(&[], &[], 0).unwrap().build();
        assert_eq!(
            empty,
            BranchInstruction::LookupSwitch {
                default: 0,
                targets: vec![],
            }
        );
    }

    #[test]
    fn bad_cases() {
        assert!(matches!(
            SwitchBuilder::new(&[1, 2], &[1], 0),
            Err(Error::MismatchedSwitchTargets {
                keys: 2,
                targets: 1
            })
        ));
        assert!(matches!(
            SwitchBuilder::new(&[1, 2, 1], &[1, 2, 3], 0),
            Err(Error::DuplicateSwitchKey(1))
        ));
    }
}
