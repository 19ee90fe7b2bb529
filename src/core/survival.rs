use rand::{Rng, RngCore};

use super::life_table::LifeTable;

/// Per-period survival probabilities for one episode, indexed by period
/// from the start of the episode.
///
/// `alive_single[k]` is `None` while both members of a couple are still
/// alive on the sampled death path, and is the survival-conditional
/// weight of the remaining member afterwards. Single households have it
/// defined from period 0.
#[derive(Debug, Clone, PartialEq)]
pub struct SurvivalArrays {
    pub first_dies_first: bool,
    pub alive_both: Vec<f64>,
    pub alive_one: Vec<f64>,
    pub alive_single: Vec<Option<f64>>,
    pub life_expectancy_both: Vec<f64>,
    pub life_expectancy_one: Vec<f64>,
    pub life_expectancy_single: Vec<Option<f64>>,
    /// Expected person-years lived by the household.
    pub alive_years: f64,
}

impl SurvivalArrays {
    /// Number of steps in the episode.
    pub fn horizon(&self) -> usize {
        self.alive_single.len() - 1
    }
}

pub struct SurvivalModel<'a> {
    pub table: &'a LifeTable,
    pub table2: Option<&'a LifeTable>,
    pub time_period: f64,
    pub start_year: f64,
}

impl SurvivalModel<'_> {
    pub fn compute(&self, age: f64, age2: f64, rng: &mut dyn RngCore) -> SurvivalArrays {
        let dead_at = rng.random::<f64>();
        let dead_at2 = rng.random::<f64>();
        self.compute_with_rolls(age, age2, dead_at, dead_at2)
    }

    /// Integrates mortality year by year, split at period boundaries.
    /// A member dies on the sampled path once their cumulative survival
    /// drops below their death roll.
    pub fn compute_with_rolls(
        &self,
        age: f64,
        age2: f64,
        dead_at: f64,
        dead_at2: f64,
    ) -> SurvivalArrays {
        let couple = self.table2.is_some();
        let dt = self.time_period;

        let mut alive_both = vec![if couple { 1.0 } else { 0.0 }];
        let mut alive_one = vec![if couple { 0.0 } else { 1.0 }];
        let mut alive_single = vec![if couple { None } else { Some(1.0) }];

        let mut alive = 1.0_f64;
        let mut alive2 = 1.0_f64;
        let mut single = if couple { None } else { Some(1.0) };
        let mut dead = false;
        let mut dead2 = !couple;
        let mut first_dies_first = false;

        let mut y = 0.0;
        let mut q_y = -1.0;
        let mut q = 0.0_f64;
        let mut q2 = 0.0_f64;
        let mut remaining_fract = 0.0_f64;
        let mut period_end = dt;
        loop {
            let fract = remaining_fract.min(period_end - y);
            let prev_alive = alive;
            let prev_alive2 = alive2;
            let q_fract = (1.0 - q).powf(fract);
            let q_fract2 = (1.0 - q2).powf(fract);
            alive *= q_fract;
            alive2 *= q_fract2;
            if !(dead || dead2) {
                dead = alive < dead_at;
                dead2 = alive2 < dead_at2;
                if dead && dead2 {
                    single = Some(0.0);
                } else if dead {
                    first_dies_first = true;
                    single = Some(q_fract.powf(crossing_fraction(dead_at, alive, prev_alive)));
                } else if dead2 {
                    single = Some(q_fract2.powf(crossing_fraction(dead_at2, alive2, prev_alive2)));
                }
            } else if dead {
                single = single.map(|s| s * q_fract2);
            } else if dead2 {
                single = single.map(|s| s * q_fract);
            }
            remaining_fract -= fract;
            y += fract;
            if y >= period_end {
                alive_both.push(alive * alive2);
                alive_one.push(1.0 - alive * alive2 - (1.0 - alive) * (1.0 - alive2));
                alive_single.push(single);
                period_end += dt;
            }
            if y - q_y >= 1.0 || remaining_fract <= 0.0 {
                q_y += 1.0;
                q = self.table.q(age + q_y, self.start_year + q_y);
                q2 = match self.table2 {
                    Some(table2) => table2.q(age2 + q_y, self.start_year + q_y),
                    None => 1.0,
                };
                remaining_fract = 1.0;
                if q == 1.0 && q2 == 1.0 {
                    break;
                }
            }
        }

        let alive_years = (2.0 * alive_both.iter().sum::<f64>() + alive_one.iter().sum::<f64>()) * dt;

        let mut life_expectancy_both = Vec::with_capacity(alive_both.len() + 1);
        let mut life_expectancy_one = Vec::with_capacity(alive_one.len() + 1);
        for k in 0..alive_both.len() {
            life_expectancy_both.push(ratio_or_zero(
                alive_both[k..].iter().sum::<f64>(),
                alive_both[k],
            ) * dt);
            life_expectancy_one.push(ratio_or_zero(
                alive_one[k..].iter().sum::<f64>(),
                alive_both[k] + alive_one[k],
            ) * dt);
        }
        life_expectancy_both.push(0.0);
        life_expectancy_one.push(0.0);

        let mut life_expectancy_single = Vec::with_capacity(alive_single.len() + 1);
        for k in 0..alive_single.len() {
            let le = alive_single[k].map(|current| {
                let remaining: f64 = alive_single[k..].iter().flatten().sum();
                ratio_or_zero(remaining, current) * dt
            });
            life_expectancy_single.push(le);
        }
        life_expectancy_single.push(Some(0.0));
        alive_single.push(Some(0.0));

        SurvivalArrays {
            first_dies_first,
            alive_both,
            alive_one,
            alive_single,
            life_expectancy_both,
            life_expectancy_one,
            life_expectancy_single,
            alive_years,
        }
    }
}

/// Share of the sub-step still lived before survival crossed the roll.
fn crossing_fraction(roll: f64, alive: f64, prev_alive: f64) -> f64 {
    let drop = prev_alive - alive;
    if drop > 0.0 {
        (roll - alive) / drop
    } else {
        1.0
    }
}

fn ratio_or_zero(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{LifeTableSpec, Sex};
    use approx::assert_relative_eq;
    use proptest::prelude::*;
    use rand::SeedableRng;

    fn model<'a>(table: &'a LifeTable, table2: Option<&'a LifeTable>) -> SurvivalModel<'a> {
        SurvivalModel {
            table,
            table2,
            time_period: 1.0,
            start_year: 2020.0,
        }
    }

    #[test]
    fn single_with_no_mortality_survives_to_death_age() {
        let table = LifeTable::fixed(0.0, 70.0);
        let stats = model(&table, None).compute_with_rolls(65.0, 65.0, 0.5, 0.5);

        assert!(!stats.first_dies_first);
        assert_eq!(stats.alive_one, vec![1.0; 6]);
        assert_eq!(stats.alive_both, vec![0.0; 6]);
        assert_eq!(stats.alive_single.len(), 7);
        assert_eq!(stats.alive_single[0], Some(1.0));
        assert_eq!(stats.alive_single[6], Some(0.0));
        assert_eq!(stats.horizon(), 6);
        assert_relative_eq!(stats.life_expectancy_one[0], 6.0);
        assert_eq!(stats.life_expectancy_both[0], 0.0);
        assert_eq!(*stats.life_expectancy_one.last().unwrap(), 0.0);
        assert_relative_eq!(stats.alive_years, 6.0);
    }

    #[test]
    fn oracle_couple_first_death_matches_hand_calculation() {
        let table = LifeTable::fixed(0.1, 70.0);
        let table2 = LifeTable::fixed(0.1, 70.0);
        let stats = model(&table, Some(&table2)).compute_with_rolls(65.0, 65.0, 0.85, 0.5);

        assert!(stats.first_dies_first);
        assert_eq!(stats.alive_single[0], None);
        assert_eq!(stats.alive_single[1], None);
        let at_death = 0.9_f64.powf((0.85 - 0.81) / (0.9 - 0.81));
        assert_relative_eq!(stats.alive_single[2].unwrap(), at_death, epsilon = 1e-12);
        assert_relative_eq!(stats.alive_single[3].unwrap(), at_death * 0.9, epsilon = 1e-12);
        assert_eq!(stats.life_expectancy_single[1], None);
        assert!(stats.life_expectancy_single[2].unwrap() > 0.0);

        assert_relative_eq!(stats.alive_both[1], 0.81, epsilon = 1e-12);
        assert_relative_eq!(stats.alive_one[1], 0.18, epsilon = 1e-12);
        assert_eq!(stats.alive_single.len(), 7);
    }

    #[test]
    fn simultaneous_deaths_leave_zero_single_weight() {
        let table = LifeTable::fixed(0.5, 80.0);
        let stats = model(&table, Some(&table)).compute_with_rolls(65.0, 65.0, 0.6, 0.6);
        assert_eq!(stats.alive_single[1], Some(0.0));
        assert_eq!(stats.alive_single[2], Some(0.0));
    }

    #[test]
    fn life_expectancy_with_zero_survival_is_zero() {
        let table = LifeTable::fixed(1.0, 70.0);
        let stats = model(&table, Some(&table)).compute_with_rolls(65.0, 65.0, 0.5, 0.5);
        assert!(stats.life_expectancy_both.iter().skip(1).all(|&le| le == 0.0));
        assert!(stats.life_expectancy_one.iter().all(|le| le.is_finite()));
    }

    #[test]
    fn sub_annual_periods_produce_more_entries() {
        let table = LifeTable::fixed(0.05, 75.0);
        let annual = model(&table, None).compute_with_rolls(65.0, 65.0, 0.5, 0.5);
        let quarterly = SurvivalModel {
            time_period: 0.25,
            ..model(&table, None)
        }
        .compute_with_rolls(65.0, 65.0, 0.5, 0.5);
        assert_eq!(quarterly.alive_one.len(), 4 * (annual.alive_one.len() - 1) + 1);
        assert_relative_eq!(quarterly.alive_one[4], annual.alive_one[1], epsilon = 1e-12);
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(24))]
        #[test]
        fn prop_survival_probabilities_bounded(
            age in 55u32..90,
            age2 in 55u32..90,
            seed in any::<u64>(),
            couple in any::<bool>(),
        ) {
            let spec = LifeTableSpec::default();
            let table = LifeTable::from_spec(&spec, Sex::Female, 120.0).unwrap();
            let table2 = LifeTable::from_spec(&spec, Sex::Male, 120.0).unwrap();
            let survival = SurvivalModel {
                table: &table,
                table2: couple.then_some(&table2),
                time_period: 1.0,
                start_year: 2020.0,
            };
            let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(seed);
            let stats = survival.compute(age as f64, age2 as f64, &mut rng);

            for k in 0..stats.alive_both.len() {
                prop_assert!(stats.alive_both[k] >= 0.0);
                prop_assert!(stats.alive_one[k] >= -1e-12);
                prop_assert!(stats.alive_both[k] + stats.alive_one[k] <= 1.0 + 1e-12);
                if k > 0 {
                    prop_assert!(stats.alive_both[k] <= stats.alive_both[k - 1] + 1e-12);
                }
            }
            for s in stats.alive_single.iter().flatten() {
                prop_assert!((0.0..=1.0).contains(s));
            }
            prop_assert_eq!(stats.alive_single.len(), stats.alive_both.len() + 1);
        }
    }
}
