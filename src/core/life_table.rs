use std::io::Read;
use std::path::Path;

use serde::Deserialize;

use super::error::SimError;
use super::types::{LifeTableSpec, Sex};

const IMPROVEMENT_BASE_YEAR: f64 = 2020.0;
const MAX_LIFE_YEARS: usize = 200;
const ADJUST_ITERATIONS: usize = 50;

#[derive(Debug, Clone, PartialEq)]
enum Hazard {
    Gompertz {
        modal_age: f64,
        dispersion: f64,
        improvement: f64,
    },
    Fixed(f64),
    /// q by whole year of age starting at `first_age`.
    Tabulated { first_age: u32, q: Vec<f64> },
}

/// Annual mortality rates for one person, truncated so that `q == 1`
/// from `death_age` onwards.
#[derive(Debug, Clone, PartialEq)]
pub struct LifeTable {
    hazard: Hazard,
    multiplier: f64,
    death_age: f64,
}

#[derive(Deserialize)]
struct CsvRow {
    age: u32,
    q: f64,
}

impl LifeTable {
    pub fn from_spec(spec: &LifeTableSpec, sex: Sex, death_age: f64) -> Result<Self, SimError> {
        let hazard = match spec {
            LifeTableSpec::Gompertz {
                modal_age_female,
                modal_age_male,
                dispersion,
                improvement,
            } => Hazard::Gompertz {
                modal_age: match sex {
                    Sex::Female => *modal_age_female,
                    Sex::Male => *modal_age_male,
                },
                dispersion: *dispersion,
                improvement: *improvement,
            },
            LifeTableSpec::Fixed { q } => Hazard::Fixed(*q),
            LifeTableSpec::Csv { path } => return Self::from_csv_path(path, death_age),
        };
        Ok(Self {
            hazard,
            multiplier: 1.0,
            death_age,
        })
    }

    pub fn fixed(q: f64, death_age: f64) -> Self {
        Self {
            hazard: Hazard::Fixed(q),
            multiplier: 1.0,
            death_age,
        }
    }

    pub fn from_csv_path(path: &Path, death_age: f64) -> Result<Self, SimError> {
        let file = std::fs::File::open(path)?;
        Self::from_csv_reader(file, death_age)
    }

    pub fn from_csv_reader<R: Read>(reader: R, death_age: f64) -> Result<Self, SimError> {
        let mut rows: Vec<CsvRow> = csv::Reader::from_reader(reader)
            .deserialize()
            .collect::<Result<_, _>>()?;
        rows.sort_by_key(|row| row.age);
        let Some(first) = rows.first() else {
            return Err(SimError::InvalidConfig("life table csv has no rows".to_string()));
        };
        let first_age = first.age;
        let mut q = Vec::with_capacity(rows.len());
        for row in &rows {
            if row.age != first_age + q.len() as u32 {
                return Err(SimError::InvalidConfig(format!(
                    "life table csv skips age {}",
                    first_age + q.len() as u32
                )));
            }
            if !(0.0..=1.0).contains(&row.q) {
                return Err(SimError::InvalidConfig(format!(
                    "life table csv q {} at age {} outside [0, 1]",
                    row.q, row.age
                )));
            }
            q.push(row.q);
        }
        Ok(Self {
            hazard: Hazard::Tabulated { first_age, q },
            multiplier: 1.0,
            death_age,
        })
    }

    pub fn death_age(&self) -> f64 {
        self.death_age
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self.hazard, Hazard::Fixed(_))
    }

    /// Probability of dying within a year for someone aged `age` in
    /// calendar `year`.
    pub fn q(&self, age: f64, year: f64) -> f64 {
        if age >= self.death_age {
            return 1.0;
        }
        let base = match &self.hazard {
            Hazard::Gompertz {
                modal_age,
                dispersion,
                improvement,
            } => {
                let cumulative = ((age - modal_age) / dispersion).exp();
                let q = 1.0 - (-cumulative * ((1.0 / dispersion).exp() - 1.0)).exp();
                q * (1.0 - improvement).powf(year - IMPROVEMENT_BASE_YEAR)
            }
            Hazard::Fixed(q) => *q,
            Hazard::Tabulated { first_age, q } => {
                let idx = (age.floor().max(*first_age as f64) as u32 - first_age) as usize;
                q.get(idx).or(q.last()).copied().unwrap_or(1.0)
            }
        };
        (base * self.multiplier).clamp(0.0, 1.0)
    }

    /// Remaining expected lifetime in years, with hazard held constant
    /// within each year of age.
    pub fn life_expectancy(&self, age: f64, year: f64) -> f64 {
        let mut alive = 1.0;
        let mut expectancy = 0.0;
        for t in 0..MAX_LIFE_YEARS {
            let q = self.q(age + t as f64, year + t as f64);
            if q >= 1.0 {
                break;
            }
            let year_fraction = if q <= 0.0 { 1.0 } else { -q / (1.0 - q).ln() };
            expectancy += alive * year_fraction;
            alive *= 1.0 - q;
        }
        expectancy
    }

    /// Scales every q so that life expectancy at `age` changes by
    /// `additional` years. Fixed tables are returned unchanged.
    pub fn with_additional_life_expectancy(mut self, age: f64, year: f64, additional: f64) -> Self {
        if additional == 0.0 || self.is_fixed() {
            return self;
        }
        let target = self.life_expectancy(age, year) + additional;
        let (mut low, mut high) = (-10.0_f64, 10.0_f64);
        for _ in 0..ADJUST_ITERATIONS {
            let mid = 0.5 * (low + high);
            self.multiplier = mid.exp();
            if self.life_expectancy(age, year) > target {
                low = mid;
            } else {
                high = mid;
            }
        }
        self.multiplier = (0.5 * (low + high)).exp();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn gompertz(sex: Sex) -> LifeTable {
        LifeTable::from_spec(&LifeTableSpec::default(), sex, 120.0).unwrap()
    }

    #[test]
    fn gompertz_q_increases_with_age_and_hits_one_at_death_age() {
        let table = gompertz(Sex::Female);
        let mut prev = 0.0;
        for age in 50..120 {
            let q = table.q(age as f64, 2020.0);
            assert!(q > prev, "age {age}");
            assert!(q < 1.0);
            prev = q;
        }
        assert_eq!(table.q(120.0, 2020.0), 1.0);
    }

    #[test]
    fn males_die_earlier_and_later_cohorts_improve() {
        let female = gompertz(Sex::Female);
        let male = gompertz(Sex::Male);
        assert!(male.q(70.0, 2020.0) > female.q(70.0, 2020.0));
        assert!(female.q(70.0, 2040.0) < female.q(70.0, 2020.0));
        assert!(male.life_expectancy(65.0, 2020.0) < female.life_expectancy(65.0, 2020.0));
    }

    #[test]
    fn fixed_table_life_expectancy_matches_geometric_series() {
        let table = LifeTable::fixed(0.0, 70.0);
        assert_relative_eq!(table.life_expectancy(65.0, 2020.0), 5.0, epsilon = 1e-12);

        let table = LifeTable::fixed(0.1, 1000.0);
        let per_year = -0.1 / (0.9_f64).ln();
        let expected = per_year * (1.0 - 0.9_f64.powi(200)) / 0.1;
        assert_relative_eq!(table.life_expectancy(65.0, 2020.0), expected, epsilon = 1e-9);
    }

    #[test]
    fn additional_life_expectancy_is_achieved() {
        let base = gompertz(Sex::Male);
        let le = base.life_expectancy(65.0, 2020.0);
        let adjusted = base.with_additional_life_expectancy(65.0, 2020.0, 3.0);
        assert_relative_eq!(adjusted.life_expectancy(65.0, 2020.0), le + 3.0, epsilon = 1e-6);
        assert_eq!(adjusted.q(120.0, 2020.0), 1.0);
    }

    #[test]
    fn fixed_table_ignores_life_expectancy_adjustment() {
        let table = LifeTable::fixed(0.05, 120.0).with_additional_life_expectancy(65.0, 2020.0, 5.0);
        assert_eq!(table.q(80.0, 2020.0), 0.05);
    }

    #[test]
    fn csv_table_reads_rows_and_extends_last_value() {
        let data = "age,q\n65,0.01\n66,0.02\n67,0.5\n";
        let table = LifeTable::from_csv_reader(data.as_bytes(), 100.0).unwrap();
        assert_eq!(table.q(60.0, 2020.0), 0.01);
        assert_eq!(table.q(66.5, 2020.0), 0.02);
        assert_eq!(table.q(90.0, 2020.0), 0.5);
        assert_eq!(table.q(100.0, 2020.0), 1.0);
    }

    #[test]
    fn csv_table_rejects_gaps_and_bad_rows() {
        let gap = "age,q\n65,0.01\n67,0.02\n";
        assert!(matches!(
            LifeTable::from_csv_reader(gap.as_bytes(), 100.0),
            Err(SimError::InvalidConfig(_))
        ));
        let bad = "age,q\n65,abc\n";
        assert!(matches!(
            LifeTable::from_csv_reader(bad.as_bytes(), 100.0),
            Err(SimError::LifeTableCsv(_))
        ));
    }
}
