use std::sync::Arc;

use super::life_table::LifeTable;

/// Prices a stream of annual-rate payouts, paid once per period, against
/// the survival of one or two lives and a flat discount rate.
///
/// With a second life the stream is either joint contingent (full payout
/// while both live, `payout_fraction` once either has died) or survivor
/// contingent (full payout while the owner lives, `payout_fraction` to
/// the other member after the owner dies).
#[derive(Debug, Clone)]
pub struct IncomeAnnuity {
    table: Arc<LifeTable>,
    table2: Option<Arc<LifeTable>>,
    joint: bool,
    payout_fraction: f64,
    rate: f64,
    time_period: f64,
    age: f64,
    age2: f64,
    year: f64,
}

impl IncomeAnnuity {
    pub fn single_life(table: Arc<LifeTable>, rate: f64, time_period: f64) -> Self {
        Self {
            table,
            table2: None,
            joint: false,
            payout_fraction: 0.0,
            rate,
            time_period,
            age: 0.0,
            age2: 0.0,
            year: 0.0,
        }
    }

    pub fn two_life(
        table: Arc<LifeTable>,
        table2: Arc<LifeTable>,
        joint: bool,
        payout_fraction: f64,
        rate: f64,
        time_period: f64,
    ) -> Self {
        Self {
            table2: Some(table2),
            joint,
            payout_fraction,
            ..Self::single_life(table, rate, time_period)
        }
    }

    /// Ages of the owner and the other life, and the current calendar year.
    pub fn set_age(&mut self, age: f64, age2: f64, year: f64) {
        self.age = age;
        self.age2 = age2;
        self.year = year;
    }

    fn weights(&self, periods: usize) -> Vec<f64> {
        let alive = survival_curve(&self.table, self.age, self.year, self.time_period, periods);
        let Some(table2) = &self.table2 else {
            return alive;
        };
        let alive2 = survival_curve(table2, self.age2, self.year, self.time_period, periods);
        let f = self.payout_fraction;
        alive
            .iter()
            .zip(&alive2)
            .map(|(&a, &a2)| {
                let both = a * a2;
                if self.joint {
                    both + f * (a + a2 - 2.0 * both)
                } else {
                    a + f * (a2 - both)
                }
            })
            .collect()
    }

    /// Expected discounted value of `schedule`, where `schedule[k]` is the
    /// annual payout rate for period `k` from now.
    pub fn present_value(&self, schedule: &[f64]) -> f64 {
        let weights = self.weights(schedule.len());
        schedule
            .iter()
            .zip(&weights)
            .enumerate()
            .map(|(k, (&payout, &w))| payout * self.time_period * w * self.discount(k))
            .sum()
    }

    /// Value of a level stream of 1 per year starting next period.
    pub fn level_present_value(&self, periods: usize) -> f64 {
        let weights = self.weights(periods);
        weights
            .iter()
            .enumerate()
            .skip(1)
            .map(|(k, &w)| self.time_period * w * self.discount(k))
            .sum()
    }

    /// Annual payout rate bought by `premium` at money's worth ratio `mwr`.
    pub fn payout(&self, premium: f64, mwr: f64, periods: usize) -> f64 {
        let pv = self.level_present_value(periods);
        if pv > 0.0 { premium * mwr / pv } else { 0.0 }
    }

    /// Premium the market would charge for `scale` times `schedule`.
    pub fn premium(&self, schedule: &[f64], scale: f64, mwr: f64) -> f64 {
        scale * self.present_value(schedule) / mwr
    }

    fn discount(&self, period: usize) -> f64 {
        (1.0 + self.rate).powf(-(period as f64) * self.time_period)
    }
}

/// Probability of surviving from `age` to each of the next `periods`
/// period starts, hazard constant within each year of age.
fn survival_curve(table: &LifeTable, age: f64, year: f64, time_period: f64, periods: usize) -> Vec<f64> {
    let mut curve = Vec::with_capacity(periods);
    let mut whole_years = 0.0_f64;
    let mut alive_whole = 1.0;
    for k in 0..periods {
        let t = k as f64 * time_period;
        while whole_years + 1.0 <= t {
            alive_whole *= 1.0 - table.q(age + whole_years, year + whole_years);
            whole_years += 1.0;
        }
        let q = table.q(age + whole_years, year + whole_years);
        curve.push(alive_whole * (1.0 - q).powf(t - whole_years));
    }
    curve
}
