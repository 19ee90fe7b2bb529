use std::sync::Arc;

use rand::RngCore;

use super::annuity::IncomeAnnuity;
use super::income::{InflationAdjustment, IncomeKind, IncomeSpec};
use super::life_table::LifeTable;
use super::types::{FundSource, Owner};

/// Identity of a guaranteed income bucket. Streams with equal keys share
/// one schedule.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BucketKey {
    pub source: FundSource,
    pub real: bool,
    pub social_security: bool,
    pub owner: Owner,
    pub joint: bool,
    pub payout_fraction: f64,
}

/// Schedule and pricer that replace the bucket's own once the couple
/// becomes single.
#[derive(Debug, Clone)]
struct SurvivorBranch {
    owner: Owner,
    schedule: Vec<f64>,
    pricer: IncomeAnnuity,
}

#[derive(Debug, Clone)]
pub struct IncomeBucket {
    key: BucketKey,
    owner: Owner,
    /// Annual payout rate per period from now. Nominal buckets hold
    /// nominal amounts.
    schedule: Vec<f64>,
    pricer: IncomeAnnuity,
    survivor: Option<SurvivorBranch>,
}

impl IncomeBucket {
    pub fn key(&self) -> &BucketKey {
        &self.key
    }

    pub fn owner(&self) -> Owner {
        self.owner
    }

    pub fn schedule(&self) -> &[f64] {
        &self.schedule
    }

    pub fn survivor_schedule(&self) -> Option<&[f64]> {
        self.survivor.as_ref().map(|s| s.schedule.as_slice())
    }

    pub fn current_payout(&self) -> f64 {
        self.schedule.first().copied().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Household {
    Couple { first_dies_first: bool },
    Single { survivor: Owner },
}

impl Household {
    pub fn is_couple(self) -> bool {
        matches!(self, Household::Couple { .. })
    }

    /// Member still alive after the first death on the sampled path.
    fn survivor(self) -> Owner {
        match self {
            Household::Couple {
                first_dies_first: true,
            } => Owner::Spouse,
            Household::Couple {
                first_dies_first: false,
            } => Owner::Primary,
            Household::Single { survivor } => survivor,
        }
    }

    /// Owner of newly purchased annuities.
    fn survivor_or_primary(self) -> Owner {
        match self {
            Household::Couple { .. } => Owner::Primary,
            Household::Single { survivor } => survivor,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pricing {
    pub real_rate: f64,
    pub nominal_rate: f64,
    pub real_mwr: f64,
    pub nominal_mwr: f64,
}

impl Pricing {
    fn rate(&self, real: bool) -> f64 {
        if real { self.real_rate } else { self.nominal_rate }
    }

    pub fn mwr(&self, real: bool) -> f64 {
        if real { self.real_mwr } else { self.nominal_mwr }
    }
}

/// Guaranteed income buckets of one household for one episode.
#[derive(Debug, Clone)]
pub struct IncomeLedger {
    buckets: Vec<IncomeBucket>,
    household: Household,
    table: Arc<LifeTable>,
    table2: Option<Arc<LifeTable>>,
    pricing: Pricing,
    time_period: f64,
    periods: usize,
    age: f64,
    age2: f64,
    year: f64,
}

impl IncomeLedger {
    /// `periods` is the schedule length, long enough to reach the final
    /// age of the younger member.
    pub fn new(
        household: Household,
        table: Arc<LifeTable>,
        table2: Option<Arc<LifeTable>>,
        pricing: Pricing,
        time_period: f64,
        periods: usize,
    ) -> Self {
        Self {
            buckets: Vec::new(),
            household,
            table,
            table2,
            pricing,
            time_period,
            periods,
            age: 0.0,
            age2: 0.0,
            year: 0.0,
        }
    }

    pub fn household(&self) -> Household {
        self.household
    }

    pub fn buckets(&self) -> &[IncomeBucket] {
        &self.buckets
    }

    pub fn find(&self, key: &BucketKey) -> Option<&IncomeBucket> {
        self.buckets.iter().find(|b| b.key == *key)
    }

    fn table_for(&self, owner: Owner) -> Arc<LifeTable> {
        match (owner, &self.table2) {
            (Owner::Spouse, Some(table2)) => table2.clone(),
            _ => self.table.clone(),
        }
    }

    fn age_of(&self, owner: Owner) -> f64 {
        match owner {
            Owner::Primary => self.age,
            Owner::Spouse => self.age2,
        }
    }

    fn set_pricer_age(&self, pricer: &mut IncomeAnnuity, owner: Owner) {
        pricer.set_age(self.age_of(owner), self.age_of(owner.other()), self.year);
    }

    /// Records current ages and re-anchors every pricer on them.
    pub fn set_ages(&mut self, age: f64, age2: f64, year: f64) {
        self.age = age;
        self.age2 = age2;
        self.year = year;
        let mut buckets = std::mem::take(&mut self.buckets);
        for bucket in &mut buckets {
            self.set_pricer_age(&mut bucket.pricer, bucket.owner);
            if let Some(survivor) = &mut bucket.survivor {
                self.set_pricer_age(&mut survivor.pricer, survivor.owner);
            }
        }
        self.buckets = buckets;
    }

    pub fn get_or_create(&mut self, key: BucketKey) -> usize {
        if let Some(idx) = self.buckets.iter().position(|b| b.key == key) {
            return idx;
        }

        let rate = self.pricing.rate(key.real);
        let (owner, mut pricer) = match self.household {
            Household::Couple { .. } => (
                key.owner,
                IncomeAnnuity::two_life(
                    self.table_for(key.owner),
                    self.table_for(key.owner.other()),
                    key.joint,
                    key.payout_fraction,
                    rate,
                    self.time_period,
                ),
            ),
            Household::Single { survivor } => (
                survivor,
                IncomeAnnuity::single_life(self.table_for(survivor), rate, self.time_period),
            ),
        };
        self.set_pricer_age(&mut pricer, owner);

        let survivor = if self.household.is_couple() {
            let survivor_owner = self.household.survivor();
            let mut survivor_pricer = IncomeAnnuity::single_life(
                self.table_for(survivor_owner),
                rate,
                self.time_period,
            );
            self.set_pricer_age(&mut survivor_pricer, survivor_owner);
            Some(SurvivorBranch {
                owner: survivor_owner,
                schedule: vec![0.0; self.periods],
                pricer: survivor_pricer,
            })
        } else {
            None
        };

        self.buckets.push(IncomeBucket {
            key,
            owner,
            schedule: vec![0.0; self.periods],
            pricer,
            survivor,
        });
        self.buckets.len() - 1
    }

    /// Adds `payout` to periods `[start, end)` and `payout * payout_fraction`
    /// to the survivor schedule over the same periods.
    pub fn add_scheduled_payout(
        &mut self,
        idx: usize,
        start: f64,
        end: f64,
        payout: f64,
        payout_fraction: f64,
        adjustment: InflationAdjustment,
    ) {
        let time_period = self.time_period;
        let bucket = &mut self.buckets[idx];
        let first = start.max(0.0).ceil() as usize;
        let last = end.min(bucket.schedule.len() as f64).floor().max(0.0) as usize;
        for e in first..last {
            let escalation = adjustment.escalation(e, time_period);
            bucket.schedule[e] += payout * escalation;
            if let Some(survivor) = &mut bucket.survivor {
                survivor.schedule[e] += payout * payout_fraction * escalation;
            }
        }
    }

    /// Adds one guaranteed income record, drawing ranged payouts
    /// log-uniformly. Records are validated with the configuration.
    pub fn add_income(&mut self, spec: &IncomeSpec, rng: &mut dyn RngCore) {
        let payout = spec.payout.map(|range| range.sample_log_uniform(rng));
        self.add_record(spec, payout);
    }

    /// Buys a joint income stream starting next period with `premium`,
    /// returning the annual payout bought. Taxable purchases exclude the
    /// return of premium from taxable income over `exclusion_years`.
    pub fn purchase_annuity(
        &mut self,
        source: FundSource,
        real: bool,
        premium: f64,
        payout_fraction: f64,
        exclusion_years: f64,
    ) -> f64 {
        let (exclusion_period, exclusion_amount) = if source == FundSource::Taxable {
            let years = exclusion_years.ceil().max(1.0);
            (years, premium / years)
        } else {
            (0.0, 0.0)
        };
        let spec = IncomeSpec {
            kind: IncomeKind::IncomeAnnuity,
            owner: self.household.survivor_or_primary(),
            age: None,
            premium: Some(premium),
            payout: None,
            inflation_adjustment: if real {
                InflationAdjustment::Cpi
            } else {
                InflationAdjustment::Nominal(0.0)
            },
            joint: true,
            payout_fraction,
            source_of_funds: source,
            exclusion_period,
            exclusion_amount,
        };
        self.add_record(&spec, None)
    }

    fn add_record(&mut self, spec: &IncomeSpec, payout: Option<f64>) -> f64 {
        let owner = match self.household {
            Household::Couple { .. } => spec.owner,
            Household::Single { survivor } => survivor,
        };
        let key = BucketKey {
            source: spec.source_of_funds,
            real: spec.inflation_adjustment.is_real(),
            social_security: spec.is_social_security(),
            owner,
            joint: spec.joint,
            payout_fraction: spec.payout_fraction,
        };
        let idx = self.get_or_create(key);

        let (payout, start) = match (spec.premium, payout) {
            (Some(premium), _) => {
                let bucket = &self.buckets[idx];
                let mwr = self.pricing.mwr(key.real);
                (bucket.pricer.payout(premium, mwr, bucket.schedule.len()), 1.0)
            }
            (None, payout) => {
                let owner_age = self.age_of(owner);
                let start = spec.age.map_or(0.0, |age| (age - owner_age) / self.time_period);
                (payout.unwrap_or(0.0), start)
            }
        };

        let owner_dies_first = match self.household {
            Household::Couple { first_dies_first } => (owner == Owner::Primary) == first_dies_first,
            Household::Single { .. } => false,
        };
        let actual_fraction = if spec.joint || owner_dies_first {
            spec.payout_fraction
        } else {
            1.0
        };

        self.add_scheduled_payout(
            idx,
            start,
            f64::INFINITY,
            payout,
            actual_fraction,
            spec.inflation_adjustment,
        );

        if spec.source_of_funds == FundSource::Taxable && spec.exclusion_period > 0.0 {
            let end = start + spec.exclusion_period / self.time_period;
            let level = InflationAdjustment::Nominal(0.0);
            for (source, amount) in [
                (FundSource::Taxable, -spec.exclusion_amount),
                (FundSource::TaxFree, spec.exclusion_amount),
            ] {
                let idx = self.get_or_create(BucketKey {
                    source,
                    real: false,
                    ..key
                });
                self.add_scheduled_payout(idx, start, end, amount, actual_fraction, level);
            }
        }

        payout
    }

    /// Moves to the next period: on the first death every bucket switches
    /// to its survivor schedule, then period 0 is dropped everywhere.
    pub fn advance_period(&mut self, became_single: bool) {
        if became_single {
            if let Household::Couple { .. } = self.household {
                let survivor = self.household.survivor();
                for bucket in &mut self.buckets {
                    if let Some(branch) = bucket.survivor.take() {
                        bucket.owner = branch.owner;
                        bucket.schedule = branch.schedule;
                        bucket.pricer = branch.pricer;
                    }
                }
                self.household = Household::Single { survivor };
            }
        }

        for bucket in &mut self.buckets {
            if !bucket.schedule.is_empty() {
                bucket.schedule.remove(0);
            }
            if let Some(branch) = &mut bucket.survivor {
                if !branch.schedule.is_empty() {
                    branch.schedule.remove(0);
                }
            }
        }
        self.periods = self.periods.saturating_sub(1);
    }

    /// Guaranteed income rate for the current period by fund source, in
    /// real terms.
    pub fn income_by_source(&self, cpi: f64) -> [f64; 3] {
        let mut income = [0.0; 3];
        for bucket in &self.buckets {
            let mut payout = bucket.current_payout();
            if !bucket.key.real {
                payout /= cpi;
            }
            income[bucket.key.source.index()] += payout;
        }
        income
    }

    pub fn income_sum(&self, cpi: f64) -> f64 {
        self.income_by_source(cpi).iter().sum()
    }

    /// Market price of every bucket's remaining schedule by fund source,
    /// in real terms.
    pub fn present_values(&self, cpi: f64) -> [f64; 3] {
        let mut values = [0.0; 3];
        for bucket in &self.buckets {
            let mwr = self.pricing.mwr(bucket.key.real);
            let mut value = bucket.pricer.premium(&bucket.schedule, 1.0, mwr);
            if !bucket.key.real {
                value /= cpi;
            }
            values[bucket.key.source.index()] += value;
        }
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ValueRange;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    const PRICING: Pricing = Pricing {
        real_rate: 0.0,
        nominal_rate: 0.0,
        real_mwr: 1.0,
        nominal_mwr: 1.0,
    };

    fn couple_ledger(first_dies_first: bool) -> IncomeLedger {
        let table = Arc::new(LifeTable::fixed(0.0, 200.0));
        let mut ledger = IncomeLedger::new(
            Household::Couple { first_dies_first },
            table.clone(),
            Some(table),
            PRICING,
            1.0,
            10,
        );
        ledger.set_ages(65.0, 63.0, 2020.0);
        ledger
    }

    fn single_ledger() -> IncomeLedger {
        let table = Arc::new(LifeTable::fixed(0.0, 200.0));
        let mut ledger = IncomeLedger::new(
            Household::Single {
                survivor: Owner::Primary,
            },
            table,
            None,
            PRICING,
            1.0,
            10,
        );
        ledger.set_ages(65.0, 65.0, 2020.0);
        ledger
    }

    fn pension(payout: f64, fraction: f64) -> IncomeSpec {
        IncomeSpec {
            payout: Some(ValueRange::fixed(payout)),
            payout_fraction: fraction,
            ..IncomeSpec::with_payout(payout)
        }
    }

    #[test]
    fn payout_fills_schedule_from_start_age() {
        let mut ledger = single_ledger();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let spec = IncomeSpec {
            age: Some(67.0),
            ..IncomeSpec::with_payout(1_000.0)
        };
        ledger.add_income(&spec, &mut rng);
        let bucket = &ledger.buckets()[0];
        assert_eq!(&bucket.schedule()[..4], &[0.0, 0.0, 1_000.0, 1_000.0]);
        assert!(bucket.survivor_schedule().is_none());
        assert_eq!(ledger.income_sum(1.0), 0.0);
    }

    #[test]
    fn same_key_shares_a_bucket() {
        let mut ledger = single_ledger();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        ledger.add_income(&IncomeSpec::with_payout(1_000.0), &mut rng);
        ledger.add_income(&IncomeSpec::with_payout(500.0), &mut rng);
        assert_eq!(ledger.buckets().len(), 1);
        assert_eq!(ledger.income_sum(1.0), 1_500.0);
    }

    #[test]
    fn couple_death_migrates_to_survivor_schedule() {
        let mut ledger = couple_ledger(true);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let spec = IncomeSpec {
            joint: true,
            ..pension(20_000.0, 0.6)
        };
        ledger.add_income(&spec, &mut rng);
        assert_eq!(ledger.income_sum(1.0), 20_000.0);

        ledger.advance_period(false);
        assert_eq!(ledger.income_sum(1.0), 20_000.0);
        assert!(ledger.household().is_couple());

        ledger.advance_period(true);
        assert_eq!(
            ledger.household(),
            Household::Single {
                survivor: Owner::Spouse
            }
        );
        let bucket = &ledger.buckets()[0];
        assert_eq!(bucket.owner(), Owner::Spouse);
        assert_relative_eq!(bucket.current_payout(), 0.6 * 20_000.0);
        assert!(bucket.survivor_schedule().is_none());
    }

    #[test]
    fn survivor_contingent_pays_full_when_owner_survives() {
        // Spouse dies first, primary owns a non-joint pension.
        let mut ledger = couple_ledger(false);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        ledger.add_income(&pension(10_000.0, 0.5), &mut rng);
        assert_eq!(ledger.buckets()[0].survivor_schedule().unwrap()[0], 10_000.0);

        // Primary dies first: spouse receives the fraction.
        let mut ledger = couple_ledger(true);
        ledger.add_income(&pension(10_000.0, 0.5), &mut rng);
        assert_eq!(ledger.buckets()[0].survivor_schedule().unwrap()[0], 5_000.0);
    }

    #[test]
    fn purchase_starts_next_period_at_priced_payout() {
        let mut ledger = single_ledger();
        let payout = ledger.purchase_annuity(FundSource::TaxFree, true, 9_000.0, 1.0, 0.0);
        // Ten period schedule, certain survival, zero rate: nine paying periods.
        assert_relative_eq!(payout, 1_000.0);
        let bucket = &ledger.buckets()[0];
        assert_eq!(bucket.schedule()[0], 0.0);
        assert_relative_eq!(bucket.schedule()[1], 1_000.0);
        assert!(bucket.key().joint);
    }

    #[test]
    fn taxable_purchase_shifts_exclusion_to_tax_free() {
        let mut ledger = single_ledger();
        ledger.purchase_annuity(FundSource::Taxable, true, 9_000.0, 1.0, 2.5);
        ledger.advance_period(false);
        let income = ledger.income_by_source(1.0);
        // Exclusion of 3000 over three years.
        assert_relative_eq!(income[FundSource::Taxable.index()], 1_000.0 - 3_000.0);
        assert_relative_eq!(income[FundSource::TaxFree.index()], 3_000.0);
        for _ in 0..3 {
            ledger.advance_period(false);
        }
        let income = ledger.income_by_source(1.0);
        assert_relative_eq!(income[FundSource::Taxable.index()], 1_000.0);
        assert_relative_eq!(income[FundSource::TaxFree.index()], 0.0);
    }

    #[test]
    fn nominal_income_is_deflated_and_escalated() {
        let mut ledger = single_ledger();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let spec = IncomeSpec {
            inflation_adjustment: InflationAdjustment::Nominal(0.1),
            ..IncomeSpec::with_payout(1_000.0)
        };
        ledger.add_income(&spec, &mut rng);
        assert_relative_eq!(ledger.income_sum(2.0), 500.0);
        ledger.advance_period(false);
        assert_relative_eq!(ledger.income_sum(1.0), 1_100.0, epsilon = 1e-9);
    }

    #[test]
    fn present_value_counts_remaining_schedule() {
        let mut ledger = single_ledger();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        ledger.add_income(&IncomeSpec::with_payout(1_000.0), &mut rng);
        assert_relative_eq!(ledger.present_values(1.0)[FundSource::TaxDeferred.index()], 10_000.0);
        ledger.advance_period(false);
        assert_relative_eq!(ledger.present_values(1.0)[FundSource::TaxDeferred.index()], 9_000.0);
    }
}
