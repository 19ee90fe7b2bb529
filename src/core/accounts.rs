use serde::Serialize;

use super::error::SimError;
use super::taxes::{DividendParams, TaxState};
use super::types::{AssetAllocation, AssetClass, AssetMap, FundSource};

/// Relative underflow treated as rounding and clamped to zero.
const ROUNDING_SLACK: f64 = 1e-15;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Balances {
    pub tax_free: f64,
    pub tax_deferred: f64,
    pub taxable: f64,
}

impl Balances {
    pub fn total(&self) -> f64 {
        self.tax_free + self.tax_deferred + self.taxable
    }

    pub fn get(&self, source: FundSource) -> f64 {
        match source {
            FundSource::TaxFree => self.tax_free,
            FundSource::TaxDeferred => self.tax_deferred,
            FundSource::Taxable => self.taxable,
        }
    }
}

/// Annuity premiums drawn from each fund location.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SpiaPurchase {
    pub tax_free: f64,
    pub tax_deferred: f64,
    pub taxable: f64,
}

impl SpiaPurchase {
    pub fn total(&self) -> f64 {
        self.tax_free + self.tax_deferred + self.taxable
    }

    pub fn by_source(&self) -> [(FundSource, f64); 3] {
        [
            (FundSource::TaxFree, self.tax_free),
            (FundSource::TaxDeferred, self.tax_deferred),
            (FundSource::Taxable, self.taxable),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpendOutcome {
    pub balances: Balances,
    pub consume: f64,
    pub taxes_paid: f64,
    pub real_spias: SpiaPurchase,
    pub nominal_spias: SpiaPurchase,
}

fn clamp_rounding(value: f64, scale: f64) -> f64 {
    if value < 0.0 {
        debug_assert!(scale <= 0.0 || value / scale > -1e-9, "underflow {value} of {scale}");
        0.0
    } else {
        value
    }
}

/// Consumes `consume_fraction` (annual rate) of wealth plus the period's
/// guaranteed `income`, pays due taxes, and carves annuity premiums out
/// of what is left. Withdrawals come from taxable first, then
/// tax-deferred, then tax-free; premiums prefer tax-free funds.
pub fn spend(
    balances: &Balances,
    income: f64,
    taxes_due: f64,
    consume_fraction: f64,
    real_spias_fraction: Option<f64>,
    nominal_spias_fraction: Option<f64>,
    time_period: f64,
) -> Result<SpendOutcome, SimError> {
    let consume_fraction_period = consume_fraction * time_period;
    if !(0.0..=1.0 + ROUNDING_SLACK).contains(&consume_fraction_period) {
        return Err(SimError::InvalidAction(format!(
            "consume fraction {consume_fraction} outside [0, 1/time_period]"
        )));
    }
    let consume_fraction_period = consume_fraction_period.min(1.0);

    let p_sum = balances.total();
    let mut p = p_sum + income;
    let consume = consume_fraction_period * p;
    p = clamp_rounding(p - consume, p_sum);

    let taxes_paid = taxes_due.min(p);
    p -= taxes_paid;

    let mut p_taxable = balances.taxable + (p - p_sum);
    let mut p_tax_deferred = balances.tax_deferred + p_taxable.min(0.0);
    let mut p_tax_free = balances.tax_free + p_tax_deferred.min(0.0);
    p_taxable = p_taxable.max(0.0);
    p_tax_deferred = p_tax_deferred.max(0.0);
    p_tax_free = clamp_rounding(p_tax_free, p_sum);

    let mut real_fraction = real_spias_fraction.map_or(0.0, |f| f * time_period);
    let mut nominal_fraction = nominal_spias_fraction.map_or(0.0, |f| f * time_period);
    if real_fraction < 0.0 || nominal_fraction < 0.0 || real_fraction.is_nan() || nominal_fraction.is_nan() {
        return Err(SimError::InvalidAction("negative annuity fraction".to_string()));
    }
    let total = real_fraction + nominal_fraction;
    if total > 1.0 {
        real_fraction /= total;
        nominal_fraction /= total;
    }

    let mut real = real_fraction * p;
    let mut nominal = nominal_fraction * p;
    let mut real_spias = SpiaPurchase::default();
    let mut nominal_spias = SpiaPurchase::default();

    real_spias.tax_free = real.min(p_tax_free);
    p_tax_free -= real_spias.tax_free;
    real -= real_spias.tax_free;
    nominal_spias.tax_free = nominal.min(p_tax_free);
    p_tax_free -= nominal_spias.tax_free;
    nominal -= nominal_spias.tax_free;

    real_spias.tax_deferred = real.min(p_tax_deferred);
    p_tax_deferred -= real_spias.tax_deferred;
    real_spias.taxable = real - real_spias.tax_deferred;
    nominal_spias.tax_deferred = nominal.min(p_tax_deferred);
    p_tax_deferred -= nominal_spias.tax_deferred;
    nominal_spias.taxable = nominal - nominal_spias.tax_deferred;

    p_taxable = clamp_rounding(p_taxable - real_spias.taxable - nominal_spias.taxable, p_sum);

    Ok(SpendOutcome {
        balances: Balances {
            tax_free: p_tax_free,
            tax_deferred: p_tax_deferred,
            taxable: p_taxable,
        },
        consume,
        taxes_paid,
        real_spias,
        nominal_spias,
    })
}

/// Asset class holdings of each fund location.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Holdings {
    pub tax_free: AssetAllocation,
    pub tax_deferred: AssetAllocation,
    pub taxable: AssetAllocation,
}

impl Holdings {
    pub fn balances(&self) -> Balances {
        Balances {
            tax_free: self.tax_free.total(),
            tax_deferred: self.tax_deferred.total(),
            taxable: self.taxable.total(),
        }
    }
}

/// Splits `balances` into per-class holdings matching `weights` overall.
/// Tax-free money goes to the least tax efficient classes first, taxable
/// money to the most efficient, and tax-deferred takes up the rest.
pub fn allocate(balances: &Balances, weights: &AssetAllocation) -> Holdings {
    let p = balances.total();
    let mut tax_free = AssetAllocation::empty();
    let mut tax_deferred = AssetAllocation::empty();
    let mut taxable = AssetAllocation::empty();

    let mut remaining = balances.tax_free;
    for class in AssetClass::TAX_EFFICIENT_ORDER.iter().rev() {
        if let Some(w) = weights[*class] {
            let alloc = (p * w).min(remaining);
            tax_free[*class] = Some(alloc);
            remaining = (remaining - alloc).max(0.0);
        }
    }

    let mut remaining = balances.taxable;
    for class in AssetClass::TAX_EFFICIENT_ORDER {
        if let Some(w) = weights[class] {
            let alloc = (p * w).min(remaining);
            taxable[class] = Some(alloc);
            remaining = (remaining - alloc).max(0.0);
        }
    }

    for class in AssetClass::TAX_EFFICIENT_ORDER {
        if let Some(w) = weights[class] {
            tax_deferred[class] =
                Some((p * w - tax_free.amount(class) - taxable.amount(class)).max(0.0));
        }
    }

    Holdings {
        tax_free,
        tax_deferred,
        taxable,
    }
}

/// Grows every holding by its class's gross real return and records the
/// taxable account's trades against `prev_taxable`, the taxable holdings
/// at the end of the previous period.
pub fn apply_returns(
    holdings: &mut Holdings,
    returns: &AssetMap<f64>,
    prev_taxable: &AssetAllocation,
    taxes: &mut TaxState,
    dividends: impl Fn(AssetClass) -> DividendParams,
) -> Balances {
    for class in AssetClass::ALL {
        let Some(position) = holdings.taxable[class] else {
            continue;
        };
        let ret = returns[class];
        let buy_sell = position - prev_taxable.amount(class);
        taxes.buy_sell(class, buy_sell, position, dividends(class));
        for account in [
            &mut holdings.tax_free,
            &mut holdings.tax_deferred,
            &mut holdings.taxable,
        ] {
            if let Some(amount) = &mut account[class] {
                *amount *= ret;
            }
        }
    }
    holdings.balances()
}
