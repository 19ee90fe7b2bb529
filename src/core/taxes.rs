use super::types::{AssetAllocation, AssetClass, AssetMap, Bracket, TaxTable};

/// Dividend treatment of one asset class.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DividendParams {
    /// Annual yield on the position at the start of the period.
    pub yield_rate: f64,
    /// Share of dividends taxed at capital gains rates.
    pub qualified: f64,
}

/// Cost basis of the taxable account and the period's taxable events.
/// All amounts are in real terms.
#[derive(Debug, Clone, PartialEq)]
pub struct TaxState {
    basis: AssetMap<f64>,
    /// Unused net capital loss carried into later periods.
    cg_carry: f64,
    capital_gains: f64,
    qualified_dividends: f64,
    ordinary_dividends: f64,
    time_period: f64,
}

impl TaxState {
    /// Stocks start with `stocks_basis_fraction` of their value as basis,
    /// other classes at full basis.
    pub fn new(taxable: &AssetAllocation, stocks_basis_fraction: f64, time_period: f64) -> Self {
        let basis = AssetMap::from_fn(|class| {
            let value = taxable.amount(class);
            if class.is_stocks() {
                value * stocks_basis_fraction
            } else {
                value
            }
        });
        Self {
            basis,
            cg_carry: 0.0,
            capital_gains: 0.0,
            qualified_dividends: 0.0,
            ordinary_dividends: 0.0,
            time_period,
        }
    }

    pub fn basis(&self, class: AssetClass) -> f64 {
        self.basis[class]
    }

    pub fn total_basis(&self) -> f64 {
        self.basis.0.iter().sum()
    }

    pub fn cg_carry(&self) -> f64 {
        self.cg_carry
    }

    /// Records a rebalancing trade of `buy_sell` (negative for a sale) on a
    /// position that now holds `position`, then the dividends it pays over
    /// the period.
    pub fn buy_sell(
        &mut self,
        class: AssetClass,
        buy_sell: f64,
        position: f64,
        dividends: DividendParams,
    ) {
        let basis = &mut self.basis[class];
        if buy_sell >= 0.0 {
            *basis += buy_sell;
        } else {
            let prior = position - buy_sell;
            let sold_fraction = if prior > 0.0 {
                (-buy_sell / prior).min(1.0)
            } else {
                1.0
            };
            let basis_sold = *basis * sold_fraction;
            self.capital_gains += -buy_sell - basis_sold;
            *basis -= basis_sold;
        }

        let dividend = position * dividends.yield_rate * self.time_period;
        self.qualified_dividends += dividend * dividends.qualified;
        self.ordinary_dividends += dividend * (1.0 - dividends.qualified);
        // Reinvested.
        *basis += dividend;
    }

    /// Tax owed for the period given `regular_income` received over it.
    /// Clears the period's events and deflates the basis by `inflation`.
    pub fn tax(
        &mut self,
        table: &TaxTable,
        state_rate: f64,
        regular_income: f64,
        single: bool,
        inflation: f64,
    ) -> f64 {
        let dt = self.time_period;
        let net_gains = self.capital_gains - self.cg_carry;

        let loss_offset = if net_gains < 0.0 {
            (-net_gains).min(table.capital_loss_offset * dt)
        } else {
            0.0
        };
        self.cg_carry = if net_gains < 0.0 {
            -net_gains - loss_offset
        } else {
            0.0
        };

        let ordinary = (regular_income + self.ordinary_dividends - loss_offset) / dt;
        let preferential = (self.qualified_dividends + net_gains.max(0.0)) / dt;
        let (deduction, income_brackets, cg_brackets) = if single {
            (
                table.standard_deduction_single,
                &table.income_single,
                &table.capital_gains_single,
            )
        } else {
            (
                table.standard_deduction_married,
                &table.income_married,
                &table.capital_gains_married,
            )
        };

        let taxable_ordinary = (ordinary - deduction).max(0.0);
        let unused_deduction = (deduction - ordinary.max(0.0)).max(0.0);
        let taxable_preferential = (preferential - unused_deduction).max(0.0);

        let federal = bracket_tax(income_brackets, 0.0, taxable_ordinary)
            + bracket_tax(cg_brackets, taxable_ordinary, taxable_preferential);
        let state = state_rate * (taxable_ordinary + taxable_preferential);

        self.end_period(inflation);
        (federal + state) * dt
    }

    /// Clears the period's events without taxing them.
    pub fn end_period(&mut self, inflation: f64) {
        self.capital_gains = 0.0;
        self.qualified_dividends = 0.0;
        self.ordinary_dividends = 0.0;
        for basis in self.basis.0.iter_mut() {
            *basis /= inflation;
        }
    }
}

/// Tax on `amount` of income stacked on top of `base` income.
fn bracket_tax(brackets: &[Bracket], base: f64, amount: f64) -> f64 {
    if amount <= 0.0 {
        return 0.0;
    }
    let top = base + amount;
    let mut tax = 0.0;
    for (i, bracket) in brackets.iter().enumerate() {
        let upper = brackets
            .get(i + 1)
            .map_or(f64::INFINITY, |next| next.threshold);
        let low = bracket.threshold.max(base);
        let high = upper.min(top);
        if high > low {
            tax += (high - low) * bracket.rate;
        }
    }
    tax
}
