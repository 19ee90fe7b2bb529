use std::collections::BTreeMap;
use std::ops::{Index, IndexMut};
use std::path::PathBuf;

use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

use super::error::SimError;
use super::income::IncomeSpec;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Sex {
    Male,
    Female,
}

/// Member of the household a guaranteed income stream belongs to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub enum Owner {
    #[serde(rename = "self")]
    Primary,
    #[serde(rename = "spouse")]
    Spouse,
}

impl Owner {
    pub fn other(self) -> Self {
        match self {
            Owner::Primary => Owner::Spouse,
            Owner::Spouse => Owner::Primary,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FundSource {
    TaxFree,
    TaxDeferred,
    Taxable,
}

impl FundSource {
    pub const ALL: [FundSource; 3] = [
        FundSource::TaxFree,
        FundSource::TaxDeferred,
        FundSource::Taxable,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    Stocks,
    RealBonds,
    NominalBonds,
    IidBonds,
    Bills,
}

impl AssetClass {
    pub const COUNT: usize = 5;

    pub const ALL: [AssetClass; AssetClass::COUNT] = [
        AssetClass::Stocks,
        AssetClass::RealBonds,
        AssetClass::NominalBonds,
        AssetClass::IidBonds,
        AssetClass::Bills,
    ];

    /// Most tax efficient first. Taxable accounts fill in this order,
    /// tax-free accounts in the reverse order.
    pub const TAX_EFFICIENT_ORDER: [AssetClass; AssetClass::COUNT] = [
        AssetClass::Stocks,
        AssetClass::Bills,
        AssetClass::IidBonds,
        AssetClass::NominalBonds,
        AssetClass::RealBonds,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn is_stocks(self) -> bool {
        self == AssetClass::Stocks
    }
}

/// Fixed-size map keyed by asset class.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct AssetMap<T>(pub [T; AssetClass::COUNT]);

impl<T> AssetMap<T> {
    pub fn from_fn(mut f: impl FnMut(AssetClass) -> T) -> Self {
        AssetMap(AssetClass::ALL.map(&mut f))
    }

    pub fn iter(&self) -> impl Iterator<Item = (AssetClass, &T)> {
        AssetClass::ALL.into_iter().zip(self.0.iter())
    }
}

impl<T> Index<AssetClass> for AssetMap<T> {
    type Output = T;

    fn index(&self, class: AssetClass) -> &T {
        &self.0[class.index()]
    }
}

impl<T> IndexMut<AssetClass> for AssetMap<T> {
    fn index_mut(&mut self, class: AssetClass) -> &mut T {
        &mut self.0[class.index()]
    }
}

/// Amounts (or weights) per asset class. `None` marks a disabled class.
pub type AssetAllocation = AssetMap<Option<f64>>;

impl AssetAllocation {
    pub fn empty() -> Self {
        AssetMap([None; AssetClass::COUNT])
    }

    pub fn total(&self) -> f64 {
        self.0.iter().flatten().sum()
    }

    pub fn amount(&self, class: AssetClass) -> f64 {
        self[class].unwrap_or(0.0)
    }

    pub fn enabled(&self) -> impl Iterator<Item = (AssetClass, f64)> + '_ {
        self.iter().filter_map(|(class, v)| v.map(|v| (class, v)))
    }
}

/// A parameter that is either fixed or drawn per episode from `[low, high]`.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
#[serde(from = "RangeRepr")]
pub struct ValueRange {
    pub low: f64,
    pub high: f64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RangeRepr {
    Fixed(f64),
    Span([f64; 2]),
}

impl From<RangeRepr> for ValueRange {
    fn from(repr: RangeRepr) -> Self {
        match repr {
            RangeRepr::Fixed(v) => ValueRange::fixed(v),
            RangeRepr::Span([low, high]) => ValueRange { low, high },
        }
    }
}

impl ValueRange {
    pub const fn fixed(value: f64) -> Self {
        Self {
            low: value,
            high: value,
        }
    }

    pub const fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }

    pub fn is_fixed(&self) -> bool {
        self.low == self.high
    }

    pub fn sample_uniform(&self, rng: &mut dyn RngCore) -> f64 {
        if self.is_fixed() {
            return self.low;
        }
        self.low + (self.high - self.low) * rng.random::<f64>()
    }

    pub fn sample_log_uniform(&self, rng: &mut dyn RngCore) -> f64 {
        // Handles low == high == 0.
        if self.is_fixed() {
            return self.low;
        }
        let (ln_low, ln_high) = (self.low.ln(), self.high.ln());
        (ln_low + (ln_high - ln_low) * rng.random::<f64>()).exp()
    }

    fn check(&self, name: &str, log_scale: bool) -> Result<(), SimError> {
        if !self.low.is_finite() || !self.high.is_finite() {
            return Err(SimError::InvalidConfig(format!("{name} must be finite")));
        }
        if self.low > self.high {
            return Err(SimError::InvalidConfig(format!(
                "{name} low {} exceeds high {}",
                self.low, self.high
            )));
        }
        if log_scale && self.low < 0.0 {
            return Err(SimError::InvalidConfig(format!("{name} must be >= 0")));
        }
        if log_scale && !self.is_fixed() && self.low <= 0.0 {
            return Err(SimError::InvalidConfig(format!(
                "{name} range must have a positive lower bound"
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LifeTableSpec {
    /// Parametric cohort table.
    Gompertz {
        #[serde(default = "default_modal_age_female")]
        modal_age_female: f64,
        #[serde(default = "default_modal_age_male")]
        modal_age_male: f64,
        #[serde(default = "default_dispersion")]
        dispersion: f64,
        #[serde(default = "default_improvement")]
        improvement: f64,
    },
    Fixed {
        q: f64,
    },
    /// `age,q` rows.
    Csv {
        path: PathBuf,
    },
}

fn default_modal_age_female() -> f64 {
    90.0
}
fn default_modal_age_male() -> f64 {
    86.5
}
fn default_dispersion() -> f64 {
    9.5
}
fn default_improvement() -> f64 {
    0.01
}

impl Default for LifeTableSpec {
    fn default() -> Self {
        LifeTableSpec::Gompertz {
            modal_age_female: default_modal_age_female(),
            modal_age_male: default_modal_age_male(),
            dispersion: default_dispersion(),
            improvement: default_improvement(),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumeRescale {
    Direct,
    PositiveDirect,
    FractionDirect,
    FractionBiased,
    EstimateBiased,
    EstimateBounded,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumePolicy {
    Rl,
    Constant,
    GuytonRule2,
    GuytonKlinger,
    Pmt,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnuitizationPolicy {
    Rl,
    AgeReal,
    AgeNominal,
    None,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationPolicy {
    Rl,
    AgeInNominalBonds,
    Fixed(BTreeMap<AssetClass, f64>),
}

#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
pub struct ReturnParams {
    pub enabled: bool,
    /// Annual arithmetic real return.
    pub mean: f64,
    pub volatility: f64,
    /// Standard error of the mean, applied once per episode.
    pub standard_error: f64,
}

impl ReturnParams {
    const fn new(enabled: bool, mean: f64, volatility: f64, standard_error: f64) -> Self {
        Self {
            enabled,
            mean,
            volatility,
            standard_error,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
pub struct Bracket {
    pub threshold: f64,
    pub rate: f64,
}

const fn bracket(threshold: f64, rate: f64) -> Bracket {
    Bracket { threshold, rate }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct TaxTable {
    pub standard_deduction_single: f64,
    pub standard_deduction_married: f64,
    pub income_single: Vec<Bracket>,
    pub income_married: Vec<Bracket>,
    pub capital_gains_single: Vec<Bracket>,
    pub capital_gains_married: Vec<Bracket>,
    /// Net capital loss usable against ordinary income each year.
    pub capital_loss_offset: f64,
}

impl Default for TaxTable {
    fn default() -> Self {
        Self {
            standard_deduction_single: 12_200.0,
            standard_deduction_married: 24_400.0,
            income_single: vec![
                bracket(0.0, 0.10),
                bracket(9_700.0, 0.12),
                bracket(39_475.0, 0.22),
                bracket(84_200.0, 0.24),
                bracket(160_725.0, 0.32),
                bracket(204_100.0, 0.35),
                bracket(510_300.0, 0.37),
            ],
            income_married: vec![
                bracket(0.0, 0.10),
                bracket(19_400.0, 0.12),
                bracket(78_950.0, 0.22),
                bracket(168_400.0, 0.24),
                bracket(321_450.0, 0.32),
                bracket(408_200.0, 0.35),
                bracket(612_350.0, 0.37),
            ],
            capital_gains_single: vec![
                bracket(0.0, 0.0),
                bracket(39_375.0, 0.15),
                bracket(434_550.0, 0.20),
            ],
            capital_gains_married: vec![
                bracket(0.0, 0.0),
                bracket(78_750.0, 0.15),
                bracket(488_850.0, 0.20),
            ],
            capital_loss_offset: 3_000.0,
        }
    }
}

/// Immutable simulation configuration. Fields mirror the planner's
/// command line parameters; see `SimConfig::default` for the values used
/// when a field is absent from the JSON file.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub sex: Sex,
    pub sex2: Option<Sex>,
    pub life_table: LifeTableSpec,
    /// Decimal calendar year at episode start, selects the birth cohort.
    pub life_table_year: f64,
    pub life_expectancy_additional: f64,
    pub life_expectancy_additional2: f64,
    pub age_start: ValueRange,
    pub age_start2: ValueRange,
    pub age_end: f64,

    pub time_period: f64,
    pub gamma: f64,
    pub consume_additional: f64,
    pub consume_floor: f64,
    pub consume_ceiling: Option<f64>,
    pub consume_utility_floor: f64,
    pub reward_clip: Option<f64>,
    pub consume_rescale: ConsumeRescale,
    pub action_space_unbounded: bool,

    pub defined_benefits: Vec<IncomeSpec>,

    pub p_tax_free: ValueRange,
    pub p_tax_deferred: ValueRange,
    pub p_taxable_stocks: ValueRange,
    pub p_taxable_real_bonds: ValueRange,
    pub p_taxable_nominal_bonds: ValueRange,
    pub p_taxable_iid_bonds: ValueRange,
    pub p_taxable_bills: ValueRange,
    pub p_taxable_stocks_basis_fraction: ValueRange,

    pub tax: bool,
    pub tax_state: f64,
    pub tax_table: TaxTable,
    pub dividend_yield_stocks: f64,
    pub dividend_yield_bonds: f64,
    pub qualified_dividends_stocks: f64,
    pub qualified_dividends_bonds: f64,

    pub real_spias: bool,
    pub nominal_spias: bool,
    pub real_spias_mwr: f64,
    pub nominal_spias_mwr: f64,
    /// Flat discount rates used to price annuity schedules.
    pub spias_real_rate: f64,
    pub spias_nominal_rate: f64,
    pub couple_spias: bool,
    pub spias_permitted_from_age: f64,

    pub stocks: ReturnParams,
    pub real_bonds: ReturnParams,
    pub nominal_bonds: ReturnParams,
    pub iid_bonds: ReturnParams,
    pub bills: ReturnParams,
    pub returns_standard_error: bool,
    pub inflation_mean: f64,
    pub inflation_volatility: f64,
    pub inflation_standard_error: f64,
    pub real_bonds_duration_max: f64,
    pub nominal_bonds_duration_max: f64,
    /// Duration at which the bond volatility parameters apply.
    pub bonds_reference_duration: f64,
    pub observe_interest_rate: bool,
    pub observe_inflation_rate: bool,

    pub consume_policy: ConsumePolicy,
    pub consume_initial: f64,
    pub consume_policy_life_expectancy: Option<f64>,
    pub consume_policy_return: f64,
    pub annuitization_policy: AnnuitizationPolicy,
    pub annuitization_policy_age: f64,
    pub asset_allocation_policy: AllocationPolicy,
    pub real_bonds_duration: Option<f64>,
    pub nominal_bonds_duration: Option<f64>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            sex: Sex::Female,
            sex2: None,
            life_table: LifeTableSpec::default(),
            life_table_year: 2020.0,
            life_expectancy_additional: 0.0,
            life_expectancy_additional2: 0.0,
            age_start: ValueRange::fixed(65.0),
            age_start2: ValueRange::fixed(65.0),
            age_end: 121.0,

            time_period: 1.0,
            gamma: 3.0,
            consume_additional: 0.6,
            consume_floor: 0.0,
            consume_ceiling: None,
            consume_utility_floor: 10_000.0,
            reward_clip: None,
            consume_rescale: ConsumeRescale::EstimateBounded,
            action_space_unbounded: false,

            defined_benefits: vec![IncomeSpec::with_payout(10_000.0)],

            p_tax_free: ValueRange::fixed(0.0),
            p_tax_deferred: ValueRange::fixed(0.0),
            p_taxable_stocks: ValueRange::fixed(0.0),
            p_taxable_real_bonds: ValueRange::fixed(0.0),
            p_taxable_nominal_bonds: ValueRange::fixed(0.0),
            p_taxable_iid_bonds: ValueRange::fixed(0.0),
            p_taxable_bills: ValueRange::fixed(0.0),
            p_taxable_stocks_basis_fraction: ValueRange::fixed(1.0),

            tax: false,
            tax_state: 0.06,
            tax_table: TaxTable::default(),
            dividend_yield_stocks: 0.02,
            dividend_yield_bonds: 0.04,
            qualified_dividends_stocks: 1.0,
            qualified_dividends_bonds: 0.0,

            real_spias: false,
            nominal_spias: false,
            real_spias_mwr: 0.94,
            nominal_spias_mwr: 1.0,
            spias_real_rate: 0.01,
            spias_nominal_rate: 0.03,
            couple_spias: true,
            spias_permitted_from_age: 0.0,

            stocks: ReturnParams::new(true, 0.065, 0.174, 0.016),
            real_bonds: ReturnParams::new(true, 0.01, 0.11, 0.010),
            nominal_bonds: ReturnParams::new(true, 0.025, 0.11, 0.010),
            iid_bonds: ReturnParams::new(false, 0.025, 0.110, 0.010),
            bills: ReturnParams::new(true, 0.009, 0.004, 0.004),
            returns_standard_error: true,
            inflation_mean: 0.03,
            inflation_volatility: 0.047,
            inflation_standard_error: 0.004,
            real_bonds_duration_max: 30.0,
            nominal_bonds_duration_max: 30.0,
            bonds_reference_duration: 15.0,
            observe_interest_rate: true,
            observe_inflation_rate: true,

            consume_policy: ConsumePolicy::Rl,
            consume_initial: 0.0,
            consume_policy_life_expectancy: None,
            consume_policy_return: 0.0,
            annuitization_policy: AnnuitizationPolicy::Rl,
            annuitization_policy_age: 0.0,
            asset_allocation_policy: AllocationPolicy::Rl,
            real_bonds_duration: None,
            nominal_bonds_duration: None,
        }
    }
}

impl SimConfig {
    pub fn return_params(&self, class: AssetClass) -> &ReturnParams {
        match class {
            AssetClass::Stocks => &self.stocks,
            AssetClass::RealBonds => &self.real_bonds,
            AssetClass::NominalBonds => &self.nominal_bonds,
            AssetClass::IidBonds => &self.iid_bonds,
            AssetClass::Bills => &self.bills,
        }
    }

    pub fn class_enabled(&self, class: AssetClass) -> bool {
        self.return_params(class).enabled
    }

    pub fn taxable_range(&self, class: AssetClass) -> &ValueRange {
        match class {
            AssetClass::Stocks => &self.p_taxable_stocks,
            AssetClass::RealBonds => &self.p_taxable_real_bonds,
            AssetClass::NominalBonds => &self.p_taxable_nominal_bonds,
            AssetClass::IidBonds => &self.p_taxable_iid_bonds,
            AssetClass::Bills => &self.p_taxable_bills,
        }
    }

    pub fn is_couple(&self) -> bool {
        self.sex2.is_some()
    }

    pub fn spias_mwr(&self, real: bool) -> f64 {
        if real {
            self.real_spias_mwr
        } else {
            self.nominal_spias_mwr
        }
    }

    pub fn validate(&self) -> Result<(), SimError> {
        let positive = |name: &str, v: f64| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(SimError::InvalidConfig(format!("{name} must be > 0")))
            }
        };
        let non_negative = |name: &str, v: f64| {
            if v.is_finite() && v >= 0.0 {
                Ok(())
            } else {
                Err(SimError::InvalidConfig(format!("{name} must be >= 0")))
            }
        };

        positive("time_period", self.time_period)?;
        positive("gamma", self.gamma)?;
        positive("consume_utility_floor", self.consume_utility_floor)?;
        positive("real_spias_mwr", self.real_spias_mwr)?;
        positive("nominal_spias_mwr", self.nominal_spias_mwr)?;
        non_negative("consume_additional", self.consume_additional)?;
        non_negative("consume_floor", self.consume_floor)?;
        non_negative("tax_state", self.tax_state)?;
        non_negative("consume_initial", self.consume_initial)?;
        if let Some(ceiling) = self.consume_ceiling {
            if !(ceiling >= self.consume_floor) {
                return Err(SimError::InvalidConfig(
                    "consume_ceiling must be >= consume_floor".to_string(),
                ));
            }
        }
        if let Some(clip) = self.reward_clip {
            positive("reward_clip", clip)?;
        }

        self.age_start.check("age_start", false)?;
        self.age_start2.check("age_start2", false)?;
        let oldest_start = if self.is_couple() {
            self.age_start.high.max(self.age_start2.high)
        } else {
            self.age_start.high
        };
        if !(self.age_end - self.time_period > oldest_start) {
            return Err(SimError::InvalidConfig(
                "age_end must exceed age_start by more than one time_period".to_string(),
            ));
        }

        self.p_tax_free.check("p_tax_free", true)?;
        self.p_tax_deferred.check("p_tax_deferred", true)?;
        for class in AssetClass::ALL {
            self.taxable_range(class)
                .check(&format!("p_taxable_{class:?}"), true)?;
        }
        self.p_taxable_stocks_basis_fraction
            .check("p_taxable_stocks_basis_fraction", false)?;

        if !AssetClass::ALL.iter().any(|&c| self.class_enabled(c)) {
            return Err(SimError::InvalidConfig(
                "at least one asset class must be enabled".to_string(),
            ));
        }
        for class in AssetClass::ALL {
            let params = self.return_params(class);
            if params.mean <= -1.0 || params.volatility < 0.0 || params.standard_error < 0.0 {
                return Err(SimError::InvalidConfig(format!(
                    "{class:?} return parameters out of range"
                )));
            }
        }
        if self.inflation_mean <= -1.0 || self.inflation_volatility < 0.0 {
            return Err(SimError::InvalidConfig(
                "inflation parameters out of range".to_string(),
            ));
        }
        if self.real_bonds_duration_max < self.time_period
            || self.nominal_bonds_duration_max < self.time_period
        {
            return Err(SimError::InvalidConfig(
                "bond duration maximum must be >= time_period".to_string(),
            ));
        }
        positive("bonds_reference_duration", self.bonds_reference_duration)?;

        if let LifeTableSpec::Fixed { q } = self.life_table {
            if !(0.0..=1.0).contains(&q) {
                return Err(SimError::InvalidConfig(
                    "fixed life table q must lie in [0, 1]".to_string(),
                ));
            }
        }

        if self.asset_allocation_policy == AllocationPolicy::AgeInNominalBonds
            && !(self.stocks.enabled && self.nominal_bonds.enabled)
        {
            return Err(SimError::InvalidConfig(
                "age_in_nominal_bonds needs stocks and nominal bonds enabled".to_string(),
            ));
        }
        let annuity_enabled = match self.annuitization_policy {
            AnnuitizationPolicy::AgeReal => self.real_spias,
            AnnuitizationPolicy::AgeNominal => self.nominal_spias,
            AnnuitizationPolicy::Rl | AnnuitizationPolicy::None => true,
        };
        if !annuity_enabled {
            return Err(SimError::InvalidConfig(format!(
                "annuitization policy {:?} needs its SPIA type enabled",
                self.annuitization_policy
            )));
        }
        if let AllocationPolicy::Fixed(weights) = &self.asset_allocation_policy {
            let mut total = 0.0;
            for (class, weight) in weights {
                if !self.class_enabled(*class) {
                    return Err(SimError::InvalidConfig(format!(
                        "fixed allocation names disabled class {class:?}"
                    )));
                }
                non_negative("fixed allocation weight", *weight)?;
                total += weight;
            }
            if total <= 0.0 {
                return Err(SimError::InvalidConfig(
                    "fixed allocation weights must sum to > 0".to_string(),
                ));
            }
        }

        for spec in &self.defined_benefits {
            spec.validate(self.is_couple())?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_range_accepts_scalar_or_pair() {
        let fixed: ValueRange = serde_json::from_str("65").unwrap();
        assert_eq!(fixed, ValueRange::fixed(65.0));
        let span: ValueRange = serde_json::from_str("[1e3, 1e5]").unwrap();
        assert_eq!(span, ValueRange::new(1e3, 1e5));
    }

    #[test]
    fn log_uniform_handles_zero_and_stays_in_range() {
        use rand::SeedableRng;
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(3);
        assert_eq!(ValueRange::fixed(0.0).sample_log_uniform(&mut rng), 0.0);
        let range = ValueRange::new(1e3, 1e7);
        for _ in 0..100 {
            let v = range.sample_log_uniform(&mut rng);
            assert!((1e3..=1e7).contains(&v));
        }
    }

    #[test]
    fn default_config_is_valid() {
        SimConfig::default().validate().unwrap();
    }

    #[test]
    fn config_parses_partial_json_with_defaults() {
        let config: SimConfig = serde_json::from_str(
            r#"{
                "sex2": "male",
                "age_start": [60, 70],
                "p_tax_free": [1e3, 1e6],
                "consume_rescale": "estimate_biased",
                "asset_allocation_policy": {"fixed": {"stocks": 0.6, "nominal_bonds": 0.4}},
                "life_table": {"kind": "fixed", "q": 0.02}
            }"#,
        )
        .unwrap();
        assert_eq!(config.sex2, Some(Sex::Male));
        assert_eq!(config.age_start, ValueRange::new(60.0, 70.0));
        assert_eq!(config.consume_rescale, ConsumeRescale::EstimateBiased);
        assert_eq!(config.life_table, LifeTableSpec::Fixed { q: 0.02 });
        assert_eq!(config.time_period, 1.0);
        config.validate().unwrap();
    }

    #[test]
    fn validate_rejects_inverted_ranges_and_bad_log_ranges() {
        let mut config = SimConfig::default();
        config.age_start = ValueRange::new(70.0, 60.0);
        assert!(matches!(config.validate(), Err(SimError::InvalidConfig(_))));

        let mut config = SimConfig::default();
        config.p_tax_free = ValueRange::new(0.0, 1e6);
        assert!(matches!(config.validate(), Err(SimError::InvalidConfig(_))));
    }

    #[test]
    fn validate_rejects_fixed_allocation_on_disabled_class() {
        let mut config = SimConfig::default();
        config.asset_allocation_policy =
            AllocationPolicy::Fixed(BTreeMap::from([(AssetClass::IidBonds, 1.0)]));
        assert!(matches!(config.validate(), Err(SimError::InvalidConfig(_))));
    }

    #[test]
    fn validate_requires_spias_for_age_annuitization() {
        let mut config = SimConfig::default();
        config.annuitization_policy = AnnuitizationPolicy::AgeNominal;
        assert!(matches!(config.validate(), Err(SimError::InvalidConfig(_))));
        config.nominal_spias = true;
        config.validate().unwrap();
    }

    #[test]
    fn asset_map_indexes_by_class() {
        let mut map = AssetAllocation::empty();
        map[AssetClass::Bills] = Some(2.0);
        map[AssetClass::Stocks] = Some(3.0);
        assert_eq!(map.total(), 5.0);
        assert_eq!(map.amount(AssetClass::RealBonds), 0.0);
        let enabled: Vec<_> = map.enabled().map(|(c, _)| c).collect();
        assert_eq!(enabled, vec![AssetClass::Stocks, AssetClass::Bills]);
    }
}
