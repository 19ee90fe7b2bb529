use serde::Deserialize;

use super::error::SimError;
use super::types::{FundSource, Owner, ValueRange};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
pub enum IncomeKind {
    #[serde(rename = "Income Annuity")]
    IncomeAnnuity,
    #[serde(rename = "Social Security")]
    SocialSecurity,
    #[serde(rename = "Pension")]
    Pension,
}

/// Escalation of a scheduled payout: tracks CPI, or grows at a fixed
/// nominal annual rate (0 for a level nominal stream).
#[derive(Copy, Clone, Debug, PartialEq, Deserialize)]
#[serde(try_from = "InflationRepr")]
pub enum InflationAdjustment {
    Cpi,
    Nominal(f64),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum InflationRepr {
    Rate(f64),
    Named(String),
}

impl TryFrom<InflationRepr> for InflationAdjustment {
    type Error = String;

    fn try_from(repr: InflationRepr) -> Result<Self, Self::Error> {
        match repr {
            InflationRepr::Rate(rate) => Ok(InflationAdjustment::Nominal(rate)),
            InflationRepr::Named(name) if name == "cpi" => Ok(InflationAdjustment::Cpi),
            InflationRepr::Named(name) => Err(format!("unknown inflation_adjustment {name:?}")),
        }
    }
}

impl InflationAdjustment {
    pub fn is_real(self) -> bool {
        matches!(self, InflationAdjustment::Cpi)
    }

    /// Growth factor applied to the payout for period `period`.
    pub fn escalation(self, period: usize, time_period: f64) -> f64 {
        match self {
            InflationAdjustment::Cpi => 1.0,
            InflationAdjustment::Nominal(rate) => (1.0 + rate).powf(period as f64 * time_period),
        }
    }
}

fn default_kind() -> IncomeKind {
    IncomeKind::IncomeAnnuity
}

fn default_owner() -> Owner {
    Owner::Primary
}

fn default_inflation() -> InflationAdjustment {
    InflationAdjustment::Cpi
}

fn default_source() -> FundSource {
    FundSource::TaxDeferred
}

/// One guaranteed income record. Exactly one of `premium` and `payout`
/// is present: a payout is an annual amount starting at `age` (the
/// owner's current age when absent), a premium buys a stream at market
/// prices starting next period.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IncomeSpec {
    #[serde(rename = "type", default = "default_kind")]
    pub kind: IncomeKind,
    #[serde(default = "default_owner")]
    pub owner: Owner,
    #[serde(default)]
    pub age: Option<f64>,
    #[serde(default)]
    pub premium: Option<f64>,
    #[serde(default)]
    pub payout: Option<ValueRange>,
    #[serde(default = "default_inflation")]
    pub inflation_adjustment: InflationAdjustment,
    #[serde(default)]
    pub joint: bool,
    #[serde(default)]
    pub payout_fraction: f64,
    #[serde(default = "default_source")]
    pub source_of_funds: FundSource,
    #[serde(default)]
    pub exclusion_period: f64,
    #[serde(default)]
    pub exclusion_amount: f64,
}

impl IncomeSpec {
    pub fn with_payout(payout: f64) -> Self {
        Self {
            kind: IncomeKind::IncomeAnnuity,
            owner: Owner::Primary,
            age: None,
            premium: None,
            payout: Some(ValueRange::fixed(payout)),
            inflation_adjustment: InflationAdjustment::Cpi,
            joint: false,
            payout_fraction: 0.0,
            source_of_funds: FundSource::TaxDeferred,
            exclusion_period: 0.0,
            exclusion_amount: 0.0,
        }
    }

    pub fn is_social_security(&self) -> bool {
        self.kind == IncomeKind::SocialSecurity
    }

    pub fn validate(&self, couple: bool) -> Result<(), SimError> {
        if self.owner == Owner::Spouse && !couple {
            return Err(SimError::InvalidIncome(
                "owner spouse requires a second household member".to_string(),
            ));
        }
        match (self.premium, self.payout) {
            (Some(premium), None) => {
                if !premium.is_finite() || premium < 0.0 {
                    return Err(SimError::InvalidIncome(format!(
                        "premium {premium} must be finite and >= 0"
                    )));
                }
            }
            (None, Some(payout)) => {
                if !payout.low.is_finite() || !payout.high.is_finite() {
                    return Err(SimError::InvalidIncome("payout must be finite".to_string()));
                }
                if payout.low < 0.0 || payout.low > payout.high {
                    return Err(SimError::InvalidIncome(format!(
                        "payout range [{}, {}] invalid",
                        payout.low, payout.high
                    )));
                }
                if !payout.is_fixed() && payout.low == 0.0 {
                    return Err(SimError::InvalidIncome(
                        "payout range needs a positive lower bound".to_string(),
                    ));
                }
            }
            _ => {
                return Err(SimError::InvalidIncome(
                    "exactly one of premium and payout is required".to_string(),
                ));
            }
        }
        if !(0.0..=1.0).contains(&self.payout_fraction) {
            return Err(SimError::InvalidIncome(format!(
                "payout_fraction {} outside [0, 1]",
                self.payout_fraction
            )));
        }
        if let Some(age) = self.age {
            if !age.is_finite() {
                return Err(SimError::InvalidIncome("age must be finite".to_string()));
            }
        }
        if let InflationAdjustment::Nominal(rate) = self.inflation_adjustment {
            if !rate.is_finite() || rate <= -1.0 {
                return Err(SimError::InvalidIncome(format!(
                    "inflation_adjustment {rate} out of range"
                )));
            }
        }
        if !self.exclusion_period.is_finite()
            || self.exclusion_period < 0.0
            || !self.exclusion_amount.is_finite()
        {
            return Err(SimError::InvalidIncome(
                "exclusion period and amount must be finite, period >= 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parses a JSON list of guaranteed income records.
pub fn parse_income_specs(json: &str, couple: bool) -> Result<Vec<IncomeSpec>, SimError> {
    let specs: Vec<IncomeSpec> =
        serde_json::from_str(json).map_err(|e| SimError::InvalidIncome(e.to_string()))?;
    for spec in &specs {
        spec.validate(couple)?;
    }
    Ok(specs)
}
