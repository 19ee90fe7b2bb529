use super::decoder::DecodedAction;
use super::types::{
    AllocationPolicy, AnnuitizationPolicy, AssetAllocation, AssetClass, ConsumePolicy, SimConfig,
};

const GK_LOWER_GUARDRAIL: f64 = 0.8;
const GK_UPPER_GUARDRAIL: f64 = 1.2;
const GK_ADJUSTMENT: f64 = 0.10;
/// Guyton-Klinger cuts only apply while this much life expectancy remains.
const GK_MIN_LIFE_EXPECTANCY: f64 = 15.0;

/// Household state the rule-based policies see before spending.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolicyContext {
    /// Investment wealth, real.
    pub p_sum: f64,
    pub p_plus_income: f64,
    /// Guaranteed income rate, real.
    pub guaranteed_income: f64,
    pub min_age: f64,
    /// Remaining life expectancy of the household.
    pub life_expectancy: f64,
    /// Years since the start of the episode.
    pub elapsed: f64,
    /// Gross nominal portfolio return of the previous period.
    pub prev_return: Option<f64>,
    pub prev_inflation: Option<f64>,
}

/// Overrides parts of a decoded action with configured decision rules.
#[derive(Debug, Clone)]
pub struct RulePolicy {
    consume: ConsumePolicy,
    consume_initial: f64,
    consume_life_expectancy: Option<f64>,
    consume_return: f64,
    annuitization: AnnuitizationPolicy,
    annuitization_age: f64,
    allocation: AllocationPolicy,
    real_bonds_duration: Option<f64>,
    nominal_bonds_duration: Option<f64>,
    spias_enabled: bool,
    enabled: [bool; AssetClass::COUNT],
    time_period: f64,
    /// Real investment withdrawal of the Guyton rules.
    withdrawal: Option<f64>,
    initial_rate: f64,
}

impl RulePolicy {
    pub fn new(config: &SimConfig) -> Self {
        Self {
            consume: config.consume_policy,
            consume_initial: config.consume_initial,
            consume_life_expectancy: config.consume_policy_life_expectancy,
            consume_return: config.consume_policy_return,
            annuitization: config.annuitization_policy,
            annuitization_age: config.annuitization_policy_age,
            allocation: config.asset_allocation_policy.clone(),
            real_bonds_duration: config.real_bonds_duration,
            nominal_bonds_duration: config.nominal_bonds_duration,
            spias_enabled: config.real_spias || config.nominal_spias,
            enabled: AssetClass::ALL.map(|class| config.class_enabled(class)),
            time_period: config.time_period,
            withdrawal: None,
            initial_rate: 0.0,
        }
    }

    pub fn reset(&mut self) {
        self.withdrawal = None;
        self.initial_rate = 0.0;
    }

    /// Whether some part of the action still comes from the caller.
    pub fn needs_action(&self) -> bool {
        self.consume == ConsumePolicy::Rl
            || (self.annuitization == AnnuitizationPolicy::Rl && self.spias_enabled)
            || self.allocation == AllocationPolicy::Rl
    }

    pub fn apply(&mut self, action: &mut DecodedAction, ctx: &PolicyContext) {
        if let Some(consume) = self.planned_consumption(ctx) {
            let fraction = if ctx.p_plus_income > 0.0 {
                consume / ctx.p_plus_income
            } else {
                0.0
            };
            action.consume_fraction = if fraction.is_nan() {
                0.0
            } else {
                fraction.clamp(0.0, 1.0 / self.time_period)
            };
        }

        match self.annuitization {
            AnnuitizationPolicy::Rl => {}
            AnnuitizationPolicy::None => {
                action.real_spias_fraction = None;
                action.nominal_spias_fraction = None;
            }
            AnnuitizationPolicy::AgeReal | AnnuitizationPolicy::AgeNominal => {
                let full = (ctx.min_age >= self.annuitization_age).then_some(1.0 / self.time_period);
                let real = self.annuitization == AnnuitizationPolicy::AgeReal;
                action.real_spias_fraction = if real { full } else { None };
                action.nominal_spias_fraction = if real { None } else { full };
            }
        }

        if let Some(allocation) = self.fixed_allocation(ctx) {
            action.asset_allocation = allocation;
        }

        if action.real_bonds_duration.is_some() && self.real_bonds_duration.is_some() {
            action.real_bonds_duration = self.real_bonds_duration;
        }
        if action.nominal_bonds_duration.is_some() && self.nominal_bonds_duration.is_some() {
            action.nominal_bonds_duration = self.nominal_bonds_duration;
        }
    }

    /// Annual consumption rate under a rule, or `None` when learned.
    fn planned_consumption(&mut self, ctx: &PolicyContext) -> Option<f64> {
        match self.consume {
            ConsumePolicy::Rl => None,
            ConsumePolicy::Constant => Some(self.consume_initial),
            ConsumePolicy::GuytonRule2 | ConsumePolicy::GuytonKlinger => {
                let withdrawal = match self.withdrawal {
                    None => {
                        let w = (self.consume_initial - ctx.guaranteed_income).max(0.0);
                        self.initial_rate = if ctx.p_sum > 0.0 { w / ctx.p_sum } else { 0.0 };
                        w
                    }
                    Some(w) => self.guyton_adjust(w, ctx),
                };
                self.withdrawal = Some(withdrawal);
                Some(ctx.guaranteed_income + withdrawal)
            }
            ConsumePolicy::Pmt => {
                let years = match self.consume_life_expectancy {
                    Some(le) => le - ctx.elapsed,
                    None => ctx.life_expectancy,
                }
                .max(self.time_period);
                Some(ctx.guaranteed_income + ctx.p_sum * annuity_withdrawal_rate(self.consume_return, years))
            }
        }
    }

    fn guyton_adjust(&self, mut withdrawal: f64, ctx: &PolicyContext) -> f64 {
        let rate = if ctx.p_sum > 0.0 {
            withdrawal / ctx.p_sum
        } else {
            f64::INFINITY
        };
        let lost_money = ctx.prev_return.is_some_and(|r| r < 1.0);
        let skip_inflation = match self.consume {
            ConsumePolicy::GuytonKlinger => lost_money && rate > self.initial_rate,
            _ => lost_money,
        };
        if skip_inflation {
            // Level nominal withdrawal loses the period's inflation.
            withdrawal /= ctx.prev_inflation.unwrap_or(1.0);
        }

        if self.consume == ConsumePolicy::GuytonKlinger {
            if rate < self.initial_rate * GK_LOWER_GUARDRAIL {
                withdrawal *= 1.0 + GK_ADJUSTMENT;
            } else if rate > self.initial_rate * GK_UPPER_GUARDRAIL
                && ctx.life_expectancy > GK_MIN_LIFE_EXPECTANCY
            {
                withdrawal *= 1.0 - GK_ADJUSTMENT;
            }
        }
        withdrawal
    }

    fn fixed_allocation(&self, ctx: &PolicyContext) -> Option<AssetAllocation> {
        let enabled = self.enabled;
        match &self.allocation {
            AllocationPolicy::Rl => None,
            AllocationPolicy::AgeInNominalBonds => {
                let bonds = (ctx.min_age / 100.0).clamp(0.0, 1.0);
                Some(AssetAllocation::from_fn(|class| {
                    enabled[class.index()].then_some(match class {
                        AssetClass::Stocks => 1.0 - bonds,
                        AssetClass::NominalBonds => bonds,
                        _ => 0.0,
                    })
                }))
            }
            AllocationPolicy::Fixed(weights) => {
                let total: f64 = weights.values().sum();
                Some(AssetAllocation::from_fn(|class| {
                    enabled[class.index()]
                        .then(|| weights.get(&class).copied().unwrap_or(0.0) / total)
                }))
            }
        }
    }
}

/// Level annual withdrawal rate that exhausts a portfolio over `years`
/// at a constant `real_return`.
pub fn annuity_withdrawal_rate(real_return: f64, years: f64) -> f64 {
    if real_return.abs() < 1e-9 {
        return 1.0 / years;
    }
    if real_return <= -0.99 {
        return 1.0 / years;
    }

    let denom = 1.0 - (1.0 + real_return).powf(-years);
    if denom.abs() <= 1e-9 {
        1.0 / years
    } else {
        real_return / denom
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::collections::BTreeMap;

    fn policy(configure: impl FnOnce(&mut SimConfig)) -> RulePolicy {
        let mut config = SimConfig::default();
        configure(&mut config);
        RulePolicy::new(&config)
    }

    fn ctx(p_sum: f64) -> PolicyContext {
        PolicyContext {
            p_sum,
            p_plus_income: p_sum,
            guaranteed_income: 0.0,
            min_age: 65.0,
            life_expectancy: 20.0,
            elapsed: 0.0,
            prev_return: None,
            prev_inflation: None,
        }
    }

    fn neutral() -> DecodedAction {
        let mut aa = AssetAllocation::empty();
        aa[AssetClass::Stocks] = Some(1.0);
        DecodedAction {
            consume_fraction: 0.5,
            real_spias_fraction: Some(0.3),
            nominal_spias_fraction: None,
            asset_allocation: aa,
            real_bonds_duration: Some(5.0),
            nominal_bonds_duration: None,
        }
    }

    #[test]
    fn withdrawal_rate_amortizes_over_remaining_years() {
        assert_relative_eq!(annuity_withdrawal_rate(0.0, 25.0), 0.04);
        assert_relative_eq!(annuity_withdrawal_rate(0.03, 30.0), 0.051019, epsilon = 1e-6);
        assert!(annuity_withdrawal_rate(0.03, 10.0) > annuity_withdrawal_rate(0.03, 30.0));
        let negative = annuity_withdrawal_rate(-0.02, 10.0);
        assert!(negative > 0.0 && negative < 0.1);
    }

    #[test]
    fn rl_policies_keep_decoded_action() {
        let mut rl = policy(|_| {});
        assert!(rl.needs_action());
        let mut action = neutral();
        rl.apply(&mut action, &ctx(1_000_000.0));
        assert_eq!(action, neutral());
    }

    #[test]
    fn constant_consumes_initial_amount() {
        let mut constant = policy(|c| {
            c.consume_policy = ConsumePolicy::Constant;
            c.consume_initial = 50_000.0;
        });
        let mut action = neutral();
        constant.apply(&mut action, &ctx(1_000_000.0));
        assert_relative_eq!(action.consume_fraction, 0.05);

        constant.apply(&mut action, &ctx(0.0));
        assert_eq!(action.consume_fraction, 0.0);
    }

    #[test]
    fn guyton_rule2_skips_inflation_after_losses() {
        let mut rule2 = policy(|c| {
            c.consume_policy = ConsumePolicy::GuytonRule2;
            c.consume_initial = 40_000.0;
        });
        let mut action = neutral();
        rule2.apply(&mut action, &ctx(1_000_000.0));
        assert_relative_eq!(action.consume_fraction, 0.04);

        let after_loss = PolicyContext {
            prev_return: Some(0.95),
            prev_inflation: Some(1.03),
            ..ctx(900_000.0)
        };
        rule2.apply(&mut action, &after_loss);
        assert_relative_eq!(action.consume_fraction, 40_000.0 / 1.03 / 900_000.0, epsilon = 1e-12);
    }

    #[test]
    fn guyton_klinger_guardrails_cut_and_raise() {
        let gk = || {
            policy(|c| {
                c.consume_policy = ConsumePolicy::GuytonKlinger;
                c.consume_initial = 40_000.0;
            })
        };
        let good_year = |p_sum| PolicyContext {
            prev_return: Some(1.05),
            prev_inflation: Some(1.02),
            ..ctx(p_sum)
        };

        let mut cut = gk();
        let mut action = neutral();
        cut.apply(&mut action, &ctx(1_000_000.0));
        cut.apply(&mut action, &good_year(700_000.0));
        assert_relative_eq!(action.consume_fraction * 700_000.0, 36_000.0, epsilon = 1e-6);

        let mut raise = gk();
        raise.apply(&mut action, &ctx(1_000_000.0));
        raise.apply(&mut action, &good_year(2_000_000.0));
        assert_relative_eq!(action.consume_fraction * 2_000_000.0, 44_000.0, epsilon = 1e-6);
    }

    #[test]
    fn pmt_spreads_wealth_over_life_expectancy() {
        let mut pmt = policy(|c| c.consume_policy = ConsumePolicy::Pmt);
        let mut action = neutral();
        let ctx = PolicyContext {
            guaranteed_income: 10_000.0,
            p_plus_income: 1_010_000.0,
            ..ctx(1_000_000.0)
        };
        pmt.apply(&mut action, &ctx);
        assert_relative_eq!(action.consume_fraction * 1_010_000.0, 10_000.0 + 50_000.0, epsilon = 1e-6);
    }

    #[test]
    fn age_real_annuitizes_fully_from_policy_age() {
        let mut age_real = policy(|c| {
            c.annuitization_policy = AnnuitizationPolicy::AgeReal;
            c.annuitization_policy_age = 70.0;
        });
        let mut action = neutral();
        age_real.apply(&mut action, &ctx(1_000_000.0));
        assert_eq!(action.real_spias_fraction, None);

        let older = PolicyContext {
            min_age: 70.0,
            ..ctx(1_000_000.0)
        };
        age_real.apply(&mut action, &older);
        assert_eq!(action.real_spias_fraction, Some(1.0));
        assert_eq!(action.nominal_spias_fraction, None);
    }

    #[test]
    fn age_in_nominal_bonds_keeps_other_classes_at_zero() {
        let mut rule = policy(|c| c.asset_allocation_policy = AllocationPolicy::AgeInNominalBonds);
        let mut action = neutral();
        rule.apply(&mut action, &ctx(1_000_000.0));
        let aa = action.asset_allocation;
        assert_relative_eq!(aa.amount(AssetClass::NominalBonds), 0.65);
        assert_relative_eq!(aa.amount(AssetClass::Stocks), 0.35);
        assert_eq!(aa[AssetClass::Bills], Some(0.0));
        assert_eq!(aa[AssetClass::IidBonds], None);
    }

    #[test]
    fn fixed_weights_are_normalized_and_durations_fixed() {
        let weights = BTreeMap::from([(AssetClass::Stocks, 3.0), (AssetClass::Bills, 1.0)]);
        let mut fixed = policy(|c| {
            c.asset_allocation_policy = AllocationPolicy::Fixed(weights);
            c.consume_policy = ConsumePolicy::Constant;
            c.annuitization_policy = AnnuitizationPolicy::None;
            c.real_bonds_duration = Some(10.0);
        });
        assert!(!fixed.needs_action());
        let mut action = neutral();
        fixed.apply(&mut action, &ctx(1_000_000.0));
        assert_relative_eq!(action.asset_allocation.amount(AssetClass::Stocks), 0.75);
        assert_eq!(action.asset_allocation[AssetClass::RealBonds], Some(0.0));
        assert_eq!(action.real_bonds_duration, Some(10.0));
        assert_eq!(action.real_spias_fraction, None);
    }
}
