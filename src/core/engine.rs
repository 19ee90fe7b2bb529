use std::sync::Arc;

use log::{debug, info};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;

use super::accounts::{self, Balances};
use super::decoder::{ACTION_LEN, ActionDecoder, DecodeContext, DecodedAction};
use super::error::SimError;
use super::ledger::{Household, IncomeLedger, Pricing};
use super::life_table::LifeTable;
use super::market::{LognormalMarket, MarketSampler};
use super::policy::{PolicyContext, RulePolicy};
use super::survival::{SurvivalArrays, SurvivalModel};
use super::taxes::{DividendParams, TaxState};
use super::types::{AssetAllocation, AssetClass, AssetMap, FundSource, Owner, SimConfig};
use super::utility::Utility;

/// Wealth draws tried by `reset` before giving up on a scenario.
const INIT_ATTEMPTS: usize = 1000;

/// What the household can see at the start of a period. Income and
/// wealth are expressed per year of consumption-equivalent life
/// expectancy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Observation {
    pub couple: f64,
    pub single: f64,
    pub life_expectancy_both: f64,
    pub life_expectancy_one: f64,
    pub income_tax_free: f64,
    pub income_tax_deferred: f64,
    pub income_taxable: f64,
    pub wealth_tax_free: f64,
    pub wealth_tax_deferred: f64,
    pub wealth_taxable: f64,
    pub real_interest_rate: f64,
    pub inflation_rate: f64,
}

impl Observation {
    pub fn to_array(&self) -> [f64; 12] {
        [
            self.couple,
            self.single,
            self.life_expectancy_both,
            self.life_expectancy_one,
            self.income_tax_free,
            self.income_tax_deferred,
            self.income_taxable,
            self.wealth_tax_free,
            self.wealth_tax_deferred,
            self.wealth_taxable,
            self.real_interest_rate,
            self.inflation_rate,
        ]
    }
}

/// Cash flows of one period, in real terms. Rates are annual.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StepInfo {
    pub consume_rate: f64,
    /// Guaranteed income received over the period.
    pub guaranteed_income: f64,
    pub taxes_paid: f64,
    pub real_spias: f64,
    pub nominal_spias: f64,
    /// Change in invested wealth from market returns over the period.
    pub investment_gain: f64,
    /// Consumption whose utility is the episode's mean utility, set on
    /// the final step.
    pub certainty_equivalent: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StepOutcome {
    pub observation: Observation,
    pub reward: f64,
    pub done: bool,
    pub info: StepInfo,
}

/// Previous period's market outcome, read by the rule-based policies.
#[derive(Debug, Clone, Copy, Default)]
struct PrevPeriod {
    /// Gross nominal portfolio return.
    portfolio_return: Option<f64>,
    inflation: Option<f64>,
}

#[derive(Debug)]
struct SimState {
    age: f64,
    age2: f64,
    couple: bool,
    start_year: f64,
    survival: SurvivalArrays,
    life_expectancy_both: Vec<f64>,
    life_expectancy_one: Vec<f64>,
    ledger: IncomeLedger,
    balances: Balances,
    /// Taxable holdings at the end of the last period.
    taxable_holdings: AssetAllocation,
    taxes: TaxState,
    taxes_due: f64,
    cpi: f64,
    episode_length: usize,
    utility_sum: f64,
    prev: PrevPeriod,
    done: bool,
}

impl SimState {
    fn min_age(&self) -> f64 {
        match self.ledger.household() {
            Household::Couple { .. } => self.age.min(self.age2),
            Household::Single {
                survivor: Owner::Primary,
            } => self.age,
            Household::Single {
                survivor: Owner::Spouse,
            } => self.age2,
        }
    }

    /// Remaining life expectancy of the household.
    fn lifespan(&self) -> f64 {
        let ep = self.episode_length;
        self.life_expectancy_both[ep] + self.life_expectancy_one[ep]
    }
}

/// One household's retirement simulated period by period.
///
/// `reset` draws a new episode, `step` advances it by one period and
/// returns the survival-weighted utility of the period's consumption.
pub struct FinEnv {
    config: SimConfig,
    decoder: ActionDecoder,
    policy: RulePolicy,
    utility: Utility,
    market: Box<dyn MarketSampler>,
    table: LifeTable,
    table2: Option<LifeTable>,
    rng: ChaCha8Rng,
    state: Option<SimState>,
}

impl FinEnv {
    pub fn new(config: SimConfig) -> Result<Self, SimError> {
        let market = Box::new(LognormalMarket::new(&config));
        Self::with_market(config, market)
    }

    pub fn with_market(config: SimConfig, market: Box<dyn MarketSampler>) -> Result<Self, SimError> {
        config.validate()?;
        let death_age = config.age_end - config.time_period;
        let table = LifeTable::from_spec(&config.life_table, config.sex, death_age)?;
        let table2 = config
            .sex2
            .map(|sex| LifeTable::from_spec(&config.life_table, sex, death_age))
            .transpose()?;
        Ok(Self {
            decoder: ActionDecoder::new(&config),
            policy: RulePolicy::new(&config),
            utility: Utility::new(config.gamma, config.consume_utility_floor),
            market,
            table,
            table2,
            rng: ChaCha8Rng::seed_from_u64(0),
            state: None,
            config,
        })
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn balances(&self) -> Option<Balances> {
        self.state.as_ref().map(|s| s.balances)
    }

    pub fn ledger(&self) -> Option<&IncomeLedger> {
        self.state.as_ref().map(|s| &s.ledger)
    }

    pub fn survival(&self) -> Option<&SurvivalArrays> {
        self.state.as_ref().map(|s| &s.survival)
    }

    pub fn episode_length(&self) -> usize {
        self.state.as_ref().map_or(0, |s| s.episode_length)
    }

    /// Starts a new episode from `seed`. Fails when no initial wealth draw
    /// puts expected consumption inside the configured band.
    pub fn reset(&mut self, seed: u64) -> Result<Observation, SimError> {
        self.start_episode(seed, None)
    }

    fn start_episode(&mut self, seed: u64, rolls: Option<(f64, f64)>) -> Result<Observation, SimError> {
        self.state = None;
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        let config = &self.config;
        let rng = &mut self.rng;
        let dt = config.time_period;
        let year = config.life_table_year;

        let age = config.age_start.sample_uniform(&mut *rng);
        let age2 = config.age_start2.sample_uniform(&mut *rng);
        let table = Arc::new(self.table.clone().with_additional_life_expectancy(
            age,
            year,
            config.life_expectancy_additional,
        ));
        let table2 = self.table2.as_ref().map(|t| {
            Arc::new(t.clone().with_additional_life_expectancy(
                age2,
                year,
                config.life_expectancy_additional2,
            ))
        });

        let model = SurvivalModel {
            table: &table,
            table2: table2.as_deref(),
            time_period: dt,
            start_year: year,
        };
        let survival = match rolls {
            Some((dead_at, dead_at2)) => model.compute_with_rolls(age, age2, dead_at, dead_at2),
            None => model.compute(age, age2, &mut *rng),
        };
        let couple = survival.alive_single[0].is_none();

        let (household, younger) = if couple {
            (
                Household::Couple {
                    first_dies_first: survival.first_dies_first,
                },
                age.min(age2),
            )
        } else {
            (
                Household::Single {
                    survivor: Owner::Primary,
                },
                age,
            )
        };
        let periods = ((config.age_end - younger) / dt).ceil().max(1.0) as usize;
        let pricing = Pricing {
            real_rate: config.spias_real_rate,
            nominal_rate: config.spias_nominal_rate,
            real_mwr: config.real_spias_mwr,
            nominal_mwr: config.nominal_spias_mwr,
        };
        let mut ledger = IncomeLedger::new(household, table, table2, pricing, dt, periods);
        ledger.set_ages(age, age2, year);
        for spec in &config.defined_benefits {
            ledger.add_income(spec, &mut *rng);
        }

        let guaranteed_income = ledger.income_sum(1.0);
        let consume_years = 2.0 * survival.life_expectancy_both[0] + survival.life_expectancy_one[0];
        let mut last_consume_estimate = f64::NAN;
        let mut initial = None;
        for attempt in 1..=INIT_ATTEMPTS {
            let tax_free = config.p_tax_free.sample_log_uniform(&mut *rng);
            let tax_deferred = config.p_tax_deferred.sample_log_uniform(&mut *rng);
            let mut taxable = AssetAllocation::empty();
            for class in AssetClass::ALL {
                if config.class_enabled(class) {
                    taxable[class] = Some(config.taxable_range(class).sample_log_uniform(&mut *rng));
                }
            }
            let basis_fraction = config.p_taxable_stocks_basis_fraction.sample_uniform(&mut *rng);

            let p_sum = tax_free + tax_deferred + taxable.total();
            let consume_estimate = guaranteed_income
                + if consume_years > 0.0 {
                    p_sum / consume_years
                } else if p_sum > 0.0 {
                    f64::INFINITY
                } else {
                    0.0
                };
            last_consume_estimate = consume_estimate;
            let in_band = consume_estimate >= config.consume_floor
                && config.consume_ceiling.is_none_or(|ceiling| consume_estimate <= ceiling);
            if in_band {
                debug!("initial wealth accepted after {attempt} attempts");
                initial = Some((tax_free, tax_deferred, taxable, basis_fraction));
                break;
            }
        }
        let Some((tax_free, tax_deferred, taxable, basis_fraction)) = initial else {
            return Err(SimError::InitializationInfeasible {
                attempts: INIT_ATTEMPTS,
                last_consume_estimate,
            });
        };

        self.market.reset(&mut *rng);
        self.policy.reset();

        let state = SimState {
            age,
            age2,
            couple,
            start_year: year,
            life_expectancy_both: survival.life_expectancy_both.clone(),
            life_expectancy_one: survival.life_expectancy_one.clone(),
            survival,
            ledger,
            balances: Balances {
                tax_free,
                tax_deferred,
                taxable: taxable.total(),
            },
            taxes: TaxState::new(&taxable, basis_fraction, dt),
            taxable_holdings: taxable,
            taxes_due: 0.0,
            cpi: 1.0,
            episode_length: 0,
            utility_sum: 0.0,
            prev: PrevPeriod::default(),
            done: false,
        };
        let observation = observe(&self.config, &state, self.market.as_ref());
        self.state = Some(state);
        Ok(observation)
    }

    /// Advances one period with a raw control vector. `None` is accepted
    /// when every decision comes from a rule-based policy.
    pub fn step(&mut self, action: Option<&[f64]>) -> Result<StepOutcome, SimError> {
        let state = self.active_state()?;
        let ctx = decode_context(&self.config, state);
        let decoded = match action {
            Some(action) => self.decoder.decode(action, &ctx)?,
            None if self.policy.needs_action() => {
                return Err(SimError::InvalidAction(
                    "an action is required unless all decisions are rule-based".to_string(),
                ));
            }
            None => self.decoder.decode(&[0.0; ACTION_LEN], &ctx)?,
        };
        self.step_decoded(decoded)
    }

    /// Advances one period with an action already in model units.
    pub fn step_decoded(&mut self, mut action: DecodedAction) -> Result<StepOutcome, SimError> {
        let config = &self.config;
        let state = match self.state.as_mut() {
            None => return Err(SimError::EpisodeNotStarted),
            Some(state) if state.done => return Err(SimError::EpisodeFinished),
            Some(state) => state,
        };
        let dt = config.time_period;
        let ep = state.episode_length;
        let cpi = state.cpi;

        let income = state.ledger.income_by_source(cpi);
        let guaranteed_income: f64 = income.iter().sum();
        let p_sum = state.balances.total();
        // Policy state is committed only once the action has been accepted.
        let mut policy = self.policy.clone();
        policy.apply(
            &mut action,
            &PolicyContext {
                p_sum,
                p_plus_income: p_sum + guaranteed_income * dt,
                guaranteed_income,
                min_age: state.min_age(),
                life_expectancy: state.lifespan(),
                elapsed: ep as f64 * dt,
                prev_return: state.prev.portfolio_return,
                prev_inflation: state.prev.inflation,
            },
        );
        self.decoder.gate_spias(&mut action, state.couple, state.min_age());
        check_allocation(config, &action.asset_allocation)?;

        let spent = accounts::spend(
            &state.balances,
            guaranteed_income * dt,
            state.taxes_due,
            action.consume_fraction,
            action.real_spias_fraction,
            action.nominal_spias_fraction,
            dt,
        )?;
        self.policy = policy;

        let payout_fraction = 1.0 / (1.0 + config.consume_additional);
        let exclusion_years = state.lifespan();
        for (real, purchase) in [(true, spent.real_spias), (false, spent.nominal_spias)] {
            for (source, premium) in purchase.by_source() {
                if premium > 0.0 {
                    // Nominal contracts are priced in current dollars.
                    let premium = if real { premium } else { premium * cpi };
                    state
                        .ledger
                        .purchase_annuity(source, real, premium, payout_fraction, exclusion_years);
                }
            }
        }

        let mut holdings = accounts::allocate(&spent.balances, &action.asset_allocation);
        // Tax-free guaranteed income stays out of regular income.
        let taxable_income = (income[FundSource::TaxDeferred.index()] + income[FundSource::Taxable.index()]) * dt;
        let regular_income = taxable_income + (state.balances.tax_deferred - spent.balances.tax_deferred);

        let inflation = self.market.inflation(&mut self.rng);
        state.cpi *= inflation;

        let mut returns = AssetMap([1.0; AssetClass::COUNT]);
        let mut portfolio_return = 0.0;
        for (class, weight) in action.asset_allocation.enabled() {
            let duration = match class {
                AssetClass::RealBonds => action.real_bonds_duration,
                AssetClass::NominalBonds => action.nominal_bonds_duration,
                _ => None,
            };
            returns[class] = self.market.sample(class, duration, &mut self.rng);
            portfolio_return += weight * returns[class];
        }
        let dividends = |class: AssetClass| {
            if class.is_stocks() {
                DividendParams {
                    yield_rate: config.dividend_yield_stocks,
                    qualified: config.qualified_dividends_stocks,
                }
            } else {
                DividendParams {
                    yield_rate: config.dividend_yield_bonds,
                    qualified: config.qualified_dividends_bonds,
                }
            }
        };
        let balances = accounts::apply_returns(
            &mut holdings,
            &returns,
            &state.taxable_holdings,
            &mut state.taxes,
            dividends,
        );

        if config.tax {
            let tax = state.taxes.tax(
                &config.tax_table,
                config.tax_state,
                regular_income,
                !state.couple,
                inflation,
            );
            state.taxes_due += tax - spent.taxes_paid;
        } else {
            state.taxes.end_period(inflation);
            state.taxes_due -= spent.taxes_paid;
        }

        let consume_rate = spent.consume / dt;
        let (utility, weight) = if state.couple {
            (
                self.utility.utility(consume_rate / (1.0 + config.consume_additional)),
                2.0 * dt,
            )
        } else {
            (
                self.utility.utility(consume_rate),
                state.survival.alive_single[ep].unwrap_or(0.0) * dt,
            )
        };
        let clipped = match config.reward_clip {
            Some(clip) => utility.clamp(-clip, clip),
            None => utility,
        };
        if clipped != utility {
            debug!(
                "reward clipped: age {:.1}, wealth {:.0}, consume fraction {:.4}, utility {utility}",
                state.age,
                p_sum,
                action.consume_fraction
            );
        }
        let reward = if weight == 0.0 { 0.0 } else { weight * clipped };

        state.age += dt;
        state.age2 += dt;

        let became_single = state.couple && state.survival.alive_single[ep + 1].is_some();
        if became_single {
            state.life_expectancy_both = vec![0.0; state.life_expectancy_both.len()];
            state.life_expectancy_one = state
                .survival
                .life_expectancy_single
                .iter()
                .map(|le| le.unwrap_or(0.0))
                .collect();
        }
        state.ledger.advance_period(became_single);
        if became_single {
            if let Household::Single { survivor } = state.ledger.household() {
                info!("couple became single in period {}, {survivor:?} survives", ep + 1);
            }
        }
        state
            .ledger
            .set_ages(state.age, state.age2, state.start_year + (ep + 1) as f64 * dt);

        state.utility_sum += utility;
        state.episode_length += 1;
        state.couple = state.survival.alive_single[state.episode_length].is_none();
        self.market.step(&mut self.rng);

        let done = state.episode_length >= state.survival.horizon();
        let certainty_equivalent =
            done.then(|| self.utility.inverse(state.utility_sum / state.episode_length as f64));

        let investment_gain = balances.total() - spent.balances.total();
        state.balances = balances;
        state.taxable_holdings = holdings.taxable;
        state.prev = PrevPeriod {
            portfolio_return: Some(portfolio_return * inflation),
            inflation: Some(inflation),
        };
        state.done = done;

        let info = StepInfo {
            consume_rate,
            guaranteed_income: guaranteed_income * dt,
            taxes_paid: spent.taxes_paid,
            real_spias: spent.real_spias.total(),
            nominal_spias: spent.nominal_spias.total(),
            investment_gain,
            certainty_equivalent,
        };
        Ok(StepOutcome {
            observation: observe(config, state, self.market.as_ref()),
            reward,
            done,
            info,
        })
    }

    fn active_state(&self) -> Result<&SimState, SimError> {
        match &self.state {
            None => Err(SimError::EpisodeNotStarted),
            Some(state) if state.done => Err(SimError::EpisodeFinished),
            Some(state) => Ok(state),
        }
    }
}

/// Seed of episode `episode` in a run started from `base_seed`.
pub fn episode_seed(base_seed: u64, episode: u64) -> u64 {
    splitmix64(base_seed ^ episode.rotate_left(32))
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

fn decode_context(config: &SimConfig, state: &SimState) -> DecodeContext {
    let dt = config.time_period;
    let guaranteed_income = state.ledger.income_sum(state.cpi);
    let p_sum = state.balances.total();
    DecodeContext {
        p_plus_income: p_sum + guaranteed_income * dt,
        income_estimate: guaranteed_income + p_sum / state.lifespan().max(dt),
        guaranteed_income,
        couple: state.couple,
        min_age: state.min_age(),
    }
}

/// Weights must cover exactly the enabled classes and sum to 1.
fn check_allocation(config: &SimConfig, allocation: &AssetAllocation) -> Result<(), SimError> {
    let mut total = 0.0;
    for class in AssetClass::ALL {
        match (config.class_enabled(class), allocation[class]) {
            (true, Some(w)) if w.is_finite() && w >= 0.0 => total += w,
            (false, None) => {}
            (_, w) => {
                return Err(SimError::InvalidAction(format!(
                    "asset allocation {w:?} for {class:?} does not match enabled classes"
                )));
            }
        }
    }
    if (total - 1.0).abs() > 1e-6 {
        return Err(SimError::InvalidAction(format!(
            "asset allocation sums to {total}"
        )));
    }
    Ok(())
}

fn observe(config: &SimConfig, state: &SimState, market: &dyn MarketSampler) -> Observation {
    let ep = state.episode_length;
    let life_expectancy_both = state.life_expectancy_both[ep];
    let life_expectancy_one = state.life_expectancy_one[ep];
    let consume_years =
        2.0 * life_expectancy_both / (1.0 + config.consume_additional) + life_expectancy_one;
    let per_year = |amount: f64| {
        if consume_years == 0.0 {
            f64::INFINITY
        } else {
            amount / consume_years
        }
    };

    let income = state.ledger.present_values(state.cpi);
    let (real_rate, inflation_rate) = market.observe();
    Observation {
        couple: if state.couple { 1.0 } else { 0.0 },
        single: if state.couple { 0.0 } else { 1.0 },
        life_expectancy_both,
        life_expectancy_one,
        income_tax_free: per_year(income[FundSource::TaxFree.index()]),
        income_tax_deferred: per_year(income[FundSource::TaxDeferred.index()]),
        income_taxable: per_year(income[FundSource::Taxable.index()]),
        wealth_tax_free: per_year(state.balances.tax_free),
        wealth_tax_deferred: per_year(state.balances.tax_deferred),
        wealth_taxable: per_year(state.balances.taxable - state.taxes_due),
        real_interest_rate: if config.observe_interest_rate { real_rate } else { 0.0 },
        inflation_rate: if config.observe_inflation_rate { inflation_rate } else { 0.0 },
    }
}
