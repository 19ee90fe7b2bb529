pub mod accounts;
pub mod annuity;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod income;
pub mod ledger;
pub mod life_table;
pub mod market;
pub mod policy;
pub mod survival;
pub mod taxes;
pub mod types;
pub mod utility;

pub use engine::{FinEnv, Observation, StepInfo, StepOutcome, episode_seed};
pub use error::{SimError, SimResult};
pub use types::SimConfig;
