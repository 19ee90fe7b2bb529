use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("invalid action: {0}")]
    InvalidAction(String),

    #[error("invalid defined benefit: {0}")]
    InvalidIncome(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(
        "no feasible initial wealth after {attempts} attempts (last consumption estimate {last_consume_estimate:.0})"
    )]
    InitializationInfeasible {
        attempts: usize,
        last_consume_estimate: f64,
    },

    #[error("step called before reset")]
    EpisodeNotStarted,

    #[error("step called after episode finished")]
    EpisodeFinished,

    #[error("life table load failed: {0}")]
    LifeTableCsv(#[from] csv::Error),

    #[error("life table read failed: {0}")]
    LifeTableIo(#[from] std::io::Error),
}

impl SimError {
    /// Errors the caller can recover from by resetting with another seed.
    pub fn is_initialization_failure(&self) -> bool {
        matches!(self, SimError::InitializationInfeasible { .. })
    }

    /// Caller errors: malformed actions, income records or configuration,
    /// and stepping outside an episode.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            SimError::InvalidAction(_)
                | SimError::InvalidIncome(_)
                | SimError::InvalidConfig(_)
                | SimError::EpisodeNotStarted
                | SimError::EpisodeFinished
        )
    }
}

pub type SimResult<T> = Result<T, SimError>;
