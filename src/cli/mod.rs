use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use log::warn;
use rayon::prelude::*;
use serde::Serialize;
use thiserror::Error;

use crate::core::decoder::ACTION_LEN;
use crate::core::{FinEnv, SimConfig, SimError, episode_seed};

#[derive(Parser, Debug)]
#[command(
    name = "retire_env",
    about = "Retirement household simulator (guaranteed income, taxes, annuities, market returns)"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Roll out episodes under the configured rule-based policies and print
    /// one JSON line per episode.
    Run {
        #[arg(long, help = "JSON configuration file; defaults are used when omitted")]
        config: Option<PathBuf>,
        #[arg(long, default_value_t = 1)]
        episodes: u64,
        #[arg(long, default_value_t = 0, help = "Base seed, mixed with the episode index")]
        seed: u64,
    },
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("reading configuration: {0}")]
    Io(#[from] io::Error),

    #[error("parsing configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Sim(#[from] SimError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpisodeSummary {
    pub episode: u64,
    pub seed: u64,
    pub length: usize,
    pub reward_sum: f64,
    pub certainty_equivalent: Option<f64>,
}

pub fn config_from_json(json: &str) -> Result<SimConfig, CliError> {
    let config: SimConfig = serde_json::from_str(json)?;
    config.validate()?;
    Ok(config)
}

pub fn load_config(path: Option<&Path>) -> Result<SimConfig, CliError> {
    match path {
        Some(path) => config_from_json(&fs::read_to_string(path)?),
        None => {
            let config = SimConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

/// Runs one episode to completion. Learned decisions receive the neutral
/// all-zero control vector.
pub fn run_episode(config: &SimConfig, episode: u64, seed: u64) -> Result<EpisodeSummary, SimError> {
    let mut env = FinEnv::new(config.clone())?;
    env.reset(seed)?;
    let controls = [0.0; ACTION_LEN];
    let mut reward_sum = 0.0;
    loop {
        let outcome = env.step(Some(&controls))?;
        reward_sum += outcome.reward;
        if outcome.done {
            return Ok(EpisodeSummary {
                episode,
                seed,
                length: env.episode_length(),
                reward_sum,
                certainty_equivalent: outcome.info.certainty_equivalent,
            });
        }
    }
}

/// Episodes that cannot find a feasible starting point are skipped with a
/// warning; any other failure aborts the run.
pub fn run_episodes(config: &SimConfig, episodes: u64, base_seed: u64) -> Result<Vec<EpisodeSummary>, SimError> {
    let results: Vec<Result<Option<EpisodeSummary>, SimError>> = (0..episodes)
        .into_par_iter()
        .map(|episode| {
            let seed = episode_seed(base_seed, episode);
            match run_episode(config, episode, seed) {
                Ok(summary) => Ok(Some(summary)),
                Err(e) if e.is_initialization_failure() => {
                    warn!("episode {episode} (seed {seed}) skipped: {e}");
                    Ok(None)
                }
                Err(e) => Err(e),
            }
        })
        .collect();

    let mut summaries = Vec::with_capacity(results.len());
    for result in results {
        if let Some(summary) = result? {
            summaries.push(summary);
        }
    }
    Ok(summaries)
}

pub fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Command::Run {
            config,
            episodes,
            seed,
        } => {
            let config = load_config(config.as_deref())?;
            let summaries = run_episodes(&config, episodes, seed)?;
            let stdout = io::stdout();
            let mut out = stdout.lock();
            for summary in &summaries {
                writeln!(out, "{}", serde_json::to_string(summary)?)?;
            }
            Ok(())
        }
    }
}
