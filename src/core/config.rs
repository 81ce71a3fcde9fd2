//! Engine configuration.
//!
//! Plain structs with defaults and `with_*` builders. A handful of knobs can
//! also be changed at runtime by name through [`EngineConfig::set_parameter`];
//! they take effect at the next command entry.

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::model::{FitSettings, PosteriorSettings};

/// Upper bound on the blind-simulation swarm.
pub const MONTE_CARLO_SIZE: usize = 1000;

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TrainingConfig {
    pub min_samples_per_entity: usize,
    pub min_stream_len: usize,
    pub fit: FitSettings,
    /// Run the posterior-sampling phase after the point estimate.
    pub uncertainty: bool,
    pub posterior: PosteriorSettings,
    pub kmeans_iterations: usize,
    pub hmm_iterations: usize,
    /// Skip picture and keyword models; train only the state and sound models.
    pub sound_only: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            min_samples_per_entity: 10,
            min_stream_len: 500,
            fit: FitSettings::default(),
            uncertainty: false,
            posterior: PosteriorSettings::default(),
            kmeans_iterations: 50,
            hmm_iterations: 30,
            sound_only: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DecisionConfig {
    /// Size of the pool the next stimulus is drawn from.
    pub top_k: usize,
    pub sound_candidates: usize,
    /// Share of sound candidates drawn uniformly instead of perturbed.
    pub random_sound_fraction: f32,
    pub sound_perturbation: f32,
    pub swarm_size: usize,
    /// Degraded-confidence threshold on mean(stddev) / mean(|Δmean|).
    pub confidence_ratio: f32,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            top_k: 3,
            sound_candidates: 64,
            random_sound_fraction: 0.1,
            sound_perturbation: 0.05,
            swarm_size: 100,
            confidence_ratio: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EngineConfig {
    pub tick: Duration,
    pub estimator_period: Duration,
    pub measure_hold: Duration,
    pub disconnect_grace: Duration,
    pub join_timeout: Duration,

    // If set, makes behavior reproducible for evaluation.
    pub seed: Option<u64>,

    pub hidden_states: usize,
    pub observation_clusters: usize,
    /// Program steps per simulated second during Execute.
    pub program_hz: f32,

    /// Execute picks stimuli at random instead of scoring models.
    pub random_programs: bool,
    pub default_loop: bool,
    pub default_blind: bool,

    pub training: TrainingConfig,
    pub decision: DecisionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(100),
            estimator_period: Duration::from_millis(250),
            measure_hold: Duration::from_millis(200),
            disconnect_grace: Duration::from_secs(5),
            join_timeout: Duration::from_secs(2),
            seed: None,
            hidden_states: 4,
            observation_clusters: 12,
            program_hz: 1.0,
            random_programs: false,
            default_loop: false,
            default_blind: false,
            training: TrainingConfig::default(),
            decision: DecisionConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_estimator_period(mut self, period: Duration) -> Self {
        self.estimator_period = period;
        self
    }

    pub fn with_measure_hold(mut self, hold: Duration) -> Self {
        self.measure_hold = hold;
        self
    }

    pub fn with_disconnect_grace(mut self, grace: Duration) -> Self {
        self.disconnect_grace = grace;
        self
    }

    pub fn with_states(mut self, hidden_states: usize, observation_clusters: usize) -> Self {
        self.hidden_states = hidden_states.max(1);
        self.observation_clusters = observation_clusters.max(1);
        self
    }

    pub fn with_training(mut self, training: TrainingConfig) -> Self {
        self.training = training;
        self
    }

    pub fn with_decision(mut self, decision: DecisionConfig) -> Self {
        self.decision = decision;
        self
    }

    /// Per-tick seconds of simulated time during Execute.
    pub fn tick_secs(&self) -> f32 {
        self.tick.as_secs_f32()
    }

    /// Change a runtime parameter by name.
    ///
    /// | name                     | value            |
    /// |--------------------------|------------------|
    /// | `show-top-results`       | K ≥ 1            |
    /// | `use-bayesian-nnetwork`  | true/false       |
    /// | `random-programs`        | true/false       |
    /// | `optimize-synth-only`    | true/false       |
    /// | `loop`                   | true/false       |
    /// | `blind-monte-carlo`      | true/false       |
    pub fn set_parameter(&mut self, name: &str, value: &str) -> Result<(), EngineError> {
        match name {
            "show-top-results" => {
                let k: usize = value
                    .trim()
                    .parse()
                    .map_err(|_| EngineError::config(format!("`{name}` needs a positive integer")))?;
                if k == 0 {
                    return Err(EngineError::config(format!("`{name}` needs a positive integer")));
                }
                self.decision.top_k = k;
            }
            "use-bayesian-nnetwork" => self.training.uncertainty = parse_flag(name, value)?,
            "random-programs" => self.random_programs = parse_flag(name, value)?,
            "optimize-synth-only" => self.training.sound_only = parse_flag(name, value)?,
            "loop" => self.default_loop = parse_flag(name, value)?,
            "blind-monte-carlo" => self.default_blind = parse_flag(name, value)?,
            _ => return Err(EngineError::config(format!("unknown parameter `{name}`"))),
        }
        Ok(())
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool, EngineError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "on" | "yes" => Ok(true),
        "false" | "0" | "off" | "no" => Ok(false),
        _ => Err(EngineError::config(format!("`{name}` needs true or false"))),
    }
}
