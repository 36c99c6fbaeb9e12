use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::TrainError;

// =============================================================================
// Training Hyperparameters
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub learning_rate: f64,
    pub max_episode: u64,
    pub observation_steps: u64,
    pub replay_capacity: usize,
    pub batch_size: usize,
    pub gamma: f64,
    pub init_epsilon: f64,
    pub final_epsilon: f64,
    /// Episodes over which epsilon falls from `init_epsilon` to `final_epsilon`.
    pub exploration_steps: u64,
    pub save_checkpoint_frequency: u64,
    pub eval_every: u64,
    pub eval_episodes: usize,
    /// Cap on a single evaluation or playback episode.
    pub eval_max_steps: u64,
    /// Probability that a random (exploration) action is a flap.
    pub explore_flap_probability: f64,
    pub resume: bool,
    pub weight: Option<PathBuf>,
    pub use_accelerator: bool,
    pub checkpoint_dir: PathBuf,
    pub seed: Option<u64>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-6,
            max_episode: 20_000,
            observation_steps: 100,
            replay_capacity: 5_000,
            batch_size: 32,
            gamma: 0.99,
            init_epsilon: 1.0,
            final_epsilon: 0.1,
            exploration_steps: 50_000,
            save_checkpoint_frequency: 2_000,
            eval_every: 100,
            eval_episodes: 5,
            eval_max_steps: 10_000,
            explore_flap_probability: 0.5,
            resume: false,
            weight: None,
            use_accelerator: false,
            checkpoint_dir: PathBuf::from("checkpoints"),
            seed: None,
        }
    }
}

impl TrainConfig {
    /// Read a JSON config. Missing fields take their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open config {}", path.display()))?;
        let config = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path.as_ref())?;
        let writer = std::io::BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), TrainError> {
        let fail = |msg: String| Err(TrainError::Config(msg));

        if self.resume && self.weight.is_none() {
            return Err(TrainError::MissingWeightFile);
        }
        if !(self.gamma > 0.0 && self.gamma < 1.0) {
            return fail(format!("gamma must be in (0, 1), got {}", self.gamma));
        }
        if !(self.learning_rate > 0.0) {
            return fail(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            ));
        }
        if self.batch_size == 0 {
            return fail("batch_size must be at least 1".into());
        }
        if self.observation_steps < self.batch_size as u64 {
            return fail(format!(
                "observation_steps ({}) must be at least batch_size ({}) so sampling never outruns the replay memory",
                self.observation_steps, self.batch_size
            ));
        }
        if self.replay_capacity < self.batch_size {
            return fail(format!(
                "replay_capacity ({}) must be at least batch_size ({})",
                self.replay_capacity, self.batch_size
            ));
        }
        if !(0.0 <= self.final_epsilon
            && self.final_epsilon <= self.init_epsilon
            && self.init_epsilon <= 1.0)
        {
            return fail(format!(
                "need 0 <= final_epsilon ({}) <= init_epsilon ({}) <= 1",
                self.final_epsilon, self.init_epsilon
            ));
        }
        if self.exploration_steps == 0 {
            return fail("exploration_steps must be at least 1".into());
        }
        if self.save_checkpoint_frequency == 0 || self.eval_every == 0 {
            return fail("save_checkpoint_frequency and eval_every must be at least 1".into());
        }
        if self.eval_episodes == 0 || self.eval_max_steps == 0 {
            return fail("eval_episodes and eval_max_steps must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&self.explore_flap_probability) {
            return fail(format!(
                "explore_flap_probability must be in [0, 1], got {}",
                self.explore_flap_probability
            ));
        }
        Ok(())
    }
}
