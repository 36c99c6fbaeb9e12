use anyhow::{Context, Result};
use candle_core::Device;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use tracing::{debug, info};

use crate::checkpoint::{self, Checkpoint, CheckpointMeta, CheckpointStore};
use crate::config::TrainConfig;
use crate::dqn::{QNetwork, RmsProp};
use crate::env::{Action, Game, StepOutcome};
use crate::error::TrainError;
use crate::eval::run_eval;
use crate::policy::{EpsilonGreedy, EpsilonSchedule, random_action};
use crate::preprocess::{State, preprocess_checked};
use crate::replay::{BatchTensors, ReplayMemory, Transition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainPhase {
    /// Random play that only fills the replay memory.
    Observation,
    Training,
    Finished,
}

/// Everything that changes as training progresses.
#[derive(Debug, Clone)]
pub struct TrainerState {
    pub phase: TrainPhase,
    /// Index of the next episode to run.
    pub episode: u64,
    pub epsilon: f64,
    /// Best evaluation average seen so far; `-inf` until the first evaluation.
    pub best_time_step: f64,
    pub last_eval: Option<f64>,
    pub total_steps: u64,
    pub optimizer_steps: u64,
}

impl TrainerState {
    pub fn new(init_epsilon: f64) -> Self {
        Self {
            phase: TrainPhase::Observation,
            episode: 0,
            epsilon: init_epsilon,
            best_time_step: f64::NEG_INFINITY,
            last_eval: None,
            total_steps: 0,
            optimizer_steps: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EpisodeStats {
    pub episode: u64,
    pub steps: u64,
    pub discounted_reward: f64,
    pub mean_loss: f32,
}

// =============================================================================
// Trainer
// =============================================================================

pub struct Trainer<G: Game> {
    config: TrainConfig,
    net: QNetwork,
    optimizer: RmsProp,
    replay: ReplayMemory,
    policy: EpsilonGreedy,
    schedule: EpsilonSchedule,
    state: TrainerState,
    current: State,
    game: G,
    eval_game: G,
    store: CheckpointStore,
    rng: SmallRng,
}

impl<G: Game> Trainer<G> {
    /// Validate `config`, build the network and, when resuming, restore it
    /// from the weight file. Nothing touches `game` yet.
    pub fn new(config: TrainConfig, device: &Device, game: G, eval_game: G) -> Result<Self> {
        config.validate()?;

        let net = QNetwork::new(device)?;
        let mut state = TrainerState::new(config.init_epsilon);
        if config.resume {
            let path = config.weight.as_ref().ok_or(TrainError::MissingWeightFile)?;
            let ckpt = checkpoint::load(path)?;
            ckpt.restore_into(&net, path)?;
            state.episode = ckpt.meta.episode + 1;
            state.epsilon = ckpt.meta.epsilon;
            state.best_time_step = ckpt.meta.best_time_step.unwrap_or(f64::NEG_INFINITY);
            state.last_eval = ckpt.meta.time_step.or(ckpt.meta.best_time_step);
            info!(
                path = %path.display(),
                episode = ckpt.meta.episode,
                epsilon = state.epsilon,
                best_time_step = state.best_time_step,
                "resumed from checkpoint"
            );
        }

        let optimizer = net.optimizer(config.learning_rate)?;
        let store = CheckpointStore::new(&config.checkpoint_dir)?;
        config.save_json(store.dir().join("config.json"))?;
        let rng = config
            .seed
            .map_or_else(SmallRng::from_os_rng, SmallRng::seed_from_u64);

        Ok(Self {
            replay: ReplayMemory::new(config.replay_capacity),
            policy: EpsilonGreedy {
                flap_probability: config.explore_flap_probability,
            },
            schedule: EpsilonSchedule::new(
                config.init_epsilon,
                config.final_epsilon,
                config.exploration_steps,
            ),
            config,
            net,
            optimizer,
            state,
            current: State::blank(),
            game,
            eval_game,
            store,
            rng,
        })
    }

    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    pub fn replay(&self) -> &ReplayMemory {
        &self.replay
    }

    pub fn network(&self) -> &QNetwork {
        &self.net
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Observation phase followed by training up to `max_episode`.
    pub fn run(&mut self) -> Result<()> {
        self.observe()?;
        self.train()
    }

    /// Fill the replay memory with random play. No gradient updates.
    pub fn observe(&mut self) -> Result<()> {
        self.state.phase = TrainPhase::Observation;
        self.begin_round()?;
        for _ in 0..self.config.observation_steps {
            let action = random_action(&mut self.rng, self.policy.flap_probability);
            let out = self.game.step(action).context("game step failed")?;
            if self.remember(action, out)? {
                self.begin_round()?;
            }
        }
        info!(
            transitions = self.replay.len(),
            "observation phase finished"
        );
        Ok(())
    }

    pub fn train(&mut self) -> Result<()> {
        self.state.phase = TrainPhase::Training;
        while self.state.episode < self.config.max_episode {
            let stats = self.run_episode()?;
            self.finish_episode(&stats)?;
        }
        self.state.phase = TrainPhase::Finished;
        info!(
            episodes = self.state.episode,
            total_steps = self.state.total_steps,
            best_time_step = self.state.best_time_step,
            "training finished"
        );
        Ok(())
    }

    /// Play one episode, learning from a minibatch after every step.
    pub fn run_episode(&mut self) -> Result<EpisodeStats> {
        self.begin_round()?;
        let gamma = self.config.gamma;
        let mut steps = 0u64;
        let mut discounted_reward = 0.0f64;
        let mut loss_sum = 0.0f32;
        let mut terminal = false;

        while !terminal {
            let action = self.policy.select_action(
                &self.net,
                &self.current,
                self.state.epsilon,
                &mut self.rng,
            )?;
            let out = self.game.step(action).context("game step failed")?;
            discounted_reward += gamma.powf(steps as f64) * out.reward as f64;
            terminal = self.remember(action, out)?;
            steps += 1;
            self.state.total_steps += 1;
            loss_sum += self.learn()?;
        }

        Ok(EpisodeStats {
            episode: self.state.episode,
            steps,
            discounted_reward,
            mean_loss: loss_sum / steps as f32,
        })
    }

    fn begin_round(&mut self) -> Result<()> {
        self.game.reset().context("game reset failed")?;
        self.current = State::blank();
        Ok(())
    }

    /// Store the transition for `out` and advance the frame stack. Returns the
    /// terminal flag; on terminal the stack is blanked.
    fn remember(&mut self, action: Action, out: StepOutcome) -> Result<bool> {
        let frame = preprocess_checked(&out.frame)?;
        let next_state = self.current.push(frame);
        let following = if out.terminal {
            State::blank()
        } else {
            next_state.clone()
        };
        let state = std::mem::replace(&mut self.current, following);
        self.replay.push(Transition {
            state,
            action,
            reward: out.reward,
            next_state,
            terminal: out.terminal,
        });
        Ok(out.terminal)
    }

    fn learn(&mut self) -> Result<f32> {
        let batch = self
            .replay
            .sample(self.config.batch_size, &mut self.rng)?;
        let tensors = BatchTensors::from_transitions(&batch, self.net.device())?;
        let loss = self
            .net
            .train_step(&mut self.optimizer, &tensors, self.config.gamma)?;
        self.state.optimizer_steps += 1;
        Ok(loss)
    }

    fn finish_episode(&mut self, stats: &EpisodeStats) -> Result<()> {
        let episode = stats.episode;
        info!(
            episode,
            epsilon = format_args!("{:.4}", self.state.epsilon),
            steps = stats.steps,
            total_reward = format_args!("{:.6}", stats.discounted_reward),
            loss = format_args!("{:.5}", stats.mean_loss),
            "episode finished"
        );

        self.state.epsilon = self.schedule.anneal(self.state.epsilon);

        let mut saved_best = false;
        if episode % self.config.eval_every == 0 {
            let avg = self.evaluate()?;
            if avg > self.state.best_time_step {
                self.state.best_time_step = avg;
                self.save_checkpoint(true)?;
                saved_best = true;
            }
        }
        if !saved_best && episode % self.config.save_checkpoint_frequency == 0 {
            self.save_checkpoint(false)?;
        }

        self.state.episode += 1;
        Ok(())
    }

    fn evaluate(&mut self) -> Result<f64> {
        let stats = run_eval(
            &self.net,
            &mut self.eval_game,
            self.config.eval_episodes,
            self.config.eval_max_steps,
        )?;
        info!(
            episode = self.state.episode,
            episodes = stats.episodes,
            avg_time_step = stats.avg_time_step,
            "evaluation"
        );
        self.state.last_eval = Some(stats.avg_time_step);
        Ok(stats.avg_time_step)
    }

    fn save_checkpoint(&self, is_best: bool) -> Result<()> {
        let meta = if is_best {
            CheckpointMeta {
                episode: self.state.episode,
                epsilon: self.state.epsilon,
                best_time_step: Some(self.state.best_time_step),
                time_step: None,
            }
        } else {
            // Episode 0 always evaluates and a resumed run seeds `last_eval`
            // from its checkpoint, so it is always set here.
            CheckpointMeta {
                episode: self.state.episode,
                epsilon: self.state.epsilon,
                best_time_step: Some(self.state.best_time_step).filter(|b| b.is_finite()),
                time_step: self.state.last_eval,
            }
        };
        let ckpt = Checkpoint::capture(&self.net, meta)?;
        let path = self.store.save_checkpoint(&ckpt, is_best)?;
        debug!(path = %path.display(), is_best, "checkpoint written");
        Ok(())
    }
}
