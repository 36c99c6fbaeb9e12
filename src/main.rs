// =============================================================================
// Flappy DQN — Deep Q-Network agent trained from raw pixels (Rust + candle)
// =============================================================================
// Build & Run:
//   cargo build --release
//   cargo run --release -- train --max-episode 20000
//   cargo run --release -- train --resume --weight checkpoints/checkpoint-episode-400.ckpt
//   cargo run --release -- play  --model checkpoints/model_best.ckpt

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use std::path::PathBuf;

use anyhow::Result;
use candle_core::Device;
use clap::{Parser, Subcommand};
use tracing::warn;

use flappy_dqn::checkpoint;
use flappy_dqn::{EnvConfig, FlappyEnv, QNetwork, TrainConfig, Trainer, play_episode};

/// CUDA, then Metal, else CPU.
fn select_device(use_accelerator: bool) -> Device {
    if !use_accelerator {
        return Device::Cpu;
    }
    match Device::cuda_if_available(0) {
        Ok(dev) if !dev.is_cpu() => return dev,
        Ok(_) => {}
        Err(err) => warn!("CUDA unavailable: {err}"),
    }
    match Device::new_metal(0) {
        Ok(dev) => dev,
        Err(err) => {
            warn!("no accelerator available ({err}), falling back to CPU");
            Device::Cpu
        }
    }
}

fn make_env(seed: Option<u64>) -> FlappyEnv {
    match seed {
        Some(s) => FlappyEnv::with_seed(EnvConfig::default(), s),
        None => FlappyEnv::new(EnvConfig::default()),
    }
}

// =============================================================================
// Train
// =============================================================================

fn train(args: TrainArgs) -> Result<()> {
    eprintln!("═══════════════════════════════════════════════════════════");
    eprintln!("  TRAINING — Flappy DQN Agent (Rust + candle)");
    eprintln!("═══════════════════════════════════════════════════════════");

    let config = args.into_config()?;
    config.validate()?;

    let device = select_device(config.use_accelerator);
    eprintln!("Device: {:?}", device);

    let game = make_env(config.seed);
    let eval_game = make_env(config.seed.map(|s| s.wrapping_add(1)));
    let mut trainer = Trainer::new(config, &device, game, eval_game)?;
    trainer.run()?;

    let state = trainer.state();
    eprintln!(
        "\n✅ Training complete. {} episodes, {} steps, best avg time step {:.2}",
        state.episode, state.total_steps, state.best_time_step
    );
    Ok(())
}

// =============================================================================
// Play
// =============================================================================

fn play(args: &PlayArgs) -> Result<()> {
    eprintln!("═══════════════════════════════════════════════════════════");
    eprintln!("  PLAYING — Flappy DQN Agent");
    eprintln!("═══════════════════════════════════════════════════════════");

    let device = select_device(args.accelerator);
    eprintln!("Load model file: {}", args.model.display());
    let ckpt = checkpoint::load(&args.model)?;
    eprintln!("Pretrained episode = {}", ckpt.meta.episode);
    if let Some(best) = ckpt.meta.best_time_step {
        eprintln!("Best time step is {best:.2}");
    }
    if let Some(time_step) = ckpt.meta.time_step {
        eprintln!("Time step is {time_step:.2}");
    }
    eprintln!("Epsilon = {:.5}", ckpt.meta.epsilon);

    let net = QNetwork::new(&device)?;
    ckpt.restore_into(&net, &args.model)?;

    let mut game = make_env(args.seed);
    let steps = play_episode(&net, &mut game, args.max_steps.unwrap_or(u64::MAX))?;
    eprintln!("Total time step is {steps}");
    Ok(())
}

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser)]
#[command(name = "flappy-dqn", about = "Side-scrolling pipe game — DQN RL Agent")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the DQN agent
    Train(TrainArgs),
    /// Watch a trained agent play one greedy episode
    Play(PlayArgs),
}

/// Flags left unset keep the value from `--config` (or the default).
#[derive(Parser)]
struct TrainArgs {
    /// JSON file with any subset of the training options
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    lr: Option<f64>,
    #[arg(long)]
    max_episode: Option<u64>,
    #[arg(long)]
    observation: Option<u64>,
    #[arg(long)]
    memory_size: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    gamma: Option<f64>,
    #[arg(long)]
    init_e: Option<f64>,
    #[arg(long)]
    final_e: Option<f64>,
    /// Episodes over which epsilon is annealed
    #[arg(long)]
    exploration: Option<u64>,
    #[arg(long)]
    save_checkpoint_freq: Option<u64>,
    #[arg(long)]
    eval_every: Option<u64>,
    #[arg(long)]
    eval_episodes: Option<usize>,
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,
    #[arg(long)]
    seed: Option<u64>,
    /// Resume from --weight
    #[arg(long, default_value_t = false)]
    resume: bool,
    #[arg(long)]
    weight: Option<PathBuf>,
    /// Use CUDA or Metal when available
    #[arg(long, default_value_t = false)]
    accelerator: bool,
}

impl TrainArgs {
    fn into_config(self) -> Result<TrainConfig> {
        let mut c = match &self.config {
            Some(path) => TrainConfig::from_json_file(path)?,
            None => TrainConfig::default(),
        };
        if let Some(v) = self.lr {
            c.learning_rate = v;
        }
        if let Some(v) = self.max_episode {
            c.max_episode = v;
        }
        if let Some(v) = self.observation {
            c.observation_steps = v;
        }
        if let Some(v) = self.memory_size {
            c.replay_capacity = v;
        }
        if let Some(v) = self.batch_size {
            c.batch_size = v;
        }
        if let Some(v) = self.gamma {
            c.gamma = v;
        }
        if let Some(v) = self.init_e {
            c.init_epsilon = v;
        }
        if let Some(v) = self.final_e {
            c.final_epsilon = v;
        }
        if let Some(v) = self.exploration {
            c.exploration_steps = v;
        }
        if let Some(v) = self.save_checkpoint_freq {
            c.save_checkpoint_frequency = v;
        }
        if let Some(v) = self.eval_every {
            c.eval_every = v;
        }
        if let Some(v) = self.eval_episodes {
            c.eval_episodes = v;
        }
        if let Some(v) = self.checkpoint_dir {
            c.checkpoint_dir = v;
        }
        if self.seed.is_some() {
            c.seed = self.seed;
        }
        if self.weight.is_some() {
            c.weight = self.weight;
        }
        c.resume |= self.resume;
        c.use_accelerator |= self.accelerator;
        Ok(c)
    }
}

#[derive(Parser)]
struct PlayArgs {
    #[arg(long)]
    model: PathBuf,
    /// Stop after this many steps (default: play until the bird crashes)
    #[arg(long)]
    max_steps: Option<u64>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long, default_value_t = false)]
    accelerator: bool,
}

// =============================================================================
// Main
// =============================================================================

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train(args) => train(args),
        Commands::Play(args) => play(&args),
    }
}
