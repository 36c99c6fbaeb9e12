pub const FRAME_WIDTH: usize = 128;
pub const FRAME_HEIGHT: usize = 72;
pub const FRAME_PIXELS: usize = FRAME_WIDTH * FRAME_HEIGHT;
/// Frames per network input.
pub const STACK_SIZE: usize = 4;

pub mod checkpoint;
pub mod config;
pub mod dqn;
pub mod env;
pub mod error;
pub mod eval;
pub mod policy;
pub mod preprocess;
pub mod replay;
pub mod trainer;

pub use checkpoint::{Checkpoint, CheckpointMeta, CheckpointStore, NamedTensor};
pub use config::TrainConfig;
pub use dqn::{DqnNet, ParamsRmsProp, QNetwork, RmsProp, bootstrap_targets};
pub use env::{Action, EnvConfig, FlappyEnv, Game, StepOutcome};
pub use error::TrainError;
pub use eval::{EvalStats, play_episode, run_eval};
pub use policy::{EpsilonGreedy, EpsilonSchedule, optimal_action};
pub use preprocess::{Frame, State, preprocess};
pub use replay::{BatchTensors, ReplayMemory, Transition};
pub use trainer::{EpisodeStats, TrainPhase, Trainer, TrainerState};
