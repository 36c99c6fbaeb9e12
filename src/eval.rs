use anyhow::{Context, Result};
use tracing::debug;

use crate::dqn::QNetwork;
use crate::env::Game;
use crate::policy::optimal_action;
use crate::preprocess::{State, preprocess_checked};

pub struct EvalStats {
    pub avg_time_step: f64,
    pub episodes: usize,
}

/// Play one greedy episode from a fresh game and blank frame stack. Returns
/// the number of steps survived (the crashing step is not counted).
pub fn play_episode<G: Game + ?Sized>(net: &QNetwork, game: &mut G, max_steps: u64) -> Result<u64> {
    game.reset().context("game reset failed")?;
    let mut state = State::blank();
    let mut steps = 0u64;

    while steps < max_steps {
        let action = optimal_action(&net.q_values(&state)?);
        let out = game.step(action).context("game step failed")?;
        if out.terminal {
            break;
        }
        state = state.push(preprocess_checked(&out.frame)?);
        steps += 1;
    }
    Ok(steps)
}

/// Average survival over `episodes` greedy runs. Reads the network only.
pub fn run_eval<G: Game + ?Sized>(
    net: &QNetwork,
    game: &mut G,
    episodes: usize,
    max_steps: u64,
) -> Result<EvalStats> {
    let eval_episodes = episodes.max(1);
    let mut total = 0u64;
    for i in 0..eval_episodes {
        let steps = play_episode(net, game, max_steps)?;
        debug!(episode = i, steps, "eval episode finished");
        total += steps;
    }
    Ok(EvalStats {
        avg_time_step: total as f64 / eval_episodes as f64,
        episodes: eval_episodes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{Action, StepOutcome};
    use candle_core::Device;
    use image::RgbImage;

    /// Survives a fixed number of steps per round, whatever the action.
    struct FixedLength {
        length: u64,
        tick: u64,
        resets: u32,
    }

    impl Game for FixedLength {
        fn reset(&mut self) -> Result<()> {
            self.tick = 0;
            self.resets += 1;
            Ok(())
        }

        fn step(&mut self, _action: Action) -> Result<StepOutcome> {
            self.tick += 1;
            Ok(StepOutcome {
                frame: RgbImage::new(512, 288),
                reward: 0.1,
                terminal: self.tick > self.length,
            })
        }
    }

    #[test]
    fn test_average_over_fresh_episodes() {
        let net = QNetwork::new(&Device::Cpu).unwrap();
        let mut game = FixedLength {
            length: 3,
            tick: 0,
            resets: 0,
        };
        let stats = run_eval(&net, &mut game, 5, 100).unwrap();
        assert_eq!(stats.episodes, 5);
        assert_eq!(stats.avg_time_step, 3.0);
        assert_eq!(game.resets, 5);
    }

    #[test]
    fn test_episode_capped_at_max_steps() {
        let net = QNetwork::new(&Device::Cpu).unwrap();
        let mut game = FixedLength {
            length: u64::MAX - 1,
            tick: 0,
            resets: 0,
        };
        assert_eq!(play_episode(&net, &mut game, 7).unwrap(), 7);
    }
}
