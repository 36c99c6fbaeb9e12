use std::collections::VecDeque;

use anyhow::Result;
use image::{Rgb, RgbImage};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

// =============================================================================
// Action Space
// =============================================================================

/// Index 0 flaps, index 1 lets the bird fall. Matches the one-hot layout the
/// network is trained against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Action {
    Flap = 0,
    Idle = 1,
}

impl Action {
    pub const COUNT: usize = 2;

    pub fn from_index(i: usize) -> Self {
        match i {
            0 => Action::Flap,
            1 => Action::Idle,
            _ => panic!("action index {i} out of range (COUNT = {})", Self::COUNT),
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn one_hot(self) -> [f32; Action::COUNT] {
        let mut v = [0.0; Action::COUNT];
        v[self.index()] = 1.0;
        v
    }
}

// =============================================================================
// Game Collaborator
// =============================================================================

pub struct StepOutcome {
    pub frame: RgbImage,
    pub reward: f32,
    pub terminal: bool,
}

/// A game the agent can be trained on. Calls are synchronous; the loop
/// blocks until each returns.
pub trait Game {
    /// Start a fresh round.
    fn reset(&mut self) -> Result<()>;

    /// Advance one tick with `action` held.
    fn step(&mut self, action: Action) -> Result<StepOutcome>;
}

// =============================================================================
// Built-in pipe game
// =============================================================================

pub struct EnvConfig {
    pub screen_width: u32,
    pub screen_height: u32,
    pub ground_height: u32,
    pub bird_x: f32,
    pub bird_width: f32,
    pub bird_height: f32,
    pub gravity: f32,
    pub flap_velocity: f32,
    pub max_fall_speed: f32,
    pub pipe_width: f32,
    pub pipe_gap: f32,
    pub pipe_spacing: f32,
    pub pipe_speed: f32,
    pub gap_margin: f32,
    pub alive_reward: f32,
    pub pass_reward: f32,
    pub crash_reward: f32,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            screen_width: 512,
            screen_height: 288,
            ground_height: 40,
            bird_x: 80.0,
            bird_width: 20.0,
            bird_height: 14.0,
            gravity: 0.6,
            flap_velocity: -5.0,
            max_fall_speed: 6.0,
            pipe_width: 40.0,
            pipe_gap: 72.0,
            pipe_spacing: 180.0,
            pipe_speed: 4.0,
            gap_margin: 24.0,
            alive_reward: 0.1,
            pass_reward: 1.0,
            crash_reward: -1.0,
        }
    }
}

const SKY: Rgb<u8> = Rgb([0, 0, 0]);
const PIPE: Rgb<u8> = Rgb([84, 192, 44]);
const GROUND: Rgb<u8> = Rgb([222, 216, 149]);
const BIRD: Rgb<u8> = Rgb([250, 200, 40]);

struct Pipe {
    x: f32,
    gap_top: f32,
    passed: bool,
}

/// Side-scrolling obstacle game rendered as 512×288 RGB frames.
///
/// Stepping a crashed game starts a new round first, so a caller that never
/// calls `reset` still sees an endless sequence of rounds.
pub struct FlappyEnv {
    config: EnvConfig,
    bird_y: f32,
    bird_vel: f32,
    pipes: VecDeque<Pipe>,
    crashed: bool,
    pub score: u32,
    rng: SmallRng,
}

impl FlappyEnv {
    pub fn new(config: EnvConfig) -> Self {
        Self::with_rng(config, SmallRng::from_os_rng())
    }

    pub fn with_seed(config: EnvConfig, seed: u64) -> Self {
        Self::with_rng(config, SmallRng::seed_from_u64(seed))
    }

    fn with_rng(config: EnvConfig, rng: SmallRng) -> Self {
        let mut env = Self {
            config,
            bird_y: 0.0,
            bird_vel: 0.0,
            pipes: VecDeque::new(),
            crashed: false,
            score: 0,
            rng,
        };
        env.start_round();
        env
    }

    fn ground_y(&self) -> f32 {
        (self.config.screen_height - self.config.ground_height) as f32
    }

    fn start_round(&mut self) {
        self.bird_y = self.ground_y() * 0.4;
        self.bird_vel = 0.0;
        self.crashed = false;
        self.score = 0;
        self.pipes.clear();
        let first_x = self.config.screen_width as f32 * 0.75;
        self.spawn_pipe(first_x);
        self.spawn_pipe(first_x + self.config.pipe_spacing);
    }

    fn spawn_pipe(&mut self, x: f32) {
        let lo = self.config.gap_margin;
        let hi = (self.ground_y() - self.config.pipe_gap - self.config.gap_margin).max(lo + 1.0);
        let gap_top = self.rng.random_range(lo..hi);
        self.pipes.push_back(Pipe {
            x,
            gap_top,
            passed: false,
        });
    }

    fn collides(&self) -> bool {
        let c = &self.config;
        if self.bird_y + c.bird_height >= self.ground_y() {
            return true;
        }
        let (left, right) = (c.bird_x, c.bird_x + c.bird_width);
        let (top, bottom) = (self.bird_y, self.bird_y + c.bird_height);
        self.pipes.iter().any(|p| {
            let overlaps_x = right > p.x && left < p.x + c.pipe_width;
            overlaps_x && (top < p.gap_top || bottom > p.gap_top + c.pipe_gap)
        })
    }

    fn render(&self) -> RgbImage {
        let c = &self.config;
        let mut img = RgbImage::from_pixel(c.screen_width, c.screen_height, SKY);
        let ground_y = self.ground_y();
        for p in &self.pipes {
            fill_rect(&mut img, p.x, 0.0, c.pipe_width, p.gap_top, PIPE);
            let lower = p.gap_top + c.pipe_gap;
            fill_rect(&mut img, p.x, lower, c.pipe_width, ground_y - lower, PIPE);
        }
        fill_rect(
            &mut img,
            0.0,
            ground_y,
            c.screen_width as f32,
            c.ground_height as f32,
            GROUND,
        );
        fill_rect(&mut img, c.bird_x, self.bird_y, c.bird_width, c.bird_height, BIRD);
        img
    }
}

impl Game for FlappyEnv {
    fn reset(&mut self) -> Result<()> {
        self.start_round();
        Ok(())
    }

    fn step(&mut self, action: Action) -> Result<StepOutcome> {
        if self.crashed {
            self.start_round();
        }
        let c = &self.config;
        self.bird_vel = match action {
            Action::Flap => c.flap_velocity,
            Action::Idle => (self.bird_vel + c.gravity).min(c.max_fall_speed),
        };
        self.bird_y = (self.bird_y + self.bird_vel).max(0.0);

        let mut reward = c.alive_reward;
        let bird_center = c.bird_x + c.bird_width / 2.0;
        let (speed, pipe_width, pass_reward) = (c.pipe_speed, c.pipe_width, c.pass_reward);
        for p in self.pipes.iter_mut() {
            p.x -= speed;
            if !p.passed && p.x + pipe_width / 2.0 < bird_center {
                p.passed = true;
                self.score += 1;
                reward = pass_reward;
            }
        }
        while self.pipes.front().is_some_and(|p| p.x + pipe_width < 0.0) {
            self.pipes.pop_front();
        }
        let last_x = self.pipes.back().map_or(0.0, |p| p.x);
        if last_x < self.config.screen_width as f32 - self.config.pipe_spacing {
            self.spawn_pipe(last_x + self.config.pipe_spacing);
        }

        let terminal = self.collides();
        if terminal {
            self.crashed = true;
            reward = self.config.crash_reward;
        }

        Ok(StepOutcome {
            frame: self.render(),
            reward,
            terminal,
        })
    }
}

fn fill_rect(img: &mut RgbImage, x: f32, y: f32, w: f32, h: f32, color: Rgb<u8>) {
    let x0 = x.max(0.0) as u32;
    let y0 = y.max(0.0) as u32;
    let x1 = ((x + w).max(0.0) as u32).min(img.width());
    let y1 = ((y + h).max(0.0) as u32).min(img.height());
    for py in y0..y1 {
        for px in x0..x1 {
            img.put_pixel(px, py, color);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_one_hot() {
        assert_eq!(Action::Flap.one_hot(), [1.0, 0.0]);
        assert_eq!(Action::Idle.one_hot(), [0.0, 1.0]);
        assert_eq!(Action::from_index(1), Action::Idle);
    }

    #[test]
    fn test_idle_bird_eventually_crashes() {
        let mut env = FlappyEnv::with_seed(EnvConfig::default(), 7);
        env.reset().unwrap();
        let mut steps = 0;
        loop {
            let out = env.step(Action::Idle).unwrap();
            steps += 1;
            assert_eq!(out.frame.dimensions(), (512, 288));
            if out.terminal {
                assert_eq!(out.reward, -1.0);
                break;
            }
            assert!(out.reward > 0.0);
            assert!(steps < 1_000, "bird never hit the ground");
        }
    }

    #[test]
    fn test_step_after_crash_starts_new_round() {
        let mut env = FlappyEnv::with_seed(EnvConfig::default(), 3);
        while !env.step(Action::Idle).unwrap().terminal {}
        let out = env.step(Action::Flap).unwrap();
        assert!(!out.terminal);
        assert_eq!(env.score, 0);
    }
}
