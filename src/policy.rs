use anyhow::Result;
use rand::Rng;

use crate::dqn::QNetwork;
use crate::env::Action;
use crate::preprocess::State;

/// When the best Q-value is at or below this, or the two actions are within
/// this of each other, the greedy policy idles instead of flapping.
pub const IDLE_TIE_TOLERANCE: f32 = 1e-6;

/// Plain argmax. The first index wins exact ties.
pub fn argmax_action(q: &[f32]) -> Action {
    let mut best = 0;
    for (i, v) in q.iter().enumerate().skip(1) {
        if *v > q[best] {
            best = i;
        }
    }
    Action::from_index(best)
}

/// Greedy action for evaluation and playback, biased toward idling when the
/// network has no clear preference.
pub fn optimal_action(q: &[f32]) -> Action {
    let flap = q[Action::Flap.index()];
    let idle = q[Action::Idle.index()];
    let top = flap.max(idle);
    if top <= IDLE_TIE_TOLERANCE || (flap - idle).abs() <= IDLE_TIE_TOLERANCE {
        return Action::Idle;
    }
    argmax_action(q)
}

pub fn random_action<R: Rng + ?Sized>(rng: &mut R, flap_probability: f64) -> Action {
    if rng.random_bool(flap_probability) {
        Action::Flap
    } else {
        Action::Idle
    }
}

/// Epsilon-greedy over the network. The forward pass only runs when the
/// exploration coin says exploit.
pub struct EpsilonGreedy {
    pub flap_probability: f64,
}

impl EpsilonGreedy {
    pub fn select_action<R: Rng + ?Sized>(
        &self,
        net: &QNetwork,
        state: &State,
        epsilon: f64,
        rng: &mut R,
    ) -> Result<Action> {
        if rng.random::<f64>() < epsilon {
            Ok(random_action(rng, self.flap_probability))
        } else {
            Ok(argmax_action(&net.q_values(state)?))
        }
    }
}

impl Default for EpsilonGreedy {
    fn default() -> Self {
        Self {
            flap_probability: 0.5,
        }
    }
}

// =============================================================================
// Epsilon schedule
// =============================================================================

/// Linear per-episode decay from `init` to `floor`, then held.
#[derive(Debug, Clone, Copy)]
pub struct EpsilonSchedule {
    pub init: f64,
    pub floor: f64,
    pub decrement: f64,
}

impl EpsilonSchedule {
    pub fn new(init: f64, floor: f64, exploration_steps: u64) -> Self {
        Self {
            init,
            floor,
            decrement: (init - floor) / exploration_steps as f64,
        }
    }

    /// Epsilon after one more episode.
    pub fn anneal(&self, epsilon: f64) -> f64 {
        if epsilon > self.floor {
            (epsilon - self.decrement).max(self.floor)
        } else {
            epsilon
        }
    }

    /// Epsilon after `k` annealed episodes, computed directly.
    #[cfg(test)]
    fn after(&self, k: u64) -> f64 {
        (self.init - k as f64 * self.decrement).max(self.floor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;
    use rstest::rstest;

    #[rstest]
    #[case(&[0.3, 0.9], Action::Idle)]
    #[case(&[0.9, 0.3], Action::Flap)]
    #[case(&[0.0, 0.0], Action::Idle)]
    #[case(&[-0.2, -0.5], Action::Idle)]
    #[case(&[0.5, 0.5], Action::Idle)]
    #[case(&[5e-7, -1.0], Action::Idle)]
    fn test_optimal_action(#[case] q: &[f32], #[case] expected: Action) {
        assert_eq!(optimal_action(q), expected);
    }

    #[test]
    fn test_argmax_prefers_first_on_ties() {
        assert_eq!(argmax_action(&[0.0, 0.0]), Action::Flap);
        assert_eq!(argmax_action(&[-1.0, -0.5]), Action::Idle);
    }

    #[test]
    fn test_schedule_matches_closed_form() {
        let schedule = EpsilonSchedule::new(1.0, 0.1, 900_000);
        let d = 0.9 / 900_000.0;
        let mut eps = schedule.init;
        for k in 1..=2_000u64 {
            eps = schedule.anneal(eps);
            let expected = (1.0 - k as f64 * d).max(0.1);
            assert!((eps - expected).abs() < 1e-9);
            assert!((schedule.after(k) - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn test_schedule_never_goes_below_floor() {
        let schedule = EpsilonSchedule::new(1.0, 0.1, 7);
        let mut eps = schedule.init;
        for _ in 0..20 {
            eps = schedule.anneal(eps);
            assert!(eps >= 0.1);
        }
        assert_eq!(eps, 0.1);
        assert_eq!(schedule.after(1_000), 0.1);
    }

    #[test]
    fn test_zero_epsilon_is_greedy() {
        let net = QNetwork::new(&Device::Cpu).unwrap();
        let state = State::blank();
        let greedy = argmax_action(&net.q_values(&state).unwrap());
        let policy = EpsilonGreedy::default();
        let mut rng = SmallRng::seed_from_u64(5);
        for _ in 0..10 {
            let a = policy.select_action(&net, &state, 0.0, &mut rng).unwrap();
            assert_eq!(a, greedy);
        }
    }

    #[test]
    fn test_full_epsilon_explores_both_actions() {
        let net = QNetwork::new(&Device::Cpu).unwrap();
        let policy = EpsilonGreedy::default();
        let mut rng = SmallRng::seed_from_u64(9);
        let picks: Vec<Action> = (0..200)
            .map(|_| {
                policy
                    .select_action(&net, &State::blank(), 1.0, &mut rng)
                    .unwrap()
            })
            .collect();
        assert!(picks.contains(&Action::Flap));
        assert!(picks.contains(&Action::Idle));
    }
}
