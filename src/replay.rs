use std::collections::VecDeque;

use anyhow::Result;
use candle_core::{Device, Tensor};
use rand::Rng;

use crate::env::Action;
use crate::error::TrainError;
use crate::preprocess::State;
use crate::{FRAME_HEIGHT, FRAME_PIXELS, FRAME_WIDTH, STACK_SIZE};

// =============================================================================
// Experience Replay Memory
// =============================================================================

#[derive(Debug, Clone)]
pub struct Transition {
    pub state: State,
    pub action: Action,
    pub reward: f32,
    pub next_state: State,
    pub terminal: bool,
}

/// Bounded FIFO of transitions. Once full, every push evicts the oldest entry.
pub struct ReplayMemory {
    buffer: VecDeque<Transition>,
    capacity: usize,
}

impl ReplayMemory {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, t: Transition) {
        if self.buffer.len() >= self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(t);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Transition> {
        self.buffer.iter()
    }

    /// Draw `k` distinct transitions uniformly at random. Order is arbitrary.
    pub fn sample<R: Rng + ?Sized>(&self, k: usize, rng: &mut R) -> Result<Vec<&Transition>> {
        let len = self.buffer.len();
        if k > len {
            return Err(TrainError::Config(format!(
                "cannot sample {k} transitions from a replay memory holding {len}"
            ))
            .into());
        }
        Ok(rand::seq::index::sample(rng, len, k)
            .into_iter()
            .map(|idx| &self.buffer[idx])
            .collect())
    }
}

/// A minibatch laid out for the network.
pub struct BatchTensors {
    /// `(B, STACK_SIZE, FRAME_HEIGHT, FRAME_WIDTH)`
    pub states: Tensor,
    /// One-hot `(B, Action::COUNT)`
    pub action_masks: Tensor,
    pub rewards: Tensor,
    pub next_states: Tensor,
    /// 1.0 for non-terminal transitions, 0.0 for terminal ones.
    pub not_terminals: Tensor,
}

impl BatchTensors {
    pub fn from_transitions(batch: &[&Transition], dev: &Device) -> Result<Self> {
        let n = batch.len();
        let mut states = Vec::with_capacity(n * STACK_SIZE * FRAME_PIXELS);
        let mut next_states = Vec::with_capacity(n * STACK_SIZE * FRAME_PIXELS);
        let mut masks = Vec::with_capacity(n * Action::COUNT);
        let mut rewards = Vec::with_capacity(n);
        let mut not_terminals = Vec::with_capacity(n);

        for t in batch {
            t.state.extend_into(&mut states);
            t.next_state.extend_into(&mut next_states);
            masks.extend_from_slice(&t.action.one_hot());
            rewards.push(t.reward);
            not_terminals.push(if t.terminal { 0.0f32 } else { 1.0f32 });
        }

        let shape = (n, STACK_SIZE, FRAME_HEIGHT, FRAME_WIDTH);
        Ok(Self {
            states: Tensor::from_vec(states, shape, dev)?,
            action_masks: Tensor::from_vec(masks, (n, Action::COUNT), dev)?,
            rewards: Tensor::from_vec(rewards, n, dev)?,
            next_states: Tensor::from_vec(next_states, shape, dev)?,
            not_terminals: Tensor::from_vec(not_terminals, n, dev)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;
    use std::collections::HashSet;

    fn transition(reward: f32) -> Transition {
        Transition {
            state: State::blank(),
            action: Action::Idle,
            reward,
            next_state: State::blank(),
            terminal: false,
        }
    }

    #[test]
    fn test_fifo_eviction() {
        let capacity = 5;
        let mut memory = ReplayMemory::new(capacity);
        for i in 0..12 {
            memory.push(transition(i as f32));
        }
        assert_eq!(memory.len(), capacity);
        let kept: Vec<f32> = memory.iter().map(|t| t.reward).collect();
        assert_eq!(kept, vec![7.0, 8.0, 9.0, 10.0, 11.0]);
    }

    #[test]
    fn test_sample_is_without_replacement() {
        let mut memory = ReplayMemory::new(10);
        for i in 0..10 {
            memory.push(transition(i as f32));
        }
        let mut rng = SmallRng::seed_from_u64(11);
        let batch = memory.sample(10, &mut rng).unwrap();
        let distinct: HashSet<u32> = batch.iter().map(|t| t.reward as u32).collect();
        assert_eq!(distinct.len(), 10);
    }

    #[test]
    fn test_sample_larger_than_memory_is_rejected() {
        let mut memory = ReplayMemory::new(10);
        memory.push(transition(0.0));
        let mut rng = SmallRng::seed_from_u64(0);
        let err = memory.sample(2, &mut rng).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TrainError>(),
            Some(TrainError::Config(_))
        ));
    }

    #[test]
    fn test_batch_layout() {
        let mut memory = ReplayMemory::new(4);
        let mut t = transition(0.5);
        t.action = Action::Flap;
        t.terminal = true;
        memory.push(t);
        memory.push(transition(0.1));

        let batch: Vec<&Transition> = memory.iter().collect();
        let tensors = BatchTensors::from_transitions(&batch, &Device::Cpu).unwrap();
        assert_eq!(
            tensors.states.dims(),
            &[2, STACK_SIZE, FRAME_HEIGHT, FRAME_WIDTH]
        );
        assert_eq!(
            tensors.action_masks.to_vec2::<f32>().unwrap(),
            vec![vec![1.0, 0.0], vec![0.0, 1.0]]
        );
        assert_eq!(
            tensors.not_terminals.to_vec1::<f32>().unwrap(),
            vec![0.0, 1.0]
        );
    }
}
