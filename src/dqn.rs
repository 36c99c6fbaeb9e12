use anyhow::{Context, Result, anyhow, bail};
use candle_core::backprop::GradStore;
use candle_core::{D, DType, Device, Tensor, Var};
use candle_nn::{Conv2d, Conv2dConfig, Linear, Module, Optimizer, VarBuilder, VarMap};

use crate::checkpoint::NamedTensor;
use crate::env::Action;
use crate::preprocess::State;
use crate::replay::BatchTensors;
use crate::{FRAME_HEIGHT, FRAME_WIDTH, STACK_SIZE};

// =============================================================================
// DQN Neural Network (candle)
// =============================================================================

const CONV3_CHANNELS: usize = 64;
// Spatial size after the conv stack on a 72×128 input.
const FEATURE_HEIGHT: usize = 9;
const FEATURE_WIDTH: usize = 16;
const HIDDEN_SIZE: usize = 256;

/// Conv Q-network.
/// Input: (B, STACK_SIZE, FRAME_HEIGHT, FRAME_WIDTH) → Action::COUNT Q-values
pub struct DqnNet {
    conv1: Conv2d,
    conv2: Conv2d,
    conv3: Conv2d,
    fc1: Linear,
    fc2: Linear,
}

impl DqnNet {
    pub fn new(vs: VarBuilder) -> Result<Self> {
        let conv1 = candle_nn::conv2d(
            STACK_SIZE,
            32,
            8,
            Conv2dConfig {
                padding: 2,
                stride: 4,
                ..Default::default()
            },
            vs.pp("conv1"),
        )?;
        let conv2 = candle_nn::conv2d(
            32,
            64,
            4,
            Conv2dConfig {
                padding: 1,
                stride: 2,
                ..Default::default()
            },
            vs.pp("conv2"),
        )?;
        let conv3 = candle_nn::conv2d(
            64,
            CONV3_CHANNELS,
            3,
            Conv2dConfig {
                padding: 1,
                stride: 1,
                ..Default::default()
            },
            vs.pp("conv3"),
        )?;
        let fc1 = candle_nn::linear(
            CONV3_CHANNELS * FEATURE_HEIGHT * FEATURE_WIDTH,
            HIDDEN_SIZE,
            vs.pp("fc1"),
        )?;
        let fc2 = candle_nn::linear(HIDDEN_SIZE, Action::COUNT, vs.pp("fc2"))?;

        Ok(Self {
            conv1,
            conv2,
            conv3,
            fc1,
            fc2,
        })
    }

    /// Forward pass: state batch → Q-values for all actions
    pub fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let h = self.conv1.forward(x)?.relu()?;
        let h = self.conv2.forward(&h)?.relu()?;
        let h = self.conv3.forward(&h)?.relu()?;
        let h = h.flatten_from(1)?;
        let h = self.fc1.forward(&h)?.relu()?;
        self.fc2.forward(&h)
    }
}

// =============================================================================
// RMSProp
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct ParamsRmsProp {
    pub lr: f64,
    pub alpha: f64,
    pub eps: f64,
}

impl Default for ParamsRmsProp {
    fn default() -> Self {
        Self {
            lr: 1e-2,
            alpha: 0.99,
            eps: 1e-8,
        }
    }
}

struct VarRmsProp {
    var: Var,
    square_avg: Var,
}

/// Plain RMSProp (no momentum, not centered):
/// v ← αv + (1-α)g², θ ← θ - lr·g / (√v + ε)
pub struct RmsProp {
    vars: Vec<VarRmsProp>,
    params: ParamsRmsProp,
}

impl Optimizer for RmsProp {
    type Config = ParamsRmsProp;

    fn new(vars: Vec<Var>, params: ParamsRmsProp) -> candle_core::Result<Self> {
        let vars = vars
            .into_iter()
            .filter(|var| var.dtype().is_float())
            .map(|var| {
                let square_avg = Var::zeros(var.shape(), var.dtype(), var.device())?;
                Ok(VarRmsProp { var, square_avg })
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self { vars, params })
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        let ParamsRmsProp { lr, alpha, eps } = self.params;
        for var in self.vars.iter() {
            let theta = &var.var;
            let v = &var.square_avg;
            if let Some(g) = grads.get(theta) {
                let next_v = ((v.as_tensor() * alpha)? + (g.sqr()? * (1.0 - alpha))?)?;
                let adjusted_grad = (g / (next_v.sqrt()? + eps)?)?;
                let next_theta = (theta.as_tensor() - (adjusted_grad * lr)?)?;
                v.set(&next_v)?;
                theta.set(&next_theta)?;
            }
        }
        Ok(())
    }
}

// =============================================================================
// Targets
// =============================================================================

/// y = r + γ·max_a Q(s', a)·(1 - terminal). Terminal rows reduce to exactly r.
pub fn bootstrap_targets(
    rewards: &Tensor,
    next_q_max: &Tensor,
    not_terminals: &Tensor,
    gamma: f64,
) -> candle_core::Result<Tensor> {
    let discounted = next_q_max.affine(gamma, 0.0)?;
    rewards.add(&discounted.mul(not_terminals)?)
}

// =============================================================================
// Q-Network
// =============================================================================

#[cfg(target_os = "macos")]
fn with_autorelease_pool<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    objc::rc::autoreleasepool(f)
}

#[cfg(not(target_os = "macos"))]
fn with_autorelease_pool<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    f()
}

/// The Q-network plus its parameters. There is no separate target network:
/// bootstrap targets come from the same weights being trained.
pub struct QNetwork {
    pub varmap: VarMap,
    net: DqnNet,
    device: Device,
}

impl QNetwork {
    pub fn new(device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let net = DqnNet::new(vb)?;
        Ok(Self {
            varmap,
            net,
            device: device.clone(),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(self.net.forward(x)?)
    }

    pub fn q_values(&self, state: &State) -> Result<Vec<f32>> {
        let s = Tensor::from_vec(
            state.to_vec(),
            (1, STACK_SIZE, FRAME_HEIGHT, FRAME_WIDTH),
            &self.device,
        )?;
        let q = self.net.forward(&s)?;
        Ok(q.squeeze(0)?.to_vec1::<f32>()?)
    }

    pub fn optimizer(&self, lr: f64) -> Result<RmsProp> {
        let params = ParamsRmsProp {
            lr,
            ..Default::default()
        };
        Ok(RmsProp::new(self.varmap.all_vars(), params)?)
    }

    /// Bootstrapped targets for a minibatch, detached from the graph.
    pub fn targets(&self, batch: &BatchTensors, gamma: f64) -> Result<Tensor> {
        let next_q_max = self.net.forward(&batch.next_states)?.max(D::Minus1)?;
        let y = bootstrap_targets(&batch.rewards, &next_q_max, &batch.not_terminals, gamma)?;
        Ok(y.detach())
    }

    /// One gradient step on the MSE between targets and Q(s, a_taken).
    pub fn train_step(
        &self,
        optimizer: &mut RmsProp,
        batch: &BatchTensors,
        gamma: f64,
    ) -> Result<f32> {
        with_autorelease_pool(|| {
            let y = self.targets(batch, gamma)?;
            let q_all = self.net.forward(&batch.states)?;
            let q_taken = q_all.mul(&batch.action_masks)?.sum(D::Minus1)?;
            let loss = candle_nn::loss::mse(&q_taken, &y)?;
            optimizer.backward_step(&loss)?;
            loss.to_scalar::<f32>().map_err(Into::into)
        })
    }

    /// Parameters as flat CPU tensors, sorted by name.
    pub fn state_dict(&self) -> Result<Vec<NamedTensor>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| anyhow!("Failed to lock varmap for snapshot"))?;
        let mut entries = Vec::with_capacity(data.len());
        for (name, var) in data.iter() {
            let tensor = var.as_tensor().to_device(&Device::Cpu)?.detach();
            entries.push(NamedTensor {
                name: name.clone(),
                shape: tensor.dims().to_vec(),
                data: tensor.flatten_all()?.to_vec1::<f32>()?,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Overwrite every parameter from `state_dict`. Names and shapes must
    /// match this network exactly.
    pub fn load_state_dict(&self, state_dict: &[NamedTensor]) -> Result<()> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| anyhow!("Failed to lock varmap for load"))?;
        if state_dict.len() != data.len() {
            bail!(
                "state dict holds {} tensors, network has {}",
                state_dict.len(),
                data.len()
            );
        }
        for entry in state_dict {
            let var = data
                .get(&entry.name)
                .ok_or_else(|| anyhow!("unexpected tensor {} in state dict", entry.name))?;
            if var.dims() != entry.shape.as_slice() {
                bail!(
                    "tensor {} has shape {:?}, network expects {:?}",
                    entry.name,
                    entry.shape,
                    var.dims()
                );
            }
            let t = Tensor::from_slice(&entry.data, entry.shape.as_slice(), &self.device)
                .with_context(|| format!("Failed to rebuild tensor {}", entry.name))?;
            var.set(&t)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::textured_state;
    use crate::replay::Transition;

    #[test]
    fn test_forward_shape() {
        let net = QNetwork::new(&Device::Cpu).unwrap();
        let x = Tensor::zeros((3, STACK_SIZE, FRAME_HEIGHT, FRAME_WIDTH), DType::F32, &Device::Cpu)
            .unwrap();
        assert_eq!(net.forward(&x).unwrap().dims(), &[3, Action::COUNT]);
        assert_eq!(net.q_values(&State::blank()).unwrap().len(), Action::COUNT);
    }

    #[test]
    fn test_terminal_target_is_reward() {
        let dev = Device::Cpu;
        let rewards = Tensor::new(&[0.1f32, -1.0, 0.5], &dev).unwrap();
        let next_q = Tensor::new(&[123.0f32, -7.5, 2.0], &dev).unwrap();
        let not_terminals = Tensor::new(&[0.0f32, 0.0, 1.0], &dev).unwrap();
        let y = bootstrap_targets(&rewards, &next_q, &not_terminals, 0.99)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(y[0], 0.1);
        assert_eq!(y[1], -1.0);
        assert!((y[2] - (0.5 + 0.99 * 2.0)).abs() < 1e-6);
    }

    #[test]
    fn test_targets_use_current_weights() {
        let net = QNetwork::new(&Device::Cpu).unwrap();
        let t = Transition {
            state: State::blank(),
            action: Action::Flap,
            reward: 0.25,
            next_state: State::blank(),
            terminal: false,
        };
        let mut done = t.clone();
        done.terminal = true;
        let batch = BatchTensors::from_transitions(&[&t, &done], &Device::Cpu).unwrap();
        let y = net.targets(&batch, 0.99).unwrap().to_vec1::<f32>().unwrap();

        let q = net.q_values(&State::blank()).unwrap();
        let max_q = q.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        assert!((y[0] - (0.25 + 0.99 * max_q)).abs() < 1e-5);
        assert_eq!(y[1], 0.25);
    }

    #[test]
    fn test_train_step_moves_weights() {
        let net = QNetwork::new(&Device::Cpu).unwrap();
        let mut opt = net.optimizer(1e-3).unwrap();
        let before = net.state_dict().unwrap();
        let t = Transition {
            state: State::blank(),
            action: Action::Idle,
            reward: 1.0,
            next_state: State::blank(),
            terminal: true,
        };
        let batch = BatchTensors::from_transitions(&[&t, &t], &Device::Cpu).unwrap();
        let loss = net.train_step(&mut opt, &batch, 0.99).unwrap();
        assert!(loss.is_finite());
        let after = net.state_dict().unwrap();
        assert!(before.iter().zip(&after).any(|(a, b)| a.data != b.data));
    }

    #[test]
    fn test_state_dict_round_trip() {
        let a = QNetwork::new(&Device::Cpu).unwrap();
        let b = QNetwork::new(&Device::Cpu).unwrap();
        let state = textured_state();
        assert_ne!(a.q_values(&state).unwrap(), b.q_values(&state).unwrap());

        b.load_state_dict(&a.state_dict().unwrap()).unwrap();
        assert_eq!(a.state_dict().unwrap(), b.state_dict().unwrap());
        assert_eq!(a.q_values(&state).unwrap(), b.q_values(&state).unwrap());
    }

    #[test]
    fn test_conv_weights_change_outputs_on_textured_input() {
        let a = QNetwork::new(&Device::Cpu).unwrap();
        let b = QNetwork::new(&Device::Cpu).unwrap();
        let mut dict = a.state_dict().unwrap();
        let conv1 = dict.iter_mut().find(|t| t.name == "conv1.weight").unwrap();
        conv1.data.iter_mut().for_each(|w| *w += 0.5);
        b.load_state_dict(&dict).unwrap();

        let state = textured_state();
        assert_ne!(a.q_values(&state).unwrap(), b.q_values(&state).unwrap());
    }

    #[test]
    fn test_load_rejects_unknown_name() {
        let net = QNetwork::new(&Device::Cpu).unwrap();
        let mut dict = net.state_dict().unwrap();
        dict[0].name = "conv9.weight".to_string();
        let err = net.load_state_dict(&dict).unwrap_err();
        assert!(err.to_string().contains("conv9.weight"));
    }

    #[test]
    fn test_load_rejects_wrong_shape() {
        let net = QNetwork::new(&Device::Cpu).unwrap();
        let mut dict = net.state_dict().unwrap();
        dict[0].shape.push(1);
        assert!(net.load_state_dict(&dict).is_err());
    }
}
