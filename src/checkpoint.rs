use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::dqn::QNetwork;
use crate::error::TrainError;

pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;
pub const BEST_MODEL_FILE: &str = "model_best.ckpt";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub episode: u64,
    pub epsilon: f64,
    pub best_time_step: Option<f64>,
    pub time_step: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub format_version: u32,
    pub meta: CheckpointMeta,
    pub state_dict: Vec<NamedTensor>,
}

impl Checkpoint {
    pub fn capture(net: &QNetwork, meta: CheckpointMeta) -> Result<Self> {
        Ok(Self {
            format_version: CHECKPOINT_FORMAT_VERSION,
            meta,
            state_dict: net.state_dict()?,
        })
    }

    /// Copy the stored weights into `net`.
    pub fn restore_into(&self, net: &QNetwork, path: &Path) -> Result<()> {
        net.load_state_dict(&self.state_dict)
            .map_err(|e| TrainError::checkpoint(path, format!("{e:#}")).into())
    }

    fn validate(&self, path: &Path) -> Result<(), TrainError> {
        if self.format_version != CHECKPOINT_FORMAT_VERSION {
            return Err(TrainError::checkpoint(
                path,
                format!(
                    "unsupported format version {} (expected {CHECKPOINT_FORMAT_VERSION})",
                    self.format_version
                ),
            ));
        }
        if self.meta.best_time_step.is_none() && self.meta.time_step.is_none() {
            return Err(TrainError::checkpoint(
                path,
                "neither best_time_step nor time_step is present",
            ));
        }
        if self.state_dict.is_empty() {
            return Err(TrainError::checkpoint(path, "state_dict is empty"));
        }
        for t in &self.state_dict {
            let expected: usize = t.shape.iter().product();
            if expected != t.data.len() {
                return Err(TrainError::checkpoint(
                    path,
                    format!(
                        "tensor {} has {} values but shape {:?}",
                        t.name,
                        t.data.len(),
                        t.shape
                    ),
                ));
            }
        }
        Ok(())
    }
}

/// Read and validate a checkpoint file.
pub fn load<P: AsRef<Path>>(path: P) -> Result<Checkpoint> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| TrainError::checkpoint(path, e.to_string()))?;
    let reader = BufReader::new(file);
    let ckpt: Checkpoint = bincode::deserialize_from(reader)
        .map_err(|e| TrainError::checkpoint(path, format!("undecodable record: {e}")))?;
    ckpt.validate(path)?;
    Ok(ckpt)
}

/// Writes checkpoints into one directory and keeps the best-model copy there.
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create checkpoint dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn episode_path(&self, episode: u64) -> PathBuf {
        self.dir.join(format!("checkpoint-episode-{episode}.ckpt"))
    }

    pub fn best_path(&self) -> PathBuf {
        self.dir.join(BEST_MODEL_FILE)
    }

    pub fn save(&self, ckpt: &Checkpoint, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create checkpoint {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(&mut writer, ckpt)?;
        writer.flush()?;
        info!(
            path = %path.display(),
            episode = ckpt.meta.episode,
            epsilon = ckpt.meta.epsilon,
            "checkpoint saved"
        );
        Ok(())
    }

    /// Byte-copy `path` to the best-model file.
    pub fn save_as_best(&self, path: &Path) -> Result<PathBuf> {
        let best = self.best_path();
        std::fs::copy(path, &best).with_context(|| {
            format!("Failed to copy {} to {}", path.display(), best.display())
        })?;
        Ok(best)
    }

    /// Save a checkpoint for `meta.episode`, and mirror it to the best-model
    /// file when `is_best`.
    pub fn save_checkpoint(&self, ckpt: &Checkpoint, is_best: bool) -> Result<PathBuf> {
        let path = self.episode_path(ckpt.meta.episode);
        self.save(ckpt, &path)?;
        if is_best {
            let best = self.save_as_best(&path)?;
            info!(path = %best.display(), "best model updated");
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::textured_state;
    use candle_core::Device;

    fn meta() -> CheckpointMeta {
        CheckpointMeta {
            episode: 300,
            epsilon: 0.8731,
            best_time_step: Some(42.4),
            time_step: None,
        }
    }

    #[test]
    fn test_round_trip_reproduces_meta_and_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let net = QNetwork::new(&Device::Cpu).unwrap();
        let ckpt = Checkpoint::capture(&net, meta()).unwrap();
        let path = store.save_checkpoint(&ckpt, true).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.meta, meta());

        let fresh = QNetwork::new(&Device::Cpu).unwrap();
        loaded.restore_into(&fresh, &path).unwrap();
        assert_eq!(net.state_dict().unwrap(), fresh.state_dict().unwrap());
        let state = textured_state();
        assert_eq!(net.q_values(&state).unwrap(), fresh.q_values(&state).unwrap());
    }

    #[test]
    fn test_restore_mismatched_shape_is_load_error() {
        let net = QNetwork::new(&Device::Cpu).unwrap();
        let mut ckpt = Checkpoint::capture(&net, meta()).unwrap();
        ckpt.state_dict[0].shape.push(1);
        let err = ckpt
            .restore_into(&net, Path::new("model_best.ckpt"))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TrainError>(),
            Some(TrainError::CheckpointLoad { .. })
        ));
    }

    #[test]
    fn test_best_file_is_byte_copy() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let net = QNetwork::new(&Device::Cpu).unwrap();
        let path = store
            .save_checkpoint(&Checkpoint::capture(&net, meta()).unwrap(), true)
            .unwrap();
        assert_eq!(
            std::fs::read(&path).unwrap(),
            std::fs::read(store.best_path()).unwrap()
        );
    }

    #[test]
    fn test_periodic_save_leaves_best_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let net = QNetwork::new(&Device::Cpu).unwrap();
        store
            .save_checkpoint(&Checkpoint::capture(&net, meta()).unwrap(), false)
            .unwrap();
        assert!(!store.best_path().exists());
    }

    #[test]
    fn test_missing_file_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(dir.path().join("nope.ckpt")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TrainError>(),
            Some(TrainError::CheckpointLoad { .. })
        ));
    }

    #[test]
    fn test_garbage_file_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.ckpt");
        std::fs::write(&path, b"not a checkpoint").unwrap();
        let err = load(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TrainError>(),
            Some(TrainError::CheckpointLoad { .. })
        ));
    }

    #[test]
    fn test_missing_time_step_keys_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let net = QNetwork::new(&Device::Cpu).unwrap();
        let mut m = meta();
        m.best_time_step = None;
        let path = store
            .save_checkpoint(&Checkpoint::capture(&net, m).unwrap(), false)
            .unwrap();
        let err = load(&path).unwrap_err();
        assert!(err.to_string().contains("best_time_step"));
    }
}
