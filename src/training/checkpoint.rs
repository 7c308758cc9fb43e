//! Best-validation checkpoints in safetensors format.
//!
//! One file holds the model tensors (`encoder.*`, `classifier.*`,
//! `propagation.*`), the optimizer moments (`optimizer.*`) and a string
//! metadata header with the epoch, score and schedule position. Saves go
//! through a temporary sibling that is renamed over the previous file, so a
//! failed write never clobbers the last good checkpoint.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use chrono::{DateTime, Utc};
use safetensors::SafeTensors;
use tracing::{debug, info, warn};

use crate::error::{TrainError, TrainResult};
use crate::model::{Component, HybridModel};
use crate::training::optimizer::GroupedAdam;

pub const CHECKPOINT_FILE: &str = "checkpoint.safetensors";

/// Scalar state stored next to the tensors.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointInfo {
    pub epoch: usize,
    pub best_val_acc: f64,
    pub saved_at: DateTime<Utc>,
    pub optimizer_steps: usize,
    pub lr_epoch: usize,
}

impl CheckpointInfo {
    fn to_metadata(&self) -> HashMap<String, String> {
        HashMap::from([
            ("epoch".to_string(), self.epoch.to_string()),
            ("best_val_acc".to_string(), self.best_val_acc.to_string()),
            ("saved_at".to_string(), self.saved_at.to_rfc3339()),
            ("optimizer_steps".to_string(), self.optimizer_steps.to_string()),
            ("lr_epoch".to_string(), self.lr_epoch.to_string()),
        ])
    }

    fn from_metadata(path: &Path, metadata: &HashMap<String, String>) -> TrainResult<Self> {
        let field = |key: &str| {
            metadata
                .get(key)
                .ok_or_else(|| TrainError::checkpoint(path, format!("missing metadata '{}'", key)))
        };
        let parse_err = |key: &str| TrainError::checkpoint(path, format!("bad metadata '{}'", key));

        Ok(Self {
            epoch: field("epoch")?.parse().map_err(|_| parse_err("epoch"))?,
            best_val_acc: field("best_val_acc")?
                .parse()
                .map_err(|_| parse_err("best_val_acc"))?,
            saved_at: DateTime::parse_from_rfc3339(field("saved_at")?)
                .map_err(|_| parse_err("saved_at"))?
                .with_timezone(&Utc),
            optimizer_steps: field("optimizer_steps")?
                .parse()
                .map_err(|_| parse_err("optimizer_steps"))?,
            lr_epoch: field("lr_epoch")?.parse().map_err(|_| parse_err("lr_epoch"))?,
        })
    }
}

/// Everything a checkpoint persists.
pub struct CheckpointState<'a> {
    pub model: &'a HybridModel,
    pub optimizer: &'a GroupedAdam,
    pub info: CheckpointInfo,
}

/// Write `state` to `path` through a temporary sibling and a rename.
pub fn save(state: &CheckpointState<'_>, path: &Path) -> TrainResult<()> {
    let mut tensors: Vec<(String, Tensor)> = Vec::new();
    for component in Component::ALL {
        tensors.extend(state.model.params().named_tensors(component)?);
    }
    tensors.extend(state.optimizer.state_tensors());
    // safetensors serializes from host memory
    let tensors = tensors
        .into_iter()
        .map(|(name, tensor)| Ok((name, tensor.to_device(&Device::Cpu)?.contiguous()?)))
        .collect::<TrainResult<Vec<_>>>()?;

    let tmp = tmp_sibling(path);
    let metadata = Some(state.info.to_metadata());
    if let Err(e) = safetensors::serialize_to_file(tensors, &metadata, &tmp) {
        let _ = std::fs::remove_file(&tmp);
        return Err(TrainError::checkpoint(path, e));
    }
    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        TrainError::checkpoint(path, e)
    })?;
    debug!(path = %path.display(), epoch = state.info.epoch, "Wrote checkpoint");
    Ok(())
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Read only the metadata header of a checkpoint.
pub fn read_info(path: &Path) -> TrainResult<CheckpointInfo> {
    let data = std::fs::read(path).map_err(|e| TrainError::checkpoint(path, e))?;
    let (_, header) = SafeTensors::read_metadata(&data).map_err(|e| TrainError::checkpoint(path, e))?;
    let metadata = header
        .metadata()
        .as_ref()
        .ok_or_else(|| TrainError::checkpoint(path, "no metadata header"))?;
    CheckpointInfo::from_metadata(path, metadata)
}

/// Warm-start: restore encoder and classifier weights from `path`.
///
/// Propagation weights and optimizer state in the file are ignored.
pub fn load(path: &Path, model: &HybridModel) -> TrainResult<usize> {
    let wanted = [Component::Encoder, Component::Classifier];
    let tensors: HashMap<String, Tensor> = candle_core::safetensors::load(path, &Device::Cpu)
        .map_err(|e| TrainError::checkpoint(path, e))?
        .into_iter()
        .filter(|(name, _)| {
            wanted
                .iter()
                .any(|c| name.starts_with(&format!("{}.", c.prefix())))
        })
        .collect();

    let restored = model
        .params()
        .load_components(&wanted, &tensors)
        .map_err(|e| TrainError::checkpoint(path, e))?;
    info!(path = %path.display(), tensors = restored, "Restored encoder and classifier");
    Ok(restored)
}

// ============================================================================
// Manager
// ============================================================================

/// Tracks the best validation accuracy. Starts at 0.0; only a strictly
/// higher score counts as an improvement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestScore {
    best: f64,
}

impl Default for BestScore {
    fn default() -> Self {
        Self { best: 0.0 }
    }
}

impl BestScore {
    pub fn best(&self) -> f64 {
        self.best
    }

    /// Record `score`; true when it beats the best so far.
    pub fn observe(&mut self, score: f64) -> bool {
        if score > self.best {
            self.best = score;
            true
        } else {
            false
        }
    }
}

/// Owns the checkpoint directory and the "last best" file in it.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>) -> TrainResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| TrainError::checkpoint(&dir, e))?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_FILE)
    }

    pub fn save(&self, state: &CheckpointState<'_>) -> TrainResult<PathBuf> {
        let path = self.path();
        if path.exists() {
            debug!(path = %path.display(), "Replacing previous checkpoint");
        }
        save(state, &path)?;
        Ok(path)
    }

    /// Metadata of the current best checkpoint, if one has been written.
    pub fn latest(&self) -> Option<CheckpointInfo> {
        let path = self.path();
        if !path.exists() {
            return None;
        }
        match read_info(&path) {
            Ok(info) => Some(info),
            Err(e) => {
                warn!(error = %e, "Unreadable checkpoint");
                None
            }
        }
    }
}
