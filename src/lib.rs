//! BertGCN-style trainer
//!
//! Transductive document classification over a fixed document/word graph:
//! - A text encoder embeds documents; a linear head predicts from that embedding
//! - A GCN or GAT propagates cached embeddings over the whole graph
//! - A staleness-managed embedding cache lets every step see all nodes while
//!   only re-encoding the mini-batch
//! - An epoch loop refreshes the cache, evaluates and keeps the best checkpoint

pub mod data;
pub mod error;
pub mod graph;
pub mod model;
pub mod training;

#[cfg(test)]
pub(crate) mod test_helpers;

use std::path::{Path, PathBuf};

use candle_core::Device;
use serde::{Deserialize, Serialize};

pub use error::{TrainError, TrainResult};
use model::PropagationKind;

// ============================================================================
// YAML config structs (deserialization targets)
// ============================================================================

/// Top-level YAML configuration file structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub data: DataConfig,
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub checkpoint: CheckpointYamlConfig,
}

/// Dataset and tokenization
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub dataset_path: PathBuf,
    /// HuggingFace `tokenizer.json`; a corpus vocabulary is built when absent
    pub tokenizer_path: Option<PathBuf>,
    pub max_length: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dataset_path: PathBuf::from("data/graph.json"),
            tokenizer_path: None,
            max_length: 128,
        }
    }
}

/// Model architecture
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub propagation: PropagationKind,
    /// Weight of the encoder head in the final prediction
    pub m: f64,
    pub layers: usize,
    pub hidden_dim: usize,
    /// GAT only
    pub heads: usize,
    pub dropout: f32,
    pub feature_dim: usize,
    pub encoder_dropout: f32,
    /// Encoder + classifier weights to warm-start from
    pub pretrained_checkpoint: Option<PathBuf>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            propagation: PropagationKind::Gcn,
            m: 0.3,
            layers: 2,
            hidden_dim: 200,
            heads: 8,
            dropout: 0.5,
            feature_dim: 768,
            encoder_dropout: 0.1,
            pretrained_checkpoint: None,
        }
    }
}

/// Compute device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[default]
    Cpu,
    Cuda,
}

impl DeviceKind {
    pub fn device(self) -> TrainResult<Device> {
        match self {
            Self::Cpu => Ok(Device::Cpu),
            Self::Cuda => Ok(Device::new_cuda(0)?),
        }
    }
}

impl std::str::FromStr for DeviceKind {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda),
            other => Err(TrainError::Config(format!("unknown device '{}'", other))),
        }
    }
}

/// Optimization schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub encoder_lr: f64,
    pub propagation_lr: f64,
    pub lr_milestones: Vec<usize>,
    pub lr_gamma: f64,
    pub refresh_batch_size: usize,
    pub seed: u64,
    pub device: DeviceKind,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 50,
            batch_size: 64,
            encoder_lr: 1e-5,
            propagation_lr: 1e-3,
            lr_milestones: vec![30],
            lr_gamma: 0.1,
            refresh_batch_size: 1024,
            seed: 42,
            device: DeviceKind::Cpu,
        }
    }
}

/// Checkpoint section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CheckpointYamlConfig {
    pub dir: PathBuf,
}

impl Default for CheckpointYamlConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./checkpoint"),
        }
    }
}

// ============================================================================
// Runtime config (what the trainer actually uses)
// ============================================================================

/// Training run configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub data: DataConfig,
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub checkpoint_dir: PathBuf,
}

impl Config {
    /// Load configuration from an optional YAML file, then override with env vars.
    ///
    /// Priority: env var > YAML > default
    ///
    /// If `yaml_path` is None, tries "config.yaml" in CWD. A missing file falls
    /// back to env vars / defaults. The result is validated.
    pub fn from_yaml_and_env(yaml_path: Option<&Path>) -> TrainResult<Self> {
        let yaml = Self::load_yaml(yaml_path);
        let mut data = yaml.data;
        let mut training = yaml.training;

        if let Ok(path) = std::env::var("BERTGCN_DATASET") {
            data.dataset_path = PathBuf::from(path);
        }
        if let Some(epochs) = env_parse("BERTGCN_EPOCHS") {
            training.epochs = epochs;
        }
        if let Some(batch_size) = env_parse("BERTGCN_BATCH_SIZE") {
            training.batch_size = batch_size;
        }
        if let Some(device) = env_parse("BERTGCN_DEVICE") {
            training.device = device;
        }

        let config = Self {
            data,
            model: yaml.model,
            training,
            checkpoint_dir: std::env::var("BERTGCN_CHECKPOINT_DIR")
                .map(PathBuf::from)
                .unwrap_or(yaml.checkpoint.dir),
        };
        config.validate()?;
        Ok(config)
    }

    /// Try to load and parse a YAML config file. Returns defaults on any failure.
    fn load_yaml(yaml_path: Option<&Path>) -> YamlConfig {
        let default_path = Path::new("config.yaml");
        let path = yaml_path.unwrap_or(default_path);

        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_yaml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                    YamlConfig::default()
                }
            },
            Err(_) => {
                tracing::debug!(
                    "No config file at {}, using env vars / defaults",
                    path.display()
                );
                YamlConfig::default()
            }
        }
    }

    /// Reject values the trainer cannot run with.
    pub fn validate(&self) -> TrainResult<()> {
        let invalid = |msg: String| Err(TrainError::Config(msg));
        let model = &self.model;
        let training = &self.training;

        if !(0.0..=1.0).contains(&model.m) {
            return invalid(format!("model.m must be within [0, 1], got {}", model.m));
        }
        if !(0.0..1.0).contains(&model.dropout) || !(0.0..1.0).contains(&model.encoder_dropout) {
            return invalid("dropout rates must be within [0, 1)".into());
        }
        for (name, value) in [
            ("data.max_length", self.data.max_length),
            ("model.layers", model.layers),
            ("model.hidden_dim", model.hidden_dim),
            ("model.heads", model.heads),
            ("model.feature_dim", model.feature_dim),
            ("training.epochs", training.epochs),
            ("training.batch_size", training.batch_size),
            ("training.refresh_batch_size", training.refresh_batch_size),
        ] {
            if value == 0 {
                return invalid(format!("{} must be positive", name));
            }
        }
        if training.encoder_lr <= 0.0 || training.propagation_lr <= 0.0 {
            return invalid("learning rates must be positive".into());
        }
        if !(training.lr_gamma > 0.0 && training.lr_gamma <= 1.0) {
            return invalid(format!(
                "training.lr_gamma must be within (0, 1], got {}",
                training.lr_gamma
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod config_tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_yaml_config_loading() {
        let yaml = r#"
data:
  dataset_path: /data/mr.json
  max_length: 64

model:
  propagation: gat
  m: 0.5
  heads: 4

training:
  epochs: 10
  lr_milestones: [5, 8]
  device: cuda

checkpoint:
  dir: /tmp/ckpt
"#;

        let config: YamlConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.data.dataset_path, PathBuf::from("/data/mr.json"));
        assert_eq!(config.data.max_length, 64);
        assert_eq!(config.model.propagation, PropagationKind::Gat);
        assert_eq!(config.model.m, 0.5);
        assert_eq!(config.model.heads, 4);
        // Unset fields keep their defaults
        assert_eq!(config.model.hidden_dim, 200);
        assert_eq!(config.training.epochs, 10);
        assert_eq!(config.training.lr_milestones, vec![5, 8]);
        assert_eq!(config.training.device, DeviceKind::Cuda);
        assert_eq!(config.training.batch_size, 64);
        assert_eq!(config.checkpoint.dir, PathBuf::from("/tmp/ckpt"));
    }

    #[test]
    fn test_defaults() {
        let config = YamlConfig::default();
        assert_eq!(config.data.max_length, 128);
        assert_eq!(config.model.propagation, PropagationKind::Gcn);
        assert_eq!(config.model.m, 0.3);
        assert_eq!(config.model.layers, 2);
        assert_eq!(config.model.dropout, 0.5);
        assert_eq!(config.training.epochs, 50);
        assert_eq!(config.training.encoder_lr, 1e-5);
        assert_eq!(config.training.propagation_lr, 1e-3);
        assert_eq!(config.training.lr_milestones, vec![30]);
        assert_eq!(config.training.refresh_batch_size, 1024);
        assert_eq!(config.checkpoint.dir, PathBuf::from("./checkpoint"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let base = Config {
            data: DataConfig::default(),
            model: ModelConfig::default(),
            training: TrainingConfig::default(),
            checkpoint_dir: PathBuf::from("ckpt"),
        };
        assert!(base.validate().is_ok());

        let mut config = base.clone();
        config.model.m = 1.2;
        assert!(matches!(config.validate(), Err(TrainError::Config(_))));

        let mut config = base.clone();
        config.training.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.model.layers = 0;
        assert!(config.validate().is_err());

        let mut config = base;
        config.training.encoder_lr = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_device_kind_parsing() {
        assert_eq!("CPU".parse::<DeviceKind>().unwrap(), DeviceKind::Cpu);
        assert_eq!("cuda".parse::<DeviceKind>().unwrap(), DeviceKind::Cuda);
        assert!("tpu".parse::<DeviceKind>().is_err());
    }

    /// Single test for the full env-var lifecycle. Env vars are process-global,
    /// so splitting this up would race under the parallel test runner.
    #[test]
    fn test_config_yaml_and_env_lifecycle() {
        let env_keys = [
            "BERTGCN_DATASET",
            "BERTGCN_CHECKPOINT_DIR",
            "BERTGCN_EPOCHS",
            "BERTGCN_BATCH_SIZE",
            "BERTGCN_DEVICE",
        ];
        let clear_env = || {
            for key in &env_keys {
                std::env::remove_var(key);
            }
        };

        // --- Phase 1: YAML values loaded correctly ---
        let yaml = r#"
data:
  dataset_path: /yaml/graph.json
training:
  epochs: 7
  batch_size: 16
checkpoint:
  dir: /yaml/ckpt
"#;
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("config.yaml");
        let mut file = std::fs::File::create(&file_path).unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        clear_env();

        let config = Config::from_yaml_and_env(Some(&file_path)).unwrap();
        assert_eq!(config.data.dataset_path, PathBuf::from("/yaml/graph.json"));
        assert_eq!(config.training.epochs, 7);
        assert_eq!(config.training.batch_size, 16);
        assert_eq!(config.checkpoint_dir, PathBuf::from("/yaml/ckpt"));

        // --- Phase 2: Env vars override YAML ---
        std::env::set_var("BERTGCN_EPOCHS", "3");
        std::env::set_var("BERTGCN_CHECKPOINT_DIR", "/env/ckpt");

        let config = Config::from_yaml_and_env(Some(&file_path)).unwrap();
        assert_eq!(config.training.epochs, 3);
        assert_eq!(config.checkpoint_dir, PathBuf::from("/env/ckpt"));
        // YAML value still used where no env override
        assert_eq!(config.training.batch_size, 16);

        // --- Phase 3: Invalid env override fails validation ---
        std::env::set_var("BERTGCN_BATCH_SIZE", "0");
        assert!(Config::from_yaml_and_env(Some(&file_path)).is_err());

        clear_env();

        // --- Phase 4: No YAML file → defaults ---
        let nonexistent = Path::new("/tmp/nonexistent-bertgcn-config-12345.yaml");
        let config = Config::from_yaml_and_env(Some(nonexistent)).unwrap();
        assert_eq!(config.training.epochs, 50);
        assert_eq!(config.checkpoint_dir, PathBuf::from("./checkpoint"));

        // --- Phase 5: Unparseable YAML → defaults ---
        let broken = dir.path().join("broken.yaml");
        std::fs::write(&broken, "training: [not, a, map").unwrap();
        let config = Config::from_yaml_and_env(Some(&broken)).unwrap();
        assert_eq!(config.training.batch_size, 64);
    }
}
