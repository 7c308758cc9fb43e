//! Training loop, cache refresh, optimization and checkpoints.
//!
//! ## Modules
//!
//! - [`scheduler`]: `TrainingContext` and the epoch state machine
//! - [`refresh`]: full re-encoding of every document into the cache
//! - [`optimizer`]: grouped Adam and the multi-step LR schedule
//! - [`metrics`]: accuracy/loss accumulation and the epoch log line
//! - [`checkpoint`]: best-validation checkpoints and warm-start loading

pub mod checkpoint;
pub mod metrics;
pub mod optimizer;
pub mod refresh;
pub mod scheduler;

pub use checkpoint::{BestScore, CheckpointInfo, CheckpointManager, CheckpointState};
pub use metrics::{EpochReport, SplitMetrics};
pub use optimizer::{GroupedAdam, MultiStepLr};
pub use refresh::{refresh_cache, RefreshStats};
pub use scheduler::{Phase, RunSummary, StepOutcome, TrainingContext};
