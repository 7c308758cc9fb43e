//! The epoch loop.
//!
//! ```text
//! Initializing ──► TrainingStep* ──► EpochBoundary ──► Evaluating ──► Checkpointing ─┐
//!                       ▲                                                          │
//!                       └──────────────────── next epoch ◄─────────────────────────┘
//!                                                             after last epoch ──► Done
//! ```
//!
//! All state lives in [`TrainingContext`]; each phase is a method on it and
//! runs to completion before the next one starts.

use std::path::Path;

use candle_core::Tensor;
use candle_nn::loss::nll;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use super::checkpoint::{self, BestScore, CheckpointInfo, CheckpointManager, CheckpointState};
use super::metrics::{accuracy, correct_predictions, EpochReport, MetricAccumulator, SplitMetrics};
use super::optimizer::{GroupedAdam, MultiStepLr};
use super::refresh::{refresh_cache, RefreshStats};
use crate::data::{build_graph, load_tokenizer, DatasetFile};
use crate::error::{TrainError, TrainResult};
use crate::graph::{EmbeddingCache, GraphStore, QuerySet, Split};
use crate::model::{HybridModel, Mode};
use crate::{Config, TrainingConfig};

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    TrainingStep,
    EpochBoundary,
    Evaluating,
    Checkpointing,
    Done,
}

/// Result of one optimization step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    /// `None` when the batch held no training rows and no update was made.
    pub loss: Option<f32>,
    pub accuracy: f64,
    pub correct: usize,
    pub train_rows: usize,
}

/// Outcome of a full run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub epochs: usize,
    pub best_val_acc: f64,
    pub checkpoints_written: usize,
    pub last_report: Option<EpochReport>,
}

/// Owns the graph, model, cache, optimizer and schedule for one run.
pub struct TrainingContext {
    config: TrainingConfig,
    graph: GraphStore,
    model: HybridModel,
    cache: EmbeddingCache,
    optimizer: GroupedAdam,
    schedule: MultiStepLr,
    checkpoints: CheckpointManager,
    best: BestScore,
    epoch: usize,
    step: usize,
    phase: Phase,
    rng: StdRng,
}

impl TrainingContext {
    pub fn new(
        graph: GraphStore,
        model: HybridModel,
        config: &TrainingConfig,
        checkpoint_dir: &Path,
    ) -> TrainResult<Self> {
        if config.batch_size == 0 {
            return Err(TrainError::Config("batch_size must be positive".into()));
        }
        if model.num_classes() != graph.num_classes() {
            return Err(TrainError::ShapeMismatch {
                what: "model classes",
                expected: graph.num_classes(),
                actual: model.num_classes(),
            });
        }
        let cache = EmbeddingCache::zeros(graph.num_nodes(), model.feature_dim(), graph.device())?;
        let optimizer = GroupedAdam::new(model.params(), config.encoder_lr, config.propagation_lr)?;
        let schedule = MultiStepLr::new(config.lr_milestones.clone(), config.lr_gamma)?;

        Ok(Self {
            config: config.clone(),
            cache,
            optimizer,
            schedule,
            checkpoints: CheckpointManager::new(checkpoint_dir)?,
            best: BestScore::default(),
            epoch: 0,
            step: 0,
            phase: Phase::Initializing,
            rng: StdRng::seed_from_u64(config.seed),
            graph,
            model,
        })
    }

    /// Load the dataset, tokenize it, build the model and warm-start it if configured.
    pub fn from_config(config: &Config) -> TrainResult<Self> {
        config.validate()?;
        let device = config.training.device.device()?;

        let dataset = DatasetFile::load(&config.data.dataset_path)?;
        let tokenizer = load_tokenizer(&config.data, &dataset)?;
        let graph = build_graph(&dataset, tokenizer.as_ref(), config.data.max_length, &device)?;
        info!(%graph, "Graph information");

        let model = HybridModel::new(
            &config.model,
            tokenizer.vocab_size(),
            config.data.max_length,
            graph.num_classes(),
            &device,
        )?;
        if let Some(path) = &config.model.pretrained_checkpoint {
            checkpoint::load(path, &model)?;
        }

        Self::new(graph, model, &config.training, &config.checkpoint_dir)
    }

    pub fn graph(&self) -> &GraphStore {
        &self.graph
    }

    pub fn model(&self) -> &HybridModel {
        &self.model
    }

    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }

    pub fn optimizer(&self) -> &GroupedAdam {
        &self.optimizer
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn best_val_acc(&self) -> f64 {
        self.best.best()
    }

    /// Fill the cache from the current encoder and reset the best score.
    pub fn initialize(&mut self) -> TrainResult<RefreshStats> {
        self.phase = Phase::Initializing;
        self.best = BestScore::default();
        refresh_cache(
            &self.model,
            &self.graph,
            &mut self.cache,
            self.config.refresh_batch_size,
        )
    }

    /// One optimization step over `batch`, then commit its fresh rows.
    ///
    /// Loss and accuracy cover only the training documents of the batch. A
    /// batch without any reports accuracy 1.0 and leaves the parameters alone;
    /// its fresh rows are still committed.
    pub fn train_step(&mut self, batch: &[usize]) -> TrainResult<StepOutcome> {
        self.phase = Phase::TrainingStep;
        self.step += 1;

        let query = QuerySet::new(batch.to_vec(), &self.graph)?;
        let prediction = self
            .model
            .predict(&self.graph, &self.cache, &query, Mode::Train)?;
        let fresh = prediction
            .fresh
            .ok_or_else(|| TrainError::InvalidQuery("train prediction produced no rows".into()))?;

        let flags = self.graph.train_flags(query.nodes())?;
        let positions = query.positions_where(&flags);
        let outcome = if positions.is_empty() {
            StepOutcome {
                loss: None,
                accuracy: 1.0,
                correct: 0,
                train_rows: 0,
            }
        } else {
            let device = self.graph.device();
            let train_nodes: Vec<usize> = positions
                .iter()
                .map(|&pos| query.nodes()[pos as usize])
                .collect();
            let rows = positions.len();
            let labels = Tensor::from_vec(self.graph.labels(&train_nodes)?, rows, device)?;
            let positions = Tensor::from_vec(positions, rows, device)?;

            let log_probs = prediction.log_probs.index_select(&positions, 0)?;
            let loss = nll(&log_probs, &labels)?;
            let loss_value = loss.to_scalar::<f32>()?;
            if !loss_value.is_finite() {
                return Err(TrainError::NonFiniteLoss {
                    epoch: self.epoch,
                    step: self.step,
                    loss: loss_value,
                });
            }

            let grads = loss.backward()?;
            self.optimizer.step(&grads)?;
            let correct = correct_predictions(&log_probs.detach(), &labels)?;
            StepOutcome {
                loss: Some(loss_value),
                accuracy: accuracy(correct, rows),
                correct,
                train_rows: rows,
            }
        };

        let pending = self.cache.stage(&query, &fresh)?;
        self.cache.commit(pending)?;

        debug!(
            epoch = self.epoch,
            step = self.step,
            loss = ?outcome.loss,
            acc = outcome.accuracy,
            rows = outcome.train_rows,
            "Train step"
        );
        Ok(outcome)
    }

    /// Shuffle every document and step through them in mini-batches.
    pub fn run_epoch(&mut self) -> TrainResult<SplitMetrics> {
        let mut documents = self.graph.content_indices();
        documents.shuffle(&mut self.rng);

        let mut metrics = MetricAccumulator::default();
        for batch in documents.chunks(self.config.batch_size) {
            let outcome = self.train_step(batch)?;
            if let Some(loss) = outcome.loss {
                metrics.record(outcome.correct, outcome.train_rows, loss as f64);
            }
        }
        Ok(metrics.finish())
    }

    /// Decay the learning rates if a milestone was reached, then refresh the cache.
    pub fn epoch_boundary(&mut self) -> TrainResult<RefreshStats> {
        self.phase = Phase::EpochBoundary;
        let factor = self.schedule.step(&mut self.optimizer);
        debug!(epoch = self.epoch, lr_factor = factor, "Stepped LR schedule");
        refresh_cache(
            &self.model,
            &self.graph,
            &mut self.cache,
            self.config.refresh_batch_size,
        )
    }

    /// Accuracy and loss over each split, read from the committed cache.
    pub fn evaluate(&mut self) -> TrainResult<EpochReport> {
        self.phase = Phase::Evaluating;
        Ok(EpochReport {
            epoch: self.epoch,
            train: self.evaluate_split(Split::Train)?,
            validation: self.evaluate_split(Split::Validation)?,
            test: self.evaluate_split(Split::Test)?,
        })
    }

    fn evaluate_split(&self, split: Split) -> TrainResult<SplitMetrics> {
        let mut metrics = MetricAccumulator::default();
        let nodes = self.graph.split_indices(split);
        for batch in nodes.chunks(self.config.batch_size) {
            let query = QuerySet::new(batch.to_vec(), &self.graph)?;
            let prediction = self
                .model
                .predict(&self.graph, &self.cache, &query, Mode::Eval)?;
            let labels = Tensor::from_vec(self.graph.labels(batch)?, batch.len(), self.graph.device())?;
            let loss = nll(&prediction.log_probs, &labels)?.to_scalar::<f32>()?;
            let correct = correct_predictions(&prediction.log_probs, &labels)?;
            metrics.record(correct, batch.len(), loss as f64);
        }
        Ok(metrics.finish())
    }

    /// Save a checkpoint if validation accuracy beat the best so far.
    pub fn checkpoint(&mut self, report: &EpochReport) -> TrainResult<bool> {
        self.phase = Phase::Checkpointing;
        if report.validation.is_empty() {
            warn!(epoch = report.epoch, "Validation split is empty, skipping checkpoint");
            return Ok(false);
        }
        if !self.best.observe(report.validation.accuracy) {
            return Ok(false);
        }
        let state = CheckpointState {
            model: &self.model,
            optimizer: &self.optimizer,
            info: CheckpointInfo {
                epoch: report.epoch,
                best_val_acc: self.best.best(),
                saved_at: Utc::now(),
                optimizer_steps: self.optimizer.step_count(),
                lr_epoch: self.schedule.last_epoch(),
            },
        };
        let path = self.checkpoints.save(&state)?;
        info!(path = %path.display(), "New checkpoint");
        Ok(true)
    }

    /// Initialize, then run every configured epoch.
    pub fn run(&mut self) -> TrainResult<RunSummary> {
        self.initialize()?;
        let mut summary = RunSummary {
            epochs: 0,
            best_val_acc: self.best.best(),
            checkpoints_written: 0,
            last_report: None,
        };

        for epoch in 1..=self.config.epochs {
            self.epoch = epoch;
            let train = self.run_epoch()?;
            debug!(epoch, acc = train.accuracy, loss = train.loss, "Epoch steps done");
            self.epoch_boundary()?;

            let report = self.evaluate()?;
            info!("{}", report);
            if self.checkpoint(&report)? {
                summary.checkpoints_written += 1;
            }
            summary.epochs = epoch;
            summary.last_report = Some(report);
        }

        self.phase = Phase::Done;
        summary.best_val_acc = self.best.best();
        info!(
            epochs = summary.epochs,
            best_val_acc = summary.best_val_acc,
            "Training finished"
        );
        Ok(summary)
    }
}
