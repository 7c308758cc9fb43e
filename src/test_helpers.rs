//! Test helper factories
//!
//! A six-node toy graph and small model/training configs that keep unit tests
//! fast on CPU.
#![allow(dead_code)]

use std::path::Path;

use candle_core::Device;

use crate::data::{Tokenize, VocabTokenizer};
use crate::graph::{Edge, GraphParts, GraphStore, NodeRole, Split};
use crate::model::{HybridModel, PropagationKind};
use crate::training::TrainingContext;
use crate::{DeviceKind, ModelConfig, TrainingConfig};

pub const TOY_MAX_LENGTH: usize = 6;

/// Node layout: 0 train/0, 1 train/1, 2 val/0, 3 word, 4 word, 5 test/1.
pub fn toy_texts() -> [Option<&'static str>; 6] {
    [
        Some("good great fine"),
        Some("bad awful poor"),
        Some("good nice"),
        None,
        None,
        Some("bad terrible"),
    ]
}

pub fn toy_tokenizer() -> VocabTokenizer {
    VocabTokenizer::from_corpus(toy_texts().into_iter().flatten())
}

pub fn toy_parts() -> GraphParts {
    let roles = vec![
        NodeRole::Content(Split::Train),
        NodeRole::Content(Split::Train),
        NodeRole::Content(Split::Validation),
        NodeRole::Structural,
        NodeRole::Structural,
        NodeRole::Content(Split::Test),
    ];
    let labels = vec![Some(0), Some(1), Some(0), None, None, Some(1)];

    let tokenizer = toy_tokenizer();
    let mut input_ids = Vec::new();
    let mut attention_mask = Vec::new();
    for text in toy_texts() {
        match text {
            Some(text) => {
                let encoded = tokenizer
                    .encode(text, TOY_MAX_LENGTH)
                    .expect("toy text encodes");
                input_ids.extend(encoded.ids);
                attention_mask.extend(encoded.mask);
            }
            None => {
                input_ids.extend([0; TOY_MAX_LENGTH]);
                attention_mask.extend([0.0; TOY_MAX_LENGTH]);
            }
        }
    }

    // Word 3 links the "good" documents, word 4 the "bad" ones
    let mut edges = Vec::new();
    for (doc, word) in [(0, 3), (2, 3), (1, 4), (5, 4)] {
        edges.push(Edge {
            src: doc,
            dst: word,
            weight: 1.0,
        });
        edges.push(Edge {
            src: word,
            dst: doc,
            weight: 1.0,
        });
    }

    GraphParts {
        num_classes: 2,
        max_length: TOY_MAX_LENGTH,
        roles,
        labels,
        edges,
        input_ids,
        attention_mask,
    }
}

pub fn toy_graph() -> GraphStore {
    GraphStore::new(toy_parts(), &Device::Cpu).expect("toy graph is valid")
}

pub fn toy_model_config() -> ModelConfig {
    ModelConfig {
        propagation: PropagationKind::Gcn,
        m: 0.3,
        layers: 2,
        hidden_dim: 4,
        heads: 2,
        dropout: 0.1,
        feature_dim: 8,
        encoder_dropout: 0.1,
        pretrained_checkpoint: None,
    }
}

pub fn toy_training_config() -> TrainingConfig {
    TrainingConfig {
        epochs: 2,
        batch_size: 4,
        encoder_lr: 1e-3,
        propagation_lr: 1e-2,
        lr_milestones: vec![1],
        lr_gamma: 0.5,
        refresh_batch_size: 1024,
        seed: 7,
        device: DeviceKind::Cpu,
    }
}

pub fn toy_model(graph: &GraphStore) -> HybridModel {
    HybridModel::new(
        &toy_model_config(),
        toy_tokenizer().vocab_size(),
        graph.max_length(),
        graph.num_classes(),
        graph.device(),
    )
    .expect("toy model builds")
}

pub fn toy_context(checkpoint_dir: &Path) -> TrainingContext {
    let graph = toy_graph();
    let model = toy_model(&graph);
    TrainingContext::new(graph, model, &toy_training_config(), checkpoint_dir)
        .expect("toy context builds")
}
