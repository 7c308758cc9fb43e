//! Graph store and embedding cache.
//!
//! ## Architecture
//!
//! ```text
//! dataset ──► GraphParts ──► GraphStore (roles, labels, tokens, normalized adjacency)
//!                                  │
//!                              QuerySet (validated node indices + row mask)
//!                                  │
//!                            EmbeddingCache (committed snapshot ◄── PendingRows)
//! ```
//!
//! ## Modules
//!
//! - [`store`]: `GraphStore`, node roles, split counts, sparse adjacency
//! - [`query`]: `QuerySet`, the validated index set every operation takes
//! - [`cache`]: `EmbeddingCache` with its stage/commit protocol
//! - [`normalize`]: `D^-1/2 (A + I) D^-1/2` over an edge list

pub mod cache;
pub mod normalize;
pub mod query;
pub mod store;

pub use cache::{EmbeddingCache, PendingRows};
pub use normalize::{normalize_with_self_loops, Edge};
pub use query::QuerySet;
pub use store::{Adjacency, GraphParts, GraphStore, NodeRole, Split, SplitCounts};
