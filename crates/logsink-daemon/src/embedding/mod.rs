//! Embedding-based deduplication.
//!
//! [`provider`] holds the provider contract and its HTTP
//! implementation; [`worker`] drains pending issues, merging them into
//! similar neighbors or promoting them to `open`.

pub mod provider;
pub mod worker;

pub use provider::{EmbeddingProvider, HttpEmbeddingProvider, build_embedding_input};
pub use worker::{EmbeddingWorker, WorkerStatus};
