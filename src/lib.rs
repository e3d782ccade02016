//! Trama — incremental build engine for generative media pipelines.
//!
//! Blueprint DAG compilation. BLAKE3 content addressing. Append-only
//! provenance. Recomputes exactly the artefacts whose upstream inputs
//! changed, and nothing else.

pub mod cli;
pub mod core;
pub mod store;
