//! Local runner for review coordination.
//!
//! Wires the coordination pipeline to concrete collaborators: an
//! OpenAI-compatible completions endpoint, unified diffs on disk as review
//! context, file or stdout posting, and JSON-file state checkpoints.

pub mod client;
pub mod config;
pub mod context;
pub mod poster;

pub use client::ChatCompletionsClient;
pub use config::{ConfigLoadError, LlmConfig, RunnerConfig};
pub use context::{parse_unified_diff, DiffContextProvider};
pub use poster::{FilePoster, PostedReview, StdoutPoster};
