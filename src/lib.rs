pub mod cleanup;
pub mod collector;
pub mod config;
pub mod filter;
pub mod generator;
pub mod health;
pub mod limiter;
pub mod llm;
pub mod pipeline;
pub mod publisher;
pub mod queue;
pub mod scheduler;
pub mod sources;
pub mod store;
pub mod tagger;
pub mod transport;
pub mod types;
pub mod worker;

pub use config::Settings;
pub use pipeline::Pipeline;
pub use types::{PipelineError, Result};
