pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod monitor;
pub mod orchestrator;
pub mod remote;
pub mod report;
pub mod streaming;
pub mod tokenizer;
pub mod transport;
