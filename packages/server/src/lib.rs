// Page Analyser - API Core
//
// Accepts URLs for analysis, runs fetch + metadata extraction on a durable
// work queue, and serves job status and results over HTTP.

pub mod common;
pub mod config;
pub mod kernel;
pub mod server;

pub use config::*;
