//! Kernel module - job infrastructure and server dependencies.

pub mod deps;
pub mod jobs;

pub use deps::{enqueue_options, queue_settings, sweeper_config, ServerDeps};
