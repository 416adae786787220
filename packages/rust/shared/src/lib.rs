//! Shared types, error model, and configuration for Concierge.
//!
//! This crate is the foundation depended on by all other Concierge crates.
//! It provides:
//! - [`ConciergeError`] — the unified error type
//! - Domain types ([`PageRecord`], [`Chunk`], [`PageState`], [`RunState`])
//! - Configuration ([`AppConfig`], [`CrawlConfig`], [`PolicyConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CrawlConfig, DefaultsConfig, ModelsConfig, PolicyConfig, PolicySection, config_dir,
    config_file_path, init_config, load_config, load_config_from, validate_api_key,
};
pub use error::{ConciergeError, Result};
pub use types::{Chunk, PageRecord, PageState, RunState, chunk_id};
