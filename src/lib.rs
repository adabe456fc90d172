//! EPUB translation pipeline
//!
//! Decomposes EPUB files into a persistent content mapping, translates the
//! text units through an async backend with caching and rate limiting, and
//! reassembles a translated EPUB that preserves the original formatting.

#![forbid(unsafe_code)]

pub mod cli;
pub mod core;
pub mod processors;

// Re-export key types for convenience
pub use core::{
    cache::SmartCache,
    client::{HttpTranslator, TranslationBackend},
    config::TranslatorConfig,
    errors::{PipelineError, TranslateError},
    models::{BatchSummary, ContentUnit, Glossary, Project, ProjectStatus},
    scheduler::{BatchOptions, BatchScheduler, CancelToken},
    store::MappingStore,
};

pub use processors::{decomposer::EpubDecomposer, reassembler::Reassembler};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
