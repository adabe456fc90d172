//! Core pipeline: models, errors, config, cache, scheduling, persistence

pub mod cache;
pub mod client;
pub mod config;
pub mod errors;
pub mod models;
pub mod rate_limit;
pub mod scheduler;
pub mod store;
