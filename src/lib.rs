// Core modules
pub mod commands;
pub mod config;
pub mod db;
pub mod exchange;
pub mod execution;
pub mod indicators;
pub mod market;
pub mod models;
pub mod notify;
pub mod portfolio;
pub mod risk;
pub mod strategy;

// Re-export commonly used types
pub use config::{BotConfig, SharedConfig};
pub use models::*;

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
