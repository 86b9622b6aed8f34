//! Core system types and foundations
//! 
//! This module contains the fundamental building blocks of the agent,
//! including error handling, configuration and its file watch, logging and
//! allocator accounting.

pub mod error;
pub mod config;
pub mod logging;
pub mod allocator;
pub mod watcher;

// Re-export commonly used items
pub use error::{Error, ProfileError, Result};
pub use config::Config;
pub use watcher::ConfigWatcher;
