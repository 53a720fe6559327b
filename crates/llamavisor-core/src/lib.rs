//! llamavisor Core Library
//!
//! Shared functionality for llamavisor components:
//! - Configuration resolution and hierarchy
//! - JSON-lines transcript log
//! - Tracing initialisation
//! - Common error types

pub mod config;
pub mod error;
pub mod tracing_init;
pub mod transcript;

pub use config::Config;
pub use error::{Error, Result};
pub use transcript::{TranscriptEntry, TranscriptLog};
