//! llamavisor daemon library
//!
//! Supervises a long-running inference subprocess and exposes it as a
//! concurrent request/response service:
//! - Child process lifecycle with bounded restarts
//! - Serialized prompt submission over the child's stdin
//! - Sentinel-delimited demultiplexing of the child's stdout into turns
//! - Event fan-out of turns, resource samples and status changes

pub mod context;
pub mod sampler;
pub mod service;
pub mod session;
pub mod stream;
pub mod subprocess;

pub use service::{LlamaService, ServiceConfig, ServiceError, StatusSnapshot};
