//! Child output demultiplexing.

pub mod demux;
pub mod splitter;

pub use demux::{DemuxConfig, StreamDemultiplexer};
pub use splitter::{Split, StreamOverflowError, TurnSplitter};
