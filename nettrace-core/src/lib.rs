//! nettrace core library
//!
//! This crate provides the fundamental types, statistics and error handling
//! shared by the nettrace capture pipeline.

pub mod error;
pub mod interface;
pub mod record;
pub mod stats;
pub mod types;

// Re-export commonly used types
pub use error::{Error, Result};
pub use interface::{InterfaceDescriptor, InterfaceRef};
pub use record::CapturedRecord;
pub use stats::{InterfaceStats, SourceStats, StatsAccumulator};
pub use types::LinkType;
