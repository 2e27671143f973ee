//! # neuroprep Common Library
//!
//! Shared code for the neuroprep pipeline crates:
//! - Error type and result alias
//! - Pipeline configuration loading
//! - Sequence vocabulary and the sequence resolver
//! - Per-session filename grammar
//! - Session model and subject/session discovery

pub mod config;
pub mod error;
pub mod naming;
pub mod sequence;
pub mod session;

pub use config::PipelineConfig;
pub use error::{Error, Result};
pub use naming::View;
pub use sequence::{Sequence, SequencePatterns};
pub use session::SessionInfo;
