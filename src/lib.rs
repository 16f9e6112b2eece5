// ABOUTME: Public library API for the notedown exporter
// ABOUTME: Re-exports core modules for external use

pub mod api;
pub mod archive;
pub mod auth;
pub mod cli;
pub mod config;
pub mod convert;
pub mod error;
pub mod model;
pub mod stats;
pub mod storage;
pub mod sync;
pub mod util;

pub use error::{Error, Result};
pub use model::{AttachmentInfo, ExtractedMedia, IndexEntry, NoteSummary, SyncState};
pub use stats::{FailedItem, FailureKind, RunStats};
