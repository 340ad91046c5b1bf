//! ul-nzb - high-performance Usenet poster library
//!
//! This library splits local files into yEnc-encoded articles and posts
//! them to news servers over a pool of persistent NNTP connections.
//!
//! # Features
//!
//! - Streaming yEnc encoding with position-aware escaping and line wrapping
//! - A concurrent posting engine: bounded work queue, per-connection
//!   state machines, automatic reconnection and retry with message-id
//!   re-minting
//! - Optional post-validation via STAT probes
//! - NZB manifest output
//!
//! # Example
//!
//! ```no_run
//! use ul_nzb::nntp::{EngineOptions, PostingEngine};
//! use ul_nzb::post::FileSet;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut files = FileSet::new(400_000, ul_nzb::yenc::DEFAULT_LINE_LENGTH);
//!     files.add_file("big.iso")?;
//!
//!     let mut engine = PostingEngine::builder(EngineOptions::default())
//!         .post_finished(|article| println!("posted {}", article.subject()))
//!         .build();
//!     engine.start()?;
//!     // engine.add_connections(server, n); enqueue articles; stop; join.
//!     Ok(())
//! }
//! ```

// Core modules
pub mod cli;
pub mod config;
pub mod error;
pub mod progress;
pub mod yenc;

// Feature modules organized by functionality
pub mod nntp;
pub mod post;

// Re-export commonly used types
pub use config::{FileConfig, PostConfig, ServerConfig};
pub use error::{Result, UlNzbError};
pub use nntp::{EngineOptions, PostOutcome, PostingEngine, StatOutcome};
pub use post::{Article, FileSet, SegmentKey};
