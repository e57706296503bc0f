//! # DriftKV
//!
//! An embedded, log-structured (Bitcask-style) key-value store with:
//! - Append-only data segments with CRC32-checked records
//! - A fully in-memory index of every live key
//! - Tombstone logs for deletions
//! - Crash recovery with torn-tail repair and a parallel index rebuild
//! - Background compaction of stale-heavy segments
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Engine                              │
//! │              (Single Writer / Multi Reader)                 │
//! └───────┬───────────────────┬──────────────────────┬──────────┘
//!         │ append            │ publish / lookup     │ queue
//!         ▼                   ▼                      ▼
//!  ┌─────────────┐     ┌─────────────┐       ┌──────────────┐
//!  │  Segments   │◄────│  IndexMap   │◄──────│  Compaction  │
//!  │ data/index/ │     │  (sharded)  │       │   (worker)   │
//!  │ tombstone   │     └──────▲──────┘       └──────────────┘
//!  └──────▲──────┘            │
//!         │                   │ rebuild at open
//!         └───────────── Recovery ◄──── Directory + METADATA
//! ```
//!
//! ```no_run
//! use driftkv::{Config, Engine};
//!
//! # fn main() -> driftkv::Result<()> {
//! let engine = Engine::open(Config::builder().data_dir("./data").build())?;
//! engine.put(b"key", b"value")?;
//! assert_eq!(engine.get(b"key")?.value, Some(b"value".to_vec()));
//! engine.close()?;
//! # Ok(())
//! # }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod codec;
pub mod segment;
pub mod directory;
pub mod index;
pub mod recovery;
pub mod compaction;
pub mod command;
pub mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{DriftError, Result};
pub use config::Config;
pub use command::{GetResult, ModifyResult, RecordExistsAction, SequenceNumberPolicy, WriteOp, WritePolicy};
pub use engine::{Engine, EngineStats};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of DriftKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
