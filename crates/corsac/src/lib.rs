//! Corsac - durable write-ahead log for telemetry ingestion.
//!
//! This crate provides the ingestion buffer of a telemetry agent:
//! producers append samples, exemplars, and histogram observations through
//! transactional appenders, and the engine guarantees the data survives
//! process restart and can be replayed to reconstruct in-memory state.
//!
//! # Components
//!
//! - [`Storage`]: the engine; owns the series registry and the segmented log
//! - [`Appender`]: per-transaction staging buffer with commit/rollback
//! - [`Wal`]: append-only segmented log with corruption-tolerant replay
//! - [`SeriesRegistry`]: label set to stable ref mapping
//!
//! # Example
//!
//! ```rust,ignore
//! use corsac::{Labels, Storage};
//!
//! let storage = Storage::open("/var/lib/agent")?;
//!
//! let mut app = storage.appender();
//! let labels = Labels::from_pairs([("__name__", "requests_total")]);
//! let ref_id = app.append(0, &labels, now_ms, 1.0)?;
//! app.commit()?;
//!
//! // Retention: drop everything older than an hour.
//! storage.truncate(now_ms - 3_600_000)?;
//! storage.close()?;
//! ```

#![deny(missing_docs)]

pub mod error;
pub mod record;
pub mod series;
pub mod storage;
pub mod wal;

pub use error::{Result, WalError};
pub use record::{
    is_stale_nan, stale_nan, Exemplar, FloatHistogram, Histogram, Label, Labels, Record,
    SeriesRef,
};
pub use series::{SeriesEntry, SeriesRegistry};
pub use storage::{Appender, Notifier, Storage};
pub use wal::{ReplayVisitor, SyncMode, Wal, WalConfig};
