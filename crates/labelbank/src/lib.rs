//! LabelBank: the ANN index over labeled exemplars (§4.1).
//!
//! Exemplars are embedded offline and assembled into an immutable shard
//! file ([`format`]); at runtime the engine opens a shard once and issues
//! [`shard::Shard::lookup`] calls against it, one per processed frame.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod calibration;
pub mod format;
pub mod shard;

pub use calibration::{CalibrationEntry, CalibrationTable, Quantiles};
pub use shard::{ExemplarRow, Shard, ACTIVE_BACKEND};
