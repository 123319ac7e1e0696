//! Collaborator traits the hot loop is built against (§6 "Inbound from
//! collaborators").
//!
//! The engine never opens a camera, decodes video, or runs a detector
//! itself — those concerns live upstream, behind [`FrameSource`], and the
//! embedding model lives behind [`Embedder`]. Keeping both as traits
//! generic over an associated `Frame` type means a test can swap in a
//! fixed sequence of synthetic embeddings without the engine crate ever
//! knowing what a real frame looks like.

use vrt_core::embedding::Embedding;
use vrt_core::error::Result;
use vrt_core::match_result::BBox;

/// Per-frame timings a [`FrameSource`] incurred producing its most
/// recent frame, outside the engine's own embed/match instrumentation.
///
/// Detection and tracking are upstream of this crate's scope (§1); a
/// frame source that performs them reports the cost here so
/// `stage_timings.csv` still has real numbers in the `detect`/`track`
/// columns. A source with no detector (e.g. one iterating pre-cropped
/// frames) simply returns the default, all-zero value.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UpstreamStageDurations {
    /// Time spent detecting the subject in this frame, in milliseconds.
    pub detect_ms: f64,
    /// Time spent tracking the subject across frames, in milliseconds.
    pub track_ms: f64,
}

/// Produces the embedding for a single frame.
///
/// Implementations surface model failures (bad input, backend error) as
/// [`vrt_core::error::Error::Data`]; the hot loop converts any such
/// failure into an `"unknown"` result rather than aborting the run (§7
/// propagation policy).
pub trait Embedder {
    /// The frame representation this embedder consumes.
    type Frame;

    /// Embed one frame. Must return a vector with `||v|| = 1` (§6).
    fn embed(&self, frame: &Self::Frame) -> Result<Embedding>;
}

/// Produces frames, one at a time, in input order.
///
/// A `FrameSource` is exhausted when [`next_frame`](FrameSource::next_frame)
/// returns `None`; the engine never retries or opens its own sockets to
/// fetch more (§6 "the core never opens its own sockets").
pub trait FrameSource {
    /// The frame representation this source produces.
    type Frame;

    /// Pull the next frame, or `None` if the run's input is exhausted.
    fn next_frame(&mut self) -> Option<Self::Frame>;

    /// Optional bounding-box hint carried with the most recently returned
    /// frame (§3 `MatchResult.bbox`).
    fn bbox_hint(&self, _frame: &Self::Frame) -> Option<BBox> {
        None
    }

    /// Optional frame timestamp, in milliseconds.
    fn timestamp_ms(&self, _frame: &Self::Frame) -> Option<u64> {
        None
    }

    /// Upstream detect/track cost incurred producing the most recently
    /// returned frame. See [`UpstreamStageDurations`].
    fn upstream_stage_durations(&self) -> UpstreamStageDurations {
        UpstreamStageDurations::default()
    }
}
