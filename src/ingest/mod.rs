//! Frame capture sources.
//!
//! The engine treats "open stream, read frame, close" as a supplied
//! capability. This module defines that seam and ships the RTSP backend:
//! - `stub://` synthetic streams (always available, used by tests)
//! - RTSP via GStreamer (feature: rtsp-gstreamer)
//!
//! A capture handle is owned by exactly one stream worker and is never shared.

use thiserror::Error;

use crate::frame::Frame;

pub mod rtsp;

pub use rtsp::{RtspBackend, RtspConfig};

/// Failures reported by a capture source.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The stream could not be opened, or failed in a way that will not recover.
    #[error("stream source unavailable: {0}")]
    SourceUnavailable(String),
    /// Transient read miss; the caller may retry.
    #[error("no frame available")]
    NoFrame,
    /// The stream reached its end or the handle was closed.
    #[error("stream ended")]
    Ended,
}

/// An open capture handle.
pub trait CaptureSource: Send {
    /// Read the next frame. May block for a bounded time.
    fn read(&mut self) -> Result<Frame, CaptureError>;

    /// Release the underlying stream. Safe to call more than once.
    fn close(&mut self);

    /// Frames successfully read so far.
    fn frames_captured(&self) -> u64;
}

/// Opens capture handles for stream addresses.
pub trait CaptureBackend: Send + Sync {
    fn open(&self, address: &str) -> Result<Box<dyn CaptureSource>, CaptureError>;
}
