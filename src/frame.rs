//! Decoded frames and the per-device frame channel.
//!
//! - `Frame`: RGB8 pixels as produced by a capture source.
//! - `FrameChannel`: bounded drop-oldest queue between capture and sampling.
//! - `encode_jpeg`: turns a sampled frame into the bytes that get written or relayed.

use std::collections::VecDeque;
use std::io::Cursor;
use std::time::Instant;

use image::{DynamicImage, ImageFormat, RgbImage};
use thiserror::Error;

/// Capacity of the per-device frame channel.
pub const FRAME_CHANNEL_CAPACITY: usize = 2;

/// A decoded RGB8 frame.
#[derive(Clone, Debug)]
pub struct Frame {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Monotonic capture instant.
    pub captured_at: Instant,
}

impl Frame {
    pub fn new(pixels: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            pixels,
            width,
            height,
            captured_at: Instant::now(),
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }
}

/// Bounded FIFO that evicts its oldest frame when full.
///
/// Owned by a single stream worker; never shared across threads.
#[derive(Debug)]
pub struct FrameChannel {
    buffer: VecDeque<Frame>,
    capacity: usize,
    evicted: u64,
}

impl FrameChannel {
    pub fn new() -> Self {
        Self::with_capacity(FRAME_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
            evicted: 0,
        }
    }

    /// Push a frame, evicting from the front while at capacity.
    pub fn push(&mut self, frame: Frame) {
        while self.buffer.len() >= self.capacity {
            self.buffer.pop_front();
            self.evicted += 1;
        }
        self.buffer.push_back(frame);
    }

    /// Take the newest frame and discard everything older.
    pub fn take_latest(&mut self) -> Option<Frame> {
        let latest = self.buffer.pop_back();
        self.buffer.clear();
        latest
    }

    pub fn latest(&self) -> Option<&Frame> {
        self.buffer.back()
    }

    pub fn oldest(&self) -> Option<&Frame> {
        self.buffer.front()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of frames dropped by eviction since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}

impl Default for FrameChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("pixel buffer of {len} bytes does not match {width}x{height} RGB")]
    BufferSize { len: usize, width: u32, height: u32 },
    #[error(transparent)]
    Image(#[from] image::ImageError),
}

/// JPEG-encode a frame in memory.
pub fn encode_jpeg(frame: &Frame) -> Result<Vec<u8>, EncodeError> {
    let image = RgbImage::from_raw(frame.width, frame.height, frame.pixels.clone()).ok_or(
        EncodeError::BufferSize {
            len: frame.pixels.len(),
            width: frame.width,
            height: frame.height,
        },
    )?;
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image).write_to(&mut out, ImageFormat::Jpeg)?;
    Ok(out.into_inner())
}
