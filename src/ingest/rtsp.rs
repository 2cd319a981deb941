//! RTSP capture backend.
//!
//! Uses GStreamer for real RTSP decode, with a synthetic source for `stub://`
//! addresses. Synthetic addresses accept a query string:
//! - `frames=N`: the stream ends after N frames
//! - `fps=N`: pacing of synthetic frames (default: target fps)
//!
//! `stub://unavailable` (any path) refuses to open.

use std::time::Duration;

use super::{CaptureBackend, CaptureError, CaptureSource};
use crate::frame::Frame;

/// Capture settings shared by every stream opened through the backend.
#[derive(Clone, Debug)]
pub struct RtspConfig {
    /// Expected stream frame rate; bounds read timeouts and synthetic pacing.
    pub target_fps: u32,
    /// Frame width for synthetic frames.
    pub width: u32,
    /// Frame height for synthetic frames.
    pub height: u32,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            target_fps: 10,
            width: 640,
            height: 480,
        }
    }
}

/// Backend that opens `stub://` and (with rtsp-gstreamer) `rtsp://` streams.
#[derive(Clone, Debug, Default)]
pub struct RtspBackend {
    config: RtspConfig,
}

impl RtspBackend {
    pub fn new(config: RtspConfig) -> Self {
        Self { config }
    }
}

impl CaptureBackend for RtspBackend {
    fn open(&self, address: &str) -> Result<Box<dyn CaptureSource>, CaptureError> {
        if let Some(rest) = address.strip_prefix("stub://") {
            let mut source = SyntheticRtspSource::parse(rest, self.config.clone())?;
            source.connect()?;
            return Ok(Box::new(source));
        }

        #[cfg(feature = "rtsp-gstreamer")]
        {
            let mut source = GstreamerRtspSource::new(address, self.config.clone())?;
            source.connect()?;
            Ok(Box::new(source))
        }
        #[cfg(not(feature = "rtsp-gstreamer"))]
        {
            Err(CaptureError::SourceUnavailable(format!(
                "{} requires the rtsp-gstreamer feature",
                address
            )))
        }
    }
}

fn frame_interval(target_fps: u32) -> Duration {
    if target_fps == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(1000 / u64::from(target_fps))
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for tests
// ----------------------------------------------------------------------------

struct SyntheticRtspSource {
    name: String,
    config: RtspConfig,
    frame_limit: Option<u64>,
    pacing: Duration,
    frame_count: u64,
    closed: bool,
}

impl SyntheticRtspSource {
    fn parse(rest: &str, config: RtspConfig) -> Result<Self, CaptureError> {
        let (name, query) = match rest.split_once('?') {
            Some((name, query)) => (name, query),
            None => (rest, ""),
        };
        if name.is_empty() {
            return Err(CaptureError::SourceUnavailable(
                "stub address has no stream name".to_string(),
            ));
        }

        let mut frame_limit = None;
        let mut pacing = frame_interval(config.target_fps);
        for pair in query.split('&').filter(|pair| !pair.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let parsed: u64 = value.parse().map_err(|_| {
                CaptureError::SourceUnavailable(format!("invalid stub parameter '{}'", pair))
            })?;
            match key {
                "frames" => frame_limit = Some(parsed),
                "fps" => pacing = frame_interval(u32::try_from(parsed).unwrap_or(u32::MAX)),
                other => {
                    return Err(CaptureError::SourceUnavailable(format!(
                        "unknown stub parameter '{}'",
                        other
                    )))
                }
            }
        }

        Ok(Self {
            name: name.to_string(),
            config,
            frame_limit,
            pacing,
            frame_count: 0,
            closed: false,
        })
    }

    /// Synthetic sources are always "connected", except the reserved name.
    fn connect(&mut self) -> Result<(), CaptureError> {
        if self.name.starts_with("unavailable") {
            return Err(CaptureError::SourceUnavailable(format!(
                "stub://{} refused connection",
                self.name
            )));
        }
        log::info!("RtspSource: connected to stub://{} (synthetic)", self.name);
        Ok(())
    }

    fn generate_synthetic_pixels(&self) -> Vec<u8> {
        let pixel_count = (self.config.width * self.config.height * 3) as usize;
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count) % 256) as u8;
        }
        pixels
    }
}

impl CaptureSource for SyntheticRtspSource {
    fn read(&mut self) -> Result<Frame, CaptureError> {
        if self.closed {
            return Err(CaptureError::Ended);
        }
        if let Some(limit) = self.frame_limit {
            if self.frame_count >= limit {
                return Err(CaptureError::Ended);
            }
        }
        if !self.pacing.is_zero() {
            std::thread::sleep(self.pacing);
        }
        self.frame_count += 1;
        Ok(Frame::new(
            self.generate_synthetic_pixels(),
            self.config.width,
            self.config.height,
        ))
    }

    fn close(&mut self) {
        if !self.closed {
            log::debug!("RtspSource: closed stub://{}", self.name);
        }
        self.closed = true;
    }

    fn frames_captured(&self) -> u64 {
        self.frame_count
    }
}

// ----------------------------------------------------------------------------
// Production RTSP source using GStreamer
// ----------------------------------------------------------------------------

#[cfg(feature = "rtsp-gstreamer")]
struct GstreamerRtspSource {
    url: String,
    config: RtspConfig,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    frame_count: u64,
    closed: bool,
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstreamerRtspSource {
    /// Build the pipeline: rtspsrc ! decodebin ! videoconvert ! appsink (RGB).
    fn new(url: &str, config: RtspConfig) -> Result<Self, CaptureError> {
        use gstreamer::prelude::*;

        let unavailable = |what: &str, e: &dyn std::fmt::Display| {
            CaptureError::SourceUnavailable(format!("{}: {}", what, e))
        };

        gstreamer::init().map_err(|e| unavailable("initialize gstreamer", &e))?;

        let pipeline_description = format!(
            "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            url
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .map_err(|e| unavailable("build RTSP pipeline", &e))?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| {
                CaptureError::SourceUnavailable("RTSP pipeline is not a Pipeline".to_string())
            })?;

        let appsink = pipeline
            .by_name("appsink")
            .ok_or_else(|| {
                CaptureError::SourceUnavailable("appsink element missing from pipeline".into())
            })?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| {
                CaptureError::SourceUnavailable("appsink element has unexpected type".into())
            })?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        Ok(Self {
            url: url.to_string(),
            config,
            pipeline,
            appsink,
            frame_count: 0,
            closed: false,
        })
    }

    fn connect(&mut self) -> Result<(), CaptureError> {
        use gstreamer::prelude::*;

        self.pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|e| {
                CaptureError::SourceUnavailable(format!("set RTSP pipeline to Playing: {}", e))
            })?;
        log::info!("RtspSource: connected to {}", self.url);
        Ok(())
    }

    fn frame_timeout(&self) -> Duration {
        let base_ms = if self.config.target_fps == 0 {
            500
        } else {
            (1000 / self.config.target_fps).saturating_mul(4)
        };
        Duration::from_millis(base_ms.max(500) as u64)
    }

    /// Drain bus messages; an error or EOS ends the stream.
    fn poll_bus(&mut self) -> Result<(), CaptureError> {
        use gstreamer::prelude::*;

        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    log::error!(
                        "RtspSource: gstreamer error from {:?} on {}: {}",
                        err.src().map(|s| s.path_string()),
                        self.url,
                        err.error()
                    );
                    return Err(CaptureError::Ended);
                }
                MessageView::Eos(..) => return Err(CaptureError::Ended),
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(feature = "rtsp-gstreamer")]
impl CaptureSource for GstreamerRtspSource {
    fn read(&mut self) -> Result<Frame, CaptureError> {
        if self.closed {
            return Err(CaptureError::Ended);
        }
        self.poll_bus()?;

        let timeout = gstreamer::ClockTime::from_mseconds(self.frame_timeout().as_millis() as u64);
        let Some(sample) = self.appsink.try_pull_sample(timeout) else {
            if self.appsink.is_eos() {
                return Err(CaptureError::Ended);
            }
            return Err(CaptureError::NoFrame);
        };

        let (pixels, width, height) = sample_to_pixels(&sample)?;
        self.frame_count += 1;
        Ok(Frame::new(pixels, width, height))
    }

    fn close(&mut self) {
        use gstreamer::prelude::*;

        if self.closed {
            return;
        }
        if let Err(e) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("RtspSource: failed to stop pipeline for {}: {}", self.url, e);
        }
        self.closed = true;
    }

    fn frames_captured(&self) -> u64 {
        self.frame_count
    }
}

#[cfg(feature = "rtsp-gstreamer")]
impl Drop for GstreamerRtspSource {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32), CaptureError> {
    let bad_sample = |what: &str| CaptureError::SourceUnavailable(format!("RTSP sample {}", what));

    let buffer = sample.buffer().ok_or_else(|| bad_sample("missing buffer"))?;
    let caps = sample.caps().ok_or_else(|| bad_sample("missing caps"))?;
    let info = gstreamer_video::VideoInfo::from_caps(caps)
        .map_err(|_| bad_sample("caps are not video info"))?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer
        .map_readable()
        .map_err(|_| bad_sample("buffer is not readable"))?;
    let data = map.as_slice();

    if stride == row_bytes {
        return Ok((data.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .ok_or_else(|| bad_sample("row is out of bounds"))?,
        );
    }

    Ok((pixels, width, height))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_backend() -> RtspBackend {
        RtspBackend::new(RtspConfig {
            target_fps: 0,
            width: 16,
            height: 8,
        })
    }

    #[test]
    fn stub_source_produces_frames() {
        let mut source = stub_backend().open("stub://front").expect("open");
        let frame = source.read().expect("frame");
        assert_eq!(frame.width, 16);
        assert_eq!(frame.height, 8);
        assert_eq!(frame.byte_len(), 16 * 8 * 3);
        assert_eq!(source.frames_captured(), 1);
    }

    #[test]
    fn stub_source_ends_after_frame_limit() {
        let mut source = stub_backend().open("stub://front?frames=2").expect("open");
        assert!(source.read().is_ok());
        assert!(source.read().is_ok());
        assert!(matches!(source.read(), Err(CaptureError::Ended)));
    }

    #[test]
    fn closed_source_reports_ended() {
        let mut source = stub_backend().open("stub://front").expect("open");
        source.close();
        source.close();
        assert!(matches!(source.read(), Err(CaptureError::Ended)));
    }

    #[test]
    fn unavailable_stub_fails_to_open() {
        let result = stub_backend().open("stub://unavailable");
        assert!(matches!(result, Err(CaptureError::SourceUnavailable(_))));
    }

    #[test]
    fn malformed_stub_parameters_are_rejected() {
        assert!(stub_backend().open("stub://front?frames=abc").is_err());
        assert!(stub_backend().open("stub://front?speed=2").is_err());
        assert!(stub_backend().open("stub://").is_err());
    }

    #[cfg(not(feature = "rtsp-gstreamer"))]
    #[test]
    fn rtsp_without_gstreamer_is_unavailable() {
        let result = stub_backend().open("rtsp://192.168.1.10:554/stream");
        assert!(matches!(result, Err(CaptureError::SourceUnavailable(_))));
    }
}
