//! Dispatch of sampled frames.
//!
//! Two strategies, chosen per device by `destination_path`:
//! - `PathSink`: write a JPEG under the destination directory, then ask the
//!   relay to mirror that directory.
//! - `BufferSink`: keep JPEG bytes in memory and relay them in batches once
//!   the flush threshold is reached.
//!
//! Sinks are owned by one stream worker and called sequentially from its loop.

use chrono::NaiveDateTime;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::device::DeviceDescriptor;
use crate::frame::{encode_jpeg, EncodeError, Frame};
use crate::relay::{RelayItem, RelayScheduler};

/// Items buffered per device before a batch relay.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 5;

const SNAPSHOT_EXTENSION: &str = "jpg";
const SNAPSHOT_TIME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] EncodeError),
    #[error("failed to write snapshot {path}: {source}")]
    LocalWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// `<device>_<YYYY-mm-dd_HH-MM-SS>.jpg`
pub fn snapshot_name(device_name: &str, taken_at: NaiveDateTime) -> String {
    format!(
        "{}_{}.{}",
        device_name,
        taken_at.format(SNAPSHOT_TIME_FORMAT),
        SNAPSHOT_EXTENSION
    )
}

pub trait DispatchSink: Send {
    /// Handle one sampled frame taken at wall-clock time `taken_at`.
    fn dispatch(&mut self, frame: &Frame, taken_at: NaiveDateTime) -> Result<(), DispatchError>;

    /// Items held back and not yet handed to the relay.
    fn pending(&self) -> usize {
        0
    }

    /// Called once when the owning worker exits.
    fn finish(&mut self) {}
}

/// Pick the sink for a device.
pub fn sink_for(
    device: &DeviceDescriptor,
    relay: Arc<dyn RelayScheduler>,
    flush_threshold: usize,
) -> Box<dyn DispatchSink> {
    if device.uses_local_storage() {
        Box::new(PathSink::new(
            &device.name,
            PathBuf::from(device.destination_path.trim()),
            relay,
        ))
    } else {
        Box::new(BufferSink::new(&device.name, flush_threshold, relay))
    }
}

pub struct PathSink {
    device_name: String,
    destination: PathBuf,
    relay: Arc<dyn RelayScheduler>,
}

impl PathSink {
    pub fn new(device_name: &str, destination: PathBuf, relay: Arc<dyn RelayScheduler>) -> Self {
        Self {
            device_name: device_name.to_string(),
            destination,
            relay,
        }
    }

    /// Write the snapshot and return its path.
    pub fn write(&self, frame: &Frame, taken_at: NaiveDateTime) -> Result<PathBuf, DispatchError> {
        let bytes = encode_jpeg(frame)?;
        let path = self
            .destination
            .join(snapshot_name(&self.device_name, taken_at));
        std::fs::create_dir_all(&self.destination).map_err(|source| {
            DispatchError::LocalWrite {
                path: self.destination.clone(),
                source,
            }
        })?;
        std::fs::write(&path, bytes).map_err(|source| DispatchError::LocalWrite {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

impl DispatchSink for PathSink {
    fn dispatch(&mut self, frame: &Frame, taken_at: NaiveDateTime) -> Result<(), DispatchError> {
        let path = self.write(frame, taken_at)?;
        log::info!(
            "saved picture from device {} to path - {}",
            self.device_name,
            path.display()
        );
        self.relay
            .schedule_mirror(&self.device_name, self.destination.clone());
        Ok(())
    }
}

pub struct BufferSink {
    device_name: String,
    threshold: usize,
    items: Vec<RelayItem>,
    relay: Arc<dyn RelayScheduler>,
}

impl BufferSink {
    pub fn new(device_name: &str, threshold: usize, relay: Arc<dyn RelayScheduler>) -> Self {
        let threshold = threshold.max(1);
        Self {
            device_name: device_name.to_string(),
            threshold,
            items: Vec::with_capacity(threshold),
            relay,
        }
    }

    /// Append already-encoded bytes; flushes when the threshold is reached.
    pub fn push(&mut self, bytes: Vec<u8>, taken_at: NaiveDateTime) {
        let name = self.unique_name(snapshot_name(&self.device_name, taken_at));
        self.items.push(RelayItem { name, bytes });
        log::debug!(
            "buffered snapshot for {} ({}/{})",
            self.device_name,
            self.items.len(),
            self.threshold
        );
        if self.items.len() >= self.threshold {
            self.flush();
        }
    }

    /// Hand the whole buffer, in arrival order, to the relay and clear it.
    pub fn flush(&mut self) {
        if self.items.is_empty() {
            return;
        }
        let batch = std::mem::replace(&mut self.items, Vec::with_capacity(self.threshold));
        self.relay.schedule_batch(&self.device_name, batch);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn unique_name(&self, base: String) -> String {
        if !self.items.iter().any(|item| item.name == base) {
            return base;
        }
        let stem = base
            .strip_suffix(&format!(".{}", SNAPSHOT_EXTENSION))
            .unwrap_or(&base)
            .to_string();
        (1..)
            .map(|n| format!("{}_{}.{}", stem, n, SNAPSHOT_EXTENSION))
            .find(|candidate| !self.items.iter().any(|item| &item.name == candidate))
            .unwrap_or(base)
    }
}

impl DispatchSink for BufferSink {
    fn dispatch(&mut self, frame: &Frame, taken_at: NaiveDateTime) -> Result<(), DispatchError> {
        let bytes = encode_jpeg(frame)?;
        self.push(bytes, taken_at);
        Ok(())
    }

    fn pending(&self) -> usize {
        self.items.len()
    }

    fn finish(&mut self) {
        if !self.items.is_empty() {
            log::warn!(
                "discarding {} buffered snapshot(s) of {} below flush threshold",
                self.items.len(),
                self.device_name
            );
            self.items.clear();
        }
    }
}
