//! RTSP Monitor
//!
//! Samples live camera streams at a per-device interval and ships the sampled
//! snapshots to local storage and/or a remote file-transfer relay.
//!
//! # Architecture
//!
//! Each active device runs one stream worker on a bounded pool. The worker
//! reads frames into a capacity-2 drop-oldest channel, asks its sampling gate
//! whether a snapshot is due, and hands the latest frame to a dispatch sink:
//!
//! - **Path sink**: write a JPEG under the device's destination directory,
//!   then mirror that directory to the relay.
//! - **Buffer sink**: hold JPEGs in memory and relay them in batches.
//!
//! Relay transfers run on a second pool and share one connection whose
//! lifetime follows the number of active devices.
//!
//! # Module Structure
//!
//! - `device`: device descriptors
//! - `catalog`: device catalog contract (SQLite and in-memory)
//! - `frame`: frames, the bounded frame channel, JPEG encoding
//! - `ingest`: capture backends (RTSP, synthetic `stub://`)
//! - `sampling`: interval gate
//! - `dispatch`: path and buffer sinks
//! - `relay`: reference-counted relay connection and backends
//! - `pool`: bounded worker pool
//! - `worker`: per-device stream worker
//! - `engine`: start / stop / shutdown facade
//! - `config`: TOML configuration with environment overrides
//! - `logging`: logger setup with daily-rotated log files

pub mod catalog;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod engine;
pub mod frame;
pub mod ingest;
pub mod logging;
pub mod pool;
pub mod relay;
pub mod sampling;
pub mod worker;

pub use catalog::{DeviceCatalog, InMemoryDeviceCatalog, SqliteDeviceCatalog};
pub use config::{MonitorConfig, RelayKind};
pub use device::{DeviceDescriptor, NewDevice, DEFAULT_INTERVAL_SECS};
pub use dispatch::{snapshot_name, BufferSink, DispatchError, DispatchSink, PathSink};
pub use engine::{Engine, EngineError, EngineSettings};
pub use frame::{EncodeError, Frame, FrameChannel, FRAME_CHANNEL_CAPACITY};
pub use ingest::{CaptureBackend, CaptureError, CaptureSource, RtspBackend, RtspConfig};
pub use pool::{PoolError, WorkerPool};
pub use relay::{
    DirectoryConnector, MemoryRelay, RelayConnector, RelayError, RelayItem, RelayManager,
    RelaySettings,
};
pub use sampling::SamplingGate;
pub use worker::{ReadPolicy, StreamWorker, WorkerExit};
