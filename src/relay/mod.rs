//! Relay of sampled snapshots to a remote file-transfer sink.
//!
//! The relay connection is the only resource shared across devices. Its
//! lifetime is tied to the number of active devices:
//! - the first `acquire` opens it
//! - the last `release` closes it
//! - every dispatch task in between reuses the same connection
//!
//! Callers never see the connection object; they ask the `RelayManager` to
//! mirror a directory or upload a batch, and the manager borrows the
//! connection for the duration of that task.
//!
//! Backends:
//! - `directory`: remote is a mounted directory (NAS, tests)
//! - `ftp`: FTP server (feature: relay-ftp)
//! - `memory`: in-process recorder for tests and embedders

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

use crate::pool::WorkerPool;

pub mod directory;
#[cfg(feature = "relay-ftp")]
pub mod ftp;
pub mod memory;

pub use directory::DirectoryConnector;
#[cfg(feature = "relay-ftp")]
pub use ftp::FtpConnector;
pub use memory::MemoryRelay;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay is disabled")]
    Disabled,
    #[error("relay is not connected")]
    NotConnected,
    #[error("failed to connect to relay: {0}")]
    Connect(String),
    #[error("failed to list remote directory {path}: {reason}")]
    List { path: String, reason: String },
    #[error("failed to upload {name}: {reason}")]
    Upload { name: String, reason: String },
    #[error("failed to read local directory {path}: {source}")]
    LocalRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A snapshot held in memory until it is relayed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayItem {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// A live connection to the remote sink.
pub trait RelayConnection: Send {
    /// Names (not paths) of the files in `remote_path`.
    fn list(&mut self, remote_path: &str) -> Result<HashSet<String>, RelayError>;

    fn upload(&mut self, remote_path: &str, name: &str, bytes: &[u8]) -> Result<(), RelayError>;

    fn close(&mut self);
}

/// Opens relay connections with externally supplied credentials.
pub trait RelayConnector: Send + Sync {
    fn open(&self) -> Result<Box<dyn RelayConnection>, RelayError>;

    fn describe(&self) -> String;

    fn enabled(&self) -> bool {
        true
    }
}

/// Connector used when no relay is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct DisabledConnector;

impl RelayConnector for DisabledConnector {
    fn open(&self) -> Result<Box<dyn RelayConnection>, RelayError> {
        Err(RelayError::Disabled)
    }

    fn describe(&self) -> String {
        "disabled".to_string()
    }

    fn enabled(&self) -> bool {
        false
    }
}

#[derive(Clone, Debug)]
pub struct RelaySettings {
    pub remote_path: String,
    pub connect_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            remote_path: "/".to_string(),
            connect_attempts: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

type SharedConnection = Arc<Mutex<Box<dyn RelayConnection>>>;

#[derive(Default)]
struct Lifecycle {
    active_devices: usize,
    connection: Option<SharedConnection>,
    /// An open is running outside the lock.
    opening: bool,
    opened: u64,
    closed: u64,
}

/// Reference-counted owner of the single relay connection.
///
/// The lifecycle lock only guards counters and the connection slot; opening,
/// transfers and closing all happen outside it.
pub struct RelayManager {
    connector: Box<dyn RelayConnector>,
    settings: RelaySettings,
    lifecycle: Mutex<Lifecycle>,
}

impl RelayManager {
    pub fn new(connector: Box<dyn RelayConnector>, settings: RelaySettings) -> Self {
        Self {
            connector,
            settings,
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(Box::new(DisabledConnector), RelaySettings::default())
    }

    pub fn enabled(&self) -> bool {
        self.connector.enabled()
    }

    pub fn remote_path(&self) -> &str {
        &self.settings.remote_path
    }

    /// Register one more active device. Never blocks on I/O.
    ///
    /// Returns true on the 0 -> 1 transition of an enabled relay; the caller
    /// then runs (or schedules) `connect`.
    pub fn acquire(&self) -> bool {
        let mut lifecycle = self.lock();
        lifecycle.active_devices += 1;
        lifecycle.active_devices == 1 && lifecycle.connection.is_none() && self.enabled()
    }

    /// Open the connection if devices are active and none is held.
    ///
    /// Concurrent callers do not open twice: while one open is running the
    /// others return immediately. A connection that finishes opening after
    /// the last device went away is closed instead of installed. Returns
    /// whether a connection is live afterwards.
    pub fn connect(&self) -> bool {
        if !self.enabled() {
            return false;
        }
        {
            let mut lifecycle = self.lock();
            if lifecycle.active_devices == 0 {
                return false;
            }
            if lifecycle.connection.is_some() {
                return true;
            }
            if lifecycle.opening {
                return false;
            }
            lifecycle.opening = true;
        }

        let opened = self.open_with_retries();

        let stale = {
            let mut lifecycle = self.lock();
            lifecycle.opening = false;
            match opened {
                Some(connection)
                    if lifecycle.active_devices > 0 && lifecycle.connection.is_none() =>
                {
                    lifecycle.connection = Some(Arc::new(Mutex::new(connection)));
                    lifecycle.opened += 1;
                    log::info!("relay: connected to {}", self.connector.describe());
                    return true;
                }
                Some(connection) => Some(connection),
                None => None,
            }
        };
        if let Some(mut connection) = stale {
            log::debug!("relay: no active devices left, closing fresh connection");
            connection.close();
        }
        false
    }

    /// Unregister one active device. Closes the connection on 1 -> 0.
    /// Calling it with no active devices is a no-op.
    pub fn release(&self) {
        let closing = {
            let mut lifecycle = self.lock();
            if lifecycle.active_devices == 0 {
                log::debug!("relay: release with no active devices ignored");
                return;
            }
            lifecycle.active_devices -= 1;
            if lifecycle.active_devices > 0 {
                return;
            }
            Self::take_connection(&mut lifecycle)
        };
        if let Some(connection) = closing {
            self.retire(&connection);
        }
    }

    /// Drop every registration and close the connection.
    pub fn release_all(&self) {
        let closing = {
            let mut lifecycle = self.lock();
            lifecycle.active_devices = 0;
            Self::take_connection(&mut lifecycle)
        };
        if let Some(connection) = closing {
            self.retire(&connection);
        }
    }

    pub fn active_devices(&self) -> usize {
        self.lock().active_devices
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connection.is_some()
    }

    /// Connections opened over the manager's lifetime.
    pub fn connections_opened(&self) -> u64 {
        self.lock().opened
    }

    /// Connections closed over the manager's lifetime.
    pub fn connections_closed(&self) -> u64 {
        self.lock().closed
    }

    /// Open and immediately close a throwaway connection.
    pub fn check(&self) -> Result<(), RelayError> {
        let mut connection = self.connector.open()?;
        connection.list(&self.settings.remote_path)?;
        connection.close();
        Ok(())
    }

    /// Upload every file in `local_dir` whose name is missing remotely.
    ///
    /// Returns the number of files uploaded. Re-running is safe: files already
    /// present remotely (by name) are skipped.
    pub fn mirror_directory(&self, local_dir: &Path) -> Result<usize, RelayError> {
        let connection = self.connection()?;
        let result = self.mirror_with(&connection, local_dir);
        if matches!(
            result,
            Err(RelayError::List { .. }) | Err(RelayError::Upload { .. })
        ) {
            self.invalidate(&connection);
        }
        self.finish_transfer(&connection);
        result
    }

    /// Upload each item in order under its own name, without diffing.
    ///
    /// Failed items are logged and dropped. Returns the number uploaded.
    pub fn upload_batch(&self, items: Vec<RelayItem>) -> Result<usize, RelayError> {
        let connection = self.connection()?;
        let remote_path = self.settings.remote_path.as_str();
        let mut uploaded = 0;
        let mut failed = false;
        {
            let mut conn = lock_connection(&connection);
            for item in &items {
                match conn.upload(remote_path, &item.name, &item.bytes) {
                    Ok(()) => {
                        uploaded += 1;
                        log::info!("relay: uploaded {}", item.name);
                    }
                    Err(e) => {
                        failed = true;
                        log::error!("relay: dropping {}: {}", item.name, e);
                    }
                }
            }
        }
        if failed {
            self.invalidate(&connection);
        }
        self.finish_transfer(&connection);
        Ok(uploaded)
    }

    fn mirror_with(
        &self,
        connection: &SharedConnection,
        local_dir: &Path,
    ) -> Result<usize, RelayError> {
        let local_files = list_local_files(local_dir)?;
        let remote_path = self.settings.remote_path.as_str();

        let mut conn = lock_connection(connection);
        let remote_files = conn.list(remote_path)?;

        let mut uploaded = 0;
        for name in local_files.iter().filter(|name| !remote_files.contains(*name)) {
            let path = local_dir.join(name);
            let bytes = std::fs::read(&path).map_err(|source| RelayError::LocalRead {
                path: path.clone(),
                source,
            })?;
            conn.upload(remote_path, name, &bytes)?;
            uploaded += 1;
            log::info!("relay: file {} sent", name);
        }
        Ok(uploaded)
    }

    /// Current connection, reopening it if devices are active but it is gone.
    fn connection(&self) -> Result<SharedConnection, RelayError> {
        if !self.connector.enabled() {
            return Err(RelayError::Disabled);
        }
        {
            let lifecycle = self.lock();
            if lifecycle.active_devices == 0 {
                return Err(RelayError::NotConnected);
            }
            if let Some(connection) = &lifecycle.connection {
                return Ok(Arc::clone(connection));
            }
        }
        self.connect();
        self.lock()
            .connection
            .as_ref()
            .map(Arc::clone)
            .ok_or(RelayError::NotConnected)
    }

    fn open_with_retries(&self) -> Option<Box<dyn RelayConnection>> {
        let attempts = self.settings.connect_attempts.max(1);
        for attempt in 1..=attempts {
            match self.connector.open() {
                Ok(connection) => return Some(connection),
                Err(e) => {
                    log::error!(
                        "relay: connect attempt {}/{} to {} failed: {}",
                        attempt,
                        attempts,
                        self.connector.describe(),
                        e
                    );
                    if attempt < attempts {
                        std::thread::sleep(self.settings.retry_delay);
                    }
                }
            }
        }
        None
    }

    /// Drop a connection that failed mid-task so the next task reopens it.
    fn invalidate(&self, broken: &SharedConnection) {
        let mut lifecycle = self.lock();
        if let Some(current) = &lifecycle.connection {
            if Arc::ptr_eq(current, broken) {
                log::warn!("relay: connection degraded; will reconnect on next transfer");
                Self::take_connection(&mut lifecycle);
            }
        }
    }

    /// Close a connection that is no longer installed.
    ///
    /// A transfer still holding it closes it when it finishes, so the caller
    /// never waits on relay I/O.
    fn retire(&self, connection: &SharedConnection) {
        match connection.try_lock() {
            Ok(mut conn) => {
                conn.close();
                log::info!("relay: disconnected from {}", self.connector.describe());
            }
            Err(std::sync::TryLockError::Poisoned(poisoned)) => {
                poisoned.into_inner().close();
            }
            Err(std::sync::TryLockError::WouldBlock) => {
                log::debug!("relay: transfer in flight, connection closes when it ends");
            }
        }
    }

    /// Close the task's connection if it was retired while the task ran.
    fn finish_transfer(&self, connection: &SharedConnection) {
        let retired = match &self.lock().connection {
            Some(current) => !Arc::ptr_eq(current, connection),
            None => true,
        };
        if retired {
            lock_connection(connection).close();
        }
    }

    fn take_connection(lifecycle: &mut Lifecycle) -> Option<SharedConnection> {
        let connection = lifecycle.connection.take();
        if connection.is_some() {
            lifecycle.closed += 1;
        }
        connection
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn lock_connection(connection: &SharedConnection) -> MutexGuard<'_, Box<dyn RelayConnection>> {
    connection
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Names of regular files in `dir`, sorted.
pub fn list_local_files(dir: &Path) -> Result<Vec<String>, RelayError> {
    let local_read = |source| RelayError::LocalRead {
        path: dir.to_path_buf(),
        source,
    };
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(local_read)? {
        let entry = entry.map_err(local_read)?;
        if !entry.file_type().map_err(local_read)?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

/// Where sinks hand off relay work.
pub trait RelayScheduler: Send + Sync {
    /// Mirror a device's local directory to the remote sink.
    fn schedule_mirror(&self, device: &str, local_dir: PathBuf);

    /// Upload a flushed in-memory batch.
    fn schedule_batch(&self, device: &str, items: Vec<RelayItem>);
}

/// Runs relay work on a bounded pool so transfers never block capture loops.
#[derive(Clone)]
pub struct RelayQueue {
    manager: Arc<RelayManager>,
    pool: Arc<WorkerPool>,
}

impl RelayQueue {
    pub fn new(manager: Arc<RelayManager>, pool: Arc<WorkerPool>) -> Self {
        Self { manager, pool }
    }

    /// Open the relay connection on the relay pool.
    ///
    /// If the pool refuses the task, the next transfer opens it instead.
    pub fn schedule_connect(&self) {
        let manager = Arc::clone(&self.manager);
        if let Err(e) = self.pool.submit(move || {
            manager.connect();
        }) {
            log::warn!("relay: connect deferred to next transfer: {}", e);
        }
    }
}

impl RelayScheduler for RelayQueue {
    fn schedule_mirror(&self, device: &str, local_dir: PathBuf) {
        if !self.manager.enabled() {
            return;
        }
        let manager = Arc::clone(&self.manager);
        let device_name = device.to_string();
        let submitted = self.pool.submit(move || {
            match manager.mirror_directory(&local_dir) {
                Ok(0) => log::debug!("relay: {} already mirrored", device_name),
                Ok(count) => log::info!("relay: {} mirrored {} file(s)", device_name, count),
                Err(e) => log::error!("relay: error sending new files for {}: {}", device_name, e),
            }
        });
        if let Err(e) = submitted {
            log::warn!("relay: mirror for {} skipped: {}", device, e);
        }
    }

    fn schedule_batch(&self, device: &str, items: Vec<RelayItem>) {
        if !self.manager.enabled() {
            log::debug!("relay: disabled, dropping {} buffered item(s) of {}", items.len(), device);
            return;
        }
        let manager = Arc::clone(&self.manager);
        let device_name = device.to_string();
        let count = items.len();
        let submitted = self.pool.submit(move || match manager.upload_batch(items) {
            Ok(uploaded) if uploaded == count => {
                log::info!("relay: {} uploaded batch of {}", device_name, count)
            }
            Ok(uploaded) => log::warn!(
                "relay: {} uploaded {} of {} buffered item(s)",
                device_name,
                uploaded,
                count
            ),
            Err(e) => log::error!(
                "relay: {} dropped batch of {}: {}",
                device_name,
                count,
                e
            ),
        });
        if let Err(e) = submitted {
            log::warn!("relay: batch of {} for {} dropped: {}", count, device, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Barrier;
    use std::time::Instant;

    fn manager_with(relay: &MemoryRelay) -> RelayManager {
        RelayManager::new(
            Box::new(relay.clone()),
            RelaySettings {
                remote_path: "/".to_string(),
                connect_attempts: 1,
                retry_delay: Duration::ZERO,
            },
        )
    }

    /// Register a device and open inline, the way the relay pool would.
    fn activate(manager: &RelayManager) -> bool {
        manager.acquire();
        manager.connect()
    }

    fn item(name: &str) -> RelayItem {
        RelayItem {
            name: name.to_string(),
            bytes: vec![1, 2, 3],
        }
    }

    /// Connector whose opens and uploads take a fixed time.
    #[derive(Clone, Default)]
    struct SlowRelay {
        open_delay: Duration,
        upload_delay: Duration,
        fail_open: bool,
        uploading: Arc<AtomicBool>,
        opens: Arc<AtomicU64>,
        closes: Arc<AtomicU64>,
    }

    struct SlowConnection {
        relay: SlowRelay,
        closed: bool,
    }

    impl RelayConnector for SlowRelay {
        fn open(&self) -> Result<Box<dyn RelayConnection>, RelayError> {
            std::thread::sleep(self.open_delay);
            if self.fail_open {
                return Err(RelayError::Connect("unreachable".into()));
            }
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(SlowConnection {
                relay: self.clone(),
                closed: false,
            }))
        }

        fn describe(&self) -> String {
            "slow".to_string()
        }
    }

    impl RelayConnection for SlowConnection {
        fn list(&mut self, _remote_path: &str) -> Result<HashSet<String>, RelayError> {
            Ok(HashSet::new())
        }

        fn upload(&mut self, _remote_path: &str, _name: &str, _bytes: &[u8]) -> Result<(), RelayError> {
            self.relay.uploading.store(true, Ordering::SeqCst);
            std::thread::sleep(self.relay.upload_delay);
            Ok(())
        }

        fn close(&mut self) {
            if !self.closed {
                self.closed = true;
                self.relay.closes.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn wait_for(flag: &AtomicBool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !flag.load(Ordering::SeqCst) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn opens_once_and_closes_once_across_devices() {
        let relay = MemoryRelay::new();
        let manager = manager_with(&relay);

        assert!(manager.acquire(), "first device asks for a connection");
        assert!(manager.connect());
        assert!(!manager.acquire());
        assert!(!manager.acquire());
        assert!(manager.connect());
        assert_eq!(relay.opened(), 1);

        manager.release();
        manager.release();
        assert!(manager.is_connected());
        assert_eq!(relay.closed(), 0);

        manager.release();
        assert!(!manager.is_connected());
        assert_eq!(relay.opened(), 1);
        assert_eq!(relay.closed(), 1);
    }

    #[test]
    fn concurrent_acquire_and_release_open_and_close_once() {
        const DEVICES: usize = 8;
        let relay = MemoryRelay::new();
        let manager = manager_with(&relay);
        let all_active = Barrier::new(DEVICES);

        std::thread::scope(|scope| {
            for index in 0..DEVICES {
                let manager = &manager;
                let all_active = &all_active;
                scope.spawn(move || {
                    manager.acquire();
                    manager.connect();
                    all_active.wait();
                    // Stagger releases so they land in a different order than the acquires.
                    let shuffle = (index * 7 + 3) % DEVICES;
                    std::thread::sleep(Duration::from_millis(shuffle as u64 * 3));
                    manager.release();
                });
            }
        });

        assert_eq!(relay.opened(), 1);
        assert_eq!(relay.closed(), 1);
        assert_eq!(manager.active_devices(), 0);
        assert!(!manager.is_connected());
    }

    #[test]
    fn extra_release_is_a_noop() {
        let relay = MemoryRelay::new();
        let manager = manager_with(&relay);

        activate(&manager);
        manager.release();
        manager.release();
        assert_eq!(manager.active_devices(), 0);
        assert_eq!(relay.closed(), 1);
    }

    #[test]
    fn failed_open_does_not_block_activation() {
        let relay = MemoryRelay::new();
        relay.fail_connects(true);
        let manager = manager_with(&relay);

        assert!(!activate(&manager));
        assert_eq!(manager.active_devices(), 1);

        relay.fail_connects(false);
        let uploaded = manager
            .upload_batch(vec![item("cam_a.jpg")])
            .expect("reconnects on next transfer");
        assert_eq!(uploaded, 1);
        assert!(manager.is_connected());
    }

    #[test]
    fn slow_open_does_not_hold_the_lifecycle_lock() {
        let slow = SlowRelay {
            open_delay: Duration::from_millis(600),
            ..SlowRelay::default()
        };
        let manager = RelayManager::new(Box::new(slow.clone()), RelaySettings::default());
        assert!(manager.acquire());

        std::thread::scope(|scope| {
            let opener = scope.spawn(|| manager.connect());
            std::thread::sleep(Duration::from_millis(100));

            let started = Instant::now();
            assert_eq!(manager.active_devices(), 1);
            manager.release();
            assert!(started.elapsed() < Duration::from_millis(200));

            assert!(!opener.join().expect("join"), "nobody is active any more");
        });

        // Opened after the last release, so it was closed, not installed.
        assert_eq!(slow.opens.load(Ordering::SeqCst), 1);
        assert_eq!(slow.closes.load(Ordering::SeqCst), 1);
        assert_eq!(manager.connections_opened(), 0);
    }

    #[test]
    fn release_does_not_wait_for_transfer_in_flight() {
        let slow = SlowRelay {
            upload_delay: Duration::from_millis(800),
            ..SlowRelay::default()
        };
        let manager = RelayManager::new(Box::new(slow.clone()), RelaySettings::default());
        assert!(activate(&manager));

        std::thread::scope(|scope| {
            let transfer = scope.spawn(|| manager.upload_batch(vec![item("cam_a.jpg")]));
            wait_for(&slow.uploading);

            let started = Instant::now();
            manager.release();
            assert!(started.elapsed() < Duration::from_millis(200));
            assert!(!manager.is_connected());
            assert_eq!(slow.closes.load(Ordering::SeqCst), 0, "closed by the transfer");

            assert_eq!(transfer.join().expect("join").expect("upload"), 1);
        });
        assert_eq!(slow.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transfers_without_active_devices_are_refused() {
        let relay = MemoryRelay::new();
        let manager = manager_with(&relay);
        let result = manager.upload_batch(Vec::new());
        assert!(matches!(result, Err(RelayError::NotConnected)));
        assert_eq!(relay.opened(), 0);
    }

    #[test]
    fn mirror_uploads_only_missing_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("a.jpg"), b"a").expect("write a");
        std::fs::write(dir.path().join("b.jpg"), b"b").expect("write b");

        let relay = MemoryRelay::new();
        relay.insert_remote("/", "a.jpg", b"a".to_vec());
        let manager = manager_with(&relay);
        activate(&manager);

        assert_eq!(manager.mirror_directory(dir.path()).expect("mirror"), 1);
        assert_eq!(relay.upload_names(), vec!["b.jpg".to_string()]);

        // Second run finds nothing new.
        assert_eq!(manager.mirror_directory(dir.path()).expect("mirror"), 0);
        assert_eq!(relay.upload_names().len(), 1);
    }

    #[test]
    fn failed_upload_degrades_connection() {
        let relay = MemoryRelay::new();
        let manager = manager_with(&relay);
        activate(&manager);
        relay.fail_uploads(true);

        let uploaded = manager
            .upload_batch(vec![item("cam_a.jpg")])
            .expect("batch attempted");
        assert_eq!(uploaded, 0);
        assert!(!manager.is_connected());
        assert_eq!(relay.closed(), 1);
        assert_eq!(manager.active_devices(), 1);
    }

    #[test]
    fn disabled_manager_never_connects() {
        let manager = RelayManager::disabled();
        assert!(!manager.acquire());
        assert!(!manager.connect());
        assert!(matches!(
            manager.upload_batch(Vec::new()),
            Err(RelayError::Disabled)
        ));
        manager.release();
        assert_eq!(manager.connections_opened(), 0);
    }
}
