//! Engine facade: start, stop and shutdown of per-device stream workers.
//!
//! The engine keeps one slot per device it has started. A slot holds the
//! worker's control flags; the `running` flag is the device's active state and
//! the only thing a worker polls to end its loop. Each running slot holds one
//! relay registration, so the relay connection lives exactly as long as at
//! least one device is active.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::catalog::DeviceCatalog;
use crate::device::DeviceDescriptor;
use crate::dispatch::{sink_for, DEFAULT_FLUSH_THRESHOLD};
use crate::ingest::CaptureBackend;
use crate::pool::{PoolError, WorkerPool};
use crate::relay::{RelayManager, RelayQueue, RelayScheduler};
use crate::worker::{ReadPolicy, StreamWorker, WorkerControl};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("device {0} is not in the catalog")]
    UnknownDevice(i64),
    #[error("device {0} is still shutting down; retry shortly")]
    Draining(String),
    #[error("engine is shut down")]
    ShutDown,
    #[error("catalog error: {0}")]
    Catalog(String),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("failed to spawn worker threads: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Clone, Debug)]
pub struct EngineSettings {
    /// Threads running stream workers; more active devices queue for a thread.
    pub stream_workers: usize,
    pub relay_workers: usize,
    /// Pending relay tasks before new ones are dropped. `None` is unbounded.
    pub relay_queue: Option<usize>,
    pub flush_threshold: usize,
    pub read_policy: ReadPolicy,
    /// How long `shutdown` waits for workers and relay tasks.
    pub shutdown_grace: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            stream_workers: 10,
            relay_workers: 2,
            relay_queue: Some(64),
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            read_policy: ReadPolicy::default(),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

struct WorkerSlot {
    name: String,
    control: Arc<WorkerControl>,
}

pub struct Engine {
    catalog: Arc<dyn DeviceCatalog>,
    capture: Arc<dyn CaptureBackend>,
    relay: Arc<RelayManager>,
    relay_queue: Arc<RelayQueue>,
    stream_pool: WorkerPool,
    relay_pool: Arc<WorkerPool>,
    settings: EngineSettings,
    workers: Mutex<HashMap<i64, WorkerSlot>>,
    shut_down: AtomicBool,
}

impl Engine {
    pub fn new(
        catalog: Arc<dyn DeviceCatalog>,
        capture: Arc<dyn CaptureBackend>,
        relay: Arc<RelayManager>,
        settings: EngineSettings,
    ) -> Result<Self, EngineError> {
        let stream_pool = WorkerPool::new("stream", settings.stream_workers, None)?;
        let relay_pool = Arc::new(WorkerPool::new(
            "relay",
            settings.relay_workers,
            settings.relay_queue,
        )?);
        let relay_queue = Arc::new(RelayQueue::new(
            Arc::clone(&relay),
            Arc::clone(&relay_pool),
        ));
        Ok(Self {
            catalog,
            capture,
            relay,
            relay_queue,
            stream_pool,
            relay_pool,
            settings,
            workers: Mutex::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn catalog(&self) -> &Arc<dyn DeviceCatalog> {
        &self.catalog
    }

    pub fn relay(&self) -> &Arc<RelayManager> {
        &self.relay
    }

    /// Start streaming a catalog device by id.
    pub fn start_by_id(&self, id: i64) -> Result<bool, EngineError> {
        let device = self
            .catalog
            .get(id)
            .map_err(|e| EngineError::Catalog(e.to_string()))?
            .ok_or(EngineError::UnknownDevice(id))?;
        self.start(&device)
    }

    /// Mark the device active and spawn its stream worker.
    ///
    /// Returns `Ok(false)` when a worker for the device is already running.
    /// The relay connection is opened on the relay pool, so a slow or
    /// unreachable relay never delays activation.
    pub fn start(&self, device: &DeviceDescriptor) -> Result<bool, EngineError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(EngineError::ShutDown);
        }
        let mut workers = self.lock_workers();

        if let Some(slot) = workers.get(&device.id) {
            match (slot.control.is_running(), slot.control.is_alive()) {
                (true, true) => {
                    log::debug!("device {} already streaming", device.name);
                    return Ok(false);
                }
                (true, false) => {
                    // Still active but the worker gave up; respawn under the
                    // registration the slot already holds.
                    log::info!("restarting stream worker for device {}", device.name);
                    let control = Arc::clone(&slot.control);
                    control.revive();
                    if let Err(e) = self.spawn_worker(device, Arc::clone(&control)) {
                        control.stop();
                        workers.remove(&device.id);
                        drop(workers);
                        self.deactivate(device.id, &device.name);
                        return Err(e);
                    }
                    return Ok(true);
                }
                (false, true) => return Err(EngineError::Draining(device.name.clone())),
                (false, false) => {
                    workers.remove(&device.id);
                }
            }
        }

        // Registered before the slot exists so a racing stop can only
        // release a registration this start already took.
        let needs_connect = self.relay.acquire();
        let control = WorkerControl::new();
        if let Err(e) = self.spawn_worker(device, Arc::clone(&control)) {
            control.stop();
            drop(workers);
            self.deactivate(device.id, &device.name);
            return Err(e);
        }
        workers.insert(
            device.id,
            WorkerSlot {
                name: device.name.clone(),
                control: Arc::clone(&control),
            },
        );
        drop(workers);

        if let Err(e) = self.catalog.set_active(device.id, true) {
            log::warn!("could not mark device {} active: {}", device.name, e);
        }
        // A stop may have landed between the insert and the catalog write.
        if !control.is_running() {
            if let Err(e) = self.catalog.set_active(device.id, false) {
                log::warn!("could not mark device {} inactive: {}", device.name, e);
            }
        }
        if needs_connect {
            self.relay_queue.schedule_connect();
        }
        log::info!("device {} started", device.name);
        Ok(true)
    }

    /// Flag the device inactive. The worker exits at its next loop boundary;
    /// this does not wait for it or for relay transfers in flight.
    ///
    /// Returns `false` when the device was not running.
    pub fn stop(&self, id: i64) -> bool {
        let name = {
            let workers = self.lock_workers();
            let Some(slot) = workers.get(&id) else {
                return false;
            };
            if !slot.control.is_running() {
                return false;
            }
            slot.control.stop();
            slot.name.clone()
        };
        self.deactivate(id, &name);
        log::info!("device {} stopped", name);
        true
    }

    /// Stop every device, wait a bounded time for workers and relay tasks,
    /// then close the relay connection.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("shutting down stream engine");

        let mut stopped = Vec::new();
        let controls: Vec<(String, Arc<WorkerControl>)> = {
            let workers = self.lock_workers();
            workers
                .iter()
                .map(|(id, slot)| {
                    if slot.control.is_running() {
                        slot.control.stop();
                        stopped.push((*id, slot.name.clone()));
                    }
                    (slot.name.clone(), Arc::clone(&slot.control))
                })
                .collect()
        };
        for (id, name) in &stopped {
            if let Err(e) = self.catalog.set_active(*id, false) {
                log::warn!("could not mark device {} inactive: {}", name, e);
            }
        }

        let deadline = Instant::now() + self.settings.shutdown_grace;
        for (name, control) in &controls {
            while control.is_alive() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(20));
            }
            if control.is_alive() {
                log::warn!("stream worker for {} did not exit within grace period", name);
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if !self.relay_pool.wait_idle(remaining) {
            log::warn!(
                "relay tasks still pending at shutdown ({} queued, {} running)",
                self.relay_pool.queued(),
                self.relay_pool.busy()
            );
        }
        self.relay.release_all();
    }

    /// Whether a worker for the device is running (or queued for a thread).
    pub fn is_running(&self, id: i64) -> bool {
        self.lock_workers()
            .get(&id)
            .map_or(false, |slot| slot.control.is_alive())
    }

    /// Whether the device is flagged active.
    pub fn is_active(&self, id: i64) -> bool {
        self.lock_workers()
            .get(&id)
            .map_or(false, |slot| slot.control.is_running())
    }

    pub fn active_count(&self) -> usize {
        self.lock_workers()
            .values()
            .filter(|slot| slot.control.is_running())
            .count()
    }

    fn spawn_worker(
        &self,
        device: &DeviceDescriptor,
        control: Arc<WorkerControl>,
    ) -> Result<(), EngineError> {
        let scheduler: Arc<dyn RelayScheduler> = self.relay_queue.clone();
        let sink = sink_for(
            device,
            scheduler,
            self.settings.flush_threshold,
        );
        let worker = StreamWorker::new(
            device.clone(),
            Arc::clone(&self.capture),
            sink,
            control,
            self.settings.read_policy.clone(),
        );
        self.stream_pool.submit(move || {
            worker.run();
        })?;
        Ok(())
    }

    /// Undo one activation: catalog flag and relay registration. Called
    /// without the workers lock held.
    fn deactivate(&self, id: i64, name: &str) {
        if let Err(e) = self.catalog.set_active(id, false) {
            log::warn!("could not mark device {} inactive: {}", name, e);
        }
        self.relay.release();
    }

    fn lock_workers(&self) -> MutexGuard<'_, HashMap<i64, WorkerSlot>> {
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
