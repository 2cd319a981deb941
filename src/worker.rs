//! Per-device stream worker.
//!
//! Opening -> Reading -> (Sampling | Draining) -> Closing
//!
//! The worker owns its capture handle, frame channel, sampling gate and sink.
//! It polls its `WorkerControl` at the top of every read and exits on its own;
//! nothing interrupts it mid-read.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::device::DeviceDescriptor;
use crate::dispatch::DispatchSink;
use crate::frame::FrameChannel;
use crate::ingest::{CaptureBackend, CaptureError, CaptureSource};
use crate::sampling::SamplingGate;

/// Shared between the engine and one worker.
#[derive(Debug)]
pub struct WorkerControl {
    running: AtomicBool,
    alive: AtomicBool,
}

impl WorkerControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            running: AtomicBool::new(true),
            alive: AtomicBool::new(true),
        })
    }

    /// Whether the device is still flagged active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether the worker has not exited yet.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Ask the worker to stop at its next loop boundary.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub(crate) fn revive(&self) {
        self.alive.store(true, Ordering::SeqCst);
    }
}

/// Why a worker ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerExit {
    /// The device was stopped.
    Stopped,
    /// The stream could not be opened or failed permanently.
    SourceUnavailable,
    /// The stream ended or kept returning no frames.
    StreamEnded,
}

impl std::fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            WorkerExit::Stopped => "stopped",
            WorkerExit::SourceUnavailable => "source unavailable",
            WorkerExit::StreamEnded => "stream ended",
        };
        f.write_str(text)
    }
}

#[derive(Clone, Debug)]
pub struct ReadPolicy {
    /// Consecutive `NoFrame` results tolerated before the stream counts as ended.
    pub max_read_misses: u32,
    pub retry_delay: Duration,
}

impl Default for ReadPolicy {
    fn default() -> Self {
        Self {
            max_read_misses: 50,
            retry_delay: Duration::from_millis(100),
        }
    }
}

pub struct StreamWorker {
    device: DeviceDescriptor,
    capture: Arc<dyn CaptureBackend>,
    sink: Box<dyn DispatchSink>,
    control: Arc<WorkerControl>,
    policy: ReadPolicy,
}

impl StreamWorker {
    pub fn new(
        device: DeviceDescriptor,
        capture: Arc<dyn CaptureBackend>,
        sink: Box<dyn DispatchSink>,
        control: Arc<WorkerControl>,
        policy: ReadPolicy,
    ) -> Self {
        Self {
            device,
            capture,
            sink,
            control,
            policy,
        }
    }

    /// Run until the device is stopped or the stream fails.
    pub fn run(mut self) -> WorkerExit {
        let _alive = AliveGuard(Arc::clone(&self.control));
        log::info!("starting streaming for device {}", self.device.name);

        let exit = self.run_stream();
        self.sink.finish();

        log::info!("streaming for device {} ended: {}", self.device.name, exit);
        exit
    }

    fn run_stream(&mut self) -> WorkerExit {
        // Seeded before opening so the first snapshot waits a full interval.
        let mut gate = SamplingGate::new(self.device.interval());

        if !self.control.is_running() {
            return WorkerExit::Stopped;
        }

        // Opening
        let source = match self.capture.open(&self.device.stream_address) {
            Ok(source) => source,
            Err(e) => {
                log::error!(
                    "error while opening stream for device {} ({}): {}",
                    self.device.name,
                    self.device.stream_address,
                    e
                );
                return WorkerExit::SourceUnavailable;
            }
        };

        // Closing happens when the guard drops, on every path.
        let mut source = CaptureGuard(source);
        self.read_loop(&mut *source.0, &mut gate)
    }

    fn read_loop(&mut self, source: &mut dyn CaptureSource, gate: &mut SamplingGate) -> WorkerExit {
        let mut channel = FrameChannel::new();
        let mut misses = 0u32;

        while self.control.is_running() {
            // Reading
            let frame = match source.read() {
                Ok(frame) => frame,
                Err(CaptureError::NoFrame) => {
                    misses += 1;
                    log::warn!(
                        "failed to capture frame from {} ({}/{})",
                        self.device.name,
                        misses,
                        self.policy.max_read_misses
                    );
                    if misses >= self.policy.max_read_misses {
                        return WorkerExit::StreamEnded;
                    }
                    std::thread::sleep(self.policy.retry_delay);
                    continue;
                }
                Err(CaptureError::Ended) => {
                    log::error!(
                        "stream of {} ended ({})",
                        self.device.name,
                        self.device.stream_address
                    );
                    return WorkerExit::StreamEnded;
                }
                Err(e @ CaptureError::SourceUnavailable(_)) => {
                    log::error!("error while reading stream for {}: {}", self.device.name, e);
                    return WorkerExit::SourceUnavailable;
                }
            };
            misses = 0;

            // Sampling
            channel.push(frame);
            if !gate.poll(Instant::now()) {
                continue;
            }
            let Some(latest) = channel.take_latest() else {
                log::error!("no frames in queue for {}", self.device.name);
                continue;
            };
            let taken_at = chrono::Local::now().naive_local();
            if let Err(e) = self.sink.dispatch(&latest, taken_at) {
                log::error!("error while saving frame for {}: {}", self.device.name, e);
            }
        }

        // Draining: the device was stopped.
        WorkerExit::Stopped
    }
}

struct CaptureGuard(Box<dyn CaptureSource>);

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        self.0.close();
    }
}

struct AliveGuard(Arc<WorkerControl>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.alive.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchError;
    use crate::frame::Frame;
    use chrono::NaiveDateTime;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU64;
    use std::sync::Mutex;

    #[derive(Default)]
    struct SourceTally {
        opened: AtomicU64,
        closed: AtomicU64,
    }

    /// Scripted capture: replays `script`, then reports Ended.
    struct ScriptedBackend {
        tally: Arc<SourceTally>,
        script: Mutex<Vec<Result<(), &'static str>>>,
        refuse: bool,
    }

    struct ScriptedSource {
        tally: Arc<SourceTally>,
        script: VecDeque<Result<(), &'static str>>,
        frames: u64,
    }

    impl CaptureBackend for ScriptedBackend {
        fn open(&self, _address: &str) -> Result<Box<dyn CaptureSource>, CaptureError> {
            if self.refuse {
                return Err(CaptureError::SourceUnavailable("refused".into()));
            }
            self.tally.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedSource {
                tally: Arc::clone(&self.tally),
                script: self.script.lock().unwrap().drain(..).collect(),
                frames: 0,
            }))
        }
    }

    impl CaptureSource for ScriptedSource {
        fn read(&mut self) -> Result<Frame, CaptureError> {
            match self.script.pop_front() {
                Some(Ok(())) => {
                    self.frames += 1;
                    Ok(Frame::new(vec![0; 2 * 2 * 3], 2, 2))
                }
                Some(Err("miss")) => Err(CaptureError::NoFrame),
                Some(Err(_)) => Err(CaptureError::SourceUnavailable("lost".into())),
                None => Err(CaptureError::Ended),
            }
        }

        fn close(&mut self) {
            self.tally.closed.fetch_add(1, Ordering::SeqCst);
        }

        fn frames_captured(&self) -> u64 {
            self.frames
        }
    }

    #[derive(Default)]
    struct CountingSink {
        dispatched: Arc<AtomicU64>,
        finished: Arc<AtomicBool>,
    }

    impl DispatchSink for CountingSink {
        fn dispatch(&mut self, _frame: &Frame, _at: NaiveDateTime) -> Result<(), DispatchError> {
            self.dispatched.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn finish(&mut self) {
            self.finished.store(true, Ordering::SeqCst);
        }
    }

    fn worker_for(
        backend: ScriptedBackend,
        sink: CountingSink,
        control: Arc<WorkerControl>,
        max_read_misses: u32,
    ) -> StreamWorker {
        StreamWorker::new(
            DeviceDescriptor::new(1, "cam1", "stub://cam1", "", 60),
            Arc::new(backend),
            Box::new(sink),
            control,
            ReadPolicy {
                max_read_misses,
                retry_delay: Duration::ZERO,
            },
        )
    }

    fn backend(tally: &Arc<SourceTally>, script: Vec<Result<(), &'static str>>) -> ScriptedBackend {
        ScriptedBackend {
            tally: Arc::clone(tally),
            script: Mutex::new(script),
            refuse: false,
        }
    }

    #[test]
    fn open_failure_exits_without_touching_control() {
        let tally = Arc::new(SourceTally::default());
        let control = WorkerControl::new();
        let mut refusing = backend(&tally, Vec::new());
        refusing.refuse = true;

        let exit = worker_for(refusing, CountingSink::default(), Arc::clone(&control), 3).run();

        assert_eq!(exit, WorkerExit::SourceUnavailable);
        assert!(control.is_running(), "active flag is owned by the caller");
        assert!(!control.is_alive());
    }

    #[test]
    fn end_of_stream_closes_capture() {
        let tally = Arc::new(SourceTally::default());
        let control = WorkerControl::new();
        let sink = CountingSink::default();
        let finished = Arc::clone(&sink.finished);

        let exit = worker_for(
            backend(&tally, vec![Ok(()), Ok(()), Ok(())]),
            sink,
            Arc::clone(&control),
            3,
        )
        .run();

        assert_eq!(exit, WorkerExit::StreamEnded);
        assert_eq!(tally.opened.load(Ordering::SeqCst), 1);
        assert_eq!(tally.closed.load(Ordering::SeqCst), 1);
        assert!(finished.load(Ordering::SeqCst));
        assert!(!control.is_alive());
    }

    #[test]
    fn transient_misses_are_retried_then_bounded() {
        let tally = Arc::new(SourceTally::default());
        let script = vec![Err("miss"), Ok(()), Err("miss"), Err("miss"), Err("miss")];
        let exit = worker_for(
            backend(&tally, script),
            CountingSink::default(),
            WorkerControl::new(),
            3,
        )
        .run();

        assert_eq!(exit, WorkerExit::StreamEnded);
        assert_eq!(tally.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn read_failure_closes_capture() {
        let tally = Arc::new(SourceTally::default());
        let exit = worker_for(
            backend(&tally, vec![Ok(()), Err("lost")]),
            CountingSink::default(),
            WorkerControl::new(),
            3,
        )
        .run();

        assert_eq!(exit, WorkerExit::SourceUnavailable);
        assert_eq!(tally.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stopped_worker_never_opens() {
        let tally = Arc::new(SourceTally::default());
        let control = WorkerControl::new();
        control.stop();

        let exit = worker_for(
            backend(&tally, vec![Ok(())]),
            CountingSink::default(),
            control,
            3,
        )
        .run();

        assert_eq!(exit, WorkerExit::Stopped);
        assert_eq!(tally.opened.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn no_dispatch_before_first_interval() {
        let tally = Arc::new(SourceTally::default());
        let sink = CountingSink::default();
        let dispatched = Arc::clone(&sink.dispatched);

        worker_for(
            backend(&tally, vec![Ok(()); 20]),
            sink,
            WorkerControl::new(),
            3,
        )
        .run();

        assert_eq!(dispatched.load(Ordering::SeqCst), 0);
    }
}
