//! Bounded worker pool.
//!
//! A fixed number of named threads pull jobs from a crossbeam channel. Thread
//! count never grows; when the queue is bounded and full, `submit` refuses the
//! job instead of blocking the caller.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool '{0}' queue is full")]
    Saturated(String),
    #[error("worker pool '{0}' is shut down")]
    Closed(String),
}

pub struct WorkerPool {
    name: String,
    size: usize,
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    busy: Arc<AtomicUsize>,
    /// Submitted jobs that have not finished yet (queued + running).
    in_flight: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Spawn `size` threads. `queue_capacity` of `None` means an unbounded queue.
    pub fn new(name: &str, size: usize, queue_capacity: Option<usize>) -> std::io::Result<Self> {
        let size = size.max(1);
        let (sender, receiver) = match queue_capacity {
            Some(capacity) => crossbeam_channel::bounded::<Job>(capacity),
            None => crossbeam_channel::unbounded::<Job>(),
        };
        let busy = Arc::new(AtomicUsize::new(0));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let receiver = receiver.clone();
            let busy = Arc::clone(&busy);
            let in_flight = Arc::clone(&in_flight);
            let pool_name = name.to_string();
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", name, index))
                .spawn(move || worker_loop(&pool_name, receiver, busy, in_flight))?;
            workers.push(handle);
        }

        Ok(Self {
            name: name.to_string(),
            size,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            busy,
            in_flight,
        })
    }

    pub fn submit<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = lock(&self.sender);
        let Some(sender) = sender.as_ref() else {
            return Err(PoolError::Closed(self.name.clone()));
        };
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let result = match sender.try_send(Box::new(job)) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Full(_)) => Err(PoolError::Saturated(self.name.clone())),
            Err(TrySendError::Disconnected(_)) => Err(PoolError::Closed(self.name.clone())),
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Jobs currently executing.
    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    /// Jobs waiting for a thread.
    pub fn queued(&self) -> usize {
        lock(&self.sender).as_ref().map_or(0, |sender| sender.len())
    }

    /// Poll until no job is queued or running. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    /// Stop accepting jobs, let queued jobs finish, and join every thread.
    pub fn shutdown(&self) {
        lock(&self.sender).take();
        let workers = std::mem::take(&mut *lock(&self.workers));
        for worker in workers {
            if worker.join().is_err() {
                log::error!("worker pool '{}': thread panicked during join", self.name);
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    name: &str,
    receiver: Receiver<Job>,
    busy: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
) {
    while let Ok(job) = receiver.recv() {
        busy.fetch_add(1, Ordering::SeqCst);
        if std::panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            log::error!("worker pool '{}': job panicked", name);
        }
        busy.fetch_sub(1, Ordering::SeqCst);
        in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn runs_submitted_jobs() {
        let pool = WorkerPool::new("test", 2, None).expect("pool");
        let (tx, rx) = mpsc::channel();
        for i in 0..4 {
            let tx = tx.clone();
            pool.submit(move || tx.send(i).expect("send")).expect("submit");
        }
        let mut seen: Vec<i32> = (0..4)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).expect("job ran"))
            .collect();
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn bounded_queue_reports_saturation() {
        let pool = WorkerPool::new("bounded", 1, Some(1)).expect("pool");
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();

        pool.submit(move || {
            started_tx.send(()).expect("send");
            let _ = release_rx.recv();
        })
        .expect("first job");
        started_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("first job started");

        pool.submit(|| {}).expect("queued job");
        assert_eq!(
            pool.submit(|| {}),
            Err(PoolError::Saturated("bounded".to_string()))
        );

        release_tx.send(()).expect("release");
        assert!(pool.wait_idle(Duration::from_secs(2)));
    }

    #[test]
    fn panicking_job_does_not_kill_the_thread() {
        let pool = WorkerPool::new("panics", 1, None).expect("pool");
        pool.submit(|| panic!("boom")).expect("submit");
        let (tx, rx) = mpsc::channel();
        pool.submit(move || tx.send(()).expect("send")).expect("submit");
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn submit_after_shutdown_is_refused() {
        let pool = WorkerPool::new("closed", 1, None).expect("pool");
        pool.shutdown();
        assert_eq!(pool.submit(|| {}), Err(PoolError::Closed("closed".to_string())));
    }
}
