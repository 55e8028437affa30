//! Generation-counted background worker
//!
//! One worker thread executes submitted requests in order. Every submission
//! gets a generation number; a result is published only while its
//! generation is still the newest one submitted. Requests that are already
//! stale when the worker picks them up are skipped without running, so a
//! burst of resize events costs one layout pass, not one per event.
//!
//! Consumers never see partial output: a result is either published whole
//! into the shared slot or dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::{CancellationToken, SchedulerError};

/// Work function run on the worker thread.
///
/// Receives the request and the submission's cancellation token; it may
/// check the token and return early, in which case the output is discarded.
pub type Executor<Req, Out> = Arc<dyn Fn(Req, &CancellationToken) -> Out + Send + Sync>;

/// What became of a submission
#[derive(Debug)]
pub enum Outcome<Out> {
    /// The result was published and is now what `latest()` returns
    Published(Arc<Out>),
    /// A newer submission (or an explicit cancel) made this one obsolete
    Superseded,
}

impl<Out> Outcome<Out> {
    pub fn is_published(&self) -> bool {
        matches!(self, Outcome::Published(_))
    }

    pub fn published(self) -> Option<Arc<Out>> {
        match self {
            Outcome::Published(value) => Some(value),
            Outcome::Superseded => None,
        }
    }
}

/// Configuration for a [`GenerationWorker`]
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Worker thread name
    pub thread_name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            thread_name: "reader-worker".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn new(thread_name: impl Into<String>) -> Self {
        Self {
            thread_name: thread_name.into(),
        }
    }
}

/// Handle to one submission
#[derive(Debug)]
pub struct Ticket<Out> {
    generation: u64,
    token: CancellationToken,
    receiver: mpsc::Receiver<Outcome<Out>>,
}

impl<Out> Ticket<Out> {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Mark this submission as no longer wanted
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Block until the worker has published or discarded this submission
    pub fn wait(self) -> Result<Outcome<Out>, SchedulerError> {
        self.receiver
            .recv()
            .map_err(|_| SchedulerError::Disconnected)
    }

    /// Like [`wait`](Ticket::wait) but gives up after `timeout`
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<Outcome<Out>>, SchedulerError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(outcome) => Ok(Some(outcome)),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(SchedulerError::Disconnected),
        }
    }

    /// Non-blocking check; `Ok(None)` while the request is still pending
    pub fn try_result(&self) -> Result<Option<Outcome<Out>>, SchedulerError> {
        match self.receiver.try_recv() {
            Ok(outcome) => Ok(Some(outcome)),
            Err(mpsc::TryRecvError::Empty) => Ok(None),
            Err(mpsc::TryRecvError::Disconnected) => Err(SchedulerError::Disconnected),
        }
    }
}

struct Job<Req, Out> {
    generation: u64,
    request: Req,
    token: CancellationToken,
    reply: mpsc::Sender<Outcome<Out>>,
}

struct Published<Out> {
    generation: u64,
    value: Arc<Out>,
}

struct Shared<Out> {
    /// Newest generation handed out by `submit`
    submitted: AtomicU64,
    published: RwLock<Option<Published<Out>>>,
}

impl<Out> Shared<Out> {
    fn is_stale(&self, generation: u64) -> bool {
        generation < self.submitted.load(Ordering::Acquire)
    }

    fn publish(&self, generation: u64, token: &CancellationToken, value: Out) -> Outcome<Out> {
        let mut slot = self.published.write();
        // Checked under the slot lock so two results can never both land
        if token.is_cancelled() || self.is_stale(generation) {
            return Outcome::Superseded;
        }
        if slot.as_ref().is_some_and(|current| current.generation > generation) {
            return Outcome::Superseded;
        }
        let value = Arc::new(value);
        *slot = Some(Published {
            generation,
            value: Arc::clone(&value),
        });
        Outcome::Published(value)
    }
}

struct Submitter<Req, Out> {
    sender: mpsc::Sender<Job<Req, Out>>,
    current: Option<CancellationToken>,
}

/// Single background thread with last-writer-wins publication
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use reader_scheduler::{CancellationToken, GenerationWorker, WorkerConfig};
///
/// let worker = GenerationWorker::new(
///     Arc::new(|n: u32, _token: &CancellationToken| n * 2),
///     WorkerConfig::new("doubler"),
/// )
/// .unwrap();
///
/// let ticket = worker.submit(21).unwrap();
/// let outcome = ticket.wait().unwrap();
/// assert_eq!(*outcome.published().unwrap(), 42);
/// assert_eq!(worker.latest().as_deref(), Some(&42));
/// worker.shutdown().unwrap();
/// ```
pub struct GenerationWorker<Req, Out> {
    submitter: Mutex<Option<Submitter<Req, Out>>>,
    shared: Arc<Shared<Out>>,
    thread: Option<JoinHandle<()>>,
    name: String,
}

impl<Req, Out> GenerationWorker<Req, Out>
where
    Req: Send + 'static,
    Out: Send + Sync + 'static,
{
    /// Spawn the worker thread
    pub fn new(executor: Executor<Req, Out>, config: WorkerConfig) -> Result<Self, SchedulerError> {
        let (sender, receiver) = mpsc::channel::<Job<Req, Out>>();
        let shared = Arc::new(Shared {
            submitted: AtomicU64::new(0),
            published: RwLock::new(None),
        });

        let worker_shared = Arc::clone(&shared);
        let name = config.thread_name.clone();
        let thread = thread::Builder::new()
            .name(config.thread_name)
            .spawn(move || Self::run(receiver, executor, worker_shared))
            .map_err(SchedulerError::Spawn)?;

        debug!(worker = %name, "worker started");
        Ok(Self {
            submitter: Mutex::new(Some(Submitter {
                sender,
                current: None,
            })),
            shared,
            thread: Some(thread),
            name,
        })
    }

    /// Queue a request. Any earlier submission is cancelled and will not
    /// publish unless it already has.
    pub fn submit(&self, request: Req) -> Result<Ticket<Out>, SchedulerError> {
        let mut guard = self.submitter.lock();
        let submitter = guard.as_mut().ok_or(SchedulerError::ShutDown)?;

        // Generation bump and send happen under one lock, so jobs reach the
        // worker in generation order
        let generation = self.shared.submitted.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(previous) = submitter.current.take() {
            previous.cancel();
        }

        let token = CancellationToken::new();
        let (reply, receiver) = mpsc::channel();
        submitter
            .sender
            .send(Job {
                generation,
                request,
                token: token.clone(),
                reply,
            })
            .map_err(|_| SchedulerError::Disconnected)?;
        submitter.current = Some(token.clone());

        trace!(worker = %self.name, generation, "submitted");
        Ok(Ticket {
            generation,
            token,
            receiver,
        })
    }

    /// Most recently published result, if any
    pub fn latest(&self) -> Option<Arc<Out>> {
        self.shared
            .published
            .read()
            .as_ref()
            .map(|published| Arc::clone(&published.value))
    }

    /// Generation of the published result; 0 before the first publish
    pub fn latest_generation(&self) -> u64 {
        self.shared
            .published
            .read()
            .as_ref()
            .map_or(0, |published| published.generation)
    }

    /// Newest generation handed out by `submit`
    pub fn submitted_generation(&self) -> u64 {
        self.shared.submitted.load(Ordering::Acquire)
    }

    /// Stop accepting work, let the worker drain its queue and join it.
    pub fn shutdown(mut self) -> Result<(), SchedulerError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), SchedulerError> {
        // Dropping the sender ends the worker's receive loop
        self.submitter.lock().take();
        match self.thread.take() {
            Some(handle) => {
                handle.join().map_err(|_| SchedulerError::WorkerPanicked)?;
                debug!(worker = %self.name, "worker stopped");
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn run(
        receiver: mpsc::Receiver<Job<Req, Out>>,
        executor: Executor<Req, Out>,
        shared: Arc<Shared<Out>>,
    ) {
        while let Ok(job) = receiver.recv() {
            if job.token.is_cancelled() || shared.is_stale(job.generation) {
                trace!(generation = job.generation, "skipping stale request");
                let _ = job.reply.send(Outcome::Superseded);
                continue;
            }

            let output = executor(job.request, &job.token);
            let outcome = shared.publish(job.generation, &job.token, output);
            match &outcome {
                Outcome::Published(_) => trace!(generation = job.generation, "published"),
                Outcome::Superseded => {
                    debug!(generation = job.generation, "discarded superseded result")
                }
            }
            // The ticket may have been dropped; nobody is waiting then
            let _ = job.reply.send(outcome);
        }
    }
}

impl<Req, Out> Drop for GenerationWorker<Req, Out> {
    fn drop(&mut self) {
        self.submitter.lock().take();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn echo_worker() -> GenerationWorker<u32, u32> {
        GenerationWorker::new(Arc::new(|n: u32, _: &CancellationToken| n), WorkerConfig::default())
            .unwrap()
    }

    #[test]
    fn test_single_submission_publishes() {
        let worker = echo_worker();
        assert!(worker.latest().is_none());
        assert_eq!(worker.latest_generation(), 0);

        let ticket = worker.submit(7).unwrap();
        assert_eq!(ticket.generation(), 1);
        let outcome = ticket.wait().unwrap();
        assert!(outcome.is_published());
        assert_eq!(worker.latest().as_deref(), Some(&7));
        assert_eq!(worker.latest_generation(), 1);

        worker.shutdown().unwrap();
    }

    #[test]
    fn test_stale_requests_are_skipped() {
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let started_tx = Mutex::new(started_tx);
        let gate_rx = Mutex::new(gate_rx);
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_in_worker = Arc::clone(&runs);

        let worker = GenerationWorker::new(
            Arc::new(move |n: u32, _: &CancellationToken| {
                runs_in_worker.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    // Hold the worker until the rest are queued
                    let _ = started_tx.lock().send(());
                    let _ = gate_rx.lock().recv();
                }
                n
            }),
            WorkerConfig::new("gated"),
        )
        .unwrap();

        let first = worker.submit(0).unwrap();
        started_rx.recv().unwrap();
        let tickets: Vec<_> = (1..=5).map(|n| worker.submit(n).unwrap()).collect();
        gate_tx.send(()).unwrap();

        assert!(!first.wait().unwrap().is_published());
        let outcomes: Vec<bool> = tickets
            .into_iter()
            .map(|t| t.wait().unwrap().is_published())
            .collect();
        assert_eq!(outcomes, vec![false, false, false, false, true]);

        // The blocked request plus the newest one; the middle four never ran
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(worker.latest().as_deref(), Some(&5));
        assert_eq!(worker.latest_generation(), 6);
    }

    #[test]
    fn test_cancelled_ticket_does_not_publish() {
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate_rx = Mutex::new(gate_rx);
        let worker = GenerationWorker::new(
            Arc::new(move |n: u32, _: &CancellationToken| {
                let _ = gate_rx.lock().recv();
                n
            }),
            WorkerConfig::default(),
        )
        .unwrap();

        let ticket = worker.submit(1).unwrap();
        ticket.cancel();
        gate_tx.send(()).unwrap();

        assert!(!ticket.wait().unwrap().is_published());
        assert!(worker.latest().is_none());
    }

    #[test]
    fn test_executor_sees_cancellation_of_superseded_job() {
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let started_tx = Mutex::new(started_tx);
        let worker = GenerationWorker::new(
            Arc::new(move |n: u32, token: &CancellationToken| {
                if n == 1 {
                    let _ = started_tx.lock().send(());
                    while !token.is_cancelled() {
                        thread::sleep(Duration::from_millis(1));
                    }
                }
                n
            }),
            WorkerConfig::default(),
        )
        .unwrap();

        let first = worker.submit(1).unwrap();
        started_rx.recv().unwrap();
        let second = worker.submit(2).unwrap();

        assert!(!first.wait().unwrap().is_published());
        assert_eq!(*second.wait().unwrap().published().unwrap(), 2);
    }

    #[test]
    fn test_try_result_and_timeout() {
        let worker = echo_worker();
        let ticket = worker.submit(3).unwrap();
        let outcome = ticket
            .wait_timeout(Duration::from_secs(5))
            .unwrap()
            .expect("finished in time");
        assert!(outcome.is_published());
        // Already consumed
        let again = ticket.try_result();
        assert!(matches!(again, Ok(None) | Err(SchedulerError::Disconnected)));
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let mut worker = echo_worker();
        worker.stop().unwrap();
        assert!(matches!(worker.submit(1), Err(SchedulerError::ShutDown)));
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let worker = echo_worker();
        let mut tickets: Vec<_> = (0..3).map(|n| worker.submit(n).unwrap()).collect();
        worker.shutdown().unwrap();

        let last = tickets.pop().unwrap();
        for ticket in tickets {
            assert!(ticket.wait().is_ok());
        }
        assert_eq!(*last.wait().unwrap().published().unwrap(), 2);
    }

    #[test]
    fn test_drop_joins_worker() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_in_worker = Arc::clone(&runs);
        {
            let worker = GenerationWorker::new(
                Arc::new(move |n: u32, _: &CancellationToken| {
                    runs_in_worker.fetch_add(1, Ordering::SeqCst);
                    n
                }),
                WorkerConfig::default(),
            )
            .unwrap();
            worker.submit(1).unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
