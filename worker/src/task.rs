//! This module provides the asynchronous task abstraction and the worker pool executing it.

use std::any::Any;
use std::num::NonZeroU8;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::{self, Future, FutureExt};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

pub const DEFAULT_POOL_SIZE: NonZeroU8 = unsafe { NonZeroU8::new_unchecked(4) };

/// A submitted task, ready to run on the blocking thread pool.
struct Job {
    handle: TaskHandle,
    run: Box<dyn FnOnce() -> Completion + Send>,
}

/// A unit of deferred work executed by a [`Pool`].
///
/// A task captures everything it needs when created on the owning thread. Once submitted, it is moved to a worker thread to [`run`](AsyncTask::run),
/// then moved back to the owning thread where exactly one of [`on_completion`](AsyncTask::on_completion) or [`on_error`](AsyncTask::on_error) is
/// called, from [`Pool::collect_completions()`] or [`Pool::wait_completion()`].
pub trait AsyncTask: Send + 'static {
    type Output: Send + 'static;
    type Error: std::error::Error + Send + 'static;

    /// Execute the task on a worker thread.
    ///
    /// It must only touch data captured by the task itself.
    fn run(&mut self) -> Result<Self::Output, Self::Error>;

    /// Handle a successful run on the owning thread.
    fn on_completion(self, output: Self::Output);

    /// Handle a failed or panicked run on the owning thread.
    fn on_error(self, error: TaskError<Self::Error>);
}

#[derive(Debug, Error)]
pub enum TaskError<E> {
    #[error(transparent)]
    Failed(E),
    #[error("task panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("pool is not running")]
    NotRunning,
}

/// Task lifecycle.
///
/// Transitions are one-directional: `Created → Queued → Running → Completed | Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Created,
    Queued,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Queued,
            2 => Self::Running,
            3 => Self::Completed,
            _ => Self::Failed,
        }
    }
}

/// An observable handle on a submitted task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: u64,
    state: Arc<AtomicU8>,
}

impl TaskHandle {
    fn new(id: u64) -> Self {
        Self {
            id,
            state: Arc::new(AtomicU8::new(TaskState::Created as u8)),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Return `true` once the task outcome has been delivered on the owning thread.
    #[inline]
    pub fn is_finished(&self) -> bool {
        matches!(self.state(), TaskState::Completed | TaskState::Failed)
    }

    fn fail(&self) {
        self.state.store(TaskState::Failed as u8, Ordering::Release);
    }

    fn advance(&self, from: TaskState, to: TaskState) {
        let advanced = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        debug_assert!(advanced, "task #{} cannot move from {:?} to {to:?}", self.id, self.state());
    }
}

/// The outcome of a task run, waiting to be dispatched on the owning thread.
struct Completion {
    id: u64,
    dispatch: Box<dyn FnOnce() + Send>,
}

impl Completion {
    /// Outcome of a task whose run was cancelled by the runtime, along with the task itself.
    ///
    /// Neither of the task hooks can be called anymore: the handle is marked as failed so that the loss stays observable.
    fn lost(handle: TaskHandle) -> Self {
        Self {
            id: handle.id,
            dispatch: Box::new(move || {
                tracing::error!("Task #{} lost before completion", handle.id);
                handle.fail();
            }),
        }
    }
}

/// A worker pool running [`AsyncTask`]s in the background.
///
/// Each worker pulls tasks from a shared unbounded queue and runs them on the blocking thread pool of the current tokio runtime,
/// so that CPU-heavy work never stalls the async workers. Outcomes are sent back through a completion channel that the owning thread
/// drains whenever it sees fit, typically once per tick. Completions are then dispatched one at a time, in the order tasks finished.
///
/// # Example
/// ```
/// # tokio_test::block_on(async {
/// # use chunk_worker::task::{AsyncTask, Pool, TaskError};
/// struct Square(u64);
///
/// impl AsyncTask for Square {
///     type Output = u64;
///     type Error = std::io::Error;
///
///     fn run(&mut self) -> Result<u64, Self::Error> {
///         Ok(self.0 * self.0)
///     }
///
///     fn on_completion(self, output: u64) {
///         println!("{}² = {output}", self.0);
///     }
///
///     fn on_error(self, error: TaskError<Self::Error>) {
///         eprintln!("{error}");
///     }
/// }
///
/// let mut pool = Pool::default();
/// pool.start(3.try_into().unwrap());
///
/// for i in 0..=5 {
///     pool.submit(Square(i)).unwrap();
/// }
///
/// pool.close().await;
/// # })
/// ```
#[derive(Debug)]
pub struct Pool {
    /// The pool of workers.
    workers: Vec<Worker>,
    /// The sending part of a channel to push tasks to the workers.
    ///
    /// The next available worker will wait for a task to be received through the channel.
    sender: Option<mpsc::UnboundedSender<Job>>,
    /// Both parts of the channel bringing task outcomes back to the owning thread.
    completions: (mpsc::UnboundedSender<Completion>, mpsc::UnboundedReceiver<Completion>),
    /// Number of submitted tasks whose outcome has not been dispatched yet.
    pending: AtomicUsize,
    next_id: AtomicU64,
}

impl Default for Pool {
    fn default() -> Self {
        Self {
            workers: vec![],
            sender: None,
            completions: mpsc::unbounded_channel(),
            pending: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
        }
    }
}

impl Pool {
    /// Start a pool with `size` workers.
    ///
    /// It must be called within a tokio runtime context.
    ///
    /// # Panics
    /// This method panics if the pool is already running, ie. when called more than once without stopping the pool in between.
    pub fn start(&mut self, size: NonZeroU8) {
        assert!(self.sender.is_none() && self.workers.is_empty());

        let (sender, receiver) = mpsc::unbounded_channel();

        let receiver = Arc::new(Mutex::new(receiver));

        static WORKER_ID: AtomicUsize = AtomicUsize::new(0);
        let size = size.get().into();
        let id = WORKER_ID.fetch_add(size, Ordering::Relaxed);

        self.workers = (0..size)
            .map(|i| Worker::new(id.wrapping_add(i), Arc::clone(&receiver), self.completions.0.clone()))
            .collect();
        self.sender = Some(sender);
    }

    /// Return `true` while the pool accepts tasks.
    #[inline]
    pub fn is_running(&self) -> bool {
        self.sender.is_some()
    }

    /// Number of submitted tasks whose outcome has not been dispatched on the owning thread yet.
    #[inline]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Queue a task for execution and return immediately.
    ///
    /// The queue is unbounded: a saturated pool only delays the task completion.
    pub fn submit<T: AsyncTask>(&self, task: T) -> Result<TaskHandle, PoolError> {
        let sender = self.sender.as_ref().ok_or(PoolError::NotRunning)?;

        let handle = TaskHandle::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let job = Self::job(task, handle.clone());

        handle.advance(TaskState::Created, TaskState::Queued);

        // workers are gone if their runtime has been shut down in the meantime
        sender.send(job).map_err(|_| PoolError::NotRunning)?;

        self.pending.fetch_add(1, Ordering::AcqRel);

        tracing::trace!("Submitted task #{}", handle.id);

        Ok(handle)
    }

    fn job<T: AsyncTask>(mut task: T, handle: TaskHandle) -> Job {
        Job {
            handle: handle.clone(),
            run: Box::new(move || {
                handle.advance(TaskState::Queued, TaskState::Running);

                let outcome = match panic::catch_unwind(AssertUnwindSafe(|| task.run())) {
                    Ok(Ok(output)) => Ok(output),
                    Ok(Err(error)) => Err(TaskError::Failed(error)),
                    Err(payload) => Err(TaskError::Panicked(panic_message(payload))),
                };

                Completion {
                    id: handle.id,
                    dispatch: Box::new(move || match outcome {
                        Ok(output) => {
                            handle.advance(TaskState::Running, TaskState::Completed);
                            task.on_completion(output);
                        }
                        Err(error) => {
                            handle.advance(TaskState::Running, TaskState::Failed);
                            task.on_error(error);
                        }
                    }),
                }
            }),
        }
    }

    /// Dispatch every task outcome available so far, without waiting.
    ///
    /// This is meant to be called on the owning thread, typically once per tick. Return the number of dispatched outcomes.
    pub fn collect_completions(&mut self) -> usize {
        let mut count = 0;

        while let Ok(completion) = self.completions.1.try_recv() {
            self.dispatch(completion);
            count += 1;
        }

        count
    }

    /// Wait for the next task outcome and dispatch it.
    ///
    /// Return `false` right away if no task is pending.
    pub async fn wait_completion(&mut self) -> bool {
        if self.pending() == 0 {
            return false;
        }

        // the pool keeps a sender alive, the channel cannot be closed
        match self.completions.1.recv().await {
            Some(completion) => {
                self.dispatch(completion);
                true
            }
            None => false,
        }
    }

    /// Wait for every pending task outcome and dispatch them.
    pub async fn drain(&mut self) {
        while self.wait_completion().await {}
    }

    fn dispatch(&self, completion: Completion) {
        tracing::trace!("Dispatching completion of task #{}", completion.id);

        self.pending.fetch_sub(1, Ordering::AcqRel);
        (completion.dispatch)();
    }

    /// Stop current pool of workers, waiting for all pending tasks to complete and dispatching their outcome.
    ///
    /// Once stopped, the pool can be started again with any number of workers.
    pub async fn stop(&mut self) {
        drop(self.sender.take());
        let workers = std::mem::take(&mut self.workers);

        future::join_all(workers.into_iter().inspect(|worker| {
            tracing::debug!("Stopping worker {}...", worker.id);
        }))
        .await;

        self.collect_completions();
    }

    /// Close current pool of workers, waiting for all pending tasks to complete and dispatching their outcome.
    ///
    /// Once closed, the pool cannot be used since it is consumed.
    pub async fn close(mut self) {
        self.stop().await
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(msg) => *msg,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(msg) => msg.to_string(),
            Err(_) => String::from("unknown panic payload"),
        },
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    handle: tokio::task::JoinHandle<()>,
}

impl Worker {
    fn new(id: usize, receiver: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>, completions: mpsc::UnboundedSender<Completion>) -> Worker {
        tracing::debug!("Starting worker {id}...");

        Worker {
            id,
            handle: tokio::spawn(async move {
                loop {
                    let message = receiver.lock().await.recv().await;

                    match message {
                        Some(Job { handle, run }) => {
                            tracing::debug!("Executing task #{} on worker {id}...", handle.id);

                            let completion = match tokio::task::spawn_blocking(run).await {
                                Ok(completion) => completion,
                                Err(e) => {
                                    tracing::error!("Task #{} lost on worker {id}: {e}", handle.id);
                                    Completion::lost(handle)
                                }
                            };

                            // the receiving part lives as long as the pool itself
                            let _ = completions.send(completion);
                        }
                        None => {
                            tracing::debug!("All tasks exhausted, shutting down worker {id}.");
                            break;
                        }
                    }
                }
            }),
        }
    }
}

impl Future for Worker {
    type Output = Result<(), tokio::task::JoinError>;

    #[inline]
    fn poll(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<Self::Output> {
        self.handle.poll_unpin(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    enum Event {
        Completed(u32, u32),
        Failed(u32, String),
    }

    #[derive(Debug, Error)]
    #[error("odd input {0}")]
    struct OddInput(u32);

    struct Double {
        input: u32,
        events: Arc<StdMutex<Vec<Event>>>,
    }

    impl Double {
        fn new(input: u32, events: &Arc<StdMutex<Vec<Event>>>) -> Self {
            Self {
                input,
                events: Arc::clone(events),
            }
        }
    }

    impl AsyncTask for Double {
        type Output = u32;
        type Error = OddInput;

        fn run(&mut self) -> Result<u32, OddInput> {
            match self.input {
                13 => panic!("unlucky input"),
                i if i % 2 == 1 => Err(OddInput(i)),
                i => Ok(i * 2),
            }
        }

        fn on_completion(self, output: u32) {
            self.events.lock().unwrap().push(Event::Completed(self.input, output));
        }

        fn on_error(self, error: TaskError<OddInput>) {
            self.events.lock().unwrap().push(Event::Failed(self.input, error.to_string()));
        }
    }

    fn started(size: u8) -> Pool {
        let mut pool = Pool::default();
        pool.start(size.try_into().unwrap());
        pool
    }

    #[test]
    fn test_submit_not_running() {
        let pool = Pool::default();
        let events = Arc::default();

        assert!(!pool.is_running());
        assert_eq!(pool.submit(Double::new(2, &events)).unwrap_err(), PoolError::NotRunning);
        assert_eq!(pool.pending(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    #[tracing_test::traced_test]
    async fn test_completion() {
        let mut pool = started(2);
        let events = Arc::default();

        let handle = pool.submit(Double::new(4, &events)).unwrap();
        assert_eq!(pool.pending(), 1);

        assert!(pool.wait_completion().await);

        assert_eq!(handle.state(), TaskState::Completed);
        assert_eq!(*events.lock().unwrap(), [Event::Completed(4, 8)]);
        assert_eq!(pool.pending(), 0);
        assert!(!pool.wait_completion().await);

        pool.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_error() {
        let mut pool = Pool::default();
        pool.start(DEFAULT_POOL_SIZE);
        let events = Arc::default();

        let handle = pool.submit(Double::new(3, &events)).unwrap();
        pool.drain().await;

        assert_eq!(handle.state(), TaskState::Failed);
        assert_eq!(*events.lock().unwrap(), [Event::Failed(3, String::from("odd input 3"))]);

        pool.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_panic_is_delivered_as_error() {
        let mut pool = started(1);
        let events = Arc::default();

        let handle = pool.submit(Double::new(13, &events)).unwrap();
        pool.drain().await;

        assert_eq!(handle.state(), TaskState::Failed);
        assert_eq!(
            *events.lock().unwrap(),
            [Event::Failed(13, String::from("task panicked: unlucky input"))]
        );

        // the worker survived the panic
        pool.submit(Double::new(6, &events)).unwrap();
        pool.drain().await;

        assert_eq!(events.lock().unwrap().last(), Some(&Event::Completed(6, 12)));

        pool.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_outcomes_dispatched_once_each() {
        let mut pool = started(4);
        let events = Arc::default();

        let handles: Vec<_> = (0..64).map(|i| pool.submit(Double::new(i, &events)).unwrap()).collect();

        let mut dispatched = 0;
        while pool.pending() > 0 {
            dispatched += pool.collect_completions();
            tokio::task::yield_now().await;
        }

        assert_eq!(dispatched, 64);
        assert!(handles.iter().all(TaskHandle::is_finished));

        let mut events = std::mem::take(&mut *events.lock().unwrap());
        events.sort_by_key(|event| match event {
            Event::Completed(i, _) | Event::Failed(i, _) => *i,
        });

        assert_eq!(events.len(), 64);
        for (i, event) in (0..).zip(&events) {
            match event {
                Event::Completed(input, output) => assert_eq!((*input, *output), (i, i * 2)),
                Event::Failed(input, _) => assert!(*input == i && (i % 2 == 1 || i == 13)),
            }
        }

        pool.close().await;
    }

    #[tokio::test]
    async fn test_stop_dispatches_pending() {
        let mut pool = started(2);
        let events = Arc::default();

        for i in 0..4 {
            pool.submit(Double::new(i * 2, &events)).unwrap();
        }

        pool.stop().await;

        assert!(!pool.is_running());
        assert_eq!(pool.pending(), 0);
        assert_eq!(events.lock().unwrap().len(), 4);

        pool.start(1.try_into().unwrap());
        pool.submit(Double::new(10, &events)).unwrap();
        pool.close().await;

        assert_eq!(events.lock().unwrap().last(), Some(&Event::Completed(10, 20)));
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_lost_task_is_accounted() {
        let mut pool = Pool::default();

        let handle = TaskHandle::new(7);
        handle.advance(TaskState::Created, TaskState::Queued);
        pool.pending.fetch_add(1, Ordering::AcqRel);

        assert!(pool.completions.0.send(Completion::lost(handle.clone())).is_ok());

        assert!(pool.wait_completion().await);
        assert_eq!(pool.pending(), 0);
        assert_eq!(handle.state(), TaskState::Failed);
        assert!(handle.is_finished());
        assert!(logs_contain("Task #7 lost before completion"));

        assert!(!pool.wait_completion().await);
    }

    #[test]
    fn test_handle_state() {
        let handle = TaskHandle::new(1);

        assert_eq!(handle.state(), TaskState::Created);
        handle.advance(TaskState::Created, TaskState::Queued);
        handle.advance(TaskState::Queued, TaskState::Running);
        assert!(!handle.is_finished());
        handle.advance(TaskState::Running, TaskState::Completed);
        assert!(handle.is_finished());
    }
}
