//! Callback dispatch.
//!
//! Progress and completion callbacks run on a [`SerialQueue`]: a dedicated
//! thread executing jobs one at a time in submission order. Because the queue
//! is FIFO, every progress callback of a retrieval runs before its completion.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::downloader::ProgressBlock;

type Job = Box<dyn FnOnce() + Send>;

// =============================================================================
// Serial Queue
// =============================================================================

/// A thread that runs submitted jobs serially.
///
/// The thread exits once the queue is dropped and its pending jobs are done.
pub struct SerialQueue {
    label: String,
    jobs: mpsc::UnboundedSender<Job>,
    thread_id: ThreadId,
}

impl SerialQueue {
    /// Spawn the queue's thread, named after `label`.
    pub fn new(label: impl Into<String>) -> io::Result<Self> {
        let label = label.into();
        let (jobs, mut rx) = mpsc::unbounded_channel::<Job>();

        let handle = thread::Builder::new()
            .name(label.clone())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    job();
                }
            })?;

        Ok(Self {
            label,
            jobs,
            thread_id: handle.thread().id(),
        })
    }

    /// Queue a job behind every job submitted before it.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        if let Err(mpsc::error::SendError(job)) = self.jobs.send(Box::new(job)) {
            // The thread only stops after the sender is gone; run inline if it died
            job();
        }
    }

    /// Whether the calling thread is this queue's thread.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialQueue")
            .field("label", &self.label)
            .finish()
    }
}

// =============================================================================
// Callback Queue
// =============================================================================

/// Where a retrieval delivers its callbacks.
#[derive(Debug, Clone, Default)]
pub enum CallbackQueue {
    /// The manager's main queue
    #[default]
    MainQueue,
    /// Whatever context the engine happens to be on when the callback fires
    Untouch,
    /// A caller-provided queue
    Queue(Arc<SerialQueue>),
}

impl CallbackQueue {
    /// Resolve against the manager's main queue. Done once per call.
    pub(crate) fn resolve(&self, main_queue: &Arc<SerialQueue>) -> Dispatcher {
        match self {
            CallbackQueue::MainQueue => Dispatcher(Some(main_queue.clone())),
            CallbackQueue::Untouch => Dispatcher(None),
            CallbackQueue::Queue(queue) => Dispatcher(Some(queue.clone())),
        }
    }
}

/// A resolved callback queue.
#[derive(Clone)]
pub(crate) struct Dispatcher(Option<Arc<SerialQueue>>);

impl Dispatcher {
    pub(crate) fn execute(&self, job: impl FnOnce() + Send + 'static) {
        match &self.0 {
            Some(queue) => queue.execute(job),
            None => job(),
        }
    }

    /// Wrap a progress block so each call is delivered on this queue.
    pub(crate) fn progress(&self, block: ProgressBlock) -> ProgressBlock {
        let dispatcher = self.clone();
        Arc::new(move |received: u64, total: Option<u64>| {
            let block = block.clone();
            dispatcher.execute(move || block(received, total));
        })
    }
}

// =============================================================================
// Completion
// =============================================================================

type CompletionFn<T> = Box<dyn FnOnce(T) + Send>;

/// Delivers a completion at most once, on a resolved queue.
pub(crate) struct CompletionOnce<T> {
    completion: Arc<Mutex<Option<CompletionFn<T>>>>,
    dispatcher: Dispatcher,
}

impl<T> Clone for CompletionOnce<T> {
    fn clone(&self) -> Self {
        Self {
            completion: self.completion.clone(),
            dispatcher: self.dispatcher.clone(),
        }
    }
}

impl<T: Send + 'static> CompletionOnce<T> {
    pub(crate) fn new(dispatcher: Dispatcher, completion: impl FnOnce(T) + Send + 'static) -> Self {
        Self {
            completion: Arc::new(Mutex::new(Some(Box::new(completion)))),
            dispatcher,
        }
    }

    /// Deliver `value`. Returns `false` if a value was already delivered.
    pub(crate) fn complete(&self, value: T) -> bool {
        // Queued under the lock so no pending job can slip in behind it
        let mut slot = self.completion.lock();
        let Some(completion) = slot.take() else {
            return false;
        };
        self.dispatcher.execute(move || completion(value));
        true
    }

    /// Queue `job` ahead of the completion. Dropped once the completion has
    /// been queued; returns whether `job` was queued.
    pub(crate) fn dispatch_if_pending(&self, job: impl FnOnce() + Send + 'static) -> bool {
        let slot = self.completion.lock();
        if slot.is_none() {
            return false;
        }
        self.dispatcher.execute(job);
        true
    }
}
