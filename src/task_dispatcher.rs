//! A dedicated background thread that runs listener notifications one at a time, in the order they
//! were submitted.
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{mpsc, Mutex},
    thread::JoinHandle,
};

use crate::{listeners::panic_message, Error, Result};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Serial executor for notification tasks.
///
/// Keeping listener code on its own thread means that a slow or misbehaving listener never blocks
/// the thread that detected a change, at the cost of serializing all listener work.
pub(crate) struct TaskDispatcher {
    /// `None` once the dispatcher is shut down.
    sender: Mutex<Option<mpsc::Sender<Task>>>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskDispatcher {
    pub(crate) const THREAD_NAME: &'static str = "flagpulse-tasks";

    /// Start the dispatch thread.
    ///
    /// `priority` is accepted for configuration compatibility but has no effect: std threads do not
    /// expose scheduling priority.
    pub(crate) fn start(priority: Option<i32>) -> std::io::Result<TaskDispatcher> {
        if let Some(priority) = priority {
            log::debug!(target: "flagpulse", priority; "thread priority is not supported on this platform, ignoring");
        }

        let (sender, receiver) = mpsc::channel::<Task>();

        let join_handle = std::thread::Builder::new()
            .name(TaskDispatcher::THREAD_NAME.to_owned())
            .spawn(move || {
                // Loop ends when all senders are dropped.
                while let Ok(task) = receiver.recv() {
                    if let Err(panic) = catch_unwind(AssertUnwindSafe(task)) {
                        log::warn!(target: "flagpulse",
                                   "unexpected panic in notification task: {}", panic_message(&*panic));
                    }
                }
                log::debug!(target: "flagpulse", "task dispatcher stopped");
            })?;

        Ok(TaskDispatcher {
            sender: Mutex::new(Some(sender)),
            join_handle: Mutex::new(Some(join_handle)),
        })
    }

    /// Queue `task` for execution. Tasks submitted after shutdown are discarded.
    pub(crate) fn submit(&self, task: impl FnOnce() + Send + 'static) {
        let sender = self
            .sender
            .lock()
            .expect("thread holding dispatcher lock should not panic");

        let Some(sender) = sender.as_ref() else {
            log::debug!(target: "flagpulse", "task dispatcher is shut down, discarding notification");
            return;
        };

        // Error means the dispatch thread has exited. There's nothing useful we can do.
        let _ = sender.send(Box::new(task));
    }

    /// Stop accepting tasks, run the ones already queued, and wait for the thread to exit.
    ///
    /// Calling it from a listener (i.e., on the dispatch thread itself) does not wait.
    pub(crate) fn shutdown(&self) -> Result<()> {
        // Dropping the sender disconnects the channel once the queue is drained.
        self.sender
            .lock()
            .expect("thread holding dispatcher lock should not panic")
            .take();

        let join_handle = self
            .join_handle
            .lock()
            .expect("thread holding dispatcher lock should not panic")
            .take();

        let Some(join_handle) = join_handle else {
            return Ok(());
        };

        if join_handle.thread().id() == std::thread::current().id() {
            return Ok(());
        }

        join_handle
            .join()
            .map_err(|_| Error::ThreadPanicked(TaskDispatcher::THREAD_NAME))
    }
}
