//! The user callback thread: a single-consumer queue with a dedicated
//! worker, so listener code never runs under a wallet or chain lock.

use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Executor for user-visible callbacks. Events enqueued here run in
/// order on one thread that the framework never blocks on internally.
pub struct UserThread {
    sender: Mutex<Option<Sender<Job>>>,
    thread_id: OnceLock<ThreadId>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl UserThread {
    pub fn new() -> Arc<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        // The worker owns nothing but the receiver, so dropping the
        // executor (last sender) ends the thread.
        let handle = thread::Builder::new()
            .name("user-callbacks".into())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    job();
                }
            })
            .expect("spawn user callback thread");

        let executor = Arc::new(UserThread {
            sender: Mutex::new(Some(sender)),
            thread_id: OnceLock::new(),
            handle: Mutex::new(None),
        });
        executor
            .thread_id
            .set(handle.thread().id())
            .expect("fresh cell");
        *executor.handle.lock() = Some(handle);
        executor
    }

    /// Queue a callback. Callers must not hold any framework lock; the
    /// queue is unbounded so this never blocks.
    pub fn execute<F: FnOnce() + Send + 'static>(&self, job: F) {
        if let Some(sender) = self.sender.lock().as_ref() {
            // A shut-down executor silently drops late events.
            let _ = sender.send(Box::new(job));
        }
    }

    /// True when the caller is running inside a user callback.
    pub fn on_user_thread(&self) -> bool {
        self.thread_id.get().copied() == Some(thread::current().id())
    }

    /// Guard for framework entry points that block: calling one from a
    /// listener would deadlock the queue, which is a programming error.
    pub fn check_not_user_thread(&self, operation: &str) {
        if self.on_user_thread() {
            panic!(
                "{} called from a wallet/chain listener on the user callback \
                 thread; this would deadlock the event queue",
                operation
            );
        }
    }

    /// Stop accepting jobs and drain the queue.
    pub fn shutdown(&self) {
        let sender = self.sender.lock().take();
        drop(sender);
        if let Some(handle) = self.handle.lock().take() {
            if thread::current().id() != handle.thread().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for UserThread {
    fn drop(&mut self) {
        let sender = self.sender.lock().take();
        drop(sender);
    }
}
