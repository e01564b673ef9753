//! Consumer side: a thread that drains a queue into a handler.

use crate::TransportError;
use crate::shutdown::ensure_open;
use ferry_queue::{BufferQueue, QueueError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// How long a worker waits for a buffer before re-checking its stop flag.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(2000);

pub struct ParseWorker {
    name: String,
    shutdown: Arc<AtomicBool>,
    thread_handle: Option<thread::JoinHandle<u64>>,
}

impl ParseWorker {
    /// Spawn a thread that hands every readable buffer to `handler`.
    ///
    /// The loop ends when [`stop`](Self::stop) is called or the queue is
    /// aborted. A zero `poll_timeout` is rejected since the loop would spin.
    pub fn spawn<T, F>(
        name: &str,
        queue: Arc<BufferQueue<T>>,
        poll_timeout: Duration,
        mut handler: F,
    ) -> Result<Self, TransportError>
    where
        T: Send + 'static,
        F: FnMut(&T) + Send + 'static,
    {
        if poll_timeout.is_zero() {
            return Err(TransportError::ZeroInterval("poll timeout"));
        }
        ensure_open(&queue)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();
        let worker_name = name.to_string();

        let thread_handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut handled = 0u64;
                while !shutdown_clone.load(Ordering::SeqCst) {
                    match queue.peek_readable(poll_timeout) {
                        Ok(slot) => {
                            handler(&*slot);
                            slot.release();
                            handled += 1;
                        }
                        Err(QueueError::Timeout) => {
                            tracing::trace!(worker = %worker_name, "No buffer within poll timeout");
                        }
                        Err(e) => {
                            tracing::debug!(worker = %worker_name, "Stopping: {}", e);
                            break;
                        }
                    }
                }
                handled
            })?;

        tracing::info!(worker = %name, "Parse worker started");

        Ok(Self {
            name: name.to_string(),
            shutdown,
            thread_handle: Some(thread_handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop the worker and return how many buffers it handled.
    ///
    /// Waits up to one poll timeout unless the queue has been aborted.
    pub fn stop(mut self) -> u64 {
        self.join()
    }

    fn join(&mut self) -> u64 {
        self.shutdown.store(true, Ordering::SeqCst);
        let Some(handle) = self.thread_handle.take() else {
            return 0;
        };
        match handle.join() {
            Ok(handled) => {
                tracing::info!(worker = %self.name, handled, "Parse worker stopped");
                handled
            }
            Err(_) => {
                tracing::error!(worker = %self.name, "Parse worker panicked");
                0
            }
        }
    }
}

impl Drop for ParseWorker {
    fn drop(&mut self) {
        self.join();
    }
}
