use ferry_queue::{BufferQueue, QueueError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const PAUSE_STEP: Duration = Duration::from_millis(50);

/// Sleep for `duration`, waking early once `shutdown` is set.
pub(crate) fn pause(shutdown: &AtomicBool, duration: Duration) {
    let deadline = Instant::now() + duration;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep(PAUSE_STEP.min(deadline - now));
    }
}

/// Read errors that only mean "nothing arrived yet".
pub(crate) fn is_idle(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut | std::io::ErrorKind::Interrupted
    )
}

/// Refuse to attach a reader or worker to a queue that was already aborted.
pub(crate) fn ensure_open<T>(queue: &BufferQueue<T>) -> Result<(), QueueError> {
    if queue.is_aborted() {
        return Err(QueueError::Aborted);
    }
    Ok(())
}
