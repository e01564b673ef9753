//! In-process producer/consumer run for observing a policy under load.

use crate::config::Settings;
use ferry_queue::BufferQueue;
use ferry_transport::{ParseWorker, StreamBuffer};
use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoakReport {
    pub produced: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub out_of_order: u64,
    pub elapsed: Duration,
}

/// Push `messages` sequence numbers through a queue drained by a parser that
/// sleeps `consumer_delay` per buffer.
pub fn run_soak(
    settings: &Settings,
    messages: u64,
    consumer_delay: Duration,
) -> Result<SoakReport, Box<dyn Error>> {
    let size = settings.buffer_size.max(8);
    let queue = Arc::new(BufferQueue::with_factory(settings.queue, || {
        StreamBuffer::with_size(size)
    })?);

    let out_of_order = Arc::new(AtomicU64::new(0));
    let out_of_order_clone = out_of_order.clone();
    let mut last_seen: Option<u64> = None;

    let worker = ParseWorker::spawn(
        "ferry-soak-parser",
        queue.clone(),
        settings.poll_timeout(),
        move |buf: &StreamBuffer| {
            let mut seq = [0u8; 8];
            seq.copy_from_slice(&buf.as_bytes()[..8]);
            let seq = u64::from_be_bytes(seq);
            if last_seen.is_some_and(|last| seq <= last) {
                out_of_order_clone.fetch_add(1, Ordering::Relaxed);
            }
            last_seen = Some(seq);
            if !consumer_delay.is_zero() {
                thread::sleep(consumer_delay);
            }
        },
    )?;

    tracing::info!(
        messages,
        policy = %settings.queue.policy,
        capacity = settings.queue.capacity,
        "Starting soak run"
    );

    let started = Instant::now();
    for seq in 0..messages {
        let mut slot = queue.peek_writable()?;
        slot.fill(&seq.to_be_bytes());
        slot.push();
    }

    loop {
        let stats = queue.stats();
        if stats.readable == 0 && stats.reading == 0 {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    let elapsed = started.elapsed();

    queue.abort();
    let delivered = worker.stop();

    let report = SoakReport {
        produced: messages,
        delivered,
        dropped: queue.stats().dropped,
        out_of_order: out_of_order.load(Ordering::Relaxed),
        elapsed,
    };
    tracing::info!(?report, "Soak run finished");
    Ok(report)
}
