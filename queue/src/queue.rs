use crate::slots::{SlotId, SlotRing};
use crate::{OverflowPolicy, QueueConfig, QueueError};
use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Bounded pool of reusable buffers handed between producers and consumers.
///
/// A producer borrows a slot with [`peek_writable`](Self::peek_writable),
/// fills it and publishes it with [`push`](Self::push). A consumer borrows the
/// oldest published slot with [`peek_readable`](Self::peek_readable) and hands
/// it back with [`next`](Self::next). The lock is only held while slots are
/// relinked, never while a caller fills or reads a payload.
///
/// Borrowed slots are guards: a [`WriteSlot`] dropped without being pushed is
/// discarded back to the writable side, a [`ReadSlot`] dropped without `next`
/// is released as if `next` had been called.
pub struct BufferQueue<T> {
    state: Mutex<State>,
    slot_writable: Condvar,
    slot_readable: Condvar,
    slots: Box<[UnsafeCell<T>]>,
    policy: OverflowPolicy,
}

#[derive(Debug)]
struct State {
    ring: SlotRing,
    aborted: bool,
    dropped: u64,
}

// Payloads are only reachable through a guard, and the slot state table
// grants each checked-out slot to exactly one guard.
unsafe impl<T: Send> Send for BufferQueue<T> {}
unsafe impl<T: Send> Sync for BufferQueue<T> {}

/// Point-in-time slot accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub capacity: usize,
    pub writable: usize,
    pub readable: usize,
    /// Slots checked out by producers.
    pub writing: usize,
    /// Slots checked out by consumers.
    pub reading: usize,
    /// Unread slots reclaimed by the drop-oldest policy.
    pub dropped: u64,
}

impl QueueStats {
    pub fn checked_out(&self) -> usize {
        self.writing + self.reading
    }
}

impl<T: Default> BufferQueue<T> {
    pub fn new(config: QueueConfig) -> Result<Self, QueueError> {
        Self::with_factory(config, T::default)
    }
}

impl<T> BufferQueue<T> {
    /// Build a queue whose slots are created by `factory`, once each.
    pub fn with_factory<F>(config: QueueConfig, mut factory: F) -> Result<Self, QueueError>
    where
        F: FnMut() -> T,
    {
        config.validate()?;

        let slots: Vec<UnsafeCell<T>> = (0..config.capacity)
            .map(|_| UnsafeCell::new(factory()))
            .collect();

        Ok(Self {
            state: Mutex::new(State {
                ring: SlotRing::new(config.capacity),
                aborted: false,
                dropped: 0,
            }),
            slot_writable: Condvar::new(),
            slot_readable: Condvar::new(),
            slots: slots.into_boxed_slice(),
            policy: config.policy,
        })
    }

    // Nothing panics while the lock is held, so a poisoned state is still consistent.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Borrow a writable slot.
    ///
    /// With [`OverflowPolicy::Block`] this waits for as long as it takes a
    /// consumer to free a slot. With [`OverflowPolicy::DropOldest`] each
    /// elapsed drop timeout reclaims the oldest unread slot. Only fails once
    /// the queue is aborted.
    pub fn peek_writable(&self) -> Result<WriteSlot<'_, T>, QueueError> {
        let drop_timeout = self.policy.drop_timeout();
        let mut deadline: Option<Instant> = None;
        let mut state = self.lock();

        loop {
            if state.aborted {
                return Err(QueueError::Aborted);
            }
            if let Some(id) = state.ring.take_writable() {
                return Ok(WriteSlot::new(self, id));
            }

            match drop_timeout {
                None => {
                    state = self
                        .slot_writable
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(timeout) => {
                    let now = Instant::now();
                    let until = *deadline.get_or_insert(now + timeout);
                    if now >= until {
                        deadline = None;
                        // With every slot checked out there is nothing to reclaim;
                        // keep waiting for a commit.
                        if let Some(evicted) = state.ring.evict_oldest() {
                            state.dropped += 1;
                            tracing::debug!(
                                slot = %evicted,
                                dropped = state.dropped,
                                "Dropped oldest unread buffer"
                            );
                        }
                        continue;
                    }
                    state = self
                        .slot_writable
                        .wait_timeout(state, until - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
    }

    /// Publish a filled slot to consumers.
    ///
    /// A slot borrowed from another queue is rejected with
    /// [`QueueError::ForeignSlot`] and goes back to its own queue unpublished.
    pub fn push(&self, slot: WriteSlot<'_, T>) -> Result<(), QueueError> {
        if !std::ptr::eq(slot.queue, self) {
            tracing::warn!(slot = %slot.id, "Rejected push of a slot owned by another queue");
            return Err(QueueError::ForeignSlot);
        }
        self.publish(slot.into_id());
        Ok(())
    }

    /// Return a borrowed writable slot without publishing it.
    pub fn discard(&self, slot: WriteSlot<'_, T>) -> Result<(), QueueError> {
        if !std::ptr::eq(slot.queue, self) {
            tracing::warn!(slot = %slot.id, "Rejected discard of a slot owned by another queue");
            return Err(QueueError::ForeignSlot);
        }
        self.restore(slot.into_id());
        Ok(())
    }

    /// Borrow the oldest readable slot, waiting up to `timeout` for one.
    pub fn peek_readable(&self, timeout: Duration) -> Result<ReadSlot<'_, T>, QueueError> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.lock();

        loop {
            if state.aborted {
                return Err(QueueError::Aborted);
            }
            if let Some(id) = state.ring.take_readable() {
                return Ok(ReadSlot::new(self, id));
            }

            state = match deadline {
                None => self
                    .slot_readable
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(QueueError::Timeout);
                    }
                    self.slot_readable
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Hand a read slot back to producers.
    pub fn next(&self, slot: ReadSlot<'_, T>) -> Result<(), QueueError> {
        if !std::ptr::eq(slot.queue, self) {
            tracing::warn!(slot = %slot.id, "Rejected next of a slot owned by another queue");
            return Err(QueueError::ForeignSlot);
        }
        self.release(slot.into_id());
        Ok(())
    }

    /// Stop the queue and wake every waiting producer and consumer.
    ///
    /// Both peeks fail with [`QueueError::Aborted`] from now on. Slots that
    /// are already borrowed can still be pushed or handed back.
    pub fn abort(&self) {
        let mut state = self.lock();
        if !state.aborted {
            state.aborted = true;
            tracing::debug!("Buffer queue aborted");
        }
        drop(state);
        self.slot_writable.notify_all();
        self.slot_readable.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().aborted
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        QueueStats {
            capacity: state.ring.capacity(),
            writable: state.ring.writable(),
            readable: state.ring.readable(),
            writing: state.ring.writing(),
            reading: state.ring.reading(),
            dropped: state.dropped,
        }
    }

    fn publish(&self, id: SlotId) {
        let published = self.lock().ring.publish(id);
        debug_assert!(published, "slot {} was not checked out for writing", id);
        self.slot_readable.notify_one();
    }

    fn restore(&self, id: SlotId) {
        let restored = self.lock().ring.restore(id);
        debug_assert!(restored, "slot {} was not checked out for writing", id);
        self.slot_writable.notify_one();
    }

    fn release(&self, id: SlotId) {
        let released = self.lock().ring.release(id);
        debug_assert!(released, "slot {} was not checked out for reading", id);
        self.slot_writable.notify_one();
    }
}

impl<T> fmt::Debug for BufferQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferQueue")
            .field("policy", &self.policy)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Exclusive borrow of a slot for filling.
#[must_use = "a write slot is discarded unless it is pushed"]
pub struct WriteSlot<'a, T> {
    queue: &'a BufferQueue<T>,
    id: SlotId,
    _payload: PhantomData<&'a mut T>,
}

impl<'a, T> WriteSlot<'a, T> {
    fn new(queue: &'a BufferQueue<T>, id: SlotId) -> Self {
        Self {
            queue,
            id,
            _payload: PhantomData,
        }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    /// Publish this slot to consumers.
    pub fn push(self) {
        let queue = self.queue;
        queue.publish(self.into_id());
    }

    /// Return this slot to the writable side without publishing it.
    pub fn discard(self) {
        let queue = self.queue;
        queue.restore(self.into_id());
    }

    fn into_id(self) -> SlotId {
        ManuallyDrop::new(self).id
    }
}

impl<T> Deref for WriteSlot<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: this guard is the only holder of a slot in the `Writing` state.
        unsafe { &*self.queue.slots[self.id.0].get() }
    }
}

impl<T> DerefMut for WriteSlot<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: see `deref`.
        unsafe { &mut *self.queue.slots[self.id.0].get() }
    }
}

impl<T> Drop for WriteSlot<'_, T> {
    fn drop(&mut self) {
        self.queue.restore(self.id);
    }
}

impl<T> fmt::Debug for WriteSlot<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WriteSlot").field(&self.id).finish()
    }
}

/// Exclusive borrow of a published slot for reading.
#[must_use = "a read slot is handed back as soon as it is dropped"]
pub struct ReadSlot<'a, T> {
    queue: &'a BufferQueue<T>,
    id: SlotId,
    _payload: PhantomData<&'a T>,
}

impl<'a, T> ReadSlot<'a, T> {
    fn new(queue: &'a BufferQueue<T>, id: SlotId) -> Self {
        Self {
            queue,
            id,
            _payload: PhantomData,
        }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    /// Hand this slot back to producers. Same as dropping it.
    pub fn release(self) {
        let queue = self.queue;
        queue.release(self.into_id());
    }

    fn into_id(self) -> SlotId {
        ManuallyDrop::new(self).id
    }
}

impl<T> Deref for ReadSlot<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: this guard is the only holder of a slot in the `Reading` state.
        unsafe { &*self.queue.slots[self.id.0].get() }
    }
}

impl<T> Drop for ReadSlot<'_, T> {
    fn drop(&mut self) {
        self.queue.release(self.id);
    }
}

impl<T> fmt::Debug for ReadSlot<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ReadSlot").field(&self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::thread;

    fn queue(capacity: usize, policy: OverflowPolicy) -> Arc<BufferQueue<u64>> {
        Arc::new(BufferQueue::new(QueueConfig::new(capacity, policy)).unwrap())
    }

    fn assert_conserved(stats: &QueueStats) {
        assert_eq!(
            stats.writable + stats.readable + stats.checked_out(),
            stats.capacity
        );
    }

    #[test]
    fn test_two_slot_scenario() {
        let q = queue(2, OverflowPolicy::Block);

        let mut a = q.peek_writable().unwrap();
        let mut b = q.peek_writable().unwrap();
        *a = 1;
        *b = 2;
        q.push(a).unwrap();
        q.push(b).unwrap();

        let first = q.peek_readable(Duration::from_millis(1000)).unwrap();
        let second = q.peek_readable(Duration::from_millis(1000)).unwrap();
        assert_eq!(*first, 1);
        assert_eq!(*second, 2);
        q.next(first).unwrap();
        q.next(second).unwrap();

        let third = q.peek_readable(Duration::from_millis(100));
        assert_eq!(third.unwrap_err(), QueueError::Timeout);
        assert_eq!(q.stats().writable, 2);
    }

    #[test]
    fn test_conservation_through_cycle() {
        let q = queue(3, OverflowPolicy::Block);
        assert_conserved(&q.stats());

        let w = q.peek_writable().unwrap();
        let stats = q.stats();
        assert_eq!(stats.writing, 1);
        assert_conserved(&stats);

        w.push();
        let stats = q.stats();
        assert_eq!(stats.readable, 1);
        assert_conserved(&stats);

        let r = q.peek_readable(Duration::ZERO).unwrap();
        let stats = q.stats();
        assert_eq!(stats.reading, 1);
        assert_eq!(stats.readable, 0);
        assert_conserved(&stats);

        r.release();
        assert_eq!(q.stats().writable, 3);
    }

    #[test]
    fn test_fifo_single_producer_single_consumer() {
        let q = queue(4, OverflowPolicy::Block);
        let producer = {
            let q = q.clone();
            thread::spawn(move || {
                for i in 0..1_000u64 {
                    let mut slot = q.peek_writable().unwrap();
                    *slot = i;
                    slot.push();
                }
            })
        };

        for expected in 0..1_000u64 {
            let slot = q.peek_readable(Duration::from_secs(5)).unwrap();
            assert_eq!(*slot, expected);
            q.next(slot).unwrap();
        }
        producer.join().unwrap();
        assert_eq!(q.stats().dropped, 0);
    }

    #[test]
    fn test_no_double_issue() {
        let q = queue(3, OverflowPolicy::Block);
        let a = q.peek_writable().unwrap();
        let b = q.peek_writable().unwrap();
        let c = q.peek_writable().unwrap();
        let mut ids = vec![a.id(), b.id(), c.id()];
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);

        let b_id = b.id();
        b.push();
        let r = q.peek_readable(Duration::ZERO).unwrap();
        assert_eq!(r.id(), b_id);
        assert_eq!(
            q.peek_readable(Duration::ZERO).unwrap_err(),
            QueueError::Timeout
        );
        drop((a, c, r));
    }

    #[test]
    fn test_back_pressure_blocks_until_next() {
        let q = queue(2, OverflowPolicy::Block);
        q.peek_writable().unwrap().push();
        q.peek_writable().unwrap().push();

        let (tx, rx) = mpsc::channel();
        let producer = {
            let q = q.clone();
            thread::spawn(move || {
                let slot = q.peek_writable().unwrap();
                tx.send(slot.id()).unwrap();
                slot.push();
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        let oldest = q.peek_readable(Duration::ZERO).unwrap();
        let freed = oldest.id();
        q.next(oldest).unwrap();

        let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got, freed);
        producer.join().unwrap();
        assert_eq!(q.stats().readable, 2);
    }

    #[test]
    fn test_drop_oldest_bounded_stall() {
        let q = queue(2, OverflowPolicy::DropOldest { timeout_ms: 50 });
        for value in [10, 20] {
            let mut slot = q.peek_writable().unwrap();
            *slot = value;
            slot.push();
        }

        let started = Instant::now();
        let mut slot = q.peek_writable().unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_secs(2));
        *slot = 30;
        slot.push();

        assert_eq!(q.stats().dropped, 1);
        let r = q.peek_readable(Duration::ZERO).unwrap();
        assert_eq!(*r, 20);
        r.release();
        let r = q.peek_readable(Duration::ZERO).unwrap();
        assert_eq!(*r, 30);
    }

    #[test]
    fn test_drop_oldest_reclaims_one_per_timeout() {
        let q = queue(3, OverflowPolicy::DropOldest { timeout_ms: 20 });
        for value in 0..3 {
            let mut slot = q.peek_writable().unwrap();
            *slot = value;
            slot.push();
        }

        let slot = q.peek_writable().unwrap();
        let stats = q.stats();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.readable, 2);
        assert_conserved(&stats);
        drop(slot);
    }

    #[test]
    fn test_drop_oldest_never_evicts_checked_out_reader() {
        let q = queue(1, OverflowPolicy::DropOldest { timeout_ms: 20 });
        q.peek_writable().unwrap().push();
        let reading = q.peek_readable(Duration::ZERO).unwrap();

        let (tx, rx) = mpsc::channel();
        let producer = {
            let q = q.clone();
            thread::spawn(move || {
                let got = q.peek_writable().map(|slot| slot.id());
                tx.send(got).unwrap();
            })
        };

        // Several drop timeouts pass, but the only slot is being read.
        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
        assert_eq!(q.stats().dropped, 0);

        let id = reading.id();
        reading.release();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(id));
        producer.join().unwrap();
    }

    #[test]
    fn test_abort_wakes_all_waiters() {
        let q = queue(1, OverflowPolicy::Block);
        let held = q.peek_writable().unwrap();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let q = q.clone();
            handles.push(thread::spawn(move || q.peek_writable().map(|_| ()).unwrap_err()));
        }
        for _ in 0..3 {
            let q = q.clone();
            handles.push(thread::spawn(move || {
                q.peek_readable(Duration::from_secs(30)).map(|_| ()).unwrap_err()
            }));
        }

        thread::sleep(Duration::from_millis(100));
        let started = Instant::now();
        q.abort();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), QueueError::Aborted);
        }
        assert!(started.elapsed() < Duration::from_secs(5));

        // A borrow obtained before the abort can still be committed.
        held.push();
        assert_eq!(q.stats().readable, 1);
        assert_eq!(
            q.peek_readable(Duration::ZERO).unwrap_err(),
            QueueError::Aborted
        );
    }

    #[test]
    fn test_abort_wakes_drop_oldest_producers_with_all_slots_checked_out() {
        let q = queue(2, OverflowPolicy::DropOldest { timeout_ms: 20 });
        let writing = q.peek_writable().unwrap();
        q.peek_writable().unwrap().push();
        let reading = q.peek_readable(Duration::ZERO).unwrap();

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let q = q.clone();
                thread::spawn(move || q.peek_writable().map(|_| ()).unwrap_err())
            })
            .collect();

        // Producers cycle through drop timeouts with nothing to evict.
        thread::sleep(Duration::from_millis(100));
        let started = Instant::now();
        q.abort();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), QueueError::Aborted);
        }
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(q.stats().dropped, 0);

        drop(writing);
        drop(reading);
        assert_conserved(&q.stats());
    }

    #[test]
    fn test_abort_wakes_drop_oldest_producer_on_full_queue() {
        let q = queue(2, OverflowPolicy::DropOldest { timeout_ms: 30_000 });
        for i in 0..2 {
            let mut slot = q.peek_writable().unwrap();
            *slot = i;
            slot.push();
        }

        let producer = {
            let q = q.clone();
            thread::spawn(move || q.peek_writable().map(|_| ()).unwrap_err())
        };

        thread::sleep(Duration::from_millis(100));
        let started = Instant::now();
        q.abort();
        assert_eq!(producer.join().unwrap(), QueueError::Aborted);
        assert!(started.elapsed() < Duration::from_secs(5));

        // Aborting mid-wait evicts nothing.
        let stats = q.stats();
        assert_eq!(stats.dropped, 0);
        assert_eq!(stats.readable, 2);
    }

    #[test]
    fn test_abort_is_idempotent() {
        let q = queue(2, OverflowPolicy::drop_oldest());
        assert!(!q.is_aborted());
        q.abort();
        q.abort();
        assert!(q.is_aborted());
        assert_eq!(q.peek_writable().unwrap_err(), QueueError::Aborted);
    }

    #[test]
    fn test_foreign_slot_is_rejected() {
        let a = queue(2, OverflowPolicy::Block);
        let b = queue(2, OverflowPolicy::Block);

        let slot = a.peek_writable().unwrap();
        assert_eq!(b.push(slot).unwrap_err(), QueueError::ForeignSlot);
        assert_eq!(b.stats().readable, 0);
        assert_eq!(b.stats().writable, 2);
        assert_eq!(a.stats().writable, 2);

        a.peek_writable().unwrap().push();
        let read = a.peek_readable(Duration::ZERO).unwrap();
        assert_eq!(b.next(read).unwrap_err(), QueueError::ForeignSlot);
        assert_eq!(a.stats().writable, 2);
        assert_eq!(b.stats().writable, 2);
    }

    #[test]
    fn test_discard_is_not_published() {
        let q = queue(2, OverflowPolicy::Block);
        let slot = q.peek_writable().unwrap();
        q.discard(slot).unwrap();
        assert_eq!(
            q.peek_readable(Duration::ZERO).unwrap_err(),
            QueueError::Timeout
        );
        assert_eq!(q.stats().writable, 2);
    }

    #[test]
    fn test_with_factory_builds_each_slot() {
        let q = BufferQueue::with_factory(QueueConfig::new(3, OverflowPolicy::Block), || vec![0u8; 16])
            .unwrap();
        let mut slot = q.peek_writable().unwrap();
        assert_eq!(slot.len(), 16);
        slot[0] = 7;
        slot.push();
        assert_eq!(q.peek_readable(Duration::ZERO).unwrap()[0], 7);
        assert_eq!(q.capacity(), 3);
    }

    #[test]
    fn test_concurrent_stress_conserves_slots() {
        let q = queue(4, OverflowPolicy::DropOldest { timeout_ms: 1 });
        let stop = Arc::new(AtomicBool::new(false));

        let producers: Vec<_> = (0..2)
            .map(|_| {
                let q = q.clone();
                thread::spawn(move || {
                    for i in 0..2_000u64 {
                        let mut slot = q.peek_writable().unwrap();
                        *slot = i;
                        slot.push();
                    }
                })
            })
            .collect();

        let consumer = {
            let q = q.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let mut seen = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    if let Ok(slot) = q.peek_readable(Duration::from_millis(10)) {
                        seen += 1;
                        drop(slot);
                    }
                    assert_conserved(&q.stats());
                }
                seen
            })
        };

        for producer in producers {
            producer.join().unwrap();
        }
        while q.stats().readable > 0 {
            thread::sleep(Duration::from_millis(5));
        }
        stop.store(true, Ordering::Relaxed);
        let seen = consumer.join().unwrap();

        let stats = q.stats();
        assert_conserved(&stats);
        assert_eq!(seen + stats.dropped, 4_000);
    }
}
