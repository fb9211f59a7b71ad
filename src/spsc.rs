//! Lock-free single-producer/single-consumer pipe queue.
//!
//! Storage is a chain of fixed-size chunks ([`YQueue`]); the publication
//! protocol on top ([`YPipe`]) batches writes and lets the producer detect a
//! sleeping consumer:
//!
//! - the producer pushes items locally and publishes them in batches with
//!   `flush`, which stores the committed position into a shared atomic;
//! - the consumer drains up to the last position it observed; when it runs
//!   dry it swaps a sleeping sentinel into the shared atomic;
//! - a `flush` that finds the sentinel returns `false`, telling the producer
//!   to wake the consumer out of band (a mailbox command in this crate).
//!
//! The only shared state is the published-position atomic and the recycled
//! spare chunk. Everything else is owned by exactly one side, which is why
//! the types are `Sync` only under the documented contract: at most one
//! thread writes and at most one thread reads at any given time.

use std::cell::Cell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

/// Chunk granularity for message pipes.
pub const MSG_PIPE_GRANULARITY: usize = 256;
/// Chunk granularity for command pipes.
pub const CMD_PIPE_GRANULARITY: usize = 16;

const SLEEPING: u64 = u64::MAX;

struct Chunk<T, const N: usize> {
    values: [MaybeUninit<T>; N],
    prev: *mut Chunk<T, N>,
    next: *mut Chunk<T, N>,
}

impl<T, const N: usize> Chunk<T, N> {
    fn alloc() -> *mut Self {
        // SAFETY: an array of MaybeUninit does not require initialization.
        let values = unsafe { MaybeUninit::<[MaybeUninit<T>; N]>::uninit().assume_init() };
        Box::into_raw(Box::new(Chunk {
            values,
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
        }))
    }
}

/// Unbounded FIFO of chunked storage. Not a queue of its own right: all
/// bounds discipline (never pop more than pushed, never unpush a published
/// item) is enforced by [`YPipe`].
struct YQueue<T, const N: usize> {
    // Consumer end.
    begin_chunk: Cell<*mut Chunk<T, N>>,
    begin_pos: Cell<usize>,
    // Producer end.
    end_chunk: Cell<*mut Chunk<T, N>>,
    end_pos: Cell<usize>,
    // One retired chunk kept for reuse; exchanged by both sides.
    spare: AtomicPtr<Chunk<T, N>>,
}

impl<T, const N: usize> YQueue<T, N> {
    fn new() -> Self {
        let chunk = Chunk::alloc();
        Self {
            begin_chunk: Cell::new(chunk),
            begin_pos: Cell::new(0),
            end_chunk: Cell::new(chunk),
            end_pos: Cell::new(0),
            spare: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Producer side. Always succeeds; grows by one chunk when the current
    /// one fills, preferring the recycled spare over a fresh allocation.
    fn push(&self, value: T) {
        let chunk = self.end_chunk.get();
        let pos = self.end_pos.get();
        unsafe {
            (*chunk).values[pos].write(value);
        }
        if pos + 1 < N {
            self.end_pos.set(pos + 1);
            return;
        }
        let spare = self.spare.swap(ptr::null_mut(), Ordering::Relaxed);
        let next = if spare.is_null() { Chunk::alloc() } else { spare };
        unsafe {
            (*next).prev = chunk;
            (*next).next = ptr::null_mut();
            (*chunk).next = next;
        }
        self.end_chunk.set(next);
        self.end_pos.set(0);
    }

    /// Producer side. Removes and returns the most recently pushed item.
    fn unpush(&self) -> T {
        let mut chunk = self.end_chunk.get();
        let mut pos = self.end_pos.get();
        if pos == 0 {
            // The tail chunk is empty; step back and release it.
            let empty = chunk;
            chunk = unsafe { (*empty).prev };
            unsafe {
                (*chunk).next = ptr::null_mut();
                drop(Box::from_raw(empty));
            }
            self.end_chunk.set(chunk);
            pos = N;
        }
        pos -= 1;
        self.end_pos.set(pos);
        unsafe { (*chunk).values[pos].assume_init_read() }
    }

    /// Consumer side. Caller guarantees at least one published item exists.
    fn pop(&self) -> T {
        let chunk = self.begin_chunk.get();
        let pos = self.begin_pos.get();
        let value = unsafe { (*chunk).values[pos].assume_init_read() };
        if pos + 1 < N {
            self.begin_pos.set(pos + 1);
            return value;
        }
        // Crossed a chunk boundary: the producer linked `next` before
        // publishing anything beyond it.
        let next = unsafe { (*chunk).next };
        unsafe {
            (*next).prev = ptr::null_mut();
        }
        self.begin_chunk.set(next);
        self.begin_pos.set(0);
        let old_spare = self.spare.swap(chunk, Ordering::Relaxed);
        if !old_spare.is_null() {
            unsafe { drop(Box::from_raw(old_spare)) };
        }
        value
    }

    /// Consumer side. Caller guarantees at least one published item exists.
    fn front<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let chunk = self.begin_chunk.get();
        let pos = self.begin_pos.get();
        f(unsafe { &*(*chunk).values[pos].as_ptr() })
    }
}

impl<T, const N: usize> Drop for YQueue<T, N> {
    fn drop(&mut self) {
        let end_chunk = self.end_chunk.get();
        let end_pos = self.end_pos.get();
        let mut chunk = self.begin_chunk.get();
        let mut pos = self.begin_pos.get();
        loop {
            let last = chunk == end_chunk;
            let stop = if last { end_pos } else { N };
            while pos < stop {
                unsafe { ptr::drop_in_place((*chunk).values[pos].as_mut_ptr()) };
                pos += 1;
            }
            let next = unsafe { (*chunk).next };
            unsafe { drop(Box::from_raw(chunk)) };
            if last {
                break;
            }
            chunk = next;
            pos = 0;
        }
        let spare = self.spare.swap(ptr::null_mut(), Ordering::Relaxed);
        if !spare.is_null() {
            unsafe { drop(Box::from_raw(spare)) };
        }
    }
}

/// The SPSC publication protocol over a [`YQueue`].
///
/// Positions are monotonically increasing item counts. `published` holds the
/// count visible to the consumer, or [`SLEEPING`] after the consumer found
/// the queue dry and parked itself.
pub struct YPipe<T, const N: usize> {
    queue: YQueue<T, N>,
    // Producer-owned.
    write_count: Cell<u64>,
    flush_from: Cell<u64>,
    flush_to: Cell<u64>,
    // Shared.
    published: AtomicU64,
    // Consumer-owned.
    read_count: Cell<u64>,
    readable: Cell<u64>,
}

// SAFETY: fields are partitioned between exactly one producer thread and one
// consumer thread; the cross-thread handoff happens through `published` with
// acquire/release ordering. Callers uphold the SPSC discipline.
unsafe impl<T: Send, const N: usize> Send for YPipe<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for YPipe<T, N> {}

impl<T, const N: usize> YPipe<T, N> {
    pub fn new() -> Self {
        Self {
            queue: YQueue::new(),
            write_count: Cell::new(0),
            flush_from: Cell::new(0),
            flush_to: Cell::new(0),
            published: AtomicU64::new(0),
            read_count: Cell::new(0),
            readable: Cell::new(0),
        }
    }

    /// Producer. Enqueue an item; `incomplete` marks it as part of a batch
    /// whose tail has not been written yet, keeping it out of the next
    /// `flush` so multi-frame messages become visible atomically.
    pub fn write(&self, value: T, incomplete: bool) {
        self.queue.push(value);
        let count = self.write_count.get() + 1;
        self.write_count.set(count);
        if !incomplete {
            self.flush_to.set(count);
        }
    }

    /// Producer. Discard the most recent unflushed item, if any.
    pub fn unwrite(&self) -> Option<T> {
        if self.write_count.get() == self.flush_from.get() {
            return None;
        }
        let value = self.queue.unpush();
        let count = self.write_count.get() - 1;
        self.write_count.set(count);
        if self.flush_to.get() > count {
            self.flush_to.set(count);
        }
        Some(value)
    }

    /// Producer. Publish all completed batches. Returns `false` if the
    /// consumer is asleep and must be woken out of band.
    #[must_use]
    pub fn flush(&self) -> bool {
        let from = self.flush_from.get();
        let to = self.flush_to.get();
        if from == to {
            return true;
        }
        self.flush_from.set(to);
        if self
            .published
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return true;
        }
        // The consumer swapped in the sleeping sentinel. Overwrite it and
        // report that a wake-up is needed.
        self.published.store(to, Ordering::Release);
        false
    }

    /// Consumer. True if an item can be read without blocking. On `false`
    /// the sleeping sentinel has been set and the next `flush` will request
    /// a wake-up.
    pub fn check_read(&self) -> bool {
        let read = self.read_count.get();
        let cached = self.readable.get();
        if cached != SLEEPING && read < cached {
            return true;
        }
        let observed = match self.published.compare_exchange(
            read,
            SLEEPING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(prev) => prev,
            Err(prev) => prev,
        };
        self.readable.set(observed);
        observed != read && observed != SLEEPING
    }

    /// Consumer. Dequeue the next published item.
    pub fn read(&self) -> Option<T> {
        if !self.check_read() {
            return None;
        }
        let value = self.queue.pop();
        self.read_count.set(self.read_count.get() + 1);
        Some(value)
    }

    /// Consumer. Peek at the next published item without dequeuing it.
    pub fn probe<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        if !self.check_read() {
            return None;
        }
        Some(self.queue.front(f))
    }
}

impl<T, const N: usize> Default for YPipe<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_flush_read_round_trip() {
        let pipe: YPipe<u32, 4> = YPipe::new();
        pipe.write(1, false);
        pipe.write(2, false);
        // Not yet flushed: invisible to the reader.
        assert_eq!(pipe.read(), None);
        assert!(pipe.flush());
        assert_eq!(pipe.read(), Some(1));
        assert_eq!(pipe.read(), Some(2));
        assert_eq!(pipe.read(), None);
    }

    #[test]
    fn incomplete_batch_is_published_atomically() {
        let pipe: YPipe<u32, 4> = YPipe::new();
        pipe.write(1, true);
        pipe.write(2, true);
        assert!(pipe.flush());
        // The batch has no completed tail yet, so nothing is visible.
        assert_eq!(pipe.read(), None);
        pipe.write(3, false);
        let _ = pipe.flush();
        assert_eq!(pipe.read(), Some(1));
        assert_eq!(pipe.read(), Some(2));
        assert_eq!(pipe.read(), Some(3));
    }

    #[test]
    fn unwrite_discards_unflushed_tail() {
        let pipe: YPipe<u32, 4> = YPipe::new();
        pipe.write(1, false);
        assert!(pipe.flush());
        pipe.write(2, true);
        pipe.write(3, true);
        assert_eq!(pipe.unwrite(), Some(3));
        assert_eq!(pipe.unwrite(), Some(2));
        // Flushed items cannot be unwritten.
        assert_eq!(pipe.unwrite(), None);
        assert_eq!(pipe.read(), Some(1));
    }

    #[test]
    fn flush_detects_sleeping_reader() {
        let pipe: YPipe<u32, 4> = YPipe::new();
        // Reader runs dry and parks.
        assert!(!pipe.check_read());
        pipe.write(7, false);
        // Writer must request a wake-up.
        assert!(!pipe.flush());
        assert_eq!(pipe.read(), Some(7));
        // Reader awake again: the next flush is silent.
        pipe.write(8, false);
        assert!(pipe.flush());
    }

    #[test]
    fn crosses_chunk_boundaries() {
        let pipe: YPipe<u64, 4> = YPipe::new();
        for round in 0..8u64 {
            for i in 0..16u64 {
                pipe.write(round * 100 + i, false);
            }
            let _ = pipe.flush();
            for i in 0..16u64 {
                assert_eq!(pipe.read(), Some(round * 100 + i));
            }
            assert_eq!(pipe.read(), None);
        }
    }

    #[test]
    fn unpush_across_chunk_boundary() {
        let pipe: YPipe<u64, 4> = YPipe::new();
        for i in 0..5u64 {
            pipe.write(i, true);
        }
        for expect in (0..5u64).rev() {
            assert_eq!(pipe.unwrite(), Some(expect));
        }
        assert_eq!(pipe.unwrite(), None);
    }

    #[test]
    fn probe_peeks_without_consuming() {
        let pipe: YPipe<String, 4> = YPipe::new();
        assert!(pipe.probe(|s| s.clone()).is_none());
        pipe.write("head".to_string(), false);
        let _ = pipe.flush();
        assert_eq!(pipe.probe(|s| s.clone()), Some("head".to_string()));
        assert_eq!(pipe.read(), Some("head".to_string()));
    }

    #[test]
    fn drops_unread_items() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        struct Counted(Arc<AtomicUsize>);
        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        {
            let pipe: YPipe<Counted, 4> = YPipe::new();
            for _ in 0..10 {
                pipe.write(Counted(Arc::clone(&drops)), false);
            }
            let _ = pipe.flush();
            drop(pipe.read());
        }
        assert_eq!(drops.load(Ordering::SeqCst), 10);
    }
}
