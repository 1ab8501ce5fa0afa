use crate::error::{PopError, PushError};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// A bounded, blocking, multi-producer/multi-consumer FIFO with a closed
/// state. This is the sole transport between pipeline stages.
///
/// The queue is a cheap-to-clone handle; all clones share the same storage.
/// Values travel strictly in push order. Closing is irreversible: pushes
/// into a closed queue are refused, while pops drain the remaining values
/// and then report [`PopError::Closed`].
///
/// Every operation comes in three flavors:
///
/// - `try_*` acquires the lock (possibly waiting for it) but never waits
///   for a slot or a value.
/// - `nonblocking_*` refuses even to wait for the lock and reports
///   [`PopError::Busy`] / [`PushError::Busy`] on contention.
/// - `push` / `pop` block until a slot or value is available, or the queue
///   is closed.
pub struct BufferQueue<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    name: Option<String>,
}

/// All mutable queue state lives under the one mutex. The ring uses
/// `capacity + 1` slots so that `head == tail` means empty and
/// `next(tail) == head` means full without a separate count.
struct State<T> {
    slots: Vec<Option<T>>,
    head: usize,
    tail: usize,
    waiting_producers: usize,
    waiting_consumers: usize,
    closed: bool,
}

impl<T> State<T> {
    fn next(&self, index: usize) -> usize {
        (index + 1) % self.slots.len()
    }

    fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    fn is_full(&self) -> bool {
        self.next(self.tail) == self.head
    }

    fn len(&self) -> usize {
        (self.tail + self.slots.len() - self.head) % self.slots.len()
    }
}

impl<T> Shared<T> {
    /// Take the head slot. The caller has verified the queue is non-empty.
    /// The index advances before the value is handed out, so a slot can
    /// never be observed twice.
    fn pop_slot(&self, state: &mut State<T>) -> T {
        let index = state.head;
        state.head = state.next(index);
        if state.waiting_producers > 0 {
            state.waiting_producers -= 1;
            self.not_full.notify_one();
        }
        state.slots[index].take().expect("live slot between head and tail")
    }

    /// Write into the tail slot. The caller has verified the queue is open
    /// and not full. The slot is written before the index advances, so
    /// readers never see an unoccupied live slot.
    fn push_slot(&self, state: &mut State<T>, value: T) {
        let index = state.tail;
        state.slots[index] = Some(value);
        state.tail = state.next(index);
        if state.waiting_consumers > 0 {
            state.waiting_consumers -= 1;
            self.not_empty.notify_one();
        }
    }

    fn try_pop_locked(&self, state: &mut State<T>) -> Result<T, PopError> {
        if state.is_empty() {
            if state.closed {
                Err(PopError::Closed)
            } else {
                Err(PopError::Empty)
            }
        } else {
            Ok(self.pop_slot(state))
        }
    }

    fn try_push_locked(&self, state: &mut State<T>, value: T) -> Result<(), PushError<T>> {
        if state.closed {
            return Err(PushError::Closed(value));
        }
        if state.is_full() {
            return Err(PushError::Full(value));
        }
        self.push_slot(state, value);
        Ok(())
    }
}

impl<T> BufferQueue<T> {
    /// Create a queue holding at most `capacity` values.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        Self::build(capacity, None)
    }

    /// Create a queue with a diagnostic name, shown in logs and `Debug`
    /// output.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn named(capacity: usize, name: impl Into<String>) -> Self {
        Self::build(capacity, Some(name.into()))
    }

    /// Create a queue pre-filled from an iterator.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or the iterator yields more than
    /// `capacity` values.
    pub fn preloaded<I>(capacity: usize, items: I) -> Self
    where
        I: IntoIterator<Item = T>,
    {
        let queue = Self::build(capacity, None);
        {
            let mut state = queue.shared.state.lock();
            for value in items {
                assert!(!state.is_full(), "preload exceeds queue capacity");
                queue.shared.push_slot(&mut state, value);
            }
        }
        queue
    }

    fn build(capacity: usize, name: Option<String>) -> Self {
        assert!(capacity >= 1, "queue capacity must be at least one");
        let slots = (0..=capacity).map(|_| None).collect();
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    slots,
                    head: 0,
                    tail: 0,
                    waiting_producers: 0,
                    waiting_consumers: 0,
                    closed: false,
                }),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
                capacity,
                name,
            }),
        }
    }

    /// Pop the oldest value without waiting for one to arrive.
    pub fn try_pop(&self) -> Result<T, PopError> {
        let mut state = self.shared.state.lock();
        self.shared.try_pop_locked(&mut state)
    }

    /// Pop without waiting for the lock either; [`PopError::Busy`] if the
    /// mutex is contended.
    pub fn nonblocking_pop(&self) -> Result<T, PopError> {
        match self.shared.state.try_lock() {
            Some(mut state) => self.shared.try_pop_locked(&mut state),
            None => Err(PopError::Busy),
        }
    }

    /// Pop the oldest value, waiting for one if the queue is empty.
    ///
    /// Returns [`PopError::Closed`] once the queue is closed *and* drained;
    /// values pushed before the close are always delivered first.
    pub fn pop(&self) -> Result<T, PopError> {
        let mut state = self.shared.state.lock();
        loop {
            if !state.is_empty() {
                return Ok(self.shared.pop_slot(&mut state));
            }
            if state.closed {
                return Err(PopError::Closed);
            }
            state.waiting_consumers += 1;
            self.shared.not_empty.wait(&mut state);
        }
    }

    /// Push a value without waiting for a slot.
    pub fn try_push(&self, value: T) -> Result<(), PushError<T>> {
        let mut state = self.shared.state.lock();
        self.shared.try_push_locked(&mut state, value)
    }

    /// Push without waiting for the lock either; [`PushError::Busy`] if the
    /// mutex is contended.
    pub fn nonblocking_push(&self, value: T) -> Result<(), PushError<T>> {
        match self.shared.state.try_lock() {
            Some(mut state) => self.shared.try_push_locked(&mut state, value),
            None => Err(PushError::Busy(value)),
        }
    }

    /// Push a value, waiting for a slot if the queue is full.
    ///
    /// The closed check precedes the fullness check, so a close unblocks
    /// waiting producers immediately with [`PushError::Closed`], which hands
    /// the value back.
    pub fn push(&self, value: T) -> Result<(), PushError<T>> {
        let mut state = self.shared.state.lock();
        loop {
            if state.closed {
                return Err(PushError::Closed(value));
            }
            if !state.is_full() {
                self.shared.push_slot(&mut state, value);
                return Ok(());
            }
            state.waiting_producers += 1;
            self.shared.not_full.wait(&mut state);
        }
    }

    /// Close the queue. Idempotent. All blocked producers and consumers are
    /// woken; producers observe `Closed`, consumers drain what remains.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();
        debug!(
            queue = self.shared.name.as_deref().unwrap_or("<unnamed>"),
            remaining = state.len(),
            "queue closed"
        );
    }

    /// Whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Whether the queue currently holds no values.
    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().is_empty()
    }

    /// Number of values currently held. A snapshot; other threads may push
    /// or pop immediately after.
    pub fn len(&self) -> usize {
        self.shared.state.lock().len()
    }

    /// Maximum number of values the queue can hold.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// The diagnostic name, if one was given.
    pub fn name(&self) -> Option<&str> {
        self.shared.name.as_deref()
    }
}

impl<T> Clone for BufferQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for BufferQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("BufferQueue")
            .field("name", &self.shared.name)
            .field("capacity", &self.shared.capacity)
            .field("len", &state.len())
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_roundtrip() {
        let queue = BufferQueue::new(10);
        assert!(queue.push(42).is_ok());
        assert_eq!(queue.pop(), Ok(42));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_fifo_order() {
        let queue = BufferQueue::new(8);
        for i in 0..5 {
            queue.push(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(queue.try_pop(), Ok(i));
        }
        assert_eq!(queue.try_pop(), Err(PopError::Empty));
    }

    #[test]
    fn test_full_status() {
        let queue = BufferQueue::new(2);
        queue.try_push(1).unwrap();
        queue.try_push(2).unwrap();
        assert_eq!(queue.try_push(3), Err(PushError::Full(3)));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_close_refuses_push_and_drains_pops() {
        let queue = BufferQueue::new(4);
        queue.push("a").unwrap();
        queue.push("b").unwrap();
        queue.close();
        queue.close(); // idempotent

        assert_eq!(queue.try_push("c"), Err(PushError::Closed("c")));
        assert_eq!(queue.pop(), Ok("a"));
        assert_eq!(queue.try_pop(), Ok("b"));
        assert_eq!(queue.pop(), Err(PopError::Closed));
        assert_eq!(queue.try_pop(), Err(PopError::Closed));
    }

    #[test]
    fn test_preloaded() {
        let queue = BufferQueue::preloaded(10, ["x", "y"]);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop(), Ok("x"));
        assert_eq!(queue.pop(), Ok("y"));
    }

    #[test]
    #[should_panic(expected = "preload exceeds queue capacity")]
    fn test_preload_overflow_panics() {
        let _ = BufferQueue::preloaded(2, [1, 2, 3]);
    }

    #[test]
    #[should_panic(expected = "capacity must be at least one")]
    fn test_zero_capacity_panics() {
        let _ = BufferQueue::<i32>::new(0);
    }

    #[test]
    fn test_nonblocking_busy_under_contention() {
        let queue = BufferQueue::new(4);
        queue.push(1).unwrap();

        // Hold the internal mutex: both nonblocking ops must report Busy
        // rather than wait, and hand any value back.
        let guard = queue.shared.state.lock();
        assert_eq!(queue.nonblocking_push(2), Err(PushError::Busy(2)));
        assert_eq!(queue.nonblocking_pop(), Err(PopError::Busy));
        drop(guard);

        assert!(queue.nonblocking_push(2).is_ok());
        assert_eq!(queue.nonblocking_pop(), Ok(1));
    }

    #[test]
    fn test_wraparound_keeps_order() {
        let queue = BufferQueue::new(3);
        for round in 0..10 {
            queue.push(round * 2).unwrap();
            queue.push(round * 2 + 1).unwrap();
            assert_eq!(queue.pop(), Ok(round * 2));
            assert_eq!(queue.pop(), Ok(round * 2 + 1));
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_len_and_capacity() {
        let queue = BufferQueue::named(5, "lens");
        assert_eq!(queue.capacity(), 5);
        assert_eq!(queue.name(), Some("lens"));
        for i in 0..5 {
            queue.push(i).unwrap();
            assert_eq!(queue.len(), i + 1);
        }
        assert_eq!(queue.try_push(9), Err(PushError::Full(9)));
    }
}
