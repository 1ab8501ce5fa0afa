use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::trace;

/// A unit of work handed to a [`WorkerPool`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// The contract the execution engine consumes. `submit` must run the task
/// asynchronously on some thread; pipeline workers are long-lived and block
/// on queue conditions, so an implementation must be able to run all
/// submitted tasks concurrently (a fixed-size pool smaller than the number
/// of pipeline workers will deadlock).
pub trait WorkerPool {
    /// Run `task` asynchronously. No guarantee about which thread.
    fn submit(&self, task: Task);
}

/// A growing thread pool: an idle thread is reused when one exists,
/// otherwise a new thread is spawned. This makes it safe for the long-lived
/// blocking workers a pipeline submits.
pub struct SimpleThreadPool {
    sender: Sender<Task>,
    receiver: Receiver<Task>,
    idle: Arc<AtomicUsize>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl SimpleThreadPool {
    /// Create an empty pool. Threads are spawned on demand by `submit`.
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            sender,
            receiver,
            idle: Arc::new(AtomicUsize::new(0)),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Number of threads spawned so far.
    pub fn thread_count(&self) -> usize {
        self.handles.lock().len()
    }

    /// Wait for all queued tasks to finish and shut the pool down.
    pub fn join(self) {
        let Self {
            sender,
            receiver,
            handles,
            ..
        } = self;
        // Disconnect the channel; workers exit after their current task.
        drop(sender);
        drop(receiver);
        for handle in handles.into_inner() {
            let _ = handle.join();
        }
    }

    fn spawn_worker(&self) {
        let receiver = self.receiver.clone();
        let idle = Arc::clone(&self.idle);
        let handle = thread::Builder::new()
            .name("flowline-worker".into())
            .spawn(move || {
                while let Ok(task) = receiver.recv() {
                    task();
                    // Only count as idle once the task has fully finished;
                    // submitters claim idle threads before sending.
                    idle.fetch_add(1, Ordering::Release);
                }
            })
            .expect("failed to spawn pool worker thread");
        self.handles.lock().push(handle);
        trace!(threads = self.thread_count(), "pool grew");
    }
}

impl WorkerPool for SimpleThreadPool {
    fn submit(&self, task: Task) {
        // Claim an idle thread if one exists; otherwise grow. Claiming
        // before sending guarantees a dedicated thread per outstanding
        // task even when tasks never return.
        let mut claimed = false;
        let mut idle = self.idle.load(Ordering::Acquire);
        while idle > 0 {
            match self.idle.compare_exchange(
                idle,
                idle - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    claimed = true;
                    break;
                }
                Err(current) => idle = current,
            }
        }
        if !claimed {
            self.spawn_worker();
        }
        self.sender
            .send(task)
            .expect("pool task channel disconnected");
    }
}

impl Default for SimpleThreadPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::latch::CountdownLatch;

    #[test]
    fn test_submit_runs_task() {
        let pool = SimpleThreadPool::new();
        let done = Arc::new(CountdownLatch::new(1));
        let signal = Arc::clone(&done);
        pool.submit(Box::new(move || signal.count_down()));
        done.wait();
        pool.join();
    }

    #[test]
    fn test_blocking_tasks_run_concurrently() {
        // Four tasks that each wait for all the others; only possible if
        // every task gets its own thread.
        let pool = SimpleThreadPool::new();
        let barrier = Arc::new(CountdownLatch::new(4));
        for _ in 0..4 {
            let barrier = Arc::clone(&barrier);
            pool.submit(Box::new(move || {
                barrier.count_down();
                barrier.wait();
            }));
        }
        barrier.wait();
        assert!(pool.thread_count() >= 4);
        pool.join();
    }

    #[test]
    fn test_join_drains_queue() {
        let pool = SimpleThreadPool::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let counter = Arc::clone(&counter);
            pool.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            }));
        }
        pool.join();
        assert_eq!(counter.load(Ordering::Relaxed), 16);
    }
}
