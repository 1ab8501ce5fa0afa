//! Typed, composable, concurrent pipelines over bounded blocking queues.
//!
//! This crate lets you build a directed chain of processing stages that
//! transform values of one type into values of another, feed it from a
//! queue, terminate it with a sink, and run the whole chain on a worker
//! pool with bounded buffering between stages.
//!
//! # Features
//!
//! - Bounded blocking MPMC queue with a closed state and precise statuses
//!   for blocking, non-waiting, and non-locking operations
//! - Stages as plain functions; mismatched compositions fail to compile
//! - `|` operator to chain stages, sources, and sinks
//! - Synchronous `apply` shortcut for open pipelines
//! - Per-stage parallelism; end-of-stream propagates downstream on close
//! - Completion latch, `on_end` callbacks, and per-stage counters
//!
//! # Example
//!
//! ```ignore
//! use flowline::{consume, filter, source, BufferQueue, SimpleThreadPool};
//!
//! let feed = BufferQueue::preloaded(10, ["hello".to_string(), "world".to_string()]);
//! let pool = SimpleThreadPool::new();
//!
//! let handle = (source(feed.clone())
//!     | filter(|s: String| s.len())
//!     | consume(|n: usize| println!("{n}")))
//!     .run(&pool);
//!
//! feed.push("more".to_string()).unwrap();
//! feed.close();
//! handle.wait();
//! ```

pub mod error;
pub mod latch;
pub mod metrics;
pub mod pipeline;
pub mod pool;
pub mod queue;
pub mod stage;

// Re-exports for convenience
pub use error::{PipelineError, PopError, PushError, Result};
pub use latch::CountdownLatch;
pub use metrics::{MetricsSnapshot, StageMetrics};
pub use pipeline::{
    consume, filter, source, OpenPipeline, PipelineHandle, RunnablePipeline, SinkedPipeline,
    SourcedPipeline, DEFAULT_QUEUE_CAPACITY,
};
pub use pool::{SimpleThreadPool, Task, WorkerPool};
pub use queue::BufferQueue;
pub use stage::{Chain, ConsumerStage, FilterStage, Identity, SourceStage, StageChain};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
