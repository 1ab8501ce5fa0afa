use crate::error::PipelineError;
use crate::latch::CountdownLatch;
use crate::metrics::StageMetrics;
use crate::pool::{Task, WorkerPool};
use crate::queue::BufferQueue;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, trace};

/// Shared completion record for one pipeline run.
///
/// Workers register before they are submitted and deregister on exit; the
/// last one out fires the `on_end` callbacks and counts the latch down, so
/// the latch opens exactly once, after every worker has exited. A builder
/// token held during `run` keeps the count from reaching zero while stages
/// are still being attached.
pub(crate) struct Completion {
    active_workers: AtomicUsize,
    latch: CountdownLatch,
    on_end: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    first_error: Mutex<Option<PipelineError>>,
    metrics: Mutex<Vec<StageMetrics>>,
}

impl Completion {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            // The builder token; released when `run` finishes attaching.
            active_workers: AtomicUsize::new(1),
            latch: CountdownLatch::new(1),
            on_end: Mutex::new(Vec::new()),
            first_error: Mutex::new(None),
            metrics: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn push_on_end(&self, callback: Box<dyn FnOnce() + Send>) {
        self.on_end.lock().push(callback);
    }

    pub(crate) fn register_metrics(&self, metrics: StageMetrics) {
        self.metrics.lock().push(metrics);
    }

    fn add_worker(&self) {
        self.active_workers.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn worker_exited(&self) {
        if self.active_workers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finish();
        }
    }

    pub(crate) fn release_builder(&self) {
        self.worker_exited();
    }

    fn finish(&self) {
        let callbacks = std::mem::take(&mut *self.on_end.lock());
        for callback in callbacks {
            if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
                error!("on_end callback panicked");
            }
        }
        debug!("pipeline drained");
        self.latch.count_down();
    }

    pub(crate) fn record_error(&self, error: PipelineError) {
        let mut slot = self.first_error.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    pub(crate) fn first_error(&self) -> Option<PipelineError> {
        self.first_error.lock().clone()
    }

    pub(crate) fn stage_metrics(&self) -> Vec<StageMetrics> {
        self.metrics.lock().clone()
    }

    pub(crate) fn wait(&self) {
        self.latch.wait();
    }

    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        self.latch.wait_timeout(timeout)
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.latch.count() == 0
    }
}

/// Ensures a stage's downstream queue is closed exactly once: the last of
/// the stage's workers to leave closes it.
struct StageGate {
    remaining: AtomicUsize,
}

impl StageGate {
    fn new(workers: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(workers),
        }
    }

    fn leave(&self) -> bool {
        self.remaining.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

/// Execution state threaded through stage attachment: the pool to submit
/// workers to, the shared completion record, and the capacity used for the
/// queues allocated between stages.
pub struct ExecContext<'a> {
    pool: &'a dyn WorkerPool,
    completion: Arc<Completion>,
    queue_capacity: usize,
    next_stage: usize,
}

impl<'a> ExecContext<'a> {
    pub(crate) fn new(
        pool: &'a dyn WorkerPool,
        completion: Arc<Completion>,
        queue_capacity: usize,
    ) -> Self {
        Self {
            pool,
            completion,
            queue_capacity,
            next_stage: 0,
        }
    }

    fn next_label(&mut self, kind: &str) -> String {
        let index = self.next_stage;
        self.next_stage += 1;
        format!("{kind}#{index}")
    }

    fn completion(&self) -> Arc<Completion> {
        Arc::clone(&self.completion)
    }

    fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Register the worker with the completion record, then hand it to the
    /// pool. Registration must precede submission or an early exit could
    /// open the latch while later stages are still being attached.
    fn submit(&self, task: Task) {
        self.completion.add_worker();
        self.pool.submit(task);
    }

    fn new_metrics(&self, label: &str) -> StageMetrics {
        let metrics = StageMetrics::new(label);
        self.completion.register_metrics(metrics.clone());
        metrics
    }
}

/// A typed chain of filter stages transforming `In` into `Self::Out`.
///
/// Chains are built by the pipeline composition operator and consumed by
/// the execution engine: [`apply`](Self::apply) threads a value through the
/// stage functions synchronously, while [`attach`](Self::attach) allocates
/// the inter-stage queues and submits one worker per stage (or `k` with
/// [`set_parallelism`](Self::set_parallelism)).
pub trait StageChain<In>: Send + Sized + 'static
where
    In: Send + 'static,
{
    /// The type produced at the downstream end of the chain.
    type Out: Send + 'static;

    /// Thread `input` through every stage function synchronously.
    fn apply(&self, input: In) -> Self::Out;

    /// Spawn this chain's workers, reading from `input`; returns the queue
    /// carrying the chain's output.
    fn attach(self, input: BufferQueue<In>, ctx: &mut ExecContext<'_>) -> BufferQueue<Self::Out>;

    /// Set the worker count for every stage in the chain.
    fn set_parallelism(&mut self, workers: usize);

    /// Number of stages in the chain.
    fn stage_count(&self) -> usize;
}

/// A single filter stage: a pure function `In -> Out` plus a worker count.
pub struct FilterStage<F> {
    function: Arc<F>,
    workers: usize,
}

impl<F> FilterStage<F> {
    pub(crate) fn new(function: F) -> Self {
        Self {
            function: Arc::new(function),
            workers: 1,
        }
    }
}

impl<In, Out, F> StageChain<In> for FilterStage<F>
where
    In: Send + 'static,
    Out: Send + 'static,
    F: Fn(In) -> Out + Send + Sync + 'static,
{
    type Out = Out;

    fn apply(&self, input: In) -> Out {
        (self.function)(input)
    }

    fn attach(self, input: BufferQueue<In>, ctx: &mut ExecContext<'_>) -> BufferQueue<Out> {
        let label = ctx.next_label("filter");
        let output = BufferQueue::named(ctx.queue_capacity(), label.clone());
        let metrics = ctx.new_metrics(&label);
        let gate = Arc::new(StageGate::new(self.workers));
        for _ in 0..self.workers {
            let function = Arc::clone(&self.function);
            let input = input.clone();
            let output = output.clone();
            let gate = Arc::clone(&gate);
            let completion = ctx.completion();
            let metrics = metrics.clone();
            let label = label.clone();
            ctx.submit(Box::new(move || {
                run_filter_worker(&label, function, input, output, gate, completion, metrics);
            }));
        }
        output
    }

    fn set_parallelism(&mut self, workers: usize) {
        self.workers = workers;
    }

    fn stage_count(&self) -> usize {
        1
    }
}

/// Two chains joined end to end. Produced by the composition operator.
pub struct Chain<A, B> {
    head: A,
    tail: B,
}

impl<A, B> Chain<A, B> {
    pub(crate) fn new(head: A, tail: B) -> Self {
        Self { head, tail }
    }
}

impl<In, A, B> StageChain<In> for Chain<A, B>
where
    In: Send + 'static,
    A: StageChain<In>,
    B: StageChain<A::Out>,
{
    type Out = B::Out;

    fn apply(&self, input: In) -> Self::Out {
        self.tail.apply(self.head.apply(input))
    }

    fn attach(self, input: BufferQueue<In>, ctx: &mut ExecContext<'_>) -> BufferQueue<Self::Out> {
        let middle = self.head.attach(input, ctx);
        self.tail.attach(middle, ctx)
    }

    fn set_parallelism(&mut self, workers: usize) {
        self.head.set_parallelism(workers);
        self.tail.set_parallelism(workers);
    }

    fn stage_count(&self) -> usize {
        self.head.stage_count() + self.tail.stage_count()
    }
}

/// The empty chain: passes its input queue straight through. `source(q)`
/// and `consume(c)` start from this.
pub struct Identity;

impl<In> StageChain<In> for Identity
where
    In: Send + 'static,
{
    type Out = In;

    fn apply(&self, input: In) -> In {
        input
    }

    fn attach(self, input: BufferQueue<In>, _ctx: &mut ExecContext<'_>) -> BufferQueue<In> {
        input
    }

    fn set_parallelism(&mut self, _workers: usize) {}

    fn stage_count(&self) -> usize {
        0
    }
}

/// The head of a runnable pipeline: forwards values from an externally
/// owned queue into the first inter-stage queue. Closing the external feed
/// is what ends the pipeline.
pub struct SourceStage<T> {
    feed: BufferQueue<T>,
}

impl<T> SourceStage<T>
where
    T: Send + 'static,
{
    pub(crate) fn new(feed: BufferQueue<T>) -> Self {
        Self { feed }
    }

    pub(crate) fn spawn(self, ctx: &mut ExecContext<'_>) -> BufferQueue<T> {
        let label = ctx.next_label("source");
        let output = BufferQueue::named(ctx.queue_capacity(), label.clone());
        let metrics = ctx.new_metrics(&label);
        let feed = self.feed;
        let completion = ctx.completion();
        let worker_output = output.clone();
        ctx.submit(Box::new(move || {
            run_source_worker(&label, feed, worker_output, completion, metrics);
        }));
        output
    }
}

/// The tail of a runnable pipeline: applies a sink function to every value
/// that reaches the end of the chain.
pub struct ConsumerStage<F> {
    function: Arc<F>,
    workers: usize,
}

impl<F> ConsumerStage<F> {
    pub(crate) fn new(function: F) -> Self {
        Self {
            function: Arc::new(function),
            workers: 1,
        }
    }

    pub(crate) fn set_parallelism(&mut self, workers: usize) {
        self.workers = workers;
    }

    pub(crate) fn spawn<In>(self, input: BufferQueue<In>, ctx: &mut ExecContext<'_>)
    where
        In: Send + 'static,
        F: Fn(In) + Send + Sync + 'static,
    {
        let label = ctx.next_label("consumer");
        let metrics = ctx.new_metrics(&label);
        for _ in 0..self.workers {
            let function = Arc::clone(&self.function);
            let input = input.clone();
            let completion = ctx.completion();
            let metrics = metrics.clone();
            let label = label.clone();
            ctx.submit(Box::new(move || {
                run_consumer_worker(&label, function, input, completion, metrics);
            }));
        }
    }
}

fn run_source_worker<T>(
    label: &str,
    feed: BufferQueue<T>,
    output: BufferQueue<T>,
    completion: Arc<Completion>,
    metrics: StageMetrics,
) where
    T: Send + 'static,
{
    trace!(stage = label, "worker started");
    loop {
        match feed.pop() {
            Ok(value) => {
                if output.push(value).is_err() {
                    // Downstream is gone; stop the feed so its producers
                    // are not left blocked.
                    feed.close();
                    break;
                }
                metrics.record_processed();
            }
            Err(_) => break, // feed closed and drained
        }
    }
    debug!(stage = label, "closing downstream queue");
    output.close();
    trace!(stage = label, "worker exited");
    completion.worker_exited();
}

fn run_filter_worker<In, Out, F>(
    label: &str,
    function: Arc<F>,
    input: BufferQueue<In>,
    output: BufferQueue<Out>,
    gate: Arc<StageGate>,
    completion: Arc<Completion>,
    metrics: StageMetrics,
) where
    In: Send + 'static,
    Out: Send + 'static,
    F: Fn(In) -> Out + Send + Sync + 'static,
{
    trace!(stage = label, "worker started");
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| loop {
        match input.pop() {
            Ok(value) => {
                let mapped = (function)(value);
                if output.push(mapped).is_err() {
                    // Downstream refused the value: it has failed and
                    // closed. Release our own upstream the same way.
                    input.close();
                    break;
                }
                metrics.record_processed();
            }
            Err(_) => break, // upstream closed and drained
        }
    }));
    if let Err(payload) = outcome {
        let message = panic_message(payload.as_ref());
        error!(stage = label, panic = %message, "stage panicked");
        completion.record_error(PipelineError::StagePanic {
            stage: label.to_string(),
            message,
        });
        input.close();
    }
    if gate.leave() {
        debug!(stage = label, "closing downstream queue");
        output.close();
    }
    trace!(stage = label, "worker exited");
    completion.worker_exited();
}

fn run_consumer_worker<In, F>(
    label: &str,
    function: Arc<F>,
    input: BufferQueue<In>,
    completion: Arc<Completion>,
    metrics: StageMetrics,
) where
    In: Send + 'static,
    F: Fn(In) + Send + Sync + 'static,
{
    trace!(stage = label, "worker started");
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| loop {
        match input.pop() {
            Ok(value) => {
                (function)(value);
                metrics.record_processed();
            }
            Err(_) => break, // upstream closed and drained
        }
    }));
    if let Err(payload) = outcome {
        let message = panic_message(payload.as_ref());
        error!(stage = label, panic = %message, "stage panicked");
        completion.record_error(PipelineError::StagePanic {
            stage: label.to_string(),
            message,
        });
        input.close();
    }
    trace!(stage = label, "worker exited");
    completion.worker_exited();
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_stage_apply() {
        let stage = FilterStage::new(|x: i32| x * 2);
        assert_eq!(stage.apply(21), 42);
    }

    #[test]
    fn test_chain_applies_in_order() {
        let chain = Chain::new(
            FilterStage::new(|s: String| s.len()),
            FilterStage::new(|n: usize| n + 1),
        );
        assert_eq!(chain.apply("hello".to_string()), 6);
        assert_eq!(chain.stage_count(), 2);
    }

    #[test]
    fn test_identity_apply() {
        let identity = Identity;
        assert_eq!(
            <Identity as StageChain<i32>>::apply(&identity, 7),
            7
        );
        assert_eq!(<Identity as StageChain<i32>>::stage_count(&identity), 0);
    }

    #[test]
    fn test_set_parallelism_recurses() {
        let mut chain = Chain::new(FilterStage::new(|x: i32| x), FilterStage::new(|x: i32| x));
        chain.set_parallelism(3);
        assert_eq!(chain.head.workers, 3);
        assert_eq!(chain.tail.workers, 3);
    }

    #[test]
    fn test_completion_fires_after_last_worker() {
        let completion = Completion::new();
        completion.add_worker();
        completion.add_worker();
        completion.release_builder();
        assert!(!completion.is_finished());
        completion.worker_exited();
        assert!(!completion.is_finished());
        completion.worker_exited();
        assert!(completion.is_finished());
    }

    #[test]
    fn test_completion_keeps_first_error() {
        let completion = Completion::new();
        completion.record_error(PipelineError::StagePanic {
            stage: "filter#1".into(),
            message: "first".into(),
        });
        completion.record_error(PipelineError::StagePanic {
            stage: "filter#2".into(),
            message: "second".into(),
        });
        match completion.first_error() {
            Some(PipelineError::StagePanic { message, .. }) => assert_eq!(message, "first"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_panic_message_rendering() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new("formatted".to_string());
        assert_eq!(panic_message(payload.as_ref()), "formatted");
        let payload: Box<dyn Any + Send> = Box::new(17_u8);
        assert_eq!(panic_message(payload.as_ref()), "opaque panic payload");
    }
}
