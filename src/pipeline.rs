use crate::error::PipelineError;
use crate::metrics::StageMetrics;
use crate::pool::WorkerPool;
use crate::queue::BufferQueue;
use crate::stage::{
    Chain, Completion, ConsumerStage, ExecContext, FilterStage, Identity, SourceStage, StageChain,
};
use std::marker::PhantomData;
use std::ops::BitOr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Capacity of the queues allocated between stages, unless overridden with
/// [`RunnablePipeline::with_queue_capacity`].
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

/// Build a pipeline from a single filter stage (`In -> Out`).
///
/// The result is *open*: it can be applied synchronously, composed with
/// further filters, given a feed with [`source`], and a sink with
/// [`consume`].
pub fn filter<In, Out, F>(function: F) -> OpenPipeline<In, FilterStage<F>>
where
    In: Send + 'static,
    Out: Send + 'static,
    F: Fn(In) -> Out + Send + Sync + 'static,
{
    OpenPipeline {
        chain: FilterStage::new(function),
        _input: PhantomData,
    }
}

/// Build a pipeline fed by an externally owned queue.
///
/// The pipeline drains `feed` until it is closed and empty; closing the
/// feed is how a running pipeline is told to finish.
pub fn source<T>(feed: BufferQueue<T>) -> SourcedPipeline<T, Identity>
where
    T: Send + 'static,
{
    SourcedPipeline {
        source: SourceStage::new(feed),
        chain: Identity,
    }
}

/// Build a pipeline terminated by a sink function (`In -> ()`).
pub fn consume<In, F>(function: F) -> SinkedPipeline<In, Identity, F>
where
    In: Send + 'static,
    F: Fn(In) + Send + Sync + 'static,
{
    SinkedPipeline {
        chain: Identity,
        sink: ConsumerStage::new(function),
        _input: PhantomData,
    }
}

/// A pipeline with both endpoints open: consumes `In`, produces the chain's
/// output. Usable as a plain function via [`apply`](Self::apply) or
/// composable into larger pipelines.
pub struct OpenPipeline<In, C> {
    chain: C,
    _input: PhantomData<fn(In)>,
}

impl<In, C> OpenPipeline<In, C>
where
    In: Send + 'static,
    C: StageChain<In>,
{
    /// Thread `input` through all stage functions synchronously, without
    /// spawning workers or queues.
    pub fn apply(&self, input: In) -> C::Out {
        self.chain.apply(input)
    }

    /// Use `workers` workers for every stage in this pipeline when run.
    ///
    /// # Panics
    ///
    /// Panics if `workers` is zero.
    pub fn parallel(mut self, workers: usize) -> Self {
        assert!(workers >= 1, "parallelism must be at least one");
        self.chain.set_parallelism(workers);
        self
    }

    /// Number of stages composed so far.
    pub fn stage_count(&self) -> usize {
        self.chain.stage_count()
    }
}

/// A pipeline with a feed attached but no sink yet.
pub struct SourcedPipeline<T, C> {
    source: SourceStage<T>,
    chain: C,
}

impl<T, C> SourcedPipeline<T, C>
where
    T: Send + 'static,
    C: StageChain<T>,
{
    /// Use `workers` workers for every filter stage when run. The source
    /// forwarder stays single so feed order is preserved into the chain.
    ///
    /// # Panics
    ///
    /// Panics if `workers` is zero.
    pub fn parallel(mut self, workers: usize) -> Self {
        assert!(workers >= 1, "parallelism must be at least one");
        self.chain.set_parallelism(workers);
        self
    }

    /// Number of stages, the source included.
    pub fn stage_count(&self) -> usize {
        1 + self.chain.stage_count()
    }
}

/// A pipeline with a sink attached but no feed yet.
pub struct SinkedPipeline<In, C, F> {
    chain: C,
    sink: ConsumerStage<F>,
    _input: PhantomData<fn(In)>,
}

impl<In, C, F> SinkedPipeline<In, C, F>
where
    In: Send + 'static,
    C: StageChain<In>,
{
    /// Use `workers` workers for every stage, the consumer included.
    ///
    /// # Panics
    ///
    /// Panics if `workers` is zero.
    pub fn parallel(mut self, workers: usize) -> Self {
        assert!(workers >= 1, "parallelism must be at least one");
        self.chain.set_parallelism(workers);
        self.sink.set_parallelism(workers);
        self
    }

    /// Number of stages, the consumer included.
    pub fn stage_count(&self) -> usize {
        self.chain.stage_count() + 1
    }
}

/// A pipeline with both a feed and a sink: the only kind that can run.
pub struct RunnablePipeline<T, C, F> {
    source: SourceStage<T>,
    chain: C,
    sink: ConsumerStage<F>,
    on_end: Vec<Box<dyn FnOnce() + Send>>,
    queue_capacity: usize,
}

impl<T, C, F> RunnablePipeline<T, C, F>
where
    T: Send + 'static,
    C: StageChain<T>,
    F: Fn(C::Out) + Send + Sync + 'static,
{
    /// Use `workers` workers for every filter stage and the consumer.
    ///
    /// # Panics
    ///
    /// Panics if `workers` is zero.
    pub fn parallel(mut self, workers: usize) -> Self {
        assert!(workers >= 1, "parallelism must be at least one");
        self.chain.set_parallelism(workers);
        self.sink.set_parallelism(workers);
        self
    }

    /// Attach a callback fired once, after the pipeline has drained and
    /// every worker has exited. Callbacks run before
    /// [`PipelineHandle::wait`] returns, in attachment order.
    pub fn on_end<H>(mut self, handler: H) -> Self
    where
        H: FnOnce() + Send + 'static,
    {
        self.on_end.push(Box::new(handler));
        self
    }

    /// Capacity for the queues allocated between stages.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        assert!(capacity >= 1, "queue capacity must be at least one");
        self.queue_capacity = capacity;
        self
    }

    /// Number of stages, source and consumer included.
    pub fn stage_count(&self) -> usize {
        2 + self.chain.stage_count()
    }

    /// Start the pipeline on `pool` and return immediately.
    ///
    /// One queue is allocated between each adjacent pair of stages and one
    /// worker (or `k` with [`parallel`](Self::parallel)) is submitted per
    /// stage. The pipeline runs until its feed is closed and drained;
    /// completion is observed through the returned [`PipelineHandle`].
    pub fn run<P>(self, pool: &P) -> PipelineHandle
    where
        P: WorkerPool,
    {
        let RunnablePipeline {
            source,
            chain,
            sink,
            on_end,
            queue_capacity,
        } = self;

        let completion = Completion::new();
        for callback in on_end {
            completion.push_on_end(callback);
        }

        debug!(
            stages = 2 + chain.stage_count(),
            queue_capacity, "starting pipeline"
        );
        let mut ctx = ExecContext::new(pool, Arc::clone(&completion), queue_capacity);
        let head = source.spawn(&mut ctx);
        let tail = chain.attach(head, &mut ctx);
        sink.spawn(tail, &mut ctx);
        completion.release_builder();

        PipelineHandle { completion }
    }
}

// Open | Open => Open
impl<In, C, D> BitOr<OpenPipeline<C::Out, D>> for OpenPipeline<In, C>
where
    In: Send + 'static,
    C: StageChain<In>,
    D: StageChain<C::Out>,
{
    type Output = OpenPipeline<In, Chain<C, D>>;

    fn bitor(self, rhs: OpenPipeline<C::Out, D>) -> Self::Output {
        OpenPipeline {
            chain: Chain::new(self.chain, rhs.chain),
            _input: PhantomData,
        }
    }
}

// Sourced | Open => Sourced
impl<T, C, D> BitOr<OpenPipeline<C::Out, D>> for SourcedPipeline<T, C>
where
    T: Send + 'static,
    C: StageChain<T>,
    D: StageChain<C::Out>,
{
    type Output = SourcedPipeline<T, Chain<C, D>>;

    fn bitor(self, rhs: OpenPipeline<C::Out, D>) -> Self::Output {
        SourcedPipeline {
            source: self.source,
            chain: Chain::new(self.chain, rhs.chain),
        }
    }
}

// Open | Sinked => Sinked
impl<In, C, D, F> BitOr<SinkedPipeline<C::Out, D, F>> for OpenPipeline<In, C>
where
    In: Send + 'static,
    C: StageChain<In>,
    D: StageChain<C::Out>,
{
    type Output = SinkedPipeline<In, Chain<C, D>, F>;

    fn bitor(self, rhs: SinkedPipeline<C::Out, D, F>) -> Self::Output {
        SinkedPipeline {
            chain: Chain::new(self.chain, rhs.chain),
            sink: rhs.sink,
            _input: PhantomData,
        }
    }
}

// Sourced | Sinked => Runnable
impl<T, C, D, F> BitOr<SinkedPipeline<C::Out, D, F>> for SourcedPipeline<T, C>
where
    T: Send + 'static,
    C: StageChain<T>,
    D: StageChain<C::Out>,
{
    type Output = RunnablePipeline<T, Chain<C, D>, F>;

    fn bitor(self, rhs: SinkedPipeline<C::Out, D, F>) -> Self::Output {
        RunnablePipeline {
            source: self.source,
            chain: Chain::new(self.chain, rhs.chain),
            sink: rhs.sink,
            on_end: Vec::new(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Observer for a running pipeline, returned by
/// [`RunnablePipeline::run`]. Cheap to pass around; all methods take
/// `&self`.
pub struct PipelineHandle {
    completion: Arc<Completion>,
}

impl PipelineHandle {
    /// Block until the pipeline has drained and every worker has exited.
    pub fn wait(&self) {
        self.completion.wait();
    }

    /// As [`wait`](Self::wait), giving up after `timeout`. Returns true if
    /// the pipeline finished.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.completion.wait_timeout(timeout)
    }

    /// Whether the pipeline has already finished.
    pub fn is_finished(&self) -> bool {
        self.completion.is_finished()
    }

    /// The first stage failure, if any stage function panicked.
    pub fn first_error(&self) -> Option<PipelineError> {
        self.completion.first_error()
    }

    /// Live per-stage counters, one entry per stage in pipeline order.
    pub fn stage_metrics(&self) -> Vec<StageMetrics> {
        self.completion.stage_metrics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_filter_apply() {
        let pipeline = filter(|s: String| s.len());
        assert_eq!(pipeline.apply("hello".to_string()), 5);
    }

    #[test]
    fn test_composed_apply_matches_function_composition() {
        let double = filter(|x: i32| x * 2);
        let add_one = filter(|x: i32| x + 1);
        let pipeline = double | add_one;
        assert_eq!(pipeline.apply(20), 41);
        assert_eq!(pipeline.stage_count(), 2);
    }

    #[test]
    fn test_classification_stage_counts() {
        let feed: BufferQueue<i32> = BufferQueue::new(4);
        let sourced = source(feed) | filter(|x: i32| x + 1);
        assert_eq!(sourced.stage_count(), 2);

        let sinked = filter(|x: i32| x + 1) | consume(|_x: i32| {});
        assert_eq!(sinked.stage_count(), 2);

        let feed: BufferQueue<i32> = BufferQueue::new(4);
        let runnable = source(feed) | filter(|x: i32| x + 1) | consume(|_x: i32| {});
        assert_eq!(runnable.stage_count(), 3);
    }

    #[test]
    #[should_panic(expected = "parallelism must be at least one")]
    fn test_zero_parallelism_panics() {
        let _ = filter(|x: i32| x).parallel(0);
    }
}
