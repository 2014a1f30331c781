use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::context::Context;
use crate::core::demand;
use crate::core::registry::{Handle, Registry};
use crate::core::traits::{Consumer, Processor, Producer, Signal, Sink, Subscription};
use crate::error::{Error, Result};
use crate::hooks;
use crate::processors::ring::{DemandGate, RingCore, RingProcessorConfig};
use crate::ring_buffer::{Sequence, SequenceBarrier};
use crate::scheduler::{Disposable, Scheduler};

/// Idle workers park their gating sequence here so they never hold back
/// producers.
const IDLE: i64 = i64::MAX;

/// Ring-buffer work distribution: each value goes to exactly one subscriber.
///
/// Subscribers ("workers") compete for the next value and only claim one
/// while they hold demand. A value claimed by a worker that is cancelled
/// before delivery is handed to another worker. Values published before the
/// first worker arrives wait in the ring. Every worker receives the terminal
/// signal once the values committed before it have been handed out.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use fluxweld::core::{Producer, Sink};
/// use fluxweld::processors::WorkQueueProcessor;
/// use fluxweld::scheduler::TokioScheduler;
/// use fluxweld::testing::TestConsumer;
///
/// #[tokio::main]
/// async fn main() -> fluxweld::Result<()> {
///     let queue = WorkQueueProcessor::create(TokioScheduler::shared()?)?;
///     let a = TestConsumer::new();
///     let b = TestConsumer::new();
///     queue.subscribe(a.clone());
///     queue.subscribe(b.clone());
///
///     for i in 0..10 {
///         queue.next(i);
///     }
///     queue.complete();
///
///     a.await_terminal(Duration::from_secs(5)).await?;
///     b.await_terminal(Duration::from_secs(5)).await?;
///     assert_eq!(a.values().len() + b.values().len(), 10);
///     Ok(())
/// }
/// ```
pub struct WorkQueueProcessor<T> {
    inner: Arc<WorkQueueInner<T>>,
}

#[derive(Default)]
struct Workers {
    count: usize,
    closed: bool,
}

struct WorkQueueInner<T> {
    core: RingCore<T>,
    scheduler: Arc<dyn Scheduler>,
    /// Last sequence claimed by any worker. Permanently gating, so unclaimed
    /// values are never overwritten.
    work_sequence: Arc<Sequence>,
    /// Values claimed by a worker that was cancelled before delivering them.
    retry: Mutex<VecDeque<T>>,
    /// Values claimed from the ring but not yet delivered or put on `retry`.
    in_flight: AtomicUsize,
    members: Mutex<Workers>,
    workers: Registry<Worker<T>>,
    auto_cancel: bool,
    max_subscribers: usize,
}

struct Worker<T> {
    actual: Arc<dyn Consumer<T>>,
    gate: DemandGate,
    /// Sequence below the slot being claimed, [`IDLE`] otherwise.
    sequence: Arc<Sequence>,
    barrier: SequenceBarrier,
    cancelled: AtomicBool,
    handle: OnceLock<Handle>,
    task: OnceLock<Arc<dyn Disposable>>,
    started: AtomicBool,
}

impl<T: Send + Sync + 'static> Worker<T> {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl<T: Send + Sync + 'static> Subscription for Worker<T> {
    fn request(&self, n: u64) {
        if demand::validate(n) {
            self.gate.add(n);
        }
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.barrier.alert();
            self.gate.wake();
        }
    }
}

enum Claim<T> {
    Item(T),
    Terminal,
    /// Lost a race, skipped slot, or interrupted; try again.
    Nothing,
}

impl<T: Send + Sync + 'static> WorkQueueInner<T> {
    /// Everything before the terminal signal has been handed out.
    fn drained(&self) -> bool {
        let terminal = self.core.terminal_sequence();
        if terminal == IDLE || self.work_sequence.get() < terminal - 1 {
            return false;
        }
        // values move between `retry` and `in_flight` under this lock
        let retry = self.retry.lock();
        retry.is_empty() && self.in_flight.load(Ordering::SeqCst) == 0
    }

    /// Interrupt every worker, whether it waits for demand or for the ring.
    fn wake_workers(&self) {
        for (_, worker) in self.workers.snapshot().iter() {
            worker.barrier.alert();
            worker.gate.wake();
        }
    }

    fn claim(&self, worker: &Worker<T>) -> Claim<T> {
        loop {
            let current = self.work_sequence.get();
            if current >= self.core.terminal_sequence() {
                // the terminal slot is taken; nothing follows it
                return Claim::Nothing;
            }
            let next = current + 1;
            worker.sequence.set(current);
            match worker.barrier.wait_for(next) {
                Ok(available) if available >= next => {}
                Ok(_) => {
                    worker.sequence.set(IDLE);
                    std::hint::spin_loop();
                    continue;
                }
                Err(_) => {
                    worker.sequence.set(IDLE);
                    worker.barrier.clear_alert();
                    return Claim::Nothing;
                }
            }
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            if !self.work_sequence.compare_and_set(current, next) {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                worker.sequence.set(IDLE);
                return Claim::Nothing;
            }
            // SAFETY: published, gated by our sequence, and the CAS above made
            // us its only reader.
            let slot = unsafe { self.core.ring.take(next) };
            worker.sequence.set(IDLE);
            return match slot {
                Some(Signal::Next(value)) => Claim::Item(value),
                other => {
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                    match other {
                        Some(_) => Claim::Terminal,
                        None => Claim::Nothing,
                    }
                }
            };
        }
    }

    /// Deliver a claimed value, or queue it for another worker if `worker`
    /// was cancelled since claiming it. Returns false in that case.
    fn hand_off(&self, worker: &Worker<T>, value: T) -> bool {
        if worker.is_cancelled() {
            let mut retry = self.retry.lock();
            retry.push_back(value);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            drop(retry);
            self.wake_workers();
            return false;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        worker.actual.on_next(value);
        true
    }

    fn run(&self, worker: &Worker<T>) {
        if worker.started.swap(true, Ordering::AcqRel) {
            return;
        }
        loop {
            if worker.is_cancelled() {
                break;
            }
            if self.drained() {
                self.core.terminal.deliver(&*worker.actual);
                break;
            }
            if !worker
                .gate
                .acquire(|| worker.is_cancelled() || self.drained())
            {
                continue;
            }
            let retried = {
                let mut retry = self.retry.lock();
                let value = retry.pop_front();
                if value.is_some() {
                    self.in_flight.fetch_add(1, Ordering::SeqCst);
                }
                value
            };
            if let Some(value) = retried {
                if !self.hand_off(worker, value) {
                    break;
                }
                continue;
            }
            match self.claim(worker) {
                Claim::Item(value) => {
                    if !self.hand_off(worker, value) {
                        break;
                    }
                }
                // the cached terminal goes out once `retry` is empty too
                Claim::Terminal | Claim::Nothing => worker.gate.restore(),
            }
        }
        self.leave(worker);
    }

    fn leave(&self, worker: &Worker<T>) {
        let mut members = self.members.lock();
        if let Some(handle) = worker.handle.get() {
            self.workers.remove(*handle);
        }
        self.core.ring.remove_gating_sequence(&worker.sequence);
        members.count -= 1;
        let cancel_upstream =
            members.count == 0 && self.auto_cancel && !self.core.terminal.is_set();
        if cancel_upstream {
            members.closed = true;
        }
        drop(members);
        if cancel_upstream {
            self.core.cancel_upstream();
            let stranded = std::mem::take(&mut *self.retry.lock());
            for value in stranded {
                hooks::next_dropped(value);
            }
        }
    }
}

impl<T: Send + Sync + 'static> WorkQueueProcessor<T> {
    pub fn with_config(config: RingProcessorConfig, scheduler: Arc<dyn Scheduler>) -> Result<Self> {
        let core = RingCore::new(&config)?;
        let work_sequence = Arc::new(Sequence::new(Sequence::INITIAL));
        core.ring.add_gating_sequence(work_sequence.clone());
        Ok(Self {
            inner: Arc::new(WorkQueueInner {
                core,
                scheduler,
                work_sequence,
                retry: Mutex::new(VecDeque::new()),
                in_flight: AtomicUsize::new(0),
                members: Mutex::new(Workers::default()),
                workers: Registry::new(),
                auto_cancel: config.auto_cancel,
                max_subscribers: config.max_subscribers,
            }),
        })
    }

    /// Work queue with the default configuration.
    pub fn create(scheduler: Arc<dyn Scheduler>) -> Result<Self> {
        Self::with_config(RingProcessorConfig::default(), scheduler)
    }

    /// Values committed but not yet claimed by a worker.
    pub fn pending(&self) -> usize {
        let claimed = self.inner.core.ring.cursor();
        let handed_out = self.inner.work_sequence.get();
        let terminal = usize::from(self.inner.core.terminal_sequence() <= claimed);
        ((claimed - handed_out).max(0) as usize).saturating_sub(terminal)
            + self.inner.retry.lock().len()
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.core.ring.buffer_size()
    }

    /// Stop every worker without a terminal signal and cancel the upstream.
    pub fn force_shutdown(&self) {
        self.inner.core.cancel_upstream();
        for (_, worker) in self.inner.workers.snapshot().iter() {
            worker.cancel();
            if let Some(task) = worker.task.get() {
                task.dispose();
            }
            // a disposed loop that never started still has to deregister
            if !worker.started.swap(true, Ordering::AcqRel) {
                self.inner.leave(worker);
            }
        }
    }
}

impl<T> Clone for WorkQueueProcessor<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Producer<T> for WorkQueueProcessor<T> {
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) -> Arc<dyn Subscription> {
        let inner = &self.inner;
        inner.core.context.record(&*consumer);

        let mut members = inner.members.lock();
        if inner.drained() {
            drop(members);
            return inner.core.replay_terminal(&*consumer);
        }
        if members.closed || inner.core.is_cancelled() {
            drop(members);
            return demand::reject(&*consumer, Error::rejected("work queue processor was cancelled"));
        }
        if members.count >= inner.max_subscribers {
            let error = Error::capacity(members.count, inner.max_subscribers);
            drop(members);
            return demand::reject(&*consumer, error);
        }
        members.count += 1;

        let worker = Arc::new(Worker {
            actual: consumer.clone(),
            gate: DemandGate::default(),
            sequence: Arc::new(Sequence::new(IDLE)),
            barrier: inner.core.ring.new_barrier(),
            cancelled: AtomicBool::new(false),
            handle: OnceLock::new(),
            task: OnceLock::new(),
            started: AtomicBool::new(false),
        });
        inner.core.ring.add_gating_sequence(worker.sequence.clone());
        if let Some(handle) = inner.workers.add(worker.clone()) {
            let _ = worker.handle.set(handle);
        }
        drop(members);

        consumer.on_subscribe(worker.clone());
        let task_inner = inner.clone();
        let task_worker = worker.clone();
        let task = inner
            .scheduler
            .schedule(Box::new(move || task_inner.run(&task_worker)));
        let _ = worker.task.set(task);
        worker
    }
}

impl<T: Send + Sync + 'static> Consumer<T> for WorkQueueProcessor<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.inner.core.on_subscribe(subscription);
    }

    fn on_next(&self, value: T) {
        self.inner.core.commit_next(value);
    }

    fn on_error(&self, error: Error) {
        if self.inner.core.commit_terminal(Some(error)) {
            self.inner.wake_workers();
        }
    }

    fn on_complete(&self) {
        if self.inner.core.commit_terminal(None) {
            self.inner.wake_workers();
        }
    }

    fn current_context(&self) -> Context {
        self.inner.core.context.get()
    }
}

impl<T: Send + Sync + 'static> Sink<T> for WorkQueueProcessor<T> {
    fn next(&self, value: T) {
        self.on_next(value);
    }

    fn error(&self, error: Error) {
        self.on_error(error);
    }

    fn complete(&self) {
        self.on_complete();
    }
}

impl<T: Send + Sync + 'static> Processor<T> for WorkQueueProcessor<T> {
    fn is_terminated(&self) -> bool {
        self.inner.core.terminal.is_set() || self.inner.core.is_cancelled()
    }

    fn subscriber_count(&self) -> usize {
        self.inner.workers.len()
    }

    fn terminal_error(&self) -> Option<Error> {
        self.inner.core.terminal.error()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::time::Duration;

    use super::*;
    use crate::ring_buffer::WaitStrategy;
    use crate::scheduler::TokioScheduler;
    use crate::testing::TestConsumer;

    const WAIT: Duration = Duration::from_secs(5);

    fn queue(config: RingProcessorConfig) -> WorkQueueProcessor<u32> {
        WorkQueueProcessor::with_config(
            config.buffer_size(32).wait_strategy(WaitStrategy::Yielding),
            TokioScheduler::shared().unwrap(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_each_value_delivered_exactly_once() {
        let queue = queue(RingProcessorConfig::default());
        let workers: Vec<_> = (0..3).map(|_| TestConsumer::new()).collect();
        for worker in &workers {
            queue.subscribe(worker.clone());
        }
        for i in 0..20 {
            queue.next(i);
        }
        queue.complete();

        let mut seen = Vec::new();
        for worker in &workers {
            worker.await_terminal(WAIT).await.unwrap();
            assert_eq!(worker.completions(), 1);
            seen.extend(worker.values());
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_values_wait_for_first_worker() {
        let queue = queue(RingProcessorConfig::default());
        queue.next(1);
        queue.next(2);
        assert_eq!(queue.pending(), 2);

        let worker = TestConsumer::new();
        queue.subscribe(worker.clone());
        worker.await_values(2, WAIT).await.unwrap();
        assert_eq!(worker.values(), vec![1, 2]);
        queue.complete();
        worker.await_terminal(WAIT).await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_without_demand_takes_nothing() {
        let queue = queue(RingProcessorConfig::default());
        let idle = TestConsumer::with_request(0);
        let busy = TestConsumer::new();
        queue.subscribe(idle.clone());
        queue.subscribe(busy.clone());
        for i in 0..5 {
            queue.next(i);
        }
        busy.await_values(5, WAIT).await.unwrap();
        assert!(idle.values().is_empty());

        queue.complete();
        idle.await_terminal(WAIT).await.unwrap();
        busy.await_terminal(WAIT).await.unwrap();
        assert_eq!(idle.completions(), 1);
    }

    #[tokio::test]
    async fn test_late_worker_after_drain_gets_terminal() {
        let queue = queue(RingProcessorConfig::default());
        let worker = TestConsumer::new();
        queue.subscribe(worker.clone());
        queue.next(1);
        queue.error(Error::custom("stop"));
        worker.await_terminal(WAIT).await.unwrap();

        let late = TestConsumer::new();
        queue.subscribe(late.clone());
        assert!(matches!(late.error(), Some(Error::Custom(_))));
        assert!(late.values().is_empty());
    }

    #[tokio::test]
    async fn test_auto_cancel_when_last_worker_leaves() {
        let queue = queue(RingProcessorConfig::default());
        let worker = TestConsumer::new();
        queue.subscribe(worker.clone());
        worker.cancel();

        let deadline = tokio::time::Instant::now() + WAIT;
        while !queue.is_terminated() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(queue.is_terminated());
        let late = TestConsumer::new();
        queue.subscribe(late.clone());
        assert!(matches!(late.error(), Some(Error::Rejected(_))));
    }

    /// A worker known to the ring but without a scheduled loop, so a test can
    /// drive `claim` and `hand_off` by hand.
    fn detached_worker(queue: &WorkQueueProcessor<u32>) -> Worker<u32> {
        let worker = Worker {
            actual: TestConsumer::<u32>::new(),
            gate: DemandGate::default(),
            sequence: Arc::new(Sequence::new(IDLE)),
            barrier: queue.inner.core.ring.new_barrier(),
            cancelled: AtomicBool::new(false),
            handle: OnceLock::new(),
            task: OnceLock::new(),
            started: AtomicBool::new(true),
        };
        queue.inner.core.ring.add_gating_sequence(worker.sequence.clone());
        worker
    }

    #[tokio::test]
    async fn test_value_claimed_by_cancelled_worker_goes_to_another() {
        let queue = queue(RingProcessorConfig::default());
        let survivor = TestConsumer::with_request(0);
        queue.subscribe(survivor.clone());
        let quitter = detached_worker(&queue);

        queue.next(7);
        let claimed = match queue.inner.claim(&quitter) {
            Claim::Item(value) => value,
            _ => panic!("value 7 was published"),
        };
        quitter.cancel();
        assert!(!queue.inner.hand_off(&quitter, claimed));
        assert_eq!(queue.pending(), 1);

        queue.complete();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!survivor.is_terminated());

        survivor.request(1);
        survivor.await_terminal(WAIT).await.unwrap();
        assert_eq!(survivor.values(), vec![7]);
        assert_eq!(survivor.completions(), 1);
    }

    #[tokio::test]
    async fn test_claim_stops_at_taken_terminal_slot() {
        let queue = queue(RingProcessorConfig::default());
        let first = detached_worker(&queue);
        let second = detached_worker(&queue);
        queue.complete();

        assert!(matches!(queue.inner.claim(&first), Claim::Terminal));
        // would otherwise wait for a slot after the terminal forever
        assert!(matches!(queue.inner.claim(&second), Claim::Nothing));
        assert!(queue.inner.drained());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_workers_cancelling_mid_stream_lose_nothing() {
        for round in 0..20u32 {
            let queue = queue(RingProcessorConfig::default());
            let quitters: Vec<_> = (0..2).map(|_| Arc::new(QuitAfter::new(3))).collect();
            let steady: Vec<_> = (0..2).map(|_| TestConsumer::new()).collect();
            for quitter in &quitters {
                queue.subscribe(quitter.clone());
            }
            for worker in &steady {
                queue.subscribe(worker.clone());
            }

            for i in 0..200 {
                queue.next(i);
            }
            queue.complete();
            for worker in &steady {
                worker.await_terminal(WAIT).await.unwrap();
                assert_eq!(worker.completions(), 1, "round {round}");
            }

            let mut seen: Vec<u32> = steady.iter().flat_map(|w| w.values()).collect();
            for quitter in &quitters {
                seen.extend(quitter.values.lock().iter().copied());
            }
            seen.sort_unstable();
            assert_eq!(seen, (0..200).collect::<Vec<_>>(), "round {round}");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_every_worker_gets_terminal_when_completion_races_claims() {
        for round in 0..50u32 {
            let queue = queue(RingProcessorConfig::default());
            let workers: Vec<_> = (0..4).map(|_| TestConsumer::new()).collect();
            for worker in &workers {
                queue.subscribe(worker.clone());
            }
            queue.next(round);
            queue.complete();

            let mut seen = 0;
            for worker in &workers {
                worker.await_terminal(WAIT).await.unwrap();
                assert_eq!(worker.completions(), 1, "round {round}");
                seen += worker.value_count();
            }
            assert_eq!(seen, 1, "round {round}");
        }
    }

    /// Cancels its own subscription from inside `on_next` after `limit` values.
    struct QuitAfter {
        limit: usize,
        values: parking_lot::Mutex<Vec<u32>>,
        subscription: OnceLock<Arc<dyn Subscription>>,
    }

    impl QuitAfter {
        fn new(limit: usize) -> Self {
            Self {
                limit,
                values: parking_lot::Mutex::new(Vec::new()),
                subscription: OnceLock::new(),
            }
        }
    }

    impl Consumer<u32> for QuitAfter {
        fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
            subscription.request(demand::UNBOUNDED);
            let _ = self.subscription.set(subscription);
        }

        fn on_next(&self, value: u32) {
            let mut values = self.values.lock();
            values.push(value);
            if values.len() == self.limit {
                if let Some(subscription) = self.subscription.get() {
                    subscription.cancel();
                }
            }
        }

        fn on_error(&self, _error: Error) {}

        fn on_complete(&self) {}
    }

    #[tokio::test]
    async fn test_distribution_uses_every_worker() {
        let queue = queue(RingProcessorConfig::default().share(true));
        let a = TestConsumer::with_request(1);
        let b = TestConsumer::with_request(1);
        queue.subscribe(a.clone());
        queue.subscribe(b.clone());
        queue.next(10);
        queue.next(20);
        a.await_values(1, WAIT).await.unwrap();
        b.await_values(1, WAIT).await.unwrap();

        let seen: BTreeSet<_> = a.values().into_iter().chain(b.values()).collect();
        assert_eq!(seen, BTreeSet::from([10, 20]));
        queue.force_shutdown();
    }
}
