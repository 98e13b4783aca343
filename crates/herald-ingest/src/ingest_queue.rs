use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::FutureExt;
use herald_core::current_unix_timestamp_ms;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{oneshot, Notify};

pub const DEFAULT_MAX_WORKERS: usize = 4;

/// Settlement error for a queued item.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Processor(anyhow::Error),
    #[error("queue item {item_id} was dropped before it settled")]
    Abandoned { item_id: u64 },
}

/// Business logic invoked once per queued item.
#[async_trait]
pub trait ItemProcessor<P, O>: Send + Sync
where
    P: Send + Sync,
{
    async fn process(&self, item: &P) -> Result<O>;
}

/// Read-only view of a queued item handed to the error handler.
#[derive(Debug)]
pub struct QueueItemView<'a, P> {
    pub id: u64,
    pub enqueued_unix_ms: u64,
    pub payload: &'a P,
}

pub type QueueErrorHandler<P> = Arc<dyn Fn(&QueueItemView<'_, P>, &anyhow::Error) + Send + Sync>;

struct QueueItem<P, O> {
    id: u64,
    payload: P,
    processor: Arc<dyn ItemProcessor<P, O>>,
    settle: oneshot::Sender<Result<O, QueueError>>,
    enqueued_unix_ms: u64,
}

#[derive(Default)]
struct QueueCounters {
    active_workers: usize,
    peak_active_workers: usize,
    total_enqueued: u64,
    total_processed: u64,
    total_succeeded: u64,
    total_errors: u64,
}

struct QueueState<P, O> {
    pending: VecDeque<QueueItem<P, O>>,
    counters: QueueCounters,
}

struct QueueShared<P, O> {
    max_workers: usize,
    state: Mutex<QueueState<P, O>>,
    error_handler: RwLock<Option<QueueErrorHandler<P>>>,
    idle: Notify,
    next_item_id: AtomicU64,
    started_at: Instant,
}

impl<P, O> QueueShared<P, O> {
    fn lock(&self) -> MutexGuard<'_, QueueState<P, O>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Throughput and error counters at one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub active_workers: usize,
    pub max_workers: usize,
    pub peak_active_workers: usize,
    pub total_enqueued: u64,
    pub total_processed: u64,
    pub total_succeeded: u64,
    pub total_errors: u64,
    pub uptime_ms: u64,
    pub throughput_per_sec: f64,
    pub error_rate: f64,
}

/// Resolves with the processor's result once the item settles.
#[must_use = "dropping a ticket discards the result but does not cancel the item"]
pub struct QueueTicket<O> {
    item_id: u64,
    rx: oneshot::Receiver<Result<O, QueueError>>,
}

impl<O> QueueTicket<O> {
    pub fn item_id(&self) -> u64 {
        self.item_id
    }
}

impl<O> Future for QueueTicket<O> {
    type Output = Result<O, QueueError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let item_id = self.item_id;
        Pin::new(&mut self.rx).poll(cx).map(|settled| {
            settled.unwrap_or(Err(QueueError::Abandoned { item_id }))
        })
    }
}

/// FIFO queue feeding a bounded set of in-flight processor invocations.
///
/// Scheduling runs on enqueue and on every worker completion; there is no
/// polling loop. Start order equals enqueue order. Completion order is only
/// guaranteed with `max_workers == 1`. A processor that never settles holds
/// its worker slot indefinitely.
pub struct MessageQueue<P, O> {
    shared: Arc<QueueShared<P, O>>,
}

impl<P, O> Clone for MessageQueue<P, O> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P, O> MessageQueue<P, O>
where
    P: Send + Sync + 'static,
    O: Send + 'static,
{
    pub fn new(max_workers: usize) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                max_workers: max_workers.max(1),
                state: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    counters: QueueCounters::default(),
                }),
                error_handler: RwLock::new(None),
                idle: Notify::new(),
                next_item_id: AtomicU64::new(1),
                started_at: Instant::now(),
            }),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.shared.max_workers
    }

    /// Registers the handler invoked with `(item, error)` for every failed item.
    pub fn set_error_handler(&self, handler: QueueErrorHandler<P>) {
        let mut slot = self
            .shared
            .error_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = Some(handler);
    }

    /// Appends an item and schedules it. Must be called inside a Tokio runtime.
    pub fn enqueue(&self, payload: P, processor: Arc<dyn ItemProcessor<P, O>>) -> QueueTicket<O> {
        let item_id = self.shared.next_item_id.fetch_add(1, Ordering::Relaxed);
        let (settle, rx) = oneshot::channel();
        {
            let mut state = self.shared.lock();
            state.pending.push_back(QueueItem {
                id: item_id,
                payload,
                processor,
                settle,
                enqueued_unix_ms: current_unix_timestamp_ms(),
            });
            state.counters.total_enqueued = state.counters.total_enqueued.saturating_add(1);
        }
        schedule(&self.shared);
        QueueTicket { item_id, rx }
    }

    pub fn len(&self) -> usize {
        self.shared.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_idle(&self) -> bool {
        let state = self.shared.lock();
        state.pending.is_empty() && state.counters.active_workers == 0
    }

    pub fn stats(&self) -> QueueStats {
        let uptime = self.shared.started_at.elapsed();
        let state = self.shared.lock();
        let counters = &state.counters;
        let uptime_secs = uptime.as_secs_f64();
        QueueStats {
            pending: state.pending.len(),
            active_workers: counters.active_workers,
            max_workers: self.shared.max_workers,
            peak_active_workers: counters.peak_active_workers,
            total_enqueued: counters.total_enqueued,
            total_processed: counters.total_processed,
            total_succeeded: counters.total_succeeded,
            total_errors: counters.total_errors,
            uptime_ms: u64::try_from(uptime.as_millis()).unwrap_or(u64::MAX),
            throughput_per_sec: if uptime_secs > 0.0 {
                counters.total_processed as f64 / uptime_secs
            } else {
                0.0
            },
            error_rate: if counters.total_processed > 0 {
                counters.total_errors as f64 / counters.total_processed as f64
            } else {
                0.0
            },
        }
    }

    /// Waits until nothing is pending or in flight, up to `timeout`.
    ///
    /// Returns `false` when the grace window elapsed first.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let wait_idle = async {
            loop {
                let notified = self.shared.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.is_idle() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait_idle).await.is_ok()
    }
}

fn schedule<P, O>(shared: &Arc<QueueShared<P, O>>)
where
    P: Send + Sync + 'static,
    O: Send + 'static,
{
    loop {
        let item = {
            let mut state = shared.lock();
            if state.counters.active_workers >= shared.max_workers {
                return;
            }
            let Some(item) = state.pending.pop_front() else {
                if state.counters.active_workers == 0 {
                    shared.idle.notify_waiters();
                }
                return;
            };
            state.counters.active_workers += 1;
            state.counters.peak_active_workers = state
                .counters
                .peak_active_workers
                .max(state.counters.active_workers);
            item
        };
        tokio::spawn(run_item(Arc::clone(shared), item));
    }
}

async fn run_item<P, O>(shared: Arc<QueueShared<P, O>>, item: QueueItem<P, O>)
where
    P: Send + Sync + 'static,
    O: Send + 'static,
{
    let QueueItem {
        id,
        payload,
        processor,
        settle,
        enqueued_unix_ms,
    } = item;

    let outcome = AssertUnwindSafe(processor.process(&payload))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(anyhow!("processor panicked while handling item {id}")));

    let settled = match outcome {
        Ok(output) => {
            let mut state = shared.lock();
            let counters = &mut state.counters;
            counters.total_processed = counters.total_processed.saturating_add(1);
            counters.total_succeeded = counters.total_succeeded.saturating_add(1);
            counters.active_workers = counters.active_workers.saturating_sub(1);
            Ok(output)
        }
        Err(error) => {
            let handler = shared
                .error_handler
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            match handler {
                Some(handler) => {
                    let view = QueueItemView {
                        id,
                        enqueued_unix_ms,
                        payload: &payload,
                    };
                    let handled =
                        std::panic::catch_unwind(AssertUnwindSafe(|| handler(&view, &error)));
                    if handled.is_err() {
                        tracing::error!(item_id = id, "queue error handler panicked");
                    }
                }
                None => tracing::warn!(item_id = id, error = %error, "queue item failed"),
            }
            let mut state = shared.lock();
            let counters = &mut state.counters;
            counters.total_processed = counters.total_processed.saturating_add(1);
            counters.total_errors = counters.total_errors.saturating_add(1);
            counters.active_workers = counters.active_workers.saturating_sub(1);
            Err(QueueError::Processor(error))
        }
    };

    let _ = settle.send(settled);
    schedule(&shared);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use anyhow::{bail, Result};
    use async_trait::async_trait;

    use super::{ItemProcessor, MessageQueue, QueueError, QueueItemView, DEFAULT_MAX_WORKERS};

    #[derive(Default)]
    struct Recorder {
        started: Mutex<Vec<u32>>,
        completed: Mutex<Vec<u32>>,
        in_flight: AtomicUsize,
        max_seen: AtomicUsize,
    }

    /// Sleeps `item * 10ms` unless a delay override is given, fails on `fail_on`.
    struct RecordingProcessor {
        recorder: Arc<Recorder>,
        delays_ms: Vec<(u32, u64)>,
        fail_on: Option<u32>,
    }

    #[async_trait]
    impl ItemProcessor<u32, u32> for RecordingProcessor {
        async fn process(&self, item: &u32) -> Result<u32> {
            self.recorder.started.lock().expect("lock").push(*item);
            let now = self.recorder.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.recorder.max_seen.fetch_max(now, Ordering::SeqCst);

            let delay = self
                .delays_ms
                .iter()
                .find(|(id, _)| id == item)
                .map(|(_, delay)| *delay)
                .unwrap_or(10);
            tokio::time::sleep(Duration::from_millis(delay)).await;

            self.recorder.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.recorder.completed.lock().expect("lock").push(*item);
            if self.fail_on == Some(*item) {
                bail!("item {item} exploded");
            }
            Ok(item * 10)
        }
    }

    fn processor(
        recorder: &Arc<Recorder>,
        delays_ms: Vec<(u32, u64)>,
        fail_on: Option<u32>,
    ) -> Arc<RecordingProcessor> {
        Arc::new(RecordingProcessor {
            recorder: recorder.clone(),
            delays_ms,
            fail_on,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn functional_failing_item_rejects_only_its_own_ticket() {
        let queue = MessageQueue::<u32, u32>::new(2);
        let handled = Arc::new(Mutex::new(Vec::new()));
        let handled_sink = handled.clone();
        queue.set_error_handler(Arc::new(
            move |item: &QueueItemView<'_, u32>, error: &anyhow::Error| {
                handled_sink
                    .lock()
                    .expect("lock")
                    .push((*item.payload, error.to_string()));
            },
        ));

        let recorder = Arc::new(Recorder::default());
        let processor = processor(&recorder, Vec::new(), Some(3));
        let tickets = (1..=5)
            .map(|item| queue.enqueue(item, processor.clone()))
            .collect::<Vec<_>>();

        let mut results = Vec::new();
        for ticket in tickets {
            results.push(ticket.await);
        }

        for (index, result) in results.iter().enumerate() {
            let item = index as u32 + 1;
            if item == 3 {
                let error = result.as_ref().expect_err("item 3 rejects");
                assert!(matches!(error, QueueError::Processor(_)));
                assert_eq!(error.to_string(), "item 3 exploded");
            } else {
                assert_eq!(*result.as_ref().expect("sibling resolves"), item * 10);
            }
        }
        assert_eq!(
            *handled.lock().expect("lock"),
            vec![(3, "item 3 exploded".to_string())]
        );

        let stats = queue.stats();
        assert_eq!(stats.total_processed, 5);
        assert_eq!(stats.total_succeeded, 4);
        assert_eq!(stats.total_errors, 1);
        assert!((stats.error_rate - 0.2).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn functional_active_workers_never_exceed_limit() {
        let queue = MessageQueue::<u32, u32>::new(3);
        let recorder = Arc::new(Recorder::default());
        let processor = processor(&recorder, vec![(1, 50), (4, 5), (7, 30)], None);
        let tickets = (1..=12)
            .map(|item| queue.enqueue(item, processor.clone()))
            .collect::<Vec<_>>();

        assert!(queue.stats().active_workers <= 3);
        for ticket in tickets {
            ticket.await.expect("item succeeds");
            let stats = queue.stats();
            assert!(stats.active_workers <= stats.max_workers);
            assert_eq!(
                stats.total_processed,
                stats.total_succeeded + stats.total_errors
            );
        }
        assert!(recorder.max_seen.load(Ordering::SeqCst) <= 3);
        assert_eq!(queue.stats().peak_active_workers, 3);
        assert!(queue.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn functional_single_worker_completes_in_enqueue_order() {
        let queue = MessageQueue::<u32, u32>::new(1);
        let recorder = Arc::new(Recorder::default());
        let processor = processor(&recorder, vec![(1, 100), (2, 1), (3, 50)], None);
        let tickets = (1..=4)
            .map(|item| queue.enqueue(item, processor.clone()))
            .collect::<Vec<_>>();
        for ticket in tickets {
            ticket.await.expect("item succeeds");
        }
        assert_eq!(*recorder.completed.lock().expect("lock"), vec![1, 2, 3, 4]);
        assert_eq!(*recorder.started.lock().expect("lock"), vec![1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn functional_parallel_workers_start_in_order_but_complete_out_of_order() {
        let queue = MessageQueue::<u32, u32>::new(2);
        let recorder = Arc::new(Recorder::default());
        let processor = processor(&recorder, vec![(1, 200), (2, 10), (3, 10)], None);
        let tickets = (1..=3)
            .map(|item| queue.enqueue(item, processor.clone()))
            .collect::<Vec<_>>();
        for ticket in tickets {
            ticket.await.expect("item succeeds");
        }
        assert_eq!(*recorder.started.lock().expect("lock"), vec![1, 2, 3]);
        assert_eq!(*recorder.completed.lock().expect("lock"), vec![2, 3, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn integration_drain_waits_for_in_flight_items() {
        let queue = MessageQueue::<u32, u32>::new(DEFAULT_MAX_WORKERS);
        let recorder = Arc::new(Recorder::default());
        let processor = processor(&recorder, vec![(1, 500)], None);
        let _ticket = queue.enqueue(1, processor.clone());

        assert!(!queue.drain(Duration::from_millis(100)).await);
        assert!(queue.drain(Duration::from_secs(1)).await);
        assert_eq!(queue.stats().total_succeeded, 1);
        assert!(queue.drain(Duration::from_millis(1)).await, "idle queue drains at once");
    }

    #[tokio::test(start_paused = true)]
    async fn regression_dropped_ticket_does_not_cancel_processing() {
        let queue = MessageQueue::<u32, u32>::new(1);
        let recorder = Arc::new(Recorder::default());
        let processor = processor(&recorder, Vec::new(), None);
        drop(queue.enqueue(1, processor.clone()));
        let second = queue.enqueue(2, processor);
        assert_eq!(second.await.expect("second item"), 20);
        assert_eq!(*recorder.completed.lock().expect("lock"), vec![1, 2]);
    }

    struct PanickingProcessor;

    #[async_trait]
    impl ItemProcessor<u32, u32> for PanickingProcessor {
        async fn process(&self, item: &u32) -> Result<u32> {
            if *item == 1 {
                panic!("boom");
            }
            Ok(*item)
        }
    }

    #[tokio::test]
    async fn regression_panicking_processor_releases_its_worker_slot() {
        let queue = MessageQueue::<u32, u32>::new(1);
        let processor = Arc::new(PanickingProcessor);
        let first = queue.enqueue(1, processor.clone());
        let second = queue.enqueue(2, processor);
        let error = first.await.expect_err("panic becomes an error");
        assert!(error.to_string().contains("panicked"));
        assert_eq!(second.await.expect("second item"), 2);
        assert_eq!(queue.stats().active_workers, 0);
    }
}
