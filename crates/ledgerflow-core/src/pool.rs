//! Bounded fan-out/fan-in worker pool.
//!
//! A dispatch task feeds `(index, item)` pairs into a bounded queue of
//! `buffer_size`; `workers` tasks share the receiving end, run the work
//! function and push one [`WorkResult`] per item onto the result channel.
//! Collection waits for every worker to finish, then orders the results by
//! input index (ordered mode) or keeps completion order.
//!
//! Every input item yields exactly one result. Items skipped because the
//! cancellation token fired carry [`WorkError::Cancelled`].
//!
//! Work function panics are not caught: the panic is resumed on the caller
//! once the workers have been joined.

use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::WorkError;
use crate::policy::RateLimiter;

pub const DEFAULT_WORKERS: usize = 5;
pub const DEFAULT_BUFFER_SIZE: usize = 10;

/// Options for a single pool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    /// Number of concurrent workers. `0` falls back to the default.
    pub workers: usize,
    /// Capacity of the dispatch queue. `0` falls back to the default.
    pub buffer_size: usize,
    /// Return results in input order (`true`) or completion order.
    pub ordered: bool,
    /// Operations per second shared by all workers. `0` disables limiting.
    pub rate_limit: u32,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            ordered: true,
            rate_limit: 0,
        }
    }
}

impl PoolOptions {
    pub fn with_workers(mut self, workers: usize) -> Self {
        if workers > 0 {
            self.workers = workers;
        }
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        if buffer_size > 0 {
            self.buffer_size = buffer_size;
        }
        self
    }

    pub fn with_ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    pub fn with_rate_limit(mut self, ops_per_second: u32) -> Self {
        self.rate_limit = ops_per_second;
        self
    }

    fn normalized(mut self) -> Self {
        if self.workers == 0 {
            self.workers = DEFAULT_WORKERS;
        }
        if self.buffer_size == 0 {
            self.buffer_size = DEFAULT_BUFFER_SIZE;
        }
        self
    }
}

/// Outcome of processing one item.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkResult<T, R, E> {
    /// The input item.
    pub item: T,
    /// Value produced by the work function, or why there is none.
    pub outcome: Result<R, WorkError<E>>,
    /// Position of `item` in the input sequence.
    pub index: usize,
}

impl<T, R, E> WorkResult<T, R, E> {
    pub(crate) fn cancelled(index: usize, item: T) -> Self {
        Self {
            item,
            outcome: Err(WorkError::Cancelled),
            index,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn value(&self) -> Option<&R> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&WorkError<E>> {
        self.outcome.as_ref().err()
    }
}

type Queue<T> = Arc<Mutex<mpsc::Receiver<(usize, T)>>>;
type ResultSender<T, R, E> = mpsc::UnboundedSender<WorkResult<T, R, E>>;

/// Run `work` over every item with bounded concurrency.
///
/// Returns one [`WorkResult`] per item. A failing item never fails the call.
pub async fn worker_pool<T, R, E, F, Fut>(
    cancel: &CancellationToken,
    items: Vec<T>,
    work: F,
    options: PoolOptions,
) -> Vec<WorkResult<T, R, E>>
where
    T: Clone + Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
    F: Fn(CancellationToken, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
{
    let options = options.normalized();
    let total = items.len();
    if total == 0 {
        return Vec::new();
    }

    let workers = options.workers.min(total);
    tracing::debug!(
        items = total,
        workers,
        buffer = options.buffer_size,
        ordered = options.ordered,
        rate_limit = options.rate_limit,
        "worker pool starting"
    );

    let work = Arc::new(work);
    let limiter = (options.rate_limit > 0)
        .then(|| Arc::new(RateLimiter::per_second(options.rate_limit, 1)));

    let (queue_tx, queue_rx) = mpsc::channel::<(usize, T)>(options.buffer_size);
    let queue_rx: Queue<T> = Arc::new(Mutex::new(queue_rx));
    let (result_tx, mut result_rx) = mpsc::unbounded_channel();

    let mut handles = Vec::with_capacity(workers + 1);
    for worker_id in 0..workers {
        handles.push(tokio::spawn(run_worker(
            worker_id,
            queue_rx.clone(),
            result_tx.clone(),
            work.clone(),
            limiter.clone(),
            cancel.clone(),
        )));
    }
    drop(queue_rx);
    handles.push(tokio::spawn(dispatch(
        items,
        queue_tx,
        result_tx,
        cancel.clone(),
    )));

    let mut collected = Vec::with_capacity(total);
    while let Some(result) = result_rx.recv().await {
        collected.push(result);
    }

    for joined in join_all(handles).await {
        if let Err(e) = joined {
            if e.is_panic() {
                std::panic::resume_unwind(e.into_panic());
            }
            tracing::warn!(error = %e, "worker task did not complete");
        }
    }

    if let Some(limiter) = limiter {
        limiter.stop().await;
    }

    let failed = collected.iter().filter(|r| !r.is_ok()).count();
    tracing::debug!(items = total, failed, "worker pool finished");

    if !options.ordered {
        return collected;
    }

    let mut slots: Vec<Option<WorkResult<T, R, E>>> = (0..total).map(|_| None).collect();
    for result in collected {
        if let Some(slot) = slots.get_mut(result.index) {
            *slot = Some(result);
        }
    }
    slots.into_iter().flatten().collect()
}

/// Run `f` over every item for its side effect.
///
/// Every item is processed; returns the first error in the collected
/// results (lowest index in ordered mode, not necessarily the earliest
/// failure in time).
pub async fn for_each<T, E, F, Fut>(
    cancel: &CancellationToken,
    items: Vec<T>,
    f: F,
    options: PoolOptions,
) -> Result<(), WorkError<E>>
where
    T: Clone + Send + 'static,
    E: Send + 'static,
    F: Fn(CancellationToken, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
{
    let first_error = worker_pool(cancel, items, f, options)
        .await
        .into_iter()
        .find_map(|r| r.outcome.err());

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn dispatch<T, R, E>(
    items: Vec<T>,
    queue: mpsc::Sender<(usize, T)>,
    results: ResultSender<T, R, E>,
    cancel: CancellationToken,
) {
    let mut pending = items.into_iter().enumerate();
    while let Some((index, item)) = pending.next() {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = queue.reserve() => permit.ok(),
        };

        match permit {
            Some(permit) => permit.send((index, item)),
            None => {
                // Cancelled, or every worker is gone.
                let mut skipped = 1usize;
                let _ = results.send(WorkResult::cancelled(index, item));
                for (index, item) in pending.by_ref() {
                    skipped += 1;
                    let _ = results.send(WorkResult::cancelled(index, item));
                }
                tracing::debug!(skipped, "dispatch stopped early");
                break;
            }
        }
    }
}

async fn run_worker<T, R, E, F, Fut>(
    worker_id: usize,
    queue: Queue<T>,
    results: ResultSender<T, R, E>,
    work: Arc<F>,
    limiter: Option<Arc<RateLimiter>>,
    cancel: CancellationToken,
) where
    T: Clone,
    F: Fn(CancellationToken, T) -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let mut processed = 0usize;
    loop {
        let next = {
            let mut rx = queue.lock().await;
            rx.recv().await
        };
        let Some((index, item)) = next else { break };

        if cancel.is_cancelled() {
            let _ = results.send(WorkResult::cancelled(index, item));
            continue;
        }
        if let Some(limiter) = &limiter {
            if limiter.wait(&cancel).await.is_err() {
                let _ = results.send(WorkResult::cancelled(index, item));
                continue;
            }
        }

        let outcome = work(cancel.clone(), item.clone())
            .await
            .map_err(WorkError::Failed);
        processed += 1;
        if results.send(WorkResult { item, outcome, index }).is_err() {
            break;
        }
    }
    tracing::trace!(worker_id, processed, "worker finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    async fn square(_: CancellationToken, n: u64) -> Result<u64, String> {
        // Later items finish first to shuffle completion order.
        tokio::time::sleep(Duration::from_millis(20u64.saturating_sub(n))).await;
        Ok(n * n)
    }

    #[tokio::test]
    async fn ordered_results_follow_input() {
        let items: Vec<u64> = (0..20).collect();
        let results = worker_pool(
            &CancellationToken::new(),
            items.clone(),
            square,
            PoolOptions::default(),
        )
        .await;

        assert_eq!(results.len(), items.len());
        for (i, r) in results.iter().enumerate() {
            assert_eq!(r.index, i);
            assert_eq!(r.item, items[i]);
            assert_eq!(r.value(), Some(&(items[i] * items[i])));
        }
    }

    #[tokio::test]
    async fn unordered_has_same_pairs() {
        let items: Vec<u64> = (0..20).collect();
        let cancel = CancellationToken::new();
        let ordered = worker_pool(&cancel, items.clone(), square, PoolOptions::default()).await;
        let unordered = worker_pool(
            &cancel,
            items,
            square,
            PoolOptions::default().with_ordered(false).with_workers(4),
        )
        .await;

        let pairs = |rs: &[WorkResult<u64, u64, String>]| -> HashSet<(u64, u64)> {
            rs.iter().map(|r| (r.item, *r.value().unwrap())).collect()
        };
        assert_eq!(unordered.len(), ordered.len());
        assert_eq!(pairs(&ordered), pairs(&unordered));
    }

    #[tokio::test]
    async fn empty_input_returns_nothing() {
        let results = worker_pool(
            &CancellationToken::new(),
            Vec::<u64>::new(),
            square,
            PoolOptions::default(),
        )
        .await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn errors_stay_per_item() {
        let results = worker_pool(
            &CancellationToken::new(),
            vec![1, 2, 3, 4],
            |_, n: u32| async move {
                if n % 2 == 0 {
                    Err(format!("even {n}"))
                } else {
                    Ok(n)
                }
            },
            PoolOptions::default(),
        )
        .await;

        assert_eq!(results.len(), 4);
        assert!(results[0].is_ok());
        assert_eq!(
            results[1].error(),
            Some(&WorkError::Failed("even 2".to_string()))
        );
        assert!(results[2].is_ok());
        assert!(!results[3].is_ok());
    }

    #[tokio::test]
    async fn concurrency_bounded_by_workers() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (active.clone(), peak.clone());

        let results = worker_pool(
            &CancellationToken::new(),
            (0..30).collect::<Vec<u32>>(),
            move |_, n| {
                let (a, p) = (a.clone(), p.clone());
                async move {
                    let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                    p.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    a.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, String>(n)
                }
            },
            PoolOptions::default().with_workers(3).with_buffer_size(2),
        )
        .await;

        assert_eq!(results.len(), 30);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn cancelled_before_start_marks_every_item() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();

        let results = worker_pool(
            &cancel,
            (0..8).collect::<Vec<u32>>(),
            move |_, n| {
                c.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, String>(n) }
            },
            PoolOptions::default(),
        )
        .await;

        assert_eq!(results.len(), 8);
        assert!(results.iter().all(|r| r.error().is_some_and(WorkError::is_cancelled)));
        assert!(results.iter().enumerate().all(|(i, r)| r.index == i));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_mid_run_keeps_length() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let results = worker_pool(
            &cancel,
            (0..50).collect::<Vec<u32>>(),
            move |_, n| {
                let trigger = trigger.clone();
                async move {
                    if n == 3 {
                        trigger.cancel();
                    }
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    Ok::<_, String>(n)
                }
            },
            PoolOptions::default().with_workers(2).with_buffer_size(1),
        )
        .await;

        assert_eq!(results.len(), 50);
        let skipped = results.iter().filter(|r| !r.is_ok()).count();
        assert!(skipped > 0, "cancellation should skip remaining items");
        assert!(results.iter().enumerate().all(|(i, r)| r.index == i));
    }

    #[tokio::test]
    async fn rate_limit_is_shared_across_workers() {
        let start = Instant::now();
        let results = worker_pool(
            &CancellationToken::new(),
            (0..10).collect::<Vec<u32>>(),
            |_, n| async move { Ok::<_, String>(n) },
            PoolOptions::default().with_workers(5).with_rate_limit(20),
        )
        .await;
        let elapsed = start.elapsed();

        assert_eq!(results.len(), 10);
        // One stored token, then one every 50ms regardless of worker count.
        assert!(
            elapsed >= Duration::from_millis(400),
            "pool ignored shared rate limit: {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn for_each_returns_first_error_after_all_calls() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();

        let res = for_each(
            &CancellationToken::new(),
            (0..10).collect::<Vec<u32>>(),
            move |_, n| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    if n == 4 || n == 7 {
                        Err(format!("item {n}"))
                    } else {
                        Ok(())
                    }
                }
            },
            PoolOptions::default(),
        )
        .await;

        assert_eq!(res, Err(WorkError::Failed("item 4".to_string())));
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn for_each_ok_when_all_succeed() {
        let res = for_each(
            &CancellationToken::new(),
            vec!["a", "b"],
            |_, _| async { Ok::<_, String>(()) },
            PoolOptions::default(),
        )
        .await;
        assert!(res.is_ok());
    }

    #[tokio::test]
    #[should_panic(expected = "work exploded")]
    async fn work_panics_propagate() {
        let _ = worker_pool(
            &CancellationToken::new(),
            vec![1u32],
            |_, _| async move {
                if true {
                    panic!("work exploded");
                }
                Ok::<u32, String>(0)
            },
            PoolOptions::default(),
        )
        .await;
    }

    #[test]
    fn options_ignore_zero_overrides() {
        let opts = PoolOptions::default().with_workers(0).with_buffer_size(0);
        assert_eq!(opts, PoolOptions::default());
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let opts: PoolOptions = serde_json::from_str(r#"{"workers": 12, "ordered": false}"#).unwrap();
        assert_eq!(opts.workers, 12);
        assert_eq!(opts.buffer_size, DEFAULT_BUFFER_SIZE);
        assert!(!opts.ordered);
        assert_eq!(opts.rate_limit, 0);
    }
}
