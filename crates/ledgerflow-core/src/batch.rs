//! Batcher: drive fixed-size groups of items through the worker pool.
//!
//! Items are split into contiguous groups of `batch_size`, each group is
//! handed to the batch function as one unit of pool work, and the group
//! outcomes are expanded back to one [`WorkResult`] per item with
//! `index = group_index * batch_size + offset`.

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::WorkError;
use crate::pool::{worker_pool, PoolOptions, WorkResult};

pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Process `items` in groups of `batch_size` (`0` means [`DEFAULT_BATCH_SIZE`]).
///
/// - A failed group gives each of its items the same error.
/// - A group whose value vector is shorter than the group gives the
///   uncovered items [`WorkError::MissingResult`]; surplus values are ignored.
/// - A cancelled group marks each of its items cancelled.
pub async fn batch<T, R, E, F, Fut>(
    cancel: &CancellationToken,
    items: Vec<T>,
    batch_size: usize,
    work: F,
    options: PoolOptions,
) -> Vec<WorkResult<T, R, E>>
where
    T: Clone + Send + 'static,
    R: Send + 'static,
    E: Clone + Send + 'static,
    F: Fn(CancellationToken, Vec<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<R>, E>> + Send + 'static,
{
    let batch_size = if batch_size == 0 {
        DEFAULT_BATCH_SIZE
    } else {
        batch_size
    };
    let total = items.len();
    let groups = split_into_groups(items, batch_size);
    tracing::debug!(items = total, groups = groups.len(), batch_size, "batching items");

    let group_results = worker_pool(cancel, groups, work, options).await;

    let mut results = Vec::with_capacity(total);
    for group in group_results {
        let base = group.index * batch_size;
        match group.outcome {
            Ok(values) => {
                let produced = values.len();
                if produced > group.item.len() {
                    tracing::warn!(
                        group = group.index,
                        expected = group.item.len(),
                        produced,
                        "batch function returned surplus values"
                    );
                }
                let mut values = values.into_iter();
                for (offset, item) in group.item.into_iter().enumerate() {
                    let outcome = values.next().ok_or(WorkError::MissingResult);
                    results.push(WorkResult {
                        item,
                        outcome,
                        index: base + offset,
                    });
                }
            }
            Err(err) => {
                for (offset, item) in group.item.into_iter().enumerate() {
                    results.push(WorkResult {
                        item,
                        outcome: Err(err.clone()),
                        index: base + offset,
                    });
                }
            }
        }
    }
    results
}

fn split_into_groups<T>(items: Vec<T>, batch_size: usize) -> Vec<Vec<T>> {
    let mut groups = Vec::with_capacity(items.len().div_ceil(batch_size));
    let mut items = items.into_iter().peekable();
    while items.peek().is_some() {
        groups.push(items.by_ref().take(batch_size).collect());
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn double_all(_: CancellationToken, group: Vec<u32>) -> Result<Vec<u32>, String> {
        Ok(group.into_iter().map(|n| n * 2).collect())
    }

    #[test]
    fn groups_are_contiguous() {
        let groups = split_into_groups((0..7).collect::<Vec<u32>>(), 3);
        assert_eq!(groups, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]);
        assert!(split_into_groups(Vec::<u32>::new(), 3).is_empty());
    }

    #[tokio::test]
    async fn every_item_gets_a_result() {
        let items: Vec<u32> = (0..23).collect();
        let results = batch(
            &CancellationToken::new(),
            items.clone(),
            5,
            double_all,
            PoolOptions::default(),
        )
        .await;

        assert_eq!(results.len(), 23);
        for (i, r) in results.iter().enumerate() {
            assert_eq!(r.index, i);
            assert_eq!(r.item, items[i]);
            assert_eq!(r.value(), Some(&(items[i] * 2)));
        }
    }

    #[tokio::test]
    async fn zero_batch_size_uses_default() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let results = batch(
            &CancellationToken::new(),
            (0..25).collect::<Vec<u32>>(),
            0,
            move |cancel, group| {
                c.fetch_add(1, Ordering::SeqCst);
                double_all(cancel, group)
            },
            PoolOptions::default(),
        )
        .await;

        assert_eq!(results.len(), 25);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn group_error_spreads_to_items() {
        let results = batch(
            &CancellationToken::new(),
            (0..6).collect::<Vec<u32>>(),
            3,
            |_, group: Vec<u32>| async move {
                if group.contains(&4) {
                    Err("group rejected".to_string())
                } else {
                    Ok(group)
                }
            },
            PoolOptions::default(),
        )
        .await;

        assert_eq!(results.len(), 6);
        assert!(results[..3].iter().all(WorkResult::is_ok));
        for r in &results[3..] {
            assert_eq!(
                r.error(),
                Some(&WorkError::Failed("group rejected".to_string()))
            );
        }
        assert_eq!(results[5].index, 5);
    }

    #[tokio::test]
    async fn short_value_vector_marks_missing() {
        let results = batch(
            &CancellationToken::new(),
            (0..4).collect::<Vec<u32>>(),
            4,
            |_, group: Vec<u32>| async move { Ok::<_, String>(group[..2].to_vec()) },
            PoolOptions::default(),
        )
        .await;

        assert_eq!(results.len(), 4);
        assert!(results[0].is_ok() && results[1].is_ok());
        assert_eq!(results[2].error(), Some(&WorkError::MissingResult));
        assert_eq!(results[3].error(), Some(&WorkError::MissingResult));
    }

    #[tokio::test]
    async fn unordered_groups_keep_item_indices() {
        let results = batch(
            &CancellationToken::new(),
            (0..12).collect::<Vec<u32>>(),
            4,
            double_all,
            PoolOptions::default().with_ordered(false),
        )
        .await;

        assert_eq!(results.len(), 12);
        for r in &results {
            assert_eq!(r.item as usize, r.index);
        }
    }

    #[tokio::test]
    async fn cancelled_batch_marks_items() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let results = batch(&cancel, vec![1u32, 2, 3], 2, double_all, PoolOptions::default()).await;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.error() == Some(&WorkError::Cancelled)));
    }
}
