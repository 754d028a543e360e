//! Bounded-concurrency worker pool.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};

/// Run `handler` over every item with at most `workers` handlers in flight.
///
/// A fixed number of tasks drains a shared queue, one item at a time per
/// task, until the queue is empty. This bounds simultaneous network
/// connections without building a future per item up front.
pub async fn run_bounded<T, F, Fut>(workers: usize, items: Vec<T>, handler: F)
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    if items.is_empty() {
        return;
    }
    let workers = workers.clamp(1, items.len());
    let queue = Arc::new(Mutex::new(VecDeque::from(items)));

    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let queue = queue.clone();
        let handler = handler.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let item = queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
                let Some(item) = item else { break };
                handler(item).await;
            }
        }));
    }
    for handle in handles {
        if let Err(e) = handle.await {
            log::error!("pool worker panicked: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_worker_count() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        let items: Vec<usize> = (0..100).collect();
        let (in_f, max_s, d) = (in_flight.clone(), max_seen.clone(), done.clone());

        run_bounded(20, items, move |_item| {
            let (in_f, max_s, d) = (in_f.clone(), max_s.clone(), d.clone());
            async move {
                let now = in_f.fetch_add(1, Ordering::SeqCst) + 1;
                max_s.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_f.fetch_sub(1, Ordering::SeqCst);
                d.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await;

        assert_eq!(done.load(Ordering::SeqCst), 100);
        assert!(max_seen.load(Ordering::SeqCst) <= 20);
        assert!(max_seen.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn test_each_item_processed_exactly_once() {
        let seen = Arc::new(Mutex::new(HashSet::new()));
        let items: Vec<usize> = (0..50).collect();

        let s = seen.clone();
        run_bounded(8, items, move |item| {
            let s = s.clone();
            async move {
                let fresh = s.lock().unwrap_or_else(|e| e.into_inner()).insert(item);
                assert!(fresh, "item {item} processed twice");
            }
        })
        .await;

        assert_eq!(seen.lock().unwrap().len(), 50);
    }

    #[tokio::test]
    async fn test_more_workers_than_items() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        run_bounded(20, vec![1, 2, 3], move |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_empty_queue_is_noop() {
        run_bounded(4, Vec::<u8>::new(), |_| async {}).await;
    }
}
