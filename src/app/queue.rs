use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Semaphore;

/// Semaphore-bounded background spawner for download workers. Work beyond
/// the permit count queues inside tokio until a permit frees up.
#[derive(Debug, Clone)]
pub struct WorkerQueue {
    permits: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
}

impl WorkerQueue {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let active = Arc::clone(&self.active);
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            active.fetch_add(1, Ordering::Relaxed);
            fut.await;
            active.fetch_sub(1, Ordering::Relaxed);
        });
    }

    /// Workers currently holding a permit.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn bounded_concurrency() {
        let queue = WorkerQueue::new(2);
        let peak = Arc::new(AtomicUsize::new(0));
        let running = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..6 {
            let peak = Arc::clone(&peak);
            let running = Arc::clone(&running);
            let done = Arc::clone(&done);
            queue.spawn(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        for _ in 0..100 {
            if done.load(Ordering::SeqCst) == 6 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(done.load(Ordering::SeqCst), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
