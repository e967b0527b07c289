//! Bounded fan-out of independent work items.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::error;

/// Results of one pool run
#[derive(Debug)]
pub struct PoolReport<T> {
    /// `(input index, output)` in completion order
    pub completed: Vec<(usize, T)>,
    /// Workers that panicked or were cancelled
    pub worker_failures: usize,
}

impl<T> PoolReport<T> {
    /// Outputs reordered by input index
    pub fn into_ordered(mut self) -> Vec<(usize, T)> {
        self.completed.sort_by_key(|(index, _)| *index);
        self.completed
    }
}

/// Runs at most `concurrency` items at once
#[derive(Debug, Clone, Copy)]
pub struct TaskPool {
    concurrency: usize,
}

impl TaskPool {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run `work` over every item. A failing worker never cancels its siblings.
    pub async fn run_all<I, T, F, Fut>(&self, items: Vec<I>, work: F) -> PoolReport<T>
    where
        I: Send + 'static,
        T: Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let work = Arc::new(work);
        let mut set = JoinSet::new();

        for (index, item) in items.into_iter().enumerate() {
            let permits = Arc::clone(&permits);
            let work = Arc::clone(&work);
            set.spawn(async move {
                // The semaphore is never closed, so acquiring only waits.
                let _permit = permits.acquire_owned().await.ok();
                (index, work(item).await)
            });
        }

        let mut report = PoolReport {
            completed: Vec::new(),
            worker_failures: 0,
        };
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(done) => report.completed.push(done),
                Err(err) => {
                    error!(error = %err, "worker task failed");
                    report.worker_failures += 1;
                }
            }
        }
        report
    }
}
