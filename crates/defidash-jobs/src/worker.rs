use std::time::Duration;

use chrono::{DateTime, Utc};
use defidash_core::config::{DEFAULT_BATCH_SIZE, DEFAULT_IDLE_POLL_MS};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::{error::Result, queue::Queue, runner::JobRunner};

/// Drains the queue: claims a batch of due jobs and runs them one by one.
///
/// A full batch is followed immediately by the next claim; only an empty
/// claim makes the loop sleep for `idle_poll`.
pub struct Worker {
    queue: Queue,
    runner: JobRunner,
    batch_size: usize,
    idle_poll: Duration,
}

impl Worker {
    pub fn new(queue: Queue, runner: JobRunner) -> Self {
        Self {
            queue,
            runner,
            batch_size: DEFAULT_BATCH_SIZE,
            idle_poll: Duration::from_millis(DEFAULT_IDLE_POLL_MS),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_idle_poll(mut self, idle_poll: Duration) -> Self {
        self.idle_poll = idle_poll;
        self
    }

    /// Claim up to one batch of jobs due at `now` and run each to completion.
    ///
    /// Returns how many jobs were claimed. Job failures are logged by the
    /// runner and do not affect the rest of the batch; only a storage error
    /// is returned.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let batch = self.queue.claim(now, self.batch_size)?;
        let claimed = batch.len();
        for job in batch {
            self.runner.run_job(&job.name, job.args).await;
        }
        Ok(claimed)
    }

    /// Poll until `shutdown` is `true`. A batch in progress always finishes.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            batch_size = self.batch_size,
            idle_poll_ms = self.idle_poll.as_millis() as u64,
            "worker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            if self.run_once(Utc::now()).await? > 0 {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.idle_poll) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        warn!("shutdown channel closed; stopping worker");
                        break;
                    }
                }
            }
        }

        info!("worker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::JobError,
        registry::RegistryBuilder,
        runner::JobContext,
        types::{JobArgs, Priority},
    };
    use defidash_cache::Cache;
    use rusqlite::Connection;
    use std::sync::{Arc, Mutex};

    fn worker(order: Arc<Mutex<Vec<String>>>) -> (Worker, Queue) {
        let mut builder = RegistryBuilder::new();
        builder
            .register_job("record", move |_ctx: JobContext, args: JobArgs| {
                let order = Arc::clone(&order);
                async move {
                    let tag = args.get_str("tag").unwrap_or_default();
                    order.lock().unwrap().push(tag);
                    Ok::<(), JobError>(())
                }
            })
            .unwrap()
            .register_job("fail", |_ctx: JobContext, _args: JobArgs| async {
                Err::<(), _>(JobError::failed("downstream rejected the update"))
            })
            .unwrap();
        let registry = Arc::new(builder.build().unwrap());
        let queue = Queue::new(Connection::open_in_memory().unwrap()).unwrap();
        let cache = Cache::new(Connection::open_in_memory().unwrap()).unwrap();
        let runner = JobRunner::new(registry, queue.clone(), cache);
        (Worker::new(queue.clone(), runner), queue)
    }

    #[tokio::test]
    async fn batch_runs_in_claim_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let (worker, queue) = worker(Arc::clone(&order));
        let now = Utc::now();
        for (tag, priority) in [("c", Priority::Low), ("a", Priority::High), ("b", Priority::Medium)] {
            queue
                .enqueue_at("record", JobArgs::new().with("tag", tag), priority, now)
                .unwrap();
        }

        assert_eq!(worker.run_once(now).await.unwrap(), 3);
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(worker.run_once(now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failures_and_unknown_names_do_not_stop_the_batch() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let (worker, queue) = worker(Arc::clone(&order));
        let now = Utc::now();
        queue.enqueue_at("fail", JobArgs::new(), Priority::High, now).unwrap();
        queue.enqueue_at("nobody-handles-this", JobArgs::new(), Priority::High, now).unwrap();
        queue
            .enqueue_at("record", JobArgs::new().with("tag", "after"), Priority::Low, now)
            .unwrap();

        assert_eq!(worker.run_once(now).await.unwrap(), 3);
        assert_eq!(*order.lock().unwrap(), vec!["after"]);
        // Failed jobs are gone, not retried.
        assert!(queue.is_empty().unwrap());
    }

    #[tokio::test]
    async fn batch_size_caps_a_single_pass() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let (worker, queue) = worker(Arc::clone(&order));
        let worker = worker.with_batch_size(2);
        let now = Utc::now();
        for tag in ["1", "2", "3"] {
            queue.enqueue_at("record", JobArgs::new().with("tag", tag), Priority::Low, now).unwrap();
        }

        assert_eq!(worker.run_once(now).await.unwrap(), 2);
        assert_eq!(queue.len().unwrap(), 1);
    }

    #[test]
    fn defaults_match_the_jobs_config() {
        let (worker, _) = worker(Arc::new(Mutex::new(Vec::new())));
        let jobs = defidash_core::config::JobsConfig::default();
        assert_eq!(worker.batch_size, jobs.batch_size);
        assert_eq!(worker.idle_poll, Duration::from_millis(jobs.idle_poll_ms));
    }
}
