use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Once};
use std::time::Instant;

use defidash_cache::Cache;
use futures_util::FutureExt;
use tracing::{error, info, warn};

use crate::{queue::Queue, registry::Registry, types::JobArgs};

/// Services available to a running job.
#[derive(Clone)]
pub struct JobContext {
    job: String,
    queue: Queue,
    cache: Cache,
    registry: Arc<Registry>,
}

impl JobContext {
    /// Name the job was invoked under.
    pub fn job_name(&self) -> &str {
        &self.job
    }

    /// Queue handle, e.g. for a handler that re-enqueues itself to retry.
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// How a single `run_job` call ended. Informational only: every variant has
/// already been logged by the time it is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// The handler returned an error.
    Failed,
    /// The handler panicked.
    Panicked,
    /// No handler is registered under the name.
    Unknown,
}

impl JobOutcome {
    pub fn is_success(self) -> bool {
        self == JobOutcome::Completed
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobOutcome::Completed => "completed",
            JobOutcome::Failed => "failed",
            JobOutcome::Panicked => "panicked",
            JobOutcome::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Dispatches job names to registered handlers inside a recovery boundary.
///
/// Used by the worker for claimed jobs and directly by the CLI and the admin
/// endpoint, which bypass the queue.
#[derive(Clone)]
pub struct JobRunner {
    registry: Arc<Registry>,
    queue: Queue,
    cache: Cache,
}

impl JobRunner {
    pub fn new(registry: Arc<Registry>, queue: Queue, cache: Cache) -> Self {
        Self {
            registry,
            queue,
            cache,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn context(&self, job: &str) -> JobContext {
        JobContext {
            job: job.to_string(),
            queue: self.queue.clone(),
            cache: self.cache.clone(),
            registry: Arc::clone(&self.registry),
        }
    }

    /// Run the handler registered as `name` to completion.
    ///
    /// Never fails: an unknown name, a returned error, and a panic are all
    /// logged with the job's arguments and reported through [`JobOutcome`].
    /// Nothing is retried.
    ///
    /// A panic is logged with its source location only if
    /// [`install_panic_capture`] was called at startup; otherwise the location
    /// is `unknown` and the backtrace is taken at the recovery boundary.
    pub async fn run_job(&self, name: &str, args: JobArgs) -> JobOutcome {
        let Some(handler) = self.registry.handler(name) else {
            error!(job = %name, args = %args, "no job registered under this name");
            return JobOutcome::Unknown;
        };

        let ctx = self.context(name);
        let started = Instant::now();
        let result = AssertUnwindSafe(handler.run(ctx, args.clone()))
            .catch_unwind()
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(())) => {
                info!(job = %name, elapsed_ms, "job completed");
                JobOutcome::Completed
            }
            Ok(Err(e)) => {
                error!(job = %name, args = %args, error = %e, elapsed_ms, "job failed");
                JobOutcome::Failed
            }
            Err(payload) => {
                let (location, backtrace) = take_panic_capture().unwrap_or_else(|| {
                    ("unknown".to_string(), Backtrace::force_capture().to_string())
                });
                error!(
                    job = %name,
                    args = %args,
                    error = %panic_message(payload.as_ref()),
                    location = %location,
                    stack = %backtrace,
                    elapsed_ms,
                    "job panicked"
                );
                JobOutcome::Panicked
            }
        }
    }
}

// --- panic capture ---------------------------------------------------------
//
// `catch_unwind` only yields the panic payload. The hook below records where
// the panic happened and the panicking thread's backtrace; the unwind then
// reaches `catch_unwind` on that same thread, which takes the record.

thread_local! {
    static LAST_PANIC: RefCell<Option<(String, String)>> = const { RefCell::new(None) };
}

/// Install the process-wide panic hook that lets [`JobRunner::run_job`] log
/// where a job panicked. Chains to the previous hook. Idempotent.
pub fn install_panic_capture() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let location = info
                .location()
                .map(|l| format!("{}:{}", l.file(), l.line()))
                .unwrap_or_else(|| "unknown".to_string());
            let backtrace = Backtrace::force_capture().to_string();
            LAST_PANIC.with(|slot| *slot.borrow_mut() = Some((location, backtrace)));
            previous(info);
        }));
    });
}

fn take_panic_capture() -> Option<(String, String)> {
    LAST_PANIC.with(|slot| slot.borrow_mut().take())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        warn!("job panicked with a non-string payload");
        "non-string panic payload".to_string()
    }
}
