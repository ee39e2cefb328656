use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::{
    error::{JobError, JobsError, Result},
    runner::JobContext,
    types::JobArgs,
};

/// A unit of deferred work, looked up by name when a job is claimed.
///
/// Any `Fn(JobContext, JobArgs) -> impl Future<Output = Result<(), JobError>>`
/// is a handler, so plain async closures can be registered directly.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn run(&self, ctx: JobContext, args: JobArgs) -> std::result::Result<(), JobError>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(JobContext, JobArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), JobError>> + Send + 'static,
{
    async fn run(&self, ctx: JobContext, args: JobArgs) -> std::result::Result<(), JobError> {
        (self)(ctx, args).await
    }
}

/// Collects job handlers and schedules during startup.
///
/// Job and schedule names are a build-time contract, so every registration
/// conflict is an error here rather than something the loops tolerate.
#[derive(Default)]
pub struct RegistryBuilder {
    jobs: HashMap<String, Arc<dyn JobHandler>>,
    schedules: BTreeMap<String, Duration>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`. Fails if the name is taken.
    pub fn register_job<H: JobHandler>(&mut self, name: impl Into<String>, handler: H) -> Result<&mut Self> {
        let name = name.into();
        if self.jobs.contains_key(&name) {
            return Err(JobsError::DuplicateJob { name });
        }
        debug!(job = %name, "job registered");
        self.jobs.insert(name, Arc::new(handler));
        Ok(self)
    }

    /// Run the job called `name` every `interval`. Fails if the name is taken.
    pub fn register_schedule(&mut self, name: impl Into<String>, interval: Duration) -> Result<&mut Self> {
        let name = name.into();
        if self.schedules.contains_key(&name) {
            return Err(JobsError::DuplicateSchedule { name });
        }
        debug!(schedule = %name, interval_secs = interval.as_secs(), "schedule registered");
        self.schedules.insert(name, interval);
        Ok(self)
    }

    /// Validate and freeze the registrations.
    pub fn build(self) -> Result<Registry> {
        for (name, interval) in &self.schedules {
            if !self.jobs.contains_key(name) {
                return Err(JobsError::ScheduleWithoutJob { name: name.clone() });
            }
            validate_interval(name, *interval)?;
        }
        Ok(Registry {
            jobs: self.jobs,
            schedules: self.schedules,
        })
    }
}

// Interval arithmetic is done in milliseconds on i64.
fn validate_interval(name: &str, interval: Duration) -> Result<()> {
    let millis = interval.as_millis();
    if millis == 0 {
        return Err(JobsError::InvalidInterval {
            name: name.to_string(),
            reason: "must be at least one millisecond".to_string(),
        });
    }
    if i64::try_from(millis).is_err() || chrono::Duration::from_std(interval).is_err() {
        return Err(JobsError::InvalidInterval {
            name: name.to_string(),
            reason: format!("{interval:?} is too large"),
        });
    }
    Ok(())
}

/// Frozen name → handler and name → interval maps.
pub struct Registry {
    jobs: HashMap<String, Arc<dyn JobHandler>>,
    schedules: BTreeMap<String, Duration>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn handler(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.jobs.get(name).cloned()
    }

    pub fn contains_job(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    /// Registered job names, sorted.
    pub fn job_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.jobs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn schedule_interval(&self, name: &str) -> Option<Duration> {
        self.schedules.get(name).copied()
    }

    /// Registered schedules in name order.
    pub fn schedules(&self) -> impl Iterator<Item = (&str, Duration)> {
        self.schedules.iter().map(|(name, interval)| (name.as_str(), *interval))
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("jobs", &self.job_names())
            .field("schedules", &self.schedules)
            .finish()
    }
}
