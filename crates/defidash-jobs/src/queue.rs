use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use defidash_core::time::{from_db, to_db};
use rusqlite::{Connection, TransactionBehavior};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    db::init_db,
    error::{JobsError, Result},
    types::{Job, JobArgs, Priority},
};

// id, name, args JSON, priority, run_at
type RawJob = (String, String, String, i64, String);

/// Durable queue of pending jobs in the shared `jobs` table.
///
/// Cheap to clone; clones share one connection. Open a separate `Queue` per
/// process (or per test "process") to get an independent connection.
#[derive(Clone)]
pub struct Queue {
    conn: Arc<Mutex<Connection>>,
}

impl Queue {
    /// Wrap a connection, creating the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Enqueue `name` to run as soon as a worker is free, at low priority.
    pub fn enqueue(&self, name: &str, args: JobArgs) -> Result<Job> {
        self.enqueue_at(name, args, Priority::default(), Utc::now())
    }

    pub fn enqueue_with(&self, name: &str, args: JobArgs, priority: Priority) -> Result<Job> {
        self.enqueue_at(name, args, priority, Utc::now())
    }

    /// Enqueue `name` to run no earlier than `delay` from now, at low priority.
    pub fn delay(&self, name: &str, args: JobArgs, delay: Duration) -> Result<Job> {
        self.delay_with(name, args, delay, Priority::default())
    }

    pub fn delay_with(&self, name: &str, args: JobArgs, delay: Duration, priority: Priority) -> Result<Job> {
        let delay = chrono::Duration::from_std(delay).map_err(|e| JobsError::InvalidDelay(e.to_string()))?;
        let run_at = Utc::now()
            .checked_add_signed(delay)
            .ok_or_else(|| JobsError::InvalidDelay(format!("{delay} overflows the run_at timestamp")))?;
        self.enqueue_at(name, args, priority, run_at)
    }

    /// Insert one pending row eligible from `run_at`.
    #[instrument(skip(self, args, run_at))]
    pub fn enqueue_at(&self, name: &str, args: JobArgs, priority: Priority, run_at: DateTime<Utc>) -> Result<Job> {
        let id = Uuid::now_v7().to_string();
        let args_json = serde_json::to_string(&args)?;

        self.lock().execute(
            "INSERT INTO jobs (id, name, args, priority, run_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![id, name, args_json, priority.as_i64(), to_db(run_at)],
        )?;
        debug!(job_id = %id, "job enqueued");

        Ok(Job {
            id,
            name: name.to_string(),
            args,
            priority,
            run_at,
        })
    }

    /// Atomically remove and return up to `limit` jobs due at `now`.
    ///
    /// Selection and deletion are one statement inside an immediate
    /// transaction, so concurrent claimers (in this or another process)
    /// always receive disjoint batches. The batch is returned in claim order:
    /// priority, then `run_at`, then creation order.
    pub fn claim(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>> {
        let raw: Vec<RawJob> = {
            let mut conn = self.lock();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let rows = {
                let mut stmt = tx.prepare_cached(
                    "DELETE FROM jobs WHERE id IN (
                         SELECT id FROM jobs
                         WHERE run_at <= ?1
                         ORDER BY priority, run_at, id
                         LIMIT ?2
                     )
                     RETURNING id, name, args, priority, run_at",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![to_db(now), limit as i64], |row| {
                        Ok((
                            row.get::<_, String>(0)?, // id
                            row.get::<_, String>(1)?, // name
                            row.get::<_, String>(2)?, // args JSON
                            row.get::<_, i64>(3)?,    // priority
                            row.get::<_, String>(4)?, // run_at
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };
            tx.commit()?;
            rows
        };

        // Rows are already deleted: one that cannot be decoded is lost, not retried.
        let mut jobs: Vec<Job> = raw
            .into_iter()
            .filter_map(|raw| match decode(raw) {
                Ok(job) => Some(job),
                Err((id, e)) => {
                    error!(job_id = %id, error = %e, "claimed job could not be decoded; dropped");
                    None
                }
            })
            .collect();
        // RETURNING order is unspecified in SQLite.
        jobs.sort_by(|a, b| a.claim_key().cmp(&b.claim_key()));

        if !jobs.is_empty() {
            info!(count = jobs.len(), "jobs claimed");
        }
        Ok(jobs)
    }

    /// All pending jobs in claim order, without claiming them.
    pub fn pending(&self) -> Result<Vec<Job>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, args, priority, run_at FROM jobs ORDER BY priority, run_at, id",
        )?;
        let raw = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<RawJob>>>()?;
        raw.into_iter()
            .map(|r| decode(r).map_err(|(_, e)| e))
            .collect()
    }

    /// Number of pending jobs, due or not.
    pub fn len(&self) -> Result<usize> {
        let n: i64 = self
            .lock()
            .query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    // Statements are transactional, so a poisoned lock leaves nothing half-written.
    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn decode((id, name, args_json, priority, run_at): RawJob) -> std::result::Result<Job, (String, JobsError)> {
    let args: JobArgs = match serde_json::from_str(&args_json) {
        Ok(args) => args,
        Err(e) => return Err((id, e.into())),
    };
    let run_at = match from_db(&run_at) {
        Ok(ts) => ts,
        Err(e) => {
            let err = JobsError::InvalidTimestamp {
                value: run_at,
                reason: e.to_string(),
            };
            return Err((id, err));
        }
    };
    let priority = Priority::from_i64(priority).unwrap_or_else(|| {
        warn!(job_id = %id, priority, "unknown priority; treating as low");
        Priority::Low
    });
    Ok(Job {
        id,
        name,
        args,
        priority,
        run_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn queue() -> Queue {
        Queue::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn names(jobs: &[Job]) -> Vec<&str> {
        jobs.iter().map(|j| j.name.as_str()).collect()
    }

    #[test]
    fn claim_orders_by_priority_then_creation() {
        let q = queue();
        let due = Utc.with_ymd_and_hms(2024, 3, 19, 12, 0, 0).unwrap();
        q.enqueue_at("low-1", JobArgs::new(), Priority::Low, due).unwrap();
        q.enqueue_at("medium", JobArgs::new(), Priority::Medium, due).unwrap();
        q.enqueue_at("low-2", JobArgs::new(), Priority::Low, due).unwrap();
        q.enqueue_at("high", JobArgs::new(), Priority::High, due).unwrap();

        let batch = q.claim(due, 5).unwrap();
        assert_eq!(names(&batch), vec!["high", "medium", "low-1", "low-2"]);
        assert!(q.is_empty().unwrap());
    }

    #[test]
    fn claim_respects_batch_limit_and_deletes_only_claimed_rows() {
        let q = queue();
        let now = Utc::now();
        for i in 0..7 {
            q.enqueue_at(&format!("job-{i}"), JobArgs::new(), Priority::Low, now).unwrap();
        }

        let first = q.claim(now, 5).unwrap();
        assert_eq!(first.len(), 5);
        assert_eq!(q.len().unwrap(), 2);

        let second = q.claim(now, 5).unwrap();
        assert_eq!(names(&second), vec!["job-5", "job-6"]);
        assert!(q.claim(now, 5).unwrap().is_empty());
    }

    #[test]
    fn future_jobs_are_not_claimed_until_due() {
        let q = queue();
        let now = Utc.with_ymd_and_hms(2024, 3, 19, 12, 0, 0).unwrap();
        q.enqueue_at("later", JobArgs::new(), Priority::High, now + chrono::Duration::minutes(5))
            .unwrap();
        q.enqueue_at("now", JobArgs::new(), Priority::Low, now).unwrap();

        assert_eq!(names(&q.claim(now, 5).unwrap()), vec!["now"]);
        assert!(q.claim(now, 5).unwrap().is_empty());
        assert_eq!(
            names(&q.claim(now + chrono::Duration::minutes(5), 5).unwrap()),
            vec!["later"]
        );
    }

    #[test]
    fn earlier_run_at_wins_within_a_priority() {
        let q = queue();
        let now = Utc.with_ymd_and_hms(2024, 3, 19, 12, 0, 0).unwrap();
        q.enqueue_at("second", JobArgs::new(), Priority::Medium, now).unwrap();
        q.enqueue_at("first", JobArgs::new(), Priority::Medium, now - chrono::Duration::seconds(30))
            .unwrap();

        assert_eq!(names(&q.claim(now, 5).unwrap()), vec!["first", "second"]);
    }

    #[test]
    fn delay_defers_and_args_survive_storage() {
        let q = queue();
        let args = JobArgs::new().with("vault", "0x483F").with("retries", 2);
        let job = q.delay("rebalance", args.clone(), Duration::from_secs(600)).unwrap();
        assert_eq!(job.priority, Priority::Low);

        assert!(q.claim(Utc::now(), 5).unwrap().is_empty());

        let pending = q.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].args, args);
        assert_eq!(pending[0].id, job.id);

        let claimed = q.claim(Utc::now() + chrono::Duration::minutes(11), 5).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].args.get_str("vault").as_deref(), Some("0x483F"));
    }

    #[test]
    fn undecodable_rows_are_dropped_on_claim() {
        let q = queue();
        let now = Utc::now();
        q.enqueue_at("good", JobArgs::new(), Priority::Low, now).unwrap();
        q.lock()
            .execute(
                "INSERT INTO jobs (id, name, args, priority, run_at) VALUES ('bad', 'bad', 'not json', 3, ?1)",
                [to_db(now)],
            )
            .unwrap();

        assert_eq!(names(&q.claim(now, 5).unwrap()), vec!["good"]);
        assert!(q.is_empty().unwrap());
    }
}
