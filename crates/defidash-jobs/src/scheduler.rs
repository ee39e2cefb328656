use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use defidash_core::config::DEFAULT_SCHEDULER_TICK_SECS;
use defidash_core::time::{from_db, to_db};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    db::init_db,
    error::{JobsError, Result},
    queue::Queue,
    registry::Registry,
    schedule::next_run_after,
    types::{JobArgs, Priority, ScheduleRow},
};

/// Promotes due schedule occurrences into the queue.
///
/// Any number of schedulers may run against the same database. Each
/// occurrence is claimed with a conditional update, so exactly one of them
/// enqueues it.
pub struct Scheduler {
    conn: Arc<Mutex<Connection>>,
    registry: Arc<Registry>,
    queue: Queue,
    tick: Duration,
}

impl Scheduler {
    pub fn new(conn: Connection, registry: Arc<Registry>, queue: Queue) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            registry,
            queue,
            tick: Duration::from_secs(DEFAULT_SCHEDULER_TICK_SECS),
        })
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Bring the `schedules` table in line with the registry.
    ///
    /// Rows whose schedule is no longer registered are deleted. A registered
    /// schedule without a row gets one with `last_ran = now` and `next_run` on
    /// the grid after `now + interval`. Existing rows are left alone, so a
    /// restart never resets a schedule.
    pub fn reconcile(&self, now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let stored: Vec<String> = {
            let mut stmt = tx.prepare("SELECT id FROM schedules")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            ids
        };

        let mut removed = 0usize;
        for id in &stored {
            if self.registry.schedule_interval(id).is_none() {
                tx.execute("DELETE FROM schedules WHERE id = ?1", [id])?;
                info!(schedule = %id, "stale schedule removed");
                removed += 1;
            }
        }

        let stored: HashSet<&str> = stored.iter().map(String::as_str).collect();
        let mut created = 0usize;
        for (name, interval) in self.registry.schedules() {
            if stored.contains(name) {
                continue;
            }
            let next_run = next_run_after(now, interval);
            // Another process may be reconciling the same schedule right now.
            let n = tx.execute(
                "INSERT OR IGNORE INTO schedules (id, last_ran, next_run) VALUES (?1, ?2, ?3)",
                rusqlite::params![name, to_db(now), to_db(next_run)],
            )?;
            if n > 0 {
                info!(schedule = %name, next_run = %to_db(next_run), "schedule created");
                created += 1;
            }
        }

        tx.commit()?;
        debug!(removed, created, "schedules reconciled");
        Ok(())
    }

    /// All schedule rows ordered by name.
    pub fn list(&self) -> Result<Vec<ScheduleRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT id, last_ran, next_run FROM schedules ORDER BY id")?;
        let raw = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter().map(decode_row).collect()
    }

    /// Names of schedules whose `next_run` is at or before `now`.
    pub fn due(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare_cached("SELECT id FROM schedules WHERE next_run <= ?1 ORDER BY next_run, id")?;
        let ids = stmt
            .query_map([to_db(now)], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    /// Try to take the occurrence of `name` that is due at `now`.
    ///
    /// Advances `last_ran` and `next_run` only if the stored `next_run` is
    /// still due. Returns the updated row when this caller won, `None` when
    /// another scheduler already advanced it.
    pub fn try_claim_occurrence(
        &self,
        name: &str,
        interval: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduleRow>> {
        let next_run = next_run_after(now, interval);
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let row = tx
            .query_row(
                "UPDATE schedules SET last_ran = ?1, next_run = ?2
                 WHERE id = ?3 AND next_run <= ?1
                 RETURNING id, last_ran, next_run",
                rusqlite::params![to_db(now), to_db(next_run), name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        tx.commit()?;

        row.map(decode_row).transpose()
    }

    /// One scheduler pass at `now`. Returns the schedules this instance fired.
    pub fn run_once(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut fired = Vec::new();
        for name in self.due(now)? {
            let Some(interval) = self.registry.schedule_interval(&name) else {
                // Registered by another process; its own scheduler fires it.
                debug!(schedule = %name, "due schedule not registered here; skipped");
                continue;
            };

            match self.try_claim_occurrence(&name, interval, now)? {
                Some(row) => {
                    // A crash before this insert loses the occurrence.
                    self.queue.enqueue_at(&name, JobArgs::new(), Priority::High, now)?;
                    info!(schedule = %name, next_run = %to_db(row.next_run), "schedule fired");
                    fired.push(name);
                }
                None => debug!(schedule = %name, "occurrence taken by another scheduler"),
            }
        }
        Ok(fired)
    }

    /// Reconcile, then run a pass every tick until `shutdown` is `true`.
    ///
    /// A storage error ends the loop and is returned to the caller.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.reconcile(Utc::now())?;
        info!(tick_secs = self.tick.as_secs(), "scheduler started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.run_once(Utc::now())?;

            tokio::select! {
                _ = tokio::time::sleep(self.tick) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        warn!("shutdown channel closed; stopping scheduler");
                        break;
                    }
                }
            }
        }

        info!("scheduler stopped");
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn decode_row((id, last_ran, next_run): (String, String, String)) -> Result<ScheduleRow> {
    let parse = |value: String| {
        from_db(&value).map_err(|e| JobsError::InvalidTimestamp {
            reason: e.to_string(),
            value,
        })
    };
    Ok(ScheduleRow {
        last_ran: parse(last_ran)?,
        next_run: parse(next_run)?,
        id,
    })
}
