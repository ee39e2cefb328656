use rusqlite::Connection;

use crate::error::Result;

/// Initialise the queue and scheduler schema in `conn`.
///
/// Both tables are idempotent. The composite index matches the claim query's
/// `ORDER BY priority, run_at, id` so draining a backlog stays an index scan.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id        TEXT    NOT NULL PRIMARY KEY,  -- UUIDv7, time-ordered
            name      TEXT    NOT NULL,
            args      TEXT    NOT NULL,              -- JSON object
            priority  INTEGER NOT NULL,              -- 1 high, 2 medium, 3 low
            run_at    TEXT    NOT NULL               -- RFC3339 UTC, millisecond precision
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs (priority, run_at, id);

        CREATE TABLE IF NOT EXISTS schedules (
            id        TEXT NOT NULL PRIMARY KEY,     -- schedule name
            last_ran  TEXT NOT NULL,
            next_run  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_schedules_next_run ON schedules (next_run);
        ",
    )?;
    Ok(())
}
