use std::path::Path;
use std::time::Duration;

use rusqlite::Connection;
use tracing::debug;

use crate::config::DatabaseConfig;
use crate::error::Result;

/// Open a connection to the shared database file.
///
/// Every subsystem (queue, scheduler, cache) gets its own connection. The
/// database file is the only coordination point between processes, so the
/// connection waits on a locked file for up to `busy_timeout_ms` instead of
/// failing immediately.
pub fn open(config: &DatabaseConfig) -> Result<Connection> {
    ensure_parent_dir(&config.path)?;
    let conn = Connection::open(&config.path)?;
    configure(&conn, Duration::from_millis(config.busy_timeout_ms))?;
    debug!(path = %config.path, "database connection opened");
    Ok(conn)
}

/// Apply the pragmas shared by every connection.
pub fn configure(conn: &Connection, busy_timeout: Duration) -> Result<()> {
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
    Ok(())
}

fn ensure_parent_dir(path: &str) -> Result<()> {
    match Path::new(path).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            std::fs::create_dir_all(parent)?;
            Ok(())
        }
        _ => Ok(()),
    }
}
