use rusqlite::Connection;

use crate::error::Result;

/// Initialise the `cache` table.
///
/// `value` holds the JSON encoding of the cached value. The index on `expires`
/// keeps the periodic purge cheap.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS cache (
            id       TEXT NOT NULL PRIMARY KEY,
            value    BLOB NOT NULL,
            expires  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_cache_expires ON cache (expires);
        ",
    )?;
    Ok(())
}
