//! Forward-only schema migrations, tracked in a `_meta` table keyed by
//! `schema_version`. Applying the same migration set twice is a no-op: the
//! version read back after open never regresses and `CREATE TABLE IF NOT
//! EXISTS` keeps re-application idempotent.

use super::StoreError;
use rusqlite::Connection;

pub const CURRENT_SCHEMA_VERSION: i64 = 1;

const MIGRATIONS: &[(i64, &str)] = &[(
    1,
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        project_root TEXT NOT NULL,
        model TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        completed_at INTEGER,
        metadata TEXT
    );
    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        task_type TEXT NOT NULL,
        description TEXT NOT NULL,
        status TEXT NOT NULL,
        result TEXT,
        error TEXT,
        started_at INTEGER,
        completed_at INTEGER,
        FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
    );
    CREATE INDEX IF NOT EXISTS idx_sessions_status_root_created
        ON sessions(status, project_root, created_at);
    CREATE INDEX IF NOT EXISTS idx_tasks_session_status
        ON tasks(session_id, status);
    "#,
)];

pub fn run(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);",
    )?;

    let current: Option<String> = conn
        .query_row("SELECT value FROM _meta WHERE key = 'schema_version'", [], |row| row.get(0))
        .ok();
    let mut version: i64 = current.and_then(|v| v.parse().ok()).unwrap_or(0);

    for (target_version, sql) in MIGRATIONS {
        if version < *target_version {
            conn.execute_batch(sql)?;
            conn.execute(
                "INSERT INTO _meta (key, value) VALUES ('schema_version', ?1)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                rusqlite::params![target_version.to_string()],
            )?;
            version = *target_version;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_open_lands_on_current_version() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        let v: String = conn
            .query_row("SELECT value FROM _meta WHERE key = 'schema_version'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(v.parse::<i64>().unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn reopening_is_idempotent_and_preserves_rows() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        conn.execute(
            "INSERT INTO sessions (id, project_root, model, status, created_at, updated_at) VALUES ('s1','/p','m','active',0,0)",
            [],
        )
        .unwrap();

        run(&conn).unwrap();

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM sessions", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
    }
}
