//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "outreach_core",
        sql: r#"
            CREATE TABLE IF NOT EXISTS leads (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                first_name TEXT,
                last_name TEXT,
                email TEXT,
                phone TEXT,
                company TEXT,
                city TEXT,
                product_interest TEXT,
                status TEXT NOT NULL DEFAULT 'NEW',
                step INTEGER NOT NULL DEFAULT 0,
                funnel_stage TEXT NOT NULL DEFAULT 'LEAD',
                stage_locked INTEGER NOT NULL DEFAULT 0,
                stage_changed_at TEXT,
                last_contacted_at TEXT,
                last_activity_at TEXT,
                memory_summary TEXT,
                memory_objection TEXT,
                memory_buying_signals TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_leads_status ON leads(status);
            CREATE INDEX IF NOT EXISTS idx_leads_funnel_stage ON leads(funnel_stage);

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                lead_id INTEGER NOT NULL REFERENCES leads(id),
                channel TEXT NOT NULL,
                direction TEXT NOT NULL,
                content TEXT NOT NULL,
                variant TEXT,
                classification TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_lead ON messages(lead_id, direction);

            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                lead_id INTEGER NOT NULL REFERENCES leads(id),
                event_type TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_lead ON events(lead_id, event_type);

            CREATE TABLE IF NOT EXISTS ab_assignments (
                step_id INTEGER NOT NULL,
                lead_id INTEGER NOT NULL REFERENCES leads(id),
                variant TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (step_id, lead_id)
            );

            CREATE TABLE IF NOT EXISTS stage_history (
                id TEXT PRIMARY KEY,
                lead_id INTEGER NOT NULL REFERENCES leads(id),
                from_stage TEXT NOT NULL,
                to_stage TEXT NOT NULL,
                reason TEXT NOT NULL,
                confidence INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_stage_history_lead ON stage_history(lead_id);
        "#,
    },
    Migration {
        version: 2,
        name: "supervisor",
        sql: r#"
            CREATE TABLE IF NOT EXISTS activities (
                id TEXT PRIMARY KEY,
                activity_type TEXT NOT NULL,
                severity TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                action TEXT NOT NULL,
                metadata TEXT NOT NULL,
                lead_id INTEGER,
                status TEXT NOT NULL DEFAULT 'PENDING',
                result TEXT,
                created_at TEXT NOT NULL,
                decided_at TEXT,
                executed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_activities_status ON activities(status);
            CREATE INDEX IF NOT EXISTS idx_activities_type_created ON activities(activity_type, created_at);
            CREATE INDEX IF NOT EXISTS idx_activities_lead ON activities(lead_id);

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                lead_id INTEGER NOT NULL REFERENCES leads(id),
                task_type TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                due_date TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'OPEN',
                created_at TEXT NOT NULL,
                completed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
        "#,
    },
];

/// Apply all pending migrations.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Database migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "leads",
            "messages",
            "events",
            "ab_assignments",
            "stage_history",
            "activities",
            "tasks",
            "_migrations",
        ] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn version_tracking() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT version, name FROM _migrations ORDER BY version", ())
            .await
            .unwrap();
        let row1 = rows.next().await.unwrap().unwrap();
        assert_eq!(row1.get::<i64>(0).unwrap(), 1);
        assert_eq!(row1.get::<String>(1).unwrap(), "outreach_core");

        let row2 = rows.next().await.unwrap().unwrap();
        assert_eq!(row2.get::<i64>(0).unwrap(), 2);
        assert_eq!(row2.get::<String>(1).unwrap(), "supervisor");
    }

    #[tokio::test]
    async fn ab_assignment_primary_key_rejects_duplicates() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        conn.execute(
            "INSERT INTO leads (created_at, updated_at) VALUES ('2026-01-01', '2026-01-01')",
            (),
        )
        .await
        .unwrap();
        conn.execute(
            "INSERT INTO ab_assignments (step_id, lead_id, variant, created_at) VALUES (1, 1, 'A', '2026-01-01')",
            (),
        )
        .await
        .unwrap();
        let dup = conn
            .execute(
                "INSERT INTO ab_assignments (step_id, lead_id, variant, created_at) VALUES (1, 1, 'B', '2026-01-01')",
                (),
            )
            .await;
        assert!(dup.is_err());
    }
}
