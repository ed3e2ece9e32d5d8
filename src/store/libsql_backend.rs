//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. A single connection is
//! shared by every caller; multi-statement writes run inside a transaction
//! guarded by `write_lock` so no other write can land in the middle.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Row, Rows, params};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::leads::{
    Event, EventType, FunnelStage, Lead, LeadId, LeadMemory, LeadStatus, Message, NewLead,
    StageHistoryEntry, Task, TaskStatus,
};
use crate::store::migrations;
use crate::store::traits::{Database, DispatchRecord, LeadCounts};
use crate::supervisor::activity::{Activity, ActivityAction, ActivityStatus, ActivityType};

/// libSQL database backend.
pub struct LibSqlBackend {
    _db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests and dry runs).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            _db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format. Fixed precision keeps text comparison in SQL
/// consistent with time order.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(ts(&dt)),
        None => libsql::Value::Null,
    }
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_datetime)
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn query_err(op: &'static str) -> impl Fn(libsql::Error) -> DatabaseError {
    move |e| DatabaseError::Query(format!("{op}: {e}"))
}

fn get_i64(row: &Row, idx: i32) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx)
        .map_err(|e| DatabaseError::Query(format!("column {idx}: {e}")))
}

fn get_str(row: &Row, idx: i32) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Query(format!("column {idx}: {e}")))
}

/// Nullable text column.
fn get_opt_str(row: &Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok()
}

fn get_enum<T: FromStr<Err = String>>(row: &Row, idx: i32) -> Result<T, DatabaseError> {
    get_str(row, idx)?
        .parse()
        .map_err(DatabaseError::Serialization)
}

fn get_uuid(row: &Row, idx: i32) -> Result<Uuid, DatabaseError> {
    let raw = get_str(row, idx)?;
    Uuid::parse_str(&raw).map_err(|e| DatabaseError::Serialization(format!("bad uuid {raw}: {e}")))
}

fn get_ts(row: &Row, idx: i32) -> Result<DateTime<Utc>, DatabaseError> {
    Ok(parse_datetime(&get_str(row, idx)?))
}

fn get_opt_ts(row: &Row, idx: i32) -> Option<DateTime<Utc>> {
    parse_optional_datetime(get_opt_str(row, idx))
}

/// Drain a result set through a row mapper.
async fn collect<T>(
    mut rows: Rows,
    op: &'static str,
    map: fn(&Row) -> Result<T, DatabaseError>,
) -> Result<Vec<T>, DatabaseError> {
    let mut out = Vec::new();
    while let Some(row) = rows.next().await.map_err(query_err(op))? {
        out.push(map(&row)?);
    }
    Ok(out)
}

async fn first<T>(
    mut rows: Rows,
    op: &'static str,
    map: fn(&Row) -> Result<T, DatabaseError>,
) -> Result<Option<T>, DatabaseError> {
    match rows.next().await.map_err(query_err(op))? {
        Some(row) => Ok(Some(map(&row)?)),
        None => Ok(None),
    }
}

/// Run a `SELECT EXISTS(...)` query.
async fn exists(
    conn: &Connection,
    sql: &str,
    params: impl libsql::params::IntoParams,
    op: &'static str,
) -> Result<bool, DatabaseError> {
    let rows = conn.query(sql, params).await.map_err(query_err(op))?;
    let flag = first(rows, op, |row| get_i64(row, 0)).await?;
    Ok(flag.unwrap_or(0) != 0)
}

// ── Row mappers ─────────────────────────────────────────────────────

const LEAD_COLUMNS: &str = "id, first_name, last_name, email, phone, company, city, product_interest, status, step, funnel_stage, stage_locked, stage_changed_at, last_contacted_at, last_activity_at, memory_summary, memory_objection, memory_buying_signals, created_at, updated_at";

const MESSAGE_COLUMNS: &str =
    "id, lead_id, channel, direction, content, variant, classification, created_at";

const STAGE_COLUMNS: &str = "id, lead_id, from_stage, to_stage, reason, confidence, created_at";

const ACTIVITY_COLUMNS: &str = "id, activity_type, severity, title, description, metadata, status, result, created_at, decided_at, executed_at";

const TASK_COLUMNS: &str =
    "id, lead_id, task_type, title, description, due_date, status, created_at";

fn row_to_lead(row: &Row) -> Result<Lead, DatabaseError> {
    Ok(Lead {
        id: get_i64(row, 0)?,
        first_name: get_opt_str(row, 1),
        last_name: get_opt_str(row, 2),
        email: get_opt_str(row, 3),
        phone: get_opt_str(row, 4),
        company: get_opt_str(row, 5),
        city: get_opt_str(row, 6),
        product_interest: get_opt_str(row, 7),
        status: get_enum(row, 8)?,
        step: get_i64(row, 9)?,
        funnel_stage: get_enum(row, 10)?,
        stage_locked: get_i64(row, 11)? != 0,
        stage_changed_at: get_opt_ts(row, 12),
        last_contacted_at: get_opt_ts(row, 13),
        last_activity_at: get_opt_ts(row, 14),
        memory: LeadMemory {
            summary: get_opt_str(row, 15),
            last_objection: get_opt_str(row, 16),
            buying_signals: get_opt_str(row, 17),
        },
        created_at: get_ts(row, 18)?,
        updated_at: get_ts(row, 19)?,
    })
}

fn row_to_message(row: &Row) -> Result<Message, DatabaseError> {
    Ok(Message {
        id: get_uuid(row, 0)?,
        lead_id: get_i64(row, 1)?,
        channel: get_enum(row, 2)?,
        direction: get_enum(row, 3)?,
        content: get_str(row, 4)?,
        variant: get_opt_str(row, 5),
        classification: get_opt_str(row, 6),
        created_at: get_ts(row, 7)?,
    })
}

fn row_to_stage_entry(row: &Row) -> Result<StageHistoryEntry, DatabaseError> {
    let confidence = get_i64(row, 5)?;
    Ok(StageHistoryEntry {
        id: get_uuid(row, 0)?,
        lead_id: get_i64(row, 1)?,
        from_stage: get_enum(row, 2)?,
        to_stage: get_enum(row, 3)?,
        reason: get_str(row, 4)?,
        confidence: confidence.clamp(0, 100) as u8,
        created_at: get_ts(row, 6)?,
    })
}

fn row_to_activity(row: &Row) -> Result<Activity, DatabaseError> {
    let metadata = get_str(row, 5)?;
    // Payloads written by a newer build still load; they just do nothing.
    let action: ActivityAction =
        serde_json::from_str(&metadata).unwrap_or(ActivityAction::Unknown);
    Ok(Activity {
        id: get_uuid(row, 0)?,
        activity_type: get_enum(row, 1)?,
        severity: get_enum(row, 2)?,
        title: get_str(row, 3)?,
        description: get_str(row, 4)?,
        action,
        status: get_enum(row, 6)?,
        result: get_opt_str(row, 7),
        created_at: get_ts(row, 8)?,
        decided_at: get_opt_ts(row, 9),
        executed_at: get_opt_ts(row, 10),
    })
}

fn row_to_task(row: &Row) -> Result<Task, DatabaseError> {
    Ok(Task {
        id: get_uuid(row, 0)?,
        lead_id: get_i64(row, 1)?,
        task_type: get_enum(row, 2)?,
        title: get_str(row, 3)?,
        description: get_opt_str(row, 4),
        due_date: get_ts(row, 5)?,
        status: get_enum(row, 6)?,
        created_at: get_ts(row, 7)?,
    })
}

// ── Statements shared by transactional paths ────────────────────────

async fn insert_message_on(conn: &Connection, m: &Message) -> Result<(), DatabaseError> {
    conn.execute(
        &format!("INSERT INTO messages ({MESSAGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
        params![
            m.id.to_string(),
            m.lead_id,
            m.channel.as_str(),
            m.direction.as_str(),
            m.content.as_str(),
            opt_text(m.variant.as_deref()),
            opt_text(m.classification.as_deref()),
            ts(&m.created_at),
        ],
    )
    .await
    .map_err(query_err("insert_message"))?;
    Ok(())
}

async fn apply_dispatch(conn: &Connection, r: &DispatchRecord) -> Result<bool, DatabaseError> {
    let changed = conn
        .execute(
            "UPDATE leads SET status = ?3, step = ?4, last_contacted_at = ?5, updated_at = ?5
             WHERE id = ?1 AND step = ?2 AND status IN ('NEW', 'ACTIVE')",
            params![
                r.lead_id,
                r.expected_step,
                r.status.as_str(),
                r.new_step,
                ts(&r.contacted_at),
            ],
        )
        .await
        .map_err(query_err("record_dispatch"))?;
    if changed == 0 {
        return Ok(false);
    }
    if let Some(message) = &r.message {
        insert_message_on(conn, message).await?;
    }
    if let Some(task) = &r.task {
        insert_task_on(conn, task).await?;
    }
    Ok(true)
}

async fn insert_task_on(conn: &Connection, task: &Task) -> Result<(), DatabaseError> {
    conn.execute(
        &format!("INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
        params![
            task.id.to_string(),
            task.lead_id,
            task.task_type.as_str(),
            task.title.as_str(),
            opt_text(task.description.as_deref()),
            ts(&task.due_date),
            task.status.as_str(),
            ts(&task.created_at),
        ],
    )
    .await
    .map_err(query_err("insert_task"))?;
    Ok(())
}

async fn apply_direct_send(conn: &Connection, m: &Message) -> Result<(), DatabaseError> {
    insert_message_on(conn, m).await?;
    conn.execute(
        "UPDATE leads SET last_contacted_at = ?2, updated_at = ?2 WHERE id = ?1",
        params![m.lead_id, ts(&m.created_at)],
    )
    .await
    .map_err(query_err("record_direct_send"))?;
    Ok(())
}

async fn apply_stage_change(
    conn: &Connection,
    entry: &StageHistoryEntry,
    expected_from: FunnelStage,
) -> Result<bool, DatabaseError> {
    let changed = conn
        .execute(
            "UPDATE leads SET funnel_stage = ?3, stage_changed_at = ?4, updated_at = ?4
             WHERE id = ?1 AND funnel_stage = ?2 AND stage_locked = 0",
            params![
                entry.lead_id,
                expected_from.as_str(),
                entry.to_stage.as_str(),
                ts(&entry.created_at),
            ],
        )
        .await
        .map_err(query_err("update_lead_stage"))?;
    if changed == 0 {
        return Ok(false);
    }
    conn.execute(
        &format!("INSERT INTO stage_history ({STAGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
        params![
            entry.id.to_string(),
            entry.lead_id,
            entry.from_stage.as_str(),
            entry.to_stage.as_str(),
            entry.reason.as_str(),
            entry.confidence as i64,
            ts(&entry.created_at),
        ],
    )
    .await
    .map_err(query_err("insert_stage_history"))?;
    Ok(true)
}

async fn apply_task_completion(conn: &Connection, id: Uuid) -> Result<Option<Task>, DatabaseError> {
    let now = ts(&Utc::now());
    let changed = conn
        .execute(
            "UPDATE tasks SET status = 'DONE', completed_at = ?2 WHERE id = ?1 AND status = 'OPEN'",
            params![id.to_string(), now.as_str()],
        )
        .await
        .map_err(query_err("complete_task"))?;
    if changed == 0 {
        return Ok(None);
    }
    let rows = conn
        .query(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            params![id.to_string()],
        )
        .await
        .map_err(query_err("complete_task"))?;
    let Some(task) = first(rows, "complete_task", row_to_task).await? else {
        return Ok(None);
    };
    conn.execute(
        "UPDATE leads SET status = 'ACTIVE', updated_at = ?2 WHERE id = ?1 AND status = 'MANUAL_TASK_DUE'",
        params![task.lead_id, now.as_str()],
    )
    .await
    .map_err(query_err("complete_task"))?;
    Ok(Some(task))
}

/// Commit when `keep` accepts the outcome, roll back otherwise.
async fn settle<T>(
    tx: libsql::Transaction,
    op: &'static str,
    outcome: Result<T, DatabaseError>,
    keep: fn(&T) -> bool,
) -> Result<T, DatabaseError> {
    match outcome {
        Ok(value) if keep(&value) => {
            tx.commit().await.map_err(query_err(op))?;
            Ok(value)
        }
        Ok(value) => {
            tx.rollback().await.map_err(query_err(op))?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                debug!(op, error = %rollback, "Rollback failed");
            }
            Err(e)
        }
    }
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        migrations::run_migrations(self.conn()).await
    }

    // ── Leads ───────────────────────────────────────────────────────

    async fn insert_lead(&self, lead: &NewLead) -> Result<Lead, DatabaseError> {
        let now = ts(&Utc::now());
        let id = {
            let _guard = self.write_lock.lock().await;
            let rows = self
                .conn()
                .query(
                    "INSERT INTO leads (first_name, last_name, email, phone, company, city, product_interest, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8) RETURNING id",
                    params![
                        opt_text(lead.first_name.as_deref()),
                        opt_text(lead.last_name.as_deref()),
                        opt_text(lead.email.as_deref()),
                        opt_text(lead.phone.as_deref()),
                        opt_text(lead.company.as_deref()),
                        opt_text(lead.city.as_deref()),
                        opt_text(lead.product_interest.as_deref()),
                        now.as_str(),
                    ],
                )
                .await
                .map_err(query_err("insert_lead"))?;
            first(rows, "insert_lead", |row| get_i64(row, 0))
                .await?
                .ok_or_else(|| DatabaseError::Query("insert_lead: no id returned".into()))?
        };
        debug!(lead_id = id, "Lead inserted");

        self.get_lead(id).await?.ok_or_else(|| DatabaseError::NotFound {
            entity: "lead".into(),
            id: id.to_string(),
        })
    }

    async fn get_lead(&self, id: LeadId) -> Result<Option<Lead>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(query_err("get_lead"))?;
        first(rows, "get_lead", row_to_lead).await
    }

    async fn list_leads_by_status(
        &self,
        statuses: &[LeadStatus],
    ) -> Result<Vec<Lead>, DatabaseError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = (1..=statuses.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let values: Vec<libsql::Value> = statuses
            .iter()
            .map(|s| libsql::Value::Text(s.as_str().to_string()))
            .collect();
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {LEAD_COLUMNS} FROM leads WHERE status IN ({placeholders}) ORDER BY id"
                ),
                libsql::params_from_iter(values),
            )
            .await
            .map_err(query_err("list_leads_by_status"))?;
        collect(rows, "list_leads_by_status", row_to_lead).await
    }

    async fn list_watchable_leads(&self) -> Result<Vec<Lead>, DatabaseError> {
        let terminal: Vec<libsql::Value> = LeadStatus::ALL
            .iter()
            .filter(|s| s.is_terminal())
            .map(|s| libsql::Value::Text(s.as_str().to_string()))
            .collect();
        let placeholders = (1..=terminal.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {LEAD_COLUMNS} FROM leads
                     WHERE funnel_stage NOT IN ('WON', 'LOST')
                       AND status NOT IN ({placeholders})
                     ORDER BY id"
                ),
                libsql::params_from_iter(terminal),
            )
            .await
            .map_err(query_err("list_watchable_leads"))?;
        collect(rows, "list_watchable_leads", row_to_lead).await
    }

    async fn advance_lead_step(
        &self,
        id: LeadId,
        expected_step: i64,
        new_step: i64,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let changed = self
            .conn()
            .execute(
                "UPDATE leads SET step = ?3, updated_at = ?4 WHERE id = ?1 AND step = ?2",
                params![id, expected_step, new_step, ts(&Utc::now())],
            )
            .await
            .map_err(query_err("advance_lead_step"))?;
        Ok(changed > 0)
    }

    async fn complete_lead(&self, id: LeadId, expected_step: i64) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let changed = self
            .conn()
            .execute(
                "UPDATE leads SET status = 'COMPLETED', updated_at = ?3
                 WHERE id = ?1 AND step = ?2 AND status IN ('NEW', 'ACTIVE')",
                params![id, expected_step, ts(&Utc::now())],
            )
            .await
            .map_err(query_err("complete_lead"))?;
        Ok(changed > 0)
    }

    async fn record_dispatch(&self, record: &DispatchRecord) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self.conn().transaction().await.map_err(query_err("record_dispatch"))?;
        let outcome = apply_dispatch(&tx, record).await;
        settle(tx, "record_dispatch", outcome, |ok| *ok).await
    }

    async fn record_direct_send(&self, message: &Message) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self.conn().transaction().await.map_err(query_err("record_direct_send"))?;
        let outcome = apply_direct_send(&tx, message).await;
        settle(tx, "record_direct_send", outcome, |_| true).await
    }

    async fn update_lead_stage(
        &self,
        entry: &StageHistoryEntry,
        expected_from: FunnelStage,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self.conn().transaction().await.map_err(query_err("update_lead_stage"))?;
        let outcome = apply_stage_change(&tx, entry, expected_from).await;
        settle(tx, "update_lead_stage", outcome, |ok| *ok).await
    }

    async fn update_lead_status(
        &self,
        id: LeadId,
        status: LeadStatus,
    ) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let changed = self
            .conn()
            .execute(
                "UPDATE leads SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, status.as_str(), ts(&Utc::now())],
            )
            .await
            .map_err(query_err("update_lead_status"))?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "lead".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn set_stage_locked(&self, id: LeadId, locked: bool) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let changed = self
            .conn()
            .execute(
                "UPDATE leads SET stage_locked = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, locked as i64, ts(&Utc::now())],
            )
            .await
            .map_err(query_err("set_stage_locked"))?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "lead".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn touch_lead_activity(
        &self,
        id: LeadId,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "UPDATE leads SET last_activity_at = ?2, updated_at = ?2 WHERE id = ?1",
                params![id, ts(&at)],
            )
            .await
            .map_err(query_err("touch_lead_activity"))?;
        Ok(())
    }

    async fn update_lead_memory(
        &self,
        id: LeadId,
        memory: &LeadMemory,
    ) -> Result<(), DatabaseError> {
        if memory.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "UPDATE leads SET
                    memory_summary = COALESCE(?2, memory_summary),
                    memory_objection = COALESCE(?3, memory_objection),
                    memory_buying_signals = COALESCE(?4, memory_buying_signals),
                    updated_at = ?5
                 WHERE id = ?1",
                params![
                    id,
                    opt_text(memory.summary.as_deref()),
                    opt_text(memory.last_objection.as_deref()),
                    opt_text(memory.buying_signals.as_deref()),
                    ts(&Utc::now()),
                ],
            )
            .await
            .map_err(query_err("update_lead_memory"))?;
        Ok(())
    }

    async fn count_leads_by_status(&self) -> Result<LeadCounts, DatabaseError> {
        let rows = self
            .conn()
            .query(
                "SELECT status, COUNT(*) FROM leads GROUP BY status ORDER BY status",
                (),
            )
            .await
            .map_err(query_err("count_leads_by_status"))?;
        let by_status = collect(rows, "count_leads_by_status", |row| {
            Ok((get_enum::<LeadStatus>(row, 0)?, get_i64(row, 1)?))
        })
        .await?;
        Ok(LeadCounts { by_status })
    }

    // ── Messages & events ───────────────────────────────────────────

    async fn insert_message(&self, message: &Message) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        insert_message_on(self.conn(), message).await
    }

    async fn list_messages(&self, lead_id: LeadId) -> Result<Vec<Message>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE lead_id = ?1 ORDER BY created_at, rowid"
                ),
                params![lead_id],
            )
            .await
            .map_err(query_err("list_messages"))?;
        collect(rows, "list_messages", row_to_message).await
    }

    async fn has_inbound_message(&self, lead_id: LeadId) -> Result<bool, DatabaseError> {
        exists(
            self.conn(),
            "SELECT EXISTS(SELECT 1 FROM messages WHERE lead_id = ?1 AND direction = 'INBOUND')",
            params![lead_id],
            "has_inbound_message",
        )
        .await
    }

    async fn has_classified_message(
        &self,
        lead_id: LeadId,
        classification: &str,
    ) -> Result<bool, DatabaseError> {
        exists(
            self.conn(),
            "SELECT EXISTS(SELECT 1 FROM messages WHERE lead_id = ?1 AND classification = ?2)",
            params![lead_id, classification],
            "has_classified_message",
        )
        .await
    }

    async fn insert_event(&self, event: &Event) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "INSERT INTO events (id, lead_id, event_type, metadata, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    event.id.to_string(),
                    event.lead_id,
                    event.event_type.as_str(),
                    event.metadata.to_string(),
                    ts(&event.created_at),
                ],
            )
            .await
            .map_err(query_err("insert_event"))?;
        Ok(())
    }

    async fn has_event(
        &self,
        lead_id: LeadId,
        event_type: EventType,
    ) -> Result<bool, DatabaseError> {
        exists(
            self.conn(),
            "SELECT EXISTS(SELECT 1 FROM events WHERE lead_id = ?1 AND event_type = ?2)",
            params![lead_id, event_type.as_str()],
            "has_event",
        )
        .await
    }

    // ── A/B assignments ─────────────────────────────────────────────

    async fn get_variant_assignment(
        &self,
        step_id: i64,
        lead_id: LeadId,
    ) -> Result<Option<String>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                "SELECT variant FROM ab_assignments WHERE step_id = ?1 AND lead_id = ?2",
                params![step_id, lead_id],
            )
            .await
            .map_err(query_err("get_variant_assignment"))?;
        first(rows, "get_variant_assignment", |row| get_str(row, 0)).await
    }

    async fn assign_variant(
        &self,
        step_id: i64,
        lead_id: LeadId,
        variant: &str,
    ) -> Result<String, DatabaseError> {
        {
            let _guard = self.write_lock.lock().await;
            self.conn()
                .execute(
                    "INSERT OR IGNORE INTO ab_assignments (step_id, lead_id, variant, created_at) VALUES (?1, ?2, ?3, ?4)",
                    params![step_id, lead_id, variant, ts(&Utc::now())],
                )
                .await
                .map_err(query_err("assign_variant"))?;
        }
        self.get_variant_assignment(step_id, lead_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "ab_assignment".into(),
                id: format!("{step_id}/{lead_id}"),
            })
    }

    // ── Stage history ───────────────────────────────────────────────

    async fn list_stage_history(
        &self,
        lead_id: LeadId,
    ) -> Result<Vec<StageHistoryEntry>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {STAGE_COLUMNS} FROM stage_history WHERE lead_id = ?1 ORDER BY created_at, rowid"
                ),
                params![lead_id],
            )
            .await
            .map_err(query_err("list_stage_history"))?;
        collect(rows, "list_stage_history", row_to_stage_entry).await
    }

    // ── Activities ──────────────────────────────────────────────────

    async fn insert_activity(&self, activity: &Activity) -> Result<(), DatabaseError> {
        let metadata = serde_json::to_string(&activity.action)
            .map_err(|e| DatabaseError::Serialization(format!("activity action: {e}")))?;
        let lead_id = match activity.lead_id() {
            Some(id) => libsql::Value::Integer(id),
            None => libsql::Value::Null,
        };

        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "INSERT INTO activities (id, activity_type, severity, title, description, action, metadata, lead_id, status, result, created_at, decided_at, executed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    activity.id.to_string(),
                    activity.activity_type.as_str(),
                    activity.severity.as_str(),
                    activity.title.as_str(),
                    activity.description.as_str(),
                    activity.action.label(),
                    metadata,
                    lead_id,
                    activity.status.as_str(),
                    opt_text(activity.result.as_deref()),
                    ts(&activity.created_at),
                    opt_ts(activity.decided_at),
                    opt_ts(activity.executed_at),
                ],
            )
            .await
            .map_err(query_err("insert_activity"))?;
        Ok(())
    }

    async fn get_activity(&self, id: Uuid) -> Result<Option<Activity>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {ACTIVITY_COLUMNS} FROM activities WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_activity"))?;
        first(rows, "get_activity", row_to_activity).await
    }

    async fn list_activities(
        &self,
        status: Option<ActivityStatus>,
        limit: usize,
    ) -> Result<Vec<Activity>, DatabaseError> {
        let rows = match status {
            Some(status) => {
                self.conn()
                    .query(
                        &format!(
                            "SELECT {ACTIVITY_COLUMNS} FROM activities WHERE status = ?1 ORDER BY created_at DESC LIMIT ?2"
                        ),
                        params![status.as_str(), limit as i64],
                    )
                    .await
            }
            None => {
                self.conn()
                    .query(
                        &format!(
                            "SELECT {ACTIVITY_COLUMNS} FROM activities ORDER BY created_at DESC LIMIT ?1"
                        ),
                        params![limit as i64],
                    )
                    .await
            }
        }
        .map_err(query_err("list_activities"))?;
        collect(rows, "list_activities", row_to_activity).await
    }

    async fn has_open_lead_activity(
        &self,
        lead_id: LeadId,
        activity_type: ActivityType,
        since: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        exists(
            self.conn(),
            "SELECT EXISTS(SELECT 1 FROM activities
                WHERE lead_id = ?1 AND activity_type = ?2
                  AND status IN ('PENDING', 'APPROVED') AND created_at >= ?3)",
            params![lead_id, activity_type.as_str(), ts(&since)],
            "has_open_lead_activity",
        )
        .await
    }

    async fn has_activity_since(
        &self,
        activity_type: ActivityType,
        since: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        exists(
            self.conn(),
            "SELECT EXISTS(SELECT 1 FROM activities WHERE activity_type = ?1 AND created_at >= ?2)",
            params![activity_type.as_str(), ts(&since)],
            "has_activity_since",
        )
        .await
    }

    async fn transition_activity(
        &self,
        id: Uuid,
        from: ActivityStatus,
        to: ActivityStatus,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let changed = self
            .conn()
            .execute(
                "UPDATE activities SET
                    status = ?3,
                    decided_at = CASE WHEN ?3 IN ('APPROVED', 'REJECTED') THEN ?4 ELSE decided_at END,
                    executed_at = CASE WHEN ?3 = 'EXECUTED' THEN ?4 ELSE executed_at END
                 WHERE id = ?1 AND status = ?2",
                params![id.to_string(), from.as_str(), to.as_str(), ts(&Utc::now())],
            )
            .await
            .map_err(query_err("transition_activity"))?;
        Ok(changed > 0)
    }

    async fn finish_activity(
        &self,
        id: Uuid,
        status: ActivityStatus,
        result: &str,
    ) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "UPDATE activities SET status = ?2, result = ?3, executed_at = COALESCE(executed_at, ?4) WHERE id = ?1",
                params![id.to_string(), status.as_str(), result, ts(&Utc::now())],
            )
            .await
            .map_err(query_err("finish_activity"))?;
        Ok(())
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        insert_task_on(self.conn(), task).await
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_task"))?;
        first(rows, "get_task", row_to_task).await
    }

    async fn list_open_tasks(&self) -> Result<Vec<Task>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1 ORDER BY due_date, rowid"
                ),
                params![TaskStatus::Open.as_str()],
            )
            .await
            .map_err(query_err("list_open_tasks"))?;
        collect(rows, "list_open_tasks", row_to_task).await
    }

    async fn complete_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self.conn().transaction().await.map_err(query_err("complete_task"))?;
        let outcome = apply_task_completion(&tx, id).await;
        settle(tx, "complete_task", outcome, Option::is_some).await
    }
}
