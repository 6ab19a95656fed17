use chrono::{DateTime, Utc};
use runlog_core::plan::{derive_plan, ingest_plan, Plan, PlanError};
use runlog_core::{Message, NewMessage, Originator};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::path::Path;
use thiserror::Error;

pub const RUNLOG_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("message index {index} out of range for {len} messages")]
    IndexOutOfRange { index: u64, len: u64 },
    #[error("invalid plan: {0}")]
    Plan(#[from] PlanError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunInfo {
    pub thread_id: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub message_count: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanChange {
    pub previous: Option<Plan>,
    pub current: Plan,
}

/// Result of a committed append: the stored message and, when the message
/// carried plan data, the snapshot before and after.
#[derive(Debug, Clone, PartialEq)]
pub struct Appended {
    pub message: Message,
    pub plan_change: Option<PlanChange>,
}

pub struct RunStore {
    conn: Connection,
}

impl RunStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > RUNLOG_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: RUNLOG_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_runlog_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    /// Creates a run keyed by a UTC timestamp id, suffixed on collision.
    pub fn create_run(&mut self, now: DateTime<Utc>) -> Result<String, StorageError> {
        let base = now.format("%y%m%d_%H%M%S_%6f").to_string();
        let tx = self.conn.transaction()?;
        let mut thread_id = base.clone();
        let mut suffix = 0u32;
        while run_exists_in(&tx, &thread_id)? {
            suffix += 1;
            thread_id = format!("{base}_{suffix}");
        }
        let stamp = now.to_rfc3339();
        tx.execute(
            "
            INSERT INTO runs (thread_id, created_at, last_updated_at)
            VALUES (?1, ?2, ?2)
            ",
            params![thread_id, stamp],
        )?;
        tx.commit()?;
        Ok(thread_id)
    }

    pub fn run_exists(&self, thread_id: &str) -> Result<bool, StorageError> {
        run_exists_in(&self.conn, thread_id)
    }

    pub fn run_info(&self, thread_id: &str) -> Result<Option<RunInfo>, StorageError> {
        let row = self
            .conn
            .query_row(
                "
                SELECT r.thread_id, r.name, r.created_at, r.last_updated_at,
                       (SELECT COUNT(*) FROM messages m WHERE m.thread_id = r.thread_id)
                FROM runs r
                WHERE r.thread_id = ?1
                ",
                [thread_id],
                run_row,
            )
            .optional()?;
        row.map(RunRow::into_info).transpose()
    }

    /// All runs, most recently updated first.
    pub fn list_runs(&self) -> Result<Vec<RunInfo>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT r.thread_id, r.name, r.created_at, r.last_updated_at,
                   (SELECT COUNT(*) FROM messages m WHERE m.thread_id = r.thread_id)
            FROM runs r
            ORDER BY r.last_updated_at DESC, r.thread_id DESC
            ",
        )?;
        let rows = statement.query_map([], run_row)?;

        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?.into_info()?);
        }
        Ok(runs)
    }

    pub fn rename_run(&mut self, thread_id: &str, name: &str) -> Result<(), StorageError> {
        let trimmed = name.trim();
        let name = (!trimmed.is_empty()).then_some(trimmed);
        let changes = self.conn.execute(
            "UPDATE runs SET name = ?2 WHERE thread_id = ?1",
            params![thread_id, name],
        )?;
        if changes == 0 {
            return Err(StorageError::RunNotFound(thread_id.to_string()));
        }
        Ok(())
    }

    pub fn touch_run(&mut self, thread_id: &str, now: DateTime<Utc>) -> Result<(), StorageError> {
        let changes = self.conn.execute(
            "UPDATE runs SET last_updated_at = ?2 WHERE thread_id = ?1",
            params![thread_id, now.to_rfc3339()],
        )?;
        if changes == 0 {
            return Err(StorageError::RunNotFound(thread_id.to_string()));
        }
        Ok(())
    }

    /// Next event cursor to assign for the thread.
    pub fn event_cursor(&self, thread_id: &str) -> Result<u64, StorageError> {
        let cursor = self
            .conn
            .query_row(
                "SELECT next_event_cursor FROM runs WHERE thread_id = ?1",
                [thread_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .ok_or_else(|| StorageError::RunNotFound(thread_id.to_string()))?;
        Ok(cursor.max(0) as u64)
    }

    /// Persists the next event cursor. The stored value never decreases.
    pub fn set_event_cursor(&mut self, thread_id: &str, next: u64) -> Result<(), StorageError> {
        let changes = self.conn.execute(
            "
            UPDATE runs
            SET next_event_cursor = MAX(next_event_cursor, ?2)
            WHERE thread_id = ?1
            ",
            params![thread_id, to_sql_index(next)?],
        )?;
        if changes == 0 {
            return Err(StorageError::RunNotFound(thread_id.to_string()));
        }
        Ok(())
    }

    pub fn latest_plan(&self, thread_id: &str) -> Result<Option<Plan>, StorageError> {
        latest_plan_in(&self.conn, thread_id)
    }

    pub fn message_count(&self, thread_id: &str) -> Result<u64, StorageError> {
        message_count_in(&self.conn, thread_id)
    }

    /// Appends at the next dense index. Index allocation, the row and the plan
    /// snapshot commit together.
    pub fn append(
        &mut self,
        thread_id: &str,
        message: NewMessage,
        now: DateTime<Utc>,
    ) -> Result<Appended, StorageError> {
        let tx = self.conn.transaction()?;
        let appended = append_in(&tx, thread_id, message, now)?;
        tx.commit()?;
        Ok(appended)
    }

    pub fn read(&self, thread_id: &str, from_index: u64) -> Result<Vec<Message>, StorageError> {
        read_in(&self.conn, thread_id, from_index)
    }

    /// Drops every message after `index`; `None` empties the thread.
    pub fn truncate_after(
        &mut self,
        thread_id: &str,
        index: Option<u64>,
    ) -> Result<usize, StorageError> {
        let tx = self.conn.transaction()?;
        let removed = truncate_in(&tx, thread_id, index.map(|index| index + 1).unwrap_or(0))?;
        tx.commit()?;
        Ok(removed)
    }

    /// Replaces the message at `index` and everything after it with `message`.
    pub fn rewrite_from(
        &mut self,
        thread_id: &str,
        index: u64,
        message: NewMessage,
        now: DateTime<Utc>,
    ) -> Result<Appended, StorageError> {
        let tx = self.conn.transaction()?;
        let count = message_count_in(&tx, thread_id)?;
        if index > count {
            return Err(StorageError::IndexOutOfRange { index, len: count });
        }
        truncate_in(&tx, thread_id, index)?;
        let appended = append_in(&tx, thread_id, message, now)?;
        tx.commit()?;
        Ok(appended)
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }
}

fn run_exists_in(conn: &Connection, thread_id: &str) -> Result<bool, StorageError> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM runs WHERE thread_id = ?1",
            [thread_id],
            |_| Ok(()),
        )
        .optional()?;
    Ok(exists.is_some())
}

fn message_count_in(conn: &Connection, thread_id: &str) -> Result<u64, StorageError> {
    if !run_exists_in(conn, thread_id)? {
        return Err(StorageError::RunNotFound(thread_id.to_string()));
    }
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE thread_id = ?1",
        [thread_id],
        |row| row.get(0),
    )?;
    Ok(count.max(0) as u64)
}

fn latest_plan_in(conn: &Connection, thread_id: &str) -> Result<Option<Plan>, StorageError> {
    let plan_json = conn
        .query_row(
            "SELECT plan_json FROM runs WHERE thread_id = ?1",
            [thread_id],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()?
        .ok_or_else(|| StorageError::RunNotFound(thread_id.to_string()))?;

    plan_json
        .map(|raw| {
            serde_json::from_str(&raw).map_err(|err| StorageError::Serialization(err.to_string()))
        })
        .transpose()
}

fn store_plan_in(
    conn: &Connection,
    thread_id: &str,
    plan: Option<&Plan>,
) -> Result<(), StorageError> {
    let plan_json = plan
        .map(|plan| {
            serde_json::to_string(plan).map_err(|err| StorageError::Serialization(err.to_string()))
        })
        .transpose()?;
    conn.execute(
        "UPDATE runs SET plan_json = ?2 WHERE thread_id = ?1",
        params![thread_id, plan_json],
    )?;
    Ok(())
}

fn append_in(
    conn: &Connection,
    thread_id: &str,
    mut message: NewMessage,
    now: DateTime<Utc>,
) -> Result<Appended, StorageError> {
    let message_index = message_count_in(conn, thread_id)?;

    let previous = latest_plan_in(conn, thread_id)?;
    let resolved = ingest_plan(previous.as_ref(), &mut message.extra, now)?;
    if let Some(plan) = resolved.as_ref() {
        store_plan_in(conn, thread_id, Some(plan))?;
    }

    let content_json = serde_json::to_string(&message.content)
        .map_err(|err| StorageError::Serialization(err.to_string()))?;
    let extra_json = serde_json::to_string(&message.extra)
        .map_err(|err| StorageError::Serialization(err.to_string()))?;
    conn.execute(
        "
        INSERT INTO messages (
            thread_id,
            message_index,
            originator,
            agent_name,
            content_json,
            extra_json,
            created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ",
        params![
            thread_id,
            to_sql_index(message_index)?,
            message.originator.kind(),
            message.originator.worker_name(),
            content_json,
            extra_json,
            now.to_rfc3339(),
        ],
    )?;

    Ok(Appended {
        message: message.into_message(message_index, now),
        plan_change: resolved.map(|current| PlanChange { previous, current }),
    })
}

fn truncate_in(conn: &Connection, thread_id: &str, keep: u64) -> Result<usize, StorageError> {
    if !run_exists_in(conn, thread_id)? {
        return Err(StorageError::RunNotFound(thread_id.to_string()));
    }
    let removed = conn.execute(
        "DELETE FROM messages WHERE thread_id = ?1 AND message_index >= ?2",
        params![thread_id, to_sql_index(keep)?],
    )?;

    let remaining = read_in(conn, thread_id, 0)?;
    store_plan_in(conn, thread_id, derive_plan(&remaining).as_ref())?;
    Ok(removed)
}

fn read_in(
    conn: &Connection,
    thread_id: &str,
    from_index: u64,
) -> Result<Vec<Message>, StorageError> {
    let mut statement = conn.prepare(
        "
        SELECT message_index, originator, agent_name, content_json, extra_json, created_at
        FROM messages
        WHERE thread_id = ?1 AND message_index >= ?2
        ORDER BY message_index ASC
        ",
    )?;
    let rows = statement.query_map(params![thread_id, to_sql_index(from_index)?], |row| {
        Ok(MessageRow {
            message_index: row.get(0)?,
            originator: row.get(1)?,
            agent_name: row.get(2)?,
            content_json: row.get(3)?,
            extra_json: row.get(4)?,
            created_at: row.get(5)?,
        })
    })?;

    let mut messages = Vec::new();
    for row in rows {
        messages.push(row?.into_message()?);
    }
    Ok(messages)
}

struct RunRow {
    thread_id: String,
    name: Option<String>,
    created_at: String,
    last_updated_at: String,
    message_count: i64,
}

impl RunRow {
    fn into_info(self) -> Result<RunInfo, StorageError> {
        Ok(RunInfo {
            thread_id: self.thread_id,
            name: self.name,
            created_at: parse_timestamp(self.created_at)?,
            last_updated_at: parse_timestamp(self.last_updated_at)?,
            message_count: self.message_count.max(0) as u64,
        })
    }
}

fn run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRow> {
    Ok(RunRow {
        thread_id: row.get(0)?,
        name: row.get(1)?,
        created_at: row.get(2)?,
        last_updated_at: row.get(3)?,
        message_count: row.get(4)?,
    })
}

struct MessageRow {
    message_index: i64,
    originator: String,
    agent_name: Option<String>,
    content_json: String,
    extra_json: String,
    created_at: String,
}

impl MessageRow {
    fn into_message(self) -> Result<Message, StorageError> {
        let originator = Originator::from_parts(&self.originator, self.agent_name.as_deref())
            .map_err(StorageError::Serialization)?;
        let content = serde_json::from_str(&self.content_json)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        Ok(Message {
            message_index: self.message_index.max(0) as u64,
            originator,
            content,
            extra: parse_extra(&self.extra_json)?,
            can_rewind_before: None,
            created_at: parse_timestamp(self.created_at)?,
        })
    }
}

fn parse_extra(raw: &str) -> Result<Map<String, Value>, StorageError> {
    serde_json::from_str(raw).map_err(|err| StorageError::Serialization(err.to_string()))
}

fn to_sql_index(value: u64) -> Result<i64, StorageError> {
    i64::try_from(value)
        .map_err(|_| StorageError::Serialization(format!("index out of range: {value}")))
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}
