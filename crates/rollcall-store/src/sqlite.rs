//! SQLite-based store implementation

use chrono::{DateTime, Local};
use rollcall_api::{NotificationRecord, StageCounter, StudentRecord};
use rollcall_util::StudentId;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::{AuditEvent, Registry, Store, StoredAbsences, StoreError, StoreResult};

const META_LAST_RESET: &str = "last_reset_at";

/// SQLite-based store; implements both [`Store`] and [`Registry`]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn fmt_dt(dt: &DateTime<Local>) -> String {
    dt.to_rfc3339()
}

fn parse_dt(s: Option<String>) -> Option<DateTime<Local>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Local))
            .ok()
    })
}

fn counter(stage: i64, last: Option<String>) -> StageCounter {
    StageCounter {
        stage_count: stage.max(0) as u32,
        last_notified_at: parse_dt(last),
    }
}

fn student_from_row(row: &Row<'_>) -> rusqlite::Result<StudentRecord> {
    Ok(StudentRecord {
        id: StudentId::new(row.get(0)?),
        display_name: row.get(1)?,
        contact_id: row.get(2)?,
        is_admin: row.get::<_, i64>(3)? != 0,
    })
}

impl SqliteStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Database("connection lock poisoned".into()))
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS students (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                display_name TEXT NOT NULL UNIQUE,
                contact_id TEXT,
                is_admin INTEGER NOT NULL DEFAULT 0
            );

            -- One row per student with at least one active track
            CREATE TABLE IF NOT EXISTS notification_records (
                student_id INTEGER PRIMARY KEY,
                camera_stage INTEGER NOT NULL DEFAULT 0,
                camera_last_notified TEXT,
                leave_stage INTEGER NOT NULL DEFAULT 0,
                leave_last_notified TEXT,
                return_stage INTEGER NOT NULL DEFAULT 0,
                return_last_notified TEXT
            );

            CREATE TABLE IF NOT EXISTS absences (
                student_id INTEGER PRIMARY KEY,
                active_json TEXT,
                pending_json TEXT NOT NULL DEFAULT '[]'
            );

            CREATE TABLE IF NOT EXISTS service_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            -- Audit log (append-only)
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                event_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);
            "#,
        )?;

        debug!("Store schema initialized");
        Ok(())
    }
}

impl Store for SqliteStore {
    fn append_audit(&self, event: AuditEvent) -> StoreResult<()> {
        let conn = self.lock()?;
        let event_json = serde_json::to_string(&event.event)?;

        conn.execute(
            "INSERT INTO audit_log (timestamp, event_json) VALUES (?, ?)",
            params![fmt_dt(&event.timestamp), event_json],
        )?;

        debug!(event_id = conn.last_insert_rowid(), "Audit event appended");
        Ok(())
    }

    fn get_recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare(
            "SELECT id, timestamp, event_json FROM audit_log ORDER BY id DESC LIMIT ?",
        )?;

        let rows = stmt.query_map([limit as i64], |row| {
            let id: i64 = row.get(0)?;
            let timestamp: String = row.get(1)?;
            let event_json: String = row.get(2)?;
            Ok((id, timestamp, event_json))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, timestamp, event_json) = row?;
            events.push(AuditEvent {
                id,
                timestamp: parse_dt(Some(timestamp)).unwrap_or_else(rollcall_util::now),
                event: serde_json::from_str(&event_json)?,
            });
        }

        Ok(events)
    }

    fn load_notification_records(&self) -> StoreResult<Vec<NotificationRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT student_id, camera_stage, camera_last_notified,
                   leave_stage, leave_last_notified, return_stage, return_last_notified
            FROM notification_records ORDER BY student_id
            "#,
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(NotificationRecord {
                student_id: StudentId::new(row.get(0)?),
                camera: counter(row.get(1)?, row.get(2)?),
                leave: counter(row.get(3)?, row.get(4)?),
                return_request: counter(row.get(5)?, row.get(6)?),
            })
        })?;

        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn save_notification_record(&self, record: &NotificationRecord) -> StoreResult<()> {
        let conn = self.lock()?;

        if record.is_empty() {
            conn.execute(
                "DELETE FROM notification_records WHERE student_id = ?",
                [record.student_id.get()],
            )?;
            return Ok(());
        }

        conn.execute(
            r#"
            INSERT INTO notification_records (
                student_id, camera_stage, camera_last_notified,
                leave_stage, leave_last_notified, return_stage, return_last_notified
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(student_id) DO UPDATE SET
                camera_stage = excluded.camera_stage,
                camera_last_notified = excluded.camera_last_notified,
                leave_stage = excluded.leave_stage,
                leave_last_notified = excluded.leave_last_notified,
                return_stage = excluded.return_stage,
                return_last_notified = excluded.return_last_notified
            "#,
            params![
                record.student_id.get(),
                record.camera.stage_count,
                record.camera.last_notified_at.as_ref().map(fmt_dt),
                record.leave.stage_count,
                record.leave.last_notified_at.as_ref().map(fmt_dt),
                record.return_request.stage_count,
                record.return_request.last_notified_at.as_ref().map(fmt_dt),
            ],
        )?;

        debug!(student_id = %record.student_id, camera_stage = record.camera.stage_count, "Notification record saved");
        Ok(())
    }

    fn clear_notification_records(&self) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM notification_records", [])?;
        Ok(())
    }

    fn load_absences(&self) -> StoreResult<Vec<StoredAbsences>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT student_id, active_json, pending_json FROM absences ORDER BY student_id",
        )?;
        let rows = stmt.query_map([], |row| {
            let id: i64 = row.get(0)?;
            let active: Option<String> = row.get(1)?;
            let pending: String = row.get(2)?;
            Ok((id, active, pending))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (id, active, pending) = row?;
            result.push(StoredAbsences {
                student_id: StudentId::new(id),
                active: active.map(|json| serde_json::from_str(&json)).transpose()?,
                pending: serde_json::from_str(&pending)?,
            });
        }
        Ok(result)
    }

    fn save_absences(&self, absences: &StoredAbsences) -> StoreResult<()> {
        let conn = self.lock()?;

        if absences.is_empty() {
            conn.execute(
                "DELETE FROM absences WHERE student_id = ?",
                [absences.student_id.get()],
            )?;
            return Ok(());
        }

        let active = absences
            .active
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let pending = serde_json::to_string(&absences.pending)?;

        conn.execute(
            r#"
            INSERT INTO absences (student_id, active_json, pending_json)
            VALUES (?, ?, ?)
            ON CONFLICT(student_id) DO UPDATE SET
                active_json = excluded.active_json,
                pending_json = excluded.pending_json
            "#,
            params![absences.student_id.get(), active, pending],
        )?;
        Ok(())
    }

    fn last_reset_at(&self) -> StoreResult<Option<DateTime<Local>>> {
        let conn = self.lock()?;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM service_meta WHERE key = ?",
                [META_LAST_RESET],
                |row| row.get(0),
            )
            .optional()?;
        Ok(parse_dt(value))
    }

    fn set_last_reset_at(&self, at: DateTime<Local>) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO service_meta (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
            params![META_LAST_RESET, fmt_dt(&at)],
        )?;
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        match self.conn.lock() {
            Ok(conn) => conn.query_row("SELECT 1", [], |_| Ok(())).is_ok(),
            Err(_) => {
                warn!("Store lock poisoned");
                false
            }
        }
    }
}

impl Registry for SqliteStore {
    fn list_students(&self) -> StoreResult<Vec<StudentRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, display_name, contact_id, is_admin FROM students ORDER BY id",
        )?;
        let rows = stmt.query_map([], student_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn get_student(&self, id: StudentId) -> StoreResult<Option<StudentRecord>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT id, display_name, contact_id, is_admin FROM students WHERE id = ?",
                [id.get()],
                student_from_row,
            )
            .optional()?)
    }

    fn find_by_display_name(&self, name: &str) -> StoreResult<Option<StudentRecord>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT id, display_name, contact_id, is_admin FROM students WHERE display_name = ?",
                [name],
                student_from_row,
            )
            .optional()?)
    }

    fn create_student(
        &self,
        display_name: &str,
        contact_id: Option<&str>,
        is_admin: bool,
    ) -> StoreResult<StudentRecord> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT INTO students (display_name, contact_id, is_admin) VALUES (?, ?, ?)",
            params![display_name, contact_id, is_admin as i64],
        );

        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(StoreError::DuplicateName(display_name.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        let record = StudentRecord {
            id: StudentId::new(conn.last_insert_rowid()),
            display_name: display_name.to_string(),
            contact_id: contact_id.map(str::to_string),
            is_admin,
        };
        debug!(student_id = %record.id, name = %record.display_name, "Student registered");
        Ok(record)
    }

    fn update_student(&self, record: &StudentRecord) -> StoreResult<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE students SET display_name = ?, contact_id = ?, is_admin = ? WHERE id = ?",
            params![
                record.display_name,
                record.contact_id,
                record.is_admin as i64,
                record.id.get()
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("student {}", record.id)));
        }
        Ok(())
    }

    fn delete_student(&self, id: StudentId) -> StoreResult<()> {
        let conn = self.lock()?;
        let is_admin: Option<i64> = conn
            .query_row("SELECT is_admin FROM students WHERE id = ?", [id.get()], |row| {
                row.get(0)
            })
            .optional()?;

        match is_admin {
            None => Err(StoreError::NotFound(format!("student {}", id))),
            Some(flag) if flag != 0 => Err(StoreError::AdminProtected(id)),
            Some(_) => {
                conn.execute("DELETE FROM students WHERE id = ?", [id.get()])?;
                conn.execute("DELETE FROM notification_records WHERE student_id = ?", [id.get()])?;
                conn.execute("DELETE FROM absences WHERE student_id = ?", [id.get()])?;
                Ok(())
            }
        }
    }
}
