//! Store trait definitions

use chrono::{DateTime, Local};
use rollcall_api::{Absence, NotificationRecord, StudentRecord};
use rollcall_util::StudentId;
use serde::{Deserialize, Serialize};

use crate::{AuditEvent, StoreResult};

/// Durable state that must survive a restart independently of presence
pub trait Store: Send + Sync {
    // Audit log

    fn append_audit(&self, event: AuditEvent) -> StoreResult<()>;

    fn get_recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>>;

    // Notification records

    fn load_notification_records(&self) -> StoreResult<Vec<NotificationRecord>>;

    /// Upsert; an empty record deletes the row
    fn save_notification_record(&self, record: &NotificationRecord) -> StoreResult<()>;

    fn clear_notification_records(&self) -> StoreResult<()>;

    // Absences

    fn load_absences(&self) -> StoreResult<Vec<StoredAbsences>>;

    /// Replace the active and pending absences of one student
    fn save_absences(&self, absences: &StoredAbsences) -> StoreResult<()>;

    // Service metadata

    /// Instant of the last daily reset that was carried out
    fn last_reset_at(&self) -> StoreResult<Option<DateTime<Local>>>;

    fn set_last_reset_at(&self, at: DateTime<Local>) -> StoreResult<()>;

    // Health

    fn is_healthy(&self) -> bool;
}

/// Registry of students known to the monitor
pub trait Registry: Send + Sync {
    fn list_students(&self) -> StoreResult<Vec<StudentRecord>>;

    fn get_student(&self, id: StudentId) -> StoreResult<Option<StudentRecord>>;

    /// Exact display-name lookup
    fn find_by_display_name(&self, name: &str) -> StoreResult<Option<StudentRecord>>;

    fn create_student(
        &self,
        display_name: &str,
        contact_id: Option<&str>,
        is_admin: bool,
    ) -> StoreResult<StudentRecord>;

    fn update_student(&self, record: &StudentRecord) -> StoreResult<()>;

    /// Fails with `AdminProtected` while the student is an admin
    fn delete_student(&self, id: StudentId) -> StoreResult<()>;
}

/// Absences of one student as persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAbsences {
    pub student_id: StudentId,
    pub active: Option<Absence>,
    pub pending: Vec<Absence>,
}

impl StoredAbsences {
    pub fn is_empty(&self) -> bool {
        self.active.is_none() && self.pending.is_empty()
    }
}
