//! # Storage Traits
//!
//! Storage abstraction traits that keep the domain layer independent of the
//! concrete backend. Each aggregate gets its own trait.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    ChatIdentity, CreateLogOutcome, LedgerAccount, Lesson, NotificationKind, NotificationLog,
    NotificationStatus, PaymentEvent, TeacherSettings,
};

/// Interface for lesson persistence.
#[async_trait]
pub trait LessonStorage: Send + Sync {
    /// Store a new lesson
    async fn store_lesson(&self, lesson: &Lesson) -> Result<()>;

    /// Store a batch of lessons (a freshly generated series)
    async fn store_lessons(&self, lessons: &[Lesson]) -> Result<()>;

    /// Retrieve a lesson by ID
    async fn get_lesson(&self, lesson_id: &str) -> Result<Option<Lesson>>;

    /// List lessons whose start instant falls inside [start, end],
    /// ordered by start ascending
    async fn list_lessons_in_range(
        &self,
        teacher_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Lesson>>;

    /// All occurrences of a series, ordered by start ascending
    async fn list_lessons_for_series(&self, series_id: &str) -> Result<Vec<Lesson>>;

    /// All lessons a student participates in, ordered by start ascending
    async fn list_lessons_for_student(
        &self,
        teacher_id: &str,
        student_id: &str,
    ) -> Result<Vec<Lesson>>;

    /// Scheduled lessons whose scheduled end is at or before `now`
    async fn list_due_lessons(
        &self,
        teacher_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Lesson>>;

    /// Distinct ids of students with an unpaid participation in any
    /// non-canceled lesson of the teacher, ordered by student id
    async fn list_unpaid_student_ids(&self, teacher_id: &str) -> Result<Vec<String>>;

    /// Update an existing lesson (including its participant rows)
    async fn update_lesson(&self, lesson: &Lesson) -> Result<()>;

    /// Delete a single lesson; returns true if it existed
    async fn delete_lesson(&self, lesson_id: &str) -> Result<bool>;

    /// Delete the SCHEDULED occurrences of a series starting at or after
    /// `start_from`; completed or canceled occurrences are preserved.
    /// Returns the ids actually deleted.
    async fn delete_series_from(
        &self,
        series_id: &str,
        start_from: DateTime<Utc>,
    ) -> Result<Vec<String>>;
}

/// Interface for ledger accounts and their append-only payment events.
#[async_trait]
pub trait LedgerStorage: Send + Sync {
    /// Store a new account
    async fn store_account(&self, account: &LedgerAccount) -> Result<()>;

    /// Look up the account for a teacher-student pair
    async fn get_account(
        &self,
        teacher_id: &str,
        student_id: &str,
    ) -> Result<Option<LedgerAccount>>;

    /// Retrieve an account by ID
    async fn get_account_by_id(&self, account_id: &str) -> Result<Option<LedgerAccount>>;

    /// Append one payment event and set the account balance in a single
    /// storage transaction. Balances only ever move together with an
    /// appended event (here or in `apply_payment_toggle`).
    async fn apply_event(
        &self,
        event: &PaymentEvent,
        new_balance: i64,
        updated_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Flip a participant's paid flag and apply the matching payment event
    /// in one storage transaction: either the flag, the event and the
    /// balance all land, or none of them do.
    async fn apply_payment_toggle(
        &self,
        event: &PaymentEvent,
        new_balance: i64,
        updated_at: DateTime<Utc>,
        lesson_id: &str,
        is_paid: bool,
    ) -> Result<()>;

    /// All accounts belonging to a teacher, ordered by student id
    async fn list_accounts(&self, teacher_id: &str) -> Result<Vec<LedgerAccount>>;

    /// All events for an account in creation order (oldest first)
    async fn list_events(&self, account_id: &str) -> Result<Vec<PaymentEvent>>;

    /// Update reminder preference flags and pricing
    async fn update_account_settings(&self, account: &LedgerAccount) -> Result<()>;
}

/// Interface for notification log persistence.
///
/// The unique constraint on `dedupe_key` must be enforced by the store
/// itself: concurrent inserts race at the storage layer, the first writer
/// wins, and losers are reported as already scheduled.
#[async_trait]
pub trait NotificationStorage: Send + Sync {
    /// Insert a log row; a dedupe-key collision is reported as
    /// `AlreadyScheduled`, not as an error
    async fn insert_log(&self, log: &NotificationLog) -> Result<CreateLogOutcome>;

    /// Finalize a pending row to Sent or Failed
    async fn finalize_log(
        &self,
        log_id: &str,
        status: NotificationStatus,
        sent_at: Option<DateTime<Utc>>,
        error_text: Option<String>,
    ) -> Result<()>;

    /// Retrieve a log row by ID
    async fn get_log(&self, log_id: &str) -> Result<Option<NotificationLog>>;

    /// Most recent SENT log of a kind for a teacher-student pair
    async fn last_sent(
        &self,
        teacher_id: &str,
        student_id: &str,
        kind: NotificationKind,
    ) -> Result<Option<NotificationLog>>;
}

/// Interface for registered chat identities.
#[async_trait]
pub trait IdentityStorage: Send + Sync {
    /// Store a newly registered identity
    async fn store_identity(&self, identity: &ChatIdentity) -> Result<()>;

    /// Look up an identity by normalized handle
    async fn find_by_handle(&self, handle: &str) -> Result<Option<ChatIdentity>>;

    /// Look up the identity already matched to a student
    async fn find_by_student(&self, student_id: &str) -> Result<Option<ChatIdentity>>;

    /// Update an identity (activation state, student match)
    async fn update_identity(&self, identity: &ChatIdentity) -> Result<()>;
}

/// Interface for per-teacher settings.
#[async_trait]
pub trait TeacherStorage: Send + Sync {
    /// Store or replace a teacher's settings
    async fn store_settings(&self, settings: &TeacherSettings) -> Result<()>;

    /// Retrieve a teacher's settings
    async fn get_settings(&self, teacher_id: &str) -> Result<Option<TeacherSettings>>;
}
