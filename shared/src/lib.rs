use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a lesson. Completion and cancellation are terminal;
/// payment state stays independent and can change afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LessonStatus {
    Scheduled,
    Completed,
    Canceled,
}

impl LessonStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LessonStatus::Scheduled => "SCHEDULED",
            LessonStatus::Completed => "COMPLETED",
            LessonStatus::Canceled => "CANCELED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SCHEDULED" => Some(LessonStatus::Scheduled),
            "COMPLETED" => Some(LessonStatus::Completed),
            "CANCELED" => Some(LessonStatus::Canceled),
            _ => None,
        }
    }
}

/// One student attached to a lesson, with per-lesson payment state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub student_id: String,
    /// Whether this participant has paid for this lesson
    pub is_paid: bool,
    /// Price captured when the lesson was created (may differ from the
    /// account's current price_per_lesson)
    pub price_snapshot: Option<f64>,
}

/// A single lesson occurrence.
///
/// Lesson ID in format: "lesson::<uuid>". Lessons created as a recurring
/// batch share a `series_id` ("series::<uuid>"); a standalone lesson has
/// `series_id = None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lesson {
    pub id: String,
    /// ID of the teacher this lesson belongs to
    pub teacher_id: String,
    /// Recurrence group; None for standalone or detached lessons
    pub series_id: Option<String>,
    /// Absolute start instant (UTC)
    pub start_at: DateTime<Utc>,
    pub duration_minutes: u32,
    pub status: LessonStatus,
    pub participants: Vec<Participant>,
    pub meeting_link: Option<String>,
    /// Display color for calendar rendering
    pub color: Option<String>,
    /// Whether this lesson was created as part of a recurring series
    pub is_recurring: bool,
    /// Weekday pattern for the series (0 = Sunday .. 6 = Saturday)
    pub weekdays: Vec<u8>,
    /// Last date (inclusive, in the teacher's zone) the series runs until
    pub until: Option<NaiveDate>,
}

impl Lesson {
    pub fn generate_id() -> String {
        format!("lesson::{}", uuid::Uuid::new_v4())
    }

    pub fn generate_series_id() -> String {
        format!("series::{}", uuid::Uuid::new_v4())
    }

    /// Scheduled end instant (start + duration).
    pub fn end_at(&self) -> DateTime<Utc> {
        self.start_at + Duration::minutes(self.duration_minutes as i64)
    }

    /// Whether `day` (0-6, Sunday-based) is a valid weekday number.
    pub fn is_valid_weekday(day: u8) -> bool {
        day <= 6
    }
}

/// Per teacher-student credit balance and pricing record.
///
/// `balance_lessons` is a signed count of prepaid lesson credits; negative
/// means the student owes lessons. It only ever changes through a
/// `PaymentEvent` (never by direct field writes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerAccount {
    pub id: String,
    pub teacher_id: String,
    pub student_id: String,
    pub balance_lessons: i64,
    pub price_per_lesson: Option<f64>,
    /// Whether lesson reminders may be sent for this student
    pub remind_lessons: bool,
    /// Whether payment reminders may be sent for this student
    pub remind_payments: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LedgerAccount {
    pub fn generate_id() -> String {
        format!("account::{}", uuid::Uuid::new_v4())
    }
}

/// Kind of ledger movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentEventType {
    /// Credits purchased up front
    TopUp,
    /// Lesson marked paid without touching the balance
    ManualPaid,
    /// Recurring subscription purchase
    Subscription,
    Other,
    /// Manual correction; all negative deltas are recorded as this
    Adjustment,
    /// One credit consumed when a lesson was marked paid
    AutoCharge,
}

impl PaymentEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentEventType::TopUp => "TOP_UP",
            PaymentEventType::ManualPaid => "MANUAL_PAID",
            PaymentEventType::Subscription => "SUBSCRIPTION",
            PaymentEventType::Other => "OTHER",
            PaymentEventType::Adjustment => "ADJUSTMENT",
            PaymentEventType::AutoCharge => "AUTO_CHARGE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TOP_UP" => Some(PaymentEventType::TopUp),
            "MANUAL_PAID" => Some(PaymentEventType::ManualPaid),
            "SUBSCRIPTION" => Some(PaymentEventType::Subscription),
            "OTHER" => Some(PaymentEventType::Other),
            "ADJUSTMENT" => Some(PaymentEventType::Adjustment),
            "AUTO_CHARGE" => Some(PaymentEventType::AutoCharge),
            _ => None,
        }
    }
}

/// One append-only ledger movement. Replaying all events for an account in
/// creation order and summing `delta` must reproduce `balance_lessons`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentEvent {
    pub id: String,
    pub account_id: String,
    pub student_id: String,
    /// Lesson this movement is tied to, when applicable
    pub lesson_id: Option<String>,
    pub event_type: PaymentEventType,
    /// Signed movement in lesson credits
    pub delta: i64,
    /// Money amount, when the movement represents a purchase
    pub amount: Option<f64>,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PaymentEvent {
    pub fn generate_id() -> String {
        format!("event::{}", uuid::Uuid::new_v4())
    }
}

/// Delivery status of a notification attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationStatus {
    Pending,
    Sent,
    Failed,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "PENDING",
            NotificationStatus::Sent => "SENT",
            NotificationStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(NotificationStatus::Pending),
            "SENT" => Some(NotificationStatus::Sent),
            "FAILED" => Some(NotificationStatus::Failed),
            _ => None,
        }
    }
}

/// Kind of reminder being dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    TeacherLessonReminder,
    StudentLessonReminder,
    TeacherUnpaidDigest,
    StudentPaymentReminder,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::TeacherLessonReminder => "TEACHER_LESSON_REMINDER",
            NotificationKind::StudentLessonReminder => "STUDENT_LESSON_REMINDER",
            NotificationKind::TeacherUnpaidDigest => "TEACHER_UNPAID_DIGEST",
            NotificationKind::StudentPaymentReminder => "STUDENT_PAYMENT_REMINDER",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TEACHER_LESSON_REMINDER" => Some(NotificationKind::TeacherLessonReminder),
            "STUDENT_LESSON_REMINDER" => Some(NotificationKind::StudentLessonReminder),
            "TEACHER_UNPAID_DIGEST" => Some(NotificationKind::TeacherUnpaidDigest),
            "STUDENT_PAYMENT_REMINDER" => Some(NotificationKind::StudentPaymentReminder),
            _ => None,
        }
    }
}

/// Record of one notification attempt. Created once per dispatch; the unique
/// `dedupe_key` is the sole deduplication mechanism. Never mutated after
/// being finalized to Sent or Failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationLog {
    pub id: String,
    pub teacher_id: String,
    pub student_id: Option<String>,
    pub lesson_id: Option<String>,
    pub kind: NotificationKind,
    pub status: NotificationStatus,
    pub dedupe_key: String,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub error_text: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NotificationLog {
    pub fn generate_id() -> String {
        format!("notification::{}", uuid::Uuid::new_v4())
    }
}

/// A registered chat identity on the messaging side, matched to a student
/// by normalized handle on first successful lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatIdentity {
    pub id: String,
    /// Normalized handle (lowercase, no leading '@')
    pub handle: String,
    /// Opaque chat id used by the messaging gateway
    pub chat_id: String,
    /// Student this identity has been matched to, once resolved
    pub student_id: Option<String>,
    /// Cleared when the gateway reports the recipient unreachable
    pub is_active: bool,
    pub activated_at: Option<DateTime<Utc>>,
}

impl ChatIdentity {
    pub fn generate_id() -> String {
        format!("identity::{}", uuid::Uuid::new_v4())
    }

    /// Normalize a user-entered handle for lookup: strip a leading '@',
    /// trim whitespace, lowercase.
    pub fn normalize_handle(raw: &str) -> String {
        raw.trim().trim_start_matches('@').to_lowercase()
    }
}

/// How an edit or delete of a series occurrence should be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyScope {
    /// Only this occurrence (detach on edit)
    Single,
    /// The whole series from this occurrence on
    Series,
    /// No choice made yet; the service must ask instead of guessing
    Ask,
}

/// Whether marking a lesson paid should consume a prepaid credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargeDecision {
    UseCredit,
    NoCharge,
    Ask,
}

/// How cancelling a payment treats the credit that was consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelPaymentDecision {
    /// Return the credit to the balance
    Refund,
    /// The credit stays consumed
    WriteOff,
}

/// One unpaid, non-canceled lesson as seen by reminders and balance-due
/// displays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebtItem {
    pub lesson_id: String,
    pub start_at: DateTime<Utc>,
    pub price: f64,
}

/// Projection of everything a student currently owes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebtSummary {
    pub items: Vec<DebtItem>,
    pub lesson_count: usize,
    pub total_amount: f64,
}

/// Per-teacher preferences that gate reminders and lesson auto-completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeacherSettings {
    pub teacher_id: String,
    /// IANA zone name all civil-time math for this teacher uses
    pub zone: String,
    /// Chat id for the teacher's own reminders, once known
    pub chat_id: Option<String>,
    /// Complete past-due lessons automatically
    pub auto_confirm: bool,
    pub remind_lessons: bool,
    pub unpaid_digest: bool,
}

/// Result of saving an edited lesson.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SaveOutcome {
    /// The lessons now current after the save (one for a plain update or
    /// detach, the regenerated batch for a series edit)
    Saved(Vec<Lesson>),
    /// The occurrence belongs to a series and no apply scope was chosen;
    /// nothing was changed
    DecisionRequired { lesson_id: String, series_id: String },
}

/// Result of deleting a lesson.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeleteOutcome {
    /// Ids actually removed
    Deleted(Vec<String>),
    DecisionRequired { lesson_id: String, series_id: String },
}

/// Result of toggling a participant's payment state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TogglePaidOutcome {
    Updated {
        lesson: Lesson,
        account: LedgerAccount,
        event: PaymentEvent,
    },
    /// Credits are available and the caller has not said whether to spend
    /// one; nothing was changed
    DecisionRequired { available_balance: i64 },
}

/// Result of attempting to create a notification log row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CreateLogOutcome {
    Created(NotificationLog),
    /// A row with this dedupe key already exists; the caller must skip
    /// sending. Not an error.
    AlreadyScheduled,
}

/// Why a dispatch was skipped without touching the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    PreferenceDisabled,
    NoChatIdentity,
    IdentityDeactivated,
    AlreadyScheduled,
    /// Nothing unpaid to remind about
    NothingToReport,
}

/// Final result of one dispatch invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DispatchOutcome {
    Sent(NotificationLog),
    /// The send failed; the log records the error text
    Failed(NotificationLog),
    Skipped(SkipReason),
    /// A manual payment reminder collided with one sent inside the cooldown
    /// window; the caller should confirm before forcing a resend
    RecentlySent { last_sent_at: DateTime<Utc> },
}
