//! Domain-level command types.
//!
//! These structs are consumed by the services in this layer and are not a
//! public wire format; the host maps its own request DTOs onto them.

pub mod lessons {
    use chrono::{DateTime, NaiveDate, Utc};
    use shared::{ApplyScope, Participant};

    /// Input for creating a single lesson.
    #[derive(Debug, Clone)]
    pub struct CreateLessonCommand {
        pub teacher_id: String,
        pub start_at: DateTime<Utc>,
        pub duration_minutes: u32,
        pub participants: Vec<Participant>,
        pub meeting_link: Option<String>,
        pub color: Option<String>,
    }

    /// Input for creating a recurring series.
    #[derive(Debug, Clone)]
    pub struct CreateRecurringCommand {
        pub teacher_id: String,
        pub start_at: DateTime<Utc>,
        pub duration_minutes: u32,
        /// Weekday pattern, 0 = Sunday .. 6 = Saturday
        pub weekdays: Vec<u8>,
        /// Last date (inclusive) to generate occurrences for
        pub until: NaiveDate,
        pub participants: Vec<Participant>,
        pub meeting_link: Option<String>,
        pub color: Option<String>,
    }

    /// Input for editing an existing lesson.
    #[derive(Debug, Clone)]
    pub struct SaveLessonCommand {
        pub lesson_id: String,
        pub start_at: DateTime<Utc>,
        pub duration_minutes: u32,
        pub participants: Vec<Participant>,
        pub meeting_link: Option<String>,
        pub color: Option<String>,
        /// Replacement pattern, applied when the edit targets the whole
        /// series; an empty set keeps the stored pattern
        pub weekdays: Vec<u8>,
        pub until: Option<NaiveDate>,
        pub scope: ApplyScope,
    }

    /// Input for deleting a lesson or series tail.
    #[derive(Debug, Clone)]
    pub struct DeleteLessonCommand {
        pub lesson_id: String,
        pub scope: ApplyScope,
    }
}

pub mod ledger {
    use chrono::{DateTime, Utc};
    use shared::{CancelPaymentDecision, ChargeDecision, PaymentEventType};

    /// Input for marking a participant paid or unpaid.
    #[derive(Debug, Clone)]
    pub struct TogglePaidCommand {
        pub lesson_id: String,
        pub student_id: String,
        /// Used when flipping unpaid -> paid with credits available
        pub charge: ChargeDecision,
        /// Used when flipping paid -> unpaid
        pub cancel: CancelPaymentDecision,
    }

    /// Input for a manual balance adjustment.
    #[derive(Debug, Clone)]
    pub struct AdjustBalanceCommand {
        pub teacher_id: String,
        pub student_id: String,
        /// Signed movement in lesson credits
        pub delta: i64,
        pub event_type: PaymentEventType,
        pub amount: Option<f64>,
        pub comment: Option<String>,
        /// Backdate override; defaults to now
        pub created_at: Option<DateTime<Utc>>,
    }
}

pub mod notifications {
    use chrono::{DateTime, Utc};

    /// Input for the teacher's own lesson reminder.
    #[derive(Debug, Clone)]
    pub struct TeacherLessonReminderCommand {
        pub lesson_id: String,
        /// Minutes between the reminder and the lesson start; part of the
        /// dedupe key, so one reminder per lead time
        pub lead_minutes: i64,
    }

    /// Input for a student's lesson reminder.
    #[derive(Debug, Clone)]
    pub struct StudentLessonReminderCommand {
        pub lesson_id: String,
        pub student_id: String,
        /// Raw handle to resolve against registered chat identities when
        /// the student has not been matched yet
        pub student_handle: Option<String>,
        pub lead_minutes: i64,
    }

    /// Input for the teacher's unpaid-lessons digest.
    #[derive(Debug, Clone)]
    pub struct UnpaidDigestCommand {
        pub teacher_id: String,
        pub scheduled_for: Option<DateTime<Utc>>,
    }

    /// Input for a student payment reminder.
    #[derive(Debug, Clone)]
    pub struct PaymentReminderCommand {
        pub teacher_id: String,
        pub student_id: String,
        pub student_handle: Option<String>,
        /// True when a human explicitly asked to send now
        pub manual: bool,
        /// Bypass the manual-resend cooldown
        pub force: bool,
    }
}
