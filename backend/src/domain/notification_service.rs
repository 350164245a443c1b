//! Notification dispatch.
//!
//! Every dispatch follows the same shape: check preferences, resolve the
//! recipient, claim a dedupe key by inserting a pending log row, send
//! through the gateway, finalize the row. The unique dedupe key is the only
//! duplicate-suppression mechanism, so two concurrent dispatchers racing on
//! the same reminder resolve at the storage layer. `now` is passed in
//! rather than read from the wall clock so outcomes are reproducible.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use log::{info, warn};

use shared::{
    ChatIdentity, CreateLogOutcome, DebtSummary, DispatchOutcome, LessonStatus, NotificationKind,
    NotificationLog, NotificationStatus, SkipReason, TeacherSettings,
};

use crate::domain::clock;
use crate::domain::commands::notifications::{
    PaymentReminderCommand, StudentLessonReminderCommand, TeacherLessonReminderCommand,
    UnpaidDigestCommand,
};
use crate::domain::ledger_service::LedgerService;
use crate::gateway::MessagingGateway;
use crate::storage::traits::{
    IdentityStorage, LessonStorage, NotificationStorage, TeacherStorage,
};

/// How long a manual payment reminder blocks another one for the same
/// student unless the caller forces it.
const MANUAL_REMINDER_COOLDOWN_HOURS: i64 = 24;

/// Where a dispatch should go, once preferences and identity are settled.
enum Recipient {
    Chat(String, Option<ChatIdentity>),
    Skip(SkipReason),
}

/// Service that composes and sends reminders, with an idempotent log.
#[derive(Clone)]
pub struct NotificationService {
    ledger_service: LedgerService,
    lessons: Arc<dyn LessonStorage>,
    notifications: Arc<dyn NotificationStorage>,
    identities: Arc<dyn IdentityStorage>,
    teachers: Arc<dyn TeacherStorage>,
    gateway: Arc<dyn MessagingGateway>,
}

impl NotificationService {
    pub fn new(
        ledger_service: LedgerService,
        lessons: Arc<dyn LessonStorage>,
        notifications: Arc<dyn NotificationStorage>,
        identities: Arc<dyn IdentityStorage>,
        teachers: Arc<dyn TeacherStorage>,
        gateway: Arc<dyn MessagingGateway>,
    ) -> Self {
        Self {
            ledger_service,
            lessons,
            notifications,
            identities,
            teachers,
            gateway,
        }
    }

    /// Remind the teacher about an upcoming lesson of their own.
    pub async fn send_teacher_lesson_reminder(
        &self,
        cmd: TeacherLessonReminderCommand,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome> {
        let lesson = self
            .lessons
            .get_lesson(&cmd.lesson_id)
            .await?
            .ok_or_else(|| anyhow!("Lesson not found: {}", cmd.lesson_id))?;
        if lesson.status != LessonStatus::Scheduled {
            return Ok(DispatchOutcome::Skipped(SkipReason::NothingToReport));
        }

        let settings = self.require_settings(&lesson.teacher_id).await?;
        if !settings.remind_lessons {
            return Ok(DispatchOutcome::Skipped(SkipReason::PreferenceDisabled));
        }
        let chat_id = match &settings.chat_id {
            Some(chat_id) => chat_id.clone(),
            None => return Ok(DispatchOutcome::Skipped(SkipReason::NoChatIdentity)),
        };

        let zone = parse_zone(&settings.zone)?;
        let dedupe_key = format!(
            "lesson-reminder::teacher::{}::{}",
            lesson.id, cmd.lead_minutes
        );
        let log = self.new_log(
            &lesson.teacher_id,
            None,
            Some(lesson.id.clone()),
            NotificationKind::TeacherLessonReminder,
            dedupe_key,
            Some(lesson.start_at - Duration::minutes(cmd.lead_minutes)),
            now,
        );
        let log = match self.notifications.insert_log(&log).await? {
            CreateLogOutcome::Created(log) => log,
            CreateLogOutcome::AlreadyScheduled => {
                return Ok(DispatchOutcome::Skipped(SkipReason::AlreadyScheduled));
            }
        };

        let (date, time) = clock::to_local(lesson.start_at, zone);
        let text = format!(
            "Upcoming lesson {}: {} at {} ({} min, {} student{})",
            lead_label(cmd.lead_minutes),
            day_label(date, local_date(now, zone)),
            time.format("%H:%M"),
            lesson.duration_minutes,
            lesson.participants.len(),
            if lesson.participants.len() == 1 { "" } else { "s" },
        );
        Ok(self.deliver(log, &chat_id, &text, None, now).await?)
    }

    /// Remind a student about an upcoming lesson they participate in.
    pub async fn send_student_lesson_reminder(
        &self,
        cmd: StudentLessonReminderCommand,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome> {
        let lesson = self
            .lessons
            .get_lesson(&cmd.lesson_id)
            .await?
            .ok_or_else(|| anyhow!("Lesson not found: {}", cmd.lesson_id))?;
        if lesson.status != LessonStatus::Scheduled {
            return Ok(DispatchOutcome::Skipped(SkipReason::NothingToReport));
        }

        let account = self
            .ledger_service
            .get_or_create_account(&lesson.teacher_id, &cmd.student_id)
            .await?;
        if !account.remind_lessons {
            return Ok(DispatchOutcome::Skipped(SkipReason::PreferenceDisabled));
        }

        let (chat_id, identity) = match self
            .resolve_identity(&cmd.student_id, cmd.student_handle.as_deref(), now)
            .await?
        {
            Recipient::Chat(chat_id, identity) => (chat_id, identity),
            Recipient::Skip(reason) => return Ok(DispatchOutcome::Skipped(reason)),
        };

        let settings = self.require_settings(&lesson.teacher_id).await?;
        let zone = parse_zone(&settings.zone)?;

        let dedupe_key = format!(
            "lesson-reminder::student::{}::{}::{}",
            lesson.id, cmd.student_id, cmd.lead_minutes
        );
        let log = self.new_log(
            &lesson.teacher_id,
            Some(cmd.student_id.clone()),
            Some(lesson.id.clone()),
            NotificationKind::StudentLessonReminder,
            dedupe_key,
            Some(lesson.start_at - Duration::minutes(cmd.lead_minutes)),
            now,
        );
        let log = match self.notifications.insert_log(&log).await? {
            CreateLogOutcome::Created(log) => log,
            CreateLogOutcome::AlreadyScheduled => {
                return Ok(DispatchOutcome::Skipped(SkipReason::AlreadyScheduled));
            }
        };

        let (date, time) = clock::to_local(lesson.start_at, zone);
        let mut text = format!(
            "Reminder: your lesson is {} at {} ({})",
            day_label(date, local_date(now, zone)),
            time.format("%H:%M"),
            lead_label(cmd.lead_minutes),
        );
        if let Some(link) = &lesson.meeting_link {
            text.push_str(&format!("\nJoin: {}", link));
        }
        Ok(self.deliver(log, &chat_id, &text, identity, now).await?)
    }

    /// Send the teacher a digest of every student's unpaid lessons. One per
    /// teacher per local day.
    pub async fn send_unpaid_digest(
        &self,
        cmd: UnpaidDigestCommand,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome> {
        let settings = self.require_settings(&cmd.teacher_id).await?;
        if !settings.unpaid_digest {
            return Ok(DispatchOutcome::Skipped(SkipReason::PreferenceDisabled));
        }
        let chat_id = match &settings.chat_id {
            Some(chat_id) => chat_id.clone(),
            None => return Ok(DispatchOutcome::Skipped(SkipReason::NoChatIdentity)),
        };
        let zone = parse_zone(&settings.zone)?;

        // Debtors come from the lessons themselves, so a student whose
        // ledger account was never created still shows up
        let mut lines = Vec::new();
        for student_id in self.lessons.list_unpaid_student_ids(&cmd.teacher_id).await? {
            let debt = self
                .ledger_service
                .list_debt(&cmd.teacher_id, &student_id)
                .await?;
            if debt.lesson_count > 0 {
                lines.push(format!(
                    "{}: {} lesson{}, {}",
                    student_id,
                    debt.lesson_count,
                    if debt.lesson_count == 1 { "" } else { "s" },
                    debt.total_amount,
                ));
            }
        }
        if lines.is_empty() {
            return Ok(DispatchOutcome::Skipped(SkipReason::NothingToReport));
        }

        let dedupe_key = format!(
            "unpaid-digest::{}::{}",
            cmd.teacher_id,
            local_date(now, zone)
        );
        let log = self.new_log(
            &cmd.teacher_id,
            None,
            None,
            NotificationKind::TeacherUnpaidDigest,
            dedupe_key,
            cmd.scheduled_for,
            now,
        );
        let log = match self.notifications.insert_log(&log).await? {
            CreateLogOutcome::Created(log) => log,
            CreateLogOutcome::AlreadyScheduled => {
                return Ok(DispatchOutcome::Skipped(SkipReason::AlreadyScheduled));
            }
        };

        let text = format!("Unpaid lessons:\n{}", lines.join("\n"));
        Ok(self.deliver(log, &chat_id, &text, None, now).await?)
    }

    /// Remind a student about their unpaid lessons.
    ///
    /// Automatic reminders respect the per-student preference and are
    /// deduplicated per local day. Manual reminders bypass the preference
    /// but sit behind a resend cooldown; `force` overrides the cooldown
    /// after the caller has confirmed.
    pub async fn send_payment_reminder(
        &self,
        cmd: PaymentReminderCommand,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome> {
        let account = self
            .ledger_service
            .get_or_create_account(&cmd.teacher_id, &cmd.student_id)
            .await?;
        if !cmd.manual && !account.remind_payments {
            return Ok(DispatchOutcome::Skipped(SkipReason::PreferenceDisabled));
        }

        let debt = self
            .ledger_service
            .list_debt(&cmd.teacher_id, &cmd.student_id)
            .await?;
        if debt.lesson_count == 0 {
            return Ok(DispatchOutcome::Skipped(SkipReason::NothingToReport));
        }

        let (chat_id, identity) = match self
            .resolve_identity(&cmd.student_id, cmd.student_handle.as_deref(), now)
            .await?
        {
            Recipient::Chat(chat_id, identity) => (chat_id, identity),
            Recipient::Skip(reason) => return Ok(DispatchOutcome::Skipped(reason)),
        };

        if cmd.manual && !cmd.force {
            if let Some(previous) = self
                .notifications
                .last_sent(
                    &cmd.teacher_id,
                    &cmd.student_id,
                    NotificationKind::StudentPaymentReminder,
                )
                .await?
            {
                if let Some(last_sent_at) = previous.sent_at {
                    if now - last_sent_at < Duration::hours(MANUAL_REMINDER_COOLDOWN_HOURS) {
                        return Ok(DispatchOutcome::RecentlySent { last_sent_at });
                    }
                }
            }
        }

        let settings = self.teachers.get_settings(&cmd.teacher_id).await?;
        let zone = match settings {
            Some(settings) => parse_zone(&settings.zone)?,
            None => chrono_tz::UTC,
        };
        // Manual sends are keyed by the moment of the request so they never
        // collide with that day's automatic reminder; the cooldown above is
        // what rate-limits them.
        let dedupe_key = if cmd.manual {
            format!(
                "payment-reminder::{}::manual::{}",
                account.id,
                now.timestamp_millis()
            )
        } else {
            format!("payment-reminder::{}::{}", account.id, local_date(now, zone))
        };
        let log = self.new_log(
            &cmd.teacher_id,
            Some(cmd.student_id.clone()),
            None,
            NotificationKind::StudentPaymentReminder,
            dedupe_key,
            None,
            now,
        );
        let log = match self.notifications.insert_log(&log).await? {
            CreateLogOutcome::Created(log) => log,
            CreateLogOutcome::AlreadyScheduled => {
                return Ok(DispatchOutcome::Skipped(SkipReason::AlreadyScheduled));
            }
        };

        let text = compose_payment_text(&debt);
        Ok(self.deliver(log, &chat_id, &text, identity, now).await?)
    }

    /// Pick the chat to send a student notification to.
    ///
    /// A previously matched identity wins. Otherwise the handle is looked
    /// up among registered identities and, on a hit, permanently matched to
    /// the student.
    async fn resolve_identity(
        &self,
        student_id: &str,
        handle: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Recipient> {
        if let Some(identity) = self.identities.find_by_student(student_id).await? {
            if !identity.is_active {
                return Ok(Recipient::Skip(SkipReason::IdentityDeactivated));
            }
            let chat_id = identity.chat_id.clone();
            return Ok(Recipient::Chat(chat_id, Some(identity)));
        }

        let handle = match handle {
            Some(handle) => ChatIdentity::normalize_handle(handle),
            None => return Ok(Recipient::Skip(SkipReason::NoChatIdentity)),
        };
        let mut identity = match self.identities.find_by_handle(&handle).await? {
            Some(identity) => identity,
            None => return Ok(Recipient::Skip(SkipReason::NoChatIdentity)),
        };
        if !identity.is_active {
            return Ok(Recipient::Skip(SkipReason::IdentityDeactivated));
        }

        identity.student_id = Some(student_id.to_string());
        if identity.activated_at.is_none() {
            identity.activated_at = Some(now);
        }
        self.identities.update_identity(&identity).await?;
        info!("Matched identity {} to student {}", identity.id, student_id);
        let chat_id = identity.chat_id.clone();
        Ok(Recipient::Chat(chat_id, Some(identity)))
    }

    /// Send and finalize. A permanent gateway failure deactivates the
    /// recipient's identity so later dispatches skip it.
    async fn deliver(
        &self,
        mut log: NotificationLog,
        chat_id: &str,
        text: &str,
        identity: Option<ChatIdentity>,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome> {
        match self.gateway.send(chat_id, text).await {
            Ok(_receipt) => {
                self.notifications
                    .finalize_log(&log.id, NotificationStatus::Sent, Some(now), None)
                    .await?;
                log.status = NotificationStatus::Sent;
                log.sent_at = Some(now);
                info!("Sent {} ({})", log.id, log.kind.as_str());
                Ok(DispatchOutcome::Sent(log))
            }
            Err(err) => {
                let error_text = err.to_string();
                self.notifications
                    .finalize_log(
                        &log.id,
                        NotificationStatus::Failed,
                        None,
                        Some(error_text.clone()),
                    )
                    .await?;
                log.status = NotificationStatus::Failed;
                log.error_text = Some(error_text);
                warn!("Send of {} failed: {}", log.id, err);

                if err.is_permanent() {
                    if let Some(mut identity) = identity {
                        identity.is_active = false;
                        self.identities.update_identity(&identity).await?;
                        warn!("Deactivated unreachable identity {}", identity.id);
                    }
                }
                Ok(DispatchOutcome::Failed(log))
            }
        }
    }

    fn new_log(
        &self,
        teacher_id: &str,
        student_id: Option<String>,
        lesson_id: Option<String>,
        kind: NotificationKind,
        dedupe_key: String,
        scheduled_for: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> NotificationLog {
        NotificationLog {
            id: NotificationLog::generate_id(),
            teacher_id: teacher_id.to_string(),
            student_id,
            lesson_id,
            kind,
            status: NotificationStatus::Pending,
            dedupe_key,
            scheduled_for,
            sent_at: None,
            error_text: None,
            created_at: now,
        }
    }

    async fn require_settings(&self, teacher_id: &str) -> Result<TeacherSettings> {
        self.teachers
            .get_settings(teacher_id)
            .await?
            .ok_or_else(|| anyhow!("No settings for teacher {}", teacher_id))
    }
}

fn parse_zone(zone: &str) -> Result<Tz> {
    zone.parse::<Tz>()
        .map_err(|e| anyhow!("Invalid zone {}: {}", zone, e))
}

fn local_date(now: DateTime<Utc>, zone: Tz) -> NaiveDate {
    clock::to_local(now, zone).0
}

/// "in 30 minutes" / "in 2 hours".
fn lead_label(minutes: i64) -> String {
    if minutes >= 60 && minutes % 60 == 0 {
        let hours = minutes / 60;
        format!("in {} hour{}", hours, if hours == 1 { "" } else { "s" })
    } else {
        format!("in {} minutes", minutes)
    }
}

/// "today", "tomorrow", or the civil date.
fn day_label(date: NaiveDate, today: NaiveDate) -> String {
    if date == today {
        "today".to_string()
    } else if date == today + Duration::days(1) {
        "tomorrow".to_string()
    } else {
        date.format("%B %-d").to_string()
    }
}

fn compose_payment_text(debt: &DebtSummary) -> String {
    format!(
        "You have {} unpaid lesson{} totaling {}. Please settle the balance.",
        debt.lesson_count,
        if debt.lesson_count == 1 { "" } else { "s" },
        debt.total_amount,
    )
}
