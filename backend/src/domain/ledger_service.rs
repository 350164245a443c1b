//! Payment and credit ledger.
//!
//! Every balance change is an append-only `PaymentEvent`; the account's
//! `balance_lessons` is a cached sum the storage layer updates in the same
//! transaction that records the event. Accounts are created lazily the
//! first time a teacher-student pair needs one.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use log::info;

use shared::{
    CancelPaymentDecision, ChargeDecision, DebtItem, DebtSummary, LedgerAccount, Lesson,
    LessonStatus, PaymentEvent, PaymentEventType, TogglePaidOutcome,
};

use crate::domain::commands::ledger::{AdjustBalanceCommand, TogglePaidCommand};
use crate::storage::traits::{LedgerStorage, LessonStorage, TeacherStorage};

/// Service for lesson completion, payment toggling and balance management.
#[derive(Clone)]
pub struct LedgerService {
    lessons: Arc<dyn LessonStorage>,
    ledger: Arc<dyn LedgerStorage>,
    teachers: Arc<dyn TeacherStorage>,
}

impl LedgerService {
    pub fn new(
        lessons: Arc<dyn LessonStorage>,
        ledger: Arc<dyn LedgerStorage>,
        teachers: Arc<dyn TeacherStorage>,
    ) -> Self {
        Self {
            lessons,
            ledger,
            teachers,
        }
    }

    /// Fetch the account for a teacher-student pair, creating an empty one
    /// on first use.
    pub async fn get_or_create_account(
        &self,
        teacher_id: &str,
        student_id: &str,
    ) -> Result<LedgerAccount> {
        if let Some(account) = self.ledger.get_account(teacher_id, student_id).await? {
            return Ok(account);
        }

        let now = Utc::now();
        let account = LedgerAccount {
            id: LedgerAccount::generate_id(),
            teacher_id: teacher_id.to_string(),
            student_id: student_id.to_string(),
            balance_lessons: 0,
            price_per_lesson: None,
            remind_lessons: true,
            remind_payments: true,
            created_at: now,
            updated_at: now,
        };
        self.ledger.store_account(&account).await?;
        info!("Created ledger account {} for {}", account.id, student_id);
        Ok(account)
    }

    /// Mark a lesson completed. Completion is terminal and independent of
    /// payment state.
    pub async fn complete_lesson(&self, lesson_id: &str) -> Result<Lesson> {
        self.transition(lesson_id, LessonStatus::Completed).await
    }

    /// Mark a lesson canceled. Terminal; canceled lessons never count as
    /// debt.
    pub async fn cancel_lesson(&self, lesson_id: &str) -> Result<Lesson> {
        self.transition(lesson_id, LessonStatus::Canceled).await
    }

    async fn transition(&self, lesson_id: &str, status: LessonStatus) -> Result<Lesson> {
        let mut lesson = self
            .lessons
            .get_lesson(lesson_id)
            .await?
            .ok_or_else(|| anyhow!("Lesson not found: {}", lesson_id))?;
        if lesson.status != LessonStatus::Scheduled {
            return Err(anyhow!(
                "Lesson {} is already {}",
                lesson_id,
                lesson.status.as_str()
            ));
        }
        lesson.status = status;
        self.lessons.update_lesson(&lesson).await?;
        Ok(lesson)
    }

    /// Complete every scheduled lesson of the teacher whose scheduled end
    /// has passed. A no-op unless the teacher opted into auto-completion.
    /// Runs lazily on demand rather than from a timer, so a missed window
    /// is swept on the next call.
    pub async fn auto_complete_due(
        &self,
        teacher_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Lesson>> {
        let auto_confirm = self
            .teachers
            .get_settings(teacher_id)
            .await?
            .map(|s| s.auto_confirm)
            .unwrap_or(false);
        if !auto_confirm {
            return Ok(Vec::new());
        }

        let mut completed = Vec::new();
        for mut lesson in self.lessons.list_due_lessons(teacher_id, now).await? {
            lesson.status = LessonStatus::Completed;
            self.lessons.update_lesson(&lesson).await?;
            completed.push(lesson);
        }
        if !completed.is_empty() {
            info!(
                "Auto-completed {} past-due lessons for {}",
                completed.len(),
                teacher_id
            );
        }
        Ok(completed)
    }

    /// Flip a participant's payment state on a lesson.
    ///
    /// Paying with prepaid credits available requires a charge decision:
    /// `UseCredit` consumes one, `NoCharge` marks paid without touching the
    /// balance, and `Ask` changes nothing and reports the available
    /// balance. With no credits the payment is recorded as manual. Unmarking
    /// a payment either refunds the credit or writes it off; both leave an
    /// audit event.
    pub async fn toggle_paid(&self, cmd: TogglePaidCommand) -> Result<TogglePaidOutcome> {
        let mut lesson = self
            .lessons
            .get_lesson(&cmd.lesson_id)
            .await?
            .ok_or_else(|| anyhow!("Lesson not found: {}", cmd.lesson_id))?;
        let currently_paid = lesson
            .participants
            .iter()
            .find(|p| p.student_id == cmd.student_id)
            .map(|p| p.is_paid)
            .ok_or_else(|| {
                anyhow!(
                    "Student {} is not a participant of lesson {}",
                    cmd.student_id,
                    cmd.lesson_id
                )
            })?;

        let account = self
            .get_or_create_account(&lesson.teacher_id, &cmd.student_id)
            .await?;

        let (event_type, delta) = if !currently_paid {
            if account.balance_lessons > 0 {
                match cmd.charge {
                    ChargeDecision::Ask => {
                        return Ok(TogglePaidOutcome::DecisionRequired {
                            available_balance: account.balance_lessons,
                        });
                    }
                    ChargeDecision::UseCredit => (PaymentEventType::AutoCharge, -1),
                    ChargeDecision::NoCharge => (PaymentEventType::ManualPaid, 0),
                }
            } else {
                (PaymentEventType::ManualPaid, 0)
            }
        } else {
            match cmd.cancel {
                CancelPaymentDecision::Refund => (PaymentEventType::Adjustment, 1),
                CancelPaymentDecision::WriteOff => (PaymentEventType::Adjustment, 0),
            }
        };

        let now = Utc::now();
        let event = PaymentEvent {
            id: PaymentEvent::generate_id(),
            account_id: account.id.clone(),
            student_id: cmd.student_id.clone(),
            lesson_id: Some(lesson.id.clone()),
            event_type,
            delta,
            amount: None,
            comment: None,
            created_at: now,
        };
        let new_balance = account.balance_lessons + delta;

        // Flag, event and balance land in one storage transaction; a
        // failure leaves the lesson untouched
        self.ledger
            .apply_payment_toggle(&event, new_balance, now, &lesson.id, !currently_paid)
            .await?;
        for participant in &mut lesson.participants {
            if participant.student_id == cmd.student_id {
                participant.is_paid = !currently_paid;
            }
        }
        info!(
            "Toggled payment on {} for {}: {} (delta {})",
            lesson.id,
            cmd.student_id,
            event.event_type.as_str(),
            delta
        );

        let account = self
            .ledger
            .get_account_by_id(&account.id)
            .await?
            .ok_or_else(|| anyhow!("Account vanished: {}", account.id))?;
        Ok(TogglePaidOutcome::Updated {
            lesson,
            account,
            event,
        })
    }

    /// Record a manual balance movement (top-up, correction, backdated
    /// purchase). Negative movements are always recorded as adjustments,
    /// whatever type the caller passed.
    pub async fn adjust(
        &self,
        cmd: AdjustBalanceCommand,
    ) -> Result<(LedgerAccount, PaymentEvent)> {
        if cmd.delta == 0 {
            return Err(anyhow!("Balance adjustment must move the balance"));
        }
        let account = self
            .get_or_create_account(&cmd.teacher_id, &cmd.student_id)
            .await?;

        let event_type = if cmd.delta < 0 {
            PaymentEventType::Adjustment
        } else {
            cmd.event_type
        };
        let created_at = cmd.created_at.unwrap_or_else(Utc::now);
        let event = PaymentEvent {
            id: PaymentEvent::generate_id(),
            account_id: account.id.clone(),
            student_id: cmd.student_id.clone(),
            lesson_id: None,
            event_type,
            delta: cmd.delta,
            amount: cmd.amount,
            comment: cmd.comment,
            created_at,
        };
        let new_balance = account.balance_lessons + cmd.delta;
        self.ledger.apply_event(&event, new_balance, Utc::now()).await?;
        info!(
            "Adjusted balance of {} by {} ({})",
            account.id,
            cmd.delta,
            event_type.as_str()
        );

        let account = self
            .ledger
            .get_account_by_id(&account.id)
            .await?
            .ok_or_else(|| anyhow!("Account vanished: {}", account.id))?;
        Ok((account, event))
    }

    /// Everything a student owes: every unpaid participation in a
    /// non-canceled lesson, scheduled or already held, priced by the
    /// lesson's snapshot with the account price as fallback.
    pub async fn list_debt(&self, teacher_id: &str, student_id: &str) -> Result<DebtSummary> {
        let account_price = self
            .ledger
            .get_account(teacher_id, student_id)
            .await?
            .and_then(|a| a.price_per_lesson);

        let mut items = Vec::new();
        for lesson in self
            .lessons
            .list_lessons_for_student(teacher_id, student_id)
            .await?
        {
            if lesson.status == LessonStatus::Canceled {
                continue;
            }
            let unpaid = lesson
                .participants
                .iter()
                .any(|p| p.student_id == student_id && !p.is_paid);
            if !unpaid {
                continue;
            }
            let price = lesson
                .participants
                .iter()
                .find(|p| p.student_id == student_id)
                .and_then(|p| p.price_snapshot)
                .or(account_price)
                .unwrap_or(0.0);
            items.push(DebtItem {
                lesson_id: lesson.id.clone(),
                start_at: lesson.start_at,
                price,
            });
        }

        let total_amount = items.iter().map(|i| i.price).sum();
        Ok(DebtSummary {
            lesson_count: items.len(),
            total_amount,
            items,
        })
    }

    /// Update an account's price and reminder preferences.
    pub async fn update_account_settings(
        &self,
        teacher_id: &str,
        student_id: &str,
        price_per_lesson: Option<f64>,
        remind_lessons: bool,
        remind_payments: bool,
    ) -> Result<LedgerAccount> {
        let mut account = self.get_or_create_account(teacher_id, student_id).await?;
        account.price_per_lesson = price_per_lesson;
        account.remind_lessons = remind_lessons;
        account.remind_payments = remind_payments;
        account.updated_at = Utc::now();
        self.ledger.update_account_settings(&account).await?;
        info!("Updated account settings for {}", account.id);
        Ok(account)
    }

    /// Every account of a teacher, ordered by student.
    pub async fn list_accounts(&self, teacher_id: &str) -> Result<Vec<LedgerAccount>> {
        self.ledger.list_accounts(teacher_id).await
    }

    /// Full movement history of an account, oldest first.
    pub async fn list_events(&self, account_id: &str) -> Result<Vec<PaymentEvent>> {
        self.ledger.list_events(account_id).await
    }

    /// Recompute an account balance from its event history. The result must
    /// equal the cached `balance_lessons`; a mismatch means the balance was
    /// written without appending an event.
    pub async fn replay_balance(&self, account_id: &str) -> Result<i64> {
        let events = self.ledger.list_events(account_id).await?;
        Ok(events.iter().map(|e| e.delta).sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::db::DbConnection;
    use crate::storage::sqlite::repositories::ledger_repository::LedgerRepository;
    use crate::storage::sqlite::repositories::lesson_repository::LessonRepository;
    use crate::storage::sqlite::repositories::teacher_repository::TeacherRepository;
    use shared::{Participant, TeacherSettings};

    struct Fixture {
        service: LedgerService,
        lessons: Arc<LessonRepository>,
        ledger: Arc<LedgerRepository>,
        teachers: Arc<TeacherRepository>,
    }

    async fn create_fixture() -> Fixture {
        let db = DbConnection::init_test().await.unwrap();
        let lessons = Arc::new(LessonRepository::new(db.clone()));
        let ledger = Arc::new(LedgerRepository::new(db.clone()));
        let teachers = Arc::new(TeacherRepository::new(db));
        let service = LedgerService::new(lessons.clone(), ledger.clone(), teachers.clone());
        Fixture {
            service,
            lessons,
            ledger,
            teachers,
        }
    }

    async fn store_lesson(fixture: &Fixture, start: &str, price: Option<f64>) -> Lesson {
        let lesson = Lesson {
            id: Lesson::generate_id(),
            teacher_id: "teacher-1".to_string(),
            series_id: None,
            start_at: start.parse().unwrap(),
            duration_minutes: 60,
            status: LessonStatus::Scheduled,
            participants: vec![Participant {
                student_id: "student-1".to_string(),
                is_paid: false,
                price_snapshot: price,
            }],
            meeting_link: None,
            color: None,
            is_recurring: false,
            weekdays: Vec::new(),
            until: None,
        };
        fixture.lessons.store_lesson(&lesson).await.unwrap();
        lesson
    }

    fn toggle_cmd(lesson: &Lesson, charge: ChargeDecision) -> TogglePaidCommand {
        TogglePaidCommand {
            lesson_id: lesson.id.clone(),
            student_id: "student-1".to_string(),
            charge,
            cancel: CancelPaymentDecision::Refund,
        }
    }

    #[tokio::test]
    async fn test_paying_without_credits_records_manual_payment() {
        let fixture = create_fixture().await;
        let lesson = store_lesson(&fixture, "2024-03-04T15:00:00Z", None).await;

        let outcome = fixture
            .service
            .toggle_paid(toggle_cmd(&lesson, ChargeDecision::Ask))
            .await
            .unwrap();

        match outcome {
            TogglePaidOutcome::Updated {
                lesson,
                account,
                event,
            } => {
                assert!(lesson.participants[0].is_paid);
                assert_eq!(event.event_type, PaymentEventType::ManualPaid);
                assert_eq!(event.delta, 0);
                assert_eq!(account.balance_lessons, 0);
            }
            other => panic!("Expected Updated, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_paying_with_credits_requires_a_decision() {
        let fixture = create_fixture().await;
        let lesson = store_lesson(&fixture, "2024-03-04T15:00:00Z", None).await;
        fixture
            .service
            .adjust(AdjustBalanceCommand {
                teacher_id: "teacher-1".to_string(),
                student_id: "student-1".to_string(),
                delta: 4,
                event_type: PaymentEventType::TopUp,
                amount: Some(4800.0),
                comment: None,
                created_at: None,
            })
            .await
            .unwrap();

        let outcome = fixture
            .service
            .toggle_paid(toggle_cmd(&lesson, ChargeDecision::Ask))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            TogglePaidOutcome::DecisionRequired {
                available_balance: 4
            }
        );
        // Nothing was changed
        let stored = fixture.lessons.get_lesson(&lesson.id).await.unwrap().unwrap();
        assert!(!stored.participants[0].is_paid);
    }

    #[tokio::test]
    async fn test_use_credit_consumes_one_lesson() {
        let fixture = create_fixture().await;
        let lesson = store_lesson(&fixture, "2024-03-04T15:00:00Z", None).await;
        fixture
            .service
            .adjust(AdjustBalanceCommand {
                teacher_id: "teacher-1".to_string(),
                student_id: "student-1".to_string(),
                delta: 2,
                event_type: PaymentEventType::TopUp,
                amount: None,
                comment: None,
                created_at: None,
            })
            .await
            .unwrap();

        let outcome = fixture
            .service
            .toggle_paid(toggle_cmd(&lesson, ChargeDecision::UseCredit))
            .await
            .unwrap();

        match outcome {
            TogglePaidOutcome::Updated { account, event, .. } => {
                assert_eq!(event.event_type, PaymentEventType::AutoCharge);
                assert_eq!(event.delta, -1);
                assert_eq!(account.balance_lessons, 1);
            }
            other => panic!("Expected Updated, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_refund_returns_the_credit() {
        let fixture = create_fixture().await;
        let lesson = store_lesson(&fixture, "2024-03-04T15:00:00Z", None).await;
        fixture
            .service
            .adjust(AdjustBalanceCommand {
                teacher_id: "teacher-1".to_string(),
                student_id: "student-1".to_string(),
                delta: 2,
                event_type: PaymentEventType::TopUp,
                amount: None,
                comment: None,
                created_at: None,
            })
            .await
            .unwrap();

        fixture
            .service
            .toggle_paid(toggle_cmd(&lesson, ChargeDecision::UseCredit))
            .await
            .unwrap();
        // Unmark with refund: the balance returns to where it was
        let outcome = fixture
            .service
            .toggle_paid(TogglePaidCommand {
                lesson_id: lesson.id.clone(),
                student_id: "student-1".to_string(),
                charge: ChargeDecision::Ask,
                cancel: CancelPaymentDecision::Refund,
            })
            .await
            .unwrap();

        match outcome {
            TogglePaidOutcome::Updated {
                lesson,
                account,
                event,
            } => {
                assert!(!lesson.participants[0].is_paid);
                assert_eq!(event.delta, 1);
                assert_eq!(account.balance_lessons, 2);
            }
            other => panic!("Expected Updated, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_write_off_keeps_the_credit_consumed() {
        let fixture = create_fixture().await;
        let lesson = store_lesson(&fixture, "2024-03-04T15:00:00Z", None).await;
        fixture
            .service
            .adjust(AdjustBalanceCommand {
                teacher_id: "teacher-1".to_string(),
                student_id: "student-1".to_string(),
                delta: 1,
                event_type: PaymentEventType::TopUp,
                amount: None,
                comment: None,
                created_at: None,
            })
            .await
            .unwrap();
        fixture
            .service
            .toggle_paid(toggle_cmd(&lesson, ChargeDecision::UseCredit))
            .await
            .unwrap();

        let outcome = fixture
            .service
            .toggle_paid(TogglePaidCommand {
                lesson_id: lesson.id.clone(),
                student_id: "student-1".to_string(),
                charge: ChargeDecision::Ask,
                cancel: CancelPaymentDecision::WriteOff,
            })
            .await
            .unwrap();

        match outcome {
            TogglePaidOutcome::Updated { account, event, .. } => {
                // The write-off is a zero-delta audit event
                assert_eq!(event.delta, 0);
                assert_eq!(account.balance_lessons, 0);
            }
            other => panic!("Expected Updated, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_negative_adjustments_are_recorded_as_adjustment() {
        let fixture = create_fixture().await;
        let (account, event) = fixture
            .service
            .adjust(AdjustBalanceCommand {
                teacher_id: "teacher-1".to_string(),
                student_id: "student-1".to_string(),
                delta: -2,
                event_type: PaymentEventType::TopUp,
                amount: None,
                comment: Some("Correction".to_string()),
                created_at: None,
            })
            .await
            .unwrap();

        assert_eq!(event.event_type, PaymentEventType::Adjustment);
        assert_eq!(account.balance_lessons, -2);
    }

    #[tokio::test]
    async fn test_replay_matches_cached_balance() {
        let fixture = create_fixture().await;
        let lesson = store_lesson(&fixture, "2024-03-04T15:00:00Z", None).await;
        fixture
            .service
            .adjust(AdjustBalanceCommand {
                teacher_id: "teacher-1".to_string(),
                student_id: "student-1".to_string(),
                delta: 5,
                event_type: PaymentEventType::Subscription,
                amount: Some(6000.0),
                comment: None,
                created_at: None,
            })
            .await
            .unwrap();
        fixture
            .service
            .toggle_paid(toggle_cmd(&lesson, ChargeDecision::UseCredit))
            .await
            .unwrap();

        let account = fixture
            .ledger
            .get_account("teacher-1", "student-1")
            .await
            .unwrap()
            .unwrap();
        let replayed = fixture.service.replay_balance(&account.id).await.unwrap();
        assert_eq!(replayed, account.balance_lessons);
        assert_eq!(replayed, 4);
    }

    #[tokio::test]
    async fn test_auto_complete_requires_opt_in() {
        let fixture = create_fixture().await;
        let now: DateTime<Utc> = "2024-03-04T17:00:00Z".parse().unwrap();
        store_lesson(&fixture, "2024-03-04T15:00:00Z", None).await;

        // No settings row: nothing happens
        let completed = fixture
            .service
            .auto_complete_due("teacher-1", now)
            .await
            .unwrap();
        assert!(completed.is_empty());

        fixture
            .teachers
            .store_settings(&TeacherSettings {
                teacher_id: "teacher-1".to_string(),
                zone: "Europe/Moscow".to_string(),
                chat_id: None,
                auto_confirm: true,
                remind_lessons: true,
                unpaid_digest: true,
            })
            .await
            .unwrap();

        let completed = fixture
            .service
            .auto_complete_due("teacher-1", now)
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].status, LessonStatus::Completed);

        // Second sweep finds nothing left
        let completed = fixture
            .service
            .auto_complete_due("teacher-1", now)
            .await
            .unwrap();
        assert!(completed.is_empty());
    }

    #[tokio::test]
    async fn test_debt_counts_all_unpaid_noncanceled_lessons() {
        let fixture = create_fixture().await;

        // Held and unpaid: counts
        store_lesson(&fixture, "2024-03-04T15:00:00Z", Some(1500.0)).await;
        // Completed and unpaid: counts
        let done = store_lesson(&fixture, "2024-03-06T15:00:00Z", Some(1500.0)).await;
        fixture.service.complete_lesson(&done.id).await.unwrap();
        // Canceled: never debt
        let canceled = store_lesson(&fixture, "2024-03-07T15:00:00Z", Some(1500.0)).await;
        fixture.service.cancel_lesson(&canceled.id).await.unwrap();
        // Scheduled in the future: still unpaid, still owed
        let upcoming = store_lesson(&fixture, "2024-03-20T15:00:00Z", Some(1500.0)).await;

        let summary = fixture.service.list_debt("teacher-1", "student-1").await.unwrap();
        assert_eq!(summary.lesson_count, 3);
        assert_eq!(summary.total_amount, 4500.0);
        assert!(summary.items.iter().any(|i| i.lesson_id == upcoming.id));
    }

    #[tokio::test]
    async fn test_future_unpaid_lesson_is_debt() {
        let fixture = create_fixture().await;
        let upcoming = store_lesson(&fixture, "2030-01-01T15:00:00Z", Some(1200.0)).await;

        let summary = fixture.service.list_debt("teacher-1", "student-1").await.unwrap();
        assert_eq!(summary.lesson_count, 1);
        assert_eq!(summary.items[0].lesson_id, upcoming.id);
        assert_eq!(summary.total_amount, 1200.0);
    }

    #[tokio::test]
    async fn test_update_account_settings_persists_preferences() {
        let fixture = create_fixture().await;

        let account = fixture
            .service
            .update_account_settings("teacher-1", "student-1", Some(1800.0), false, false)
            .await
            .unwrap();
        assert_eq!(account.price_per_lesson, Some(1800.0));
        assert!(!account.remind_lessons);
        assert!(!account.remind_payments);

        let stored = fixture
            .ledger
            .get_account("teacher-1", "student-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.price_per_lesson, Some(1800.0));
        assert!(!stored.remind_lessons);
        assert!(!stored.remind_payments);
    }

    #[tokio::test]
    async fn test_terminal_status_cannot_change_again() {
        let fixture = create_fixture().await;
        let lesson = store_lesson(&fixture, "2024-03-04T15:00:00Z", None).await;
        fixture.service.complete_lesson(&lesson.id).await.unwrap();
        assert!(fixture.service.cancel_lesson(&lesson.id).await.is_err());
        assert!(fixture.service.complete_lesson(&lesson.id).await.is_err());
    }
}
