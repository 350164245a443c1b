use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use shared::{LedgerAccount, PaymentEvent, PaymentEventType};

use crate::storage::sqlite::db::DbConnection;
use crate::storage::sqlite::repositories::{fmt_instant, parse_instant};
use crate::storage::traits::LedgerStorage;

/// Repository for ledger accounts and their append-only payment events
#[derive(Clone)]
pub struct LedgerRepository {
    db: DbConnection,
}

impl LedgerRepository {
    pub fn new(db: DbConnection) -> Self {
        Self { db }
    }

    fn row_to_account(&self, row: &sqlx::sqlite::SqliteRow) -> Result<LedgerAccount> {
        Ok(LedgerAccount {
            id: row.get("id"),
            teacher_id: row.get("teacher_id"),
            student_id: row.get("student_id"),
            balance_lessons: row.get("balance_lessons"),
            price_per_lesson: row.get("price_per_lesson"),
            remind_lessons: row.get::<i64, _>("remind_lessons") != 0,
            remind_payments: row.get::<i64, _>("remind_payments") != 0,
            created_at: parse_instant(row.get("created_at"))?,
            updated_at: parse_instant(row.get("updated_at"))?,
        })
    }
}

#[async_trait]
impl LedgerStorage for LedgerRepository {
    async fn store_account(&self, account: &LedgerAccount) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_accounts (id, teacher_id, student_id, balance_lessons,
                                         price_per_lesson, remind_lessons, remind_payments,
                                         created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&account.id)
        .bind(&account.teacher_id)
        .bind(&account.student_id)
        .bind(account.balance_lessons)
        .bind(account.price_per_lesson)
        .bind(account.remind_lessons as i64)
        .bind(account.remind_payments as i64)
        .bind(fmt_instant(account.created_at))
        .bind(fmt_instant(account.updated_at))
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    async fn get_account(
        &self,
        teacher_id: &str,
        student_id: &str,
    ) -> Result<Option<LedgerAccount>> {
        let row = sqlx::query(
            r#"
            SELECT id, teacher_id, student_id, balance_lessons, price_per_lesson,
                   remind_lessons, remind_payments, created_at, updated_at
            FROM ledger_accounts
            WHERE teacher_id = ? AND student_id = ?
            "#,
        )
        .bind(teacher_id)
        .bind(student_id)
        .fetch_optional(self.db.pool())
        .await?;

        row.map(|r| self.row_to_account(&r)).transpose()
    }

    async fn get_account_by_id(&self, account_id: &str) -> Result<Option<LedgerAccount>> {
        let row = sqlx::query(
            r#"
            SELECT id, teacher_id, student_id, balance_lessons, price_per_lesson,
                   remind_lessons, remind_payments, created_at, updated_at
            FROM ledger_accounts
            WHERE id = ?
            "#,
        )
        .bind(account_id)
        .fetch_optional(self.db.pool())
        .await?;

        row.map(|r| self.row_to_account(&r)).transpose()
    }

    async fn apply_event(
        &self,
        event: &PaymentEvent,
        new_balance: i64,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        // Event append and balance write are one storage transaction so a
        // replay of the event log always reproduces the stored balance.
        let mut tx = self.db.pool().begin().await?;

        sqlx::query(
            r#"
            INSERT INTO payment_events (id, account_id, student_id, lesson_id, event_type,
                                        delta, amount, comment, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.id)
        .bind(&event.account_id)
        .bind(&event.student_id)
        .bind(&event.lesson_id)
        .bind(event.event_type.as_str())
        .bind(event.delta)
        .bind(event.amount)
        .bind(&event.comment)
        .bind(fmt_instant(event.created_at))
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE ledger_accounts
            SET balance_lessons = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(new_balance)
        .bind(fmt_instant(updated_at))
        .bind(&event.account_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn apply_payment_toggle(
        &self,
        event: &PaymentEvent,
        new_balance: i64,
        updated_at: DateTime<Utc>,
        lesson_id: &str,
        is_paid: bool,
    ) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;

        sqlx::query(
            r#"
            UPDATE lesson_participants
            SET is_paid = ?
            WHERE lesson_id = ? AND student_id = ?
            "#,
        )
        .bind(is_paid as i64)
        .bind(lesson_id)
        .bind(&event.student_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO payment_events (id, account_id, student_id, lesson_id, event_type,
                                        delta, amount, comment, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.id)
        .bind(&event.account_id)
        .bind(&event.student_id)
        .bind(&event.lesson_id)
        .bind(event.event_type.as_str())
        .bind(event.delta)
        .bind(event.amount)
        .bind(&event.comment)
        .bind(fmt_instant(event.created_at))
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE ledger_accounts
            SET balance_lessons = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(new_balance)
        .bind(fmt_instant(updated_at))
        .bind(&event.account_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_accounts(&self, teacher_id: &str) -> Result<Vec<LedgerAccount>> {
        let rows = sqlx::query(
            r#"
            SELECT id, teacher_id, student_id, balance_lessons, price_per_lesson,
                   remind_lessons, remind_payments, created_at, updated_at
            FROM ledger_accounts
            WHERE teacher_id = ?
            ORDER BY student_id ASC
            "#,
        )
        .bind(teacher_id)
        .fetch_all(self.db.pool())
        .await?;

        rows.iter().map(|r| self.row_to_account(r)).collect()
    }

    async fn list_events(&self, account_id: &str) -> Result<Vec<PaymentEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, account_id, student_id, lesson_id, event_type, delta, amount,
                   comment, created_at
            FROM payment_events
            WHERE account_id = ?
            ORDER BY rowid ASC
            "#,
        )
        .bind(account_id)
        .fetch_all(self.db.pool())
        .await?;

        rows.iter()
            .map(|row| {
                let type_raw: String = row.get("event_type");
                let event_type = PaymentEventType::parse(&type_raw).ok_or_else(|| {
                    anyhow::anyhow!("Unknown payment event type '{}'", type_raw)
                })?;
                Ok(PaymentEvent {
                    id: row.get("id"),
                    account_id: row.get("account_id"),
                    student_id: row.get("student_id"),
                    lesson_id: row.get("lesson_id"),
                    event_type,
                    delta: row.get("delta"),
                    amount: row.get("amount"),
                    comment: row.get("comment"),
                    created_at: parse_instant(row.get("created_at"))?,
                })
            })
            .collect()
    }

    async fn update_account_settings(&self, account: &LedgerAccount) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE ledger_accounts
            SET price_per_lesson = ?, remind_lessons = ?, remind_payments = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(account.price_per_lesson)
        .bind(account.remind_lessons as i64)
        .bind(account.remind_payments as i64)
        .bind(fmt_instant(account.updated_at))
        .bind(&account.id)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_account() -> LedgerAccount {
        let now: DateTime<Utc> = "2024-03-01T10:00:00Z".parse().unwrap();
        LedgerAccount {
            id: LedgerAccount::generate_id(),
            teacher_id: "teacher-1".to_string(),
            student_id: "student-1".to_string(),
            balance_lessons: 0,
            price_per_lesson: Some(30.0),
            remind_lessons: true,
            remind_payments: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_apply_event_writes_event_and_balance_together() {
        let db = DbConnection::init_test().await.unwrap();
        let repo = LedgerRepository::new(db);

        let account = sample_account();
        repo.store_account(&account).await.unwrap();

        let event = PaymentEvent {
            id: PaymentEvent::generate_id(),
            account_id: account.id.clone(),
            student_id: account.student_id.clone(),
            lesson_id: None,
            event_type: PaymentEventType::TopUp,
            delta: 5,
            amount: Some(150.0),
            comment: None,
            created_at: "2024-03-01T11:00:00Z".parse().unwrap(),
        };
        repo.apply_event(&event, 5, "2024-03-01T11:00:00Z".parse().unwrap())
            .await
            .unwrap();

        let stored = repo.get_account_by_id(&account.id).await.unwrap().unwrap();
        assert_eq!(stored.balance_lessons, 5);

        let events = repo.list_events(&account.id).await.unwrap();
        assert_eq!(events, vec![event]);
    }

    #[tokio::test]
    async fn test_payment_toggle_writes_flag_event_and_balance_together() {
        let db = DbConnection::init_test().await.unwrap();
        let repo = LedgerRepository::new(db.clone());

        let account = sample_account();
        repo.store_account(&account).await.unwrap();
        sqlx::query(
            "INSERT INTO lessons (id, teacher_id, start_at, duration_minutes, status) \
             VALUES ('lesson-1', 'teacher-1', '2024-03-01T15:00:00.000Z', 60, 'SCHEDULED')",
        )
        .execute(db.pool())
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO lesson_participants (lesson_id, student_id, is_paid) \
             VALUES ('lesson-1', 'student-1', 0)",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let event = PaymentEvent {
            id: PaymentEvent::generate_id(),
            account_id: account.id.clone(),
            student_id: account.student_id.clone(),
            lesson_id: Some("lesson-1".to_string()),
            event_type: PaymentEventType::AutoCharge,
            delta: -1,
            amount: None,
            comment: None,
            created_at: "2024-03-01T16:00:00Z".parse().unwrap(),
        };
        repo.apply_payment_toggle(&event, -1, event.created_at, "lesson-1", true)
            .await
            .unwrap();

        let is_paid: i64 = sqlx::query(
            "SELECT is_paid FROM lesson_participants WHERE lesson_id = 'lesson-1'",
        )
        .fetch_one(db.pool())
        .await
        .unwrap()
        .get("is_paid");
        assert_eq!(is_paid, 1);
        let stored = repo.get_account_by_id(&account.id).await.unwrap().unwrap();
        assert_eq!(stored.balance_lessons, -1);
        assert_eq!(repo.list_events(&account.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_payment_toggle_leaves_no_partial_write() {
        let db = DbConnection::init_test().await.unwrap();
        let repo = LedgerRepository::new(db.clone());

        let account = sample_account();
        repo.store_account(&account).await.unwrap();
        sqlx::query(
            "INSERT INTO lessons (id, teacher_id, start_at, duration_minutes, status) \
             VALUES ('lesson-1', 'teacher-1', '2024-03-01T15:00:00.000Z', 60, 'SCHEDULED')",
        )
        .execute(db.pool())
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO lesson_participants (lesson_id, student_id, is_paid) \
             VALUES ('lesson-1', 'student-1', 0)",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let event = PaymentEvent {
            id: PaymentEvent::generate_id(),
            account_id: account.id.clone(),
            student_id: account.student_id.clone(),
            lesson_id: Some("lesson-1".to_string()),
            event_type: PaymentEventType::AutoCharge,
            delta: -1,
            amount: None,
            comment: None,
            created_at: "2024-03-01T16:00:00Z".parse().unwrap(),
        };
        // A prior event with the same id makes the insert collide mid
        // transaction
        repo.apply_event(&event, 0, event.created_at).await.unwrap();

        let result = repo
            .apply_payment_toggle(&event, -1, event.created_at, "lesson-1", true)
            .await;
        assert!(result.is_err());

        // The participant flip rolled back with the rest
        let is_paid: i64 = sqlx::query(
            "SELECT is_paid FROM lesson_participants WHERE lesson_id = 'lesson-1'",
        )
        .fetch_one(db.pool())
        .await
        .unwrap()
        .get("is_paid");
        assert_eq!(is_paid, 0);
        let stored = repo.get_account_by_id(&account.id).await.unwrap().unwrap();
        assert_eq!(stored.balance_lessons, 0);
        assert_eq!(repo.list_events(&account.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_events_come_back_in_creation_order() {
        let db = DbConnection::init_test().await.unwrap();
        let repo = LedgerRepository::new(db);

        let account = sample_account();
        repo.store_account(&account).await.unwrap();

        let mut balance = 0;
        for delta in [3i64, -1, -1] {
            balance += delta;
            let event = PaymentEvent {
                id: PaymentEvent::generate_id(),
                account_id: account.id.clone(),
                student_id: account.student_id.clone(),
                lesson_id: None,
                event_type: if delta > 0 {
                    PaymentEventType::TopUp
                } else {
                    PaymentEventType::AutoCharge
                },
                delta,
                amount: None,
                comment: None,
                created_at: "2024-03-01T11:00:00Z".parse().unwrap(),
            };
            repo.apply_event(&event, balance, event.created_at).await.unwrap();
        }

        let events = repo.list_events(&account.id).await.unwrap();
        let deltas: Vec<i64> = events.iter().map(|e| e.delta).collect();
        assert_eq!(deltas, vec![3, -1, -1]);
        let replayed: i64 = deltas.iter().sum();
        let stored = repo.get_account_by_id(&account.id).await.unwrap().unwrap();
        assert_eq!(replayed, stored.balance_lessons);
    }
}
