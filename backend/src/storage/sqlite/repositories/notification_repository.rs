use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use shared::{CreateLogOutcome, NotificationKind, NotificationLog, NotificationStatus};

use crate::storage::sqlite::db::DbConnection;
use crate::storage::sqlite::repositories::{fmt_instant, parse_instant, parse_instant_opt};
use crate::storage::traits::NotificationStorage;

/// Repository for the notification log.
///
/// The UNIQUE constraint on `dedupe_key` is the system's only true
/// mutual-exclusion point: the first insert wins and every later attempt for
/// the same key is reported as already scheduled.
#[derive(Clone)]
pub struct NotificationRepository {
    db: DbConnection,
}

impl NotificationRepository {
    pub fn new(db: DbConnection) -> Self {
        Self { db }
    }

    fn row_to_log(&self, row: &sqlx::sqlite::SqliteRow) -> Result<NotificationLog> {
        let kind_raw: String = row.get("kind");
        let status_raw: String = row.get("status");
        Ok(NotificationLog {
            id: row.get("id"),
            teacher_id: row.get("teacher_id"),
            student_id: row.get("student_id"),
            lesson_id: row.get("lesson_id"),
            kind: NotificationKind::parse(&kind_raw)
                .ok_or_else(|| anyhow::anyhow!("Unknown notification kind '{}'", kind_raw))?,
            status: NotificationStatus::parse(&status_raw)
                .ok_or_else(|| anyhow::anyhow!("Unknown notification status '{}'", status_raw))?,
            dedupe_key: row.get("dedupe_key"),
            scheduled_for: parse_instant_opt(row.get("scheduled_for"))?,
            sent_at: parse_instant_opt(row.get("sent_at"))?,
            error_text: row.get("error_text"),
            created_at: parse_instant(row.get("created_at"))?,
        })
    }
}

const LOG_COLUMNS: &str = "id, teacher_id, student_id, lesson_id, kind, status, dedupe_key, \
                           scheduled_for, sent_at, error_text, created_at";

#[async_trait]
impl NotificationStorage for NotificationRepository {
    async fn insert_log(&self, log: &NotificationLog) -> Result<CreateLogOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO notification_log (id, teacher_id, student_id, lesson_id, kind, status,
                                          dedupe_key, scheduled_for, sent_at, error_text, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (dedupe_key) DO NOTHING
            "#,
        )
        .bind(&log.id)
        .bind(&log.teacher_id)
        .bind(&log.student_id)
        .bind(&log.lesson_id)
        .bind(log.kind.as_str())
        .bind(log.status.as_str())
        .bind(&log.dedupe_key)
        .bind(log.scheduled_for.map(fmt_instant))
        .bind(log.sent_at.map(fmt_instant))
        .bind(&log.error_text)
        .bind(fmt_instant(log.created_at))
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() == 0 {
            Ok(CreateLogOutcome::AlreadyScheduled)
        } else {
            Ok(CreateLogOutcome::Created(log.clone()))
        }
    }

    async fn finalize_log(
        &self,
        log_id: &str,
        status: NotificationStatus,
        sent_at: Option<DateTime<Utc>>,
        error_text: Option<String>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE notification_log
            SET status = ?, sent_at = ?, error_text = ?
            WHERE id = ? AND status = 'PENDING'
            "#,
        )
        .bind(status.as_str())
        .bind(sent_at.map(fmt_instant))
        .bind(error_text)
        .bind(log_id)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    async fn get_log(&self, log_id: &str) -> Result<Option<NotificationLog>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM notification_log WHERE id = ?",
            LOG_COLUMNS
        ))
        .bind(log_id)
        .fetch_optional(self.db.pool())
        .await?;

        row.map(|r| self.row_to_log(&r)).transpose()
    }

    async fn last_sent(
        &self,
        teacher_id: &str,
        student_id: &str,
        kind: NotificationKind,
    ) -> Result<Option<NotificationLog>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {} FROM notification_log
            WHERE teacher_id = ? AND student_id = ? AND kind = ? AND status = 'SENT'
            ORDER BY sent_at DESC
            LIMIT 1
            "#,
            LOG_COLUMNS
        ))
        .bind(teacher_id)
        .bind(student_id)
        .bind(kind.as_str())
        .fetch_optional(self.db.pool())
        .await?;

        row.map(|r| self.row_to_log(&r)).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_log(dedupe_key: &str) -> NotificationLog {
        NotificationLog {
            id: NotificationLog::generate_id(),
            teacher_id: "teacher-1".to_string(),
            student_id: Some("student-1".to_string()),
            lesson_id: None,
            kind: NotificationKind::StudentPaymentReminder,
            status: NotificationStatus::Pending,
            dedupe_key: dedupe_key.to_string(),
            scheduled_for: None,
            sent_at: None,
            error_text: None,
            created_at: "2024-03-01T10:00:00Z".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_dedupe_key_collision_is_a_no_op() {
        let db = DbConnection::init_test().await.unwrap();
        let repo = NotificationRepository::new(db.clone());

        let first = sample_log("key-1");
        let second = sample_log("key-1");

        assert_eq!(
            repo.insert_log(&first).await.unwrap(),
            CreateLogOutcome::Created(first.clone())
        );
        assert_eq!(
            repo.insert_log(&second).await.unwrap(),
            CreateLogOutcome::AlreadyScheduled
        );

        // Exactly one row exists, and it is the first writer's
        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM notification_log")
            .fetch_one(db.pool())
            .await
            .unwrap()
            .get("n");
        assert_eq!(count, 1);
        assert!(repo.get_log(&first.id).await.unwrap().is_some());
        assert!(repo.get_log(&second.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_finalize_is_terminal() {
        let db = DbConnection::init_test().await.unwrap();
        let repo = NotificationRepository::new(db);

        let log = sample_log("key-2");
        repo.insert_log(&log).await.unwrap();

        let sent_at: DateTime<Utc> = "2024-03-01T10:05:00Z".parse().unwrap();
        repo.finalize_log(&log.id, NotificationStatus::Sent, Some(sent_at), None)
            .await
            .unwrap();

        // A second finalize must not overwrite the finalized row
        repo.finalize_log(
            &log.id,
            NotificationStatus::Failed,
            None,
            Some("late error".to_string()),
        )
        .await
        .unwrap();

        let stored = repo.get_log(&log.id).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Sent);
        assert_eq!(stored.sent_at, Some(sent_at));
        assert_eq!(stored.error_text, None);
    }

    #[tokio::test]
    async fn test_last_sent_picks_latest_matching_kind() {
        let db = DbConnection::init_test().await.unwrap();
        let repo = NotificationRepository::new(db);

        for (key, sent_at) in [("key-a", "2024-03-01T08:00:00Z"), ("key-b", "2024-03-02T08:00:00Z")] {
            let log = sample_log(key);
            repo.insert_log(&log).await.unwrap();
            repo.finalize_log(
                &log.id,
                NotificationStatus::Sent,
                Some(sent_at.parse().unwrap()),
                None,
            )
            .await
            .unwrap();
        }

        let last = repo
            .last_sent("teacher-1", "student-1", NotificationKind::StudentPaymentReminder)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(last.dedupe_key, "key-b");

        assert!(repo
            .last_sent("teacher-1", "student-1", NotificationKind::TeacherUnpaidDigest)
            .await
            .unwrap()
            .is_none());
    }
}
