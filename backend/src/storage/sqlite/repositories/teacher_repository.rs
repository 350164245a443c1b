use anyhow::Result;
use async_trait::async_trait;
use sqlx::Row;

use shared::TeacherSettings;

use crate::storage::sqlite::db::DbConnection;
use crate::storage::traits::TeacherStorage;

/// Repository for per-teacher settings
#[derive(Clone)]
pub struct TeacherRepository {
    db: DbConnection,
}

impl TeacherRepository {
    pub fn new(db: DbConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TeacherStorage for TeacherRepository {
    async fn store_settings(&self, settings: &TeacherSettings) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO teacher_settings (teacher_id, zone, chat_id, auto_confirm,
                                          remind_lessons, unpaid_digest)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (teacher_id) DO UPDATE SET
                zone = excluded.zone,
                chat_id = excluded.chat_id,
                auto_confirm = excluded.auto_confirm,
                remind_lessons = excluded.remind_lessons,
                unpaid_digest = excluded.unpaid_digest
            "#,
        )
        .bind(&settings.teacher_id)
        .bind(&settings.zone)
        .bind(&settings.chat_id)
        .bind(settings.auto_confirm as i64)
        .bind(settings.remind_lessons as i64)
        .bind(settings.unpaid_digest as i64)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    async fn get_settings(&self, teacher_id: &str) -> Result<Option<TeacherSettings>> {
        let row = sqlx::query(
            r#"
            SELECT teacher_id, zone, chat_id, auto_confirm, remind_lessons, unpaid_digest
            FROM teacher_settings
            WHERE teacher_id = ?
            "#,
        )
        .bind(teacher_id)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(row.map(|r| TeacherSettings {
            teacher_id: r.get("teacher_id"),
            zone: r.get("zone"),
            chat_id: r.get("chat_id"),
            auto_confirm: r.get::<i64, _>("auto_confirm") != 0,
            remind_lessons: r.get::<i64, _>("remind_lessons") != 0,
            unpaid_digest: r.get::<i64, _>("unpaid_digest") != 0,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_and_update_settings() {
        let db = DbConnection::init_test().await.unwrap();
        let repo = TeacherRepository::new(db);

        let mut settings = TeacherSettings {
            teacher_id: "teacher-1".to_string(),
            zone: "Europe/Moscow".to_string(),
            chat_id: None,
            auto_confirm: false,
            remind_lessons: true,
            unpaid_digest: true,
        };
        repo.store_settings(&settings).await.unwrap();
        assert_eq!(
            repo.get_settings("teacher-1").await.unwrap().unwrap(),
            settings
        );

        settings.auto_confirm = true;
        settings.chat_id = Some("chat-1".to_string());
        repo.store_settings(&settings).await.unwrap();
        assert_eq!(
            repo.get_settings("teacher-1").await.unwrap().unwrap(),
            settings
        );
    }
}
