use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use shared::{Lesson, LessonStatus, Participant};

use crate::storage::sqlite::db::DbConnection;
use crate::storage::sqlite::repositories::{
    fmt_date, fmt_instant, fmt_weekdays, parse_date, parse_instant, parse_weekdays,
};
use crate::storage::traits::LessonStorage;

/// Repository for lesson and participant rows
#[derive(Clone)]
pub struct LessonRepository {
    db: DbConnection,
}

impl LessonRepository {
    pub fn new(db: DbConnection) -> Self {
        Self { db }
    }

    fn row_to_lesson(&self, row: &sqlx::sqlite::SqliteRow) -> Result<Lesson> {
        let status_raw: String = row.get("status");
        let status = LessonStatus::parse(&status_raw)
            .ok_or_else(|| anyhow::anyhow!("Unknown lesson status '{}'", status_raw))?;
        let until_raw: Option<String> = row.get("until_date");
        let weekdays_raw: String = row.get("weekdays");

        Ok(Lesson {
            id: row.get("id"),
            teacher_id: row.get("teacher_id"),
            series_id: row.get("series_id"),
            start_at: parse_instant(row.get("start_at"))?,
            duration_minutes: row.get::<i64, _>("duration_minutes") as u32,
            status,
            participants: Vec::new(),
            meeting_link: row.get("meeting_link"),
            color: row.get("color"),
            is_recurring: row.get::<i64, _>("is_recurring") != 0,
            weekdays: parse_weekdays(&weekdays_raw),
            until: until_raw.as_deref().map(parse_date).transpose()?,
        })
    }

    async fn load_participants(&self, lesson_id: &str) -> Result<Vec<Participant>> {
        let rows = sqlx::query(
            r#"
            SELECT student_id, is_paid, price_snapshot
            FROM lesson_participants
            WHERE lesson_id = ?
            ORDER BY student_id ASC
            "#,
        )
        .bind(lesson_id)
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows
            .iter()
            .map(|row| Participant {
                student_id: row.get("student_id"),
                is_paid: row.get::<i64, _>("is_paid") != 0,
                price_snapshot: row.get("price_snapshot"),
            })
            .collect())
    }

    async fn hydrate(&self, rows: Vec<sqlx::sqlite::SqliteRow>) -> Result<Vec<Lesson>> {
        let mut lessons = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut lesson = self.row_to_lesson(row)?;
            lesson.participants = self.load_participants(&lesson.id).await?;
            lessons.push(lesson);
        }
        Ok(lessons)
    }
}

const LESSON_COLUMNS: &str = "id, teacher_id, series_id, start_at, duration_minutes, status, \
                              meeting_link, color, is_recurring, weekdays, until_date";

#[async_trait]
impl LessonStorage for LessonRepository {
    async fn store_lesson(&self, lesson: &Lesson) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;

        sqlx::query(
            r#"
            INSERT INTO lessons (id, teacher_id, series_id, start_at, duration_minutes,
                                 status, meeting_link, color, is_recurring, weekdays, until_date)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&lesson.id)
        .bind(&lesson.teacher_id)
        .bind(&lesson.series_id)
        .bind(fmt_instant(lesson.start_at))
        .bind(lesson.duration_minutes as i64)
        .bind(lesson.status.as_str())
        .bind(&lesson.meeting_link)
        .bind(&lesson.color)
        .bind(lesson.is_recurring as i64)
        .bind(fmt_weekdays(&lesson.weekdays))
        .bind(lesson.until.map(fmt_date))
        .execute(&mut *tx)
        .await?;

        for participant in &lesson.participants {
            sqlx::query(
                r#"
                INSERT INTO lesson_participants (lesson_id, student_id, is_paid, price_snapshot)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(&lesson.id)
            .bind(&participant.student_id)
            .bind(participant.is_paid as i64)
            .bind(participant.price_snapshot)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn store_lessons(&self, lessons: &[Lesson]) -> Result<()> {
        for lesson in lessons {
            self.store_lesson(lesson).await?;
        }
        Ok(())
    }

    async fn get_lesson(&self, lesson_id: &str) -> Result<Option<Lesson>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM lessons WHERE id = ?",
            LESSON_COLUMNS
        ))
        .bind(lesson_id)
        .fetch_optional(self.db.pool())
        .await?;

        match row {
            Some(row) => {
                let mut lesson = self.row_to_lesson(&row)?;
                lesson.participants = self.load_participants(&lesson.id).await?;
                Ok(Some(lesson))
            }
            None => Ok(None),
        }
    }

    async fn list_lessons_in_range(
        &self,
        teacher_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Lesson>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM lessons
            WHERE teacher_id = ? AND start_at >= ? AND start_at <= ?
            ORDER BY start_at ASC
            "#,
            LESSON_COLUMNS
        ))
        .bind(teacher_id)
        .bind(fmt_instant(start))
        .bind(fmt_instant(end))
        .fetch_all(self.db.pool())
        .await?;

        self.hydrate(rows).await
    }

    async fn list_lessons_for_series(&self, series_id: &str) -> Result<Vec<Lesson>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM lessons
            WHERE series_id = ?
            ORDER BY start_at ASC
            "#,
            LESSON_COLUMNS
        ))
        .bind(series_id)
        .fetch_all(self.db.pool())
        .await?;

        self.hydrate(rows).await
    }

    async fn list_lessons_for_student(
        &self,
        teacher_id: &str,
        student_id: &str,
    ) -> Result<Vec<Lesson>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM lessons
            WHERE teacher_id = ?
              AND id IN (SELECT lesson_id FROM lesson_participants WHERE student_id = ?)
            ORDER BY start_at ASC
            "#,
            LESSON_COLUMNS
        ))
        .bind(teacher_id)
        .bind(student_id)
        .fetch_all(self.db.pool())
        .await?;

        self.hydrate(rows).await
    }

    async fn list_due_lessons(
        &self,
        teacher_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Lesson>> {
        // SQL prefilters by start; the precise end-of-lesson check needs the
        // duration, so it happens after mapping.
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM lessons
            WHERE teacher_id = ? AND status = 'SCHEDULED' AND start_at <= ?
            ORDER BY start_at ASC
            "#,
            LESSON_COLUMNS
        ))
        .bind(teacher_id)
        .bind(fmt_instant(now))
        .fetch_all(self.db.pool())
        .await?;

        let lessons = self.hydrate(rows).await?;
        Ok(lessons
            .into_iter()
            .filter(|lesson| lesson.end_at() <= now)
            .collect())
    }

    async fn list_unpaid_student_ids(&self, teacher_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT p.student_id
            FROM lesson_participants p
            JOIN lessons l ON l.id = p.lesson_id
            WHERE l.teacher_id = ? AND p.is_paid = 0 AND l.status != 'CANCELED'
            ORDER BY p.student_id ASC
            "#,
        )
        .bind(teacher_id)
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows.iter().map(|row| row.get("student_id")).collect())
    }

    async fn update_lesson(&self, lesson: &Lesson) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;

        sqlx::query(
            r#"
            UPDATE lessons
            SET series_id = ?, start_at = ?, duration_minutes = ?, status = ?,
                meeting_link = ?, color = ?, is_recurring = ?, weekdays = ?, until_date = ?
            WHERE id = ?
            "#,
        )
        .bind(&lesson.series_id)
        .bind(fmt_instant(lesson.start_at))
        .bind(lesson.duration_minutes as i64)
        .bind(lesson.status.as_str())
        .bind(&lesson.meeting_link)
        .bind(&lesson.color)
        .bind(lesson.is_recurring as i64)
        .bind(fmt_weekdays(&lesson.weekdays))
        .bind(lesson.until.map(fmt_date))
        .bind(&lesson.id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM lesson_participants WHERE lesson_id = ?")
            .bind(&lesson.id)
            .execute(&mut *tx)
            .await?;

        for participant in &lesson.participants {
            sqlx::query(
                r#"
                INSERT INTO lesson_participants (lesson_id, student_id, is_paid, price_snapshot)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(&lesson.id)
            .bind(&participant.student_id)
            .bind(participant.is_paid as i64)
            .bind(participant.price_snapshot)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_lesson(&self, lesson_id: &str) -> Result<bool> {
        let mut tx = self.db.pool().begin().await?;
        let result = sqlx::query("DELETE FROM lessons WHERE id = ?")
            .bind(lesson_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM lesson_participants WHERE lesson_id = ?")
            .bind(lesson_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_series_from(
        &self,
        series_id: &str,
        start_from: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM lessons
            WHERE series_id = ? AND status = 'SCHEDULED' AND start_at >= ?
            "#,
        )
        .bind(series_id)
        .bind(fmt_instant(start_from))
        .fetch_all(self.db.pool())
        .await?;

        let ids: Vec<String> = rows.iter().map(|row| row.get("id")).collect();

        let mut tx = self.db.pool().begin().await?;
        for id in &ids {
            sqlx::query("DELETE FROM lessons WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM lesson_participants WHERE lesson_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Ok(ids)
    }
}
