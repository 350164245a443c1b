use anyhow::Result;
use sqlx::{migrate::MigrateDatabase, Sqlite, SqlitePool};
use std::sync::Arc;

// The database URL for the production database
const DATABASE_URL: &str = "sqlite:tutorbook.db";

/// DbConnection manages database operations
#[derive(Clone)]
pub struct DbConnection {
    pool: Arc<SqlitePool>,
}

impl DbConnection {
    /// Create a new database connection
    pub async fn new(url: &str) -> Result<Self> {
        // Create database if it doesn't exist
        if !Sqlite::database_exists(url).await.unwrap_or(false) {
            Sqlite::create_database(url).await?
        }

        let pool = SqlitePool::connect(url).await?;
        Self::setup_schema(&pool).await?;

        Ok(Self { pool: Arc::new(pool) })
    }

    /// Initialize the standard database
    pub async fn init() -> Result<Self> {
        Self::new(DATABASE_URL).await
    }

    /// Initialize a test database with a unique name
    pub async fn init_test() -> Result<Self> {
        // Generate a unique database name for tests
        let test_id = uuid::Uuid::new_v4().to_string();
        let db_url = format!("file:memdb_{}?mode=memory&cache=shared", test_id);

        Self::new(&db_url).await
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Set up the required database schema
    async fn setup_schema(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS lessons (
                id TEXT PRIMARY KEY,
                teacher_id TEXT NOT NULL,
                series_id TEXT,
                start_at TEXT NOT NULL,
                duration_minutes INTEGER NOT NULL,
                status TEXT NOT NULL,
                meeting_link TEXT,
                color TEXT,
                is_recurring INTEGER NOT NULL DEFAULT 0,
                weekdays TEXT NOT NULL DEFAULT '',
                until_date TEXT
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_lessons_teacher_start
            ON lessons (teacher_id, start_at)
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS lesson_participants (
                lesson_id TEXT NOT NULL,
                student_id TEXT NOT NULL,
                is_paid INTEGER NOT NULL DEFAULT 0,
                price_snapshot REAL,
                PRIMARY KEY (lesson_id, student_id),
                FOREIGN KEY (lesson_id) REFERENCES lessons (id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_accounts (
                id TEXT PRIMARY KEY,
                teacher_id TEXT NOT NULL,
                student_id TEXT NOT NULL,
                balance_lessons INTEGER NOT NULL DEFAULT 0,
                price_per_lesson REAL,
                remind_lessons INTEGER NOT NULL DEFAULT 1,
                remind_payments INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (teacher_id, student_id)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS payment_events (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                student_id TEXT NOT NULL,
                lesson_id TEXT,
                event_type TEXT NOT NULL,
                delta INTEGER NOT NULL,
                amount REAL,
                comment TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (account_id) REFERENCES ledger_accounts (id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS notification_log (
                id TEXT PRIMARY KEY,
                teacher_id TEXT NOT NULL,
                student_id TEXT,
                lesson_id TEXT,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                dedupe_key TEXT NOT NULL UNIQUE,
                scheduled_for TEXT,
                sent_at TEXT,
                error_text TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chat_identities (
                id TEXT PRIMARY KEY,
                handle TEXT NOT NULL UNIQUE,
                chat_id TEXT NOT NULL,
                student_id TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                activated_at TEXT
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS teacher_settings (
                teacher_id TEXT PRIMARY KEY,
                zone TEXT NOT NULL,
                chat_id TEXT,
                auto_confirm INTEGER NOT NULL DEFAULT 0,
                remind_lessons INTEGER NOT NULL DEFAULT 1,
                unpaid_digest INTEGER NOT NULL DEFAULT 1
            )
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }
}
