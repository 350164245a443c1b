use anyhow::Result;
use async_trait::async_trait;
use sqlx::Row;

use shared::ChatIdentity;

use crate::storage::sqlite::db::DbConnection;
use crate::storage::sqlite::repositories::{fmt_instant, parse_instant_opt};
use crate::storage::traits::IdentityStorage;

/// Repository for registered chat identities
#[derive(Clone)]
pub struct IdentityRepository {
    db: DbConnection,
}

impl IdentityRepository {
    pub fn new(db: DbConnection) -> Self {
        Self { db }
    }

    fn row_to_identity(&self, row: &sqlx::sqlite::SqliteRow) -> Result<ChatIdentity> {
        Ok(ChatIdentity {
            id: row.get("id"),
            handle: row.get("handle"),
            chat_id: row.get("chat_id"),
            student_id: row.get("student_id"),
            is_active: row.get::<i64, _>("is_active") != 0,
            activated_at: parse_instant_opt(row.get("activated_at"))?,
        })
    }
}

#[async_trait]
impl IdentityStorage for IdentityRepository {
    async fn store_identity(&self, identity: &ChatIdentity) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chat_identities (id, handle, chat_id, student_id, is_active, activated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&identity.id)
        .bind(&identity.handle)
        .bind(&identity.chat_id)
        .bind(&identity.student_id)
        .bind(identity.is_active as i64)
        .bind(identity.activated_at.map(fmt_instant))
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    async fn find_by_handle(&self, handle: &str) -> Result<Option<ChatIdentity>> {
        let row = sqlx::query(
            r#"
            SELECT id, handle, chat_id, student_id, is_active, activated_at
            FROM chat_identities
            WHERE handle = ?
            "#,
        )
        .bind(handle)
        .fetch_optional(self.db.pool())
        .await?;

        row.map(|r| self.row_to_identity(&r)).transpose()
    }

    async fn find_by_student(&self, student_id: &str) -> Result<Option<ChatIdentity>> {
        let row = sqlx::query(
            r#"
            SELECT id, handle, chat_id, student_id, is_active, activated_at
            FROM chat_identities
            WHERE student_id = ?
            "#,
        )
        .bind(student_id)
        .fetch_optional(self.db.pool())
        .await?;

        row.map(|r| self.row_to_identity(&r)).transpose()
    }

    async fn update_identity(&self, identity: &ChatIdentity) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE chat_identities
            SET handle = ?, chat_id = ?, student_id = ?, is_active = ?, activated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&identity.handle)
        .bind(&identity.chat_id)
        .bind(&identity.student_id)
        .bind(identity.is_active as i64)
        .bind(identity.activated_at.map(fmt_instant))
        .bind(&identity.id)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }
}
