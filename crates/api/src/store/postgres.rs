//! Postgres-backed chat store

use deskline_shared::{Message, MessageId, Role, RoomId, UserId};
use futures::future::BoxFuture;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{ChatStore, NewMessage, StoreError};

/// Chat store over the `ticket_*` tables
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: i64,
    ticket_id: Uuid,
    sender_id: Uuid,
    content: String,
    is_internal: bool,
    withdrawn: bool,
    created_at: OffsetDateTime,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Message {
            id: MessageId(row.id),
            room_id: RoomId(row.ticket_id),
            sender_id: UserId(row.sender_id),
            content: row.content,
            internal: row.is_internal,
            withdrawn: row.withdrawn,
            created_at: row.created_at,
        }
    }
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl ChatStore for PgStore {
    fn can_access(
        &self,
        room_id: RoomId,
        user_id: UserId,
        role: Role,
    ) -> BoxFuture<'_, Result<bool, StoreError>> {
        Box::pin(async move {
            if role.is_staff_side() {
                return Ok(true);
            }
            let has_access = sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS(SELECT 1 FROM ticket_participants WHERE ticket_id = $1 AND user_id = $2)",
            )
            .bind(room_id.0)
            .bind(user_id.0)
            .fetch_one(&self.pool)
            .await?;

            Ok(has_access)
        })
    }

    fn save_message(&self, message: NewMessage) -> BoxFuture<'_, Result<Message, StoreError>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, MessageRow>(
                r#"
                INSERT INTO ticket_messages (ticket_id, sender_id, content, is_internal)
                VALUES ($1, $2, $3, $4)
                RETURNING id, ticket_id, sender_id, content, is_internal, withdrawn, created_at
                "#,
            )
            .bind(message.room_id.0)
            .bind(message.sender_id.0)
            .bind(&message.content)
            .bind(message.internal)
            .fetch_one(&self.pool)
            .await?;

            Ok(row.into())
        })
    }

    fn get_message(
        &self,
        message_id: MessageId,
    ) -> BoxFuture<'_, Result<Option<Message>, StoreError>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, MessageRow>(
                r#"
                SELECT id, ticket_id, sender_id, content, is_internal, withdrawn, created_at
                FROM ticket_messages
                WHERE id = $1
                "#,
            )
            .bind(message_id.0)
            .fetch_optional(&self.pool)
            .await?;

            Ok(row.map(Message::from))
        })
    }

    fn save_read_receipt(
        &self,
        message_id: MessageId,
        user_id: UserId,
        read_at: OffsetDateTime,
    ) -> BoxFuture<'_, Result<bool, StoreError>> {
        Box::pin(async move {
            let result = sqlx::query(
                r#"
                INSERT INTO ticket_message_reads (message_id, user_id, read_at)
                VALUES ($1, $2, $3)
                ON CONFLICT (message_id, user_id) DO NOTHING
                "#,
            )
            .bind(message_id.0)
            .bind(user_id.0)
            .bind(read_at)
            .execute(&self.pool)
            .await?;

            Ok(result.rows_affected() == 1)
        })
    }

    fn save_withdrawal(&self, message_id: MessageId) -> BoxFuture<'_, Result<bool, StoreError>> {
        Box::pin(async move {
            let result = sqlx::query(
                r#"
                UPDATE ticket_messages
                SET withdrawn = TRUE, content = '', withdrawn_at = NOW()
                WHERE id = $1 AND withdrawn = FALSE
                "#,
            )
            .bind(message_id.0)
            .execute(&self.pool)
            .await?;

            Ok(result.rows_affected() == 1)
        })
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            sqlx::query("SELECT 1").execute(&self.pool).await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> PgStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = deskline_shared::create_pool(&url, 2)
            .await
            .expect("Failed to create pool");
        deskline_shared::run_migrations(&pool)
            .await
            .expect("Failed to run migrations");
        PgStore::new(pool)
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_withdrawal_and_receipt_are_idempotent() {
        let store = test_store().await;
        let message = store
            .save_message(NewMessage {
                room_id: RoomId::new(),
                sender_id: UserId::new(),
                content: "hello".to_string(),
                internal: false,
            })
            .await
            .unwrap();

        assert!(store.save_withdrawal(message.id).await.unwrap());
        assert!(!store.save_withdrawal(message.id).await.unwrap());

        let reader = UserId::new();
        let now = OffsetDateTime::now_utc();
        assert!(store.save_read_receipt(message.id, reader, now).await.unwrap());
        assert!(!store.save_read_receipt(message.id, reader, now).await.unwrap());
    }
}
