//! Logical schema of the downstream consumer's database (§3, §4.5, §6).
//!
//! The router process itself never opens a SQL connection — it only
//! publishes [`crate::db_publisher::DbMutation`] messages onto the
//! DB-updates queue. This module exists so integration tests can stand up a
//! real `sqlx::MySqlPool` and assert the publisher's payload shapes against
//! the tables a downstream consumer would actually apply them to. Grounded
//! in the teacher's `database::schema::initialize_schema`.

use sqlx::MySqlPool;

pub async fn initialize_schema(pool: &MySqlPool) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS request (
            id VARCHAR(64) PRIMARY KEY,
            state VARCHAR(32) NOT NULL DEFAULT 'PENDING',
            system_id VARCHAR(64),
            user_id VARCHAR(64),
            request_mode VARCHAR(32),
            fallback_mode VARCHAR(32),
            sent_time BIGINT,
            delivery_time BIGINT,
            expires BIGINT,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS request_tags (
            id BIGINT AUTO_INCREMENT PRIMARY KEY,
            request_id VARCHAR(64) NOT NULL,
            system_id VARCHAR(64),
            tag_name VARCHAR(64) NOT NULL,
            tag_value TEXT,
            expires_flag BOOLEAN NOT NULL DEFAULT FALSE,
            UNIQUE KEY request_tag_unique (request_id, tag_name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS request_batch (
            request_id VARCHAR(64) NOT NULL,
            batch_id VARCHAR(64) NOT NULL,
            PRIMARY KEY (request_id, batch_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Reserved tag names the publisher writes on every abort/terminal hop (§3).
pub const RESERVED_TAG_NAMES: &[&str] =
    &["_sito_settings", "_sito_cargo", "_sito_history", "_sito_status_detail", "_sito_retry"];
