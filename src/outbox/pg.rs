//! Postgres SQL shared by both strategies. Only the claim query differs
//! between them.

use super::{OutboxTx, Strategy};
use crate::error::{Error, Result};
use crate::model::{Email, EmailId};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use sqlx::{PgConnection, PgPool};

const CREATE_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS email_outbox (
        id          BIGSERIAL PRIMARY KEY,
        recipient   TEXT NOT NULL,
        subject     TEXT NOT NULL,
        body        TEXT NOT NULL
    )";

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
pub(super) struct EmailRow {
    id: i64,
    recipient: String,
    subject: String,
    body: String,
}

impl From<EmailRow> for Email {
    fn from(row: EmailRow) -> Self {
        Email {
            id: Some(EmailId(row.id)),
            recipient: row.recipient,
            subject: row.subject,
            body: row.body,
        }
    }
}

pub(super) async fn create_table(pool: &PgPool) -> Result<()> {
    sqlx::query(CREATE_TABLE).execute(pool).await?;
    Ok(())
}

pub(super) async fn reset(pool: &PgPool) -> Result<()> {
    sqlx::query("TRUNCATE TABLE email_outbox").execute(pool).await?;
    tracing::info!("outbox truncated");
    Ok(())
}

pub(super) async fn count(pool: &PgPool) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM email_outbox")
        .fetch_one(pool)
        .await?;
    Ok(row.0)
}

pub(super) async fn insert(pool: &PgPool, strategy: Strategy, email: &Email) -> Result<EmailId> {
    let row: (i64,) = sqlx::query_as(
        "INSERT INTO email_outbox (recipient, subject, body) VALUES ($1, $2, $3) RETURNING id",
    )
    .bind(&email.recipient)
    .bind(&email.subject)
    .bind(&email.body)
    .fetch_one(pool)
    .await?;

    metrics::emails_enqueued().add(1, &[KeyValue::new("strategy", strategy.to_string())]);
    tracing::debug!(email.id = row.0, "email enqueued");
    Ok(EmailId(row.0))
}

/// Read a row the calling transaction already holds the lock on.
pub(super) async fn fetch_locked(conn: &mut PgConnection, id: EmailId) -> Result<Email> {
    let row: Option<EmailRow> =
        sqlx::query_as("SELECT id, recipient, subject, body FROM email_outbox WHERE id = $1")
            .bind(id.0)
            .fetch_optional(conn)
            .await?;

    row.map(Email::from).ok_or_else(|| {
        Error::InvariantViolation(format!("email {id} vanished while locked by its claimer"))
    })
}

pub(super) async fn remove(tx: &mut OutboxTx, strategy: Strategy, email: &Email) -> Result<()> {
    let id = email.id.ok_or_else(|| {
        Error::ProtocolViolation("cannot remove an email that was never persisted".to_string())
    })?;
    tx.ensure_claimed(id)?;

    let rows_affected = sqlx::query("DELETE FROM email_outbox WHERE id = $1")
        .bind(id.0)
        .execute(tx.conn())
        .await?
        .rows_affected();

    if rows_affected == 0 {
        return Err(Error::InvariantViolation(format!(
            "email {id} was locked by transaction {} but no row was deleted",
            tx.id()
        )));
    }
    tx.release_claim(id);
    super::record_removed(tx.id(), strategy, id);
    Ok(())
}
