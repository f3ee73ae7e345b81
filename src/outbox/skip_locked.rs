//! Native skip-lock claiming.
//!
//! A single `SELECT ... LIMIT 1 FOR UPDATE SKIP LOCKED` both picks and locks
//! a row; rows held by other open transactions are silently left out instead
//! of waited on. Without an ordering clause Postgres returns whichever
//! unlocked row it reaches first, so concurrent claimers get no relative
//! ordering. [`SkipLockedOutbox::fifo`] adds `ORDER BY id` for callers that
//! want ascending delivery.

use super::{Outbox, OutboxTx, Strategy, finish_claim, pg};
use crate::db::Db;
use crate::error::Result;
use crate::model::{Email, EmailId};
use crate::telemetry::claim::start_claim_span;
use std::time::Instant;
use tracing::Instrument;

const CLAIM: &str = "
    SELECT id, recipient, subject, body FROM email_outbox
    WHERE id <> ALL($1)
    LIMIT 1
    FOR UPDATE SKIP LOCKED";

const CLAIM_FIFO: &str = "
    SELECT id, recipient, subject, body FROM email_outbox
    WHERE id <> ALL($1)
    ORDER BY id
    LIMIT 1
    FOR UPDATE SKIP LOCKED";

/// Outbox backed by `FOR UPDATE SKIP LOCKED`.
#[derive(Clone)]
pub struct SkipLockedOutbox {
    db: Db,
    fifo: bool,
}

impl SkipLockedOutbox {
    pub fn new(db: Db) -> Self {
        Self { db, fifo: false }
    }

    /// Claim in ascending id order. Concurrent claimers then all start from
    /// the head of the table and skip past each other's locks.
    pub fn fifo(mut self, fifo: bool) -> Self {
        self.fifo = fifo;
        self
    }
}

impl Outbox for SkipLockedOutbox {
    type Tx = OutboxTx;

    fn strategy(&self) -> Strategy {
        Strategy::SkipLocked
    }

    async fn provision_schema(&self) -> Result<()> {
        pg::create_table(self.db.pool()).await?;
        tracing::info!(strategy = %self.strategy(), "outbox schema provisioned");
        Ok(())
    }

    async fn reset_all(&self) -> Result<()> {
        pg::reset(self.db.pool()).await
    }

    async fn count(&self) -> Result<i64> {
        pg::count(self.db.pool()).await
    }

    async fn begin(&self) -> Result<OutboxTx> {
        OutboxTx::begin(self.db.pool()).await
    }

    async fn commit(&self, tx: OutboxTx) -> Result<()> {
        tx.commit().await
    }

    async fn rollback(&self, tx: OutboxTx) -> Result<()> {
        tx.rollback().await
    }

    async fn insert(&self, email: &Email) -> Result<EmailId> {
        pg::insert(self.db.pool(), self.strategy(), email).await
    }

    async fn claim_one(&self, tx: &mut OutboxTx) -> Result<Option<Email>> {
        let span = start_claim_span(&self.strategy().to_string(), &tx.id());
        async {
            let started = Instant::now();
            let held = tx.claimed_ids();
            let row: Option<pg::EmailRow> =
                sqlx::query_as(if self.fifo { CLAIM_FIFO } else { CLAIM })
                    .bind(&held)
                    .fetch_optional(tx.conn())
                    .await?;

            let id = tx.id();
            finish_claim(id, tx.ledger_mut(), self.strategy(), started, row.map(Email::from))
        }
        .instrument(span)
        .await
    }

    async fn remove(&self, tx: &mut OutboxTx, email: &Email) -> Result<()> {
        pg::remove(tx, self.strategy(), email).await
    }
}
