//! Emulated skip-lock claiming by per-row lock probing.
//!
//! Does not use `SKIP LOCKED`. Instead provisioning installs two routines:
//!
//! - `email_outbox_try_lock(candidate)` makes one `FOR UPDATE NOWAIT`
//!   attempt on a single row and reports the outcome as `locked`,
//!   `unavailable` (another open transaction holds it) or `gone` (deleted
//!   and committed since the caller's cursor was opened). Only
//!   `lock_not_available` (SQLSTATE 55P03) is turned into an outcome; every
//!   other error propagates.
//! - `next_email(excluded)` opens a cursor over ids in ascending order and
//!   branches on each attempt's outcome, returning the first id it locks or
//!   NULL when the cursor runs out.
//!
//! The whole walk runs server-side in the caller's transaction, so each
//! claim is one round trip no matter how many locked rows sit ahead of the
//! first free one. The caller then reads the full row by id; the row is
//! already locked, so that read cannot race another claimer.

use super::{Outbox, OutboxTx, Strategy, finish_claim, pg};
use crate::db::Db;
use crate::error::Result;
use crate::model::{Email, EmailId};
use crate::telemetry::claim::start_claim_span;
use std::time::Instant;
use tracing::Instrument;

const CREATE_TRY_LOCK: &str = r#"
CREATE OR REPLACE FUNCTION email_outbox_try_lock(candidate BIGINT) RETURNS TEXT
LANGUAGE plpgsql AS $$
BEGIN
    PERFORM 1 FROM email_outbox WHERE id = candidate FOR UPDATE NOWAIT;
    IF FOUND THEN
        RETURN 'locked';
    END IF;
    RETURN 'gone';
EXCEPTION
    WHEN lock_not_available THEN
        RETURN 'unavailable';
END;
$$
"#;

const CREATE_NEXT_EMAIL: &str = r#"
CREATE OR REPLACE FUNCTION next_email(excluded BIGINT[] DEFAULT '{}') RETURNS BIGINT
LANGUAGE plpgsql AS $$
DECLARE
    candidate RECORD;
    outcome TEXT;
BEGIN
    FOR candidate IN
        SELECT id FROM email_outbox WHERE id <> ALL(excluded) ORDER BY id
    LOOP
        outcome := email_outbox_try_lock(candidate.id);
        CASE outcome
            WHEN 'locked' THEN
                RETURN candidate.id;
            WHEN 'unavailable', 'gone' THEN
                CONTINUE;
            ELSE
                RAISE EXCEPTION 'unexpected lock outcome % for email %', outcome, candidate.id;
        END CASE;
    END LOOP;
    RETURN NULL;
END;
$$
"#;

/// Outbox that walks candidates in id order, probing each with a
/// non-waiting row lock.
#[derive(Clone)]
pub struct ProbeOutbox {
    db: Db,
}

impl ProbeOutbox {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

impl Outbox for ProbeOutbox {
    type Tx = OutboxTx;

    fn strategy(&self) -> Strategy {
        Strategy::Probe
    }

    async fn provision_schema(&self) -> Result<()> {
        pg::create_table(self.db.pool()).await?;
        // next_email calls email_outbox_try_lock, so install that first.
        sqlx::query(CREATE_TRY_LOCK).execute(self.db.pool()).await?;
        sqlx::query(CREATE_NEXT_EMAIL).execute(self.db.pool()).await?;
        tracing::info!(strategy = %self.strategy(), "outbox schema and claim routines provisioned");
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
            let (id,): (Option<i64>,) = sqlx::query_as("SELECT next_email($1)")
                .bind(&held)
                .fetch_one(tx.conn())
                .await?;

            let claimed = match id {
                Some(id) => Some(pg::fetch_locked(tx.conn(), EmailId(id)).await?),
                None => None,
            };
            let id = tx.id();
            finish_claim(id, tx.ledger_mut(), self.strategy(), started, claimed)
        }
        .instrument(span)
        .await
    }

    async fn remove(&self, tx: &mut OutboxTx, email: &Email) -> Result<()> {
        pg::remove(tx, self.strategy(), email).await
    }
}
