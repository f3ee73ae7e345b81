//! Oracle backend for the probe strategy.
//!
//! Provisioning creates the table (Oracle has no `CREATE TABLE IF NOT
//! EXISTS`, so it checks `user_tables` first) and installs two PL/SQL
//! functions shaped like their Postgres counterparts:
//!
//! - `email_outbox_try_lock(candidate)` runs one `SELECT ... FOR UPDATE
//!   NOWAIT` and answers `locked`, `unavailable` (ORA-00054, the row is
//!   held elsewhere) or `gone` (no such row any more). Every other
//!   exception propagates to the caller.
//! - `next_email(excluded)` walks ids in ascending order and returns the
//!   first one it locks, or NULL. `excluded` is a comma-separated list of
//!   ids the calling session already holds; Oracle would otherwise lock
//!   them again without complaint.
//!
//! The driver is synchronous, so every call runs on tokio's blocking pool.
//! Each [`OracleTx`] owns one session. Dropping it closes the session,
//! which rolls back whatever was not committed and releases its locks.

use super::tx::ClaimLedger;
use super::{Outbox, Strategy, TxId, finish_claim, record_removed};
use crate::config::OracleConfig;
use crate::error::{Error, Result};
use crate::model::{Email, EmailId};
use crate::telemetry::claim::start_claim_span;
use crate::telemetry::metrics;
use ::oracle::Connection;
use ::oracle::sql_type::OracleType;
use opentelemetry::KeyValue;
use secrecy::ExposeSecret;
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

const TABLE_EXISTS: &str = "SELECT COUNT(*) FROM user_tables WHERE table_name = 'EMAIL_OUTBOX'";

const CREATE_TABLE: &str = "
    CREATE TABLE email_outbox (
        id          NUMBER GENERATED BY DEFAULT ON NULL AS IDENTITY PRIMARY KEY,
        recipient   VARCHAR2(255) NOT NULL,
        subject     VARCHAR2(255) NOT NULL,
        body        VARCHAR2(4000) NOT NULL
    )";

const CREATE_TRY_LOCK: &str = "
CREATE OR REPLACE FUNCTION email_outbox_try_lock(candidate IN NUMBER) RETURN VARCHAR2 IS
    row_locked EXCEPTION;
    PRAGMA EXCEPTION_INIT(row_locked, -54);
    held_id NUMBER;
BEGIN
    SELECT id INTO held_id FROM email_outbox WHERE id = candidate FOR UPDATE NOWAIT;
    RETURN 'locked';
EXCEPTION
    WHEN row_locked THEN
        RETURN 'unavailable';
    WHEN NO_DATA_FOUND THEN
        RETURN 'gone';
END;";

const CREATE_NEXT_EMAIL: &str = "
CREATE OR REPLACE FUNCTION next_email(excluded IN VARCHAR2 DEFAULT NULL) RETURN NUMBER IS
    outcome VARCHAR2(16);
BEGIN
    FOR candidate IN (
        SELECT id FROM email_outbox
        WHERE excluded IS NULL
           OR INSTR(',' || excluded || ',', ',' || TO_CHAR(id) || ',') = 0
        ORDER BY id
    ) LOOP
        outcome := email_outbox_try_lock(candidate.id);
        CASE outcome
            WHEN 'locked' THEN
                RETURN candidate.id;
            WHEN 'unavailable' THEN
                NULL;
            WHEN 'gone' THEN
                NULL;
            ELSE
                RAISE_APPLICATION_ERROR(-20001,
                    'unexpected lock outcome ' || outcome || ' for email ' || candidate.id);
        END CASE;
    END LOOP;
    RETURN NULL;
END;";

const CALL_NEXT_EMAIL: &str = "BEGIN :1 := next_email(:2); END;";

const FETCH_LOCKED: &str = "SELECT recipient, subject, body FROM email_outbox WHERE id = :1";

const INSERT: &str = "
    INSERT INTO email_outbox (recipient, subject, body) VALUES (:1, :2, :3)
    RETURNING id INTO :4";

/// Outbox on Oracle, claiming by per-row `FOR UPDATE NOWAIT` probing.
#[derive(Clone)]
pub struct OracleOutbox {
    config: Arc<OracleConfig>,
}

/// An open Oracle session plus the emails it has claimed.
pub struct OracleTx {
    id: TxId,
    conn: Arc<Connection>,
    ledger: ClaimLedger,
}

impl OracleTx {
    pub fn id(&self) -> TxId {
        self.id
    }

    /// Emails claimed through this handle and not yet removed.
    pub fn claimed(&self) -> impl Iterator<Item = EmailId> + '_ {
        self.ledger.ids()
    }
}

impl std::fmt::Debug for OracleTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OracleTx")
            .field("id", &self.id)
            .field("claimed", &self.ledger)
            .finish()
    }
}

impl OracleOutbox {
    pub fn new(config: OracleConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    async fn connect(&self) -> Result<Connection> {
        let config = Arc::clone(&self.config);
        blocking(move || open_session(&config)).await
    }

    /// Run `f` on a fresh session that is closed afterwards.
    async fn with_session<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> ::oracle::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let config = Arc::clone(&self.config);
        blocking(move || {
            let conn = open_session(&config)?;
            f(&conn)
        })
        .await
    }
}

impl Outbox for OracleOutbox {
    type Tx = OracleTx;

    fn strategy(&self) -> Strategy {
        Strategy::Probe
    }

    async fn provision_schema(&self) -> Result<()> {
        let created = self
            .with_session(|conn| {
                let existing: i64 = conn.query_row(TABLE_EXISTS, &[])?.get(0usize)?;
                if existing == 0 {
                    conn.execute(CREATE_TABLE, &[])?;
                }
                // next_email calls email_outbox_try_lock, so install that first.
                conn.execute(CREATE_TRY_LOCK, &[])?;
                conn.execute(CREATE_NEXT_EMAIL, &[])?;
                Ok(existing == 0)
            })
            .await?;
        tracing::info!(
            backend = "oracle",
            table_created = created,
            "outbox schema and claim routines provisioned"
        );
        Ok(())
    }

    async fn reset_all(&self) -> Result<()> {
        self.with_session(|conn| conn.execute("TRUNCATE TABLE email_outbox", &[]).map(|_| ()))
            .await?;
        tracing::info!(backend = "oracle", "outbox truncated");
        Ok(())
    }

    async fn count(&self) -> Result<i64> {
        self.with_session(|conn| {
            conn.query_row("SELECT COUNT(*) FROM email_outbox", &[])?
                .get(0usize)
        })
        .await
    }

    async fn begin(&self) -> Result<OracleTx> {
        let conn = self.connect().await?;
        let id = TxId::new();
        tracing::trace!(tx = %id, "oracle session opened");
        Ok(OracleTx {
            id,
            conn: Arc::new(conn),
            ledger: ClaimLedger::default(),
        })
    }

    async fn commit(&self, tx: OracleTx) -> Result<()> {
        let OracleTx { id, conn, ledger } = tx;
        // The session closes on the blocking thread once the commit returns.
        blocking(move || conn.commit()).await?;
        tracing::trace!(tx = %id, held = ledger.len(), "transaction committed");
        Ok(())
    }

    async fn rollback(&self, tx: OracleTx) -> Result<()> {
        let OracleTx { id, conn, ledger } = tx;
        blocking(move || conn.rollback()).await?;
        tracing::debug!(tx = %id, held = ledger.len(), "transaction rolled back");
        Ok(())
    }

    async fn insert(&self, email: &Email) -> Result<EmailId> {
        let fields = (
            email.recipient.clone(),
            email.subject.clone(),
            email.body.clone(),
        );
        let id = self
            .with_session(move |conn| {
                let (recipient, subject, body) = fields;
                let mut stmt = conn.statement(INSERT).build()?;
                stmt.execute(&[&recipient, &subject, &body, &None::<i64>])?;
                let ids: Vec<i64> = stmt.returned_values(4usize)?;
                conn.commit()?;
                Ok(ids.first().copied())
            })
            .await?
            .ok_or_else(|| Error::InvariantViolation("insert returned no id".to_string()))?;

        metrics::emails_enqueued().add(1, &[KeyValue::new("strategy", self.strategy().to_string())]);
        tracing::debug!(email.id = id, "email enqueued");
        Ok(EmailId(id))
    }

    async fn claim_one(&self, tx: &mut OracleTx) -> Result<Option<Email>> {
        let span = start_claim_span(&self.strategy().to_string(), &tx.id);
        async {
            let started = Instant::now();
            let conn = Arc::clone(&tx.conn);
            let excluded = excluded_list(tx.ledger.ids());

            let locked = blocking(move || {
                let mut stmt = conn.statement(CALL_NEXT_EMAIL).build()?;
                stmt.execute(&[&OracleType::Int64, &excluded])?;
                let Some(id) = stmt.bind_value::<_, Option<i64>>(1usize)? else {
                    return Ok(None);
                };
                let row = conn
                    .query_as::<(String, String, String)>(FETCH_LOCKED, &[&id])?
                    .next()
                    .transpose()?;
                Ok(Some((id, row)))
            })
            .await?;

            let claimed = match locked {
                None => None,
                Some((id, Some((recipient, subject, body)))) => Some(Email {
                    id: Some(EmailId(id)),
                    recipient,
                    subject,
                    body,
                }),
                Some((id, None)) => {
                    return Err(Error::InvariantViolation(format!(
                        "email {id} vanished while locked by its claimer"
                    )));
                }
            };
            finish_claim(tx.id, &mut tx.ledger, self.strategy(), started, claimed)
        }
        .instrument(span)
        .await
    }

    async fn remove(&self, tx: &mut OracleTx, email: &Email) -> Result<()> {
        let id = email.id.ok_or_else(|| {
            Error::ProtocolViolation("cannot remove an email that was never persisted".to_string())
        })?;
        tx.ledger.ensure(id, tx.id)?;

        let conn = Arc::clone(&tx.conn);
        let deleted = blocking(move || {
            conn.execute("DELETE FROM email_outbox WHERE id = :1", &[&id.0])?
                .row_count()
        })
        .await?;

        if deleted == 0 {
            return Err(Error::InvariantViolation(format!(
                "email {id} was locked by transaction {} but no row was deleted",
                tx.id
            )));
        }
        tx.ledger.release(id);
        record_removed(tx.id, self.strategy(), id);
        Ok(())
    }
}

fn open_session(config: &OracleConfig) -> ::oracle::Result<Connection> {
    Connection::connect(
        &config.username,
        config.password.expose_secret(),
        &config.connect_string,
    )
}

/// Run a synchronous driver call off the async workers.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> ::oracle::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Other(format!("oracle call did not complete: {e}")))?
        .map_err(Error::from)
}

/// Ids for `next_email`'s `excluded` argument. Empty binds as NULL.
fn excluded_list(ids: impl Iterator<Item = EmailId>) -> String {
    ids.map(|id| id.0.to_string()).collect::<Vec<_>>().join(",")
}
