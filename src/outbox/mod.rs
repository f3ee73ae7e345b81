//! The outbox contract and its two claim strategies.
//!
//! Producers [`insert`](Outbox::insert) outside any transaction. Consumers
//! [`begin`](Outbox::begin) a unit of work, [`claim_one`](Outbox::claim_one)
//! an email (selecting and row-locking it), [`remove`](Outbox::remove) it once
//! processed, and [`commit`](Outbox::commit). The row lock taken by the claim
//! is the only thing keeping two consumers off the same email; it lives until
//! the owning transaction commits or rolls back.
//!
//! - [`SkipLockedOutbox`] relies on Postgres' `FOR UPDATE SKIP LOCKED`.
//! - [`ProbeOutbox`] emulates skip-locked with a server-side routine that
//!   walks candidates in id order and tries `FOR UPDATE NOWAIT` on each.
//! - `OracleOutbox` (cargo feature `oracle`) runs the same probing walk as
//!   PL/SQL on Oracle.

#[cfg(feature = "oracle")]
pub mod oracle;
mod pg;
pub mod probe;
pub mod skip_locked;
pub mod tx;

#[cfg(feature = "oracle")]
pub use self::oracle::{OracleOutbox, OracleTx};
pub use probe::ProbeOutbox;
pub use skip_locked::SkipLockedOutbox;
pub use tx::{OutboxTx, TxId};

use crate::error::{Error, Result};
use crate::model::{Email, EmailId};
use crate::telemetry::{claim, metrics};
use opentelemetry::KeyValue;
use std::future::Future;
use std::time::Instant;
use tx::ClaimLedger;

/// Which claim strategy an outbox uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Native `FOR UPDATE SKIP LOCKED`.
    SkipLocked,
    /// Server-side `FOR UPDATE NOWAIT` probing in ascending id order.
    Probe,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Strategy::SkipLocked => "skip-locked",
            Strategy::Probe => "probe",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip-locked" | "skip_locked" | "native" => Ok(Strategy::SkipLocked),
            "probe" | "emulated" => Ok(Strategy::Probe),
            other => Err(Error::Config(format!(
                "unknown outbox strategy '{other}' (expected 'skip-locked' or 'probe')"
            ))),
        }
    }
}

/// Operations every outbox backend provides.
///
/// `Tx` is the transaction handle. `commit` and `rollback` take it by value,
/// so a finished handle cannot be reused. Dropping a handle without either
/// rolls the transaction back and releases its locks.
pub trait Outbox: Send + Sync {
    type Tx: Send;

    fn strategy(&self) -> Strategy;

    /// Create the backing table (and any server-side routines). Idempotent.
    fn provision_schema(&self) -> impl Future<Output = Result<()>> + Send;

    /// Delete every persisted email. Test and bench setup only.
    fn reset_all(&self) -> impl Future<Output = Result<()>> + Send;

    /// Number of persisted emails, claimed or not. Approximate under concurrency.
    fn count(&self) -> impl Future<Output = Result<i64>> + Send;

    fn begin(&self) -> impl Future<Output = Result<Self::Tx>> + Send;

    /// Make removals durable and release every lock held by `tx`.
    fn commit(&self, tx: Self::Tx) -> impl Future<Output = Result<()>> + Send;

    /// Discard removals and release every lock held by `tx`.
    fn rollback(&self, tx: Self::Tx) -> impl Future<Output = Result<()>> + Send;

    /// Persist a new email outside any caller transaction. Visible to
    /// claimers as soon as this returns.
    fn insert(&self, email: &Email) -> impl Future<Output = Result<EmailId>> + Send;

    /// Select and lock one email nobody else holds. `Ok(None)` when every
    /// persisted email is locked elsewhere or the outbox is empty. Never
    /// waits on another transaction's lock.
    fn claim_one(&self, tx: &mut Self::Tx) -> impl Future<Output = Result<Option<Email>>> + Send;

    /// Delete an email previously claimed through `tx`. Anything else is a
    /// [`Error::ProtocolViolation`].
    fn remove(&self, tx: &mut Self::Tx, email: &Email) -> impl Future<Output = Result<()>> + Send;
}

/// Book-keeping common to every successful or empty claim, whatever the
/// backend.
fn finish_claim(
    tx: TxId,
    ledger: &mut ClaimLedger,
    strategy: Strategy,
    started: Instant,
    claimed: Option<Email>,
) -> Result<Option<Email>> {
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    let result = match claimed.as_ref().and_then(|email| email.id) {
        Some(id) => {
            ledger.record(id)?;
            claim::record_claimed(&tracing::Span::current(), id);
            tracing::debug!(tx = %tx, email.id = %id, elapsed_ms, "email claimed");
            "claimed"
        }
        None => {
            tracing::trace!(tx = %tx, elapsed_ms, "nothing to claim");
            "empty"
        }
    };

    let labels = [
        KeyValue::new("strategy", strategy.to_string()),
        KeyValue::new("result", result),
    ];
    metrics::claims().add(1, &labels);
    metrics::claim_duration_ms().record(elapsed_ms, &labels);
    Ok(claimed)
}

fn record_removed(tx: TxId, strategy: Strategy, id: EmailId) {
    metrics::emails_removed().add(1, &[KeyValue::new("strategy", strategy.to_string())]);
    tracing::debug!(tx = %tx, email.id = %id, "email removed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_parses_aliases() {
        assert_eq!("skip-locked".parse::<Strategy>().unwrap(), Strategy::SkipLocked);
        assert_eq!("NATIVE".parse::<Strategy>().unwrap(), Strategy::SkipLocked);
        assert_eq!(" probe ".parse::<Strategy>().unwrap(), Strategy::Probe);
        assert_eq!("emulated".parse::<Strategy>().unwrap(), Strategy::Probe);
    }

    #[test]
    fn strategy_display_round_trips() {
        for strategy in [Strategy::SkipLocked, Strategy::Probe] {
            assert_eq!(strategy.to_string().parse::<Strategy>().unwrap(), strategy);
        }
    }

    #[test]
    fn unknown_strategy_is_config_error() {
        let err = "oracle".parse::<Strategy>().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
