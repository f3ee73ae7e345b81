//! Transaction handle threaded through claim, remove and commit.

use crate::error::{Error, Result};
use crate::model::EmailId;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Identifies one unit of work in logs and spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxId(pub Uuid);

impl TxId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TxId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// An open Postgres transaction plus the emails it has claimed.
///
/// Created by `Outbox::begin`, finished by `Outbox::commit` or
/// `Outbox::rollback`. Dropping it unfinished rolls back.
pub struct OutboxTx {
    id: TxId,
    inner: Transaction<'static, Postgres>,
    ledger: ClaimLedger,
}

impl OutboxTx {
    pub(crate) async fn begin(pool: &PgPool) -> Result<Self> {
        let inner = pool.begin().await?;
        let id = TxId::new();
        tracing::trace!(tx = %id, "transaction started");
        Ok(Self {
            id,
            inner,
            ledger: ClaimLedger::default(),
        })
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    /// Emails claimed through this handle and not yet removed.
    pub fn claimed(&self) -> impl Iterator<Item = EmailId> + '_ {
        self.ledger.ids()
    }

    pub(crate) fn conn(&mut self) -> &mut PgConnection {
        &mut *self.inner
    }

    /// Claimed ids as a bind-ready array, so a second claim in the same
    /// transaction skips rows this transaction already holds.
    pub(crate) fn claimed_ids(&self) -> Vec<i64> {
        self.ledger.ids().map(|id| id.0).collect()
    }

    pub(crate) fn ledger_mut(&mut self) -> &mut ClaimLedger {
        &mut self.ledger
    }

    pub(crate) fn ensure_claimed(&self, id: EmailId) -> Result<()> {
        self.ledger.ensure(id, self.id)
    }

    pub(crate) fn release_claim(&mut self, id: EmailId) {
        self.ledger.release(id);
    }

    pub(crate) async fn commit(self) -> Result<()> {
        let held = self.ledger.len();
        self.inner.commit().await?;
        tracing::trace!(tx = %self.id, held, "transaction committed");
        Ok(())
    }

    pub(crate) async fn rollback(self) -> Result<()> {
        let held = self.ledger.len();
        self.inner.rollback().await?;
        tracing::debug!(tx = %self.id, held, "transaction rolled back");
        Ok(())
    }
}

impl std::fmt::Debug for OutboxTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxTx")
            .field("id", &self.id)
            .field("claimed", &self.ledger.ids)
            .finish()
    }
}

/// Emails a transaction holds row locks on. Shared by every backend's
/// handle type.
#[derive(Debug, Default)]
pub(crate) struct ClaimLedger {
    ids: BTreeSet<EmailId>,
}

impl ClaimLedger {
    pub(crate) fn ids(&self) -> impl Iterator<Item = EmailId> + '_ {
        self.ids.iter().copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.ids.len()
    }

    pub(crate) fn record(&mut self, id: EmailId) -> Result<()> {
        if !self.ids.insert(id) {
            return Err(Error::InvariantViolation(format!(
                "email {id} claimed twice in one transaction"
            )));
        }
        Ok(())
    }

    pub(crate) fn ensure(&self, id: EmailId, tx: TxId) -> Result<()> {
        if self.ids.contains(&id) {
            Ok(())
        } else {
            Err(Error::ProtocolViolation(format!(
                "email {id} was not claimed by transaction {tx}"
            )))
        }
    }

    pub(crate) fn release(&mut self, id: EmailId) {
        self.ids.remove(&id);
    }
}
