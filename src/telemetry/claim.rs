//! Span helpers for claiming and delivering emails.

use crate::model::EmailId;
use crate::outbox::TxId;
use tracing::Span;

/// Start a span for one claim attempt.
///
/// `email.id` is declared empty and filled by [`record_claimed`] when the
/// claim locks a row.
pub fn start_claim_span(strategy: &str, tx: &TxId) -> Span {
    tracing::debug_span!(
        "outbox.claim",
        "outbox.strategy" = strategy,
        "tx.id" = %tx,
        "email.id" = tracing::field::Empty,
    )
}

pub fn record_claimed(span: &Span, id: EmailId) {
    span.record("email.id", id.0);
}

/// Start a span covering a worker's handling of one claimed email.
pub fn start_deliver_span(worker: usize, id: EmailId) -> Span {
    tracing::info_span!("outbox.deliver", "worker" = worker, "email.id" = id.0)
}
