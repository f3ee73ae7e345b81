//! Metric instrument factories for email-outbox.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without a provider (no OTLP endpoint) every instrument is a no-op.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("email-outbox")
}

/// Counter: emails inserted.
/// Labels: `strategy`.
pub fn emails_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("outbox.emails.enqueued")
        .with_description("Number of emails inserted into the outbox")
        .build()
}

/// Counter: claim attempts.
/// Labels: `strategy`, `result` ("claimed" | "empty").
pub fn claims() -> Counter<u64> {
    meter()
        .u64_counter("outbox.claims")
        .with_description("Number of claim attempts")
        .build()
}

/// Counter: emails deleted after processing.
/// Labels: `strategy`.
pub fn emails_removed() -> Counter<u64> {
    meter()
        .u64_counter("outbox.emails.removed")
        .with_description("Number of emails removed by their claimer")
        .build()
}

/// Histogram: time spent selecting and locking one email.
/// Labels: `strategy`, `result`.
pub fn claim_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("outbox.claim.duration_ms")
        .with_description("Claim duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: emails a worker's handler failed on (left in the outbox).
/// Labels: `strategy`.
pub fn handler_failures() -> Counter<u64> {
    meter()
        .u64_counter("outbox.worker.handler_failures")
        .with_description("Number of claimed emails whose handler failed")
        .build()
}
