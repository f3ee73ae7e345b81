//! Worker loop: claim an email, hand it to a [`Handler`], remove it on success.
//!
//! Each iteration is one unit of work: begin, claim, handle, then
//! remove-and-commit or just commit. Workers share nothing but the outbox;
//! the row lock taken by the claim keeps them off each other's emails.

use crate::error::{Error, Result};
use crate::model::{Email, EmailId};
use crate::outbox::Outbox;
use crate::telemetry::claim::start_deliver_span;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{Instrument, error, info, warn};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Processes one claimed email, e.g. hands it to an SMTP relay.
///
/// An `Err` leaves the email in the outbox; its lock is released when the
/// worker commits, so any worker may claim it again. Retry policy is the
/// handler's business.
pub trait Handler: Send + Sync {
    fn handle(&self, email: &Email) -> impl Future<Output = std::result::Result<(), BoxError>> + Send;
}

/// Configuration for a worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Pause after an empty claim, a handler failure, or a transient error.
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// What a single iteration did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Handled, removed and committed.
    Delivered(EmailId),
    /// Handler failed; the email stays in the outbox.
    Failed(EmailId),
    /// Nothing to claim.
    Idle,
}

/// A claim/handle/remove loop. Clones share the outbox, handler and
/// shutdown signal, so one `shutdown()` stops all of them.
pub struct Worker<O, H> {
    outbox: Arc<O>,
    handler: Arc<H>,
    config: WorkerConfig,
    shutdown: Arc<Notify>,
    stopping: Arc<AtomicBool>,
}

impl<O, H> Clone for Worker<O, H> {
    fn clone(&self) -> Self {
        Self {
            outbox: Arc::clone(&self.outbox),
            handler: Arc::clone(&self.handler),
            config: self.config.clone(),
            shutdown: Arc::clone(&self.shutdown),
            stopping: Arc::clone(&self.stopping),
        }
    }
}

impl<O: Outbox, H: Handler> Worker<O, H> {
    pub fn new(outbox: Arc<O>, handler: Arc<H>, config: WorkerConfig) -> Self {
        Self {
            outbox,
            handler,
            config,
            shutdown: Arc::new(Notify::new()),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Signal every clone of this worker to stop after its current iteration.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Run until shutdown. Returns `Err` only for non-retryable outbox errors.
    pub async fn run(&self, worker: usize) -> Result<()> {
        info!(worker, strategy = %self.outbox.strategy(), "worker started");

        while !self.is_stopping() {
            let pause = match self.step(worker).await {
                Ok(Step::Delivered(_)) => false,
                Ok(Step::Failed(_) | Step::Idle) => true,
                Err(e) if e.is_retryable() => {
                    warn!(worker, error = %e, "transient outbox failure, backing off");
                    true
                }
                Err(e) => {
                    error!(worker, error = %e, "worker stopping on outbox error");
                    return Err(e);
                }
            };

            if pause {
                tokio::select! {
                    _ = self.shutdown.notified() => {}
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        info!(worker, "worker stopped");
        Ok(())
    }

    /// One unit of work. An error drops the open transaction, which rolls
    /// it back and releases any lock it took.
    pub async fn step(&self, worker: usize) -> Result<Step> {
        let mut tx = self.outbox.begin().await?;

        let Some(email) = self.outbox.claim_one(&mut tx).await? else {
            self.outbox.commit(tx).await?;
            return Ok(Step::Idle);
        };
        let id = email
            .id
            .ok_or_else(|| Error::InvariantViolation("claimed email has no id".to_string()))?;

        async {
            match self.handler.handle(&email).await {
                Ok(()) => {
                    self.outbox.remove(&mut tx, &email).await?;
                    self.outbox.commit(tx).await?;
                    info!(email.id = %id, "email delivered");
                    Ok(Step::Delivered(id))
                }
                Err(e) => {
                    metrics::handler_failures().add(
                        1,
                        &[KeyValue::new("strategy", self.outbox.strategy().to_string())],
                    );
                    warn!(error = %e, "handler failed, leaving email in outbox");
                    self.outbox.commit(tx).await?;
                    Ok(Step::Failed(id))
                }
            }
        }
        .instrument(start_deliver_span(worker, id))
        .await
    }
}
