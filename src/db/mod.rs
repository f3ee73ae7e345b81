//! Database connection pool and health check.
//!
//! One Postgres pool shared by producers and consumers. Every open
//! [`OutboxTx`](crate::outbox::OutboxTx) pins one pooled connection until it
//! is committed or rolled back, so size the pool for the number of
//! concurrent consumers plus producers.

use crate::error::Result;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Database handle. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        tracing::debug!(max_connections, "connected to postgres");
        Ok(Self { pool })
    }

    /// Wrap a pool built elsewhere, e.g. one whose connections run as a
    /// specific role.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Simple health check — run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Close the pool, waiting for checked-out connections to come back.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}
