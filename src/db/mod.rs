//! Postgres backends: connection pool, migrations, and health check.
//!
//! One pool backs all three shared resources: the `works`/`tasks` tables
//! (`JobStore`), the `token_pools` counter row (`TokenStore`), and the pgmq
//! queue (`JobQueue`).

pub mod pgmq;
pub mod tokens;
pub mod work;

use crate::error::Result;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

pub use pgmq::PgmqQueue;

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
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Round-trip a `SELECT 1`.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Clamp a duration to whole seconds for pgmq's integer arguments.
pub(crate) fn whole_seconds(d: std::time::Duration) -> i32 {
    d.as_secs().min(i32::MAX as u64) as i32
}
