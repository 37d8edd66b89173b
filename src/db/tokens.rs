//! Token counters in the `token_pools` table.
//!
//! The compare-and-swap is a conditional `UPDATE … WHERE tokens = $expected`;
//! a concurrent writer makes it affect zero rows.

use async_trait::async_trait;

use super::Db;
use crate::error::Result;
use crate::tokens::TokenStore;

#[async_trait]
impl TokenStore for Db {
    async fn get(&self, key: &str) -> Result<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT tokens FROM token_pools WHERE key = $1")
            .bind(key)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(|r| r.0))
    }

    async fn set_if_absent(&self, key: &str, value: i64) -> Result<bool> {
        let inserted = sqlx::query(
            "INSERT INTO token_pools (key, tokens, updated_at) VALUES ($1, $2, now())
             ON CONFLICT (key) DO NOTHING",
        )
        .bind(key)
        .bind(value)
        .execute(self.pool())
        .await?
        .rows_affected();
        Ok(inserted == 1)
    }

    async fn compare_and_swap(&self, key: &str, expected: i64, new: i64) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE token_pools SET tokens = $3, updated_at = now()
             WHERE key = $1 AND tokens = $2",
        )
        .bind(key)
        .bind(expected)
        .bind(new)
        .execute(self.pool())
        .await?
        .rows_affected();
        Ok(updated == 1)
    }

    async fn increment(&self, key: &str) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO token_pools (key, tokens, updated_at) VALUES ($1, 1, now())
             ON CONFLICT (key) DO UPDATE SET tokens = token_pools.tokens + 1, updated_at = now()
             RETURNING tokens",
        )
        .bind(key)
        .fetch_one(self.pool())
        .await?;
        Ok(row.0)
    }

    async fn set(&self, key: &str, value: i64) -> Result<Option<i64>> {
        let mut tx = self.pool().begin().await?;
        let previous: Option<(i64,)> =
            sqlx::query_as("SELECT tokens FROM token_pools WHERE key = $1 FOR UPDATE")
                .bind(key)
                .fetch_optional(&mut *tx)
                .await?;
        sqlx::query(
            "INSERT INTO token_pools (key, tokens, updated_at) VALUES ($1, $2, now())
             ON CONFLICT (key) DO UPDATE SET tokens = EXCLUDED.tokens, updated_at = now()",
        )
        .bind(key)
        .bind(value)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(previous.map(|r| r.0))
    }
}
