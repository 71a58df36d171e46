// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embedded schema for the SQLite store.
//!
//! One session table plus [`SHARD_COUNT`](crate::store::SHARD_COUNT) partitions
//! each of the inbox, outbox and request tables. Products embedding
//! mats-websocket on their own pool call [`run_sqlite`];
//! [`SqliteStore::from_path`](crate::SqliteStore::from_path) does so itself.
//!
//! ```ignore
//! let pool = SqlitePool::connect("sqlite:csaf.db?mode=rwc").await?;
//! mats_websocket::migrations::run_sqlite(&pool).await?;
//! ```

use tracing::debug;

use crate::error::Result;

pub static SQLITE: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Brings the schema up to date. Already applied migrations are skipped.
pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<()> {
    SQLITE.run(pool).await?;
    debug!(
        migrations = SQLITE.iter().count(),
        "Cluster store-and-forward schema up to date"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SHARD_COUNT;
    use sqlx::sqlite::SqlitePoolOptions;

    #[tokio::test]
    async fn test_every_partition_is_created() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_sqlite(&pool).await.unwrap();
        run_sqlite(&pool).await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE 'mats_socket_%'",
        )
        .fetch_all(&pool)
        .await
        .unwrap();

        assert_eq!(tables.len(), 1 + 3 * SHARD_COUNT);
        for kind in ["inbox", "outbox", "request_out"] {
            let last = format!("mats_socket_{kind}_{:02}", SHARD_COUNT - 1);
            assert!(tables.contains(&last), "missing {last}");
        }
    }
}
