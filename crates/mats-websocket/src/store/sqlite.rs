// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed cluster store-and-forward.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::{debug, info};

use super::{
    ClientInfo, ClusterStoreAndForward, CsafSession, CurrentNode, MessageType, OutboxMessage,
    RequestCorrelation, SessionFilter, StoredInMessage, StoredOutMessage, from_millis, now,
    shard_for,
};
use crate::error::{CsafError, Result};
use crate::migrations;

/// Name of the partition of `kind` (`inbox`, `outbox` or `request_out`) holding the session's rows.
fn box_table(kind: &str, session_id: &str) -> String {
    format!("mats_socket_{kind}_{:02}", shard_for(session_id))
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    session_id: String,
    connection_id: Option<String>,
    nodename: Option<String>,
    user_id: String,
    client_lib: String,
    app_name: String,
    app_version: String,
    created_timestamp: i64,
    liveliness_timestamp: i64,
}

impl From<SessionRow> for CsafSession {
    fn from(row: SessionRow) -> Self {
        CsafSession {
            session_id: row.session_id,
            user_id: row.user_id,
            nodename: row.nodename,
            connection_id: row.connection_id,
            client: ClientInfo {
                client_lib: row.client_lib,
                app_name: row.app_name,
                app_version: row.app_version,
            },
            created_at: from_millis(row.created_timestamp),
            liveliness_at: from_millis(row.liveliness_timestamp),
        }
    }
}

#[derive(sqlx::FromRow)]
struct InboxRow {
    session_id: String,
    cmid: String,
    stored_timestamp: i64,
    full_envelope: Option<String>,
    message_binary: Option<Vec<u8>>,
}

impl From<InboxRow> for StoredInMessage {
    fn from(row: InboxRow) -> Self {
        StoredInMessage {
            session_id: row.session_id,
            client_message_id: row.cmid,
            stored_at: from_millis(row.stored_timestamp),
            full_envelope: row.full_envelope,
            message_binary: row.message_binary,
        }
    }
}

#[derive(sqlx::FromRow)]
struct OutboxRow {
    session_id: String,
    smid: String,
    cmid: Option<String>,
    stored_timestamp: i64,
    attempt_timestamp: Option<i64>,
    delivery_count: i64,
    trace_id: String,
    #[sqlx(rename = "type")]
    message_type: String,
    envelope: String,
    message_text: Option<String>,
    message_binary: Option<Vec<u8>>,
}

impl TryFrom<OutboxRow> for StoredOutMessage {
    type Error = CsafError;

    fn try_from(row: OutboxRow) -> Result<Self> {
        let message_type = MessageType::parse(&row.message_type).ok_or_else(|| {
            CsafError::data_access(
                "get_messages_from_outbox",
                format!("unknown message type '{}' for smid '{}'", row.message_type, row.smid),
            )
        })?;
        Ok(StoredOutMessage {
            message: OutboxMessage {
                session_id: row.session_id,
                server_message_id: row.smid,
                client_message_id: row.cmid,
                trace_id: row.trace_id,
                message_type,
                envelope: row.envelope,
                message_text: row.message_text,
                message_binary: row.message_binary,
            },
            stored_at: from_millis(row.stored_timestamp),
            attempt_at: row.attempt_timestamp.map(from_millis),
            delivery_count: u32::try_from(row.delivery_count).unwrap_or_default(),
        })
    }
}

#[derive(sqlx::FromRow)]
struct CorrelationRow {
    session_id: String,
    smid: String,
    request_timestamp: i64,
    reply_terminator_id: String,
    correlation_text: Option<String>,
    correlation_binary: Option<Vec<u8>>,
}

impl From<CorrelationRow> for RequestCorrelation {
    fn from(row: CorrelationRow) -> Self {
        RequestCorrelation {
            session_id: row.session_id,
            server_message_id: row.smid,
            requested_at: from_millis(row.request_timestamp),
            reply_terminator_id: row.reply_terminator_id,
            correlation_text: row.correlation_text,
            correlation_binary: row.correlation_binary,
        }
    }
}

const OUTBOX_COLUMNS: &str = "session_id, smid, cmid, stored_timestamp, attempt_timestamp, \
     delivery_count, trace_id, type, envelope, message_text, message_binary";

/// SQLite-backed [`ClusterStoreAndForward`].
///
/// Every node of the cluster points its own `SqliteStore` at the same database.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    nodename: String,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("nodename", &self.nodename)
            .field("pool", &"...")
            .finish()
    }
}

impl SqliteStore {
    /// Create a store on an existing, already migrated pool.
    pub fn new(pool: SqlitePool, nodename: impl Into<String>) -> Self {
        Self {
            pool,
            nodename: nodename.into(),
        }
    }

    /// Create and initialize a store from a database file path.
    ///
    /// Creates missing parent directories and the database file, connects, and
    /// runs the embedded migrations.
    pub async fn from_path(path: impl AsRef<Path>, nodename: impl Into<String>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                CsafError::data_access(
                    "create_dir",
                    format!("failed to create directory {parent:?}: {e}"),
                )
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| {
                CsafError::data_access(
                    "connect",
                    format!("failed to connect to SQLite at {path:?}: {e}"),
                )
            })?;

        migrations::run_sqlite(&pool).await?;
        info!(path = %path.display(), "Cluster store-and-forward database ready");

        Ok(Self::new(pool, nodename))
    }

    /// Get a reference to the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Messages of the session that were dead-lettered, in stored order.
    pub async fn dead_letters(&self, session_id: &str) -> Result<Vec<StoredOutMessage>> {
        let sql = format!(
            "SELECT {OUTBOX_COLUMNS} FROM {} \
             WHERE session_id = ? AND dlq_timestamp IS NOT NULL \
             ORDER BY stored_timestamp, rowid",
            box_table("outbox", session_id)
        );
        sqlx::query_as::<_, OutboxRow>(&sql)
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(StoredOutMessage::try_from)
            .collect()
    }

    async fn current_node(&self, session_id: &str) -> Result<Option<Option<CurrentNode>>> {
        let row: Option<(Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT nodename, connection_id FROM mats_socket_session WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(nodename, connection_id)| match (nodename, connection_id) {
            (Some(nodename), Some(connection_id)) => Some(CurrentNode {
                nodename,
                connection_id,
            }),
            _ => None,
        }))
    }

    /// Runs `sql` once per message id, in one transaction. The statement binds
    /// `extra` (if any), then the session id, then the message id.
    async fn for_each_message_id(
        &self,
        sql: &str,
        extra: Option<i64>,
        session_id: &str,
        message_ids: &[String],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for message_id in message_ids {
            let mut query = sqlx::query(sql);
            if let Some(value) = extra {
                query = query.bind(value);
            }
            query
                .bind(session_id)
                .bind(message_id.as_str())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

fn push_session_filter<'a>(builder: &mut QueryBuilder<'a, Sqlite>, filter: &'a SessionFilter) {
    builder.push(" WHERE 1 = 1");
    if filter.only_active {
        builder.push(" AND nodename IS NOT NULL");
    }
    if let Some(user_id) = &filter.user_id {
        builder.push(" AND user_id = ").push_bind(user_id.as_str());
    }
    if let Some(app_name) = &filter.app_name {
        builder.push(" AND app_name = ").push_bind(app_name.as_str());
    }
    if let Some(version) = &filter.app_version_at_or_above {
        builder.push(" AND app_version >= ").push_bind(version.as_str());
    }
}

#[async_trait]
impl ClusterStoreAndForward for SqliteStore {
    fn nodename(&self) -> &str {
        &self.nodename
    }

    async fn register_session_at_this_node(
        &self,
        session_id: &str,
        user_id: &str,
        connection_id: &str,
        client: &ClientInfo,
    ) -> Result<DateTime<Utc>> {
        // One statement: the owner check and the upsert cannot be split by a
        // concurrent registration. A different user updates nothing and gets no row back.
        let now = now().timestamp_millis();
        let created: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO mats_socket_session
                (session_id, connection_id, nodename, user_id, client_lib, app_name,
                 app_version, created_timestamp, liveliness_timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (session_id) DO UPDATE SET
                connection_id = excluded.connection_id,
                nodename = excluded.nodename,
                client_lib = excluded.client_lib,
                app_name = excluded.app_name,
                app_version = excluded.app_version,
                liveliness_timestamp = excluded.liveliness_timestamp
            WHERE mats_socket_session.user_id = excluded.user_id
            RETURNING created_timestamp
            "#,
        )
        .bind(session_id)
        .bind(connection_id)
        .bind(&self.nodename)
        .bind(user_id)
        .bind(&client.client_lib)
        .bind(&client.app_name)
        .bind(&client.app_version)
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let Some(created) = created else {
            return Err(CsafError::WrongUser {
                session_id: session_id.to_string(),
                user_id: user_id.to_string(),
            });
        };
        debug!(session_id, connection_id, nodename = %self.nodename, "Registered session");
        Ok(from_millis(created))
    }

    async fn deregister_session_from_this_node(
        &self,
        session_id: &str,
        connection_id: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE mats_socket_session
            SET nodename = NULL
            WHERE session_id = ? AND connection_id = ? AND nodename = ?
            "#,
        )
        .bind(session_id)
        .bind(connection_id)
        .bind(&self.nodename)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(session_id, connection_id, "Stale deregister ignored");
        }
        Ok(())
    }

    async fn get_current_registered_node_for_session(
        &self,
        session_id: &str,
    ) -> Result<Option<CurrentNode>> {
        Ok(self.current_node(session_id).await?.flatten())
    }

    async fn is_session_exists(&self, session_id: &str) -> Result<bool> {
        Ok(self.current_node(session_id).await?.is_some())
    }

    async fn notify_session_liveliness(&self, session_ids: &[String]) -> Result<()> {
        let now = now().timestamp_millis();
        let mut tx = self.pool.begin().await?;
        for session_id in session_ids {
            sqlx::query(
                "UPDATE mats_socket_session SET liveliness_timestamp = ? WHERE session_id = ?",
            )
            .bind(now)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn close_session(&self, session_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM mats_socket_session WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        for kind in ["inbox", "outbox", "request_out"] {
            let sql = format!("DELETE FROM {} WHERE session_id = ?", box_table(kind, session_id));
            sqlx::query(&sql).bind(session_id).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        debug!(session_id, "Closed session");
        Ok(())
    }

    async fn get_sessions(&self, filter: &SessionFilter) -> Result<Vec<CsafSession>> {
        let mut builder = QueryBuilder::new(
            "SELECT session_id, connection_id, nodename, user_id, client_lib, app_name, \
             app_version, created_timestamp, liveliness_timestamp FROM mats_socket_session",
        );
        push_session_filter(&mut builder, filter);
        builder.push(" ORDER BY session_id");

        let rows = builder
            .build_query_as::<SessionRow>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(CsafSession::from).collect())
    }

    async fn get_sessions_count(&self, filter: &SessionFilter) -> Result<usize> {
        let mut builder = QueryBuilder::new("SELECT COUNT(*) FROM mats_socket_session");
        push_session_filter(&mut builder, filter);

        let count: i64 = builder
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    async fn store_message_id_in_inbox(
        &self,
        session_id: &str,
        client_message_id: &str,
    ) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (session_id, cmid, stored_timestamp) VALUES (?, ?, ?)",
            box_table("inbox", session_id)
        );
        let result = sqlx::query(&sql)
            .bind(session_id)
            .bind(client_message_id)
            .bind(now().timestamp_millis())
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(CsafError::ClientMessageIdAlreadyExists {
                    session_id: session_id.to_string(),
                    client_message_id: client_message_id.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_message_in_inbox(
        &self,
        session_id: &str,
        client_message_id: &str,
        full_envelope: Option<&str>,
        message_binary: Option<&[u8]>,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET full_envelope = ?, message_binary = ? WHERE session_id = ? AND cmid = ?",
            box_table("inbox", session_id)
        );
        sqlx::query(&sql)
            .bind(full_envelope)
            .bind(message_binary)
            .bind(session_id)
            .bind(client_message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_message_from_inbox(
        &self,
        session_id: &str,
        client_message_id: &str,
    ) -> Result<Option<StoredInMessage>> {
        let sql = format!(
            "SELECT session_id, cmid, stored_timestamp, full_envelope, message_binary \
             FROM {} WHERE session_id = ? AND cmid = ?",
            box_table("inbox", session_id)
        );
        let row = sqlx::query_as::<_, InboxRow>(&sql)
            .bind(session_id)
            .bind(client_message_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(StoredInMessage::from))
    }

    async fn delete_message_ids_from_inbox(
        &self,
        session_id: &str,
        client_message_ids: &[String],
    ) -> Result<()> {
        let sql = format!(
            "DELETE FROM {} WHERE session_id = ? AND cmid = ?",
            box_table("inbox", session_id)
        );
        self.for_each_message_id(&sql, None, session_id, client_message_ids)
            .await
    }

    async fn store_message_in_outbox(&self, message: &OutboxMessage) -> Result<Option<CurrentNode>> {
        let Some(node) = self.current_node(&message.session_id).await? else {
            debug!(
                session_id = %message.session_id,
                server_message_id = %message.server_message_id,
                "Session gone, dropping outbox message"
            );
            return Ok(None);
        };

        let sql = format!(
            "INSERT INTO {} (session_id, smid, cmid, stored_timestamp, delivery_count, trace_id, \
             type, envelope, message_text, message_binary) VALUES (?, ?, ?, ?, 0, ?, ?, ?, ?, ?)",
            box_table("outbox", &message.session_id)
        );
        sqlx::query(&sql)
            .bind(&message.session_id)
            .bind(&message.server_message_id)
            .bind(message.client_message_id.as_deref())
            .bind(now().timestamp_millis())
            .bind(&message.trace_id)
            .bind(message.message_type.as_str())
            .bind(&message.envelope)
            .bind(message.message_text.as_deref())
            .bind(message.message_binary.as_deref())
            .execute(&self.pool)
            .await?;

        Ok(node)
    }

    async fn get_messages_from_outbox(
        &self,
        session_id: &str,
        max: usize,
    ) -> Result<Vec<StoredOutMessage>> {
        let sql = format!(
            "SELECT {OUTBOX_COLUMNS} FROM {} \
             WHERE session_id = ? AND attempt_timestamp IS NULL AND dlq_timestamp IS NULL \
             ORDER BY stored_timestamp, rowid LIMIT ?",
            box_table("outbox", session_id)
        );
        sqlx::query_as::<_, OutboxRow>(&sql)
            .bind(session_id)
            .bind(i64::try_from(max).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(StoredOutMessage::try_from)
            .collect()
    }

    async fn outbox_messages_attempted_delivery(
        &self,
        session_id: &str,
        server_message_ids: &[String],
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET attempt_timestamp = ?, delivery_count = delivery_count + 1 \
             WHERE session_id = ? AND smid = ?",
            box_table("outbox", session_id)
        );
        self.for_each_message_id(
            &sql,
            Some(now().timestamp_millis()),
            session_id,
            server_message_ids,
        )
        .await
    }

    async fn outbox_messages_unmark_attempted_delivery(&self, session_id: &str) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET attempt_timestamp = NULL WHERE session_id = ?",
            box_table("outbox", session_id)
        );
        sqlx::query(&sql)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn outbox_messages_unmark_attempted_delivery_ids(
        &self,
        session_id: &str,
        server_message_ids: &[String],
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET attempt_timestamp = NULL WHERE session_id = ? AND smid = ?",
            box_table("outbox", session_id)
        );
        self.for_each_message_id(&sql, None, session_id, server_message_ids)
            .await
    }

    async fn outbox_messages_complete(
        &self,
        session_id: &str,
        server_message_ids: &[String],
    ) -> Result<()> {
        let sql = format!(
            "DELETE FROM {} WHERE session_id = ? AND smid = ?",
            box_table("outbox", session_id)
        );
        self.for_each_message_id(&sql, None, session_id, server_message_ids)
            .await
    }

    async fn outbox_messages_dead_letter_queue(
        &self,
        session_id: &str,
        server_message_ids: &[String],
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET dlq_timestamp = ? WHERE session_id = ? AND smid = ?",
            box_table("outbox", session_id)
        );
        self.for_each_message_id(
            &sql,
            Some(now().timestamp_millis()),
            session_id,
            server_message_ids,
        )
        .await
    }

    async fn store_request_correlation(&self, correlation: &RequestCorrelation) -> Result<()> {
        let sql = format!(
            "INSERT OR REPLACE INTO {} (session_id, smid, request_timestamp, reply_terminator_id, \
             correlation_text, correlation_binary) VALUES (?, ?, ?, ?, ?, ?)",
            box_table("request_out", &correlation.session_id)
        );
        sqlx::query(&sql)
            .bind(&correlation.session_id)
            .bind(&correlation.server_message_id)
            .bind(correlation.requested_at.timestamp_millis())
            .bind(&correlation.reply_terminator_id)
            .bind(correlation.correlation_text.as_deref())
            .bind(correlation.correlation_binary.as_deref())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_and_delete_request_correlation(
        &self,
        session_id: &str,
        server_message_id: &str,
    ) -> Result<Option<RequestCorrelation>> {
        let sql = format!(
            "DELETE FROM {} WHERE session_id = ? AND smid = ? \
             RETURNING session_id, smid, request_timestamp, reply_terminator_id, \
             correlation_text, correlation_binary",
            box_table("request_out", session_id)
        );
        let row = sqlx::query_as::<_, CorrelationRow>(&sql)
            .bind(session_id)
            .bind(server_message_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(RequestCorrelation::from))
    }
}
