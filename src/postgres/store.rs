// ABOUTME: PgStore - Store and PendingQueue on top of a ConnectionPool
// ABOUTME: Serves both the master and the local tier

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_postgres::types::ToSql;

use super::convert::{json_to_param, row_to_json};
use super::pool::ConnectionPool;
use super::sql;
use crate::error::{SyncError, SyncResult};
use crate::row::{self, Row, ID_COLUMN};
use crate::store::{
    ChangePage, NewPendingOperation, Operation, PendingOperation, PendingQueue, PullCursor,
    QueryResult, QueuePosition, QueueStatus, Store,
};
use crate::utils::validate_identifier;

/// PostgreSQL-backed store for one tier.
///
/// Table and column names are validated before they are spliced into SQL;
/// row values always travel as a single JSON parameter.
pub struct PgStore {
    pool: ConnectionPool,
    schema: String,
}

impl PgStore {
    pub fn new(pool: ConnectionPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    fn columns_of(&self, table: &str, row: &Row) -> SyncResult<Vec<String>> {
        validate_identifier(table)?;
        let columns: Vec<String> = row.keys().cloned().collect();
        for column in &columns {
            validate_identifier(column).map_err(|e| {
                SyncError::InvalidRow(format!("bad column name in row for {}: {}", table, e))
            })?;
        }
        Ok(columns)
    }

    async fn query_returning_row(&self, query: &str, payload: &Value) -> SyncResult<Row> {
        let client = self.pool.get().await?;
        let pg_row = client.query_one(query, &[payload]).await?;
        row::row_from_value(pg_row.get::<_, Value>(0))
    }
}

fn pending_from_row(row: &tokio_postgres::Row) -> SyncResult<PendingOperation> {
    let operation: String = row.get("operation");
    let data = row::row_from_value(row.get::<_, Value>("data"))?;
    Ok(PendingOperation {
        id: row.get("id"),
        table_name: row.get("table_name"),
        operation: Operation::parse(&operation)?,
        data,
        created_at: row.get("created_at"),
        synced_at: row.get("synced_at"),
        error: row.get("error"),
        attempts: row.get("attempts"),
    })
}

#[async_trait]
impl Store for PgStore {
    fn label(&self) -> &str {
        self.pool.label()
    }

    async fn ping(&self) -> SyncResult<()> {
        let client = self.pool.get().await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    async fn insert(&self, table: &str, row: &Row) -> SyncResult<Row> {
        let columns = self.columns_of(table, row)?;
        let query = sql::build_insert(&self.schema, table, &columns);
        self.query_returning_row(&query, &Value::Object(row.clone()))
            .await
    }

    async fn upsert(&self, table: &str, row: &Row) -> SyncResult<Row> {
        if row::row_id(row).is_none() {
            return Err(SyncError::InvalidRow(format!(
                "upsert into {} requires an id",
                table
            )));
        }
        let columns = self.columns_of(table, row)?;
        let query = sql::build_upsert(&self.schema, table, &columns);
        self.query_returning_row(&query, &Value::Object(row.clone()))
            .await
    }

    async fn update(&self, table: &str, row: &Row) -> SyncResult<Option<Row>> {
        if row::row_id(row).is_none() {
            return Err(SyncError::InvalidRow(format!(
                "update of {} requires an id",
                table
            )));
        }
        let columns: Vec<String> = self
            .columns_of(table, row)?
            .into_iter()
            .filter(|c| c != ID_COLUMN)
            .collect();
        if columns.is_empty() {
            return Err(SyncError::InvalidRow(format!(
                "update of {} has no columns to set",
                table
            )));
        }

        let query = sql::build_update(&self.schema, table, &columns);
        let payload = Value::Object(row.clone());
        let client = self.pool.get().await?;
        client
            .query_opt(&query, &[&payload])
            .await?
            .map(|pg_row| row::row_from_value(pg_row.get::<_, Value>(0)))
            .transpose()
    }

    async fn delete(&self, table: &str, id: &Value) -> SyncResult<u64> {
        validate_identifier(table)?;
        let query = sql::build_delete(&self.schema, table);
        let mut key = Row::new();
        key.insert(ID_COLUMN.to_string(), id.clone());
        let payload = Value::Object(key);
        let client = self.pool.get().await?;
        client.execute(&query, &[&payload]).await.map_err(SyncError::from)
    }

    async fn select(&self, table: &str, filter: &Row) -> SyncResult<Vec<Row>> {
        let columns = self.columns_of(table, filter)?;
        let query = sql::build_select(&self.schema, table, &columns);
        let payload = Value::Object(filter.clone());

        let client = self.pool.get().await?;
        let rows = if columns.is_empty() {
            client.query(&query, &[]).await?
        } else {
            client.query(&query, &[&payload]).await?
        };
        rows.iter()
            .map(|r| row::row_from_value(r.get::<_, Value>(0)))
            .collect()
    }

    async fn watermark(&self, table: &str) -> SyncResult<Option<DateTime<Utc>>> {
        validate_identifier(table)?;
        let query = sql::build_watermark(&self.schema, table);
        let client = self.pool.get().await?;
        let row = client.query_one(&query, &[]).await?;
        Ok(row.get::<_, Option<DateTime<Utc>>>(0))
    }

    async fn changed_since(
        &self,
        table: &str,
        cursor: &PullCursor,
        limit: usize,
    ) -> SyncResult<ChangePage> {
        validate_identifier(table)?;
        let query = sql::build_changed_since(&self.schema, table);
        let limit = limit as i64;

        let client = self.pool.get().await?;
        let pg_rows = client
            .query(&query, &[&cursor.updated_at, &cursor.last_id, &limit])
            .await?;

        let mut page = ChangePage::default();
        for pg_row in &pg_rows {
            page.rows
                .push(row::row_from_value(pg_row.get::<_, Value>(0))?);
            page.next = Some(PullCursor {
                updated_at: pg_row.get(1),
                last_id: pg_row.get(2),
            });
        }
        Ok(page)
    }

    async fn execute(&self, query: &str, params: &[Value]) -> SyncResult<QueryResult> {
        let client = self.pool.get().await?;
        let statement = client.prepare(query).await?;

        if statement.params().len() != params.len() {
            return Err(SyncError::InvalidRow(format!(
                "statement expects {} parameter(s), got {}",
                statement.params().len(),
                params.len()
            )));
        }

        let values = statement
            .params()
            .iter()
            .zip(params)
            .map(|(ty, value)| json_to_param(ty, value))
            .collect::<SyncResult<Vec<_>>>()?;
        let refs: Vec<&(dyn ToSql + Sync)> = values
            .iter()
            .map(|v| v.as_ref() as &(dyn ToSql + Sync))
            .collect();

        if statement.columns().is_empty() {
            let rows_affected = client.execute(&statement, &refs).await?;
            Ok(QueryResult {
                rows: Vec::new(),
                rows_affected,
            })
        } else {
            let rows = client.query(&statement, &refs).await?;
            Ok(QueryResult {
                rows_affected: rows.len() as u64,
                rows: rows.iter().map(row_to_json).collect(),
            })
        }
    }

    async fn close(&self) {
        self.pool.close();
    }
}

#[async_trait]
impl PendingQueue for PgStore {
    async fn ensure_schema(&self) -> SyncResult<()> {
        let ddl = sql::pending_schema(&self.schema);
        let client = self.pool.get().await?;
        client.batch_execute(&ddl).await.map_err(SyncError::from)
    }

    async fn enqueue(&self, op: &NewPendingOperation) -> SyncResult<i64> {
        let query = sql::pending_insert(&self.schema);
        let data = Value::Object(op.data.clone());
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                &query,
                &[&op.table_name, &op.operation.as_str(), &data],
            )
            .await?;
        Ok(row.get(0))
    }

    async fn fetch_unsynced(
        &self,
        after: Option<QueuePosition>,
        limit: usize,
    ) -> SyncResult<Vec<PendingOperation>> {
        let query = sql::pending_fetch_unsynced(&self.schema);
        let created_at = after.map(|pos| pos.created_at);
        let id = after.map(|pos| pos.id);
        let limit = limit as i64;
        let client = self.pool.get().await?;
        let rows = client.query(&query, &[&created_at, &id, &limit]).await?;
        rows.iter().map(pending_from_row).collect()
    }

    async fn sync_watermark(&self, table: &str) -> SyncResult<Option<DateTime<Utc>>> {
        validate_identifier(table)?;
        let query = sql::build_sync_watermark(&self.schema, table);
        let client = self.pool.get().await?;
        let row = client.query_one(&query, &[&table]).await?;
        Ok(row.get::<_, Option<DateTime<Utc>>>(0))
    }

    async fn unsynced_ids(&self, table: &str) -> SyncResult<HashSet<String>> {
        let query = sql::pending_unsynced_ids(&self.schema);
        let client = self.pool.get().await?;
        let rows = client.query(&query, &[&table]).await?;
        Ok(rows.iter().map(|r| r.get::<_, String>(0)).collect())
    }

    async fn mark_synced(&self, id: i64, synced_at: DateTime<Utc>) -> SyncResult<()> {
        let query = sql::pending_mark_synced(&self.schema);
        let client = self.pool.get().await?;
        match client.execute(&query, &[&id, &synced_at]).await? {
            0 => Err(SyncError::NotFound(format!("pending operation {}", id))),
            _ => Ok(()),
        }
    }

    async fn mark_failed(&self, id: i64, error: &str) -> SyncResult<()> {
        let query = sql::pending_mark_failed(&self.schema);
        let client = self.pool.get().await?;
        match client.execute(&query, &[&id, &error]).await? {
            0 => Err(SyncError::NotFound(format!("pending operation {}", id))),
            _ => Ok(()),
        }
    }

    async fn get(&self, id: i64) -> SyncResult<Option<PendingOperation>> {
        let query = sql::pending_get(&self.schema);
        let client = self.pool.get().await?;
        client
            .query_opt(&query, &[&id])
            .await?
            .as_ref()
            .map(pending_from_row)
            .transpose()
    }

    async fn queue_status(&self) -> SyncResult<QueueStatus> {
        let query = sql::pending_status(&self.schema);
        let client = self.pool.get().await?;
        let row = client.query_one(&query, &[]).await?;
        Ok(QueueStatus {
            pending: row.get::<_, i64>(0) as u64,
            failed: row.get::<_, i64>(1) as u64,
            synced: row.get::<_, i64>(2) as u64,
        })
    }
}
