//! SQLite implementation of the store traits

use crate::error::{Result, SqliteStoreError};
use crate::schema::{self, quote};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cloudledger::{
    CanonicalEntity, ChildHistoryRecord, ChildRow, ChildSpec, FieldKind, HistoryRecord,
    LiveRecord, ResourceDescriptor, Store, StoreTx, Value,
};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Row, Sqlite, SqlitePool, Transaction, TypeInfo, ValueRef};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, <Sqlite as sqlx::Database>::Arguments<'q>>;

/// Store backed by a SQLite database
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to a database URL (e.g., "sqlite://ledger.db")
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        if url.contains(":memory:") || url.contains("mode=memory") {
            return Self::in_memory().await;
        }

        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        debug!(url, "Connected to SQLite");
        Ok(Self { pool })
    }

    /// Open (or create) a database file, creating parent directories
    pub async fn open(path: impl AsRef<Path>, max_connections: u32) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        Self::connect(&format!("sqlite://{}", path.display()), max_connections).await
    }

    /// Private in-memory database
    ///
    /// Every connection to `:memory:` is a separate database, so the pool is
    /// pinned to one connection that never expires.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Start a transaction holding the write lock
    ///
    /// Reconciling reads before it writes, and a deferred transaction that
    /// lost the race for the write lock fails with `SQLITE_BUSY` without
    /// waiting on the busy timeout.
    async fn begin_immediate(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }

    async fn migrate(&self, desc: &ResourceDescriptor) -> Result<()> {
        let mut tx = self.begin_immediate().await?;
        for statement in schema::create_statements(desc) {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }

        // Fields added to a descriptor after its tables were created
        for (table, columns) in schema::expected_columns(desc) {
            let existing: Vec<String> = sqlx::query_scalar("SELECT name FROM pragma_table_info(?)")
                .bind(&table)
                .fetch_all(&mut *tx)
                .await?;
            for (column, ty) in columns {
                if !existing.contains(&column) {
                    let sql = format!(
                        "ALTER TABLE {} ADD COLUMN {} {}",
                        quote(&table),
                        quote(&column),
                        ty
                    );
                    sqlx::query(&sql).execute(&mut *tx).await?;
                    info!(table = %table, column = %column, "Added column");
                }
            }
        }

        tx.commit().await?;
        debug!(resource = %desc.name, "Schema ready");
        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn ensure_schema(&self, desc: &ResourceDescriptor) -> cloudledger::Result<()> {
        desc.validate()?;
        Ok(self.migrate(desc).await?)
    }

    async fn begin(&self) -> cloudledger::Result<Box<dyn StoreTx>> {
        let tx = self.begin_immediate().await?;
        Ok(Box::new(SqliteTx { tx }))
    }

    async fn find_stale(
        &self,
        desc: &ResourceDescriptor,
        scope: &str,
        before: DateTime<Utc>,
    ) -> cloudledger::Result<Vec<String>> {
        let sql = format!(
            "SELECT entity_id FROM {} WHERE scope_id = ? AND collected_at < ? ORDER BY entity_id",
            quote(&desc.live_table())
        );
        let ids: Vec<String> = sqlx::query_scalar(&sql)
            .bind(scope)
            .bind(micros(before))
            .fetch_all(&self.pool)
            .await
            .map_err(SqliteStoreError::from)?;
        Ok(ids)
    }

    async fn entity_history(
        &self,
        desc: &ResourceDescriptor,
        entity_id: &str,
    ) -> cloudledger::Result<Vec<HistoryRecord>> {
        let mut conn = self.pool.acquire().await.map_err(SqliteStoreError::from)?;
        Ok(select_history(&mut conn, desc, entity_id, false).await?)
    }

    async fn child_history(
        &self,
        desc: &ResourceDescriptor,
        history_id: i64,
    ) -> cloudledger::Result<Vec<ChildHistoryRecord>> {
        let mut conn = self.pool.acquire().await.map_err(SqliteStoreError::from)?;
        let mut records = Vec::new();
        for child in &desc.children {
            records.extend(select_child_history(&mut conn, desc, child, history_id, false).await?);
        }
        records.sort_by(|a, b| {
            (&a.collection, a.valid_from, a.position, a.id)
                .cmp(&(&b.collection, b.valid_from, b.position, b.id))
        });
        Ok(records)
    }
}

/// One open SQLite transaction; rolled back by sqlx when dropped
struct SqliteTx {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl StoreTx for SqliteTx {
    async fn load_with_children(
        &mut self,
        desc: &ResourceDescriptor,
        entity_id: &str,
    ) -> cloudledger::Result<Option<LiveRecord>> {
        Ok(load_live(&mut self.tx, desc, entity_id).await?)
    }

    async fn touch_collected_at(
        &mut self,
        desc: &ResourceDescriptor,
        entity_id: &str,
        collected_at: DateTime<Utc>,
    ) -> cloudledger::Result<()> {
        let sql = format!(
            "UPDATE {} SET collected_at = ? WHERE entity_id = ?",
            quote(&desc.live_table())
        );
        let done = sqlx::query(&sql)
            .bind(micros(collected_at))
            .bind(entity_id)
            .execute(&mut *self.tx)
            .await
            .map_err(SqliteStoreError::from)?;
        if done.rows_affected() == 0 {
            return Err(cloudledger::LedgerError::Storage(format!(
                "no live row for {} {}",
                desc.name, entity_id
            )));
        }
        Ok(())
    }

    async fn upsert(
        &mut self,
        desc: &ResourceDescriptor,
        entity: &CanonicalEntity,
        scope: &str,
        collected_at: DateTime<Utc>,
    ) -> cloudledger::Result<()> {
        let mut columns = vec![
            "entity_id".to_string(),
            "scope_id".to_string(),
            "collected_at".to_string(),
        ];
        columns.extend(schema::field_columns(desc).iter().map(|(n, _)| quote(n)));
        let updates = columns[1..]
            .iter()
            .map(|c| format!("{c} = excluded.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT(entity_id) DO UPDATE SET {}",
            quote(&desc.live_table()),
            columns.join(", "),
            placeholders(columns.len()),
            updates
        );

        let query = sqlx::query(&sql)
            .bind(&entity.id)
            .bind(scope)
            .bind(micros(collected_at));
        bind_entity(query, desc, entity)
            .execute(&mut *self.tx)
            .await
            .map_err(SqliteStoreError::from)?;
        Ok(())
    }

    async fn delete_children(
        &mut self,
        desc: &ResourceDescriptor,
        entity_id: &str,
    ) -> cloudledger::Result<()> {
        for child in &desc.children {
            let sql = format!(
                "DELETE FROM {} WHERE entity_id = ?",
                quote(&desc.live_child_table(&child.name))
            );
            sqlx::query(&sql)
                .bind(entity_id)
                .execute(&mut *self.tx)
                .await
                .map_err(SqliteStoreError::from)?;
        }
        Ok(())
    }

    async fn insert_children(
        &mut self,
        desc: &ResourceDescriptor,
        entity_id: &str,
        children: &BTreeMap<String, Vec<ChildRow>>,
    ) -> cloudledger::Result<()> {
        for (name, rows) in children {
            let spec = child_spec(desc, name)?;
            let sql = insert_sql(
                &desc.live_child_table(name),
                &["entity_id", "position", "row_key"],
                spec,
            );
            for (position, row) in rows.iter().enumerate() {
                let query = sqlx::query(&sql)
                    .bind(entity_id)
                    .bind(position as i64)
                    .bind(row.key.as_deref());
                bind_row(query, spec, row)
                    .execute(&mut *self.tx)
                    .await
                    .map_err(SqliteStoreError::from)?;
            }
        }
        Ok(())
    }

    async fn delete(&mut self, desc: &ResourceDescriptor, entity_id: &str) -> cloudledger::Result<()> {
        let sql = format!(
            "DELETE FROM {} WHERE entity_id = ?",
            quote(&desc.live_table())
        );
        sqlx::query(&sql)
            .bind(entity_id)
            .execute(&mut *self.tx)
            .await
            .map_err(SqliteStoreError::from)?;
        Ok(())
    }

    async fn insert_history(
        &mut self,
        desc: &ResourceDescriptor,
        entity: &CanonicalEntity,
        scope: &str,
        valid_from: DateTime<Utc>,
    ) -> cloudledger::Result<i64> {
        let mut columns = vec![
            "entity_id".to_string(),
            "valid_from".to_string(),
            "scope_id".to_string(),
            "collected_at".to_string(),
        ];
        columns.extend(schema::field_columns(desc).iter().map(|(n, _)| quote(n)));
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote(&desc.history_table()),
            columns.join(", "),
            placeholders(columns.len())
        );

        let query = sqlx::query(&sql)
            .bind(&entity.id)
            .bind(micros(valid_from))
            .bind(scope)
            .bind(micros(valid_from));
        let done = bind_entity(query, desc, entity)
            .execute(&mut *self.tx)
            .await
            .map_err(SqliteStoreError::from)?;
        Ok(done.last_insert_rowid())
    }

    async fn insert_child_history(
        &mut self,
        desc: &ResourceDescriptor,
        parent_history_id: i64,
        entity_id: &str,
        collection: &str,
        rows: &[ChildRow],
        valid_from: DateTime<Utc>,
    ) -> cloudledger::Result<()> {
        let spec = child_spec(desc, collection)?;
        let sql = insert_sql(
            &desc.history_child_table(collection),
            &["parent_history_id", "entity_id", "position", "row_key", "valid_from"],
            spec,
        );
        for (position, row) in rows.iter().enumerate() {
            let query = sqlx::query(&sql)
                .bind(parent_history_id)
                .bind(entity_id)
                .bind(position as i64)
                .bind(row.key.as_deref())
                .bind(micros(valid_from));
            bind_row(query, spec, row)
                .execute(&mut *self.tx)
                .await
                .map_err(SqliteStoreError::from)?;
        }
        Ok(())
    }

    async fn close_open_history(
        &mut self,
        desc: &ResourceDescriptor,
        entity_id: &str,
        valid_to: DateTime<Utc>,
    ) -> cloudledger::Result<u64> {
        let sql = format!(
            "UPDATE {} SET valid_to = ? WHERE entity_id = ? AND valid_to IS NULL",
            quote(&desc.history_table())
        );
        let done = sqlx::query(&sql)
            .bind(micros(valid_to))
            .bind(entity_id)
            .execute(&mut *self.tx)
            .await
            .map_err(SqliteStoreError::from)?;
        Ok(done.rows_affected())
    }

    async fn close_open_child_history(
        &mut self,
        desc: &ResourceDescriptor,
        parent_history_id: i64,
        collection: Option<&str>,
        valid_to: DateTime<Utc>,
    ) -> cloudledger::Result<u64> {
        let targets: Vec<&ChildSpec> = match collection {
            Some(name) => vec![child_spec(desc, name)?],
            None => desc.children.iter().collect(),
        };

        let mut closed = 0;
        for child in targets {
            let sql = format!(
                "UPDATE {} SET valid_to = ? WHERE parent_history_id = ? AND valid_to IS NULL",
                quote(&desc.history_child_table(&child.name))
            );
            let done = sqlx::query(&sql)
                .bind(micros(valid_to))
                .bind(parent_history_id)
                .execute(&mut *self.tx)
                .await
                .map_err(SqliteStoreError::from)?;
            closed += done.rows_affected();
        }
        Ok(closed)
    }

    async fn query_open_history(
        &mut self,
        desc: &ResourceDescriptor,
        entity_id: &str,
    ) -> cloudledger::Result<Option<HistoryRecord>> {
        let mut open = select_history(&mut self.tx, desc, entity_id, true).await?;
        Ok(open.pop())
    }

    async fn query_open_child_history(
        &mut self,
        desc: &ResourceDescriptor,
        parent_history_id: i64,
        collection: &str,
    ) -> cloudledger::Result<Vec<ChildHistoryRecord>> {
        let spec = child_spec(desc, collection)?;
        Ok(select_child_history(&mut self.tx, desc, spec, parent_history_id, true).await?)
    }

    async fn commit(self: Box<Self>) -> cloudledger::Result<()> {
        self.tx.commit().await.map_err(SqliteStoreError::from)?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> cloudledger::Result<()> {
        self.tx.rollback().await.map_err(SqliteStoreError::from)?;
        Ok(())
    }
}

fn micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn child_spec<'a>(desc: &'a ResourceDescriptor, name: &str) -> Result<&'a ChildSpec> {
    desc.child(name)
        .ok_or_else(|| SqliteStoreError::UnknownTable(format!("{}.{}", desc.name, name)))
}

fn insert_sql(table: &str, leading: &[&str], spec: &ChildSpec) -> String {
    let columns: Vec<String> = leading
        .iter()
        .map(|c| c.to_string())
        .chain(spec.fields.iter().map(|f| quote(&f.name)))
        .collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote(table),
        columns.join(", "),
        placeholders(columns.len())
    )
}

fn bind_value<'q>(query: SqliteQuery<'q>, value: &Value) -> SqliteQuery<'q> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Int(i) => query.bind(*i),
        Value::Float(x) => query.bind(*x),
        Value::Text(s) => query.bind(s.clone()),
    }
}

/// Bind scalar then opaque fields, in `schema::field_columns` order
fn bind_entity<'q>(
    mut query: SqliteQuery<'q>,
    desc: &ResourceDescriptor,
    entity: &CanonicalEntity,
) -> SqliteQuery<'q> {
    for field in &desc.scalar_fields {
        query = bind_value(query, entity.scalar(&field.name));
    }
    for field in &desc.opaque_fields {
        query = query.bind(entity.opaque(&field.name).map(<[u8]>::to_vec));
    }
    query
}

fn bind_row<'q>(mut query: SqliteQuery<'q>, spec: &ChildSpec, row: &ChildRow) -> SqliteQuery<'q> {
    for field in &spec.fields {
        query = bind_value(query, row.field(&field.name));
    }
    query
}

fn timestamp(row: &SqliteRow, table: &str, column: &str) -> Result<DateTime<Utc>> {
    let value: i64 = row.try_get(column)?;
    DateTime::from_timestamp_micros(value).ok_or_else(|| {
        SqliteStoreError::decode(table, column, format!("timestamp out of range: {}", value))
    })
}

fn optional_timestamp(row: &SqliteRow, table: &str, column: &str) -> Result<Option<DateTime<Utc>>> {
    let value: Option<i64> = row.try_get(column)?;
    value
        .map(|v| {
            DateTime::from_timestamp_micros(v).ok_or_else(|| {
                SqliteStoreError::decode(table, column, format!("timestamp out of range: {}", v))
            })
        })
        .transpose()
}

/// Decode by the stored value's own type; booleans live in INTEGER columns
fn decode_value(row: &SqliteRow, table: &str, column: &str, kind: FieldKind) -> Result<Value> {
    let raw = row.try_get_raw(column)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let storage = raw.type_info().name().to_string();

    match storage.as_str() {
        "INTEGER" | "BOOLEAN" if kind == FieldKind::Boolean => {
            Ok(Value::Bool(row.try_get::<i64, _>(column)? != 0))
        }
        "INTEGER" | "BOOLEAN" => Ok(Value::Int(row.try_get(column)?)),
        "REAL" => Ok(Value::Float(row.try_get(column)?)),
        "TEXT" => Ok(Value::Text(row.try_get(column)?)),
        other => Err(SqliteStoreError::decode(
            table,
            column,
            format!("unexpected {} value", other),
        )),
    }
}

type Fields = (BTreeMap<String, Value>, BTreeMap<String, Vec<u8>>);

fn decode_fields(row: &SqliteRow, table: &str, desc: &ResourceDescriptor) -> Result<Fields> {
    let mut scalars = BTreeMap::new();
    for field in &desc.scalar_fields {
        scalars.insert(
            field.name.clone(),
            decode_value(row, table, &field.name, field.kind)?,
        );
    }
    let mut opaque = BTreeMap::new();
    for field in &desc.opaque_fields {
        let bytes: Option<Vec<u8>> = row.try_get(field.name.as_str())?;
        if let Some(bytes) = bytes {
            opaque.insert(field.name.clone(), bytes);
        }
    }
    Ok((scalars, opaque))
}

fn decode_child_row(row: &SqliteRow, table: &str, spec: &ChildSpec) -> Result<ChildRow> {
    let mut fields = BTreeMap::new();
    for field in &spec.fields {
        fields.insert(
            field.name.clone(),
            decode_value(row, table, &field.name, field.kind)?,
        );
    }
    Ok(ChildRow {
        key: row.try_get("row_key")?,
        fields,
    })
}

fn position(row: &SqliteRow, table: &str) -> Result<usize> {
    let value: i64 = row.try_get("position")?;
    usize::try_from(value)
        .map_err(|_| SqliteStoreError::decode(table, "position", format!("negative position {}", value)))
}

async fn load_live(
    conn: &mut SqliteConnection,
    desc: &ResourceDescriptor,
    entity_id: &str,
) -> Result<Option<LiveRecord>> {
    let table = desc.live_table();
    let sql = format!("SELECT * FROM {} WHERE entity_id = ?", quote(&table));
    let Some(row) = sqlx::query(&sql)
        .bind(entity_id)
        .fetch_optional(&mut *conn)
        .await?
    else {
        return Ok(None);
    };

    let (scalars, opaque) = decode_fields(&row, &table, desc)?;
    let mut entity = CanonicalEntity::new(entity_id);
    entity.scalars = scalars;
    entity.opaque = opaque;

    for child in &desc.children {
        let child_table = desc.live_child_table(&child.name);
        let sql = format!(
            "SELECT * FROM {} WHERE entity_id = ? ORDER BY position, id",
            quote(&child_table)
        );
        let rows = sqlx::query(&sql)
            .bind(entity_id)
            .fetch_all(&mut *conn)
            .await?;
        let rows = rows
            .iter()
            .map(|r| decode_child_row(r, &child_table, child))
            .collect::<Result<Vec<_>>>()?;
        entity.children.insert(child.name.clone(), rows);
    }

    Ok(Some(LiveRecord {
        entity,
        scope_id: row.try_get("scope_id")?,
        collected_at: timestamp(&row, &table, "collected_at")?,
    }))
}

async fn select_history(
    conn: &mut SqliteConnection,
    desc: &ResourceDescriptor,
    entity_id: &str,
    open_only: bool,
) -> Result<Vec<HistoryRecord>> {
    let table = desc.history_table();
    let filter = if open_only { " AND valid_to IS NULL" } else { "" };
    let sql = format!(
        "SELECT * FROM {} WHERE entity_id = ?{} ORDER BY valid_from, history_id",
        quote(&table),
        filter
    );
    let rows = sqlx::query(&sql)
        .bind(entity_id)
        .fetch_all(&mut *conn)
        .await?;

    rows.iter()
        .map(|row| {
            let (scalars, opaque) = decode_fields(row, &table, desc)?;
            Ok(HistoryRecord {
                history_id: row.try_get("history_id")?,
                entity_id: row.try_get("entity_id")?,
                valid_from: timestamp(row, &table, "valid_from")?,
                valid_to: optional_timestamp(row, &table, "valid_to")?,
                scalars,
                opaque,
                scope_id: row.try_get("scope_id")?,
                collected_at: timestamp(row, &table, "collected_at")?,
            })
        })
        .collect()
}

async fn select_child_history(
    conn: &mut SqliteConnection,
    desc: &ResourceDescriptor,
    spec: &ChildSpec,
    parent_history_id: i64,
    open_only: bool,
) -> Result<Vec<ChildHistoryRecord>> {
    let table = desc.history_child_table(&spec.name);
    let filter = if open_only { " AND valid_to IS NULL" } else { "" };
    let sql = format!(
        "SELECT * FROM {} WHERE parent_history_id = ?{} ORDER BY valid_from, position, id",
        quote(&table),
        filter
    );
    let rows = sqlx::query(&sql)
        .bind(parent_history_id)
        .fetch_all(&mut *conn)
        .await?;

    rows.iter()
        .map(|row| {
            Ok(ChildHistoryRecord {
                id: row.try_get("id")?,
                parent_history_id: row.try_get("parent_history_id")?,
                entity_id: row.try_get("entity_id")?,
                collection: spec.name.clone(),
                position: position(row, &table)?,
                row: decode_child_row(row, &table, spec)?,
                valid_from: timestamp(row, &table, "valid_from")?,
                valid_to: optional_timestamp(row, &table, "valid_to")?,
            })
        })
        .collect()
}
