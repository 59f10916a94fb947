//! Dynamic table operations driven by inferred signatures.

use std::collections::BTreeSet;

use rowsmith_core::{FreshnessEntry, Record, SchemaSignature};
use serde_json::Value as JsonValue;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnection, SqlitePool, SqliteRow};
use sqlx::{Column, Row, Sqlite, TypeInfo, ValueRef};
use tracing::debug;

use crate::{FreshnessLedger, StoreError};

/// Quote an identifier for interpolation into SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableColumn {
    pub name: String,
    pub declared_type: String,
}

/// Read access to a table, handed to producers as "the existing table".
#[derive(Debug, Clone)]
pub struct TableHandle {
    pool: SqlitePool,
    name: String,
}

impl TableHandle {
    pub(crate) fn new(pool: SqlitePool, name: &str) -> Self {
        Self {
            pool,
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn exists(&self) -> Result<bool, StoreError> {
        let mut conn = self.pool.acquire().await?;
        table_exists(&mut conn, &self.name).await
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let mut conn = self.pool.acquire().await?;
        count_rows(&mut conn, &self.name).await
    }

    pub async fn columns(&self) -> Result<Vec<TableColumn>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        table_columns(&mut conn, &self.name).await
    }

    /// Rows in storage order, optionally capped.
    pub async fn fetch_records(&self, limit: Option<i64>) -> Result<Vec<Record>, StoreError> {
        let sql = format!(
            "SELECT * FROM {} LIMIT {}",
            quote_ident(&self.name),
            limit.unwrap_or(-1)
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter()
            .map(row_to_record)
            .collect::<Result<_, _>>()
            .map_err(StoreError::from)
    }

    /// Every value stored in `column`, e.g. to skip ids already fetched.
    pub async fn column_values(&self, column: &str) -> Result<Vec<JsonValue>, StoreError> {
        let sql = format!(
            "SELECT {} FROM {}",
            quote_ident(column),
            quote_ident(&self.name)
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| decode_column(row, 0))
            .collect::<Result<_, _>>()
            .map_err(StoreError::from)
    }

    /// When this table was last built, and with how many rows.
    pub async fn last_build(&self) -> Result<Option<FreshnessEntry>, StoreError> {
        FreshnessLedger::new(self.pool.clone()).get(&self.name).await
    }
}

pub async fn table_exists(conn: &mut SqliteConnection, name: &str) -> Result<bool, StoreError> {
    let found: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(name)
            .fetch_one(&mut *conn)
            .await?;
    Ok(found > 0)
}

pub async fn table_columns(
    conn: &mut SqliteConnection,
    name: &str,
) -> Result<Vec<TableColumn>, StoreError> {
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT name, type FROM pragma_table_info(?) ORDER BY cid")
            .bind(name)
            .fetch_all(&mut *conn)
            .await?;
    Ok(rows
        .into_iter()
        .map(|(name, declared_type)| TableColumn {
            name,
            declared_type,
        })
        .collect())
}

pub async fn count_rows(conn: &mut SqliteConnection, name: &str) -> Result<i64, StoreError> {
    let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(name));
    Ok(sqlx::query_scalar(&sql).fetch_one(&mut *conn).await?)
}

/// Create `name` with one column per signature entry. A non-empty natural key
/// becomes the primary key so later batches can upsert against it.
pub async fn create_table(
    conn: &mut SqliteConnection,
    name: &str,
    signature: &SchemaSignature,
    natural_key: &[String],
) -> Result<(), StoreError> {
    if signature.is_empty() {
        return Err(StoreError::EmptySchema {
            table: name.to_string(),
        });
    }
    if let Some(missing) = natural_key.iter().find(|key| !signature.contains(key)) {
        return Err(StoreError::MissingKeyColumn {
            table: name.to_string(),
            column: missing.clone(),
        });
    }

    let mut definitions: Vec<String> = signature
        .iter()
        .map(|(column, kind)| format!("{} {}", quote_ident(column), kind.sql_type()))
        .collect();
    if !natural_key.is_empty() {
        definitions.push(format!("PRIMARY KEY ({})", quoted_list(natural_key)));
    }

    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(name),
        definitions.join(", ")
    );
    debug!(table = name, %sql, "creating table");
    sqlx::query(&sql).execute(&mut *conn).await?;
    Ok(())
}

/// Additive-only DDL: add signature columns the table lacks. Existing columns
/// are never altered.
pub async fn add_missing_columns(
    conn: &mut SqliteConnection,
    name: &str,
    signature: &SchemaSignature,
) -> Result<Vec<String>, StoreError> {
    let existing = table_columns(conn, name).await?;
    let mut added = Vec::new();
    for (column, kind) in signature.iter() {
        if existing.iter().any(|c| c.name == column) {
            continue;
        }
        let sql = format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            quote_ident(name),
            quote_ident(column),
            kind.sql_type()
        );
        debug!(table = name, column, %sql, "adding column");
        sqlx::query(&sql).execute(&mut *conn).await?;
        added.push(column.to_string());
    }
    Ok(added)
}

/// Back `natural_key` with a unique index on an existing table, so upserts
/// have a conflict target even when the table predates the key. Fails without
/// touching the table when stored rows already repeat a key.
pub async fn ensure_unique_key(
    conn: &mut SqliteConnection,
    name: &str,
    natural_key: &[String],
) -> Result<(), StoreError> {
    if natural_key.is_empty() {
        return Ok(());
    }
    let existing = table_columns(conn, name).await?;
    if let Some(missing) = natural_key
        .iter()
        .find(|key| !existing.iter().any(|c| &c.name == *key))
    {
        return Err(StoreError::MissingKeyColumn {
            table: name.to_string(),
            column: missing.clone(),
        });
    }

    let primary_key: Vec<String> =
        sqlx::query_scalar("SELECT name FROM pragma_table_info(?) WHERE pk > 0 ORDER BY pk")
            .bind(name)
            .fetch_all(&mut *conn)
            .await?;
    let index_name = format!("{name}__key__{}", natural_key.join("__"));
    let indexed: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = ?")
            .bind(&index_name)
            .fetch_one(&mut *conn)
            .await?;
    if primary_key == natural_key || indexed > 0 {
        return Ok(());
    }

    let table = quote_ident(name);
    let columns = quoted_list(natural_key);
    let not_null = natural_key
        .iter()
        .map(|c| format!("{} IS NOT NULL", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(" AND ");
    let duplicates_sql = format!(
        "SELECT COUNT(*) FROM (SELECT 1 FROM {table} WHERE {not_null} \
         GROUP BY {columns} HAVING COUNT(*) > 1)"
    );
    let groups: i64 = sqlx::query_scalar(&duplicates_sql)
        .fetch_one(&mut *conn)
        .await?;
    if groups > 0 {
        return Err(StoreError::DuplicateKeyRows {
            table: name.to_string(),
            columns: natural_key.join(", "),
            groups,
        });
    }

    let sql = format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {table} ({columns})",
        quote_ident(&index_name)
    );
    debug!(table = name, %sql, "ensuring natural key index");
    sqlx::query(&sql).execute(&mut *conn).await?;
    Ok(())
}

/// Insert `records`, upserting on `natural_key` when one is declared.
/// Returns the number of rows written.
pub async fn insert_records(
    conn: &mut SqliteConnection,
    name: &str,
    records: &[Record],
    natural_key: &[String],
) -> Result<u64, StoreError> {
    let table = quote_ident(name);
    let mut written = 0u64;

    for record in records {
        if let Some(missing) = natural_key
            .iter()
            .find(|key| record.get(*key).map_or(true, JsonValue::is_null))
        {
            return Err(StoreError::MissingKeyColumn {
                table: name.to_string(),
                column: missing.clone(),
            });
        }

        let sql = insert_sql(&table, record, natural_key);
        let mut query = sqlx::query(&sql);
        for value in record.values() {
            query = bind_value(query, value);
        }
        written += query.execute(&mut *conn).await?.rows_affected();
    }
    Ok(written)
}

/// Delete every stored row whose `column` matches a value carried by
/// `records`, so those groups can be rewritten whole. Returns rows deleted.
pub async fn delete_groups(
    conn: &mut SqliteConnection,
    name: &str,
    column: &str,
    records: &[Record],
) -> Result<u64, StoreError> {
    let mut seen = BTreeSet::new();
    let values: Vec<&JsonValue> = records
        .iter()
        .filter_map(|record| record.get(column))
        .filter(|value| !value.is_null() && seen.insert(value.to_string()))
        .collect();

    let sql = format!(
        "DELETE FROM {} WHERE {} = ?",
        quote_ident(name),
        quote_ident(column)
    );
    let mut deleted = 0u64;
    for value in values {
        deleted += bind_value(sqlx::query(&sql), value)
            .execute(&mut *conn)
            .await?
            .rows_affected();
    }
    debug!(table = name, column, deleted, "cleared fragment groups");
    Ok(deleted)
}

pub async fn drop_table(conn: &mut SqliteConnection, name: &str) -> Result<(), StoreError> {
    let sql = format!("DROP TABLE IF EXISTS {}", quote_ident(name));
    sqlx::query(&sql).execute(&mut *conn).await?;
    Ok(())
}

fn quoted_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn insert_sql(table: &str, record: &Record, natural_key: &[String]) -> String {
    if record.is_empty() {
        return format!("INSERT INTO {table} DEFAULT VALUES");
    }

    let columns: Vec<&String> = record.keys().collect();
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let params = vec!["?"; columns.len()].join(", ");
    let mut sql = format!("INSERT INTO {table} ({column_list}) VALUES ({params})");

    if !natural_key.is_empty() {
        let updates = columns
            .iter()
            .filter(|c| !natural_key.contains(c))
            .map(|c| {
                let quoted = quote_ident(c);
                format!("{quoted} = excluded.{quoted}")
            })
            .collect::<Vec<_>>();
        let conflict_target = quoted_list(natural_key);
        if updates.is_empty() {
            sql.push_str(&format!(" ON CONFLICT ({conflict_target}) DO NOTHING"));
        } else {
            sql.push_str(&format!(
                " ON CONFLICT ({conflict_target}) DO UPDATE SET {}",
                updates.join(", ")
            ));
        }
    }
    sql
}

fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &JsonValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        JsonValue::Null => query.bind(Option::<String>::None),
        JsonValue::Bool(flag) => query.bind(i64::from(*flag)),
        // Integers past i64::MAX are classified Real and stored as such.
        JsonValue::Number(number) => match number.as_i64() {
            Some(int) => query.bind(int),
            None => query.bind(number.as_f64().unwrap_or_default()),
        },
        JsonValue::String(text) => query.bind(text.clone()),
        compound @ (JsonValue::Array(_) | JsonValue::Object(_)) => query.bind(compound.to_string()),
    }
}

fn decode_column(row: &SqliteRow, index: usize) -> Result<JsonValue, sqlx::Error> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(JsonValue::Null);
    }
    let storage_type = raw.type_info().name().to_string();
    Ok(match storage_type.as_str() {
        "INTEGER" => JsonValue::from(row.try_get::<i64, _>(index)?),
        "REAL" => JsonValue::from(row.try_get::<f64, _>(index)?),
        "BLOB" => JsonValue::from(hex::encode(row.try_get::<Vec<u8>, _>(index)?)),
        _ => JsonValue::from(row.try_get::<String, _>(index)?),
    })
}

fn row_to_record(row: &SqliteRow) -> Result<Record, sqlx::Error> {
    let mut record = Record::new();
    for column in row.columns() {
        record.insert(column.name().to_string(), decode_column(row, column.ordinal())?);
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use rowsmith_core::{record, ColumnKind};
    use serde_json::json;
    use tempfile::tempdir;

    fn key(columns: &[&str]) -> Vec<String> {
        columns.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn identifiers_are_quoted_and_escaped() {
        assert_eq!(quote_ident("plain"), "\"plain\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn upsert_sql_updates_non_key_columns() {
        let row = record([("id", json!(1)), ("title", json!("x"))]);
        let sql = insert_sql("\"docs\"", &row, &key(&["id"]));
        assert_eq!(
            sql,
            "INSERT INTO \"docs\" (\"id\", \"title\") VALUES (?, ?) \
             ON CONFLICT (\"id\") DO UPDATE SET \"title\" = excluded.\"title\""
        );
    }

    #[tokio::test]
    async fn create_insert_and_read_back() {
        let dir = tempdir().expect("tempdir");
        let db = Database::open(dir.path().join("t.db")).await.expect("open");
        let rows = vec![
            record([("id", json!(1)), ("price", json!(2.5)), ("tags", json!(["a"]))]),
            record([("id", json!(2)), ("price", json!(null)), ("tags", json!({"k": true}))]),
        ];
        let signature = SchemaSignature::infer(&rows, 100);

        let mut tx = db.begin().await.expect("begin");
        create_table(&mut tx, "items", &signature, &[]).await.expect("create");
        let written = insert_records(&mut tx, "items", &rows, &[]).await.expect("insert");
        tx.commit().await.expect("commit");
        assert_eq!(written, 2);

        let handle = db.existing_table("items").await.expect("lookup").expect("exists");
        assert_eq!(handle.count().await.expect("count"), 2);
        let columns = handle.columns().await.expect("columns");
        assert_eq!(
            columns
                .iter()
                .map(|c| (c.name.as_str(), c.declared_type.as_str()))
                .collect::<Vec<_>>(),
            vec![("id", "INTEGER"), ("price", "REAL"), ("tags", "TEXT")]
        );

        let stored = handle.fetch_records(None).await.expect("fetch");
        assert_eq!(stored[0].get("price"), Some(&json!(2.5)));
        assert_eq!(stored[0].get("tags"), Some(&json!("[\"a\"]")));
        assert_eq!(stored[1].get("price"), Some(&JsonValue::Null));
        assert_eq!(
            handle.column_values("id").await.expect("values"),
            vec![json!(1), json!(2)]
        );
    }

    #[tokio::test]
    async fn natural_key_upserts_instead_of_duplicating() {
        let dir = tempdir().expect("tempdir");
        let db = Database::open(dir.path().join("t.db")).await.expect("open");
        let signature =
            SchemaSignature::from_columns([("id", ColumnKind::Text), ("title", ColumnKind::Text)]);
        let natural_key = key(&["id"]);

        let mut conn = db.pool().acquire().await.expect("conn");
        create_table(&mut conn, "docs", &signature, &natural_key)
            .await
            .expect("create");
        insert_records(
            &mut conn,
            "docs",
            &[record([("id", json!("d1")), ("title", json!("old"))])],
            &natural_key,
        )
        .await
        .expect("first insert");
        insert_records(
            &mut conn,
            "docs",
            &[record([("id", json!("d1")), ("title", json!("new"))])],
            &natural_key,
        )
        .await
        .expect("upsert");
        drop(conn);

        let handle = db.table("docs");
        assert_eq!(handle.count().await.expect("count"), 1);
        let stored = handle.fetch_records(Some(1)).await.expect("fetch");
        assert_eq!(stored[0].get("title"), Some(&json!("new")));
    }

    #[tokio::test]
    async fn missing_natural_key_value_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let db = Database::open(dir.path().join("t.db")).await.expect("open");
        let signature = SchemaSignature::from_columns([("id", ColumnKind::Integer)]);
        let mut conn = db.pool().acquire().await.expect("conn");
        create_table(&mut conn, "t", &signature, &key(&["id"])).await.expect("create");
        let err = insert_records(&mut conn, "t", &[record([("id", json!(null))])], &key(&["id"]))
            .await
            .expect_err("null key");
        assert!(matches!(err, StoreError::MissingKeyColumn { .. }));
    }

    #[tokio::test]
    async fn add_missing_columns_is_additive_only() {
        let dir = tempdir().expect("tempdir");
        let db = Database::open(dir.path().join("t.db")).await.expect("open");
        let mut conn = db.pool().acquire().await.expect("conn");
        create_table(
            &mut conn,
            "t",
            &SchemaSignature::from_columns([("price", ColumnKind::Integer)]),
            &[],
        )
        .await
        .expect("create");

        let wider = SchemaSignature::from_columns([
            ("price", ColumnKind::Real),
            ("currency", ColumnKind::Text),
        ]);
        let added = add_missing_columns(&mut conn, "t", &wider).await.expect("alter");
        assert_eq!(added, vec!["currency".to_string()]);

        let columns = table_columns(&mut conn, "t").await.expect("columns");
        let price = columns.iter().find(|c| c.name == "price").expect("price");
        assert_eq!(price.declared_type, "INTEGER");
    }

    #[tokio::test]
    async fn empty_signature_cannot_create_a_table() {
        let dir = tempdir().expect("tempdir");
        let db = Database::open(dir.path().join("t.db")).await.expect("open");
        let mut conn = db.pool().acquire().await.expect("conn");
        let err = create_table(&mut conn, "t", &SchemaSignature::default(), &[])
            .await
            .expect_err("empty");
        assert!(matches!(err, StoreError::EmptySchema { .. }));
        assert!(!table_exists(&mut conn, "t").await.expect("exists"));
    }

    #[tokio::test]
    async fn key_declared_after_creation_gets_a_unique_index() {
        let dir = tempdir().expect("tempdir");
        let db = Database::open(dir.path().join("t.db")).await.expect("open");
        let signature =
            SchemaSignature::from_columns([("id", ColumnKind::Integer), ("name", ColumnKind::Text)]);
        let natural_key = key(&["id"]);

        let mut conn = db.pool().acquire().await.expect("conn");
        create_table(&mut conn, "users", &signature, &[]).await.expect("create");
        insert_records(&mut conn, "users", &[record([("id", json!(1)), ("name", json!("ada"))])], &[])
            .await
            .expect("keyless insert");

        ensure_unique_key(&mut conn, "users", &natural_key).await.expect("index");
        ensure_unique_key(&mut conn, "users", &natural_key).await.expect("idempotent");
        insert_records(
            &mut conn,
            "users",
            &[record([("id", json!(1)), ("name", json!("grace"))])],
            &natural_key,
        )
        .await
        .expect("upsert");
        drop(conn);

        let handle = db.table("users");
        assert_eq!(handle.count().await.expect("count"), 1);
        assert_eq!(handle.column_values("name").await.expect("names"), vec![json!("grace")]);
    }

    #[tokio::test]
    async fn repeated_keys_in_stored_rows_block_the_index() {
        let dir = tempdir().expect("tempdir");
        let db = Database::open(dir.path().join("t.db")).await.expect("open");
        let signature = SchemaSignature::from_columns([("id", ColumnKind::Integer)]);
        let rows = vec![
            record([("id", json!(7))]),
            record([("id", json!(7))]),
            record([("id", json!(null))]),
            record([("id", json!(null))]),
        ];

        let mut conn = db.pool().acquire().await.expect("conn");
        create_table(&mut conn, "t", &signature, &[]).await.expect("create");
        insert_records(&mut conn, "t", &rows, &[]).await.expect("insert");

        let err = ensure_unique_key(&mut conn, "t", &key(&["id"]))
            .await
            .expect_err("duplicates");
        match err {
            StoreError::DuplicateKeyRows { table, columns, groups } => {
                assert_eq!(table, "t");
                assert_eq!(columns, "id");
                assert_eq!(groups, 1);
            }
            other => panic!("expected duplicate key rows, got {other:?}"),
        }
        assert_eq!(count_rows(&mut conn, "t").await.expect("count"), 4);

        let err = ensure_unique_key(&mut conn, "t", &key(&["slug"]))
            .await
            .expect_err("absent column");
        assert!(matches!(err, StoreError::MissingKeyColumn { .. }));
    }

    #[tokio::test]
    async fn integers_beyond_i64_are_stored_as_real() {
        let dir = tempdir().expect("tempdir");
        let db = Database::open(dir.path().join("t.db")).await.expect("open");
        let rows = vec![record([("big", json!(u64::MAX))])];
        let signature = SchemaSignature::infer(&rows, 100);
        assert_eq!(signature.get("big"), Some(ColumnKind::Real));

        let mut conn = db.pool().acquire().await.expect("conn");
        create_table(&mut conn, "n", &signature, &[]).await.expect("create");
        insert_records(&mut conn, "n", &rows, &[]).await.expect("insert");
        drop(conn);

        let stored = db.table("n").column_values("big").await.expect("values");
        assert_eq!(stored, vec![json!(u64::MAX as f64)]);
    }

    #[tokio::test]
    async fn delete_groups_clears_only_the_named_parents() {
        let dir = tempdir().expect("tempdir");
        let db = Database::open(dir.path().join("t.db")).await.expect("open");
        let rows = vec![
            record([("parent_id", json!("d1")), ("position", json!(0))]),
            record([("parent_id", json!("d1")), ("position", json!(1))]),
            record([("parent_id", json!("d2")), ("position", json!(0))]),
        ];
        let signature = SchemaSignature::infer(&rows, 100);
        let mut conn = db.pool().acquire().await.expect("conn");
        create_table(&mut conn, "f", &signature, &[]).await.expect("create");
        insert_records(&mut conn, "f", &rows, &[]).await.expect("insert");

        let incoming = vec![
            record([("parent_id", json!("d1")), ("position", json!(0))]),
            record([("parent_id", json!("d1")), ("position", json!(3))]),
        ];
        let deleted = delete_groups(&mut conn, "f", "parent_id", &incoming)
            .await
            .expect("delete");
        assert_eq!(deleted, 2);
        drop(conn);

        assert_eq!(
            db.table("f").column_values("parent_id").await.expect("values"),
            vec![json!("d2")]
        );
    }
}
