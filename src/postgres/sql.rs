// ABOUTME: SQL generation for schema-less row operations
// ABOUTME: Rows travel as one JSON parameter expanded with json_populate_record

use crate::row::{ID_COLUMN, UPDATED_AT_COLUMN};
use crate::store::PENDING_TABLE;
use crate::utils::{qualified_name, quote_ident};

/// `json_populate_record(NULL::"schema"."table", $1::json)` - turns the JSON
/// parameter into a record typed like the table, so the engine never needs
/// to know column types.
fn populate(schema: &str, table: &str) -> String {
    format!(
        "json_populate_record(NULL::{}, $1::json)",
        qualified_name(schema, table)
    )
}

fn quoted_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Build an insert returning the stored row as JSONB.
///
/// Generates a query like:
/// ```sql
/// INSERT INTO "public"."users" AS _row ("id", "name")
/// SELECT "id", "name" FROM json_populate_record(NULL::"public"."users", $1::json)
/// RETURNING to_jsonb(_row)
/// ```
/// Only the given columns are written, so omitted ones keep their defaults.
pub fn build_insert(schema: &str, table: &str, columns: &[String]) -> String {
    if columns.is_empty() {
        return format!(
            "INSERT INTO {} AS _row DEFAULT VALUES RETURNING to_jsonb(_row)",
            qualified_name(schema, table)
        );
    }
    let list = quoted_list(columns);
    format!(
        "INSERT INTO {} AS _row ({}) SELECT {} FROM {} RETURNING to_jsonb(_row)",
        qualified_name(schema, table),
        list,
        list,
        populate(schema, table)
    )
}

/// Build an upsert keyed by `id` that overwrites every given non-id column.
///
/// When the row carries only `id` the conflict clause re-assigns `id` to
/// itself instead of `DO NOTHING`, so `RETURNING` still yields the row.
pub fn build_upsert(schema: &str, table: &str, columns: &[String]) -> String {
    let insert = build_insert(schema, table, columns);
    let (head, returning) = insert
        .rsplit_once(" RETURNING ")
        .unwrap_or((insert.as_str(), "to_jsonb(_row)"));

    let mut updates: Vec<String> = columns
        .iter()
        .filter(|c| c.as_str() != ID_COLUMN)
        .map(|c| format!("{} = EXCLUDED.{}", quote_ident(c), quote_ident(c)))
        .collect();
    if updates.is_empty() {
        updates.push(format!(
            "{} = EXCLUDED.{}",
            quote_ident(ID_COLUMN),
            quote_ident(ID_COLUMN)
        ));
    }

    format!(
        "{} ON CONFLICT ({}) DO UPDATE SET {} RETURNING {}",
        head,
        quote_ident(ID_COLUMN),
        updates.join(", "),
        returning
    )
}

/// Build an update of the given non-id columns on the row matching `id`.
///
/// ```sql
/// UPDATE "public"."users" AS _row SET "name" = _src."name"
/// FROM json_populate_record(NULL::"public"."users", $1::json) AS _src
/// WHERE _row."id" = _src."id"
/// ```
pub fn build_update(schema: &str, table: &str, columns: &[String]) -> String {
    let assignments = columns
        .iter()
        .map(|c| format!("{} = _src.{}", quote_ident(c), quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "UPDATE {} AS _row SET {} FROM {} AS _src WHERE _row.{} = _src.{} RETURNING to_jsonb(_row)",
        qualified_name(schema, table),
        assignments,
        populate(schema, table),
        quote_ident(ID_COLUMN),
        quote_ident(ID_COLUMN)
    )
}

/// Build a delete by `id`; the parameter is `{"id": ...}`.
pub fn build_delete(schema: &str, table: &str) -> String {
    format!(
        "DELETE FROM {} AS _row USING {} AS _src WHERE _row.{} = _src.{}",
        qualified_name(schema, table),
        populate(schema, table),
        quote_ident(ID_COLUMN),
        quote_ident(ID_COLUMN)
    )
}

/// Build an equality-filtered select. `NULL` filter values match `NULL`.
///
/// With no filter columns the query takes no parameters.
pub fn build_select(schema: &str, table: &str, filter_columns: &[String]) -> String {
    let base = format!(
        "SELECT to_jsonb(_row) FROM {} AS _row",
        qualified_name(schema, table)
    );
    let order = format!(" ORDER BY _row.{}", quote_ident(ID_COLUMN));
    if filter_columns.is_empty() {
        return base + &order;
    }

    let predicates = filter_columns
        .iter()
        .map(|c| {
            format!(
                "_row.{} IS NOT DISTINCT FROM _f.{}",
                quote_ident(c),
                quote_ident(c)
            )
        })
        .collect::<Vec<_>>()
        .join(" AND ");
    format!(
        "{} CROSS JOIN {} AS _f WHERE {}{}",
        base,
        populate(schema, table),
        predicates,
        order
    )
}

/// `max(updated_at)` normalized to `timestamptz`.
pub fn build_watermark(schema: &str, table: &str) -> String {
    format!(
        "SELECT max({})::timestamptz FROM {}",
        quote_ident(UPDATED_AT_COLUMN),
        qualified_name(schema, table)
    )
}

/// Keyset page of rows after a `(updated_at, id)` cursor.
///
/// Parameters: `$1` cursor timestamp, `$2` cursor id as text (NULL on the
/// first page, which reduces the predicate to `updated_at > $1`), `$3` limit.
/// Besides the row, each result carries its normalized timestamp and text id
/// so the next cursor can be built without parsing JSON.
pub fn build_changed_since(schema: &str, table: &str) -> String {
    let updated_at = format!("_row.{}", quote_ident(UPDATED_AT_COLUMN));
    let id = format!("_row.{}", quote_ident(ID_COLUMN));
    format!(
        "SELECT to_jsonb(_row), {ts}::timestamptz, {id}::text FROM {table} AS _row \
         WHERE {ts} > $1::timestamptz \
            OR ({ts} = $1::timestamptz AND {id}::text > $2::text) \
         ORDER BY {ts}, {id}::text \
         LIMIT $3",
        ts = updated_at,
        id = id,
        table = qualified_name(schema, table)
    )
}

/// DDL for the pending queue. Idempotent.
pub fn pending_schema(schema: &str) -> String {
    let table = qualified_name(schema, PENDING_TABLE);
    let index = quote_ident(&format!("{}_unsynced_idx", PENDING_TABLE));
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            id          BIGSERIAL PRIMARY KEY,
            table_name  TEXT NOT NULL,
            operation   TEXT NOT NULL,
            data        JSONB NOT NULL,
            created_at  TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp(),
            synced_at   TIMESTAMPTZ,
            error       TEXT,
            attempts    INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS {index}
            ON {table} (created_at, id) WHERE synced_at IS NULL;
        "#,
        table = table,
        index = index
    )
}

pub fn pending_insert(schema: &str) -> String {
    format!(
        "INSERT INTO {} (table_name, operation, data) VALUES ($1, $2, $3) RETURNING id",
        qualified_name(schema, PENDING_TABLE)
    )
}

const PENDING_COLUMNS: &str =
    "id, table_name, operation, data, created_at, synced_at, error, attempts";

/// Parameters: `$1` created_at and `$2` id of the last record seen (both
/// NULL for the head of the queue), `$3` limit.
pub fn pending_fetch_unsynced(schema: &str) -> String {
    format!(
        "SELECT {} FROM {} WHERE synced_at IS NULL \
           AND ($1::timestamptz IS NULL OR (created_at, id) > ($1::timestamptz, $2::bigint)) \
         ORDER BY created_at, id LIMIT $3",
        PENDING_COLUMNS,
        qualified_name(schema, PENDING_TABLE)
    )
}

/// Unsynced queue entries for row `_row` of the table named by `$1`.
fn unsynced_for_row(schema: &str) -> String {
    format!(
        "SELECT 1 FROM {} AS _p WHERE _p.table_name = $1 AND _p.synced_at IS NULL \
           AND _p.data->>'id' = _row.{}::text",
        qualified_name(schema, PENDING_TABLE),
        quote_ident(ID_COLUMN)
    )
}

/// Watermark over rows without an unsynced queued write. `$1` is the
/// table name as stored in `pending_sync`.
pub fn build_sync_watermark(schema: &str, table: &str) -> String {
    format!(
        "SELECT max(_row.{})::timestamptz FROM {} AS _row WHERE NOT EXISTS ({})",
        quote_ident(UPDATED_AT_COLUMN),
        qualified_name(schema, table),
        unsynced_for_row(schema)
    )
}

pub fn pending_unsynced_ids(schema: &str) -> String {
    format!(
        "SELECT DISTINCT data->>'id' FROM {} \
         WHERE table_name = $1 AND synced_at IS NULL AND data->>'id' IS NOT NULL",
        qualified_name(schema, PENDING_TABLE)
    )
}

pub fn pending_get(schema: &str) -> String {
    format!(
        "SELECT {} FROM {} WHERE id = $1",
        PENDING_COLUMNS,
        qualified_name(schema, PENDING_TABLE)
    )
}

pub fn pending_mark_synced(schema: &str) -> String {
    format!(
        "UPDATE {} SET synced_at = $2 WHERE id = $1",
        qualified_name(schema, PENDING_TABLE)
    )
}

pub fn pending_mark_failed(schema: &str) -> String {
    format!(
        "UPDATE {} SET error = $2, attempts = attempts + 1 WHERE id = $1",
        qualified_name(schema, PENDING_TABLE)
    )
}

pub fn pending_status(schema: &str) -> String {
    format!(
        "SELECT count(*) FILTER (WHERE synced_at IS NULL), \
                count(*) FILTER (WHERE synced_at IS NULL AND error IS NOT NULL), \
                count(*) FILTER (WHERE synced_at IS NOT NULL) \
         FROM {}",
        qualified_name(schema, PENDING_TABLE)
    )
}
