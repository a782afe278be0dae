//! # Query Layer
//!
//! Read operations over either the store or a live transaction — both
//! expose [`Queryable`]. The untyped core builds parametric SQL for
//! point-get, prefix-list, full-text search and their join-details variants,
//! and materializes rows into `(path, detail path, value bytes, snippet)`
//! records. Typed projection happens in the provided trait methods; value
//! bytes stay raw until the caller decides to decode (eagerly via
//! [`Queryable::list`], lazily via [`Queryable::rlist`]).
//!
//! ## SQL Shapes
//!
//! Plain listing orders by path and pages with `LIMIT`/`OFFSET`:
//!
//! ```sql
//! SELECT path, value FROM S_data WHERE path LIKE ? ORDER BY path ASC LIMIT ? OFFSET ?
//! ```
//!
//! With `join_details` the row's text-tagged value is a pointer to another
//! row, joined on `l.value = d.path` (the partial value index covers this);
//! `include_empty_details` switches the `INNER JOIN` to a `LEFT OUTER JOIN`.
//! Search joins the fts table on the manually managed rowid, filters with
//! `MATCH`, orders by relevance and emits a five-parameter snippet.

use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;

use crate::codec::{decode_text, encode_text, Codec, Storable};
use crate::error::{Error, Result};
use crate::raw::Raw;
use crate::schema::Schema;
use crate::types::{Item, ListParams, SearchParams, SearchResult};

// =============================================================================
// Core
// =============================================================================

/// The capability bundle every queryable carries: the shared connection, the
/// schema names, and the codec. Cloning is cheap (three `Arc`s).
#[derive(Clone)]
pub struct Core {
    conn: Arc<Mutex<Connection>>,
    schema: Arc<Schema>,
    codec: Arc<Codec>,
}

/// One materialized row, paths decoded, value bytes untouched.
#[derive(Debug, Clone)]
pub(crate) struct RowRecord {
    pub path: String,
    pub detail_path: String,
    /// Absent only for `include_empty_details` rows whose detail is missing.
    pub value: Option<Vec<u8>>,
    pub snippet: String,
}

impl Core {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>, schema: Arc<Schema>, codec: Arc<Codec>) -> Self {
        Self { conn, schema, codec }
    }

    pub(crate) fn conn(&self) -> &Arc<Mutex<Connection>> {
        &self.conn
    }

    pub(crate) fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub(crate) fn codec(&self) -> &Arc<Codec> {
        &self.codec
    }

    /// Point get: the raw stored bytes at `path`, if any.
    pub(crate) fn get_bytes(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT value FROM {data} WHERE path = ?",
            data = self.schema.data(),
        ))?;
        let mut rows = stmt.query([SqlValue::Blob(encode_text(path))])?;
        match rows.next()? {
            Some(row) => Ok(row.get::<_, Option<Vec<u8>>>(0)?),
            None => Ok(None),
        }
    }

    /// Prefix listing, optionally full-text filtered.
    pub(crate) fn list_rows(
        &self,
        query: &ListParams,
        search: Option<&SearchParams>,
    ) -> Result<Vec<RowRecord>> {
        let data = self.schema.data();
        let fts = self.schema.fts();
        let sort = if query.reverse_sort { "DESC" } else { "ASC" };
        let join = if query.include_empty_details {
            "LEFT OUTER JOIN"
        } else {
            "INNER JOIN"
        };

        let mut params: Vec<SqlValue> = Vec::with_capacity(8);
        let sql = match search {
            Some(search) => {
                let (hl_start, hl_end, ellipses, num_tokens) = search.effective();
                params.push(SqlValue::Text(hl_start));
                params.push(SqlValue::Text(hl_end));
                params.push(SqlValue::Text(ellipses));
                params.push(SqlValue::Integer(num_tokens));
                params.push(SqlValue::Blob(encode_text(&query.path)));
                params.push(SqlValue::Text(search.query.clone()));
                if query.join_details {
                    format!(
                        "SELECT l.path, l.value, d.value, snippet({fts}, 0, ?, ?, ?, ?) \
                         FROM {fts} f \
                         INNER JOIN {data} d ON f.rowid = d.rowid \
                         INNER JOIN {data} l ON l.value = d.path \
                         WHERE l.path LIKE ? AND SUBSTR(CAST(l.value AS TEXT), 1, 1) = 'T' \
                         AND f.value MATCH ? \
                         ORDER BY f.rank LIMIT ? OFFSET ?"
                    )
                } else {
                    format!(
                        "SELECT d.path, d.value, snippet({fts}, 0, ?, ?, ?, ?) \
                         FROM {fts} f \
                         INNER JOIN {data} d ON f.rowid = d.rowid \
                         WHERE d.path LIKE ? AND f.value MATCH ? \
                         ORDER BY f.rank LIMIT ? OFFSET ?"
                    )
                }
            }
            None => {
                params.push(SqlValue::Blob(encode_text(&query.path)));
                if query.join_details {
                    format!(
                        "SELECT l.path, l.value, d.value \
                         FROM {data} l \
                         {join} {data} d ON l.value = d.path \
                         WHERE l.path LIKE ? AND SUBSTR(CAST(l.value AS TEXT), 1, 1) = 'T' \
                         ORDER BY l.path {sort} LIMIT ? OFFSET ?"
                    )
                } else {
                    format!(
                        "SELECT path, value FROM {data} WHERE path LIKE ? \
                         ORDER BY path {sort} LIMIT ? OFFSET ?"
                    )
                }
            }
        };
        params.push(SqlValue::Integer(query.effective_count()));
        params.push(SqlValue::Integer(query.start));

        let is_search = search.is_some();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&sql)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(params))?;

        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let path_bytes: Vec<u8> = row.get(0)?;
            let path = decode_text(&path_bytes)?;
            let mut col = 1;

            let detail_path = if query.join_details {
                // The index row's own value names the detail row; deriving
                // the path from it keeps LEFT JOIN rows (missing detail)
                // covered as well.
                let pointer: Vec<u8> = row.get(col)?;
                col += 1;
                decode_text(&pointer)?
            } else {
                String::new()
            };

            let value: Option<Vec<u8>> = row.get(col)?;
            col += 1;

            let snippet = if is_search {
                row.get::<_, Option<String>>(col)?.unwrap_or_default()
            } else {
                String::new()
            };

            records.push(RowRecord {
                path,
                detail_path,
                value,
                snippet,
            });
        }
        Ok(records)
    }
}

// =============================================================================
// Queryable
// =============================================================================

pub(crate) mod sealed {
    use super::Core;

    pub trait Sealed {
        fn core(&self) -> &Core;
    }
}

/// Read operations shared by the store and live transactions.
///
/// The typed methods project each row into the caller's target type; decode
/// failures surface per call (`get`) or per row (`list`, `search`). The
/// `r`-prefixed variants return lazily decoded [`Raw`] values instead.
pub trait Queryable: sealed::Sealed {
    /// The value at `path`, eagerly decoded; `None` when absent.
    fn get<T: Storable>(&self, path: &str) -> Result<Option<T>> {
        let core = self.core();
        match core.get_bytes(path)? {
            Some(bytes) if !bytes.is_empty() => Ok(Some(core.codec().decode(&bytes)?)),
            _ => Ok(None),
        }
    }

    /// The value at `path` as an unloaded [`Raw`]; `None` when absent.
    fn rget<T: Storable>(&self, path: &str) -> Result<Option<Raw<T>>> {
        let core = self.core();
        match core.get_bytes(path)? {
            Some(bytes) if !bytes.is_empty() => {
                Ok(Some(Raw::from_bytes(Arc::clone(core.codec()), bytes)))
            }
            _ => Ok(None),
        }
    }

    /// Prefix listing with eager decoding.
    fn list<T: Storable>(&self, query: &ListParams) -> Result<Vec<Item<T>>> {
        let core = self.core();
        let rows = core.list_rows(query, None)?;
        rows.into_iter()
            .map(|row| {
                let bytes = row.value.ok_or(Error::UnexpectedDatabaseState(
                    "detail value missing; list empty details with rlist",
                ))?;
                Ok(Item::new(row.path, row.detail_path, core.codec().decode(&bytes)?))
            })
            .collect()
    }

    /// Prefix listing with lazy decoding. Missing detail values (possible
    /// with `include_empty_details`) become empty raws whose `value()`
    /// reports the absence.
    fn rlist<T: Storable>(&self, query: &ListParams) -> Result<Vec<Item<Raw<T>>>> {
        let core = self.core();
        let rows = core.list_rows(query, None)?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let raw =
                    Raw::from_bytes(Arc::clone(core.codec()), row.value.unwrap_or_default());
                Item::new(row.path, row.detail_path, raw)
            })
            .collect())
    }

    /// Prefix listing projected to paths only.
    fn list_paths(&self, query: &ListParams) -> Result<Vec<String>> {
        let core = self.core();
        let rows = core.list_rows(query, None)?;
        Ok(rows.into_iter().map(|row| row.path).collect())
    }

    /// Full-text search with eager decoding, best matches first.
    fn search<T: Storable>(
        &self,
        query: &ListParams,
        search: &SearchParams,
    ) -> Result<Vec<SearchResult<T>>> {
        let core = self.core();
        let rows = core.list_rows(query, Some(search))?;
        rows.into_iter()
            .map(|row| {
                let bytes = row.value.ok_or(Error::UnexpectedDatabaseState(
                    "search row has no value",
                ))?;
                Ok(SearchResult {
                    item: Item::new(row.path, row.detail_path, core.codec().decode(&bytes)?),
                    snippet: row.snippet,
                })
            })
            .collect()
    }

    /// Full-text search with lazy decoding.
    fn rsearch<T: Storable>(
        &self,
        query: &ListParams,
        search: &SearchParams,
    ) -> Result<Vec<SearchResult<Raw<T>>>> {
        let core = self.core();
        let rows = core.list_rows(query, Some(search))?;
        Ok(rows
            .into_iter()
            .map(|row| SearchResult {
                item: Item::new(
                    row.path,
                    row.detail_path,
                    Raw::from_bytes(Arc::clone(core.codec()), row.value.unwrap_or_default()),
                ),
                snippet: row.snippet,
            })
            .collect())
    }
}

impl<Q: sealed::Sealed> Queryable for Q {}
