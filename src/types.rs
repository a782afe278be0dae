//! # Query and Result Types
//!
//! The shapes shared by the query layer and the subscription engine: items,
//! search results, and the two parameter structs. Parameter structs derive
//! `Default` and are meant to be filled field-by-field; zero values mean
//! "use the documented default" and are resolved at query time.

// =============================================================================
// Items
// =============================================================================

/// One row produced by a query or delivered to a subscriber.
///
/// `detail_path` is empty unless the row came out of a join-details query or
/// a detail subscription match, in which case `path` is the index row's path
/// and `value` belongs to the row at `detail_path`.
#[derive(Debug, Clone, PartialEq)]
pub struct Item<V> {
    pub path: String,
    pub detail_path: String,
    pub value: V,
}

impl<V> Item<V> {
    pub fn new(path: impl Into<String>, detail_path: impl Into<String>, value: V) -> Self {
        Self {
            path: path.into(),
            detail_path: detail_path.into(),
            value,
        }
    }
}

/// A full-text match: the item plus its highlighted snippet.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult<V> {
    pub item: Item<V>,
    pub snippet: String,
}

// =============================================================================
// Query Parameters
// =============================================================================

/// Parameters for point-range listing.
///
/// `path` may end in `%` to match any suffix. A `count` of zero means
/// unbounded (resolved to the maximum positive 32-bit value).
#[derive(Debug, Clone, Default)]
pub struct ListParams {
    /// Path or path pattern with a trailing `%` wildcard.
    pub path: String,
    /// Offset into the result set.
    pub start: i64,
    /// Maximum rows returned; 0 means no limit.
    pub count: i64,
    /// Descending path order instead of ascending.
    pub reverse_sort: bool,
    /// Interpret each row's text value as a detail path and join the
    /// referenced row; the returned value is the detail row's.
    pub join_details: bool,
    /// With `join_details`, keep index rows whose detail row is missing
    /// (their value is absent) instead of dropping them.
    pub include_empty_details: bool,
}

impl ListParams {
    /// Lists everything under `path`.
    pub fn prefix(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub(crate) fn effective_count(&self) -> i64 {
        if self.count == 0 {
            i64::from(i32::MAX)
        } else {
            self.count
        }
    }
}

/// Parameters for full-text search.
///
/// Empty highlight/ellipsis strings and a non-positive token count fall back
/// to `*`, `*`, `...` and 64 tokens.
#[derive(Debug, Clone, Default)]
pub struct SearchParams {
    /// FTS match expression, e.g. `bla*`.
    pub query: String,
    pub highlight_start: String,
    pub highlight_end: String,
    pub ellipses: String,
    /// Approximate snippet length in tokens.
    pub num_tokens: i64,
}

impl SearchParams {
    pub fn matching(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    pub(crate) fn effective(&self) -> (String, String, String, i64) {
        let or = |s: &str, default: &str| {
            if s.is_empty() {
                default.to_string()
            } else {
                s.to_string()
            }
        };
        let tokens = if self.num_tokens <= 0 {
            64
        } else {
            self.num_tokens
        };
        (
            or(&self.highlight_start, "*"),
            or(&self.highlight_end, "*"),
            or(&self.ellipses, "..."),
            tokens,
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
