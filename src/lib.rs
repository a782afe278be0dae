//! # pathstore
//!
//! An embedded, typed key-value store on SQLite, keyed by hierarchical text
//! paths (`/contacts/42/messages/7`). One store serves four roles at once:
//!
//! - **Document store**: put/get/delete typed values by path
//! - **Range index**: prefix listings with ordering and paging
//! - **Search index**: full-text queries with snippet highlighting
//! - **Reactive surface**: subscriptions by path prefix receiving one
//!   coalesced change set per committed transaction
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Typed API (Queryable, Tx)                   │
//! │        put/get/list/search, Raw<T> lazy decoding            │
//! └───────────────┬─────────────────────────┬───────────────────┘
//!                 │ reads                   │ commit/subscribe
//!                 ▼                         ▼
//! ┌───────────────────────────┐  ┌──────────────────────────────┐
//! │        Query layer        │  │  Event loop (1 thread)       │
//! │  parametric SQL, rows →   │  │  prefix + detail tries,      │
//! │  (path, detail, bytes)    │  │  fan-out, SQL COMMIT, flush  │
//! └───────────────┬───────────┘  └──────────────┬───────────────┘
//!                 │                             │
//!                 ▼                             ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │            SQLite (data + fts5 + counters tables)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every value crossing the SQL boundary goes through the tagged binary
//! codec, so heterogeneous values share a single BLOB column and remain
//! round-trippable to their original category.
//!
//! ## Module Organization
//!
//! - [`error`]: the crate error enum and `Result` alias
//! - [`codec`]: the tagged value codec and [`Storable`]
//! - [`raw`]: lazily decoded values
//! - [`schema`]: prefixed DDL for the four persistent objects
//! - [`types`]: items, search results, query parameters
//! - [`reader`]: the query layer and [`Queryable`]
//! - [`writer`]: transactions with buffered pending effects
//! - [`subscription`]: subscriptions and change sets
//! - [`store`]: the [`PathStore`] handle

pub mod codec;
pub mod error;
pub mod raw;
pub mod reader;
pub mod schema;
pub mod store;
pub mod subscription;
pub mod types;
pub mod writer;

mod actor;
mod trie;

pub use codec::{is_binary_message, structured_body, Codec, Storable};
pub use error::{Error, Result};
pub use raw::Raw;
pub use reader::Queryable;
pub use schema::Schema;
pub use store::PathStore;
pub use subscription::{ChangeSet, Subscription};
pub use types::{Item, ListParams, SearchParams, SearchResult};
pub use writer::Tx;
