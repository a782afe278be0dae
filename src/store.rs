//! # Store Handle
//!
//! [`PathStore`] is the entry point: it owns the SQLite connection, the
//! codec registry and the event loop, ensures the schema objects exist, and
//! hands out transactions and subscriptions. Handles over sibling schema
//! prefixes share all three via [`PathStore::with_schema`], so several
//! logical stores can coexist in one database file behind one loop.
//!
//! ```rust,no_run
//! use pathstore::{PathStore, Queryable};
//!
//! # fn main() -> pathstore::Result<()> {
//! let store = PathStore::open("app.db", "main")?;
//! store.mutate(|tx| {
//!     tx.put("/contacts/42/name", "That Person".to_string(), "")?;
//!     Ok(())
//! })?;
//! let name: Option<String> = store.get("/contacts/42/name")?;
//! # Ok(())
//! # }
//! ```
//!
//! One caveat of the single shared connection: only one write transaction
//! can be open at a time. Readers are unaffected; a second concurrent
//! `begin` surfaces the SQL engine's nested-transaction error.

use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::actor::{self, Request};
use crate::codec::{Codec, Storable};
use crate::error::{Error, Result};
use crate::reader::{sealed, Core};
use crate::schema::{apply_pragmas, Schema};
use crate::subscription::{SubscriberSpec, Subscription};
use crate::writer::Tx;

// =============================================================================
// Event-Loop Handle
// =============================================================================

/// Shared ownership of the loop thread. The last store handle to drop sends
/// the shutdown request and joins the thread.
struct LoopHandle {
    sender: mpsc::Sender<Request>,
    join: Option<JoinHandle<()>>,
}

impl Drop for LoopHandle {
    fn drop(&mut self) {
        let _ = self.sender.send(Request::Shutdown);
        if let Some(handle) = self.join.take() {
            let _ = handle.join();
        }
    }
}

// =============================================================================
// PathStore
// =============================================================================

/// An embedded, typed, subscribable path→value store.
///
/// Cloning is cheap and shares the connection, codec and event loop;
/// clones (and [`PathStore::with_schema`] siblings) can live on other
/// threads.
#[derive(Clone)]
pub struct PathStore {
    core: Core,
    events: Arc<LoopHandle>,
}

impl sealed::Sealed for PathStore {
    fn core(&self) -> &Core {
        &self.core
    }
}

impl PathStore {
    /// Wraps an existing connection, ensuring the schema objects for
    /// `schema_prefix` exist.
    pub fn new(conn: Connection, schema_prefix: &str) -> Result<Self> {
        let schema = Arc::new(Schema::new(schema_prefix));
        schema.create_all(&conn)?;
        let (sender, join) = actor::spawn()?;
        Ok(Self {
            core: Core::new(
                Arc::new(Mutex::new(conn)),
                schema,
                Arc::new(Codec::new()),
            ),
            events: Arc::new(LoopHandle {
                sender,
                join: Some(join),
            }),
        })
    }

    /// Opens (creating if needed) a database file with the store's pragmas
    /// applied.
    pub fn open(path: impl AsRef<Path>, schema_prefix: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        apply_pragmas(&conn)?;
        Self::new(conn, schema_prefix)
    }

    /// An in-memory store, mostly for tests.
    pub fn open_in_memory(schema_prefix: &str) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_pragmas(&conn)?;
        Self::new(conn, schema_prefix)
    }

    /// A handle over a different schema prefix sharing this store's
    /// connection, codec and event loop.
    pub fn with_schema(&self, schema_prefix: &str) -> Result<Self> {
        let schema = Arc::new(Schema::new(schema_prefix));
        schema.create_all(&self.core.conn().lock())?;
        Ok(Self {
            core: Core::new(
                Arc::clone(self.core.conn()),
                schema,
                Arc::clone(self.core.codec()),
            ),
            events: Arc::clone(&self.events),
        })
    }

    // =========================================================================
    // Codec Registration
    // =========================================================================

    /// The shared codec registry.
    pub fn codec(&self) -> &Arc<Codec> {
        self.core.codec()
    }

    /// Registers `T` in the binary-structured category. Must happen before
    /// values of `T` are stored or decoded.
    pub fn register_binary<T>(&self, id: i16)
    where
        T: Serialize + DeserializeOwned + Storable,
    {
        self.core.codec().register_binary::<T>(id);
    }

    /// Registers `T` in the text-structured category.
    pub fn register_json<T>(&self, id: i16)
    where
        T: Serialize + DeserializeOwned + Storable,
    {
        self.core.codec().register_json::<T>(id);
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Opens a write transaction. The caller owns it exclusively until
    /// `commit` or `rollback`.
    pub fn begin(&self) -> Result<Tx> {
        Tx::begin(self.core.clone(), self.events.sender.clone())
    }

    /// Runs `f` inside a transaction: commit on `Ok`, best-effort rollback
    /// on `Err` (the function's error wins over a rollback failure).
    pub fn mutate(&self, f: impl FnOnce(&mut Tx) -> Result<()>) -> Result<()> {
        let mut tx = self.begin()?;
        match f(&mut tx) {
            Ok(()) => tx.commit(),
            Err(err) => {
                if let Err(rollback_err) = tx.rollback() {
                    warn!(error = %rollback_err, "rollback after failed mutate");
                }
                Err(err)
            }
        }
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Registers `sub`. Blocks until the event loop has installed it (and
    /// delivered the initial snapshot, when requested); commits that enter
    /// the loop afterwards are observed.
    pub fn subscribe<T: Storable + Clone>(&self, sub: Subscription<T>) -> Result<()> {
        let spec = SubscriberSpec::erase(sub, Arc::clone(self.core.codec()));
        let (reply_tx, reply_rx) = mpsc::channel();
        self.events
            .sender
            .send(Request::Subscribe {
                spec,
                core: self.core.clone(),
                reply: reply_tx,
            })
            .map_err(|_| Error::Closed)?;
        reply_rx.recv().map_err(|_| Error::Closed)
    }

    /// Removes the subscription registered under `id`, if any. Blocks until
    /// the loop has forgotten it.
    pub fn unsubscribe(&self, id: &str) -> Result<()> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.events
            .sender
            .send(Request::Unsubscribe {
                id: id.to_string(),
                reply: reply_tx,
            })
            .map_err(|_| Error::Closed)?;
        reply_rx.recv().map_err(|_| Error::Closed)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::Queryable;

    #[test]
    fn test_open_put_get() {
        let store = PathStore::open_in_memory("test").expect("open store");
        store
            .mutate(|tx| tx.put("/a", "hello".to_string(), ""))
            .expect("mutate");
        let got: Option<String> = store.get("/a").expect("get");
        assert_eq!(got.as_deref(), Some("hello"));
    }

    #[test]
    fn test_with_schema_isolation() {
        let store = PathStore::open_in_memory("one").expect("open store");
        let other = store.with_schema("two").expect("sibling store");

        store
            .mutate(|tx| tx.put("/a", 1i64, ""))
            .expect("mutate one");
        other
            .mutate(|tx| tx.put("/a", 2i64, ""))
            .expect("mutate two");

        assert_eq!(store.get::<i64>("/a").expect("get one"), Some(1));
        assert_eq!(other.get::<i64>("/a").expect("get two"), Some(2));
    }

    #[test]
    fn test_nil_put_bytes_deletes() {
        let store = PathStore::open_in_memory("test").expect("open store");
        store
            .mutate(|tx| tx.put("/p", "x".to_string(), ""))
            .expect("seed");
        store
            .mutate(|tx| {
                // The untyped core treats absent bytes as a delete, even
                // without update_if_present.
                tx.put_bytes("/p", None, None, "", false)?;
                assert_eq!(tx.get::<String>("/p")?, None);
                Ok(())
            })
            .expect("delete through put");
        assert_eq!(store.get::<String>("/p").expect("get"), None);
    }
}
