//! # Event Loop
//!
//! A single long-lived thread serializes everything that touches committed
//! state or the subscription registries: transaction commits, subscription
//! registration, unregistration, and shutdown. Callers enqueue a request and
//! block on a reply channel; the loop is the only code that ever mutates the
//! routing tries, which is the entire concurrency discipline — no locks on
//! the registries, no torn fan-out.
//!
//! ```text
//! callers                 ┌──────────────────────────────┐
//! tx.commit()      ─────► │  pathstore-events (1 thread) │
//! subscribe()      ─────► │                              │
//! unsubscribe()    ─────► │  prefix trie   detail trie   │
//! drop(store)      ─────► │  fan-out, SQL COMMIT, flush  │
//!                         └──────────────────────────────┘
//! ```
//!
//! ## Commit Handling
//!
//! For each changed path the loop first routes through the prefix trie
//! (every subscriber whose prefix covers the path), then through the detail
//! trie (every subscriber holding a binding that covers the path, notified
//! against the *index* path that refers to it). Join-details subscribers
//! have their index values decoded as detail paths on the fly, the binding
//! recorded for future commits, and the referenced row fetched inside the
//! still-open transaction. Only after both passes does the SQL `COMMIT` run;
//! on success each dirty subscriber is flushed exactly once with its
//! coalesced change set, and the commit result is replied to the waiting
//! transaction.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::codec::decode_text;
use crate::error::{Error, Result};
use crate::reader::Core;
use crate::subscription::{ChangeSink, EngineItem, SubscriberSpec};
use crate::trie::Trie;
use crate::types::ListParams;
use crate::writer::PendingValue;

// =============================================================================
// Requests
// =============================================================================

/// A transaction's buffered effects, handed over at commit time.
pub(crate) struct CommitRequest {
    pub core: Core,
    pub updates: HashMap<String, PendingValue>,
    pub deletes: HashSet<String>,
    pub reply: mpsc::Sender<Result<()>>,
}

pub(crate) enum Request {
    Commit(CommitRequest),
    Subscribe {
        spec: SubscriberSpec,
        core: Core,
        reply: mpsc::Sender<()>,
    },
    Unsubscribe {
        id: String,
        reply: mpsc::Sender<()>,
    },
    Shutdown,
}

/// Spawns the event loop on a dedicated named thread.
pub(crate) fn spawn() -> std::io::Result<(mpsc::Sender<Request>, JoinHandle<()>)> {
    let (tx, rx) = mpsc::channel();
    let handle = thread::Builder::new()
        .name("pathstore-events".to_string())
        .spawn(move || run_event_loop(rx))?;
    Ok((tx, handle))
}

fn run_event_loop(rx: mpsc::Receiver<Request>) {
    let mut state = EventLoop::new();
    while let Ok(request) = rx.recv() {
        match request {
            Request::Commit(commit) => state.handle_commit(commit),
            Request::Subscribe { spec, core, reply } => {
                state.handle_subscribe(spec, core);
                let _ = reply.send(());
            }
            Request::Unsubscribe { id, reply } => {
                state.handle_unsubscribe(&id);
                let _ = reply.send(());
            }
            Request::Shutdown => break,
        }
    }
    debug!("event loop stopped");
}

// =============================================================================
// Loop State
// =============================================================================

/// One live subscription as the loop tracks it.
struct ActiveSubscription {
    id: String,
    prefixes: Vec<String>,
    join_details: bool,
    sink: Box<dyn ChangeSink>,
    /// Reverse bookkeeping for detail joins: index path → detail path this
    /// subscription currently follows.
    details_by_index: HashMap<String, String>,
}

type Shared = Rc<RefCell<ActiveSubscription>>;
type Bucket = HashMap<String, Shared>;

struct EventLoop {
    by_prefix: Trie<Bucket>,
    by_detail: Trie<Bucket>,
    by_id: HashMap<String, Shared>,
}

/// Every subscription in the trie whose key covers `path`.
fn matching(trie: &Trie<Bucket>, path: &str) -> Vec<Shared> {
    let mut subs = Vec::new();
    trie.visit_prefixes(path, |bucket| subs.extend(bucket.values().cloned()));
    subs
}

fn remove_from_bucket(trie: &mut Trie<Bucket>, key: &str, id: &str) {
    let emptied = match trie.get_mut(key) {
        Some(bucket) => {
            bucket.remove(id);
            bucket.is_empty()
        }
        None => false,
    };
    if emptied {
        trie.remove(key);
    }
}

impl EventLoop {
    fn new() -> Self {
        Self {
            by_prefix: Trie::new(),
            by_detail: Trie::new(),
            by_id: HashMap::new(),
        }
    }

    // =========================================================================
    // Registration
    // =========================================================================

    fn handle_subscribe(&mut self, spec: SubscriberSpec, core: Core) {
        // A duplicate id replaces the prior registration wholesale.
        if self.by_id.contains_key(&spec.id) {
            self.handle_unsubscribe(&spec.id);
        }
        debug!(subscription = %spec.id, prefixes = ?spec.prefixes, "subscribe");

        let SubscriberSpec {
            id,
            prefixes,
            receive_initial,
            join_details,
            sink,
        } = spec;
        let sub = Rc::new(RefCell::new(ActiveSubscription {
            id: id.clone(),
            prefixes: prefixes.clone(),
            join_details,
            sink,
            details_by_index: HashMap::new(),
        }));
        self.by_id.insert(id.clone(), Rc::clone(&sub));
        for prefix in &prefixes {
            self.by_prefix
                .get_or_insert_with(prefix, Bucket::new)
                .insert(id.clone(), Rc::clone(&sub));
        }

        // The initial listing runs for receive-initial subscribers, and also
        // for join-details subscribers that did not ask for it: the latter
        // still need the pass to arm the detail trie, with the items
        // suppressed afterwards.
        if !(receive_initial || join_details) {
            return;
        }
        for prefix in &prefixes {
            let params = ListParams {
                path: format!("{prefix}%"),
                join_details,
                include_empty_details: join_details,
                ..ListParams::default()
            };
            let rows = match core.list_rows(&params, None) {
                Ok(rows) => rows,
                Err(err) => {
                    warn!(prefix = %prefix, error = %err, "initial listing failed");
                    continue;
                }
            };
            for row in rows {
                if join_details && !row.detail_path.is_empty() {
                    self.bind_detail(&sub, &row.path, &row.detail_path);
                }
                // Rows whose detail is missing exist only for bookkeeping.
                if let Some(bytes) = row.value {
                    sub.borrow_mut().sink.on_update(EngineItem {
                        path: row.path,
                        detail_path: row.detail_path,
                        bytes,
                        loaded: None,
                    });
                }
            }
        }
        let mut sub = sub.borrow_mut();
        if receive_initial {
            if let Err(err) = sub.sink.flush() {
                warn!(subscription = %sub.id, error = %err, "subscriber rejected initial change set");
            }
        } else {
            sub.sink.discard();
        }
    }

    fn handle_unsubscribe(&mut self, id: &str) {
        let Some(sub) = self.by_id.remove(id) else {
            return;
        };
        debug!(subscription = %id, "unsubscribe");
        let sub = sub.borrow();
        for prefix in &sub.prefixes {
            remove_from_bucket(&mut self.by_prefix, prefix, id);
        }
        let detail_paths: HashSet<&String> = sub.details_by_index.values().collect();
        for detail in detail_paths {
            remove_from_bucket(&mut self.by_detail, detail, id);
        }
    }

    /// Points `index_path` at `detail_path` for `sub`, retiring the previous
    /// binding when no other index entry of the subscription still uses it.
    fn bind_detail(&mut self, sub: &Shared, index_path: &str, detail_path: &str) {
        let (id, stale) = {
            let mut s = sub.borrow_mut();
            let old = s
                .details_by_index
                .insert(index_path.to_string(), detail_path.to_string());
            let stale = old.filter(|old| {
                old.as_str() != detail_path && !s.details_by_index.values().any(|d| d == old)
            });
            (s.id.clone(), stale)
        };
        if let Some(old) = stale {
            remove_from_bucket(&mut self.by_detail, &old, &id);
        }
        self.by_detail
            .get_or_insert_with(detail_path, Bucket::new)
            .insert(id, Rc::clone(sub));
    }

    /// Drops the binding for a deleted index path.
    fn unbind_index(&mut self, sub: &Shared, index_path: &str) {
        let (id, stale) = {
            let mut s = sub.borrow_mut();
            let old = s.details_by_index.remove(index_path);
            let stale = old.filter(|old| !s.details_by_index.values().any(|d| d == old));
            (s.id.clone(), stale)
        };
        if let Some(old) = stale {
            remove_from_bucket(&mut self.by_detail, &old, &id);
        }
    }

    // =========================================================================
    // Commit Fan-Out
    // =========================================================================

    fn handle_commit(&mut self, commit: CommitRequest) {
        let CommitRequest {
            core,
            updates,
            deletes,
            reply,
        } = commit;
        debug!(
            updates = updates.len(),
            deletes = deletes.len(),
            "commit"
        );
        let mut dirty: HashMap<String, Shared> = HashMap::new();

        for (path, pending) in &updates {
            for sub in matching(&self.by_prefix, path) {
                self.route_update(&sub, path, pending, &core);
                let id = sub.borrow().id.clone();
                dirty.insert(id, sub);
            }
            for sub in matching(&self.by_detail, path) {
                let index_paths = referring_index_paths(&sub, path);
                if index_paths.is_empty() {
                    continue;
                }
                {
                    let mut s = sub.borrow_mut();
                    for index_path in index_paths {
                        s.sink.on_update(EngineItem {
                            path: index_path,
                            detail_path: path.clone(),
                            bytes: pending.bytes.clone(),
                            loaded: pending.loaded.clone(),
                        });
                    }
                }
                let id = sub.borrow().id.clone();
                dirty.insert(id, sub);
            }
        }

        for path in &deletes {
            for sub in matching(&self.by_prefix, path) {
                let join_details = {
                    let mut s = sub.borrow_mut();
                    s.sink.on_delete(path.clone());
                    s.join_details
                };
                if join_details {
                    self.unbind_index(&sub, path);
                }
                let id = sub.borrow().id.clone();
                dirty.insert(id, sub);
            }
            for sub in matching(&self.by_detail, path) {
                let index_paths = referring_index_paths(&sub, path);
                if index_paths.is_empty() {
                    continue;
                }
                {
                    let mut s = sub.borrow_mut();
                    for index_path in index_paths {
                        s.sink.on_delete(index_path);
                    }
                }
                let id = sub.borrow().id.clone();
                dirty.insert(id, sub);
            }
        }

        // The passes above ran against the still-open transaction; only now
        // does the commit become durable.
        let committed = core
            .conn()
            .lock()
            .execute_batch("COMMIT")
            .map_err(Error::from);
        match committed {
            Ok(()) => {
                for sub in dirty.into_values() {
                    let mut s = sub.borrow_mut();
                    if let Err(err) = s.sink.flush() {
                        warn!(subscription = %s.id, error = %err, "subscriber callback failed");
                    }
                }
                let _ = reply.send(Ok(()));
            }
            Err(err) => {
                let _ = core.conn().lock().execute_batch("ROLLBACK");
                for sub in dirty.into_values() {
                    sub.borrow_mut().sink.discard();
                }
                let _ = reply.send(Err(err));
            }
        }
    }

    /// Main-trie delivery of one updated path to one subscriber.
    fn route_update(&mut self, sub: &Shared, path: &str, pending: &PendingValue, core: &Core) {
        let join_details = sub.borrow().join_details;
        if join_details {
            if let Ok(detail_path) = decode_text(&pending.bytes) {
                self.bind_detail(sub, path, &detail_path);
                match core.get_bytes(&detail_path) {
                    Ok(Some(bytes)) => sub.borrow_mut().sink.on_update(EngineItem {
                        path: path.to_string(),
                        detail_path,
                        bytes,
                        loaded: None,
                    }),
                    // Binding armed; nothing to deliver until the detail
                    // row appears.
                    Ok(None) => {}
                    Err(err) => {
                        warn!(path = %detail_path, error = %err, "detail lookup failed")
                    }
                }
                return;
            }
            // Not a text value, so not a pointer: fall through to plain
            // delivery.
        }
        sub.borrow_mut().sink.on_update(EngineItem {
            path: path.to_string(),
            detail_path: String::new(),
            bytes: pending.bytes.clone(),
            loaded: pending.loaded.clone(),
        });
    }
}

/// Index paths of `sub` whose recorded detail binding covers `path`.
fn referring_index_paths(sub: &Shared, path: &str) -> Vec<String> {
    sub.borrow()
        .details_by_index
        .iter()
        .filter(|(_, detail)| path.starts_with(detail.as_str()))
        .map(|(index, _)| index.clone())
        .collect()
}
