//! # Subscriptions
//!
//! Clients subscribe to path prefixes and receive one coalesced
//! [`ChangeSet`] per committed transaction that touched a matching path.
//! Within a commit, writes to the same path collapse to the final effect: a
//! delete after puts yields only the delete, a put after a delete only the
//! put.
//!
//! A subscription is generic over its value type `T`, but the event loop
//! routes untyped items. The bridge is [`ChangeSink`], implemented by a thin
//! typed adapter constructed at registration: each routed item is narrowed
//! to `T` on delivery, and a native value of the wrong type simply degrades
//! to an unloaded [`Raw`].
//!
//! With `join_details`, a subscription follows stored text values as
//! pointers: changes to an index row report the referenced detail row's
//! value, and changes to a referenced detail row are reported against the
//! index path that points at it.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::codec::{Codec, Storable};
use crate::error::Result;
use crate::raw::Raw;
use crate::types::Item;

// =============================================================================
// Public Types
// =============================================================================

/// The per-commit notification: updated items keyed by path, plus the set of
/// deleted paths.
#[derive(Debug)]
pub struct ChangeSet<T: Storable> {
    pub updates: HashMap<String, Item<Raw<T>>>,
    pub deletes: HashSet<String>,
}

impl<T: Storable> Default for ChangeSet<T> {
    fn default() -> Self {
        Self {
            updates: HashMap::new(),
            deletes: HashSet::new(),
        }
    }
}

impl<T: Storable> ChangeSet<T> {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.deletes.is_empty()
    }
}

impl<T: Storable + PartialEq> PartialEq for ChangeSet<T> {
    fn eq(&self, other: &Self) -> bool {
        self.updates == other.updates && self.deletes == other.deletes
    }
}

/// Callback invoked with each coalesced change set.
pub type OnUpdate<T> = Box<dyn FnMut(ChangeSet<T>) -> Result<()> + Send>;

/// A registered interest in a set of path prefixes.
///
/// `id` is caller-chosen; registering a second subscription under the same
/// id replaces the first. Trailing `%` wildcards on prefixes are stripped at
/// registration.
pub struct Subscription<T: Storable> {
    pub id: String,
    pub path_prefixes: Vec<String>,
    /// Deliver a snapshot of currently matching paths on registration.
    pub receive_initial: bool,
    /// Follow text values as pointers to detail rows.
    pub join_details: bool,
    pub on_update: OnUpdate<T>,
}

impl<T: Storable> Subscription<T> {
    pub fn new(
        id: impl Into<String>,
        path_prefixes: impl IntoIterator<Item = impl Into<String>>,
        on_update: impl FnMut(ChangeSet<T>) -> Result<()> + Send + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            path_prefixes: path_prefixes.into_iter().map(Into::into).collect(),
            receive_initial: false,
            join_details: false,
            on_update: Box::new(on_update),
        }
    }

    pub fn receive_initial(mut self, yes: bool) -> Self {
        self.receive_initial = yes;
        self
    }

    pub fn join_details(mut self, yes: bool) -> Self {
        self.join_details = yes;
        self
    }
}

// =============================================================================
// Engine Bridge
// =============================================================================

/// An untyped item routed by the event loop.
pub(crate) struct EngineItem {
    pub path: String,
    pub detail_path: String,
    pub bytes: Vec<u8>,
    /// The committing caller's native value, when one was supplied.
    pub loaded: Option<Arc<dyn Any + Send + Sync>>,
}

/// The loop-facing side of a subscription: accumulate, then flush once per
/// commit.
pub(crate) trait ChangeSink: Send {
    fn on_update(&mut self, item: EngineItem);
    fn on_delete(&mut self, path: String);
    fn has_pending(&self) -> bool;
    /// Drops accumulated items without delivering them (used to suppress
    /// initial listings that only exist to arm detail bookkeeping).
    fn discard(&mut self);
    /// Delivers the accumulated change set to the subscriber callback.
    fn flush(&mut self) -> Result<()>;
}

/// The registration-time descriptor handed to the event loop.
pub(crate) struct SubscriberSpec {
    pub id: String,
    pub prefixes: Vec<String>,
    pub receive_initial: bool,
    pub join_details: bool,
    pub sink: Box<dyn ChangeSink>,
}

impl SubscriberSpec {
    /// Erases a typed subscription. Prefixes lose any trailing `%` and empty
    /// prefixes are dropped (the routing tries hold only non-empty keys).
    pub fn erase<T: Storable + Clone>(sub: Subscription<T>, codec: Arc<Codec>) -> Self {
        let prefixes = sub
            .path_prefixes
            .into_iter()
            .map(|prefix| prefix.trim_end_matches('%').to_string())
            .filter(|prefix| !prefix.is_empty())
            .collect();
        Self {
            id: sub.id,
            prefixes,
            receive_initial: sub.receive_initial,
            join_details: sub.join_details,
            sink: Box::new(TypedSink {
                codec,
                pending: ChangeSet::default(),
                on_update: sub.on_update,
            }),
        }
    }
}

struct TypedSink<T: Storable> {
    codec: Arc<Codec>,
    pending: ChangeSet<T>,
    on_update: OnUpdate<T>,
}

impl<T: Storable + Clone> ChangeSink for TypedSink<T> {
    fn on_update(&mut self, item: EngineItem) {
        // Narrow the native value to T; a mismatch just loses the priming.
        let loaded = item
            .loaded
            .and_then(|any| any.downcast::<T>().ok())
            .map(|arc| (*arc).clone());
        let raw = Raw::from_parts(Arc::clone(&self.codec), item.bytes, loaded);
        self.pending.deletes.remove(&item.path);
        self.pending
            .updates
            .insert(item.path.clone(), Item::new(item.path, item.detail_path, raw));
    }

    fn on_delete(&mut self, path: String) {
        self.pending.updates.remove(&path);
        self.pending.deletes.insert(path);
    }

    fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    fn discard(&mut self) {
        self.pending = ChangeSet::default();
    }

    fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let set = std::mem::take(&mut self.pending);
        (self.on_update)(set)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn item(path: &str, value: &str, codec: &Arc<Codec>) -> EngineItem {
        EngineItem {
            path: path.to_string(),
            detail_path: String::new(),
            bytes: codec.encode(&value.to_string()).expect("encode"),
            loaded: None,
        }
    }

    #[test]
    fn test_sink_coalesces_per_path() {
        let codec = Arc::new(Codec::new());
        let delivered: Arc<Mutex<Vec<ChangeSet<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&delivered);
        let sub = Subscription::new("s", ["/p"], move |cs| {
            captured.lock().expect("lock").push(cs);
            Ok(())
        });
        let mut spec = SubscriberSpec::erase(sub, Arc::clone(&codec));

        spec.sink.on_update(item("/p/1", "0", &codec));
        spec.sink.on_update(item("/p/1", "1", &codec));
        spec.sink.on_update(item("/p/2", "2", &codec));
        spec.sink.on_delete("/p/2".to_string());
        spec.sink.on_delete("/p/3".to_string());
        spec.sink.on_update(item("/p/3", "3", &codec));
        assert!(spec.sink.has_pending());
        spec.sink.flush().expect("flush");

        let sets = delivered.lock().expect("lock");
        assert_eq!(sets.len(), 1);
        let set = &sets[0];
        assert_eq!(set.updates.len(), 2);
        assert_eq!(
            set.updates["/p/1"].value.value().expect("decode"),
            "1"
        );
        assert_eq!(
            set.updates["/p/3"].value.value().expect("decode"),
            "3"
        );
        assert_eq!(set.deletes, HashSet::from(["/p/2".to_string()]));
    }

    #[test]
    fn test_sink_discard_and_empty_flush() {
        let codec = Arc::new(Codec::new());
        let count = Arc::new(Mutex::new(0usize));
        let captured = Arc::clone(&count);
        let sub: Subscription<String> = Subscription::new("s", ["/p"], move |_| {
            *captured.lock().expect("lock") += 1;
            Ok(())
        });
        let mut spec = SubscriberSpec::erase(sub, Arc::clone(&codec));

        // Flushing with nothing pending never reaches the callback.
        spec.sink.flush().expect("flush");
        assert_eq!(*count.lock().expect("lock"), 0);

        spec.sink.on_update(item("/p/1", "x", &codec));
        spec.sink.discard();
        assert!(!spec.sink.has_pending());
        spec.sink.flush().expect("flush");
        assert_eq!(*count.lock().expect("lock"), 0);
    }

    #[test]
    fn test_prefix_normalization() {
        let sub: Subscription<String> =
            Subscription::new("s", ["/p%", "/q/", "%"], |_| Ok(()));
        let spec = SubscriberSpec::erase(sub, Arc::new(Codec::new()));
        assert_eq!(spec.prefixes, vec!["/p".to_string(), "/q/".to_string()]);
    }

    #[test]
    fn test_loaded_value_narrowing() {
        let codec = Arc::new(Codec::new());
        let delivered: Arc<Mutex<Option<ChangeSet<i64>>>> = Arc::new(Mutex::new(None));
        let captured = Arc::clone(&delivered);
        let sub = Subscription::new("s", ["/n"], move |cs| {
            *captured.lock().expect("lock") = Some(cs);
            Ok(())
        });
        let mut spec = SubscriberSpec::erase(sub, Arc::clone(&codec));

        spec.sink.on_update(EngineItem {
            path: "/n/1".to_string(),
            detail_path: String::new(),
            bytes: codec.encode(&7i64).expect("encode"),
            loaded: Some(Arc::new(7i64)),
        });
        // A native value of the wrong type degrades to unloaded.
        spec.sink.on_update(EngineItem {
            path: "/n/2".to_string(),
            detail_path: String::new(),
            bytes: codec.encode(&8i64).expect("encode"),
            loaded: Some(Arc::new("eight".to_string())),
        });
        spec.sink.flush().expect("flush");

        let guard = delivered.lock().expect("lock");
        let set = guard.as_ref().expect("delivered");
        assert!(set.updates["/n/1"].value.is_loaded());
        assert!(!set.updates["/n/2"].value.is_loaded());
    }
}
