#![allow(dead_code)]

use std::sync::Arc;

use pathstore::{Codec, PathStore, Raw, Storable};

/// Opens a store backed by a temp file. Keep the `TempDir` alive for the
/// duration of the test.
pub fn test_store() -> (tempfile::TempDir, PathStore) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join("store.db");
    let store = PathStore::open(&path, "test").expect("open store");
    (dir, store)
}

pub fn unloaded_raw<T: Storable>(codec: &Arc<Codec>, value: &T) -> Raw<T> {
    Raw::unloaded(codec, value).expect("encode value")
}

pub fn loaded_raw<T: Storable>(codec: &Arc<Codec>, value: T) -> Raw<T> {
    Raw::loaded(codec, value).expect("encode value")
}
