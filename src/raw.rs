//! # Lazy Values
//!
//! [`Raw<T>`] is a view over a stored payload that defers decoding until the
//! value is actually needed. Query results and change-set entries hand these
//! out so that listing a thousand rows does not pay for a thousand decodes.
//!
//! The first call to [`Raw::value`] decodes and memoizes the outcome —
//! including a failed outcome. Every later call returns the cached result
//! without touching the codec again. A `Raw` produced from a `put` whose
//! caller supplied a native value arrives with the cache already primed
//! ("loaded"), so subscribers can skip redeserialization entirely.

use std::cell::OnceCell;
use std::fmt;
use std::sync::Arc;

use crate::codec::{Codec, Storable};
use crate::error::{Error, Result};

/// A lazily decoded stored value.
///
/// Owns the raw bytes and a reference to the codec. Effectively move-only:
/// the memoization cell is not thread-shared.
pub struct Raw<T: Storable> {
    codec: Arc<Codec>,
    bytes: Vec<u8>,
    cell: OnceCell<Result<T>>,
}

impl<T: Storable> Raw<T> {
    /// Wraps already-stored bytes; nothing is decoded yet.
    pub(crate) fn from_bytes(codec: Arc<Codec>, bytes: Vec<u8>) -> Self {
        Self {
            codec,
            bytes,
            cell: OnceCell::new(),
        }
    }

    /// Wraps stored bytes with an optionally pre-decoded value.
    pub(crate) fn from_parts(codec: Arc<Codec>, bytes: Vec<u8>, loaded: Option<T>) -> Self {
        let cell = OnceCell::new();
        if let Some(value) = loaded {
            let _ = cell.set(Ok(value));
        }
        Self { codec, bytes, cell }
    }

    /// Encodes `value` and returns an *unloaded* raw over the result; the
    /// first `value()` call will decode it back.
    pub fn unloaded(codec: &Arc<Codec>, value: &T) -> Result<Self> {
        let bytes = codec.encode(value)?;
        Ok(Self::from_bytes(Arc::clone(codec), bytes))
    }

    /// Encodes `value` and returns a raw whose cache is already primed with
    /// it.
    pub fn loaded(codec: &Arc<Codec>, value: T) -> Result<Self> {
        let bytes = codec.encode(&value)?;
        Ok(Self::from_parts(Arc::clone(codec), bytes, Some(value)))
    }

    /// The decoded value. Idempotent: the first call decodes and caches,
    /// later calls return the cache — errors included.
    pub fn value(&self) -> std::result::Result<&T, &Error> {
        self.cell
            .get_or_init(|| self.codec.decode(&self.bytes))
            .as_ref()
    }

    /// The stored bytes, tag included.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// True once a successful decode has been cached (eagerly via
    /// [`Raw::loaded`] / a native `put`, or by a prior `value()` call).
    pub fn is_loaded(&self) -> bool {
        matches!(self.cell.get(), Some(Ok(_)))
    }

    /// The cached value, if a successful decode has happened.
    pub(crate) fn cached(&self) -> Option<&T> {
        match self.cell.get() {
            Some(Ok(value)) => Some(value),
            _ => None,
        }
    }
}

impl<T: Storable + Clone> Clone for Raw<T> {
    fn clone(&self) -> Self {
        // A cached error is not carried over; the clone would re-derive the
        // same error on first use.
        Self::from_parts(
            Arc::clone(&self.codec),
            self.bytes.clone(),
            self.cached().cloned(),
        )
    }
}

impl<T: Storable + PartialEq> PartialEq for Raw<T> {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
            && self.is_loaded() == other.is_loaded()
            && self.cached() == other.cached()
    }
}

impl<T: Storable + fmt::Debug> fmt::Debug for Raw<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Raw")
            .field("bytes", &self.bytes)
            .field("loaded", &self.cached())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> Arc<Codec> {
        Arc::new(Codec::new())
    }

    #[test]
    fn test_unloaded_decodes_on_first_use() {
        let codec = codec();
        let raw = Raw::unloaded(&codec, &"hello".to_string()).expect("encode");
        assert!(!raw.is_loaded());
        assert_eq!(raw.value().expect("decode"), "hello");
        assert!(raw.is_loaded());
        // Second call hits the cache.
        assert_eq!(raw.value().expect("cached"), "hello");
    }

    #[test]
    fn test_loaded_skips_decoding() {
        let codec = codec();
        let raw = Raw::loaded(&codec, 42i64).expect("encode");
        assert!(raw.is_loaded());
        assert_eq!(*raw.value().expect("cached"), 42);
    }

    #[test]
    fn test_error_is_cached() {
        let codec = codec();
        // An i64 payload read as a String fails, and keeps failing.
        let bytes = codec.encode(&7i64).unwrap();
        let raw: Raw<String> = Raw::from_bytes(Arc::clone(&codec), bytes);
        assert!(raw.value().is_err());
        assert!(raw.value().is_err());
        assert!(!raw.is_loaded());
    }

    #[test]
    fn test_equality_tracks_loadedness() {
        let codec = codec();
        let unloaded = Raw::unloaded(&codec, &"x".to_string()).unwrap();
        let loaded = Raw::loaded(&codec, "x".to_string()).unwrap();
        assert_eq!(unloaded.bytes(), loaded.bytes());
        assert_ne!(unloaded, loaded);

        let other = Raw::unloaded(&codec, &"x".to_string()).unwrap();
        assert_eq!(unloaded, other);
    }
}
