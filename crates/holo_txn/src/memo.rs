//! Lazily decoded values backed by their canonical bytes.
//!
//! The raw bytes (always at `Version::LATEST`) are the source of truth; the
//! decoded value is a cache that can be dropped with `unmemoize` to bound
//! memory when objects are kept across rounds. Re-serializing an unmodified
//! value is a byte copy.

use std::sync::{Arc, Mutex};

use bytes::Bytes;

pub struct Memoized<T> {
    bytes: Bytes,
    cache: Mutex<Option<Arc<T>>>,
}

impl<T> Memoized<T> {
    pub fn from_bytes(bytes: Bytes) -> Self {
        Self {
            bytes,
            cache: Mutex::new(None),
        }
    }

    /// Wrap an already decoded value together with its encoding.
    pub fn with_value(bytes: Bytes, value: T) -> Self {
        Self {
            bytes,
            cache: Mutex::new(Some(Arc::new(value))),
        }
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Return the decoded value, decoding and caching it on first access.
    pub fn get<F>(&self, decode: F) -> anyhow::Result<Arc<T>>
    where
        F: FnOnce(&[u8]) -> anyhow::Result<T>,
    {
        let mut cache = self.cache.lock().expect("memoized cache lock");
        if let Some(value) = cache.as_ref() {
            return Ok(Arc::clone(value));
        }
        let value = Arc::new(decode(&self.bytes)?);
        *cache = Some(Arc::clone(&value));
        Ok(value)
    }

    pub fn is_memoized(&self) -> bool {
        self.cache.lock().expect("memoized cache lock").is_some()
    }

    pub fn unmemoize(&self) {
        *self.cache.lock().expect("memoized cache lock") = None;
    }
}

impl<T> Clone for Memoized<T> {
    fn clone(&self) -> Self {
        let cache = self.cache.lock().expect("memoized cache lock").clone();
        Self {
            bytes: self.bytes.clone(),
            cache: Mutex::new(cache),
        }
    }
}

/// Equality ignores the cache.
impl<T> PartialEq for Memoized<T> {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl<T> Eq for Memoized<T> {}

impl<T> std::fmt::Debug for Memoized<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memoized")
            .field("len", &self.bytes.len())
            .field("memoized", &self.is_memoized())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn decodes_once_until_unmemoized() {
        let memo = Memoized::<usize>::from_bytes(Bytes::from_static(b"abc"));
        let calls = AtomicUsize::new(0);
        let decode = |raw: &[u8]| -> anyhow::Result<usize> {
            calls.fetch_add(1, Ordering::Relaxed);
            Ok(raw.len())
        };
        assert_eq!(*memo.get(decode).expect("decode"), 3);
        assert_eq!(*memo.get(decode).expect("decode"), 3);
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        memo.unmemoize();
        assert!(!memo.is_memoized());
        assert_eq!(*memo.get(decode).expect("decode"), 3);
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn equality_ignores_cache_state() {
        let a = Memoized::with_value(Bytes::from_static(b"x"), 1u8);
        let b = Memoized::<u8>::from_bytes(Bytes::from_static(b"x"));
        assert_eq!(a, b);
    }
}
