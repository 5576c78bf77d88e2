//! Replaceable certificate sources.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

/// A shared, wholesale-replaceable list of certificate material.
///
/// Readers clone the inner `Arc` under a read-lock and never observe a
/// partially updated list; writers swap the whole `Arc`.
pub struct SourceCell<T> {
    inner: RwLock<Arc<Vec<T>>>,
}

impl<T> SourceCell<T> {
    /// Create a cell seeded with `items`.
    #[must_use]
    pub fn new(items: Vec<T>) -> Self {
        Self {
            inner: RwLock::new(Arc::new(items)),
        }
    }

    /// Current contents.
    #[must_use]
    pub fn get(&self) -> Arc<Vec<T>> {
        Arc::clone(&self.inner.read())
    }

    /// Replace the contents.
    pub fn replace(&self, items: Vec<T>) {
        *self.inner.write() = Arc::new(items);
    }

    /// Number of items currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// `true` when the cell currently holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for SourceCell<T> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl<T> fmt::Debug for SourceCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceCell").field("len", &self.len()).finish()
    }
}
