//! # Auto-Select Policy
//!
//! Picks a default downstream key from an upstream collection when nothing is
//! pinned, and keeps an explicit pin for as long as it stays valid.
//!
//! | Collection | Pin | Result |
//! |------------|-----|--------|
//! | `[A,B,C]` | none | `A` |
//! | `[A,B,C]` | `C` | `C` (sticky) |
//! | `[A,B]` | `C` | `A`, pin released |
//! | `[]` | any | none, pin released |

use std::fmt;
use std::sync::Arc;

/// Outcome of resolving a selection against a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved<K> {
    /// The pinned key is still present and stays selected.
    Pinned(K),
    /// The default (first element, or none for an empty collection).
    /// `released_pin` is set when a pin existed but vanished from the
    /// collection.
    Default { key: Option<K>, released_pin: bool },
}

impl<K> Resolved<K> {
    /// The selected key, if any.
    #[must_use]
    pub fn key(&self) -> Option<&K> {
        match self {
            Resolved::Pinned(key) => Some(key),
            Resolved::Default { key, .. } => key.as_ref(),
        }
    }

    /// Consume into the selected key.
    #[must_use]
    pub fn into_key(self) -> Option<K> {
        match self {
            Resolved::Pinned(key) => Some(key),
            Resolved::Default { key, .. } => key,
        }
    }

    /// Check if a pin was dropped because its key disappeared.
    #[must_use]
    pub fn released_pin(&self) -> bool {
        matches!(self, Resolved::Default { released_pin: true, .. })
    }
}

/// Default-selection policy over an ordered collection of `I`, producing keys
/// of type `K` through an identifier function.
pub struct AutoSelect<I, K> {
    id_of: Arc<dyn Fn(&I) -> K + Send + Sync>,
}

impl<I, K> Clone for AutoSelect<I, K> {
    fn clone(&self) -> Self {
        Self {
            id_of: Arc::clone(&self.id_of),
        }
    }
}

impl<I, K> fmt::Debug for AutoSelect<I, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoSelect").finish_non_exhaustive()
    }
}

impl<I, K: PartialEq> AutoSelect<I, K> {
    /// Create a policy that identifies elements with `id_of`.
    pub fn new(id_of: impl Fn(&I) -> K + Send + Sync + 'static) -> Self {
        Self {
            id_of: Arc::new(id_of),
        }
    }

    /// The first element's key in insertion order, or `None` when empty.
    pub fn select(&self, items: &[I]) -> Option<K> {
        items.first().map(|item| (self.id_of)(item))
    }

    /// Check if `key` identifies one of `items`.
    pub fn contains(&self, items: &[I], key: &K) -> bool {
        items.iter().any(|item| (self.id_of)(item) == *key)
    }

    /// Resolve the selection for a (re)loaded collection.
    pub fn resolve(&self, items: &[I], pinned: Option<&K>) -> Resolved<K>
    where
        K: Clone,
    {
        match pinned {
            Some(pin) if self.contains(items, pin) => Resolved::Pinned(pin.clone()),
            Some(_) => Resolved::Default {
                key: self.select(items),
                released_pin: true,
            },
            None => Resolved::Default {
                key: self.select(items),
                released_pin: false,
            },
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Class {
        id: u64,
    }

    fn classes(ids: &[u64]) -> Vec<Class> {
        ids.iter().map(|&id| Class { id }).collect()
    }

    fn policy() -> AutoSelect<Class, u64> {
        AutoSelect::new(|class: &Class| class.id)
    }

    #[test]
    fn selects_first_in_insertion_order() {
        assert_eq!(policy().select(&classes(&[12, 10, 11])), Some(12));
    }

    #[test]
    fn empty_collection_selects_nothing() {
        assert_eq!(policy().select(&[]), None);
        let resolved = policy().resolve(&[], None);
        assert_eq!(resolved.key(), None);
        assert!(!resolved.released_pin());
    }

    #[test]
    fn pin_is_sticky_across_reloads() {
        let resolved = policy().resolve(&classes(&[10, 11, 12]), Some(&12));
        assert_eq!(resolved, Resolved::Pinned(12));
    }

    #[test]
    fn vanished_pin_falls_back_to_first() {
        let resolved = policy().resolve(&classes(&[10, 11]), Some(&12));
        assert!(resolved.released_pin());
        assert_eq!(resolved.into_key(), Some(10));
    }

    #[test]
    fn vanished_pin_on_empty_collection_selects_nothing() {
        let resolved = policy().resolve(&[], Some(&12));
        assert!(resolved.released_pin());
        assert_eq!(resolved.into_key(), None);
    }
}
