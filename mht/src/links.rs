//! Provides the [`Relation`] store for symmetric bidirectional links.

use rustc_hash::FxHashMap;
use std::hash::Hash;

/// A set of `(left, right)` pairs with lookup from either side. Both halves
/// of a pair are inserted and removed together, so the two directions can
/// never disagree. The vectors returned by [`Relation::rights_of`] and
/// [`Relation::lefts_of`] preserve insertion order.
pub struct Relation<L, R> {
    rights: FxHashMap<L, Vec<R>>,
    lefts: FxHashMap<R, Vec<L>>,
}

impl<L, R> Relation<L, R>
where
    L: Copy + Eq + Hash,
    R: Copy + Eq + Hash,
{
    /// Constructs a new, empty `Relation`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rights: FxHashMap::default(),
            lefts: FxHashMap::default(),
        }
    }

    /// Inserts the pair `(left, right)`.
    pub fn insert(&mut self, left: L, right: R) {
        self.rights.entry(left).or_default().push(right);
        self.lefts.entry(right).or_default().push(left);
    }

    /// Removes the pair `(left, right)`. Removing a pair that is not present
    /// is a no-op.
    pub fn remove(&mut self, left: L, right: R) {
        Self::unlink(&mut self.rights, left, right);
        Self::unlink(&mut self.lefts, right, left);
    }

    /// Removes every pair whose left element is `left` and returns the right
    /// elements that were linked to it.
    pub fn drop_left(&mut self, left: L) -> Vec<R> {
        let rights = self.rights.remove(&left).unwrap_or_default();
        for &right in &rights {
            Self::unlink(&mut self.lefts, right, left);
        }
        rights
    }

    /// Removes every pair whose right element is `right` and returns the
    /// left elements that were linked to it.
    pub fn drop_right(&mut self, right: R) -> Vec<L> {
        let lefts = self.lefts.remove(&right).unwrap_or_default();
        for &left in &lefts {
            Self::unlink(&mut self.rights, left, right);
        }
        lefts
    }

    /// Returns the right elements linked to `left`, in insertion order.
    #[must_use]
    pub fn rights_of(&self, left: L) -> &[R] {
        self.rights.get(&left).map_or(&[], Vec::as_slice)
    }

    /// Returns the left elements linked to `right`, in insertion order.
    #[must_use]
    pub fn lefts_of(&self, right: R) -> &[L] {
        self.lefts.get(&right).map_or(&[], Vec::as_slice)
    }

    fn unlink<A: Copy + Eq + Hash, B: Copy + Eq>(map: &mut FxHashMap<A, Vec<B>>, key: A, gone: B) {
        if let Some(values) = map.get_mut(&key) {
            if let Some(index) = values.iter().position(|&value| value == gone) {
                values.remove(index);
            }
            if values.is_empty() {
                map.remove(&key);
            }
        }
    }
}

impl<L, R> Default for Relation<L, R>
where
    L: Copy + Eq + Hash,
    R: Copy + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}
