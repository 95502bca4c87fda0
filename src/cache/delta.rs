//! Computes the ids to add and to remove when reconciling the cache with upstream.
use fnv::FnvHashSet;

use crate::story::StoryId;

/// Describes the changes required to reconcile the cached ids with the ones reported by upstream.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Delta {
    /// Ids reported by upstream which are not cached yet.
    pub to_add: Vec<StoryId>,

    /// Ids which are cached but no longer reported by upstream.
    pub to_remove: Vec<StoryId>,
}

impl Delta {
    /// Determines if nothing has to be done at all.
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Computes which ids have to be added or removed so that `cached` matches `incoming`.
///
/// Both inputs are turned into hash sets first, therefore this runs in **O(n + m)** and repeated
/// ids never show up twice in the result. An empty iterator is treated just like a missing list.
/// `to_add` keeps the order in which the ids were reported by upstream.
///
/// # Example
///
/// ```
/// # use hnproxy::cache::delta;
/// let delta = delta(vec![3, 4, 5, 6, 7], vec![1, 2, 3, 4, 5]);
/// assert_eq!(delta.to_add, vec![6, 7]);
///
/// let mut to_remove = delta.to_remove.clone();
/// to_remove.sort();
/// assert_eq!(to_remove, vec![1, 2]);
/// ```
pub fn delta<I, C>(incoming: I, cached: C) -> Delta
where
    I: IntoIterator<Item = StoryId>,
    C: IntoIterator<Item = StoryId>,
{
    let cached: FnvHashSet<StoryId> = cached.into_iter().collect();

    let mut incoming_set = FnvHashSet::default();
    let mut to_add = Vec::new();
    for id in incoming {
        if incoming_set.insert(id) && !cached.contains(&id) {
            to_add.push(id);
        }
    }

    let to_remove = cached
        .into_iter()
        .filter(|id| !incoming_set.contains(id))
        .collect();

    Delta { to_add, to_remove }
}
