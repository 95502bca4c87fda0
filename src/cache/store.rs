//! Provides the concurrent, memory bounded store of stories.
//!
//! Stories are kept in a [DashMap] so that any number of tasks can add or remove entries
//! without a global lock. Readers never touch the map. They obtain the
//! [ordered snapshot](StoryCache::ordered_snapshot) which is an immutable list sorted by score
//! descending. This list is rebuilt and swapped in one step by
//! [rebuild_ordered_snapshot](StoryCache::rebuild_ordered_snapshot), therefore a reader either
//! sees the previous or the next snapshot but never a partially sorted one.
//!
//! # Memory accounting
//!
//! The store doesn't measure each entry. It rather charges every admitted story with the
//! current average item size. This average starts with the configured
//! **hacker_news.average_object_size** and is recalibrated on each rebuild by sampling about
//! `sqrt(n)` of the stored items via [estimate_size](crate::cache::estimate_size). A story is
//! rejected if charging it would exceed **hacker_news.max_memory**. As the check and the
//! subsequent charge are two separate atomic operations, concurrent insertions may overshoot
//! the limit slightly.
//!
//! # Example
//!
//! ```
//! # use hnproxy::cache::StoryCache;
//! # use hnproxy::settings::{ProxySettings, Settings};
//! # use hnproxy::story::Story;
//! # #[tokio::main]
//! # async fn main() {
//! let cache = StoryCache::new(Settings::fixed(ProxySettings::default()));
//!
//! assert_eq!(cache.try_add(Story::example(1, 10)), true);
//! assert_eq!(cache.try_add(Story::example(2, 50)), true);
//!
//! // Additions only become visible to readers once the snapshot has been rebuilt...
//! assert_eq!(cache.ordered_snapshot().is_empty(), true);
//! cache.rebuild_ordered_snapshot().await;
//!
//! let ids: Vec<_> = cache.ordered_snapshot().iter().map(|story| story.id).collect();
//! assert_eq!(ids, vec![2, 1]);
//! # }
//! ```
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::cache::EstimatedSize;
use crate::fmt::{format_short_duration, format_size};
use crate::settings::Settings;
use crate::story::{Story, StoryId};

/// Represents an immutable list of stories, sorted by score descending.
pub type Snapshot = Arc<Vec<Arc<Story>>>;

/// Keeps track of the estimated memory usage of a [StoryCache].
#[derive(Default)]
pub struct MemoryAccount {
    current_usage: AtomicI64,
    average_item_size: AtomicI64,
}

impl MemoryAccount {
    /// Returns the estimated number of bytes currently occupied.
    pub fn current_usage(&self) -> i64 {
        self.current_usage.load(Ordering::Acquire)
    }

    /// Returns the most recently calibrated item size or 0 if no calibration happened yet.
    pub fn average_item_size(&self) -> i64 {
        self.average_item_size.load(Ordering::Acquire)
    }

    fn charge(&self, bytes: i64) {
        let _ = self.current_usage.fetch_add(bytes, Ordering::AcqRel);
    }

    fn release(&self, bytes: i64) {
        let _ = self
            .current_usage
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |usage| {
                Some((usage - bytes).max(0))
            });
    }

    fn calibrate(&self, average_item_size: i64, items: usize) {
        self.average_item_size
            .store(average_item_size, Ordering::Release);
        self.current_usage
            .store(average_item_size * items as i64, Ordering::Release);
    }
}

/// Stores stories by id and provides a snapshot sorted by score.
pub struct StoryCache {
    stories: DashMap<StoryId, Arc<Story>>,
    ordered: ArcSwap<Vec<Arc<Story>>>,
    rebuild_lock: tokio::sync::Mutex<()>,
    account: MemoryAccount,
    settings: Arc<Settings>,
}

impl StoryCache {
    /// Creates a new and empty cache which reads its limits from the given settings.
    pub fn new(settings: Arc<Settings>) -> Self {
        StoryCache {
            stories: DashMap::new(),
            ordered: ArcSwap::from_pointee(Vec::new()),
            rebuild_lock: tokio::sync::Mutex::new(()),
            account: MemoryAccount::default(),
            settings,
        }
    }

    /// Determines if no story at all is stored.
    pub fn is_empty(&self) -> bool {
        self.stories.is_empty()
    }

    /// Determines if a story with the given id is stored.
    pub fn contains(&self, id: StoryId) -> bool {
        self.stories.contains_key(&id)
    }

    /// Returns the number of stored stories.
    pub fn len(&self) -> usize {
        self.stories.len()
    }

    /// Returns the estimated memory usage in bytes.
    pub fn memory_usage(&self) -> i64 {
        self.account.current_usage()
    }

    /// Returns the calibrated size per story or 0 if the cache hasn't been calibrated yet.
    pub fn average_item_size(&self) -> i64 {
        self.account.average_item_size()
    }

    /// Returns the currently configured memory budget in bytes.
    pub fn memory_limit(&self) -> i64 {
        self.settings.current().hacker_news.max_memory
    }

    /// Provides access to the memory bookkeeping.
    pub fn account(&self) -> &MemoryAccount {
        &self.account
    }

    /// Returns the size which is charged per story.
    fn effective_average(&self) -> i64 {
        match self.account.average_item_size() {
            0 => self.settings.current().hacker_news.average_object_size,
            average => average,
        }
    }

    /// Tries to add the given story.
    ///
    /// Returns **false** if the memory budget would be exceeded. If a story with the same id is
    /// already present, it is replaced by the given one and **true** is returned without charging
    /// any memory.
    pub fn try_add(&self, story: Story) -> bool {
        let average = self.effective_average();
        let usage = self.account.current_usage();
        let limit = self.memory_limit();

        if usage + average > limit {
            log::warn!(
                "Cannot add story {}: The cache is full ({} of {} used).",
                story.id,
                format_size(usage),
                format_size(limit)
            );
            return false;
        }

        match self.stories.entry(story.id) {
            Entry::Vacant(entry) => {
                let _ = entry.insert(Arc::new(story));
                self.account.charge(average);
            }
            Entry::Occupied(mut entry) => {
                let _ = entry.insert(Arc::new(story));
            }
        }

        true
    }

    /// Removes the stories with the given ids.
    ///
    /// Each removed story releases the current average item size. Unknown ids are skipped.
    pub fn remove_old_ids(&self, ids: &[StoryId]) {
        if ids.is_empty() {
            return;
        }

        let average = self.effective_average();
        for id in ids {
            if self.stories.remove(id).is_some() {
                self.account.release(average);
            } else {
                log::warn!("Cannot remove story {}: It isn't cached.", id);
            }
        }
    }

    /// Returns the most recently built snapshot.
    ///
    /// This never blocks but may miss the latest additions or removals until the next
    /// [rebuild](StoryCache::rebuild_ordered_snapshot).
    pub fn ordered_snapshot(&self) -> Snapshot {
        self.ordered.load_full()
    }

    /// Sorts all stored stories by score and publishes them as new snapshot.
    ///
    /// Only one rebuild runs at a time, concurrent calls wait for their turn. As a side effect
    /// the average item size is recalibrated and the memory usage is re-computed from it.
    ///
    /// If the cache is empty, the previous snapshot remains in place.
    pub async fn rebuild_ordered_snapshot(&self) {
        let _guard = self.rebuild_lock.lock().await;
        let watch = Instant::now();

        let mut stories: Vec<Arc<Story>> = self
            .stories
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        if stories.is_empty() {
            return;
        }

        // Ties are broken by id so that equal scores always yield the same order...
        stories.sort_by(|a, b| b.score.cmp(&a.score).then(a.id.cmp(&b.id)));

        let count = stories.len();
        let average = sampled_average(&stories);
        self.ordered.store(Arc::new(stories));
        self.account.calibrate(average, count);

        log::info!(
            "Rebuilt the ordered snapshot: {} stories, {} ({} per story), took {}.",
            count,
            format_size(self.account.current_usage()),
            format_size(average),
            format_short_duration(watch.elapsed())
        );
    }
}

/// Estimates the average size by looking at every s-th story, where s is `ceil(sqrt(n))`.
///
/// Note that the sum is divided by s and not by the number of samples. For a perfect square n
/// both are equal, otherwise this underestimates slightly.
fn sampled_average(stories: &[Arc<Story>]) -> i64 {
    let stride = (stories.len() as f64).sqrt().ceil().max(1.) as usize;
    let total: i64 = stories
        .iter()
        .step_by(stride)
        .map(|story| story.estimated_size())
        .sum();

    total / stride as i64
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::cache::{estimate_size, MemoryAccount, StoryCache};
    use crate::settings::{ProxySettings, Settings};
    use crate::story::Story;
    use crate::testing::test_async;

    fn cache_with_limits(max_memory: i64, average_object_size: i64) -> StoryCache {
        let mut settings = ProxySettings::default();
        settings.hacker_news.max_memory = max_memory;
        settings.hacker_news.average_object_size = average_object_size;
        StoryCache::new(Settings::fixed(settings))
    }

    fn cache() -> StoryCache {
        StoryCache::new(Settings::fixed(ProxySettings::default()))
    }

    fn snapshot_ids(cache: &StoryCache) -> Vec<i64> {
        cache
            .ordered_snapshot()
            .iter()
            .map(|story| story.id)
            .collect()
    }

    #[test]
    fn a_new_cache_is_empty() {
        let cache = cache();
        assert_eq!(cache.is_empty(), true);
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.memory_usage(), 0);
        assert_eq!(cache.average_item_size(), 0);
        assert_eq!(cache.ordered_snapshot().is_empty(), true);
    }

    #[test]
    fn adding_charges_the_configured_default_until_calibrated() {
        let cache = cache_with_limits(1024 * 1024, 256);
        assert_eq!(cache.try_add(Story::example(1, 10)), true);
        assert_eq!(cache.try_add(Story::example(2, 20)), true);

        assert_eq!(cache.contains(1), true);
        assert_eq!(cache.contains(3), false);
        assert_eq!(cache.memory_usage(), 512);
    }

    #[test]
    fn adding_the_same_id_twice_is_idempotent() {
        let cache = cache_with_limits(1024 * 1024, 256);
        assert_eq!(cache.try_add(Story::example(1, 10)), true);
        assert_eq!(cache.try_add(Story::example(1, 99)), true);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.memory_usage(), 256);

        // The last writer wins...
        test_async(async {
            cache.rebuild_ordered_snapshot().await;
            assert_eq!(cache.ordered_snapshot()[0].score, 99);
        });
    }

    #[test]
    fn stories_are_rejected_once_the_budget_is_exhausted() {
        let cache = cache_with_limits(600, 256);
        assert_eq!(cache.try_add(Story::example(1, 10)), true);
        assert_eq!(cache.try_add(Story::example(2, 20)), true);
        assert_eq!(cache.try_add(Story::example(3, 30)), false);

        assert_eq!(cache.contains(3), false);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.memory_usage(), 512);
    }

    #[test]
    fn a_rejection_keeps_duplicates_out_as_well() {
        let cache = cache_with_limits(256, 256);
        assert_eq!(cache.try_add(Story::example(1, 10)), true);

        // The budget check happens first, therefore even a known id is reported as rejected...
        assert_eq!(cache.try_add(Story::example(1, 10)), false);
        assert_eq!(cache.memory_usage(), 256);
    }

    #[test]
    fn removing_releases_memory() {
        let cache = cache_with_limits(1024 * 1024, 256);
        for id in 1..=3 {
            assert_eq!(cache.try_add(Story::example(id, id)), true);
        }

        cache.remove_old_ids(&[1, 2, 42]);
        assert_eq!(cache.contains(1), false);
        assert_eq!(cache.contains(2), false);
        assert_eq!(cache.contains(3), true);
        assert_eq!(cache.memory_usage(), 256);

        cache.remove_old_ids(&[]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn memory_usage_never_drops_below_zero() {
        let account = MemoryAccount::default();
        account.charge(100);
        account.release(300);
        assert_eq!(account.current_usage(), 0);

        account.charge(100);
        assert_eq!(account.current_usage(), 100);
    }

    #[test]
    fn the_snapshot_is_sorted_by_score() {
        test_async(async {
            let cache = cache();
            assert_eq!(cache.try_add(Story::example(1, 10)), true);
            assert_eq!(cache.try_add(Story::example(2, 100)), true);
            assert_eq!(cache.try_add(Story::example(3, 50)), true);

            cache.rebuild_ordered_snapshot().await;

            let scores: Vec<i64> = cache
                .ordered_snapshot()
                .iter()
                .map(|story| story.score)
                .collect();
            assert_eq!(scores, vec![100, 50, 10]);
        });
    }

    #[test]
    fn equal_scores_are_ordered_by_id() {
        test_async(async {
            let cache = cache();
            for id in [5, 3, 9, 1] {
                assert_eq!(cache.try_add(Story::example(id, 7)), true);
            }

            cache.rebuild_ordered_snapshot().await;
            assert_eq!(snapshot_ids(&cache), vec![1, 3, 5, 9]);
        });
    }

    #[test]
    fn snapshots_are_immutable() {
        test_async(async {
            let cache = cache();
            assert_eq!(cache.try_add(Story::example(1, 10)), true);
            cache.rebuild_ordered_snapshot().await;
            let first = cache.ordered_snapshot();

            assert_eq!(cache.try_add(Story::example(2, 20)), true);
            cache.remove_old_ids(&[1]);

            // The previous snapshot is untouched until the next rebuild...
            assert_eq!(Arc::ptr_eq(&first, &cache.ordered_snapshot()), true);
            assert_eq!(snapshot_ids(&cache), vec![1]);

            cache.rebuild_ordered_snapshot().await;
            let second = cache.ordered_snapshot();

            assert_eq!(Arc::ptr_eq(&first, &second), false);
            assert_eq!(first.iter().map(|s| s.id).collect::<Vec<_>>(), vec![1]);
            assert_eq!(second.iter().map(|s| s.id).collect::<Vec<_>>(), vec![2]);
        });
    }

    #[test]
    fn rebuilding_an_empty_cache_keeps_the_previous_snapshot() {
        test_async(async {
            let cache = cache();
            assert_eq!(cache.try_add(Story::example(1, 10)), true);
            cache.rebuild_ordered_snapshot().await;

            cache.remove_old_ids(&[1]);
            cache.rebuild_ordered_snapshot().await;

            assert_eq!(snapshot_ids(&cache), vec![1]);
        });
    }

    #[test]
    fn rebuilding_recalibrates_the_average() {
        test_async(async {
            let cache = cache_with_limits(1024 * 1024, 1024);

            // Stories with two digit ids all share the same estimated size...
            let size = estimate_size(&Story::example(10, 0));
            for id in 10..=13 {
                assert_eq!(cache.try_add(Story::example(id, id)), true);
            }
            assert_eq!(cache.memory_usage(), 4 * 1024);

            // 4 stories -> every 2nd story is sampled and the sum is divided by 2...
            cache.rebuild_ordered_snapshot().await;
            assert_eq!(cache.average_item_size(), size);
            assert_eq!(cache.memory_usage(), 4 * size);

            // New stories are now charged with the calibrated size...
            assert_eq!(cache.try_add(Story::example(14, 14)), true);
            assert_eq!(cache.memory_usage(), 5 * size);

            // 5 stories -> a stride of 3 samples the 1st and the 4th story only, but the sum is
            // still divided by 3...
            cache.rebuild_ordered_snapshot().await;
            assert_eq!(cache.average_item_size(), 2 * size / 3);
            assert_eq!(cache.memory_usage(), 5 * (2 * size / 3));
        });
    }

    #[test]
    fn a_single_story_is_calibrated_exactly() {
        test_async(async {
            let cache = cache();
            let story = Story::example(12345, 1);
            let size = estimate_size(&story);
            assert_eq!(cache.try_add(story), true);

            cache.rebuild_ordered_snapshot().await;
            assert_eq!(cache.average_item_size(), size);
            assert_eq!(cache.memory_usage(), size);
        });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_additions_are_counted_once() {
        let cache = Arc::new(cache_with_limits(1024 * 1024 * 1024, 256));

        let mut tasks = Vec::new();
        for worker in 0..4 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                for id in 1..=250 {
                    // Every worker offers the same ids, only the first insert of each id is charged...
                    let _ = cache.try_add(Story::example(id, id * worker));
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(cache.len(), 250);
        assert_eq!(cache.memory_usage(), 250 * 256);
    }
}
