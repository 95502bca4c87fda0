//! Provides the read-through logic which keeps the [StoryCache] in sync with upstream.
//!
//! Each call to [QueryService::best_stories] performs a refresh:
//! 1. fetch the ids of the current best stories,
//! 2. compute the [delta](crate::cache::delta) against the ids of the current snapshot,
//! 3. remove stories which are no longer listed,
//! 4. fetch all new stories with bounded parallelism and offer them to the cache,
//! 5. rebuild the ordered snapshot and return it.
//!
//! Only one refresh runs at a time. If the cache already contains stories, a caller who finds a
//! refresh in progress is served the current snapshot right away. If the cache is still empty,
//! there is nothing to serve, therefore the caller waits until the running refresh has
//! completed and then performs its own (most probably cheap) refresh.
//!
//! Everything is tied to the caller's [CancellationToken]. Stories which have been added when a
//! refresh is cancelled remain in the cache and show up in the snapshot after the next refresh.
//!
//! # Installation
//!
//! [install](install) creates and registers the [HackerNewsClient], the [StoryCache] and the
//! [QueryService] and warms up the cache in the background.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::average::Average;
use crate::cache::{delta, Snapshot, StoryCache};
use crate::fmt::format_short_duration;
use crate::platform::Platform;
use crate::settings::Settings;
use crate::upstream::{HackerNewsClient, UpstreamClient};

/// Serves the best stories from the cache and refreshes it on the way.
pub struct QueryService {
    upstream: Arc<dyn UpstreamClient>,
    cache: Arc<StoryCache>,
    settings: Arc<Settings>,
    refresh_gate: Semaphore,
    requests: AtomicU64,
    refreshes: Average,
}

impl QueryService {
    /// Creates a new service which keeps the given cache in sync with the given upstream.
    pub fn new(
        upstream: Arc<dyn UpstreamClient>,
        cache: Arc<StoryCache>,
        settings: Arc<Settings>,
    ) -> Self {
        QueryService {
            upstream,
            cache,
            settings,
            refresh_gate: Semaphore::new(1),
            requests: AtomicU64::new(0),
            refreshes: Average::new(),
        }
    }

    /// Provides access to the underlying cache.
    pub fn cache(&self) -> &Arc<StoryCache> {
        &self.cache
    }

    /// Returns the number of calls to [best_stories](QueryService::best_stories) so far.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Returns the durations of all refreshes which actually contacted upstream.
    pub fn refreshes(&self) -> &Average {
        &self.refreshes
    }

    /// Refreshes the cache (unless a refresh is already running) and returns the stories
    /// ordered by score descending.
    ///
    /// # Errors
    /// Fails if the given token is cancelled before the refresh completed.
    pub async fn best_stories(&self, token: &CancellationToken) -> anyhow::Result<Snapshot> {
        let request = self.requests.fetch_add(1, Ordering::Relaxed) + 1;

        let _permit = if self.cache.is_empty() {
            log::debug!("#{} The cache is empty, waiting for the refresh gate...", request);
            tokio::select! {
                permit = self.refresh_gate.acquire() => {
                    permit.context("The refresh gate has been closed.")?
                }
                _ = token.cancelled() => {
                    return Err(cancelled(request));
                }
            }
        } else {
            match self.refresh_gate.try_acquire() {
                Ok(permit) => permit,
                Err(_) => {
                    log::debug!(
                        "#{} An update is in progress, serving the current snapshot.",
                        request
                    );
                    return Ok(self.cache.ordered_snapshot());
                }
            }
        };

        let watch = Instant::now();
        let result = self.refresh(request, token).await;
        self.refreshes.add_duration(watch.elapsed());
        log::debug!(
            "#{} Refresh completed in {}.",
            request,
            format_short_duration(watch.elapsed())
        );

        result
    }

    async fn refresh(&self, request: u64, token: &CancellationToken) -> anyhow::Result<Snapshot> {
        let ids = self.upstream.fetch_current_ids(token).await;
        if token.is_cancelled() {
            return Err(cancelled(request));
        }
        if ids.is_empty() {
            log::warn!(
                "#{} Upstream didn't report any stories, serving the current snapshot.",
                request
            );
            return Ok(self.cache.ordered_snapshot());
        }

        let current = self.cache.ordered_snapshot();
        let delta = delta(ids, current.iter().map(|story| story.id));
        self.cache.remove_old_ids(&delta.to_remove);

        if delta.to_add.is_empty() {
            log::debug!(
                "#{} No new stories ({} removed), serving the current snapshot.",
                request,
                delta.to_remove.len()
            );
            return Ok(self.cache.ordered_snapshot());
        }

        let max_concurrent_requests = self
            .settings
            .current()
            .hacker_news
            .max_concurrent_requests;
        log::info!(
            "#{} Fetching {} new stories ({} removed, at most {} at once)...",
            request,
            delta.to_add.len(),
            delta.to_remove.len(),
            max_concurrent_requests
        );

        let fetch_all = futures::stream::iter(delta.to_add).for_each_concurrent(
            max_concurrent_requests,
            |id| async move {
                match self.upstream.fetch_story(id, token).await {
                    Some(story) if story.id > 0 => {
                        if !self.cache.try_add(story) {
                            log::warn!("#{} Story {} has been rejected by the cache.", request, id);
                        }
                    }
                    Some(_) => log::warn!("#{} Upstream sent an invalid story for {}.", request, id),
                    None => (),
                }
            },
        );

        tokio::select! {
            _ = fetch_all => (),
            _ = token.cancelled() => return Err(cancelled(request)),
        }
        if token.is_cancelled() {
            return Err(cancelled(request));
        }

        self.cache.rebuild_ordered_snapshot().await;

        Ok(self.cache.ordered_snapshot())
    }
}

fn cancelled(request: u64) -> anyhow::Error {
    anyhow::anyhow!("#{} The request for the best stories has been cancelled.", request)
}

/// Creates and registers the [HackerNewsClient], the [StoryCache] and the [QueryService].
///
/// The cache is warmed up in the background. Note that the [Settings] are installed on demand
/// if the [Builder](crate::builder::Builder) didn't do so already.
pub fn install(platform: &Arc<Platform>) -> Arc<QueryService> {
    let settings = platform
        .find::<Settings>()
        .unwrap_or_else(|| crate::settings::install(platform));

    let client = Arc::new(HackerNewsClient::new(settings.clone()));
    platform.register::<HackerNewsClient>(client.clone());

    install_with_upstream(platform, client)
}

/// Registers a [StoryCache] and a [QueryService] which uses the given upstream.
///
/// This is used by [install] and permits to run against a different upstream in tests.
pub fn install_with_upstream(
    platform: &Arc<Platform>,
    upstream: Arc<dyn UpstreamClient>,
) -> Arc<QueryService> {
    let settings = platform
        .find::<Settings>()
        .unwrap_or_else(|| crate::settings::install(platform));

    let cache = Arc::new(StoryCache::new(settings.clone()));
    platform.register::<StoryCache>(cache.clone());

    let service = Arc::new(QueryService::new(upstream, cache, settings));
    platform.register::<QueryService>(service.clone());

    warm_up(service.clone(), platform.shutdown_token());

    service
}

fn warm_up(service: Arc<QueryService>, token: CancellationToken) {
    crate::spawn!(async move {
        log::info!("Warming up the cache...");
        match service.best_stories(&token).await {
            Ok(stories) => log::info!("Cache warm-up completed: {} stories.", stories.len()),
            Err(error) => log::error!("Cache warm-up failed: {:#}", error),
        }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use crate::builder::Builder;
    use crate::cache::StoryCache;
    use crate::query::QueryService;
    use crate::settings::{ProxySettings, Settings};
    use crate::story::StoryId;
    use crate::testing::{test_async, FakeUpstream};

    fn service_with(upstream: &Arc<FakeUpstream>, settings: ProxySettings) -> QueryService {
        let settings = Settings::fixed(settings);
        QueryService::new(
            upstream.clone(),
            Arc::new(StoryCache::new(settings.clone())),
            settings,
        )
    }

    fn service(upstream: &Arc<FakeUpstream>) -> QueryService {
        service_with(upstream, ProxySettings::default())
    }

    fn ids(snapshot: &[Arc<crate::story::Story>]) -> Vec<StoryId> {
        snapshot.iter().map(|story| story.id).collect()
    }

    #[test]
    fn stories_are_fetched_and_sorted() {
        test_async(async {
            let upstream = FakeUpstream::new(&[(100, 10), (200, 50)]);
            let service = service(&upstream);

            let stories = service
                .best_stories(&CancellationToken::new())
                .await
                .unwrap();

            assert_eq!(ids(&stories), vec![200, 100]);
            assert_eq!(upstream.id_fetches(), 1);
            assert_eq!(upstream.story_fetches(), 2);
            assert_eq!(service.requests(), 1);
        });
    }

    #[test]
    fn an_unchanged_list_is_served_without_fetching_stories() {
        test_async(async {
            let upstream = FakeUpstream::new(&[(1, 10), (2, 20)]);
            let service = service(&upstream);
            let token = CancellationToken::new();

            let first = service.best_stories(&token).await.unwrap();
            let second = service.best_stories(&token).await.unwrap();

            assert_eq!(Arc::ptr_eq(&first, &second), true);
            assert_eq!(upstream.id_fetches(), 2);
            assert_eq!(upstream.story_fetches(), 2);
        });
    }

    #[test]
    fn stale_stories_are_replaced() {
        test_async(async {
            let upstream = FakeUpstream::new(&[(1, 10), (2, 20), (3, 30)]);
            let service = service(&upstream);
            let token = CancellationToken::new();
            let _ = service.best_stories(&token).await.unwrap();

            upstream.publish(&[(2, 20), (3, 30), (4, 5)]);
            let stories = service.best_stories(&token).await.unwrap();

            assert_eq!(ids(&stories), vec![3, 2, 4]);
            assert_eq!(service.cache().contains(1), false);
            assert_eq!(upstream.story_fetches(), 4);
        });
    }

    #[test]
    fn an_upstream_failure_keeps_the_current_snapshot() {
        test_async(async {
            let upstream = FakeUpstream::new(&[(1, 10), (2, 20)]);
            let service = service(&upstream);
            let token = CancellationToken::new();
            let before = service.best_stories(&token).await.unwrap();

            upstream.publish(&[]);
            let after = service.best_stories(&token).await.unwrap();

            assert_eq!(Arc::ptr_eq(&before, &after), true);
            assert_eq!(service.cache().len(), 2);
        });
    }

    #[test]
    fn an_upstream_failure_on_a_cold_cache_yields_an_empty_list() {
        test_async(async {
            let upstream = FakeUpstream::new(&[]);
            let service = service(&upstream);

            let stories = service
                .best_stories(&CancellationToken::new())
                .await
                .unwrap();

            assert_eq!(stories.is_empty(), true);
            assert_eq!(upstream.story_fetches(), 0);
        });
    }

    #[test]
    fn missing_and_invalid_stories_are_skipped() {
        test_async(async {
            let upstream = FakeUpstream::new(&[(1, 10), (2, 20)]);
            upstream.forget(1);
            upstream.corrupt(2);
            upstream.publish_ids(&[1, 2, 3]);
            upstream.insert(3, 30);
            let service = service(&upstream);

            let stories = service
                .best_stories(&CancellationToken::new())
                .await
                .unwrap();

            assert_eq!(ids(&stories), vec![3]);
        });
    }

    #[test]
    fn rejected_stories_do_not_fail_the_refresh() {
        test_async(async {
            let upstream = FakeUpstream::new(&[(1, 10), (2, 20), (3, 30), (4, 40), (5, 50)]);
            let mut settings = ProxySettings::default();
            settings.hacker_news.max_memory = 600;
            settings.hacker_news.average_object_size = 256;
            let service = service_with(&upstream, settings);

            let stories = service
                .best_stories(&CancellationToken::new())
                .await
                .unwrap();

            assert_eq!(stories.len(), 2);
            assert_eq!(upstream.story_fetches(), 5);
        });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn story_fetches_are_bounded() {
        let stories: Vec<(StoryId, i64)> = (1..=60).map(|id| (id, id)).collect();
        let upstream = FakeUpstream::new(&stories);
        upstream.set_delay(Duration::from_millis(20));

        let mut settings = ProxySettings::default();
        settings.hacker_news.max_concurrent_requests = 5;
        let service = service_with(&upstream, settings);

        let result = service
            .best_stories(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.len(), 60);
        assert_eq!(upstream.max_in_flight() <= 5, true);
        assert_eq!(upstream.max_in_flight() > 1, true);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn only_one_refresh_runs_at_a_time() {
        let upstream = FakeUpstream::new(&[(1, 10)]);
        let service = Arc::new(service(&upstream));
        let token = CancellationToken::new();
        let warm = service.best_stories(&token).await.unwrap();

        // Block the next refresh within its story fetches...
        let latch = upstream.block();
        upstream.publish(&[(1, 10), (2, 20)]);
        let refresh = {
            let service = service.clone();
            tokio::spawn(async move { service.best_stories(&CancellationToken::new()).await })
        };
        while upstream.in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Concurrent callers are served from the cache without contacting upstream...
        for _ in 0..5 {
            let stories = service.best_stories(&token).await.unwrap();
            assert_eq!(Arc::ptr_eq(&stories, &warm), true);
        }
        assert_eq!(upstream.id_fetches(), 2);

        latch.cancel();
        let stories = refresh.await.unwrap().unwrap();
        assert_eq!(ids(&stories), vec![2, 1]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cold_start_callers_wait_for_the_running_refresh() {
        let upstream = FakeUpstream::new(&[(1, 10), (2, 20)]);
        upstream.set_delay(Duration::from_millis(50));
        let service = Arc::new(service(&upstream));

        let first = {
            let service = service.clone();
            tokio::spawn(async move { service.best_stories(&CancellationToken::new()).await })
        };
        while upstream.id_fetches() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let second = service
            .best_stories(&CancellationToken::new())
            .await
            .unwrap();
        let first = first.await.unwrap().unwrap();

        // The second caller didn't return early with an empty list and didn't fetch twice...
        assert_eq!(ids(&first), vec![2, 1]);
        assert_eq!(ids(&second), vec![2, 1]);
        assert_eq!(upstream.story_fetches(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancellation_releases_the_gate() {
        let upstream = FakeUpstream::new(&[(1, 10), (2, 20)]);
        let service = Arc::new(service(&upstream));

        let latch = upstream.block();
        let token = CancellationToken::new();
        let refresh = {
            let service = service.clone();
            let token = token.clone();
            tokio::spawn(async move { service.best_stories(&token).await })
        };
        while upstream.in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        token.cancel();
        assert_eq!(refresh.await.unwrap().is_err(), true);

        // Nothing has been published, but the gate is free again...
        assert_eq!(service.cache().ordered_snapshot().is_empty(), true);
        latch.cancel();
        let stories = service
            .best_stories(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ids(&stories), vec![2, 1]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stories_fetched_before_a_cancellation_are_kept() {
        let upstream = FakeUpstream::new(&[(1, 10)]);
        let service = Arc::new(service(&upstream));
        let stories = service
            .best_stories(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ids(&stories), vec![1]);

        upstream.publish(&[(1, 10), (2, 20), (3, 30), (4, 40)]);
        let release = upstream.hold(&[3, 4]);
        let token = CancellationToken::new();
        let refresh = {
            let service = service.clone();
            let token = token.clone();
            tokio::spawn(async move { service.best_stories(&token).await })
        };
        while !service.cache().contains(2) || upstream.in_flight() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        token.cancel();
        assert_eq!(refresh.await.unwrap().is_err(), true);

        // Story 2 made it into the cache but the snapshot wasn't rebuilt...
        assert_eq!(service.cache().contains(2), true);
        assert_eq!(service.cache().contains(3), false);
        assert_eq!(ids(&service.cache().ordered_snapshot()), vec![1]);

        release.cancel();
        let stories = service
            .best_stories(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ids(&stories), vec![4, 3, 2, 1]);
    }

    #[test]
    fn a_cancelled_caller_fails_without_fetching_stories() {
        test_async(async {
            let upstream = FakeUpstream::new(&[(1, 10)]);
            let service = service(&upstream);
            let token = CancellationToken::new();
            token.cancel();

            assert_eq!(service.best_stories(&token).await.is_err(), true);
            assert_eq!(upstream.story_fetches(), 0);
        });
    }

    #[test]
    fn install_warms_up_the_cache() {
        test_async(async {
            let platform = Builder::new().enable_settings().build().await;
            let upstream = FakeUpstream::new(&[(7, 70), (8, 80)]);
            let service = crate::query::install_with_upstream(&platform, upstream.clone());

            while service.cache().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }

            assert_eq!(platform.find::<StoryCache>().is_some(), true);
            assert_eq!(platform.find::<QueryService>().is_some(), true);
            assert_eq!(upstream.id_fetches(), 1);

            platform.terminate();
        });
    }
}
