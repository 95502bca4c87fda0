//! HNProxy is a read-through caching proxy which serves the best stories of Hacker News.
//!
//! # Introduction
//! Querying the [Hacker News API](https://github.com/HackerNews/API) for the best stories
//! requires one request for the list of ids and one request per story. Doing this for each
//! client request would be slow and would put quite some load on upstream. Therefore **HNProxy**
//! keeps the stories in memory and only fetches what has changed since the last request.
//!
//! # Features
//! * **Incremental refreshes** - each request fetches the current list of ids, computes the
//!   delta against the cached stories and only fetches the new ones (with bounded parallelism).
//!   See [query](crate::query).
//! * **At most one refresh at a time** - concurrent clients are served the current snapshot
//!   instead of piling up requests against upstream.
//! * **Memory bounded cache** - stories are admitted based on an estimated size which is
//!   recalibrated periodically. See [cache](crate::cache).
//! * **Lock free reads** - readers obtain an immutable snapshot sorted by score which is swapped
//!   atomically once a refresh completes.
//! * **Reload-aware config facility** which permits to update the configuration during operation.
//!   Even the IP binding or port can be changed without a restart. See [settings](crate::settings).
//!
//! # HTTP endpoints
//! * `GET /api/beststories?n=10` returns the best **n** stories as JSON.
//! * `GET /health` reports if the cache holds any stories.
//! * `GET /stats` reports some metrics about the cache and upstream.
//!
//! # Using HNProxy
//! The **hnproxy-io** binary sets everything up. A short example on how to embed the library
//! can be found here: [Builder](builder::Builder).
#![deny(
    missing_docs,
    trivial_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_results
)]
use anyhow::Context;
use simplelog::{
    format_description, CombinedLogger, ConfigBuilder, LevelFilter, SharedLogger, SimpleLogger,
    WriteLogger,
};
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Once;

pub mod api;
pub mod average;
pub mod builder;
pub mod cache;
pub mod config;
pub mod fmt;
pub mod platform;
pub mod query;
pub mod ratelimit;
pub mod server;
pub mod settings;
pub mod signals;
pub mod story;
pub mod upstream;

/// Contains the version of the HNProxy library.
pub const HNPROXY_VERSION: &str = "DEVELOPMENT-SNAPSHOT";

/// Contains the git commit hash of the HNProxy build being used.
pub const HNPROXY_REVISION: &str = "NO-REVISION";

/// Initializes the logging system.
///
/// Log messages are written to stdout and, if a **log_file** is given, also appended to this
/// file. Its directory is created if necessary. If the file cannot be opened, an error is
/// reported and only stdout is used.
///
/// Note that most probably the simplest way is to use a [Builder](builder::Builder) to set up the
/// framework, which will also set up logging if enabled.
pub fn init_logging(log_file: Option<&Path>) {
    static INIT_LOGGING: Once = Once::new();

    // Tests might call this several times...
    INIT_LOGGING.call_once(|| {
        let config = ConfigBuilder::new()
            .set_time_format_custom(format_description!(
                "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
            ))
            .set_thread_level(LevelFilter::Trace)
            .set_target_level(LevelFilter::Error)
            .set_location_level(LevelFilter::Trace)
            .build();

        let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();
        loggers.push(SimpleLogger::new(LevelFilter::Debug, config.clone()));
        if let Some(path) = log_file {
            match open_log_file(path) {
                Ok(file) => loggers.push(WriteLogger::new(LevelFilter::Info, config, file)),
                Err(error) => eprintln!("{:#}", error),
            }
        }

        if let Err(error) = CombinedLogger::init(loggers) {
            eprintln!("Failed to initialize logging system: {}", error);
        }
    });
}

fn open_log_file(path: &Path) -> anyhow::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create log directory {}", parent.to_string_lossy())
        })?;
    }

    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.to_string_lossy()))
}

/// Provides a simple macro to execute an async lambda within `tokio::spawn`.
///
/// The returned join handle is dropped, therefore the task simply runs in the background.
///
/// # Example
/// ```rust
/// # #[macro_use] extern crate hnproxy;
/// # #[tokio::main]
/// # async fn main() {
/// spawn!(async move {
///     // perform some async stuff here...
/// });
/// # }
/// ```
#[macro_export]
macro_rules! spawn {
    ($e:expr) => {{
        std::mem::drop(tokio::spawn($e));
    }};
}

#[cfg(test)]
mod testing {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use crate::story::{Story, StoryId};
    use crate::upstream::UpstreamClient;

    lazy_static::lazy_static! {
        /// Provides a global lock which has to be acquired if a test operates on shared
        /// resources. These are our test ports (1503 and 1505) on which we start our local server
        /// for integration tests and the port (1504) of the fake upstream. Using this lock, we
        /// can still execute all other tests in parallel and only block if required.
        pub static ref SHARED_TEST_RESOURCES: Mutex<()> = Mutex::new(());
    }

    /// Executes async code within a single threaded tokio runtime.
    pub fn test_async<F: std::future::Future>(future: F) {
        use tokio::runtime;

        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let _ = rt.block_on(future);
    }

    /// Simulates upstream in memory and records how it is being used.
    #[derive(Default)]
    pub struct FakeUpstream {
        ids: Mutex<Vec<StoryId>>,
        stories: Mutex<HashMap<StoryId, Story>>,
        delay: Mutex<Duration>,
        latch: Mutex<Option<CancellationToken>>,
        holds: Mutex<HashMap<StoryId, CancellationToken>>,
        id_fetches: AtomicUsize,
        story_fetches: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl FakeUpstream {
        /// Creates an upstream which lists the given stories (id and score) in the given order.
        pub fn new(stories: &[(StoryId, i64)]) -> Arc<Self> {
            let upstream = Arc::new(FakeUpstream::default());
            upstream.publish(stories);
            upstream
        }

        /// Replaces the list of best stories.
        pub fn publish(&self, stories: &[(StoryId, i64)]) {
            self.publish_ids(&stories.iter().map(|(id, _)| *id).collect::<Vec<_>>());
            for (id, score) in stories {
                self.insert(*id, *score);
            }
        }

        /// Replaces the list of ids without touching the stories.
        pub fn publish_ids(&self, ids: &[StoryId]) {
            *self.ids.lock().unwrap() = ids.to_vec();
        }

        /// Makes the given story known.
        pub fn insert(&self, id: StoryId, score: i64) {
            let _ = self
                .stories
                .lock()
                .unwrap()
                .insert(id, Story::example(id, score));
        }

        /// Makes upstream answer "null" for the given story.
        pub fn forget(&self, id: StoryId) {
            let _ = self.stories.lock().unwrap().remove(&id);
        }

        /// Makes upstream deliver a story without an id.
        pub fn corrupt(&self, id: StoryId) {
            let _ = self
                .stories
                .lock()
                .unwrap()
                .insert(id, Story::example(0, 0));
        }

        /// Delays every response by the given duration.
        pub fn set_delay(&self, delay: Duration) {
            *self.delay.lock().unwrap() = delay;
        }

        /// Blocks all story fetches until the returned token is cancelled.
        pub fn block(&self) -> CancellationToken {
            let latch = CancellationToken::new();
            *self.latch.lock().unwrap() = Some(latch.clone());
            latch
        }

        /// Blocks the fetches of the given stories until the returned token is cancelled.
        pub fn hold(&self, ids: &[StoryId]) -> CancellationToken {
            let release = CancellationToken::new();
            let mut holds = self.holds.lock().unwrap();
            for id in ids {
                let _ = holds.insert(*id, release.clone());
            }
            release
        }

        pub fn id_fetches(&self) -> usize {
            self.id_fetches.load(Ordering::SeqCst)
        }

        pub fn story_fetches(&self) -> usize {
            self.story_fetches.load(Ordering::SeqCst)
        }

        pub fn in_flight(&self) -> usize {
            self.in_flight.load(Ordering::SeqCst)
        }

        pub fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl UpstreamClient for FakeUpstream {
        async fn fetch_current_ids(&self, token: &CancellationToken) -> Vec<StoryId> {
            let _ = self.id_fetches.fetch_add(1, Ordering::SeqCst);
            let delay = *self.delay.lock().unwrap();

            tokio::select! {
                _ = tokio::time::sleep(delay) => self.ids.lock().unwrap().clone(),
                _ = token.cancelled() => Vec::new(),
            }
        }

        async fn fetch_story(&self, id: StoryId, token: &CancellationToken) -> Option<Story> {
            let _ = self.story_fetches.fetch_add(1, Ordering::SeqCst);
            let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            let _ = self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

            let latch = self
                .holds
                .lock()
                .unwrap()
                .get(&id)
                .cloned()
                .or_else(|| self.latch.lock().unwrap().clone());
            let delay = *self.delay.lock().unwrap();
            let completed = tokio::select! {
                _ = async {
                    if let Some(latch) = &latch {
                        latch.cancelled().await;
                    }
                    tokio::time::sleep(delay).await;
                } => true,
                _ = token.cancelled() => false,
            };

            let _ = self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if completed {
                self.stories.lock().unwrap().get(&id).cloned()
            } else {
                None
            }
        }
    }
}
