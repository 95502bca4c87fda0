//! Provides the client used to talk to the Hacker News API.
//!
//! The [QueryService](crate::query::QueryService) only depends on the [UpstreamClient] trait.
//! [HackerNewsClient] is the production implementation which performs HTTP(S) requests via
//! **hyper**.
//!
//! Neither operation ever fails from the caller's point of view. Transport errors, timeouts,
//! unexpected status codes and malformed JSON are logged and reported as "nothing found" (an
//! empty list or **None**). This permits a refresh to simply keep serving what is already cached
//! if upstream has a hiccup.
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use async_trait::async_trait;
use hyper::body::Bytes;
use hyper::client::HttpConnector;
use hyper::{Body, Client, Uri};
use hyper_tls::HttpsConnector;
use tokio_util::sync::CancellationToken;

use crate::average::Average;
use crate::fmt::format_short_duration;
use crate::settings::Settings;
use crate::story::{Story, StoryId};

/// Describes the operations the [QueryService](crate::query::QueryService) needs from upstream.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Fetches the ids of the current best stories.
    ///
    /// Returns an empty list if upstream cannot be reached or if the token is cancelled.
    async fn fetch_current_ids(&self, token: &CancellationToken) -> Vec<StoryId>;

    /// Fetches the details of the given story.
    ///
    /// Returns **None** if the story is unknown, if upstream cannot be reached or if the token
    /// is cancelled.
    async fn fetch_story(&self, id: StoryId, token: &CancellationToken) -> Option<Story>;
}

/// Talks to the Hacker News API as configured in **hacker_news.***.
pub struct HackerNewsClient {
    client: Client<HttpsConnector<HttpConnector>, Body>,
    settings: Arc<Settings>,
    id_lists: Average,
    stories: Average,
    failures: AtomicU64,
}

impl HackerNewsClient {
    /// Creates a new client which reads its URLs and timeouts from the given settings.
    pub fn new(settings: Arc<Settings>) -> Self {
        HackerNewsClient {
            client: Client::builder().build::<_, Body>(HttpsConnector::new()),
            settings,
            id_lists: Average::new(),
            stories: Average::new(),
            failures: AtomicU64::new(0),
        }
    }

    /// Returns the timings of fetching the list of best stories.
    pub fn id_list_timings(&self) -> &Average {
        &self.id_lists
    }

    /// Returns the timings of fetching individual stories.
    pub fn story_timings(&self) -> &Average {
        &self.stories
    }

    /// Returns the number of upstream calls which failed.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Performs a GET request and returns the body of a successful response.
    async fn get(&self, url: &str, token: &CancellationToken) -> anyhow::Result<Bytes> {
        let uri = Uri::from_str(url).with_context(|| format!("Invalid upstream URL: {}", url))?;
        let timeout = self.settings.current().hacker_news.request_timeout;

        let request = async {
            let response = self
                .client
                .get(uri)
                .await
                .context("Failed to contact upstream")?;

            if !response.status().is_success() {
                return Err(anyhow::anyhow!(
                    "Upstream responded with {}",
                    response.status()
                ));
            }

            hyper::body::to_bytes(response.into_body())
                .await
                .context("Failed to read the upstream response")
        };

        tokio::select! {
            result = tokio::time::timeout(timeout, request) => match result {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!(
                    "Upstream didn't respond within {}",
                    format_short_duration(timeout)
                )),
            },
            _ = token.cancelled() => Err(anyhow::anyhow!("The request has been cancelled")),
        }
    }

    fn report_failure(&self, url: &str, error: anyhow::Error, token: &CancellationToken) {
        if token.is_cancelled() {
            log::warn!("Aborted fetching {}: {:#}", url, error);
        } else {
            let _ = self.failures.fetch_add(1, Ordering::Relaxed);
            log::error!("Failed to fetch {}: {:#}", url, error);
        }
    }
}

#[async_trait]
impl UpstreamClient for HackerNewsClient {
    async fn fetch_current_ids(&self, token: &CancellationToken) -> Vec<StoryId> {
        let url = self.settings.current().hacker_news.url_base.clone();
        let watch = Instant::now();

        let result = self.get(&url, token).await.and_then(|data| {
            serde_json::from_slice::<Option<Vec<StoryId>>>(&data)
                .context("Failed to parse the list of story ids")
        });

        match result {
            Ok(ids) => {
                self.id_lists.add_duration(watch.elapsed());
                ids.unwrap_or_default()
            }
            Err(error) => {
                self.report_failure(&url, error, token);
                Vec::new()
            }
        }
    }

    async fn fetch_story(&self, id: StoryId, token: &CancellationToken) -> Option<Story> {
        let url = self.settings.current().hacker_news.story_url(id);
        let watch = Instant::now();

        match self
            .get(&url, token)
            .await
            .and_then(|data| Story::parse(&data))
        {
            Ok(story) => {
                self.stories.add_duration(watch.elapsed());
                if story.is_none() {
                    log::warn!("Upstream doesn't know story {}.", id);
                }
                story
            }
            Err(error) => {
                self.report_failure(&url, error, token);
                None
            }
        }
    }
}
