//! Provides the HTTP endpoints of the proxy.
//!
//! Each request passes through a pipeline: first a global timeout is applied (controlled by
//! **inbound.global_timeout**, 0 disables it). If it is exceeded, the request is aborted and
//! **504 Gateway Timeout** is sent. Then the request is routed:
//!
//! * `GET /api/beststories?n=N` passes the [RateLimiter] (which may delay the request until the
//!   next window or reject it with **429 Too Many Requests**), validates **n** (**400 Bad
//!   Request** unless it is a positive number) and responds with the best **n** stories as JSON
//!   array.
//! * `GET /health` responds with **200** once the cache holds stories and **503** before.
//! * `GET /stats` provides a text table with some metrics of the process, the cache and upstream.
//!
//! Everything else is answered with **404 Not Found**.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Body, Method, Request, Response, StatusCode};
use tokio_util::sync::CancellationToken;

use crate::average::Average;
use crate::cache::StoryCache;
use crate::fmt::format_size;
use crate::platform::Platform;
use crate::query::QueryService;
use crate::ratelimit::RateLimiter;
use crate::settings::Settings;
use crate::story::Story;
use crate::upstream::HackerNewsClient;

const CONTENT_TYPE_TEXT: &str = "text/plain; charset=utf-8";
const CONTENT_TYPE_JSON: &str = "application/json; charset=utf-8";

/// Separates the header of a table in the stats output.
const SEPARATOR: &str =
    "-------------------------------------------------------------------------------\n";

/// Handles all incoming HTTP requests.
pub struct Api {
    platform: Arc<Platform>,
    settings: Arc<Settings>,
    limiter: RateLimiter,
    requests: Average,
    timeouts: AtomicU64,
}

impl Api {
    /// Creates and registers the **Api** for the given platform.
    ///
    /// Note that this is called by [Server::install](crate::server::Server::install).
    pub fn install(platform: &Arc<Platform>) -> Arc<Api> {
        let settings = platform
            .find::<Settings>()
            .unwrap_or_else(|| crate::settings::install(platform));

        let api = Arc::new(Api {
            platform: platform.clone(),
            settings: settings.clone(),
            limiter: RateLimiter::new(settings),
            requests: Average::new(),
            timeouts: AtomicU64::new(0),
        });
        platform.register::<Api>(api.clone());

        api
    }

    /// Provides the rate limiter which guards `/api/beststories`.
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Returns the durations of all handled requests.
    pub fn requests(&self) -> &Average {
        &self.requests
    }

    /// Returns the number of requests which have been aborted by the global timeout.
    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    /// Handles the given request by applying the global timeout and routing it to the
    /// appropriate endpoint.
    ///
    /// Once the timeout is exceeded, the request is cancelled, which aborts all upstream calls
    /// performed on its behalf.
    pub async fn handle(&self, request: Request<Body>) -> Response<Body> {
        let watch = Instant::now();
        let token = self.platform.shutdown_token().child_token();
        let timeout = self.settings.current().inbound.global_timeout;

        let response = if timeout.is_zero() {
            self.route(&request, &token).await
        } else {
            match tokio::time::timeout(timeout, self.route(&request, &token)).await {
                Ok(response) => response,
                Err(_) => {
                    token.cancel();
                    let _ = self.timeouts.fetch_add(1, Ordering::Relaxed);
                    log::warn!(
                        "{} {} exceeded the global timeout of {}.",
                        request.method(),
                        request.uri(),
                        crate::fmt::format_duration(timeout)
                    );
                    respond(
                        StatusCode::GATEWAY_TIMEOUT,
                        CONTENT_TYPE_TEXT,
                        "Global request timeout exceeded.",
                    )
                }
            }
        };

        self.requests.add_duration(watch.elapsed());
        log::debug!(
            "{} {} -> {} ({})",
            request.method(),
            request.uri(),
            response.status().as_u16(),
            crate::fmt::format_short_duration(watch.elapsed())
        );

        response
    }

    async fn route(&self, request: &Request<Body>, token: &CancellationToken) -> Response<Body> {
        match (request.method(), request.uri().path()) {
            (&Method::GET, "/api/beststories") => self.best_stories(request, token).await,
            (&Method::GET, "/health") => self.health(),
            (&Method::GET, "/stats") => self.stats(),
            _ => respond(StatusCode::NOT_FOUND, CONTENT_TYPE_TEXT, "Not found."),
        }
    }

    async fn best_stories(
        &self,
        request: &Request<Body>,
        token: &CancellationToken,
    ) -> Response<Body> {
        if !self.limiter.acquire().await {
            return respond(
                StatusCode::TOO_MANY_REQUESTS,
                CONTENT_TYPE_TEXT,
                "Too many requests. Please try again later.",
            );
        }

        let count = match parse_count(request.uri().query()) {
            Some(count) => count,
            None => {
                return respond(
                    StatusCode::BAD_REQUEST,
                    CONTENT_TYPE_TEXT,
                    "Please provide the number of stories as positive number: ?n=10",
                )
            }
        };

        let service = match self.platform.find::<QueryService>() {
            Some(service) => service,
            None => {
                return respond(
                    StatusCode::SERVICE_UNAVAILABLE,
                    CONTENT_TYPE_TEXT,
                    "The query service is not available.",
                )
            }
        };

        match service.best_stories(token).await {
            Ok(stories) => {
                let best = stories
                    .iter()
                    .take(count)
                    .map(|story| story.as_ref())
                    .collect::<Vec<&Story>>();

                match serde_json::to_vec(&best) {
                    Ok(json) => respond(StatusCode::OK, CONTENT_TYPE_JSON, json),
                    Err(error) => internal_error(anyhow::Error::new(error)),
                }
            }
            Err(error) => internal_error(error),
        }
    }

    fn health(&self) -> Response<Body> {
        let ready = self
            .platform
            .find::<StoryCache>()
            .map(|cache| !cache.is_empty())
            .unwrap_or(false);

        if ready {
            respond(StatusCode::OK, CONTENT_TYPE_TEXT, "Cache is ready.")
        } else {
            respond(
                StatusCode::SERVICE_UNAVAILABLE,
                CONTENT_TYPE_TEXT,
                "Cache is warming up...",
            )
        }
    }

    fn stats(&self) -> Response<Body> {
        let mut result = String::new();

        result += format!("{:<40} {:>38}\n", "Metric", "Value").as_str();
        result += SEPARATOR;

        result += line(
            "Process memory",
            resident_memory()
                .map(format_size)
                .unwrap_or_else(|| "-".to_owned()),
        )
        .as_str();

        if let Some(cache) = self.platform.find::<StoryCache>() {
            result += line("Cached stories", cache.len()).as_str();
            result += line("Stories in snapshot", cache.ordered_snapshot().len()).as_str();
            result += line("Memory usage", format_size(cache.memory_usage())).as_str();
            result += line("Memory limit", format_size(cache.memory_limit())).as_str();
            result += line("Average story size", format_size(cache.average_item_size())).as_str();
        }

        if let Some(service) = self.platform.find::<QueryService>() {
            result += line("Queries", service.requests()).as_str();
            result += line("Refreshes", service.refreshes()).as_str();
        }

        if let Some(client) = self.platform.find::<HackerNewsClient>() {
            result += line("Upstream: Best stories", client.id_list_timings()).as_str();
            result += line("Upstream: Stories", client.story_timings()).as_str();
            result += line("Upstream: Failures", client.failures()).as_str();
        }

        result += line("Inbound: Requests", &self.requests).as_str();
        result += line("Inbound: Queued", self.limiter.queued()).as_str();
        result += line("Inbound: Rate limited", self.limiter.rejected()).as_str();
        result += line("Inbound: Timeouts", self.timeouts()).as_str();
        result += SEPARATOR;

        respond(StatusCode::OK, CONTENT_TYPE_TEXT, result)
    }
}

/// Determines the resident memory of this process in bytes.
fn resident_memory() -> Option<i64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut system = sysinfo::System::new();
    if !system.refresh_process(pid) {
        return None;
    }

    system
        .process(pid)
        .and_then(|process| i64::try_from(process.memory()).ok())
}

fn line(name: &str, value: impl std::fmt::Display) -> String {
    format!("{:<40} {:>38}\n", name, value.to_string())
}

/// Extracts **n** from the query string.
///
/// Returns **None** if the parameter is missing, not a number or not positive.
fn parse_count(query: Option<&str>) -> Option<usize> {
    query?
        .split('&')
        .filter_map(|parameter| parameter.split_once('='))
        .find(|(name, _)| *name == "n")
        .and_then(|(_, value)| value.trim().parse::<i64>().ok())
        .filter(|count| *count > 0)
        .and_then(|count| usize::try_from(count).ok())
}

fn internal_error(error: anyhow::Error) -> Response<Body> {
    log::error!("Failed to determine the best stories: {:#}", error);
    respond(
        StatusCode::INTERNAL_SERVER_ERROR,
        CONTENT_TYPE_TEXT,
        "Failed to determine the best stories.",
    )
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    let _ = response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));

    response
}
