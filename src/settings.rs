//! Provides a typed and validated view of the [Config](crate::config::Config).
//!
//! All components read their settings at the time of use via [Settings::current]. Whenever the
//! config file changes, the settings are re-parsed and atomically swapped. Therefore a change of
//! e.g. the memory limit or the number of concurrent upstream requests takes effect without a
//! restart.
//!
//! # Configuration
//!
//! ```yaml
//! server:
//!     host: 0.0.0.0
//!     port: 5080
//!
//! inbound:
//!     # Requests taking longer than this are aborted with 504 (0 disables the timeout).
//!     global_timeout: 30s
//!     # Permits this many requests to /api/beststories per window before responding with 429.
//!     max_requests_per_window: 1000
//!     rate_limit_window: 60s
//!     # Requests beyond the limit wait (oldest first) for the next window. Once this many
//!     # requests are waiting, further ones are rejected with 429.
//!     queue_limit: 50
//!
//! logging:
//!     # Log messages are also appended to this file (an empty value disables it). This is only
//!     # read on startup.
//!     file: logs/hnproxy_log.txt
//!
//! hacker_news:
//!     url_base: https://hacker-news.firebaseio.com/v0/beststories.json
//!     # "{}" is replaced by the id of the story.
//!     url_story_by_id: https://hacker-news.firebaseio.com/v0/item/{}.json
//!     request_timeout: 10s
//!     max_concurrent_requests: 20
//!     # Used as estimated size per story until the first calibration happened.
//!     average_object_size: 256
//!     max_memory: 100m
//! ```
//!
//! Values which cannot be parsed or which are outside of their permitted range are reported as
//! error and replaced by their default.
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use yaml_rust::Yaml;

use crate::config::{ChangeNotifier, Config, Handle};
use crate::fmt::{parse_duration, parse_size};
use crate::platform::Platform;
use crate::story::StoryId;

/// Contains the default upstream URL which lists the ids of the best stories.
pub const DEFAULT_URL_BASE: &str = "https://hacker-news.firebaseio.com/v0/beststories.json";

/// Contains the default upstream URL pattern to fetch a single story.
pub const DEFAULT_URL_STORY_BY_ID: &str = "https://hacker-news.firebaseio.com/v0/item/{}.json";

/// Contains all settings of the proxy.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProxySettings {
    /// Determines where the HTTP server listens.
    pub server: ServerSettings,

    /// Controls the protection of the inbound HTTP endpoint.
    pub inbound: InboundSettings,

    /// Controls how upstream is queried and how much is cached.
    pub hacker_news: HackerNewsSettings,
}

/// Determines the address of the HTTP server.
#[derive(Clone, Debug, PartialEq)]
pub struct ServerSettings {
    /// Contains the IP to bind to.
    pub host: String,

    /// Contains the port to listen on.
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            host: "0.0.0.0".to_owned(),
            port: 5080,
        }
    }
}

impl ServerSettings {
    /// Returns the socket address as "host:port".
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Controls the global timeout and the rate limit of the inbound endpoint.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundSettings {
    /// Contains the max duration of a request. A zero duration disables the timeout.
    pub global_timeout: Duration,

    /// Contains the number of requests permitted within a window.
    pub max_requests_per_window: u32,

    /// Contains the length of a rate limiting window.
    pub rate_limit_window: Duration,

    /// Contains the number of requests which may wait for the next window.
    pub queue_limit: u32,
}

impl Default for InboundSettings {
    fn default() -> Self {
        InboundSettings {
            global_timeout: Duration::from_secs(30),
            max_requests_per_window: 1000,
            rate_limit_window: Duration::from_secs(60),
            queue_limit: 50,
        }
    }
}

/// Controls the upstream client and the cache.
#[derive(Clone, Debug, PartialEq)]
pub struct HackerNewsSettings {
    /// Contains the URL which lists the ids of the best stories.
    pub url_base: String,

    /// Contains the URL pattern used to fetch a story. Each "{}" is replaced by the story id.
    pub url_story_by_id: String,

    /// Contains the timeout applied to each upstream request.
    pub request_timeout: Duration,

    /// Contains the max number of story fetches in flight during a refresh.
    pub max_concurrent_requests: usize,

    /// Contains the estimated size of a story in bytes, used until the cache has calibrated
    /// itself.
    pub average_object_size: i64,

    /// Contains the memory budget of the cache in bytes.
    pub max_memory: i64,
}

impl Default for HackerNewsSettings {
    fn default() -> Self {
        HackerNewsSettings {
            url_base: DEFAULT_URL_BASE.to_owned(),
            url_story_by_id: DEFAULT_URL_STORY_BY_ID.to_owned(),
            request_timeout: Duration::from_secs(10),
            max_concurrent_requests: 20,
            average_object_size: 256,
            max_memory: 100 * 1024 * 1024,
        }
    }
}

impl HackerNewsSettings {
    /// Computes the URL used to fetch the story with the given id.
    ///
    /// # Example
    ///
    /// ```
    /// # use hnproxy::settings::HackerNewsSettings;
    /// let settings = HackerNewsSettings::default();
    /// assert_eq!(
    ///     settings.story_url(8863),
    ///     "https://hacker-news.firebaseio.com/v0/item/8863.json"
    /// );
    /// ```
    pub fn story_url(&self, id: StoryId) -> String {
        self.url_story_by_id.replace("{}", &id.to_string())
    }
}

impl ProxySettings {
    /// Parses the settings from the given config.
    ///
    /// Missing values are silently replaced by their defaults. Invalid values are logged and
    /// replaced by their defaults as well.
    pub fn from_config(handle: &Handle) -> ProxySettings {
        let defaults = ProxySettings::default();

        ProxySettings {
            server: ServerSettings {
                host: text(handle, "server.host", defaults.server.host),
                port: number(handle, "server.port", defaults.server.port as i64, 1, 65535) as u16,
            },
            inbound: InboundSettings {
                global_timeout: duration(
                    handle,
                    "inbound.global_timeout",
                    defaults.inbound.global_timeout,
                    Duration::ZERO,
                    Duration::from_secs(30),
                ),
                max_requests_per_window: number(
                    handle,
                    "inbound.max_requests_per_window",
                    defaults.inbound.max_requests_per_window as i64,
                    1,
                    10_000,
                ) as u32,
                rate_limit_window: duration(
                    handle,
                    "inbound.rate_limit_window",
                    defaults.inbound.rate_limit_window,
                    Duration::from_secs(1),
                    Duration::from_secs(360),
                ),
                queue_limit: number(
                    handle,
                    "inbound.queue_limit",
                    defaults.inbound.queue_limit as i64,
                    0,
                    1000,
                ) as u32,
            },
            hacker_news: HackerNewsSettings {
                url_base: text(handle, "hacker_news.url_base", defaults.hacker_news.url_base),
                url_story_by_id: text(
                    handle,
                    "hacker_news.url_story_by_id",
                    defaults.hacker_news.url_story_by_id,
                ),
                request_timeout: duration(
                    handle,
                    "hacker_news.request_timeout",
                    defaults.hacker_news.request_timeout,
                    Duration::from_secs(2),
                    Duration::from_secs(15),
                ),
                max_concurrent_requests: number(
                    handle,
                    "hacker_news.max_concurrent_requests",
                    defaults.hacker_news.max_concurrent_requests as i64,
                    1,
                    50,
                ) as usize,
                average_object_size: size(
                    handle,
                    "hacker_news.average_object_size",
                    defaults.hacker_news.average_object_size,
                    64,
                    1024,
                ),
                max_memory: size(
                    handle,
                    "hacker_news.max_memory",
                    defaults.hacker_news.max_memory,
                    50 * 1024,
                    500 * 1024 * 1024,
                ),
            },
        }
    }
}

/// Contains the location of the log file unless **logging.file** specifies another one.
pub const DEFAULT_LOG_FILE: &str = "logs/hnproxy_log.txt";

/// Determines the file into which log messages are written in addition to stdout.
///
/// Yields [DEFAULT_LOG_FILE] if **logging.file** is absent and **None** if it is present but
/// empty (e.g. `file: ''` or `file:`).
///
/// # Example
///
/// ```
/// # use hnproxy::config::Config;
/// # use hnproxy::settings::log_file;
/// let config = Config::new("test.yml");
/// config.load_from_string("logging:\n    file: ''", None).unwrap();
/// assert_eq!(log_file(&config.current()), None);
/// ```
pub fn log_file(handle: &Handle) -> Option<PathBuf> {
    match handle.query("logging.file") {
        Yaml::BadValue => Some(PathBuf::from(DEFAULT_LOG_FILE)),
        Yaml::Null => None,
        Yaml::String(file) if file.trim().is_empty() => None,
        Yaml::String(file) => Some(PathBuf::from(file.trim())),
        _ => {
            log::error!(
                "Invalid value for 'logging.file'. Expected a string. Using default: {}",
                DEFAULT_LOG_FILE
            );
            Some(PathBuf::from(DEFAULT_LOG_FILE))
        }
    }
}

/// Returns the value as string, as sizes and durations may either be given with a suffix or
/// as plain number.
fn raw_value(handle: &Handle, path: &str) -> Option<String> {
    match handle.query(path) {
        Yaml::String(value) => Some(value.clone()),
        Yaml::Integer(value) => Some(value.to_string()),
        Yaml::Real(value) => Some(value.clone()),
        Yaml::Boolean(value) => Some(value.to_string()),
        _ => None,
    }
}

fn text(handle: &Handle, path: &str, default: String) -> String {
    match handle.query(path) {
        Yaml::String(value) if !value.trim().is_empty() => value.clone(),
        Yaml::BadValue | Yaml::Null => default,
        _ => {
            log::error!("Invalid value for '{}'. Expected a string. Using default.", path);
            default
        }
    }
}

fn number(handle: &Handle, path: &str, default: i64, min: i64, max: i64) -> i64 {
    match handle.query(path) {
        Yaml::BadValue | Yaml::Null => default,
        Yaml::Integer(value) if (min..=max).contains(value) => *value,
        _ => {
            log::error!(
                "Invalid value for '{}'. Expected a number between {} and {}. Using default: {}",
                path,
                min,
                max,
                default
            );
            default
        }
    }
}

fn size(handle: &Handle, path: &str, default: i64, min: i64, max: i64) -> i64 {
    let value = match raw_value(handle, path) {
        Some(value) => value,
        None => return default,
    };

    match parse_size(&value) {
        Ok(size) if (min..=max).contains(&size) => size,
        Ok(size) => {
            log::error!(
                "Invalid value for '{}': {} is outside of {}..{}. Using default: {}",
                path,
                crate::fmt::format_size(size),
                crate::fmt::format_size(min),
                crate::fmt::format_size(max),
                crate::fmt::format_size(default)
            );
            default
        }
        Err(error) => {
            log::error!("Invalid value for '{}': {}. Using default.", path, error);
            default
        }
    }
}

fn duration(
    handle: &Handle,
    path: &str,
    default: Duration,
    min: Duration,
    max: Duration,
) -> Duration {
    let value = match raw_value(handle, path) {
        Some(value) => value,
        None => return default,
    };

    match parse_duration(&value) {
        Ok(duration) if duration >= min && duration <= max => duration,
        Ok(duration) => {
            log::error!(
                "Invalid value for '{}': {} is outside of {}..{}. Using default: {}",
                path,
                crate::fmt::format_duration(duration),
                crate::fmt::format_duration(min),
                crate::fmt::format_duration(max),
                crate::fmt::format_duration(default)
            );
            default
        }
        Err(error) => {
            log::error!("Invalid value for '{}': {}. Using default.", path, error);
            default
        }
    }
}

/// Keeps the currently active [ProxySettings] around.
///
/// Use [Settings::current] to read the settings at the time of use and do not keep the returned
/// value around for long, as it won't reflect config changes.
pub struct Settings {
    current: ArcSwap<ProxySettings>,
    tx: tokio::sync::broadcast::Sender<()>,
}

impl Settings {
    /// Creates a new instance which provides the given settings.
    pub fn new(settings: ProxySettings) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(1);
        Settings {
            current: ArcSwap::from_pointee(settings),
            tx,
        }
    }

    /// Creates settings which are not backed by a config.
    ///
    /// This is mostly useful for tests or for embedding the cache in other applications.
    pub fn fixed(settings: ProxySettings) -> Arc<Self> {
        Arc::new(Settings::new(settings))
    }

    /// Returns the currently active settings.
    pub fn current(&self) -> Arc<ProxySettings> {
        self.current.load_full()
    }

    /// Obtains a receiver which is notified once the settings have been replaced.
    pub fn notifier(&self) -> ChangeNotifier {
        self.tx.subscribe()
    }

    /// Replaces the currently active settings.
    pub fn update(&self, settings: ProxySettings) {
        self.current.store(Arc::new(settings));
        let _ = self.tx.send(());
    }

    /// Re-parses the settings from the given config.
    pub fn reload(&self, config: &Config) {
        let settings = ProxySettings::from_config(&config.current());
        if *self.current() != settings {
            log::info!("Applying updated settings...");
            self.update(settings);
        }
    }
}

/// Creates and installs the **Settings** for the given platform.
///
/// If a [Config](Config) is present, the settings are parsed from it and updated whenever it
/// changes. Otherwise the defaults are used.
///
/// Note that this is called by the [Builder](crate::builder::Builder) unless disabled.
pub fn install(platform: &Arc<Platform>) -> Arc<Settings> {
    let settings = match platform.find::<Config>() {
        Some(config) => {
            let settings = Arc::new(Settings::new(ProxySettings::from_config(
                &config.current(),
            )));
            run_settings_monitor(platform.clone(), config, settings.clone());
            settings
        }
        None => Settings::fixed(ProxySettings::default()),
    };

    platform.register::<Settings>(settings.clone());

    settings
}

fn run_settings_monitor(platform: Arc<Platform>, config: Arc<Config>, settings: Arc<Settings>) {
    crate::spawn!(async move {
        let mut config_changed = config.notifier();
        let shutdown = platform.shutdown_token();

        while platform.is_running() {
            tokio::select! {
                changed = config_changed.recv() => match changed {
                    Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        settings.reload(&config)
                    }
                    Err(_) => return,
                },
                _ = shutdown.cancelled() => return,
            }
        }
    });
}
