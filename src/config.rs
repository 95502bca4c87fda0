//! Contains the system configuration.
//!
//! Provides access to the system configuration which is loaded from the **config/settings.yml**
//! file. The file is observed for changes and reloaded once a change is detected. Therefore each
//! user of the config should attach itself to the [Config::notifier](Config::notifier) and
//! re-process the config once a change message is received. Most components don't do this
//! themselves but rather use the typed view provided by [Settings](crate::settings::Settings).
//!
//! Note that when using **Config::current()** to obtain the current config handle, this should
//! not be stored, as it will not be updated once a new config has been loaded.
//!
//! # Examples
//!
//! Obtaining and reading the config:
//! ```
//! # use hnproxy::builder::Builder;
//! # use hnproxy::config::Config;
//! # #[tokio::main]
//! # async fn main() {
//! # let platform = Builder::new().enable_config().build().await;
//! // Obtain the config...
//! let config = platform.require::<Config>();
//!
//! // Fetch the current config document (might be reloaded from time to time) and read the
//! // selected server port..
//! let port = config.current().query("server.port").as_i64().unwrap_or(5080);
//! # }
//! ```
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Context;
use arc_swap::ArcSwap;
use yaml_rust::{Yaml, YamlLoader};

use crate::platform::Platform;

/// Specifies the location of the config file used by [install](install).
pub const SETTINGS_FILE: &str = "config/settings.yml";

/// Provides access to the system configuration.
///
/// Most probably a config instance is installed by the [Builder](crate::builder::Builder) and
/// can be obtained via `platform.require::<Config>()`.
pub struct Config {
    filename: String,
    tx: tokio::sync::broadcast::Sender<()>,
    config: ArcSwap<(Yaml, Option<SystemTime>)>,
}

/// Represents the change listener.
///
/// Internally this is simply the receiver of a broadcast. The actual message being broadcast
/// can and should be ignored. All that matters is, once a message has been received, the config
/// was changed and needs to be re-processed.
pub type ChangeNotifier = tokio::sync::broadcast::Receiver<()>;

/// Represents a handle to the currently loaded configuration.
///
/// Note that this handle should not be stored or kept around for long, as it will not be updated
/// if the underlying config changed.
pub struct Handle {
    config: Arc<(Yaml, Option<SystemTime>)>,
}

impl Config {
    /// Creates a new config reading the given file.
    ///
    /// Note that this will not install a change listener. This is only done by the
    /// [install](install) function.
    pub fn new(file: &str) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(1);
        Config {
            filename: file.to_owned(),
            config: ArcSwap::new(Arc::new((Yaml::Null, None))),
            tx,
        }
    }

    /// Obtains a change notifier which receives a message once the config changed.
    pub fn notifier(&self) -> ChangeNotifier {
        self.tx.subscribe()
    }

    /// Obtains a handle to the currently loaded configuration.
    pub fn current(&self) -> Handle {
        Handle {
            config: self.config.load_full(),
        }
    }

    /// Determines the last modified date of the config file on disk.
    ///
    /// Within docker, the file is presented as volume. Therefore we check that it is a file, as
    /// an unmounted docker volume shows up as directory.
    #[cfg(not(test))]
    async fn last_modified(&self) -> Option<SystemTime> {
        tokio::fs::metadata(&self.filename)
            .await
            .ok()
            .filter(|meta| meta.is_file())
            .and_then(|meta| meta.modified().ok())
    }

    /// Forces the config to read the underlying file.
    ///
    /// Note that this is normally called by the framework and should not be invoked manually.
    pub async fn load(&self) -> anyhow::Result<()> {
        log::info!("Loading config file {}...", &self.filename);

        match tokio::fs::metadata(&self.filename).await {
            Ok(metadata) if !metadata.is_file() => {
                log::info!("Config file is an unmounted docker volume - skipping config load.");
                return Ok(());
            }
            Err(_) => {
                log::info!("Config file doesn't exist - using the built-in defaults.");
                return Ok(());
            }
            _ => (),
        }

        let config_data = tokio::fs::read_to_string(&self.filename)
            .await
            .with_context(|| format!("Cannot load config file {}", &self.filename))?;

        let last_modified = tokio::fs::metadata(&self.filename)
            .await
            .ok()
            .and_then(|metadata| metadata.modified().ok());

        self.load_from_string(config_data.as_str(), last_modified)
    }

    /// Loads a configuration from the given string instead of a file.
    ///
    /// This is intended to be used in test environments where we cannot / do not want to load
    /// a config file from disk. A malformed document is rejected and the previous config remains
    /// active.
    ///
    /// # Example
    ///
    /// ```
    /// # use hnproxy::config::Config;
    /// let config = Config::new("somefile.yml");
    /// config.load_from_string("
    /// hacker_news:
    ///     max_memory: 50m
    /// ", None).unwrap();
    ///
    /// assert_eq!(config.current().query("hacker_news.max_memory").as_str(), Some("50m"));
    ///
    /// // Unknown paths yield a "bad value" instead of an error...
    /// assert_eq!(config.current().query("hacker_news.unknown.key").is_badvalue(), true);
    /// ```
    pub fn load_from_string(
        &self,
        data: &str,
        last_modified: Option<SystemTime>,
    ) -> anyhow::Result<()> {
        let mut docs = YamlLoader::load_from_str(data).map_err(|error| {
            anyhow::anyhow!("Cannot parse config file {}: {}", &self.filename, error)
        })?;

        let doc = if docs.is_empty() {
            Yaml::Null
        } else {
            docs.swap_remove(0)
        };

        if !matches!(doc, Yaml::Hash(_) | Yaml::Null) {
            return Err(anyhow::anyhow!(
                "Cannot use config file {}: The root element has to be an object.",
                &self.filename
            ));
        }

        self.config.store(Arc::new((doc, last_modified)));

        // Notify all listeners - we ignore if there are none...
        let _ = self.tx.send(());

        Ok(())
    }
}

impl Handle {
    /// Provides access to the root of the currently loaded configuration.
    pub fn config(&self) -> &Yaml {
        &self.config.0
    }

    /// Navigates along the given dot separated path (e.g. `server.port`).
    ///
    /// Returns **Yaml::BadValue** if any part of the path doesn't exist.
    pub fn query(&self, path: impl AsRef<str>) -> &Yaml {
        path.as_ref()
            .split('.')
            .fold(&self.config.0, |node, key| &node[key])
    }
}

/// Creates and installs a **Config** for the given platform.
///
/// This will read its contents from **config/settings.yml** and also install a change listener
/// for this file. Note that this listener only watches the "last modified" date of the file and
/// will not perform a structural comparison.
///
/// Note that this method is also called by the [Builder](crate::builder::Builder) unless the
/// **Config** part is disabled.
pub async fn install(platform: Arc<Platform>) -> Arc<Config> {
    if let Some(parent) = Path::new(SETTINGS_FILE).parent() {
        if let Err(error) = tokio::fs::create_dir_all(parent).await {
            log::warn!(
                "Failed to create config base directory {}: {}",
                parent.to_string_lossy(),
                error
            )
        }
    }

    let config = Arc::new(Config::new(SETTINGS_FILE));
    platform.register::<Config>(config.clone());

    if let Err(error) = config.load().await {
        log::error!("{:#}", error);
    }

    run_config_change_monitor(platform, config.clone());

    config
}

#[cfg(test)]
fn run_config_change_monitor(_platform: Arc<Platform>, _config: Arc<Config>) {
    // No automatic updates during testing...
}

#[cfg(not(test))]
fn run_config_change_monitor(platform: Arc<Platform>, config: Arc<Config>) {
    crate::spawn!(async move {
        while platform.is_running() {
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;

            let last_modified = config.last_modified().await;
            let last_loaded = config.config.load().1;

            if last_modified.is_some() && (last_loaded.is_none() || last_modified > last_loaded) {
                match config.load().await {
                    Ok(_) => log::info!("System configuration was re-loaded."),
                    Err(error) => log::error!("Failed to re-load system config: {:#}", error),
                }
            }
        }
    });
}
