//! Wires up the components of the proxy.
//!
//! The binary wants everything: logging, signal handling, the config file, the typed settings
//! and the HTTP server. Tests usually only need the settings and maybe the config. Therefore each
//! part is switched on individually.
//!
//! # Example
//! Running the proxy as the **hnproxy-io** binary does:
//! ```no_run
//! # use hnproxy::builder::Builder;
//! # use hnproxy::server::Server;
//! #[tokio::main]
//! async fn main() {
//!     let platform = Builder::new().enable_all().build().await;
//!
//!     // The cache is installed separately, as it starts fetching from Hacker News right away...
//!     let _ = hnproxy::query::install(&platform);
//!
//!     platform.require::<Server>().event_loop().await;
//! }
//! ```
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{Config, SETTINGS_FILE};
use crate::platform::Platform;
use crate::{init_logging, HNPROXY_REVISION, HNPROXY_VERSION};

/// Selects which components are registered in the [Platform].
///
/// The [QueryService](crate::query::QueryService) is never part of this, see
/// [query::install](crate::query::install).
#[derive(Default)]
pub struct Builder {
    setup_logging: bool,
    enable_signals: bool,
    setup_config: bool,
    setup_settings: bool,
    setup_server: bool,
}

impl Builder {
    /// Creates a builder with every component switched off.
    pub fn new() -> Self {
        Builder {
            setup_logging: false,
            enable_signals: false,
            setup_config: false,
            setup_settings: false,
            setup_server: false,
        }
    }

    /// Switches on everything the proxy binary needs.
    pub fn enable_all(mut self) -> Self {
        self.setup_logging = true;
        self.enable_signals = true;
        self.setup_config = true;
        self.setup_settings = true;
        self.setup_server = true;

        self
    }

    /// Logs to stdout and, if the config is enabled as well, into the file named by
    /// **logging.file** (see [log_file](crate::settings::log_file)).
    pub fn enable_logging(mut self) -> Self {
        self.setup_logging = true;
        self
    }

    /// Leaves the global logger alone.
    pub fn disable_logging(mut self) -> Self {
        self.setup_logging = false;
        self
    }

    /// Shuts the platform down on **CTRL-C**, **SIGHUP** or **SIGTERM**.
    ///
    /// For more details see: [signals](crate::signals)
    pub fn enable_signals(mut self) -> Self {
        self.enable_signals = true;
        self
    }

    /// Keeps the default signal handling of the process.
    pub fn disable_signals(mut self) -> Self {
        self.enable_signals = false;
        self
    }

    /// Reads **config/settings.yml** and watches it for changes.
    ///
    /// For more details see: [config](crate::config)
    pub fn enable_config(mut self) -> Self {
        self.setup_config = true;
        self
    }

    /// Runs without a config file, so that only the built-in defaults apply.
    pub fn disable_config(mut self) -> Self {
        self.setup_config = false;
        self
    }

    /// Registers the typed [Settings](crate::settings::Settings), parsed from the config or set
    /// to the defaults if there is none.
    pub fn enable_settings(mut self) -> Self {
        self.setup_settings = true;
        self
    }

    /// Skips the settings, unless the server is enabled, which cannot run without them.
    pub fn disable_settings(mut self) -> Self {
        self.setup_settings = false;
        self
    }

    /// Registers the HTTP [Server](crate::server::Server).
    ///
    /// It doesn't accept connections until `platform.require::<Server>().event_loop().await`
    /// is invoked.
    pub fn enable_server(mut self) -> Self {
        self.setup_server = true;
        self
    }

    /// Skips the HTTP server, e.g. when only the cache is embedded.
    pub fn disable_server(mut self) -> Self {
        self.setup_server = false;
        self
    }

    /// Creates the [Platform] and registers the selected components.
    pub async fn build(self) -> Arc<Platform> {
        let platform = Platform::new();

        if self.setup_logging {
            init_logging(self.log_file().await.as_deref());
        }

        log::info!(
            "||. HNPROXY (v {} - rev {}) running on {} core(s) in {} CPU(s)",
            HNPROXY_VERSION,
            HNPROXY_REVISION,
            num_cpus::get(),
            num_cpus::get_physical()
        );

        if self.enable_signals {
            crate::signals::install(platform.clone());
        }

        if self.setup_config {
            let _ = crate::config::install(platform.clone()).await;
        }

        if self.setup_settings || self.setup_server {
            let _ = crate::settings::install(&platform);
        }

        if self.setup_server {
            let _ = crate::server::Server::install(&platform);
        }

        platform
    }

    /// Peeks into the config file, as the logger has to be up before the config is installed.
    async fn log_file(&self) -> Option<PathBuf> {
        if !self.setup_config {
            return None;
        }

        // Problems with the file are reported once the config is actually installed...
        let config = Config::new(SETTINGS_FILE);
        let _ = config.load().await;

        crate::settings::log_file(&config.current())
    }
}
