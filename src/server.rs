//! Contains the HTTP server of the proxy.
//!
//! Opens a server socket on the specified port (**server.port** in the config or 5080 as
//! fallback) and binds it to the selected IP (**server.host** in the config or 0.0.0.0 as
//! fallback). Each incoming request is handed to the [Api](crate::api::Api).
//!
//! If the socket cannot be opened (most probably as another instance still holds the port), the
//! server retries every 5s. Therefore a "new" instance can be started while the "old" one bleeds
//! out and the port is "handed through" with minimal downtime. Also, the server listens to
//! change events of the settings and will relocate to another port or host if changed.
//!
//! # Example
//!
//! ```no_run
//! use hnproxy::builder::Builder;
//! use hnproxy::config::Config;
//! use hnproxy::server::Server;
//!
//! #[tokio::main]
//! async fn main() {
//!     // Setup and create a platform...
//!     let platform = Builder::new().enable_all().build().await;
//!
//!     // Specify a minimal config so that we run on a different port than a
//!     // production instance.
//!     platform.require::<Config>().load_from_string("
//!         server:
//!             port: 1503
//!     ", None).unwrap();
//!
//!     // Run the platform...
//!     let _ = hnproxy::query::install(&platform);
//!     platform.require::<Server>().event_loop().await;
//! }
//! ```
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use hyper::server::conn::{AddrIncoming, AddrStream};
use hyper::service::{make_service_fn, service_fn};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;

use crate::api::Api;
use crate::platform::Platform;
use crate::settings::Settings;
use crate::spawn;

/// Specifies the interval in which we try to bind the server socket if it is in use.
const BIND_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Serves the [Api] via HTTP.
pub struct Server {
    running: AtomicBool,
    current_address: Mutex<Option<String>>,
    platform: Arc<Platform>,
    settings: Arc<Settings>,
    api: Arc<Api>,
}

impl Server {
    /// Creates and installs a **Server** (along with the [Api]) into the given **Platform**.
    ///
    /// Note that this is called by the [Builder](crate::builder::Builder) unless disabled.
    ///
    /// Also note, that this will not technically start the server. This has to be done manually
    /// via [event_loop](Server::event_loop) as it is most probably done in the main thread.
    pub fn install(platform: &Arc<Platform>) -> Arc<Self> {
        let settings = platform
            .find::<Settings>()
            .unwrap_or_else(|| crate::settings::install(platform));

        let server = Arc::new(Server {
            running: AtomicBool::new(false),
            current_address: Mutex::new(None),
            platform: platform.clone(),
            settings,
            api: Api::install(platform),
        });

        platform.register::<Server>(server.clone());

        server
    }

    /// Determines if the server socket is currently open.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Returns the address the server socket is currently bound to.
    pub fn current_address(&self) -> Option<String> {
        self.current_address
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_current_address(&self, address: Option<String>) {
        *self
            .current_address
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = address;
    }

    /// Determines the server address based on the current settings.
    fn address(&self) -> String {
        self.settings.current().server.address()
    }

    /// Starts the event loop in a separate task.
    ///
    /// This is most probably used by test scenarios where the tests itself run in the main thread.
    pub fn fork(server: &Arc<Server>) {
        let cloned_server = server.clone();
        spawn!(async move {
            cloned_server.event_loop().await;
        });
    }

    /// Starts the event loop in a separate task and waits until the server is up and running.
    ///
    /// Just like **fork** this is intended to be used in test environments.
    pub async fn fork_and_await(server: &Arc<Server>) {
        Server::fork(server);

        while !server.is_running() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Tries to open a server socket on the configured address to serve incoming requests.
    ///
    /// Once the socket is open, requests are served until either the platform terminates or
    /// the configured address changes. In the latter case, the socket is closed and re-opened
    /// for the new address.
    pub async fn event_loop(&self) {
        let shutdown = self.platform.shutdown_token();
        let mut last_failed_address = None;

        while self.platform.is_running() {
            let address = self.address();

            match bind(&address).await {
                Ok(incoming) => {
                    last_failed_address = None;
                    log::info!("Opened server socket on {}...", &address);
                    self.set_current_address(Some(address.clone()));
                    self.running.store(true, Ordering::Release);

                    self.serve(incoming, &address).await;

                    self.running.store(false, Ordering::Release);
                    self.set_current_address(None);
                    log::info!("Closing server socket on {}.", &address);
                }
                Err(error) => {
                    // Only report once per address, as we retry every 5s...
                    if last_failed_address.as_ref() != Some(&address) {
                        log::error!(
                            "{:#}. Retrying every {}...",
                            error,
                            crate::fmt::format_duration(BIND_RETRY_INTERVAL)
                        );
                        last_failed_address = Some(address);
                    }

                    tokio::select! {
                        _ = tokio::time::sleep(BIND_RETRY_INTERVAL) => {}
                        _ = shutdown.cancelled() => return,
                    }
                }
            }
        }
    }

    /// Serves incoming requests until the platform terminates or the address changes.
    async fn serve(&self, incoming: AddrIncoming, address: &str) {
        let api = self.api.clone();
        let make_service = make_service_fn(move |_connection: &AddrStream| {
            let api = api.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |request| {
                    let api = api.clone();
                    async move { Ok::<_, Infallible>(api.handle(request).await) }
                }))
            }
        });

        if let Err(error) = hyper::Server::builder(incoming)
            .serve(make_service)
            .with_graceful_shutdown(self.wait_for_relocation(address))
            .await
        {
            log::error!("The HTTP server on {} failed: {}", address, error);
        }
    }

    /// Completes once the platform terminates or once the settings specify another address.
    async fn wait_for_relocation(&self, address: &str) {
        let mut settings_changed = self.settings.notifier();
        let shutdown = self.platform.shutdown_token();

        loop {
            tokio::select! {
                changed = settings_changed.recv() => match changed {
                    Ok(_) | Err(RecvError::Lagged(_)) => {
                        if self.address() != address {
                            log::info!("Server address has changed. Restarting server socket...");
                            return;
                        }
                    }
                    Err(RecvError::Closed) => {
                        shutdown.cancelled().await;
                        return;
                    }
                },
                _ = shutdown.cancelled() => return,
            }
        }
    }
}

async fn bind(address: &str) -> anyhow::Result<AddrIncoming> {
    let listener = TcpListener::bind(address)
        .await
        .with_context(|| format!("Cannot open server address: {}", address))?;
    let mut incoming = AddrIncoming::from_listener(listener)
        .with_context(|| format!("Cannot accept connections on: {}", address))?;
    let _ = incoming.set_nodelay(true);

    Ok(incoming)
}
