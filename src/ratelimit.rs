//! Provides a fixed window rate limiter for the inbound API.
//!
//! Permits up to **inbound.max_requests_per_window** requests within each window of
//! **inbound.rate_limit_window**. Once a window is exhausted, further requests wait for the next
//! one. Up to **inbound.queue_limit** requests may wait, they are admitted oldest first. Requests
//! arriving at a full queue are rejected right away (with **429 Too Many Requests** by the
//! [api](crate::api)).
//!
//! All values are read at the time of use, therefore a config change takes effect once the
//! current window ends.
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crate::settings::Settings;

struct Window {
    started: Instant,
    permits: u32,
}

/// Releases a place in the queue, even if the waiting request is dropped.
struct QueueSlot<'a>(&'a AtomicU32);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        let _ = self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Limits the number of requests per fixed time window.
pub struct RateLimiter {
    settings: Arc<Settings>,
    window: Mutex<Window>,
    queue: tokio::sync::Mutex<()>,
    queued: AtomicU32,
    rejected: AtomicU64,
}

impl RateLimiter {
    /// Creates a new limiter which reads its limits from the given settings.
    pub fn new(settings: Arc<Settings>) -> Self {
        RateLimiter {
            settings,
            window: Mutex::new(Window {
                started: Instant::now(),
                permits: 0,
            }),
            queue: tokio::sync::Mutex::new(()),
            queued: AtomicU32::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Obtains a permit, waiting for the next window if the current one is exhausted.
    ///
    /// Returns **false** if the request has to be rejected, as the queue is full. Waiting
    /// requests are admitted in the order of their arrival. Dropping the returned future gives
    /// up the place in the queue.
    pub async fn acquire(&self) -> bool {
        if self.queued.load(Ordering::SeqCst) == 0 && self.admit_at(Instant::now()).is_ok() {
            return true;
        }

        let limit = self.settings.current().inbound.queue_limit;
        if self
            .queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |queued| {
                if queued < limit {
                    Some(queued + 1)
                } else {
                    None
                }
            })
            .is_err()
        {
            let _ = self.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let _slot = QueueSlot(&self.queued);

        // The tokio mutex is fair, therefore the oldest request is always next in line...
        let _turn = self.queue.lock().await;
        loop {
            match self.admit_at(Instant::now()) {
                Ok(()) => return true,
                Err(next_window) => {
                    tokio::time::sleep_until(tokio::time::Instant::from_std(next_window)).await
                }
            }
        }
    }

    /// Tries to obtain a permit for a request arriving now, without waiting.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    /// Tries to obtain a permit for a request arriving at the given instant.
    ///
    /// This never queues, a request which doesn't fit into the window is rejected.
    ///
    /// # Example
    ///
    /// ```
    /// # use hnproxy::ratelimit::RateLimiter;
    /// # use hnproxy::settings::{ProxySettings, Settings};
    /// # use std::time::{Duration, Instant};
    /// let mut settings = ProxySettings::default();
    /// settings.inbound.max_requests_per_window = 2;
    /// settings.inbound.rate_limit_window = Duration::from_secs(10);
    /// let limiter = RateLimiter::new(Settings::fixed(settings));
    ///
    /// let now = Instant::now();
    /// assert_eq!(limiter.try_acquire_at(now), true);
    /// assert_eq!(limiter.try_acquire_at(now), true);
    /// assert_eq!(limiter.try_acquire_at(now), false);
    ///
    /// // A new window starts after 10s...
    /// assert_eq!(limiter.try_acquire_at(now + Duration::from_secs(11)), true);
    /// ```
    pub fn try_acquire_at(&self, now: Instant) -> bool {
        if self.admit_at(now).is_ok() {
            true
        } else {
            let _ = self.rejected.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Hands out a permit or returns the start of the next window.
    fn admit_at(&self, now: Instant) -> Result<(), Instant> {
        let settings = self.settings.current();
        let mut window = self.window();

        if now.saturating_duration_since(window.started) >= settings.inbound.rate_limit_window {
            window.started = now;
            window.permits = 0;
        }

        if window.permits < settings.inbound.max_requests_per_window {
            window.permits += 1;
            Ok(())
        } else {
            Err(window.started + settings.inbound.rate_limit_window)
        }
    }

    /// Returns the number of requests which have been rejected so far.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Returns the number of requests currently waiting for a permit.
    pub fn queued(&self) -> u32 {
        self.queued.load(Ordering::SeqCst)
    }

    /// Returns the number of permits handed out in the current window.
    pub fn permits_in_window(&self) -> u32 {
        self.window().permits
    }

    fn window(&self) -> MutexGuard<Window> {
        // The guarded state is always consistent, therefore a poisoned lock can be re-used...
        self.window
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
