//! Provides a lock free sliding average which is used to track timings.
//!
//! The [QueryService](crate::query::QueryService) records the duration of each refresh and the
//! [HackerNewsClient](crate::upstream::HackerNewsClient) records the duration of each upstream
//! call. The values are reported by the `/stats` endpoint.
//!
//! # Example
//!
//! ```
//! # use hnproxy::average::Average;
//! let avg = Average::new();
//! avg.add(10);
//! avg.add(20);
//! avg.add(30);
//!
//! assert_eq!(avg.avg(), 20);
//! assert_eq!(avg.count(), 3);
//! ```
use std::fmt;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::fmt::format_micros;

/// Once this many values have been recorded, older values start to fade out.
const WINDOW: u64 = 100;

/// Computes a sliding average of a series of values (most probably durations in microseconds).
///
/// The sum and the number of values within the window are packed into a single **u64** (32 bits
/// each) so that an update is a single compare and swap. Once the window is full or the sum
/// would overflow, both are halved before the new value is added.
#[derive(Default)]
pub struct Average {
    window: AtomicU64,
    count: AtomicU64,
}

fn unpack(window: u64) -> (u64, u64) {
    (window >> 32, window & 0xFFFF_FFFF)
}

fn pack(sum: u64, count: u64) -> u64 {
    (sum << 32) | count
}

impl Average {
    /// Creates a new average.
    pub fn new() -> Average {
        Average::default()
    }

    /// Adds another value to the average.
    ///
    /// Values larger than **u32::MAX** are clamped.
    pub fn add(&self, value: u64) {
        let value = value.min(u32::MAX as u64);
        let _ = self.count.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .window
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |window| {
                let (mut sum, mut count) = unpack(window);
                while count > 0 && (count >= WINDOW || sum + value > u32::MAX as u64) {
                    sum = sum / count * (count / 2);
                    count /= 2;
                    if count == 0 {
                        sum = 0;
                    }
                }

                Some(pack(sum + value, count + 1))
            });
    }

    /// Records the given duration in microseconds.
    pub fn add_duration(&self, duration: Duration) {
        self.add(duration.as_micros().min(u64::MAX as u128) as u64);
    }

    /// Returns the total number of recorded values.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Computes the sliding average of the most recent values.
    pub fn avg(&self) -> u64 {
        match unpack(self.window.load(Ordering::Acquire)) {
            (_, 0) => 0,
            (sum, count) => sum / count,
        }
    }
}

impl Display for Average {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        format_micros(self.avg(), f)?;
        write!(f, " ({})", self.count())
    }
}
