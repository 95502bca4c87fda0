//! Provides the memory bounded, score ordered story cache.
//!
//! The cache consists of three parts:
//! * [estimator](estimator) which approximates the memory occupied by a story.
//! * [delta](delta::delta) which determines what has to be added or removed so that the cache
//!   matches the list of ids reported by upstream.
//! * [StoryCache](store::StoryCache) which keeps the stories in a concurrent map, guards it by a
//!   soft memory budget and publishes an immutable snapshot sorted by score.
//!
//! The cache itself never talks to upstream. This is the job of the
//! [QueryService](crate::query::QueryService).
pub mod delta;
pub mod estimator;
pub mod store;

pub use delta::{delta, Delta};
pub use estimator::{estimate_size, EstimatedSize};
pub use store::{MemoryAccount, Snapshot, StoryCache};
