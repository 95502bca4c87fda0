//! Defines the item being cached: a story as reported by Hacker News.
//!
//! Upstream delivers items like this (unused keys such as **kids** or **descendants** are simply
//! skipped):
//!
//! ```json
//! {
//!     "by": "iambateman",
//!     "descendants": 422,
//!     "id": 46829147,
//!     "score": 1769,
//!     "time": 1769803524,
//!     "title": "Antirender: remove the glossy shine on architectural renderings",
//!     "type": "story",
//!     "url": "https://antirender.com/"
//! }
//! ```
//!
//! Clients on the other hand receive the condensed representation produced by the **Serialize**
//! impl of [Story]: `id`, `title`, `uri`, `postedBy`, `time` (RFC 3339) and `score`.
//!
//! # Example
//!
//! ```
//! # use hnproxy::story::Story;
//! let story = Story::parse(br#"{"id": 42, "by": "pg", "score": 7, "time": 1175714200}"#)
//!     .unwrap()
//!     .unwrap();
//!
//! assert_eq!(story.id, 42);
//! assert_eq!(story.author.as_deref(), Some("pg"));
//! assert_eq!(story.title, None);
//! assert_eq!(story.posted_at.to_rfc3339(), "2007-04-04T19:16:40+00:00");
//!
//! // Hacker News answers "null" for unknown items...
//! assert_eq!(Story::parse(b"null").unwrap().is_none(), true);
//! ```
use std::fmt::{Display, Formatter};

use anyhow::Context;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Represents the id of a story.
///
/// Valid stories always have a positive id.
pub type StoryId = i64;

/// Represents a story as kept in the cache.
///
/// A story is never modified once it has been created. An updated score is represented by a new
/// instance which replaces the old one.
#[derive(Clone, Debug, Serialize)]
pub struct Story {
    /// Contains the unique id of the story.
    pub id: StoryId,

    /// Contains the title (if present).
    pub title: Option<String>,

    /// Contains the link of the story (Hacker News calls this **url**).
    pub uri: Option<String>,

    /// Contains the name of the submitter (Hacker News calls this **by**).
    #[serde(rename = "postedBy")]
    pub author: Option<String>,

    /// Contains the point in time when the story was submitted.
    #[serde(rename = "time")]
    pub posted_at: DateTime<Utc>,

    /// Contains the score which determines the order of the best stories.
    pub score: i64,
}

impl PartialEq for Story {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Story {}

impl Display for Story {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Id: {}, Title: {}, Uri: {}, PostedBy: {}, Time: {}, Score: {}",
            self.id,
            self.title.as_deref().unwrap_or(""),
            self.uri.as_deref().unwrap_or(""),
            self.author.as_deref().unwrap_or(""),
            self.posted_at.format("%Y-%m-%d %H:%M:%S"),
            self.score
        )
    }
}

/// Mirrors the JSON structure of an item delivered by Hacker News.
#[derive(Deserialize)]
struct HackerNewsItem {
    #[serde(default)]
    id: StoryId,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    by: Option<String>,
    #[serde(default)]
    time: Option<UnixTime>,
    #[serde(default)]
    score: i64,
}

/// Upstream usually sends the timestamp as number, but numeric strings have been observed too.
#[derive(Deserialize)]
#[serde(untagged)]
enum UnixTime {
    Number(i64),
    Text(String),
}

impl UnixTime {
    fn to_date_time(&self) -> DateTime<Utc> {
        let seconds = match self {
            UnixTime::Number(seconds) => Some(*seconds),
            UnixTime::Text(text) => text.trim().parse::<i64>().ok(),
        };

        seconds
            .and_then(|seconds| Utc.timestamp_opt(seconds, 0).single())
            .unwrap_or_default()
    }
}

impl Story {
    /// Parses the JSON representation of an item as delivered by Hacker News.
    ///
    /// Returns **None** if upstream reported `null` (which is what happens for unknown ids).
    ///
    /// # Errors
    /// Fails if the given data isn't valid JSON or doesn't describe an item.
    pub fn parse(data: &[u8]) -> anyhow::Result<Option<Story>> {
        let item: Option<HackerNewsItem> =
            serde_json::from_slice(data).context("Failed to parse story JSON.")?;

        Ok(item.map(|item| Story {
            id: item.id,
            title: item.title,
            uri: item.url,
            author: item.by,
            posted_at: item
                .time
                .map(|time| time.to_date_time())
                .unwrap_or_default(),
            score: item.score,
        }))
    }

    /// Creates a story with the given id and score and some filler text.
    ///
    /// This is mostly intended for tests and benchmarks.
    pub fn example(id: StoryId, score: i64) -> Story {
        Story {
            id,
            title: Some(format!("Story {}", id)),
            uri: Some(format!("https://example.com/{}", id)),
            author: Some("hnproxy".to_owned()),
            posted_at: Utc.timestamp_opt(1_700_000_000 + id, 0).single().unwrap_or_default(),
            score,
        }
    }
}
