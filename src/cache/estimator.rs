//! Approximates the memory occupied by a story.
use crate::story::Story;

/// Fixed cost of every item: object header, the timestamp / score slot and the id.
const BASE_SIZE: i64 = 24 + 8 + 4;

/// Cost of a present text field on top of its characters: the reference plus string overhead.
const TEXT_FIELD_OVERHEAD: i64 = 8 + 26;

/// Each character is accounted with two bytes.
const BYTES_PER_CHAR: i64 = 2;

/// Estimates the amount of memory occupied by a cached value in bytes.
///
/// Note that this is an approximation and not an exact measurement of what the allocator handed
/// out. It is however deterministic and grows linearly with the size of the text being held,
/// which is all the admission control of the [StoryCache](crate::cache::StoryCache) relies on.
pub trait EstimatedSize {
    /// Returns the estimated size in bytes.
    fn estimated_size(&self) -> i64;
}

impl EstimatedSize for Story {
    fn estimated_size(&self) -> i64 {
        BASE_SIZE
            + text_size(&self.title)
            + text_size(&self.uri)
            + text_size(&self.author)
    }
}

fn text_size(text: &Option<String>) -> i64 {
    match text {
        Some(text) => TEXT_FIELD_OVERHEAD + text.chars().count() as i64 * BYTES_PER_CHAR,
        None => 0,
    }
}

/// Estimates the memory footprint of the given story.
///
/// # Example
///
/// ```
/// # use hnproxy::cache::estimate_size;
/// # use hnproxy::story::Story;
/// let mut story = Story::example(1, 10);
/// story.title = None;
/// story.uri = None;
/// story.author = None;
///
/// // Without any text only the fixed overhead remains...
/// assert_eq!(estimate_size(&story), 36);
///
/// // ...each text field adds its overhead and two bytes per character.
/// story.title = Some("Rust".to_owned());
/// assert_eq!(estimate_size(&story), 36 + 34 + 8);
/// ```
pub fn estimate_size(story: &Story) -> i64 {
    story.estimated_size()
}

#[cfg(test)]
mod tests {
    use crate::cache::estimate_size;
    use crate::story::Story;

    fn empty_story() -> Story {
        let mut story = Story::example(1, 1);
        story.title = None;
        story.uri = None;
        story.author = None;
        story
    }

    #[test]
    fn a_story_without_text_costs_the_base_size() {
        assert_eq!(estimate_size(&empty_story()), 36);
    }

    #[test]
    fn the_estimate_grows_linearly_with_the_text() {
        let sizes: Vec<i64> = (0..3)
            .map(|len| {
                let mut story = empty_story();
                story.title = Some("x".repeat(len));
                story.uri = Some("y".repeat(len));
                story.author = Some("z".repeat(len));
                estimate_size(&story)
            })
            .collect();

        assert_eq!(sizes[0], 36 + 3 * 34);
        assert_eq!(sizes[1] - sizes[0], 6);
        assert_eq!(sizes[2] - sizes[1], 6);
    }

    #[test]
    fn characters_are_counted_instead_of_bytes() {
        let mut story = empty_story();
        story.author = Some("Jürgen".to_owned());
        assert_eq!(estimate_size(&story), 36 + 34 + 12);
    }

    #[test]
    fn the_estimate_ignores_id_and_score() {
        let mut story = Story::example(1, 1);
        let size = estimate_size(&story);
        story.score = 1_000_000;
        assert_eq!(estimate_size(&story), size);
    }
}
