//! Process tags attached to server-side spans.

use std::{collections::HashMap, fmt, str::FromStr, sync::Arc};

use arc_swap::ArcSwap;

/// Shared key/value tags merged into every server-side [`Span`].
///
/// The handle is cheap to clone and is passed to
/// [`HttpLayer::with_tags`]; there is no ambient global map. Merging
/// swaps the whole map atomically, so concurrent readers never observe
/// a partially applied update.
///
/// [`Span`]: tracing::Span
/// [`HttpLayer::with_tags`]: crate::trace::HttpLayer::with_tags
#[derive(Clone, Debug, Default)]
pub struct Tags {
    entries: Arc<ArcSwap<HashMap<String, String>>>,
}

impl Tags {
    /// Create an empty set of tags.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite entries, last writer wins.
    pub fn merge<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut merged = HashMap::clone(&self.entries.load());
        merged.extend(entries);
        self.entries.store(Arc::new(merged));
    }

    /// Immutable snapshot of the current entries.
    ///
    /// The snapshot is detached from the handle: a later [`merge`]
    /// replaces the map instead of mutating it in place.
    ///
    /// [`merge`]: Tags::merge
    pub fn snapshot(&self) -> Arc<HashMap<String, String>> {
        self.entries.load_full()
    }
}

impl Extend<Tag> for Tags {
    fn extend<I: IntoIterator<Item = Tag>>(&mut self, iter: I) {
        self.merge(iter.into_iter().map(|tag| (tag.key, tag.value)));
    }
}

impl fmt::Display for Tags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot();
        let mut entries: Vec<_> = snapshot.iter().collect();
        entries.sort();

        let mut entries = entries.into_iter();
        if let Some((key, value)) = entries.next() {
            write!(f, "{}={}", key, value)?;
        }
        for (key, value) in entries {
            write!(f, ", {}={}", key, value)?;
        }
        Ok(())
    }
}

/// A single tag parsed from caller-supplied `key=value` configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag {
    key: String,
    value: String,
}

impl Tag {
    /// Create a tag from its parts.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Tag key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Tag value.
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl From<Tag> for (String, String) {
    fn from(tag: Tag) -> Self {
        (tag.key, tag.value)
    }
}

impl FromStr for Tag {
    type Err = ParseTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, value) = s.split_once('=').ok_or_else(|| ParseTagError {
            input: s.to_owned(),
        })?;
        Ok(Self::new(key, value))
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// The string is not formatted as `key=value`.
#[derive(Clone, Debug, thiserror::Error)]
#[error("tag must be formatted as key=value, got {input:?}")]
pub struct ParseTagError {
    input: String,
}
