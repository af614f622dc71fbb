//! Cache and mutation keys.

use std::fmt;

/// Namespace of the paginated catalog search.
pub const SEARCH_BOOKS: &str = "search_books";
/// Namespace of favorites subscriptions (full list and filtered views).
pub const FAVORITE_BOOKS: &str = "favorite_books";
/// Namespace of the favorite-ISBN subscription used for annotation.
pub const FAVORITE_ISBNS: &str = "favorite_isbns";
/// Namespace of the favorite toggle mutation.
pub const TOGGLE_FAVORITE: &str = "toggle_favorite";

/// Identifies a cacheable read: operation namespace plus ordered parameter tags.
///
/// Equality and hashing are field-by-field, tags in order.
#[derive(Hash, Eq, PartialEq, Clone, Debug, PartialOrd, Ord)]
pub struct QueryKey {
    namespace: String,
    tags: Vec<String>,
}

impl QueryKey {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            tags: Vec::new(),
        }
    }

    /// Builder form: append a tag while constructing.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// A new key identical to `self` with one extra trailing tag.
    pub fn with_tag(&self, tag: impl Into<String>) -> Self {
        self.clone().tag(tag)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// True when `prefix` has the same namespace and its tags are a prefix of ours.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.namespace == prefix.namespace && self.tags.starts_with(&prefix.tags)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.namespace, self.tags.join(", "))
    }
}

/// Identifies a state-changing operation. Never used for caching.
#[derive(Hash, Eq, PartialEq, Clone, Debug)]
pub struct MutationKey {
    namespace: String,
    tags: Vec<String>,
}

impl MutationKey {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            tags: Vec::new(),
        }
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }
}

impl fmt::Display for MutationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.namespace, self.tags.join(", "))
    }
}
