//! Capability descriptors and filter criteria.
//!
//! A descriptor is the registry's unit of ownership: immutable metadata plus
//! the opaque handler.  It is removed only by `deregister` or `reload`.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use capabilities::Capability;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// CapabilityKind
// ---------------------------------------------------------------------------

/// What sort of invocable unit a capability is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    /// A deterministic function-like unit.
    Tool,
    /// A model-backed unit with its own reasoning loop.
    Agent,
}

// ---------------------------------------------------------------------------
// CapabilityDescriptor
// ---------------------------------------------------------------------------

/// A registered capability: metadata plus the opaque handler.
#[derive(Clone)]
pub struct CapabilityDescriptor {
    /// Unique registry-wide identifier.
    pub id: String,
    pub kind: CapabilityKind,
    pub category: String,
    pub tags: BTreeSet<String>,
    /// Whether the underlying unit is natively asynchronous.  Pure metadata;
    /// every handler is dispatched through the async trait either way.
    pub is_async: bool,
    /// The invocable itself.
    pub handler: Arc<dyn Capability>,
}

impl CapabilityDescriptor {
    pub fn new(
        id: impl Into<String>,
        kind: CapabilityKind,
        category: impl Into<String>,
        handler: Arc<dyn Capability>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            category: category.into(),
            tags: BTreeSet::new(),
            is_async: true,
            handler,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_is_async(mut self, is_async: bool) -> Self {
        self.is_async = is_async;
        self
    }

    /// True when this descriptor carries the given tag.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }
}

impl fmt::Debug for CapabilityDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityDescriptor")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("category", &self.category)
            .field("tags", &self.tags)
            .field("is_async", &self.is_async)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// FilterCriteria
// ---------------------------------------------------------------------------

/// Criteria for [`CapabilityRegistry::filter`](crate::CapabilityRegistry::filter).
///
/// Matching order: categories (OR), tags (OR, or AND when `match_all_tags`),
/// then the `names` allow-list is intersected, and `exclude_names` is
/// subtracted last.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterCriteria {
    pub categories: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
    pub names: Option<Vec<String>>,
    pub exclude_names: Option<Vec<String>>,
    #[serde(default)]
    pub match_all_tags: bool,
}

impl FilterCriteria {
    pub fn categories<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.categories = Some(categories.into_iter().map(Into::into).collect());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.names = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn exclude_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_names = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn match_all_tags(mut self) -> Self {
        self.match_all_tags = true;
        self
    }

    /// Whether a descriptor passes this filter.
    pub fn matches(&self, descriptor: &CapabilityDescriptor) -> bool {
        if let Some(categories) = &self.categories {
            if !categories.iter().any(|c| c == &descriptor.category) {
                return false;
            }
        }

        if let Some(tags) = &self.tags {
            let hit = if self.match_all_tags {
                tags.iter().all(|t| descriptor.has_tag(t))
            } else {
                tags.iter().any(|t| descriptor.has_tag(t))
            };
            if !hit {
                return false;
            }
        }

        if let Some(names) = &self.names {
            if !names.iter().any(|n| n == &descriptor.id) {
                return false;
            }
        }

        if let Some(excluded) = &self.exclude_names {
            if excluded.iter().any(|n| n == &descriptor.id) {
                return false;
            }
        }

        true
    }
}
