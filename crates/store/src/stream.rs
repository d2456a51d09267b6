//! Change-stream types.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::document::Document;

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Insert,
    Update,
    Delete,
}

/// Opaque position in a change stream; events are delivered strictly after it.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct ResumeToken(String);

impl ResumeToken {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One row-level change.
///
/// `document` is the row after the change, or the removed row for deletions.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ChangeEvent {
    pub token: ResumeToken,
    pub operation: OperationType,
    pub collection: String,
    pub oid: String,
    pub document: Document,
}

impl ChangeEvent {
    #[must_use]
    pub fn new(
        token: ResumeToken,
        operation: OperationType,
        collection: String,
        oid: String,
        document: Document,
    ) -> Self {
        Self {
            token,
            operation,
            collection,
            oid,
            document,
        }
    }
}

/// Selects the collections a change-stream read covers.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CollectionFilter {
    names: Vec<String>,
    prefixes: Vec<String>,
}

impl CollectionFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.names.push(name.into());
        self
    }

    #[must_use]
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefixes.push(prefix.into());
        self
    }

    #[must_use]
    pub fn matches(&self, collection: &str) -> bool {
        self.names.iter().any(|name| name == collection)
            || self
                .prefixes
                .iter()
                .any(|prefix| collection.starts_with(prefix.as_str()))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty() && self.prefixes.is_empty()
    }
}
