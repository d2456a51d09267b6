//! A small document filter language.
//!
//! It covers the operators the transfer engine needs (`$eq`, `$ne`, `$gt`,
//! `$lte`, `$in`, `$nin`, `$and`, `$or`, `$nor`) with the matching rules of a
//! document database: negative operators hold for documents missing the field.

use core::cmp::Ordering;

use serde_json::Value;

use crate::document::{compare_values, Document};

#[derive(Clone, Debug, Default, PartialEq)]
pub enum Filter {
    #[default]
    All,
    Eq(String, Value),
    Ne(String, Value),
    Gt(String, Value),
    Lte(String, Value),
    In(String, Vec<Value>),
    Nin(String, Vec<Value>),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Nor(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(field.into(), value.into())
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Ne(field.into(), value.into())
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gt(field.into(), value.into())
    }

    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Lte(field.into(), value.into())
    }

    pub fn is_in<V: Into<Value>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Self::In(field.into(), values.into_iter().map(Into::into).collect())
    }

    pub fn not_in<V: Into<Value>>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self::Nin(field.into(), values.into_iter().map(Into::into).collect())
    }

    /// Conjunction of two filters, collapsing `All` operands.
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        match (self, other) {
            (Self::All, other) | (other, Self::All) => other,
            (Self::And(mut left), Self::And(right)) => {
                left.extend(right);
                Self::And(left)
            }
            (Self::And(mut left), other) => {
                left.push(other);
                Self::And(left)
            }
            (this, other) => Self::And(vec![this, other]),
        }
    }

    #[must_use]
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Self::All => true,
            Self::Eq(field, value) => doc
                .get(field)
                .is_some_and(|found| compare_values(found, value) == Ordering::Equal),
            Self::Ne(field, value) => doc
                .get(field)
                .map_or(true, |found| compare_values(found, value) != Ordering::Equal),
            Self::Gt(field, value) => doc
                .get(field)
                .is_some_and(|found| same_kind(found, value) && compare_values(found, value) == Ordering::Greater),
            Self::Lte(field, value) => doc
                .get(field)
                .is_some_and(|found| same_kind(found, value) && compare_values(found, value) != Ordering::Greater),
            Self::In(field, values) => doc.get(field).is_some_and(|found| {
                values
                    .iter()
                    .any(|value| compare_values(found, value) == Ordering::Equal)
            }),
            Self::Nin(field, values) => doc.get(field).map_or(true, |found| {
                values
                    .iter()
                    .all(|value| compare_values(found, value) != Ordering::Equal)
            }),
            Self::And(filters) => filters.iter().all(|filter| filter.matches(doc)),
            Self::Or(filters) => filters.iter().any(|filter| filter.matches(doc)),
            Self::Nor(filters) => !filters.iter().any(|filter| filter.matches(doc)),
        }
    }
}

/// Range operators only compare numbers with numbers and strings with strings.
fn same_kind(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::Number(_), Value::Number(_)) | (Value::String(_), Value::String(_))
    )
}

/// Sort order and page size of a `find`.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct Query {
    pub filter: Filter,
    /// Field to sort ascending by; insertion order when `None`.
    pub sort: Option<String>,
    pub limit: Option<usize>,
}

impl Query {
    #[must_use]
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            sort: None,
            limit: None,
        }
    }

    #[must_use]
    pub fn sort(mut self, field: impl Into<String>) -> Self {
        self.sort = Some(field.into());
        self
    }

    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}
