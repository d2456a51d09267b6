use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ResType;

/// Inclusive identity range, `end = None` leaves it open-ended.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct IdRange {
    pub start: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<i64>,
}

impl IdRange {
    #[must_use]
    pub const fn new(start: i64, end: Option<i64>) -> Self {
        Self { start, end }
    }

    #[must_use]
    pub const fn contains(&self, id: i64) -> bool {
        if id < self.start {
            return false;
        }

        match self.end {
            Some(end) => id <= end,
            None => true,
        }
    }
}

/// Operator-declared scope of one resource type: an id is in scope if any range holds it.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct IdRule {
    #[serde(default)]
    pub ranges: Vec<IdRange>,
}

impl IdRule {
    #[must_use]
    pub fn new(ranges: Vec<IdRange>) -> Self {
        Self { ranges }
    }

    #[must_use]
    pub fn matches(&self, id: i64) -> bool {
        self.ranges.iter().any(|range| range.contains(id))
    }
}

/// Source environment name -> resource type -> rule.
pub type IdRuleMap = BTreeMap<String, BTreeMap<ResType, IdRule>>;
