use std::collections::BTreeMap;

use cmdb_store::{Document, ResumeToken};
use cmdb_transfer_primitives::{EventType, ResType, INFINITE_END_ID};

/// Identity field name -> identity value, the bound of a list window.
pub type IdMarks = BTreeMap<String, i64>;

/// A source tenant and the destination tenant it is replicated into.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TenantPair {
    pub src: String,
    pub dest: String,
}

impl TenantPair {
    #[must_use]
    pub fn new(src: impl Into<String>, dest: impl Into<String>) -> Self {
        Self {
            src: src.into(),
            dest: dest.into(),
        }
    }
}

/// A canonical payload together with its logical identity.
#[derive(Clone, Debug, PartialEq)]
pub struct IdentifiedRecord {
    pub id: i64,
    pub data: Document,
}

impl IdentifiedRecord {
    #[must_use]
    pub const fn new(id: i64, data: Document) -> Self {
        Self { id, data }
    }
}

/// Bounds of one list query: `start` is exclusive, `end` inclusive.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ListWindow {
    pub sub_res: String,
    pub start: IdMarks,
    pub end: IdMarks,
}

impl ListWindow {
    #[must_use]
    pub fn new(sub_res: impl Into<String>) -> Self {
        Self {
            sub_res: sub_res.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn after(mut self, start: IdMarks) -> Self {
        self.start = start;
        self
    }

    #[must_use]
    pub fn until(mut self, end: IdMarks) -> Self {
        self.end = end;
        self
    }

    /// Lower bound on `field`; rows must be strictly greater.
    #[must_use]
    pub fn start_of(&self, field: &str) -> i64 {
        self.start.get(field).copied().unwrap_or(0)
    }

    /// Upper bound on `field`, `None` when the window is open-ended.
    #[must_use]
    pub fn end_of(&self, field: &str) -> Option<i64> {
        self.end
            .get(field)
            .copied()
            .filter(|end| *end != INFINITE_END_ID)
    }
}

/// One page of raw rows.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ListResult {
    /// The page held fewer rows than the page size: nothing is left up to the window's end.
    pub is_all: bool,
    pub data: Vec<Document>,
    /// Where the next page starts, empty once everything was listed.
    pub next_start: IdMarks,
}

/// Writes needed to make one destination page match the source.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompareResult {
    pub insert: Vec<IdentifiedRecord>,
    pub update: Vec<IdentifiedRecord>,
    pub delete: Vec<i64>,
    /// Source records beyond the destination page, compared on the next one.
    pub remaining_src: Vec<IdentifiedRecord>,
}

impl CompareResult {
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.insert.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }
}

/// A deduplicated change on the source, ready for scoping and apply.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct SyncEvent {
    pub event_type: EventType,
    pub res_type: ResType,
    /// Source tenant the change happened in.
    pub tenant: String,
    /// Physical row identity, used for deduplication.
    pub oid: String,
    pub sub_res: Vec<String>,
    /// Row after the change, or the removed row for deletions.
    pub detail: Document,
}

impl SyncEvent {
    #[must_use]
    pub const fn new(
        event_type: EventType,
        res_type: ResType,
        tenant: String,
        oid: String,
        detail: Document,
    ) -> Self {
        Self {
            event_type,
            res_type,
            tenant,
            oid,
            sub_res: Vec::new(),
            detail,
        }
    }

    #[must_use]
    pub fn with_sub_res(mut self, sub_res: Vec<String>) -> Self {
        self.sub_res = sub_res;
        self
    }
}

/// Progress of one sub-resource, broadcast to subscribers of the engine.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum SyncProgress {
    /// A full sync window was applied.
    Window {
        res_type: ResType,
        tenant: String,
        sub_res: String,
        cursor: IdMarks,
        inserted: usize,
        updated: usize,
        deleted: usize,
    },
    /// A full sync of one sub-resource finished.
    FullSyncDone {
        res_type: ResType,
        tenant: String,
        sub_res: String,
    },
    /// An incremental batch was applied and its position persisted.
    Batch {
        res_type: ResType,
        token: ResumeToken,
        events: usize,
    },
}
