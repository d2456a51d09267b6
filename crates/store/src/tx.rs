use crate::document::Document;
use crate::filter::Filter;

/// One write of an atomic multi-table commit.
#[derive(Clone, Debug)]
pub enum WriteOp {
    /// Insert documents, skipping those that collide with existing rows.
    Insert {
        table: String,
        documents: Vec<Document>,
    },
    Delete {
        table: String,
        filter: Filter,
    },
}

impl WriteOp {
    pub fn insert(table: impl Into<String>, documents: Vec<Document>) -> Self {
        Self::Insert {
            table: table.into(),
            documents,
        }
    }

    pub fn delete(table: impl Into<String>, filter: Filter) -> Self {
        Self::Delete {
            table: table.into(),
            filter,
        }
    }

    #[must_use]
    pub fn table(&self) -> &str {
        match self {
            Self::Insert { table, .. } | Self::Delete { table, .. } => table,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct CommitSummary {
    pub inserted: usize,
    pub duplicates: usize,
    pub deleted: usize,
}
