use core::fmt;
use core::ops::Deref;
use std::sync::Arc;

pub mod db;
pub mod document;
pub mod error;
pub mod filter;
pub mod stream;
pub mod tx;

pub use db::{DocumentStore, InMemoryStore};
pub use document::Document;
pub use error::StoreError;
pub use filter::{Filter, Query};
pub use stream::{ChangeEvent, CollectionFilter, OperationType, ResumeToken};
pub use tx::{CommitSummary, WriteOp};

/// Shared handle to a document store.
#[derive(Clone)]
pub struct Store {
    db: Arc<dyn DocumentStore>,
}

impl Store {
    pub fn new<T: DocumentStore>(db: T) -> Self {
        Self { db: Arc::new(db) }
    }

    #[must_use]
    pub fn from_arc(db: Arc<dyn DocumentStore>) -> Self {
        Self { db }
    }
}

impl Deref for Store {
    type Target = dyn DocumentStore;

    fn deref(&self) -> &Self::Target {
        &*self.db
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}
