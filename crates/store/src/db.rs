use async_trait::async_trait;
use serde_json::Value;

use crate::document::Document;
use crate::error::StoreError;
use crate::filter::{Filter, Query};
use crate::stream::{ChangeEvent, CollectionFilter, ResumeToken};
use crate::tx::{CommitSummary, WriteOp};

mod memory;

pub use memory::InMemoryStore;

/// Capabilities the transfer engine needs from a document store.
///
/// Tables are addressed by their physical name; tenancy is encoded in the
/// name by the caller.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    async fn find(&self, table: &str, query: &Query) -> Result<Vec<Document>, StoreError>;

    async fn find_one(&self, table: &str, filter: &Filter) -> Result<Option<Document>, StoreError> {
        let query = Query::new(filter.clone()).limit(1);

        Ok(self.find(table, &query).await?.into_iter().next())
    }

    /// Distinct values of `field` over the documents matching `filter`.
    async fn distinct(
        &self,
        table: &str,
        field: &str,
        filter: &Filter,
    ) -> Result<Vec<Value>, StoreError>;

    /// Inserts every document that does not collide with an existing row.
    ///
    /// Returns [`StoreError::Duplicate`] if at least one document collided, the
    /// others are still written.
    async fn insert(&self, table: &str, documents: Vec<Document>) -> Result<(), StoreError>;

    /// Replaces the fields of every matching document, keeping its `_id`.
    ///
    /// Returns the number of matched documents.
    async fn update(
        &self,
        table: &str,
        filter: &Filter,
        document: Document,
    ) -> Result<u64, StoreError>;

    /// Returns the number of deleted documents.
    async fn delete(&self, table: &str, filter: &Filter) -> Result<u64, StoreError>;

    /// Idempotently declares `field` unique within `table`.
    async fn create_unique_index(&self, table: &str, field: &str) -> Result<(), StoreError>;

    /// Applies all writes atomically; colliding inserts are skipped, not failed.
    async fn commit(&self, ops: Vec<WriteOp>) -> Result<CommitSummary, StoreError>;

    /// Reads up to `limit` changes of the selected collections strictly after `after`,
    /// or from the start of the stream when `after` is `None`.
    async fn read_changes(
        &self,
        filter: &CollectionFilter,
        after: Option<&ResumeToken>,
        limit: usize,
    ) -> Result<Vec<ChangeEvent>, StoreError>;
}
