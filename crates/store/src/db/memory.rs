use core::cmp::Ordering;
use core::sync::atomic::{self, AtomicUsize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::db::DocumentStore;
use crate::document::{compare_values, Document};
use crate::error::StoreError;
use crate::filter::{Filter, Query};
use crate::stream::{ChangeEvent, CollectionFilter, OperationType, ResumeToken};
use crate::tx::{CommitSummary, WriteOp};

const META_ID: &str = "_id";

#[derive(Debug, Default)]
struct Table {
    // oids are allocated in increasing order, so this is also insertion order
    rows: BTreeMap<String, Document>,
    unique: BTreeSet<String>,
}

impl Table {
    /// Finds the field and value `doc` would collide on, ignoring the row `own_oid`.
    fn conflict(&self, doc: &Document, own_oid: Option<&str>) -> Option<(String, String)> {
        for field in &self.unique {
            let Some(value) = doc.get(field) else {
                continue;
            };

            let taken = self.rows.iter().any(|(oid, row)| {
                Some(oid.as_str()) != own_oid
                    && row
                        .get(field)
                        .is_some_and(|other| compare_values(other, value) == Ordering::Equal)
            });

            if taken {
                return Some((field.clone(), value.to_string()));
            }
        }

        None
    }
}

#[derive(Debug, Default)]
struct InMemoryInner {
    tables: BTreeMap<String, Table>,
    changes: Vec<ChangeEvent>,
    next_oid: u64,
}

impl InMemoryInner {
    fn record(&mut self, operation: OperationType, collection: &str, oid: &str, doc: Document) {
        let seq = self.changes.len().saturating_add(1);
        let token = ResumeToken::new(format!("{seq:016x}"));

        self.changes.push(ChangeEvent::new(
            token,
            operation,
            collection.to_owned(),
            oid.to_owned(),
            doc,
        ));
    }

    /// Inserts one document, returning the collision instead if there is one.
    fn insert_one(&mut self, table: &str, mut doc: Document) -> Result<(), (String, String)> {
        let oid = match doc.get(META_ID).and_then(Value::as_str) {
            Some(oid) => oid.to_owned(),
            None => {
                self.next_oid = self.next_oid.saturating_add(1);
                let oid = format!("{:024x}", self.next_oid);
                let _ignored = doc.insert(META_ID.to_owned(), Value::String(oid.clone()));
                oid
            }
        };

        let entry = self.tables.entry(table.to_owned()).or_default();

        if entry.rows.contains_key(&oid) {
            return Err((META_ID.to_owned(), oid));
        }

        if let Some(conflict) = entry.conflict(&doc, None) {
            return Err(conflict);
        }

        let _ignored = entry.rows.insert(oid.clone(), doc.clone());
        self.record(OperationType::Insert, table, &oid, doc);

        Ok(())
    }

    fn delete_matching(&mut self, table: &str, filter: &Filter) -> u64 {
        let Some(entry) = self.tables.get_mut(table) else {
            return 0;
        };

        let oids: Vec<String> = entry
            .rows
            .iter()
            .filter(|(_, row)| filter.matches(row))
            .map(|(oid, _)| oid.clone())
            .collect();

        let mut removed = Vec::with_capacity(oids.len());
        for oid in oids {
            if let Some(row) = entry.rows.remove(&oid) {
                removed.push((oid, row));
            }
        }

        let count = removed.len() as u64;
        for (oid, row) in removed {
            self.record(OperationType::Delete, table, &oid, row);
        }

        count
    }
}

/// Document store kept entirely in memory.
///
/// Every write is appended to a change log whose positions serve as resume
/// tokens. Failures can be injected to exercise retry paths.
#[derive(Clone, Debug, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<InMemoryInner>>,
    failures: Arc<AtomicUsize>,
    rejections: Arc<AtomicUsize>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` operations fail with [`StoreError::Unavailable`].
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, atomic::Ordering::SeqCst);
    }

    /// Makes the next `count` operations fail with [`StoreError::Rejected`].
    pub fn reject_next(&self, count: usize) {
        self.rejections.store(count, atomic::Ordering::SeqCst);
    }

    /// Injected failures not consumed yet.
    #[must_use]
    pub fn pending_failures(&self) -> usize {
        self.failures.load(atomic::Ordering::SeqCst)
    }

    /// Number of entries in the change log.
    #[must_use]
    pub fn change_count(&self) -> usize {
        self.inner.read().changes.len()
    }

    /// Every row of `table` in insertion order, `_id` included.
    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<Document> {
        self.inner
            .read()
            .tables
            .get(table)
            .map(|entry| entry.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if take_one(&self.rejections) {
            return Err(StoreError::Rejected("injected rejection".to_owned()));
        }

        if take_one(&self.failures) {
            return Err(StoreError::Unavailable("injected failure".to_owned()));
        }

        Ok(())
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(atomic::Ordering::SeqCst, atomic::Ordering::SeqCst, |left| {
            left.checked_sub(1)
        })
        .is_ok()
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn find(&self, table: &str, query: &Query) -> Result<Vec<Document>, StoreError> {
        self.check_available()?;

        let inner = self.inner.read();

        let Some(entry) = inner.tables.get(table) else {
            return Ok(Vec::new());
        };

        let mut found: Vec<&Document> = entry
            .rows
            .values()
            .filter(|row| query.filter.matches(row))
            .collect();

        if let Some(field) = &query.sort {
            found.sort_by(|a, b| {
                compare_values(
                    a.get(field).unwrap_or(&Value::Null),
                    b.get(field).unwrap_or(&Value::Null),
                )
            });
        }

        let limit = query.limit.unwrap_or(usize::MAX);

        Ok(found.into_iter().take(limit).cloned().collect())
    }

    async fn distinct(
        &self,
        table: &str,
        field: &str,
        filter: &Filter,
    ) -> Result<Vec<Value>, StoreError> {
        self.check_available()?;

        let inner = self.inner.read();

        let Some(entry) = inner.tables.get(table) else {
            return Ok(Vec::new());
        };

        let mut values: Vec<Value> = Vec::new();
        for row in entry.rows.values().filter(|row| filter.matches(row)) {
            let Some(value) = row.get(field) else {
                continue;
            };

            let seen = values
                .iter()
                .any(|known| compare_values(known, value) == Ordering::Equal);
            if !seen {
                values.push(value.clone());
            }
        }

        Ok(values)
    }

    async fn insert(&self, table: &str, documents: Vec<Document>) -> Result<(), StoreError> {
        self.check_available()?;

        let mut inner = self.inner.write();

        let mut first_conflict = None;
        for doc in documents {
            if let Err(conflict) = inner.insert_one(table, doc) {
                let _ignored = first_conflict.get_or_insert(conflict);
            }
        }

        match first_conflict {
            Some((field, value)) => Err(StoreError::Duplicate {
                table: table.to_owned(),
                field,
                value,
            }),
            None => Ok(()),
        }
    }

    async fn update(
        &self,
        table: &str,
        filter: &Filter,
        document: Document,
    ) -> Result<u64, StoreError> {
        self.check_available()?;

        let mut inner = self.inner.write();

        let Some(entry) = inner.tables.get_mut(table) else {
            return Ok(0);
        };

        let oids: Vec<String> = entry
            .rows
            .iter()
            .filter(|(_, row)| filter.matches(row))
            .map(|(oid, _)| oid.clone())
            .collect();

        let mut changed = Vec::new();
        for oid in &oids {
            let mut replacement = document.clone();
            let _ignored = replacement.insert(META_ID.to_owned(), Value::String(oid.clone()));

            if let Some((field, value)) = entry.conflict(&replacement, Some(oid)) {
                return Err(StoreError::Duplicate {
                    table: table.to_owned(),
                    field,
                    value,
                });
            }

            if let Some(row) = entry.rows.get_mut(oid) {
                if *row != replacement {
                    *row = replacement.clone();
                    changed.push((oid.clone(), replacement));
                }
            }
        }

        for (oid, row) in changed {
            inner.record(OperationType::Update, table, &oid, row);
        }

        Ok(oids.len() as u64)
    }

    async fn delete(&self, table: &str, filter: &Filter) -> Result<u64, StoreError> {
        self.check_available()?;

        Ok(self.inner.write().delete_matching(table, filter))
    }

    async fn create_unique_index(&self, table: &str, field: &str) -> Result<(), StoreError> {
        self.check_available()?;

        let mut inner = self.inner.write();
        let entry = inner.tables.entry(table.to_owned()).or_default();

        if entry.unique.contains(field) {
            return Ok(());
        }

        let mut seen: Vec<&Value> = Vec::new();
        for value in entry.rows.values().filter_map(|row| row.get(field)) {
            if seen
                .iter()
                .any(|known| compare_values(known, value) == Ordering::Equal)
            {
                return Err(StoreError::Rejected(format!(
                    "cannot create unique index on {table}.{field}: duplicate value {value}"
                )));
            }
            seen.push(value);
        }

        let _ignored = entry.unique.insert(field.to_owned());

        Ok(())
    }

    async fn commit(&self, ops: Vec<WriteOp>) -> Result<CommitSummary, StoreError> {
        self.check_available()?;

        let mut inner = self.inner.write();
        let mut summary = CommitSummary::default();

        for op in ops {
            match op {
                WriteOp::Insert { table, documents } => {
                    for doc in documents {
                        match inner.insert_one(&table, doc) {
                            Ok(()) => summary.inserted = summary.inserted.saturating_add(1),
                            Err(_) => summary.duplicates = summary.duplicates.saturating_add(1),
                        }
                    }
                }
                WriteOp::Delete { table, filter } => {
                    let deleted = inner.delete_matching(&table, &filter);
                    summary.deleted = summary
                        .deleted
                        .saturating_add(usize::try_from(deleted).unwrap_or(usize::MAX));
                }
            }
        }

        Ok(summary)
    }

    async fn read_changes(
        &self,
        filter: &CollectionFilter,
        after: Option<&ResumeToken>,
        limit: usize,
    ) -> Result<Vec<ChangeEvent>, StoreError> {
        self.check_available()?;

        let start = match after {
            Some(token) if !token.is_empty() => usize::from_str_radix(token.as_str(), 16)
                .map_err(|_| StoreError::InvalidToken(token.to_string()))?,
            _ => 0,
        };

        let inner = self.inner.read();

        Ok(inner
            .changes
            .iter()
            .skip(start)
            .filter(|event| filter.matches(&event.collection))
            .take(limit)
            .cloned()
            .collect())
    }
}
