use std::time::{SystemTime, UNIX_EPOCH};

use cmdb_store::document::{get_i64, get_str};
use cmdb_store::{Document, Filter, ResumeToken, Store};
use cmdb_transfer_primitives::common::{
    BK_START_AT_FIELD, BK_TABLE_NAME_SYNC_WATCH_TOKEN, BK_TOKEN_FIELD, MONGO_META_ID,
};
use cmdb_transfer_primitives::ResType;
use serde_json::Value;
use tracing::info;

use crate::error::SyncError;

/// Persisted change-stream position of one resource type's watcher.
///
/// Stored as `{ _id: "<name>:<res_type>", token, start_at }` in the watch
/// token table of the token store.
#[derive(Debug)]
pub struct TokenHandler {
    store: Store,
    key: String,
}

/// Where a watcher stands in the change stream.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct WatchCursor {
    /// Last fully applied event, `None` before the first batch.
    pub token: Option<ResumeToken>,
    /// Unix seconds the watch was first started at.
    pub start_at: i64,
}

impl WatchCursor {
    #[must_use]
    pub fn advance(&self, token: ResumeToken) -> Self {
        Self {
            token: Some(token),
            start_at: self.start_at,
        }
    }
}

impl TokenHandler {
    #[must_use]
    pub fn new(store: Store, name: &str, res_type: ResType) -> Self {
        Self {
            store,
            key: format!("{name}:{res_type}"),
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the position to resume after, creating the cursor row if there is none.
    ///
    /// A fresh cursor has no token: the watcher starts from the beginning of the stream.
    pub async fn load(&self) -> Result<WatchCursor, SyncError> {
        let row = self
            .store
            .find_one(BK_TABLE_NAME_SYNC_WATCH_TOKEN, &self.filter())
            .await?;

        if let Some(row) = row {
            let cursor = WatchCursor {
                token: get_str(&row, BK_TOKEN_FIELD)
                    .filter(|token| !token.is_empty())
                    .map(ResumeToken::new),
                start_at: get_i64(&row, BK_START_AT_FIELD).unwrap_or_default(),
            };

            info!(key = %self.key, token = ?cursor.token, "Resuming watch");

            return Ok(cursor);
        }

        let cursor = WatchCursor {
            token: None,
            start_at: unix_now(),
        };

        match self
            .store
            .insert(BK_TABLE_NAME_SYNC_WATCH_TOKEN, vec![self.row(&cursor, true)])
            .await
        {
            Ok(()) => {}
            // written concurrently by an earlier run of the same watcher
            Err(err) if err.is_duplicate() => {}
            Err(err) => return Err(err.into()),
        }

        info!(key = %self.key, start_at = cursor.start_at, "Starting new watch");

        Ok(cursor)
    }

    /// Persists `cursor`.
    pub async fn save(&self, cursor: &WatchCursor) -> Result<(), SyncError> {
        let matched = self
            .store
            .update(
                BK_TABLE_NAME_SYNC_WATCH_TOKEN,
                &self.filter(),
                self.row(cursor, false),
            )
            .await?;

        if matched == 0 {
            self.store
                .insert(BK_TABLE_NAME_SYNC_WATCH_TOKEN, vec![self.row(cursor, true)])
                .await?;
        }

        Ok(())
    }

    fn filter(&self) -> Filter {
        Filter::eq(MONGO_META_ID, self.key.as_str())
    }

    fn row(&self, cursor: &WatchCursor, with_key: bool) -> Document {
        let mut row = Document::new();

        if with_key {
            let _ignored = row.insert(MONGO_META_ID.to_owned(), Value::from(self.key.as_str()));
        }

        let token = cursor.token.as_ref().map_or("", ResumeToken::as_str);
        let _ignored = row.insert(BK_TOKEN_FIELD.to_owned(), Value::from(token));
        let _ignored = row.insert(BK_START_AT_FIELD.to_owned(), Value::from(cursor.start_at));

        row
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX))
}
