use cmdb_store::StoreError;
use cmdb_transfer_primitives::ResType;
use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no table resolves {res_type} sub-resource {sub_res:?}")]
    TableNotFound { res_type: ResType, sub_res: String },

    #[error("resource type {0} is not registered")]
    UnknownResType(ResType),

    #[error("{res_type} gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        res_type: ResType,
        attempts: u32,
        #[source]
        source: Box<SyncError>,
    },

    #[error("{0} sync was cancelled")]
    Cancelled(ResType),

    #[error("failed to load metadata: {0}")]
    Metadata(String),

    #[error("sync task ended abnormally: {0}")]
    Task(String),
}

impl SyncError {
    /// Whether the same request may succeed when retried unchanged.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Store(err) => err.is_transient(),
            _ => false,
        }
    }
}

/// A row that cannot be turned into a record. Such rows are logged and skipped.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ParseError {
    #[error("field {0} is missing or not an integer")]
    InvalidId(String),

    #[error("field {0} is missing or not a string")]
    InvalidField(String),

    #[error("unexpected shape: {0}")]
    Shape(#[from] serde_json::Error),
}
