use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// A written document collided with an existing one on `_id` or a unique field.
    #[error("duplicate key in table {table}: {field} = {value}")]
    Duplicate {
        table: String,
        field: String,
        value: String,
    },

    /// The store could not serve the request right now; the same request may succeed later.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store refused the request; retrying it will not help.
    #[error("store rejected request: {0}")]
    Rejected(String),

    #[error("invalid resume token: {0}")]
    InvalidToken(String),

    #[error(transparent)]
    Codec(#[from] serde_json::Error),
}

impl StoreError {
    #[must_use]
    pub const fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }

    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
