use cmdb_store::Store;

/// One deployment taking part in a transfer.
#[derive(Clone, Debug)]
pub struct Environment {
    /// Environment name, selects the ID rules of a source.
    pub name: String,
    pub store: Store,
}

impl Environment {
    #[must_use]
    pub fn new(name: impl Into<String>, store: Store) -> Self {
        Self {
            name: name.into(),
            store,
        }
    }
}
