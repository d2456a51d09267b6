//! Per resource type plug-ins of the reconciler.
//!
//! A descriptor tells the engine where a resource type lives, how its rows are
//! identified and how a raw row becomes the canonical payload that both sides
//! are compared on. The engine itself never looks inside a payload.

use std::collections::BTreeMap;

use cmdb_store::document::get_i64;
use cmdb_store::Document;
use cmdb_transfer_primitives::{InnerDataIdConf, ResType};

use crate::error::ParseError;

mod builtin;

pub use builtin::{
    builtin_descriptors, HostRelationDescriptor, InstAsstDescriptor, ObjectInstanceDescriptor,
    QuotedInstanceDescriptor, SimpleDescriptor,
};

/// Identities of the resources a row refers to, keyed by their resource type.
pub type RelatedIds = BTreeMap<ResType, Vec<i64>>;

/// Where the rows of a resource type are stored.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Collection {
    /// A single table per tenant.
    Fixed(&'static str),
    /// One table per object, named by this prefix and the object's uuid.
    PerObject(&'static str),
}

impl Collection {
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Fixed(name) | Self::PerObject(name) => name,
        }
    }
}

/// Translation of environment-local identifiers from a source to a destination.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct InnerIdRemap {
    pub src: InnerDataIdConf,
    pub dest: InnerDataIdConf,
}

impl InnerIdRemap {
    #[must_use]
    pub const fn new(src: InnerDataIdConf, dest: InnerDataIdConf) -> Self {
        Self { src, dest }
    }

    #[must_use]
    pub const fn biz(&self, id: i64) -> i64 {
        if id == self.src.host_pool.biz {
            self.dest.host_pool.biz
        } else {
            id
        }
    }

    #[must_use]
    pub const fn set(&self, id: i64) -> i64 {
        if id == self.src.host_pool.set {
            self.dest.host_pool.set
        } else {
            id
        }
    }

    #[must_use]
    pub const fn module(&self, id: i64) -> i64 {
        if id == self.src.host_pool.module {
            self.dest.host_pool.module
        } else {
            id
        }
    }
}

pub trait ResourceDescriptor: Send + Sync + 'static {
    fn res_type(&self) -> ResType;

    /// Field holding the row's logical identity.
    fn id_field(&self) -> &'static str;

    fn collection(&self) -> Collection;

    /// Canonicalises a raw row.
    ///
    /// `remap` is set for source rows only and translates environment-local
    /// identifiers into the destination's.
    fn normalize(
        &self,
        doc: Document,
        _remap: Option<&InnerIdRemap>,
    ) -> Result<Document, ParseError> {
        Ok(doc)
    }

    fn identity(&self, doc: &Document) -> Result<i64, ParseError> {
        get_i64(doc, self.id_field()).ok_or_else(|| ParseError::InvalidId(self.id_field().to_owned()))
    }

    /// Identities of the resources this row belongs to, checked against the ID rules.
    fn related_ids(&self, _sub_res: &str, _doc: &Document) -> Result<RelatedIds, ParseError> {
        Ok(RelatedIds::new())
    }

    /// Sub-resources a changed row belongs to.
    ///
    /// `None` means the sub-resource can only be derived from the changed table.
    fn event_sub_resources(&self, _doc: &Document) -> Option<Vec<String>> {
        match self.collection() {
            Collection::Fixed(_) => Some(vec![String::new()]),
            Collection::PerObject(_) => None,
        }
    }

    /// Whether inserts and deletes also maintain the instance location index.
    fn indexes_location(&self) -> bool {
        false
    }
}
