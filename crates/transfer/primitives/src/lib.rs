//! Shared vocabulary of the CMDB transfer engine.
//!
//! Everything in here is plain data: resource types, event kinds, sync roles,
//! the environment-local "inner" identifiers and operator-declared ID rules.
//! Both the configuration crate and the engine depend on it.

pub mod common;
pub mod id_rule;
pub mod inner;

use core::fmt;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};

pub use id_rule::{IdRange, IdRule, IdRuleMap};
pub use inner::{HostPoolInfo, InnerDataIdConf};

/// Sentinel used in a window's upper bound meaning "no upper bound yet known".
pub const INFINITE_END_ID: i64 = i64::MAX;

/// A named category of CMDB data with its own identity field and storage location.
#[derive(
    AsRefStr,
    Clone,
    Copy,
    Debug,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[non_exhaustive]
pub enum ResType {
    Biz,
    Set,
    Module,
    Host,
    HostRelation,
    ObjectInstance,
    InstAsst,
    QuotedInstance,
    ServiceInstance,
    Process,
    ProcessRelation,
}

impl ResType {
    /// All resource types in the order a full sync visits them.
    ///
    /// Parents come before the resources that reference them so a fresh
    /// destination fills up top-down.
    pub fn all() -> impl Iterator<Item = Self> {
        Self::iter()
    }

    /// Resource types that carry a `bk_biz_id` and are therefore subject to
    /// the excluded business filter.
    #[must_use]
    pub const fn is_biz_related(self) -> bool {
        matches!(
            self,
            Self::Biz
                | Self::ObjectInstance
                | Self::Set
                | Self::Module
                | Self::HostRelation
                | Self::ServiceInstance
                | Self::Process
                | Self::ProcessRelation
        )
    }

    /// Resource types whose rows live in one physical table per sub-resource.
    #[must_use]
    pub const fn has_sub_resource(self) -> bool {
        matches!(
            self,
            Self::ObjectInstance | Self::InstAsst | Self::QuotedInstance
        )
    }

    /// Maps an object id to the resource type its instances belong to.
    ///
    /// Built-in objects have dedicated resource types, everything else is a
    /// generic object instance.
    #[must_use]
    pub fn of_object(obj_id: &str) -> Self {
        match obj_id {
            common::BK_INNER_OBJ_ID_BIZ => Self::Biz,
            common::BK_INNER_OBJ_ID_SET => Self::Set,
            common::BK_INNER_OBJ_ID_MODULE => Self::Module,
            common::BK_INNER_OBJ_ID_HOST => Self::Host,
            _ => Self::ObjectInstance,
        }
    }
}

/// Kind of change carried by a sync event.
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventType {
    Create,
    Update,
    Delete,
}

impl EventType {
    #[must_use]
    pub const fn is_upsert(self) -> bool {
        !matches!(self, Self::Delete)
    }
}

/// A side of a transfer.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRole {
    #[default]
    Src,
    Dest,
}

impl fmt::Display for SyncRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Src => "src",
            Self::Dest => "dest",
        })
    }
}

/// Builds the physical name of a tenant's table.
#[must_use]
pub fn tenant_table(tenant: &str, table: &str) -> String {
    format!("{tenant}_{table}")
}

/// Splits a physical table name into its tenant and logical table name.
///
/// Tenant ids never contain `_`, logical table names may.
#[must_use]
pub fn split_tenant_table(name: &str) -> Option<(&str, &str)> {
    let (tenant, table) = name.split_once('_')?;

    if tenant.is_empty() || table.is_empty() {
        return None;
    }

    Some((tenant, table))
}
