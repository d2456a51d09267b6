//! Cross-environment reconciliation and change-data-capture for the CMDB.
//!
//! A [`TransferEngine`] keeps the tenants of a destination deployment
//! consistent with their source tenants. Each resource type is described by a
//! [`ResourceDescriptor`]; a generic [`Reconciler`] lists, compares and applies
//! its rows. Full sync walks both sides in identity-ordered windows, incremental
//! sync follows the source change stream and persists its position after every
//! applied batch.
//!
//! Rows of the host-pool business and of the platform's own business are never
//! replicated, see [`Metadata`].

pub mod config;
pub mod descriptor;
pub mod engine;
pub mod env;
pub mod error;
pub mod full_sync;
pub mod id_rule;
pub mod logics;
pub mod metadata;
pub mod metrics;
pub mod types;
pub mod watch;

pub use config::TransferConfig;
pub use descriptor::ResourceDescriptor;
pub use engine::{IncrementalSyncHandle, TransferEngine};
pub use env::Environment;
pub use error::{ParseError, SyncError};
pub use full_sync::FullSyncReport;
pub use logics::Reconciler;
pub use metadata::Metadata;
pub use metrics::TransferMetrics;
pub use types::{SyncEvent, SyncProgress, TenantPair};
