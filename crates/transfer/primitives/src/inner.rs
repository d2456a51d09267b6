use serde::{Deserialize, Serialize};

/// Identifiers of a tenant's host pool, assigned independently in every environment.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct HostPoolInfo {
    pub biz: i64,
    pub set: i64,
    pub module: i64,
}

/// Environment-local identifiers of one tenant's built-in data.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[non_exhaustive]
pub struct InnerDataIdConf {
    pub host_pool: HostPoolInfo,
}

impl InnerDataIdConf {
    #[must_use]
    pub const fn new(host_pool: HostPoolInfo) -> Self {
        Self { host_pool }
    }
}
