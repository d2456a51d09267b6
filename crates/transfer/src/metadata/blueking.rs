use std::collections::{BTreeMap, BTreeSet};

use parking_lot::RwLock;

/// Business modules of every member host, as captured by [`BluekingBiz::snapshot`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Members(BTreeMap<i64, BTreeSet<i64>>);

/// The platform's own business in a source tenant and the hosts currently assigned to it.
///
/// Rows of this business are never replicated. Host membership changes while
/// the engine runs, so it is tracked from host relation events; every access
/// goes through the methods below, which take the lock themselves.
#[derive(Debug)]
pub struct BluekingBiz {
    biz_id: i64,
    host_modules: RwLock<Members>,
}

impl BluekingBiz {
    #[must_use]
    pub fn new(biz_id: i64, relations: impl IntoIterator<Item = (i64, i64)>) -> Self {
        let mut host_modules: BTreeMap<i64, BTreeSet<i64>> = BTreeMap::new();

        for (host_id, module_id) in relations {
            let _ignored = host_modules.entry(host_id).or_default().insert(module_id);
        }

        Self {
            biz_id,
            host_modules: RwLock::new(Members(host_modules)),
        }
    }

    #[must_use]
    pub const fn biz_id(&self) -> i64 {
        self.biz_id
    }

    #[must_use]
    pub fn host_ids(&self) -> Vec<i64> {
        self.host_modules.read().0.keys().copied().collect()
    }

    #[must_use]
    pub fn contains_host(&self, host_id: i64) -> bool {
        self.host_modules.read().0.contains_key(&host_id)
    }

    #[must_use]
    pub fn snapshot(&self) -> Members {
        self.host_modules.read().clone()
    }

    /// Puts back membership taken with [`snapshot`](Self::snapshot), dropping every change since.
    pub fn restore(&self, members: Members) {
        *self.host_modules.write() = members;
    }

    /// Records that the host was assigned to one of the business's modules.
    ///
    /// Returns `true` if the host was not a member before.
    pub fn add_relation(&self, host_id: i64, module_id: i64) -> bool {
        let mut members = self.host_modules.write();
        let host_modules = &mut members.0;

        let entered = !host_modules.contains_key(&host_id);
        let _ignored = host_modules.entry(host_id).or_default().insert(module_id);

        entered
    }

    /// Records that the host was removed from one of the business's modules.
    ///
    /// Returns `true` if the host has no module of the business left.
    pub fn remove_relation(&self, host_id: i64, module_id: i64) -> bool {
        let mut members = self.host_modules.write();
        let host_modules = &mut members.0;

        let Some(modules) = host_modules.get_mut(&host_id) else {
            return false;
        };

        let _ignored = modules.remove(&module_id);

        if !modules.is_empty() {
            return false;
        }

        let _ignored = host_modules.remove(&host_id);

        true
    }
}
