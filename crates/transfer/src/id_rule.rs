use std::collections::BTreeMap;

use cmdb_transfer_primitives::{IdRule, IdRuleMap, ResType};

use crate::descriptor::RelatedIds;

/// Operator-declared synchronization scope.
///
/// Complements the platform exclusions of the metadata oracle: a row is
/// synchronized only if every identity it carries is allowed by the rules of
/// the source environment it comes from.
#[derive(Clone, Debug, Default)]
pub struct IdRuleFilter {
    rules: IdRuleMap,
}

impl IdRuleFilter {
    #[must_use]
    pub const fn new(rules: IdRuleMap) -> Self {
        Self { rules }
    }

    fn rules_of(&self, env: &str) -> Option<&BTreeMap<ResType, IdRule>> {
        self.rules.get(env).filter(|rules| !rules.is_empty())
    }

    /// Whether a row with these identities is in scope for the source environment `env`.
    ///
    /// Resource types without a rule are unrestricted.
    #[must_use]
    pub fn in_scope(&self, env: &str, ids: &RelatedIds) -> bool {
        let Some(rules) = self.rules_of(env) else {
            return true;
        };

        ids.iter().all(|(res_type, ids)| match rules.get(res_type) {
            Some(rule) => ids.iter().all(|id| rule.matches(*id)),
            None => true,
        })
    }
}
