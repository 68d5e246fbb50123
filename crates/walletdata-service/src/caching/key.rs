use std::fmt;

use rustc_hash::FxHashSet;

/// The logical key of one coalesced fetch: a scope id plus the member ids
/// being fetched within that scope.
///
/// Two keys are *related* if their scope matches and their member sets
/// intersect. Related in-flight fetches are coalesced into one remote call;
/// unrelated ones proceed in parallel. A key is never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestKey {
    scope_id: String,
    member_ids: FxHashSet<String>,
}

impl RequestKey {
    pub fn new(scope_id: impl Into<String>, member_ids: FxHashSet<String>) -> Self {
        RequestKey {
            scope_id: scope_id.into(),
            member_ids,
        }
    }

    pub fn scope_id(&self) -> &str {
        &self.scope_id
    }

    pub fn member_ids(&self) -> &FxHashSet<String> {
        &self.member_ids
    }

    /// Whether a fetch for `member_ids` within `scope_id` overlaps this key.
    pub fn is_related(&self, scope_id: &str, member_ids: &FxHashSet<String>) -> bool {
        self.scope_id == scope_id && !self.member_ids.is_disjoint(member_ids)
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut members: Vec<_> = self.member_ids.iter().map(String::as_str).collect();
        members.sort_unstable();
        write!(f, "{}:{}", self.scope_id, members.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(ids: &[&str]) -> FxHashSet<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[test]
    fn test_related_requires_same_scope() {
        let key = RequestKey::new("usd", members(&["bitcoin", "ethereum"]));

        assert!(key.is_related("usd", &members(&["ethereum", "ripple"])));
        assert!(!key.is_related("eur", &members(&["ethereum"])));
    }

    #[test]
    fn test_disjoint_members_are_unrelated() {
        let key = RequestKey::new("usd", members(&["bitcoin"]));

        assert!(!key.is_related("usd", &members(&["ethereum"])));
    }

    #[test]
    fn test_display_is_stable() {
        let key = RequestKey::new("usd", members(&["ethereum", "bitcoin"]));

        assert_eq!(key.to_string(), "usd:bitcoin,ethereum");
    }
}
