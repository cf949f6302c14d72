// src/core/acl/rules.rs

//! A single ACL rule and the ordered-list evaluation it participates in.

use std::collections::BTreeSet;

/// A named allow/deny clause: matches a principal whose uid is in
/// `uid_list` (or `uid_list` is empty) AND whose gid set intersects
/// `gid_list` (or `gid_list` is empty).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclRule {
    pub name: String,
    pub uid_list: BTreeSet<u32>,
    pub gid_list: BTreeSet<u32>,
    pub sense: bool,
}

impl AclRule {
    pub fn matches(&self, uid: u32, gids: &BTreeSet<u32>) -> bool {
        let uid_ok = self.uid_list.is_empty() || self.uid_list.contains(&uid);
        let gid_ok = self.gid_list.is_empty() || !self.gid_list.is_disjoint(gids);
        uid_ok && gid_ok
    }
}

/// Evaluates an ordered list of rules against a principal: the first
/// matching rule's `sense` wins; if none match, the principal is denied.
pub fn evaluate(rules: &[AclRule], uid: u32, gids: &BTreeSet<u32>) -> bool {
    for rule in rules {
        if rule.matches(uid, gids) {
            return rule.sense;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(name: &str, uids: &[u32], gids: &[u32], sense: bool) -> AclRule {
        AclRule {
            name: name.to_string(),
            uid_list: uids.iter().copied().collect(),
            gid_list: gids.iter().copied().collect(),
            sense,
        }
    }

    #[test]
    fn empty_lists_match_every_principal() {
        let open = rule("open", &[], &[], true);
        assert!(open.matches(1001, &BTreeSet::new()));
        assert!(open.matches(0, &BTreeSet::from([100])));
    }

    #[test]
    fn first_match_wins_over_later_permissive_rules() {
        let rules = vec![
            rule("deny-1001", &[1001], &[], false),
            rule("allow-all", &[], &[], true),
        ];
        assert!(!evaluate(&rules, 1001, &BTreeSet::new()));
        assert!(evaluate(&rules, 1002, &BTreeSet::new()));
    }

    #[test]
    fn no_matching_rule_denies_by_default() {
        let rules = vec![rule("only-1001", &[1001], &[], true)];
        assert!(!evaluate(&rules, 1002, &BTreeSet::new()));
    }

    #[test]
    fn gid_set_intersection_matches() {
        let r = rule("wheel-only", &[], &[0], true);
        assert!(r.matches(1001, &BTreeSet::from([0, 100])));
        assert!(!r.matches(1001, &BTreeSet::from([100])));
    }
}
