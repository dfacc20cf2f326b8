//! Cleanup of finalizers on nodes stuck in termination.

use chrono::{DateTime, Utc};

use crate::config::PolicyConfig;
use crate::model::NodeRecord;
use crate::verdict::FinalizerAction;

/// Decide which finalizers to strip from `node`, if any.
///
/// Only nodes that have been terminating for at least `finalizer_timeout` are
/// considered, so a termination that is still progressing normally is not raced.
/// A finalizer is removed iff it is whitelisted and not blacklisted.
pub fn plan(node: &NodeRecord, config: &PolicyConfig, now: DateTime<Utc>) -> Option<FinalizerAction> {
    if !config.enable_finalizer_cleanup {
        return None;
    }
    let deleted_at = node.deletion_ts?;
    if now - deleted_at < config.finalizer_timeout {
        return None;
    }
    let mut remove: Vec<String> = Vec::new();
    for f in node.finalizers.iter() {
        if config.is_removable_finalizer(f) && !remove.contains(f) {
            remove.push(f.clone());
        }
    }
    if remove.is_empty() {
        return None;
    }
    Some(FinalizerAction { node: node.name.clone(), uid: node.uid.clone(), remove })
}

/// Finalizers left on a node after removing `remove` from `current`, order kept.
pub fn remaining<'a>(current: &'a [String], remove: &[String]) -> Vec<&'a str> {
    current.iter().filter(|f| !remove.contains(f)).map(String::as_str).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_list;
    use chrono::Duration;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-01T12:00:00Z").unwrap().with_timezone(&Utc)
    }

    fn terminating(name: &str, since: Duration, finalizers: &[&str]) -> NodeRecord {
        let mut n = NodeRecord::new(name);
        n.creation_ts = Some(now() - Duration::days(3));
        n.deletion_ts = Some(now() - since);
        n.finalizers = finalizers.iter().map(|s| s.to_string()).collect();
        n
    }

    fn policy(white: &str, black: &str) -> PolicyConfig {
        PolicyConfig {
            finalizer_timeout: Duration::minutes(5),
            finalizer_whitelist: parse_list(white).unwrap(),
            finalizer_blacklist: parse_list(black).unwrap(),
            ..PolicyConfig::default()
        }
    }

    #[test]
    fn strips_only_whitelisted_finalizers() {
        let n = terminating("n4", Duration::minutes(10), &["karpenter.sh/termination", "custom.io/x"]);
        let action = plan(&n, &policy("karpenter.sh/termination", ""), now()).unwrap();
        assert_eq!(action.node, "n4");
        assert_eq!(action.remove, vec!["karpenter.sh/termination".to_string()]);
    }

    #[test]
    fn blacklist_always_wins() {
        let n = terminating("n", Duration::hours(1), &["a", "b"]);
        let action = plan(&n, &policy("a,b", "b"), now()).unwrap();
        assert_eq!(action.remove, vec!["a".to_string()]);
        assert!(plan(&n, &policy("b", "b"), now()).is_none());
    }

    #[test]
    fn waits_for_timeout_inclusive() {
        let cfg = policy("a", "");
        assert!(plan(&terminating("n", Duration::minutes(4), &["a"]), &cfg, now()).is_none());
        assert!(plan(&terminating("n", Duration::minutes(5), &["a"]), &cfg, now()).is_some());
    }

    #[test]
    fn no_action_without_deletion_timestamp_or_when_disabled() {
        let mut n = terminating("n", Duration::hours(1), &["a"]);
        let mut cfg = policy("a", "");
        cfg.enable_finalizer_cleanup = false;
        assert!(plan(&n, &cfg, now()).is_none());
        n.deletion_ts = None;
        assert!(plan(&n, &policy("a", ""), now()).is_none());
    }

    #[test]
    fn planning_is_idempotent_and_applying_twice_is_a_noop() {
        let cfg = policy("a,c", "");
        let mut n = terminating("n", Duration::hours(1), &["a", "b", "c"]);
        let first = plan(&n, &cfg, now()).unwrap();
        assert_eq!(plan(&n, &cfg, now()).unwrap(), first);

        let left: Vec<String> = remaining(&n.finalizers, &first.remove).into_iter().map(str::to_string).collect();
        assert_eq!(left, vec!["b".to_string()]);
        n.finalizers = left.iter().cloned().collect();
        assert_eq!(remaining(&n.finalizers, &first.remove), vec!["b"]);
        assert!(plan(&n, &cfg, now()).is_none());
    }
}
