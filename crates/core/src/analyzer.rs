//! Per-node deletion eligibility.
//!
//! [`evaluate`] is a pure function of the node, its pods, the policy and the
//! current time. Rules are checked in a fixed order and the first one that
//! matches decides the verdict:
//!
//! 1. protection annotation/label pair present: `Skip(protected)`
//! 2. younger than `min_age` (or no creation timestamp): `Skip(too-young)`
//! 3. label selector configured and not matched: `Skip(not-selected)`
//! 4. deletion taint younger than `deletion_timeout` (or without a timestamp):
//!    `Skip(deferred-to-other-controller)`; an older one marks the verdict as takeover
//! 5. unreachable, then unschedulable, then empty; otherwise `Skip(workload-present)`
//!
//! Nothing here reads a clock; "how long" is always `now` minus a timestamp that
//! is stored on the node, so the result is stable across runs for fixed input.

use chrono::{DateTime, Duration, Utc};

use crate::config::PolicyConfig;
use crate::model::{NodeRecord, PodRecord, Readiness, UNSCHEDULABLE_TAINT};
use crate::verdict::{Condition, Reason, SkipCause, Verdict};

pub fn evaluate(node: &NodeRecord, pods: &[PodRecord], config: &PolicyConfig, now: DateTime<Utc>) -> Verdict {
    if is_protected(node, config) {
        return Verdict::Skip(SkipCause::Protected);
    }
    match node.age(now) {
        Some(age) if age >= config.min_age => {}
        _ => return Verdict::Skip(SkipCause::TooYoung),
    }
    if !matches_selector(node, config) {
        return Verdict::Skip(SkipCause::NotSelected);
    }
    let takeover = match deletion_taint_age(node, config, now) {
        TaintState::Absent => false,
        TaintState::Pending => return Verdict::Skip(SkipCause::Deferred),
        TaintState::Expired => true,
    };
    let Some(condition) = removable_condition(node, pods) else {
        return Verdict::Skip(SkipCause::WorkloadPresent);
    };
    if takeover {
        Verdict::TakeoverDelete(Reason::takeover(condition))
    } else {
        Verdict::Delete(Reason::plain(condition))
    }
}

pub fn is_protected(node: &NodeRecord, config: &PolicyConfig) -> bool {
    let annotated = config.protection_annotations.iter().any(|(k, v)| node.annotation(k) == Some(v.as_str()));
    let labeled = config.protection_labels.iter().any(|(k, v)| node.label(k) == Some(v.as_str()));
    annotated || labeled
}

/// An empty selector matches every node.
pub fn matches_selector(node: &NodeRecord, config: &PolicyConfig) -> bool {
    config.node_label_selector.iter().all(|(k, v)| node.label(k) == Some(v.as_str()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaintState {
    Absent,
    /// Another controller is still within its grace period.
    Pending,
    Expired,
}

fn deletion_taint_age(node: &NodeRecord, config: &PolicyConfig, now: DateTime<Utc>) -> TaintState {
    let mut found = false;
    let mut oldest: Option<DateTime<Utc>> = None;
    for taint in node.taints.iter().filter(|t| config.deletion_taints.contains(&t.key)) {
        found = true;
        // Unknown application time: never act on a clock we cannot read.
        let Some(added) = taint.time_added else { return TaintState::Pending };
        oldest = Some(oldest.map_or(added, |o| o.min(added)));
    }
    match oldest {
        _ if !found => TaintState::Absent,
        Some(added) if now - added >= config.deletion_timeout => TaintState::Expired,
        _ => TaintState::Pending,
    }
}

/// Health first, occupancy last.
pub fn removable_condition(node: &NodeRecord, pods: &[PodRecord]) -> Option<Condition> {
    if node.readiness == Some(Readiness::Unknown) {
        return Some(Condition::Unreachable);
    }
    if is_unschedulable(node) {
        return Some(Condition::Unschedulable);
    }
    if pods.iter().all(|p| !p.occupies_node()) {
        return Some(Condition::Empty);
    }
    None
}

pub fn is_unschedulable(node: &NodeRecord) -> bool {
    !node.schedulable || node.taints.iter().any(|t| t.key == UNSCHEDULABLE_TAINT)
}

/// Remaining time before a deferred node becomes eligible for takeover, if any.
/// `None` when no dated deletion taint is present or the deadline is out of range.
pub fn takeover_in(node: &NodeRecord, config: &PolicyConfig, now: DateTime<Utc>) -> Option<Duration> {
    node.taints
        .iter()
        .filter(|t| config.deletion_taints.contains(&t.key))
        .filter_map(|t| t.time_added)
        .min()
        .and_then(|added| added.checked_add_signed(config.deletion_timeout))
        .map(|deadline| (deadline - now).max(Duration::zero()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse_list, parse_pairs};
    use crate::model::{OwnerKind, PodPhase, Taint};

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-01T12:00:00Z").unwrap().with_timezone(&Utc)
    }

    fn node(name: &str, age: Duration) -> NodeRecord {
        let mut n = NodeRecord::new(name);
        n.creation_ts = Some(now() - age);
        n
    }

    fn ds_pod(node: &str) -> PodRecord { PodRecord::new("agent", node, OwnerKind::DaemonSet) }
    fn app_pod(node: &str) -> PodRecord { PodRecord::new("web", node, OwnerKind::Other) }

    fn policy() -> PolicyConfig {
        PolicyConfig {
            min_age: Duration::minutes(10),
            deletion_timeout: Duration::minutes(15),
            deletion_taints: parse_list("karpenter.sh/disrupted,ToBeDeletedByClusterAutoscaler").unwrap(),
            protection_annotations: parse_pairs("nodereaper.io/do-not-delete=true").unwrap(),
            protection_labels: parse_pairs("nodereaper.io/protected=yes").unwrap(),
            ..PolicyConfig::default()
        }
    }

    #[test]
    fn daemonset_only_node_is_empty() {
        let n = node("n1", Duration::minutes(20));
        assert_eq!(evaluate(&n, &[ds_pod("n1")], &policy(), now()), Verdict::Delete(Reason::Empty));
        assert_eq!(evaluate(&n, &[], &policy(), now()), Verdict::Delete(Reason::Empty));
    }

    #[test]
    fn expired_deletion_taint_is_taken_over() {
        let mut n = node("n2", Duration::hours(1));
        n.taints.push(Taint::new("karpenter.sh/disrupted", "NoSchedule", Some(now() - Duration::minutes(20))));
        assert_eq!(evaluate(&n, &[], &policy(), now()), Verdict::TakeoverDelete(Reason::TakeoverEmpty));
    }

    #[test]
    fn protection_annotation_dominates() {
        let mut n = node("n3", Duration::hours(1));
        n.annotations.insert("nodereaper.io/do-not-delete".into(), "true".into());
        assert_eq!(evaluate(&n, &[], &policy(), now()), Verdict::Skip(SkipCause::Protected));

        // Even unreachable, cordoned and tainted long ago.
        n.readiness = Some(Readiness::Unknown);
        n.schedulable = false;
        n.taints.push(Taint::new("karpenter.sh/disrupted", "NoSchedule", Some(now() - Duration::days(1))));
        assert_eq!(evaluate(&n, &[], &policy(), now()), Verdict::Skip(SkipCause::Protected));
    }

    #[test]
    fn protection_requires_exact_value() {
        let mut n = node("n3", Duration::hours(1));
        n.annotations.insert("nodereaper.io/do-not-delete".into(), "false".into());
        n.labels.insert("nodereaper.io/protected".into(), "no".into());
        assert_eq!(evaluate(&n, &[], &policy(), now()), Verdict::Delete(Reason::Empty));
        n.labels.insert("nodereaper.io/protected".into(), "yes".into());
        assert_eq!(evaluate(&n, &[], &policy(), now()), Verdict::Skip(SkipCause::Protected));
    }

    #[test]
    fn young_or_undated_nodes_are_skipped() {
        let mut n = node("young", Duration::minutes(5));
        n.readiness = Some(Readiness::Unknown);
        assert_eq!(evaluate(&n, &[], &policy(), now()), Verdict::Skip(SkipCause::TooYoung));
        n.creation_ts = None;
        assert_eq!(evaluate(&n, &[], &policy(), now()), Verdict::Skip(SkipCause::TooYoung));
        n.creation_ts = Some(now() - Duration::minutes(10));
        assert_eq!(evaluate(&n, &[], &policy(), now()), Verdict::Delete(Reason::Unreachable));
    }

    #[test]
    fn selector_must_match_every_pair() {
        let mut cfg = policy();
        cfg.node_label_selector = parse_pairs("pool=batch,cleanup=enabled").unwrap();
        let mut n = node("n", Duration::hours(1));
        n.labels.insert("pool".into(), "batch".into());
        assert_eq!(evaluate(&n, &[], &cfg, now()), Verdict::Skip(SkipCause::NotSelected));
        n.labels.insert("cleanup".into(), "enabled".into());
        assert_eq!(evaluate(&n, &[], &cfg, now()), Verdict::Delete(Reason::Empty));
    }

    #[test]
    fn deletion_taint_defers_then_flips_once() {
        let applied = now() - Duration::hours(2);
        let mut n = node("n", Duration::days(1));
        n.taints.push(Taint::new("ToBeDeletedByClusterAutoscaler", "NoSchedule", Some(applied)));
        let cfg = policy();
        let mut seen_takeover = false;
        for minute in 0..=30 {
            let at = applied + Duration::minutes(minute);
            let v = evaluate(&n, &[], &cfg, at);
            if minute < 15 {
                assert_eq!(v, Verdict::Skip(SkipCause::Deferred), "minute {}", minute);
            } else {
                assert_eq!(v, Verdict::TakeoverDelete(Reason::TakeoverEmpty), "minute {}", minute);
                seen_takeover = true;
            }
        }
        assert!(seen_takeover);
    }

    #[test]
    fn deletion_taint_without_timestamp_defers() {
        let mut n = node("n", Duration::days(1));
        n.taints.push(Taint::new("karpenter.sh/disrupted", "NoExecute", None));
        assert_eq!(evaluate(&n, &[], &policy(), now()), Verdict::Skip(SkipCause::Deferred));
    }

    #[test]
    fn unrelated_taints_are_ignored() {
        let mut n = node("n", Duration::days(1));
        n.taints.push(Taint::new("dedicated", "NoSchedule", Some(now() - Duration::days(2))));
        assert_eq!(evaluate(&n, &[], &policy(), now()), Verdict::Delete(Reason::Empty));
    }

    #[test]
    fn health_priority_is_unreachable_then_unschedulable_then_empty() {
        let mut n = node("n", Duration::hours(1));
        n.readiness = Some(Readiness::Unknown);
        n.schedulable = false;
        assert_eq!(evaluate(&n, &[app_pod("n")], &policy(), now()), Verdict::Delete(Reason::Unreachable));
        n.readiness = Some(Readiness::Ready);
        assert_eq!(evaluate(&n, &[app_pod("n")], &policy(), now()), Verdict::Delete(Reason::Unschedulable));
        n.schedulable = true;
        assert_eq!(evaluate(&n, &[app_pod("n")], &policy(), now()), Verdict::Skip(SkipCause::WorkloadPresent));
    }

    #[test]
    fn takeover_combines_with_every_condition() {
        let mut n = node("n", Duration::hours(1));
        n.taints.push(Taint::new("karpenter.sh/disrupted", "NoSchedule", Some(now() - Duration::minutes(30))));
        n.readiness = Some(Readiness::Unknown);
        assert_eq!(evaluate(&n, &[app_pod("n")], &policy(), now()), Verdict::TakeoverDelete(Reason::TakeoverUnreachable));
        n.readiness = Some(Readiness::Ready);
        n.taints.push(Taint::new(UNSCHEDULABLE_TAINT, "NoSchedule", None));
        assert_eq!(evaluate(&n, &[app_pod("n")], &policy(), now()), Verdict::TakeoverDelete(Reason::TakeoverUnschedulable));
    }

    #[test]
    fn not_ready_or_missing_condition_is_not_unreachable() {
        let mut n = node("n", Duration::hours(1));
        n.readiness = Some(Readiness::False);
        assert_eq!(evaluate(&n, &[app_pod("n")], &policy(), now()), Verdict::Skip(SkipCause::WorkloadPresent));
        n.readiness = None;
        assert_eq!(evaluate(&n, &[app_pod("n")], &policy(), now()), Verdict::Skip(SkipCause::WorkloadPresent));
    }

    #[test]
    fn finished_workload_pods_leave_node_empty() {
        let n = node("n", Duration::hours(1));
        let mut job = app_pod("n");
        job.phase = PodPhase::Succeeded;
        assert_eq!(evaluate(&n, &[ds_pod("n"), job], &policy(), now()), Verdict::Delete(Reason::Empty));
    }

    #[test]
    fn takeover_in_reports_remaining_grace() {
        let mut n = node("n", Duration::hours(1));
        assert_eq!(takeover_in(&n, &policy(), now()), None);
        n.taints.push(Taint::new("karpenter.sh/disrupted", "NoSchedule", Some(now() - Duration::minutes(5))));
        assert_eq!(takeover_in(&n, &policy(), now()), Some(Duration::minutes(10)));
    }

    #[test]
    fn static_pods_keep_a_control_plane_node_occupied() {
        let n = node("cp-1", Duration::days(30));
        let pods = [
            PodRecord::new("etcd", "cp-1", OwnerKind::Node),
            PodRecord::new("kube-apiserver", "cp-1", OwnerKind::Node),
            PodRecord::new("kube-proxy", "cp-1", OwnerKind::DaemonSet),
        ];
        assert_eq!(evaluate(&n, &pods, &policy(), now()), Verdict::Skip(SkipCause::WorkloadPresent));
    }

    #[test]
    fn takeover_in_is_none_when_deadline_overflows() {
        let mut cfg = policy();
        cfg.deletion_timeout = Duration::days(999_999_999);
        let mut n = node("n", Duration::hours(1));
        n.taints.push(Taint::new("karpenter.sh/disrupted", "NoSchedule", Some(now() - Duration::minutes(5))));
        assert_eq!(takeover_in(&n, &cfg, now()), None);
        assert_eq!(evaluate(&n, &[], &cfg, now()), Verdict::Skip(SkipCause::Deferred));
    }
}
