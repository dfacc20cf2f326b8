//! Verdicts and finalizer actions produced per node per run.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Why a node was left alone.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum SkipCause {
    Protected,
    TooYoung,
    NotSelected,
    #[serde(rename = "deferred-to-other-controller")]
    Deferred,
    WorkloadPresent,
}

impl SkipCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipCause::Protected => "protected",
            SkipCause::TooYoung => "too-young",
            SkipCause::NotSelected => "not-selected",
            SkipCause::Deferred => "deferred-to-other-controller",
            SkipCause::WorkloadPresent => "workload-present",
        }
    }
}

/// Node health/occupancy condition that makes a node removable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Condition {
    Unreachable,
    Unschedulable,
    Empty,
}

/// Fully qualified deletion reason.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum Reason {
    Empty,
    Unreachable,
    Unschedulable,
    TakeoverEmpty,
    TakeoverUnreachable,
    TakeoverUnschedulable,
}

impl Reason {
    pub fn plain(c: Condition) -> Self {
        match c {
            Condition::Empty => Reason::Empty,
            Condition::Unreachable => Reason::Unreachable,
            Condition::Unschedulable => Reason::Unschedulable,
        }
    }

    pub fn takeover(c: Condition) -> Self {
        match c {
            Condition::Empty => Reason::TakeoverEmpty,
            Condition::Unreachable => Reason::TakeoverUnreachable,
            Condition::Unschedulable => Reason::TakeoverUnschedulable,
        }
    }

    pub fn is_takeover(&self) -> bool {
        matches!(self, Reason::TakeoverEmpty | Reason::TakeoverUnreachable | Reason::TakeoverUnschedulable)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::Empty => "empty",
            Reason::Unreachable => "unreachable",
            Reason::Unschedulable => "unschedulable",
            Reason::TakeoverEmpty => "takeover-empty",
            Reason::TakeoverUnreachable => "takeover-unreachable",
            Reason::TakeoverUnschedulable => "takeover-unschedulable",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl fmt::Display for SkipCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Verdict {
    Skip(SkipCause),
    Delete(Reason),
    /// The reaper substitutes for a controller that tainted the node and stalled.
    TakeoverDelete(Reason),
}

impl Verdict {
    pub fn reason(&self) -> Option<Reason> {
        match self {
            Verdict::Skip(_) => None,
            Verdict::Delete(r) | Verdict::TakeoverDelete(r) => Some(*r),
        }
    }

    pub fn is_delete(&self) -> bool { self.reason().is_some() }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Skip(c) => write!(f, "skip({})", c),
            Verdict::Delete(r) => write!(f, "delete({})", r),
            Verdict::TakeoverDelete(r) => write!(f, "takeover-delete({})", r),
        }
    }
}

/// Finalizers to strip from one node, in the node's own order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FinalizerAction {
    pub node: String,
    pub uid: String,
    pub remove: Vec<String>,
}
