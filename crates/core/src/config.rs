//! Reaper policy: thresholds, protection rules and finalizer lists.
//!
//! The policy is resolved once before a run (see the `nodereaper` binary) and then
//! passed by reference into every entry point. Parsers here are shaped as
//! `fn(&str) -> Result<T, ConfigError>` so clap can use them as value parsers.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use chrono::Duration;
use regex::Regex;

/// Upper bound for every configured duration (ten years).
pub const MAX_DURATION_SECS: i64 = 10 * 365 * 86_400;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid duration '{0}' (expect <n>s, <n>m, <n>h or <n>d)")]
    Duration(String),
    #[error("invalid key=value pair '{0}'")]
    Pair(String),
    #[error("invalid boolean '{0}' (expect true/false, 1/0, yes/no, on/off)")]
    Bool(String),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyConfig {
    pub min_age: Duration,
    pub deletion_taints: BTreeSet<String>,
    pub protection_annotations: BTreeMap<String, String>,
    pub protection_labels: BTreeMap<String, String>,
    /// Grace period granted to another controller that tainted a node for deletion.
    pub deletion_timeout: Duration,
    pub enable_finalizer_cleanup: bool,
    pub finalizer_timeout: Duration,
    pub finalizer_whitelist: BTreeSet<String>,
    /// Never removed, even when whitelisted.
    pub finalizer_blacklist: BTreeSet<String>,
    pub node_label_selector: BTreeMap<String, String>,
    pub dry_run: bool,
    pub cluster_name: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            min_age: Duration::minutes(10),
            deletion_taints: BTreeSet::new(),
            protection_annotations: BTreeMap::new(),
            protection_labels: BTreeMap::new(),
            deletion_timeout: Duration::minutes(15),
            enable_finalizer_cleanup: true,
            finalizer_timeout: Duration::minutes(5),
            finalizer_whitelist: BTreeSet::new(),
            finalizer_blacklist: BTreeSet::new(),
            node_label_selector: BTreeMap::new(),
            dry_run: false,
            cluster_name: "unknown".to_string(),
        }
    }
}

impl PolicyConfig {
    /// Checks cross-field consistency. Whitelist/blacklist overlap is allowed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster_name.trim().is_empty() {
            return Err(ConfigError::Invalid { field: "cluster_name", reason: "must not be empty".into() });
        }
        for (field, d) in [
            ("min_age", self.min_age),
            ("deletion_timeout", self.deletion_timeout),
            ("finalizer_timeout", self.finalizer_timeout),
        ] {
            if d < Duration::zero() {
                return Err(ConfigError::Invalid { field, reason: "must not be negative".into() });
            }
            if d > Duration::seconds(MAX_DURATION_SECS) {
                return Err(ConfigError::Invalid { field, reason: "must not exceed 3650d".into() });
            }
        }
        let empty_key = |m: &BTreeMap<String, String>| m.keys().any(|k| k.is_empty());
        if empty_key(&self.protection_annotations) || empty_key(&self.protection_labels) || empty_key(&self.node_label_selector) {
            return Err(ConfigError::Invalid { field: "key=value list", reason: "empty key".into() });
        }
        Ok(())
    }

    /// Whether a finalizer may be stripped from a node stuck in termination.
    pub fn is_removable_finalizer(&self, finalizer: &str) -> bool {
        self.finalizer_whitelist.contains(finalizer) && !self.finalizer_blacklist.contains(finalizer)
    }

    /// Names listed in both whitelist and blacklist; these are never removed.
    pub fn overlapping_finalizers(&self) -> Vec<&str> {
        self.finalizer_whitelist.intersection(&self.finalizer_blacklist).map(String::as_str).collect()
    }

    /// Server-side label selector (`k=v,k2=v2`), if any is configured.
    pub fn selector_string(&self) -> Option<String> {
        if self.node_label_selector.is_empty() {
            return None;
        }
        let parts: Vec<String> = self.node_label_selector.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        Some(parts.join(","))
    }
}

fn duration_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)([smhd])$").ok()).as_ref()
}

/// Parse `30s`, `10m`, `1h` or `2d` (case-insensitive), at most ten years.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let lowered = s.trim().to_ascii_lowercase();
    let caps = duration_re()
        .and_then(|re| re.captures(&lowered))
        .ok_or_else(|| ConfigError::Duration(s.to_string()))?;
    let value: i64 = caps[1].parse().map_err(|_| ConfigError::Duration(s.to_string()))?;
    let unit: i64 = match &caps[2] {
        "s" => 1,
        "m" => 60,
        "h" => 3_600,
        _ => 86_400,
    };
    value
        .checked_mul(unit)
        .filter(|secs| *secs <= MAX_DURATION_SECS)
        .and_then(Duration::try_seconds)
        .ok_or_else(|| ConfigError::Duration(s.to_string()))
}

/// Parse a comma-separated list, dropping blanks.
pub fn parse_list(s: &str) -> Result<BTreeSet<String>, ConfigError> {
    Ok(s.split(',').map(str::trim).filter(|p| !p.is_empty()).map(str::to_string).collect())
}

/// Parse `k1=v1,k2=v2`. The value may itself contain `=`.
pub fn parse_pairs(s: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut out = BTreeMap::new();
    for pair in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (k, v) = pair.split_once('=').ok_or_else(|| ConfigError::Pair(pair.to_string()))?;
        let k = k.trim();
        if k.is_empty() {
            return Err(ConfigError::Pair(pair.to_string()));
        }
        out.insert(k.to_string(), v.trim().to_string());
    }
    Ok(out)
}

pub fn parse_bool(s: &str) -> Result<bool, ConfigError> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Bool(s.to_string())),
    }
}
