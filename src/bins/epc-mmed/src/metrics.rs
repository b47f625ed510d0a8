//! MME Metrics
//!
//! Counter sink used by the procedure engines, and the in-process registry
//! behind it.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

/// Counter names
pub mod names {
    pub const UE_ATTACH: &str = "ue_attach";
    pub const UE_DETACH: &str = "ue_detach";
    pub const IMPLICIT_DETACH: &str = "implicit_detach";
    pub const NAS_ATTACH_REJECT: &str = "nas_attach_reject";
    pub const PAGING: &str = "paging";
    pub const DEDICATED_BEARER_ACTIVATION: &str = "dedicated_bearer_activation";
    pub const S1_HANDOVER: &str = "s1_handover";
    pub const PATH_SWITCH: &str = "path_switch";
}

/// Counter increments from the engines. Never fails.
pub trait CounterSink: Send + Sync {
    fn increment_counter(&self, name: &str, value: u64, labels: &[(&str, &str)]);
}

/// Series key: name plus sorted label pairs
fn series_key(name: &str, labels: &[(&str, &str)]) -> String {
    let mut labels: Vec<_> = labels.to_vec();
    labels.sort_unstable();
    if labels.is_empty() {
        return name.to_string();
    }
    let body: Vec<String> = labels.iter().map(|(k, v)| format!("{}=\"{}\"", k, v)).collect();
    format!("{}{{{}}}", name, body.join(","))
}

/// In-process counter registry
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: RwLock<BTreeMap<String, u64>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a series (0 if never incremented)
    pub fn get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let counters = self.counters.read().unwrap_or_else(PoisonError::into_inner);
        counters.get(&series_key(name, labels)).copied().unwrap_or(0)
    }

    /// Sum over every series of `name`
    pub fn total(&self, name: &str) -> u64 {
        let prefix = format!("{}{{", name);
        let counters = self.counters.read().unwrap_or_else(PoisonError::into_inner);
        counters
            .iter()
            .filter(|(k, _)| k.as_str() == name || k.starts_with(&prefix))
            .map(|(_, v)| *v)
            .sum()
    }

    /// Text exposition, one series per line
    pub fn render(&self) -> String {
        let counters = self.counters.read().unwrap_or_else(PoisonError::into_inner);
        counters
            .iter()
            .map(|(k, v)| format!("{} {}\n", k, v))
            .collect()
    }
}

impl CounterSink for MetricsRegistry {
    fn increment_counter(&self, name: &str, value: u64, labels: &[(&str, &str)]) {
        let mut counters = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        *counters.entry(series_key(name, labels)).or_insert(0) += value;
    }
}
