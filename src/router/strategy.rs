//! Load-balancing strategies and the per-server load counters behind them.

use std::collections::HashMap;

use serde::Serialize;

use crate::config::ServerDescriptor;

/// Counter value that triggers a decay of every load counter.
const LOAD_CEILING: u64 = 1_000;

/// Divisor applied to every counter on decay.
const DECAY_FACTOR: u64 = 2;

/// How one server is picked from a candidate set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Priority,
    RoundRobin,
    LeastConnections,
    Random,
}

/// Method-name keywords and the strategy they select, checked in table order.
const STRATEGY_TABLE: &[(&str, Strategy)] = &[
    // data-heavy
    ("query", Strategy::LeastConnections),
    ("bigquery", Strategy::LeastConnections),
    ("batch", Strategy::LeastConnections),
    ("export", Strategy::LeastConnections),
    ("import", Strategy::LeastConnections),
    ("analyze", Strategy::LeastConnections),
    ("ingest", Strategy::LeastConnections),
    // low-latency / cache
    ("cache", Strategy::Priority),
    ("memory", Strategy::Priority),
    ("status", Strategy::Priority),
    ("ping", Strategy::Priority),
    ("health", Strategy::Priority),
    // search / fetch
    ("search", Strategy::RoundRobin),
    ("fetch", Strategy::RoundRobin),
    ("crawl", Strategy::RoundRobin),
    ("browse", Strategy::RoundRobin),
    ("lookup", Strategy::RoundRobin),
];

/// Pick a strategy from the shape of the method name.
///
/// The method is split on `.`, `_`, `-` and `/`; the first table entry whose
/// keyword equals one of the segments wins. Anything else uses priority.
pub fn classify(method: &str) -> Strategy {
    let lowered = method.to_ascii_lowercase();
    let segments: Vec<&str> = lowered
        .split(['.', '_', '-', '/'])
        .filter(|s| !s.is_empty())
        .collect();

    STRATEGY_TABLE
        .iter()
        .find(|(keyword, _)| segments.contains(keyword))
        .map(|(_, strategy)| *strategy)
        .unwrap_or(Strategy::Priority)
}

/// Mutable selection state: load counters and round-robin cursors.
#[derive(Debug, Default)]
pub struct LoadState {
    counters: HashMap<String, u64>,
    cursors: HashMap<String, usize>,
}

impl LoadState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, server_id: &str) -> u64 {
        self.counters.get(server_id).copied().unwrap_or(0)
    }

    /// Snapshot of every counter.
    pub fn counters(&self) -> HashMap<String, u64> {
        self.counters.clone()
    }

    /// Select a candidate index and advance any cursor involved.
    ///
    /// Returns `None` only for an empty candidate set.
    pub fn select(&mut self, strategy: Strategy, candidates: &[ServerDescriptor]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        if strategy != Strategy::RoundRobin {
            return self.peek(strategy, candidates);
        }
        let key = cursor_key(candidates);
        let cursor = self.cursors.entry(key).or_insert(0);
        let idx = *cursor % candidates.len();
        *cursor = (idx + 1) % candidates.len();
        Some(idx)
    }

    /// Select a candidate index without advancing cursors.
    pub fn peek(&self, strategy: Strategy, candidates: &[ServerDescriptor]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let idx = match strategy {
            Strategy::Priority => {
                // First of the highest priority wins
                let mut best = 0;
                for (i, c) in candidates.iter().enumerate().skip(1) {
                    if c.priority > candidates[best].priority {
                        best = i;
                    }
                }
                best
            }
            Strategy::RoundRobin => {
                let cursor = self.cursors.get(&cursor_key(candidates)).copied().unwrap_or(0);
                cursor % candidates.len()
            }
            Strategy::LeastConnections => {
                // min_by_key keeps the first of equal minima
                candidates
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, c)| self.load(&c.id))
                    .map(|(i, _)| i)
                    .unwrap_or(0)
            }
            Strategy::Random => fastrand::usize(..candidates.len()),
        };
        Some(idx)
    }

    /// Count one routed request against `server_id`, decaying all counters
    /// once it crosses the ceiling.
    pub fn record(&mut self, server_id: &str) {
        let counter = self.counters.entry(server_id.to_string()).or_insert(0);
        *counter += 1;
        if *counter > LOAD_CEILING {
            self.decay();
        }
    }

    /// Divide every counter, preserving relative order.
    pub fn decay(&mut self) {
        for value in self.counters.values_mut() {
            *value /= DECAY_FACTOR;
        }
        tracing::debug!(servers = self.counters.len(), "decayed load counters");
    }

    #[cfg(test)]
    pub(crate) fn set_load(&mut self, server_id: &str, value: u64) {
        self.counters.insert(server_id.to_string(), value);
    }
}

/// Round-robin cursors are keyed by the sorted set of candidate ids.
fn cursor_key(candidates: &[ServerDescriptor]) -> String {
    let mut ids: Vec<&str> = candidates.iter().map(|c| c.id.as_str()).collect();
    ids.sort_unstable();
    ids.join(",")
}
