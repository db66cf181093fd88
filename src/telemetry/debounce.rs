/// Short-window suppression of repeated identical readings
use std::collections::HashMap;

use tokio::time::{Duration, Instant};

use crate::models::{ComparableValue, VitalKind};

#[derive(Debug, Clone, Copy)]
struct DebounceEntry {
    last_value: ComparableValue,
    last_accepted_at: Instant,
}

/// Per-(device, vital kind) duplicate filter
///
/// A candidate is dropped only when it repeats the last accepted value inside
/// the window. A changed value always passes.
#[derive(Debug)]
pub struct DebounceFilter {
    window: Duration,
    entries: HashMap<(String, VitalKind), DebounceEntry>,
}

impl DebounceFilter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: HashMap::new(),
        }
    }

    pub fn accept(&mut self, address: &str, kind: VitalKind, value: ComparableValue) -> bool {
        self.accept_at(address, kind, value, Instant::now())
    }

    pub fn accept_at(
        &mut self,
        address: &str,
        kind: VitalKind,
        value: ComparableValue,
        now: Instant,
    ) -> bool {
        let key = (address.to_string(), kind);

        if let Some(entry) = self.entries.get(&key) {
            let elapsed = now.saturating_duration_since(entry.last_accepted_at);
            if elapsed < self.window && entry.last_value == value {
                return false;
            }
        }

        self.entries.insert(
            key,
            DebounceEntry {
                last_value: value,
                last_accepted_at: now,
            },
        );
        true
    }

    /// Evict entries older than twice the window; returns how many were dropped
    pub fn sweep(&mut self, now: Instant) -> usize {
        let max_age = self.window * 2;
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.last_accepted_at) <= max_age);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
