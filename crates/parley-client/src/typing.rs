use std::collections::HashMap;
use std::time::{Duration, Instant};

use parley_shared::Address;

/// Who is typing where. An indicator without a matching stop expires after
/// the quiet period.
#[derive(Debug)]
pub struct TypingTracker {
    expiry: Duration,
    active: HashMap<(Address, Option<String>), Instant>,
}

impl TypingTracker {
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            active: HashMap::new(),
        }
    }

    /// Record an indicator. Returns `true` when the visible state changed.
    pub fn observe(
        &mut self,
        from: &Address,
        group_id: Option<&str>,
        is_typing: bool,
        now: Instant,
    ) -> bool {
        let key = (from.clone(), group_id.map(str::to_lowercase));
        if is_typing {
            self.active.insert(key, now).is_none()
        } else {
            self.active.remove(&key).is_some()
        }
    }

    /// Drop expired indicators and return who stopped.
    pub fn expire(&mut self, now: Instant) -> Vec<(Address, Option<String>)> {
        let expiry = self.expiry;
        let mut expired = Vec::new();
        self.active.retain(|key, since| {
            let live = now.saturating_duration_since(*since) < expiry;
            if !live {
                expired.push(key.clone());
            }
            live
        });
        expired
    }

    /// Addresses typing in a direct chat (`None`) or a group, sorted.
    pub fn typing_in(&self, group_id: Option<&str>, now: Instant) -> Vec<Address> {
        let group_id = group_id.map(str::to_lowercase);
        let mut typing: Vec<_> = self
            .active
            .iter()
            .filter(|((_, group), since)| {
                *group == group_id && now.saturating_duration_since(**since) < self.expiry
            })
            .map(|((from, _), _)| from.clone())
            .collect();
        typing.sort();
        typing
    }

    pub fn is_typing(&self, from: &Address, group_id: Option<&str>, now: Instant) -> bool {
        let key = (from.clone(), group_id.map(str::to_lowercase));
        self.active
            .get(&key)
            .is_some_and(|since| now.saturating_duration_since(*since) < self.expiry)
    }
}
