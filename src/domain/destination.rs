//! Destination → subscriber bookkeeping.
//!
//! [`DestinationTable`] maps each destination name to the ordered list of
//! connections subscribed to it. A destination exists only while it has at
//! least one subscriber: it is created on first subscribe and dropped when
//! the last subscriber leaves.
//!
//! The table is plain data. The relay keeps it behind its state lock, which
//! serializes every mutation.

use std::collections::HashMap;

use serde::Serialize;
use utoipa::ToSchema;

use super::ConnectionId;

/// Subscriber lists keyed by destination name.
///
/// Subscriber order is subscribe order, which is also fan-out order.
#[derive(Debug, Default)]
pub struct DestinationTable {
    destinations: HashMap<String, Vec<ConnectionId>>,
}

/// Lightweight summary of a destination for list endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct DestinationSummary {
    /// Destination name.
    pub name: String,
    /// Number of current subscribers.
    pub subscriber_count: usize,
}

impl DestinationTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `id` to the subscribers of `name`, creating the destination if
    /// needed.
    ///
    /// Returns `false` if `id` was already subscribed (the call is a no-op).
    pub fn subscribe(&mut self, name: &str, id: ConnectionId) -> bool {
        let subscribers = self.destinations.entry(name.to_string()).or_default();
        if subscribers.contains(&id) {
            return false;
        }
        subscribers.push(id);
        true
    }

    /// Removes `id` from the subscribers of `name`, dropping the destination
    /// when it becomes empty.
    ///
    /// Returns `false` if `id` was not subscribed.
    pub fn unsubscribe(&mut self, name: &str, id: ConnectionId) -> bool {
        let Some(subscribers) = self.destinations.get_mut(name) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|s| *s != id);
        let removed = subscribers.len() != before;
        if subscribers.is_empty() {
            self.destinations.remove(name);
        }
        removed
    }

    /// Removes `id` from every named destination. Returns how many
    /// subscriptions were dropped.
    pub fn remove_connection<'a>(
        &mut self,
        names: impl IntoIterator<Item = &'a str>,
        id: ConnectionId,
    ) -> usize {
        names
            .into_iter()
            .filter(|name| self.unsubscribe(name, id))
            .count()
    }

    /// Returns the subscribers of `name` in subscribe order.
    #[must_use]
    pub fn subscribers(&self, name: &str) -> Option<&[ConnectionId]> {
        self.destinations.get(name).map(Vec::as_slice)
    }

    /// Returns `true` if `id` is subscribed to `name`.
    #[must_use]
    pub fn is_subscribed(&self, name: &str, id: ConnectionId) -> bool {
        self.subscribers(name)
            .is_some_and(|subscribers| subscribers.contains(&id))
    }

    /// Returns summaries of all destinations, sorted by name.
    #[must_use]
    pub fn summaries(&self) -> Vec<DestinationSummary> {
        let mut summaries: Vec<DestinationSummary> = self
            .destinations
            .iter()
            .map(|(name, subscribers)| DestinationSummary {
                name: name.clone(),
                subscriber_count: subscribers.len(),
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    /// Returns the number of live destinations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    /// Returns `true` if no destination has subscribers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }
}
