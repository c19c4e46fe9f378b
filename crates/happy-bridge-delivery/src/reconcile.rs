//! Reconciliation of a displayed list against the relay's listing.

use std::collections::{HashMap, HashSet};

/// Items keyed by a client-chosen idempotency key.
pub trait LocalId {
    fn local_id(&self) -> &str;
}

/// Merge relay-listed entries against the displayed list.
///
/// `relay` holds `(localId, decoded)` pairs in relay order; `decoded` is
/// `None` when the entry could not be decoded. The result follows relay
/// order. An undecodable entry keeps its displayed version, or is dropped
/// if there is none. Displayed items missing from the relay are removed.
/// Repeated local ids keep their first occurrence.
#[must_use]
pub fn reconcile<T>(displayed: &[T], relay: Vec<(String, Option<T>)>) -> Vec<T>
where
    T: LocalId + Clone,
{
    let by_id: HashMap<&str, &T> = displayed.iter().map(|item| (item.local_id(), item)).collect();
    let mut seen = HashSet::new();
    let mut merged = Vec::with_capacity(relay.len());
    for (local_id, decoded) in relay {
        if !seen.insert(local_id.clone()) {
            continue;
        }
        match decoded {
            Some(item) => merged.push(item),
            None => match by_id.get(local_id.as_str()) {
                Some(previous) => merged.push((*previous).clone()),
                None => tracing::debug!(%local_id, "Dropping undecodable relay entry"),
            },
        }
    }
    merged
}
