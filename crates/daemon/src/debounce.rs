// Keyed coalescing timer.
//
// Each key holds at most one pending value. A push on a pending key replaces
// the value (last write wins) and restarts that key's window. Used for mount
// passes (keyed by conversation) and backend saves (keyed by project + kind).

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::time::Instant;

struct Pending<V> {
    value: V,
    last_seen: Instant,
}

pub struct Debouncer<K, V> {
    window: Duration,
    pending: HashMap<K, Pending<V>>,
}

impl<K, V> Debouncer<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(window: Duration) -> Self {
        Self { window, pending: HashMap::new() }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record a value for `key`, restarting its window.
    pub fn push(&mut self, key: K, value: V) {
        self.push_at(key, value, Instant::now());
    }

    /// Like `push` but with a specific timestamp (for testing).
    pub(crate) fn push_at(&mut self, key: K, value: V, now: Instant) {
        self.pending.insert(key, Pending { value, last_seen: now });
    }

    /// Record a value for `key`, combining it with any pending value.
    pub fn push_merge(&mut self, key: K, value: V, merge: impl FnOnce(V, V) -> V) {
        let now = Instant::now();
        let value = match self.pending.remove(&key) {
            Some(previous) => merge(previous.value, value),
            None => value,
        };
        self.push_at(key, value, now);
    }

    /// Drain all entries whose window has elapsed.
    pub fn drain_ready(&mut self) -> Vec<(K, V)> {
        self.drain_ready_at(Instant::now())
    }

    /// Like `drain_ready` but with a specific timestamp (for testing).
    pub(crate) fn drain_ready_at(&mut self, now: Instant) -> Vec<(K, V)> {
        let window = self.window;
        let ready_keys: Vec<K> = self
            .pending
            .iter()
            .filter(|(_, pending)| now.duration_since(pending.last_seen) >= window)
            .map(|(key, _)| key.clone())
            .collect();

        ready_keys
            .into_iter()
            .filter_map(|key| self.pending.remove(&key).map(|pending| (key, pending.value)))
            .collect()
    }

    /// Remove and return every pending entry regardless of its deadline.
    pub fn drain_all(&mut self) -> Vec<(K, V)> {
        self.pending.drain().map(|(key, pending)| (key, pending.value)).collect()
    }

    /// Drop pending entries whose key fails `keep`.
    pub fn cancel_where(&mut self, mut keep: impl FnMut(&K) -> bool) -> usize {
        let before = self.pending.len();
        self.pending.retain(|key, _| keep(key));
        before - self.pending.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// When the next pending entry becomes ready, or None if empty.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.last_seen + self.window).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn debouncer() -> Debouncer<&'static str, u32> {
        Debouncer::new(Duration::from_millis(100))
    }

    // ── Single entry lifecycle ─────────────────────────────────────

    #[test]
    fn entry_not_ready_before_window() {
        let mut debouncer = debouncer();
        let now = Instant::now();

        debouncer.push_at("a", 1, now);

        assert!(debouncer.drain_ready_at(now + Duration::from_millis(50)).is_empty());
        assert_eq!(debouncer.pending_count(), 1);
    }

    #[test]
    fn entry_ready_after_window() {
        let mut debouncer = debouncer();
        let now = Instant::now();

        debouncer.push_at("a", 1, now);

        let ready = debouncer.drain_ready_at(now + Duration::from_millis(100));
        assert_eq!(ready, vec![("a", 1)]);
        assert_eq!(debouncer.pending_count(), 0);
    }

    // ── Coalescing ─────────────────────────────────────────────────

    #[test]
    fn rapid_pushes_coalesce_last_value_wins() {
        let mut debouncer = debouncer();
        let now = Instant::now();

        debouncer.push_at("a", 1, now);
        debouncer.push_at("a", 2, now + Duration::from_millis(20));
        debouncer.push_at("a", 3, now + Duration::from_millis(40));
        assert_eq!(debouncer.pending_count(), 1);

        assert!(debouncer.drain_ready_at(now + Duration::from_millis(80)).is_empty());

        let ready = debouncer.drain_ready_at(now + Duration::from_millis(140));
        assert_eq!(ready, vec![("a", 3)]);
    }

    #[test]
    fn keys_tracked_independently() {
        let mut debouncer = debouncer();
        let now = Instant::now();

        debouncer.push_at("a", 1, now);
        debouncer.push_at("b", 2, now + Duration::from_millis(50));

        assert_eq!(debouncer.drain_ready_at(now + Duration::from_millis(100)), vec![("a", 1)]);
        assert_eq!(debouncer.drain_ready_at(now + Duration::from_millis(150)), vec![("b", 2)]);
    }

    #[test]
    fn drain_ready_is_idempotent() {
        let mut debouncer = debouncer();
        let now = Instant::now();

        debouncer.push_at("a", 1, now);
        assert_eq!(debouncer.drain_ready_at(now + Duration::from_millis(100)).len(), 1);
        assert!(debouncer.drain_ready_at(now + Duration::from_millis(200)).is_empty());
    }

    #[test]
    fn push_merge_combines_with_pending_value() {
        let mut debouncer = debouncer();
        debouncer.push("a", 5);
        debouncer.push_merge("a", 2, u32::max);
        debouncer.push_merge("b", 7, u32::max);
        let mut drained = debouncer.drain_all();
        drained.sort();
        assert_eq!(drained, vec![("a", 5), ("b", 7)]);
    }

    // ── Cancellation and flush ─────────────────────────────────────

    #[test]
    fn cancel_where_drops_matching_keys() {
        let mut debouncer = debouncer();
        debouncer.push("a", 1);
        debouncer.push("b", 2);

        assert_eq!(debouncer.cancel_where(|key| *key != "a"), 1);
        assert_eq!(debouncer.drain_all(), vec![("b", 2)]);
    }

    #[test]
    fn drain_all_ignores_deadlines() {
        let mut debouncer = debouncer();
        debouncer.push("a", 1);
        assert_eq!(debouncer.drain_all(), vec![("a", 1)]);
        assert_eq!(debouncer.pending_count(), 0);
    }

    // ── next_deadline ──────────────────────────────────────────────

    #[test]
    fn next_deadline_none_when_empty() {
        assert!(debouncer().next_deadline().is_none());
    }

    #[test]
    fn next_deadline_returns_earliest() {
        let mut debouncer = debouncer();
        let now = Instant::now();

        debouncer.push_at("a", 1, now);
        debouncer.push_at("b", 2, now + Duration::from_millis(50));

        assert_eq!(debouncer.next_deadline(), Some(now + Duration::from_millis(100)));
    }
}
