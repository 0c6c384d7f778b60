use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::LedgerConfig;
use crate::models::{Event, EventKind};

/// An event plus the local instant it entered the ledger. Ages are measured
/// from `received`; the emitter's wall-clock stamp is never compared.
struct Entry {
    event: Event,
    received: Instant,
}

/// Recently seen events with a sliding time-to-live.
///
/// Answers "is an equivalent event still active" independently of whether an
/// alert for it is still on screen. Cheap to clone; clones share the log.
#[derive(Clone)]
pub struct EventLedger {
    entries: Arc<Mutex<Vec<Entry>>>,
    ttl: Duration,
    sweep_interval: Duration,
}

impl EventLedger {
    pub fn new(cfg: &LedgerConfig) -> Self {
        Self::with_ttl(
            Duration::from_secs(cfg.ttl_secs),
            Duration::from_millis(cfg.sweep_interval_ms),
        )
    }

    pub fn with_ttl(ttl: Duration, sweep_interval: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            ttl,
            sweep_interval,
        }
    }

    // The collection is always left consistent, so a poisoned lock is
    // still safe to use.
    fn lock(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn is_fresh(&self, entry: &Entry, now: Instant) -> bool {
        now.saturating_duration_since(entry.received) < self.ttl
    }

    pub fn push(&self, event: Event) {
        self.push_at(event, Instant::now());
    }

    pub fn push_at(&self, event: Event, received: Instant) {
        debug!("Ledger ← {}/{} ({})", event.kind.as_str(), event.name, event.id);
        self.lock().push(Entry { event, received });
    }

    /// True if a live member has this kind (and this name, when given).
    pub fn is_active(&self, kind: EventKind, name: Option<&str>) -> bool {
        self.is_active_at(kind, name, Instant::now())
    }

    pub fn is_active_at(&self, kind: EventKind, name: Option<&str>, now: Instant) -> bool {
        self.lock().iter().any(|e| {
            e.event.kind == kind
                && name.map_or(true, |n| e.event.name == n)
                && self.is_fresh(e, now)
        })
    }

    /// True if a live member carries this emission id.
    pub fn seen_id(&self, id: &str) -> bool {
        let now = Instant::now();
        self.lock().iter().any(|e| e.event.id == id && self.is_fresh(e, now))
    }

    /// Forget members of a situation that has been resolved, so the next
    /// occurrence is not taken for a duplicate.
    pub fn resolve(&self, kind: EventKind, name: &str) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|e| !(e.event.kind == kind && e.event.name == name));
        before - entries.len()
    }

    /// Drop every member whose age reached the TTL. Returns how many went.
    pub fn evict_expired(&self) -> usize {
        self.evict_expired_at(Instant::now())
    }

    pub fn evict_expired_at(&self, now: Instant) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|e| self.is_fresh(e, now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Periodic eviction until cancelled.
    pub async fn run_sweeper(self, cancel: CancellationToken) {
        info!("Event ledger sweeper started — every {:?}", self.sweep_interval);
        let mut tick = tokio::time::interval(self.sweep_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    let removed = self.evict_expired();
                    if removed > 0 {
                        debug!("Evicted {removed} stale event(s)");
                    }
                }
            }
        }
        info!("Event ledger sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn ledger() -> EventLedger {
        EventLedger::with_ttl(Duration::from_secs(10), Duration::from_secs(1))
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn duplicate_within_window_is_active() {
        let l = ledger();
        let t0 = Instant::now();
        l.push_at(Event::local(EventKind::Connection, "disconnected"), t0);

        let later = t0 + secs(2);
        assert!(l.is_active_at(EventKind::Connection, Some("disconnected"), later));
        assert!(l.is_active_at(EventKind::Connection, None, later));
        assert!(!l.is_active_at(EventKind::Connection, Some("connected"), later));
        assert!(!l.is_active_at(EventKind::Client, None, later));
    }

    #[test]
    fn expired_member_no_longer_matches() {
        let l = ledger();
        let t0 = Instant::now();
        l.push_at(Event::local(EventKind::Onvif, "motion"), t0);

        assert!(!l.is_active_at(EventKind::Onvif, Some("motion"), t0 + secs(10)));
        // still stored until the sweeper runs
        assert_eq!(l.len(), 1);
    }

    #[test]
    fn evict_removes_everything_past_ttl() {
        let l = ledger();
        let t0 = Instant::now();
        l.push_at(Event::local(EventKind::Onvif, "motion"), t0);
        l.push_at(Event::local(EventKind::Client, "zero_client"), t0 + secs(3));
        l.push_at(Event::local(EventKind::User, "kill"), t0 + secs(8));

        assert_eq!(l.evict_expired_at(t0 + secs(12)), 1);
        assert_eq!(l.len(), 2);

        assert_eq!(l.evict_expired_at(t0 + secs(30)), 2);
        assert_eq!(l.len(), 0);
        assert!(!l.is_active_at(EventKind::User, None, t0 + secs(30)));
    }

    #[test]
    fn emitter_clock_does_not_affect_age() {
        let l = ledger();
        let t0 = Instant::now();

        let mut stale = Event::local(EventKind::Connection, "disconnected");
        stale.timestamp = Utc::now() - chrono::Duration::minutes(5);
        let mut future = Event::local(EventKind::Onvif, "motion");
        future.timestamp = Utc::now() + chrono::Duration::hours(1);
        l.push_at(stale, t0);
        l.push_at(future, t0);

        assert!(l.is_active_at(EventKind::Connection, Some("disconnected"), t0 + secs(1)));
        assert!(!l.is_active_at(EventKind::Onvif, Some("motion"), t0 + secs(11)));
        assert_eq!(l.evict_expired_at(t0 + secs(11)), 2);
    }

    #[test]
    fn seen_id_matches_live_members() {
        let l = ledger();
        let e = Event::local(EventKind::User, "kill");
        let id = e.id.clone();
        l.push(e);
        assert!(l.seen_id(&id));
        assert!(!l.seen_id("other"));
    }

    #[test]
    fn resolve_clears_only_that_situation() {
        let l = ledger();
        l.push(Event::local(EventKind::Connection, "disconnected"));
        l.push(Event::local(EventKind::Onvif, "motion"));

        assert_eq!(l.resolve(EventKind::Connection, "disconnected"), 1);
        assert!(!l.is_active(EventKind::Connection, Some("disconnected")));
        assert!(l.is_active(EventKind::Onvif, Some("motion")));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_stops_on_cancel() {
        let l = ledger();
        l.push(Event::local(EventKind::Onvif, "motion"));

        let cancel = CancellationToken::new();
        let task = tokio::spawn(l.clone().run_sweeper(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert_eq!(l.len(), 0);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
