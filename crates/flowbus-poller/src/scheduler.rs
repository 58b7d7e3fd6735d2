//! Due-time queue for periodic polling of one port.
//!
//! Each registered address has one active [`ScheduleEntry`] in a min-heap
//! keyed by due time. The port worker asks [`PollScheduler::next_action`]
//! what to do, services the returned entry, and hands it back through
//! [`PollScheduler::complete`]:
//!
//! 1. Nothing registered: idle
//! 2. Earliest entry in the future: wait, capped to the wait quantum
//! 3. Otherwise service the earliest entry, unless the same address was
//!    serviced last time and another entry is due within the fairness
//!    window, in which case that one goes first
//!
//! Rescheduling is drift-free: the next due time is the original due time
//! plus a whole number of periods, the first one after now. Missed cycles
//! are skipped rather than replayed.
//!
//! Unregistration is lazy. Every registration gets a fresh generation and
//! entries whose generation no longer matches are dropped when they reach
//! the top of the heap.

use flowbus_common::{Address, SchedulerConfig};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// One pending poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    /// When the poll is due.
    pub due: Instant,
    /// Address to poll.
    pub address: Address,
    /// Poll period.
    pub period: Duration,
    generation: u64,
}

impl Ord for ScheduleEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so BinaryHeap pops the earliest entry first
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.address.cmp(&self.address))
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

impl PartialOrd for ScheduleEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// What the worker should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextAction {
    /// No address registered.
    Idle,
    /// Nothing due yet; sleep this long and ask again.
    Wait(Duration),
    /// Poll this entry now.
    Service(ScheduleEntry),
}

#[derive(Debug, Clone, Copy)]
struct Registration {
    period: Duration,
    generation: u64,
}

/// Next due time after `now` that stays on the `due + k * period` grid.
#[must_use]
pub fn next_due(due: Instant, period: Duration, now: Instant) -> Instant {
    let period_ns = period.as_nanos();
    if period_ns == 0 {
        return now;
    }
    let behind = now.saturating_duration_since(due).as_nanos();
    let k = behind / period_ns + 1;
    u64::try_from(period_ns * k)
        .ok()
        .and_then(|offset| due.checked_add(Duration::from_nanos(offset)))
        .unwrap_or(now + period)
}

/// Polling schedule of one port.
#[derive(Debug)]
pub struct PollScheduler {
    heap: BinaryHeap<ScheduleEntry>,
    registered: HashMap<Address, Registration>,
    next_generation: u64,
    last_serviced: Option<Address>,
    wait_quantum: Duration,
    fairness_window: Duration,
    stagger_step: Duration,
}

impl PollScheduler {
    /// Create an empty schedule.
    #[must_use]
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            heap: BinaryHeap::new(),
            registered: HashMap::new(),
            next_generation: 0,
            last_serviced: None,
            wait_quantum: config.wait_quantum,
            fairness_window: config.fairness_window,
            stagger_step: config.stagger_step,
        }
    }

    /// Start polling `address` every `period`.
    ///
    /// The first poll is staggered by the number of addresses already
    /// registered times the stagger step. Returns false, and changes
    /// nothing, if the address is already registered.
    pub fn register(&mut self, address: Address, period: Duration, now: Instant) -> bool {
        if self.registered.contains_key(&address) {
            trace!(%address, "Address already registered");
            return false;
        }

        let order = u32::try_from(self.registered.len()).unwrap_or(u32::MAX);
        let due = now + self.stagger_step * order;
        let generation = self.next_generation;
        self.next_generation += 1;

        self.registered.insert(address, Registration { period, generation });
        self.heap.push(ScheduleEntry {
            due,
            address,
            period,
            generation,
        });

        debug!(
            %address,
            period_ms = period.as_millis(),
            first_due_ms = due.saturating_duration_since(now).as_millis(),
            "Address registered"
        );
        true
    }

    /// Stop polling `address`. Returns false if it was not registered.
    pub fn unregister(&mut self, address: Address) -> bool {
        let removed = self.registered.remove(&address).is_some();
        if removed {
            if self.last_serviced == Some(address) {
                self.last_serviced = None;
            }
            debug!(%address, "Address unregistered");
        }
        removed
    }

    /// Decide what to do at `now`.
    ///
    /// A returned [`NextAction::Service`] entry is out of the heap until it
    /// is handed back through [`complete`](Self::complete) or
    /// [`reschedule`](Self::reschedule).
    pub fn next_action(&mut self, now: Instant) -> NextAction {
        self.discard_stale();
        let Some(first) = self.heap.peek() else {
            return NextAction::Idle;
        };
        if first.due > now {
            return NextAction::Wait((first.due - now).min(self.wait_quantum));
        }
        let Some(first) = self.heap.pop() else {
            return NextAction::Idle;
        };

        if self.last_serviced == Some(first.address) {
            self.discard_stale();
            let second_due = self.heap.peek().map(|e| e.due);
            if second_due.is_some_and(|due| due <= now + self.fairness_window) {
                if let Some(second) = self.heap.pop() {
                    trace!(
                        deferred = %first.address,
                        serviced = %second.address,
                        "Fairness tie-break"
                    );
                    self.heap.push(first);
                    return NextAction::Service(second);
                }
            }
        }

        NextAction::Service(first)
    }

    /// Hand back an entry after polling it.
    ///
    /// Marks the address as last serviced and pushes the entry back at its
    /// next drift-free due time. Returns that time, or `None` if the address
    /// was unregistered in the meantime.
    pub fn complete(&mut self, entry: ScheduleEntry, now: Instant) -> Option<Instant> {
        self.last_serviced = Some(entry.address);
        self.push_next(entry, now)
    }

    /// Hand back an entry that was skipped without polling.
    ///
    /// Like [`complete`](Self::complete) but does not count as servicing
    /// the address for the fairness tie-break.
    pub fn reschedule(&mut self, entry: ScheduleEntry, now: Instant) -> Option<Instant> {
        self.push_next(entry, now)
    }

    /// True if `address` is registered.
    #[must_use]
    pub fn is_registered(&self, address: Address) -> bool {
        self.registered.contains_key(&address)
    }

    /// Poll period of a registered address.
    #[must_use]
    pub fn period_of(&self, address: Address) -> Option<Duration> {
        self.registered.get(&address).map(|r| r.period)
    }

    /// Registered addresses with their periods, in no particular order.
    pub fn registrations(&self) -> impl Iterator<Item = (Address, Duration)> + '_ {
        self.registered.iter().map(|(a, r)| (*a, r.period))
    }

    /// Number of registered addresses.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registered.len()
    }

    /// True if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registered.is_empty()
    }

    /// Address serviced by the most recent [`complete`](Self::complete).
    #[must_use]
    pub fn last_serviced(&self) -> Option<Address> {
        self.last_serviced
    }

    fn is_active(&self, entry: &ScheduleEntry) -> bool {
        self.registered
            .get(&entry.address)
            .is_some_and(|r| r.generation == entry.generation)
    }

    fn discard_stale(&mut self) {
        while let Some(top) = self.heap.peek() {
            if self.is_active(top) {
                break;
            }
            trace!(address = %top.address, "Discarding stale schedule entry");
            self.heap.pop();
        }
    }

    fn push_next(&mut self, mut entry: ScheduleEntry, now: Instant) -> Option<Instant> {
        if !self.is_active(&entry) {
            return None;
        }
        entry.due = next_due(entry.due, entry.period, now);
        let due = entry.due;
        self.heap.push(entry);
        Some(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn addr(v: u8) -> Address {
        Address::new(v).unwrap()
    }

    fn scheduler() -> PollScheduler {
        PollScheduler::new(&SchedulerConfig::default())
    }

    fn expect_service(action: NextAction) -> ScheduleEntry {
        match action {
            NextAction::Service(entry) => entry,
            other => panic!("expected Service, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_is_idle() {
        let mut s = scheduler();
        assert_eq!(s.next_action(Instant::now()), NextAction::Idle);
    }

    #[test]
    fn test_registration_is_staggered_and_idempotent() {
        let mut s = scheduler();
        let t0 = Instant::now();

        assert!(s.register(addr(1), ms(200), t0));
        assert!(s.register(addr(2), ms(200), t0));
        assert!(!s.register(addr(1), ms(500), t0));
        assert_eq!(s.period_of(addr(1)), Some(ms(200)));

        let first = expect_service(s.next_action(t0));
        assert_eq!(first.address, addr(1));
        s.complete(first, t0);

        // Address 2 starts one stagger step later
        assert_eq!(s.next_action(t0), NextAction::Wait(ms(5)));
        let second = expect_service(s.next_action(t0 + ms(20)));
        assert_eq!(second.address, addr(2));
        assert_eq!(second.due, t0 + ms(20));
    }

    #[test]
    fn test_wait_capped_to_quantum() {
        let mut s = scheduler();
        let t0 = Instant::now();
        s.register(addr(1), ms(200), t0);
        let entry = expect_service(s.next_action(t0));
        s.complete(entry, t0 + ms(1));

        assert_eq!(s.next_action(t0 + ms(100)), NextAction::Wait(ms(5)));
        assert_eq!(s.next_action(t0 + ms(198)), NextAction::Wait(ms(2)));
    }

    #[test]
    fn test_drift_free_reschedule() {
        let t0 = Instant::now();
        // On time: next slot
        assert_eq!(next_due(t0, ms(200), t0 + ms(30)), t0 + ms(200));
        // Late by 1.5 periods: skip to the first slot after now
        assert_eq!(next_due(t0, ms(200), t0 + ms(300)), t0 + ms(400));
        // Exactly on a slot boundary: strictly later
        assert_eq!(next_due(t0, ms(200), t0 + ms(400)), t0 + ms(600));
        // Serviced slightly early
        assert_eq!(next_due(t0 + ms(3), ms(200), t0), t0 + ms(203));
    }

    #[test]
    fn test_complete_keeps_grid_after_delay() {
        let mut s = scheduler();
        let t0 = Instant::now();
        s.register(addr(1), ms(100), t0);

        let entry = expect_service(s.next_action(t0));
        // A slow poll finishing 250 ms late lands on the 300 ms slot
        assert_eq!(s.complete(entry, t0 + ms(250)), Some(t0 + ms(300)));
    }

    #[test]
    fn test_fairness_tie_break() {
        let mut s = scheduler();
        let t0 = Instant::now();
        s.register(addr(1), ms(10), t0);
        let e1 = expect_service(s.next_action(t0));
        s.complete(e1, t0);

        // Staggered by one step, 2 comes due together with 1 at t0+10
        s.register(addr(2), ms(10), t0 - ms(10));
        let now = t0 + ms(10);

        let next = expect_service(s.next_action(now));
        assert_eq!(next.address, addr(2), "just-serviced address must yield");
        s.complete(next, now);

        let next = expect_service(s.next_action(now));
        assert_eq!(next.address, addr(1));
    }

    #[test]
    fn test_no_tie_break_outside_window() {
        let mut s = scheduler();
        let t0 = Instant::now();
        s.register(addr(1), ms(10), t0);
        s.register(addr(2), ms(10), t0);
        let e1 = expect_service(s.next_action(t0));
        s.complete(e1, t0);

        // 1 is due at t0+10, 2 at t0+20: far apart, no swap
        let next = expect_service(s.next_action(t0 + ms(10)));
        assert_eq!(next.address, addr(1));
    }

    #[test]
    fn test_unregister_discards_lazily() {
        let mut s = scheduler();
        let t0 = Instant::now();
        s.register(addr(1), ms(100), t0);
        assert!(s.unregister(addr(1)));
        assert!(!s.unregister(addr(1)));
        assert_eq!(s.next_action(t0), NextAction::Idle);
    }

    #[test]
    fn test_reregister_invalidates_old_entry() {
        let mut s = scheduler();
        let t0 = Instant::now();
        s.register(addr(1), ms(100), t0);
        let entry = expect_service(s.next_action(t0));

        // Removed and re-added while the old entry was out for servicing
        s.unregister(addr(1));
        s.register(addr(1), ms(50), t0);
        assert_eq!(s.complete(entry, t0), None);

        let fresh = expect_service(s.next_action(t0));
        assert_eq!(fresh.period, ms(50));
        s.complete(fresh, t0);
        assert!(matches!(s.next_action(t0), NextAction::Wait(_)));
    }

    #[test]
    fn test_reschedule_does_not_mark_serviced() {
        let mut s = scheduler();
        let t0 = Instant::now();
        s.register(addr(1), ms(100), t0);
        let entry = expect_service(s.next_action(t0));
        assert_eq!(s.reschedule(entry, t0), Some(t0 + ms(100)));
        assert_eq!(s.last_serviced(), None);
    }
}
