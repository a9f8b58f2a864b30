use crate::utils::current_ms;

use log::{debug, warn};
use parking_lot::RwLock;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Callback stored in a timer. Recurring timers invoke it repeatedly.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

type FrontHook = Box<dyn Fn() + Send + Sync>;

/// A backwards clock jump larger than this expires every timer at once.
const ROLLOVER_WINDOW_MS: u64 = 60 * 60 * 1000;

/// An entry in the timer queue.
struct TimerEntry {
    /// Period in milliseconds.
    interval: u64,
    recurring: bool,
    callback: TimerCallback,
}

/// Timers ordered by `(deadline, id)`, plus an index from id to deadline.
///
/// The id breaks ties between timers due at the same millisecond, so
/// iteration order is deadline first, then creation order.
struct TimerQueue {
    ordered: BTreeMap<(u64, u64), TimerEntry>,
    deadlines: HashMap<u64, u64>,

    /// Clock value seen by the previous expiry scan.
    previous_ms: u64,
}

impl TimerQueue {
    fn new(now: u64) -> Self {
        Self {
            ordered: BTreeMap::new(),
            deadlines: HashMap::new(),
            previous_ms: now,
        }
    }

    /// Inserts an entry and reports whether it became the earliest one.
    fn insert(&mut self, id: u64, next: u64, entry: TimerEntry) -> bool {
        self.deadlines.insert(id, next);
        self.ordered.insert((next, id), entry);
        self.ordered
            .first_key_value()
            .is_some_and(|(key, _)| *key == (next, id))
    }

    fn remove(&mut self, id: u64) -> Option<(u64, TimerEntry)> {
        let next = self.deadlines.remove(&id)?;
        let entry = self.ordered.remove(&(next, id))?;
        Some((next, entry))
    }

    fn detect_rollover(&mut self, now: u64) -> bool {
        let rollover = now < self.previous_ms.saturating_sub(ROLLOVER_WINDOW_MS);
        self.previous_ms = now;
        rollover
    }
}

struct Shared {
    queue: RwLock<TimerQueue>,

    /// Set once the front hook fired, cleared by `next_timer`. Coalesces
    /// front notifications between two waits.
    tickled: AtomicBool,

    on_front: Option<FrontHook>,
    next_id: AtomicU64,
}

impl Shared {
    fn insert(&self, id: u64, next: u64, entry: TimerEntry) {
        let notify = {
            let mut queue = self.queue.write();
            let at_front = queue.insert(id, next, entry);
            at_front && !self.tickled.swap(true, Ordering::AcqRel)
        };

        if notify {
            if let Some(hook) = &self.on_front {
                hook();
            }
        }
    }
}

/// An ordered set of millisecond timers.
///
/// The manager never fires anything on its own: its owner asks how long
/// until the next deadline ([`next_timer`](Self::next_timer)), waits, and
/// then collects the due callbacks with [`list_expired`](Self::list_expired).
/// [`IoManager`](crate::IoManager) does this from its idle loop.
pub struct TimerManager {
    shared: Arc<Shared>,
}

impl TimerManager {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Creates a manager that calls `on_front` whenever a new timer becomes
    /// the earliest one.
    ///
    /// Calls are coalesced: after one notification the hook stays quiet
    /// until the owner calls [`next_timer`](Self::next_timer) again.
    pub fn with_front_hook<F>(on_front: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::build(Some(Box::new(on_front)))
    }

    fn build(on_front: Option<FrontHook>) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: RwLock::new(TimerQueue::new(current_ms())),
                tickled: AtomicBool::new(false),
                on_front,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Arms a timer firing `ms` milliseconds from now.
    ///
    /// A recurring timer is re-armed `ms` after each expiry scan that
    /// collected it, until cancelled.
    pub fn add_timer<F>(&self, ms: u64, callback: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = TimerEntry {
            interval: ms,
            recurring,
            callback: Arc::new(callback),
        };

        self.shared.insert(id, current_ms().saturating_add(ms), entry);

        Timer {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Arms a timer whose callback only runs while `condition` is alive.
    pub fn add_condition_timer<F, T>(
        &self,
        ms: u64,
        callback: F,
        condition: Weak<T>,
        recurring: bool,
    ) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + ?Sized + 'static,
    {
        self.add_timer(
            ms,
            move || {
                if condition.upgrade().is_some() {
                    callback();
                }
            },
            recurring,
        )
    }

    /// Milliseconds until the earliest deadline, `Some(0)` if one is already
    /// due, `None` when no timer is armed.
    pub fn next_timer(&self) -> Option<u64> {
        self.shared.tickled.store(false, Ordering::Release);

        let queue = self.shared.queue.read();
        let (&(next, _), _) = queue.ordered.first_key_value()?;
        Some(next.saturating_sub(current_ms()))
    }

    pub fn has_timer(&self) -> bool {
        !self.shared.queue.read().ordered.is_empty()
    }

    /// Moves the callbacks of every due timer into `out`.
    ///
    /// Recurring timers are re-armed, one-shot timers are removed.
    pub fn list_expired(&self, out: &mut Vec<TimerCallback>) {
        self.list_expired_at(current_ms(), out);
    }

    pub(crate) fn list_expired_at(&self, now: u64, out: &mut Vec<TimerCallback>) {
        if self.shared.queue.read().ordered.is_empty() {
            return;
        }

        let mut queue = self.shared.queue.write();
        let rollover = queue.detect_rollover(now);
        if rollover {
            warn!("clock moved backwards, expiring {} timers", queue.ordered.len());
        }

        let due = queue
            .ordered
            .first_key_value()
            .is_some_and(|(&(next, _), _)| next <= now);
        if !rollover && !due {
            return;
        }

        let expired = match now.checked_add(1) {
            Some(bound) if !rollover => {
                let later = queue.ordered.split_off(&(bound, 0));
                std::mem::replace(&mut queue.ordered, later)
            }
            _ => std::mem::take(&mut queue.ordered),
        };

        out.reserve(expired.len());
        for ((_, id), entry) in expired {
            out.push(entry.callback.clone());
            if entry.recurring {
                let next = now.saturating_add(entry.interval);
                queue.insert(id, next, entry);
            } else {
                queue.deadlines.remove(&id);
            }
        }

        debug!("{} timers expired", out.len());
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerManager")
            .field("timers", &self.shared.queue.read().ordered.len())
            .finish()
    }
}

/// Handle to an armed timer.
///
/// Handles are cheap to clone and do not keep the manager alive. Every
/// operation returns `false` once the timer has fired (if one-shot), been
/// cancelled, or its manager is gone.
#[derive(Clone)]
pub struct Timer {
    id: u64,
    shared: Weak<Shared>,
}

impl Timer {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Disarms the timer. Idempotent.
    pub fn cancel(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        shared.queue.write().remove(self.id).is_some()
    }

    /// Pushes the deadline to one full interval from now.
    pub fn refresh(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };

        let mut queue = shared.queue.write();
        let Some((_, entry)) = queue.remove(self.id) else {
            return false;
        };
        let next = current_ms().saturating_add(entry.interval);
        queue.insert(self.id, next, entry);
        true
    }

    /// Changes the interval to `ms`.
    ///
    /// With `from_now` the new deadline counts from now, otherwise from the
    /// moment the current period started.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };

        let (next, entry) = {
            let mut queue = shared.queue.write();
            let Some((next, entry)) = queue.remove(self.id) else {
                return false;
            };
            if ms == entry.interval && !from_now {
                queue.insert(self.id, next, entry);
                return true;
            }
            (next, entry)
        };

        let start = if from_now {
            current_ms()
        } else {
            next.saturating_sub(entry.interval)
        };
        let entry = TimerEntry {
            interval: ms,
            ..entry
        };
        shared.insert(self.id, start.saturating_add(ms), entry);
        true
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Clone + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        (count, move || {
            seen.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn run(callbacks: Vec<TimerCallback>) {
        for callback in callbacks {
            callback();
        }
    }

    #[test]
    fn expiry_is_ordered_by_deadline_then_creation() {
        let manager = TimerManager::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for (ms, tag) in [(30, 'c'), (10, 'a'), (10, 'b')] {
            let order = order.clone();
            manager.add_timer(ms, move || order.lock().push(tag), false);
        }

        let mut out = Vec::new();
        manager.list_expired_at(current_ms() + 1_000, &mut out);
        run(out);

        assert_eq!(*order.lock(), vec!['a', 'b', 'c']);
        assert!(!manager.has_timer());
    }

    #[test]
    fn nothing_expires_early() {
        let manager = TimerManager::new();
        let (count, callback) = counter();
        manager.add_timer(10_000, callback, false);

        let mut out = Vec::new();
        manager.list_expired(&mut out);
        assert!(out.is_empty());
        assert_eq!(count.load(Ordering::SeqCst), 0);

        let next = manager.next_timer().unwrap();
        assert!(next <= 10_000 && next > 9_000);
    }

    #[test]
    fn recurring_timers_are_rearmed() {
        let manager = TimerManager::new();
        let (count, callback) = counter();
        let timer = manager.add_timer(50, callback, true);

        let now = current_ms();
        let mut out = Vec::new();
        manager.list_expired_at(now + 60, &mut out);
        manager.list_expired_at(now + 120, &mut out);
        run(out);

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(manager.has_timer());
        assert!(timer.cancel());
        assert!(!manager.has_timer());
    }

    #[test]
    fn clock_rollover_expires_everything() {
        let manager = TimerManager::new();
        let (count, callback) = counter();
        manager.add_timer(5_000, callback.clone(), false);
        manager.add_timer(60_000, callback, false);

        let mut out = Vec::new();
        manager.list_expired_at(current_ms() - 2 * ROLLOVER_WINDOW_MS, &mut out);
        run(out);

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(!manager.has_timer());
    }

    #[test]
    fn small_backwards_steps_are_not_rollovers() {
        let manager = TimerManager::new();
        let (count, callback) = counter();
        manager.add_timer(5_000, callback, false);

        let mut out = Vec::new();
        manager.list_expired_at(current_ms() - 1_000, &mut out);
        assert!(out.is_empty());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_is_idempotent() {
        let manager = TimerManager::new();
        let timer = manager.add_timer(100, || {}, false);

        assert!(timer.cancel());
        assert!(!timer.cancel());
        assert!(!timer.refresh());
        assert!(!timer.reset(10, true));
        assert_eq!(manager.next_timer(), None);
    }

    #[test]
    fn handles_outliving_the_manager_are_inert() {
        let manager = TimerManager::new();
        let timer = manager.add_timer(100, || {}, false);
        drop(manager);

        assert!(!timer.cancel());
        assert!(!timer.refresh());
    }

    #[test]
    fn condition_timer_skips_dead_owners() {
        let manager = TimerManager::new();
        let (count, callback) = counter();

        let owner = Arc::new(());
        manager.add_condition_timer(0, callback, Arc::downgrade(&owner), false);
        drop(owner);

        let mut out = Vec::new();
        manager.list_expired_at(current_ms() + 10, &mut out);
        assert_eq!(out.len(), 1);
        run(out);

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reset_moves_the_deadline() {
        let manager = TimerManager::new();
        let timer = manager.add_timer(10_000, || {}, false);

        assert!(timer.reset(10_000, false));
        assert!(manager.next_timer().unwrap() > 9_000);

        assert!(timer.reset(50, true));
        assert!(manager.next_timer().unwrap() <= 50);

        assert!(timer.refresh());
        assert!(manager.next_timer().unwrap() <= 50);
    }

    #[test]
    fn huge_intervals_saturate() {
        let manager = TimerManager::new();
        let (count, callback) = counter();
        let timer = manager.add_timer(u64::MAX, callback, true);

        let mut out = Vec::new();
        manager.list_expired_at(current_ms() + 1_000, &mut out);
        assert!(out.is_empty());
        assert!(manager.next_timer().unwrap() > 1_000_000);

        assert!(timer.refresh());
        assert!(timer.reset(u64::MAX, false));
        assert!(timer.reset(u64::MAX, true));

        manager.list_expired_at(u64::MAX, &mut out);
        assert_eq!(out.len(), 1);
        run(out);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(timer.cancel());
    }

    #[test]
    fn front_hook_fires_once_per_wait() {
        let (count, callback) = counter();
        let manager = TimerManager::with_front_hook(callback);

        manager.add_timer(1_000, || {}, false);
        manager.add_timer(500, || {}, false);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        manager.next_timer();
        manager.add_timer(2_000, || {}, false);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        manager.add_timer(100, || {}, false);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
