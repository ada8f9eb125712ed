//! Ordered timer for cyclic and one-shot callbacks.
//!
//! Entries live in an id-ordered arena and are additionally indexed by
//! `(next_time, id)` so processing pops them in firing order with the id as
//! tie-breaker. During a processing pass the due entries move to a transient
//! set; while an entry sits there, `remove` only clears its callback slot
//! (tombstone) and `modify` adjusts its fields in place. The timer mutex is
//! dropped around every callback so a callback may add, modify or remove
//! entries on the same timer, including itself. Dropping the timer from
//! within one of its callbacks is not supported.

use core_status::{UaError, UaResult};
use core_time::{DATETIME_MSEC, DATETIME_SEC, DateTime};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use tracing::trace;

/// Identifier of a timer entry. Strictly increasing, never zero and never
/// reused while the timer lives.
pub type TimerId = u64;

/// How a cyclic entry recovers when an execution window was missed, e.g.
/// because the application was congested or the clock was shifted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPolicy {
    /// Guarantee at least `interval` between executions by rescheduling
    /// relative to the current time.
    CurrentTime,
    /// Stay aligned to the original base time.
    BaseTime,
    /// Execute a single time, then remove the entry. The only policy that
    /// admits a firing time in the past (executes in the next pass).
    Once,
}

type Callback = Arc<Mutex<dyn FnMut() + Send>>;

struct TimerEntry {
    next_time: DateTime,
    /// Interval in ticks. Zero or negative only for `Once` entries.
    interval: i64,
    policy: TimerPolicy,
    /// Cleared slot marks the entry for deletion during a processing pass.
    callback: Option<Callback>,
}

#[derive(Default)]
struct TimerState {
    /// Arena ordered by id.
    entries: BTreeMap<TimerId, TimerEntry>,
    /// `(next_time, id)` index over the entries not currently dispatching.
    by_time: BTreeSet<(DateTime, TimerId)>,
    /// Ids split off for the running `process` pass.
    dispatching: BTreeSet<TimerId>,
    id_counter: u64,
}

/// Key-value store of timer entries ordered by `next_time` and by id.
#[derive(Default)]
pub struct Timer {
    state: Mutex<TimerState>,
}

/// Next execution aligned forward from `base` in steps of `interval`.
/// A negative modulus (base in the future) is normalized by adding the
/// interval so the result still lies ahead of `current`.
fn calculate_next_time(current: DateTime, base: DateTime, interval: i64) -> DateTime {
    let mut cycle_delay = (current - base) % interval;
    if cycle_delay < 0 {
        cycle_delay += interval;
    }
    current + interval - cycle_delay
}

/// Resolve interval and first execution time from the public arguments.
/// Only the `Once` policy admits a non-positive interval; with a base time
/// the effective interval becomes `base − now` so the entry fires in the
/// next processing pass.
fn resolve_schedule(
    interval_ms: f64,
    now: DateTime,
    mut base_time: Option<DateTime>,
    policy: TimerPolicy,
) -> UaResult<(i64, DateTime)> {
    let mut interval = (interval_ms * DATETIME_MSEC as f64) as i64;
    if interval <= 0 {
        if policy != TimerPolicy::Once {
            return Err(UaError::InvalidArgument);
        }
        if let Some(base) = base_time.take() {
            interval = base - now;
        }
    }
    let next_time = match base_time {
        None => now + interval,
        Some(base) => calculate_next_time(now, base, interval),
    };
    Ok((interval, next_time))
}

impl TimerState {
    /// Adjust `next_time` of a CurrentTime entry to coincide with a harmonic
    /// neighbor. The search window deviates from the requested time by at
    /// most a quarter interval and at most one second; a neighbor qualifies
    /// when one interval is an integer multiple of the other. An exact
    /// interval match ends the search.
    fn batch(&self, skip: Option<TimerId>, interval: i64, next_time: DateTime) -> DateTime {
        let deviate = (interval / 4).min(DATETIME_SEC);
        let earliest = next_time - deviate;
        let latest = next_time + deviate;
        let mut adjusted = next_time;
        for (&id, entry) in &self.entries {
            if Some(id) == skip || entry.interval <= 0 {
                continue;
            }
            if entry.next_time < earliest || entry.next_time > latest {
                continue;
            }
            if interval < entry.interval && entry.interval % interval != 0 {
                continue;
            }
            if interval > entry.interval && interval % entry.interval != 0 {
                continue;
            }
            adjusted = entry.next_time;
            if interval == entry.interval {
                break;
            }
        }
        adjusted
    }

    fn earliest(&self) -> DateTime {
        self.by_time
            .first()
            .map(|&(t, _)| t)
            .unwrap_or(DateTime::MAX)
    }
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry. `interval_ms` must be positive unless `policy` is
    /// `Once`. With a base time the first execution is aligned to it,
    /// otherwise it happens `interval` after `now`. Cyclic CurrentTime
    /// entries are batched with harmonic neighbors.
    pub fn add(
        &self,
        callback: impl FnMut() + Send + 'static,
        interval_ms: f64,
        now: DateTime,
        base_time: Option<DateTime>,
        policy: TimerPolicy,
    ) -> UaResult<TimerId> {
        let (interval, mut next_time) = resolve_schedule(interval_ms, now, base_time, policy)?;

        let mut state = self.state.lock().unwrap();
        if policy == TimerPolicy::CurrentTime && interval > 0 {
            next_time = state.batch(None, interval, next_time);
        }
        state.id_counter += 1;
        let id = state.id_counter;
        state.entries.insert(
            id,
            TimerEntry {
                next_time,
                interval,
                policy,
                callback: Some(Arc::new(Mutex::new(callback))),
            },
        );
        state.by_time.insert((next_time, id));
        trace!(target: "timer", id, next_time, interval, "entry added");
        Ok(id)
    }

    /// One-shot entry that fires at `date` (or in the next processing pass
    /// when `date` already lies in the past).
    pub fn add_timed(
        &self,
        callback: impl FnMut() + Send + 'static,
        date: DateTime,
        now: DateTime,
    ) -> UaResult<TimerId> {
        self.add(callback, 0.0, now, Some(date), TimerPolicy::Once)
    }

    /// Reschedule an existing entry. When the entry is currently
    /// dispatching, only its fields are updated: the freshly computed
    /// `next_time` is reduced by `interval` so the post-dispatch re-insert,
    /// which adds `interval`, arrives at the intended time.
    pub fn modify(
        &self,
        id: TimerId,
        interval_ms: f64,
        now: DateTime,
        base_time: Option<DateTime>,
        policy: TimerPolicy,
    ) -> UaResult<()> {
        let (interval, mut next_time) = resolve_schedule(interval_ms, now, base_time, policy)?;

        let mut state = self.state.lock().unwrap();
        if !state.entries.contains_key(&id) {
            return Err(UaError::NotFound);
        }
        if policy == TimerPolicy::CurrentTime && interval > 0 {
            next_time = state.batch(Some(id), interval, next_time);
        }

        let dispatching = state.dispatching.contains(&id);
        let entry = state.entries.get_mut(&id).expect("entry present");
        let old_key = (entry.next_time, id);
        entry.interval = interval;
        entry.policy = policy;
        if dispatching {
            entry.next_time = next_time - interval;
        } else {
            entry.next_time = next_time;
            state.by_time.remove(&old_key);
            state.by_time.insert((next_time, id));
        }
        Ok(())
    }

    /// Remove an entry. A currently dispatching entry is only tombstoned;
    /// the processing pass traverses it without executing and frees it.
    pub fn remove(&self, id: TimerId) {
        let mut state = self.state.lock().unwrap();
        if state.dispatching.contains(&id) {
            if let Some(entry) = state.entries.get_mut(&id) {
                entry.callback = None;
            }
            return;
        }
        if let Some(entry) = state.entries.remove(&id) {
            state.by_time.remove(&(entry.next_time, id));
        }
    }

    /// Execute all entries due at `now` in `(next_time, id)` order and
    /// return the earliest remaining `next_time` (or `i64::MAX`).
    ///
    /// Not reentrant: calling `process` from within one of its callbacks
    /// returns without doing work.
    pub fn process(&self, now: DateTime) -> DateTime {
        let mut state = self.state.lock().unwrap();
        if !state.dispatching.is_empty() {
            return state.earliest();
        }

        // Split off everything due at `now`. Entries a callback adds during
        // the pass go to `by_time` and wait for the next pass.
        let not_ready = state.by_time.split_off(&(now + 1, 0));
        let ready = std::mem::replace(&mut state.by_time, not_ready);
        for &(_, id) in &ready {
            state.dispatching.insert(id);
        }

        for (_, id) in ready {
            let callback = state
                .entries
                .get(&id)
                .and_then(|entry| entry.callback.clone());
            if let Some(callback) = callback {
                drop(state);
                (*callback.lock().unwrap())();
                state = self.state.lock().unwrap();
            }

            state.dispatching.remove(&id);
            let drop_entry = match state.entries.get(&id) {
                None => continue,
                // Tombstoned or one-shot entries are dropped after traversal.
                Some(entry) => entry.callback.is_none() || entry.policy == TimerPolicy::Once,
            };
            if drop_entry {
                state.entries.remove(&id);
                continue;
            }

            let entry = state.entries.get_mut(&id).expect("entry present");
            entry.next_time += entry.interval;
            if entry.next_time < now {
                entry.next_time = match entry.policy {
                    TimerPolicy::CurrentTime => now + entry.interval,
                    TimerPolicy::BaseTime => {
                        calculate_next_time(now, entry.next_time, entry.interval)
                    }
                    TimerPolicy::Once => unreachable!("handled above"),
                };
            }
            let key = (entry.next_time, id);
            state.by_time.insert(key);
        }

        state.earliest()
    }

    /// Earliest `next_time` of any live entry without doing work.
    pub fn next(&self) -> DateTime {
        self.state.lock().unwrap().earliest()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.entries.clear();
        state.by_time.clear();
        state.dispatching.clear();
    }
}
