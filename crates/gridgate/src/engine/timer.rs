//! Single-threaded timer service. Entities register a timer with a target
//! payload; the engine loop sleeps until the earliest deadline and
//! dispatches whatever came due. Periodic timers re-arm themselves on fire.

use std::time::{Duration, Instant};

use crate::common::ids::{IdCounter, TimerId};
use crate::Map;

struct TimerEntry<T> {
    deadline: Instant,
    period: Option<Duration>,
    target: T,
}

pub struct TimerService<T> {
    timers: Map<TimerId, TimerEntry<T>>,
    ids: IdCounter,
}

impl<T: Clone> TimerService<T> {
    pub fn new() -> Self {
        Self {
            timers: Map::default(),
            ids: IdCounter::default(),
        }
    }

    pub fn register(
        &mut self,
        initial_delay: Duration,
        period: Option<Duration>,
        target: T,
    ) -> TimerId {
        let id = TimerId::new(self.ids.increment());
        self.timers.insert(id, TimerEntry {
            deadline: Instant::now() + initial_delay,
            period,
            target,
        });
        id
    }

    /// Moves the timer's next fire time to `now + delay`. Unknown ids are
    /// ignored (the timer may have been cancelled by a concurrent path).
    pub fn reset(&mut self, id: TimerId, delay: Duration) {
        if let Some(entry) = self.timers.get_mut(&id) {
            entry.deadline = Instant::now() + delay;
        }
    }

    pub fn set_period(&mut self, id: TimerId, period: Option<Duration>) {
        if let Some(entry) = self.timers.get_mut(&id) {
            entry.period = period;
        }
    }

    pub fn cancel(&mut self, id: TimerId) {
        self.timers.remove(&id);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.values().map(|entry| entry.deadline).min()
    }

    /// Removes and returns everything due at `now`; periodic timers are
    /// re-armed instead of removed.
    pub fn take_due(&mut self, now: Instant) -> Vec<(TimerId, T)> {
        let due: Vec<TimerId> = self
            .timers
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        let mut fired = Vec::with_capacity(due.len());
        for id in due {
            let entry = self.timers.get_mut(&id).unwrap();
            fired.push((id, entry.target.clone()));
            match entry.period {
                Some(period) => entry.deadline = now + period,
                None => {
                    self.timers.remove(&id);
                }
            }
        }
        fired
    }
}

impl<T: Clone> Default for TimerService<T> {
    fn default() -> Self {
        Self::new()
    }
}
