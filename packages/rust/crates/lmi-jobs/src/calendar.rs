//! Time-ordered deferred actions, drained by the event loop.
//!
//! Events are keyed by `(fire time in epoch ms, job number, action)`. At most
//! one event per `(job, action)` is live; scheduling a duplicate keeps the
//! sooner of the two, and equal times keep the existing event.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use crate::manager::duration_millis;

/// Deferred action kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum CalendarAction {
    /// Delete the job if it still wants deletion.
    DeleteJob,
}

/// One due event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CalendarEvent {
    pub(crate) at_ms: i64,
    pub(crate) number: u64,
    pub(crate) action: CalendarAction,
}

#[derive(Debug, Default)]
pub(crate) struct Calendar {
    events: BTreeSet<(i64, u64, CalendarAction)>,
    index: HashMap<(u64, CalendarAction), i64>,
}

impl Calendar {
    /// Schedule `action` for job `number` `timeout` after `now_ms`.
    pub(crate) fn schedule(
        &mut self,
        now_ms: i64,
        timeout: Duration,
        number: u64,
        action: CalendarAction,
    ) -> bool {
        self.schedule_at(now_ms.saturating_add(duration_millis(timeout)), number, action)
    }

    /// Returns `true` if the event was armed, `false` if an earlier (or
    /// equal) one already exists.
    pub(crate) fn schedule_at(&mut self, at_ms: i64, number: u64, action: CalendarAction) -> bool {
        if let Some(&existing) = self.index.get(&(number, action)) {
            if existing <= at_ms {
                tracing::trace!(
                    job_number = number,
                    ?action,
                    existing,
                    requested = at_ms,
                    "calendar event already scheduled sooner"
                );
                return false;
            }
            self.events.remove(&(existing, number, action));
        }
        self.events.insert((at_ms, number, action));
        self.index.insert((number, action), at_ms);
        tracing::debug!(job_number = number, ?action, at_ms, "calendar event scheduled");
        true
    }

    pub(crate) fn cancel(&mut self, number: u64, action: CalendarAction) -> bool {
        match self.index.remove(&(number, action)) {
            Some(at_ms) => {
                self.events.remove(&(at_ms, number, action));
                tracing::debug!(job_number = number, ?action, "calendar event cancelled");
                true
            }
            None => false,
        }
    }

    /// Drop every event of job `number`.
    pub(crate) fn cancel_job(&mut self, number: u64) -> usize {
        let actions: Vec<_> = self
            .index
            .keys()
            .filter(|(n, _)| *n == number)
            .map(|(_, action)| *action)
            .collect();
        actions
            .into_iter()
            .filter(|action| self.cancel(number, *action))
            .count()
    }

    /// Fire time of the earliest event.
    pub(crate) fn next_deadline(&self) -> Option<i64> {
        self.events.first().map(|(at_ms, _, _)| *at_ms)
    }

    /// Remove and return all events due at `now_ms`, earliest first.
    pub(crate) fn pop_due(&mut self, now_ms: i64) -> Vec<CalendarEvent> {
        let mut due = Vec::new();
        while let Some(&(at_ms, number, action)) = self.events.first() {
            if at_ms > now_ms {
                break;
            }
            self.events.pop_first();
            self.index.remove(&(number, action));
            due.push(CalendarEvent {
                at_ms,
                number,
                action,
            });
        }
        due
    }

    #[cfg(test)]
    pub(crate) fn scheduled_at(&self, number: u64, action: CalendarAction) -> Option<i64> {
        self.index.get(&(number, action)).copied()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.events.len()
    }
}
