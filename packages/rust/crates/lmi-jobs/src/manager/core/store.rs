//! Job map, pending queue, running set and calendar, guarded by the manager lock.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::calendar::Calendar;
use crate::error::{JobError, Result};
use crate::job::Job;
use crate::manager::types::{LoopMessage, SignalHook};

#[derive(Debug, Default)]
pub(super) struct JobStore {
    pub(super) jobs: BTreeMap<u64, Arc<Job>>,
    /// Ordered by (priority, number); lowest first.
    pending: BTreeSet<(u32, u64)>,
    /// number -> priority the job is queued under.
    pending_index: HashMap<u64, u32>,
    pub(super) running: BTreeMap<u64, CancellationToken>,
    pub(super) calendar: Calendar,
    pub(super) mailbox: Option<SignalHook>,
}

impl JobStore {
    pub(super) fn is_pending(&self, number: u64) -> bool {
        self.pending_index.contains_key(&number)
    }

    pub(super) fn is_queued(&self, number: u64) -> bool {
        self.is_pending(number) || self.running.contains_key(&number)
    }

    /// Returns `false` if the job is already pending.
    pub(super) fn enqueue(&mut self, number: u64, priority: u32) -> bool {
        if self.is_pending(number) {
            return false;
        }
        self.pending.insert((priority, number));
        self.pending_index.insert(number, priority);
        true
    }

    /// Move a pending job to its new priority. No-op for jobs not pending.
    pub(super) fn requeue(&mut self, number: u64, priority: u32) -> bool {
        let Some(old) = self.pending_index.get(&number).copied() else {
            return false;
        };
        if old == priority {
            return false;
        }
        self.pending.remove(&(old, number));
        self.pending.insert((priority, number));
        self.pending_index.insert(number, priority);
        true
    }

    pub(super) fn remove_pending(&mut self, number: u64) -> bool {
        match self.pending_index.remove(&number) {
            Some(priority) => self.pending.remove(&(priority, number)),
            None => false,
        }
    }

    /// Pop the next job allowed to start under the concurrency policy.
    pub(super) fn pop_launchable(&mut self, concurrent: bool) -> Option<u64> {
        if !concurrent && !self.running.is_empty() {
            return None;
        }
        let (_, number) = self.pending.pop_first()?;
        self.pending_index.remove(&number);
        Some(number)
    }

    pub(super) fn pending_numbers(&self) -> Vec<u64> {
        self.pending.iter().map(|(_, number)| *number).collect()
    }

    pub(super) fn running_numbers(&self) -> Vec<u64> {
        self.running.keys().copied().collect()
    }

    pub(super) fn notify(&self, message: LoopMessage) -> Result<()> {
        let mailbox = self.mailbox.as_ref().ok_or(JobError::NotRunning)?;
        mailbox.send(message).map_err(|_| JobError::NotRunning)
    }
}
