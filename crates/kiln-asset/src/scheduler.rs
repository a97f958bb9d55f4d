//! Main-thread job scheduler: a priority-ordered pending list with at most
//! one asynchronous group job in flight.

use crate::group::GroupHandle;

/// Job kinds in dispatch priority order: `Server > Load > Unload`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum JobKind {
    Server,
    Load,
    Unload,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingJob {
    pub kind: JobKind,
    /// Invalid for `Server` jobs.
    pub group: GroupHandle,
}

pub(crate) struct Scheduler {
    pending: Vec<PendingJob>,
    current: Option<(JobKind, tokio::task::JoinHandle<()>)>,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Self {
            pending: Vec::new(),
            current: None,
        }
    }

    /// Queues a load. A pending unload for the same group is cancelled:
    /// the most recent intent wins.
    pub(crate) fn submit_load(&mut self, group: GroupHandle) {
        self.pending
            .retain(|job| !(job.kind == JobKind::Unload && job.group == group));
        if !self
            .pending
            .iter()
            .any(|job| job.kind == JobKind::Load && job.group == group)
        {
            self.pending.push(PendingJob {
                kind: JobKind::Load,
                group,
            });
        }
    }

    /// Queues an unload. A pending load for the same group annihilates
    /// with it: neither job runs.
    pub(crate) fn submit_unload(&mut self, group: GroupHandle) {
        let before = self.pending.len();
        self.pending
            .retain(|job| !(job.kind == JobKind::Load && job.group == group));
        if self.pending.len() != before {
            return;
        }
        if !self
            .pending
            .iter()
            .any(|job| job.kind == JobKind::Unload && job.group == group)
        {
            self.pending.push(PendingJob {
                kind: JobKind::Unload,
                group,
            });
        }
    }

    /// Queues a server job (bake requests pending from remote clients).
    pub(crate) fn submit_server(&mut self) {
        if !self.pending.iter().any(|job| job.kind == JobKind::Server) {
            self.pending.push(PendingJob {
                kind: JobKind::Server,
                group: GroupHandle::INVALID,
            });
        }
    }

    /// One scheduler step: retire the in-flight job if it finished, then
    /// hand out the highest-priority pending job if the slot is free. The
    /// caller dispatches it and reports back via [`Self::set_current`].
    pub(crate) fn tick(&mut self) -> Option<PendingJob> {
        if let Some((_, task)) = &self.current {
            if task.is_finished() {
                self.current = None;
            }
        }
        if self.current.is_some() || self.pending.is_empty() {
            return None;
        }

        let best = self
            .pending
            .iter()
            .enumerate()
            .min_by_key(|(index, job)| (job.kind, *index))
            .map(|(index, _)| index)?;
        Some(self.pending.remove(best))
    }

    pub(crate) fn set_current(&mut self, kind: JobKind, task: tokio::task::JoinHandle<()>) {
        debug_assert!(self.current.is_none(), "one group job in flight at a time");
        self.current = Some((kind, task));
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.current.is_some()
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn has_pending_for(&self, group: GroupHandle) -> bool {
        self.pending.iter().any(|job| job.group == group)
    }
}
