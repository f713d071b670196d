//! Per-instance busy guard with an optional bounded backlog.

use crate::runtime::RejectReason;
use std::collections::VecDeque;

/// Result of offering a firing to a [`BusySlot`].
#[derive(Debug)]
pub(crate) enum Admission<T> {
    /// The slot was idle and is now held by this firing.
    Run(T),
    /// The slot is busy; the firing waits at this backlog depth.
    Queued(usize),
    /// The slot is busy and the firing was discarded.
    Rejected(RejectReason),
}

/// Serializes executions of one task instance.
///
/// At most one firing holds the slot. While it is held, firings either wait
/// in a FIFO backlog of bounded length or are rejected.
#[derive(Debug)]
pub(crate) struct BusySlot<T> {
    busy: bool,
    backlog: VecDeque<T>,
}

impl<T> Default for BusySlot<T> {
    fn default() -> Self {
        Self {
            busy: false,
            backlog: VecDeque::new(),
        }
    }
}

impl<T> BusySlot<T> {
    /// Offers a firing. `queue_capacity` of `None` means "skip when busy".
    pub(crate) fn admit(&mut self, item: T, queue_capacity: Option<usize>) -> Admission<T> {
        if !self.busy {
            self.busy = true;
            return Admission::Run(item);
        }
        match queue_capacity {
            None => Admission::Rejected(RejectReason::Busy),
            Some(capacity) if self.backlog.len() >= capacity => {
                Admission::Rejected(RejectReason::BacklogFull)
            }
            Some(_) => {
                self.backlog.push_back(item);
                Admission::Queued(self.backlog.len())
            }
        }
    }

    /// Releases the slot, or hands it straight to the oldest waiting firing.
    pub(crate) fn finish(&mut self) -> Option<T> {
        let next = self.backlog.pop_front();
        self.busy = next.is_some();
        next
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.busy
    }

    pub(crate) fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Discards waiting firings and returns how many were dropped.
    pub(crate) fn clear_backlog(&mut self) -> usize {
        let dropped = self.backlog.len();
        self.backlog.clear();
        dropped
    }
}
