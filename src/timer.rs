use core::time::Duration;

use std::collections::BTreeSet;
use std::time::Instant;

use crate::task::TaskId;

/// The instant `duration` from now, or `None` if it cannot be represented.
pub(crate) fn deadline_after(duration: Duration) -> Option<Instant> {
    Instant::now().checked_add(duration)
}

/// An instant far enough away to stand in for "never".
pub(crate) fn far_future() -> Instant {
    const YEAR: u64 = 365 * 24 * 60 * 60;

    let now = Instant::now();

    [30 * YEAR, YEAR, 24 * 60 * 60]
        .into_iter()
        .find_map(|secs| now.checked_add(Duration::from_secs(secs)))
        .unwrap_or(now)
}

/// Pending deadlines of suspended tasks, ordered by expiry.
///
/// Ties are broken by task id, so tasks whose deadlines coincide expire in spawn order.
#[derive(Debug, Default)]
pub(crate) struct Deadlines {
    queue: BTreeSet<(Instant, TaskId)>,
}

impl Deadlines {
    pub(crate) const fn new() -> Self {
        Self {
            queue: BTreeSet::new(),
        }
    }

    pub(crate) fn insert(&mut self, deadline: Instant, task: TaskId) {
        self.queue.insert((deadline, task));
    }

    /// Withdraws a deadline; returns `false` if it had already expired or was never set.
    pub(crate) fn remove(&mut self, deadline: Instant, task: TaskId) -> bool {
        self.queue.remove(&(deadline, task))
    }

    pub(crate) fn next(&self) -> Option<Instant> {
        self.queue.first().map(|(deadline, _)| *deadline)
    }

    /// How long until the next deadline, saturating at zero.
    pub(crate) fn timeout(&self, now: Instant) -> Option<Duration> {
        self.next()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Removes and returns every task whose deadline is at or before `now`, earliest first.
    pub(crate) fn expire(&mut self, now: Instant) -> Vec<TaskId> {
        let mut expired = Vec::new();

        while let Some(&(deadline, task)) = self.queue.first() {
            if deadline > now {
                break;
            }

            self.queue.pop_first();
            expired.push(task);
        }

        expired
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.queue.clear();
    }
}
