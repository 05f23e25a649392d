//! Registry of processes that have been started but not waited on.
//!
//! Entries are keyed by pid and hold weak references, so the registry never
//! keeps a descriptor alive. A descriptor dropped without being waited on
//! disappears from [`jobs`] even though its process may still be running.

use crate::command::{Command, State};
use crate::error::Result;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

thread_local! {
    static JOBS: RefCell<BTreeMap<u32, Weak<RefCell<State>>>> = const { RefCell::new(BTreeMap::new()) };
}

pub(crate) fn register(pid: u32, state: &Rc<RefCell<State>>) {
    JOBS.with(|jobs| jobs.borrow_mut().insert(pid, Rc::downgrade(state)));
    tracing::trace!(pid, "job registered");
}

pub(crate) fn deregister(pid: u32) {
    JOBS.with(|jobs| jobs.borrow_mut().remove(&pid));
    tracing::trace!(pid, "job deregistered");
}

/// Descriptors with a running (or exited but not yet waited) process,
/// ordered by pid.
pub fn jobs() -> Vec<Command> {
    JOBS.with(|jobs| {
        let mut jobs = jobs.borrow_mut();
        jobs.retain(|_, state| state.strong_count() > 0);
        jobs.values()
            .filter_map(Weak::upgrade)
            .map(|state| Command { state })
            .collect()
    })
}

/// Wait on every registered job.
///
/// Each wait is subject to its job's own raise-policy. All jobs are waited
/// on even if some fail; the first failure is returned.
pub fn wait_jobs() -> Result<()> {
    let mut first_error = None;
    for job in jobs() {
        if let Err(e) = job.wait(None) {
            tracing::warn!(argv = ?job.argv(), error = %e, "background job failed");
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}
