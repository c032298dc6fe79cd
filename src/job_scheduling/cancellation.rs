//! Per-job cancellation tokens and the current-job marker
//!
//! Both live behind one mutex so an inbound cancel always sees a consistent
//! pair. Entries are removed by [`ActiveJobGuard`] when execution ends,
//! however it ends. A closed registry hands out pre-cancelled tokens, so a
//! job picked up while the runner stops never starts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::types::JobId;

#[derive(Debug, Default)]
struct RegistryState {
    tokens: HashMap<JobId, CancellationToken>,
    current_job: Option<JobId>,
    closed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CancellationRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `job_id` as the executing job and hand out its token
    ///
    /// The returned guard clears both again when dropped.
    pub fn register(&self, job_id: JobId) -> (CancellationToken, ActiveJobGuard) {
        let token = CancellationToken::new();
        let mut state = self.lock();
        if state.closed {
            token.cancel();
        }
        if let Some(previous) = state.tokens.insert(job_id, token.clone()) {
            // a stale entry can only be left behind by a leaked guard
            previous.cancel();
        }
        state.current_job = Some(job_id);
        drop(state);

        debug!("Registered cancellation token for job {}", job_id);
        let guard = ActiveJobGuard {
            registry: self.clone(),
            job_id,
        };
        (token, guard)
    }

    /// Signal the token registered for `job_id`, if any
    pub fn cancel(&self, job_id: JobId) -> bool {
        match self.lock().tokens.get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Stop admitting executions; returns the job already in flight, if any
    pub fn close(&self) -> Option<JobId> {
        let mut state = self.lock();
        state.closed = true;
        state.current_job
    }

    pub fn reopen(&self) {
        self.lock().closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn current_job(&self) -> Option<JobId> {
        self.lock().current_job
    }

    pub fn active_count(&self) -> usize {
        self.lock().tokens.len()
    }

    pub fn is_registered(&self, job_id: JobId) -> bool {
        self.lock().tokens.contains_key(&job_id)
    }

    fn release(&self, job_id: JobId) {
        let mut state = self.lock();
        state.tokens.remove(&job_id);
        if state.current_job == Some(job_id) {
            state.current_job = None;
        }
    }
}

/// Releases a job's registry entry on drop
#[derive(Debug)]
pub struct ActiveJobGuard {
    registry: CancellationRegistry,
    job_id: JobId,
}

impl Drop for ActiveJobGuard {
    fn drop(&mut self) {
        self.registry.release(self.job_id);
        debug!("Released cancellation token for job {}", self.job_id);
    }
}
