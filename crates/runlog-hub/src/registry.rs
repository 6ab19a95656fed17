use chrono::{DateTime, Utc};
use runlog_core::events::ActiveState;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

pub const RUN_LABEL: &str = "run";
pub const REWIND_LABEL: &str = "rewind";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveRunClaim {
    pub token: u64,
    pub thread_id: String,
    pub run_label: String,
    pub run_name: Option<String>,
    pub held_since: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("thread {active_thread_id} is already running ({active_run_label})")]
pub struct AdmissionConflict {
    pub active_thread_id: String,
    pub active_run_label: String,
    pub active_run_name: Option<String>,
}

/// A granted claim plus the cancel signal its executor listens on.
#[derive(Debug)]
pub struct AdmittedRun {
    pub claim: ActiveRunClaim,
    pub cancel: watch::Receiver<bool>,
}

enum RegistryState {
    Idle,
    Claimed {
        claim: ActiveRunClaim,
        cancel: watch::Sender<bool>,
    },
}

/// At most one run or rewind is active across all threads.
pub struct ActiveRunRegistry {
    state: Mutex<RegistryState>,
    next_token: AtomicU64,
    active: watch::Sender<ActiveState>,
}

impl Default for ActiveRunRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ActiveRunRegistry {
    pub fn new() -> Self {
        let (active, _) = watch::channel(ActiveState::default());
        Self {
            state: Mutex::new(RegistryState::Idle),
            next_token: AtomicU64::new(1),
            active,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn try_admit(
        &self,
        thread_id: &str,
        label: &str,
        name: Option<String>,
    ) -> Result<AdmittedRun, AdmissionConflict> {
        let mut state = self.lock();
        if let RegistryState::Claimed { claim, .. } = &*state {
            debug!(
                event = "admission_conflict",
                requested_thread = thread_id,
                active_thread = %claim.thread_id,
                label = %claim.run_label
            );
            return Err(AdmissionConflict {
                active_thread_id: claim.thread_id.clone(),
                active_run_label: claim.run_label.clone(),
                active_run_name: claim.run_name.clone(),
            });
        }

        let claim = ActiveRunClaim {
            token: self.next_token.fetch_add(1, Ordering::Relaxed),
            thread_id: thread_id.to_string(),
            run_label: label.to_string(),
            run_name: name,
            held_since: Utc::now(),
        };
        let (cancel_tx, cancel_rx) = watch::channel(false);
        *state = RegistryState::Claimed {
            claim: claim.clone(),
            cancel: cancel_tx,
        };
        self.active.send_replace(active_state_for(Some(&claim)));
        info!(
            event = "claim_acquired",
            thread_id = %claim.thread_id,
            label = %claim.run_label,
            token = claim.token
        );
        Ok(AdmittedRun {
            claim,
            cancel: cancel_rx,
        })
    }

    /// Moves a claim taken for a not-yet-created thread onto its real id.
    pub fn assign_thread(&self, token: u64, thread_id: &str) -> bool {
        let mut state = self.lock();
        let RegistryState::Claimed { claim, .. } = &mut *state else {
            return false;
        };
        if claim.token != token {
            return false;
        }
        claim.thread_id = thread_id.to_string();
        self.active.send_replace(active_state_for(Some(claim)));
        true
    }

    /// Releases the claim only if `token` still owns it. Returns whether it did.
    pub fn release(&self, token: u64) -> bool {
        let mut state = self.lock();
        let owns = matches!(&*state, RegistryState::Claimed { claim, .. } if claim.token == token);
        if !owns {
            debug!(event = "stale_release", token);
            return false;
        }
        *state = RegistryState::Idle;
        self.active.send_replace(ActiveState::default());
        info!(event = "claim_released", token);
        true
    }

    /// Signals cancellation to the active run when it belongs to `thread_id`.
    pub fn interrupt(&self, thread_id: &str) -> bool {
        let state = self.lock();
        match &*state {
            RegistryState::Claimed { claim, cancel } if claim.thread_id == thread_id => {
                cancel.send_replace(true);
                info!(event = "interrupt_requested", thread_id, token = claim.token);
                true
            }
            _ => false,
        }
    }

    pub fn rename(&self, thread_id: &str, name: Option<String>) {
        let mut state = self.lock();
        if let RegistryState::Claimed { claim, .. } = &mut *state {
            if claim.thread_id == thread_id {
                claim.run_name = name;
                self.active.send_replace(active_state_for(Some(claim)));
            }
        }
    }

    pub fn current(&self) -> Option<ActiveRunClaim> {
        match &*self.lock() {
            RegistryState::Idle => None,
            RegistryState::Claimed { claim, .. } => Some(claim.clone()),
        }
    }

    pub fn active_state(&self) -> ActiveState {
        self.active.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ActiveState> {
        self.active.subscribe()
    }
}

fn active_state_for(claim: Option<&ActiveRunClaim>) -> ActiveState {
    match claim {
        None => ActiveState::default(),
        Some(claim) => ActiveState {
            active_thread_id: Some(claim.thread_id.clone()),
            active_run_name: claim.run_name.clone(),
            active_run_label: Some(claim.run_label.clone()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn second_admission_conflicts_with_active_details() {
        let registry = ActiveRunRegistry::new();
        let first = registry
            .try_admit("t1", RUN_LABEL, Some("report".to_string()))
            .expect("admit");
        let conflict = registry
            .try_admit("t2", REWIND_LABEL, None)
            .expect_err("busy");
        assert_eq!(
            conflict,
            AdmissionConflict {
                active_thread_id: "t1".to_string(),
                active_run_label: RUN_LABEL.to_string(),
                active_run_name: Some("report".to_string()),
            }
        );

        assert!(registry.release(first.claim.token));
        assert!(registry.try_admit("t2", REWIND_LABEL, None).is_ok());
    }

    #[test]
    fn stale_token_cannot_release_newer_claim() {
        let registry = ActiveRunRegistry::new();
        let first = registry.try_admit("t1", RUN_LABEL, None).expect("first");
        assert!(registry.release(first.claim.token));
        let second = registry.try_admit("t1", RUN_LABEL, None).expect("second");

        assert!(!registry.release(first.claim.token));
        assert_eq!(registry.current().map(|c| c.token), Some(second.claim.token));
        assert!(registry.release(second.claim.token));
        assert!(!registry.release(second.claim.token));
        assert_eq!(registry.current(), None);
    }

    #[test]
    fn interrupt_only_reaches_matching_thread() {
        let registry = ActiveRunRegistry::new();
        let admitted = registry.try_admit("t1", RUN_LABEL, None).expect("admit");
        assert!(!registry.interrupt("t2"));
        assert!(!*admitted.cancel.borrow());
        assert!(registry.interrupt("t1"));
        assert!(*admitted.cancel.borrow());
    }

    #[test]
    fn watch_follows_admission_rename_assignment_and_release() {
        let registry = ActiveRunRegistry::new();
        let watcher = registry.watch();
        assert!(watcher.borrow().is_idle());

        let admitted = registry
            .try_admit(runlog_core::NEW_THREAD_SENTINEL, RUN_LABEL, None)
            .expect("admit");
        assert!(registry.assign_thread(admitted.claim.token, "t9"));
        assert!(!registry.assign_thread(admitted.claim.token + 1, "t10"));
        registry.rename("t9", Some("nightly".to_string()));
        assert_eq!(
            registry.active_state(),
            ActiveState {
                active_thread_id: Some("t9".to_string()),
                active_run_name: Some("nightly".to_string()),
                active_run_label: Some(RUN_LABEL.to_string()),
            }
        );

        registry.release(admitted.claim.token);
        assert!(watcher.borrow().is_idle());
    }

    #[test]
    fn concurrent_admissions_grant_exactly_one_claim() {
        let registry = Arc::new(ActiveRunRegistry::new());
        let handles: Vec<_> = (0..16)
            .map(|idx| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    registry
                        .try_admit(&format!("t{idx}"), RUN_LABEL, None)
                        .is_ok()
                })
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|handle| handle.join().expect("join"))
            .filter(|ok| *ok)
            .count();
        assert_eq!(granted, 1);
    }
}
