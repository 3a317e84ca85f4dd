//! In-memory attendance ledger.
//!
//! The set of students marked present in the current session. Lives for the
//! process lifetime and is only cleared by an explicit reset. All access goes
//! through one mutex, so concurrent marks and resets never drop an update.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Present/absent listing for the current session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceReport {
    /// Sorted labels marked present.
    pub present: Vec<String>,
    /// Sorted known students not yet marked present.
    pub absent: Vec<String>,
    pub count: usize,
}

struct LedgerState {
    present: BTreeSet<String>,
    session_started: DateTime<Utc>,
}

pub struct AttendanceLedger {
    state: Mutex<LedgerState>,
}

impl Default for AttendanceLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl AttendanceLedger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState {
                present: BTreeSet::new(),
                session_started: Utc::now(),
            }),
        }
    }

    /// A panic while holding the lock cannot leave the set half-updated,
    /// so a poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `label` present. Returns false if it already was.
    pub fn mark(&self, label: &str) -> bool {
        let inserted = self.lock().present.insert(label.to_string());
        if inserted {
            tracing::info!(label, "marked present");
        }
        inserted
    }

    /// Mark every label present and return the resulting attendance count,
    /// all under one lock acquisition.
    pub fn mark_all<S: AsRef<str>>(&self, labels: &[S]) -> usize {
        let mut state = self.lock();
        for label in labels {
            let label = label.as_ref();
            if state.present.insert(label.to_string()) {
                tracing::info!(label, "marked present");
            }
        }
        state.present.len()
    }

    /// Snapshot of the labels currently marked present.
    pub fn present(&self) -> BTreeSet<String> {
        self.lock().present.clone()
    }

    /// Known students not marked present.
    pub fn absent(&self, known_students: &[String]) -> BTreeSet<String> {
        let state = self.lock();
        known_students
            .iter()
            .filter(|s| !state.present.contains(*s))
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.lock().present.len()
    }

    /// Present and absent lists taken from the same snapshot.
    pub fn report(&self, known_students: &[String]) -> AttendanceReport {
        let state = self.lock();
        let absent: BTreeSet<&String> = known_students
            .iter()
            .filter(|s| !state.present.contains(*s))
            .collect();

        AttendanceReport {
            present: state.present.iter().cloned().collect(),
            absent: absent.into_iter().cloned().collect(),
            count: state.present.len(),
        }
    }

    /// Clear the ledger and start a new session. Returns the post-reset count.
    pub fn reset(&self) -> usize {
        let mut state = self.lock();
        let cleared = state.present.len();
        state.present.clear();
        state.session_started = Utc::now();
        tracing::info!(cleared, "attendance reset");
        state.present.len()
    }

    /// When the current session began (process start or last reset).
    pub fn session_started(&self) -> DateTime<Utc> {
        self.lock().session_started
    }
}
