//! Presence state machine: turns a stream of match results into
//! check-in / check-out events.
//!
//! ```text
//!  absent --match--> present (check_in)
//!  absent --match within debounce of check_out--> absent (no event)
//!  present --match--> present (last_seen refreshed, no event)
//!  present --silence > absence_timeout--> absent (check_out)
//! ```

use crate::types::MatchResult;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Absent,
    Present,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    CheckIn,
    CheckOut,
}

/// An attendance transition. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub employee_id: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    /// Similarity of the match that caused the event (for check-outs, of the
    /// last match before the employee went silent).
    pub confidence: f32,
    pub camera_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceState {
    pub employee_id: String,
    pub status: PresenceStatus,
    pub last_seen_timestamp: Option<DateTime<Utc>>,
    pub last_event_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_confidence: f32,
}

impl PresenceState {
    fn absent(employee_id: &str) -> Self {
        Self {
            employee_id: employee_id.to_string(),
            status: PresenceStatus::Absent,
            last_seen_timestamp: None,
            last_event_timestamp: None,
            last_confidence: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TrackerConfig {
    /// A match this soon after an employee's check-out does not check them
    /// back in. Zero disables the guard.
    pub debounce: Duration,
    /// Silence longer than this checks a present employee out.
    pub absence_timeout: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::seconds(60),
            absence_timeout: Duration::seconds(300),
        }
    }
}

/// Per-employee presence tracking.
///
/// One mutex guards the whole state map; every transition for an employee is
/// decided and applied inside a single critical section.
pub struct AttendanceTracker {
    config: TrackerConfig,
    states: Mutex<HashMap<String, PresenceState>>,
}

impl AttendanceTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> TrackerConfig {
        self.config
    }

    /// Ensure every listed employee has a state (absent when new).
    pub fn seed<I, S>(&self, employee_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut states = self.lock();
        for id in employee_ids {
            let id = id.as_ref();
            states
                .entry(id.to_string())
                .or_insert_with(|| PresenceState::absent(id));
        }
    }

    /// Feed one match result observed at `now`.
    ///
    /// Unmatched results are ignored. A match for an employee whose absence
    /// timeout already elapsed without a sweep yields the overdue check-out
    /// (stamped when the timeout expired) followed by a fresh check-in.
    pub fn observe(
        &self,
        result: &MatchResult,
        camera_id: &str,
        now: DateTime<Utc>,
    ) -> Vec<AttendanceEvent> {
        let (true, Some(employee_id)) = (result.matched, result.employee_id.as_deref()) else {
            return Vec::new();
        };

        let mut events = Vec::new();
        let mut states = self.lock();
        let state = states
            .entry(employee_id.to_string())
            .or_insert_with(|| PresenceState::absent(employee_id));

        if state.status == PresenceStatus::Present {
            let expired_at = state
                .last_seen_timestamp
                .and_then(|seen| seen.checked_add_signed(self.config.absence_timeout));
            if let Some(expired_at) = expired_at {
                if now > expired_at {
                    events.push(AttendanceEvent {
                        employee_id: employee_id.to_string(),
                        event_type: EventType::CheckOut,
                        timestamp: expired_at,
                        confidence: state.last_confidence,
                        camera_id: camera_id.to_string(),
                    });
                    state.status = PresenceStatus::Absent;
                    state.last_event_timestamp = Some(expired_at);
                }
            }
        }

        match state.status {
            PresenceStatus::Absent if self.within_debounce(state, now) => {
                tracing::debug!(employee_id, "match too soon after check-out; not checking in");
                state.last_seen_timestamp = Some(now);
                state.last_confidence = result.similarity;
            }
            PresenceStatus::Absent => {
                state.status = PresenceStatus::Present;
                state.last_seen_timestamp = Some(now);
                state.last_event_timestamp = Some(now);
                state.last_confidence = result.similarity;
                events.push(AttendanceEvent {
                    employee_id: employee_id.to_string(),
                    event_type: EventType::CheckIn,
                    timestamp: now,
                    confidence: result.similarity,
                    camera_id: camera_id.to_string(),
                });
            }
            PresenceStatus::Present => {
                if state.last_seen_timestamp.map_or(true, |seen| now > seen) {
                    state.last_seen_timestamp = Some(now);
                }
                state.last_confidence = result.similarity;
            }
        }
        events
    }

    /// Check out every present employee silent for longer than the absence
    /// timeout. Events are ordered by employee id.
    pub fn sweep(&self, camera_id: &str, now: DateTime<Utc>) -> Vec<AttendanceEvent> {
        let mut states = self.lock();
        let mut events: Vec<AttendanceEvent> = states
            .values_mut()
            .filter(|s| s.status == PresenceStatus::Present)
            .filter(|s| {
                s.last_seen_timestamp
                    .is_some_and(|seen| now.signed_duration_since(seen) > self.config.absence_timeout)
            })
            .map(|state| {
                state.status = PresenceStatus::Absent;
                state.last_event_timestamp = Some(now);
                AttendanceEvent {
                    employee_id: state.employee_id.clone(),
                    event_type: EventType::CheckOut,
                    timestamp: now,
                    confidence: state.last_confidence,
                    camera_id: camera_id.to_string(),
                }
            })
            .collect();
        events.sort_by(|a, b| a.employee_id.cmp(&b.employee_id));
        events
    }

    /// Whether an absent employee checked out less than `debounce` ago.
    fn within_debounce(&self, state: &PresenceState, now: DateTime<Utc>) -> bool {
        state.last_event_timestamp.is_some_and(|checked_out| {
            now.signed_duration_since(checked_out) < self.config.debounce
        })
    }

    pub fn presence(&self, employee_id: &str) -> Option<PresenceState> {
        self.lock().get(employee_id).cloned()
    }

    /// All states, ordered by employee id (for export / persistence).
    pub fn snapshot(&self) -> Vec<PresenceState> {
        let mut states: Vec<_> = self.lock().values().cloned().collect();
        states.sort_by(|a, b| a.employee_id.cmp(&b.employee_id));
        states
    }

    /// Replace states with previously exported ones (e.g. after a restart).
    pub fn restore(&self, restored: Vec<PresenceState>) {
        let mut states = self.lock();
        for state in restored {
            states.insert(state.employee_id.clone(), state);
        }
    }

    /// Drop the state of a deleted employee.
    pub fn forget(&self, employee_id: &str) -> bool {
        self.lock().remove(employee_id).is_some()
    }

    pub fn present_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|s| s.status == PresenceStatus::Present)
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PresenceState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
