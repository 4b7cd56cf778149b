//! Same-day check-in deduplication and the late-arrival policy.

use crate::types::MatchResult;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("attendance store unavailable: {0}")]
    Unavailable(String),
    #[error("attendance store backend: {0}")]
    Backend(#[from] Box<dyn std::error::Error + Send + Sync>),
}

#[derive(Error, Debug)]
pub enum AttendanceError {
    #[error("face not recognized")]
    NotRecognized,
    #[error("{identity} already marked present on {date}")]
    AlreadyMarked { identity: String, date: NaiveDate },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Persistent attendance history, consulted and appended by the gate.
pub trait AttendanceStore {
    /// Whether `identity` already has a record on `date`.
    fn exists(&self, identity: &str, date: NaiveDate) -> Result<bool, StoreError>;

    /// Persist a decision and return its record id.
    fn append(&mut self, decision: &AttendanceDecision) -> Result<i64, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttendancePolicy {
    /// Arrivals strictly after `late_hour:late_minute` are late.
    pub late_hour: u32,
    pub late_minute: u32,
    pub allow_multiple_checkin: bool,
}

impl Default for AttendancePolicy {
    fn default() -> Self {
        Self {
            late_hour: 10,
            late_minute: 0,
            allow_multiple_checkin: false,
        }
    }
}

impl AttendancePolicy {
    /// Later hour, or same hour and later minute. Seconds are ignored, so
    /// 10:00:59 is still on time for a 10:00 cutoff.
    pub fn is_late(&self, time: NaiveTime) -> bool {
        time.hour() > self.late_hour || (time.hour() == self.late_hour && time.minute() > self.late_minute)
    }
}

/// One check-in ready to persist.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceDecision {
    pub identity: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    /// Another record for the same identity and day already existed.
    pub is_duplicate: bool,
    pub is_late: bool,
    pub confidence: f32,
}

/// A decision that was appended to the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordedAttendance {
    pub record_id: i64,
    pub decision: AttendanceDecision,
}

#[derive(Debug, Clone, Default)]
pub struct AttendanceGate {
    policy: AttendancePolicy,
}

impl AttendanceGate {
    pub fn new(policy: AttendancePolicy) -> Self {
        Self { policy }
    }

    /// Turn a confident match into a stored attendance record.
    ///
    /// Nothing is appended when the match is not confident or when the
    /// identity already checked in today and multiple check-ins are off.
    pub fn check_in(
        &self,
        result: &MatchResult,
        now: NaiveDateTime,
        store: &mut dyn AttendanceStore,
    ) -> Result<RecordedAttendance, AttendanceError> {
        let identity = match (&result.identity, result.is_confident) {
            (Some(identity), true) => identity,
            _ => return Err(AttendanceError::NotRecognized),
        };

        let date = now.date();
        let is_duplicate = store.exists(identity, date)?;
        if is_duplicate && !self.policy.allow_multiple_checkin {
            tracing::info!(identity = %identity, %date, "already marked present");
            return Err(AttendanceError::AlreadyMarked {
                identity: identity.clone(),
                date,
            });
        }

        let decision = AttendanceDecision {
            identity: identity.clone(),
            date,
            time: now.time(),
            is_duplicate,
            is_late: self.policy.is_late(now.time()),
            confidence: result.confidence,
        };
        let record_id = store.append(&decision)?;

        tracing::info!(
            identity = %decision.identity,
            record_id,
            late = decision.is_late,
            duplicate = decision.is_duplicate,
            "attendance marked"
        );
        Ok(RecordedAttendance { record_id, decision })
    }
}
