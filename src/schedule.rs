use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::MAX_REASON_LEN;
use crate::model::{Actor, Ms, Role};

/// Minutes since midnight, `00:00..=23:59`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MinuteOfDay(u16);

impl MinuteOfDay {
    pub fn new(hour: u16, minute: u16) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self(hour * 60 + minute))
    }

    pub fn minutes(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for MinuteOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

impl FromStr for MinuteOfDay {
    type Err = ScheduleError;

    /// Accepts `HH:MM` and `HH:MM:SS` (seconds must be zero).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split(':');
        let hour = parts.next().and_then(|p| p.parse::<u16>().ok());
        let minute = parts.next().and_then(|p| p.parse::<u16>().ok());
        let seconds_ok = match parts.next() {
            None => true,
            Some(sec) => sec == "00",
        };
        match (hour, minute, seconds_ok, parts.next()) {
            (Some(h), Some(m), true, None) => MinuteOfDay::new(h, m).ok_or(ScheduleError::InvalidTime),
            _ => Err(ScheduleError::InvalidTime),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScheduleStatus {
    Pending,
    Approved,
    Rejected,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Pending => "pending",
            ScheduleStatus::Approved => "approved",
            ScheduleStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(ScheduleStatus::Pending),
            "approved" | "approve" => Ok(ScheduleStatus::Approved),
            "rejected" | "reject" => Ok(ScheduleStatus::Rejected),
            other => Err(format!("unknown schedule status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleChangeRequest {
    pub id: Ulid,
    pub requester_id: Ulid,
    pub role: Role,
    pub branch_id: Option<Ulid>,
    /// 1 = Monday .. 7 = Sunday
    pub day_of_week: u8,
    pub start_time: Option<MinuteOfDay>,
    pub end_time: Option<MinuteOfDay>,
    pub reason: String,
    pub status: ScheduleStatus,
    pub admin_notes: Option<String>,
    pub reviewer_id: Option<Ulid>,
    pub requested_at: Ms,
    pub reviewed_at: Option<Ms>,
}

/// One recurring weekly slot of a staff member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklySlot {
    pub day_of_week: u8,
    pub branch_id: Option<Ulid>,
    pub start_time: Option<MinuteOfDay>,
    pub end_time: Option<MinuteOfDay>,
}

impl ScheduleChangeRequest {
    pub fn slot(&self) -> WeeklySlot {
        WeeklySlot {
            day_of_week: self.day_of_week,
            branch_id: self.branch_id,
            start_time: self.start_time,
            end_time: self.end_time,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    InvalidDay(u8),
    InvalidTime,
    EndBeforeStart,
    EmptyReason,
    ReasonTooLong,
    /// Only staff and optometrists file requests, and only for themselves.
    NotRequester,
    NotReviewer,
    AlreadyReviewed(ScheduleStatus),
    InvalidDecision,
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleError::InvalidDay(d) => write!(f, "day_of_week must be 1..=7, got {d}"),
            ScheduleError::InvalidTime => write!(f, "time must be HH:MM"),
            ScheduleError::EndBeforeStart => write!(f, "end_time must be after start_time"),
            ScheduleError::EmptyReason => write!(f, "reason is required"),
            ScheduleError::ReasonTooLong => write!(f, "reason too long"),
            ScheduleError::NotRequester => {
                write!(f, "only staff or optometrists may request changes, and only for themselves")
            }
            ScheduleError::NotReviewer => write!(f, "only an admin may review schedule changes"),
            ScheduleError::AlreadyReviewed(s) => write!(f, "request already {s}"),
            ScheduleError::InvalidDecision => write!(f, "decision must be approved or rejected"),
        }
    }
}

impl std::error::Error for ScheduleError {}

pub struct NewScheduleChange<'a> {
    pub requester_id: Ulid,
    pub role: Role,
    pub day_of_week: u8,
    pub start_time: Option<MinuteOfDay>,
    pub end_time: Option<MinuteOfDay>,
    pub reason: &'a str,
}

/// Shape and permission checks for a new request.
pub fn validate_request(actor: &Actor, req: &NewScheduleChange<'_>) -> Result<(), ScheduleError> {
    if !matches!(actor.role, Role::Staff | Role::Optometrist)
        || actor.user_id != req.requester_id
        || actor.role != req.role
    {
        return Err(ScheduleError::NotRequester);
    }
    if !(1..=7).contains(&req.day_of_week) {
        return Err(ScheduleError::InvalidDay(req.day_of_week));
    }
    if let (Some(start), Some(end)) = (req.start_time, req.end_time)
        && end <= start
    {
        return Err(ScheduleError::EndBeforeStart);
    }
    if req.reason.trim().is_empty() {
        return Err(ScheduleError::EmptyReason);
    }
    if req.reason.chars().count() > MAX_REASON_LEN {
        return Err(ScheduleError::ReasonTooLong);
    }
    Ok(())
}

/// The review guard: only a pending request can be decided, and only once.
pub fn review(
    actor: &Actor,
    current: ScheduleStatus,
    decision: ScheduleStatus,
) -> Result<ScheduleStatus, ScheduleError> {
    if !actor.is_admin() {
        return Err(ScheduleError::NotReviewer);
    }
    match (current, decision) {
        (ScheduleStatus::Pending, ScheduleStatus::Approved | ScheduleStatus::Rejected) => Ok(decision),
        (ScheduleStatus::Pending, ScheduleStatus::Pending) => Err(ScheduleError::InvalidDecision),
        (done @ (ScheduleStatus::Approved | ScheduleStatus::Rejected), _) => {
            Err(ScheduleError::AlreadyReviewed(done))
        }
    }
}
