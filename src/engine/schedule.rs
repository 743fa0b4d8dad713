use std::collections::HashMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::Mutex;
use tracing::{debug, info};
use ulid::Ulid;

use crate::catalog::TargetError;
use crate::limits::*;
use crate::model::*;
use crate::notify::Notice;
use crate::schedule::{self, MinuteOfDay, NewScheduleChange, ScheduleChangeRequest, ScheduleStatus, WeeklySlot};

use super::{Engine, EngineError};

/// Parameters of a schedule-change request as filed by a staff member.
#[derive(Debug, Clone)]
pub struct ScheduleChangeInput {
    pub requester_id: Ulid,
    pub role: Role,
    pub branch_id: Option<Ulid>,
    pub day_of_week: u8,
    pub start_time: Option<MinuteOfDay>,
    pub end_time: Option<MinuteOfDay>,
    pub reason: String,
}

fn apply_review(
    req: &mut ScheduleChangeRequest,
    decision: ScheduleStatus,
    reviewer_id: Ulid,
    admin_notes: Option<String>,
    at: Ms,
) {
    req.status = decision;
    req.reviewer_id = Some(reviewer_id);
    req.admin_notes = admin_notes;
    req.reviewed_at = Some(at);
}

impl Engine {
    pub async fn request_schedule_change(
        &self,
        id: Ulid,
        actor: &Actor,
        input: ScheduleChangeInput,
    ) -> Result<ScheduleChangeRequest, EngineError> {
        schedule::validate_request(
            actor,
            &NewScheduleChange {
                requester_id: input.requester_id,
                role: input.role,
                day_of_week: input.day_of_week,
                start_time: input.start_time,
                end_time: input.end_time,
                reason: &input.reason,
            },
        )
        .map_err(|e| EngineError::from_schedule(id, "request", e))?;
        if let Some(branch_id) = input.branch_id {
            match self.catalog.branch(&branch_id) {
                None => return Err(TargetError::UnknownBranch(branch_id).into()),
                Some(b) if !b.active => return Err(TargetError::InactiveBranch(branch_id).into()),
                Some(_) => {}
            }
        }

        let _gate = self.commit_gate.read().await;
        // Claim the id first; of two racing requests with one id, one stops here.
        if !self.schedule_ids.insert(id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let claim = (input.requester_id, input.day_of_week);
        let existing = match self.pending_schedule.entry(claim) {
            Entry::Occupied(o) => Some(*o.get()),
            Entry::Vacant(v) => {
                v.insert(id);
                None
            }
        };
        if let Some(existing) = existing {
            self.schedule_ids.remove(&id);
            return Err(EngineError::DuplicatePending(existing));
        }

        let at = now_ms();
        let event = Event::ScheduleChangeRequested {
            id,
            requester_id: input.requester_id,
            role: input.role,
            branch_id: input.branch_id,
            day_of_week: input.day_of_week,
            start_time: input.start_time,
            end_time: input.end_time,
            reason: input.reason.clone(),
            at,
        };
        if let Err(e) = self.wal_append(&event).await {
            self.pending_schedule.remove_if(&claim, |_, v| *v == id);
            self.schedule_ids.remove(&id);
            return Err(e);
        }

        let request = ScheduleChangeRequest {
            id,
            requester_id: input.requester_id,
            role: input.role,
            branch_id: input.branch_id,
            day_of_week: input.day_of_week,
            start_time: input.start_time,
            end_time: input.end_time,
            reason: input.reason,
            status: ScheduleStatus::Pending,
            admin_notes: None,
            reviewer_id: None,
            requested_at: at,
            reviewed_at: None,
        };
        self.schedule_requests
            .insert(id, Arc::new(Mutex::new(request.clone())));
        info!(request = %id, requester = %request.requester_id, day = request.day_of_week, "schedule change requested");
        Ok(request)
    }

    pub async fn approve_schedule_change(
        &self,
        id: Ulid,
        actor: &Actor,
        admin_notes: Option<String>,
    ) -> Result<ScheduleChangeRequest, EngineError> {
        self.review_schedule_change(id, actor, ScheduleStatus::Approved, admin_notes)
            .await
    }

    pub async fn reject_schedule_change(
        &self,
        id: Ulid,
        actor: &Actor,
        admin_notes: Option<String>,
    ) -> Result<ScheduleChangeRequest, EngineError> {
        self.review_schedule_change(id, actor, ScheduleStatus::Rejected, admin_notes)
            .await
    }

    /// First reviewer wins: the status check and the write happen under the
    /// request's lock, so a concurrent second review sees the decision.
    pub async fn review_schedule_change(
        &self,
        id: Ulid,
        actor: &Actor,
        decision: ScheduleStatus,
        admin_notes: Option<String>,
    ) -> Result<ScheduleChangeRequest, EngineError> {
        let verb = match decision {
            ScheduleStatus::Approved => "approve",
            ScheduleStatus::Rejected => "reject",
            ScheduleStatus::Pending => "review",
        };
        if let Some(ref n) = admin_notes
            && n.chars().count() > MAX_ADMIN_NOTES_LEN
        {
            return Err(EngineError::LimitExceeded("admin notes too long"));
        }

        let _gate = self.commit_gate.read().await;
        let handle = self
            .schedule_requests
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        let mut req = handle.lock().await;
        let decision = schedule::review(actor, req.status, decision).map_err(|e| {
            debug!(request = %id, error = %e, "schedule review refused");
            EngineError::from_schedule(id, verb, e)
        })?;

        let at = now_ms();
        let event = Event::ScheduleChangeReviewed {
            id,
            decision,
            reviewer_id: actor.user_id,
            admin_notes: admin_notes.clone(),
            at,
        };
        self.wal_append(&event).await?;
        apply_review(&mut req, decision, actor.user_id, admin_notes, at);
        self.pending_schedule
            .remove_if(&(req.requester_id, req.day_of_week), |_, v| *v == id);
        if decision == ScheduleStatus::Approved {
            self.weekly
                .entry(req.requester_id)
                .or_default()
                .insert(req.day_of_week, req.slot());
        }
        let reviewed = req.clone();
        drop(req);

        info!(request = %id, status = %decision, reviewer = %actor.user_id, "schedule change reviewed");
        self.notify.send(Notice::ScheduleChange {
            request_id: id,
            requester_id: reviewed.requester_id,
            branch_id: reviewed.branch_id,
            status: decision,
        });
        Ok(reviewed)
    }

    pub async fn get_schedule_change(&self, id: Ulid) -> Result<ScheduleChangeRequest, EngineError> {
        let handle = self
            .schedule_requests
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        let req = handle.lock().await;
        Ok(req.clone())
    }

    /// Newest first.
    pub async fn list_schedule_changes(&self, status: Option<ScheduleStatus>) -> Vec<ScheduleChangeRequest> {
        let handles: Vec<_> = self.schedule_requests.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for handle in handles {
            let req = handle.lock().await;
            if status.is_none_or(|s| s == req.status) {
                out.push(req.clone());
            }
        }
        out.sort_by(|a, b| b.requested_at.cmp(&a.requested_at).then(b.id.cmp(&a.id)));
        out
    }

    /// Approved slots for one staff member, Monday first.
    pub fn weekly_schedule(&self, staff_id: Ulid) -> Vec<WeeklySlot> {
        self.weekly
            .get(&staff_id)
            .map(|days| days.values().copied().collect())
            .unwrap_or_default()
    }

    /// Replay counterpart of the two mutations above.
    pub(super) fn replay_schedule_event(&self, requests: &mut HashMap<Ulid, ScheduleChangeRequest>, event: &Event) {
        match event {
            Event::ScheduleChangeRequested {
                id,
                requester_id,
                role,
                branch_id,
                day_of_week,
                start_time,
                end_time,
                reason,
                at,
            } => {
                requests.insert(
                    *id,
                    ScheduleChangeRequest {
                        id: *id,
                        requester_id: *requester_id,
                        role: *role,
                        branch_id: *branch_id,
                        day_of_week: *day_of_week,
                        start_time: *start_time,
                        end_time: *end_time,
                        reason: reason.clone(),
                        status: ScheduleStatus::Pending,
                        admin_notes: None,
                        reviewer_id: None,
                        requested_at: *at,
                        reviewed_at: None,
                    },
                );
            }
            Event::ScheduleChangeReviewed {
                id,
                decision,
                reviewer_id,
                admin_notes,
                at,
            } => {
                if let Some(req) = requests.get_mut(id) {
                    apply_review(req, *decision, *reviewer_id, admin_notes.clone(), *at);
                    if *decision == ScheduleStatus::Approved {
                        self.weekly
                            .entry(req.requester_id)
                            .or_default()
                            .insert(req.day_of_week, req.slot());
                    }
                }
            }
            Event::ScheduleChangeRestored { request } => {
                if request.status == ScheduleStatus::Approved {
                    self.weekly
                        .entry(request.requester_id)
                        .or_default()
                        .insert(request.day_of_week, request.slot());
                }
                requests.insert(request.id, request.clone());
            }
            _ => {}
        }
    }
}
