//! Activity Admission Controller
//!
//! Bounds how many activities may run at once under one agreement. An
//! agreement without the multi-activity capability runs at most one; a
//! multi-activity agreement runs at most the provider's simultaneous limit,
//! which defaults to one (sequential reuse of the same agreement).

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use agora_types::{Activity, ActivityId, ActivityState, AgreementId, MarketError, Result};

/// Limits recorded when an agreement is approved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityPolicy {
    pub multi_activity: bool,
    pub max_simultaneous: usize,
}

impl ActivityPolicy {
    pub fn limit(&self) -> usize {
        if self.multi_activity {
            self.max_simultaneous.max(1)
        } else {
            1
        }
    }
}

#[derive(Debug)]
struct AgreementSlot {
    policy: ActivityPolicy,
    live: Vec<ActivityId>,
    created_total: u64,
    closed: bool,
}

#[derive(Debug, Default)]
struct ActivityTable {
    agreements: HashMap<AgreementId, AgreementSlot>,
    activities: HashMap<ActivityId, Activity>,
}

#[derive(Debug, Default)]
pub struct ActivityAdmission {
    table: Mutex<ActivityTable>,
}

impl ActivityAdmission {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an approved agreement for activities
    pub fn register(&self, agreement_id: AgreementId, policy: ActivityPolicy) {
        let mut table = self.table.lock();
        table.agreements.insert(
            agreement_id,
            AgreementSlot {
                policy,
                live: Vec::new(),
                created_total: 0,
                closed: false,
            },
        );
        debug!(
            agreement_id = %agreement_id,
            limit = policy.limit(),
            "Agreement open for activities"
        );
    }

    /// Create an activity if the agreement is below its limit
    pub fn create(&self, agreement_id: &AgreementId) -> Result<Activity> {
        let mut table = self.table.lock();
        let slot = table
            .agreements
            .get_mut(agreement_id)
            .ok_or_else(|| MarketError::protocol(agreement_id, "agreement is not approved"))?;

        if slot.closed {
            return Err(MarketError::protocol(agreement_id, "agreement is terminated"));
        }

        let limit = slot.policy.limit();
        if slot.live.len() >= limit {
            let reason = if limit == 1 {
                "Only single Activity allowed".to_string()
            } else {
                format!("Reached Activities limit: {}", limit)
            };
            let err = MarketError::ActivityConflict {
                agreement_id: agreement_id.to_string(),
                reason,
                message: format!("Can't create {} simultaneous Activities.", limit + 1),
            };
            warn!(agreement_id = %agreement_id, live = slot.live.len(), "{}", err);
            return Err(err);
        }

        let activity = Activity {
            id: ActivityId::new(),
            agreement_id: *agreement_id,
            state: ActivityState::Created,
            created_at: Utc::now(),
            destroyed_at: None,
        };
        slot.live.push(activity.id);
        slot.created_total += 1;
        table.activities.insert(activity.id, activity.clone());

        info!(activity_id = %activity.id, agreement_id = %agreement_id, "Activity created");
        Ok(activity)
    }

    /// Destroy a live activity, freeing its place under the agreement
    pub fn destroy(&self, activity_id: &ActivityId) -> Result<Activity> {
        let mut table = self.table.lock();
        let activity = table
            .activities
            .get_mut(activity_id)
            .ok_or_else(|| MarketError::ActivityNotFound {
                activity_id: activity_id.to_string(),
            })?;

        if activity.state == ActivityState::Destroyed {
            return Err(MarketError::protocol(activity_id, "activity already destroyed"));
        }
        activity.state = ActivityState::Destroyed;
        activity.destroyed_at = Some(Utc::now());
        let destroyed = activity.clone();

        if let Some(slot) = table.agreements.get_mut(&destroyed.agreement_id) {
            slot.live.retain(|id| id != activity_id);
        }

        info!(
            activity_id = %activity_id,
            agreement_id = %destroyed.agreement_id,
            "Activity destroyed"
        );
        Ok(destroyed)
    }

    /// Close the agreement to new activities unless one is still live
    pub fn close_if_idle(&self, agreement_id: &AgreementId) -> Result<()> {
        let mut table = self.table.lock();
        if let Some(slot) = table.agreements.get_mut(agreement_id) {
            if !slot.live.is_empty() {
                return Err(MarketError::protocol(
                    agreement_id,
                    format!("{} activities still running", slot.live.len()),
                ));
            }
            slot.closed = true;
        }
        Ok(())
    }

    pub fn get(&self, activity_id: &ActivityId) -> Result<Activity> {
        self.table
            .lock()
            .activities
            .get(activity_id)
            .cloned()
            .ok_or_else(|| MarketError::ActivityNotFound {
                activity_id: activity_id.to_string(),
            })
    }

    pub fn live_count(&self, agreement_id: &AgreementId) -> usize {
        self.table
            .lock()
            .agreements
            .get(agreement_id)
            .map(|s| s.live.len())
            .unwrap_or(0)
    }

    /// Activities ever created under the agreement
    pub fn created_total(&self, agreement_id: &AgreementId) -> u64 {
        self.table
            .lock()
            .agreements
            .get(agreement_id)
            .map(|s| s.created_total)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SINGLE: ActivityPolicy = ActivityPolicy {
        multi_activity: false,
        max_simultaneous: 1,
    };

    #[test]
    fn test_second_simultaneous_activity_rejected() {
        let admission = ActivityAdmission::new();
        let agreement = AgreementId::new();
        admission.register(agreement, SINGLE);

        let first = admission.create(&agreement).unwrap();
        let err = admission.create(&agreement).unwrap_err();
        assert!(err.to_string().ends_with(
            "terminated. Reason: Only single Activity allowed, message: Can't create 2 simultaneous Activities."
        ));

        admission.destroy(&first.id).unwrap();
        assert!(admission.create(&agreement).is_ok());
    }

    #[test]
    fn test_multi_activity_sequential_reuse() {
        let admission = ActivityAdmission::new();
        let agreement = AgreementId::new();
        admission.register(
            agreement,
            ActivityPolicy {
                multi_activity: true,
                max_simultaneous: 1,
            },
        );

        for _ in 0..3 {
            let activity = admission.create(&agreement).unwrap();
            assert_eq!(admission.live_count(&agreement), 1);
            admission.destroy(&activity.id).unwrap();
        }
        assert_eq!(admission.created_total(&agreement), 3);
        assert_eq!(admission.live_count(&agreement), 0);
    }

    #[test]
    fn test_multi_activity_limit_above_one() {
        let admission = ActivityAdmission::new();
        let agreement = AgreementId::new();
        admission.register(
            agreement,
            ActivityPolicy {
                multi_activity: true,
                max_simultaneous: 2,
            },
        );

        admission.create(&agreement).unwrap();
        admission.create(&agreement).unwrap();
        match admission.create(&agreement).unwrap_err() {
            MarketError::ActivityConflict { reason, message, .. } => {
                assert_eq!(reason, "Reached Activities limit: 2");
                assert_eq!(message, "Can't create 3 simultaneous Activities.");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_double_destroy_is_protocol_violation() {
        let admission = ActivityAdmission::new();
        let agreement = AgreementId::new();
        admission.register(agreement, SINGLE);
        let activity = admission.create(&agreement).unwrap();

        admission.destroy(&activity.id).unwrap();
        let err = admission.destroy(&activity.id).unwrap_err();
        assert!(matches!(err, MarketError::ProtocolViolation { .. }));
    }

    #[test]
    fn test_destroy_unknown_activity_not_found() {
        let admission = ActivityAdmission::new();
        let agreement = AgreementId::new();
        admission.register(agreement, SINGLE);

        let unknown = ActivityId::new();
        match admission.destroy(&unknown).unwrap_err() {
            MarketError::ActivityNotFound { activity_id } => {
                assert_eq!(activity_id, unknown.to_string());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(admission.live_count(&agreement), 0);
    }

    #[test]
    fn test_close_blocks_new_activities() {
        let admission = ActivityAdmission::new();
        let agreement = AgreementId::new();
        admission.register(agreement, SINGLE);

        let activity = admission.create(&agreement).unwrap();
        assert!(admission.close_if_idle(&agreement).is_err());
        admission.destroy(&activity.id).unwrap();
        admission.close_if_idle(&agreement).unwrap();

        let err = admission.create(&agreement).unwrap_err();
        assert!(matches!(err, MarketError::ProtocolViolation { .. }));
    }

    #[test]
    fn test_unapproved_agreement_rejected() {
        let admission = ActivityAdmission::new();
        let err = admission.create(&AgreementId::new()).unwrap_err();
        assert!(matches!(err, MarketError::ProtocolViolation { .. }));
    }
}
