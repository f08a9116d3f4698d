//! Agreement Lifecycle State Machine
//!
//! ```text
//! Proposed ──confirm──► Pending ──approve──► Approved ──terminate──► Terminated
//!                          │
//!                          └──no capacity──► Rejected
//! ```
//!
//! Approval goes through [`AgreementAdmission`]; termination releases the
//! slot and closes the agreement to new activities.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::info;

use agora_types::{
    Agreement, AgreementId, AgreementState, MarketError, NodeId, Party, Proposal, Result,
};

use crate::activity::ActivityAdmission;
use crate::admission::{AgreementAdmission, AgreementProposal};

/// Outcome of a provider approval attempt
#[derive(Debug, Clone)]
pub enum Approval {
    Approved(Agreement),
    Rejected(Agreement, MarketError),
}

#[derive(Debug, Default)]
pub struct AgreementLifecycle {
    agreements: RwLock<HashMap<AgreementId, Agreement>>,
}

impl AgreementLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an agreement from a requestor proposal and the provider's answer
    ///
    /// The provider proposal may back a new agreement only while no other
    /// non-rejected agreement uses it.
    pub fn create(
        &self,
        demand_proposal: &Proposal,
        offer_proposal: &Proposal,
        multi_activity: bool,
    ) -> Result<Agreement> {
        let mut agreements = self.agreements.write();

        if agreements.values().any(|a| {
            a.offer_proposal_id == offer_proposal.id && a.state != AgreementState::Rejected
        }) {
            return Err(MarketError::protocol(
                offer_proposal.id,
                "proposal already backs an agreement",
            ));
        }

        let agreement = Agreement {
            id: AgreementId::new(),
            requestor: demand_proposal.issuer,
            provider: offer_proposal.issuer,
            demand_proposal_id: demand_proposal.id,
            offer_proposal_id: offer_proposal.id,
            multi_activity,
            state: AgreementState::Proposed,
            created_at: Utc::now(),
            approved_at: None,
            terminated_at: None,
            terminated_by: None,
            reason: None,
        };
        agreements.insert(agreement.id, agreement.clone());

        info!(
            agreement_id = %agreement.id,
            requestor = %agreement.requestor,
            provider = %agreement.provider,
            multi_activity,
            "Agreement proposed"
        );
        Ok(agreement)
    }

    /// Requestor half of the two-phase commit
    pub fn confirm(&self, agreement_id: &AgreementId, requestor: &NodeId) -> Result<Agreement> {
        let mut agreements = self.agreements.write();
        let agreement = lookup_mut(&mut agreements, agreement_id)?;
        if agreement.requestor != *requestor {
            return Err(MarketError::protocol(agreement_id, "not the agreement requestor"));
        }
        transition(agreement, AgreementState::Pending)?;
        info!(agreement_id = %agreement_id, "Agreement confirmed by requestor");
        Ok(agreement.clone())
    }

    /// Provider half of the two-phase commit
    ///
    /// Reserves a capacity slot; when none is free the agreement moves to
    /// `Rejected` and the capacity error is returned alongside it.
    pub fn approve(
        &self,
        agreement_id: &AgreementId,
        admission: &AgreementAdmission,
    ) -> Result<Approval> {
        let mut agreements = self.agreements.write();
        let agreement = lookup_mut(&mut agreements, agreement_id)?;
        if agreement.state != AgreementState::Pending {
            return Err(MarketError::protocol(
                agreement_id,
                format!("cannot approve agreement in state {}", agreement.state),
            ));
        }

        let request = AgreementProposal {
            agreement_id: *agreement_id,
            provider: agreement.provider,
        };
        match admission.confirm(&request) {
            Ok(approved) => {
                transition(agreement, AgreementState::Approved)?;
                agreement.approved_at = Some(Utc::now());
                info!(
                    agreement_id = %agreement_id,
                    provider = %agreement.provider,
                    active = approved.active,
                    "Agreement approved"
                );
                Ok(Approval::Approved(agreement.clone()))
            }
            Err(rejected) => {
                transition(agreement, AgreementState::Rejected)?;
                agreement.reason = Some(rejected.reason.message.clone());
                Ok(Approval::Rejected(agreement.clone(), rejected.into()))
            }
        }
    }

    /// Terminate an approved agreement and release its slot
    ///
    /// Refused while any activity is live under the agreement.
    pub fn terminate(
        &self,
        agreement_id: &AgreementId,
        by: Party,
        reason: Option<String>,
        activities: &ActivityAdmission,
        admission: &AgreementAdmission,
    ) -> Result<Agreement> {
        let mut agreements = self.agreements.write();
        let agreement = lookup_mut(&mut agreements, agreement_id)?;
        if !agreement.state.can_transition_to(AgreementState::Terminated) {
            return Err(MarketError::protocol(
                agreement_id,
                format!("cannot terminate agreement in state {}", agreement.state),
            ));
        }
        activities.close_if_idle(agreement_id)?;

        transition(agreement, AgreementState::Terminated)?;
        agreement.terminated_at = Some(Utc::now());
        agreement.terminated_by = Some(by);
        agreement.reason = reason;
        admission.release(&agreement.provider, agreement_id);

        info!(
            agreement_id = %agreement_id,
            provider = %agreement.provider,
            by = ?by,
            "Agreement terminated"
        );
        Ok(agreement.clone())
    }

    pub fn get(&self, agreement_id: &AgreementId) -> Result<Agreement> {
        self.agreements
            .read()
            .get(agreement_id)
            .cloned()
            .ok_or_else(|| not_found(agreement_id))
    }

    /// Agreements in `state`, oldest first
    pub fn list_by_state(&self, state: AgreementState) -> Vec<Agreement> {
        let mut list: Vec<Agreement> = self
            .agreements
            .read()
            .values()
            .filter(|a| a.state == state)
            .cloned()
            .collect();
        list.sort_by_key(|a| a.created_at);
        list
    }
}

fn lookup_mut<'a>(
    agreements: &'a mut HashMap<AgreementId, Agreement>,
    agreement_id: &AgreementId,
) -> Result<&'a mut Agreement> {
    agreements
        .get_mut(agreement_id)
        .ok_or_else(|| not_found(agreement_id))
}

fn transition(agreement: &mut Agreement, next: AgreementState) -> Result<()> {
    if !agreement.state.can_transition_to(next) {
        return Err(MarketError::protocol(
            agreement.id,
            format!("illegal transition {} -> {}", agreement.state, next),
        ));
    }
    agreement.state = next;
    Ok(())
}

fn not_found(agreement_id: &AgreementId) -> MarketError {
    MarketError::AgreementNotFound {
        agreement_id: agreement_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityPolicy;
    use agora_types::{Constraint, ProposalId, Properties, SubscriptionId};

    struct Fixture {
        lifecycle: AgreementLifecycle,
        admission: AgreementAdmission,
        activities: ActivityAdmission,
        requestor: NodeId,
        provider: NodeId,
    }

    impl Fixture {
        fn new(capacity: usize) -> Self {
            let provider = NodeId::new();
            let admission = AgreementAdmission::new();
            admission.register_provider(provider, capacity);
            Self {
                lifecycle: AgreementLifecycle::new(),
                admission,
                activities: ActivityAdmission::new(),
                requestor: NodeId::new(),
                provider,
            }
        }

        fn proposal(&self, issuer: NodeId) -> Proposal {
            Proposal {
                id: ProposalId::new(),
                issuer,
                subscription_id: SubscriptionId::new(),
                prev_proposal_id: None,
                properties: Properties::new(),
                constraints: Constraint::Any,
                created_at: Utc::now(),
            }
        }

        fn proposed(&self) -> Agreement {
            let demand = self.proposal(self.requestor);
            let offer = self.proposal(self.provider);
            self.lifecycle.create(&demand, &offer, false).unwrap()
        }
    }

    #[test]
    fn test_full_lifecycle() {
        let fx = Fixture::new(1);
        let agreement = fx.proposed();
        assert_eq!(agreement.state, AgreementState::Proposed);

        let pending = fx.lifecycle.confirm(&agreement.id, &fx.requestor).unwrap();
        assert_eq!(pending.state, AgreementState::Pending);

        let approved = match fx.lifecycle.approve(&agreement.id, &fx.admission).unwrap() {
            Approval::Approved(a) => a,
            Approval::Rejected(_, err) => panic!("unexpected rejection: {err}"),
        };
        assert!(approved.is_active());
        assert_eq!(fx.admission.active_count(&fx.provider), 1);

        fx.activities.register(
            agreement.id,
            ActivityPolicy {
                multi_activity: false,
                max_simultaneous: 1,
            },
        );
        let terminated = fx
            .lifecycle
            .terminate(
                &agreement.id,
                Party::Requestor,
                Some("done".into()),
                &fx.activities,
                &fx.admission,
            )
            .unwrap();
        assert_eq!(terminated.state, AgreementState::Terminated);
        assert_eq!(terminated.terminated_by, Some(Party::Requestor));
        assert_eq!(fx.admission.active_count(&fx.provider), 0);
    }

    #[test]
    fn test_rejected_when_slot_taken() {
        let fx = Fixture::new(1);
        let a = fx.proposed();
        let b = fx.proposed();

        fx.lifecycle.confirm(&a.id, &fx.requestor).unwrap();
        fx.lifecycle.confirm(&b.id, &fx.requestor).unwrap();
        assert!(matches!(
            fx.lifecycle.approve(&a.id, &fx.admission).unwrap(),
            Approval::Approved(_)
        ));
        match fx.lifecycle.approve(&b.id, &fx.admission).unwrap() {
            Approval::Rejected(agreement, err) => {
                assert_eq!(agreement.state, AgreementState::Rejected);
                assert_eq!(
                    agreement.reason.as_deref(),
                    Some("No capacity available. Reached Agreements limit: 1")
                );
                assert!(matches!(err, MarketError::CapacityExceeded { limit: 1, .. }));
            }
            Approval::Approved(_) => panic!("second agreement must be rejected"),
        }
    }

    #[test]
    fn test_illegal_transitions() {
        let fx = Fixture::new(1);
        let agreement = fx.proposed();

        // approve before confirm
        assert!(fx.lifecycle.approve(&agreement.id, &fx.admission).is_err());
        // terminate before approval
        let err = fx
            .lifecycle
            .terminate(&agreement.id, Party::Provider, None, &fx.activities, &fx.admission)
            .unwrap_err();
        assert!(matches!(err, MarketError::ProtocolViolation { .. }));
        // wrong requestor
        assert!(fx.lifecycle.confirm(&agreement.id, &NodeId::new()).is_err());
        // double confirm
        fx.lifecycle.confirm(&agreement.id, &fx.requestor).unwrap();
        assert!(fx.lifecycle.confirm(&agreement.id, &fx.requestor).is_err());
    }

    #[test]
    fn test_terminate_refused_while_activity_live() {
        let fx = Fixture::new(1);
        let agreement = fx.proposed();
        fx.lifecycle.confirm(&agreement.id, &fx.requestor).unwrap();
        fx.lifecycle.approve(&agreement.id, &fx.admission).unwrap();
        fx.activities.register(
            agreement.id,
            ActivityPolicy {
                multi_activity: true,
                max_simultaneous: 1,
            },
        );
        let activity = fx.activities.create(&agreement.id).unwrap();

        assert!(fx
            .lifecycle
            .terminate(&agreement.id, Party::Requestor, None, &fx.activities, &fx.admission)
            .is_err());
        assert_eq!(fx.lifecycle.get(&agreement.id).unwrap().state, AgreementState::Approved);

        fx.activities.destroy(&activity.id).unwrap();
        fx.lifecycle
            .terminate(&agreement.id, Party::Requestor, None, &fx.activities, &fx.admission)
            .unwrap();
    }

    #[test]
    fn test_offer_proposal_reusable_only_after_rejection() {
        let fx = Fixture::new(1);
        let demand = fx.proposal(fx.requestor);
        let offer = fx.proposal(fx.provider);

        let first = fx.lifecycle.create(&demand, &offer, false).unwrap();
        assert!(fx.lifecycle.create(&demand, &offer, false).is_err());

        // Fill the slot so the first agreement gets rejected
        let blocker = fx.proposed();
        fx.lifecycle.confirm(&blocker.id, &fx.requestor).unwrap();
        fx.lifecycle.approve(&blocker.id, &fx.admission).unwrap();
        fx.lifecycle.confirm(&first.id, &fx.requestor).unwrap();
        fx.lifecycle.approve(&first.id, &fx.admission).unwrap();
        assert_eq!(fx.lifecycle.get(&first.id).unwrap().state, AgreementState::Rejected);

        assert!(fx.lifecycle.create(&demand, &offer, false).is_ok());
    }
}
