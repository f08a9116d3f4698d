//! Agreement types
//!
//! An agreement binds one requestor proposal and one provider proposal into a
//! contract. Approval is a two-phase commit: the requestor confirms
//! (`Pending`), then the provider approves (`Approved`) or rejects for
//! capacity (`Rejected`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::identity::{AgreementId, NodeId, ProposalId};

/// Agreement lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgreementState {
    /// Created from a proposal pair, not yet confirmed
    Proposed,
    /// Confirmed by the requestor, awaiting provider approval
    Pending,
    Approved,
    /// Provider declined at approval time (absorbing)
    Rejected,
    /// Terminated by either party (absorbing)
    Terminated,
}

impl AgreementState {
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Rejected | Self::Terminated)
    }

    /// Whether a transition from `self` to `next` is part of the lifecycle
    pub fn can_transition_to(&self, next: AgreementState) -> bool {
        use AgreementState::*;
        matches!(
            (self, next),
            (Proposed, Pending) | (Pending, Approved) | (Pending, Rejected) | (Approved, Terminated)
        )
    }
}

impl fmt::Display for AgreementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Which side of the agreement acted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Party {
    Requestor,
    Provider,
}

/// Contract between one requestor and one provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agreement {
    pub id: AgreementId,
    pub requestor: NodeId,
    pub provider: NodeId,
    /// Requestor-side proposal the provider answered
    pub demand_proposal_id: ProposalId,
    /// Provider-side proposal the agreement was created from
    pub offer_proposal_id: ProposalId,
    /// Both sides declared the multi-activity capability
    pub multi_activity: bool,
    pub state: AgreementState,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub terminated_by: Option<Party>,
    /// Termination or rejection reason
    pub reason: Option<String>,
}

impl Agreement {
    pub fn is_active(&self) -> bool {
        self.state == AgreementState::Approved
    }
}
