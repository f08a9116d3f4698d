//! Negotiation types: demands, offers, proposals and rejections
//!
//! A negotiation thread is a chain of proposals linked by
//! `prev_proposal_id`. Proposals are immutable; a counter-proposal supersedes
//! its predecessor rather than modifying it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::identity::{NodeId, ProposalId, SubscriptionId};
use crate::properties::{Constraint, Properties};

/// Requestor-authored property/constraint bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Demand {
    pub requestor: NodeId,
    pub properties: Properties,
    pub constraints: Constraint,
}

impl Demand {
    pub fn new(requestor: NodeId, properties: Properties, constraints: &str) -> Result<Self> {
        Ok(Self {
            requestor,
            properties,
            constraints: Constraint::parse(constraints)?,
        })
    }

    /// Whether this demand and the offer accept each other
    pub fn matches(&self, offer: &Offer) -> bool {
        self.constraints.matches(&offer.properties) && offer.constraints.matches(&self.properties)
    }
}

/// Provider-authored property/constraint bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub provider: NodeId,
    pub properties: Properties,
    pub constraints: Constraint,
}

impl Offer {
    pub fn new(provider: NodeId, properties: Properties, constraints: &str) -> Result<Self> {
        Ok(Self {
            provider,
            properties,
            constraints: Constraint::parse(constraints)?,
        })
    }
}

/// A negotiation message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: ProposalId,
    /// Node that authored this proposal
    pub issuer: NodeId,
    /// Demand subscription the thread belongs to
    pub subscription_id: SubscriptionId,
    /// Proposal this one answers; `None` for the initial offer
    pub prev_proposal_id: Option<ProposalId>,
    pub properties: Properties,
    pub constraints: Constraint,
    pub created_at: DateTime<Utc>,
}

impl Proposal {
    pub fn is_initial(&self) -> bool {
        self.prev_proposal_id.is_none()
    }
}

/// Structured reason attached to a rejection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reason {
    pub message: String,
}

impl Reason {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Produced when a provider declines a proposal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectionRecord {
    /// The proposal that was declined; it stays in the log for later
    /// reconsideration
    pub proposal_id: ProposalId,
    pub issuer: NodeId,
    pub reason: Reason,
    pub rejected_at: DateTime<Utc>,
}

/// What a requestor sees when collecting a subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProposalEvent {
    Proposal { proposal: Proposal },
    Rejected { rejection: RejectionRecord },
}

impl ProposalEvent {
    pub fn proposal(&self) -> Option<&Proposal> {
        match self {
            Self::Proposal { proposal } => Some(proposal),
            Self::Rejected { .. } => None,
        }
    }

    pub fn rejection(&self) -> Option<&RejectionRecord> {
        match self {
            Self::Rejected { rejection } => Some(rejection),
            Self::Proposal { .. } => None,
        }
    }

    pub fn issuer(&self) -> NodeId {
        match self {
            Self::Proposal { proposal } => proposal.issuer,
            Self::Rejected { rejection } => rejection.issuer,
        }
    }
}
