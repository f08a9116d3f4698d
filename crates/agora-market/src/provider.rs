//! Provider Negotiator
//!
//! Each provider node answers requestor counter-proposals on its own:
//!
//! - free slot: answer with a counter-proposal built from its offer
//! - no slot: push a capacity rejection and retain the requestor proposal
//!
//! Retained proposals are re-offered, oldest first, once one of the
//! provider's agreements terminates.

use std::collections::VecDeque;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use agora_types::{
    capacity_reason, names, Agreement, LinearPricing, NodeId, Offer, Properties, Proposal,
    ProposalEvent, ProposalId, Reason, RejectionRecord, Result, SubscriptionId,
};

use crate::activity::ActivityPolicy;
use crate::events::MarketEvent;
use crate::lifecycle::Approval;
use crate::market::Market;

/// Provider node settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,

    /// Agreements the provider serves at once
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Advertise `golem.srv.caps.multi-activity`
    #[serde(default = "default_multi_activity")]
    pub multi_activity: bool,

    /// Live activities allowed under one multi-activity agreement
    #[serde(default = "default_max_simultaneous_activities")]
    pub max_simultaneous_activities: usize,

    #[serde(default = "default_runtime_name")]
    pub runtime_name: String,

    #[serde(default)]
    pub pricing: LinearPricing,

    /// Constraint expression the provider puts on demands
    #[serde(default)]
    pub constraints: String,

    /// Route the provider's traffic through the relay proxy
    #[serde(default)]
    pub use_proxy: bool,
}

fn default_capacity() -> usize {
    1
}

fn default_multi_activity() -> bool {
    true
}

fn default_max_simultaneous_activities() -> usize {
    1
}

fn default_runtime_name() -> String {
    "wasmtime".to_string()
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capacity: default_capacity(),
            multi_activity: default_multi_activity(),
            max_simultaneous_activities: default_max_simultaneous_activities(),
            runtime_name: default_runtime_name(),
            pricing: LinearPricing::default(),
            constraints: String::new(),
            use_proxy: false,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_multi_activity(mut self, multi_activity: bool) -> Self {
        self.multi_activity = multi_activity;
        self
    }

    pub fn with_max_simultaneous_activities(mut self, max: usize) -> Self {
        self.max_simultaneous_activities = max;
        self
    }

    pub fn with_pricing(mut self, pricing: LinearPricing) -> Self {
        self.pricing = pricing;
        self
    }
}

/// Requestor proposal held back for lack of capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetainedProposal {
    pub subscription_id: SubscriptionId,
    pub proposal_id: ProposalId,
}

pub struct ProviderNode {
    id: NodeId,
    config: ProviderConfig,
    offer: Offer,
    retained: Mutex<VecDeque<RetainedProposal>>,
}

impl ProviderNode {
    pub fn new(id: NodeId, config: ProviderConfig) -> Result<Self> {
        let properties = Properties::new()
            .with(names::NODE_NAME, config.name.as_str())
            .with(names::RUNTIME_NAME, config.runtime_name.as_str())
            .with(names::PRICING_MODEL, "linear")
            .with(names::MULTI_ACTIVITY, config.multi_activity);
        let offer = Offer::new(id, properties, &config.constraints)?;
        Ok(Self {
            id,
            config,
            offer,
            retained: Mutex::new(VecDeque::new()),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn offer(&self) -> &Offer {
        &self.offer
    }

    /// Proposals waiting for a free slot, oldest first
    pub fn retained(&self) -> Vec<RetainedProposal> {
        self.retained.lock().iter().copied().collect()
    }

    /// React to a requestor counter-proposal
    pub(crate) fn on_counter_proposal(&self, market: &Market, proposal: &Proposal) -> Result<()> {
        if market.admission().has_capacity(&self.id) {
            self.answer(market, proposal)?;
            return Ok(());
        }

        let reason = capacity_reason(market.admission().capacity(&self.id));
        market.store().push_event(
            &proposal.subscription_id,
            ProposalEvent::Rejected {
                rejection: RejectionRecord {
                    proposal_id: proposal.id,
                    issuer: self.id,
                    reason: Reason::new(reason.clone()),
                    rejected_at: Utc::now(),
                },
            },
        );
        market.events().emit(MarketEvent::ProposalRejected {
            provider: self.id,
            requestor: proposal.issuer,
            proposal_id: proposal.id,
            reason: reason.clone(),
            timestamp: Utc::now(),
        });
        info!(
            provider = %self.config.name,
            proposal_id = %proposal.id,
            %reason,
            "Proposal rejected"
        );
        self.retain(proposal.subscription_id, proposal.id);
        Ok(())
    }

    /// Approve a requestor-confirmed agreement through the admission controller
    pub(crate) fn on_agreement_confirmed(
        &self,
        market: &Market,
        agreement: &Agreement,
    ) -> Result<Agreement> {
        match market.lifecycle().approve(&agreement.id, market.admission())? {
            Approval::Approved(approved) => {
                market.activities().register(
                    approved.id,
                    ActivityPolicy {
                        multi_activity: approved.multi_activity,
                        max_simultaneous: self.config.max_simultaneous_activities,
                    },
                );
                market.events().emit(MarketEvent::AgreementApproved {
                    provider: self.id,
                    requestor: approved.requestor,
                    agreement_id: approved.id,
                    timestamp: Utc::now(),
                });
                Ok(approved)
            }
            Approval::Rejected(rejected, err) => {
                market.events().emit(MarketEvent::AgreementRejected {
                    provider: self.id,
                    requestor: rejected.requestor,
                    agreement_id: rejected.id,
                    reason: rejected.reason.clone().unwrap_or_default(),
                    timestamp: Utc::now(),
                });
                let demand = market.store().get(&rejected.demand_proposal_id)?;
                self.retain(demand.subscription_id, demand.id);
                Err(err)
            }
        }
    }

    /// Bill the agreement and re-offer retained proposals
    pub(crate) fn on_agreement_terminated(&self, market: &Market, agreement: &Agreement) {
        let batches = market.exeunit().completed_batches(&agreement.id);
        let amount = self.config.pricing.cost(batches);
        match market.ledger().issue_invoice(agreement, amount) {
            Ok(invoice) => market.events().emit(MarketEvent::InvoiceIssued {
                provider: self.id,
                requestor: agreement.requestor,
                agreement_id: agreement.id,
                invoice_id: invoice.id,
                amount,
                timestamp: Utc::now(),
            }),
            Err(e) => warn!(agreement_id = %agreement.id, error = %e, "Failed to issue invoice"),
        }

        self.reoffer_retained(market);
    }

    fn reoffer_retained(&self, market: &Market) {
        if !market.admission().has_capacity(&self.id) {
            return;
        }
        let retained: Vec<RetainedProposal> = self.retained.lock().drain(..).collect();
        for entry in retained {
            if !market.store().is_live(&entry.subscription_id) {
                debug!(
                    proposal_id = %entry.proposal_id,
                    "Dropping retained proposal of closed subscription"
                );
                continue;
            }
            let result = market
                .store()
                .get(&entry.proposal_id)
                .and_then(|proposal| self.answer(market, &proposal));
            match result {
                Ok(answer) => info!(
                    provider = %self.config.name,
                    proposal_id = %entry.proposal_id,
                    answer_id = %answer.id,
                    "Retained proposal re-offered"
                ),
                Err(e) => warn!(
                    proposal_id = %entry.proposal_id,
                    error = %e,
                    "Failed to re-offer proposal"
                ),
            }
        }
    }

    fn answer(&self, market: &Market, proposal: &Proposal) -> Result<Proposal> {
        let multi_activity = self.config.multi_activity && proposal.properties.multi_activity();
        let properties = self
            .offer
            .properties
            .clone()
            .with(names::MULTI_ACTIVITY, multi_activity);
        let answer = market.store().counter(
            proposal.subscription_id,
            proposal.id,
            self.id,
            properties,
            self.offer.constraints.clone(),
        )?;

        market.events().emit(MarketEvent::ProposalAccepted {
            provider: self.id,
            requestor: proposal.issuer,
            proposal_id: proposal.id,
            timestamp: Utc::now(),
        });
        market.store().push_event(
            &proposal.subscription_id,
            ProposalEvent::Proposal {
                proposal: answer.clone(),
            },
        );
        Ok(answer)
    }

    fn retain(&self, subscription_id: SubscriptionId, proposal_id: ProposalId) {
        let mut retained = self.retained.lock();
        if retained.iter().any(|r| r.proposal_id == proposal_id) {
            return;
        }
        retained.push_back(RetainedProposal {
            subscription_id,
            proposal_id,
        });
        debug!(provider = %self.config.name, proposal_id = %proposal_id, "Proposal retained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_properties() {
        let node = ProviderNode::new(NodeId::new(), ProviderConfig::new("provider-1")).unwrap();
        let props = &node.offer().properties;
        assert_eq!(props.get_str(names::RUNTIME_NAME), Some("wasmtime"));
        assert_eq!(props.get_str(names::PRICING_MODEL), Some("linear"));
        assert!(props.multi_activity());
    }

    #[test]
    fn test_config_defaults_from_yaml_like_json() {
        let config: ProviderConfig = serde_json::from_str(r#"{"name": "provider-2"}"#).unwrap();
        assert_eq!(config.capacity, 1);
        assert_eq!(config.max_simultaneous_activities, 1);
        assert!(config.multi_activity);
        assert!(!config.use_proxy);
    }

    #[test]
    fn test_invalid_constraints_rejected() {
        let mut config = ProviderConfig::new("provider-3");
        config.constraints = "(golem.runtime.name=".to_string();
        assert!(ProviderNode::new(NodeId::new(), config).is_err());
    }
}
