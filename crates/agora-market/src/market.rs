//! Market network
//!
//! Wires the proposal store, both admission controllers, the agreement
//! lifecycle, the exe-unit simulator and the payment ledger together, and
//! hosts the provider negotiators. Requestors talk to it through
//! [`Requestor`](crate::api::Requestor) handles.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use agora_types::{
    Activity, ActivityId, ActivityState, Agreement, AgreementId, AgreementState, Allocation,
    AllocationId, BatchId, Demand, ExeScript, Invoice, InvoiceId, MarketError, NodeId, Party,
    Properties, ProposalEvent, ProposalId, Result, SubscriptionId,
};

use crate::activity::ActivityAdmission;
use crate::admission::AgreementAdmission;
use crate::api::Requestor;
use crate::events::{EventHub, MarketEvent, Probe};
use crate::exeunit::ExeUnitSimulator;
use crate::lifecycle::AgreementLifecycle;
use crate::payment::PaymentLedger;
use crate::provider::{ProviderConfig, ProviderNode};
use crate::store::ProposalStore;

/// Market-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    /// Extra one-way delay for nodes routed through the relay proxy
    #[serde(default = "default_proxy_latency_ms")]
    pub proxy_latency_ms: u64,

    /// Delay between two exec commands
    #[serde(default = "default_command_delay_ms")]
    pub command_delay_ms: u64,

    /// Interval for polling agreement approval and invoices
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

fn default_proxy_latency_ms() -> u64 {
    5
}

fn default_command_delay_ms() -> u64 {
    10
}

fn default_poll_interval_ms() -> u64 {
    10
}

fn default_event_channel_capacity() -> usize {
    1000
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            proxy_latency_ms: default_proxy_latency_ms(),
            command_delay_ms: default_command_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

impl MarketConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Copy)]
struct RequestorInfo {
    use_proxy: bool,
}

pub struct Market {
    config: MarketConfig,
    store: ProposalStore,
    admission: AgreementAdmission,
    activities: ActivityAdmission,
    lifecycle: AgreementLifecycle,
    events: Arc<EventHub>,
    exeunit: ExeUnitSimulator,
    ledger: PaymentLedger,
    providers: DashMap<NodeId, Arc<ProviderNode>>,
    requestors: DashMap<NodeId, RequestorInfo>,
}

impl Market {
    pub fn new(config: MarketConfig) -> Arc<Self> {
        info!(
            proxy_latency_ms = config.proxy_latency_ms,
            command_delay_ms = config.command_delay_ms,
            "Creating market"
        );
        Arc::new(Self {
            events: Arc::new(EventHub::new(config.event_channel_capacity)),
            exeunit: ExeUnitSimulator::new(Duration::from_millis(config.command_delay_ms)),
            store: ProposalStore::new(),
            admission: AgreementAdmission::new(),
            activities: ActivityAdmission::new(),
            lifecycle: AgreementLifecycle::new(),
            ledger: PaymentLedger::new(),
            providers: DashMap::new(),
            requestors: DashMap::new(),
            config,
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn config(&self) -> &MarketConfig {
        &self.config
    }

    pub fn store(&self) -> &ProposalStore {
        &self.store
    }

    pub fn admission(&self) -> &AgreementAdmission {
        &self.admission
    }

    pub fn activities(&self) -> &ActivityAdmission {
        &self.activities
    }

    pub fn lifecycle(&self) -> &AgreementLifecycle {
        &self.lifecycle
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    pub fn exeunit(&self) -> &ExeUnitSimulator {
        &self.exeunit
    }

    pub fn ledger(&self) -> &PaymentLedger {
        &self.ledger
    }

    /// Event observer scoped to `node`
    pub fn probe(&self, node: NodeId) -> Probe {
        self.events.probe(node)
    }

    pub fn provider(&self, provider: &NodeId) -> Result<Arc<ProviderNode>> {
        self.providers
            .get(provider)
            .map(|p| p.clone())
            .ok_or_else(|| MarketError::ProviderNotFound {
                provider: provider.to_string(),
            })
    }

    /// One-way delay applied to round trips issued by `node`
    pub fn latency_for(&self, node: &NodeId) -> Duration {
        let proxied = self
            .requestors
            .get(node)
            .map(|r| r.use_proxy)
            .or_else(|| self.providers.get(node).map(|p| p.config().use_proxy))
            .unwrap_or(false);
        if proxied {
            Duration::from_millis(self.config.proxy_latency_ms)
        } else {
            Duration::ZERO
        }
    }

    // ========================================================================
    // Node Registration
    // ========================================================================

    /// Start a provider node and publish its offer
    ///
    /// The offer is proposed to every live demand it matches.
    pub fn add_provider(&self, config: ProviderConfig) -> Result<NodeId> {
        let id = NodeId::new();
        let node = Arc::new(ProviderNode::new(id, config)?);
        self.admission.register_provider(id, node.config().capacity);
        self.providers.insert(id, node.clone());

        info!(provider = %id, name = %node.config().name, "Offer subscribed");
        self.events.emit(MarketEvent::OfferSubscribed {
            provider: id,
            timestamp: Utc::now(),
        });

        for (subscription_id, demand) in self.store.live_subscriptions() {
            self.propose_offer(&node, subscription_id, &demand)?;
        }
        Ok(id)
    }

    /// Register a requestor node and hand out its API handle
    pub fn add_requestor(
        self: &Arc<Self>,
        name: impl Into<String>,
        use_proxy: bool,
    ) -> Requestor {
        let id = NodeId::new();
        let name = name.into();
        self.requestors.insert(id, RequestorInfo { use_proxy });
        info!(requestor = %id, name = %name, use_proxy, "Requestor joined");
        Requestor::new(id, name, self.clone())
    }

    fn propose_offer(
        &self,
        node: &ProviderNode,
        subscription_id: SubscriptionId,
        demand: &Demand,
    ) -> Result<()> {
        if !demand.matches(node.offer()) {
            return Ok(());
        }
        let proposal = self.store.record_initial(
            subscription_id,
            node.id(),
            node.offer().properties.clone(),
            node.offer().constraints.clone(),
        )?;
        self.store
            .push_event(&subscription_id, ProposalEvent::Proposal { proposal });
        Ok(())
    }

    // ========================================================================
    // Negotiation
    // ========================================================================

    /// Publish a demand and queue an initial proposal from every matching offer
    pub fn subscribe_demand(
        &self,
        requestor: NodeId,
        properties: Properties,
        constraints: &str,
    ) -> Result<SubscriptionId> {
        let demand = Demand::new(requestor, properties, constraints)?;
        let subscription_id = self.store.submit(demand.clone());
        self.events.emit(MarketEvent::DemandSubscribed {
            requestor,
            subscription_id,
            timestamp: Utc::now(),
        });

        let providers: Vec<Arc<ProviderNode>> =
            self.providers.iter().map(|p| p.clone()).collect();
        for node in providers {
            self.propose_offer(&node, subscription_id, &demand)?;
        }
        info!(
            requestor = %requestor,
            subscription_id = %subscription_id,
            "Demand subscribed"
        );
        Ok(subscription_id)
    }

    /// Counter a provider proposal with the subscription's demand
    pub fn counter_proposal(
        &self,
        requestor: NodeId,
        subscription_id: SubscriptionId,
        proposal_id: ProposalId,
    ) -> Result<ProposalId> {
        let demand = self.owned_demand(&requestor, &subscription_id)?;
        let offer = self.store.get(&proposal_id)?;
        let provider = self.provider(&offer.issuer)?;

        let counter = self.store.counter(
            subscription_id,
            proposal_id,
            requestor,
            demand.properties,
            demand.constraints,
        )?;
        provider.on_counter_proposal(self, &counter)?;
        Ok(counter.id)
    }

    pub fn unsubscribe_demand(
        &self,
        requestor: NodeId,
        subscription_id: SubscriptionId,
    ) -> Result<()> {
        self.owned_demand(&requestor, &subscription_id)?;
        self.store.unsubscribe(&subscription_id)
    }

    fn owned_demand(
        &self,
        requestor: &NodeId,
        subscription_id: &SubscriptionId,
    ) -> Result<Demand> {
        let demand = self.store.demand(subscription_id)?;
        if demand.requestor != *requestor {
            return Err(MarketError::protocol(
                subscription_id,
                "subscription owned by another node",
            ));
        }
        Ok(demand)
    }

    // ========================================================================
    // Agreements
    // ========================================================================

    /// Create an agreement from a provider's answer to one of our proposals
    pub fn create_agreement(
        &self,
        requestor: NodeId,
        proposal_id: ProposalId,
    ) -> Result<AgreementId> {
        let offer = self.store.get(&proposal_id)?;
        self.provider(&offer.issuer).map_err(|_| {
            MarketError::protocol(proposal_id, "proposal was not issued by a provider")
        })?;
        let demand_id = offer.prev_proposal_id.ok_or_else(|| {
            MarketError::protocol(proposal_id, "initial proposal must be countered first")
        })?;
        let demand = self.store.get(&demand_id)?;
        if demand.issuer != requestor {
            return Err(MarketError::protocol(proposal_id, "proposal answers another node"));
        }

        let multi_activity =
            offer.properties.multi_activity() && demand.properties.multi_activity();
        Ok(self.lifecycle.create(&demand, &offer, multi_activity)?.id)
    }

    /// Requestor confirmation followed by provider approval
    pub fn confirm_agreement(
        &self,
        requestor: NodeId,
        agreement_id: AgreementId,
    ) -> Result<Agreement> {
        let agreement = self.lifecycle.confirm(&agreement_id, &requestor)?;
        let provider = self.provider(&agreement.provider)?;
        provider.on_agreement_confirmed(self, &agreement)
    }

    /// Current approval outcome; `None` while still undecided
    pub fn approval_status(
        &self,
        requestor: NodeId,
        agreement_id: AgreementId,
    ) -> Result<Option<Agreement>> {
        let agreement = self.owned_agreement(&requestor, &agreement_id)?;
        match agreement.state {
            AgreementState::Approved => Ok(Some(agreement)),
            AgreementState::Proposed | AgreementState::Pending => Ok(None),
            AgreementState::Rejected => Err(MarketError::CapacityExceeded {
                provider: agreement.provider.to_string(),
                limit: self.admission.capacity(&agreement.provider),
            }),
            AgreementState::Terminated => Err(MarketError::protocol(
                agreement_id,
                "agreement already terminated",
            )),
        }
    }

    /// Terminate an approved agreement on behalf of `node`
    pub fn terminate_agreement(
        &self,
        node: NodeId,
        by: Party,
        agreement_id: AgreementId,
        reason: Option<String>,
    ) -> Result<Agreement> {
        let agreement = self.lifecycle.get(&agreement_id)?;
        let party_node = match by {
            Party::Requestor => agreement.requestor,
            Party::Provider => agreement.provider,
        };
        if party_node != node {
            return Err(MarketError::protocol(agreement_id, "not a party of the agreement"));
        }

        let terminated = self
            .lifecycle
            .terminate(&agreement_id, by, reason, &self.activities, &self.admission)?;
        self.events.emit(MarketEvent::AgreementTerminated {
            provider: terminated.provider,
            requestor: terminated.requestor,
            agreement_id,
            terminated_by: by,
            timestamp: Utc::now(),
        });

        let provider = self.provider(&terminated.provider)?;
        provider.on_agreement_terminated(self, &terminated);
        Ok(terminated)
    }

    fn owned_agreement(
        &self,
        requestor: &NodeId,
        agreement_id: &AgreementId,
    ) -> Result<Agreement> {
        let agreement = self.lifecycle.get(agreement_id)?;
        if agreement.requestor != *requestor {
            return Err(MarketError::protocol(agreement_id, "agreement owned by another node"));
        }
        Ok(agreement)
    }

    // ========================================================================
    // Activities
    // ========================================================================

    pub fn create_activity(
        &self,
        requestor: NodeId,
        agreement_id: AgreementId,
    ) -> Result<ActivityId> {
        let agreement = self.owned_agreement(&requestor, &agreement_id)?;
        if agreement.state != AgreementState::Approved {
            return Err(MarketError::protocol(
                agreement_id,
                format!("cannot create activity in state {}", agreement.state),
            ));
        }

        let activity = self.activities.create(&agreement_id)?;
        self.events.emit(MarketEvent::ExeUnitStarted {
            provider: agreement.provider,
            agreement_id,
            activity_id: activity.id,
            timestamp: Utc::now(),
        });
        Ok(activity.id)
    }

    pub fn call_exec(
        &self,
        requestor: NodeId,
        activity_id: ActivityId,
        script: ExeScript,
    ) -> Result<BatchId> {
        let activity = self.owned_activity(&requestor, &activity_id)?;
        if activity.state != ActivityState::Created {
            return Err(MarketError::protocol(activity_id, "activity already destroyed"));
        }
        Ok(self.exeunit.exec(activity_id, activity.agreement_id, script))
    }

    /// Destroy an activity and stop its running batches
    pub fn destroy_activity(
        &self,
        requestor: NodeId,
        activity_id: ActivityId,
    ) -> Result<Activity> {
        self.owned_activity(&requestor, &activity_id)?;
        let activity = self.activities.destroy(&activity_id)?;
        self.exeunit.stop(&activity_id);
        let agreement = self.lifecycle.get(&activity.agreement_id)?;
        self.events.emit(MarketEvent::ExeUnitFinished {
            provider: agreement.provider,
            agreement_id: activity.agreement_id,
            activity_id,
            timestamp: Utc::now(),
        });
        Ok(activity)
    }

    pub(crate) fn owned_activity(
        &self,
        requestor: &NodeId,
        activity_id: &ActivityId,
    ) -> Result<Activity> {
        let activity = self.activities.get(activity_id)?;
        self.owned_agreement(requestor, &activity.agreement_id)?;
        Ok(activity)
    }

    // ========================================================================
    // Payments
    // ========================================================================

    pub fn fund(&self, node: NodeId, amount: Decimal) -> Result<Decimal> {
        self.ledger.fund(node, amount)
    }

    pub fn create_allocation(
        &self,
        requestor: NodeId,
        amount: Decimal,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Allocation> {
        self.ledger.create_allocation(requestor, amount, expires_at)
    }

    pub fn invoice_for(
        &self,
        requestor: NodeId,
        agreement_id: AgreementId,
    ) -> Result<Option<Invoice>> {
        self.owned_agreement(&requestor, &agreement_id)?;
        Ok(self.ledger.invoice_for(&agreement_id))
    }

    pub fn accept_invoice(
        &self,
        requestor: NodeId,
        invoice_id: InvoiceId,
        allocation_id: AllocationId,
    ) -> Result<Invoice> {
        let invoice = self.ledger.invoice(&invoice_id)?;
        if invoice.recipient != requestor {
            return Err(MarketError::protocol(
                invoice_id,
                "invoice addressed to another node",
            ));
        }
        let accepted = self.ledger.accept_invoice(&invoice_id, &allocation_id)?;
        self.events.emit(MarketEvent::InvoiceAccepted {
            provider: accepted.issuer,
            requestor,
            invoice_id,
            amount: accepted.amount,
            timestamp: Utc::now(),
        });
        Ok(accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_types::names;

    const CONSTRAINTS: &str =
        "(&(golem.com.pricing.model=linear)(golem.srv.caps.multi-activity=true)(golem.runtime.name=wasmtime))";

    fn demand_props() -> Properties {
        Properties::new().with(names::MULTI_ACTIVITY, true)
    }

    fn initial(market: &Market, sub: SubscriptionId) -> Vec<agora_types::Proposal> {
        market
            .store()
            .collect(&sub)
            .unwrap()
            .into_iter()
            .filter_map(|e| e.proposal().cloned())
            .collect()
    }

    #[tokio::test]
    async fn test_offers_matched_in_both_directions() {
        let market = Market::new(MarketConfig::default());
        let requestor = market.add_requestor("requestor", false);

        market.add_provider(ProviderConfig::new("early")).unwrap();
        let sub = market
            .subscribe_demand(requestor.id(), demand_props(), CONSTRAINTS)
            .unwrap();
        market.add_provider(ProviderConfig::new("late")).unwrap();
        market
            .add_provider(ProviderConfig::new("single").with_multi_activity(false))
            .unwrap();

        // "single" does not advertise multi-activity
        assert_eq!(initial(&market, sub).len(), 2);
    }

    #[tokio::test]
    async fn test_counter_answered_then_rejected_when_full() {
        let market = Market::new(MarketConfig::default());
        let requestor = market.add_requestor("requestor", false);
        let provider = market.add_provider(ProviderConfig::new("provider")).unwrap();
        let sub = market
            .subscribe_demand(requestor.id(), demand_props(), CONSTRAINTS)
            .unwrap();
        let offer = initial(&market, sub).remove(0);

        let counter = market.counter_proposal(requestor.id(), sub, offer.id).unwrap();
        let answer = initial(&market, sub).remove(0);
        assert_eq!(answer.prev_proposal_id, Some(counter));
        assert_eq!(answer.issuer, provider);

        let agreement = market.create_agreement(requestor.id(), answer.id).unwrap();
        let approved = market.confirm_agreement(requestor.id(), agreement).unwrap();
        assert!(approved.multi_activity);

        let second = market.counter_proposal(requestor.id(), sub, offer.id).unwrap();
        let events = market.store().collect(&sub).unwrap();
        assert_eq!(events.len(), 1);
        let rejection = events[0].rejection().unwrap();
        assert_eq!(rejection.proposal_id, second);
        assert_eq!(
            rejection.reason.message,
            "No capacity available. Reached Agreements limit: 1"
        );
        assert_eq!(market.provider(&provider).unwrap().retained().len(), 1);
    }

    #[tokio::test]
    async fn test_agreement_requires_countered_proposal() {
        let market = Market::new(MarketConfig::default());
        let requestor = market.add_requestor("requestor", false);
        market.add_provider(ProviderConfig::new("provider")).unwrap();
        let sub = market
            .subscribe_demand(requestor.id(), demand_props(), CONSTRAINTS)
            .unwrap();
        let offer = initial(&market, sub).remove(0);

        let err = market.create_agreement(requestor.id(), offer.id).unwrap_err();
        assert!(matches!(err, MarketError::ProtocolViolation { .. }));
    }

    #[tokio::test]
    async fn test_foreign_requestor_cannot_touch_agreement() {
        let market = Market::new(MarketConfig::default());
        let owner = market.add_requestor("owner", false);
        let intruder = market.add_requestor("intruder", false);
        market.add_provider(ProviderConfig::new("provider")).unwrap();
        let sub = market
            .subscribe_demand(owner.id(), demand_props(), CONSTRAINTS)
            .unwrap();
        let offer = initial(&market, sub).remove(0);

        assert!(market.counter_proposal(intruder.id(), sub, offer.id).is_err());
        market.counter_proposal(owner.id(), sub, offer.id).unwrap();
        let answer = initial(&market, sub).remove(0);
        assert!(market.create_agreement(intruder.id(), answer.id).is_err());

        let agreement = market.create_agreement(owner.id(), answer.id).unwrap();
        assert!(market.confirm_agreement(intruder.id(), agreement).is_err());
        market.confirm_agreement(owner.id(), agreement).unwrap();
        assert!(market.create_activity(intruder.id(), agreement).is_err());
        assert!(market
            .terminate_agreement(intruder.id(), Party::Requestor, agreement, None)
            .is_err());
    }

    #[test]
    fn test_proxy_latency_only_for_proxied_nodes() {
        let market = Market::new(MarketConfig {
            proxy_latency_ms: 25,
            ..MarketConfig::default()
        });
        let direct = market.add_requestor("direct", false);
        let proxied = market.add_requestor("proxied", true);
        assert_eq!(market.latency_for(&direct.id()), Duration::ZERO);
        assert_eq!(market.latency_for(&proxied.id()), Duration::from_millis(25));
    }
}
