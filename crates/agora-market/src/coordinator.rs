//! Negotiation Coordinator
//!
//! Requestor-side driver of the whole flow:
//!
//! ```text
//! subscribe ─► initial proposal per provider ─► counter each
//!     │
//!     ├─ answer    ─► create ─► confirm ─► wait approval ─► agreement
//!     └─ rejection ─► PendingRenegotiation ─(termination)─► renegotiate
//! ```
//!
//! Events that arrive while waiting for something else are kept in a
//! per-subscription backlog, so nothing collected is lost.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use agora_types::{
    AgreementId, AllocationId, ErrorKind, ExeResult, ExeScript, Invoice, MarketError, NodeId,
    Properties, ProposalEvent, ProposalId, Result, SubscriptionId,
};

use crate::api::MarketApi;

/// Agreement concluded with one provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedAgreement {
    pub agreement_id: AgreementId,
    pub provider: NodeId,
}

/// Negotiation that hit a full provider and may be retried later
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRenegotiation {
    pub subscription_id: SubscriptionId,
    pub provider: NodeId,
    /// Our counter-proposal the provider declined or could not approve
    pub counter_proposal_id: ProposalId,
    /// Provider answer whose agreement was rejected at approval time
    pub retained_proposal_id: Option<ProposalId>,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct NegotiationOutcome {
    pub subscription_id: SubscriptionId,
    pub agreements: Vec<NegotiatedAgreement>,
    pub pending: Vec<PendingRenegotiation>,
}

pub struct NegotiationCoordinator<'a, A: MarketApi + ?Sized> {
    api: &'a A,
    timeout: Duration,
    backlog: HashMap<SubscriptionId, VecDeque<ProposalEvent>>,
}

impl<'a, A: MarketApi + ?Sized> NegotiationCoordinator<'a, A> {
    pub fn new(api: &'a A, timeout: Duration) -> Self {
        Self {
            api,
            timeout,
            backlog: HashMap::new(),
        }
    }

    /// Negotiate one agreement with each of `providers`
    ///
    /// The demand is unsubscribed once every provider answered with an
    /// agreement; otherwise it stays open for renegotiation.
    pub async fn negotiate(
        &mut self,
        properties: Properties,
        constraints: &str,
        providers: &[NodeId],
    ) -> Result<NegotiationOutcome> {
        let subscription_id = self
            .api
            .subscribe_demand(properties, constraints, self.timeout)
            .await?;

        let mut counters = Vec::with_capacity(providers.len());
        for provider in providers {
            let offer = self
                .wait_event(subscription_id, "wait_for_initial_proposal", |e| {
                    e.proposal()
                        .map(|p| p.is_initial() && p.issuer == *provider)
                        .unwrap_or(false)
                })
                .await?;
            let offer_id = match offer {
                ProposalEvent::Proposal { proposal } => proposal.id,
                ProposalEvent::Rejected { .. } => {
                    return Err(MarketError::internal(
                        "initial proposal filter returned a rejection",
                    ))
                }
            };
            let counter = self
                .api
                .counter_proposal(subscription_id, offer_id, self.timeout)
                .await?;
            counters.push((*provider, counter));
        }

        let mut agreements = Vec::new();
        let mut pending = Vec::new();
        for (provider, counter) in counters {
            match self.wait_response(subscription_id, counter).await? {
                ProposalEvent::Proposal { proposal } => match self.conclude(proposal.id).await {
                    Ok(agreement_id) => agreements.push(NegotiatedAgreement {
                        agreement_id,
                        provider,
                    }),
                    Err(e) if e.kind() == ErrorKind::Capacity => {
                        info!(
                            provider = %provider,
                            error = %e,
                            "Agreement rejected, keeping for renegotiation"
                        );
                        pending.push(PendingRenegotiation {
                            subscription_id,
                            provider,
                            counter_proposal_id: counter,
                            retained_proposal_id: Some(proposal.id),
                            reason: e.to_string(),
                        });
                    }
                    Err(e) => return Err(e),
                },
                ProposalEvent::Rejected { rejection } => {
                    info!(
                        provider = %provider,
                        reason = %rejection.reason.message,
                        "Counter-proposal rejected, keeping for renegotiation"
                    );
                    pending.push(PendingRenegotiation {
                        subscription_id,
                        provider,
                        counter_proposal_id: counter,
                        retained_proposal_id: None,
                        reason: rejection.reason.message,
                    });
                }
            }
        }

        if pending.is_empty() {
            self.finalize(subscription_id).await?;
        }

        info!(
            subscription_id = %subscription_id,
            agreements = agreements.len(),
            pending = pending.len(),
            "Negotiation finished"
        );
        Ok(NegotiationOutcome {
            subscription_id,
            agreements,
            pending,
        })
    }

    /// Retry a capacity-rejected negotiation after the provider freed a slot
    ///
    /// Prefers the provider's fresh answer to our counter-proposal and falls
    /// back to the proposal whose agreement was rejected before.
    pub async fn renegotiate(
        &mut self,
        pending: &PendingRenegotiation,
    ) -> Result<NegotiatedAgreement> {
        let counter = pending.counter_proposal_id;
        let fresh = self
            .wait_event(pending.subscription_id, "renegotiate", |e| {
                e.proposal()
                    .map(|p| p.prev_proposal_id == Some(counter))
                    .unwrap_or(false)
            })
            .await;

        let proposal_id = match (fresh, pending.retained_proposal_id) {
            (Ok(ProposalEvent::Proposal { proposal }), _) => proposal.id,
            (Err(e), Some(retained)) if e.kind() == ErrorKind::Timeout => {
                warn!(provider = %pending.provider, "No fresh proposal, retrying retained one");
                retained
            }
            (Err(e), _) => return Err(e),
            (Ok(ProposalEvent::Rejected { .. }), _) => {
                return Err(MarketError::internal("renegotiation filter returned a rejection"))
            }
        };

        let agreement_id = self.conclude(proposal_id).await?;
        info!(
            agreement_id = %agreement_id,
            provider = %pending.provider,
            "Renegotiation succeeded"
        );
        Ok(NegotiatedAgreement {
            agreement_id,
            provider: pending.provider,
        })
    }

    /// `n` sequential create → exec → collect → destroy cycles
    pub async fn run_activities(
        &self,
        agreement_id: AgreementId,
        n: usize,
        script: &ExeScript,
    ) -> Result<Vec<Vec<ExeResult>>> {
        let mut batches = Vec::with_capacity(n);
        for cycle in 0..n {
            let activity_id = self.api.create_activity(agreement_id, self.timeout).await?;
            let batch_id = self
                .api
                .call_exec(activity_id, script.clone(), self.timeout)
                .await?;
            let results = self
                .api
                .collect_results(activity_id, batch_id, script.len(), self.timeout)
                .await?;
            self.api.destroy_activity(activity_id, self.timeout).await?;
            info!(agreement_id = %agreement_id, cycle, "Activity cycle completed");
            batches.push(results);
        }
        Ok(batches)
    }

    pub async fn finish(&self, agreement_id: AgreementId) -> Result<()> {
        self.api
            .terminate_agreement(agreement_id, Some("Work finished".to_string()), self.timeout)
            .await
    }

    /// Accept every invoice for `agreements` against one allocation
    pub async fn pay_all(
        &self,
        agreements: &[AgreementId],
        allocation_id: AllocationId,
    ) -> Result<Vec<Invoice>> {
        let mut paid = Vec::with_capacity(agreements.len());
        for agreement_id in agreements {
            let invoice = self.api.wait_for_invoice(*agreement_id, self.timeout).await?;
            self.api
                .accept_invoice(invoice.id, allocation_id, self.timeout)
                .await?;
            info!(invoice_id = %invoice.id, amount = %invoice.amount, "Invoice paid");
            paid.push(invoice);
        }
        Ok(paid)
    }

    pub async fn finalize(&mut self, subscription_id: SubscriptionId) -> Result<()> {
        self.backlog.remove(&subscription_id);
        self.api
            .unsubscribe_demand(subscription_id, self.timeout)
            .await
    }

    async fn conclude(&self, proposal_id: ProposalId) -> Result<AgreementId> {
        let agreement_id = self.api.create_agreement(proposal_id, self.timeout).await?;
        self.api.confirm_agreement(agreement_id, self.timeout).await?;
        self.api.wait_for_approval(agreement_id, self.timeout).await?;
        Ok(agreement_id)
    }

    /// Provider answer to, or rejection of, our counter-proposal
    async fn wait_response(
        &mut self,
        subscription_id: SubscriptionId,
        counter: ProposalId,
    ) -> Result<ProposalEvent> {
        self.wait_event(subscription_id, "wait_for_response", |e| match e {
            ProposalEvent::Proposal { proposal } => proposal.prev_proposal_id == Some(counter),
            ProposalEvent::Rejected { rejection } => rejection.proposal_id == counter,
        })
        .await
    }

    async fn wait_event<F>(
        &mut self,
        subscription_id: SubscriptionId,
        operation: &'static str,
        mut wanted: F,
    ) -> Result<ProposalEvent>
    where
        F: FnMut(&ProposalEvent) -> bool,
    {
        let deadline = Instant::now() + self.timeout;
        loop {
            let queue = self.backlog.entry(subscription_id).or_default();
            if let Some(event) = queue
                .iter()
                .position(&mut wanted)
                .and_then(|pos| queue.remove(pos))
            {
                return Ok(event);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(MarketError::timeout(operation, self.timeout));
            }
            let events = self.api.collect_offers(subscription_id, remaining).await?;
            self.backlog
                .entry(subscription_id)
                .or_default()
                .extend(events);
        }
    }
}
