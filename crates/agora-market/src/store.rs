//! Proposal Store - append-only proposal log plus per-subscription queues
//!
//! Proposals form a forest of chains linked by `prev_proposal_id`. The log
//! only ever grows; subscriptions own a FIFO queue of [`ProposalEvent`]s that
//! `collect` drains.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::debug;

use agora_types::{
    Constraint, Demand, MarketError, NodeId, Properties, Proposal, ProposalEvent, ProposalId,
    Result, SubscriptionId,
};

struct Subscription {
    demand: Demand,
    queue: VecDeque<ProposalEvent>,
    notify: Arc<Notify>,
}

/// Holds demand subscriptions and the proposal log
#[derive(Default)]
pub struct ProposalStore {
    proposals: DashMap<ProposalId, Proposal>,
    subscriptions: DashMap<SubscriptionId, Subscription>,
}

impl ProposalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a demand; the returned subscription starts empty
    pub fn submit(&self, demand: Demand) -> SubscriptionId {
        let subscription_id = SubscriptionId::new();
        self.subscriptions.insert(
            subscription_id,
            Subscription {
                demand,
                queue: VecDeque::new(),
                notify: Arc::new(Notify::new()),
            },
        );
        debug!(subscription_id = %subscription_id, "Demand subscribed");
        subscription_id
    }

    /// The demand behind a live subscription
    pub fn demand(&self, subscription_id: &SubscriptionId) -> Result<Demand> {
        self.subscriptions
            .get(subscription_id)
            .map(|s| s.demand.clone())
            .ok_or_else(|| not_found(subscription_id))
    }

    /// Snapshot of all live subscriptions
    pub fn live_subscriptions(&self) -> Vec<(SubscriptionId, Demand)> {
        self.subscriptions
            .iter()
            .map(|entry| (*entry.key(), entry.value().demand.clone()))
            .collect()
    }

    pub fn is_live(&self, subscription_id: &SubscriptionId) -> bool {
        self.subscriptions.contains_key(subscription_id)
    }

    /// Record an initial offer proposal inside a subscription's thread forest
    pub fn record_initial(
        &self,
        subscription_id: SubscriptionId,
        issuer: NodeId,
        properties: Properties,
        constraints: Constraint,
    ) -> Result<Proposal> {
        if !self.is_live(&subscription_id) {
            return Err(not_found(&subscription_id));
        }
        Ok(self.append(subscription_id, issuer, None, properties, constraints))
    }

    /// Record a counter-proposal answering `prev`
    ///
    /// The previous proposal must exist and belong to the same subscription.
    pub fn counter(
        &self,
        subscription_id: SubscriptionId,
        prev: ProposalId,
        issuer: NodeId,
        properties: Properties,
        constraints: Constraint,
    ) -> Result<Proposal> {
        if !self.is_live(&subscription_id) {
            return Err(not_found(&subscription_id));
        }
        let previous = self.get(&prev)?;
        if previous.subscription_id != subscription_id {
            return Err(MarketError::protocol(
                prev,
                format!("proposal does not belong to subscription {}", subscription_id),
            ));
        }
        if previous.issuer == issuer {
            return Err(MarketError::protocol(prev, "cannot counter own proposal"));
        }
        Ok(self.append(subscription_id, issuer, Some(prev), properties, constraints))
    }

    fn append(
        &self,
        subscription_id: SubscriptionId,
        issuer: NodeId,
        prev_proposal_id: Option<ProposalId>,
        properties: Properties,
        constraints: Constraint,
    ) -> Proposal {
        let proposal = Proposal {
            id: ProposalId::new(),
            issuer,
            subscription_id,
            prev_proposal_id,
            properties,
            constraints,
            created_at: Utc::now(),
        };
        self.proposals.insert(proposal.id, proposal.clone());
        proposal
    }

    /// Queue an event for the subscription owner
    ///
    /// Returns `false` when the subscription is gone; the event is dropped.
    pub fn push_event(&self, subscription_id: &SubscriptionId, event: ProposalEvent) -> bool {
        match self.subscriptions.get_mut(subscription_id) {
            Some(mut sub) => {
                sub.queue.push_back(event);
                sub.notify.notify_waiters();
                true
            }
            None => {
                debug!(
                    subscription_id = %subscription_id,
                    "Dropping event for unsubscribed demand"
                );
                false
            }
        }
    }

    /// Drain everything queued since the previous call (non-blocking)
    pub fn collect(&self, subscription_id: &SubscriptionId) -> Result<Vec<ProposalEvent>> {
        let mut sub = self
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| not_found(subscription_id))?;
        Ok(sub.queue.drain(..).collect())
    }

    /// Drain the queue, waiting up to `timeout` for the first event
    ///
    /// An empty vector means nothing arrived in time.
    pub async fn collect_timeout(
        &self,
        subscription_id: &SubscriptionId,
        timeout: Duration,
    ) -> Result<Vec<ProposalEvent>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notify = self
                .subscriptions
                .get(subscription_id)
                .map(|s| s.notify.clone())
                .ok_or_else(|| not_found(subscription_id))?;
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let events = self.collect(subscription_id)?;
            if !events.is_empty() {
                return Ok(events);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    pub fn get(&self, proposal_id: &ProposalId) -> Result<Proposal> {
        self.proposals
            .get(proposal_id)
            .map(|p| p.clone())
            .ok_or_else(|| MarketError::ProposalNotFound {
                proposal_id: proposal_id.to_string(),
            })
    }

    /// Reconstruct the negotiation thread ending at `proposal_id`, root first
    pub fn thread(&self, proposal_id: &ProposalId) -> Result<Vec<Proposal>> {
        let mut chain = Vec::new();
        let mut cursor = Some(*proposal_id);
        while let Some(id) = cursor {
            let proposal = self.get(&id)?;
            cursor = proposal.prev_proposal_id;
            chain.push(proposal);
        }
        chain.reverse();
        Ok(chain)
    }

    /// Stop the subscription; proposals already logged stay resolvable
    pub fn unsubscribe(&self, subscription_id: &SubscriptionId) -> Result<()> {
        let (_, sub) = self
            .subscriptions
            .remove(subscription_id)
            .ok_or_else(|| not_found(subscription_id))?;
        sub.notify.notify_waiters();
        debug!(subscription_id = %subscription_id, "Demand unsubscribed");
        Ok(())
    }
}

fn not_found(subscription_id: &SubscriptionId) -> MarketError {
    MarketError::SubscriptionNotFound {
        subscription_id: subscription_id.to_string(),
    }
}
