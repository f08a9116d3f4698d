//! Market events and probes
//!
//! Every component publishes what it did through the [`EventHub`]. Live
//! subscribers get a broadcast stream; [`Probe`]s replay the append-only
//! history through private cursors so a test can wait for "the next
//! agreement approved by provider X" without racing the event.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Notify};
use tracing::debug;

use agora_types::{
    ActivityId, AgreementId, InvoiceId, MarketError, NodeId, Party, ProposalId, Result,
    SubscriptionId,
};

/// Events emitted during negotiation, execution and payment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MarketEvent {
    /// Provider offer is visible to matching demands
    OfferSubscribed {
        provider: NodeId,
        timestamp: DateTime<Utc>,
    },

    DemandSubscribed {
        requestor: NodeId,
        subscription_id: SubscriptionId,
        timestamp: DateTime<Utc>,
    },

    /// Provider answered a requestor counter-proposal
    ProposalAccepted {
        provider: NodeId,
        requestor: NodeId,
        proposal_id: ProposalId,
        timestamp: DateTime<Utc>,
    },

    /// Provider declined a requestor counter-proposal
    ProposalRejected {
        provider: NodeId,
        requestor: NodeId,
        proposal_id: ProposalId,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    AgreementApproved {
        provider: NodeId,
        requestor: NodeId,
        agreement_id: AgreementId,
        timestamp: DateTime<Utc>,
    },

    AgreementRejected {
        provider: NodeId,
        requestor: NodeId,
        agreement_id: AgreementId,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    AgreementTerminated {
        provider: NodeId,
        requestor: NodeId,
        agreement_id: AgreementId,
        terminated_by: Party,
        timestamp: DateTime<Utc>,
    },

    ExeUnitStarted {
        provider: NodeId,
        agreement_id: AgreementId,
        activity_id: ActivityId,
        timestamp: DateTime<Utc>,
    },

    ExeUnitFinished {
        provider: NodeId,
        agreement_id: AgreementId,
        activity_id: ActivityId,
        timestamp: DateTime<Utc>,
    },

    InvoiceIssued {
        provider: NodeId,
        requestor: NodeId,
        agreement_id: AgreementId,
        invoice_id: InvoiceId,
        amount: Decimal,
        timestamp: DateTime<Utc>,
    },

    InvoiceAccepted {
        provider: NodeId,
        requestor: NodeId,
        invoice_id: InvoiceId,
        amount: Decimal,
        timestamp: DateTime<Utc>,
    },
}

/// Discriminant of [`MarketEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    OfferSubscribed,
    DemandSubscribed,
    ProposalAccepted,
    ProposalRejected,
    AgreementApproved,
    AgreementRejected,
    AgreementTerminated,
    ExeUnitStarted,
    ExeUnitFinished,
    InvoiceIssued,
    InvoiceAccepted,
}

impl MarketEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::OfferSubscribed { .. } => EventKind::OfferSubscribed,
            Self::DemandSubscribed { .. } => EventKind::DemandSubscribed,
            Self::ProposalAccepted { .. } => EventKind::ProposalAccepted,
            Self::ProposalRejected { .. } => EventKind::ProposalRejected,
            Self::AgreementApproved { .. } => EventKind::AgreementApproved,
            Self::AgreementRejected { .. } => EventKind::AgreementRejected,
            Self::AgreementTerminated { .. } => EventKind::AgreementTerminated,
            Self::ExeUnitStarted { .. } => EventKind::ExeUnitStarted,
            Self::ExeUnitFinished { .. } => EventKind::ExeUnitFinished,
            Self::InvoiceIssued { .. } => EventKind::InvoiceIssued,
            Self::InvoiceAccepted { .. } => EventKind::InvoiceAccepted,
        }
    }

    /// Whether `node` took part in the event
    pub fn involves(&self, node: &NodeId) -> bool {
        match self {
            Self::OfferSubscribed { provider, .. }
            | Self::ExeUnitStarted { provider, .. }
            | Self::ExeUnitFinished { provider, .. } => provider == node,
            Self::DemandSubscribed { requestor, .. } => requestor == node,
            Self::ProposalAccepted {
                provider, requestor, ..
            }
            | Self::ProposalRejected {
                provider, requestor, ..
            }
            | Self::AgreementApproved {
                provider, requestor, ..
            }
            | Self::AgreementRejected {
                provider, requestor, ..
            }
            | Self::AgreementTerminated {
                provider, requestor, ..
            }
            | Self::InvoiceIssued {
                provider, requestor, ..
            }
            | Self::InvoiceAccepted {
                provider, requestor, ..
            } => provider == node || requestor == node,
        }
    }

    /// Agreement the event refers to, if any
    pub fn agreement_id(&self) -> Option<AgreementId> {
        match self {
            Self::AgreementApproved { agreement_id, .. }
            | Self::AgreementRejected { agreement_id, .. }
            | Self::AgreementTerminated { agreement_id, .. }
            | Self::ExeUnitStarted { agreement_id, .. }
            | Self::ExeUnitFinished { agreement_id, .. }
            | Self::InvoiceIssued { agreement_id, .. } => Some(*agreement_id),
            _ => None,
        }
    }
}

/// Append-only event history with a live broadcast stream
pub struct EventHub {
    history: RwLock<Vec<MarketEvent>>,
    appended: Notify,
    sender: broadcast::Sender<MarketEvent>,
}

impl EventHub {
    pub fn new(channel_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            history: RwLock::new(Vec::new()),
            appended: Notify::new(),
            sender,
        }
    }

    /// Record and broadcast an event
    pub fn emit(&self, event: MarketEvent) {
        debug!(kind = ?event.kind(), "Market event");
        self.history.write().push(event.clone());
        self.appended.notify_waiters();
        // No live subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MarketEvent> {
        self.sender.subscribe()
    }

    /// All events involving `node`, in emission order
    pub fn events_for(&self, node: &NodeId) -> Vec<MarketEvent> {
        self.history
            .read()
            .iter()
            .filter(|e| e.involves(node))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.history.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.read().is_empty()
    }

    /// Observer scoped to one node
    pub fn probe(self: &Arc<Self>, node: NodeId) -> Probe {
        Probe {
            hub: self.clone(),
            node,
            cursors: HashMap::new(),
        }
    }

    fn find_from(
        &self,
        start: usize,
        node: &NodeId,
        kind: EventKind,
    ) -> Option<(usize, MarketEvent)> {
        self.history
            .read()
            .iter()
            .enumerate()
            .skip(start)
            .find(|(_, e)| e.kind() == kind && e.involves(node))
            .map(|(i, e)| (i, e.clone()))
    }
}

/// Waits for events involving one node
///
/// Each event kind has its own cursor: waiting twice for `ExeUnitStarted`
/// yields the first and then the second start.
pub struct Probe {
    hub: Arc<EventHub>,
    node: NodeId,
    cursors: HashMap<EventKind, usize>,
}

impl Probe {
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Wait for the next unseen event of `kind`
    pub async fn wait_for(&mut self, kind: EventKind, timeout: Duration) -> Result<MarketEvent> {
        let hub = self.hub.clone();
        let start = self.cursors.get(&kind).copied().unwrap_or(0);
        let node = self.node;

        let found = tokio::time::timeout(timeout, async {
            loop {
                let appended = hub.appended.notified();
                tokio::pin!(appended);
                appended.as_mut().enable();

                if let Some(hit) = hub.find_from(start, &node, kind) {
                    return hit;
                }
                appended.await;
            }
        })
        .await
        .map_err(|_| MarketError::timeout(format!("wait_for {:?} on {}", kind, node), timeout))?;

        self.cursors.insert(kind, found.0 + 1);
        Ok(found.1)
    }

    pub async fn wait_for_offer_subscribed(&mut self, timeout: Duration) -> Result<MarketEvent> {
        self.wait_for(EventKind::OfferSubscribed, timeout).await
    }

    pub async fn wait_for_proposal_accepted(&mut self, timeout: Duration) -> Result<MarketEvent> {
        self.wait_for(EventKind::ProposalAccepted, timeout).await
    }

    pub async fn wait_for_agreement_approved(&mut self, timeout: Duration) -> Result<MarketEvent> {
        self.wait_for(EventKind::AgreementApproved, timeout).await
    }

    pub async fn wait_for_exeunit_started(&mut self, timeout: Duration) -> Result<MarketEvent> {
        self.wait_for(EventKind::ExeUnitStarted, timeout).await
    }

    pub async fn wait_for_exeunit_finished(&mut self, timeout: Duration) -> Result<MarketEvent> {
        self.wait_for(EventKind::ExeUnitFinished, timeout).await
    }

    pub async fn wait_for_agreement_terminated(
        &mut self,
        timeout: Duration,
    ) -> Result<MarketEvent> {
        self.wait_for(EventKind::AgreementTerminated, timeout).await
    }

    pub async fn wait_for_invoice_issued(&mut self, timeout: Duration) -> Result<MarketEvent> {
        self.wait_for(EventKind::InvoiceIssued, timeout).await
    }
}
