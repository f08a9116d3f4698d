//! Requestor API
//!
//! Every call is a round trip to the market and takes a timeout. A round
//! trip that does not finish in time fails with [`MarketError::Timeout`]
//! instead of hanging.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::time::Instant;
use tracing::{debug, warn};

use agora_types::{
    ActivityId, AgreementId, AllocationId, BatchId, ExeResult, ExeScript, Invoice, InvoiceId,
    MarketError, NodeId, Party, Properties, ProposalEvent, ProposalId, Result, SubscriptionId,
};

use crate::market::Market;

/// Operations a requestor performs against the market
#[async_trait]
pub trait MarketApi: Send + Sync {
    fn node_id(&self) -> NodeId;

    async fn subscribe_demand(
        &self,
        properties: Properties,
        constraints: &str,
        timeout: Duration,
    ) -> Result<SubscriptionId>;

    async fn counter_proposal(
        &self,
        subscription_id: SubscriptionId,
        proposal_id: ProposalId,
        timeout: Duration,
    ) -> Result<ProposalId>;

    /// Events queued since the previous collect; empty when nothing arrived
    /// within `timeout`
    async fn collect_offers(
        &self,
        subscription_id: SubscriptionId,
        timeout: Duration,
    ) -> Result<Vec<ProposalEvent>>;

    async fn create_agreement(
        &self,
        proposal_id: ProposalId,
        timeout: Duration,
    ) -> Result<AgreementId>;

    async fn confirm_agreement(&self, agreement_id: AgreementId, timeout: Duration) -> Result<()>;

    async fn wait_for_approval(&self, agreement_id: AgreementId, timeout: Duration) -> Result<()>;

    async fn create_activity(
        &self,
        agreement_id: AgreementId,
        timeout: Duration,
    ) -> Result<ActivityId>;

    async fn call_exec(
        &self,
        activity_id: ActivityId,
        script: ExeScript,
        timeout: Duration,
    ) -> Result<BatchId>;

    async fn collect_results(
        &self,
        activity_id: ActivityId,
        batch_id: BatchId,
        expected: usize,
        timeout: Duration,
    ) -> Result<Vec<ExeResult>>;

    async fn destroy_activity(&self, activity_id: ActivityId, timeout: Duration) -> Result<()>;

    async fn terminate_agreement(
        &self,
        agreement_id: AgreementId,
        reason: Option<String>,
        timeout: Duration,
    ) -> Result<()>;

    async fn unsubscribe_demand(
        &self,
        subscription_id: SubscriptionId,
        timeout: Duration,
    ) -> Result<()>;

    async fn create_allocation(
        &self,
        amount: Decimal,
        expires_at: Option<DateTime<Utc>>,
        timeout: Duration,
    ) -> Result<AllocationId>;

    /// Wait until the provider has invoiced the agreement
    async fn wait_for_invoice(
        &self,
        agreement_id: AgreementId,
        timeout: Duration,
    ) -> Result<Invoice>;

    async fn accept_invoice(
        &self,
        invoice_id: InvoiceId,
        allocation_id: AllocationId,
        timeout: Duration,
    ) -> Result<()>;
}

/// Requestor node handle
#[derive(Clone)]
pub struct Requestor {
    id: NodeId,
    name: String,
    market: Arc<Market>,
}

impl Requestor {
    pub(crate) fn new(id: NodeId, name: String, market: Arc<Market>) -> Self {
        Self { id, name, market }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn market(&self) -> &Arc<Market> {
        &self.market
    }

    /// Run `work` after the node's network delay, bounded by `timeout`
    async fn round_trip<T, F>(
        &self,
        operation: &'static str,
        timeout: Duration,
        work: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let latency = self.market.latency_for(&self.id);
        let call = async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            work.await
        };

        match tokio::time::timeout(timeout, call).await {
            Ok(result) => {
                if let Err(e) = &result {
                    debug!(requestor = %self.name, operation, error = %e, "Round trip failed");
                }
                result
            }
            Err(_) => {
                warn!(
                    requestor = %self.name,
                    operation,
                    timeout_ms = timeout.as_millis() as u64,
                    "Round trip timed out"
                );
                Err(MarketError::timeout(operation, timeout))
            }
        }
    }

    /// Poll `check` every poll interval until it yields a value
    async fn poll<T, C>(
        &self,
        operation: &'static str,
        timeout: Duration,
        mut check: C,
    ) -> Result<T>
    where
        C: FnMut() -> Result<Option<T>> + Send,
        T: Send,
    {
        let interval = self.market.config().poll_interval();
        self.round_trip(operation, timeout, async move {
            loop {
                if let Some(value) = check()? {
                    return Ok(value);
                }
                tokio::time::sleep(interval).await;
            }
        })
        .await
    }
}

#[async_trait]
impl MarketApi for Requestor {
    fn node_id(&self) -> NodeId {
        self.id
    }

    async fn subscribe_demand(
        &self,
        properties: Properties,
        constraints: &str,
        timeout: Duration,
    ) -> Result<SubscriptionId> {
        let market = &self.market;
        self.round_trip("subscribe_demand", timeout, async move {
            market.subscribe_demand(self.id, properties, constraints)
        })
        .await
    }

    async fn counter_proposal(
        &self,
        subscription_id: SubscriptionId,
        proposal_id: ProposalId,
        timeout: Duration,
    ) -> Result<ProposalId> {
        let market = &self.market;
        self.round_trip("counter_proposal", timeout, async move {
            market.counter_proposal(self.id, subscription_id, proposal_id)
        })
        .await
    }

    async fn collect_offers(
        &self,
        subscription_id: SubscriptionId,
        timeout: Duration,
    ) -> Result<Vec<ProposalEvent>> {
        let started = Instant::now();
        self.round_trip("collect_offers", timeout, async { Ok(()) }).await?;
        let remaining = timeout.saturating_sub(started.elapsed());
        self.market
            .store()
            .collect_timeout(&subscription_id, remaining)
            .await
    }

    async fn create_agreement(
        &self,
        proposal_id: ProposalId,
        timeout: Duration,
    ) -> Result<AgreementId> {
        let market = &self.market;
        self.round_trip("create_agreement", timeout, async move {
            market.create_agreement(self.id, proposal_id)
        })
        .await
    }

    async fn confirm_agreement(&self, agreement_id: AgreementId, timeout: Duration) -> Result<()> {
        let market = &self.market;
        self.round_trip("confirm_agreement", timeout, async move {
            market.confirm_agreement(self.id, agreement_id).map(|_| ())
        })
        .await
    }

    async fn wait_for_approval(&self, agreement_id: AgreementId, timeout: Duration) -> Result<()> {
        let market = self.market.clone();
        let id = self.id;
        self.poll("wait_for_approval", timeout, move || {
            market.approval_status(id, agreement_id).map(|a| a.map(|_| ()))
        })
        .await
    }

    async fn create_activity(
        &self,
        agreement_id: AgreementId,
        timeout: Duration,
    ) -> Result<ActivityId> {
        let market = &self.market;
        self.round_trip("create_activity", timeout, async move {
            market.create_activity(self.id, agreement_id)
        })
        .await
    }

    async fn call_exec(
        &self,
        activity_id: ActivityId,
        script: ExeScript,
        timeout: Duration,
    ) -> Result<BatchId> {
        let market = &self.market;
        self.round_trip("call_exec", timeout, async move {
            market.call_exec(self.id, activity_id, script)
        })
        .await
    }

    async fn collect_results(
        &self,
        activity_id: ActivityId,
        batch_id: BatchId,
        expected: usize,
        timeout: Duration,
    ) -> Result<Vec<ExeResult>> {
        let market = &self.market;
        self.round_trip("collect_results", timeout, async move {
            market.owned_activity(&self.id, &activity_id)?;
            market
                .exeunit()
                .collect_results(&activity_id, &batch_id, expected, timeout)
                .await
        })
        .await
    }

    async fn destroy_activity(&self, activity_id: ActivityId, timeout: Duration) -> Result<()> {
        let market = &self.market;
        self.round_trip("destroy_activity", timeout, async move {
            market.destroy_activity(self.id, activity_id).map(|_| ())
        })
        .await
    }

    async fn terminate_agreement(
        &self,
        agreement_id: AgreementId,
        reason: Option<String>,
        timeout: Duration,
    ) -> Result<()> {
        let market = &self.market;
        self.round_trip("terminate_agreement", timeout, async move {
            market
                .terminate_agreement(self.id, Party::Requestor, agreement_id, reason)
                .map(|_| ())
        })
        .await
    }

    async fn unsubscribe_demand(
        &self,
        subscription_id: SubscriptionId,
        timeout: Duration,
    ) -> Result<()> {
        let market = &self.market;
        self.round_trip("unsubscribe_demand", timeout, async move {
            market.unsubscribe_demand(self.id, subscription_id)
        })
        .await
    }

    async fn create_allocation(
        &self,
        amount: Decimal,
        expires_at: Option<DateTime<Utc>>,
        timeout: Duration,
    ) -> Result<AllocationId> {
        let market = &self.market;
        self.round_trip("create_allocation", timeout, async move {
            market
                .create_allocation(self.id, amount, expires_at)
                .map(|a| a.id)
        })
        .await
    }

    async fn wait_for_invoice(
        &self,
        agreement_id: AgreementId,
        timeout: Duration,
    ) -> Result<Invoice> {
        let market = self.market.clone();
        let id = self.id;
        self.poll("wait_for_invoice", timeout, move || {
            market.invoice_for(id, agreement_id)
        })
        .await
    }

    async fn accept_invoice(
        &self,
        invoice_id: InvoiceId,
        allocation_id: AllocationId,
        timeout: Duration,
    ) -> Result<()> {
        let market = &self.market;
        self.round_trip("accept_invoice", timeout, async move {
            market
                .accept_invoice(self.id, invoice_id, allocation_id)
                .map(|_| ())
        })
        .await
    }
}
