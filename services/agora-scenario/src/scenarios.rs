//! Scenario Runs
//!
//! Each scenario starts a fresh market cluster from the configured nodes and
//! drives it through the requestor API, watching provider events with
//! probes.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::info;

use agora_market::{Market, MarketApi, NegotiationCoordinator, Probe, Requestor};
use agora_types::{names, AgreementId, ErrorKind, ExeCommand, ExeScript, NodeId, Properties};

use crate::config::ScenarioConfig;

/// Summary of one scenario run
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: &'static str,
    pub agreements: usize,
    pub activities: usize,
    pub invoices: usize,
    pub total_paid: Decimal,
    pub elapsed_ms: u64,
}

/// Market plus the nodes started from configuration
struct Cluster {
    market: Arc<Market>,
    requestors: Vec<Requestor>,
    providers: Vec<NodeId>,
}

impl Cluster {
    fn start(config: &ScenarioConfig) -> anyhow::Result<Self> {
        let market = Market::new(config.market.clone());
        let mut providers = Vec::new();
        for node in config.providers() {
            providers.push(market.add_provider(node.provider_config())?);
        }
        let requestors = config
            .requestors()
            .map(|node| market.add_requestor(node.name.as_str(), node.use_proxy))
            .collect::<Vec<_>>();

        for requestor in &requestors {
            market.fund(requestor.id(), config.payment.fund_amount)?;
        }
        Ok(Self {
            market,
            requestors,
            providers,
        })
    }

    fn requestor(&self, index: usize) -> anyhow::Result<&Requestor> {
        self.requestors
            .get(index)
            .with_context(|| format!("scenario needs at least {} requestor nodes", index + 1))
    }

    fn probes(&self) -> Vec<Probe> {
        self.providers.iter().map(|p| self.market.probe(*p)).collect()
    }
}

fn demand_properties() -> Properties {
    Properties::new().with(names::MULTI_ACTIVITY, true)
}

fn script() -> ExeScript {
    vec![
        ExeCommand::Deploy {},
        ExeCommand::Start {},
        ExeCommand::run("/bin/sh", &["-c", "echo hello"]),
    ]
}

/// Negotiate with every provider, run `cycles` activities per agreement,
/// terminate and pay all invoices
pub async fn multi_activity(config: &ScenarioConfig) -> anyhow::Result<ScenarioReport> {
    let started = Instant::now();
    let cluster = Cluster::start(config)?;
    let requestor = cluster.requestor(0)?;
    let timeout = config.timeouts.negotiation();
    let mut probes = cluster.probes();
    for probe in probes.iter_mut() {
        probe.wait_for_offer_subscribed(timeout).await?;
    }

    let allocation = requestor
        .create_allocation(config.payment.allocation_amount, None, timeout)
        .await?;

    let mut coordinator = NegotiationCoordinator::new(requestor, timeout);
    let outcome = coordinator
        .negotiate(
            demand_properties(),
            &config.workload.demand_constraints,
            &cluster.providers,
        )
        .await?;
    if !outcome.pending.is_empty() {
        bail!(
            "{} providers refused the demand: {}",
            outcome.pending.len(),
            outcome.pending[0].reason
        );
    }
    for probe in probes.iter_mut() {
        probe.wait_for_agreement_approved(timeout).await?;
    }

    let worker = NegotiationCoordinator::new(requestor, config.timeouts.activity());
    let mut agreements: Vec<AgreementId> = Vec::new();
    let mut activities = 0;
    for negotiated in &outcome.agreements {
        let batches = worker
            .run_activities(negotiated.agreement_id, config.workload.cycles, &script())
            .await?;
        activities += batches.len();
        worker.finish(negotiated.agreement_id).await?;
        agreements.push(negotiated.agreement_id);
    }

    for probe in probes.iter_mut() {
        for _ in 0..config.workload.cycles {
            probe.wait_for_exeunit_started(timeout).await?;
            probe.wait_for_exeunit_finished(timeout).await?;
        }
        probe.wait_for_agreement_terminated(timeout).await?;
        probe.wait_for_invoice_issued(timeout).await?;
    }

    let invoices = coordinator.pay_all(&agreements, allocation).await?;
    let total_paid: Decimal = invoices.iter().map(|i| i.amount).sum();

    info!(
        agreements = agreements.len(),
        activities,
        total_paid = %total_paid,
        "Multi-activity scenario finished"
    );
    Ok(ScenarioReport {
        name: "multi-activity",
        agreements: agreements.len(),
        activities,
        invoices: invoices.len(),
        total_paid,
        elapsed_ms: started.elapsed().as_millis() as u64,
    })
}

/// A second simultaneous activity is refused until the first is destroyed
pub async fn single_simultaneous_activity(
    config: &ScenarioConfig,
) -> anyhow::Result<ScenarioReport> {
    let started = Instant::now();
    let cluster = Cluster::start(config)?;
    let requestor = cluster.requestor(0)?;
    let timeout = config.timeouts.negotiation();
    let provider = *cluster
        .providers
        .first()
        .context("scenario needs a provider node")?;

    let mut coordinator = NegotiationCoordinator::new(requestor, timeout);
    let outcome = coordinator
        .negotiate(
            demand_properties(),
            &config.workload.demand_constraints,
            &[provider],
        )
        .await?;
    let agreement = outcome
        .agreements
        .first()
        .map(|a| a.agreement_id)
        .context("provider refused the demand")?;

    let first = requestor.create_activity(agreement, timeout).await?;
    match requestor.create_activity(agreement, timeout).await {
        Err(e) if e.kind() == ErrorKind::ActivityConflict => {
            info!(error = %e, "Second simultaneous activity refused");
        }
        Err(e) => return Err(e.into()),
        Ok(activity) => bail!("second simultaneous activity {} was admitted", activity),
    }

    requestor.destroy_activity(first, timeout).await?;
    let second = requestor.create_activity(agreement, timeout).await?;
    requestor.destroy_activity(second, timeout).await?;
    coordinator.finish(agreement).await?;

    Ok(ScenarioReport {
        name: "single-simultaneous",
        agreements: 1,
        activities: 2,
        invoices: 0,
        total_paid: Decimal::ZERO,
        elapsed_ms: started.elapsed().as_millis() as u64,
    })
}

/// A requestor turned away by a full provider gets an agreement once the
/// provider's slot is freed by another requestor's termination
pub async fn renegotiate(config: &ScenarioConfig) -> anyhow::Result<ScenarioReport> {
    let started = Instant::now();
    let cluster = Cluster::start(config)?;
    let holder = cluster.requestor(0)?;
    let latecomer = cluster.requestor(1)?;
    let timeout = config.timeouts.negotiation();
    let provider = *cluster
        .providers
        .first()
        .context("scenario needs a provider node")?;
    let mut probe = cluster.market.probe(provider);

    // Occupy every slot of the provider
    let capacity = cluster.market.admission().capacity(&provider);
    let mut holding = NegotiationCoordinator::new(holder, timeout);
    let mut held = Vec::with_capacity(capacity);
    for _ in 0..capacity {
        let outcome = holding
            .negotiate(
                demand_properties(),
                &config.workload.demand_constraints,
                &[provider],
            )
            .await?;
        let agreement = outcome
            .agreements
            .first()
            .map(|a| a.agreement_id)
            .context("provider refused a free slot")?;
        held.push(agreement);
    }

    let mut waiting = NegotiationCoordinator::new(latecomer, timeout);
    let outcome = waiting
        .negotiate(
            demand_properties(),
            &config.workload.demand_constraints,
            &[provider],
        )
        .await?;
    let pending = outcome
        .pending
        .first()
        .context("full provider accepted another agreement")?;
    info!(reason = %pending.reason, "Latecomer waits for a free slot");

    let released = held[0];
    holding.run_activities(released, 1, &script()).await?;
    holding.finish(released).await?;
    probe.wait_for_agreement_terminated(timeout).await?;

    let renewed = waiting.renegotiate(pending).await?;
    waiting.finalize(outcome.subscription_id).await?;

    let batches = waiting
        .run_activities(renewed.agreement_id, 1, &script())
        .await?;
    waiting.finish(renewed.agreement_id).await?;
    for agreement in held.iter().skip(1) {
        holding.finish(*agreement).await?;
    }

    Ok(ScenarioReport {
        name: "renegotiate",
        agreements: held.len() + 1,
        activities: 1 + batches.len(),
        invoices: 0,
        total_paid: Decimal::ZERO,
        elapsed_ms: started.elapsed().as_millis() as u64,
    })
}
