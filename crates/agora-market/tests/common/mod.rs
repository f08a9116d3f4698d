#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use agora_market::{Market, MarketApi, MarketConfig, NegotiationCoordinator, Requestor};
use agora_types::{
    names, AgreementId, ExeCommand, ExeScript, NodeId, Properties, Proposal, ProposalEvent,
    ProposalId, SubscriptionId,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub const CONSTRAINTS: &str =
    "(&(golem.com.pricing.model=linear)(golem.srv.caps.multi-activity=true)(golem.runtime.name=wasmtime))";

/// Test log output, filtered by `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn market() -> Arc<Market> {
    init_tracing();
    Market::new(MarketConfig {
        proxy_latency_ms: 1,
        command_delay_ms: 1,
        poll_interval_ms: 5,
        event_channel_capacity: 256,
    })
}

pub fn demand_props() -> Properties {
    Properties::new().with(names::MULTI_ACTIVITY, true)
}

pub fn script() -> ExeScript {
    vec![
        ExeCommand::Deploy {},
        ExeCommand::Start {},
        ExeCommand::run("/bin/sh", &["-c", "echo hello"]),
    ]
}

/// Negotiate a single agreement with `provider` through the coordinator
pub async fn agree(requestor: &Requestor, provider: NodeId) -> AgreementId {
    let mut coordinator = NegotiationCoordinator::new(requestor, TIMEOUT);
    let outcome = coordinator
        .negotiate(demand_props(), CONSTRAINTS, &[provider])
        .await
        .unwrap();
    assert!(outcome.pending.is_empty());
    outcome.agreements[0].agreement_id
}

/// Subscribe and counter the provider's initial proposal without waiting
/// for the answer
pub async fn counter_initial(
    requestor: &Requestor,
    provider: NodeId,
) -> (SubscriptionId, Proposal, ProposalId) {
    let sub = requestor
        .subscribe_demand(demand_props(), CONSTRAINTS, TIMEOUT)
        .await
        .unwrap();
    let offer = next_proposal(requestor, sub, |p| p.issuer == provider && p.is_initial()).await;
    let counter = requestor
        .counter_proposal(sub, offer.id, TIMEOUT)
        .await
        .unwrap();
    (sub, offer, counter)
}

/// Collect until a proposal matching `wanted` shows up; other events are dropped
pub async fn next_proposal<F>(requestor: &Requestor, sub: SubscriptionId, wanted: F) -> Proposal
where
    F: Fn(&Proposal) -> bool,
{
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        let events = requestor.collect_offers(sub, TIMEOUT).await.unwrap();
        if let Some(p) = events
            .iter()
            .filter_map(ProposalEvent::proposal)
            .find(|p| wanted(p))
        {
            return p.clone();
        }
        assert!(tokio::time::Instant::now() < deadline, "no matching proposal");
    }
}
