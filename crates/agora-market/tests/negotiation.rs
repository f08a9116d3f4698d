mod common;

use std::time::Duration;

use futures::future::join_all;

use agora_market::{MarketApi, MarketEvent, NegotiationCoordinator, ProviderConfig};
use agora_types::{AgreementState, ErrorKind, MarketError, NodeId, ProposalEvent};

use common::*;

#[tokio::test]
async fn single_slot_admits_exactly_one_of_many_concurrent_confirms() {
    let market = market();
    let provider = market.add_provider(ProviderConfig::new("provider-1")).unwrap();

    // Every requestor gets an answer before anyone confirms
    let mut pending = Vec::new();
    for i in 0..8 {
        let requestor = market.add_requestor(format!("requestor-{i}"), i % 2 == 0);
        let (sub, _, counter) = counter_initial(&requestor, provider).await;
        let answer = next_proposal(&requestor, sub, |p| p.prev_proposal_id == Some(counter)).await;
        let agreement = requestor.create_agreement(answer.id, TIMEOUT).await.unwrap();
        pending.push((requestor, agreement));
    }

    let confirms = pending.iter().map(|(requestor, agreement)| {
        let requestor = requestor.clone();
        let agreement = *agreement;
        tokio::spawn(async move { requestor.confirm_agreement(agreement, TIMEOUT).await })
    });
    let results: Vec<_> = join_all(confirms)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert_eq!(err.kind(), ErrorKind::Capacity);
        assert!(err
            .to_string()
            .contains("No capacity available. Reached Agreements limit: 1"));
    }
    assert_eq!(market.admission().active_count(&provider), 1);
    assert_eq!(market.lifecycle().list_by_state(AgreementState::Approved).len(), 1);
    assert_eq!(market.lifecycle().list_by_state(AgreementState::Rejected).len(), 7);
}

#[tokio::test]
async fn capacity_bound_above_one_is_respected() {
    let market = market();
    let provider = market
        .add_provider(ProviderConfig::new("provider-3").with_capacity(3))
        .unwrap();

    let mut approved = 0;
    for i in 0..5 {
        let requestor = market.add_requestor(format!("requestor-{i}"), false);
        let (sub, _, counter) = counter_initial(&requestor, provider).await;
        let events = requestor.collect_offers(sub, TIMEOUT).await.unwrap();
        match &events[0] {
            ProposalEvent::Proposal { proposal } => {
                assert_eq!(proposal.prev_proposal_id, Some(counter));
                let agreement = requestor.create_agreement(proposal.id, TIMEOUT).await.unwrap();
                requestor.confirm_agreement(agreement, TIMEOUT).await.unwrap();
                approved += 1;
            }
            ProposalEvent::Rejected { rejection } => {
                assert_eq!(
                    rejection.reason.message,
                    "No capacity available. Reached Agreements limit: 3"
                );
            }
        }
    }
    assert_eq!(approved, 3);
}

#[tokio::test]
async fn rejected_counter_is_reoffered_after_termination() {
    let market = market();
    let provider = market.add_provider(ProviderConfig::new("provider-1")).unwrap();
    let first = market.add_requestor("requestor-1", false);
    let second = market.add_requestor("requestor-2", true);
    let mut probe = market.probe(provider);

    let agreement = agree(&first, provider).await;
    probe.wait_for_agreement_approved(TIMEOUT).await.unwrap();

    let (sub, _, counter) = counter_initial(&second, provider).await;

    let coordinator = NegotiationCoordinator::new(&first, TIMEOUT);
    coordinator.run_activities(agreement, 1, &script()).await.unwrap();
    coordinator.finish(agreement).await.unwrap();
    probe.wait_for_agreement_terminated(TIMEOUT).await.unwrap();

    let events = second.collect_offers(sub, TIMEOUT).await.unwrap();
    assert_eq!(events.len(), 2);
    let rejection = events[0].rejection().expect("rejection first");
    assert_eq!(rejection.proposal_id, counter);
    assert_eq!(
        rejection.reason.message,
        "No capacity available. Reached Agreements limit: 1"
    );
    let fresh = events[1].proposal().expect("fresh proposal second");
    assert_eq!(fresh.prev_proposal_id, Some(counter));

    let renewed = second.create_agreement(fresh.id, TIMEOUT).await.unwrap();
    second.confirm_agreement(renewed, TIMEOUT).await.unwrap();
    second.wait_for_approval(renewed, TIMEOUT).await.unwrap();

    // First acceptance answered requestor-1, the second is the re-offer
    probe.wait_for_proposal_accepted(TIMEOUT).await.unwrap();
    match probe.wait_for_proposal_accepted(TIMEOUT).await.unwrap() {
        MarketEvent::ProposalAccepted { requestor, proposal_id, .. } => {
            assert_eq!(requestor, second.id());
            assert_eq!(proposal_id, counter);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn coordinator_renegotiates_counter_rejected_at_counter_time() {
    let market = market();
    let provider = market.add_provider(ProviderConfig::new("provider-1")).unwrap();
    let first = market.add_requestor("requestor-1", false);
    let second = market.add_requestor("requestor-2", false);

    let agreement = agree(&first, provider).await;

    let mut coordinator = NegotiationCoordinator::new(&second, TIMEOUT);
    let outcome = coordinator
        .negotiate(demand_props(), CONSTRAINTS, &[provider])
        .await
        .unwrap();
    assert!(outcome.agreements.is_empty());
    assert_eq!(outcome.pending.len(), 1);
    let pending = &outcome.pending[0];
    assert_eq!(pending.retained_proposal_id, None);
    assert_eq!(
        pending.reason,
        "No capacity available. Reached Agreements limit: 1"
    );

    first
        .terminate_agreement(agreement, None, TIMEOUT)
        .await
        .unwrap();

    let renewed = coordinator.renegotiate(pending).await.unwrap();
    assert_eq!(renewed.provider, provider);
    assert_eq!(
        market.lifecycle().get(&renewed.agreement_id).unwrap().state,
        AgreementState::Approved
    );
    coordinator.finalize(outcome.subscription_id).await.unwrap();
}

#[tokio::test]
async fn agreement_rejected_at_confirm_time_succeeds_after_termination() {
    let market = market();
    let provider = market.add_provider(ProviderConfig::new("provider-1")).unwrap();
    let first = market.add_requestor("requestor-1", false);
    let second = market.add_requestor("requestor-2", false);

    // Both hold an answer while the slot is still free
    let (sub_a, _, counter_a) = counter_initial(&first, provider).await;
    let (sub_b, _, counter_b) = counter_initial(&second, provider).await;
    let answer_a = next_proposal(&first, sub_a, |p| p.prev_proposal_id == Some(counter_a)).await;
    let answer_b = next_proposal(&second, sub_b, |p| p.prev_proposal_id == Some(counter_b)).await;

    let agreement_a = first.create_agreement(answer_a.id, TIMEOUT).await.unwrap();
    first.confirm_agreement(agreement_a, TIMEOUT).await.unwrap();

    let agreement_b = second.create_agreement(answer_b.id, TIMEOUT).await.unwrap();
    let err = second.confirm_agreement(agreement_b, TIMEOUT).await.unwrap_err();
    assert!(matches!(err, MarketError::CapacityExceeded { limit: 1, .. }));
    assert!(err.is_retriable());
    let err = second.wait_for_approval(agreement_b, TIMEOUT).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capacity);

    first.terminate_agreement(agreement_a, None, TIMEOUT).await.unwrap();

    // The same answer may back a new agreement once the old one was rejected
    let retry = second.create_agreement(answer_b.id, TIMEOUT).await.unwrap();
    second.confirm_agreement(retry, TIMEOUT).await.unwrap();
    second.wait_for_approval(retry, TIMEOUT).await.unwrap();

    // The provider also re-offered the retained counter-proposal
    let fresh = next_proposal(&second, sub_b, |p| p.prev_proposal_id == Some(counter_b)).await;
    assert_ne!(fresh.id, answer_b.id);
}

#[tokio::test]
async fn negotiation_thread_is_reconstructible() {
    let market = market();
    let provider = market.add_provider(ProviderConfig::new("provider-1")).unwrap();
    let requestor = market.add_requestor("requestor-1", false);

    let (sub, offer, counter) = counter_initial(&requestor, provider).await;
    let answer = next_proposal(&requestor, sub, |p| p.prev_proposal_id == Some(counter)).await;

    let thread: Vec<_> = market
        .store()
        .thread(&answer.id)
        .unwrap()
        .into_iter()
        .map(|p| (p.id, p.issuer))
        .collect();
    assert_eq!(
        thread,
        vec![
            (offer.id, provider),
            (counter, requestor.id()),
            (answer.id, provider)
        ]
    );
}

#[tokio::test]
async fn unsubscribe_stops_delivery_but_keeps_agreement() {
    let market = market();
    let provider = market.add_provider(ProviderConfig::new("provider-1")).unwrap();
    let requestor = market.add_requestor("requestor-1", false);

    let mut coordinator = NegotiationCoordinator::new(&requestor, TIMEOUT);
    let outcome = coordinator
        .negotiate(demand_props(), CONSTRAINTS, &[provider])
        .await
        .unwrap();
    let agreement = outcome.agreements[0].agreement_id;

    // Negotiation unsubscribes once every provider agreed
    let err = requestor
        .collect_offers(outcome.subscription_id, TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::SubscriptionNotFound { .. }));

    // New offers no longer reach the closed subscription
    market.add_provider(ProviderConfig::new("provider-2")).unwrap();
    assert!(market.store().collect(&outcome.subscription_id).is_err());

    let activity = requestor.create_activity(agreement, TIMEOUT).await.unwrap();
    requestor.destroy_activity(activity, TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn negotiation_with_silent_provider_times_out() {
    let market = market();
    let requestor = market.add_requestor("requestor-1", false);
    let mut coordinator = NegotiationCoordinator::new(&requestor, Duration::from_millis(50));

    let err = coordinator
        .negotiate(demand_props(), CONSTRAINTS, &[NodeId::new()])
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::Timeout { .. }));
}

#[tokio::test]
async fn offers_not_matching_demand_constraints_are_not_proposed() {
    let market = market();
    market
        .add_provider(ProviderConfig::new("single-activity").with_multi_activity(false))
        .unwrap();
    let requestor = market.add_requestor("requestor-1", false);

    let sub = requestor
        .subscribe_demand(demand_props(), CONSTRAINTS, TIMEOUT)
        .await
        .unwrap();
    let events = requestor
        .collect_offers(sub, Duration::from_millis(50))
        .await
        .unwrap();
    assert!(events.is_empty());
}
