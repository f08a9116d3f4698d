//! Agora Market - negotiation and admission engine
//!
//! Requestors publish demands, providers publish offers, and the two sides
//! negotiate agreements under strict capacity limits:
//!
//! - **Proposal Store**: append-only proposal log, per-subscription FIFO queues
//! - **Agreement Admission**: atomic per-provider slot reservation
//! - **Activity Admission**: at most N live activities per agreement
//! - **Agreement Lifecycle**: Proposed → Pending → Approved → Terminated
//! - **Provider Negotiator**: answers or rejects counter-proposals, re-offers
//!   rejected ones once a slot frees up
//! - **Negotiation Coordinator**: requestor-side driver with renegotiation
//! - **Exe-unit simulator** and **Payment Ledger** for the run and pay phases
//!
//! # Flow
//!
//! ```text
//! subscribe ─► proposal ⇄ counter ─► agreement ─► activity × N ─► terminate ─► invoice
//!                                        │                            │
//!                                 capacity check               slot released,
//!                                                              rejected proposals re-offered
//! ```

pub mod activity;
pub mod admission;
pub mod api;
pub mod coordinator;
pub mod events;
pub mod exeunit;
pub mod lifecycle;
pub mod market;
pub mod payment;
pub mod provider;
pub mod store;

pub use activity::{ActivityAdmission, ActivityPolicy};
pub use admission::{AgreementAdmission, AgreementProposal, Approved, Rejected};
pub use api::{MarketApi, Requestor};
pub use coordinator::{
    NegotiatedAgreement, NegotiationCoordinator, NegotiationOutcome, PendingRenegotiation,
};
pub use events::{EventHub, EventKind, MarketEvent, Probe};
pub use exeunit::ExeUnitSimulator;
pub use lifecycle::{AgreementLifecycle, Approval};
pub use market::{Market, MarketConfig};
pub use payment::PaymentLedger;
pub use provider::{ProviderConfig, ProviderNode, RetainedProposal};
pub use store::ProposalStore;

pub use agora_types;
