//! Agora Types - Canonical domain types for the Agora compute market
//!
//! This crate contains the foundational types shared by every Agora crate:
//!
//! - Identity types (NodeId, ProposalId, AgreementId, ActivityId, ...)
//! - Property bundles and the constraint filter language
//! - Demands, offers, proposals and rejection records
//! - Agreement and activity state
//! - Allocations and invoices
//! - The market error taxonomy
//!
//! # Negotiation Flow
//!
//! ```text
//! Offer + Demand → Proposal ⇄ Counter-proposal → Agreement → Activity → Invoice
//! ```

pub mod identity;
pub mod properties;
pub mod negotiation;
pub mod agreement;
pub mod activity;
pub mod payment;
pub mod error;

pub use identity::*;
pub use properties::*;
pub use negotiation::*;
pub use agreement::*;
pub use activity::*;
pub use payment::*;
pub use error::*;
