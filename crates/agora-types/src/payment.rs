//! Payment types: allocations reserved by requestors, invoices issued by
//! providers once an agreement terminates.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::identity::{AgreementId, AllocationId, InvoiceId, NodeId};

/// Funds a requestor reserves for paying invoices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: AllocationId,
    pub owner: NodeId,
    pub total_amount: Decimal,
    pub spent_amount: Decimal,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub released: bool,
}

impl Allocation {
    pub fn remaining_amount(&self) -> Decimal {
        self.total_amount - self.spent_amount
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|t| now >= t).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceStatus {
    Issued,
    Accepted,
}

/// Final bill for a terminated agreement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: InvoiceId,
    pub agreement_id: AgreementId,
    pub issuer: NodeId,
    pub recipient: NodeId,
    pub amount: Decimal,
    pub status: InvoiceStatus,
    pub issued_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
}

/// Linear pricing: a start fee plus a fee per completed exec batch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearPricing {
    pub start_price: Decimal,
    pub per_batch_price: Decimal,
}

impl LinearPricing {
    pub fn cost(&self, completed_batches: u64) -> Decimal {
        self.start_price + self.per_batch_price * Decimal::from(completed_batches)
    }
}

impl Default for LinearPricing {
    fn default() -> Self {
        Self {
            start_price: Decimal::ZERO,
            per_batch_price: Decimal::new(1, 2),
        }
    }
}
