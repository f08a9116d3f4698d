//! Payment Ledger
//!
//! Requestors reserve funds in allocations; providers issue one invoice per
//! terminated agreement; accepting an invoice moves money from the allocation
//! to the provider's balance.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{info, warn};

use agora_types::{
    Agreement, AgreementId, AgreementState, Allocation, AllocationId, Invoice, InvoiceId,
    InvoiceStatus, MarketError, NodeId, Result,
};

#[derive(Debug, Default)]
struct LedgerState {
    /// Unreserved funds per node
    balances: HashMap<NodeId, Decimal>,
    allocations: HashMap<AllocationId, Allocation>,
    invoices: HashMap<InvoiceId, Invoice>,
    by_agreement: HashMap<AgreementId, InvoiceId>,
}

#[derive(Debug, Default)]
pub struct PaymentLedger {
    state: Mutex<LedgerState>,
}

impl PaymentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit unreserved funds to a node
    pub fn fund(&self, node: NodeId, amount: Decimal) -> Result<Decimal> {
        if amount <= Decimal::ZERO {
            return Err(MarketError::protocol(node, "funding amount must be positive"));
        }
        let mut state = self.state.lock();
        let balance = state.balances.entry(node).or_insert(Decimal::ZERO);
        *balance += amount;
        info!(node = %node, amount = %amount, balance = %balance, "Node funded");
        Ok(*balance)
    }

    /// Unreserved funds
    pub fn balance(&self, node: &NodeId) -> Decimal {
        self.state
            .lock()
            .balances
            .get(node)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Reserve `amount` of the owner's unreserved funds
    pub fn create_allocation(
        &self,
        owner: NodeId,
        amount: Decimal,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Allocation> {
        if amount <= Decimal::ZERO {
            return Err(MarketError::protocol(owner, "allocation amount must be positive"));
        }
        let mut state = self.state.lock();
        release_expired_locked(&mut state, Utc::now());
        let available = state.balances.get(&owner).copied().unwrap_or(Decimal::ZERO);
        if amount > available {
            warn!(
                owner = %owner,
                requested = %amount,
                available = %available,
                "Allocation rejected"
            );
            return Err(MarketError::InsufficientFunds {
                owner: owner.to_string(),
                requested: amount.to_string(),
                available: available.to_string(),
            });
        }

        state.balances.insert(owner, available - amount);
        let allocation = Allocation {
            id: AllocationId::new(),
            owner,
            total_amount: amount,
            spent_amount: Decimal::ZERO,
            created_at: Utc::now(),
            expires_at,
            released: false,
        };
        state.allocations.insert(allocation.id, allocation.clone());

        info!(
            allocation_id = %allocation.id,
            owner = %owner,
            amount = %amount,
            "Allocation created"
        );
        Ok(allocation)
    }

    /// Return an allocation's unspent amount to its owner
    pub fn release_allocation(&self, allocation_id: &AllocationId) -> Result<Allocation> {
        let mut state = self.state.lock();
        release_locked(&mut state, allocation_id)
    }

    /// Release every allocation expired at `now`
    ///
    /// Expired allocations are also swept whenever an allocation is created
    /// or charged, so their funds never stay reserved.
    pub fn release_expired(&self, now: DateTime<Utc>) -> Vec<Allocation> {
        let mut state = self.state.lock();
        release_expired_locked(&mut state, now)
    }

    pub fn allocation(&self, allocation_id: &AllocationId) -> Result<Allocation> {
        self.state
            .lock()
            .allocations
            .get(allocation_id)
            .cloned()
            .ok_or_else(|| allocation_not_found(allocation_id))
    }

    /// Issue the final invoice for a terminated agreement
    ///
    /// Issuing twice for the same agreement returns the first invoice.
    pub fn issue_invoice(&self, agreement: &Agreement, amount: Decimal) -> Result<Invoice> {
        if agreement.state != AgreementState::Terminated {
            return Err(MarketError::protocol(
                agreement.id,
                format!("cannot invoice agreement in state {}", agreement.state),
            ));
        }
        let mut state = self.state.lock();
        if let Some(existing) = state
            .by_agreement
            .get(&agreement.id)
            .and_then(|id| state.invoices.get(id))
        {
            return Ok(existing.clone());
        }

        let invoice = Invoice {
            id: InvoiceId::new(),
            agreement_id: agreement.id,
            issuer: agreement.provider,
            recipient: agreement.requestor,
            amount,
            status: InvoiceStatus::Issued,
            issued_at: Utc::now(),
            accepted_at: None,
        };
        state.by_agreement.insert(agreement.id, invoice.id);
        state.invoices.insert(invoice.id, invoice.clone());

        info!(
            invoice_id = %invoice.id,
            agreement_id = %agreement.id,
            amount = %amount,
            "Invoice issued"
        );
        Ok(invoice)
    }

    pub fn invoice_for(&self, agreement_id: &AgreementId) -> Option<Invoice> {
        let state = self.state.lock();
        state
            .by_agreement
            .get(agreement_id)
            .and_then(|id| state.invoices.get(id))
            .cloned()
    }

    pub fn invoice(&self, invoice_id: &InvoiceId) -> Result<Invoice> {
        self.state
            .lock()
            .invoices
            .get(invoice_id)
            .cloned()
            .ok_or_else(|| MarketError::InvoiceNotFound {
                invoice_id: invoice_id.to_string(),
            })
    }

    /// Pay an invoice from an allocation owned by the invoice recipient
    pub fn accept_invoice(
        &self,
        invoice_id: &InvoiceId,
        allocation_id: &AllocationId,
    ) -> Result<Invoice> {
        let mut guard = self.state.lock();
        release_expired_locked(&mut guard, Utc::now());
        let state = &mut *guard;

        let invoice = state
            .invoices
            .get_mut(invoice_id)
            .ok_or_else(|| MarketError::InvoiceNotFound {
                invoice_id: invoice_id.to_string(),
            })?;
        if invoice.status == InvoiceStatus::Accepted {
            return Err(MarketError::protocol(invoice_id, "invoice already accepted"));
        }

        let allocation = state
            .allocations
            .get_mut(allocation_id)
            .ok_or_else(|| allocation_not_found(allocation_id))?;
        if allocation.owner != invoice.recipient {
            return Err(MarketError::protocol(allocation_id, "allocation owned by another node"));
        }
        if allocation.released {
            return Err(MarketError::protocol(allocation_id, "allocation already released"));
        }
        if allocation.remaining_amount() < invoice.amount {
            return Err(MarketError::InsufficientFunds {
                owner: allocation.owner.to_string(),
                requested: invoice.amount.to_string(),
                available: allocation.remaining_amount().to_string(),
            });
        }

        allocation.spent_amount += invoice.amount;
        invoice.status = InvoiceStatus::Accepted;
        invoice.accepted_at = Some(Utc::now());
        *state.balances.entry(invoice.issuer).or_insert(Decimal::ZERO) += invoice.amount;

        info!(
            invoice_id = %invoice_id,
            allocation_id = %allocation_id,
            amount = %invoice.amount,
            "Invoice accepted"
        );
        Ok(invoice.clone())
    }
}

fn release_locked(state: &mut LedgerState, allocation_id: &AllocationId) -> Result<Allocation> {
    let allocation = state
        .allocations
        .get_mut(allocation_id)
        .ok_or_else(|| allocation_not_found(allocation_id))?;
    if allocation.released {
        return Err(MarketError::protocol(allocation_id, "allocation already released"));
    }
    allocation.released = true;
    let refund = allocation.remaining_amount();
    let released = allocation.clone();
    *state.balances.entry(released.owner).or_insert(Decimal::ZERO) += refund;
    info!(allocation_id = %allocation_id, refund = %refund, "Allocation released");
    Ok(released)
}

fn release_expired_locked(state: &mut LedgerState, now: DateTime<Utc>) -> Vec<Allocation> {
    let expired: Vec<AllocationId> = state
        .allocations
        .values()
        .filter(|a| !a.released && a.is_expired(now))
        .map(|a| a.id)
        .collect();
    expired
        .iter()
        .filter_map(|id| release_locked(state, id).ok())
        .collect()
}

fn allocation_not_found(allocation_id: &AllocationId) -> MarketError {
    MarketError::AllocationNotFound {
        allocation_id: allocation_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_types::ProposalId;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn terminated(requestor: NodeId, provider: NodeId) -> Agreement {
        Agreement {
            id: AgreementId::new(),
            requestor,
            provider,
            demand_proposal_id: ProposalId::new(),
            offer_proposal_id: ProposalId::new(),
            multi_activity: true,
            state: AgreementState::Terminated,
            created_at: Utc::now(),
            approved_at: Some(Utc::now()),
            terminated_at: Some(Utc::now()),
            terminated_by: None,
            reason: None,
        }
    }

    #[test]
    fn test_allocation_cannot_exceed_funds() {
        let ledger = PaymentLedger::new();
        let requestor = NodeId::new();
        ledger.fund(requestor, dec!(100)).unwrap();

        let err = ledger.create_allocation(requestor, dec!(101), None).unwrap_err();
        assert!(matches!(err, MarketError::InsufficientFunds { .. }));

        ledger.create_allocation(requestor, dec!(60), None).unwrap();
        // Only 40 left unreserved
        let err = ledger.create_allocation(requestor, dec!(50), None).unwrap_err();
        assert!(matches!(err, MarketError::InsufficientFunds { .. }));
        assert_eq!(ledger.balance(&requestor), dec!(40));
    }

    #[test]
    fn test_invoice_paid_from_allocation() {
        let ledger = PaymentLedger::new();
        let requestor = NodeId::new();
        let provider = NodeId::new();
        ledger.fund(requestor, dec!(10)).unwrap();
        let allocation = ledger.create_allocation(requestor, dec!(5), None).unwrap();

        let agreement = terminated(requestor, provider);
        let invoice = ledger.issue_invoice(&agreement, dec!(0.03)).unwrap();
        assert_eq!(ledger.issue_invoice(&agreement, dec!(9)).unwrap().id, invoice.id);

        let paid = ledger.accept_invoice(&invoice.id, &allocation.id).unwrap();
        assert_eq!(paid.status, InvoiceStatus::Accepted);
        assert_eq!(ledger.balance(&provider), dec!(0.03));
        assert_eq!(
            ledger.allocation(&allocation.id).unwrap().remaining_amount(),
            dec!(4.97)
        );

        let err = ledger.accept_invoice(&invoice.id, &allocation.id).unwrap_err();
        assert!(matches!(err, MarketError::ProtocolViolation { .. }));
    }

    #[test]
    fn test_invoice_larger_than_allocation() {
        let ledger = PaymentLedger::new();
        let requestor = NodeId::new();
        ledger.fund(requestor, dec!(10)).unwrap();
        let allocation = ledger.create_allocation(requestor, dec!(1), None).unwrap();
        let invoice = ledger
            .issue_invoice(&terminated(requestor, NodeId::new()), dec!(2))
            .unwrap();

        let err = ledger.accept_invoice(&invoice.id, &allocation.id).unwrap_err();
        assert!(matches!(err, MarketError::InsufficientFunds { .. }));
    }

    #[test]
    fn test_only_terminated_agreements_invoiced() {
        let ledger = PaymentLedger::new();
        let mut agreement = terminated(NodeId::new(), NodeId::new());
        agreement.state = AgreementState::Approved;
        assert!(ledger.issue_invoice(&agreement, dec!(1)).is_err());
        assert!(ledger.invoice_for(&agreement.id).is_none());
    }

    #[test]
    fn test_release_expired_refunds_owner() {
        let ledger = PaymentLedger::new();
        let requestor = NodeId::new();
        ledger.fund(requestor, dec!(10)).unwrap();
        let now = Utc::now();
        let short = ledger
            .create_allocation(requestor, dec!(3), Some(now + Duration::seconds(1)))
            .unwrap();
        ledger
            .create_allocation(requestor, dec!(2), Some(now + Duration::hours(1)))
            .unwrap();

        let released = ledger.release_expired(now + Duration::seconds(5));
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].id, short.id);
        assert_eq!(ledger.balance(&requestor), dec!(8));
        assert!(ledger.release_allocation(&short.id).is_err());
    }

    #[test]
    fn test_expired_allocation_frees_funds_for_next_allocation() {
        let ledger = PaymentLedger::new();
        let requestor = NodeId::new();
        ledger.fund(requestor, dec!(1000)).unwrap();
        let short = ledger
            .create_allocation(requestor, dec!(600), Some(Utc::now() + Duration::milliseconds(50)))
            .unwrap();

        std::thread::sleep(std::time::Duration::from_millis(150));

        ledger.create_allocation(requestor, dec!(600), None).unwrap();
        assert!(ledger.allocation(&short.id).unwrap().released);
        assert_eq!(ledger.balance(&requestor), dec!(400));
    }

    #[test]
    fn test_expired_allocation_cannot_pay() {
        let ledger = PaymentLedger::new();
        let requestor = NodeId::new();
        ledger.fund(requestor, dec!(10)).unwrap();
        let allocation = ledger
            .create_allocation(requestor, dec!(5), Some(Utc::now() + Duration::milliseconds(20)))
            .unwrap();
        let invoice = ledger
            .issue_invoice(&terminated(requestor, NodeId::new()), dec!(1))
            .unwrap();

        std::thread::sleep(std::time::Duration::from_millis(100));

        let err = ledger.accept_invoice(&invoice.id, &allocation.id).unwrap_err();
        assert!(matches!(err, MarketError::ProtocolViolation { .. }));
        assert_eq!(ledger.balance(&requestor), dec!(10));
    }
}
