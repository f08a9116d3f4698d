//! Agreement Admission Controller
//!
//! Each provider advertises a fixed number of agreement slots. `confirm`
//! performs the check-and-reserve under a single lock, so concurrent confirms
//! against the last slot can never both succeed.
//!
//! ```text
//! confirm ──► slot free? ──yes──► reserve ──► Approved
//!                 │
//!                 no ───────────────────────► Rejected("No capacity available. ...")
//!
//! terminate ──► release ──► slot free again
//! ```

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tracing::{debug, info};

use agora_types::{capacity_reason, AgreementId, MarketError, NodeId, Reason};

/// Request to occupy one of a provider's slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgreementProposal {
    pub agreement_id: AgreementId,
    pub provider: NodeId,
}

/// Slot reserved for the agreement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Approved {
    pub agreement_id: AgreementId,
    pub provider: NodeId,
    /// Slots in use after this reservation
    pub active: usize,
}

/// Provider had no free slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejected {
    pub agreement_id: AgreementId,
    pub provider: NodeId,
    pub limit: usize,
    pub reason: Reason,
}

impl From<Rejected> for MarketError {
    fn from(rejected: Rejected) -> Self {
        MarketError::CapacityExceeded {
            provider: rejected.provider.to_string(),
            limit: rejected.limit,
        }
    }
}

#[derive(Debug, Default)]
struct ProviderSlots {
    capacity: usize,
    active: HashSet<AgreementId>,
}

/// Per-provider agreement capacity
#[derive(Debug, Default)]
pub struct AgreementAdmission {
    slots: Mutex<HashMap<NodeId, ProviderSlots>>,
}

impl AgreementAdmission {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a provider and its slot count
    pub fn register_provider(&self, provider: NodeId, capacity: usize) {
        let mut slots = self.slots.lock();
        slots.entry(provider).or_default().capacity = capacity;
        info!(provider = %provider, capacity, "Provider capacity registered");
    }

    /// Atomically reserve a slot or reject
    ///
    /// Confirming an agreement that already holds a slot is idempotent.
    /// Unknown providers have zero slots.
    pub fn confirm(&self, proposal: &AgreementProposal) -> Result<Approved, Rejected> {
        let mut slots = self.slots.lock();
        let entry = slots.entry(proposal.provider).or_default();

        if entry.active.contains(&proposal.agreement_id) || entry.active.len() < entry.capacity {
            entry.active.insert(proposal.agreement_id);
            debug!(
                agreement_id = %proposal.agreement_id,
                provider = %proposal.provider,
                active = entry.active.len(),
                capacity = entry.capacity,
                "Agreement slot reserved"
            );
            return Ok(Approved {
                agreement_id: proposal.agreement_id,
                provider: proposal.provider,
                active: entry.active.len(),
            });
        }

        info!(
            agreement_id = %proposal.agreement_id,
            provider = %proposal.provider,
            limit = entry.capacity,
            "Agreement rejected, no capacity"
        );
        Err(Rejected {
            agreement_id: proposal.agreement_id,
            provider: proposal.provider,
            limit: entry.capacity,
            reason: Reason::new(capacity_reason(entry.capacity)),
        })
    }

    /// Free the slot held by `agreement_id`; returns whether one was held
    pub fn release(&self, provider: &NodeId, agreement_id: &AgreementId) -> bool {
        let mut slots = self.slots.lock();
        let released = slots
            .get_mut(provider)
            .map(|s| s.active.remove(agreement_id))
            .unwrap_or(false);
        if released {
            debug!(agreement_id = %agreement_id, provider = %provider, "Agreement slot released");
        }
        released
    }

    /// Non-reserving capacity check used when answering proposals
    pub fn has_capacity(&self, provider: &NodeId) -> bool {
        self.slots
            .lock()
            .get(provider)
            .map(|s| s.active.len() < s.capacity)
            .unwrap_or(false)
    }

    pub fn active_count(&self, provider: &NodeId) -> usize {
        self.slots.lock().get(provider).map(|s| s.active.len()).unwrap_or(0)
    }

    pub fn capacity(&self, provider: &NodeId) -> usize {
        self.slots.lock().get(provider).map(|s| s.capacity).unwrap_or(0)
    }
}
