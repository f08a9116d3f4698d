//! Identity types for the Agora market
//!
//! All identity types are strongly typed wrappers around UUIDs so that a
//! proposal id can never be passed where an agreement id is expected.
//! Entities refer to each other only through these ids.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Macro to generate ID types with common implementations
macro_rules! define_id_type {
    ($name:ident, $prefix:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random ID
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Parse from a string (with or without prefix)
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                let s = s.strip_prefix(concat!($prefix, "_")).unwrap_or(s);
                Ok(Self(Uuid::parse_str(s)?))
            }

            /// Get the inner UUID
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

// Participants
define_id_type!(NodeId, "node", "Unique identifier for a market node (requestor or provider)");

// Negotiation
define_id_type!(SubscriptionId, "sub", "Unique identifier for a demand or offer subscription");
define_id_type!(ProposalId, "prop", "Unique identifier for a proposal in the negotiation log");
define_id_type!(AgreementId, "agr", "Unique identifier for an agreement");

// Execution
define_id_type!(ActivityId, "act", "Unique identifier for an activity");
define_id_type!(BatchId, "batch", "Unique identifier for an exec batch");

// Payment
define_id_type!(AllocationId, "alloc", "Unique identifier for a payment allocation");
define_id_type!(InvoiceId, "inv", "Unique identifier for an invoice");
