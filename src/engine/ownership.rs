//! Ownership transfer tickets.
//!
//! A `request_ownership` call hands back an [`OwnershipTicket`]: a shared
//! status cell the engine resolves when the answer arrives in the (old)
//! owner's delta stream. Tickets never hang — departure of the object or
//! the session resolves them as cancelled.

use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::types::NetworkId;

/// Errors that can occur during ownership operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OwnershipError {
    /// The object is not present in the local state graph
    #[error("object {id} is not present in the state graph")]
    UnknownObject { id: NetworkId },

    /// The local peer already owns the object
    #[error("object {id} is already owned by the local peer")]
    AlreadyOwned { id: NetworkId },

    /// A transfer request for this object is already outstanding locally
    #[error("a transfer request for object {id} is already in flight")]
    RequestInFlight { id: NetworkId },

    /// The operation requires ownership the local peer does not hold
    #[error("object {id} is not owned by the local peer")]
    NotOwner { id: NetworkId },

    /// The request lost a race against a concurrent transfer; retry later
    #[error("concurrent ownership transfer won for object {id}")]
    Conflict { id: NetworkId },
}

/// Outcome of an ownership transfer request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OwnershipStatus {
    /// Waiting on the current owner's (or authority's) answer.
    Pending,
    /// The local peer is now the owner.
    Granted,
    /// A concurrent transfer won; the request can be retried.
    Denied,
    /// The object or the session went away before an answer arrived.
    Cancelled,
}

/// Shared handle onto one outstanding transfer request. Inspect it each
/// tick.
#[derive(Clone, Debug)]
pub struct OwnershipTicket {
    object: NetworkId,
    status: Arc<RwLock<OwnershipStatus>>,
}

impl OwnershipTicket {
    pub(crate) fn new(object: NetworkId) -> Self {
        Self {
            object,
            status: Arc::new(RwLock::new(OwnershipStatus::Pending)),
        }
    }

    pub fn object(&self) -> NetworkId {
        self.object
    }

    pub fn status(&self) -> OwnershipStatus {
        match self.status.as_ref().read() {
            Ok(status) => *status,
            Err(_) => OwnershipStatus::Cancelled,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status() == OwnershipStatus::Pending
    }

    pub(crate) fn resolve(&self, status: OwnershipStatus) {
        if let Ok(mut cell) = self.status.as_ref().write() {
            // First resolution wins.
            if *cell == OwnershipStatus::Pending {
                *cell = status;
            }
        }
    }
}
