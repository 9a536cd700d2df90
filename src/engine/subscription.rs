//! Per-peer-pair subscription state and the catch-up gate.
//!
//! Subscription is tracked per (local peer, remote peer) pair: a newly
//! joining peer puts every established peer back into `Subscribing` toward
//! it specifically, while they stay `CaughtUp` toward everyone else.

use std::{
    collections::HashSet,
    sync::{Arc, RwLock},
};

use crate::types::PeerId;

/// State of the local engine's subscription toward one remote peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    /// No interest established (peer unknown or departed).
    Unsubscribed,
    /// Waiting on the peer's full-state delta.
    Subscribing,
    /// The peer's full-state delta has been received and applied.
    CaughtUp,
}

/// How a [`CatchUpGate`] ended up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateResolution {
    /// Still waiting on at least one peer's full state.
    Pending,
    /// Every awaited peer's full state has been applied.
    Complete,
    /// The session tore down before the gate could complete.
    Cancelled,
}

#[derive(Debug)]
struct GateState {
    waiting: HashSet<PeerId>,
    /// While open, peers that join are added to the wait set. Gates close
    /// at the end of the first connected tick; peers joining later never
    /// reopen a gate.
    open: bool,
    cancelled: bool,
}

/// Handle that resolves once the local engine has applied the full-state
/// delta of every peer it was subscribing to when the gate was created.
/// Inspect it each tick; it resolves to `Cancelled` rather than hanging if
/// the session tears down first.
#[derive(Clone, Debug)]
pub struct CatchUpGate {
    state: Arc<RwLock<GateState>>,
}

impl CatchUpGate {
    pub(crate) fn new(waiting: HashSet<PeerId>, open: bool) -> Self {
        Self {
            state: Arc::new(RwLock::new(GateState {
                waiting,
                open,
                cancelled: false,
            })),
        }
    }

    pub fn resolution(&self) -> GateResolution {
        let Ok(state) = self.state.as_ref().read() else {
            return GateResolution::Cancelled;
        };
        if state.cancelled {
            GateResolution::Cancelled
        } else if state.waiting.is_empty() && !state.open {
            GateResolution::Complete
        } else {
            GateResolution::Pending
        }
    }

    pub fn is_complete(&self) -> bool {
        self.resolution() == GateResolution::Complete
    }

    /// Peers whose full state is still outstanding.
    pub fn pending_peers(&self) -> Vec<PeerId> {
        match self.state.as_ref().read() {
            Ok(state) => state.waiting.iter().copied().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.resolution() != GateResolution::Pending
    }

    pub(crate) fn add_waiting(&self, peer: PeerId) {
        if let Ok(mut state) = self.state.as_ref().write() {
            if state.open && !state.cancelled {
                state.waiting.insert(peer);
            }
        }
    }

    /// A peer's full state arrived, or the peer left mid-subscribe; either
    /// way it no longer blocks the gate.
    pub(crate) fn settle_peer(&self, peer: PeerId) {
        if let Ok(mut state) = self.state.as_ref().write() {
            state.waiting.remove(&peer);
        }
    }

    pub(crate) fn close(&self) {
        if let Ok(mut state) = self.state.as_ref().write() {
            state.open = false;
        }
    }

    pub(crate) fn cancel(&self) {
        if let Ok(mut state) = self.state.as_ref().write() {
            state.cancelled = true;
        }
    }
}
