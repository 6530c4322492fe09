//! Reference-counted upstream subscriptions.
//!
//! Each room counts the local connections currently in it. The relay holds
//! one backbone subscription per room while that count is non-zero, shared by
//! every local member, so backbone churn scales with active rooms rather than
//! with connections.
//!
//! Every room's state sits behind its own async mutex. Callers that must issue
//! the upstream subscribe/unsubscribe in the same order as the count changes
//! hold the guard from [`SubscriptionManager::lock`] across that call.

use crate::registry::{RoomId, RoomRegistry};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::{Mutex, MutexGuard};
use tracing::trace;

/// Result of adding a member to a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOutcome {
    /// The count went 0 → 1; the caller must subscribe upstream.
    pub subscribed_now: bool,
}

/// Result of removing a member from a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaveOutcome {
    /// The count reached 0; the caller must unsubscribe upstream.
    pub unsubscribed_now: bool,
}

/// Subscription state of one room.
///
/// Invariant: `upstream` is true exactly when `members > 0`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RoomSubscription {
    members: usize,
    upstream: bool,
}

impl RoomSubscription {
    /// Count one more member.
    pub fn join(&mut self) -> JoinOutcome {
        self.members += 1;
        let subscribed_now = !self.upstream;
        self.upstream = true;
        JoinOutcome { subscribed_now }
    }

    /// Count one member fewer. Leaving an empty room is a no-op.
    pub fn leave(&mut self) -> LeaveOutcome {
        if self.members == 0 {
            return LeaveOutcome {
                unsubscribed_now: false,
            };
        }

        self.members -= 1;
        let unsubscribed_now = self.members == 0;
        if unsubscribed_now {
            self.upstream = false;
        }
        LeaveOutcome { unsubscribed_now }
    }

    /// Current member count.
    #[must_use]
    pub fn members(&self) -> usize {
        self.members
    }

    /// Whether the room should be subscribed upstream.
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.upstream
    }
}

/// Point-in-time view of one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomSnapshot {
    /// Room name.
    pub room: String,
    /// Local member count.
    pub members: usize,
    /// Whether the room is subscribed upstream.
    pub subscribed: bool,
}

/// Tracks member counts and upstream subscription state for every room.
///
/// Entries for the whole closed set are created up front with count 0.
#[derive(Debug)]
pub struct SubscriptionManager {
    rooms: HashMap<RoomId, Mutex<RoomSubscription>>,
    /// Configuration order, for stable snapshots.
    order: Vec<RoomId>,
}

impl SubscriptionManager {
    /// Create a manager covering every room in the registry.
    #[must_use]
    pub fn new(registry: &RoomRegistry) -> Self {
        let rooms = registry
            .rooms()
            .iter()
            .map(|room| (room.clone(), Mutex::new(RoomSubscription::default())))
            .collect();

        Self {
            rooms,
            order: registry.rooms().to_vec(),
        }
    }

    /// Lock a room's state. `None` if the room is not in the registry.
    pub async fn lock(&self, room: &str) -> Option<MutexGuard<'_, RoomSubscription>> {
        match self.rooms.get(room) {
            Some(slot) => Some(slot.lock().await),
            None => None,
        }
    }

    /// Add a member to a room.
    pub async fn join(&self, room: &str) -> Option<JoinOutcome> {
        let outcome = self.lock(room).await?.join();
        trace!(room = %room, subscribed_now = outcome.subscribed_now, "Member counted");
        Some(outcome)
    }

    /// Remove a member from a room.
    pub async fn leave(&self, room: &str) -> Option<LeaveOutcome> {
        let outcome = self.lock(room).await?.leave();
        trace!(room = %room, unsubscribed_now = outcome.unsubscribed_now, "Member released");
        Some(outcome)
    }

    /// Local member count of a room; 0 for unknown rooms.
    pub async fn member_count(&self, room: &str) -> usize {
        match self.lock(room).await {
            Some(state) => state.members(),
            None => 0,
        }
    }

    /// Whether a room is currently subscribed upstream.
    pub async fn is_subscribed(&self, room: &str) -> bool {
        match self.lock(room).await {
            Some(state) => state.is_subscribed(),
            None => false,
        }
    }

    /// Number of rooms currently subscribed upstream.
    pub async fn subscribed_count(&self) -> usize {
        let mut count = 0;
        for room in &self.order {
            if self.is_subscribed(room.as_str()).await {
                count += 1;
            }
        }
        count
    }

    /// Snapshot of every room in configuration order.
    pub async fn snapshot(&self) -> Vec<RoomSnapshot> {
        let mut rooms = Vec::with_capacity(self.order.len());
        for room in &self.order {
            if let Some(state) = self.lock(room.as_str()).await {
                rooms.push(RoomSnapshot {
                    room: room.to_string(),
                    members: state.members(),
                    subscribed: state.is_subscribed(),
                });
            }
        }
        rooms
    }
}
