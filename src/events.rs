/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of the events a [`ViewsManager`](crate::view_change::implementation::ViewsManager)
//! publishes.
//!
//! An event for a given action indicates that the action has been completed. Events are published on
//! the optional `Sender<Event>` passed to the `ViewsManager`, and handled by the
//! [event bus](crate::event_bus) thread: logged (see [`logging`](crate::logging)) and passed to
//! user-registered handlers.

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::types::data_types::{CryptoHash, ReplicaID, SeqNumber, ViewNumber};
use crate::view_change::{
    messages::{NewViewMessage, ViewChangeMessage},
    types::Rejection,
};

pub enum Event {
    // Events that involve admitting evidence from other replicas.
    AcceptViewChange(AcceptViewChangeEvent),
    AcceptNewView(AcceptNewViewEvent),
    RejectEvidence(RejectEvidenceEvent),
    // Events that involve creating evidence.
    ExitView(ExitViewEvent),
    CreateNewView(CreateNewViewEvent),
    // Events that involve moving to a new view.
    ComputeRestrictions(ComputeRestrictionsEvent),
    RecoverPrePrepare(RecoverPrePrepareEvent),
    EnterView(EnterViewEvent),
    AbandonPendingView(AbandonPendingViewEvent),
}

impl Event {
    /// Send the event to the event bus, if there is one.
    pub(crate) fn publish(self, event_publisher: &Option<Sender<Event>>) {
        if let Some(event_publisher) = event_publisher {
            // The event bus may have been shut down before the manager.
            let _ = event_publisher.send(self);
        }
    }
}

/// A `ViewChangeMessage` from another replica was stored.
pub struct AcceptViewChangeEvent {
    pub timestamp: SystemTime,
    pub view_change: ViewChangeMessage,
}

/// A `NewViewMessage` from another replica was stored.
pub struct AcceptNewViewEvent {
    pub timestamp: SystemTime,
    pub new_view: NewViewMessage,
}

/// Evidence from `origin` about `view` was rejected.
pub struct RejectEvidenceEvent {
    pub timestamp: SystemTime,
    pub origin: ReplicaID,
    pub view: ViewNumber,
    pub reason: Rejection,
}

/// The local replica left `view` and created `view_change`.
pub struct ExitViewEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
    pub view_change: ViewChangeMessage,
}

/// The local replica, as the primary of `new_view.view`, created `new_view`.
pub struct CreateNewViewEvent {
    pub timestamp: SystemTime,
    pub new_view: NewViewMessage,
}

/// The restrictions of `view` were computed and installed.
pub struct ComputeRestrictionsEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
    pub stable_lower_bound: SeqNumber,
    pub bound_slots: usize,
    pub missing_slots: usize,
}

/// The missing content of slot `seq` was recovered.
pub struct RecoverPrePrepareEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
    pub seq: SeqNumber,
    pub digest: CryptoHash,
}

/// `view` became the active view.
pub struct EnterViewEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
    pub stable_lower_bound: SeqNumber,
    pub reissued_pre_prepares: usize,
}

/// The attempt to enter `abandoned` was given up in favour of `target`.
pub struct AbandonPendingViewEvent {
    pub timestamp: SystemTime,
    pub abandoned: ViewNumber,
    pub target: ViewNumber,
}
