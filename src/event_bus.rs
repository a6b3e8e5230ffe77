/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Thread that receives [events](crate::events) from a
//! [`ViewsManager`](crate::view_change::implementation::ViewsManager) and passes each of them to the
//! handlers registered for its type.
//!
//! The event bus only reads events. It never touches the state of the `ViewsManager`, which stays
//! single-threaded.

use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::events::*;
use crate::logging::Logger;

pub type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

/// The handlers invoked for each type of event: the default logger (if logging is enabled), followed by
/// the handlers registered by the user.
pub struct EventHandlers {
    pub(crate) accept_view_change_handlers: Vec<HandlerPtr<AcceptViewChangeEvent>>,
    pub(crate) accept_new_view_handlers: Vec<HandlerPtr<AcceptNewViewEvent>>,
    pub(crate) reject_evidence_handlers: Vec<HandlerPtr<RejectEvidenceEvent>>,
    pub(crate) exit_view_handlers: Vec<HandlerPtr<ExitViewEvent>>,
    pub(crate) create_new_view_handlers: Vec<HandlerPtr<CreateNewViewEvent>>,
    pub(crate) compute_restrictions_handlers: Vec<HandlerPtr<ComputeRestrictionsEvent>>,
    pub(crate) recover_pre_prepare_handlers: Vec<HandlerPtr<RecoverPrePrepareEvent>>,
    pub(crate) enter_view_handlers: Vec<HandlerPtr<EnterViewEvent>>,
    pub(crate) abandon_pending_view_handlers: Vec<HandlerPtr<AbandonPendingViewEvent>>,
}

impl EventHandlers {
    /// Create a set of handlers that contains the default logger of every event type if `log_events` is
    /// set, and no other handlers.
    pub fn new(log_events: bool) -> Self {
        fn default_logger<T: Logger>(log_events: bool) -> Vec<HandlerPtr<T>> {
            if log_events {
                vec![T::get_logger()]
            } else {
                Vec::new()
            }
        }

        Self {
            accept_view_change_handlers: default_logger(log_events),
            accept_new_view_handlers: default_logger(log_events),
            reject_evidence_handlers: default_logger(log_events),
            exit_view_handlers: default_logger(log_events),
            create_new_view_handlers: default_logger(log_events),
            compute_restrictions_handlers: default_logger(log_events),
            recover_pre_prepare_handlers: default_logger(log_events),
            enter_view_handlers: default_logger(log_events),
            abandon_pending_view_handlers: default_logger(log_events),
        }
    }

    pub fn on_accept_view_change(
        mut self,
        handler: impl Fn(&AcceptViewChangeEvent) + Send + 'static,
    ) -> Self {
        self.accept_view_change_handlers.push(Box::new(handler));
        self
    }

    pub fn on_accept_new_view(
        mut self,
        handler: impl Fn(&AcceptNewViewEvent) + Send + 'static,
    ) -> Self {
        self.accept_new_view_handlers.push(Box::new(handler));
        self
    }

    pub fn on_reject_evidence(
        mut self,
        handler: impl Fn(&RejectEvidenceEvent) + Send + 'static,
    ) -> Self {
        self.reject_evidence_handlers.push(Box::new(handler));
        self
    }

    pub fn on_exit_view(mut self, handler: impl Fn(&ExitViewEvent) + Send + 'static) -> Self {
        self.exit_view_handlers.push(Box::new(handler));
        self
    }

    pub fn on_create_new_view(
        mut self,
        handler: impl Fn(&CreateNewViewEvent) + Send + 'static,
    ) -> Self {
        self.create_new_view_handlers.push(Box::new(handler));
        self
    }

    pub fn on_compute_restrictions(
        mut self,
        handler: impl Fn(&ComputeRestrictionsEvent) + Send + 'static,
    ) -> Self {
        self.compute_restrictions_handlers.push(Box::new(handler));
        self
    }

    pub fn on_recover_pre_prepare(
        mut self,
        handler: impl Fn(&RecoverPrePrepareEvent) + Send + 'static,
    ) -> Self {
        self.recover_pre_prepare_handlers.push(Box::new(handler));
        self
    }

    pub fn on_enter_view(mut self, handler: impl Fn(&EnterViewEvent) + Send + 'static) -> Self {
        self.enter_view_handlers.push(Box::new(handler));
        self
    }

    pub fn on_abandon_pending_view(
        mut self,
        handler: impl Fn(&AbandonPendingViewEvent) + Send + 'static,
    ) -> Self {
        self.abandon_pending_view_handlers.push(Box::new(handler));
        self
    }

    /// Check whether no handler is registered for any event type.
    pub fn is_empty(&self) -> bool {
        self.accept_view_change_handlers.is_empty()
            && self.accept_new_view_handlers.is_empty()
            && self.reject_evidence_handlers.is_empty()
            && self.exit_view_handlers.is_empty()
            && self.create_new_view_handlers.is_empty()
            && self.compute_restrictions_handlers.is_empty()
            && self.recover_pre_prepare_handlers.is_empty()
            && self.enter_view_handlers.is_empty()
            && self.abandon_pending_view_handlers.is_empty()
    }

    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::AcceptViewChange(accept_view_change_event) => self
                .accept_view_change_handlers
                .iter()
                .for_each(|handler| handler(&accept_view_change_event)),

            Event::AcceptNewView(accept_new_view_event) => self
                .accept_new_view_handlers
                .iter()
                .for_each(|handler| handler(&accept_new_view_event)),

            Event::RejectEvidence(reject_evidence_event) => self
                .reject_evidence_handlers
                .iter()
                .for_each(|handler| handler(&reject_evidence_event)),

            Event::ExitView(exit_view_event) => self
                .exit_view_handlers
                .iter()
                .for_each(|handler| handler(&exit_view_event)),

            Event::CreateNewView(create_new_view_event) => self
                .create_new_view_handlers
                .iter()
                .for_each(|handler| handler(&create_new_view_event)),

            Event::ComputeRestrictions(compute_restrictions_event) => self
                .compute_restrictions_handlers
                .iter()
                .for_each(|handler| handler(&compute_restrictions_event)),

            Event::RecoverPrePrepare(recover_pre_prepare_event) => self
                .recover_pre_prepare_handlers
                .iter()
                .for_each(|handler| handler(&recover_pre_prepare_event)),

            Event::EnterView(enter_view_event) => self
                .enter_view_handlers
                .iter()
                .for_each(|handler| handler(&enter_view_event)),

            Event::AbandonPendingView(abandon_pending_view_event) => self
                .abandon_pending_view_handlers
                .iter()
                .for_each(|handler| handler(&abandon_pending_view_event)),
        }
    }
}

/// Start the event bus thread. The thread fires the handlers of every event received on
/// `event_subscriber` until `shutdown_signal` receives a message or is disconnected, or every publisher
/// is dropped.
pub fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => return,
            Err(TryRecvError::Empty) => (),
        }

        match event_subscriber.recv_timeout(Duration::from_millis(50)) {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => return,
        }
    })
}
