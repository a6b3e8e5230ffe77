/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via
//! [`Configuration::log_events`](crate::config::Configuration::log_events).
//!
//! This crate logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values are
//! always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following snippet
//! is how an [AcceptViewChange](crate::events::AcceptViewChangeEvent) is printed:
//!
//! ```text
//! AcceptViewChange, 1701329264, 2, 7, 120, 4
//! ```
//!
//! In the snippet:
//! - The third value is the id of the replica that sent the view-change message.
//! - The fourth value is the view the message asks to move to.
//! - The fifth value is the sender's stable checkpoint.
//! - The sixth value is the number of slots the message carries evidence for.

use std::time::SystemTime;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use log;

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const ACCEPT_VIEW_CHANGE: &str = "AcceptViewChange";
pub const ACCEPT_NEW_VIEW: &str = "AcceptNewView";
pub const REJECT_EVIDENCE: &str = "RejectEvidence";

pub const EXIT_VIEW: &str = "ExitView";
pub const CREATE_NEW_VIEW: &str = "CreateNewView";

pub const COMPUTE_RESTRICTIONS: &str = "ComputeRestrictions";
pub const RECOVER_PRE_PREPARE: &str = "RecoverPrePrepare";
pub const ENTER_VIEW: &str = "EnterView";
pub const ABANDON_PENDING_VIEW: &str = "AbandonPendingView";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for AcceptViewChangeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |accept_view_change_event: &AcceptViewChangeEvent| {
            let view_change = &accept_view_change_event.view_change;
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                ACCEPT_VIEW_CHANGE,
                secs_since_unix_epoch(accept_view_change_event.timestamp),
                view_change.sender,
                view_change.view,
                view_change.last_stable,
                view_change.elements.len()
            )
        };
        Box::new(logger)
    }
}

impl Logger for AcceptNewViewEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |accept_new_view_event: &AcceptNewViewEvent| {
            let new_view = &accept_new_view_event.new_view;
            log::info!(
                "{}, {}, {}, {}, {}",
                ACCEPT_NEW_VIEW,
                secs_since_unix_epoch(accept_new_view_event.timestamp),
                new_view.sender,
                new_view.view,
                referenced_replicas_info(&new_view.referenced_replicas())
            )
        };
        Box::new(logger)
    }
}

impl Logger for RejectEvidenceEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |reject_evidence_event: &RejectEvidenceEvent| {
            log::warn!(
                "{}, {}, {}, {}, {}",
                REJECT_EVIDENCE,
                secs_since_unix_epoch(reject_evidence_event.timestamp),
                reject_evidence_event.origin,
                reject_evidence_event.view,
                reject_evidence_event.reason
            )
        };
        Box::new(logger)
    }
}

impl Logger for ExitViewEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |exit_view_event: &ExitViewEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                EXIT_VIEW,
                secs_since_unix_epoch(exit_view_event.timestamp),
                exit_view_event.view,
                exit_view_event.view_change.view,
                exit_view_event.view_change.last_stable,
                exit_view_event.view_change.last_executed
            )
        };
        Box::new(logger)
    }
}

impl Logger for CreateNewViewEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |create_new_view_event: &CreateNewViewEvent| {
            log::info!(
                "{}, {}, {}, {}",
                CREATE_NEW_VIEW,
                secs_since_unix_epoch(create_new_view_event.timestamp),
                create_new_view_event.new_view.view,
                referenced_replicas_info(&create_new_view_event.new_view.referenced_replicas())
            )
        };
        Box::new(logger)
    }
}

impl Logger for ComputeRestrictionsEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |compute_restrictions_event: &ComputeRestrictionsEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                COMPUTE_RESTRICTIONS,
                secs_since_unix_epoch(compute_restrictions_event.timestamp),
                compute_restrictions_event.view,
                compute_restrictions_event.stable_lower_bound,
                compute_restrictions_event.bound_slots,
                compute_restrictions_event.missing_slots
            )
        };
        Box::new(logger)
    }
}

impl Logger for RecoverPrePrepareEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |recover_pre_prepare_event: &RecoverPrePrepareEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                RECOVER_PRE_PREPARE,
                secs_since_unix_epoch(recover_pre_prepare_event.timestamp),
                recover_pre_prepare_event.view,
                recover_pre_prepare_event.seq,
                first_seven_base64_chars(&recover_pre_prepare_event.digest.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for EnterViewEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |enter_view_event: &EnterViewEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                ENTER_VIEW,
                secs_since_unix_epoch(enter_view_event.timestamp),
                enter_view_event.view,
                enter_view_event.stable_lower_bound,
                enter_view_event.reissued_pre_prepares
            )
        };
        Box::new(logger)
    }
}

impl Logger for AbandonPendingViewEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |abandon_pending_view_event: &AbandonPendingViewEvent| {
            log::info!(
                "{}, {}, {}, {}",
                ABANDON_PENDING_VIEW,
                secs_since_unix_epoch(abandon_pending_view_event.timestamp),
                abandon_pending_view_event.abandoned,
                abandon_pending_view_event.target
            )
        };
        Box::new(logger)
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first 7 characters.
fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

// Replicas are joined with '|' so that the list stays a single CSV value.
fn referenced_replicas_info<T: ToString>(replicas: &[T]) -> String {
    replicas
        .iter()
        .map(|replica| replica.to_string())
        .collect::<Vec<String>>()
        .join("|")
}
