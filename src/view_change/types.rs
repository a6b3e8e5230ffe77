/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Inputs, outputs, and errors of the [`ViewsManager`](super::implementation::ViewsManager).

use std::fmt::{self, Display, Formatter};

use crate::types::data_types::{CryptoHash, ReplicaID, SeqNumber, ViewNumber};

use super::{
    messages::{PrePrepareMessage, PreparedCertificate},
    safety::{Restriction, SafetyLogicError},
};

/// The phase of the view-change protocol a [`ViewsManager`](super::implementation::ViewsManager) is in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewStatus {
    /// No view has been entered yet.
    NoView,

    /// A view is pending, and either the quorum that justifies it is not known yet, or the local stable
    /// checkpoint is behind the quorum's.
    Pending,

    /// The restrictions of the pending view are installed, and the content of some bound slots is
    /// missing.
    PendingWithRestrictions,

    /// The pending view is the active view.
    InView,
}

impl Display for ViewStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            ViewStatus::NoView => "NoView",
            ViewStatus::Pending => "Pending",
            ViewStatus::PendingWithRestrictions => "PendingWithRestrictions",
            ViewStatus::InView => "InView",
        };
        f.write_str(name)
    }
}

/// A slot that was executed in the view being left.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutedSlot {
    pub pre_prepare: PrePrepareMessage,
}

/// A slot that was proposed but not executed in the view being left.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingSlot {
    pub pre_prepare: PrePrepareMessage,

    /// Whether the local replica holds every request referenced by `pre_prepare`. Content that is not
    /// complete is not kept for re-issuing in the next view.
    pub has_all_requests: bool,

    /// The prepared certificate for `pre_prepare`, if the slot was prepared.
    pub prepared: Option<PreparedCertificate>,
}

/// What the local replica knows about the slots of the view it is leaving.
///
/// `executed` and `pending` are disjoint: slots in `(last_stable, last_executed]` go in `executed`, and
/// slots in `(last_executed, last_stable + work_window_size]` go in `pending`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PrevViewInfo {
    pub executed: Vec<ExecutedSlot>,
    pub pending: Vec<PendingSlot>,
}

/// The result of [`try_to_enter_view`](super::implementation::ViewsManager::try_to_enter_view).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnterViewOutcome {
    /// No usable quorum for the target view is known yet, or the local stable checkpoint is behind the
    /// quorum's.
    NotReady,

    /// Restrictions are installed, but the content of the slots in `missing` has to be recovered with
    /// [`add_potentially_missing_pre_prepare`](super::implementation::ViewsManager::add_potentially_missing_pre_prepare).
    WaitingForPrePrepares { missing: Vec<SeqNumber> },

    /// `view` is now the active view. `pre_prepares` are the bound proposals re-issued in `view`, in
    /// ascending order of sequence number.
    Entered {
        view: ViewNumber,
        pre_prepares: Vec<PrePrepareMessage>,
    },
}

/// The result of
/// [`add_potentially_missing_pre_prepare`](super::implementation::ViewsManager::add_potentially_missing_pre_prepare).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MissingPrePrepareOutcome {
    /// The pre-prepare was not needed.
    Ignored,

    /// The pre-prepare was stored, and other content is still missing.
    StillWaiting,

    /// The pre-prepare was the last missing content, and `view` is now the active view.
    EnteredView {
        view: ViewNumber,
        pre_prepares: Vec<PrePrepareMessage>,
    },
}

/// The views that the view-change messages of other replicas prove to be reasonable targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelevantViewNumbers {
    /// At least one correct replica wants to move to this view or a higher one.
    pub max_known_correct_view: ViewNumber,

    /// Enough replicas want to move to this view or a higher one to form a quorum.
    pub max_known_agreed_view: ViewNumber,
}

/// Reasons evidence from another replica is rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rejection {
    UnknownSender,
    BadSignature,
    Malformed,
    InvalidCertificate,
    NotPrimary,
    Stale,
}

impl Display for Rejection {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Rejection::UnknownSender => "UnknownSender",
            Rejection::BadSignature => "BadSignature",
            Rejection::Malformed => "Malformed",
            Rejection::InvalidCertificate => "InvalidCertificate",
            Rejection::NotPrimary => "NotPrimary",
            Rejection::Stale => "Stale",
        };
        f.write_str(name)
    }
}

/// Number of pieces of evidence rejected, per [`Rejection`] reason.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RejectionCounters {
    pub unknown_sender: u64,
    pub bad_signature: u64,
    pub malformed: u64,
    pub invalid_certificate: u64,
    pub not_primary: u64,
    pub stale: u64,
}

impl RejectionCounters {
    pub(crate) fn record(&mut self, reason: Rejection) {
        let counter = match reason {
            Rejection::UnknownSender => &mut self.unknown_sender,
            Rejection::BadSignature => &mut self.bad_signature,
            Rejection::Malformed => &mut self.malformed,
            Rejection::InvalidCertificate => &mut self.invalid_certificate,
            Rejection::NotPrimary => &mut self.not_primary,
            Rejection::Stale => &mut self.stale,
        };
        *counter += 1;
    }

    /// Get the number of pieces of evidence rejected for `reason`.
    pub fn get(&self, reason: Rejection) -> u64 {
        match reason {
            Rejection::UnknownSender => self.unknown_sender,
            Rejection::BadSignature => self.bad_signature,
            Rejection::Malformed => self.malformed,
            Rejection::InvalidCertificate => self.invalid_certificate,
            Rejection::NotPrimary => self.not_primary,
            Rejection::Stale => self.stale,
        }
    }

    /// Get the number of pieces of evidence rejected for any reason.
    pub fn total(&self) -> u64 {
        self.unknown_sender
            + self.bad_signature
            + self.malformed
            + self.invalid_certificate
            + self.not_primary
            + self.stale
    }
}

/// Ways the [`PrevViewInfo`] passed to
/// [`exit_from_current_view`](super::implementation::ViewsManager::exit_from_current_view) can be
/// inconsistent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrevViewInfoError {
    /// `last_executed` is lower than `last_stable`.
    ExecutedBelowStable {
        last_stable: SeqNumber,
        last_executed: SeqNumber,
    },

    /// An executed slot is outside `(last_stable, last_executed]`.
    ExecutedSlotOutOfRange { seq: SeqNumber },

    /// A pending slot is outside `(last_executed, last_stable + work_window_size]`.
    PendingSlotOutOfRange { seq: SeqNumber },

    /// The same slot appears twice.
    DuplicateSlot { seq: SeqNumber },

    /// The digest of a pre-prepare does not match its contents.
    MalformedPrePrepare { seq: SeqNumber },

    /// A prepared certificate is not about the pre-prepare it accompanies, or comes from a view that is
    /// not lower than the next view.
    MismatchedCertificate { seq: SeqNumber },
}

/// Local invariants whose violation means that the replica can no longer take part in the protocol
/// safely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// The caller reported a stable checkpoint lower than one it reported before.
    StableRegression {
        previous: SeqNumber,
        current: SeqNumber,
    },

    /// The pending view would fall below the active view.
    PendingViewBelowActiveView {
        active: ViewNumber,
        pending: ViewNumber,
    },

    /// The stable lower bound of a new view is lower than that of the previous one.
    StableLowerBoundRegression {
        previous: SeqNumber,
        current: SeqNumber,
    },

    /// A slot bound in the previous view would be re-bound to a different proposal without a certificate
    /// from a strictly higher view.
    RestrictionChanged {
        seq: SeqNumber,
        previous: Restriction,
        current: Restriction,
    },
}

/// Enumerates the errors that [`ViewsManager`](super::implementation::ViewsManager) methods can return.
#[derive(Debug)]
pub enum ViewsManagerError {
    /// The operation is not allowed in the current status.
    InvalidState {
        operation: &'static str,
        status: ViewStatus,
    },

    /// The target view is below the view that is already pending.
    TargetViewBelowPendingView {
        target: ViewNumber,
        pending: ViewNumber,
    },

    /// The target view is not above the active view.
    TargetViewNotAboveActiveView {
        target: ViewNumber,
        active: ViewNumber,
    },

    InvalidPrevViewInfo(PrevViewInfoError),

    /// The configured signing key does not belong to the local replica.
    IdentityMismatch { my_id: ReplicaID },

    /// The verifier refused to combine the signatures of a selected quorum.
    NewViewCombineFailed { view: ViewNumber },

    InvariantViolation(InvariantViolation),

    SafetyLogic(SafetyLogicError),

    /// A fatal error happened earlier, and the `ViewsManager` accepts no more changes.
    Halted,
}

impl ViewsManagerError {
    /// Check whether the error leaves the local replica unable to take part in the protocol safely.
    pub fn is_fatal(&self) -> bool {
        match self {
            ViewsManagerError::InvariantViolation(_) | ViewsManagerError::Halted => true,
            ViewsManagerError::SafetyLogic(SafetyLogicError::ConflictingCertificates { .. }) => true,
            _ => false,
        }
    }
}

impl From<PrevViewInfoError> for ViewsManagerError {
    fn from(value: PrevViewInfoError) -> Self {
        ViewsManagerError::InvalidPrevViewInfo(value)
    }
}

impl From<InvariantViolation> for ViewsManagerError {
    fn from(value: InvariantViolation) -> Self {
        ViewsManagerError::InvariantViolation(value)
    }
}

impl From<SafetyLogicError> for ViewsManagerError {
    fn from(value: SafetyLogicError) -> Self {
        ViewsManagerError::SafetyLogic(value)
    }
}

/// The content kept for a bound slot of the pending view, keyed by the digest it must have.
#[derive(Clone, Debug)]
pub(crate) struct BoundSlot {
    pub(crate) digest: CryptoHash,
    pub(crate) pre_prepare: Option<PrePrepareMessage>,
}
