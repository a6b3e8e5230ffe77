/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Stateful implementation of the view-change coordinator.
//!
//! Main type: [`ViewsManager`].

use std::{
    collections::BTreeMap,
    mem,
    ops::Bound::{Excluded, Unbounded},
    sync::mpsc::Sender,
    time::SystemTime,
};

use crate::{
    config::Configuration,
    events::{
        AbandonPendingViewEvent, AcceptNewViewEvent, AcceptViewChangeEvent,
        ComputeRestrictionsEvent, CreateNewViewEvent, EnterViewEvent, Event, ExitViewEvent,
        RecoverPrePrepareEvent, RejectEvidenceEvent,
    },
    types::{
        crypto_primitives::Keypair,
        data_types::{CryptoHash, ReplicaID, SeqNumber, ViewNumber},
        replica_set::{QuorumKind, ReplicaSet},
        signed_messages::SignedMessage,
    },
};

use super::{
    messages::{
        NewViewMessage, PrePrepareMessage, PreparedCertificate, SlotEvidence, ViewChangeElement,
        ViewChangeMessage,
    },
    safety::{self, Restriction, Restrictions},
    types::{
        BoundSlot, EnterViewOutcome, InvariantViolation, MissingPrePrepareOutcome, PrevViewInfo,
        PrevViewInfoError, Rejection, RejectionCounters, RelevantViewNumbers, ViewStatus,
        ViewsManagerError,
    },
    verifier::CertificateVerifier,
};

/// The view-change coordinator of a single replica.
///
/// # Usage
///
/// After creating an instance of `ViewsManager` using [`new`](Self::new), the caller should interact
/// with it as follows:
/// 1. Enter the initial view by calling [`try_to_enter_view`](Self::try_to_enter_view) with view 0.
/// 2. When the local replica suspects the primary of the active view, call
///    [`exit_from_current_view`](Self::exit_from_current_view) and broadcast the returned
///    `ViewChangeMessage`.
/// 3. Pass every `ViewChangeMessage` and `NewViewMessage` received from other replicas to
///    [`add_view_change`](Self::add_view_change) and [`add_new_view`](Self::add_new_view).
/// 4. Call [`try_to_enter_view`](Self::try_to_enter_view) whenever new evidence is added. If the local
///    replica is the primary of the target view, broadcast
///    [`new_view_for_view`](Self::new_view_for_view) after it is created.
/// 5. If `try_to_enter_view` reports missing pre-prepares, fetch them from other replicas and pass them
///    to [`add_potentially_missing_pre_prepare`](Self::add_potentially_missing_pre_prepare).
///
/// ## Halting
///
/// Methods that return [`ViewsManagerError`] halt the `ViewsManager` if the error is
/// [fatal](ViewsManagerError::is_fatal). After that, every method that changes state fails with
/// [`ViewsManagerError::Halted`], and evidence from other replicas is no longer admitted.
pub struct ViewsManager<V: CertificateVerifier> {
    config: ViewsManagerConfiguration,
    replica_set: ReplicaSet,
    verifier: V,
    state: ViewsManagerState,
    event_publisher: Option<Sender<Event>>,
}

struct ViewsManagerConfiguration {
    keypair: Keypair,
    work_window_size: u64,
}

struct ViewsManagerState {
    status: ViewStatus,
    active_view: ViewNumber,
    pending_view: ViewNumber,
    halted: bool,

    /// The latest stable checkpoint reported by the caller.
    last_stable: SeqNumber,

    /// The most advanced `ViewChangeMessage` of every replica, including the local one.
    view_changes: BTreeMap<ReplicaID, ViewChangeMessage>,

    /// The most advanced `NewViewMessage` of every replica, including the local one.
    new_views: BTreeMap<ReplicaID, NewViewMessage>,

    /// Content of the slots of previous views, kept since the last view exit, keyed by digest.
    collected_pre_prepares: BTreeMap<CryptoHash, PrePrepareMessage>,

    /// The restrictions of the pending view, once computed.
    pending_restrictions: Option<Restrictions>,

    /// The bound slots of the pending view above the local stable checkpoint.
    bound_slots: BTreeMap<SeqNumber, BoundSlot>,

    /// The certificate that binds each bound slot of the pending view.
    pending_certificates: BTreeMap<SeqNumber, PreparedCertificate>,

    /// The certificate that bound each bound slot of the active view when it was entered.
    active_certificates: BTreeMap<SeqNumber, PreparedCertificate>,

    /// The restrictions the active view was entered with. `None` for view 0.
    active_restrictions: Option<Restrictions>,

    /// The stable lower bound the active view was entered with.
    active_stable_lower_bound: SeqNumber,

    /// The proposals re-issued when the active view was entered.
    active_pre_prepares: BTreeMap<SeqNumber, PrePrepareMessage>,

    rejection_counters: RejectionCounters,
}

impl<V: CertificateVerifier> ViewsManager<V> {
    /// Create a new `ViewsManager` for the local replica of `replica_set`, in status
    /// [`NoView`](ViewStatus::NoView).
    ///
    /// # Errors
    ///
    /// Fails with [`ViewsManagerError::IdentityMismatch`] if `config.me` is not the signing key of the
    /// local replica.
    pub fn new(
        config: Configuration,
        replica_set: ReplicaSet,
        verifier: V,
        event_publisher: Option<Sender<Event>>,
    ) -> Result<Self, ViewsManagerError> {
        let keypair = Keypair::new(config.me);
        let my_id = replica_set.my_id();
        if replica_set.verifying_key(my_id) != Some(&keypair.public()) {
            return Err(ViewsManagerError::IdentityMismatch { my_id });
        }

        Ok(Self {
            config: ViewsManagerConfiguration {
                keypair,
                work_window_size: config.work_window_size,
            },
            replica_set,
            verifier,
            state: ViewsManagerState {
                status: ViewStatus::NoView,
                active_view: ViewNumber::init(),
                pending_view: ViewNumber::init(),
                halted: false,
                last_stable: SeqNumber::new(0),
                view_changes: BTreeMap::new(),
                new_views: BTreeMap::new(),
                collected_pre_prepares: BTreeMap::new(),
                pending_restrictions: None,
                bound_slots: BTreeMap::new(),
                pending_certificates: BTreeMap::new(),
                active_certificates: BTreeMap::new(),
                active_restrictions: None,
                active_stable_lower_bound: SeqNumber::new(0),
                active_pre_prepares: BTreeMap::new(),
                rejection_counters: RejectionCounters::default(),
            },
            event_publisher,
        })
    }

    /// Admit a `ViewChangeMessage` from another replica, replacing the message previously stored for its
    /// sender.
    ///
    /// Returns whether the message was accepted **and** the stored messages for its view now form a
    /// strong quorum. Rejected messages are counted in [`rejection_counters`](Self::rejection_counters).
    ///
    /// ## Staleness
    ///
    /// A message is stale if the stored message from the same sender targets a higher view, or targets
    /// the same view with a stable checkpoint that is not lower. A message that the stored
    /// `NewViewMessage` of the target view's primary references is preferred over any other message for
    /// the same view.
    ///
    /// The local replica's own latest message, echoed back by the network, changes nothing and is not
    /// counted as a rejection.
    pub fn add_view_change(&mut self, view_change: ViewChangeMessage) -> bool {
        if self.state.halted {
            return false;
        }

        let sender = view_change.sender;
        let view = view_change.view;
        if self.replica_set.is_self(sender) && self.my_latest_view_change() == Some(&view_change) {
            return self.count_view_changes_for_view(view)
                >= self.replica_set.quorum_size(QuorumKind::Strong);
        }
        if let Err(reason) = self.check_view_change(&view_change) {
            self.reject(sender, view, reason);
            return false;
        }

        self.state.view_changes.insert(sender, view_change.clone());
        Event::AcceptViewChange(AcceptViewChangeEvent {
            timestamp: SystemTime::now(),
            view_change,
        })
        .publish(&self.event_publisher);

        self.count_view_changes_for_view(view) >= self.replica_set.quorum_size(QuorumKind::Strong)
    }

    fn check_view_change(&self, view_change: &ViewChangeMessage) -> Result<(), Rejection> {
        // 1. The sender must be another member of the replica set. The local message is created locally.
        let verifying_key = match self.replica_set.verifying_key(view_change.sender) {
            Some(verifying_key) => verifying_key,
            None => return Err(Rejection::UnknownSender),
        };
        if self.replica_set.is_self(view_change.sender) {
            return Err(Rejection::Stale);
        }

        // 2. Views that were already entered need no more evidence.
        if view_change.view <= self.state.active_view && self.state.status != ViewStatus::NoView {
            return Err(Rejection::Stale);
        }

        // 3. Keep the most advanced message per sender.
        if let Some(stored) = self.state.view_changes.get(&view_change.sender) {
            let is_newer = if view_change.view == stored.view {
                !self.is_referenced_by_new_view(stored)
                    && (self.is_referenced_by_new_view(view_change)
                        || view_change.last_stable > stored.last_stable)
            } else {
                view_change.view > stored.view
            };
            if !is_newer {
                return Err(Rejection::Stale);
            }
        }

        // 4. Check the structure, then the signatures.
        if !view_change.is_well_formed(self.config.work_window_size) {
            return Err(Rejection::Malformed);
        }
        if !view_change.is_correct(verifying_key) {
            return Err(Rejection::BadSignature);
        }
        if !view_change
            .prepared_certificates()
            .all(|prepared| self.verifier.validate(&prepared.certificate))
        {
            return Err(Rejection::InvalidCertificate);
        }

        Ok(())
    }

    /// Admit a `NewViewMessage` from the primary of its view, replacing the message previously stored
    /// for its sender. New-view messages are never applied automatically: they are used by the next call
    /// to [`try_to_enter_view`](Self::try_to_enter_view) for their view.
    ///
    /// Returns whether the message was accepted.
    pub fn add_new_view(&mut self, new_view: NewViewMessage) -> bool {
        if self.state.halted {
            return false;
        }

        let sender = new_view.sender;
        let view = new_view.view;
        if let Err(reason) = self.check_new_view(&new_view) {
            self.reject(sender, view, reason);
            return false;
        }

        self.state.new_views.insert(sender, new_view.clone());
        Event::AcceptNewView(AcceptNewViewEvent {
            timestamp: SystemTime::now(),
            new_view,
        })
        .publish(&self.event_publisher);

        true
    }

    fn check_new_view(&self, new_view: &NewViewMessage) -> Result<(), Rejection> {
        // 1. The sender must be another member of the replica set, and the primary of the view.
        let verifying_key = match self.replica_set.verifying_key(new_view.sender) {
            Some(verifying_key) => verifying_key,
            None => return Err(Rejection::UnknownSender),
        };
        if self.replica_set.is_self(new_view.sender) {
            return Err(Rejection::Stale);
        }
        if new_view.view == ViewNumber::init() {
            return Err(Rejection::Malformed);
        }
        if self.replica_set.primary_of_view(new_view.view) != new_view.sender {
            return Err(Rejection::NotPrimary);
        }

        // 2. Views that were already entered need no more evidence, and only newer messages replace
        //    stored ones.
        if new_view.view <= self.state.active_view && self.state.status != ViewStatus::NoView {
            return Err(Rejection::Stale);
        }
        if let Some(stored) = self.state.new_views.get(&new_view.sender) {
            if stored.view >= new_view.view {
                return Err(Rejection::Stale);
            }
        }

        // 3. Check the signature, then the certificate.
        if !new_view.is_correct(verifying_key) {
            return Err(Rejection::BadSignature);
        }
        if new_view.certificate.len() != self.replica_set.quorum_size(QuorumKind::Strong)
            || !self.verifier.validate(&new_view.certificate)
        {
            return Err(Rejection::InvalidCertificate);
        }

        Ok(())
    }

    /// Try to make `target` the active view.
    ///
    /// ## Precondition
    ///
    /// `last_stable` and `last_executed` are the local replica's current stable checkpoint and last
    /// executed sequence number.
    ///
    /// ## Steps
    ///
    /// 1. Entering view 0 from [`NoView`](ViewStatus::NoView) needs no evidence.
    /// 2. A target above the pending view abandons the current attempt and re-issues the local
    ///    `ViewChangeMessage` for `target`.
    /// 3. The quorum that justifies `target` is selected. The primary of `target` selects it from the
    ///    stored view-change messages and creates its `NewViewMessage`. Other replicas use the quorum
    ///    referenced by the stored `NewViewMessage` of the primary.
    /// 4. The restrictions of the quorum are computed and installed.
    /// 5. If the content of every bound slot is known locally, `target` is entered.
    pub fn try_to_enter_view(
        &mut self,
        target: ViewNumber,
        last_stable: SeqNumber,
        last_executed: SeqNumber,
    ) -> Result<EnterViewOutcome, ViewsManagerError> {
        self.ensure_not_halted()?;
        let result = self.try_to_enter_view_inner(target, last_stable, last_executed);
        self.halt_on_fatal(result)
    }

    fn try_to_enter_view_inner(
        &mut self,
        target: ViewNumber,
        last_stable: SeqNumber,
        last_executed: SeqNumber,
    ) -> Result<EnterViewOutcome, ViewsManagerError> {
        self.record_stable(last_stable)?;

        match self.state.status {
            ViewStatus::InView => {
                return Err(ViewsManagerError::InvalidState {
                    operation: "try_to_enter_view",
                    status: ViewStatus::InView,
                })
            }

            // 1. Enter the initial view directly, or join the cluster at a later view.
            ViewStatus::NoView => {
                if target == ViewNumber::init() {
                    return Ok(self.enter_initial_view(last_stable));
                }
                let view_change = ViewChangeMessage::new(
                    &self.config.keypair.0,
                    self.replica_set.my_id(),
                    target,
                    last_stable,
                    last_executed.max(last_stable),
                    Vec::new(),
                );
                self.state
                    .view_changes
                    .insert(self.replica_set.my_id(), view_change);
                self.state.pending_view = target;
                self.state.status = ViewStatus::Pending;
            }

            ViewStatus::Pending | ViewStatus::PendingWithRestrictions => {
                if target <= self.state.active_view {
                    return Err(ViewsManagerError::TargetViewNotAboveActiveView {
                        target,
                        active: self.state.active_view,
                    });
                }
                if target < self.state.pending_view {
                    return Err(ViewsManagerError::TargetViewBelowPendingView {
                        target,
                        pending: self.state.pending_view,
                    });
                }

                // 2. Abandon the current attempt.
                if target > self.state.pending_view {
                    self.abandon_pending_view(target);
                } else if self.state.status == ViewStatus::PendingWithRestrictions {
                    let missing = self.missing_pre_prepares(last_stable);
                    if missing.is_empty() {
                        let pre_prepares = self.enter_pending_view()?;
                        return Ok(EnterViewOutcome::Entered {
                            view: target,
                            pre_prepares,
                        });
                    }
                    return Ok(EnterViewOutcome::WaitingForPrePrepares { missing });
                }
            }
        }

        // 3. Select the quorum.
        let quorum_members = match self.select_quorum(target)? {
            Some(quorum_members) => quorum_members,
            None => return Ok(EnterViewOutcome::NotReady),
        };
        let quorum: Vec<&ViewChangeMessage> = quorum_members
            .iter()
            .filter_map(|replica| self.state.view_changes.get(replica))
            .collect();

        let fault_bound = self.replica_set.fault_bound();
        let stable_lower_bound = safety::stable_lower_bound(quorum.iter().copied(), fault_bound);
        if last_stable < stable_lower_bound {
            return Ok(EnterViewOutcome::NotReady);
        }
        if stable_lower_bound < self.state.active_stable_lower_bound {
            return Err(InvariantViolation::StableLowerBoundRegression {
                previous: self.state.active_stable_lower_bound,
                current: stable_lower_bound,
            }
            .into());
        }

        // 4. Compute the restrictions, check them against those of the active view, and install them.
        let restrictions =
            safety::compute_restrictions(&quorum, fault_bound, self.config.work_window_size)?;
        if let Some(previous) = &self.state.active_restrictions {
            check_restrictions_monotonic(previous, &restrictions)?;
        }
        let certificates = binding_certificates(&quorum, &restrictions);
        self.install_restrictions(target, restrictions, certificates, last_stable);

        // 5. Enter the view if no content is missing.
        let missing = self.missing_pre_prepares(last_stable);
        if missing.is_empty() {
            let pre_prepares = self.enter_pending_view()?;
            Ok(EnterViewOutcome::Entered {
                view: target,
                pre_prepares,
            })
        } else {
            Ok(EnterViewOutcome::WaitingForPrePrepares { missing })
        }
    }

    fn enter_initial_view(&mut self, last_stable: SeqNumber) -> EnterViewOutcome {
        self.state.status = ViewStatus::InView;
        self.state.active_view = ViewNumber::init();
        self.state.pending_view = ViewNumber::init();
        self.state.active_stable_lower_bound = last_stable;
        Event::EnterView(EnterViewEvent {
            timestamp: SystemTime::now(),
            view: ViewNumber::init(),
            stable_lower_bound: last_stable,
            reissued_pre_prepares: 0,
        })
        .publish(&self.event_publisher);

        EnterViewOutcome::Entered {
            view: ViewNumber::init(),
            pre_prepares: Vec::new(),
        }
    }

    /// Give up on entering the pending view and move on to `target`. Content collected from previous
    /// views is kept, since it is re-validated by digest.
    fn abandon_pending_view(&mut self, target: ViewNumber) {
        let abandoned = self.state.pending_view;
        self.state.pending_restrictions = None;
        self.state.bound_slots.clear();
        self.state.pending_certificates.clear();
        self.state.pending_view = target;
        self.state.status = ViewStatus::Pending;

        let my_id = self.replica_set.my_id();
        if let Some(own) = self.state.view_changes.get(&my_id) {
            let reissued = ViewChangeMessage::new(
                &self.config.keypair.0,
                my_id,
                target,
                own.last_stable,
                own.last_executed,
                own.elements.clone(),
            );
            self.state.view_changes.insert(my_id, reissued);
        }

        Event::AbandonPendingView(AbandonPendingViewEvent {
            timestamp: SystemTime::now(),
            abandoned,
            target,
        })
        .publish(&self.event_publisher);
    }

    /// Get the replicas whose stored view-change messages make up the quorum that justifies `target`, or
    /// `None` if no such quorum is known yet.
    fn select_quorum(
        &mut self,
        target: ViewNumber,
    ) -> Result<Option<Vec<ReplicaID>>, ViewsManagerError> {
        let my_id = self.replica_set.my_id();
        let primary = self.replica_set.primary_of_view(target);

        // A new-view message for the target view, created locally or received from the primary, fixes
        // the quorum.
        if let Some(new_view) = self
            .state
            .new_views
            .get(&primary)
            .filter(|new_view| new_view.view == target)
        {
            return Ok(self.referenced_quorum(new_view));
        }
        if primary != my_id {
            return Ok(None);
        }

        // As the primary, select our own message first, then the others in ascending order of replica id.
        let quorum_size = self.replica_set.quorum_size(QuorumKind::Strong);
        let mut candidates: Vec<ReplicaID> = Vec::with_capacity(quorum_size);
        if self
            .state
            .view_changes
            .get(&my_id)
            .is_some_and(|own| own.view == target)
        {
            candidates.push(my_id);
        }
        candidates.extend(
            self.state
                .view_changes
                .values()
                .filter(|view_change| view_change.sender != my_id && view_change.view == target)
                .map(|view_change| view_change.sender),
        );
        if candidates.len() < quorum_size {
            return Ok(None);
        }
        candidates.truncate(quorum_size);

        let shares = candidates
            .iter()
            .filter_map(|replica| self.state.view_changes.get(replica))
            .map(|view_change| view_change.signature_share())
            .collect();
        let certificate = self
            .verifier
            .combine(shares)
            .ok_or(ViewsManagerError::NewViewCombineFailed { view: target })?;
        let new_view = NewViewMessage::new(&self.config.keypair.0, my_id, target, certificate);
        self.state.new_views.insert(my_id, new_view.clone());
        Event::CreateNewView(CreateNewViewEvent {
            timestamp: SystemTime::now(),
            new_view,
        })
        .publish(&self.event_publisher);

        candidates.sort();
        Ok(Some(candidates))
    }

    /// Get the replicas referenced by `new_view`, if every referenced view-change message is stored
    /// with a matching digest.
    fn referenced_quorum(&self, new_view: &NewViewMessage) -> Option<Vec<ReplicaID>> {
        new_view
            .certificate
            .shares()
            .iter()
            .map(|share| {
                self.state
                    .view_changes
                    .get(&share.signer)
                    .filter(|view_change| {
                        view_change.view == new_view.view && view_change.digest() == share.message
                    })
                    .map(|view_change| view_change.sender)
            })
            .collect()
    }

    fn is_referenced_by_new_view(&self, view_change: &ViewChangeMessage) -> bool {
        let primary = self.replica_set.primary_of_view(view_change.view);
        self.state
            .new_views
            .get(&primary)
            .filter(|new_view| new_view.view == view_change.view)
            .and_then(|new_view| new_view.view_change_digest_of(view_change.sender))
            .is_some_and(|digest| digest == view_change.digest())
    }

    fn install_restrictions(
        &mut self,
        target: ViewNumber,
        restrictions: Restrictions,
        certificates: BTreeMap<SeqNumber, PreparedCertificate>,
        last_stable: SeqNumber,
    ) {
        self.state.pending_certificates = certificates;
        self.state.bound_slots = restrictions
            .bound_slots()
            .filter(|(seq, _)| *seq > last_stable)
            .map(|(seq, digest)| {
                let pre_prepare = self.state.collected_pre_prepares.get(&digest).cloned();
                (
                    seq,
                    BoundSlot {
                        digest,
                        pre_prepare,
                    },
                )
            })
            .collect();

        Event::ComputeRestrictions(ComputeRestrictionsEvent {
            timestamp: SystemTime::now(),
            view: target,
            stable_lower_bound: restrictions.stable_lower_bound(),
            bound_slots: self.state.bound_slots.len(),
            missing_slots: self
                .state
                .bound_slots
                .values()
                .filter(|slot| slot.pre_prepare.is_none())
                .count(),
        })
        .publish(&self.event_publisher);

        self.state.pending_restrictions = Some(restrictions);
        self.state.status = ViewStatus::PendingWithRestrictions;
    }

    /// Make the pending view the active view, re-issuing the content of its bound slots in it.
    fn enter_pending_view(&mut self) -> Result<Vec<PrePrepareMessage>, ViewsManagerError> {
        let view = self.state.pending_view;
        if view < self.state.active_view {
            return Err(InvariantViolation::PendingViewBelowActiveView {
                active: self.state.active_view,
                pending: view,
            }
            .into());
        }

        let pre_prepares: Vec<PrePrepareMessage> = self
            .state
            .bound_slots
            .values()
            .filter_map(|slot| slot.pre_prepare.as_ref())
            .map(|pre_prepare| pre_prepare.with_view(view))
            .collect();
        let stable_lower_bound = self
            .state
            .pending_restrictions
            .as_ref()
            .map(|restrictions| restrictions.stable_lower_bound())
            .unwrap_or(self.state.active_stable_lower_bound);

        self.state.status = ViewStatus::InView;
        self.state.active_view = view;
        self.state.active_restrictions = self.state.pending_restrictions.take();
        self.state.active_certificates = mem::take(&mut self.state.pending_certificates);
        self.state.active_stable_lower_bound = stable_lower_bound;
        self.state.active_pre_prepares = pre_prepares
            .iter()
            .map(|pre_prepare| (pre_prepare.seq, pre_prepare.clone()))
            .collect();
        self.state.bound_slots.clear();
        self.state.collected_pre_prepares.clear();

        // Evidence for views up to the new active view is no longer needed. The local view-change message
        // is kept.
        let my_id = self.replica_set.my_id();
        self.state
            .view_changes
            .retain(|replica, view_change| *replica == my_id || view_change.view > view);
        self.state
            .new_views
            .retain(|_, new_view| new_view.view >= view);

        Event::EnterView(EnterViewEvent {
            timestamp: SystemTime::now(),
            view,
            stable_lower_bound,
            reissued_pre_prepares: pre_prepares.len(),
        })
        .publish(&self.event_publisher);

        Ok(pre_prepares)
    }

    /// Supply the content of a bound slot of the pending view that was missing locally.
    ///
    /// The pre-prepare is stored only if the `ViewsManager` is waiting for it: the status is
    /// [`PendingWithRestrictions`](ViewStatus::PendingWithRestrictions), the pre-prepare is well formed,
    /// its slot is above `last_stable`, its slot is bound to its digest, and the slot's content is still
    /// missing. Otherwise it is ignored.
    pub fn add_potentially_missing_pre_prepare(
        &mut self,
        pre_prepare: PrePrepareMessage,
        last_stable: SeqNumber,
    ) -> Result<MissingPrePrepareOutcome, ViewsManagerError> {
        self.ensure_not_halted()?;
        let result = self.add_potentially_missing_pre_prepare_inner(pre_prepare, last_stable);
        self.halt_on_fatal(result)
    }

    fn add_potentially_missing_pre_prepare_inner(
        &mut self,
        pre_prepare: PrePrepareMessage,
        last_stable: SeqNumber,
    ) -> Result<MissingPrePrepareOutcome, ViewsManagerError> {
        self.record_stable(last_stable)?;

        if self.state.status != ViewStatus::PendingWithRestrictions
            || pre_prepare.seq <= last_stable
            || !pre_prepare.is_well_formed()
        {
            return Ok(MissingPrePrepareOutcome::Ignored);
        }

        let slot = match self.state.bound_slots.get_mut(&pre_prepare.seq) {
            Some(slot) if slot.digest == pre_prepare.digest && slot.pre_prepare.is_none() => slot,
            _ => return Ok(MissingPrePrepareOutcome::Ignored),
        };
        let (seq, digest) = (pre_prepare.seq, pre_prepare.digest);
        slot.pre_prepare = Some(pre_prepare);
        Event::RecoverPrePrepare(RecoverPrePrepareEvent {
            timestamp: SystemTime::now(),
            view: self.state.pending_view,
            seq,
            digest,
        })
        .publish(&self.event_publisher);

        if self.missing_pre_prepares(last_stable).is_empty() {
            let view = self.state.pending_view;
            let pre_prepares = self.enter_pending_view()?;
            Ok(MissingPrePrepareOutcome::EnteredView { view, pre_prepares })
        } else {
            Ok(MissingPrePrepareOutcome::StillWaiting)
        }
    }

    /// Get the sequence numbers above `last_stable` of the bound slots of the pending view whose content
    /// is missing, in ascending order. Empty unless the status is
    /// [`PendingWithRestrictions`](ViewStatus::PendingWithRestrictions).
    pub fn numbers_of_missing_pre_prepares(
        &self,
        last_stable: SeqNumber,
    ) -> Result<Vec<SeqNumber>, ViewsManagerError> {
        self.ensure_not_halted()?;
        Ok(self.missing_pre_prepares(last_stable))
    }

    fn missing_pre_prepares(&self, last_stable: SeqNumber) -> Vec<SeqNumber> {
        if self.state.status != ViewStatus::PendingWithRestrictions {
            return Vec::new();
        }
        self.state
            .bound_slots
            .range((Excluded(last_stable), Unbounded))
            .filter(|(_, slot)| slot.pre_prepare.is_none())
            .map(|(seq, _)| *seq)
            .collect()
    }

    /// Leave the active view, and create the local replica's `ViewChangeMessage` for the next view.
    ///
    /// Executed slots contribute no evidence to the message, but their content is kept locally, as is the
    /// content of pending slots for which every request is known. The returned message should be
    /// broadcast to every other replica.
    ///
    /// A pending slot is reported with the highest prepared certificate known for its proposal: the one
    /// passed in `prev_view_info`, the one that bound the slot when the active view was entered, or the
    /// one in the local replica's previous `ViewChangeMessage`. A proposal re-issued under a restriction
    /// therefore stays bound in later views even if it is not prepared again.
    pub fn exit_from_current_view(
        &mut self,
        last_stable: SeqNumber,
        last_executed: SeqNumber,
        prev_view_info: PrevViewInfo,
    ) -> Result<ViewChangeMessage, ViewsManagerError> {
        self.ensure_not_halted()?;
        let result = self.exit_from_current_view_inner(last_stable, last_executed, prev_view_info);
        self.halt_on_fatal(result)
    }

    fn exit_from_current_view_inner(
        &mut self,
        last_stable: SeqNumber,
        last_executed: SeqNumber,
        prev_view_info: PrevViewInfo,
    ) -> Result<ViewChangeMessage, ViewsManagerError> {
        if self.state.status != ViewStatus::InView {
            return Err(ViewsManagerError::InvalidState {
                operation: "exit_from_current_view",
                status: self.state.status,
            });
        }
        self.record_stable(last_stable)?;
        let next_view = self.state.active_view + 1;
        self.check_prev_view_info(last_stable, last_executed, &prev_view_info)?;

        let mut pending = prev_view_info.pending;
        pending.sort_by_key(|slot| slot.pre_prepare.seq);
        let elements = pending
            .iter()
            .map(|slot| ViewChangeElement {
                seq: slot.pre_prepare.seq,
                evidence: match self.highest_certificate(slot.prepared.as_ref(), &slot.pre_prepare) {
                    Some(prepared) => SlotEvidence::Prepared(prepared),
                    None => SlotEvidence::PrePrepared {
                        view: slot.pre_prepare.view,
                        digest: slot.pre_prepare.digest,
                    },
                },
            })
            .collect();

        let kept = prev_view_info
            .executed
            .into_iter()
            .map(|slot| slot.pre_prepare)
            .chain(
                pending
                    .into_iter()
                    .filter(|slot| slot.has_all_requests)
                    .map(|slot| slot.pre_prepare),
            );
        for pre_prepare in kept {
            self.state
                .collected_pre_prepares
                .insert(pre_prepare.digest, pre_prepare);
        }

        let my_id = self.replica_set.my_id();
        let view_change = ViewChangeMessage::new(
            &self.config.keypair.0,
            my_id,
            next_view,
            last_stable,
            last_executed,
            elements,
        );
        self.state.view_changes.insert(my_id, view_change.clone());
        self.state.pending_view = next_view;
        self.state.status = ViewStatus::Pending;
        self.state.active_pre_prepares.clear();

        Event::ExitView(ExitViewEvent {
            timestamp: SystemTime::now(),
            view: self.state.active_view,
            view_change: view_change.clone(),
        })
        .publish(&self.event_publisher);

        Ok(view_change)
    }

    /// Get the highest of `prepared`, the certificate that bound `pre_prepare`'s slot in the active view,
    /// and the certificate for the slot in the local replica's latest `ViewChangeMessage`, among those
    /// about `pre_prepare`'s proposal.
    fn highest_certificate(
        &self,
        prepared: Option<&PreparedCertificate>,
        pre_prepare: &PrePrepareMessage,
    ) -> Option<PreparedCertificate> {
        let seq = pre_prepare.seq;
        let from_entry = self.state.active_certificates.get(&seq);
        let from_own = self
            .my_latest_view_change()
            .and_then(|own| own.prepared_certificate(seq));

        prepared
            .into_iter()
            .chain(from_entry)
            .chain(from_own)
            .filter(|certificate| certificate.matches(pre_prepare))
            .max_by_key(|certificate| certificate.view)
            .cloned()
    }

    fn check_prev_view_info(
        &self,
        last_stable: SeqNumber,
        last_executed: SeqNumber,
        prev_view_info: &PrevViewInfo,
    ) -> Result<(), PrevViewInfoError> {
        if last_executed < last_stable {
            return Err(PrevViewInfoError::ExecutedBelowStable {
                last_stable,
                last_executed,
            });
        }
        let upper_bound = last_stable
            .checked_add(self.config.work_window_size)
            .unwrap_or(SeqNumber::new(u64::MAX));
        let mut seen = Vec::new();

        for slot in &prev_view_info.executed {
            let seq = slot.pre_prepare.seq;
            if seq <= last_stable || seq > last_executed {
                return Err(PrevViewInfoError::ExecutedSlotOutOfRange { seq });
            }
            if !self.is_acceptable_pre_prepare(&slot.pre_prepare) {
                return Err(PrevViewInfoError::MalformedPrePrepare { seq });
            }
            seen.push(seq);
        }

        for slot in &prev_view_info.pending {
            let seq = slot.pre_prepare.seq;
            if seq <= last_executed || seq > upper_bound {
                return Err(PrevViewInfoError::PendingSlotOutOfRange { seq });
            }
            if !self.is_acceptable_pre_prepare(&slot.pre_prepare) {
                return Err(PrevViewInfoError::MalformedPrePrepare { seq });
            }
            if let Some(prepared) = &slot.prepared {
                if !prepared.matches(&slot.pre_prepare)
                    || prepared.view > self.state.active_view
                    || !prepared.is_over_prepare_digest()
                {
                    return Err(PrevViewInfoError::MismatchedCertificate { seq });
                }
            }
            seen.push(seq);
        }

        seen.sort();
        if let Some(pair) = seen.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(PrevViewInfoError::DuplicateSlot { seq: pair[0] });
        }

        Ok(())
    }

    fn is_acceptable_pre_prepare(&self, pre_prepare: &PrePrepareMessage) -> bool {
        pre_prepare.is_well_formed() && pre_prepare.view <= self.state.active_view
    }

    /// Get the most recent `ViewChangeMessage` created by the local replica.
    pub fn my_latest_view_change(&self) -> Option<&ViewChangeMessage> {
        self.state.view_changes.get(&self.replica_set.my_id())
    }

    /// Get the `NewViewMessage` the local replica created for the active view, if the local replica is
    /// its primary.
    pub fn my_new_view_for_current_view(&self) -> Option<&NewViewMessage> {
        if self.state.status != ViewStatus::InView {
            return None;
        }
        self.state
            .new_views
            .get(&self.replica_set.my_id())
            .filter(|new_view| new_view.view == self.state.active_view)
    }

    /// Get the stored `NewViewMessage` of the primary of `view`, if there is one.
    pub fn new_view_for_view(&self, view: ViewNumber) -> Option<&NewViewMessage> {
        self.state
            .new_views
            .get(&self.replica_set.primary_of_view(view))
            .filter(|new_view| new_view.view == view)
    }

    /// Get the stored view-change messages that target `view`, in ascending order of sender.
    pub fn view_changes_for_view(&self, view: ViewNumber) -> Vec<&ViewChangeMessage> {
        self.state
            .view_changes
            .values()
            .filter(|view_change| view_change.view == view)
            .collect()
    }

    /// Get the proposal re-issued for `seq` when the active view was entered.
    pub fn pre_prepare(&self, seq: SeqNumber) -> Option<&PrePrepareMessage> {
        if self.state.status != ViewStatus::InView {
            return None;
        }
        self.state.active_pre_prepares.get(&seq)
    }

    /// Get the restrictions of the pending view, once they are installed.
    pub fn pending_restrictions(&self) -> Option<&Restrictions> {
        self.state.pending_restrictions.as_ref()
    }

    /// Get the stable lower bound the active view was entered with.
    pub fn stable_lower_bound_when_entered_to_view(&self) -> Option<SeqNumber> {
        if self.state.status != ViewStatus::InView {
            return None;
        }
        Some(self.state.active_stable_lower_bound)
    }

    pub fn latest_active_view(&self) -> ViewNumber {
        self.state.active_view
    }

    pub fn latest_pending_view(&self) -> ViewNumber {
        self.state.pending_view
    }

    pub fn status(&self) -> ViewStatus {
        self.state.status
    }

    pub fn is_halted(&self) -> bool {
        self.state.halted
    }

    pub fn rejection_counters(&self) -> &RejectionCounters {
        &self.state.rejection_counters
    }

    /// Check whether the `NewViewMessage` of the primary of `view` is stored.
    pub fn has_new_view_message(&self, view: ViewNumber) -> bool {
        self.new_view_for_view(view).is_some()
    }

    /// Check whether the stored `ViewChangeMessage` of `replica` targets a view above the active view.
    pub fn has_view_change_for_future_view(&self, replica: ReplicaID) -> bool {
        self.state
            .view_changes
            .get(&replica)
            .is_some_and(|view_change| view_change.view > self.state.active_view)
    }

    pub fn view_is_active(&self, view: ViewNumber) -> bool {
        self.state.status == ViewStatus::InView && self.state.active_view == view
    }

    pub fn view_is_pending(&self, view: ViewNumber) -> bool {
        matches!(
            self.state.status,
            ViewStatus::Pending | ViewStatus::PendingWithRestrictions
        ) && self.state.pending_view == view
    }

    /// Check whether the `ViewsManager` is waiting for missing pre-prepares.
    pub fn waiting_for_messages(&self) -> bool {
        self.state.status == ViewStatus::PendingWithRestrictions
    }

    /// Compute the highest views that the view-change messages of other replicas prove that
    /// 1. at least one correct replica wants to move to (the `F + 1`-th highest), and
    /// 2. a strong quorum of replicas wants to move to (the `2F + C + 1`-th highest).
    ///
    /// Only messages for views above the pending view are considered. Both views default to the
    /// pending view.
    pub fn compute_correct_relevant_view_numbers(&self) -> RelevantViewNumbers {
        let pending_view = self.state.pending_view;
        let mut views: Vec<ViewNumber> = self
            .state
            .view_changes
            .values()
            .filter(|view_change| {
                !self.replica_set.is_self(view_change.sender) && view_change.view > pending_view
            })
            .map(|view_change| view_change.view)
            .collect();
        views.sort_by(|a, b| b.cmp(a));

        let nth_highest = |kind: QuorumKind| {
            views
                .get(self.replica_set.quorum_size(kind) - 1)
                .copied()
                .unwrap_or(pending_view)
        };
        RelevantViewNumbers {
            max_known_correct_view: nth_highest(QuorumKind::Correct),
            max_known_agreed_view: nth_highest(QuorumKind::Strong),
        }
    }

    fn count_view_changes_for_view(&self, view: ViewNumber) -> usize {
        self.state
            .view_changes
            .values()
            .filter(|view_change| view_change.view == view)
            .count()
    }

    fn reject(&mut self, origin: ReplicaID, view: ViewNumber, reason: Rejection) {
        self.state.rejection_counters.record(reason);
        Event::RejectEvidence(RejectEvidenceEvent {
            timestamp: SystemTime::now(),
            origin,
            view,
            reason,
        })
        .publish(&self.event_publisher);
    }

    fn record_stable(&mut self, last_stable: SeqNumber) -> Result<(), ViewsManagerError> {
        if last_stable < self.state.last_stable {
            return Err(InvariantViolation::StableRegression {
                previous: self.state.last_stable,
                current: last_stable,
            }
            .into());
        }
        self.state.last_stable = last_stable;
        Ok(())
    }

    fn ensure_not_halted(&self) -> Result<(), ViewsManagerError> {
        if self.state.halted {
            Err(ViewsManagerError::Halted)
        } else {
            Ok(())
        }
    }

    fn halt_on_fatal<T>(
        &mut self,
        result: Result<T, ViewsManagerError>,
    ) -> Result<T, ViewsManagerError> {
        if let Err(error) = &result {
            if error.is_fatal() {
                log::error!("ViewsManager halted: {:?}", error);
                self.state.halted = true;
            }
        }
        result
    }
}

/// Get, for every bound slot of `restrictions`, the certificate in `quorum` that binds it.
fn binding_certificates(
    quorum: &[&ViewChangeMessage],
    restrictions: &Restrictions,
) -> BTreeMap<SeqNumber, PreparedCertificate> {
    restrictions
        .iter()
        .filter_map(|(seq, restriction)| match restriction {
            Restriction::Bound {
                digest,
                certified_in,
            } => quorum
                .iter()
                .filter_map(|view_change| view_change.prepared_certificate(seq))
                .find(|certificate| {
                    certificate.view == *certified_in && certificate.digest == *digest
                })
                .map(|certificate| (seq, certificate.clone())),
            Restriction::Free => None,
        })
        .collect()
}

/// Check that no slot bound in the active view is re-bound to a different proposal without a
/// certificate from a strictly higher view.
fn check_restrictions_monotonic(
    previous: &Restrictions,
    current: &Restrictions,
) -> Result<(), InvariantViolation> {
    for (seq, previous_restriction) in previous.iter() {
        if let (
            Restriction::Bound {
                digest: previous_digest,
                certified_in: previous_view,
            },
            Some(Restriction::Bound {
                digest: current_digest,
                certified_in: current_view,
            }),
        ) = (previous_restriction, current.get(seq))
        {
            if previous_digest != current_digest && current_view <= previous_view {
                return Err(InvariantViolation::RestrictionChanged {
                    seq,
                    previous: *previous_restriction,
                    current: Restriction::Bound {
                        digest: *current_digest,
                        certified_in: *current_view,
                    },
                });
            }
        }
    }
    Ok(())
}
