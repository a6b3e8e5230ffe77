use std::sync::{mpsc, Arc, Mutex};

use log::LevelFilter;
use rand::seq::SliceRandom;

use bft_views::{
    event_bus::{start_event_bus, EventHandlers},
    events::{EnterViewEvent, RejectEvidenceEvent},
    types::data_types::{ReplicaID, SeqNumber, ViewNumber},
    view_change::{
        messages::{
            NewViewMessage, PrePrepareMessage, PreparedCertificate, SlotEvidence,
            ViewChangeElement, ViewChangeMessage,
        },
        safety::{Restriction, SafetyLogicError},
        types::{
            EnterViewOutcome, InvariantViolation, MissingPrePrepareOutcome, PendingSlot,
            PrevViewInfo, Rejection, RelevantViewNumbers, ViewStatus, ViewsManagerError,
        },
        verifier::{CertificateVerifier, QuorumCertificate},
    },
};

mod common;

use common::{
    cluster::{pending_slot, prev_view_info, Cluster},
    logging::{log_with_context, setup_logger},
};

fn view(int: u64) -> ViewNumber {
    ViewNumber::new(int)
}

fn seq(int: u64) -> SeqNumber {
    SeqNumber::new(int)
}

/// Runs two view changes in a cluster with N = 4, F = 1, C = 0 in which the proposal for slot 5 was
/// prepared in view 0.
///
/// Replica 0, the primary of view 0, is suspected and never leaves view 0. Replicas 1, 2, and 3 move
/// to view 1 (primary: replica 1), where the proposal must be re-issued unchanged, and then to view 2
/// (primary: replica 2), where it must be re-issued again.
#[test]
fn prepared_proposal_survives_two_view_changes() {
    setup_logger(LevelFilter::Debug);

    // 1. Initialize the cluster, and prepare slot 5 in view 0.
    let mut cluster = Cluster::new(1, 0, 300);
    cluster.enter_initial_view();
    let pre_prepare = PrePrepareMessage::new(view(0), seq(5), b"transfer 10".to_vec());
    let prepared_in_view_0 = cluster.prepared_certificate(view(0), seq(5), pre_prepare.digest);

    // 2. Replicas 1, 2, and 3 leave view 0.
    log_with_context(None, "Leaving view 0.");
    let mut quorum_reported = Vec::new();
    for replica in 1..=3u16 {
        let view_change = cluster.replicas[replica as usize]
            .exit_from_current_view(
                seq(0),
                seq(4),
                prev_view_info(vec![pending_slot(
                    &pre_prepare,
                    Some(prepared_in_view_0.clone()),
                )]),
            )
            .unwrap();
        assert_eq!(view_change.view, view(1));
        quorum_reported.push(cluster.broadcast_view_change(&view_change));
    }
    // The third message completes the quorum at every replica that received it.
    assert_eq!(quorum_reported[2], vec![true, true, true, false]);

    // 3. The primary of view 1 enters the view and creates its `NewViewMessage`.
    log_with_context(Some(ReplicaID::new(1)), "Entering view 1.");
    let outcome = cluster.replicas[1]
        .try_to_enter_view(view(1), seq(0), seq(4))
        .unwrap();
    let expected = EnterViewOutcome::Entered {
        view: view(1),
        pre_prepares: vec![pre_prepare.with_view(view(1))],
    };
    assert_eq!(outcome, expected);
    let new_view = cluster.replicas[1].my_new_view_for_current_view().unwrap();
    assert_eq!(
        new_view.referenced_replicas(),
        vec![ReplicaID::new(1), ReplicaID::new(2), ReplicaID::new(3)]
    );
    assert_eq!(
        cluster.replicas[1].pre_prepare(seq(5)),
        Some(&pre_prepare.with_view(view(1)))
    );

    // 4. The other replicas follow the primary.
    cluster.broadcast_new_view(1, view(1));
    for replica in 2..=3 {
        assert!(cluster.replicas[replica].has_new_view_message(view(1)));
        let outcome = cluster.replicas[replica]
            .try_to_enter_view(view(1), seq(0), seq(4))
            .unwrap();
        assert_eq!(outcome, expected);
        assert!(cluster.replicas[replica].view_is_active(view(1)));
        assert_eq!(
            cluster.replicas[replica].stable_lower_bound_when_entered_to_view(),
            Some(seq(0))
        );
    }

    // 5. Slot 5 is prepared again in view 1, and replicas 1, 2, and 3 leave view 1.
    log_with_context(None, "Leaving view 1.");
    let reissued = pre_prepare.with_view(view(1));
    let prepared_in_view_1 = cluster.prepared_certificate(view(1), seq(5), reissued.digest);
    for replica in 1..=3u16 {
        let view_change = cluster.replicas[replica as usize]
            .exit_from_current_view(
                seq(0),
                seq(4),
                prev_view_info(vec![pending_slot(&reissued, Some(prepared_in_view_1.clone()))]),
            )
            .unwrap();
        assert_eq!(view_change.view, view(2));
        cluster.broadcast_view_change(&view_change);
    }

    // 6. Every replica of the new quorum enters view 2 with the same proposal for slot 5.
    let outcome = cluster.replicas[2]
        .try_to_enter_view(view(2), seq(0), seq(4))
        .unwrap();
    let expected = EnterViewOutcome::Entered {
        view: view(2),
        pre_prepares: vec![pre_prepare.with_view(view(2))],
    };
    assert_eq!(outcome, expected);
    cluster.broadcast_new_view(2, view(2));
    for replica in [1, 3] {
        let outcome = cluster.replicas[replica]
            .try_to_enter_view(view(2), seq(0), seq(4))
            .unwrap();
        assert_eq!(outcome, expected);
    }

    // Replica 0 never left view 0, but it still holds the evidence for view 2.
    assert!(cluster.replicas[0].view_is_active(view(0)));
    assert!(cluster.replicas[0].has_new_view_message(view(2)));
    assert!(cluster.replicas[0].has_view_change_for_future_view(ReplicaID::new(3)));
}

/// Tests that a replica without the content of a bound slot waits for it, ignores content with the
/// wrong digest, and enters the view once the right content arrives.
#[test]
fn missing_pre_prepare_is_recovered() {
    let mut cluster = Cluster::new(1, 0, 300);
    cluster.enter_initial_view();
    let pre_prepare = PrePrepareMessage::new(view(0), seq(5), b"transfer 10".to_vec());
    let prepared = cluster.prepared_certificate(view(0), seq(5), pre_prepare.digest);

    for replica in 1..=3u16 {
        let mut slot = pending_slot(&pre_prepare, Some(prepared.clone()));
        // Replica 3 misses some of the requests of the proposal.
        slot.has_all_requests = replica != 3;
        let view_change = cluster.replicas[replica as usize]
            .exit_from_current_view(seq(0), seq(4), prev_view_info(vec![slot]))
            .unwrap();
        cluster.broadcast_view_change(&view_change);
    }
    cluster.replicas[1]
        .try_to_enter_view(view(1), seq(0), seq(4))
        .unwrap();
    cluster.broadcast_new_view(1, view(1));

    let replica = &mut cluster.replicas[3];
    assert_eq!(
        replica.try_to_enter_view(view(1), seq(0), seq(4)).unwrap(),
        EnterViewOutcome::WaitingForPrePrepares {
            missing: vec![seq(5)]
        }
    );
    assert_eq!(replica.status(), ViewStatus::PendingWithRestrictions);
    assert!(replica.waiting_for_messages());
    assert_eq!(
        replica.pending_restrictions().unwrap().get(seq(5)),
        Some(&Restriction::Bound {
            digest: pre_prepare.digest,
            certified_in: view(0)
        })
    );
    assert_eq!(
        replica.numbers_of_missing_pre_prepares(seq(0)).unwrap(),
        vec![seq(5)]
    );
    // A stable checkpoint at or above the slot makes its content unnecessary.
    assert!(replica
        .numbers_of_missing_pre_prepares(seq(5))
        .unwrap()
        .is_empty());

    // Calling again with the same target reports the same missing slots.
    assert_eq!(
        replica.try_to_enter_view(view(1), seq(0), seq(4)).unwrap(),
        EnterViewOutcome::WaitingForPrePrepares {
            missing: vec![seq(5)]
        }
    );

    let forged = PrePrepareMessage::new(view(0), seq(5), b"transfer 1000".to_vec());
    assert_eq!(
        replica
            .add_potentially_missing_pre_prepare(forged, seq(0))
            .unwrap(),
        MissingPrePrepareOutcome::Ignored
    );
    let unbound = PrePrepareMessage::new(view(0), seq(6), b"transfer 10".to_vec());
    assert_eq!(
        replica
            .add_potentially_missing_pre_prepare(unbound, seq(0))
            .unwrap(),
        MissingPrePrepareOutcome::Ignored
    );

    assert_eq!(
        replica
            .add_potentially_missing_pre_prepare(pre_prepare.clone(), seq(0))
            .unwrap(),
        MissingPrePrepareOutcome::EnteredView {
            view: view(1),
            pre_prepares: vec![pre_prepare.with_view(view(1))]
        }
    );
    assert!(replica.view_is_active(view(1)));

    // Late content is normal, and ignored.
    assert_eq!(
        replica
            .add_potentially_missing_pre_prepare(pre_prepare, seq(0))
            .unwrap(),
        MissingPrePrepareOutcome::Ignored
    );
}

/// Tests that slots nobody prepared are free in the new view, and that bare proposals are not carried
/// over.
#[test]
fn unprepared_proposals_are_not_reissued() {
    let mut cluster = Cluster::new(1, 0, 300);
    cluster.enter_initial_view();
    let pre_prepare = PrePrepareMessage::new(view(0), seq(1), b"transfer 10".to_vec());

    for replica in 1..=3u16 {
        let view_change = cluster.replicas[replica as usize]
            .exit_from_current_view(seq(0), seq(0), prev_view_info(vec![pending_slot(&pre_prepare, None)]))
            .unwrap();
        assert_eq!(
            view_change.elements,
            vec![ViewChangeElement {
                seq: seq(1),
                evidence: SlotEvidence::PrePrepared {
                    view: view(0),
                    digest: pre_prepare.digest
                }
            }]
        );
        cluster.broadcast_view_change(&view_change);
    }

    assert_eq!(
        cluster.replicas[1]
            .try_to_enter_view(view(1), seq(0), seq(0))
            .unwrap(),
        EnterViewOutcome::Entered {
            view: view(1),
            pre_prepares: Vec::new()
        }
    );
    assert_eq!(cluster.replicas[1].pre_prepare(seq(1)), None);
}

/// Tests that a proposal re-issued in view 1 under a restriction, but never prepared again in view 1,
/// stays bound to the same digest in view 2.
#[test]
fn restricted_proposal_stays_bound_without_new_certificate() {
    let mut cluster = Cluster::new(1, 0, 300);
    cluster.enter_initial_view();
    let pre_prepare = PrePrepareMessage::new(view(0), seq(5), vec![0xAB]);
    let prepared_in_view_0 = cluster.prepared_certificate(view(0), seq(5), pre_prepare.digest);

    // 1. Replicas 1, 2, and 3 move to view 1 with slot 5 bound.
    for replica in 1..=3u16 {
        let view_change = cluster.replicas[replica as usize]
            .exit_from_current_view(
                seq(0),
                seq(4),
                prev_view_info(vec![pending_slot(
                    &pre_prepare,
                    Some(prepared_in_view_0.clone()),
                )]),
            )
            .unwrap();
        cluster.broadcast_view_change(&view_change);
    }
    cluster.replicas[1]
        .try_to_enter_view(view(1), seq(0), seq(4))
        .unwrap();
    cluster.broadcast_new_view(1, view(1));
    for replica in 2..=3 {
        cluster.replicas[replica]
            .try_to_enter_view(view(1), seq(0), seq(4))
            .unwrap();
    }

    // 2. View 1 fails before the re-issued proposal is prepared again.
    let reissued = pre_prepare.with_view(view(1));
    for replica in 1..=3u16 {
        let view_change = cluster.replicas[replica as usize]
            .exit_from_current_view(
                seq(0),
                seq(4),
                prev_view_info(vec![pending_slot(&reissued, None)]),
            )
            .unwrap();
        assert_eq!(
            view_change.prepared_certificate(seq(5)),
            Some(&prepared_in_view_0)
        );
        cluster.broadcast_view_change(&view_change);
    }

    // 3. View 2 is still bound to the digest certified in view 0.
    let expected = EnterViewOutcome::Entered {
        view: view(2),
        pre_prepares: vec![pre_prepare.with_view(view(2))],
    };
    assert_eq!(
        cluster.replicas[2]
            .try_to_enter_view(view(2), seq(0), seq(4))
            .unwrap(),
        expected
    );
    cluster.broadcast_new_view(2, view(2));
    for replica in [1, 3] {
        let replica = &mut cluster.replicas[replica];
        assert_eq!(
            replica.try_to_enter_view(view(2), seq(0), seq(4)).unwrap(),
            expected
        );
        assert!(!replica.is_halted());
    }
}

/// Tests that a single faulty member of the quorum that reports an inflated stable checkpoint cannot keep
/// correct replicas out of the new view.
#[test]
fn inflated_stable_checkpoint_does_not_block_the_view() {
    let mut cluster = Cluster::new(1, 0, 300);
    cluster.enter_initial_view();

    for replica in 1..=2u16 {
        let view_change = cluster.replicas[replica as usize]
            .exit_from_current_view(seq(0), seq(0), PrevViewInfo::default())
            .unwrap();
        cluster.broadcast_view_change(&view_change);
    }
    // Replica 3 is faulty, and claims a stable checkpoint nobody else has.
    let inflated = cluster.signed_view_change(3, view(1), seq(1_000_000));
    cluster.broadcast_view_change(&inflated);

    assert!(matches!(
        cluster.replicas[1].try_to_enter_view(view(1), seq(0), seq(0)),
        Ok(EnterViewOutcome::Entered { .. })
    ));
    assert_eq!(
        cluster.replicas[1]
            .new_view_for_view(view(1))
            .unwrap()
            .referenced_replicas(),
        vec![ReplicaID::new(1), ReplicaID::new(2), ReplicaID::new(3)]
    );
    cluster.broadcast_new_view(1, view(1));
    assert!(matches!(
        cluster.replicas[2].try_to_enter_view(view(1), seq(0), seq(0)),
        Ok(EnterViewOutcome::Entered { .. })
    ));
    assert_eq!(
        cluster.replicas[2].stable_lower_bound_when_entered_to_view(),
        Some(seq(0))
    );
}

/// Tests that adding the same view-change message twice changes nothing, and that every kind of invalid
/// evidence is rejected and counted.
#[test]
fn invalid_and_repeated_evidence_is_rejected() {
    let mut cluster = Cluster::new(1, 0, 300);
    cluster.enter_initial_view();

    let rejected = Arc::new(Mutex::new(Vec::new()));
    let rejected_clone = rejected.clone();
    let handlers = EventHandlers::new(false).on_reject_evidence(move |event: &RejectEvidenceEvent| {
        rejected_clone.lock().unwrap().push(event.reason)
    });
    let (event_publisher, event_subscriber) = mpsc::channel();
    let (shutdown, shutdown_receiver) = mpsc::channel();
    let event_bus = start_event_bus(handlers, event_subscriber, shutdown_receiver);
    let mut replica = cluster.manager(0, Some(event_publisher));
    replica
        .try_to_enter_view(view(0), seq(0), seq(0))
        .unwrap();

    // 1. A valid message is accepted once.
    let view_change = cluster.signed_view_change(2, view(1), seq(0));
    assert!(!replica.add_view_change(view_change.clone()));
    assert!(!replica.add_view_change(view_change.clone()));
    assert_eq!(replica.view_changes_for_view(view(1)), vec![&view_change]);
    assert_eq!(replica.status(), ViewStatus::InView);

    // 2. Unknown sender.
    let mut unknown = cluster.signed_view_change(2, view(1), seq(0));
    unknown.sender = ReplicaID::new(9);
    assert!(!replica.add_view_change(unknown));

    // 3. Signature of another replica.
    let mut forged = cluster.signed_view_change(3, view(1), seq(0));
    forged.signature = cluster.signed_view_change(1, view(1), seq(0)).signature;
    assert!(!replica.add_view_change(forged));

    // 4. Evidence outside the work window.
    let far = PrePrepareMessage::new(view(0), seq(400), vec![1]);
    let malformed = ViewChangeMessage::new(
        &cluster.keys[3],
        ReplicaID::new(3),
        view(1),
        seq(0),
        seq(0),
        vec![ViewChangeElement {
            seq: far.seq,
            evidence: SlotEvidence::PrePrepared {
                view: view(0),
                digest: far.digest,
            },
        }],
    );
    assert!(!replica.add_view_change(malformed));

    // 5. Prepared certificate without a quorum.
    let pre_prepare = PrePrepareMessage::new(view(0), seq(1), vec![1]);
    let mut weak = cluster.prepared_certificate(view(0), seq(1), pre_prepare.digest);
    weak.certificate = QuorumCertificate::from_shares(weak.certificate.shares()[..2].to_vec());
    let invalid = ViewChangeMessage::new(
        &cluster.keys[3],
        ReplicaID::new(3),
        view(1),
        seq(0),
        seq(0),
        vec![ViewChangeElement {
            seq: seq(1),
            evidence: SlotEvidence::Prepared(weak),
        }],
    );
    assert!(!replica.add_view_change(invalid));

    // 6. New-view message from a replica that is not the primary of its view.
    let shares = (1..=3u16)
        .map(|sender| {
            cluster
                .signed_view_change(sender, view(1), seq(0))
                .signature_share()
        })
        .collect();
    let certificate = cluster.verifier().combine(shares).unwrap();
    let not_primary = NewViewMessage::new(&cluster.keys[2], ReplicaID::new(2), view(1), certificate);
    assert!(!replica.add_new_view(not_primary));

    let counters = *replica.rejection_counters();
    assert_eq!(counters.get(Rejection::Stale), 1);
    assert_eq!(counters.get(Rejection::UnknownSender), 1);
    assert_eq!(counters.get(Rejection::BadSignature), 1);
    assert_eq!(counters.get(Rejection::Malformed), 1);
    assert_eq!(counters.get(Rejection::InvalidCertificate), 1);
    assert_eq!(counters.get(Rejection::NotPrimary), 1);
    assert_eq!(counters.total(), 6);

    drop(replica);
    event_bus.join().unwrap();
    drop(shutdown);
    assert_eq!(
        *rejected.lock().unwrap(),
        vec![
            Rejection::Stale,
            Rejection::UnknownSender,
            Rejection::BadSignature,
            Rejection::Malformed,
            Rejection::InvalidCertificate,
            Rejection::NotPrimary,
        ]
    );
}

/// Tests that a view-change message created by one replica is admitted unchanged by another.
#[test]
fn exit_and_add_round_trip() {
    let mut cluster = Cluster::new(1, 0, 300);
    cluster.enter_initial_view();
    let pre_prepare = PrePrepareMessage::new(view(0), seq(3), vec![3]);
    let prepared = cluster.prepared_certificate(view(0), seq(3), pre_prepare.digest);

    let view_change = cluster.replicas[2]
        .exit_from_current_view(
            seq(0),
            seq(2),
            PrevViewInfo {
                executed: Vec::new(),
                pending: vec![PendingSlot {
                    pre_prepare: pre_prepare.clone(),
                    has_all_requests: true,
                    prepared: Some(prepared.clone()),
                }],
            },
        )
        .unwrap();
    assert_eq!(
        view_change.prepared_certificate(seq(3)),
        Some(&prepared)
    );

    assert!(!cluster.replicas[0].add_view_change(view_change.clone()));
    assert_eq!(cluster.replicas[0].rejection_counters().total(), 0);
    assert_eq!(
        cluster.replicas[0].view_changes_for_view(view(1)),
        vec![&view_change]
    );
    assert!(cluster.replicas[0].has_view_change_for_future_view(ReplicaID::new(2)));

    // The sender's own message, echoed back, changes nothing.
    assert!(!cluster.replicas[2].add_view_change(view_change.clone()));
    assert_eq!(cluster.replicas[2].rejection_counters().total(), 0);
    assert_eq!(cluster.replicas[2].my_latest_view_change(), Some(&view_change));
}

/// Tests that a replica whose stable checkpoint is behind the quorum's cannot enter the view until it
/// catches up.
#[test]
fn lagging_stable_checkpoint_delays_entering() {
    let mut cluster = Cluster::new(1, 0, 300);
    cluster.enter_initial_view();

    for (replica, last_stable) in [(1u16, 10u64), (2, 10), (3, 0)] {
        let view_change = cluster.replicas[replica as usize]
            .exit_from_current_view(seq(last_stable), seq(last_stable), PrevViewInfo::default())
            .unwrap();
        cluster.broadcast_view_change(&view_change);
    }
    assert!(matches!(
        cluster.replicas[1].try_to_enter_view(view(1), seq(10), seq(10)),
        Ok(EnterViewOutcome::Entered { .. })
    ));
    cluster.broadcast_new_view(1, view(1));

    let replica = &mut cluster.replicas[3];
    assert_eq!(
        replica.try_to_enter_view(view(1), seq(0), seq(0)).unwrap(),
        EnterViewOutcome::NotReady
    );
    assert_eq!(replica.status(), ViewStatus::Pending);
    assert!(matches!(
        replica.try_to_enter_view(view(1), seq(10), seq(10)),
        Ok(EnterViewOutcome::Entered { .. })
    ));
    assert_eq!(
        replica.stable_lower_bound_when_entered_to_view(),
        Some(seq(10))
    );
}

/// Tests that moving to a higher target abandons the pending view and re-issues the local view-change
/// message, and that moving back to a lower target is refused.
#[test]
fn jump_to_a_higher_view() {
    let mut cluster = Cluster::new(1, 0, 300);
    cluster.enter_initial_view();
    let pre_prepare = PrePrepareMessage::new(view(0), seq(1), vec![1]);

    let replica = &mut cluster.replicas[2];
    let first = replica
        .exit_from_current_view(seq(0), seq(0), prev_view_info(vec![pending_slot(&pre_prepare, None)]))
        .unwrap();
    assert_eq!(
        replica.try_to_enter_view(view(3), seq(0), seq(0)).unwrap(),
        EnterViewOutcome::NotReady
    );

    let reissued = replica.my_latest_view_change().unwrap();
    assert_eq!(reissued.view, view(3));
    assert_eq!(reissued.elements, first.elements);
    assert_eq!(reissued.last_stable, first.last_stable);
    assert_eq!(replica.latest_pending_view(), view(3));
    assert!(replica.view_is_pending(view(3)));

    let result = replica.try_to_enter_view(view(1), seq(0), seq(0));
    assert!(matches!(
        result,
        Err(ViewsManagerError::TargetViewBelowPendingView { .. })
    ));
    assert!(!result.unwrap_err().is_fatal());
    assert!(!replica.is_halted());
}

/// Tests which views the view-change messages of other replicas vouch for.
#[test]
fn relevant_view_numbers() {
    let mut cluster = Cluster::new(1, 0, 300);
    cluster.enter_initial_view();

    assert_eq!(
        cluster.replicas[0].compute_correct_relevant_view_numbers(),
        RelevantViewNumbers {
            max_known_correct_view: view(0),
            max_known_agreed_view: view(0)
        }
    );

    for (sender, target) in [(1u16, 3u64), (2, 5), (3, 4)] {
        let view_change = cluster.signed_view_change(sender, view(target), seq(0));
        assert!(!cluster.replicas[0].add_view_change(view_change));
    }
    assert_eq!(
        cluster.replicas[0].compute_correct_relevant_view_numbers(),
        RelevantViewNumbers {
            max_known_correct_view: view(4),
            max_known_agreed_view: view(3)
        }
    );
}

/// Tests that conflicting prepared certificates from the same view, which need more than F faulty
/// replicas, halt the primary instead of being resolved arbitrarily.
#[test]
fn conflicting_certificates_halt_the_manager() {
    let mut cluster = Cluster::new(1, 0, 300);
    cluster.enter_initial_view();
    let honest = PrePrepareMessage::new(view(0), seq(2), b"honest".to_vec());
    let equivocated = PrePrepareMessage::new(view(0), seq(2), b"equivocated".to_vec());

    for replica in 1..=3u16 {
        let pre_prepare = if replica == 3 { &equivocated } else { &honest };
        let prepared = cluster.prepared_certificate(view(0), seq(2), pre_prepare.digest);
        let view_change = cluster.replicas[replica as usize]
            .exit_from_current_view(
                seq(0),
                seq(0),
                prev_view_info(vec![pending_slot(pre_prepare, Some(prepared))]),
            )
            .unwrap();
        cluster.broadcast_view_change(&view_change);
    }

    let late_view_change = cluster.signed_view_change(0, view(1), seq(0));
    let primary = &mut cluster.replicas[1];
    let error = primary
        .try_to_enter_view(view(1), seq(0), seq(0))
        .unwrap_err();
    assert!(matches!(
        error,
        ViewsManagerError::SafetyLogic(SafetyLogicError::ConflictingCertificates { .. })
    ));
    assert!(error.is_fatal());
    assert!(primary.is_halted());
    assert!(matches!(
        primary.try_to_enter_view(view(1), seq(0), seq(0)),
        Err(ViewsManagerError::Halted)
    ));
    assert!(!primary.add_view_change(late_view_change));
}

/// Tests that reporting a lower stable checkpoint than before is fatal.
#[test]
fn stable_regression_is_fatal() {
    let mut cluster = Cluster::new(1, 0, 300);
    let replica = &mut cluster.replicas[0];
    replica
        .try_to_enter_view(view(0), seq(20), seq(20))
        .unwrap();
    replica
        .exit_from_current_view(seq(20), seq(20), PrevViewInfo::default())
        .unwrap();

    assert!(matches!(
        replica.try_to_enter_view(view(1), seq(10), seq(20)),
        Err(ViewsManagerError::InvariantViolation(
            InvariantViolation::StableRegression { .. }
        ))
    ));
    assert!(replica.is_halted());
    assert!(matches!(
        replica.add_potentially_missing_pre_prepare(
            PrePrepareMessage::new(view(0), seq(21), vec![]),
            seq(20)
        ),
        Err(ViewsManagerError::Halted)
    ));
}

/// Tests that the order in which evidence arrives does not change the outcome.
#[test]
fn shuffled_delivery_reaches_the_same_view() {
    enum Evidence {
        ViewChange(ViewChangeMessage),
        NewView(NewViewMessage),
    }

    let mut rng = rand::thread_rng();
    for _ in 0..10 {
        let mut cluster = Cluster::new(1, 0, 300);
        cluster.enter_initial_view();
        let pre_prepare = PrePrepareMessage::new(view(0), seq(7), vec![7]);
        let prepared = cluster.prepared_certificate(view(0), seq(7), pre_prepare.digest);

        let mut view_changes = Vec::new();
        for replica in 1..=3u16 {
            let view_change = cluster.replicas[replica as usize]
                .exit_from_current_view(
                    seq(0),
                    seq(0),
                    prev_view_info(vec![pending_slot(&pre_prepare, Some(prepared.clone()))]),
                )
                .unwrap();
            view_changes.push(view_change);
        }

        // Replica 1, the primary of view 1, receives the messages of replicas 2 and 3.
        for view_change in &view_changes[1..] {
            cluster.replicas[1].add_view_change(view_change.clone());
        }
        cluster.replicas[1]
            .try_to_enter_view(view(1), seq(0), seq(0))
            .unwrap();
        let new_view = cluster.replicas[1]
            .new_view_for_view(view(1))
            .cloned()
            .unwrap();

        // Replica 0 receives everything, including duplicates, in a random order.
        let mut evidence: Vec<Evidence> = view_changes
            .iter()
            .chain(view_changes.iter())
            .cloned()
            .map(Evidence::ViewChange)
            .collect();
        evidence.push(Evidence::NewView(new_view));
        evidence.shuffle(&mut rng);

        let replica = &mut cluster.replicas[0];
        for evidence in evidence {
            match evidence {
                Evidence::ViewChange(view_change) => {
                    replica.add_view_change(view_change);
                }
                Evidence::NewView(new_view) => {
                    replica.add_new_view(new_view);
                }
            }
        }
        assert_eq!(replica.rejection_counters().get(Rejection::Stale), 3);

        // Replica 0 never left view 0, so it joins view 1 without evidence of its own.
        replica
            .exit_from_current_view(seq(0), seq(0), PrevViewInfo::default())
            .unwrap();
        assert_eq!(
            replica.try_to_enter_view(view(1), seq(0), seq(0)).unwrap(),
            EnterViewOutcome::WaitingForPrePrepares {
                missing: vec![seq(7)]
            }
        );
        assert_eq!(
            replica
                .add_potentially_missing_pre_prepare(pre_prepare.clone(), seq(0))
                .unwrap(),
            MissingPrePrepareOutcome::EnteredView {
                view: view(1),
                pre_prepares: vec![pre_prepare.with_view(view(1))]
            }
        );
    }
}

/// Tests that the event bus logs events and passes them to registered handlers.
#[test]
fn events_reach_the_event_bus() {
    setup_logger(LevelFilter::Info);

    let cluster = Cluster::new(1, 0, 300);
    let entered = Arc::new(Mutex::new(Vec::new()));
    let entered_clone = entered.clone();
    let handlers = EventHandlers::new(true).on_enter_view(move |event: &EnterViewEvent| {
        entered_clone.lock().unwrap().push(event.view)
    });
    let (event_publisher, event_subscriber) = mpsc::channel();
    let (shutdown, shutdown_receiver) = mpsc::channel();
    let event_bus = start_event_bus(handlers, event_subscriber, shutdown_receiver);

    let mut replica = cluster.manager(1, Some(event_publisher));
    replica
        .try_to_enter_view(view(0), seq(0), seq(0))
        .unwrap();
    replica
        .exit_from_current_view(seq(0), seq(0), PrevViewInfo::default())
        .unwrap();
    for sender in [2u16, 3] {
        replica.add_view_change(cluster.signed_view_change(sender, view(1), seq(0)));
    }
    assert!(matches!(
        replica.try_to_enter_view(view(1), seq(0), seq(0)),
        Ok(EnterViewOutcome::Entered { .. })
    ));

    drop(replica);
    event_bus.join().unwrap();
    drop(shutdown);
    assert_eq!(*entered.lock().unwrap(), vec![view(0), view(1)]);
}

/// Tests that a certificate made of shares over prepare digests of another slot does not pass as
/// evidence for this one.
#[test]
fn certificate_for_another_slot_is_malformed() {
    let mut cluster = Cluster::new(1, 0, 300);
    cluster.enter_initial_view();
    let pre_prepare = PrePrepareMessage::new(view(0), seq(1), vec![1]);
    let other = cluster.prepared_certificate(view(0), seq(2), pre_prepare.digest);
    let misattributed = PreparedCertificate {
        seq: seq(1),
        ..other
    };

    let view_change = ViewChangeMessage::new(
        &cluster.keys[1],
        ReplicaID::new(1),
        view(1),
        seq(0),
        seq(0),
        vec![ViewChangeElement {
            seq: seq(1),
            evidence: SlotEvidence::Prepared(misattributed),
        }],
    );
    assert!(!cluster.replicas[0].add_view_change(view_change));
    assert_eq!(
        cluster.replicas[0]
            .rejection_counters()
            .get(Rejection::Malformed),
        1
    );
}
