use std::sync::mpsc::Sender;

use rand_core::OsRng;

use bft_views::{
    config::Configuration,
    events::Event,
    types::{
        crypto_primitives::SigningKey,
        data_types::{CryptoHash, ReplicaID, SeqNumber, ViewNumber},
        replica_set::{QuorumKind, ReplicaSet},
    },
    view_change::{
        implementation::ViewsManager,
        messages::{PrePrepareMessage, PreparedCertificate, ViewChangeMessage},
        types::{EnterViewOutcome, PendingSlot, PrevViewInfo},
        verifier::{CertificateVerifier, Ed25519CertificateVerifier},
    },
};

/// A set of `N = 3F + 2C + 1` replicas, each with its own `ViewsManager`, connected by a test that
/// passes messages between them by hand.
pub(crate) struct Cluster {
    pub(crate) keys: Vec<SigningKey>,
    pub(crate) replicas: Vec<ViewsManager<Ed25519CertificateVerifier>>,
    fault_bound: u16,
    redundancy: u16,
    work_window_size: u64,
}

impl Cluster {
    pub(crate) fn new(fault_bound: u16, redundancy: u16, work_window_size: u64) -> Self {
        let n = 3 * fault_bound + 2 * redundancy + 1;
        let mut csprg = OsRng {};
        let keys: Vec<SigningKey> = (0..n).map(|_| SigningKey::generate(&mut csprg)).collect();

        let mut cluster = Self {
            keys,
            replicas: Vec::new(),
            fault_bound,
            redundancy,
            work_window_size,
        };
        cluster.replicas = (0..n)
            .map(|me| cluster.manager(me, None))
            .collect();
        cluster
    }

    pub(crate) fn replica_set(&self, me: u16) -> ReplicaSet {
        ReplicaSet::new(
            self.fault_bound,
            self.redundancy,
            ReplicaID::new(me),
            self.keys.iter().map(|key| key.verifying_key()).collect(),
        )
        .unwrap()
    }

    pub(crate) fn verifier(&self) -> Ed25519CertificateVerifier {
        Ed25519CertificateVerifier::new(self.replica_set(0))
    }

    /// Create a fresh `ViewsManager` for replica `me`, publishing its events on `event_publisher`.
    pub(crate) fn manager(
        &self,
        me: u16,
        event_publisher: Option<Sender<Event>>,
    ) -> ViewsManager<Ed25519CertificateVerifier> {
        let config = Configuration::builder()
            .me(self.keys[me as usize].clone())
            .work_window_size(self.work_window_size)
            .build();
        ViewsManager::new(
            config,
            self.replica_set(me),
            Ed25519CertificateVerifier::new(self.replica_set(me)),
            event_publisher,
        )
        .unwrap()
    }

    pub(crate) fn quorum_size(&self) -> usize {
        self.replica_set(0).quorum_size(QuorumKind::Strong)
    }

    /// Make every replica enter view 0 with an empty log.
    pub(crate) fn enter_initial_view(&mut self) {
        for replica in self.replicas.iter_mut() {
            let outcome = replica
                .try_to_enter_view(ViewNumber::new(0), SeqNumber::new(0), SeqNumber::new(0))
                .unwrap();
            assert!(matches!(outcome, EnterViewOutcome::Entered { .. }));
        }
    }

    /// Create a prepared certificate for `digest` at `seq` in `view`, signed by the first quorum of
    /// replicas.
    pub(crate) fn prepared_certificate(
        &self,
        view: ViewNumber,
        seq: SeqNumber,
        digest: CryptoHash,
    ) -> PreparedCertificate {
        let shares = (0..self.quorum_size() as u16)
            .map(|signer| {
                PreparedCertificate::sign_prepare(
                    &self.keys[signer as usize],
                    ReplicaID::new(signer),
                    view,
                    seq,
                    digest,
                )
            })
            .collect();
        PreparedCertificate {
            view,
            seq,
            digest,
            certificate: self.verifier().combine(shares).unwrap(),
        }
    }

    /// Create a `ViewChangeMessage` signed by `sender` directly, without a `ViewsManager`.
    pub(crate) fn signed_view_change(
        &self,
        sender: u16,
        view: ViewNumber,
        last_stable: SeqNumber,
    ) -> ViewChangeMessage {
        ViewChangeMessage::new(
            &self.keys[sender as usize],
            ReplicaID::new(sender),
            view,
            last_stable,
            last_stable,
            Vec::new(),
        )
    }

    /// Pass `view_change` to every replica except its sender. Returns which replicas reported a quorum.
    pub(crate) fn broadcast_view_change(&mut self, view_change: &ViewChangeMessage) -> Vec<bool> {
        self.replicas
            .iter_mut()
            .enumerate()
            .map(|(index, replica)| {
                index != view_change.sender.index() && replica.add_view_change(view_change.clone())
            })
            .collect()
    }

    /// Pass the `NewViewMessage` that replica `primary` created for `view` to every other replica.
    pub(crate) fn broadcast_new_view(&mut self, primary: u16, view: ViewNumber) {
        let new_view = self.replicas[primary as usize]
            .new_view_for_view(view)
            .cloned()
            .unwrap();
        for (index, replica) in self.replicas.iter_mut().enumerate() {
            if index != primary as usize {
                assert!(replica.add_new_view(new_view.clone()));
            }
        }
    }
}

/// A pending slot whose content is complete.
pub(crate) fn pending_slot(
    pre_prepare: &PrePrepareMessage,
    prepared: Option<PreparedCertificate>,
) -> PendingSlot {
    PendingSlot {
        pre_prepare: pre_prepare.clone(),
        has_all_requests: true,
        prepared,
    }
}

pub(crate) fn prev_view_info(pending: Vec<PendingSlot>) -> PrevViewInfo {
    PrevViewInfo {
        executed: Vec::new(),
        pending,
    }
}
