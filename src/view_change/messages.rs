/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of the evidence exchanged between replicas during a view change.
//!
//! Four kinds of evidence are involved:
//! 1. [`PrePrepareMessage`]: the content proposed for a slot.
//! 2. [`PreparedCertificate`]: proof that a quorum prepared a particular proposal for a slot in a view.
//! 3. [`ViewChangeMessage`]: a replica's summary of its progress, sent when it leaves a view.
//! 4. [`NewViewMessage`]: the primary's announcement of the quorum of `ViewChangeMessage`s that
//!    justifies entering a new view.
//!
//! None of these types define a wire encoding. Borsh is used only to produce the canonical bytes that
//! digests and signatures are computed over.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    crypto_primitives::{CryptoHasher, Digest, Keypair, SigningKey},
    data_types::{CryptoHash, ReplicaID, SeqNumber, SignatureBytes, ViewNumber},
    signed_messages::SignedMessage,
};

use super::verifier::{QuorumCertificate, SignatureShare};

// Domain separation tags, prepended to the bytes of every digest.
const PRE_PREPARE_TAG: u8 = 0;
const PREPARE_TAG: u8 = 1;
const VIEW_CHANGE_TAG: u8 = 2;
const NEW_VIEW_TAG: u8 = 3;

/// The content proposed for slot `seq`, and the view in which it was (last) proposed.
///
/// The `digest` covers `seq` and `payload` but not `view`, so that the same proposal can be re-issued in
/// a later view (see [`with_view`](Self::with_view)) without changing the digest that restrictions and
/// certificates refer to.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PrePrepareMessage {
    pub view: ViewNumber,
    pub seq: SeqNumber,
    pub payload: Vec<u8>,
    pub digest: CryptoHash,
}

impl PrePrepareMessage {
    /// Create a `PrePrepareMessage`, computing its digest.
    pub fn new(view: ViewNumber, seq: SeqNumber, payload: Vec<u8>) -> Self {
        let digest = Self::compute_digest(seq, &payload);
        Self {
            view,
            seq,
            payload,
            digest,
        }
    }

    /// Compute the digest of a proposal of `payload` for slot `seq`.
    pub fn compute_digest(seq: SeqNumber, payload: &[u8]) -> CryptoHash {
        let mut hasher = CryptoHasher::new();
        hasher.update([PRE_PREPARE_TAG]);
        hasher.update(seq.int().to_le_bytes());
        hasher.update(payload);
        CryptoHash::new(hasher.finalize().into())
    }

    /// Check whether `digest` is actually the digest of `seq` and `payload`.
    pub fn is_well_formed(&self) -> bool {
        Self::compute_digest(self.seq, &self.payload) == self.digest
    }

    /// Re-issue this proposal in `view`.
    pub fn with_view(&self, view: ViewNumber) -> Self {
        Self {
            view,
            ..self.clone()
        }
    }
}

/// Proof that a quorum of replicas prepared the proposal with `digest` for slot `seq` in `view`.
///
/// Every share of `certificate` must be over [`prepare_digest`](Self::prepare_digest).
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PreparedCertificate {
    pub view: ViewNumber,
    pub seq: SeqNumber,
    pub digest: CryptoHash,
    pub certificate: QuorumCertificate,
}

impl PreparedCertificate {
    /// Compute the digest that replicas sign when they prepare the proposal with `digest` for slot `seq`
    /// in `view`.
    pub fn prepare_digest(view: ViewNumber, seq: SeqNumber, digest: CryptoHash) -> CryptoHash {
        let mut hasher = CryptoHasher::new();
        hasher.update([PREPARE_TAG]);
        hasher.update((view, seq, digest).try_to_vec().unwrap());
        CryptoHash::new(hasher.finalize().into())
    }

    /// Create the signature share that `signer` contributes to a prepared certificate.
    pub fn sign_prepare(
        signing_key: &SigningKey,
        signer: ReplicaID,
        view: ViewNumber,
        seq: SeqNumber,
        digest: CryptoHash,
    ) -> SignatureShare {
        SignatureShare::sign(
            signing_key,
            signer,
            Self::prepare_digest(view, seq, digest),
        )
    }

    /// Check whether this certificate is about `pre_prepare`'s slot and proposal.
    pub fn matches(&self, pre_prepare: &PrePrepareMessage) -> bool {
        self.seq == pre_prepare.seq && self.digest == pre_prepare.digest
    }

    /// Check whether every share of the certificate is over the right prepare digest. This does **not**
    /// check the signatures: that is the job of a
    /// [`CertificateVerifier`](super::verifier::CertificateVerifier).
    pub fn is_over_prepare_digest(&self) -> bool {
        self.certificate
            .is_over(&Self::prepare_digest(self.view, self.seq, self.digest))
    }
}

/// What a replica knows about a single slot when it leaves a view.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum SlotEvidence {
    /// The replica holds a prepared certificate for the slot.
    Prepared(PreparedCertificate),

    /// The replica only saw a proposal with `digest` for the slot in `view`. A bare proposal never binds
    /// the slot in a new view.
    PrePrepared { view: ViewNumber, digest: CryptoHash },
}

impl SlotEvidence {
    /// Get the view the evidence originates from.
    pub fn view(&self) -> ViewNumber {
        match self {
            SlotEvidence::Prepared(certificate) => certificate.view,
            SlotEvidence::PrePrepared { view, .. } => *view,
        }
    }

    /// Get the digest of the proposal the evidence is about.
    pub fn digest(&self) -> CryptoHash {
        match self {
            SlotEvidence::Prepared(certificate) => certificate.digest,
            SlotEvidence::PrePrepared { digest, .. } => *digest,
        }
    }
}

/// The evidence a [`ViewChangeMessage`] carries for slot `seq`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ViewChangeElement {
    pub seq: SeqNumber,
    pub evidence: SlotEvidence,
}

/// A replica's summary of its progress, sent when it leaves a view, asking to move to `view`.
///
/// ## Elements
///
/// `elements` holds evidence only for slots in `(last_executed, last_stable + work_window_size]`, in
/// strictly ascending order of sequence number. Slots that are not in `elements` carry no evidence. In
/// particular, slots that the sender has already executed are never reported: they are durably agreed
/// and must not be reopened.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ViewChangeMessage {
    pub sender: ReplicaID,
    pub view: ViewNumber,
    pub last_stable: SeqNumber,
    pub last_executed: SeqNumber,
    pub elements: Vec<ViewChangeElement>,
    pub signature: SignatureBytes,
}

impl ViewChangeMessage {
    /// Create a `ViewChangeMessage` and sign it with `signing_key`.
    pub fn new(
        signing_key: &SigningKey,
        sender: ReplicaID,
        view: ViewNumber,
        last_stable: SeqNumber,
        last_executed: SeqNumber,
        elements: Vec<ViewChangeElement>,
    ) -> Self {
        let digest = Self::compute_digest(sender, view, last_stable, last_executed, &elements);
        Self {
            sender,
            view,
            last_stable,
            last_executed,
            elements,
            signature: Keypair::new(signing_key.clone()).sign(&digest.bytes()),
        }
    }

    fn compute_digest(
        sender: ReplicaID,
        view: ViewNumber,
        last_stable: SeqNumber,
        last_executed: SeqNumber,
        elements: &Vec<ViewChangeElement>,
    ) -> CryptoHash {
        let mut hasher = CryptoHasher::new();
        hasher.update([VIEW_CHANGE_TAG]);
        hasher.update(
            (sender, view, last_stable, last_executed)
                .try_to_vec()
                .unwrap(),
        );
        hasher.update(elements.try_to_vec().unwrap());
        CryptoHash::new(hasher.finalize().into())
    }

    /// Get the element for `seq`, if the message carries evidence for it.
    pub fn element(&self, seq: SeqNumber) -> Option<&ViewChangeElement> {
        self.elements
            .binary_search_by_key(&seq, |element| element.seq)
            .ok()
            .map(|pos| &self.elements[pos])
    }

    /// Get the prepared certificate for `seq`, if the message carries one.
    pub fn prepared_certificate(&self, seq: SeqNumber) -> Option<&PreparedCertificate> {
        match self.element(seq) {
            Some(ViewChangeElement {
                evidence: SlotEvidence::Prepared(certificate),
                ..
            }) => Some(certificate),
            _ => None,
        }
    }

    /// Iterate through the prepared certificates carried by the message.
    pub fn prepared_certificates(&self) -> impl Iterator<Item = &PreparedCertificate> {
        self.elements
            .iter()
            .filter_map(|element| match &element.evidence {
                SlotEvidence::Prepared(certificate) => Some(certificate),
                SlotEvidence::PrePrepared { .. } => None,
            })
    }

    /// Check the structural rules of a `ViewChangeMessage`:
    /// 1. `view` is not the initial view, which is entered without a view change.
    /// 2. `last_executed >= last_stable`.
    /// 3. Elements are in strictly ascending order of sequence number, and lie in
    ///    `(last_executed, last_stable + work_window_size]`.
    /// 4. Every piece of evidence comes from a view lower than `view`.
    /// 5. Every prepared certificate is about the slot of its element, and its shares are over the right
    ///    prepare digest.
    ///
    /// Signatures are not checked here.
    pub fn is_well_formed(&self, work_window_size: u64) -> bool {
        /* 1 */
        if self.view == ViewNumber::init() {
            return false;
        }

        /* 2 */
        if self.last_executed < self.last_stable {
            return false;
        }

        /* 3 */
        let upper_bound = match self.last_stable.checked_add(work_window_size) {
            Some(upper_bound) => upper_bound,
            None => return false,
        };
        let ascending = self
            .elements
            .windows(2)
            .all(|pair| pair[0].seq < pair[1].seq);
        let in_window = self
            .elements
            .iter()
            .all(|element| element.seq > self.last_executed && element.seq <= upper_bound);
        if !ascending || !in_window {
            return false;
        }

        self.elements.iter().all(|element| {
            /* 4 */
            element.evidence.view() < self.view
                && match &element.evidence {
                    /* 5 */
                    SlotEvidence::Prepared(certificate) => {
                        certificate.seq == element.seq && certificate.is_over_prepare_digest()
                    }
                    SlotEvidence::PrePrepared { .. } => true,
                }
        })
    }

    /// Get the signature share this message contributes to the certificate of a [`NewViewMessage`].
    pub fn signature_share(&self) -> SignatureShare {
        SignatureShare {
            signer: self.sender,
            message: self.digest(),
            signature: self.signature,
        }
    }
}

impl SignedMessage for ViewChangeMessage {
    fn sender(&self) -> ReplicaID {
        self.sender
    }

    fn digest(&self) -> CryptoHash {
        Self::compute_digest(
            self.sender,
            self.view,
            self.last_stable,
            self.last_executed,
            &self.elements,
        )
    }

    fn signature_bytes(&self) -> SignatureBytes {
        self.signature
    }
}

/// The primary's announcement that `view` can be entered, justified by the quorum of
/// `ViewChangeMessage`s whose signatures make up `certificate`.
///
/// Each share of `certificate` is the signature of one justifying `ViewChangeMessage` over its own
/// digest, so the certificate both references the justifying messages and proves that their senders
/// created them.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct NewViewMessage {
    pub sender: ReplicaID,
    pub view: ViewNumber,
    pub certificate: QuorumCertificate,
    pub signature: SignatureBytes,
}

impl NewViewMessage {
    /// Create a `NewViewMessage` and sign it with `signing_key`.
    pub fn new(
        signing_key: &SigningKey,
        sender: ReplicaID,
        view: ViewNumber,
        certificate: QuorumCertificate,
    ) -> Self {
        let digest = Self::compute_digest(sender, view, &certificate);
        Self {
            sender,
            view,
            certificate,
            signature: Keypair::new(signing_key.clone()).sign(&digest.bytes()),
        }
    }

    fn compute_digest(
        sender: ReplicaID,
        view: ViewNumber,
        certificate: &QuorumCertificate,
    ) -> CryptoHash {
        let mut hasher = CryptoHasher::new();
        hasher.update([NEW_VIEW_TAG]);
        hasher.update((sender, view).try_to_vec().unwrap());
        hasher.update(certificate.try_to_vec().unwrap());
        CryptoHash::new(hasher.finalize().into())
    }

    /// Get the digest of the `ViewChangeMessage` from `replica` that this message references, if any.
    pub fn view_change_digest_of(&self, replica: ReplicaID) -> Option<CryptoHash> {
        self.certificate.message_of(replica)
    }

    /// Get the replicas whose `ViewChangeMessage`s this message references, in ascending order.
    pub fn referenced_replicas(&self) -> Vec<ReplicaID> {
        self.certificate.signers().collect()
    }
}

impl SignedMessage for NewViewMessage {
    fn sender(&self) -> ReplicaID {
        self.sender
    }

    fn digest(&self) -> CryptoHash {
        Self::compute_digest(self.sender, self.view, &self.certificate)
    }

    fn signature_bytes(&self) -> SignatureBytes {
        self.signature
    }
}
