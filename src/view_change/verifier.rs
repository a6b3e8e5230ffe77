/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Quorum certificates and the interface through which the view-change subsystem verifies them.
//!
//! The view-change subsystem never inspects cryptographic material itself. It asks a
//! [`CertificateVerifier`] whether a [`QuorumCertificate`] is valid, and asks it to
//! [`combine`](CertificateVerifier::combine) signature shares into a certificate when the local replica
//! is the primary of a new view.
//!
//! [`Ed25519CertificateVerifier`] is the implementation used by default. It treats a quorum certificate
//! as a multi-signature: a list of Ed25519 signatures by distinct replicas, each over a (possibly
//! different) message digest.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    crypto_primitives::{is_signed_by, Keypair, SigningKey},
    data_types::{CryptoHash, ReplicaID, SignatureBytes},
    replica_set::{QuorumKind, ReplicaSet},
};

/// A signature by `signer` over the bytes of `message`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SignatureShare {
    pub signer: ReplicaID,
    pub message: CryptoHash,
    pub signature: SignatureBytes,
}

impl SignatureShare {
    /// Create a `SignatureShare` by signing `message` with the signing key of `signer`.
    pub fn sign(signing_key: &SigningKey, signer: ReplicaID, message: CryptoHash) -> Self {
        Self {
            signer,
            message,
            signature: Keypair::new(signing_key.clone()).sign(&message.bytes()),
        }
    }
}

/// Evidence that a quorum of replicas signed particular messages.
///
/// ## Ordering of shares
///
/// Certificates produced by [`CertificateVerifier::combine`] keep their shares in strictly ascending order
/// of signer. [`Ed25519CertificateVerifier::validate`] rejects certificates that do not.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct QuorumCertificate {
    shares: Vec<SignatureShare>,
}

impl QuorumCertificate {
    /// Create a `QuorumCertificate` from `shares` as-is. Prefer [`CertificateVerifier::combine`], which
    /// sorts and filters the shares.
    pub fn from_shares(shares: Vec<SignatureShare>) -> Self {
        Self { shares }
    }

    /// Get the shares of this certificate.
    pub fn shares(&self) -> &[SignatureShare] {
        &self.shares
    }

    /// Iterate through the replicas that signed this certificate.
    pub fn signers(&self) -> impl Iterator<Item = ReplicaID> + '_ {
        self.shares.iter().map(|share| share.signer)
    }

    /// Get the message `signer` signed in this certificate, if it signed any.
    pub fn message_of(&self, signer: ReplicaID) -> Option<CryptoHash> {
        self.shares
            .iter()
            .find(|share| share.signer == signer)
            .map(|share| share.message)
    }

    /// Check whether every share in this certificate is over `message`.
    pub fn is_over(&self, message: &CryptoHash) -> bool {
        self.shares.iter().all(|share| share.message == *message)
    }

    /// Get the number of shares in this certificate.
    pub fn len(&self) -> usize {
        self.shares.len()
    }

    /// Check whether this certificate has no shares.
    pub fn is_empty(&self) -> bool {
        self.shares.is_empty()
    }
}

/// Validates and combines quorum certificates.
///
/// Implementations are called synchronously from the thread that drives the
/// [`ViewsManager`](super::implementation::ViewsManager). An implementation may offload signature
/// arithmetic to a worker pool, but must present a synchronous result.
pub trait CertificateVerifier {
    /// Check whether `certificate` carries valid signatures from a [strong quorum](QuorumKind::Strong)
    /// of distinct replicas.
    fn validate(&self, certificate: &QuorumCertificate) -> bool;

    /// Combine `shares` into a certificate, returning `None` if the valid shares among them do not come
    /// from a strong quorum of distinct replicas.
    fn combine(&self, shares: Vec<SignatureShare>) -> Option<QuorumCertificate>;
}

/// [`CertificateVerifier`] that checks Ed25519 signatures against the verifying keys of a
/// [`ReplicaSet`].
#[derive(Clone)]
pub struct Ed25519CertificateVerifier {
    replica_set: ReplicaSet,
}

impl Ed25519CertificateVerifier {
    /// Create a verifier for certificates signed by replicas in `replica_set`.
    pub fn new(replica_set: ReplicaSet) -> Self {
        Self { replica_set }
    }

    fn is_correct_share(&self, share: &SignatureShare) -> bool {
        match self.replica_set.verifying_key(share.signer) {
            Some(verifying_key) => {
                is_signed_by(verifying_key, &share.message.bytes(), &share.signature)
            }
            None => false,
        }
    }
}

impl CertificateVerifier for Ed25519CertificateVerifier {
    fn validate(&self, certificate: &QuorumCertificate) -> bool {
        // Check that signers are distinct and in ascending order.
        let ascending = certificate
            .shares
            .windows(2)
            .all(|pair| pair[0].signer < pair[1].signer);
        if !ascending {
            return false;
        }

        if certificate.len() < self.replica_set.quorum_size(QuorumKind::Strong) {
            return false;
        }

        certificate
            .shares
            .iter()
            .all(|share| self.is_correct_share(share))
    }

    fn combine(&self, mut shares: Vec<SignatureShare>) -> Option<QuorumCertificate> {
        shares.retain(|share| self.is_correct_share(share));
        shares.sort_by_key(|share| share.signer);
        shares.dedup_by_key(|share| share.signer);

        if shares.len() < self.replica_set.quorum_size(QuorumKind::Strong) {
            return None;
        }

        Some(QuorumCertificate { shares })
    }
}
