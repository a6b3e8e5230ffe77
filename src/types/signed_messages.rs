/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Trait implemented by messages that carry the signature of the replica that created them.

use super::{
    crypto_primitives::{is_signed_by, VerifyingKey},
    data_types::{CryptoHash, ReplicaID, SignatureBytes},
};

/// Data types that contain: 1. A message, and 2. A digital signature over said message whose
/// correctness can be verified against a `VerifyingKey`.
pub(crate) trait SignedMessage: Clone {
    /// Get the replica that created and signed the `SignedMessage`.
    fn sender(&self) -> ReplicaID;

    /// Get the digest of the contents of the `SignedMessage`. The signature is computed over the bytes of
    /// this digest.
    fn digest(&self) -> CryptoHash;

    /// Get the signature of the `SignedMessage`.
    fn signature_bytes(&self) -> SignatureBytes;

    /// Verify that `signature_bytes` is a signature created by `verifying_key` over the bytes of `digest`.
    fn is_correct(&self, verifying_key: &VerifyingKey) -> bool {
        is_signed_by(
            verifying_key,
            &self.digest().bytes(),
            &self.signature_bytes(),
        )
    }
}
