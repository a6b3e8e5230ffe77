/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The decision procedure that guarantees the safety of a view change.
//!
//! Given a quorum of [`ViewChangeMessage`]s for the same target view, [`compute_restrictions`] decides,
//! for every slot in the work window above the quorum's stable checkpoint, whether a previously prepared
//! proposal must be carried forward into the new view ([`Restriction::Bound`]), or whether the slot is
//! free for a new proposal ([`Restriction::Free`]).
//!
//! ## Highest certificate rule
//!
//! For each slot, the prepared certificates reported by the quorum are collected, and the certificate
//! with the **highest originating view** binds the slot.
//!
//! If a proposal was committed at a slot, then a strong quorum prepared it, so at least `F + C + 1`
//! correct replicas hold a prepared certificate for it. Any strong quorum of view-change messages
//! includes at least one of them, so the committed proposal is always reported. A certificate for a
//! different proposal at that slot can only be formed in a higher view if the primary of that view was
//! not bound to the committed proposal, which this rule rules out inductively. Hence the certificate with
//! the highest view always names the committed proposal, if there is one.
//!
//! ## Stable lower bound
//!
//! The window starts above the highest stable checkpoint that at least `F + 1` members of the quorum
//! report, so at least one correct replica vouches for it. A single faulty member reporting an
//! arbitrarily high `last_stable` cannot move the window away from the checkpoints the correct replicas
//! actually hold.
//!
//! Two certificates for the same slot and the same view can only name different proposals if two strong
//! quorums prepared different proposals in the same view, which requires more than `F` faulty replicas.
//! Such input is reported as [`SafetyLogicError::ConflictingCertificates`] instead of being resolved by
//! an arbitrary tie-break.
//!
//! ## Purity
//!
//! The functions in this module hold no state and perform no I/O: applying them twice to the same
//! input yields the same output.

use crate::types::data_types::{CryptoHash, ReplicaID, SeqNumber, ViewNumber};

use super::messages::{PreparedCertificate, ViewChangeMessage};

/// The binding decision for one slot in a new view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Restriction {
    /// Only a proposal with `digest` may be accepted for the slot. `certified_in` is the view of the
    /// prepared certificate that produced the binding.
    Bound {
        digest: CryptoHash,
        certified_in: ViewNumber,
    },

    /// Any proposal may be accepted for the slot.
    Free,
}

impl Restriction {
    pub fn is_bound(&self) -> bool {
        matches!(self, Restriction::Bound { .. })
    }

    /// Get the digest the slot is bound to, if it is bound.
    pub fn digest(&self) -> Option<CryptoHash> {
        match self {
            Restriction::Bound { digest, .. } => Some(*digest),
            Restriction::Free => None,
        }
    }
}

/// One [`Restriction`] per slot in `[stable_lower_bound + 1, stable_lower_bound + work_window_size]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Restrictions {
    stable_lower_bound: SeqNumber,
    slots: Vec<Restriction>,
}

impl Restrictions {
    #[cfg(test)]
    pub(crate) fn from_slots(stable_lower_bound: SeqNumber, slots: Vec<Restriction>) -> Self {
        Self {
            stable_lower_bound,
            slots,
        }
    }

    /// Get the stable checkpoint below which no slot is restricted.
    pub fn stable_lower_bound(&self) -> SeqNumber {
        self.stable_lower_bound
    }

    /// Get the highest slot of the window.
    pub fn upper_bound(&self) -> SeqNumber {
        self.stable_lower_bound + self.slots.len() as u64
    }

    /// Get the restriction of `seq`, or `None` if `seq` is outside the window.
    pub fn get(&self, seq: SeqNumber) -> Option<&Restriction> {
        if seq <= self.stable_lower_bound {
            return None;
        }
        self.slots.get((seq - self.stable_lower_bound - 1) as usize)
    }

    /// Iterate through every slot of the window and its restriction, in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (SeqNumber, &Restriction)> {
        let first = self.stable_lower_bound + 1;
        self.slots
            .iter()
            .enumerate()
            .map(move |(offset, restriction)| (first + offset as u64, restriction))
    }

    /// Iterate through the bound slots of the window, in ascending order.
    pub fn bound_slots(&self) -> impl Iterator<Item = (SeqNumber, CryptoHash)> + '_ {
        self.iter()
            .filter_map(|(seq, restriction)| restriction.digest().map(|digest| (seq, digest)))
    }

    /// Get the lowest and the highest bound slots, or `None` if every slot is free.
    pub fn bound_range(&self) -> Option<(SeqNumber, SeqNumber)> {
        let mut bound = self.bound_slots().map(|(seq, _)| seq);
        let min = bound.next()?;
        let max = bound.last().unwrap_or(min);
        Some((min, max))
    }
}

/// Compute the stable checkpoint that the restrictions of a new view are computed above: the
/// `(fault_bound + 1)`-th highest `last_stable` reported in `quorum`, or the lowest one if `quorum` has
/// no more than `fault_bound` members.
pub fn stable_lower_bound<'a>(
    quorum: impl IntoIterator<Item = &'a ViewChangeMessage>,
    fault_bound: u16,
) -> SeqNumber {
    let mut last_stables: Vec<SeqNumber> = quorum
        .into_iter()
        .map(|view_change| view_change.last_stable)
        .collect();
    last_stables.sort_by(|a, b| b.cmp(a));
    last_stables
        .get(fault_bound as usize)
        .or(last_stables.last())
        .copied()
        .unwrap_or(SeqNumber::new(0))
}

/// Compute the restrictions that a quorum of view-change messages imposes on the new view.
///
/// ## Preconditions
///
/// The caller checks that `quorum` is a strong quorum of [well-formed](ViewChangeMessage::is_well_formed)
/// messages whose signatures and certificates are valid. This function only checks the preconditions
/// that concern the set as a whole:
/// 1. `quorum` is not empty.
/// 2. Every message targets the same view.
/// 3. No two messages come from the same sender.
pub fn compute_restrictions(
    quorum: &[&ViewChangeMessage],
    fault_bound: u16,
    work_window_size: u64,
) -> Result<Restrictions, SafetyLogicError> {
    /* 1 */
    let target_view = match quorum.first() {
        Some(view_change) => view_change.view,
        None => return Err(SafetyLogicError::EmptyQuorum),
    };

    /* 2 */
    if let Some(other) = quorum.iter().find(|view_change| view_change.view != target_view) {
        return Err(SafetyLogicError::MixedTargetViews {
            expected: target_view,
            found: other.view,
        });
    }

    /* 3 */
    let mut senders: Vec<ReplicaID> = quorum.iter().map(|view_change| view_change.sender).collect();
    senders.sort();
    if let Some(pair) = senders.windows(2).find(|pair| pair[0] == pair[1]) {
        return Err(SafetyLogicError::DuplicateSender { sender: pair[0] });
    }

    let lower_bound = stable_lower_bound(quorum.iter().copied(), fault_bound);
    if lower_bound.checked_add(work_window_size).is_none() {
        return Err(SafetyLogicError::WindowOutOfRange {
            stable_lower_bound: lower_bound,
        });
    }
    let slots = (1..=work_window_size)
        .map(|offset| restriction_of_slot(quorum, lower_bound + offset))
        .collect::<Result<Vec<Restriction>, SafetyLogicError>>()?;

    Ok(Restrictions {
        stable_lower_bound: lower_bound,
        slots,
    })
}

/// Apply the [highest certificate rule](self#highest-certificate-rule) to `seq`.
fn restriction_of_slot(
    quorum: &[&ViewChangeMessage],
    seq: SeqNumber,
) -> Result<Restriction, SafetyLogicError> {
    let mut highest: Option<&PreparedCertificate> = None;

    for certificate in quorum
        .iter()
        .filter_map(|view_change| view_change.prepared_certificate(seq))
    {
        match highest {
            Some(current) if certificate.view < current.view => {}
            Some(current) if certificate.view == current.view => {
                if certificate.digest != current.digest {
                    return Err(SafetyLogicError::ConflictingCertificates {
                        seq,
                        view: certificate.view,
                    });
                }
            }
            _ => highest = Some(certificate),
        }
    }

    Ok(match highest {
        Some(certificate) => Restriction::Bound {
            digest: certificate.digest,
            certified_in: certificate.view,
        },
        None => Restriction::Free,
    })
}

/// Enumerates the ways [`compute_restrictions`] can reject its input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyLogicError {
    /// No view-change messages were passed.
    EmptyQuorum,

    /// The messages do not all target the same view.
    MixedTargetViews {
        expected: ViewNumber,
        found: ViewNumber,
    },

    /// Two messages come from the same sender.
    DuplicateSender { sender: ReplicaID },

    /// Two prepared certificates from the same view name different proposals for `seq`. This can only
    /// happen if more than `F` replicas are faulty.
    ConflictingCertificates { seq: SeqNumber, view: ViewNumber },

    /// The window above `stable_lower_bound` extends past the highest representable sequence number.
    WindowOutOfRange { stable_lower_bound: SeqNumber },
}
