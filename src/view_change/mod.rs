//! Subprotocol for replacing the primary of a view without losing agreed proposals.
//!
//! # Views and primaries
//!
//! Replicas order client requests into numbered slots ("sequence numbers") under the direction of a
//! primary. Time is divided into views, and the primary of view `v` is replica `v mod N`. When enough
//! replicas suspect the primary of the active view, they move to the next view, whose primary is a
//! different replica.
//!
//! Moving to a new view must not undo agreement: a proposal that may have been committed in an earlier
//! view must be proposed again, unchanged, in the new view. This module decides which proposals these
//! are.
//!
//! ## Leaving a view
//!
//! A replica that leaves its active view calls
//! [`exit_from_current_view`](implementation::ViewsManager::exit_from_current_view), which creates its
//! [`ViewChangeMessage`](messages::ViewChangeMessage) for the next view. The message summarizes the
//! replica's progress: its stable checkpoint, the last slot it executed, and for every slot in its work
//! window the strongest evidence it holds:
//! - a [`PreparedCertificate`](messages::PreparedCertificate), if a quorum prepared a proposal for the
//!   slot, or
//! - the digest of the proposal it saw for the slot, otherwise.
//!
//! ## Entering a view
//!
//! The primary of the new view waits for view-change messages from a strong quorum (`2F + C + 1`
//! replicas), then creates a [`NewViewMessage`](messages::NewViewMessage) whose certificate combines
//! the signatures of exactly those messages. Every other replica uses the quorum that the
//! `NewViewMessage` references, so all correct replicas compute the same
//! [restrictions](safety::Restrictions) from the same input.
//!
//! The [safety logic](safety) binds each slot to the proposal of the highest-view prepared certificate
//! reported for it. Once the content of every bound slot is known locally, the replica enters the view
//! and the bound proposals are re-issued in it. Content that is missing is fetched from other replicas
//! and passed to
//! [`add_potentially_missing_pre_prepare`](implementation::ViewsManager::add_potentially_missing_pre_prepare).
//!
//! ## Sliding window
//!
//! Only slots in `[B + 1, B + W]` are restricted, where `B` is the highest stable checkpoint reported by
//! the quorum and `W` is the [work window size](crate::config::Configuration::work_window_size). A
//! replica whose own stable checkpoint is below `B` must catch up through state transfer before it can
//! enter the view.

pub mod implementation;

pub mod messages;

pub mod safety;

pub mod types;

pub mod verifier;
