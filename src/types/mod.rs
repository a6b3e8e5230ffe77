//! Types and traits that are used across multiple components of the view-change subsystem.
//!
//! Types specific to the view-change protocol itself, like its messages and restrictions, can be found
//! in the submodules of [`crate::view_change`].

pub mod crypto_primitives;

pub mod data_types;

pub mod replica_set;

pub(crate) mod signed_messages;
