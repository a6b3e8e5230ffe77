/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! User-defined parameters of a [`ViewsManager`](crate::view_change::implementation::ViewsManager).

use ed25519_dalek::SigningKey;
use typed_builder::TypedBuilder;

/// The default number of sequence numbers that may be in flight above the stable checkpoint.
pub const DEFAULT_WORK_WINDOW_SIZE: u64 = 300;

/// Stores the user-defined parameters required to start a `ViewsManager`, that is:
/// 1. The replica's [keypair](ed25519_dalek::SigningKey), used to sign view-change and new-view messages.
/// 2. The work window size: how many sequence numbers above the stable checkpoint may be in flight.
/// 3. The "Log Events" flag: if set to `true`, events are logged.
///
/// ## Work window size
///
/// Every replica of a cluster must use the same work window size. A view-change message from a replica
/// that uses a larger window may be rejected as malformed.
///
/// ## Log Events
///
/// This crate logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
/// printed onto a terminal or to a file, set up a [logging
/// implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
#[derive(TypedBuilder, Clone)]
#[builder(builder_method(doc = "
    Create a builder for building a [Configuration]. On the builder call the following methods to construct a valid [Configuration].

    Required:
    - `.me(...)`

    Optional:
    - `.work_window_size(...)`
    - `.log_events(...)`
"))]
pub struct Configuration {
    #[builder(setter(doc = "Set the replica's keypair, used to sign messages. Required."))]
    pub me: SigningKey,
    #[builder(
        default = DEFAULT_WORK_WINDOW_SIZE,
        setter(doc = "Set the number of sequence numbers that may be in flight above the stable checkpoint. Optional, defaults to 300.")
    )]
    pub work_window_size: u64,
    #[builder(
        default = false,
        setter(doc = "Enable logging? Optional, defaults to false.")
    )]
    pub log_events: bool,
}
