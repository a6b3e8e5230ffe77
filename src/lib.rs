/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The view-change subsystem of a Byzantine fault tolerant replicated state machine with
//! `N = 3F + 2C + 1` replicas, of which up to `F` may be Byzantine.
//!
//! The subsystem is made of two parts:
//! 1. The [`ViewsManager`](view_change::implementation::ViewsManager), a stateful coordinator that
//!    collects view-change evidence from every replica, decides when a new view may be entered, and
//!    tracks the proposal content that has to be carried into it.
//! 2. The [safety logic](view_change::safety), a pure function from a quorum of view-change messages to
//!    the restrictions of the new view.
//!
//! Transport, request execution, checkpointing, and the timers that decide when to suspect a primary
//! are left to the caller.

pub mod config;

pub mod event_bus;

pub mod events;

pub mod logging;

pub mod types;

pub mod view_change;
