// Copyright (c) 2026 Warden Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Warden orchestrator core
//!
//! Event-dispatch and worker-supervision engine for a bot host: one upstream
//! subscription feed is demultiplexed into per-persona worker inboxes, each
//! worker is kept alive by a restart supervisor, and periodic work is
//! scheduled by a declarative recurrence calculator.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Library behind the `warden` binary

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
