// Copyright (c) 2026 Warden Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! Entities, ports and pure services of the bot host: personas and feed
//! events, the per-worker inbox, the business handler seam, the upstream
//! port, the restart supervisor and the recurrence calculator.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Types and rules with no transport or runtime wiring

pub mod persona;
pub mod events;
pub mod inbox;
pub mod handler;
pub mod upstream;
pub mod schedule;
pub mod supervisor;
pub mod host_config;
