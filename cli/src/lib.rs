// Copyright (c) 2026 Warden Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Warden CLI library - exposes testable components
//!
//! # Architecture
//!
//! - **Layer:** Interface / Presentation Layer
//! - **Purpose:** Command implementations and the reference bot used by `warden run`

pub mod bot;
pub mod commands;
