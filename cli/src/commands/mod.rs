// Copyright (c) 2026 Warden Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for Warden CLI

pub mod config;
pub mod run;
pub mod schedule;

pub use self::config::ConfigCommand;
pub use self::run::RunCommand;
pub use self::schedule::ScheduleCommand;
