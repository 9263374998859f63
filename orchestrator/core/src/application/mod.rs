// Copyright (c) 2026 Warden Contributors
// SPDX-License-Identifier: AGPL-3.0

pub mod registry;
pub mod event_router;
pub mod worker;
pub mod heartbeat;
pub mod host;

// Re-export the host-facing surface for convenience
pub use event_router::{EventRouter, RouterError, RouterSettings, RouterStatus, WorkerStatus};
pub use host::BotHost;
pub use worker::{DrainReport, WorkerLauncher, WorkerLoop, WorkerSettings};
