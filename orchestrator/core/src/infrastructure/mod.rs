// Copyright (c) 2026 Warden Contributors
// SPDX-License-Identifier: AGPL-3.0

pub mod envelope_mapper;
pub mod upstream_http;
pub mod in_memory_upstream;

pub use envelope_mapper::EnvelopeMapper;
pub use in_memory_upstream::{FeedSender, InMemoryUpstream, PostedResult};
pub use upstream_http::HttpUpstreamClient;
