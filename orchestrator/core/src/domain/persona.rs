// Copyright (c) 2026 Warden Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Persona Aggregate
//!
//! A persona is one tenant-facing bot identity. Every running worker is bound
//! to exactly one persona and holds an immutable [`PersonaConfig`] snapshot,
//! replaced wholesale whenever the upstream reports an UPDATE.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Unique identifier for a persona as assigned by the upstream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersonaId(pub String);

impl PersonaId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PersonaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Snapshot of a persona as delivered by the upstream feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaConfig {
    pub persona_id: PersonaId,

    /// User that owns the persona
    #[serde(default, rename = "owner_fuser_id")]
    pub owner_user_id: String,

    /// Group the persona is installed into
    #[serde(default, rename = "located_fgroup_id")]
    pub group_id: String,

    #[serde(default)]
    pub persona_name: String,

    #[serde(default)]
    pub persona_marketable_name: String,

    #[serde(default)]
    pub persona_marketable_version: u32,

    /// Free-form settings. A change here restarts the worker.
    #[serde(default, rename = "persona_setup")]
    pub settings: Map<String, Value>,

    /// Remaining fields the core does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PersonaConfig {
    /// Build a minimal persona; mostly useful for tests and dry runs.
    pub fn new(persona_id: impl Into<String>, settings: Map<String, Value>) -> Self {
        Self {
            persona_id: PersonaId::new(persona_id),
            owner_user_id: String::new(),
            group_id: String::new(),
            persona_name: String::new(),
            persona_marketable_name: String::new(),
            persona_marketable_version: 0,
            settings,
            extra: Map::new(),
        }
    }

    /// Whether replacing `self` by `other` requires a worker restart.
    pub fn settings_differ(&self, other: &PersonaConfig) -> bool {
        self.settings != other.settings
    }

    /// Look up a single setting.
    pub fn setting(&self, key: &str) -> Option<&Value> {
        self.settings.get(key)
    }
}
