//! Location event types
//!
//! Shared between the services that produce corrected positions and the
//! dashboards that observe them. Every frame sent to an observer channel is a
//! serialized [`CorrectedFix`].

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A GPS fix after the learned offset has been applied
///
/// Ephemeral: produced per telemetry message, fanned out to observers and
/// handed to whoever persists it. Routing identifiers are optional because
/// `/predict` callers may omit them; such fixes only reach `all` observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrectedFix {
    /// Corrected latitude in decimal degrees
    pub latitude: f64,
    /// Corrected longitude in decimal degrees
    pub longitude: f64,
    /// IoT device that reported the raw telemetry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_device_id: Option<String>,
    /// Vehicle carrying the device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle_id: Option<String>,
    /// Fleet the vehicle belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fleet_id: Option<String>,
    /// When the correction was computed
    pub timestamp: DateTime<Utc>,
}

impl CorrectedFix {
    /// Scope keys this fix is published under
    ///
    /// Always contains [`ScopeKey::All`], followed by one key per routing
    /// identifier that is present.
    pub fn scope_keys(&self) -> Vec<ScopeKey> {
        let mut keys = Vec::with_capacity(4);
        if let Some(id) = &self.source_device_id {
            keys.push(ScopeKey::Device(id.clone()));
        }
        if let Some(id) = &self.vehicle_id {
            keys.push(ScopeKey::Vehicle(id.clone()));
        }
        if let Some(id) = &self.fleet_id {
            keys.push(ScopeKey::Fleet(id.clone()));
        }
        keys.push(ScopeKey::All);
        keys
    }
}

/// Subscription partition used for broadcast routing
///
/// Textual form: `device:<id>`, `vehicle:<id>`, `fleet:<id>` or `all`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScopeKey {
    Device(String),
    Vehicle(String),
    Fleet(String),
    All,
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeKey::Device(id) => write!(f, "device:{}", id),
            ScopeKey::Vehicle(id) => write!(f, "vehicle:{}", id),
            ScopeKey::Fleet(id) => write!(f, "fleet:{}", id),
            ScopeKey::All => f.write_str("all"),
        }
    }
}

impl FromStr for ScopeKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == "all" {
            return Ok(ScopeKey::All);
        }

        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidInput(format!("Malformed scope key: {}", s)))?;

        if id.is_empty() {
            return Err(Error::InvalidInput(format!("Scope key has empty id: {}", s)));
        }

        match kind {
            "device" => Ok(ScopeKey::Device(id.to_string())),
            "vehicle" => Ok(ScopeKey::Vehicle(id.to_string())),
            "fleet" => Ok(ScopeKey::Fleet(id.to_string())),
            other => Err(Error::InvalidInput(format!("Unknown scope kind: {}", other))),
        }
    }
}

impl Serialize for ScopeKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ScopeKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
