//! Core data models shared by the update and matching pipelines.
//!
//! These types represent the vulnerabilities produced by updaters, the
//! update operations that tag each ingested generation, and the installed
//! package records that are correlated against them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque snapshot of upstream feed state (an ETag or equivalent).
///
/// Owned by the updater. The controller only stores it and hands the most
/// recent value back on the next fetch. The empty fingerprint means the
/// updater has never run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Fingerprint {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Fingerprint {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// One ingestion run for one updater.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateOperation {
    pub id: Uuid,
    pub updater: String,
    pub fingerprint: Fingerprint,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Package {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub kind: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Distribution {
    #[serde(default)]
    pub did: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub version_code_name: String,
    #[serde(default)]
    pub version_id: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub cpe: String,
    #[serde(default)]
    pub pretty_name: String,
}

impl Distribution {
    pub fn is_empty(&self) -> bool {
        *self == Distribution::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Repository {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub uri: String,
}

impl Repository {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Repository::default()
    }
}

/// Severity bucket shared across feeds.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum NormalizedSeverity {
    #[default]
    Unknown,
    Negligible,
    Low,
    Medium,
    High,
    Critical,
}

impl NormalizedSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::Negligible => "Negligible",
            Self::Low => "Low",
            Self::Medium => "Medium",
            Self::High => "High",
            Self::Critical => "Critical",
        }
    }

    /// Maps a feed severity label onto a bucket. Unrecognized labels are `Unknown`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "negligible" => Self::Negligible,
            "low" => Self::Low,
            "medium" | "moderate" => Self::Medium,
            "high" | "important" => Self::High,
            "critical" => Self::Critical,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for NormalizedSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical vulnerability record.
///
/// Created by an updater's parse step and owned by the store afterwards.
/// Stored rows are never edited: a correction arrives as a new row tagged
/// with a newer update operation. `id` is assigned by the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vulnerability {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub updater: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub links: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub normalized_severity: NormalizedSeverity,
    #[serde(default)]
    pub fixed_in_version: String,
    #[serde(default)]
    pub package: Option<Package>,
    #[serde(default)]
    pub dist: Option<Distribution>,
    #[serde(default)]
    pub repo: Option<Repository>,
}

/// An installed package plus its distribution and repository context.
///
/// `package.id` is the record identity used to key correlation results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub package: Package,
    #[serde(default)]
    pub distribution: Option<Distribution>,
    #[serde(default)]
    pub repository: Option<Repository>,
}

impl IndexRecord {
    pub fn id(&self) -> &str {
        &self.package.id
    }

    pub fn repository_name(&self) -> &str {
        self.repository
            .as_ref()
            .map(|r| r.name.as_str())
            .unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_labels() {
        assert_eq!(NormalizedSeverity::from_label("HIGH"), NormalizedSeverity::High);
        assert_eq!(
            NormalizedSeverity::from_label("moderate"),
            NormalizedSeverity::Medium
        );
        assert_eq!(NormalizedSeverity::from_label("?"), NormalizedSeverity::Unknown);
        assert!(NormalizedSeverity::Critical > NormalizedSeverity::Low);
    }

    #[test]
    fn test_record_deserializes_with_defaults() {
        let record: IndexRecord = serde_json::from_str(
            r#"{"package":{"id":"1","name":"foo","version":"1.5"},"repository":{"name":"pypi"}}"#,
        )
        .unwrap();
        assert_eq!(record.id(), "1");
        assert_eq!(record.repository_name(), "pypi");
        assert!(record.distribution.is_none());
    }

    #[test]
    fn test_fingerprint_default_is_empty() {
        assert!(Fingerprint::default().is_empty());
        assert_eq!(Fingerprint::from("v1").to_string(), "v1");
    }
}
