//! Per-ecosystem matching: the [`Matcher`] trait and its registry.
//!
//! A matcher encapsulates everything the engine needs to know about one
//! ecosystem without the engine understanding its version syntax:
//!
//! - [`filter`](Matcher::filter) is a cheap applicability check run before
//!   any version parsing.
//! - [`query`](Matcher::query) declares which optional dimensions the
//!   batched store lookup should bind.
//! - [`vulnerable`](Matcher::vulnerable) is the authoritative decision.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │             MatcherRegistry              │
//! │  ┌─────────┐ ┌─────────┐ ┌────────────┐  │
//! │  │  maven  │ │ python  │ │     go     │  │
//! │  └─────────┘ └─────────┘ └────────────┘  │
//! └──────────────┬───────────────────────────┘
//!                ▼
//!        MatchEngine::match_records()
//! ```
//!
//! The registry is an explicit value built by the hosting process and
//! handed to the engine. Names are unique; a duplicate is reported when
//! the registry is built.

mod golang;
mod maven;
mod python;

pub use golang::GoMatcher;
pub use maven::MavenMatcher;
pub use python::PythonMatcher;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

use crate::models::{IndexRecord, Vulnerability};

/// Names of the built-in matchers, in registration order of
/// [`MatcherRegistry::with_defaults`].
pub const BUILTIN_MATCHERS: &[&str] = &["maven", "python", "go"];

/// Optional query dimensions a matcher can ask the store to bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MatchConstraint {
    DistributionDid,
    DistributionName,
    DistributionVersion,
    DistributionVersionCodeName,
    DistributionVersionId,
    DistributionArch,
    DistributionCpe,
    DistributionPrettyName,
    RepositoryName,
    RepositoryKey,
    RepositoryUri,
}

impl MatchConstraint {
    /// The value this constraint binds for an installed record.
    pub fn record_value<'a>(&self, record: &'a IndexRecord) -> &'a str {
        let dist = record.distribution.as_ref();
        let repo = record.repository.as_ref();
        let value = match self {
            Self::DistributionDid => dist.map(|d| d.did.as_str()),
            Self::DistributionName => dist.map(|d| d.name.as_str()),
            Self::DistributionVersion => dist.map(|d| d.version.as_str()),
            Self::DistributionVersionCodeName => dist.map(|d| d.version_code_name.as_str()),
            Self::DistributionVersionId => dist.map(|d| d.version_id.as_str()),
            Self::DistributionArch => dist.map(|d| d.arch.as_str()),
            Self::DistributionCpe => dist.map(|d| d.cpe.as_str()),
            Self::DistributionPrettyName => dist.map(|d| d.pretty_name.as_str()),
            Self::RepositoryName => repo.map(|r| r.name.as_str()),
            Self::RepositoryKey => repo.map(|r| r.key.as_str()),
            Self::RepositoryUri => repo.map(|r| r.uri.as_str()),
        };
        value.unwrap_or("")
    }

    /// The value of the same dimension on a stored vulnerability.
    pub fn vulnerability_value<'a>(&self, vuln: &'a Vulnerability) -> &'a str {
        let dist = vuln.dist.as_ref();
        let repo = vuln.repo.as_ref();
        let value = match self {
            Self::DistributionDid => dist.map(|d| d.did.as_str()),
            Self::DistributionName => dist.map(|d| d.name.as_str()),
            Self::DistributionVersion => dist.map(|d| d.version.as_str()),
            Self::DistributionVersionCodeName => dist.map(|d| d.version_code_name.as_str()),
            Self::DistributionVersionId => dist.map(|d| d.version_id.as_str()),
            Self::DistributionArch => dist.map(|d| d.arch.as_str()),
            Self::DistributionCpe => dist.map(|d| d.cpe.as_str()),
            Self::DistributionPrettyName => dist.map(|d| d.pretty_name.as_str()),
            Self::RepositoryName => repo.map(|r| r.name.as_str()),
            Self::RepositoryKey => repo.map(|r| r.key.as_str()),
            Self::RepositoryUri => repo.map(|r| r.uri.as_str()),
        };
        value.unwrap_or("")
    }
}

/// Decides whether installed packages of one ecosystem are affected.
///
/// # Example
///
/// ```rust
/// use anyhow::Result;
/// use async_trait::async_trait;
/// use vulnsync_core::matcher::{MatchConstraint, Matcher};
/// use vulnsync_core::models::{IndexRecord, Vulnerability};
///
/// pub struct NpmMatcher;
///
/// #[async_trait]
/// impl Matcher for NpmMatcher {
///     fn name(&self) -> &str { "npm" }
///
///     fn filter(&self, record: &IndexRecord) -> bool {
///         record.repository_name() == "npm"
///     }
///
///     fn query(&self) -> Vec<MatchConstraint> {
///         vec![MatchConstraint::RepositoryName]
///     }
///
///     async fn vulnerable(&self, _record: &IndexRecord, vuln: &Vulnerability) -> Result<bool> {
///         Ok(vuln.package.is_some())
///     }
/// }
/// ```
#[async_trait]
pub trait Matcher: Send + Sync {
    /// Unique name used for registry lookup and logging.
    fn name(&self) -> &str;

    /// Cheap pre-check. `false` excludes the record from this matcher.
    fn filter(&self, record: &IndexRecord) -> bool;

    /// Dimensions the correlation query should bind for this matcher.
    ///
    /// Empty means "package identity alone". This is a narrowing hint; the
    /// final answer always comes from [`vulnerable`](Matcher::vulnerable).
    fn query(&self) -> Vec<MatchConstraint>;

    /// Whether `record` is affected by `vuln`.
    ///
    /// Must return `Ok(false)` when the vulnerability has no package, and
    /// when either version cannot be parsed.
    async fn vulnerable(&self, record: &IndexRecord, vuln: &Vulnerability) -> Result<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("duplicate registration for '{0}'")]
    Duplicate(String),
    #[error("unknown matcher '{0}'. Available: {available}", available = BUILTIN_MATCHERS.join(", "))]
    Unknown(String),
}

/// Explicit, name-keyed set of matchers.
///
/// Iteration is ordered by name, so the order in which matchers were
/// registered never changes results.
#[derive(Default)]
pub struct MatcherRegistry {
    matchers: BTreeMap<String, Box<dyn Matcher>>,
}

impl MatcherRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a list of matchers, rejecting duplicates.
    pub fn from_matchers(
        matchers: impl IntoIterator<Item = Box<dyn Matcher>>,
    ) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for matcher in matchers {
            registry.register(matcher)?;
        }
        Ok(registry)
    }

    /// Registry with every built-in matcher.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for name in BUILTIN_MATCHERS {
            if let Some(matcher) = builtin(name) {
                registry.matchers.insert(name.to_string(), matcher);
            }
        }
        registry
    }

    /// Registry with the named built-in matchers (e.g. from config).
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, RegistryError> {
        let mut matchers = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            matchers.push(builtin(name).ok_or_else(|| RegistryError::Unknown(name.to_string()))?);
        }
        Self::from_matchers(matchers)
    }

    /// Register a matcher. Fails if the name is taken.
    pub fn register(&mut self, matcher: Box<dyn Matcher>) -> Result<(), RegistryError> {
        let name = matcher.name().to_string();
        if self.matchers.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        self.matchers.insert(name, matcher);
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<&dyn Matcher> {
        self.matchers.get(name).map(|m| m.as_ref())
    }

    /// All matchers, ordered by name.
    pub fn matchers(&self) -> impl Iterator<Item = &dyn Matcher> {
        self.matchers.values().map(|m| m.as_ref())
    }

    pub fn names(&self) -> Vec<&str> {
        self.matchers.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.matchers.len()
    }
}

impl fmt::Debug for MatcherRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatcherRegistry")
            .field("matchers", &self.names())
            .finish()
    }
}

/// Union of the constraints requested by `matchers`.
pub fn union_constraints<'a>(
    matchers: impl IntoIterator<Item = &'a dyn Matcher>,
) -> BTreeSet<MatchConstraint> {
    matchers.into_iter().flat_map(|m| m.query()).collect()
}

fn builtin(name: &str) -> Option<Box<dyn Matcher>> {
    match name {
        "maven" => Some(Box::new(MavenMatcher)),
        "python" => Some(Box::new(PythonMatcher)),
        "go" => Some(Box::new(GoMatcher)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Distribution, Package, Repository};

    struct Fixed(&'static str, Vec<MatchConstraint>);

    #[async_trait]
    impl Matcher for Fixed {
        fn name(&self) -> &str {
            self.0
        }

        fn filter(&self, _record: &IndexRecord) -> bool {
            true
        }

        fn query(&self) -> Vec<MatchConstraint> {
            self.1.clone()
        }

        async fn vulnerable(&self, _record: &IndexRecord, _vuln: &Vulnerability) -> Result<bool> {
            Ok(true)
        }
    }

    #[test]
    fn test_defaults_registered() {
        let registry = MatcherRegistry::with_defaults();
        assert_eq!(registry.names(), vec!["go", "maven", "python"]);
        assert!(registry.find("maven").is_some());
    }

    #[test]
    fn test_duplicate_is_rejected() {
        let err = MatcherRegistry::from_matchers(vec![
            Box::new(Fixed("a", vec![])) as Box<dyn Matcher>,
            Box::new(Fixed("a", vec![])),
        ])
        .unwrap_err();
        assert_eq!(err, RegistryError::Duplicate("a".to_string()));
    }

    #[test]
    fn test_registration_order_does_not_matter() {
        let forward = MatcherRegistry::from_matchers(vec![
            Box::new(Fixed("b", vec![])) as Box<dyn Matcher>,
            Box::new(Fixed("a", vec![])),
        ])
        .unwrap();
        let reverse = MatcherRegistry::from_matchers(vec![
            Box::new(Fixed("a", vec![])) as Box<dyn Matcher>,
            Box::new(Fixed("b", vec![])),
        ])
        .unwrap();
        assert_eq!(forward.names(), reverse.names());
    }

    #[test]
    fn test_from_names() {
        let registry = MatcherRegistry::from_names(&["python"]).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(
            MatcherRegistry::from_names(&["cobol"]).unwrap_err(),
            RegistryError::Unknown("cobol".to_string())
        );
        assert!(matches!(
            MatcherRegistry::from_names(&["go", "go"]),
            Err(RegistryError::Duplicate(_))
        ));
    }

    #[test]
    fn test_union_constraints() {
        let registry = MatcherRegistry::from_matchers(vec![
            Box::new(Fixed("a", vec![MatchConstraint::RepositoryName])) as Box<dyn Matcher>,
            Box::new(Fixed(
                "b",
                vec![
                    MatchConstraint::RepositoryName,
                    MatchConstraint::DistributionVersion,
                ],
            )),
        ])
        .unwrap();
        let union = union_constraints(registry.matchers());
        assert_eq!(union.len(), 2);
        assert!(union.contains(&MatchConstraint::DistributionVersion));
    }

    #[test]
    fn test_constraint_values() {
        let record = IndexRecord {
            package: Package {
                name: "openssl".into(),
                ..Default::default()
            },
            distribution: Some(Distribution {
                version_id: "12".into(),
                ..Default::default()
            }),
            repository: None,
        };
        assert_eq!(
            MatchConstraint::DistributionVersionId.record_value(&record),
            "12"
        );
        assert_eq!(MatchConstraint::RepositoryKey.record_value(&record), "");

        let vuln = Vulnerability {
            repo: Some(Repository::named("pypi")),
            ..Default::default()
        };
        assert_eq!(
            MatchConstraint::RepositoryName.vulnerability_value(&vuln),
            "pypi"
        );
    }
}
