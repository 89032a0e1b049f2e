use anyhow::Result;
use async_trait::async_trait;

use super::{MatchConstraint, Matcher};
use crate::models::{IndexRecord, Vulnerability};
use crate::version::{parse_semver, SemverRequirements};

/// Correlates Go modules using semantic versioning.
pub struct GoMatcher;

#[async_trait]
impl Matcher for GoMatcher {
    fn name(&self) -> &str {
        "go"
    }

    fn filter(&self, record: &IndexRecord) -> bool {
        record.repository_name() == "go"
    }

    fn query(&self) -> Vec<MatchConstraint> {
        vec![MatchConstraint::RepositoryName]
    }

    async fn vulnerable(&self, record: &IndexRecord, vuln: &Vulnerability) -> Result<bool> {
        let Some(package) = vuln.package.as_ref() else {
            return Ok(false);
        };
        let Ok(installed) = parse_semver(&record.package.version) else {
            return Ok(false);
        };
        let Ok(affected) = SemverRequirements::parse(&package.version) else {
            return Ok(false);
        };
        Ok(affected.check(&installed))
    }
}
