use anyhow::Result;
use async_trait::async_trait;

use super::{MatchConstraint, Matcher};
use crate::models::{IndexRecord, Vulnerability};
use crate::version::{LooseVersion, Requirements};

/// Correlates Java artifacts found in jar/war/ear archives.
///
/// Vulnerable ranges use Maven interval notation or operator constraints.
pub struct MavenMatcher;

#[async_trait]
impl Matcher for MavenMatcher {
    fn name(&self) -> &str {
        "maven"
    }

    fn filter(&self, record: &IndexRecord) -> bool {
        record.repository_name() == "maven"
    }

    fn query(&self) -> Vec<MatchConstraint> {
        Vec::new()
    }

    async fn vulnerable(&self, record: &IndexRecord, vuln: &Vulnerability) -> Result<bool> {
        let Some(package) = vuln.package.as_ref() else {
            return Ok(false);
        };
        let Ok(installed) = LooseVersion::parse(&record.package.version) else {
            return Ok(false);
        };
        let Ok(affected) = Requirements::parse(&package.version) else {
            return Ok(false);
        };
        Ok(affected.check(&installed))
    }
}
