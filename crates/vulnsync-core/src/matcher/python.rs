use anyhow::Result;
use async_trait::async_trait;

use super::{MatchConstraint, Matcher};
use crate::models::{IndexRecord, Vulnerability};
use crate::version::{LooseVersion, Requirements};

/// Correlates packages installed from PyPI.
///
/// Python ranges in the feeds are operator constraints (`>=1.0,<1.4`),
/// which the loose Maven-style ordering handles for release, pre-release
/// and post-release versions.
pub struct PythonMatcher;

#[async_trait]
impl Matcher for PythonMatcher {
    fn name(&self) -> &str {
        "python"
    }

    fn filter(&self, record: &IndexRecord) -> bool {
        record.repository_name() == "pypi"
    }

    fn query(&self) -> Vec<MatchConstraint> {
        Vec::new()
    }

    async fn vulnerable(&self, record: &IndexRecord, vuln: &Vulnerability) -> Result<bool> {
        let Some(package) = vuln.package.as_ref() else {
            return Ok(false);
        };
        if !package.name.eq_ignore_ascii_case(&record.package.name) {
            return Ok(false);
        }
        let Ok(installed) = LooseVersion::parse(&record.package.version) else {
            return Ok(false);
        };
        let Ok(affected) = Requirements::parse(&package.version) else {
            return Ok(false);
        };
        Ok(affected.check(&installed))
    }
}
