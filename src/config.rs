//! TOML configuration parsing and validation.
//!
//! ```toml
//! [db]
//! path = "./data/vulnsync.sqlite"
//!
//! [updater]
//! interval_secs = 21600
//! update_on_start = true
//! lock_ttl_secs = 3600
//!
//! [matchers]
//! enabled = ["maven", "python", "go"]
//!
//! [feeds.snyk]
//! url = "https://snyk.io/partners/api/v4/vulndb/feed.json"
//! languages = ["python", "maven"]
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use vulnsync_core::matcher::BUILTIN_MATCHERS;

use crate::feed::KNOWN_LANGUAGES;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub updater: UpdaterConfig,
    #[serde(default)]
    pub matchers: MatchersConfig,
    #[serde(default)]
    pub feeds: BTreeMap<String, FeedConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpdaterConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_update_on_start")]
    pub update_on_start: bool,
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            update_on_start: default_update_on_start(),
            lock_ttl_secs: default_lock_ttl_secs(),
        }
    }
}

impl UpdaterConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
}

fn default_interval_secs() -> u64 {
    6 * 60 * 60
}
fn default_update_on_start() -> bool {
    true
}
fn default_lock_ttl_secs() -> u64 {
    60 * 60
}

#[derive(Debug, Deserialize, Clone)]
pub struct MatchersConfig {
    #[serde(default = "default_matchers")]
    pub enabled: Vec<String>,
}

impl Default for MatchersConfig {
    fn default() -> Self {
        Self {
            enabled: default_matchers(),
        }
    }
}

fn default_matchers() -> Vec<String> {
    BUILTIN_MATCHERS.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeedConfig {
    pub url: String,
    #[serde(default = "default_languages")]
    pub languages: Vec<String>,
    #[serde(default = "default_feed_timeout_secs")]
    pub timeout_secs: u64,
    /// JWT issuer for feeds that require bearer auth. Falls back to `<FEED>_ISS`.
    #[serde(default)]
    pub iss: Option<String>,
    /// Pre-shared HS256 signing key. Falls back to `<FEED>_PSK`.
    #[serde(default)]
    pub psk: Option<String>,
}

fn default_languages() -> Vec<String> {
    vec!["python".to_string(), "maven".to_string()]
}
fn default_feed_timeout_secs() -> u64 {
    60
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.updater.interval_secs == 0 {
        anyhow::bail!("updater.interval_secs must be > 0");
    }
    if config.updater.lock_ttl_secs == 0 {
        anyhow::bail!("updater.lock_ttl_secs must be > 0");
    }

    for name in &config.matchers.enabled {
        if !BUILTIN_MATCHERS.contains(&name.as_str()) {
            anyhow::bail!(
                "Unknown matcher: '{}'. Available: {}",
                name,
                BUILTIN_MATCHERS.join(", ")
            );
        }
    }

    for (name, feed) in &config.feeds {
        reqwest::Url::parse(&feed.url)
            .with_context(|| format!("feeds.{}.url is not a valid URL", name))?;
        if feed.languages.is_empty() {
            anyhow::bail!("feeds.{}.languages must not be empty", name);
        }
        for lang in &feed.languages {
            if !KNOWN_LANGUAGES.contains(&lang.as_str()) {
                anyhow::bail!(
                    "feeds.{}: unknown language '{}'. Available: {}",
                    name,
                    lang,
                    KNOWN_LANGUAGES.join(", ")
                );
            }
        }
        if feed.timeout_secs == 0 {
            anyhow::bail!("feeds.{}.timeout_secs must be > 0", name);
        }
        if feed.iss.is_some() != feed.psk.is_some() {
            anyhow::bail!("feeds.{}: iss and psk must be set together", name);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> Result<Config> {
        let config: Config = toml::from_str(content)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_defaults() {
        let config = parse(
            r#"
[db]
path = "/tmp/vulnsync.sqlite"
"#,
        )
        .unwrap();
        assert_eq!(config.updater.interval(), Duration::from_secs(21600));
        assert!(config.updater.update_on_start);
        assert_eq!(config.matchers.enabled, vec!["maven", "python", "go"]);
        assert!(config.feeds.is_empty());
    }

    #[test]
    fn test_feed_section() {
        let config = parse(
            r#"
[db]
path = "/tmp/vulnsync.sqlite"

[feeds.snyk]
url = "https://example.com/feed.json"
languages = ["python"]
"#,
        )
        .unwrap();
        let feed = &config.feeds["snyk"];
        assert_eq!(feed.languages, vec!["python"]);
        assert_eq!(feed.timeout_secs, 60);
    }

    #[test]
    fn test_rejects_zero_interval() {
        let err = parse(
            r#"
[db]
path = "/tmp/vulnsync.sqlite"

[updater]
interval_secs = 0
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("interval_secs"));
    }

    #[test]
    fn test_rejects_unknown_matcher_and_language() {
        assert!(parse(
            r#"
[db]
path = "/tmp/vulnsync.sqlite"

[matchers]
enabled = ["cobol"]
"#,
        )
        .is_err());

        assert!(parse(
            r#"
[db]
path = "/tmp/vulnsync.sqlite"

[feeds.snyk]
url = "https://example.com/feed.json"
languages = ["fortran"]
"#,
        )
        .is_err());
    }

    #[test]
    fn test_rejects_bad_url() {
        assert!(parse(
            r#"
[db]
path = "/tmp/vulnsync.sqlite"

[feeds.snyk]
url = "not a url"
"#,
        )
        .is_err());
    }

    #[test]
    fn test_feed_auth_needs_both_halves() {
        let config = parse(
            r#"
[db]
path = "/tmp/vulnsync.sqlite"

[feeds.snyk]
url = "https://example.com/feed.json"
iss = "partner"
psk = "secret"
"#,
        )
        .unwrap();
        assert_eq!(config.feeds["snyk"].iss.as_deref(), Some("partner"));

        let err = parse(
            r#"
[db]
path = "/tmp/vulnsync.sqlite"

[feeds.snyk]
url = "https://example.com/feed.json"
iss = "partner"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("iss and psk"));
    }
}
