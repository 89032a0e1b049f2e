//! HTTP updater for snyk-style JSON vulnerability feeds.
//!
//! The feed is one JSON object keyed by language, each holding an array
//! of advisories:
//!
//! ```json
//! {
//!   "python": [
//!     {
//!       "id": "SNYK-PYTHON-FOO-1",
//!       "title": "Remote code execution",
//!       "description": "...",
//!       "package": "Foo",
//!       "severity": "high",
//!       "url": "https://snyk.io/vuln/SNYK-PYTHON-FOO-1",
//!       "vulnerableVersions": ["<2.0"],
//!       "initiallyFixedIn": ["2.0"]
//!     }
//!   ],
//!   "maven": []
//! }
//! ```
//!
//! Fetching is conditional: the last stored fingerprint is sent as
//! `If-None-Match`, and a `304 Not Modified` answer becomes
//! [`FetchOutcome::Unchanged`]. The response `ETag` is the new fingerprint.
//!
//! Feeds that need authentication get an `Authorization: Bearer` header
//! carrying a short-lived HS256 JWT signed with the feed's pre-shared key
//! (see [`FeedAuth`]). A fresh token is signed for every fetch.
//!
//! Each advisory is decoded on its own. A malformed advisory is counted
//! and skipped; only a document that is not an object of arrays fails the
//! parse.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};

use vulnsync_core::models::{Fingerprint, NormalizedSeverity, Package, Repository, Vulnerability};
use vulnsync_core::updater::{FeedData, FetchOutcome, Updater, UpdaterSet};

use crate::config::{Config, FeedConfig};

/// Languages a feed section can be transformed from.
pub const KNOWN_LANGUAGES: &[&str] = &["python", "maven", "golang"];

const USER_AGENT: &str = concat!("vulnsync/", env!("CARGO_PKG_VERSION"));

/// One advisory as it appears in the feed.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeedEntry {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    package: String,
    #[serde(default)]
    severity: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    vulnerable_versions: Vec<String>,
    #[serde(default)]
    initially_fixed_in: Vec<String>,
}

/// Maps feed advisories of one language onto [`Vulnerability`] records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Python,
    Maven,
    Golang,
}

impl Language {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "python" => Some(Self::Python),
            "maven" => Some(Self::Maven),
            "golang" => Some(Self::Golang),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Maven => "maven",
            Self::Golang => "golang",
        }
    }

    fn repository(&self) -> Repository {
        match self {
            Self::Python => Repository {
                name: "pypi".into(),
                uri: "https://pypi.org/simple".into(),
                ..Default::default()
            },
            Self::Maven => Repository {
                name: "maven".into(),
                uri: "https://repo1.maven.apache.org/maven2".into(),
                ..Default::default()
            },
            Self::Golang => Repository {
                name: "go".into(),
                uri: "https://proxy.golang.org".into(),
                ..Default::default()
            },
        }
    }

    fn transform(&self, feed: &str, entry: FeedEntry) -> Result<Vulnerability> {
        if entry.id.trim().is_empty() {
            bail!("advisory without id");
        }
        if entry.package.trim().is_empty() {
            bail!("advisory {} without package", entry.id);
        }

        // PyPI project names are case-insensitive.
        let name = match self {
            Self::Python => entry.package.to_lowercase(),
            Self::Maven | Self::Golang => entry.package,
        };
        let description = if entry.description.is_empty() {
            entry.title
        } else {
            entry.description
        };

        Ok(Vulnerability {
            id: String::new(),
            updater: format!("{}-{}", feed, self.as_str()),
            normalized_severity: NormalizedSeverity::from_label(&entry.severity),
            name: entry.id,
            description,
            links: entry.url,
            severity: entry.severity,
            fixed_in_version: entry.initially_fixed_in.join(", "),
            package: Some(Package {
                id: String::new(),
                name,
                version: entry.vulnerable_versions.join(" || "),
                kind: "binary".into(),
            }),
            dist: None,
            repo: Some(self.repository()),
        })
    }
}

const TOKEN_LIFETIME_SECS: i64 = 300;

/// Bearer-token credentials for a feed: a JWT issuer and the pre-shared
/// key its tokens are signed with.
#[derive(Clone)]
pub struct FeedAuth {
    iss: String,
    psk: String,
}

#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    iat: i64,
    exp: i64,
}

impl FeedAuth {
    pub fn new(iss: impl Into<String>, psk: impl Into<String>) -> Self {
        Self {
            iss: iss.into(),
            psk: psk.into(),
        }
    }

    /// Credentials for feed `name`, from its config section or else from
    /// the `<NAME>_ISS` and `<NAME>_PSK` environment variables.
    pub fn resolve(name: &str, config: &FeedConfig) -> Result<Option<Self>> {
        Self::resolve_with(name, config, |key| std::env::var(key).ok())
    }

    fn resolve_with(
        name: &str,
        config: &FeedConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Option<Self>> {
        let prefix: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        let iss = config
            .iss
            .clone()
            .or_else(|| env(&format!("{}_ISS", prefix)))
            .filter(|v| !v.is_empty());
        let psk = config
            .psk
            .clone()
            .or_else(|| env(&format!("{}_PSK", prefix)))
            .filter(|v| !v.is_empty());

        match (iss, psk) {
            (Some(iss), Some(psk)) => Ok(Some(Self { iss, psk })),
            (None, None) => Ok(None),
            _ => bail!("feed '{}' needs both an issuer and a pre-shared key", name),
        }
    }

    pub fn issuer(&self) -> &str {
        &self.iss
    }

    /// Sign a fresh token.
    pub fn token(&self) -> Result<String> {
        let iat = Utc::now().timestamp();
        let claims = Claims {
            iss: &self.iss,
            iat,
            exp: iat + TOKEN_LIFETIME_SECS,
        };
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.psk.as_bytes()),
        )
        .context("failed to sign feed token")
    }
}

impl fmt::Debug for FeedAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedAuth")
            .field("iss", &self.iss)
            .field("psk", &"<redacted>")
            .finish()
    }
}

/// [`Updater`] over one JSON feed URL.
pub struct JsonFeedUpdater {
    name: String,
    url: Url,
    client: reqwest::Client,
    languages: Vec<Language>,
    auth: Option<FeedAuth>,
}

impl JsonFeedUpdater {
    pub fn new(
        name: impl Into<String>,
        url: &str,
        languages: &[String],
        timeout: Duration,
    ) -> Result<Self> {
        let url = Url::parse(url).with_context(|| format!("invalid feed URL: {}", url))?;
        let mut parsed = Vec::with_capacity(languages.len());
        for lang in languages {
            match Language::from_name(lang) {
                Some(l) => parsed.push(l),
                None => bail!(
                    "unknown feed language '{}'. Available: {}",
                    lang,
                    KNOWN_LANGUAGES.join(", ")
                ),
            }
        }
        if parsed.is_empty() {
            bail!("feed needs at least one language");
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            name: name.into(),
            url,
            client,
            languages: parsed,
            auth: None,
        })
    }

    /// Send a signed bearer token with every fetch.
    pub fn with_auth(mut self, auth: FeedAuth) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn from_config(name: &str, config: &FeedConfig) -> Result<Self> {
        let updater = Self::new(
            name,
            &config.url,
            &config.languages,
            Duration::from_secs(config.timeout_secs),
        )?;
        Ok(match FeedAuth::resolve(name, config)? {
            Some(auth) => updater.with_auth(auth),
            None => updater,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn language(&self, key: &str) -> Option<Language> {
        Language::from_name(key).filter(|l| self.languages.contains(l))
    }
}

#[async_trait]
impl Updater for JsonFeedUpdater {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, hint: &Fingerprint) -> Result<FetchOutcome> {
        tracing::info!(updater = %self.name, database = %self.url, "starting fetch");

        let mut request = self.client.get(self.url.clone());
        if !hint.is_empty() {
            tracing::debug!(updater = %self.name, hint = %hint, "using hint");
            request = request.header(IF_NONE_MATCH, hint.as_str());
        }
        if let Some(auth) = &self.auth {
            request = request.bearer_auth(auth.token()?);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            return Ok(FetchOutcome::Unchanged);
        }
        if status != StatusCode::OK {
            bail!("{}: unexpected HTTP response {}", self.name, status);
        }

        let fingerprint = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(Fingerprint::from)
            .unwrap_or_else(|| hint.clone());
        let body = response.bytes().await?;
        tracing::debug!(
            updater = %self.name,
            bytes = body.len(),
            fingerprint = %fingerprint,
            "fetched feed"
        );

        Ok(FetchOutcome::Updated {
            data: Box::new(Cursor::new(body)),
            fingerprint,
        })
    }

    async fn parse(&self, data: FeedData) -> Result<Vec<Vulnerability>> {
        let document: BTreeMap<String, Vec<serde_json::Value>> =
            serde_json::from_reader(data).context("feed is not an object of advisory arrays")?;

        let mut vulns = Vec::new();
        let mut malformed = 0usize;
        for (key, entries) in document {
            let Some(language) = self.language(&key) else {
                tracing::debug!(updater = %self.name, language = %key, "no transformer; skipping");
                continue;
            };
            for value in entries {
                let transformed = serde_json::from_value::<FeedEntry>(value)
                    .map_err(anyhow::Error::from)
                    .and_then(|entry| language.transform(&self.name, entry));
                match transformed {
                    Ok(vuln) => vulns.push(vuln),
                    Err(e) => {
                        malformed += 1;
                        tracing::debug!(
                            updater = %self.name,
                            language = language.as_str(),
                            error = %e,
                            "skipping malformed advisory"
                        );
                    }
                }
            }
        }

        if malformed > 0 {
            tracing::warn!(updater = %self.name, count = malformed, "skipped malformed advisories");
        }
        tracing::debug!(updater = %self.name, count = vulns.len(), "parsed feed");
        Ok(vulns)
    }
}

/// One [`JsonFeedUpdater`] per `[feeds.<name>]` section.
pub fn updater_set(config: &Config) -> Result<UpdaterSet> {
    let mut set = UpdaterSet::new();
    for (name, feed) in &config.feeds {
        set.add(Arc::new(JsonFeedUpdater::from_config(name, feed)?))?;
    }
    Ok(set)
}
