//! Remote errorbook registry lookup.
//!
//! A registry source is either a full snapshot (URI or path) or an indexed
//! collection of shards. The token index maps query tokens to shard URIs so
//! a `find` touches only the shards that can contain a hit; the whole source
//! is scanned only as an explicit opt-in.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::SharedClock;
use crate::config::{ErrorbookRegistryConfig, RegistrySource};
use crate::error::{CoreError, Result};
use crate::errorbook::{Entry, EntryStatus, RegistryExport};
use crate::layout::Layout;
use crate::store;

pub const CACHE_VERSION: &str = "sce.errorbook.cache.v1";
pub const DEFAULT_MIN_TOKEN_LENGTH: usize = 2;
pub const DEFAULT_MAX_SHARDS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Cache,
    Remote,
    #[default]
    Hybrid,
}

impl std::str::FromStr for SearchMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "cache" => Ok(Self::Cache),
            "remote" => Ok(Self::Remote),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(format!("unknown search mode: {other}")),
        }
    }
}

/// `token_to_source` values are a single URI or a list of URIs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ShardRef {
    One(String),
    Many(Vec<String>),
}

impl ShardRef {
    fn uris(&self) -> Vec<&str> {
        match self {
            ShardRef::One(uri) => vec![uri.as_str()],
            ShardRef::Many(uris) => uris.iter().map(String::as_str).collect(),
        }
    }
}

/// Per-source token index document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryIndexDoc {
    #[serde(default)]
    pub api_version: String,
    #[serde(default = "default_min_token_length")]
    pub min_token_length: usize,
    #[serde(default)]
    pub token_to_source: BTreeMap<String, ShardRef>,
    #[serde(default)]
    pub token_to_bucket: BTreeMap<String, String>,
    #[serde(default)]
    pub buckets: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_source: Option<String>,
}

fn default_min_token_length() -> usize {
    DEFAULT_MIN_TOKEN_LENGTH
}

/// Local synced snapshot (`errorbook/registry-cache.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryCache {
    pub api_version: String,
    pub synced_at: DateTime<Utc>,
    pub sources: Vec<String>,
    pub entries: Vec<Entry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub fingerprint: String,
    pub title: String,
    pub status: EntryStatus,
    pub quality_score: u8,
    pub tags: Vec<String>,
    pub match_score: f64,
    pub origin: String,
}

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub mode: SearchMode,
    pub max_shards: Option<usize>,
    pub allow_remote_fullscan: bool,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchReport {
    pub hits: Vec<SearchHit>,
    /// Sources that could not be reached; `find` degrades to a warning.
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceHealth {
    pub name: String,
    pub enabled: bool,
    pub reachable: bool,
    pub indexed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub sources: Vec<SourceHealth>,
}

/// Fetches raw JSON from a URI or filesystem path. Swapped for a table fake
/// in tests.
pub trait SnapshotFetcher: Send + Sync {
    fn fetch(&self, location: &str) -> Result<String>;
}

/// Production fetcher: blocking HTTP for `http(s)://`, filesystem otherwise.
#[derive(Debug, Default)]
pub struct HttpFetcher;

impl SnapshotFetcher for HttpFetcher {
    fn fetch(&self, location: &str) -> Result<String> {
        if location.starts_with("http://") || location.starts_with("https://") {
            let client = reqwest::blocking::Client::builder()
                .user_agent(format!("sce/{}", env!("CARGO_PKG_VERSION")))
                .build()
                .map_err(|e| CoreError::RegistryUnavailable(format!("http client: {e}")))?;
            let resp = client.get(location).send().map_err(|e| {
                CoreError::RegistryUnavailable(format!("fetch failed for {location}: {e}"))
            })?;
            if !resp.status().is_success() {
                return Err(CoreError::RegistryUnavailable(format!(
                    "unexpected status {} fetching {location}",
                    resp.status()
                )));
            }
            resp.text().map_err(|e| {
                CoreError::RegistryUnavailable(format!("failed to read body of {location}: {e}"))
            })
        } else {
            std::fs::read_to_string(location).map_err(|e| {
                CoreError::RegistryUnavailable(format!("failed to read {location}: {e}"))
            })
        }
    }
}

/// Query tokens: lowercased, split on non-alphanumeric, length-filtered.
pub fn tokenize(query: &str, min_token_length: usize) -> Vec<String> {
    let mut seen = std::collections::BTreeSet::new();
    let mut out = Vec::new();
    for token in query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= min_token_length)
    {
        if seen.insert(token.to_string()) {
            out.push(token.to_string());
        }
    }
    out
}

/// Weighted match score for one entry against the query tokens.
pub fn match_score(entry: &Entry, tokens: &[String]) -> f64 {
    let title = entry.title.to_lowercase();
    let symptom = entry.symptom.to_lowercase();
    let root = entry.root_cause.to_lowercase();
    let fixes = entry.fix_actions.join(" ").to_lowercase();
    let tags = entry.tags.join(" ").to_lowercase();
    let fp = entry.fingerprint.to_lowercase();

    let mut score = 0.0;
    for token in tokens {
        if title.contains(token.as_str()) {
            score += 8.0;
        }
        if symptom.contains(token.as_str()) {
            score += 5.0;
        }
        if root.contains(token.as_str()) {
            score += 5.0;
        }
        if fixes.contains(token.as_str()) {
            score += 3.0;
        }
        if tags.contains(token.as_str()) {
            score += 2.0;
        }
        if fp.contains(token.as_str()) {
            score += 1.0;
        }
    }
    if score == 0.0 {
        return 0.0;
    }
    score + f64::from(entry.quality_score) / 20.0 + f64::from(entry.status.rank())
}

pub struct RegistryClient {
    layout: Layout,
    config: ErrorbookRegistryConfig,
    fetcher: Box<dyn SnapshotFetcher>,
    clock: SharedClock,
}

impl RegistryClient {
    pub fn new(layout: Layout, config: ErrorbookRegistryConfig, clock: SharedClock) -> Self {
        Self {
            layout,
            config,
            fetcher: Box::new(HttpFetcher),
            clock,
        }
    }

    pub fn with_fetcher(
        layout: Layout,
        config: ErrorbookRegistryConfig,
        clock: SharedClock,
        fetcher: Box<dyn SnapshotFetcher>,
    ) -> Self {
        Self {
            layout,
            config,
            fetcher,
            clock,
        }
    }

    /// Search the registry. Source failures degrade to warnings; results are
    /// deduplicated by fingerprint keeping the highest match score.
    pub fn find(&self, query: &str, options: &SearchOptions) -> Result<SearchReport> {
        let mut hits: Vec<SearchHit> = Vec::new();
        let mut warnings: Vec<String> = Vec::new();

        if matches!(options.mode, SearchMode::Cache | SearchMode::Hybrid) {
            match self.search_cache(query) {
                Ok(mut cached) => hits.append(&mut cached),
                Err(e) => warnings.push(e.to_string()),
            }
        }
        if matches!(options.mode, SearchMode::Remote | SearchMode::Hybrid) {
            for source in self.config.sources.iter().filter(|s| s.enabled) {
                match self.search_source(source, query, options) {
                    Ok(mut found) => hits.append(&mut found),
                    Err(e) => warnings.push(format!("source '{}': {e}", source.name)),
                }
            }
        }

        let mut best: BTreeMap<String, SearchHit> = BTreeMap::new();
        for hit in hits {
            match best.get(&hit.fingerprint) {
                Some(existing) if existing.match_score >= hit.match_score => {}
                _ => {
                    best.insert(hit.fingerprint.clone(), hit);
                }
            }
        }
        let mut hits: Vec<SearchHit> = best.into_values().filter(|h| h.match_score > 0.0).collect();
        hits.sort_by(|a, b| {
            b.match_score
                .partial_cmp(&a.match_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });
        if let Some(limit) = options.limit {
            hits.truncate(limit);
        }

        Ok(SearchReport { hits, warnings })
    }

    fn search_cache(&self, query: &str) -> Result<Vec<SearchHit>> {
        let cache = store::read_json::<RegistryCache>(&self.layout.registry_cache())?
            .ok_or_else(|| {
                CoreError::RegistryUnavailable(
                    "registry cache missing; run sync-registry first".to_string(),
                )
            })?;
        let tokens = tokenize(query, DEFAULT_MIN_TOKEN_LENGTH);
        Ok(score_entries(&cache.entries, &tokens, "cache"))
    }

    fn search_source(
        &self,
        source: &RegistrySource,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<SearchHit>> {
        let Some(index_url) = &source.index_url else {
            // Unindexed sources are scanned whole; configuring one is the
            // opt-in.
            let entries = self.fetch_entries(&source.source)?;
            let tokens = tokenize(query, DEFAULT_MIN_TOKEN_LENGTH);
            return Ok(score_entries(&entries, &tokens, &source.name));
        };

        let raw = self.fetcher.fetch(index_url)?;
        let index: RegistryIndexDoc = serde_json::from_str(&raw).map_err(|e| {
            CoreError::RegistryUnavailable(format!("bad index document at {index_url}: {e}"))
        })?;

        let tokens = tokenize(query, index.min_token_length);
        let max_shards = options.max_shards.unwrap_or(DEFAULT_MAX_SHARDS);

        let mut shards: Vec<String> = Vec::new();
        for token in &tokens {
            if let Some(shard) = index.token_to_source.get(token) {
                for uri in shard.uris() {
                    push_unique(&mut shards, uri);
                }
            } else if let Some(bucket) = index.token_to_bucket.get(token)
                && let Some(uri) = index.buckets.get(bucket)
            {
                push_unique(&mut shards, uri);
            }
            if shards.len() >= max_shards {
                shards.truncate(max_shards);
                break;
            }
        }

        if shards.is_empty() {
            if let Some(default_source) = &index.default_source {
                shards.push(default_source.clone());
            } else if options.allow_remote_fullscan {
                shards.push(source.source.clone());
            } else {
                return Ok(Vec::new());
            }
        }

        let mut hits = Vec::new();
        for shard in &shards {
            let entries = self.fetch_entries(shard)?;
            hits.extend(score_entries(&entries, &tokens, &source.name));
        }
        Ok(hits)
    }

    /// Fetch a snapshot; accepts an export document or a bare entry array.
    fn fetch_entries(&self, location: &str) -> Result<Vec<Entry>> {
        let raw = self.fetcher.fetch(location)?;
        if let Ok(export) = serde_json::from_str::<RegistryExport>(&raw) {
            return Ok(export.entries);
        }
        serde_json::from_str::<Vec<Entry>>(&raw).map_err(|e| {
            CoreError::RegistryUnavailable(format!("bad snapshot at {location}: {e}"))
        })
    }

    /// Pull every enabled source into the local cache snapshot.
    pub fn sync(&self) -> Result<RegistryCache> {
        let mut best: BTreeMap<String, Entry> = BTreeMap::new();
        let mut names = Vec::new();
        for source in self.config.sources.iter().filter(|s| s.enabled) {
            let entries = self.fetch_entries(&source.source)?;
            names.push(source.name.clone());
            for entry in entries {
                match best.get(&entry.fingerprint) {
                    Some(existing) if keep_existing(existing, &entry) => {}
                    _ => {
                        best.insert(entry.fingerprint.clone(), entry);
                    }
                }
            }
        }

        let cache = RegistryCache {
            api_version: CACHE_VERSION.to_string(),
            synced_at: self.clock.now(),
            sources: names,
            entries: best.into_values().collect(),
        };
        store::write_json(&self.layout.registry_cache(), &cache)?;
        Ok(cache)
    }

    /// Probe every source; alerts are collected, not raised. The caller
    /// decides whether an alert is fatal.
    pub fn health(&self) -> HealthReport {
        let mut sources = Vec::new();
        for source in &self.config.sources {
            if !source.enabled {
                sources.push(SourceHealth {
                    name: source.name.clone(),
                    enabled: false,
                    reachable: false,
                    indexed: source.index_url.is_some(),
                    alert: None,
                });
                continue;
            }

            let mut alert = None;
            if let Some(index_url) = &source.index_url
                && let Err(e) = self
                    .fetcher
                    .fetch(index_url)
                    .and_then(|raw| {
                        serde_json::from_str::<RegistryIndexDoc>(&raw).map_err(|e| {
                            CoreError::RegistryUnavailable(format!("bad index document: {e}"))
                        })
                    })
            {
                alert = Some(e.to_string());
            }
            if alert.is_none()
                && let Err(e) = self.fetch_entries(&source.source)
            {
                alert = Some(e.to_string());
            }

            sources.push(SourceHealth {
                name: source.name.clone(),
                enabled: true,
                reachable: alert.is_none(),
                indexed: source.index_url.is_some(),
                alert,
            });
        }

        HealthReport {
            healthy: sources.iter().all(|s| s.alert.is_none()),
            sources,
        }
    }
}

fn push_unique(shards: &mut Vec<String>, uri: &str) {
    if !shards.iter().any(|s| s == uri) {
        shards.push(uri.to_string());
    }
}

/// Cache merge preference: higher status rank, then quality, then recency.
fn keep_existing(existing: &Entry, incoming: &Entry) -> bool {
    (
        existing.status.rank(),
        existing.quality_score,
        existing.updated_at,
    ) >= (
        incoming.status.rank(),
        incoming.quality_score,
        incoming.updated_at,
    )
}

fn score_entries(entries: &[Entry], tokens: &[String], origin: &str) -> Vec<SearchHit> {
    entries
        .iter()
        .map(|entry| SearchHit {
            fingerprint: entry.fingerprint.clone(),
            title: entry.title.clone(),
            status: entry.status,
            quality_score: entry.quality_score,
            tags: entry.tags.clone(),
            match_score: match_score(entry, tokens),
            origin: origin.to_string(),
        })
        .filter(|hit| hit.match_score > 0.0)
        .collect()
}
