//! Curated failure-knowledge store.
//!
//! Entries are content-addressed by a stable fingerprint over the lowercased
//! (title, symptom, root_cause) triple; colliding records merge. The entry
//! file is the source of truth; the index is a materialized cache that is
//! rebuilt from entries whenever it is missing or corrupt.

use std::collections::BTreeSet;
use std::fs;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::clock::SharedClock;
use crate::error::{CoreError, Result};
use crate::layout::Layout;
use crate::store;

pub const INDEX_VERSION: &str = "sce.errorbook.index.v1";
pub const EXPORT_VERSION: &str = "sce.errorbook.export.v1";

/// Tag set that forces high release risk regardless of quality.
pub const HIGH_RISK_TAGS: [&str; 8] = [
    "release-blocker",
    "security",
    "auth",
    "payment",
    "data-loss",
    "integrity",
    "compliance",
    "incident",
];

/// Default tag applied when a record carries none.
const DEFAULT_TAG: &str = "recorded";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Candidate,
    Verified,
    Promoted,
    Deprecated,
}

impl EntryStatus {
    /// Merge rank: `deprecated < candidate < verified < promoted`.
    pub fn rank(&self) -> u8 {
        match self {
            EntryStatus::Deprecated => 0,
            EntryStatus::Candidate => 1,
            EntryStatus::Verified => 2,
            EntryStatus::Promoted => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Candidate => "candidate",
            EntryStatus::Verified => "verified",
            EntryStatus::Promoted => "promoted",
            EntryStatus::Deprecated => "deprecated",
        }
    }
}

impl std::str::FromStr for EntryStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "candidate" => Ok(Self::Candidate),
            "verified" => Ok(Self::Verified),
            "promoted" => Ok(Self::Promoted),
            "deprecated" => Ok(Self::Deprecated),
            other => Err(format!("unknown entry status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OntologyTag {
    Entity,
    Relation,
    BusinessRule,
    DecisionPolicy,
    ExecutionFlow,
}

impl std::str::FromStr for OntologyTag {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "entity" => Ok(Self::Entity),
            "relation" => Ok(Self::Relation),
            "business_rule" => Ok(Self::BusinessRule),
            "decision_policy" => Ok(Self::DecisionPolicy),
            "execution_flow" => Ok(Self::ExecutionFlow),
            other => Err(format!("unknown ontology tag: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!("unknown risk level: {other}")),
        }
    }
}

/// Temporary workaround attached to an entry. While enabled and unresolved
/// it must carry exit criteria, a cleanup task, and a parseable deadline.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TemporaryMitigation {
    pub enabled: bool,
    #[serde(default)]
    pub exit_criteria: String,
    #[serde(default)]
    pub cleanup_task: String,
    /// ISO-8601 timestamp; the empty string and unparseable values are
    /// policy violations.
    #[serde(default)]
    pub deadline_at: String,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl TemporaryMitigation {
    pub fn is_active(&self) -> bool {
        self.enabled && !self.resolved
    }

    /// Policy violations while active; each is a stable field path.
    pub fn violations(&self, now: DateTime<Utc>) -> Vec<String> {
        if !self.is_active() {
            return Vec::new();
        }
        let mut out = Vec::new();
        if self.exit_criteria.trim().is_empty() {
            out.push("temporary_mitigation.exit_criteria".to_string());
        }
        if self.cleanup_task.trim().is_empty() {
            out.push("temporary_mitigation.cleanup_task".to_string());
        }
        match self.deadline_at.parse::<DateTime<Utc>>() {
            Ok(deadline) if deadline > now => {}
            // Missing, unparseable, or already due.
            _ => out.push("temporary_mitigation.deadline_at".to_string()),
        }
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entry {
    pub id: String,
    pub fingerprint: String,
    pub title: String,
    pub symptom: String,
    pub root_cause: String,
    pub fix_actions: Vec<String>,
    pub verification_evidence: Vec<String>,
    pub tags: Vec<String>,
    pub ontology_tags: Vec<OntologyTag>,
    pub status: EntryStatus,
    pub quality_score: u8,
    pub occurrences: u32,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporary_mitigation: Option<TemporaryMitigation>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entry {
    pub fn has_high_risk_tag(&self) -> bool {
        self.tags
            .iter()
            .any(|t| HIGH_RISK_TAGS.contains(&t.as_str()))
    }

    pub fn has_ontology(&self, tag: OntologyTag) -> bool {
        self.ontology_tags.contains(&tag)
    }

    pub fn active_mitigation(&self) -> Option<&TemporaryMitigation> {
        self.temporary_mitigation.as_ref().filter(|m| m.is_active())
    }
}

/// Derived release-risk label.
pub fn risk_of(entry: &Entry) -> RiskLevel {
    match entry.status {
        EntryStatus::Promoted | EntryStatus::Deprecated => RiskLevel::Low,
        status => {
            if entry.has_high_risk_tag() {
                return RiskLevel::High;
            }
            let quality = entry.quality_score;
            let decision_policy = entry.has_ontology(OntologyTag::DecisionPolicy);
            match status {
                EntryStatus::Candidate => {
                    if quality >= 85 || (quality >= 75 && decision_policy) {
                        RiskLevel::High
                    } else {
                        RiskLevel::Medium
                    }
                }
                EntryStatus::Verified => {
                    if quality >= 85 && decision_policy {
                        RiskLevel::High
                    } else {
                        RiskLevel::Medium
                    }
                }
                _ => unreachable!("promoted/deprecated handled above"),
            }
        }
    }
}

/// Deterministic weighted quality score, clipped to [0, 100].
pub fn quality_score(entry: &Entry) -> u8 {
    let mut score: u32 = 0;
    if !entry.title.trim().is_empty() {
        score += 10;
    }
    if !entry.symptom.trim().is_empty() {
        score += 10;
    }
    if !entry.fingerprint.trim().is_empty() {
        score += 10;
    }
    if !entry.root_cause.trim().is_empty() {
        score += 20;
    }
    if !entry.fix_actions.is_empty() {
        score += 20;
    }
    if !entry.verification_evidence.is_empty() {
        score += 20;
    }
    if !entry.ontology_tags.is_empty() {
        score += 5;
    }
    if !entry.tags.is_empty() {
        score += 3;
    }
    if entry.symptom.chars().count() >= 24 && entry.root_cause.chars().count() >= 24 {
        score += 2;
    }
    score.min(100) as u8
}

/// Stable 160-bit digest over the lowercased triple, truncated to 16 hex.
pub fn fingerprint(title: &str, symptom: &str, root_cause: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(title.trim().to_lowercase().as_bytes());
    hasher.update(b"\n");
    hasher.update(symptom.trim().to_lowercase().as_bytes());
    hasher.update(b"\n");
    hasher.update(root_cause.trim().to_lowercase().as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..16].to_string()
}

/// Normalized input to [`Errorbook::record`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordInput {
    pub title: String,
    pub symptom: String,
    #[serde(default)]
    pub root_cause: String,
    #[serde(default)]
    pub fix_actions: Vec<String>,
    #[serde(default)]
    pub verification_evidence: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub ontology_tags: Vec<OntologyTag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<EntryStatus>,
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporary_mitigation: Option<TemporaryMitigation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordOutcome {
    pub entry: Entry,
    pub merged: bool,
}

/// Index summary line; the index is rebuildable from entries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntrySummary {
    pub id: String,
    pub fingerprint: String,
    pub title: String,
    pub status: EntryStatus,
    pub quality_score: u8,
    pub occurrences: u32,
    pub tags: Vec<String>,
    pub has_active_mitigation: bool,
    pub updated_at: DateTime<Utc>,
}

impl EntrySummary {
    fn of(entry: &Entry) -> Self {
        Self {
            id: entry.id.clone(),
            fingerprint: entry.fingerprint.clone(),
            title: entry.title.clone(),
            status: entry.status,
            quality_score: entry.quality_score,
            occurrences: entry.occurrences,
            tags: entry.tags.clone(),
            has_active_mitigation: entry.active_mitigation().is_some(),
            updated_at: entry.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorbookIndex {
    pub api_version: String,
    pub updated_at: DateTime<Utc>,
    pub entries: Vec<EntrySummary>,
}

/// Release-gate blocker, sorted for output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateBlocker {
    pub id: String,
    pub fingerprint: String,
    pub title: String,
    pub status: EntryStatus,
    pub risk: RiskLevel,
    pub quality_score: u8,
    pub has_active_mitigation: bool,
    pub policy_violations: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseGateReport {
    pub passed: bool,
    pub min_risk: RiskLevel,
    pub include_verified: bool,
    pub evaluated: usize,
    pub blocked_count: usize,
    pub risk_blocked: Vec<GateBlocker>,
    pub mitigation_blocked: Vec<GateBlocker>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryExport {
    pub api_version: String,
    pub generated_at: DateTime<Utc>,
    pub entries: Vec<Entry>,
}

/// The errorbook engine. All mutations go through the state store; the
/// index is refreshed atomically after every entry write.
pub struct Errorbook {
    layout: Layout,
    clock: SharedClock,
}

impl Errorbook {
    pub fn new(layout: Layout, clock: SharedClock) -> Self {
        Self { layout, clock }
    }

    /// Record a failure. Merges into the entry with the same fingerprint
    /// when one exists, otherwise creates a new candidate.
    pub fn record(&self, input: RecordInput) -> Result<RecordOutcome> {
        let input = normalize(input)?;
        let status = match input.status {
            Some(EntryStatus::Promoted) => {
                return Err(CoreError::PreconditionViolation(
                    "status 'promoted' is reachable only via promote".to_string(),
                ));
            }
            Some(s) => s,
            None => EntryStatus::Candidate,
        };
        if status == EntryStatus::Verified && input.verification_evidence.is_empty() {
            return Err(CoreError::PreconditionViolation(
                "status 'verified' requires at least one verification evidence".to_string(),
            ));
        }

        let fp = fingerprint(&input.title, &input.symptom, &input.root_cause);
        let now = self.clock.now();

        let outcome = match self.find_by_fingerprint(&fp)? {
            Some(mut existing) => {
                merge_into(&mut existing, &input, status);
                existing.occurrences += 1;
                existing.updated_at = now;
                existing.quality_score = quality_score(&existing);
                RecordOutcome {
                    entry: existing,
                    merged: true,
                }
            }
            None => {
                let mut entry = Entry {
                    id: format!("eb-{fp}"),
                    fingerprint: fp,
                    title: input.title,
                    symptom: input.symptom,
                    root_cause: input.root_cause,
                    fix_actions: input.fix_actions,
                    verification_evidence: input.verification_evidence,
                    tags: input.tags,
                    ontology_tags: input.ontology_tags,
                    status,
                    quality_score: 0,
                    occurrences: 1,
                    source: input.source,
                    temporary_mitigation: input.temporary_mitigation,
                    created_at: now,
                    updated_at: now,
                };
                entry.quality_score = quality_score(&entry);
                RecordOutcome {
                    entry,
                    merged: false,
                }
            }
        };

        self.persist(&outcome.entry)?;
        Ok(outcome)
    }

    /// Promote a verified (or qualifying candidate) entry. Lists every
    /// unmet requirement in the error.
    pub fn promote(&self, key: &str) -> Result<Entry> {
        let mut entry = self.get(key)?;
        let mut missing: Vec<&str> = Vec::new();
        if entry.status == EntryStatus::Deprecated {
            return Err(CoreError::PreconditionViolation(format!(
                "entry {} is deprecated and cannot be promoted",
                entry.id
            )));
        }
        if entry.root_cause.trim().is_empty() {
            missing.push("root_cause");
        }
        if entry.fix_actions.is_empty() {
            missing.push("fix_actions");
        }
        if entry.verification_evidence.is_empty() {
            missing.push("verification_evidence");
        }
        if entry.ontology_tags.is_empty() {
            missing.push("ontology_tags");
        }
        if entry.quality_score < 75 {
            missing.push("quality_score>=75");
        }
        if !missing.is_empty() {
            return Err(CoreError::PreconditionViolation(format!(
                "entry {} not promotable; missing: {}",
                entry.id,
                missing.join(", ")
            )));
        }

        entry.status = EntryStatus::Promoted;
        self.resolve_mitigation_in(&mut entry);
        self.touch_and_persist(entry)
    }

    /// Deprecate any non-promoted entry.
    pub fn deprecate(&self, key: &str) -> Result<Entry> {
        let mut entry = self.get(key)?;
        if entry.status == EntryStatus::Promoted {
            return Err(CoreError::PreconditionViolation(format!(
                "entry {} is promoted; promoted entries cannot be deprecated",
                entry.id
            )));
        }
        entry.status = EntryStatus::Deprecated;
        self.resolve_mitigation_in(&mut entry);
        self.touch_and_persist(entry)
    }

    /// Return a deprecated or candidate entry to circulation.
    pub fn requalify(&self, key: &str, target: EntryStatus) -> Result<Entry> {
        if !matches!(target, EntryStatus::Candidate | EntryStatus::Verified) {
            return Err(CoreError::InputValidation(format!(
                "requalify target must be candidate or verified, got {}",
                target.as_str()
            )));
        }
        let mut entry = self.get(key)?;
        if !matches!(
            entry.status,
            EntryStatus::Deprecated | EntryStatus::Candidate
        ) {
            return Err(CoreError::PreconditionViolation(format!(
                "entry {} has status {}; only deprecated or candidate entries requalify",
                entry.id,
                entry.status.as_str()
            )));
        }
        if target == EntryStatus::Verified && entry.verification_evidence.is_empty() {
            return Err(CoreError::PreconditionViolation(format!(
                "entry {} cannot requalify to verified without verification evidence",
                entry.id
            )));
        }
        entry.status = target;
        self.touch_and_persist(entry)
    }

    /// Attach or replace the temporary mitigation.
    pub fn set_mitigation(&self, key: &str, mitigation: TemporaryMitigation) -> Result<Entry> {
        let mut entry = self.get(key)?;
        entry.temporary_mitigation = Some(mitigation);
        self.touch_and_persist(entry)
    }

    /// Mark the mitigation resolved directly.
    pub fn resolve_mitigation(&self, key: &str) -> Result<Entry> {
        let mut entry = self.get(key)?;
        if entry.temporary_mitigation.is_none() {
            return Err(CoreError::NotFound(format!(
                "entry {} has no temporary mitigation",
                entry.id
            )));
        }
        self.resolve_mitigation_in(&mut entry);
        self.touch_and_persist(entry)
    }

    fn resolve_mitigation_in(&self, entry: &mut Entry) {
        if let Some(m) = entry.temporary_mitigation.as_mut()
            && !m.resolved
        {
            m.resolved = true;
            m.resolved_at = Some(self.clock.now());
        }
    }

    /// Load one entry by id or fingerprint.
    pub fn get(&self, key: &str) -> Result<Entry> {
        let id = if key.starts_with("eb-") {
            key.to_string()
        } else {
            format!("eb-{key}")
        };
        store::read_json::<Entry>(&self.layout.errorbook_entry(&id))?
            .ok_or_else(|| CoreError::NotFound(format!("errorbook entry not found: {key}")))
    }

    fn find_by_fingerprint(&self, fp: &str) -> Result<Option<Entry>> {
        match store::read_json::<Entry>(&self.layout.errorbook_entry(&format!("eb-{fp}")))? {
            Some(entry) => Ok(Some(entry)),
            None => Ok(None),
        }
    }

    /// Entry summaries from the index, optionally filtered.
    pub fn list(
        &self,
        status: Option<EntryStatus>,
        tag: Option<&str>,
    ) -> Result<Vec<EntrySummary>> {
        let index = self.load_index()?;
        Ok(index
            .entries
            .into_iter()
            .filter(|s| status.is_none_or(|want| s.status == want))
            .filter(|s| tag.is_none_or(|want| s.tags.iter().any(|t| t == want)))
            .collect())
    }

    /// Load the index, rebuilding from entries when missing or corrupt.
    pub fn load_index(&self) -> Result<ErrorbookIndex> {
        match store::read_json::<ErrorbookIndex>(&self.layout.errorbook_index()) {
            Ok(Some(index)) => Ok(index),
            Ok(None) | Err(CoreError::Corruption(_)) => self.rebuild_index(),
            Err(e) => Err(e),
        }
    }

    /// Rebuild the index from the entry files and persist it.
    pub fn rebuild_index(&self) -> Result<ErrorbookIndex> {
        let entries = self.load_all_entries()?;
        let index = ErrorbookIndex {
            api_version: INDEX_VERSION.to_string(),
            updated_at: self.clock.now(),
            entries: entries.iter().map(EntrySummary::of).collect(),
        };
        store::write_json(&self.layout.errorbook_index(), &index)?;
        Ok(index)
    }

    /// Every entry on disk, sorted by updated_at descending.
    pub fn load_all_entries(&self) -> Result<Vec<Entry>> {
        let dir = self.layout.errorbook_entries_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries: Vec<Entry> = Vec::new();
        let read = fs::read_dir(&dir)
            .map_err(|e| CoreError::io(format!("failed to list {}", dir.display()), e))?;
        for item in read {
            let item =
                item.map_err(|e| CoreError::io(format!("failed to list {}", dir.display()), e))?;
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let entry = store::read_json::<Entry>(&path)?.ok_or_else(|| {
                CoreError::Corruption(format!("entry vanished during scan: {}", path.display()))
            })?;
            entries.push(entry);
        }
        entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        Ok(entries)
    }

    /// Evaluate the release gate.
    pub fn release_gate(&self, min_risk: RiskLevel, include_verified: bool) -> Result<ReleaseGateReport> {
        let entries = self.load_all_entries()?;
        let now = self.clock.now();

        let mut risk_blocked: Vec<GateBlocker> = Vec::new();
        let mut mitigation_blocked: Vec<GateBlocker> = Vec::new();

        for entry in &entries {
            let risk = risk_of(entry);
            let violations = entry
                .temporary_mitigation
                .as_ref()
                .map(|m| m.violations(now))
                .unwrap_or_default();

            let unresolved = entry.status == EntryStatus::Candidate
                || (include_verified && entry.status == EntryStatus::Verified);
            if unresolved && risk >= min_risk {
                risk_blocked.push(blocker(entry, risk, violations.clone()));
            }
            if !violations.is_empty() {
                mitigation_blocked.push(blocker(entry, risk, violations));
            }
        }

        sort_blockers(&mut risk_blocked);
        sort_blockers(&mut mitigation_blocked);

        let blocked_count = risk_blocked.len() + mitigation_blocked.len();
        Ok(ReleaseGateReport {
            passed: blocked_count == 0,
            min_risk,
            include_verified,
            evaluated: entries.len(),
            blocked_count,
            risk_blocked,
            mitigation_blocked,
        })
    }

    /// Write the sharable registry export.
    pub fn export(&self) -> Result<RegistryExport> {
        let export = RegistryExport {
            api_version: EXPORT_VERSION.to_string(),
            generated_at: self.clock.now(),
            entries: self.load_all_entries()?,
        };
        store::write_json(&self.layout.registry_export(), &export)?;
        Ok(export)
    }

    fn touch_and_persist(&self, mut entry: Entry) -> Result<Entry> {
        entry.updated_at = self.clock.now();
        entry.quality_score = quality_score(&entry);
        self.persist(&entry)?;
        Ok(entry)
    }

    /// Write the entry, then refresh the index atomically.
    fn persist(&self, entry: &Entry) -> Result<()> {
        store::write_json(&self.layout.errorbook_entry(&entry.id), entry)?;
        self.rebuild_index()?;
        Ok(())
    }
}

fn blocker(entry: &Entry, risk: RiskLevel, violations: Vec<String>) -> GateBlocker {
    GateBlocker {
        id: entry.id.clone(),
        fingerprint: entry.fingerprint.clone(),
        title: entry.title.clone(),
        status: entry.status,
        risk,
        quality_score: entry.quality_score,
        has_active_mitigation: entry.active_mitigation().is_some(),
        policy_violations: violations,
        updated_at: entry.updated_at,
    }
}

/// Blocker ordering: mitigation-present desc, risk desc, quality desc,
/// updated_at desc.
fn sort_blockers(blockers: &mut [GateBlocker]) {
    blockers.sort_by(|a, b| {
        b.has_active_mitigation
            .cmp(&a.has_active_mitigation)
            .then(b.risk.cmp(&a.risk))
            .then(b.quality_score.cmp(&a.quality_score))
            .then(b.updated_at.cmp(&a.updated_at))
    });
}

/// Boundary normalization: trim, drop empties, dedupe, default tag.
fn normalize(mut input: RecordInput) -> Result<RecordInput> {
    input.title = input.title.trim().to_string();
    input.symptom = input.symptom.trim().to_string();
    input.root_cause = input.root_cause.trim().to_string();
    input.source = input.source.trim().to_string();
    if input.title.is_empty() {
        return Err(CoreError::InputValidation("title is required".to_string()));
    }
    if input.symptom.is_empty() {
        return Err(CoreError::InputValidation(
            "symptom is required".to_string(),
        ));
    }

    input.fix_actions = dedup_trimmed(input.fix_actions);
    input.verification_evidence = dedup_trimmed(input.verification_evidence);
    input.tags = dedup_trimmed(input.tags);
    if input.tags.is_empty() {
        input.tags.push(DEFAULT_TAG.to_string());
    }
    let ontology: BTreeSet<OntologyTag> = input.ontology_tags.into_iter().collect();
    input.ontology_tags = ontology.into_iter().collect();
    if input.source.is_empty() {
        input.source = "manual".to_string();
    }
    Ok(input)
}

fn dedup_trimmed(items: Vec<String>) -> Vec<String> {
    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut out = Vec::new();
    for item in items {
        let item = item.trim().to_string();
        if item.is_empty() {
            continue;
        }
        if seen.insert(item.clone()) {
            out.push(item);
        }
    }
    out
}

/// Merge a normalized record into an existing entry: union the lists, pick
/// the higher status, keep the richer free-text fields.
fn merge_into(existing: &mut Entry, input: &RecordInput, incoming_status: EntryStatus) {
    union_into(&mut existing.fix_actions, &input.fix_actions);
    union_into(&mut existing.verification_evidence, &input.verification_evidence);
    union_into(&mut existing.tags, &input.tags);
    for tag in &input.ontology_tags {
        if !existing.ontology_tags.contains(tag) {
            existing.ontology_tags.push(*tag);
        }
    }
    existing.ontology_tags.sort();
    if incoming_status.rank() > existing.status.rank() {
        existing.status = incoming_status;
    }
    if existing.root_cause.trim().is_empty() && !input.root_cause.is_empty() {
        existing.root_cause = input.root_cause.clone();
    }
    if existing.temporary_mitigation.is_none() {
        existing.temporary_mitigation = input.temporary_mitigation.clone();
    }
}

fn union_into(existing: &mut Vec<String>, incoming: &[String]) {
    for item in incoming {
        if !existing.iter().any(|e| e == item) {
            existing.push(item.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;
    use tempfile::tempdir;

    use super::*;
    use crate::clock::ManualClock;

    fn book(dir: &std::path::Path) -> (Errorbook, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 4, 1, 8, 0, 0).unwrap(),
        ));
        let shared: SharedClock = clock.clone();
        (
            Errorbook::new(Layout::with_default_ns(dir), shared),
            clock,
        )
    }

    fn hash_mismatch_input() -> RecordInput {
        RecordInput {
            title: "Hash mismatch".into(),
            symptom: "sha256 differs".into(),
            root_cause: "partial write".into(),
            fix_actions: vec!["retry".into(), "fsync".into()],
            ..Default::default()
        }
    }

    #[test]
    fn fingerprint_is_case_insensitive_and_16_hex() {
        let a = fingerprint("Hash mismatch", "SHA256 differs", "Partial Write");
        let b = fingerprint("hash mismatch", "sha256 differs", "partial write");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        // Pinned vector: byte-identical across runs and platforms.
        assert_eq!(a, "753a775ad229db5f");
    }

    #[test]
    fn record_twice_merges_into_one_entry_with_quality_73() {
        let td = tempdir().expect("tempdir");
        let (book, _) = book(td.path());

        let first = book.record(hash_mismatch_input()).expect("record");
        assert!(!first.merged);
        assert_eq!(first.entry.status, EntryStatus::Candidate);
        assert_eq!(first.entry.occurrences, 1);
        assert_eq!(first.entry.quality_score, 73);

        let second = book.record(hash_mismatch_input()).expect("record again");
        assert!(second.merged);
        assert_eq!(second.entry.occurrences, 2);
        assert_eq!(second.entry.quality_score, 73);
        assert_eq!(second.entry.fingerprint, first.entry.fingerprint);

        // No duplicate fingerprints in the index.
        let index = book.load_index().expect("index");
        assert_eq!(index.entries.len(), 1);
    }

    #[test]
    fn promote_requires_verification_and_succeeds_at_quality_98() {
        let td = tempdir().expect("tempdir");
        let (book, _) = book(td.path());

        let recorded = book.record(hash_mismatch_input()).expect("record");
        let err = book.promote(&recorded.entry.id).expect_err("not promotable");
        assert_eq!(err.machine_name(), "precondition-violation");
        assert!(err.to_string().contains("verification_evidence"));

        let enriched = book
            .record(RecordInput {
                verification_evidence: vec!["unit-test#42".into()],
                ontology_tags: vec![OntologyTag::ExecutionFlow],
                ..hash_mismatch_input()
            })
            .expect("merge");
        assert_eq!(enriched.entry.quality_score, 98);

        let promoted = book.promote(&enriched.entry.id).expect("promote");
        assert_eq!(promoted.status, EntryStatus::Promoted);
    }

    #[test]
    fn record_rejects_promoted_status() {
        let td = tempdir().expect("tempdir");
        let (book, _) = book(td.path());

        let err = book
            .record(RecordInput {
                status: Some(EntryStatus::Promoted),
                ..hash_mismatch_input()
            })
            .expect_err("must reject");
        assert_eq!(err.machine_name(), "precondition-violation");
    }

    #[test]
    fn merge_never_demotes_a_promoted_entry() {
        let td = tempdir().expect("tempdir");
        let (book, _) = book(td.path());

        let entry = book
            .record(RecordInput {
                verification_evidence: vec!["unit-test#42".into()],
                ontology_tags: vec![OntologyTag::ExecutionFlow],
                ..hash_mismatch_input()
            })
            .expect("record");
        book.promote(&entry.entry.id).expect("promote");

        let merged = book.record(hash_mismatch_input()).expect("merge");
        assert_eq!(merged.entry.status, EntryStatus::Promoted);
        assert_eq!(merged.entry.occurrences, 2);
    }

    #[test]
    fn security_tagged_candidate_is_high_risk_and_blocks() {
        let td = tempdir().expect("tempdir");
        let (book, _) = book(td.path());

        let entry = book
            .record(RecordInput {
                title: "Token echoed to logs".into(),
                symptom: "bearer token visible in trace output".into(),
                tags: vec!["security".into()],
                ..Default::default()
            })
            .expect("record");
        assert_eq!(risk_of(&entry.entry), RiskLevel::High);

        let report = book
            .release_gate(RiskLevel::High, false)
            .expect("gate");
        assert!(!report.passed);
        assert_eq!(report.blocked_count, 1);
        assert_eq!(report.risk_blocked.len(), 1);
    }

    #[test]
    fn missing_mitigation_deadline_blocks_regardless_of_risk() {
        let td = tempdir().expect("tempdir");
        let (book, _) = book(td.path());

        let entry = book
            .record(RecordInput {
                title: "Feature flag workaround".into(),
                symptom: "slow path forced on".into(),
                temporary_mitigation: Some(TemporaryMitigation {
                    enabled: true,
                    exit_criteria: "remove flag".into(),
                    cleanup_task: "#123".into(),
                    deadline_at: "".into(),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .expect("record");
        assert_eq!(risk_of(&entry.entry), RiskLevel::Medium);

        let report = book.release_gate(RiskLevel::High, false).expect("gate");
        assert!(!report.passed);
        assert_eq!(report.mitigation_blocked.len(), 1);
        assert_eq!(
            report.mitigation_blocked[0].policy_violations,
            vec!["temporary_mitigation.deadline_at"]
        );
    }

    #[test]
    fn expired_mitigation_deadline_blocks() {
        let td = tempdir().expect("tempdir");
        let (book, clock) = book(td.path());

        book.record(RecordInput {
            title: "Cache bypass".into(),
            symptom: "cold reads on every request".into(),
            temporary_mitigation: Some(TemporaryMitigation {
                enabled: true,
                exit_criteria: "restore cache".into(),
                cleanup_task: "#77".into(),
                deadline_at: "2025-04-02T00:00:00Z".into(),
                ..Default::default()
            }),
            ..Default::default()
        })
        .expect("record");

        // Before the deadline the mitigation is compliant.
        let report = book.release_gate(RiskLevel::High, false).expect("gate");
        assert!(report.mitigation_blocked.is_empty());

        clock.advance_ms(2 * 24 * 3_600_000);
        let report = book.release_gate(RiskLevel::High, false).expect("gate");
        assert_eq!(report.mitigation_blocked.len(), 1);
    }

    #[test]
    fn promote_resolves_active_mitigation() {
        let td = tempdir().expect("tempdir");
        let (book, _) = book(td.path());

        let entry = book
            .record(RecordInput {
                verification_evidence: vec!["unit-test#42".into()],
                ontology_tags: vec![OntologyTag::ExecutionFlow],
                temporary_mitigation: Some(TemporaryMitigation {
                    enabled: true,
                    exit_criteria: "fsync everywhere".into(),
                    cleanup_task: "#9".into(),
                    deadline_at: "2099-01-01T00:00:00Z".into(),
                    ..Default::default()
                }),
                ..hash_mismatch_input()
            })
            .expect("record");

        let promoted = book.promote(&entry.entry.id).expect("promote");
        let mitigation = promoted.temporary_mitigation.expect("mitigation kept");
        assert!(mitigation.resolved);
        assert!(mitigation.resolved_at.is_some());
    }

    #[test]
    fn release_gate_is_monotone_in_min_risk() {
        let td = tempdir().expect("tempdir");
        let (book, _) = book(td.path());

        book.record(RecordInput {
            title: "Payment double-charge".into(),
            symptom: "duplicate transactions on retry".into(),
            tags: vec!["payment".into()],
            ..Default::default()
        })
        .expect("record high");
        book.record(RecordInput {
            title: "Typo in banner".into(),
            symptom: "misspelled product name".into(),
            ..Default::default()
        })
        .expect("record medium");

        let low = book.release_gate(RiskLevel::Low, false).expect("gate");
        let medium = book.release_gate(RiskLevel::Medium, false).expect("gate");
        let high = book.release_gate(RiskLevel::High, false).expect("gate");
        assert!(low.risk_blocked.len() >= medium.risk_blocked.len());
        assert!(medium.risk_blocked.len() >= high.risk_blocked.len());
        assert_eq!(high.risk_blocked.len(), 1);
        assert_eq!(medium.risk_blocked.len(), 2);
    }

    #[test]
    fn verified_entries_block_only_when_included() {
        let td = tempdir().expect("tempdir");
        let (book, _) = book(td.path());

        let entry = book
            .record(RecordInput {
                title: "Order totals drift".into(),
                symptom: "totals disagree between services and ledger".into(),
                root_cause: "floating point accumulation across service boundaries".into(),
                fix_actions: vec!["use integer cents".into()],
                verification_evidence: vec!["ledger replay".into()],
                status: Some(EntryStatus::Verified),
                tags: vec!["integrity".into()],
                ..Default::default()
            })
            .expect("record");
        assert_eq!(entry.entry.status, EntryStatus::Verified);

        let excluded = book.release_gate(RiskLevel::Medium, false).expect("gate");
        assert!(excluded.passed);

        let included = book.release_gate(RiskLevel::Medium, true).expect("gate");
        assert!(!included.passed);
        assert_eq!(included.risk_blocked.len(), 1);
    }

    #[test]
    fn requalify_rules() {
        let td = tempdir().expect("tempdir");
        let (book, _) = book(td.path());

        let entry = book.record(hash_mismatch_input()).expect("record");
        let deprecated = book.deprecate(&entry.entry.id).expect("deprecate");
        assert_eq!(deprecated.status, EntryStatus::Deprecated);

        // Back to candidate is always allowed.
        let back = book
            .requalify(&entry.entry.id, EntryStatus::Candidate)
            .expect("requalify");
        assert_eq!(back.status, EntryStatus::Candidate);

        // Verified needs evidence.
        let err = book
            .requalify(&entry.entry.id, EntryStatus::Verified)
            .expect_err("no evidence");
        assert_eq!(err.machine_name(), "precondition-violation");

        // Promoted/deprecated are never requalify targets.
        let err = book
            .requalify(&entry.entry.id, EntryStatus::Promoted)
            .expect_err("bad target");
        assert_eq!(err.machine_name(), "input-validation");
    }

    #[test]
    fn deprecate_rejects_promoted() {
        let td = tempdir().expect("tempdir");
        let (book, _) = book(td.path());

        let entry = book
            .record(RecordInput {
                verification_evidence: vec!["unit-test#42".into()],
                ontology_tags: vec![OntologyTag::ExecutionFlow],
                ..hash_mismatch_input()
            })
            .expect("record");
        book.promote(&entry.entry.id).expect("promote");

        let err = book.deprecate(&entry.entry.id).expect_err("must reject");
        assert_eq!(err.machine_name(), "precondition-violation");
    }

    #[test]
    fn corrupt_index_is_rebuilt_from_entries() {
        let td = tempdir().expect("tempdir");
        let (book, _) = book(td.path());

        book.record(hash_mismatch_input()).expect("record");
        std::fs::write(book.layout.errorbook_index(), "{broken").expect("corrupt");

        let index = book.load_index().expect("rebuilt");
        assert_eq!(index.entries.len(), 1);
        assert_eq!(index.api_version, INDEX_VERSION);
    }

    #[test]
    fn export_writes_sharable_snapshot() {
        let td = tempdir().expect("tempdir");
        let (book, _) = book(td.path());

        book.record(hash_mismatch_input()).expect("record");
        let export = book.export().expect("export");
        assert_eq!(export.entries.len(), 1);
        assert!(book.layout.registry_export().exists());
    }

    #[test]
    fn blocker_sort_puts_mitigated_then_high_risk_first() {
        let now = Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap();
        let mk = |id: &str, risk: RiskLevel, quality: u8, mitigated: bool| GateBlocker {
            id: id.into(),
            fingerprint: "f".into(),
            title: id.into(),
            status: EntryStatus::Candidate,
            risk,
            quality_score: quality,
            has_active_mitigation: mitigated,
            policy_violations: Vec::new(),
            updated_at: now,
        };

        let mut blockers = vec![
            mk("low-q", RiskLevel::Medium, 10, false),
            mk("high", RiskLevel::High, 50, false),
            mk("mitigated", RiskLevel::Medium, 5, true),
            mk("high-q", RiskLevel::Medium, 90, false),
        ];
        sort_blockers(&mut blockers);
        let ids: Vec<&str> = blockers.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["mitigated", "high", "high-q", "low-q"]);
    }

    mod proptests {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            // Equal lowercased triples produce byte-identical fingerprints.
            #[test]
            fn fingerprint_stability(
                title in "[A-Za-z0-9 ]{1,40}",
                symptom in "[A-Za-z0-9 ]{1,40}",
                root in "[A-Za-z0-9 ]{0,40}",
            ) {
                let a = fingerprint(&title, &symptom, &root);
                let b = fingerprint(&title.to_uppercase(), &symptom.to_lowercase(), &root);
                prop_assert_eq!(a.clone(), b);
                prop_assert_eq!(a.len(), 16);
            }

            // Quality never leaves [0, 100] and is deterministic.
            #[test]
            fn quality_bounds(
                fixes in prop::collection::vec("[a-z]{1,10}", 0..4),
                evidence in prop::collection::vec("[a-z]{1,10}", 0..4),
                tags in prop::collection::vec("[a-z]{1,10}", 0..4),
                symptom in "[a-z ]{0,60}",
                root in "[a-z ]{0,60}",
            ) {
                let now = chrono::Utc::now();
                let mut entry = Entry {
                    id: "eb-x".into(),
                    fingerprint: "abcd".into(),
                    title: "t".into(),
                    symptom,
                    root_cause: root,
                    fix_actions: fixes,
                    verification_evidence: evidence,
                    tags,
                    ontology_tags: vec![],
                    status: EntryStatus::Candidate,
                    quality_score: 0,
                    occurrences: 1,
                    source: "manual".into(),
                    temporary_mitigation: None,
                    created_at: now,
                    updated_at: now,
                };
                let first = quality_score(&entry);
                prop_assert!(first <= 100);
                entry.quality_score = first;
                prop_assert_eq!(first, quality_score(&entry));
            }
        }
    }
}
