//! Studio job state machine.
//!
//! A job walks the fixed stage order plan → generate → apply → verify →
//! release, with rollback available once apply has completed. Verify and
//! release run declared gate steps; failing required steps auto-record
//! errorbook candidates, and release additionally consults the errorbook
//! release gate. Privileged transitions are password-gated by policy.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::clock::SharedClock;
use crate::config::{self, PrivilegedStage};
use crate::error::{CoreError, Result};
use crate::errorbook::{Errorbook, RecordInput, RiskLevel};
use crate::gate::{self, GateRunReport, GateStep, GateStepResult, GateStepStatus};
use crate::layout::Layout;
use crate::process::SharedRunner;
use crate::store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Planned,
    Generated,
    Applied,
    Verified,
    Released,
    VerifyFailed,
    ReleaseFailed,
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Plan,
    Generate,
    Apply,
    Verify,
    Release,
}

pub const JOB_STAGES: [JobStage; 5] = [
    JobStage::Plan,
    JobStage::Generate,
    JobStage::Apply,
    JobStage::Verify,
    JobStage::Release,
];

impl JobStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStage::Plan => "plan",
            JobStage::Generate => "generate",
            JobStage::Apply => "apply",
            JobStage::Verify => "verify",
            JobStage::Release => "release",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEntry {
    pub status: StageState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl StageEntry {
    fn pending() -> Self {
        Self {
            status: StageState::Pending,
            completed_at: None,
            metadata: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobArtifacts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_bundle_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_report_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_report_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackInfo {
    pub reason: String,
    pub rolled_back_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub status: JobStatus,
    pub stages: BTreeMap<JobStage, StageEntry>,
    pub artifacts: JobArtifacts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn stage(&self, stage: JobStage) -> &StageEntry {
        self.stages.get(&stage).expect("all stages initialized")
    }

    fn stage_completed(&self, stage: JobStage) -> bool {
        self.stage(stage).status == StageState::Completed
    }

    /// Canonical first-pending-stage projection: the next command token for
    /// the caller to display or consume.
    pub fn next_action(&self) -> &'static str {
        if self.status == JobStatus::RolledBack {
            return "plan";
        }
        JOB_STAGES
            .into_iter()
            .find(|s| !self.stage_completed(*s))
            .map(|s| s.as_str())
            .unwrap_or("done")
    }
}

/// Append-only per-job event record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudioEvent {
    pub event_id: String,
    pub job_id: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyProfile {
    Fast,
    Standard,
    Strict,
}

impl VerifyProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerifyProfile::Fast => "fast",
            VerifyProfile::Standard => "standard",
            VerifyProfile::Strict => "strict",
        }
    }

    pub fn strict(&self) -> bool {
        matches!(self, VerifyProfile::Strict)
    }
}

impl std::str::FromStr for VerifyProfile {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "fast" => Ok(Self::Fast),
            "standard" => Ok(Self::Standard),
            "strict" => Ok(Self::Strict),
            other => Err(format!("unknown verify profile: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseProfile {
    Standard,
    Strict,
}

impl ReleaseProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseProfile::Standard => "standard",
            ReleaseProfile::Strict => "strict",
        }
    }

    pub fn strict(&self) -> bool {
        matches!(self, ReleaseProfile::Strict)
    }
}

impl std::str::FromStr for ReleaseProfile {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "standard" => Ok(Self::Standard),
            "strict" => Ok(Self::Strict),
            other => Err(format!("unknown release profile: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseChannel {
    Dev,
    Prod,
}

impl ReleaseChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseChannel::Dev => "dev",
            ReleaseChannel::Prod => "prod",
        }
    }
}

impl std::str::FromStr for ReleaseChannel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "dev" => Ok(Self::Dev),
            "prod" => Ok(Self::Prod),
            other => Err(format!("unknown release channel: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentFingerprint {
    pub core_version: String,
    pub os: String,
    pub arch: String,
}

impl EnvironmentFingerprint {
    fn collect() -> Self {
        Self {
            core_version: env!("CARGO_PKG_VERSION").to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyReport {
    pub job_id: String,
    pub profile: VerifyProfile,
    pub passed: bool,
    pub strict: bool,
    pub steps: Vec<GateStepResult>,
    pub environment: EnvironmentFingerprint,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseReport {
    pub job_id: String,
    pub channel: ReleaseChannel,
    pub profile: ReleaseProfile,
    pub passed: bool,
    pub strict: bool,
    pub release_ref: Option<String>,
    pub steps: Vec<GateStepResult>,
    pub errorbook_blockers: Vec<String>,
    pub environment: EnvironmentFingerprint,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub from_chat: String,
    pub goal: Option<String>,
    pub target: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub job_id: String,
    pub scene_id: String,
    pub target: Option<String>,
    pub patch_bundle: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ApplyRequest {
    pub job_id: String,
    pub patch_bundle: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VerifyRequest {
    pub job_id: String,
    pub profile: VerifyProfile,
    pub steps: Vec<GateStep>,
}

#[derive(Debug, Clone)]
pub struct ReleaseRequest {
    pub job_id: String,
    pub channel: ReleaseChannel,
    pub profile: ReleaseProfile,
    pub release_ref: Option<String>,
    pub steps: Vec<GateStep>,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RollbackRequest {
    pub job_id: String,
    pub reason: String,
    pub password: Option<String>,
}

#[derive(Debug)]
pub struct VerifyOutcome {
    pub job: Job,
    pub report: VerifyReport,
    /// Errorbook entry ids auto-recorded for failing required steps.
    pub recorded_entries: Vec<String>,
}

#[derive(Debug)]
pub struct ReleaseOutcome {
    pub job: Job,
    pub report: ReleaseReport,
    pub recorded_entries: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LatestJobPointer {
    job_id: String,
    updated_at: DateTime<Utc>,
}

pub struct StudioEngine {
    layout: Layout,
    clock: SharedClock,
    runner: SharedRunner,
}

impl StudioEngine {
    pub fn new(layout: Layout, clock: SharedClock, runner: SharedRunner) -> Self {
        Self {
            layout,
            clock,
            runner,
        }
    }

    fn errorbook(&self) -> Errorbook {
        Errorbook::new(self.layout.clone(), self.clock.clone())
    }

    /// Create a new job from a chat handle; always legal.
    pub fn plan(&self, request: &PlanRequest) -> Result<Job> {
        if request.from_chat.trim().is_empty() {
            return Err(CoreError::InputValidation(
                "from_chat is required".to_string(),
            ));
        }
        let now = self.clock.now();
        let job_id = new_job_id(&request.from_chat, now);

        let mut stages: BTreeMap<JobStage, StageEntry> = JOB_STAGES
            .into_iter()
            .map(|s| (s, StageEntry::pending()))
            .collect();
        let plan_entry = stages.get_mut(&JobStage::Plan).expect("plan stage");
        plan_entry.status = StageState::Completed;
        plan_entry.completed_at = Some(now);
        plan_entry.metadata = stage_metadata(&[
            ("from_chat", Some(request.from_chat.as_str())),
            ("goal", request.goal.as_deref()),
            ("target", request.target.as_deref()),
        ]);

        let job = Job {
            job_id: job_id.clone(),
            status: JobStatus::Planned,
            stages,
            artifacts: JobArtifacts::default(),
            rollback: None,
            created_at: now,
            updated_at: now,
        };
        self.save(&job)?;
        self.append_event(
            &job_id,
            "stage.plan.completed",
            serde_json::json!({
                "from_chat": request.from_chat,
                "goal": request.goal,
                "target": request.target,
            }),
        )?;
        Ok(job)
    }

    pub fn generate(&self, request: &GenerateRequest) -> Result<Job> {
        if request.scene_id.trim().is_empty() {
            return Err(CoreError::InputValidation(
                "scene_id is required".to_string(),
            ));
        }
        let mut job = self.load(&request.job_id)?;
        self.require_not_rolled_back(&job)?;
        self.require_completed(&job, JobStage::Plan, "generate")?;

        let now = self.clock.now();
        let bundle = request
            .patch_bundle
            .clone()
            .unwrap_or_else(|| format!("patch-{}", now.format("%Y%m%dT%H%M%S")));
        job.artifacts.patch_bundle_id = Some(bundle.clone());
        self.complete_stage(
            &mut job,
            JobStage::Generate,
            JobStatus::Generated,
            stage_metadata(&[
                ("scene_id", Some(request.scene_id.as_str())),
                ("target", request.target.as_deref()),
                ("patch_bundle_id", Some(bundle.as_str())),
            ]),
        )?;
        self.append_event(
            &job.job_id,
            "stage.generate.completed",
            serde_json::json!({ "scene_id": request.scene_id, "patch_bundle_id": bundle }),
        )?;
        Ok(job)
    }

    pub fn apply(&self, request: &ApplyRequest) -> Result<Job> {
        let mut job = self.load(&request.job_id)?;
        self.require_not_rolled_back(&job)?;
        self.require_completed(&job, JobStage::Generate, "apply")?;
        self.authorize(&job, PrivilegedStage::Apply, request.password.as_deref())?;

        if let Some(bundle) = &request.patch_bundle {
            job.artifacts.patch_bundle_id = Some(bundle.clone());
        }
        let bundle = job
            .artifacts
            .patch_bundle_id
            .clone()
            .unwrap_or_default();
        self.complete_stage(
            &mut job,
            JobStage::Apply,
            JobStatus::Applied,
            stage_metadata(&[("patch_bundle_id", Some(bundle.as_str()))]),
        )?;
        self.append_event(
            &job.job_id,
            "stage.apply.completed",
            serde_json::json!({ "patch_bundle_id": bundle }),
        )?;
        Ok(job)
    }

    pub fn verify(&self, request: &VerifyRequest) -> Result<VerifyOutcome> {
        let mut job = self.load(&request.job_id)?;
        self.require_not_rolled_back(&job)?;
        self.require_completed(&job, JobStage::Apply, "verify")?;

        let strict = request.profile.strict();
        let gate_report = gate::run_steps(
            &request.steps,
            strict,
            self.layout.workspace_root(),
            &self.runner,
            &self.clock,
        );

        let report = VerifyReport {
            job_id: job.job_id.clone(),
            profile: request.profile,
            passed: gate_report.passed,
            strict,
            steps: gate_report.steps.clone(),
            environment: EnvironmentFingerprint::collect(),
            generated_at: self.clock.now(),
        };
        let report_path = self.layout.verify_report(&job.job_id);
        store::write_json(&report_path, &report)?;
        job.artifacts.verify_report_path = Some(report_path.display().to_string());

        if gate_report.passed {
            self.complete_stage(
                &mut job,
                JobStage::Verify,
                JobStatus::Verified,
                stage_metadata(&[("profile", Some(request.profile.as_str()))]),
            )?;
            self.append_event(
                &job.job_id,
                "stage.verify.completed",
                serde_json::json!({ "profile": request.profile.as_str() }),
            )?;
            return Ok(VerifyOutcome {
                job,
                report,
                recorded_entries: Vec::new(),
            });
        }

        let recorded = self.record_gate_failures(
            &job.job_id,
            JobStage::Verify,
            request.profile.as_str(),
            &gate_report,
        )?;
        self.fail_stage(&mut job, JobStage::Verify, JobStatus::VerifyFailed)?;
        self.append_event(
            &job.job_id,
            "stage.verify.failed",
            serde_json::json!({
                "profile": request.profile.as_str(),
                "failing_steps": failing_ids(&gate_report),
                "errorbook_entries": recorded,
            }),
        )?;
        Ok(VerifyOutcome {
            job,
            report,
            recorded_entries: recorded,
        })
    }

    pub fn release(&self, request: &ReleaseRequest) -> Result<ReleaseOutcome> {
        let mut job = self.load(&request.job_id)?;
        self.require_not_rolled_back(&job)?;
        self.require_completed(&job, JobStage::Verify, "release")?;
        self.authorize(&job, PrivilegedStage::Release, request.password.as_deref())?;

        // The errorbook gate blocks before any step runs.
        let errorbook_gate = self.errorbook().release_gate(RiskLevel::High, false)?;
        if !errorbook_gate.passed {
            let blockers: Vec<String> = errorbook_gate
                .risk_blocked
                .iter()
                .chain(errorbook_gate.mitigation_blocked.iter())
                .map(|b| format!("{} ({})", b.id, b.title))
                .collect();
            return Err(CoreError::gate_block(
                "errorbook release gate blocked",
                blockers,
            ));
        }

        let strict = request.profile.strict();
        let gate_report = gate::run_steps(
            &request.steps,
            strict,
            self.layout.workspace_root(),
            &self.runner,
            &self.clock,
        );

        let release_ref = request
            .release_ref
            .clone()
            .unwrap_or_else(|| format!("release-{}", self.clock.now().format("%Y%m%dT%H%M%S")));
        let report = ReleaseReport {
            job_id: job.job_id.clone(),
            channel: request.channel,
            profile: request.profile,
            passed: gate_report.passed,
            strict,
            release_ref: Some(release_ref.clone()),
            steps: gate_report.steps.clone(),
            errorbook_blockers: Vec::new(),
            environment: EnvironmentFingerprint::collect(),
            generated_at: self.clock.now(),
        };
        let report_path = self.layout.release_report(&job.job_id);
        store::write_json(&report_path, &report)?;
        job.artifacts.release_report_path = Some(report_path.display().to_string());

        if gate_report.passed {
            job.artifacts.release_ref = Some(release_ref.clone());
            self.complete_stage(
                &mut job,
                JobStage::Release,
                JobStatus::Released,
                stage_metadata(&[
                    ("channel", Some(request.channel.as_str())),
                    ("profile", Some(request.profile.as_str())),
                    ("release_ref", Some(release_ref.as_str())),
                ]),
            )?;
            self.append_event(
                &job.job_id,
                "stage.release.completed",
                serde_json::json!({
                    "channel": request.channel.as_str(),
                    "release_ref": release_ref,
                }),
            )?;
            return Ok(ReleaseOutcome {
                job,
                report,
                recorded_entries: Vec::new(),
            });
        }

        let recorded = self.record_gate_failures(
            &job.job_id,
            JobStage::Release,
            request.profile.as_str(),
            &gate_report,
        )?;
        self.fail_stage(&mut job, JobStage::Release, JobStatus::ReleaseFailed)?;
        self.append_event(
            &job.job_id,
            "stage.release.failed",
            serde_json::json!({
                "channel": request.channel.as_str(),
                "profile": request.profile.as_str(),
                "failing_steps": failing_ids(&gate_report),
                "errorbook_entries": recorded,
            }),
        )?;
        Ok(ReleaseOutcome {
            job,
            report,
            recorded_entries: recorded,
        })
    }

    pub fn rollback(&self, request: &RollbackRequest) -> Result<Job> {
        if request.reason.trim().is_empty() {
            return Err(CoreError::InputValidation(
                "rollback reason is required".to_string(),
            ));
        }
        let mut job = self.load(&request.job_id)?;
        self.require_not_rolled_back(&job)?;
        if !job.stage_completed(JobStage::Apply) {
            return Err(CoreError::PreconditionViolation(
                "rollback requires a completed apply stage".to_string(),
            ));
        }
        self.authorize(&job, PrivilegedStage::Rollback, request.password.as_deref())?;

        let now = self.clock.now();
        job.status = JobStatus::RolledBack;
        job.rollback = Some(RollbackInfo {
            reason: request.reason.clone(),
            rolled_back_at: now,
        });
        job.updated_at = now;
        self.save(&job)?;
        self.append_event(
            &job.job_id,
            "job.rolled_back",
            serde_json::json!({ "reason": request.reason }),
        )?;
        Ok(job)
    }

    pub fn load(&self, job_id: &str) -> Result<Job> {
        store::read_json::<Job>(&self.layout.studio_job(job_id))?
            .ok_or_else(|| CoreError::NotFound(format!("unknown job: {job_id}")))
    }

    /// Resolve the most recent job through the latest-job pointer.
    pub fn latest(&self) -> Result<Job> {
        let pointer = store::read_json::<LatestJobPointer>(&self.layout.latest_job())?
            .ok_or_else(|| CoreError::NotFound("no studio job recorded yet".to_string()))?;
        self.load(&pointer.job_id)
    }

    pub fn events(&self, job_id: &str, tail: Option<usize>) -> Result<Vec<StudioEvent>> {
        store::read_jsonl(&self.layout.studio_events(job_id), tail)
    }

    fn require_completed(&self, job: &Job, stage: JobStage, operation: &str) -> Result<()> {
        if !job.stage_completed(stage) {
            return Err(CoreError::PreconditionViolation(format!(
                "{operation} requires the {} stage to be completed (job {} is {})",
                stage.as_str(),
                job.job_id,
                job.next_action()
            )));
        }
        Ok(())
    }

    fn require_not_rolled_back(&self, job: &Job) -> Result<()> {
        if job.status == JobStatus::RolledBack {
            return Err(CoreError::PreconditionViolation(format!(
                "job {} is rolled back; start a new plan",
                job.job_id
            )));
        }
        Ok(())
    }

    /// Enforce the security policy for a privileged transition. A failed
    /// check appends a `stage.<name>.failed` event with
    /// `reason="authorization_failure"` and mutates nothing else.
    fn authorize(&self, job: &Job, stage: PrivilegedStage, password: Option<&str>) -> Result<()> {
        let policy = config::load_studio_security(&self.layout)?.value;
        let forced = std::env::var(config::AUTH_FORCE_ENV)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let enabled = policy.enabled || forced;
        if !enabled || !policy.require_auth_for.contains(&stage) {
            return Ok(());
        }

        let stage_name = match stage {
            PrivilegedStage::Apply => "apply",
            PrivilegedStage::Release => "release",
            PrivilegedStage::Rollback => "rollback",
        };
        let expected = std::env::var(&policy.password_env).unwrap_or_default();
        let provided = password.unwrap_or_default();
        if expected.is_empty() || provided.as_bytes() != expected.as_bytes() {
            self.append_event(
                &job.job_id,
                &format!("stage.{stage_name}.failed"),
                serde_json::json!({ "reason": "authorization_failure" }),
            )?;
            return Err(CoreError::AuthorizationFailure(format!(
                "{stage_name} requires a valid password (env {})",
                policy.password_env
            )));
        }
        Ok(())
    }

    fn record_gate_failures(
        &self,
        job_id: &str,
        stage: JobStage,
        profile: &str,
        report: &GateRunReport,
    ) -> Result<Vec<String>> {
        let errorbook = self.errorbook();
        let mut recorded = Vec::new();
        for step in report.failing_required() {
            let outcome = errorbook.record(auto_record_input(job_id, stage, profile, step))?;
            recorded.push(outcome.entry.id.clone());
        }
        Ok(recorded)
    }

    fn complete_stage(
        &self,
        job: &mut Job,
        stage: JobStage,
        status: JobStatus,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Result<()> {
        let now = self.clock.now();
        let entry = job.stages.get_mut(&stage).expect("all stages initialized");
        entry.status = StageState::Completed;
        entry.completed_at = Some(now);
        entry.metadata = metadata;
        job.status = status;
        job.updated_at = now;
        self.save(job)
    }

    fn fail_stage(&self, job: &mut Job, stage: JobStage, status: JobStatus) -> Result<()> {
        let now = self.clock.now();
        let entry = job.stages.get_mut(&stage).expect("all stages initialized");
        entry.status = StageState::Failed;
        entry.completed_at = None;
        job.status = status;
        job.updated_at = now;
        self.save(job)
    }

    fn save(&self, job: &Job) -> Result<()> {
        store::write_json(&self.layout.studio_job(&job.job_id), job)?;
        store::write_json(
            &self.layout.latest_job(),
            &LatestJobPointer {
                job_id: job.job_id.clone(),
                updated_at: job.updated_at,
            },
        )
    }

    fn append_event(
        &self,
        job_id: &str,
        event_type: &str,
        metadata: serde_json::Value,
    ) -> Result<()> {
        let timestamp = self.clock.now();
        let event = StudioEvent {
            event_id: event_id(job_id, event_type, timestamp, &metadata),
            job_id: job_id.to_string(),
            event_type: event_type.to_string(),
            timestamp,
            metadata,
        };
        store::append_jsonl(&self.layout.studio_events(job_id), &event)
    }
}

fn stage_metadata(pairs: &[(&str, Option<&str>)]) -> BTreeMap<String, serde_json::Value> {
    pairs
        .iter()
        .filter_map(|(key, value)| {
            value.map(|v| (key.to_string(), serde_json::Value::String(v.to_string())))
        })
        .collect()
}

fn failing_ids(report: &GateRunReport) -> Vec<String> {
    report
        .failing_required()
        .iter()
        .map(|s| s.id.clone())
        .collect()
}

fn new_job_id(from_chat: &str, now: DateTime<Utc>) -> String {
    let mut hasher = Sha1::new();
    hasher.update(from_chat.as_bytes());
    hasher.update(b"\n");
    hasher.update(now.to_rfc3339().as_bytes());
    let digest = hasher.finalize();
    format!(
        "job-{}-{}",
        now.format("%Y%m%dT%H%M%S"),
        &hex::encode(digest)[..8]
    )
}

fn event_id(
    job_id: &str,
    event_type: &str,
    timestamp: DateTime<Utc>,
    metadata: &serde_json::Value,
) -> String {
    let mut hasher = Sha1::new();
    hasher.update(job_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(event_type.as_bytes());
    hasher.update(b"\n");
    hasher.update(timestamp.to_rfc3339().as_bytes());
    hasher.update(b"\n");
    hasher.update(metadata.to_string().as_bytes());
    format!("evt-{}", &hex::encode(hasher.finalize())[..16])
}

/// Auto-recorded failure knowledge for one failing required step. The
/// fingerprint inputs are exactly the deterministic tuple
/// (stage, profile, job id, step id, command, exit code, skip reason,
/// stderr prefix).
fn auto_record_input(
    job_id: &str,
    stage: JobStage,
    profile: &str,
    step: &GateStepResult,
) -> RecordInput {
    let exit = match (step.status, step.exit_code) {
        (GateStepStatus::Skipped, _) => "skipped".to_string(),
        (_, Some(code)) => code.to_string(),
        (_, None) => "none".to_string(),
    };
    let skip_reason = step.skip_reason.clone().unwrap_or_default();
    let stderr_prefix: String = step.output.stderr.chars().take(200).collect();

    RecordInput {
        title: format!("studio {} step '{}' failed", stage.as_str(), step.id),
        symptom: format!(
            "stage={} profile={} job={} step={} command={} exit={} {}",
            stage.as_str(),
            profile,
            job_id,
            step.id,
            step.command,
            exit,
            skip_reason
        )
        .trim()
        .to_string(),
        root_cause: if stderr_prefix.trim().is_empty() {
            skip_reason
        } else {
            stderr_prefix
        },
        tags: vec!["studio".to_string(), format!("studio-{}", stage.as_str())],
        source: format!("studio-{}", stage.as_str()),
        ..Default::default()
    }
}
