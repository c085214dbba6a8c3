//! Resumable staged pipeline for a single spec.
//!
//! Stages run in the fixed order requirements → design → tasks → gate
//! through pluggable adapters. The run document is persisted atomically
//! after every stage transition, so a crash between stages resumes exactly
//! at the first stage that is not yet complete.

use std::collections::BTreeMap;
use std::fs;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::clock::SharedClock;
use crate::error::{CoreError, Result};
use crate::layout::Layout;
use crate::store::{self, SpecLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Requirements,
    Design,
    Tasks,
    Gate,
}

pub const STAGE_ORDER: [StageName; 4] = [
    StageName::Requirements,
    StageName::Design,
    StageName::Tasks,
    StageName::Gate,
];

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Requirements => "requirements",
            StageName::Design => "design",
            StageName::Tasks => "tasks",
            StageName::Gate => "gate",
        }
    }
}

impl std::str::FromStr for StageName {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "requirements" => Ok(Self::Requirements),
            "design" => Ok(Self::Design),
            "tasks" => Ok(Self::Tasks),
            "gate" => Ok(Self::Gate),
            other => Err(format!("unknown stage: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    Warning,
    Skipped,
    Failed,
}

impl StageStatus {
    /// A stage in this state does not need to run again on resume.
    pub fn is_settled_success(&self) -> bool {
        matches!(self, StageStatus::Completed | StageStatus::Warning)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunOptions {
    pub fail_fast: bool,
    pub continue_on_warning: bool,
    pub strict: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_stage: Option<StageName>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_stage: Option<StageName>,
}

impl RunOptions {
    fn in_window(&self, stage: StageName) -> bool {
        if let Some(from) = self.from_stage
            && stage < from
        {
            return false;
        }
        if let Some(to) = self.to_stage
            && stage > to
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub name: StageName,
    pub status: StageStatus,
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub spec_id: String,
    pub run_id: String,
    pub status: RunStatus,
    pub options: RunOptions,
    pub stages: Vec<StageRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineRun {
    fn record_for(&self, stage: StageName) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.name == stage)
    }
}

/// What an adapter hands back.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub status: StageStatus,
    pub artifacts: BTreeMap<String, String>,
    pub warnings: Vec<String>,
}

impl StageOutcome {
    pub fn completed() -> Self {
        Self {
            status: StageStatus::Completed,
            artifacts: BTreeMap::new(),
            warnings: Vec::new(),
        }
    }
}

/// Execution context handed to adapters.
pub struct StageContext<'a> {
    pub spec_id: &'a str,
    pub layout: &'a Layout,
    pub strict: bool,
}

pub trait StageAdapter {
    fn name(&self) -> StageName;
    fn execute(&self, ctx: &StageContext<'_>) -> Result<StageOutcome>;
}

pub struct PipelineEngine {
    layout: Layout,
    clock: SharedClock,
}

impl PipelineEngine {
    pub fn new(layout: Layout, clock: SharedClock) -> Self {
        Self { layout, clock }
    }

    /// Start a fresh run. Refuses while an in-progress run exists (resume
    /// it instead); the per-spec advisory lock covers the whole execution.
    pub fn run(
        &self,
        spec_id: &str,
        adapters: &[Box<dyn StageAdapter>],
        options: RunOptions,
    ) -> Result<PipelineRun> {
        validate_spec_id(spec_id)?;
        if let Some(existing) = self.latest_in_progress(spec_id)? {
            return Err(CoreError::Conflict(format!(
                "spec '{spec_id}' already has in-progress run {}; resume it",
                existing.run_id
            )));
        }

        let _lock = SpecLock::acquire(
            &self.layout,
            spec_id,
            "pipeline",
            "pipeline run",
            4.0,
            false,
            &self.clock,
        )?;

        let now = self.clock.now();
        let run = PipelineRun {
            spec_id: spec_id.to_string(),
            run_id: new_run_id(spec_id, now),
            status: RunStatus::InProgress,
            options,
            stages: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        self.save(&run)?;
        self.execute(run, adapters)
    }

    /// Resume the latest in-progress run from its first unsettled stage.
    pub fn resume(
        &self,
        spec_id: &str,
        adapters: &[Box<dyn StageAdapter>],
    ) -> Result<PipelineRun> {
        validate_spec_id(spec_id)?;
        let run = self.latest_in_progress(spec_id)?.ok_or_else(|| {
            CoreError::NotFound(format!("no in-progress pipeline run for spec '{spec_id}'"))
        })?;

        let _lock = SpecLock::acquire(
            &self.layout,
            spec_id,
            "pipeline",
            "pipeline resume",
            4.0,
            false,
            &self.clock,
        )?;
        self.execute(run, adapters)
    }

    fn execute(
        &self,
        mut run: PipelineRun,
        adapters: &[Box<dyn StageAdapter>],
    ) -> Result<PipelineRun> {
        let mut failed = false;
        let mut halted = false;

        for stage in STAGE_ORDER {
            if let Some(record) = run.record_for(stage) {
                if record.status.is_settled_success() {
                    continue;
                }
                // A recorded skip/failure only survives from a finished run,
                // which never reaches here; an in-progress run re-executes.
                run.stages.retain(|s| s.name != stage);
            }
            if halted {
                break;
            }

            let started_at = self.clock.now();
            let record = if failed {
                StageRecord {
                    name: stage,
                    status: StageStatus::Skipped,
                    artifacts: BTreeMap::new(),
                    warnings: vec!["earlier stage failed".to_string()],
                    started_at,
                    finished_at: started_at,
                }
            } else if !run.options.in_window(stage) {
                StageRecord {
                    name: stage,
                    status: StageStatus::Skipped,
                    artifacts: BTreeMap::new(),
                    warnings: Vec::new(),
                    started_at,
                    finished_at: started_at,
                }
            } else {
                let adapter = adapters
                    .iter()
                    .find(|a| a.name() == stage)
                    .ok_or_else(|| {
                        CoreError::InputValidation(format!(
                            "no adapter registered for stage '{}'",
                            stage.as_str()
                        ))
                    })?;
                let ctx = StageContext {
                    spec_id: &run.spec_id,
                    layout: &self.layout,
                    strict: run.options.strict,
                };
                let outcome = adapter.execute(&ctx)?;
                let finished_at = self.clock.now();

                match outcome.status {
                    StageStatus::Completed | StageStatus::Skipped => {}
                    StageStatus::Warning => {
                        if !run.options.continue_on_warning {
                            failed = true;
                        }
                    }
                    StageStatus::Failed => {
                        failed = true;
                        if run.options.fail_fast {
                            halted = true;
                        }
                    }
                }

                StageRecord {
                    name: stage,
                    status: outcome.status,
                    artifacts: outcome.artifacts,
                    warnings: outcome.warnings,
                    started_at,
                    finished_at,
                }
            };

            run.stages.push(record);
            run.updated_at = self.clock.now();
            self.save(&run)?;
        }

        run.status = if failed {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        run.updated_at = self.clock.now();
        self.save(&run)?;
        Ok(run)
    }

    /// Newest-first run history for a spec.
    pub fn runs(&self, spec_id: &str) -> Result<Vec<PipelineRun>> {
        let dir = self.layout.pipeline_runs_dir(spec_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut runs: Vec<PipelineRun> = Vec::new();
        let read = fs::read_dir(&dir)
            .map_err(|e| CoreError::io(format!("failed to list {}", dir.display()), e))?;
        for item in read {
            let item =
                item.map_err(|e| CoreError::io(format!("failed to list {}", dir.display()), e))?;
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(run) = store::read_json::<PipelineRun>(&path)? {
                runs.push(run);
            }
        }
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.run_id.cmp(&a.run_id)));
        Ok(runs)
    }

    pub fn latest_in_progress(&self, spec_id: &str) -> Result<Option<PipelineRun>> {
        Ok(self
            .runs(spec_id)?
            .into_iter()
            .find(|r| r.status == RunStatus::InProgress))
    }

    fn save(&self, run: &PipelineRun) -> Result<()> {
        store::write_json(&self.layout.pipeline_run(&run.spec_id, &run.run_id), run)
    }
}

fn validate_spec_id(spec_id: &str) -> Result<()> {
    if spec_id.trim().is_empty() {
        return Err(CoreError::InputValidation("spec id is required".to_string()));
    }
    if !spec_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(CoreError::InputValidation(format!(
            "spec id '{spec_id}' may only contain alphanumerics, '-' and '_'"
        )));
    }
    Ok(())
}

fn new_run_id(spec_id: &str, now: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(spec_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(now.to_rfc3339().as_bytes());
    let digest = hasher.finalize();
    format!("run-{}-{}", now.format("%Y%m%dT%H%M%S"), &hex::encode(digest)[..8])
}

/// Adapter over one of the spec's markdown inputs: fails when the document
/// is missing, warns when it is empty. Document generation itself lives
/// outside the core.
pub struct DocumentStage {
    stage: StageName,
    file_name: &'static str,
}

impl DocumentStage {
    pub fn requirements() -> Self {
        Self {
            stage: StageName::Requirements,
            file_name: "requirements.md",
        }
    }

    pub fn design() -> Self {
        Self {
            stage: StageName::Design,
            file_name: "design.md",
        }
    }

    pub fn tasks() -> Self {
        Self {
            stage: StageName::Tasks,
            file_name: "tasks.md",
        }
    }
}

impl StageAdapter for DocumentStage {
    fn name(&self) -> StageName {
        self.stage
    }

    fn execute(&self, ctx: &StageContext<'_>) -> Result<StageOutcome> {
        let path = ctx.layout.spec_dir(ctx.spec_id).join(self.file_name);
        let mut outcome = StageOutcome::completed();
        outcome
            .artifacts
            .insert("document".to_string(), path.display().to_string());

        if !path.exists() {
            outcome.status = StageStatus::Failed;
            outcome
                .warnings
                .push(format!("{} is missing", self.file_name));
            return Ok(outcome);
        }
        let content = fs::read_to_string(&path)
            .map_err(|e| CoreError::io(format!("failed to read {}", path.display()), e))?;
        if content.trim().is_empty() {
            outcome.status = StageStatus::Warning;
            outcome
                .warnings
                .push(format!("{} is empty", self.file_name));
        }
        Ok(outcome)
    }
}

/// Final gate stage: runs the steps declared in the spec's
/// `gate-steps.json` (if any) and hands the report path downstream as
/// `gate_out`. The pipeline only observes the returned status.
pub struct GateStepsStage {
    runner: crate::process::SharedRunner,
    clock: SharedClock,
}

impl GateStepsStage {
    pub fn new(runner: crate::process::SharedRunner, clock: SharedClock) -> Self {
        Self { runner, clock }
    }
}

impl StageAdapter for GateStepsStage {
    fn name(&self) -> StageName {
        StageName::Gate
    }

    fn execute(&self, ctx: &StageContext<'_>) -> Result<StageOutcome> {
        let steps_path = ctx.layout.spec_dir(ctx.spec_id).join("gate-steps.json");
        let steps: Vec<crate::gate::GateStep> =
            store::read_json(&steps_path)?.unwrap_or_default();

        let mut outcome = StageOutcome::completed();
        if steps.is_empty() {
            outcome
                .warnings
                .push("no gate steps declared".to_string());
            return Ok(outcome);
        }

        let report = crate::gate::run_steps(
            &steps,
            ctx.strict,
            ctx.layout.workspace_root(),
            &self.runner,
            &self.clock,
        );
        let gate_out = ctx
            .layout
            .spec_dir(ctx.spec_id)
            .join("pipeline")
            .join("gate-report.json");
        store::write_json(&gate_out, &report)?;
        outcome
            .artifacts
            .insert("gate_out".to_string(), gate_out.display().to_string());
        if !report.passed {
            outcome.status = StageStatus::Failed;
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::TimeZone;
    use tempfile::tempdir;

    use super::*;
    use crate::clock::Clock;
    use crate::clock::ManualClock;

    struct ScriptedStage {
        stage: StageName,
        status: StageStatus,
        executions: Arc<AtomicUsize>,
    }

    impl ScriptedStage {
        fn new(stage: StageName, status: StageStatus) -> (Self, Arc<AtomicUsize>) {
            let executions = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    stage,
                    status,
                    executions: executions.clone(),
                },
                executions,
            )
        }
    }

    impl StageAdapter for ScriptedStage {
        fn name(&self) -> StageName {
            self.stage
        }

        fn execute(&self, _ctx: &StageContext<'_>) -> Result<StageOutcome> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            Ok(StageOutcome {
                status: self.status,
                artifacts: BTreeMap::new(),
                warnings: Vec::new(),
            })
        }
    }

    fn engine(dir: &std::path::Path) -> (PipelineEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 5, 10, 9, 0, 0).unwrap(),
        ));
        let shared: SharedClock = clock.clone();
        (
            PipelineEngine::new(Layout::with_default_ns(dir), shared),
            clock,
        )
    }

    fn all_completed() -> Vec<Box<dyn StageAdapter>> {
        STAGE_ORDER
            .into_iter()
            .map(|stage| {
                Box::new(ScriptedStage::new(stage, StageStatus::Completed).0)
                    as Box<dyn StageAdapter>
            })
            .collect()
    }

    #[test]
    fn full_run_completes_all_stages_in_order() {
        let td = tempdir().expect("tempdir");
        let (engine, _) = engine(td.path());

        let run = engine
            .run("auth-flow", &all_completed(), RunOptions::default())
            .expect("run");
        assert_eq!(run.status, RunStatus::Completed);
        let names: Vec<StageName> = run.stages.iter().map(|s| s.name).collect();
        assert_eq!(names, STAGE_ORDER.to_vec());
        assert!(engine.layout.pipeline_run("auth-flow", &run.run_id).exists());
    }

    #[test]
    fn failed_stage_fail_fast_halts() {
        let td = tempdir().expect("tempdir");
        let (engine, _) = engine(td.path());

        let adapters: Vec<Box<dyn StageAdapter>> = vec![
            Box::new(ScriptedStage::new(StageName::Requirements, StageStatus::Completed).0),
            Box::new(ScriptedStage::new(StageName::Design, StageStatus::Failed).0),
            Box::new(ScriptedStage::new(StageName::Tasks, StageStatus::Completed).0),
            Box::new(ScriptedStage::new(StageName::Gate, StageStatus::Completed).0),
        ];
        let run = engine
            .run(
                "auth-flow",
                &adapters,
                RunOptions {
                    fail_fast: true,
                    ..Default::default()
                },
            )
            .expect("run");
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.stages.len(), 2);
    }

    #[test]
    fn failed_stage_without_fail_fast_records_rest_as_skipped() {
        let td = tempdir().expect("tempdir");
        let (engine, _) = engine(td.path());

        let adapters: Vec<Box<dyn StageAdapter>> = vec![
            Box::new(ScriptedStage::new(StageName::Requirements, StageStatus::Failed).0),
            Box::new(ScriptedStage::new(StageName::Design, StageStatus::Completed).0),
            Box::new(ScriptedStage::new(StageName::Tasks, StageStatus::Completed).0),
            Box::new(ScriptedStage::new(StageName::Gate, StageStatus::Completed).0),
        ];
        let run = engine
            .run("auth-flow", &adapters, RunOptions::default())
            .expect("run");
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.stages.len(), 4);
        assert_eq!(run.stages[0].status, StageStatus::Failed);
        assert!(run.stages[1..]
            .iter()
            .all(|s| s.status == StageStatus::Skipped));
    }

    #[test]
    fn warning_needs_continue_on_warning_to_advance() {
        let td = tempdir().expect("tempdir");
        let (engine, _) = engine(td.path());

        let adapters: Vec<Box<dyn StageAdapter>> = vec![
            Box::new(ScriptedStage::new(StageName::Requirements, StageStatus::Warning).0),
            Box::new(ScriptedStage::new(StageName::Design, StageStatus::Completed).0),
            Box::new(ScriptedStage::new(StageName::Tasks, StageStatus::Completed).0),
            Box::new(ScriptedStage::new(StageName::Gate, StageStatus::Completed).0),
        ];

        let blocked = engine
            .run("spec-a", &adapters, RunOptions::default())
            .expect("run");
        assert_eq!(blocked.status, RunStatus::Failed);
        assert_eq!(blocked.stages[0].status, StageStatus::Warning);
        assert!(blocked.stages[1..]
            .iter()
            .all(|s| s.status == StageStatus::Skipped));

        let advanced = engine
            .run(
                "spec-b",
                &adapters,
                RunOptions {
                    continue_on_warning: true,
                    ..Default::default()
                },
            )
            .expect("run");
        assert_eq!(advanced.status, RunStatus::Completed);
    }

    #[test]
    fn stage_window_skips_outside_stages() {
        let td = tempdir().expect("tempdir");
        let (engine, _) = engine(td.path());

        let run = engine
            .run(
                "auth-flow",
                &all_completed(),
                RunOptions {
                    from_stage: Some(StageName::Design),
                    to_stage: Some(StageName::Tasks),
                    ..Default::default()
                },
            )
            .expect("run");
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.stages[0].status, StageStatus::Skipped);
        assert_eq!(run.stages[1].status, StageStatus::Completed);
        assert_eq!(run.stages[2].status, StageStatus::Completed);
        assert_eq!(run.stages[3].status, StageStatus::Skipped);
    }

    #[test]
    fn resume_starts_at_first_unsettled_stage() {
        let td = tempdir().expect("tempdir");
        let (engine, clock) = engine(td.path());

        // A crashed run: requirements completed, nothing else recorded.
        let now = clock.now();
        let crashed = PipelineRun {
            spec_id: "auth-flow".into(),
            run_id: "run-crashed".into(),
            status: RunStatus::InProgress,
            options: RunOptions::default(),
            stages: vec![StageRecord {
                name: StageName::Requirements,
                status: StageStatus::Completed,
                artifacts: BTreeMap::new(),
                warnings: Vec::new(),
                started_at: now,
                finished_at: now,
            }],
            created_at: now,
            updated_at: now,
        };
        store::write_json(
            &engine.layout.pipeline_run("auth-flow", &crashed.run_id),
            &crashed,
        )
        .expect("seed");

        let (req, req_count) = ScriptedStage::new(StageName::Requirements, StageStatus::Completed);
        let (design, design_count) = ScriptedStage::new(StageName::Design, StageStatus::Completed);
        let adapters: Vec<Box<dyn StageAdapter>> = vec![
            Box::new(req),
            Box::new(design),
            Box::new(ScriptedStage::new(StageName::Tasks, StageStatus::Completed).0),
            Box::new(ScriptedStage::new(StageName::Gate, StageStatus::Completed).0),
        ];

        let resumed = engine.resume("auth-flow", &adapters).expect("resume");
        assert_eq!(resumed.status, RunStatus::Completed);
        assert_eq!(resumed.run_id, "run-crashed");
        // Requirements was not re-executed; design was.
        assert_eq!(req_count.load(Ordering::SeqCst), 0);
        assert_eq!(design_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn resume_without_in_progress_run_is_not_found() {
        let td = tempdir().expect("tempdir");
        let (engine, _) = engine(td.path());

        let err = engine
            .resume("auth-flow", &all_completed())
            .expect_err("nothing to resume");
        assert_eq!(err.machine_name(), "not-found");
    }

    #[test]
    fn finished_runs_are_never_resumed() {
        let td = tempdir().expect("tempdir");
        let (engine, clock) = engine(td.path());

        engine
            .run("auth-flow", &all_completed(), RunOptions::default())
            .expect("run");
        clock.advance_ms(1_000);

        let err = engine
            .resume("auth-flow", &all_completed())
            .expect_err("finished runs never resume");
        assert_eq!(err.machine_name(), "not-found");
    }

    #[test]
    fn second_run_conflicts_while_one_is_in_progress() {
        let td = tempdir().expect("tempdir");
        let (engine, clock) = engine(td.path());

        let now = clock.now();
        let stuck = PipelineRun {
            spec_id: "auth-flow".into(),
            run_id: "run-stuck".into(),
            status: RunStatus::InProgress,
            options: RunOptions::default(),
            stages: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        store::write_json(
            &engine.layout.pipeline_run("auth-flow", &stuck.run_id),
            &stuck,
        )
        .expect("seed");

        let err = engine
            .run("auth-flow", &all_completed(), RunOptions::default())
            .expect_err("must conflict");
        assert_eq!(err.machine_name(), "conflict");
    }

    #[test]
    fn spec_id_is_validated_at_the_boundary() {
        let td = tempdir().expect("tempdir");
        let (engine, _) = engine(td.path());

        for bad in ["", "  ", "a/b", "a b"] {
            let err = engine
                .run(bad, &all_completed(), RunOptions::default())
                .expect_err("must reject");
            assert_eq!(err.machine_name(), "input-validation");
        }
    }

    #[test]
    fn gate_stage_runs_declared_steps_and_writes_gate_out() {
        use crate::gate::GateStep;
        use crate::process::{CommandOutcome, FakeRunner};

        let td = tempdir().expect("tempdir");
        let layout = Layout::with_default_ns(td.path());
        let clock: SharedClock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 5, 10, 9, 0, 0).unwrap(),
        ));

        let steps = vec![GateStep {
            id: "lint".into(),
            name: "lint".into(),
            command: "lint".into(),
            args: vec![],
            required: true,
            timeout_ms: None,
        }];
        store::write_json(
            &layout.spec_dir("auth-flow").join("gate-steps.json"),
            &steps,
        )
        .expect("seed steps");

        let runner = Arc::new(FakeRunner::new());
        let stage = GateStepsStage::new(runner.clone(), clock.clone());
        let ctx = StageContext {
            spec_id: "auth-flow",
            layout: &layout,
            strict: false,
        };

        let ok = stage.execute(&ctx).expect("execute");
        assert_eq!(ok.status, StageStatus::Completed);
        let gate_out = ok.artifacts.get("gate_out").expect("gate_out artifact");
        assert!(std::path::Path::new(gate_out).exists());

        runner.stub(
            "lint",
            CommandOutcome {
                exit_code: 1,
                stderr: "bad style".into(),
                ..Default::default()
            },
        );
        let failed = stage.execute(&ctx).expect("execute");
        assert_eq!(failed.status, StageStatus::Failed);
    }

    #[test]
    fn gate_stage_with_no_declared_steps_completes_with_warning() {
        let td = tempdir().expect("tempdir");
        let layout = Layout::with_default_ns(td.path());
        let clock: SharedClock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 5, 10, 9, 0, 0).unwrap(),
        ));
        let stage = GateStepsStage::new(
            Arc::new(crate::process::FakeRunner::new()),
            clock,
        );
        let ctx = StageContext {
            spec_id: "auth-flow",
            layout: &layout,
            strict: false,
        };
        let outcome = stage.execute(&ctx).expect("execute");
        assert_eq!(outcome.status, StageStatus::Completed);
        assert_eq!(outcome.warnings, vec!["no gate steps declared"]);
    }

    #[test]
    fn document_stage_reports_missing_and_empty_inputs() {
        let td = tempdir().expect("tempdir");
        let layout = Layout::with_default_ns(td.path());
        let ctx = StageContext {
            spec_id: "auth-flow",
            layout: &layout,
            strict: false,
        };

        let stage = DocumentStage::requirements();
        let missing = stage.execute(&ctx).expect("execute");
        assert_eq!(missing.status, StageStatus::Failed);

        let doc = layout.spec_dir("auth-flow").join("requirements.md");
        fs::create_dir_all(doc.parent().unwrap()).expect("mkdir");
        fs::write(&doc, "").expect("write");
        let empty = stage.execute(&ctx).expect("execute");
        assert_eq!(empty.status, StageStatus::Warning);

        fs::write(&doc, "# Requirements\n- login\n").expect("write");
        let ok = stage.execute(&ctx).expect("execute");
        assert_eq!(ok.status, StageStatus::Completed);
    }
}
