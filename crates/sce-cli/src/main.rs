use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use serde_json::json;

use sce_core::clock::system_clock;
use sce_core::config::{self, RateLimitProfile};
use sce_core::error::CoreError;
use sce_core::errorbook::{
    Errorbook, EntryStatus, OntologyTag, RecordInput, RiskLevel, TemporaryMitigation,
};
use sce_core::gate::StepsDeclaration;
use sce_core::layout::{DEFAULT_NS, Layout};
use sce_core::orchestrator::{
    CancelToken, CommandAgentRunner, DirSpecProvider, OrchestrateOptions, OrchestrationStatus,
    Orchestrator,
};
use sce_core::pipeline::{
    DocumentStage, GateStepsStage, PipelineEngine, RunOptions, StageAdapter, StageName,
};
use sce_core::process::ProcessRunner;
use sce_core::registry::{RegistryClient, SearchMode, SearchOptions};
use sce_core::store::{self, SpecLock};
use sce_core::studio::{
    ApplyRequest, GenerateRequest, PlanRequest, ReleaseChannel, ReleaseProfile, ReleaseRequest,
    RollbackRequest, StudioEngine, VerifyProfile, VerifyRequest,
};

#[derive(Parser, Debug)]
#[command(name = "sce", version)]
#[command(about = "Spec pipeline, multi-agent orchestration, studio jobs, and the errorbook")]
struct Cli {
    /// Project workspace root.
    #[arg(long, global = true, default_value = ".")]
    dir: PathBuf,

    /// Namespace directory (default `.sce`, or $SCE_NS).
    #[arg(long, global = true)]
    ns: Option<String>,

    /// Emit machine-readable JSON on stdout.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Curated failure-knowledge registry.
    Errorbook {
        #[command(subcommand)]
        cmd: ErrorbookCmd,
    },
    /// Staged spec pipeline (requirements, design, tasks, gate).
    Pipeline {
        #[command(subcommand)]
        cmd: PipelineCmd,
    },
    /// Parallel multi-spec execution.
    Orchestrate {
        #[command(subcommand)]
        cmd: OrchestrateCmd,
    },
    /// Chat-to-release job state machine.
    Studio {
        #[command(subcommand)]
        cmd: StudioCmd,
    },
    /// Hold the advisory lock for a spec.
    SpecLock(SpecLockArgs),
    /// Release the advisory lock for a spec.
    SpecUnlock { spec: String },
    /// Print environment and layout diagnostics.
    Doctor,
}

#[derive(Subcommand, Debug)]
enum ErrorbookCmd {
    /// Record (or merge) a failure entry.
    Record(RecordArgs),
    /// Promote an entry to the curated tier.
    Promote { key: String },
    /// Retire an entry.
    Deprecate { key: String },
    /// Return a deprecated or candidate entry to circulation.
    Requalify {
        key: String,
        /// Target status: candidate or verified.
        #[arg(long)]
        to: String,
    },
    /// List entry summaries.
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        tag: Option<String>,
    },
    /// Show one entry by id or fingerprint.
    Show { key: String },
    /// Attach or resolve a temporary mitigation.
    Mitigation(MitigationArgs),
    /// Evaluate the release gate.
    ReleaseGate {
        #[arg(long, default_value = "high")]
        min_risk: String,
        #[arg(long)]
        include_verified: bool,
    },
    /// Write the sharable registry export.
    Export,
    /// Search the remote registry.
    Find(FindArgs),
    /// Pull enabled sources into the local cache.
    SyncRegistry,
    /// Probe registry sources.
    HealthRegistry {
        #[arg(long)]
        fail_on_alert: bool,
    },
}

#[derive(Args, Debug)]
struct RecordArgs {
    #[arg(long)]
    title: String,
    #[arg(long)]
    symptom: String,
    #[arg(long, default_value = "")]
    root_cause: String,
    #[arg(long = "fix")]
    fix_actions: Vec<String>,
    #[arg(long = "evidence")]
    verification_evidence: Vec<String>,
    #[arg(long = "tag")]
    tags: Vec<String>,
    /// Ontology tags: entity, relation, business_rule, decision_policy,
    /// execution_flow.
    #[arg(long = "ontology")]
    ontology_tags: Vec<String>,
    #[arg(long)]
    status: Option<String>,
    #[arg(long, default_value = "manual")]
    source: String,
}

#[derive(Args, Debug)]
struct MitigationArgs {
    key: String,
    /// Mark the existing mitigation resolved instead of attaching one.
    #[arg(long, conflicts_with_all = ["exit_criteria", "cleanup_task", "deadline"])]
    resolve: bool,
    #[arg(long, default_value = "")]
    exit_criteria: String,
    #[arg(long, default_value = "")]
    cleanup_task: String,
    /// ISO-8601 deadline, e.g. 2026-03-01T00:00:00Z.
    #[arg(long, default_value = "")]
    deadline: String,
}

#[derive(Args, Debug)]
struct FindArgs {
    query: String,
    /// cache, remote, or hybrid.
    #[arg(long, default_value = "hybrid")]
    mode: String,
    #[arg(long)]
    max_shards: Option<usize>,
    #[arg(long)]
    allow_remote_fullscan: bool,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Args, Debug, Clone)]
struct PipelineRunArgs {
    /// One spec runs inline; several default to orchestrate mode.
    #[arg(required = true)]
    specs: Vec<String>,
    #[arg(long)]
    fail_fast: bool,
    #[arg(long)]
    continue_on_warning: bool,
    #[arg(long)]
    strict: bool,
    #[arg(long)]
    from_stage: Option<String>,
    #[arg(long)]
    to_stage: Option<String>,
}

#[derive(Subcommand, Debug)]
enum PipelineCmd {
    /// Execute the stage chain for one or more specs.
    Run(PipelineRunArgs),
    /// Resume the latest in-progress run.
    Resume { spec: String },
    /// Show run history for a spec.
    Status { spec: String },
}

#[derive(Subcommand, Debug)]
enum OrchestrateCmd {
    /// Run specs in dependency-ordered batches.
    Run(OrchestrateRunArgs),
    /// Request a cooperative stop (idempotent).
    Stop,
    /// Show the current status snapshot.
    Status,
}

#[derive(Args, Debug)]
struct OrchestrateRunArgs {
    /// Specs to run (default: every spec).
    #[arg(long = "spec")]
    specs: Vec<String>,
    #[arg(long, default_value_t = 4)]
    max_parallel: usize,
    /// Single-run rate-limit profile override (not persisted).
    #[arg(long)]
    profile: Option<String>,
    /// Agent command; defaults to a per-spec `sce pipeline run` bootstrap.
    #[arg(long)]
    agent_cmd: Option<String>,
    /// Agent argument (repeatable); `{spec}` expands to the spec name.
    #[arg(long = "agent-arg")]
    agent_args: Vec<String>,
    /// Per-spec wall-clock deadline (e.g. 30m).
    #[arg(long, default_value = "30m")]
    spec_timeout: String,
}

#[derive(Subcommand, Debug)]
enum StudioCmd {
    /// Create a job from a chat handle.
    Plan {
        #[arg(long)]
        from_chat: String,
        #[arg(long)]
        goal: Option<String>,
        #[arg(long)]
        target: Option<String>,
    },
    /// Generate a patch bundle for a scene.
    Generate {
        #[arg(long)]
        job: Option<String>,
        #[arg(long)]
        scene: String,
        #[arg(long)]
        target: Option<String>,
        #[arg(long)]
        patch_bundle: Option<String>,
    },
    /// Apply the generated patch bundle.
    Apply {
        #[arg(long)]
        job: Option<String>,
        #[arg(long)]
        patch_bundle: Option<String>,
        #[arg(long)]
        password: Option<String>,
    },
    /// Run the verify gate.
    Verify {
        #[arg(long)]
        job: Option<String>,
        /// fast, standard, or strict.
        #[arg(long, default_value = "standard")]
        profile: String,
        /// Gate-step declaration document (default config/gate-steps.json).
        #[arg(long)]
        steps: Option<PathBuf>,
    },
    /// Run the release gate and cut a release.
    Release {
        #[arg(long)]
        job: Option<String>,
        /// dev or prod.
        #[arg(long, default_value = "dev")]
        channel: String,
        /// standard or strict.
        #[arg(long, default_value = "standard")]
        profile: String,
        #[arg(long)]
        release_ref: Option<String>,
        #[arg(long)]
        steps: Option<PathBuf>,
        #[arg(long)]
        password: Option<String>,
    },
    /// Roll the job back (terminal).
    Rollback {
        #[arg(long)]
        job: Option<String>,
        #[arg(long)]
        reason: String,
        #[arg(long)]
        password: Option<String>,
    },
    /// Show a job.
    Status {
        #[arg(long)]
        job: Option<String>,
    },
    /// Print the next command token for a job.
    Next {
        #[arg(long)]
        job: Option<String>,
    },
    /// Show the per-job event log.
    Events {
        #[arg(long)]
        job: Option<String>,
        #[arg(long)]
        tail: Option<usize>,
    },
}

#[derive(Args, Debug)]
struct SpecLockArgs {
    spec: String,
    #[arg(long, default_value = "manual hold")]
    reason: String,
    #[arg(long, default_value_t = 4.0)]
    timeout_hours: f64,
    #[arg(long)]
    force: bool,
}

/// One command's result: the `mode` discriminator, the JSON payload, the
/// human rendering, and the process exit code.
struct CommandOutput {
    mode: &'static str,
    json: serde_json::Value,
    human: String,
    exit: u8,
}

impl CommandOutput {
    fn ok(mode: &'static str, json: serde_json::Value, human: String) -> Self {
        Self {
            mode,
            json,
            human,
            exit: 0,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let ns = cli
        .ns
        .clone()
        .or_else(|| std::env::var("SCE_NS").ok())
        .unwrap_or_else(|| DEFAULT_NS.to_string());
    let layout = Layout::new(&cli.dir, ns);
    let mode = mode_of(&cli.cmd);

    match dispatch(&cli, &layout) {
        Ok(output) => {
            if cli.json {
                let mut body = output.json;
                if let Some(map) = body.as_object_mut() {
                    map.insert("mode".to_string(), json!(output.mode));
                }
                println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
            } else if !output.human.is_empty() {
                println!("{}", output.human);
            }
            ExitCode::from(output.exit)
        }
        Err(err) => {
            if cli.json {
                let body = json!({
                    "mode": mode,
                    "success": false,
                    "error": err.to_string(),
                    "error_kind": err.machine_name(),
                });
                println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
            } else {
                eprintln!("[error] {err} ({})", err.machine_name());
            }
            ExitCode::from(1)
        }
    }
}

fn mode_of(cmd: &Commands) -> &'static str {
    match cmd {
        Commands::Errorbook { cmd } => match cmd {
            ErrorbookCmd::Record(_) => "errorbook-record",
            ErrorbookCmd::Promote { .. } => "errorbook-promote",
            ErrorbookCmd::Deprecate { .. } => "errorbook-deprecate",
            ErrorbookCmd::Requalify { .. } => "errorbook-requalify",
            ErrorbookCmd::List { .. } => "errorbook-list",
            ErrorbookCmd::Show { .. } => "errorbook-show",
            ErrorbookCmd::Mitigation(_) => "errorbook-mitigation",
            ErrorbookCmd::ReleaseGate { .. } => "errorbook-release-gate",
            ErrorbookCmd::Export => "errorbook-export",
            ErrorbookCmd::Find(_) => "errorbook-find",
            ErrorbookCmd::SyncRegistry => "errorbook-sync-registry",
            ErrorbookCmd::HealthRegistry { .. } => "errorbook-health-registry",
        },
        Commands::Pipeline { cmd } => match cmd {
            PipelineCmd::Run(_) => "pipeline-run",
            PipelineCmd::Resume { .. } => "pipeline-resume",
            PipelineCmd::Status { .. } => "pipeline-status",
        },
        Commands::Orchestrate { cmd } => match cmd {
            OrchestrateCmd::Run(_) => "orchestrate-run",
            OrchestrateCmd::Stop => "orchestrate-stop",
            OrchestrateCmd::Status => "orchestrate-status",
        },
        Commands::Studio { cmd } => match cmd {
            StudioCmd::Plan { .. } => "studio-plan",
            StudioCmd::Generate { .. } => "studio-generate",
            StudioCmd::Apply { .. } => "studio-apply",
            StudioCmd::Verify { .. } => "studio-verify",
            StudioCmd::Release { .. } => "studio-release",
            StudioCmd::Rollback { .. } => "studio-rollback",
            StudioCmd::Status { .. } => "studio-status",
            StudioCmd::Next { .. } => "studio-next",
            StudioCmd::Events { .. } => "studio-events",
        },
        Commands::SpecLock(_) => "spec-lock",
        Commands::SpecUnlock { .. } => "spec-unlock",
        Commands::Doctor => "doctor",
    }
}

fn dispatch(cli: &Cli, layout: &Layout) -> Result<CommandOutput, CoreError> {
    let clock = system_clock();
    match &cli.cmd {
        Commands::Errorbook { cmd } => {
            let book = Errorbook::new(layout.clone(), clock.clone());
            run_errorbook(cmd, layout, &book, &clock)
        }
        Commands::Pipeline { cmd } => run_pipeline(cmd, cli, layout, &clock),
        Commands::Orchestrate { cmd } => run_orchestrate(cmd, cli, layout, &clock),
        Commands::Studio { cmd } => {
            let engine = StudioEngine::new(layout.clone(), clock.clone(), Arc::new(ProcessRunner));
            run_studio(cmd, layout, &engine)
        }
        Commands::SpecLock(args) => {
            let lock = SpecLock::acquire(
                layout,
                &args.spec,
                "cli",
                &args.reason,
                args.timeout_hours,
                args.force,
                &clock,
            )?;
            // The lock survives this process; unlock releases it.
            std::mem::forget(lock);
            let info = store::read_lock(layout, &args.spec)?;
            Ok(CommandOutput::ok(
                "spec-lock",
                json!({ "success": true, "spec": args.spec, "lock": info }),
                format!("locked spec '{}' ({})", args.spec, args.reason),
            ))
        }
        Commands::SpecUnlock { spec } => {
            let held = store::read_lock(layout, spec)?;
            if held.is_none() {
                return Err(CoreError::NotFound(format!("spec '{spec}' is not locked")));
            }
            std::fs::remove_file(layout.spec_lock(spec))
                .map_err(|e| CoreError::Io(format!("failed to remove lock: {e}")))?;
            Ok(CommandOutput::ok(
                "spec-unlock",
                json!({ "success": true, "spec": spec }),
                format!("unlocked spec '{spec}'"),
            ))
        }
        Commands::Doctor => run_doctor(layout),
    }
}

fn parse_enum<T: std::str::FromStr<Err = String>>(value: &str) -> Result<T, CoreError> {
    value.parse::<T>().map_err(CoreError::InputValidation)
}

fn run_errorbook(
    cmd: &ErrorbookCmd,
    layout: &Layout,
    book: &Errorbook,
    clock: &sce_core::SharedClock,
) -> Result<CommandOutput, CoreError> {
    match cmd {
        ErrorbookCmd::Record(args) => {
            let status = args
                .status
                .as_deref()
                .map(parse_enum::<EntryStatus>)
                .transpose()?;
            let ontology_tags = args
                .ontology_tags
                .iter()
                .map(|t| parse_enum::<OntologyTag>(t))
                .collect::<Result<Vec<_>, _>>()?;
            let outcome = book.record(RecordInput {
                title: args.title.clone(),
                symptom: args.symptom.clone(),
                root_cause: args.root_cause.clone(),
                fix_actions: args.fix_actions.clone(),
                verification_evidence: args.verification_evidence.clone(),
                tags: args.tags.clone(),
                ontology_tags,
                status,
                source: args.source.clone(),
                temporary_mitigation: None,
            })?;
            Ok(CommandOutput::ok(
                "errorbook-record",
                json!({
                    "success": true,
                    "merged": outcome.merged,
                    "entry": outcome.entry,
                }),
                format!(
                    "{} entry {} (fingerprint {}, quality {}, occurrences {})",
                    if outcome.merged { "merged into" } else { "created" },
                    outcome.entry.id,
                    outcome.entry.fingerprint,
                    outcome.entry.quality_score,
                    outcome.entry.occurrences
                ),
            ))
        }
        ErrorbookCmd::Promote { key } => {
            let entry = book.promote(key)?;
            Ok(CommandOutput::ok(
                "errorbook-promote",
                json!({ "success": true, "entry": entry }),
                format!("promoted {}", entry.id),
            ))
        }
        ErrorbookCmd::Deprecate { key } => {
            let entry = book.deprecate(key)?;
            Ok(CommandOutput::ok(
                "errorbook-deprecate",
                json!({ "success": true, "entry": entry }),
                format!("deprecated {}", entry.id),
            ))
        }
        ErrorbookCmd::Requalify { key, to } => {
            let target = parse_enum::<EntryStatus>(to)?;
            let entry = book.requalify(key, target)?;
            Ok(CommandOutput::ok(
                "errorbook-requalify",
                json!({ "success": true, "entry": entry }),
                format!("requalified {} to {}", entry.id, entry.status.as_str()),
            ))
        }
        ErrorbookCmd::List { status, tag } => {
            let status = status.as_deref().map(parse_enum::<EntryStatus>).transpose()?;
            let summaries = book.list(status, tag.as_deref())?;
            let mut human = String::new();
            for s in &summaries {
                human.push_str(&format!(
                    "{}  {:<10} q={:<3} x{}  {}\n",
                    s.fingerprint,
                    s.status.as_str(),
                    s.quality_score,
                    s.occurrences,
                    s.title
                ));
            }
            Ok(CommandOutput::ok(
                "errorbook-list",
                json!({ "success": true, "count": summaries.len(), "entries": summaries }),
                human.trim_end().to_string(),
            ))
        }
        ErrorbookCmd::Show { key } => {
            let entry = book.get(key)?;
            let human = serde_json::to_string_pretty(&entry).unwrap_or_default();
            Ok(CommandOutput::ok(
                "errorbook-show",
                json!({ "success": true, "entry": entry }),
                human,
            ))
        }
        ErrorbookCmd::Mitigation(args) => {
            let entry = if args.resolve {
                book.resolve_mitigation(&args.key)?
            } else {
                book.set_mitigation(
                    &args.key,
                    TemporaryMitigation {
                        enabled: true,
                        exit_criteria: args.exit_criteria.clone(),
                        cleanup_task: args.cleanup_task.clone(),
                        deadline_at: args.deadline.clone(),
                        resolved: false,
                        resolved_at: None,
                    },
                )?
            };
            Ok(CommandOutput::ok(
                "errorbook-mitigation",
                json!({ "success": true, "entry": entry }),
                format!(
                    "{} mitigation on {}",
                    if args.resolve { "resolved" } else { "set" },
                    entry.id
                ),
            ))
        }
        ErrorbookCmd::ReleaseGate {
            min_risk,
            include_verified,
        } => {
            let min_risk = parse_enum::<RiskLevel>(min_risk)?;
            let report = book.release_gate(min_risk, *include_verified)?;
            let human = if report.passed {
                format!("release gate passed ({} entries evaluated)", report.evaluated)
            } else {
                let mut s = format!(
                    "release gate BLOCKED: {} blocker(s)\n",
                    report.blocked_count
                );
                for b in report.risk_blocked.iter().chain(&report.mitigation_blocked) {
                    s.push_str(&format!(
                        "  {} [{}] {} {}\n",
                        b.id,
                        b.risk.as_str(),
                        b.title,
                        b.policy_violations.join(",")
                    ));
                }
                s.trim_end().to_string()
            };
            let passed = report.passed;
            let output = CommandOutput {
                mode: "errorbook-release-gate",
                json: json!({ "success": true, "passed": passed, "blocked_count": report.blocked_count, "report": report }),
                human,
                exit: if passed { 0 } else { 1 },
            };
            Ok(output)
        }
        ErrorbookCmd::Export => {
            let export = book.export()?;
            Ok(CommandOutput::ok(
                "errorbook-export",
                json!({
                    "success": true,
                    "path": layout.registry_export(),
                    "entries": export.entries.len(),
                }),
                format!(
                    "exported {} entries to {}",
                    export.entries.len(),
                    layout.registry_export().display()
                ),
            ))
        }
        ErrorbookCmd::Find(args) => {
            let mode = parse_enum::<SearchMode>(&args.mode)?;
            let registry = registry_client(layout, clock)?;
            let report = registry.find(
                &args.query,
                &SearchOptions {
                    mode,
                    max_shards: args.max_shards,
                    allow_remote_fullscan: args.allow_remote_fullscan,
                    limit: args.limit,
                },
            )?;
            for warning in &report.warnings {
                eprintln!("[warn] {warning}");
            }
            let mut human = String::new();
            for hit in &report.hits {
                human.push_str(&format!(
                    "{:>6.1}  {}  {:<10} {}\n",
                    hit.match_score,
                    hit.fingerprint,
                    hit.status.as_str(),
                    hit.title
                ));
            }
            Ok(CommandOutput::ok(
                "errorbook-find",
                json!({
                    "success": true,
                    "count": report.hits.len(),
                    "hits": report.hits,
                    "warnings": report.warnings,
                }),
                human.trim_end().to_string(),
            ))
        }
        ErrorbookCmd::SyncRegistry => {
            let registry = registry_client(layout, clock)?;
            let cache = registry.sync()?;
            Ok(CommandOutput::ok(
                "errorbook-sync-registry",
                json!({
                    "success": true,
                    "entries": cache.entries.len(),
                    "sources": cache.sources,
                }),
                format!(
                    "synced {} entries from {} source(s)",
                    cache.entries.len(),
                    cache.sources.len()
                ),
            ))
        }
        ErrorbookCmd::HealthRegistry { fail_on_alert } => {
            let registry = registry_client(layout, clock)?;
            let report = registry.health();
            if !report.healthy && *fail_on_alert {
                let alerts: Vec<String> = report
                    .sources
                    .iter()
                    .filter_map(|s| s.alert.as_ref().map(|a| format!("{}: {a}", s.name)))
                    .collect();
                return Err(CoreError::RegistryUnavailable(alerts.join("; ")));
            }
            let mut human = String::new();
            for s in &report.sources {
                human.push_str(&format!(
                    "{:<16} enabled={} reachable={} indexed={}{}\n",
                    s.name,
                    s.enabled,
                    s.reachable,
                    s.indexed,
                    s.alert
                        .as_ref()
                        .map(|a| format!("  alert: {a}"))
                        .unwrap_or_default()
                ));
            }
            Ok(CommandOutput::ok(
                "errorbook-health-registry",
                json!({ "success": true, "healthy": report.healthy, "sources": report.sources }),
                human.trim_end().to_string(),
            ))
        }
    }
}

fn registry_client(
    layout: &Layout,
    clock: &sce_core::SharedClock,
) -> Result<RegistryClient, CoreError> {
    let loaded = config::load_registry_config(layout)?;
    if loaded.corrupt_fallback {
        eprintln!("[warn] errorbook-registry.json is corrupt; using defaults");
    }
    Ok(RegistryClient::new(
        layout.clone(),
        loaded.value,
        clock.clone(),
    ))
}

fn pipeline_adapters(clock: &sce_core::SharedClock) -> Vec<Box<dyn StageAdapter>> {
    vec![
        Box::new(DocumentStage::requirements()),
        Box::new(DocumentStage::design()),
        Box::new(DocumentStage::tasks()),
        Box::new(GateStepsStage::new(Arc::new(ProcessRunner), clock.clone())),
    ]
}

fn run_pipeline(
    cmd: &PipelineCmd,
    cli: &Cli,
    layout: &Layout,
    clock: &sce_core::SharedClock,
) -> Result<CommandOutput, CoreError> {
    let engine = PipelineEngine::new(layout.clone(), clock.clone());
    match cmd {
        PipelineCmd::Run(args) => {
            if args.specs.len() > 1 {
                // Multi-spec pipeline defaults to orchestrate mode with a
                // per-agent bootstrap carrying the per-spec options.
                return orchestrate_specs(
                    layout,
                    clock,
                    &args.specs,
                    4,
                    None,
                    30 * 60 * 1000,
                    pipeline_bootstrap_args(cli, args),
                );
            }
            let options = RunOptions {
                fail_fast: args.fail_fast,
                continue_on_warning: args.continue_on_warning,
                strict: args.strict,
                from_stage: args
                    .from_stage
                    .as_deref()
                    .map(parse_enum::<StageName>)
                    .transpose()?,
                to_stage: args
                    .to_stage
                    .as_deref()
                    .map(parse_enum::<StageName>)
                    .transpose()?,
            };
            let adapters = pipeline_adapters(clock);
            let run = engine.run(&args.specs[0], &adapters, options)?;
            Ok(pipeline_run_output("pipeline-run", run))
        }
        PipelineCmd::Resume { spec } => {
            let adapters = pipeline_adapters(clock);
            let run = engine.resume(spec, &adapters)?;
            Ok(pipeline_run_output("pipeline-resume", run))
        }
        PipelineCmd::Status { spec } => {
            let runs = engine.runs(spec)?;
            let mut human = String::new();
            for run in &runs {
                human.push_str(&format!(
                    "{}  {:?}  {} stage(s)\n",
                    run.run_id,
                    run.status,
                    run.stages.len()
                ));
            }
            Ok(CommandOutput::ok(
                "pipeline-status",
                json!({ "success": true, "spec": spec, "runs": runs }),
                human.trim_end().to_string(),
            ))
        }
    }
}

fn pipeline_run_output(mode: &'static str, run: sce_core::pipeline::PipelineRun) -> CommandOutput {
    let passed = run.status == sce_core::pipeline::RunStatus::Completed;
    let mut human = format!("run {} for spec '{}': {:?}\n", run.run_id, run.spec_id, run.status);
    for stage in &run.stages {
        human.push_str(&format!("  {:<12} {:?}\n", stage.name.as_str(), stage.status));
    }
    CommandOutput {
        mode,
        json: json!({ "success": true, "run": run }),
        human: human.trim_end().to_string(),
        exit: if passed { 0 } else { 1 },
    }
}

fn pipeline_bootstrap_args(cli: &Cli, args: &PipelineRunArgs) -> Vec<String> {
    let mut out = vec![
        "--dir".to_string(),
        cli.dir.display().to_string(),
        "--ns".to_string(),
        cli.ns.clone().unwrap_or_else(|| DEFAULT_NS.to_string()),
        "pipeline".to_string(),
        "run".to_string(),
        "{spec}".to_string(),
    ];
    if args.fail_fast {
        out.push("--fail-fast".to_string());
    }
    if args.continue_on_warning {
        out.push("--continue-on-warning".to_string());
    }
    if args.strict {
        out.push("--strict".to_string());
    }
    if let Some(from) = &args.from_stage {
        out.push("--from-stage".to_string());
        out.push(from.clone());
    }
    if let Some(to) = &args.to_stage {
        out.push("--to-stage".to_string());
        out.push(to.clone());
    }
    out
}

#[allow(clippy::too_many_arguments)]
fn orchestrate_specs(
    layout: &Layout,
    clock: &sce_core::SharedClock,
    specs: &[String],
    max_parallel: usize,
    profile_override: Option<RateLimitProfile>,
    timeout_ms: u64,
    agent_args: Vec<String>,
) -> Result<CommandOutput, CoreError> {
    let loaded = config::load_orchestrator_config(layout)?;
    if loaded.corrupt_fallback {
        eprintln!("[warn] orchestrator.json is corrupt; using defaults");
    }
    let params = loaded.value.resolve(profile_override);

    let exe = std::env::current_exe()
        .map_err(|e| CoreError::Io(format!("cannot resolve current executable: {e}")))?;
    let agent = CommandAgentRunner::new(
        Arc::new(ProcessRunner),
        exe.display().to_string(),
        agent_args,
        layout.workspace_root().to_path_buf(),
        Some(timeout_ms),
    );
    let orchestrator = Orchestrator::new(layout.clone(), clock.clone(), Arc::new(agent), params);
    let provider = DirSpecProvider::new(layout.clone());
    let result = orchestrator.run(
        &provider,
        &OrchestrateOptions {
            specs: specs.to_vec(),
            max_parallel,
            profile_override,
        },
        &CancelToken::new(),
    )?;
    Ok(orchestrate_output(result.status))
}

fn orchestrate_output(status: OrchestrationStatus) -> CommandOutput {
    use sce_core::orchestrator::OrchestrationState;
    let ok = status.status == OrchestrationState::Completed;
    let human = format!(
        "orchestration {:?}: {}/{} completed, {} failed, {} skipped ({} batches)",
        status.status,
        status.completed_specs,
        status.total_specs,
        status.failed_specs,
        status.skipped_specs,
        status.total_batches
    );
    CommandOutput {
        mode: "orchestrate-run",
        json: json!({ "success": true, "status": status }),
        human,
        exit: if ok { 0 } else { 1 },
    }
}

fn run_orchestrate(
    cmd: &OrchestrateCmd,
    cli: &Cli,
    layout: &Layout,
    clock: &sce_core::SharedClock,
) -> Result<CommandOutput, CoreError> {
    match cmd {
        OrchestrateCmd::Run(args) => {
            let profile = args
                .profile
                .as_deref()
                .map(parse_enum::<RateLimitProfile>)
                .transpose()?;
            let timeout = humantime::parse_duration(&args.spec_timeout)
                .map_err(|e| CoreError::InputValidation(format!("invalid --spec-timeout: {e}")))?;

            if let Some(agent_cmd) = &args.agent_cmd {
                let loaded = config::load_orchestrator_config(layout)?;
                let params = loaded.value.resolve(profile);
                let agent = CommandAgentRunner::new(
                    Arc::new(ProcessRunner),
                    agent_cmd.clone(),
                    args.agent_args.clone(),
                    layout.workspace_root().to_path_buf(),
                    Some(timeout.as_millis() as u64),
                );
                let orchestrator =
                    Orchestrator::new(layout.clone(), clock.clone(), Arc::new(agent), params);
                let provider = DirSpecProvider::new(layout.clone());
                let result = orchestrator.run(
                    &provider,
                    &OrchestrateOptions {
                        specs: args.specs.clone(),
                        max_parallel: args.max_parallel,
                        profile_override: profile,
                    },
                    &CancelToken::new(),
                )?;
                return Ok(orchestrate_output(result.status));
            }

            // Default bootstrap: each agent runs the spec pipeline.
            let bootstrap = PipelineRunArgs {
                specs: args.specs.clone(),
                fail_fast: false,
                continue_on_warning: false,
                strict: false,
                from_stage: None,
                to_stage: None,
            };
            orchestrate_specs(
                layout,
                clock,
                &args.specs,
                args.max_parallel,
                profile,
                timeout.as_millis() as u64,
                pipeline_bootstrap_args(cli, &bootstrap),
            )
        }
        OrchestrateCmd::Stop => {
            Orchestrator::request_stop(layout, clock)?;
            Ok(CommandOutput::ok(
                "orchestrate-stop",
                json!({ "success": true }),
                "stop requested".to_string(),
            ))
        }
        OrchestrateCmd::Status => {
            match store::read_json::<OrchestrationStatus>(&layout.orchestration_status())? {
                Some(status) => {
                    let human = format!(
                        "{:?}: {}/{} completed, {} failed, {} running (batch {}/{})",
                        status.status,
                        status.completed_specs,
                        status.total_specs,
                        status.failed_specs,
                        status.running_specs,
                        status.current_batch,
                        status.total_batches
                    );
                    Ok(CommandOutput::ok(
                        "orchestrate-status",
                        json!({ "success": true, "status": status }),
                        human,
                    ))
                }
                None => Ok(CommandOutput::ok(
                    "orchestrate-status",
                    json!({ "success": true, "status": null }),
                    "idle (no orchestration has run)".to_string(),
                )),
            }
        }
    }
}

fn load_steps(
    layout: &Layout,
    explicit: Option<&PathBuf>,
) -> Result<StepsDeclaration, CoreError> {
    let path = match explicit {
        Some(path) => path.clone(),
        None => {
            let default = layout.config_dir().join("gate-steps.json");
            if !default.exists() {
                return Ok(StepsDeclaration::default());
            }
            default
        }
    };
    store::read_json::<StepsDeclaration>(&path)?.ok_or_else(|| {
        CoreError::NotFound(format!("gate-step declaration not found: {}", path.display()))
    })
}

fn resolve_job(engine: &StudioEngine, job: Option<&String>) -> Result<String, CoreError> {
    match job {
        Some(id) => Ok(id.clone()),
        None => Ok(engine.latest()?.job_id),
    }
}

fn job_output(mode: &'static str, job: sce_core::studio::Job, human: String) -> CommandOutput {
    let next = job.next_action();
    CommandOutput::ok(
        mode,
        json!({ "success": true, "job": job, "next_action": next }),
        human,
    )
}

fn run_studio(
    cmd: &StudioCmd,
    layout: &Layout,
    engine: &StudioEngine,
) -> Result<CommandOutput, CoreError> {
    match cmd {
        StudioCmd::Plan {
            from_chat,
            goal,
            target,
        } => {
            let job = engine.plan(&PlanRequest {
                from_chat: from_chat.clone(),
                goal: goal.clone(),
                target: target.clone(),
            })?;
            let human = format!("planned job {} (next: {})", job.job_id, job.next_action());
            Ok(job_output("studio-plan", job, human))
        }
        StudioCmd::Generate {
            job,
            scene,
            target,
            patch_bundle,
        } => {
            let job_id = resolve_job(engine, job.as_ref())?;
            let job = engine.generate(&GenerateRequest {
                job_id,
                scene_id: scene.clone(),
                target: target.clone(),
                patch_bundle: patch_bundle.clone(),
            })?;
            let human = format!(
                "generated {} for job {} (next: {})",
                job.artifacts.patch_bundle_id.as_deref().unwrap_or("-"),
                job.job_id,
                job.next_action()
            );
            Ok(job_output("studio-generate", job, human))
        }
        StudioCmd::Apply {
            job,
            patch_bundle,
            password,
        } => {
            let job_id = resolve_job(engine, job.as_ref())?;
            let job = engine.apply(&ApplyRequest {
                job_id,
                patch_bundle: patch_bundle.clone(),
                password: password.clone(),
            })?;
            let human = format!("applied job {} (next: {})", job.job_id, job.next_action());
            Ok(job_output("studio-apply", job, human))
        }
        StudioCmd::Verify {
            job,
            profile,
            steps,
        } => {
            let job_id = resolve_job(engine, job.as_ref())?;
            let profile = parse_enum::<VerifyProfile>(profile)?;
            let declaration = load_steps(layout, steps.as_ref())?;
            let outcome = engine.verify(&VerifyRequest {
                job_id,
                profile,
                steps: declaration.verify_steps(profile.as_str()),
            })?;
            let human = format!(
                "verify {} for job {} ({} step(s), report {})",
                if outcome.report.passed { "passed" } else { "FAILED" },
                outcome.job.job_id,
                outcome.report.steps.len(),
                outcome
                    .job
                    .artifacts
                    .verify_report_path
                    .as_deref()
                    .unwrap_or("-")
            );
            let passed = outcome.report.passed;
            Ok(CommandOutput {
                mode: "studio-verify",
                json: json!({
                    "success": true,
                    "passed": passed,
                    "job": outcome.job,
                    "report": outcome.report,
                    "errorbook_entries": outcome.recorded_entries,
                }),
                human,
                exit: if passed { 0 } else { 1 },
            })
        }
        StudioCmd::Release {
            job,
            channel,
            profile,
            release_ref,
            steps,
            password,
        } => {
            let job_id = resolve_job(engine, job.as_ref())?;
            let channel = parse_enum::<ReleaseChannel>(channel)?;
            let profile = parse_enum::<ReleaseProfile>(profile)?;
            let declaration = load_steps(layout, steps.as_ref())?;
            let outcome = engine.release(&ReleaseRequest {
                job_id,
                channel,
                profile,
                release_ref: release_ref.clone(),
                steps: declaration.release_steps(profile.as_str()),
                password: password.clone(),
            })?;
            let human = format!(
                "release {} on {} for job {} (ref {})",
                if outcome.report.passed { "passed" } else { "FAILED" },
                channel.as_str(),
                outcome.job.job_id,
                outcome.job.artifacts.release_ref.as_deref().unwrap_or("-")
            );
            let passed = outcome.report.passed;
            Ok(CommandOutput {
                mode: "studio-release",
                json: json!({
                    "success": true,
                    "passed": passed,
                    "job": outcome.job,
                    "report": outcome.report,
                    "errorbook_entries": outcome.recorded_entries,
                }),
                human,
                exit: if passed { 0 } else { 1 },
            })
        }
        StudioCmd::Rollback {
            job,
            reason,
            password,
        } => {
            let job_id = resolve_job(engine, job.as_ref())?;
            let job = engine.rollback(&RollbackRequest {
                job_id,
                reason: reason.clone(),
                password: password.clone(),
            })?;
            let human = format!("rolled back job {} ({})", job.job_id, reason);
            Ok(job_output("studio-rollback", job, human))
        }
        StudioCmd::Status { job } => {
            let job_id = resolve_job(engine, job.as_ref())?;
            let job = engine.load(&job_id)?;
            let mut human = format!("job {}: {:?}\n", job.job_id, job.status);
            for stage in sce_core::studio::JOB_STAGES {
                human.push_str(&format!(
                    "  {:<9} {:?}\n",
                    stage.as_str(),
                    job.stage(stage).status
                ));
            }
            human.push_str(&format!("next: {}", job.next_action()));
            Ok(job_output("studio-status", job, human.trim_end().to_string()))
        }
        StudioCmd::Next { job } => {
            let job_id = resolve_job(engine, job.as_ref())?;
            let job = engine.load(&job_id)?;
            let next = job.next_action().to_string();
            Ok(CommandOutput::ok(
                "studio-next",
                json!({ "success": true, "job_id": job.job_id, "next_action": next.clone() }),
                next,
            ))
        }
        StudioCmd::Events { job, tail } => {
            let job_id = resolve_job(engine, job.as_ref())?;
            let events = engine.events(&job_id, *tail)?;
            let mut human = String::new();
            for event in &events {
                human.push_str(&format!(
                    "{}  {}\n",
                    event.timestamp.to_rfc3339(),
                    event.event_type
                ));
            }
            Ok(CommandOutput::ok(
                "studio-events",
                json!({ "success": true, "job_id": job_id, "events": events }),
                human.trim_end().to_string(),
            ))
        }
    }
}

fn run_doctor(layout: &Layout) -> Result<CommandOutput, CoreError> {
    let ns_dir = layout.ns_dir();
    let checks = json!({
        "workspace_root": layout.workspace_root(),
        "ns": layout.ns(),
        "ns_dir_exists": ns_dir.exists(),
        "orchestrator_config": layout.orchestrator_config().exists(),
        "studio_security": layout.studio_security().exists(),
        "errorbook_index": layout.errorbook_index().exists(),
        "registry_cache": layout.registry_cache().exists(),
        "version": env!("CARGO_PKG_VERSION"),
    });
    let human = format!(
        "sce {}\nworkspace_root: {}\nns: {} (exists: {})\norchestrator config: {}\nstudio policy: {}\nerrorbook index: {}",
        env!("CARGO_PKG_VERSION"),
        layout.workspace_root().display(),
        layout.ns(),
        ns_dir.exists(),
        layout.orchestrator_config().exists(),
        layout.studio_security().exists(),
        layout.errorbook_index().exists(),
    );
    Ok(CommandOutput::ok(
        "doctor",
        json!({ "success": true, "checks": checks }),
        human,
    ))
}

