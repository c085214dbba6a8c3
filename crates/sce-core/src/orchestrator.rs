//! Parallel multi-spec orchestration.
//!
//! A single coordinator thread owns the admission controller, the status
//! snapshot writer, and the event stream; worker threads only run agents
//! and report back over a channel. Specs execute in topologically ordered
//! batches; a batch finishes before the next begins.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::admission::{Admission, AdmissionController};
use crate::clock::SharedClock;
use crate::config::{RateLimitParams, RateLimitProfile};
use crate::error::{CoreError, Result};
use crate::layout::Layout;
use crate::process::{CommandRequest, SharedRunner};
use crate::store;

/// Cooperative cancellation flag shared with workers.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One spec in the dependency graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecNode {
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Metadata provider for the spec graph.
pub trait SpecGraphProvider {
    fn specs(&self) -> Result<Vec<SpecNode>>;
}

/// Production provider: every directory under `specs/`, with optional
/// `spec.json` declaring dependencies.
pub struct DirSpecProvider {
    layout: Layout,
}

#[derive(Debug, Default, Deserialize)]
struct SpecMeta {
    #[serde(default)]
    depends_on: Vec<String>,
}

impl DirSpecProvider {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }
}

impl SpecGraphProvider for DirSpecProvider {
    fn specs(&self) -> Result<Vec<SpecNode>> {
        let dir = self.layout.specs_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut nodes = Vec::new();
        let read = std::fs::read_dir(&dir)
            .map_err(|e| CoreError::io(format!("failed to list {}", dir.display()), e))?;
        for item in read {
            let item =
                item.map_err(|e| CoreError::io(format!("failed to list {}", dir.display()), e))?;
            if !item.path().is_dir() {
                continue;
            }
            let name = item.file_name().to_string_lossy().to_string();
            let meta = store::read_json::<SpecMeta>(&item.path().join("spec.json"))
                .unwrap_or(None)
                .unwrap_or_default();
            nodes.push(SpecNode {
                name,
                depends_on: meta.depends_on,
            });
        }
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(nodes)
    }
}

/// Terminal result of one agent invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentOutcome {
    Completed,
    Failed { message: String },
    RateLimited,
    TimedOut,
}

/// The agent-spawning contract. The mechanism is out of scope; the runner
/// only promises a terminal outcome per invocation and cooperative
/// cancellation.
pub trait AgentRunner: Send + Sync {
    fn run_spec(&self, spec: &str, cancel: &CancelToken) -> AgentOutcome;
}

pub type SharedAgentRunner = Arc<dyn AgentRunner>;

/// Production runner: one subprocess per spec, outcome classified from the
/// exit code and output text.
pub struct CommandAgentRunner {
    runner: SharedRunner,
    command: String,
    args: Vec<String>,
    working_dir: std::path::PathBuf,
    timeout_ms: Option<u64>,
}

impl CommandAgentRunner {
    /// `{spec}` in args is replaced with the spec name.
    pub fn new(
        runner: SharedRunner,
        command: String,
        args: Vec<String>,
        working_dir: std::path::PathBuf,
        timeout_ms: Option<u64>,
    ) -> Self {
        Self {
            runner,
            command,
            args,
            working_dir,
            timeout_ms,
        }
    }
}

impl AgentRunner for CommandAgentRunner {
    fn run_spec(&self, spec: &str, _cancel: &CancelToken) -> AgentOutcome {
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| a.replace("{spec}", spec))
            .collect();
        let outcome = self.runner.run(&CommandRequest {
            command: self.command.clone(),
            args,
            working_dir: self.working_dir.clone(),
            timeout: self.timeout_ms.map(StdDuration::from_millis),
        });

        if let Some(error) = &outcome.error {
            if error.contains("timed out") {
                return AgentOutcome::TimedOut;
            }
            return AgentOutcome::Failed {
                message: error.clone(),
            };
        }
        if outcome.exit_code == 0 {
            return AgentOutcome::Completed;
        }
        let text = format!("{}\n{}", outcome.stdout, outcome.stderr).to_lowercase();
        if text.contains("429") || text.contains("rate limit") || text.contains("too many requests")
        {
            return AgentOutcome::RateLimited;
        }
        AgentOutcome::Failed {
            message: tail_of(&outcome.stderr, 400),
        }
    }
}

fn tail_of(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= max {
        return trimmed.to_string();
    }
    let start = trimmed.len() - max;
    let start = trimmed
        .char_indices()
        .map(|(i, _)| i)
        .find(|i| *i >= start)
        .unwrap_or(0);
    trimmed[start..].to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationState {
    Idle,
    Running,
    Completed,
    Failed,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpecRunState {
    Pending,
    Running,
    RateLimited,
    Completed,
    Failed,
    Timeout,
    Skipped,
}

impl SpecRunState {
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            SpecRunState::Completed
                | SpecRunState::Failed
                | SpecRunState::Timeout
                | SpecRunState::Skipped
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecStatusEntry {
    pub status: SpecRunState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelSnapshot {
    pub max: usize,
    pub effective: usize,
    pub adaptive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchBudgetSnapshot {
    pub per_minute: u32,
    pub window_ms: u64,
    pub used: u32,
    pub hold_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_hold_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub signal_count: u64,
    pub total_backoff_ms: u64,
    pub launch_budget: LaunchBudgetSnapshot,
}

/// Internally-consistent snapshot persisted after every event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationStatus {
    pub status: OrchestrationState,
    pub total_specs: usize,
    pub completed_specs: usize,
    pub failed_specs: usize,
    pub running_specs: usize,
    pub skipped_specs: usize,
    pub current_batch: usize,
    pub total_batches: usize,
    pub parallel: ParallelSnapshot,
    pub rate_limit: RateLimitSnapshot,
    pub specs: BTreeMap<String, SpecStatusEntry>,
    pub snapshot_seq: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: OrchestrationEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum OrchestrationEventKind {
    #[serde(rename = "batch:start")]
    BatchStart { batch: usize, specs: Vec<String> },
    #[serde(rename = "batch:complete")]
    BatchComplete { batch: usize },
    #[serde(rename = "spec:start")]
    SpecStart { spec: String },
    #[serde(rename = "spec:complete")]
    SpecComplete { spec: String },
    #[serde(rename = "spec:failed")]
    SpecFailed { spec: String, error: String },
    #[serde(rename = "spec:rate-limited")]
    SpecRateLimited { spec: String, attempt: u32 },
    #[serde(rename = "launch:budget-hold")]
    LaunchBudgetHold { used: u32 },
    #[serde(rename = "parallel:throttled")]
    ParallelThrottled { effective: usize },
    #[serde(rename = "parallel:recovered")]
    ParallelRecovered { effective: usize },
    #[serde(rename = "orchestration:complete")]
    OrchestrationComplete { status: OrchestrationState },
}

#[derive(Debug, Clone)]
pub struct OrchestrateOptions {
    /// Empty selects every spec the provider knows.
    pub specs: Vec<String>,
    pub max_parallel: usize,
    pub profile_override: Option<RateLimitProfile>,
}

impl Default for OrchestrateOptions {
    fn default() -> Self {
        Self {
            specs: Vec::new(),
            max_parallel: 4,
            profile_override: None,
        }
    }
}

#[derive(Debug)]
pub struct OrchestrationRunResult {
    pub status: OrchestrationStatus,
    pub events: Vec<OrchestrationEvent>,
}

enum WorkerMsg {
    RateLimited { spec: String, attempt: u32 },
    Done { spec: String, outcome: AgentOutcome },
}

/// Waiting launch, possibly parked until a backoff elapses.
struct LaunchTicket {
    spec: String,
    attempt: u32,
    not_before: Option<DateTime<Utc>>,
}

pub struct Orchestrator {
    layout: Layout,
    clock: SharedClock,
    agent_runner: SharedAgentRunner,
    params: RateLimitParams,
}

impl Orchestrator {
    pub fn new(
        layout: Layout,
        clock: SharedClock,
        agent_runner: SharedAgentRunner,
        params: RateLimitParams,
    ) -> Self {
        Self {
            layout,
            clock,
            agent_runner,
            params,
        }
    }

    /// Request a cooperative stop of the running orchestration. Idempotent.
    pub fn request_stop(layout: &Layout, clock: &SharedClock) -> Result<()> {
        let now = clock.now();
        store::write_json(
            &layout.orchestration_stop(),
            &serde_json::json!({ "requested_at": now }),
        )?;
        if let Some(mut status) =
            store::read_json::<OrchestrationStatus>(&layout.orchestration_status())?
            && status.status == OrchestrationState::Running
        {
            status.status = OrchestrationState::Stopped;
            status.snapshot_seq += 1;
            status.updated_at = now;
            store::write_json(&layout.orchestration_status(), &status)?;
        }
        Ok(())
    }

    /// Run the selected specs to completion (or stop).
    pub fn run(
        &self,
        provider: &dyn SpecGraphProvider,
        options: &OrchestrateOptions,
        cancel: &CancelToken,
    ) -> Result<OrchestrationRunResult> {
        let nodes = select_nodes(provider.specs()?, &options.specs)?;
        if nodes.is_empty() {
            return Err(CoreError::InputValidation(
                "no specs selected for orchestration".to_string(),
            ));
        }
        let batches = build_batches(&nodes)?;

        // A stop requested before this run does not apply to it.
        let stop_path = self.layout.orchestration_stop();
        if stop_path.exists() {
            let _ = std::fs::remove_file(&stop_path);
        }

        let mut ctl = AdmissionController::new(
            self.params.clone(),
            options.max_parallel,
        );
        let mut spec_states: BTreeMap<String, SpecStatusEntry> = nodes
            .iter()
            .map(|n| {
                (
                    n.name.clone(),
                    SpecStatusEntry {
                        status: SpecRunState::Pending,
                        error: None,
                    },
                )
            })
            .collect();

        let mut events: Vec<OrchestrationEvent> = Vec::new();
        let mut seq: u64 = 0;
        let total_batches = batches.len();
        let mut current_batch = 0usize;
        let mut stopped = false;

        self.snapshot(
            OrchestrationState::Running,
            &spec_states,
            current_batch,
            total_batches,
            0,
            &mut ctl,
            &mut seq,
        )?;

        let (tx, rx) = mpsc::channel::<WorkerMsg>();

        for (batch_idx, batch) in batches.iter().enumerate() {
            current_batch = batch_idx + 1;
            if stopped {
                for spec in batch {
                    self.mark_skipped(&mut spec_states, spec);
                }
                continue;
            }

            self.emit(
                &mut events,
                OrchestrationEventKind::BatchStart {
                    batch: current_batch,
                    specs: batch.clone(),
                },
            );
            self.snapshot(
                OrchestrationState::Running,
                &spec_states,
                current_batch,
                total_batches,
                0,
                &mut ctl,
                &mut seq,
            )?;

            let mut ready: VecDeque<LaunchTicket> = batch
                .iter()
                .map(|spec| LaunchTicket {
                    spec: spec.clone(),
                    attempt: 1,
                    not_before: None,
                })
                .collect();
            let mut parked: Vec<LaunchTicket> = Vec::new();
            let mut running: BTreeMap<String, thread::JoinHandle<()>> = BTreeMap::new();

            loop {
                let now = self.clock.now();

                if !stopped && (cancel.is_cancelled() || stop_path.exists()) {
                    stopped = true;
                    cancel.cancel();
                }
                if stopped {
                    for ticket in ready.drain(..).chain(parked.drain(..)) {
                        self.mark_skipped(&mut spec_states, &ticket.spec);
                    }
                    if running.is_empty() {
                        break;
                    }
                }

                if ctl.maybe_recover(now) {
                    self.emit(
                        &mut events,
                        OrchestrationEventKind::ParallelRecovered {
                            effective: ctl.effective(),
                        },
                    );
                    self.snapshot(
                        OrchestrationState::Running,
                        &spec_states,
                        current_batch,
                        total_batches,
                        running.len(),
                        &mut ctl,
                        &mut seq,
                    )?;
                }

                // Parked tickets whose backoff elapsed become launchable.
                let mut still_parked = Vec::new();
                for ticket in parked.drain(..) {
                    match ticket.not_before {
                        Some(at) if at > now => still_parked.push(ticket),
                        _ => ready.push_back(LaunchTicket {
                            not_before: None,
                            ..ticket
                        }),
                    }
                }
                parked = still_parked;

                while !ready.is_empty() && !stopped {
                    match ctl.admit(now, running.len()) {
                        Admission::Allow => {
                            let ticket = ready.pop_front().expect("checked non-empty");
                            ctl.record_launch(now);
                            spec_states
                                .get_mut(&ticket.spec)
                                .expect("selected spec tracked")
                                .status = SpecRunState::Running;
                            self.emit(
                                &mut events,
                                OrchestrationEventKind::SpecStart {
                                    spec: ticket.spec.clone(),
                                },
                            );

                            let runner = Arc::clone(&self.agent_runner);
                            let worker_tx = tx.clone();
                            let worker_cancel = cancel.clone();
                            let spec = ticket.spec.clone();
                            let attempt = ticket.attempt;
                            let handle = thread::spawn(move || {
                                let outcome = runner.run_spec(&spec, &worker_cancel);
                                let msg = match outcome {
                                    AgentOutcome::RateLimited => {
                                        WorkerMsg::RateLimited { spec, attempt }
                                    }
                                    other => WorkerMsg::Done {
                                        spec,
                                        outcome: other,
                                    },
                                };
                                let _ = worker_tx.send(msg);
                            });
                            running.insert(ticket.spec, handle);
                            self.snapshot(
                                OrchestrationState::Running,
                                &spec_states,
                                current_batch,
                                total_batches,
                                running.len(),
                                &mut ctl,
                                &mut seq,
                            )?;
                        }
                        Admission::BudgetHold { fresh } => {
                            if fresh {
                                let used = ctl.budget_used(now);
                                self.emit(
                                    &mut events,
                                    OrchestrationEventKind::LaunchBudgetHold { used },
                                );
                                self.snapshot(
                                    OrchestrationState::Running,
                                    &spec_states,
                                    current_batch,
                                    total_batches,
                                    running.len(),
                                    &mut ctl,
                                    &mut seq,
                                )?;
                            }
                            break;
                        }
                        Admission::AtCapacity | Admission::LaunchHold { .. } => break,
                    }
                }

                if running.is_empty() && ready.is_empty() && parked.is_empty() {
                    break;
                }

                match rx.recv_timeout(StdDuration::from_millis(20)) {
                    Ok(WorkerMsg::RateLimited { spec, attempt }) => {
                        if let Some(handle) = running.remove(&spec) {
                            let _ = handle.join();
                        }
                        let now = self.clock.now();
                        let backoff = ctl.backoff_ms(attempt);
                        let throttled = ctl.record_signal(now, backoff);
                        self.emit(
                            &mut events,
                            OrchestrationEventKind::SpecRateLimited {
                                spec: spec.clone(),
                                attempt,
                            },
                        );
                        if throttled {
                            self.emit(
                                &mut events,
                                OrchestrationEventKind::ParallelThrottled {
                                    effective: ctl.effective(),
                                },
                            );
                        }

                        if attempt >= ctl.max_retries() {
                            let message = format!(
                                "rate-limit retries exhausted after {attempt} attempts"
                            );
                            let entry = spec_states
                                .get_mut(&spec)
                                .expect("selected spec tracked");
                            entry.status = SpecRunState::Failed;
                            entry.error = Some(
                                CoreError::RateLimitFatal(message.clone()).to_string(),
                            );
                            self.emit(
                                &mut events,
                                OrchestrationEventKind::SpecFailed {
                                    spec,
                                    error: message,
                                },
                            );
                        } else {
                            spec_states
                                .get_mut(&spec)
                                .expect("selected spec tracked")
                                .status = SpecRunState::RateLimited;
                            parked.push(LaunchTicket {
                                spec,
                                attempt: attempt + 1,
                                not_before: Some(
                                    now + Duration::milliseconds(backoff as i64),
                                ),
                            });
                        }
                        self.snapshot(
                            OrchestrationState::Running,
                            &spec_states,
                            current_batch,
                            total_batches,
                            running.len(),
                            &mut ctl,
                            &mut seq,
                        )?;
                    }
                    Ok(WorkerMsg::Done { spec, outcome }) => {
                        if let Some(handle) = running.remove(&spec) {
                            let _ = handle.join();
                        }
                        let entry = spec_states
                            .get_mut(&spec)
                            .expect("selected spec tracked");
                        match outcome {
                            AgentOutcome::Completed => {
                                entry.status = SpecRunState::Completed;
                                self.emit(
                                    &mut events,
                                    OrchestrationEventKind::SpecComplete { spec },
                                );
                            }
                            AgentOutcome::TimedOut => {
                                entry.status = SpecRunState::Timeout;
                                entry.error = Some("agent deadline exceeded".to_string());
                                self.emit(
                                    &mut events,
                                    OrchestrationEventKind::SpecFailed {
                                        spec,
                                        error: "agent deadline exceeded".to_string(),
                                    },
                                );
                            }
                            AgentOutcome::Failed { message } => {
                                entry.status = SpecRunState::Failed;
                                entry.error = Some(message.clone());
                                self.emit(
                                    &mut events,
                                    OrchestrationEventKind::SpecFailed {
                                        spec,
                                        error: message,
                                    },
                                );
                            }
                            AgentOutcome::RateLimited => unreachable!("sent as RateLimited"),
                        }
                        self.snapshot(
                            OrchestrationState::Running,
                            &spec_states,
                            current_batch,
                            total_batches,
                            running.len(),
                            &mut ctl,
                            &mut seq,
                        )?;
                    }
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }

            if !stopped {
                self.emit(
                    &mut events,
                    OrchestrationEventKind::BatchComplete {
                        batch: current_batch,
                    },
                );
                self.snapshot(
                    OrchestrationState::Running,
                    &spec_states,
                    current_batch,
                    total_batches,
                    0,
                    &mut ctl,
                    &mut seq,
                )?;
            }
        }

        let final_state = if stopped {
            OrchestrationState::Stopped
        } else if spec_states
            .values()
            .any(|s| matches!(s.status, SpecRunState::Failed | SpecRunState::Timeout))
        {
            OrchestrationState::Failed
        } else {
            OrchestrationState::Completed
        };

        self.emit(
            &mut events,
            OrchestrationEventKind::OrchestrationComplete {
                status: final_state,
            },
        );
        let status = self.snapshot(
            final_state,
            &spec_states,
            current_batch,
            total_batches,
            0,
            &mut ctl,
            &mut seq,
        )?;

        Ok(OrchestrationRunResult { status, events })
    }

    fn mark_skipped(&self, spec_states: &mut BTreeMap<String, SpecStatusEntry>, spec: &str) {
        if let Some(entry) = spec_states.get_mut(spec)
            && !entry.status.is_terminal()
        {
            entry.status = SpecRunState::Skipped;
        }
    }

    fn emit(&self, events: &mut Vec<OrchestrationEvent>, kind: OrchestrationEventKind) {
        events.push(OrchestrationEvent {
            timestamp: self.clock.now(),
            kind,
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn snapshot(
        &self,
        state: OrchestrationState,
        spec_states: &BTreeMap<String, SpecStatusEntry>,
        current_batch: usize,
        total_batches: usize,
        running: usize,
        ctl: &mut AdmissionController,
        seq: &mut u64,
    ) -> Result<OrchestrationStatus> {
        let now = self.clock.now();
        let completed = spec_states
            .values()
            .filter(|s| s.status == SpecRunState::Completed)
            .count();
        let failed = spec_states
            .values()
            .filter(|s| matches!(s.status, SpecRunState::Failed | SpecRunState::Timeout))
            .count();
        let skipped = spec_states
            .values()
            .filter(|s| s.status == SpecRunState::Skipped)
            .count();

        let status = OrchestrationStatus {
            status: state,
            total_specs: spec_states.len(),
            completed_specs: completed,
            failed_specs: failed,
            running_specs: running,
            skipped_specs: skipped,
            current_batch,
            total_batches,
            parallel: ParallelSnapshot {
                max: ctl.max(),
                effective: ctl.effective(),
                adaptive: self.params.adaptive_parallel,
            },
            rate_limit: RateLimitSnapshot {
                signal_count: ctl.signal_count(),
                total_backoff_ms: ctl.total_backoff_ms(),
                launch_budget: LaunchBudgetSnapshot {
                    per_minute: self.params.launch_budget_per_minute,
                    window_ms: self.params.launch_budget_window_ms,
                    used: ctl.budget_used(now),
                    hold_count: ctl.budget_hold_count(),
                    last_hold_at: ctl.last_hold_at(),
                },
            },
            specs: spec_states.clone(),
            snapshot_seq: *seq,
            updated_at: now,
        };
        *seq += 1;
        store::write_json(&self.layout.orchestration_status(), &status)?;
        Ok(status)
    }
}

/// Restrict the graph to the requested specs (empty = all). Dependencies on
/// unselected specs are treated as already satisfied.
fn select_nodes(all: Vec<SpecNode>, requested: &[String]) -> Result<Vec<SpecNode>> {
    if requested.is_empty() {
        return Ok(all);
    }
    let known: BTreeSet<&str> = all.iter().map(|n| n.name.as_str()).collect();
    for name in requested {
        if !known.contains(name.as_str()) {
            return Err(CoreError::NotFound(format!("unknown spec: {name}")));
        }
    }
    let wanted: BTreeSet<&str> = requested.iter().map(String::as_str).collect();
    Ok(all
        .into_iter()
        .filter(|n| wanted.contains(n.name.as_str()))
        .collect())
}

/// Group specs into topologically ordered batches; specs inside a batch are
/// mutually independent.
pub fn build_batches(nodes: &[SpecNode]) -> Result<Vec<Vec<String>>> {
    let selected: BTreeSet<&str> = nodes.iter().map(|n| n.name.as_str()).collect();
    let mut indegree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for node in nodes {
        let deps: Vec<&str> = node
            .depends_on
            .iter()
            .map(String::as_str)
            .filter(|d| selected.contains(d) && *d != node.name)
            .collect();
        indegree.insert(node.name.as_str(), deps.len());
        for dep in deps {
            dependents.entry(dep).or_default().push(node.name.as_str());
        }
    }

    let mut batches: Vec<Vec<String>> = Vec::new();
    let mut placed = 0usize;
    let mut frontier: Vec<&str> = indegree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(name, _)| *name)
        .collect();

    while !frontier.is_empty() {
        frontier.sort_unstable();
        placed += frontier.len();
        let mut next: Vec<&str> = Vec::new();
        for name in &frontier {
            if let Some(deps) = dependents.get(name) {
                for dependent in deps {
                    let deg = indegree
                        .get_mut(dependent)
                        .expect("dependent tracked in indegree");
                    *deg -= 1;
                    if *deg == 0 {
                        next.push(dependent);
                    }
                }
            }
        }
        batches.push(frontier.iter().map(|s| s.to_string()).collect());
        frontier = next;
    }

    if placed != nodes.len() {
        return Err(CoreError::InputValidation(
            "dependency cycle detected in spec graph".to_string(),
        ));
    }
    Ok(batches)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tempfile::tempdir;

    use super::*;
    use crate::clock::system_clock;

    /// Scripted runner: per-spec queue of outcomes, then Completed forever.
    struct ScriptedAgent {
        script: Mutex<BTreeMap<String, Vec<AgentOutcome>>>,
        delay_ms: u64,
        started: Mutex<Vec<String>>,
    }

    impl ScriptedAgent {
        fn new(delay_ms: u64) -> Self {
            Self {
                script: Mutex::new(BTreeMap::new()),
                delay_ms,
                started: Mutex::new(Vec::new()),
            }
        }

        fn stub(&self, spec: &str, outcomes: Vec<AgentOutcome>) {
            self.script.lock().unwrap().insert(spec.to_string(), outcomes);
        }

        fn started(&self) -> Vec<String> {
            self.started.lock().unwrap().clone()
        }
    }

    impl AgentRunner for ScriptedAgent {
        fn run_spec(&self, spec: &str, cancel: &CancelToken) -> AgentOutcome {
            self.started.lock().unwrap().push(spec.to_string());
            let mut waited = 0;
            while waited < self.delay_ms {
                if cancel.is_cancelled() {
                    return AgentOutcome::Failed {
                        message: "cancelled".to_string(),
                    };
                }
                thread::sleep(StdDuration::from_millis(5));
                waited += 5;
            }
            let mut script = self.script.lock().unwrap();
            match script.get_mut(spec) {
                Some(queue) if !queue.is_empty() => queue.remove(0),
                _ => AgentOutcome::Completed,
            }
        }
    }

    fn fast_params() -> RateLimitParams {
        RateLimitParams {
            max_retries: 3,
            backoff_base_ms: 10,
            backoff_max_ms: 50,
            adaptive_parallel: true,
            parallel_floor: 1,
            cooldown_ms: 60_000,
            launch_budget_per_minute: 100,
            launch_budget_window_ms: 60_000,
            signal_window_ms: 60_000,
            signal_threshold: 10,
            signal_extra_hold_ms: 5,
            dynamic_budget_floor: 1,
        }
    }

    struct TableProvider(Vec<SpecNode>);

    impl SpecGraphProvider for TableProvider {
        fn specs(&self) -> Result<Vec<SpecNode>> {
            Ok(self.0.clone())
        }
    }

    fn node(name: &str, deps: &[&str]) -> SpecNode {
        SpecNode {
            name: name.to_string(),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    fn count_events(events: &[OrchestrationEvent], want: fn(&OrchestrationEventKind) -> bool) -> usize {
        events.iter().filter(|e| want(&e.kind)).count()
    }

    #[test]
    fn batches_follow_the_dependency_graph() {
        let nodes = vec![
            node("api", &["core"]),
            node("core", &[]),
            node("ui", &["api"]),
            node("docs", &[]),
        ];
        let batches = build_batches(&nodes).expect("batches");
        assert_eq!(
            batches,
            vec![
                vec!["core".to_string(), "docs".to_string()],
                vec!["api".to_string()],
                vec!["ui".to_string()],
            ]
        );
    }

    #[test]
    fn cycle_is_rejected() {
        let nodes = vec![node("a", &["b"]), node("b", &["a"])];
        let err = build_batches(&nodes).expect_err("cycle");
        assert_eq!(err.machine_name(), "input-validation");
    }

    #[test]
    fn all_specs_complete_and_events_arrive_in_batch_order() {
        let td = tempdir().expect("tempdir");
        let layout = Layout::with_default_ns(td.path());
        let agent = Arc::new(ScriptedAgent::new(10));
        let orch = Orchestrator::new(
            layout.clone(),
            system_clock(),
            agent.clone(),
            fast_params(),
        );

        let provider = TableProvider(vec![
            node("core", &[]),
            node("api", &["core"]),
        ]);
        let result = orch
            .run(&provider, &OrchestrateOptions::default(), &CancelToken::new())
            .expect("run");

        assert_eq!(result.status.status, OrchestrationState::Completed);
        assert_eq!(result.status.completed_specs, 2);
        assert_eq!(result.status.failed_specs, 0);
        assert_eq!(result.status.running_specs, 0);

        // core finished (its batch completed) before api started.
        let api_start = result
            .events
            .iter()
            .position(|e| {
                e.kind
                    == OrchestrationEventKind::SpecStart {
                        spec: "api".to_string(),
                    }
            })
            .expect("api started");
        let batch1_complete = result
            .events
            .iter()
            .position(|e| e.kind == OrchestrationEventKind::BatchComplete { batch: 1 })
            .expect("batch 1 completed");
        assert!(batch1_complete < api_start);

        // Snapshot on disk matches the returned final state.
        let persisted =
            store::read_json::<OrchestrationStatus>(&layout.orchestration_status())
                .expect("read")
                .expect("snapshot exists");
        assert_eq!(persisted.status, OrchestrationState::Completed);
        assert_eq!(
            persisted.completed_specs
                + persisted.failed_specs
                + persisted.running_specs
                + persisted.skipped_specs,
            persisted.total_specs
        );
    }

    #[test]
    fn rate_limit_signal_throttles_then_spec_recovers() {
        let td = tempdir().expect("tempdir");
        let layout = Layout::with_default_ns(td.path());
        let agent = Arc::new(ScriptedAgent::new(10));
        agent.stub("s2", vec![AgentOutcome::RateLimited]);
        let orch =
            Orchestrator::new(layout, system_clock(), agent.clone(), fast_params());

        let provider = TableProvider(vec![
            node("s1", &[]),
            node("s2", &[]),
            node("s3", &[]),
            node("s4", &[]),
        ]);
        let result = orch
            .run(
                &provider,
                &OrchestrateOptions {
                    max_parallel: 4,
                    ..Default::default()
                },
                &CancelToken::new(),
            )
            .expect("run");

        assert_eq!(result.status.status, OrchestrationState::Completed);
        assert_eq!(result.status.completed_specs, 4);
        assert_eq!(result.status.rate_limit.signal_count, 1);
        // One signal, no recovery inside the short run.
        assert_eq!(result.status.parallel.effective, 3);
        assert!(result.status.parallel.effective < result.status.parallel.max);

        assert_eq!(
            count_events(&result.events, |k| matches!(
                k,
                OrchestrationEventKind::SpecRateLimited { .. }
            )),
            1
        );
        assert_eq!(
            count_events(&result.events, |k| matches!(
                k,
                OrchestrationEventKind::ParallelThrottled { .. }
            )),
            1
        );
        // s2 was launched twice: initial attempt and the retry.
        assert_eq!(
            agent.started().iter().filter(|s| *s == "s2").count(),
            2
        );
    }

    #[test]
    fn exhausted_rate_limit_retries_fail_the_spec() {
        let td = tempdir().expect("tempdir");
        let layout = Layout::with_default_ns(td.path());
        let agent = Arc::new(ScriptedAgent::new(5));
        agent.stub(
            "flaky",
            vec![
                AgentOutcome::RateLimited,
                AgentOutcome::RateLimited,
                AgentOutcome::RateLimited,
            ],
        );
        let orch = Orchestrator::new(layout, system_clock(), agent, fast_params());

        let provider = TableProvider(vec![node("flaky", &[])]);
        let result = orch
            .run(&provider, &OrchestrateOptions::default(), &CancelToken::new())
            .expect("run");

        assert_eq!(result.status.status, OrchestrationState::Failed);
        let entry = &result.status.specs["flaky"];
        assert_eq!(entry.status, SpecRunState::Failed);
        assert!(entry
            .error
            .as_deref()
            .unwrap_or("")
            .contains("rate limit fatal"));
    }

    #[test]
    fn timeout_is_a_terminal_failure() {
        let td = tempdir().expect("tempdir");
        let layout = Layout::with_default_ns(td.path());
        let agent = Arc::new(ScriptedAgent::new(5));
        agent.stub("slow", vec![AgentOutcome::TimedOut]);
        let orch = Orchestrator::new(layout, system_clock(), agent, fast_params());

        let provider = TableProvider(vec![node("slow", &[]), node("ok", &[])]);
        let result = orch
            .run(&provider, &OrchestrateOptions::default(), &CancelToken::new())
            .expect("run");

        assert_eq!(result.status.status, OrchestrationState::Failed);
        assert_eq!(result.status.specs["slow"].status, SpecRunState::Timeout);
        assert_eq!(result.status.specs["ok"].status, SpecRunState::Completed);
        assert_eq!(result.status.failed_specs, 1);
    }

    #[test]
    fn stop_skips_queued_specs_and_is_idempotent() {
        let td = tempdir().expect("tempdir");
        let layout = Layout::with_default_ns(td.path());
        let agent = Arc::new(ScriptedAgent::new(50));
        let orch = Orchestrator::new(
            layout.clone(),
            system_clock(),
            agent,
            fast_params(),
        );

        let cancel = CancelToken::new();
        cancel.cancel();

        let provider = TableProvider(vec![
            node("a", &[]),
            node("b", &["a"]),
        ]);
        let result = orch
            .run(
                &provider,
                &OrchestrateOptions {
                    max_parallel: 1,
                    ..Default::default()
                },
                &cancel,
            )
            .expect("run");

        assert_eq!(result.status.status, OrchestrationState::Stopped);
        assert!(result
            .status
            .specs
            .values()
            .all(|s| s.status == SpecRunState::Skipped));

        // Stop against the persisted snapshot is idempotent.
        let clock = system_clock();
        Orchestrator::request_stop(&layout, &clock).expect("stop");
        Orchestrator::request_stop(&layout, &clock).expect("stop again");
    }

    #[test]
    fn selection_rejects_unknown_specs() {
        let err = select_nodes(
            vec![node("a", &[])],
            &["missing".to_string()],
        )
        .expect_err("unknown");
        assert_eq!(err.machine_name(), "not-found");
    }

    #[test]
    fn dir_provider_reads_spec_dirs_and_dependencies() {
        let td = tempdir().expect("tempdir");
        let layout = Layout::with_default_ns(td.path());

        for spec in ["core", "api"] {
            std::fs::create_dir_all(layout.spec_dir(spec)).expect("mkdir");
        }
        std::fs::write(
            layout.spec_dir("api").join("spec.json"),
            r#"{"depends_on": ["core"]}"#,
        )
        .expect("write");

        let provider = DirSpecProvider::new(layout);
        let nodes = provider.specs().expect("specs");
        assert_eq!(nodes.len(), 2);
        let api = nodes.iter().find(|n| n.name == "api").expect("api");
        assert_eq!(api.depends_on, vec!["core"]);
    }

    #[test]
    fn event_names_serialize_with_contract_names() {
        let event = OrchestrationEvent {
            timestamp: Utc::now(),
            kind: OrchestrationEventKind::LaunchBudgetHold { used: 4 },
        };
        let json = serde_json::to_string(&event).expect("serialize");
        assert!(json.contains("\"event\":\"launch:budget-hold\""));

        let event = OrchestrationEvent {
            timestamp: Utc::now(),
            kind: OrchestrationEventKind::SpecRateLimited {
                spec: "s1".into(),
                attempt: 1,
            },
        };
        let json = serde_json::to_string(&event).expect("serialize");
        assert!(json.contains("\"event\":\"spec:rate-limited\""));
    }
}
