//! Declarative gate steps.
//!
//! A gate step is a single declared subprocess whose exit code decides
//! pass/fail. The engine is agnostic to what the steps do; it only runs
//! them in order through the [`CommandRunner`] capability and folds the
//! results. Which steps make up a gate is declared by callers.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::SharedClock;
use crate::process::{CommandRequest, SharedRunner};

/// Declared step, as supplied by collaborators.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateStep {
    pub id: String,
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

fn default_required() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStepStatus {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepOutput {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateStepResult {
    pub id: String,
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub required: bool,
    pub status: GateStepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub output: StepOutput,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateRunReport {
    pub passed: bool,
    pub strict: bool,
    pub steps: Vec<GateStepResult>,
}

impl GateRunReport {
    /// Required steps that count as failures under the active profile.
    pub fn failing_required(&self) -> Vec<&GateStepResult> {
        self.steps
            .iter()
            .filter(|s| s.required)
            .filter(|s| {
                s.status == GateStepStatus::Failed
                    || (self.strict && s.status == GateStepStatus::Skipped)
            })
            .collect()
    }
}

/// Run the declared steps in order.
///
/// A failing required step stops execution; the remaining steps are
/// recorded as skipped. Optional-step failures are recorded but do not fail
/// the gate. Under `strict`, a skipped required step is equivalent to a
/// failed one.
pub fn run_steps(
    steps: &[GateStep],
    strict: bool,
    workspace_root: &std::path::Path,
    runner: &SharedRunner,
    clock: &SharedClock,
) -> GateRunReport {
    let mut results: Vec<GateStepResult> = Vec::new();
    let mut halted = false;

    for step in steps {
        if halted {
            let now = clock.now();
            results.push(GateStepResult {
                id: step.id.clone(),
                name: step.name.clone(),
                command: step.command.clone(),
                args: step.args.clone(),
                required: step.required,
                status: GateStepStatus::Skipped,
                exit_code: None,
                skip_reason: Some("previous required step failed".to_string()),
                started_at: now,
                completed_at: now,
                duration_ms: 0,
                output: StepOutput::default(),
            });
            continue;
        }

        let started_at = clock.now();
        let outcome = runner.run(&CommandRequest {
            command: step.command.clone(),
            args: step.args.clone(),
            working_dir: workspace_root.to_path_buf(),
            timeout: step.timeout_ms.map(Duration::from_millis),
        });
        let completed_at = clock.now();

        let status = if outcome.success() {
            GateStepStatus::Passed
        } else {
            GateStepStatus::Failed
        };
        if status == GateStepStatus::Failed && step.required {
            halted = true;
        }

        results.push(GateStepResult {
            id: step.id.clone(),
            name: step.name.clone(),
            command: step.command.clone(),
            args: step.args.clone(),
            required: step.required,
            status,
            exit_code: Some(outcome.exit_code),
            skip_reason: None,
            started_at,
            completed_at,
            duration_ms: outcome.duration_ms,
            output: StepOutput {
                stdout: outcome.stdout,
                stderr: outcome.stderr,
                error: outcome.error,
            },
        });
    }

    let report = GateRunReport {
        passed: true,
        strict,
        steps: results,
    };
    let passed = report.failing_required().is_empty();
    GateRunReport { passed, ..report }
}

/// Per-profile step declarations, loaded from a declaration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StepsDeclaration {
    pub verify: BTreeMap<String, Vec<GateStep>>,
    pub release: BTreeMap<String, Vec<GateStep>>,
}

impl StepsDeclaration {
    pub fn verify_steps(&self, profile: &str) -> Vec<GateStep> {
        self.verify.get(profile).cloned().unwrap_or_default()
    }

    pub fn release_steps(&self, profile: &str) -> Vec<GateStep> {
        self.release.get(profile).cloned().unwrap_or_default()
    }
}
