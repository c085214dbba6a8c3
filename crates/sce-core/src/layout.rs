//! Workspace layout.
//!
//! All contractual on-disk paths live here. A [`Layout`] is constructed once
//! per workspace and handed to every component; nothing else joins path
//! segments by hand.

use std::path::{Path, PathBuf};

/// Default namespace directory prefix.
pub const DEFAULT_NS: &str = ".sce";

pub const ORCHESTRATOR_CONFIG_FILE: &str = "orchestrator.json";
pub const ORCHESTRATION_STATUS_FILE: &str = "orchestration-status.json";
pub const STUDIO_SECURITY_FILE: &str = "studio-security.json";
pub const ERRORBOOK_REGISTRY_FILE: &str = "errorbook-registry.json";
pub const ERRORBOOK_INDEX_FILE: &str = "index.json";
pub const REGISTRY_CACHE_FILE: &str = "registry-cache.json";
pub const REGISTRY_EXPORT_FILE: &str = "errorbook-registry-export.json";
pub const LATEST_JOB_FILE: &str = "latest-job.json";
pub const SPEC_LOCK_FILE: &str = "lock.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
    ns: String,
}

impl Layout {
    pub fn new(workspace_root: impl Into<PathBuf>, ns: impl Into<String>) -> Self {
        Self {
            root: workspace_root.into(),
            ns: ns.into(),
        }
    }

    /// Layout rooted at `workspace_root` with the default `.sce` namespace.
    pub fn with_default_ns(workspace_root: impl Into<PathBuf>) -> Self {
        Self::new(workspace_root, DEFAULT_NS)
    }

    pub fn workspace_root(&self) -> &Path {
        &self.root
    }

    pub fn ns(&self) -> &str {
        &self.ns
    }

    /// `<root>/<ns>/`
    pub fn ns_dir(&self) -> PathBuf {
        self.root.join(&self.ns)
    }

    pub fn config_dir(&self) -> PathBuf {
        self.ns_dir().join("config")
    }

    pub fn orchestrator_config(&self) -> PathBuf {
        self.config_dir().join(ORCHESTRATOR_CONFIG_FILE)
    }

    pub fn orchestration_status(&self) -> PathBuf {
        self.config_dir().join(ORCHESTRATION_STATUS_FILE)
    }

    /// Cooperative stop request for a running orchestration.
    pub fn orchestration_stop(&self) -> PathBuf {
        self.config_dir().join("orchestration-stop.json")
    }

    pub fn studio_security(&self) -> PathBuf {
        self.config_dir().join(STUDIO_SECURITY_FILE)
    }

    pub fn errorbook_registry_config(&self) -> PathBuf {
        self.config_dir().join(ERRORBOOK_REGISTRY_FILE)
    }

    pub fn specs_dir(&self) -> PathBuf {
        self.ns_dir().join("specs")
    }

    pub fn spec_dir(&self, spec_id: &str) -> PathBuf {
        self.specs_dir().join(spec_id)
    }

    pub fn spec_lock(&self, spec_id: &str) -> PathBuf {
        self.spec_dir(spec_id).join(SPEC_LOCK_FILE)
    }

    pub fn pipeline_runs_dir(&self, spec_id: &str) -> PathBuf {
        self.spec_dir(spec_id).join("pipeline").join("runs")
    }

    pub fn pipeline_run(&self, spec_id: &str, run_id: &str) -> PathBuf {
        self.pipeline_runs_dir(spec_id).join(format!("{run_id}.json"))
    }

    pub fn studio_dir(&self) -> PathBuf {
        self.ns_dir().join("studio")
    }

    pub fn studio_jobs_dir(&self) -> PathBuf {
        self.studio_dir().join("jobs")
    }

    pub fn studio_job(&self, job_id: &str) -> PathBuf {
        self.studio_jobs_dir().join(format!("{job_id}.json"))
    }

    pub fn studio_events_dir(&self) -> PathBuf {
        self.studio_dir().join("events")
    }

    pub fn studio_events(&self, job_id: &str) -> PathBuf {
        self.studio_events_dir().join(format!("{job_id}.jsonl"))
    }

    pub fn latest_job(&self) -> PathBuf {
        self.studio_dir().join(LATEST_JOB_FILE)
    }

    pub fn errorbook_dir(&self) -> PathBuf {
        self.ns_dir().join("errorbook")
    }

    pub fn errorbook_index(&self) -> PathBuf {
        self.errorbook_dir().join(ERRORBOOK_INDEX_FILE)
    }

    pub fn errorbook_entries_dir(&self) -> PathBuf {
        self.errorbook_dir().join("entries")
    }

    pub fn errorbook_entry(&self, entry_id: &str) -> PathBuf {
        self.errorbook_entries_dir().join(format!("{entry_id}.json"))
    }

    pub fn registry_cache(&self) -> PathBuf {
        self.errorbook_dir().join(REGISTRY_CACHE_FILE)
    }

    pub fn registry_export(&self) -> PathBuf {
        self.errorbook_dir().join("exports").join(REGISTRY_EXPORT_FILE)
    }

    pub fn studio_reports_dir(&self) -> PathBuf {
        self.ns_dir().join("reports").join("studio")
    }

    pub fn verify_report(&self, job_id: &str) -> PathBuf {
        self.studio_reports_dir().join(format!("verify-{job_id}.json"))
    }

    pub fn release_report(&self, job_id: &str) -> PathBuf {
        self.studio_reports_dir().join(format!("release-{job_id}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_follow_the_contract() {
        let layout = Layout::with_default_ns("/ws");
        assert_eq!(layout.ns_dir(), PathBuf::from("/ws/.sce"));
        assert_eq!(
            layout.orchestrator_config(),
            PathBuf::from("/ws/.sce/config/orchestrator.json")
        );
        assert_eq!(
            layout.pipeline_run("auth-flow", "run-01"),
            PathBuf::from("/ws/.sce/specs/auth-flow/pipeline/runs/run-01.json")
        );
        assert_eq!(
            layout.studio_events("job-9"),
            PathBuf::from("/ws/.sce/studio/events/job-9.jsonl")
        );
        assert_eq!(
            layout.errorbook_entry("eb-1"),
            PathBuf::from("/ws/.sce/errorbook/entries/eb-1.json")
        );
        assert_eq!(
            layout.verify_report("job-9"),
            PathBuf::from("/ws/.sce/reports/studio/verify-job-9.json")
        );
        assert_eq!(
            layout.registry_export(),
            PathBuf::from("/ws/.sce/errorbook/exports/errorbook-registry-export.json")
        );
    }

    #[test]
    fn custom_ns_is_respected() {
        let layout = Layout::new("/ws", ".kiro");
        assert_eq!(layout.ns(), ".kiro");
        assert_eq!(
            layout.spec_lock("s1"),
            PathBuf::from("/ws/.kiro/specs/s1/lock.json")
        );
    }
}
