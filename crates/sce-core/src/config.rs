//! Persisted configuration documents.
//!
//! Three documents live under `config/`: the orchestrator rate-limit config
//! (camelCase keys, contractual), the studio security policy, and the
//! errorbook registry source list. Defaults are materialized on first read;
//! a corrupt document falls back to defaults with a warning rather than
//! aborting the command.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::layout::Layout;
use crate::store;

/// Named rate-limit parameter presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitProfile {
    /// Few launches, long holds; for shared upstreams.
    Conservative,
    #[default]
    Balanced,
    /// Fast ramp-up, short holds; for dedicated capacity.
    Aggressive,
}

impl std::str::FromStr for RateLimitProfile {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "conservative" => Ok(Self::Conservative),
            "balanced" => Ok(Self::Balanced),
            "aggressive" => Ok(Self::Aggressive),
            other => Err(format!("unknown rate-limit profile: {other}")),
        }
    }
}

/// Fully-resolved rate-limit parameters consumed by the admission
/// controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitParams {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub adaptive_parallel: bool,
    pub parallel_floor: usize,
    pub cooldown_ms: u64,
    pub launch_budget_per_minute: u32,
    pub launch_budget_window_ms: u64,
    pub signal_window_ms: u64,
    pub signal_threshold: u32,
    pub signal_extra_hold_ms: u64,
    pub dynamic_budget_floor: usize,
}

impl RateLimitProfile {
    pub fn params(&self) -> RateLimitParams {
        match self {
            RateLimitProfile::Conservative => RateLimitParams {
                max_retries: 3,
                backoff_base_ms: 2_000,
                backoff_max_ms: 60_000,
                adaptive_parallel: true,
                parallel_floor: 1,
                cooldown_ms: 60_000,
                launch_budget_per_minute: 4,
                launch_budget_window_ms: 60_000,
                signal_window_ms: 120_000,
                signal_threshold: 2,
                signal_extra_hold_ms: 15_000,
                dynamic_budget_floor: 1,
            },
            RateLimitProfile::Balanced => RateLimitParams {
                max_retries: 5,
                backoff_base_ms: 1_000,
                backoff_max_ms: 30_000,
                adaptive_parallel: true,
                parallel_floor: 2,
                cooldown_ms: 30_000,
                launch_budget_per_minute: 8,
                launch_budget_window_ms: 60_000,
                signal_window_ms: 60_000,
                signal_threshold: 3,
                signal_extra_hold_ms: 10_000,
                dynamic_budget_floor: 2,
            },
            RateLimitProfile::Aggressive => RateLimitParams {
                max_retries: 8,
                backoff_base_ms: 500,
                backoff_max_ms: 15_000,
                adaptive_parallel: true,
                parallel_floor: 2,
                cooldown_ms: 15_000,
                launch_budget_per_minute: 16,
                launch_budget_window_ms: 60_000,
                signal_window_ms: 30_000,
                signal_threshold: 5,
                signal_extra_hold_ms: 5_000,
                dynamic_budget_floor: 2,
            },
        }
    }
}

/// Persistent orchestrator configuration (`config/orchestrator.json`).
///
/// The profile selects coherent defaults; any explicitly-set key overrides
/// its profile default. Key names are contractual camelCase.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestratorConfig {
    pub rate_limit_profile: RateLimitProfile,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_max_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_backoff_base_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_backoff_max_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_adaptive_parallel: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_parallel_floor: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_cooldown_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_launch_budget_per_minute: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_launch_budget_window_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_signal_window_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_signal_threshold: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_signal_extra_hold_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_dynamic_budget_floor: Option<usize>,
}

impl OrchestratorConfig {
    /// Resolve effective parameters. A runtime `profile_override` applies to
    /// this resolution only and suppresses the persisted per-key overrides
    /// (a single-run profile means exactly that profile's preset).
    pub fn resolve(&self, profile_override: Option<RateLimitProfile>) -> RateLimitParams {
        if let Some(profile) = profile_override {
            return profile.params();
        }
        let mut p = self.rate_limit_profile.params();
        if let Some(v) = self.rate_limit_max_retries {
            p.max_retries = v;
        }
        if let Some(v) = self.rate_limit_backoff_base_ms {
            p.backoff_base_ms = v;
        }
        if let Some(v) = self.rate_limit_backoff_max_ms {
            p.backoff_max_ms = v;
        }
        if let Some(v) = self.rate_limit_adaptive_parallel {
            p.adaptive_parallel = v;
        }
        if let Some(v) = self.rate_limit_parallel_floor {
            p.parallel_floor = v.max(1);
        }
        if let Some(v) = self.rate_limit_cooldown_ms {
            p.cooldown_ms = v;
        }
        if let Some(v) = self.rate_limit_launch_budget_per_minute {
            p.launch_budget_per_minute = v;
        }
        if let Some(v) = self.rate_limit_launch_budget_window_ms {
            p.launch_budget_window_ms = v;
        }
        if let Some(v) = self.rate_limit_signal_window_ms {
            p.signal_window_ms = v;
        }
        if let Some(v) = self.rate_limit_signal_threshold {
            p.signal_threshold = v;
        }
        if let Some(v) = self.rate_limit_signal_extra_hold_ms {
            p.signal_extra_hold_ms = v;
        }
        if let Some(v) = self.rate_limit_dynamic_budget_floor {
            p.dynamic_budget_floor = v.max(1);
        }
        p
    }
}

/// Stages that may require authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivilegedStage {
    Apply,
    Release,
    Rollback,
}

/// Default env var holding the shared studio secret.
pub const DEFAULT_PASSWORD_ENV: &str = "SCE_STUDIO_AUTH_PASSWORD";

/// Env flag that forces authorization on regardless of the policy file.
pub const AUTH_FORCE_ENV: &str = "SCE_STUDIO_AUTH_FORCE";

/// Studio security policy (`config/studio-security.json`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StudioSecurityPolicy {
    pub enabled: bool,
    pub require_auth_for: Vec<PrivilegedStage>,
    pub password_env: String,
}

impl Default for StudioSecurityPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            require_auth_for: vec![
                PrivilegedStage::Apply,
                PrivilegedStage::Release,
                PrivilegedStage::Rollback,
            ],
            password_env: DEFAULT_PASSWORD_ENV.to_string(),
        }
    }
}

/// One remote errorbook source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistrySource {
    pub name: String,
    /// `https://…` URI or a local path.
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_url: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Errorbook registry configuration (`config/errorbook-registry.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ErrorbookRegistryConfig {
    pub sources: Vec<RegistrySource>,
}

/// A loaded config plus whether the on-disk copy was usable.
#[derive(Debug, Clone)]
pub struct Loaded<T> {
    pub value: T,
    /// Set when the document existed but failed to parse and defaults were
    /// substituted.
    pub corrupt_fallback: bool,
}

fn load_or_init<T>(path: &std::path::Path) -> Result<Loaded<T>>
where
    T: Default + Serialize + DeserializeOwned,
{
    match store::read_json::<T>(path) {
        Ok(Some(value)) => Ok(Loaded {
            value,
            corrupt_fallback: false,
        }),
        Ok(None) => {
            let value = T::default();
            store::write_json(path, &value)?;
            Ok(Loaded {
                value,
                corrupt_fallback: false,
            })
        }
        Err(crate::error::CoreError::Corruption(_)) => Ok(Loaded {
            value: T::default(),
            corrupt_fallback: true,
        }),
        Err(e) => Err(e),
    }
}

pub fn load_orchestrator_config(layout: &Layout) -> Result<Loaded<OrchestratorConfig>> {
    load_or_init(&layout.orchestrator_config())
}

pub fn load_studio_security(layout: &Layout) -> Result<Loaded<StudioSecurityPolicy>> {
    load_or_init(&layout.studio_security())
}

pub fn load_registry_config(layout: &Layout) -> Result<Loaded<ErrorbookRegistryConfig>> {
    load_or_init(&layout.errorbook_registry_config())
}

pub fn save_orchestrator_config(layout: &Layout, config: &OrchestratorConfig) -> Result<()> {
    store::write_json(&layout.orchestrator_config(), config)
}
