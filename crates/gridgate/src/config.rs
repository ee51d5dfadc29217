use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::Map;

/// Default delay ladder between successive submit attempts of one job.
/// Each failed attempt moves one rung up; success resets to the bottom.
fn default_submit_delays() -> Vec<u64> {
    vec![0, 60, 5 * 60, 15 * 60, 30 * 60]
}

/// Concurrency limits of one remote endpoint.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Maximum number of submit operations in flight at once.
    pub submit_limit: usize,
    /// Maximum number of jobs concurrently held at the endpoint.
    pub job_limit: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            submit_limit: 5,
            job_limit: 1000,
        }
    }
}

/// All numeric knobs of the engine. Loadable from a TOML file; every field
/// has a deployment-tested default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Minimum spacing between endpoint probes while the endpoint is up.
    probe_delay_secs: u64,
    /// Minimum spacing between endpoint probes while the endpoint is down.
    probe_interval_secs: u64,
    /// Default admission limits, overridable per endpoint below.
    pub default_limits: ResourceLimits,
    /// Admission limit overrides keyed by canonical endpoint name.
    pub resource_limits: Map<String, ResourceLimits>,
    /// Consecutive failed submit attempts after which a job is held.
    pub max_submit_attempts: usize,
    /// Delay ladder (seconds) between successive submit attempts.
    submit_delays_secs: Vec<u64>,
    /// Consecutive connectivity failures after which an endpoint probe is
    /// requested and further action deferred.
    pub connect_failure_limit: usize,
    /// Consecutive "remote knows nothing about this job" poll results after
    /// which the job is held.
    pub status_unknown_limit: usize,
    /// Spacing between remote status polls of one submitted job.
    poll_interval_secs: u64,
    /// Spacing between lease-renewal batch checks of one endpoint.
    lease_check_interval_secs: u64,
    /// Lease duration granted to jobs whose descriptor does not carry one.
    lease_duration_secs: Option<u64>,
    /// Maximum spacing between credential reconciliation passes.
    credential_check_interval_secs: u64,
    /// Remaining lifetime below which a credential counts as near expired.
    min_credential_lifetime_secs: u64,
    /// Directory holding the per-identity master credential copies.
    pub master_credential_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            probe_delay_secs: 15,
            probe_interval_secs: 5 * 60,
            default_limits: ResourceLimits::default(),
            resource_limits: Map::default(),
            max_submit_attempts: 5,
            submit_delays_secs: default_submit_delays(),
            connect_failure_limit: 3,
            status_unknown_limit: 3,
            poll_interval_secs: 60,
            lease_check_interval_secs: 60,
            lease_duration_secs: Some(60 * 60),
            credential_check_interval_secs: 10 * 60,
            min_credential_lifetime_secs: 3 * 60,
            master_credential_dir: PathBuf::from("master_credentials"),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_file(path: &Path) -> crate::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Limits for the given canonical endpoint name.
    pub fn limits_for(&self, endpoint: &str) -> ResourceLimits {
        self.resource_limits
            .get(endpoint)
            .copied()
            .unwrap_or(self.default_limits)
    }

    pub fn probe_delay(&self) -> Duration {
        Duration::from_secs(self.probe_delay_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn lease_check_interval(&self) -> Duration {
        Duration::from_secs(self.lease_check_interval_secs)
    }

    pub fn lease_duration(&self) -> Option<Duration> {
        self.lease_duration_secs.map(Duration::from_secs)
    }

    pub fn credential_check_interval(&self) -> Duration {
        Duration::from_secs(self.credential_check_interval_secs)
    }

    pub fn min_credential_lifetime(&self) -> Duration {
        Duration::from_secs(self.min_credential_lifetime_secs)
    }

    /// Delay before the next submit attempt after `attempts` failures.
    pub fn submit_attempt_delay(&self, attempts: usize) -> Duration {
        if self.submit_delays_secs.is_empty() {
            return Duration::ZERO;
        }
        let index = attempts.min(self.submit_delays_secs.len() - 1);
        Duration::from_secs(self.submit_delays_secs[index])
    }
}
