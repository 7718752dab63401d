//! Tunable constants, loadable from the environment in the style of
//! `qarax::configuration::get_configuration` — overridable per-field so
//! tests can shrink the timeouts without touching the defaults consumers
//! get in production.

use std::time::Duration;

use serde::Deserialize;

/// Coordinator-wide tunables.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct MergeCoordinatorConfig {
    /// How long an EXTEND job may wait for the volume service's callback
    /// before it's removed outright (§4.3). Order of minutes in
    /// production; tests shrink this to make the timeout path reachable
    /// without a real clock.
    #[serde(with = "duration_secs")]
    pub extend_timeout: Duration,

    /// How long the cleanup worker sleeps between pivot attempts while in
    /// `RETRY`.
    #[serde(with = "duration_millis")]
    pub cleanup_wait_interval: Duration,

    /// How many times the cleanup worker will retry a not-ready pivot
    /// before promoting itself to `ABORT` (§5: "an implementation may cap
    /// retries").
    pub cleanup_max_retries: u32,

    /// Bound on how long the cleanup worker polls the domain chain after a
    /// successful pivot, waiting for it to reflect the post-merge layout.
    #[serde(with = "duration_secs")]
    pub post_pivot_chain_timeout: Duration,
}

impl Default for MergeCoordinatorConfig {
    fn default() -> Self {
        Self {
            extend_timeout: Duration::from_secs(5 * 60),
            cleanup_wait_interval: Duration::from_secs(2),
            cleanup_max_retries: 30,
            post_pivot_chain_timeout: Duration::from_secs(60),
        }
    }
}

/// Load configuration from `configuration/merge_coordinator.yaml` plus
/// environment overrides (`MERGE_EXTEND_TIMEOUT_SECS`,
/// `MERGE_CLEANUP_WAIT_INTERVAL_MS`, `MERGE_CLEANUP_MAX_RETRIES`), falling
/// back to [`MergeCoordinatorConfig::default`] field-by-field when neither
/// source sets a value.
pub fn load_configuration() -> Result<MergeCoordinatorConfig, config::ConfigError> {
    let defaults = MergeCoordinatorConfig::default();

    let settings = config::Config::builder()
        .set_default("extend_timeout", defaults.extend_timeout.as_secs())?
        .set_default(
            "cleanup_wait_interval",
            defaults.cleanup_wait_interval.as_millis() as u64,
        )?
        .set_default("cleanup_max_retries", defaults.cleanup_max_retries)?
        .set_default(
            "post_pivot_chain_timeout",
            defaults.post_pivot_chain_timeout.as_secs(),
        )?
        .add_source(
            config::File::with_name("configuration/merge_coordinator").required(false),
        )
        .set_override_option(
            "extend_timeout",
            std::env::var("MERGE_EXTEND_TIMEOUT_SECS").ok(),
        )?
        .set_override_option(
            "cleanup_wait_interval",
            std::env::var("MERGE_CLEANUP_WAIT_INTERVAL_MS").ok(),
        )?
        .set_override_option(
            "cleanup_max_retries",
            std::env::var("MERGE_CLEANUP_MAX_RETRIES").ok(),
        )?
        .build()?;

    settings.try_deserialize()
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
