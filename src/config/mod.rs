//! Configuration module for groupkeeper.

use crate::error::{OperatorError, Result};
use crate::resilience::RetryConfig;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration for the operator core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorConfig {
    /// Retry policy wrapped around a whole diagnosis pass.
    #[serde(default = "RetryConfig::diagnosis")]
    pub diagnose_retry: RetryConfig,
    /// Retry policy wrapped around each remote repair call.
    #[serde(default)]
    pub action_retry: RetryConfig,
    /// Group view monitor settings.
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Group replication options applied on cluster creation.
    #[serde(default)]
    pub group: GroupOptions,
    /// Requeue delays handed to the event loop.
    #[serde(default)]
    pub requeue: RequeueConfig,
    /// Member addressing defaults.
    #[serde(default)]
    pub members: MemberDefaults,
    /// Logging configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            diagnose_retry: RetryConfig::diagnosis(),
            action_retry: RetryConfig::default(),
            monitor: MonitorConfig::default(),
            group: GroupOptions::default(),
            requeue: RequeueConfig::default(),
            members: MemberDefaults::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl OperatorConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| OperatorError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| OperatorError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        for (field, retry) in [
            ("diagnose_retry", &self.diagnose_retry),
            ("action_retry", &self.action_retry),
        ] {
            if retry.max_attempts == 0 {
                return Err(OperatorError::InvalidConfig {
                    field: format!("{}.max_attempts", field),
                    reason: "At least one attempt is required".to_string(),
                });
            }
            if retry.multiplier < 1.0 {
                return Err(OperatorError::InvalidConfig {
                    field: format!("{}.multiplier", field),
                    reason: "Backoff multiplier must be >= 1.0".to_string(),
                });
            }
        }

        if self.monitor.poll_interval.is_zero() {
            return Err(OperatorError::InvalidConfig {
                field: "monitor.poll_interval".to_string(),
                reason: "Poll interval must be non-zero".to_string(),
            });
        }

        if self.members.admin_user.is_empty() {
            return Err(OperatorError::InvalidConfig {
                field: "members.admin_user".to_string(),
                reason: "Admin user must be set".to_string(),
            });
        }

        Ok(())
    }
}

/// Group view monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Upper bound on a single wait for notifications.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Minimum time between reconnection attempts for one cluster.
    #[serde(with = "humantime_serde")]
    pub min_reconnect_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            min_reconnect_interval: Duration::from_secs(5),
        }
    }
}

/// How members authenticate to each other inside the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MemberAuth {
    /// Replication user with a password.
    #[default]
    Password,
    /// X.509 certificates issued by a common CA.
    CertIssuer,
}

/// What a member does after being expelled from the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStateAction {
    /// Shut the server down so the container restarts it.
    #[default]
    AbortServer,
    /// Stay up in read-only mode.
    ReadOnly,
    /// Go offline but keep the server running.
    OfflineMode,
}

/// Group replication options set when the cluster is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupOptions {
    /// Default member authentication, overridable per cluster.
    #[serde(default)]
    pub member_auth: MemberAuth,
    /// Action on expulsion.
    #[serde(default)]
    pub exit_state_action: ExitStateAction,
    /// Automatic rejoin attempts after expulsion. Zero leaves rejoin to the operator.
    #[serde(default)]
    pub auto_rejoin_tries: u32,
    /// Start group replication when the server boots.
    #[serde(default)]
    pub start_on_boot: bool,
}

impl Default for GroupOptions {
    fn default() -> Self {
        Self {
            member_auth: MemberAuth::Password,
            exit_state_action: ExitStateAction::AbortServer,
            auto_rejoin_tries: 0,
            start_on_boot: false,
        }
    }
}

/// Requeue delays used when an entry point reports a retriable error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequeueConfig {
    /// Delay when the error did not suggest one.
    #[serde(with = "humantime_serde")]
    pub default_delay: Duration,
    /// Delay when the cluster lock was busy.
    #[serde(with = "humantime_serde")]
    pub busy_delay: Duration,
    /// Interval between periodic cluster probes.
    #[serde(with = "humantime_serde")]
    pub probe_interval: Duration,
    /// Delay after a fatal error.
    #[serde(with = "humantime_serde")]
    pub fatal_delay: Duration,
}

impl Default for RequeueConfig {
    fn default() -> Self {
        Self {
            default_delay: Duration::from_secs(5),
            busy_delay: Duration::from_secs(2),
            probe_interval: Duration::from_secs(60),
            fatal_delay: Duration::from_secs(300),
        }
    }
}

/// Account management connections use unless configured otherwise.
pub const DEFAULT_ADMIN_USER: &str = "groupkeeper";

/// Addressing defaults for member pods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberDefaults {
    /// Account used for management connections.
    pub admin_user: String,
    /// SQL protocol port.
    pub port: u16,
    /// Auxiliary admin protocol port.
    pub admin_port: u16,
    /// DNS suffix appended to `<pod>.<cluster>-instances.<namespace>`.
    pub cluster_domain: String,
}

impl Default for MemberDefaults {
    fn default() -> Self {
        Self {
            admin_user: DEFAULT_ADMIN_USER.to_string(),
            port: 3306,
            admin_port: 33060,
            cluster_domain: "svc.cluster.local".to_string(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level or filter directive.
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Serde helper for Duration using humantime format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    /// Same format for `Option<Duration>`; `null` maps to `None`.
    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let s: Option<String> = Option::deserialize(deserializer)?;
            s.map(|s| super::parse_duration(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(s_val) = s.strip_suffix('s') {
            s_val
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else if let Some(m) = s.strip_suffix('m') {
            m.parse::<u64>()
                .map(|v| Duration::from_secs(v * 60))
                .map_err(|e| e.to_string())
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        }
    }
}
