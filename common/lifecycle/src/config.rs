use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use thiserror::Error;

/// Environment-driven settings for a [`Group`](crate::Group). Apply them with
/// [`GroupBuilder::with_config`](crate::GroupBuilder::with_config).
#[derive(Envconfig, Clone, Debug)]
pub struct LifecycleConfig {
    /// Total budget from "stop requested" to process exit.
    #[envconfig(from = "LIFECYCLE_GRACE_PERIOD_MS", default = "2000")]
    pub grace_period: EnvMsDuration,

    /// Part of the grace period reserved for shutdown functions.
    #[envconfig(from = "LIFECYCLE_SHUTDOWN_TIMEOUT_MS", default = "2000")]
    pub shutdown_timeout: EnvMsDuration,

    #[envconfig(from = "LIFECYCLE_TRAP_SIGNALS", default = "true")]
    pub trap_signals: bool,

    /// host:port for the readiness and liveness probes. Disabled when unset.
    #[envconfig(from = "LIFECYCLE_HEALTH_BIND")]
    pub health_bind: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Error, Debug, PartialEq, Eq)]
#[error("expected a duration in milliseconds")]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.trim().parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;

    #[test]
    fn defaults() {
        let config = LifecycleConfig::init_from_hashmap(&HashMap::new()).unwrap();
        assert_eq!(config.grace_period.0, Duration::from_secs(2));
        assert_eq!(config.shutdown_timeout.0, Duration::from_secs(2));
        assert!(config.trap_signals);
        assert!(config.health_bind.is_none());
    }

    #[test]
    fn overrides() {
        let env = HashMap::from([
            ("LIFECYCLE_GRACE_PERIOD_MS".to_string(), "30000".to_string()),
            ("LIFECYCLE_SHUTDOWN_TIMEOUT_MS".to_string(), "5000".to_string()),
            ("LIFECYCLE_TRAP_SIGNALS".to_string(), "false".to_string()),
            ("LIFECYCLE_HEALTH_BIND".to_string(), "127.0.0.1:9090".to_string()),
        ]);
        let config = LifecycleConfig::init_from_hashmap(&env).unwrap();
        assert_eq!(config.grace_period.0, Duration::from_secs(30));
        assert_eq!(config.shutdown_timeout.0, Duration::from_secs(5));
        assert!(!config.trap_signals);
        assert_eq!(config.health_bind.as_deref(), Some("127.0.0.1:9090"));
    }

    #[test]
    fn rejects_non_numeric_durations() {
        assert_eq!("10s".parse::<EnvMsDuration>(), Err(ParseEnvMsDurationError));
        assert_eq!(
            ParseEnvMsDurationError.to_string(),
            "expected a duration in milliseconds"
        );

        let env = HashMap::from([(
            "LIFECYCLE_GRACE_PERIOD_MS".to_string(),
            "soon".to_string(),
        )]);
        assert!(LifecycleConfig::init_from_hashmap(&env).is_err());
    }
}
