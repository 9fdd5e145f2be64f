use std::time::Duration as StdDuration;

use anyhow::Context;
use chrono::Duration;

/// How a breached alert picks its next responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassignPolicy {
    /// Mentor in the student's cohort with the fewest open alerts.
    LeastLoaded,
    /// Mentor in the student's cohort who was escalated to least recently.
    RoundRobin,
}

impl std::str::FromStr for ReassignPolicy {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "least-loaded" => Ok(ReassignPolicy::LeastLoaded),
            "round-robin" => Ok(ReassignPolicy::RoundRobin),
            other => anyhow::bail!(
                "unknown reassign policy {other:?}, expected least-loaded or round-robin"
            ),
        }
    }
}

/// Runtime configuration, read from the environment with production
/// defaults. Only DATABASE_URL is required.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Maximum time a mentor has to acknowledge a new alert.
    pub sla_window: Duration,
    /// Interval for the watch loop between escalation sweeps.
    pub sweep_interval: StdDuration,
    /// After this many escalations the alert is parked for admin review.
    pub max_escalations: i32,
    /// Bounded attempts for store operations (CAS losses and outages).
    pub retry_attempts: u32,
    pub retry_base_delay: StdDuration,
    /// Notification delivery attempts before the outbox row is marked failed.
    pub max_delivery_attempts: i32,
    pub reassign_policy: ReassignPolicy,
    /// Lookback window for feature vectors, in days.
    pub evaluation_window_days: i64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .context("DATABASE_URL must be set to a production Postgres instance")?;

        let sla_hours: i64 = env_or("SLA_WINDOW_HOURS", 24)?;
        anyhow::ensure!(sla_hours > 0, "SLA_WINDOW_HOURS must be positive");

        let sweep_interval_secs: u64 = env_or("SWEEP_INTERVAL_SECS", 3600)?;
        let policy = match std::env::var("REASSIGN_POLICY") {
            Ok(raw) => raw.parse().context("REASSIGN_POLICY is invalid")?,
            Err(_) => ReassignPolicy::LeastLoaded,
        };

        Ok(Config {
            database_url,
            sla_window: Duration::hours(sla_hours),
            sweep_interval: StdDuration::from_secs(sweep_interval_secs),
            max_escalations: env_or("MAX_ESCALATIONS", 3)?,
            retry_attempts: env_or("RETRY_ATTEMPTS", 4)?,
            retry_base_delay: StdDuration::from_millis(env_or("RETRY_BASE_DELAY_MS", 50)?),
            max_delivery_attempts: env_or("MAX_DELIVERY_ATTEMPTS", 5)?,
            reassign_policy: policy,
            evaluation_window_days: env_or("EVALUATION_WINDOW_DAYS", 30)?,
        })
    }
}

fn env_or<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{name} has an invalid value: {raw:?}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassign_policy_parses_known_names() {
        assert_eq!(
            "least-loaded".parse::<ReassignPolicy>().unwrap(),
            ReassignPolicy::LeastLoaded
        );
        assert_eq!(
            "round-robin".parse::<ReassignPolicy>().unwrap(),
            ReassignPolicy::RoundRobin
        );
        assert!("random".parse::<ReassignPolicy>().is_err());
    }
}
