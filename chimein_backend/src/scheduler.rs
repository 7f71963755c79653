use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::engagement::{ConfigStore, EngagementCoordinator};

/// Fires engagement runs on the cron schedule stored in the engagement config.
///
/// The config is re-read at least every `recheck` so frequency or enablement
/// changes made through the admin API take effect without a restart.
pub struct EngagementScheduler {
    coordinator: Arc<EngagementCoordinator>,
    config: Arc<dyn ConfigStore>,
    recheck: Duration,
}

impl EngagementScheduler {
    pub fn new(
        coordinator: Arc<EngagementCoordinator>,
        config: Arc<dyn ConfigStore>,
        recheck: Duration,
    ) -> Self {
        Self {
            coordinator,
            config,
            recheck: recheck.max(Duration::from_secs(1)),
        }
    }

    pub async fn run_loop(self) {
        tracing::info!("Engagement scheduler starting (recheck every {:?})", self.recheck);
        let mut next_due: Option<(String, DateTime<Utc>)> = None;

        loop {
            let now = Utc::now();
            let config = match self.config.get_config() {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("Scheduler could not read engagement config: {:#}", e);
                    tokio::time::sleep(self.recheck).await;
                    continue;
                }
            };

            if !config.enabled {
                next_due = None;
                tokio::time::sleep(self.recheck).await;
                continue;
            }

            let due = match next_due {
                Some((ref frequency, at)) if *frequency == config.frequency => at,
                _ => match next_run_for(&config.frequency, now) {
                    Ok(at) => {
                        tracing::info!("Next engagement run at {}", at.to_rfc3339());
                        next_due = Some((config.frequency.clone(), at));
                        at
                    }
                    Err(e) => {
                        tracing::warn!("{:#}", e);
                        next_due = None;
                        tokio::time::sleep(self.recheck).await;
                        continue;
                    }
                },
            };

            if now >= due {
                next_due = None;
                if let Err(e) = self.coordinator.run_once().await {
                    tracing::error!("Scheduled engagement run failed: {:#}", e);
                }
                continue;
            }

            tokio::time::sleep(wait_until(now, due, self.recheck)).await;
        }
    }
}

/// Next fire time strictly after `from`. Accepts 5-field crontab syntax as well
/// as the 6/7-field form with seconds.
pub fn next_run_for(expression: &str, from: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let normalized = normalize_expression(expression)?;
    let schedule = Schedule::from_str(&normalized)
        .with_context(|| format!("Invalid cron expression: {expression}"))?;
    schedule
        .after(&from)
        .next()
        .ok_or_else(|| anyhow::anyhow!("No future occurrence for expression: {expression}"))
}

pub fn validate_expression(expression: &str) -> Result<()> {
    next_run_for(expression, Utc::now()).map(|_| ())
}

fn normalize_expression(expression: &str) -> Result<String> {
    let expression = expression.trim();
    let field_count = expression.split_whitespace().count();

    match field_count {
        5 => Ok(format!("0 {expression}")),
        6 | 7 => Ok(expression.to_string()),
        _ => anyhow::bail!(
            "Invalid cron expression: {expression} (expected 5, 6, or 7 fields, got {field_count})"
        ),
    }
}

fn wait_until(now: DateTime<Utc>, due: DateTime<Utc>, cap: Duration) -> Duration {
    (due - now).to_std().unwrap_or_default().min(cap)
}
