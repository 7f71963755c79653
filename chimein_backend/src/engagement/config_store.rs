use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Fixed key of the singleton engagement configuration (also the run-lease key).
pub const ENGAGEMENT_CONFIG_ID: &str = "engagement";

/// Every two hours, on the hour.
pub const DEFAULT_FREQUENCY: &str = "0 0 */2 * * *";
pub const DEFAULT_MIN_MESSAGE_GAP_MINS: u32 = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagementConfig {
    pub enabled: bool,
    /// Channels are scanned in this order; the first interjection ends the run.
    pub channel_ids: Vec<String>,
    /// Cron expression read by the scheduler, not by the pipeline.
    pub frequency: String,
    /// Minimum minutes between two interjections in the same channel. 0 disables the gate.
    pub min_message_gap_mins: u32,
    pub updated_at: DateTime<Utc>,
}

impl EngagementConfig {
    pub fn with_defaults(now: DateTime<Utc>) -> Self {
        Self {
            enabled: true,
            channel_ids: Vec::new(),
            frequency: DEFAULT_FREQUENCY.to_string(),
            min_message_gap_mins: DEFAULT_MIN_MESSAGE_GAP_MINS,
            updated_at: now,
        }
    }

    /// Merge the fields present in `patch` and stamp `updated_at`.
    pub fn apply(&mut self, patch: &EngagementConfigPatch, now: DateTime<Utc>) {
        if let Some(enabled) = patch.enabled {
            self.enabled = enabled;
        }
        if let Some(ref channel_ids) = patch.channel_ids {
            self.channel_ids = normalize_channel_ids(channel_ids);
        }
        if let Some(ref frequency) = patch.frequency {
            let frequency = frequency.trim();
            if !frequency.is_empty() {
                self.frequency = frequency.to_string();
            }
        }
        if let Some(gap) = patch.min_message_gap_mins {
            self.min_message_gap_mins = gap;
        }
        self.updated_at = now;
    }

    pub fn min_message_gap(&self) -> Option<Duration> {
        if self.min_message_gap_mins == 0 {
            None
        } else {
            Some(Duration::minutes(i64::from(self.min_message_gap_mins)))
        }
    }
}

/// Partial update; absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngagementConfigPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_message_gap_mins: Option<u32>,
}

/// Persistent home of the engagement configuration.
pub trait ConfigStore: Send + Sync {
    /// Returns the stored config, creating and persisting the defaults first if absent.
    fn get_config(&self) -> Result<EngagementConfig>;

    fn update_config(&self, patch: &EngagementConfigPatch) -> Result<EngagementConfig>;
}

/// Trim, drop blanks and duplicates, keep first-seen order.
fn normalize_channel_ids(raw: &[String]) -> Vec<String> {
    let mut channel_ids: Vec<String> = Vec::with_capacity(raw.len());
    for id in raw {
        let id = id.trim();
        if id.is_empty() || channel_ids.iter().any(|existing| existing == id) {
            continue;
        }
        channel_ids.push(id.to_string());
    }
    channel_ids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_enabled_with_no_channels() {
        let config = EngagementConfig::with_defaults(Utc::now());
        assert!(config.enabled);
        assert!(config.channel_ids.is_empty());
        assert_eq!(config.frequency, DEFAULT_FREQUENCY);
        assert_eq!(config.min_message_gap_mins, 30);
    }

    #[test]
    fn apply_merges_only_present_fields() {
        let created = Utc::now() - Duration::hours(1);
        let mut config = EngagementConfig::with_defaults(created);
        let now = Utc::now();

        config.apply(
            &EngagementConfigPatch {
                channel_ids: Some(vec![
                    " a ".to_string(),
                    "b".to_string(),
                    "a".to_string(),
                    "".to_string(),
                ]),
                ..Default::default()
            },
            now,
        );

        assert!(config.enabled);
        assert_eq!(config.channel_ids, vec!["a", "b"]);
        assert_eq!(config.frequency, DEFAULT_FREQUENCY);
        assert_eq!(config.updated_at, now);
    }

    #[test]
    fn blank_frequency_is_ignored() {
        let mut config = EngagementConfig::with_defaults(Utc::now());
        config.apply(
            &EngagementConfigPatch {
                frequency: Some("   ".to_string()),
                enabled: Some(false),
                ..Default::default()
            },
            Utc::now(),
        );
        assert_eq!(config.frequency, DEFAULT_FREQUENCY);
        assert!(!config.enabled);
    }

    #[test]
    fn zero_gap_disables_the_gate() {
        let mut config = EngagementConfig::with_defaults(Utc::now());
        assert_eq!(config.min_message_gap(), Some(Duration::minutes(30)));
        config.min_message_gap_mins = 0;
        assert_eq!(config.min_message_gap(), None);
    }
}
