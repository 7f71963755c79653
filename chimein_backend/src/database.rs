use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use crate::engagement::config_store::{
    ConfigStore, EngagementConfig, EngagementConfigPatch, ENGAGEMENT_CONFIG_ID,
};
use crate::engagement::coordinator::RunLease;
use crate::engagement::delivery::{AuditStore, PersonaChatRecord};
use crate::engagement::persona::{Persona, PersonaRoster};

/// SQLite home of the engagement config, the persona roster, the interjection
/// audit trail and the run lease.
pub struct EngagementDatabase {
    conn: Mutex<Connection>,
}

impl EngagementDatabase {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {:?}", path))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS engagement_config (
                id TEXT PRIMARY KEY,
                enabled INTEGER NOT NULL,
                channel_ids TEXT NOT NULL,
                frequency TEXT NOT NULL,
                min_message_gap_mins INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS personas (
                name_key TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                avatar TEXT NOT NULL DEFAULT '',
                color TEXT NOT NULL DEFAULT '',
                prompt TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS persona_chats (
                id TEXT PRIMARY KEY,
                channel_id TEXT NOT NULL,
                persona_name TEXT NOT NULL,
                response TEXT NOT NULL,
                context TEXT NOT NULL,
                decision TEXT NOT NULL,
                posted_at TEXT NOT NULL,
                message_id TEXT
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_persona_chats_channel_posted
             ON persona_chats (channel_id, posted_at)",
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS run_leases (
                key TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            )"#,
            [],
        )?;

        Ok(())
    }

    fn read_config(conn: &Connection) -> Result<Option<EngagementConfig>> {
        conn.query_row(
            "SELECT enabled, channel_ids, frequency, min_message_gap_mins, updated_at
             FROM engagement_config WHERE id = ?1",
            [ENGAGEMENT_CONFIG_ID],
            |row| {
                let channel_ids: String = row.get(1)?;
                Ok(EngagementConfig {
                    enabled: row.get(0)?,
                    channel_ids: serde_json::from_str(&channel_ids)
                        .map_err(|e| conversion_error(1, e))?,
                    frequency: row.get(2)?,
                    min_message_gap_mins: row.get(3)?,
                    updated_at: parse_timestamp(4, row.get(4)?)?,
                })
            },
        )
        .optional()
        .context("Failed to read engagement config")
    }

    fn write_config(conn: &Connection, config: &EngagementConfig) -> Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO engagement_config
             (id, enabled, channel_ids, frequency, min_message_gap_mins, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                ENGAGEMENT_CONFIG_ID,
                config.enabled,
                serde_json::to_string(&config.channel_ids)?,
                config.frequency,
                config.min_message_gap_mins,
                format_timestamp(&config.updated_at),
            ],
        )
        .context("Failed to write engagement config")?;
        Ok(())
    }

    /// Insert or replace a persona; names are unique case-insensitively.
    pub fn upsert_persona(&self, persona: &Persona) -> Result<()> {
        let name = persona.name.trim();
        if name.is_empty() {
            bail!("persona name must not be empty");
        }
        if persona.prompt.trim().is_empty() {
            bail!("persona '{}' needs a prompt", name);
        }

        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO personas (name_key, name, avatar, color, prompt, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                name.to_lowercase(),
                name,
                persona.avatar.trim(),
                persona.color.trim(),
                persona.prompt,
                format_timestamp(&Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Returns whether a persona was removed.
    pub fn delete_persona(&self, name: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let removed = conn.execute(
            "DELETE FROM personas WHERE name_key = ?1",
            [name.trim().to_lowercase()],
        )?;
        Ok(removed > 0)
    }
}

impl ConfigStore for EngagementDatabase {
    fn get_config(&self) -> Result<EngagementConfig> {
        let conn = self.lock_conn()?;
        if let Some(config) = Self::read_config(&conn)? {
            return Ok(config);
        }

        let config = EngagementConfig::with_defaults(Utc::now());
        Self::write_config(&conn, &config)?;
        tracing::info!("Created default engagement config");
        Ok(config)
    }

    fn update_config(&self, patch: &EngagementConfigPatch) -> Result<EngagementConfig> {
        let conn = self.lock_conn()?;
        let now = Utc::now();
        let mut config =
            Self::read_config(&conn)?.unwrap_or_else(|| EngagementConfig::with_defaults(now));
        config.apply(patch, now);
        Self::write_config(&conn, &config)?;
        Ok(config)
    }
}

impl PersonaRoster for EngagementDatabase {
    fn list_personas(&self) -> Result<Vec<Persona>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT name, avatar, color, prompt FROM personas ORDER BY name_key",
        )?;
        let personas = stmt
            .query_map([], |row| {
                Ok(Persona {
                    name: row.get(0)?,
                    avatar: row.get(1)?,
                    color: row.get(2)?,
                    prompt: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(personas)
    }
}

impl AuditStore for EngagementDatabase {
    fn insert_record(&self, record: &PersonaChatRecord) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO persona_chats
             (id, channel_id, persona_name, response, context, decision, posted_at, message_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.id,
                record.channel_id,
                record.persona_name,
                record.response,
                record.context,
                serde_json::to_string(&record.decision)?,
                format_timestamp(&record.posted_at),
                record.message_id,
            ],
        )
        .context("Failed to insert persona chat record")?;
        Ok(())
    }

    fn last_interjection_at(&self, channel_id: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.lock_conn()?;
        let latest: Option<String> = conn.query_row(
            "SELECT MAX(posted_at) FROM persona_chats WHERE channel_id = ?1",
            [channel_id],
            |row| row.get(0),
        )?;
        latest
            .map(|raw| parse_timestamp(0, raw).map_err(anyhow::Error::from))
            .transpose()
    }

    fn list_recent_records(&self, limit: usize) -> Result<Vec<PersonaChatRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, channel_id, persona_name, response, context, decision, posted_at, message_id
             FROM persona_chats
             ORDER BY posted_at DESC
             LIMIT ?1",
        )?;
        let records = stmt
            .query_map([limit as i64], |row| {
                let decision: String = row.get(5)?;
                Ok(PersonaChatRecord {
                    id: row.get(0)?,
                    channel_id: row.get(1)?,
                    persona_name: row.get(2)?,
                    response: row.get(3)?,
                    context: row.get(4)?,
                    decision: serde_json::from_str(&decision).map_err(|e| conversion_error(5, e))?,
                    posted_at: parse_timestamp(6, row.get(6)?)?,
                    message_id: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

impl RunLease for EngagementDatabase {
    fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let now_ms = Utc::now().timestamp_millis();
        let expires_ms = lease_expiry_ms(ttl);

        let conn = self.lock_conn()?;
        let changed = conn
            .execute(
                "INSERT INTO run_leases (key, holder, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE
                 SET holder = excluded.holder, expires_at = excluded.expires_at
                 WHERE run_leases.expires_at <= ?4",
                params![key, holder, expires_ms, now_ms],
            )
            .context("Failed to claim run lease")?;
        Ok(changed > 0)
    }

    fn renew(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let expires_ms = lease_expiry_ms(ttl);

        let conn = self.lock_conn()?;
        let changed = conn
            .execute(
                "UPDATE run_leases SET expires_at = ?3 WHERE key = ?1 AND holder = ?2",
                params![key, holder, expires_ms],
            )
            .context("Failed to renew run lease")?;
        Ok(changed > 0)
    }

    fn release(&self, key: &str, holder: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "DELETE FROM run_leases WHERE key = ?1 AND holder = ?2",
            params![key, holder],
        )?;
        Ok(())
    }
}

fn lease_expiry_ms(ttl: Duration) -> i64 {
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    Utc::now().timestamp_millis().saturating_add(ttl_ms)
}

fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}
