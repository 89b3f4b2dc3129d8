use rusqlite::{Connection, Result};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

mod abilities;
mod channels;

pub use abilities::{DirectoryRows, FixAbilitiesReport};

pub const CHANNEL_STATUS_ENABLED: i64 = 1;
pub const CHANNEL_STATUS_MANUALLY_DISABLED: i64 = 2;
pub const CHANNEL_STATUS_AUTO_DISABLED: i64 = 3;

pub const CHANNEL_TYPE_OPENAI: i64 = 1;
pub const CHANNEL_TYPE_AZURE: i64 = 3;
pub const CHANNEL_TYPE_CUSTOM: i64 = 8;

const MIGRATIONS: &[(&str, &str)] = &[
    ("001_channels", include_str!("../../migrations/001_channels.sql")),
    ("002_abilities", include_str!("../../migrations/002_abilities.sql")),
    (
        "003_abilities_lookup_index",
        include_str!("../../migrations/003_abilities_lookup_index.sql"),
    ),
];

/// One upstream provider endpoint with its credential and declared models/groups.
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    pub channel_type: i64,
    pub status: i64,
    pub priority: i64,
    pub weight: i64,
    pub base_url: String,
    pub key: String,
    pub other: String,
    pub models: String,
    pub groups: String,
    pub model_mapping: Option<String>,
    pub status_code_mapping: Option<String>,
    pub supports_image: bool,
    pub supports_stream: bool,
    pub supports_system_prompt: bool,
    pub supports_non_deterministic: bool,
    pub supports_function_call: bool,
    pub max_input_tokens: i64,
    pub auto_ban: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Default for Channel {
    fn default() -> Self {
        let now = now_ts();
        Self {
            id: 0,
            name: String::new(),
            channel_type: CHANNEL_TYPE_OPENAI,
            status: CHANNEL_STATUS_ENABLED,
            priority: 0,
            weight: 0,
            base_url: String::new(),
            key: String::new(),
            other: String::new(),
            models: String::new(),
            groups: "default".to_string(),
            model_mapping: None,
            status_code_mapping: None,
            supports_image: true,
            supports_stream: true,
            supports_system_prompt: true,
            supports_non_deterministic: true,
            supports_function_call: true,
            max_input_tokens: 0,
            auto_ban: true,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Channel {
    pub fn is_enabled(&self) -> bool {
        self.status == CHANNEL_STATUS_ENABLED
    }

    pub fn model_list(&self) -> Vec<String> {
        split_list(&self.models)
    }

    pub fn group_list(&self) -> Vec<String> {
        split_list(&self.groups)
    }

    /// Negative weights are stored as-is but treated as zero by routing.
    pub fn effective_weight(&self) -> i64 {
        self.weight.max(0)
    }
}

/// Eligibility of one channel for a (group, model) pair. Priority, weight and
/// capability flags are copied from the channel when the row is written.
#[derive(Debug, Clone, PartialEq)]
pub struct Ability {
    pub group: String,
    pub model: String,
    pub channel_id: i64,
    pub enabled: bool,
    pub priority: i64,
    pub weight: i64,
    pub supports_image: bool,
    pub supports_stream: bool,
    pub supports_system_prompt: bool,
    pub supports_non_deterministic: bool,
    pub supports_function_call: bool,
    pub max_input_tokens: i64,
}

#[derive(Debug)]
pub struct Storage {
    conn: Connection,
}

impl Storage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(3000))?;
        // 中文注释：文件库启用 WAL，读（目录重载）与写（渠道更新）互不阻塞。
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn })
    }

    pub fn init(&self) -> Result<()> {
        self.ensure_migrations_table()?;
        for (version, sql) in MIGRATIONS {
            self.apply_migration(version, sql)?;
        }
        Ok(())
    }

    fn ensure_migrations_table(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version TEXT PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )",
        )
    }

    fn apply_migration(&self, version: &str, sql: &str) -> Result<()> {
        let applied: i64 = self.conn.query_row(
            "SELECT COUNT(1) FROM schema_migrations WHERE version = ?1",
            [version],
            |row| row.get(0),
        )?;
        if applied > 0 {
            return Ok(());
        }
        let tx = self.conn.unchecked_transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            (version, now_ts()),
        )?;
        tx.commit()
    }
}

pub fn now_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn split_list(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in raw.split(',') {
        let item = item.trim();
        if item.is_empty() || out.iter().any(|existing| existing == item) {
            continue;
        }
        out.push(item.to_string());
    }
    out
}

#[cfg(test)]
#[path = "../../tests/storage/migration_tests.rs"]
mod migration_tests;
