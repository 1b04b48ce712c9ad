use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use super::profile::ProfileStore;
use crate::models::profile::BehavioralProfile;

/// SQLite-backed profile store. Each profile is one JSON row.
pub struct SqliteProfileStore {
    conn: Mutex<Connection>,
}

impl SqliteProfileStore {
    /// Open (or create) the database at `path`. `:memory:` is accepted.
    pub fn open(path: &str) -> Result<Self> {
        if path != ":memory:" {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create {}", parent.display()))?;
                }
            }
        }

        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;

            CREATE TABLE IF NOT EXISTS behavioral_profiles (
                user_id       TEXT PRIMARY KEY,
                profile_json  TEXT NOT NULL,
                created_at    TEXT DEFAULT (datetime('now')),
                updated_at    TEXT NOT NULL
            );
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl ProfileStore for SqliteProfileStore {
    async fn load(&self, user_id: &str) -> Result<Option<BehavioralProfile>> {
        let json: Option<String> = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT profile_json FROM behavioral_profiles WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?
        };

        match json {
            Some(raw) => {
                let profile = serde_json::from_str(&raw)
                    .with_context(|| format!("Corrupt profile row for {}", user_id))?;
                Ok(Some(profile))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, profile: &BehavioralProfile) -> Result<()> {
        let json = serde_json::to_string(profile)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO behavioral_profiles (user_id, profile_json, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET
                profile_json = excluded.profile_json,
                updated_at = excluded.updated_at",
            params![profile.user_id, json, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM behavioral_profiles", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}
