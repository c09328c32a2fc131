mod sealed;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

use crate::core::bot::{BotId, BotRecord, BotStatus, NewBot};
use crate::core::error::StoreError;
use crate::host::{Host, NativeHost};

use sealed::Sealer;

/// The narrow slice of persistence the supervisor and runner depend on.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Writes `status`, and `last_active` when given. A missing record is
    /// reported as `StoreError::NotFound`.
    async fn update_status(
        &self,
        id: &BotId,
        status: BotStatus,
        last_active: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    async fn get_status(&self, id: &BotId) -> Result<Option<BotStatus>, StoreError>;

    async fn touch(&self, id: &BotId, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Removes the record. Returns whether one existed.
    async fn delete_bot(&self, id: &BotId) -> Result<bool, StoreError>;
}

pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
    sealer: Sealer,
}

const BOT_COLUMNS: &str = "id, name, platform, bot_type, status, last_active, created_at";

struct RawBot {
    id: String,
    name: String,
    platform: String,
    bot_type: String,
    status: String,
    last_active: Option<String>,
    created_at: String,
}

impl RawBot {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            platform: row.get(2)?,
            bot_type: row.get(3)?,
            status: row.get(4)?,
            last_active: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn into_record(self) -> Result<BotRecord, StoreError> {
        Ok(BotRecord {
            platform: self.platform.parse().map_err(StoreError::InvalidValue)?,
            bot_type: self.bot_type.parse().map_err(StoreError::InvalidValue)?,
            status: BotStatus::from_status(&self.status).ok_or_else(|| {
                StoreError::InvalidValue(format!("unknown status '{}'", self.status))
            })?,
            last_active: self.last_active.as_deref().map(parse_ts).transpose()?,
            created_at: parse_ts(&self.created_at)?,
            id: BotId::from(self.id),
            name: self.name,
        })
    }
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidValue(format!("bad timestamp '{}': {}", value, e)))
}

impl SqliteStore {
    /// Opens (or creates) the database file. The daemon and every runner
    /// process open the same file, so WAL and a busy timeout are required.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            tokio::fs::create_dir_all(parent).await?;
            NativeHost::restrict_dir_permissions(parent);
        }

        let db = Connection::open(path)?;
        NativeHost::restrict_file_permissions(path);
        db.busy_timeout(Duration::from_secs(5))?;
        let _mode: String =
            db.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;

        let store = Self::with_connection(db, Sealer::new()?)?;
        info!("Bot store opened at {}", path.display());
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, Sealer::new()?)
    }

    fn with_connection(db: Connection, sealer: Sealer) -> Result<Self, StoreError> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS bots (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                platform TEXT NOT NULL,
                bot_type TEXT NOT NULL,
                config_sealed TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'offline',
                last_active TEXT,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            sealer,
        })
    }

    pub async fn create_bot(&self, new: NewBot) -> Result<BotRecord, StoreError> {
        let name = new.name.trim().to_string();
        if name.is_empty() {
            return Err(StoreError::InvalidValue("bot name must not be empty".into()));
        }
        if !new.platform.supports(new.bot_type) {
            return Err(StoreError::InvalidValue(format!(
                "{} does not support {} bots",
                new.platform, new.bot_type
            )));
        }
        let config = match new.config {
            serde_json::Value::Null => serde_json::json!({}),
            serde_json::Value::Object(map) => serde_json::Value::Object(map),
            _ => {
                return Err(StoreError::InvalidValue(
                    "bot config must be a JSON object".into(),
                ));
            }
        };

        let record = BotRecord {
            id: BotId::generate(),
            name,
            platform: new.platform,
            bot_type: new.bot_type,
            status: BotStatus::Offline,
            last_active: None,
            created_at: Utc::now(),
        };
        let sealed = self.sealer.seal(&config)?;

        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO bots (id, name, platform, bot_type, config_sealed, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id.as_str(),
                record.name,
                record.platform.as_str(),
                record.bot_type.as_str(),
                sealed,
                record.status.as_str(),
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(record)
    }

    pub async fn get_bot(&self, id: &BotId) -> Result<Option<BotRecord>, StoreError> {
        let db = self.db.lock().await;
        let raw = db
            .query_row(
                &format!("SELECT {} FROM bots WHERE id = ?1", BOT_COLUMNS),
                params![id.as_str()],
                RawBot::from_row,
            )
            .optional()?;
        raw.map(RawBot::into_record).transpose()
    }

    /// Unseals the platform configuration. Only the runner should need this.
    pub async fn load_config(&self, id: &BotId) -> Result<serde_json::Value, StoreError> {
        let sealed: Option<String> = {
            let db = self.db.lock().await;
            db.query_row(
                "SELECT config_sealed FROM bots WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?
        };
        let sealed = sealed.ok_or_else(|| StoreError::NotFound(id.clone()))?;
        self.sealer.unseal(&sealed)
    }

    pub async fn list_bots(&self) -> Result<Vec<BotRecord>, StoreError> {
        self.query_bots(
            &format!("SELECT {} FROM bots ORDER BY created_at, id", BOT_COLUMNS),
            None,
        )
        .await
    }

    pub async fn list_by_status(&self, status: BotStatus) -> Result<Vec<BotRecord>, StoreError> {
        self.query_bots(
            &format!(
                "SELECT {} FROM bots WHERE status = ?1 ORDER BY created_at, id",
                BOT_COLUMNS
            ),
            Some(status.as_str()),
        )
        .await
    }

    async fn query_bots(
        &self,
        sql: &str,
        status: Option<&str>,
    ) -> Result<Vec<BotRecord>, StoreError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(sql)?;
        let rows = match status {
            Some(status) => stmt.query_map(params![status], RawBot::from_row)?,
            None => stmt.query_map([], RawBot::from_row)?,
        };

        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }

    pub async fn rename_bot(&self, id: &BotId, name: &str) -> Result<bool, StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::InvalidValue("bot name must not be empty".into()));
        }
        let db = self.db.lock().await;
        let updated = db.execute(
            "UPDATE bots SET name = ?1 WHERE id = ?2",
            params![name, id.as_str()],
        )?;
        Ok(updated > 0)
    }

    /// Replaces the sealed configuration. Takes effect on the next start.
    pub async fn update_config(
        &self,
        id: &BotId,
        config: &serde_json::Value,
    ) -> Result<bool, StoreError> {
        if !config.is_object() {
            return Err(StoreError::InvalidValue(
                "bot config must be a JSON object".into(),
            ));
        }
        let sealed = self.sealer.seal(config)?;
        let db = self.db.lock().await;
        let updated = db.execute(
            "UPDATE bots SET config_sealed = ?1 WHERE id = ?2",
            params![sealed, id.as_str()],
        )?;
        Ok(updated > 0)
    }

}

#[async_trait]
impl StatusStore for SqliteStore {
    async fn update_status(
        &self,
        id: &BotId,
        status: BotStatus,
        last_active: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let db = self.db.lock().await;
        let updated = match last_active {
            Some(at) => db.execute(
                "UPDATE bots SET status = ?1, last_active = ?2 WHERE id = ?3",
                params![status.as_str(), at.to_rfc3339(), id.as_str()],
            )?,
            None => db.execute(
                "UPDATE bots SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id.as_str()],
            )?,
        };
        if updated == 0 {
            return Err(StoreError::NotFound(id.clone()));
        }
        Ok(())
    }

    async fn get_status(&self, id: &BotId) -> Result<Option<BotStatus>, StoreError> {
        let db = self.db.lock().await;
        let status: Option<String> = db
            .query_row(
                "SELECT status FROM bots WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        match status {
            Some(value) => BotStatus::from_status(&value)
                .map(Some)
                .ok_or_else(|| StoreError::InvalidValue(format!("unknown status '{}'", value))),
            None => Ok(None),
        }
    }

    async fn touch(&self, id: &BotId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let db = self.db.lock().await;
        let updated = db.execute(
            "UPDATE bots SET last_active = ?1 WHERE id = ?2",
            params![at.to_rfc3339(), id.as_str()],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(id.clone()));
        }
        Ok(())
    }

    async fn delete_bot(&self, id: &BotId) -> Result<bool, StoreError> {
        let db = self.db.lock().await;
        let deleted = db.execute("DELETE FROM bots WHERE id = ?1", params![id.as_str()])?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bot::{BotType, Platform};
    use serde_json::json;

    fn new_bot(name: &str, platform: Platform, bot_type: BotType) -> NewBot {
        NewBot {
            name: name.to_string(),
            platform,
            bot_type,
            config: json!({ "token": "secret-token" }),
        }
    }

    #[tokio::test]
    async fn create_bot_starts_offline() {
        let store = SqliteStore::open_in_memory().unwrap();
        let bot = store
            .create_bot(new_bot("helper", Platform::Telegram, BotType::Standard))
            .await
            .unwrap();
        assert_eq!(bot.status, BotStatus::Offline);
        assert!(bot.last_active.is_none());

        let fetched = store.get_bot(&bot.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "helper");
        assert_eq!(fetched.platform, Platform::Telegram);
        assert_eq!(
            store.get_status(&bot.id).await.unwrap(),
            Some(BotStatus::Offline)
        );
    }

    #[tokio::test]
    async fn create_bot_rejects_unsupported_type() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store
            .create_bot(new_bot("mod", Platform::WhatsApp, BotType::Moderation))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidValue(_)));
    }

    #[tokio::test]
    async fn create_bot_rejects_non_object_config() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut bot = new_bot("x", Platform::Discord, BotType::Standard);
        bot.config = json!(["token"]);
        assert!(store.create_bot(bot).await.is_err());
    }

    #[tokio::test]
    async fn config_is_sealed_and_loadable() {
        let store = SqliteStore::open_in_memory().unwrap();
        let bot = store
            .create_bot(new_bot("d", Platform::Discord, BotType::Moderation))
            .await
            .unwrap();

        let raw: String = {
            let db = store.db.lock().await;
            db.query_row(
                "SELECT config_sealed FROM bots WHERE id = ?1",
                params![bot.id.as_str()],
                |row| row.get(0),
            )
            .unwrap()
        };
        assert!(!raw.contains("secret-token"));

        let config = store.load_config(&bot.id).await.unwrap();
        assert_eq!(config["token"], "secret-token");
    }

    #[tokio::test]
    async fn update_status_without_timestamp_keeps_last_active() {
        let store = SqliteStore::open_in_memory().unwrap();
        let bot = store
            .create_bot(new_bot("b", Platform::Messenger, BotType::Standard))
            .await
            .unwrap();

        let at = Utc::now();
        store
            .update_status(&bot.id, BotStatus::Online, Some(at))
            .await
            .unwrap();
        store
            .update_status(&bot.id, BotStatus::Error, None)
            .await
            .unwrap();

        let fetched = store.get_bot(&bot.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, BotStatus::Error);
        assert_eq!(
            fetched.last_active.map(|t| t.timestamp_millis()),
            Some(at.timestamp_millis())
        );
    }

    #[tokio::test]
    async fn missing_bot_is_reported() {
        let store = SqliteStore::open_in_memory().unwrap();
        let ghost = BotId::from("ghost");
        assert_eq!(store.get_status(&ghost).await.unwrap(), None);
        assert!(matches!(
            store.update_status(&ghost, BotStatus::Online, None).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.load_config(&ghost).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(!store.delete_bot(&ghost).await.unwrap());
    }

    #[tokio::test]
    async fn list_by_status_filters() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = store
            .create_bot(new_bot("a", Platform::Discord, BotType::Standard))
            .await
            .unwrap();
        let b = store
            .create_bot(new_bot("b", Platform::Instagram, BotType::Standard))
            .await
            .unwrap();
        store
            .update_status(&b.id, BotStatus::Online, Some(Utc::now()))
            .await
            .unwrap();

        assert_eq!(store.list_bots().await.unwrap().len(), 2);
        let online = store.list_by_status(BotStatus::Online).await.unwrap();
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].id, b.id);
        let offline = store.list_by_status(BotStatus::Offline).await.unwrap();
        assert_eq!(offline[0].id, a.id);
    }

    #[tokio::test]
    async fn rename_and_delete() {
        let store = SqliteStore::open_in_memory().unwrap();
        let bot = store
            .create_bot(new_bot("old", Platform::Telegram, BotType::Standard))
            .await
            .unwrap();

        assert!(store.rename_bot(&bot.id, "new").await.unwrap());
        assert!(store.rename_bot(&bot.id, "  ").await.is_err());
        assert_eq!(store.get_bot(&bot.id).await.unwrap().unwrap().name, "new");

        assert!(store.delete_bot(&bot.id).await.unwrap());
        assert!(store.get_bot(&bot.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_store_is_shared_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("botdeck.db");
        let daemon = SqliteStore::open(&path).await.unwrap();
        let runner = SqliteStore::open(&path).await.unwrap();

        let bot = daemon
            .create_bot(new_bot("shared", Platform::Discord, BotType::Standard))
            .await
            .unwrap();
        runner.touch(&bot.id, Utc::now()).await.unwrap();

        let fetched = daemon.get_bot(&bot.id).await.unwrap().unwrap();
        assert!(fetched.last_active.is_some());
        assert_eq!(runner.load_config(&bot.id).await.unwrap()["token"], "secret-token");
    }
}
