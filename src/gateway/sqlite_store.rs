use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::OptionalExtension;

use super::store::{RelayStore, StoreError};
use super::store_types::{
    Channel, ChannelCandidate, ChannelConfig, ChannelStatus, ChannelType, ConsumeLog,
    ModelAbility, ModelPricing, Token, TokenStatus, User,
};

#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

const CHANNEL_COLUMNS: &str =
    "c.id, c.type, c.key, c.status, c.name, c.base_url, c.used_quota, c.priority, c.config";
const MODEL_COLUMNS: &str =
    "m.channel_id, m.name, m.mapped_name, m.enabled, m.priority, m.config, m.tokenizer";
const TOKEN_COLUMNS: &str = "id, user_id, key, name, status, expired_time, remain_quota, unlimited_quota, used_quota";

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        self.blocking(|_conn| Ok(())).await
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<T, StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            f(&mut conn)
        })
        .await?
    }

    pub async fn insert_channel(&self, channel: &Channel) -> Result<i64, StoreError> {
        let channel = channel.clone();
        let config = serde_json::to_string(&channel.config)?;
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO channels (id, type, key, status, name, base_url, used_quota, priority, config)
                 VALUES (NULLIF(?1, 0), ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    channel.id,
                    channel.channel_type.as_i64(),
                    channel.key,
                    channel.status.as_i64(),
                    channel.name,
                    channel.base_url,
                    channel.used_quota,
                    channel.priority,
                    config,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn set_channel_status(
        &self,
        channel_id: i64,
        status: ChannelStatus,
    ) -> Result<(), StoreError> {
        self.blocking(move |conn| {
            conn.execute(
                "UPDATE channels SET status = ?2 WHERE id = ?1",
                rusqlite::params![channel_id, status.as_i64()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn insert_user(&self, user: &User) -> Result<i64, StoreError> {
        let user = user.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO users (id, quota, used_quota, request_count)
                 VALUES (NULLIF(?1, 0), ?2, ?3, ?4)",
                rusqlite::params![user.id, user.quota, user.used_quota, user.request_count],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn get_user(&self, user_id: i64) -> Result<Option<User>, StoreError> {
        self.blocking(move |conn| {
            let user = conn
                .query_row(
                    "SELECT id, quota, used_quota, request_count FROM users WHERE id = ?1",
                    rusqlite::params![user_id],
                    |row| {
                        Ok(User {
                            id: row.get(0)?,
                            quota: row.get(1)?,
                            used_quota: row.get(2)?,
                            request_count: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(user)
        })
        .await
    }

    pub async fn insert_token(&self, token: &Token) -> Result<i64, StoreError> {
        let token = token.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO tokens (id, user_id, key, name, status, expired_time, remain_quota, unlimited_quota, used_quota)
                 VALUES (NULLIF(?1, 0), ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    token.id,
                    token.user_id,
                    token.key,
                    token.name,
                    token.status.as_i64(),
                    token.expired_time,
                    token.remain_quota,
                    token.unlimited_quota,
                    token.used_quota,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn get_token(&self, token_id: i64) -> Result<Option<Token>, StoreError> {
        self.blocking(move |conn| {
            let token = conn
                .query_row(
                    &format!("SELECT {TOKEN_COLUMNS} FROM tokens WHERE id = ?1"),
                    rusqlite::params![token_id],
                    token_from_row,
                )
                .optional()?;
            Ok(token)
        })
        .await
    }

    pub async fn list_consume_logs(&self, limit: usize) -> Result<Vec<ConsumeLog>, StoreError> {
        let limit = i64::try_from(limit.max(1)).unwrap_or(i64::MAX);
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, created_at, user_id, channel_id, model_name, token_name, prompt_tokens,
                        completion_tokens, quota, content, is_stream, elapsed_ms
                 FROM logs
                 ORDER BY id DESC
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map(rusqlite::params![limit], |row| {
                Ok(ConsumeLog {
                    id: row.get(0)?,
                    created_at: row.get(1)?,
                    user_id: row.get(2)?,
                    channel_id: row.get(3)?,
                    model_name: row.get(4)?,
                    token_name: row.get(5)?,
                    prompt_tokens: row.get(6)?,
                    completion_tokens: row.get(7)?,
                    quota: row.get(8)?,
                    content: row.get(9)?,
                    is_stream: row.get(10)?,
                    elapsed_ms: row.get(11)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn pending_reservations(&self) -> Result<usize, StoreError> {
        self.blocking(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM quota_reservations", [], |row| row.get(0))?;
            Ok(usize::try_from(count).unwrap_or(0))
        })
        .await
    }
}

#[async_trait]
impl RelayStore for SqliteStore {
    async fn list_enabled_channels(&self) -> Result<Vec<Channel>, StoreError> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CHANNEL_COLUMNS} FROM channels c WHERE c.status = 1 ORDER BY c.id"
            ))?;
            let rows = stmt.query_map([], |row| channel_from_row(row, 0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    async fn list_models(&self) -> Result<Vec<ModelAbility>, StoreError> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MODEL_COLUMNS} FROM models m ORDER BY m.channel_id, m.name"
            ))?;
            let rows = stmt.query_map([], |row| model_from_row(row, 0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    async fn get_channel(&self, channel_id: i64) -> Result<Option<Channel>, StoreError> {
        self.blocking(move |conn| {
            let channel = conn
                .query_row(
                    &format!("SELECT {CHANNEL_COLUMNS} FROM channels c WHERE c.id = ?1"),
                    rusqlite::params![channel_id],
                    |row| channel_from_row(row, 0),
                )
                .optional()?;
            Ok(channel)
        })
        .await
    }

    async fn channel_candidates(&self, model: &str) -> Result<Vec<ChannelCandidate>, StoreError> {
        let model = model.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CHANNEL_COLUMNS}, {MODEL_COLUMNS}
                 FROM models m
                 JOIN channels c ON c.id = m.channel_id
                 WHERE m.name = ?1 AND m.enabled = 1 AND c.status = 1
                 ORDER BY COALESCE(m.priority, c.priority) DESC, c.name ASC, c.id ASC"
            ))?;
            let rows = stmt.query_map(rusqlite::params![model], |row| {
                Ok(ChannelCandidate {
                    channel: Arc::new(channel_from_row(row, 0)?),
                    ability: Arc::new(model_from_row(row, 9)?),
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    async fn model_ability(
        &self,
        channel_id: i64,
        model: &str,
    ) -> Result<Option<ModelAbility>, StoreError> {
        let model = model.to_string();
        self.blocking(move |conn| {
            let ability = conn
                .query_row(
                    &format!(
                        "SELECT {MODEL_COLUMNS} FROM models m WHERE m.channel_id = ?1 AND m.name = ?2"
                    ),
                    rusqlite::params![channel_id, model],
                    |row| model_from_row(row, 0),
                )
                .optional()?;
            Ok(ability)
        })
        .await
    }

    async fn enabled_model_names(&self) -> Result<Vec<String>, StoreError> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT m.name
                 FROM models m
                 JOIN channels c ON c.id = m.channel_id
                 WHERE m.enabled = 1 AND c.status = 1
                 ORDER BY m.name",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    async fn upsert_models(&self, models: &[ModelAbility]) -> Result<(), StoreError> {
        let serialized = models
            .iter()
            .map(|model| {
                let pricing = model.pricing.map(|p| serde_json::to_string(&p)).transpose()?;
                Ok((model.clone(), pricing))
            })
            .collect::<Result<Vec<_>, serde_json::Error>>()?;
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            for (model, pricing) in serialized {
                tx.execute(
                    "INSERT INTO models (channel_id, name, mapped_name, enabled, priority, config, tokenizer)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(channel_id, name) DO UPDATE SET
                        mapped_name = excluded.mapped_name,
                        config = excluded.config,
                        tokenizer = excluded.tokenizer",
                    rusqlite::params![
                        model.channel_id,
                        model.name,
                        model.mapped_name,
                        model.enabled,
                        model.priority,
                        pricing,
                        model.tokenizer,
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn token_by_key(&self, key: &str) -> Result<Option<Token>, StoreError> {
        let key = key.to_string();
        self.blocking(move |conn| {
            let token = conn
                .query_row(
                    &format!("SELECT {TOKEN_COLUMNS} FROM tokens WHERE key = ?1"),
                    rusqlite::params![key],
                    token_from_row,
                )
                .optional()?;
            Ok(token)
        })
        .await
    }

    async fn set_token_status(
        &self,
        token_id: i64,
        status: TokenStatus,
    ) -> Result<(), StoreError> {
        self.blocking(move |conn| {
            conn.execute(
                "UPDATE tokens SET status = ?2 WHERE id = ?1",
                rusqlite::params![token_id, status.as_i64()],
            )?;
            Ok(())
        })
        .await
    }

    async fn user_quota(&self, user_id: i64) -> Result<f64, StoreError> {
        self.blocking(move |conn| {
            let quota: Option<f64> = conn
                .query_row(
                    "SELECT quota FROM users WHERE id = ?1",
                    rusqlite::params![user_id],
                    |row| row.get(0),
                )
                .optional()?;
            quota.ok_or_else(|| StoreError::NotFound {
                entity: "user",
                id: user_id.to_string(),
            })
        })
        .await
    }

    async fn reserve_token_quota(
        &self,
        reservation_id: &str,
        token_id: i64,
        amount: f64,
    ) -> Result<bool, StoreError> {
        let reservation_id = reservation_id.to_string();
        let ts_ms = now_millis();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO quota_reservations (reservation_id, token_id, amount, ts_ms)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![reservation_id, token_id, amount, ts_ms],
            )?;
            if inserted == 0 {
                return Ok(false);
            }
            tx.execute(
                "UPDATE tokens
                 SET remain_quota = remain_quota - ?2,
                     used_quota = used_quota + ?2
                 WHERE id = ?1",
                rusqlite::params![token_id, amount],
            )?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn release_reservation(&self, reservation_id: &str) -> Result<bool, StoreError> {
        let reservation_id = reservation_id.to_string();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let reservation: Option<(i64, f64)> = tx
                .query_row(
                    "SELECT token_id, amount FROM quota_reservations WHERE reservation_id = ?1",
                    rusqlite::params![reservation_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let Some((token_id, amount)) = reservation else {
                return Ok(false);
            };

            tx.execute(
                "DELETE FROM quota_reservations WHERE reservation_id = ?1",
                rusqlite::params![reservation_id],
            )?;
            tx.execute(
                "UPDATE tokens
                 SET remain_quota = remain_quota + ?2,
                     used_quota = used_quota - ?2
                 WHERE id = ?1",
                rusqlite::params![token_id, amount],
            )?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn settle_reservation(
        &self,
        reservation_id: &str,
        token_id: i64,
        actual: f64,
    ) -> Result<(), StoreError> {
        let reservation_id = reservation_id.to_string();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let reserved: f64 = tx
                .query_row(
                    "SELECT amount FROM quota_reservations
                     WHERE reservation_id = ?1 AND token_id = ?2",
                    rusqlite::params![reservation_id, token_id],
                    |row| row.get(0),
                )
                .optional()?
                .unwrap_or(0.0);

            tx.execute(
                "DELETE FROM quota_reservations WHERE reservation_id = ?1 AND token_id = ?2",
                rusqlite::params![reservation_id, token_id],
            )?;

            let delta = actual - reserved;
            if delta != 0.0 {
                tx.execute(
                    "UPDATE tokens
                     SET remain_quota = remain_quota - ?2,
                         used_quota = used_quota + ?2
                     WHERE id = ?1",
                    rusqlite::params![token_id, delta],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn reap_stale_reservations(
        &self,
        cutoff_ts_ms: i64,
        max_reaped: usize,
    ) -> Result<usize, StoreError> {
        let limit = max_reaped.clamp(1, 100_000) as i64;
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let stale: Vec<(String, i64, f64)> = {
                let mut stmt = tx.prepare(
                    "SELECT reservation_id, token_id, amount FROM quota_reservations
                     WHERE ts_ms < ?1
                     ORDER BY ts_ms
                     LIMIT ?2",
                )?;
                let rows = stmt.query_map(rusqlite::params![cutoff_ts_ms, limit], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                out
            };

            for (reservation_id, token_id, amount) in &stale {
                tx.execute(
                    "DELETE FROM quota_reservations WHERE reservation_id = ?1",
                    rusqlite::params![reservation_id],
                )?;
                tx.execute(
                    "UPDATE tokens
                     SET remain_quota = remain_quota + ?2,
                         used_quota = used_quota - ?2
                     WHERE id = ?1",
                    rusqlite::params![token_id, amount],
                )?;
            }
            tx.commit()?;
            Ok(stale.len())
        })
        .await
    }

    async fn record_user_consumption(&self, user_id: i64, quota: f64) -> Result<(), StoreError> {
        self.blocking(move |conn| {
            conn.execute(
                "UPDATE users
                 SET quota = quota - ?2,
                     used_quota = used_quota + ?2,
                     request_count = request_count + 1
                 WHERE id = ?1",
                rusqlite::params![user_id, quota],
            )?;
            Ok(())
        })
        .await
    }

    async fn add_channel_used_quota(
        &self,
        channel_id: i64,
        quota: f64,
    ) -> Result<(), StoreError> {
        self.blocking(move |conn| {
            conn.execute(
                "UPDATE channels SET used_quota = used_quota + ?2 WHERE id = ?1",
                rusqlite::params![channel_id, quota],
            )?;
            Ok(())
        })
        .await
    }

    async fn append_consume_log(&self, log: &ConsumeLog) -> Result<i64, StoreError> {
        let log = log.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO logs (created_at, user_id, channel_id, model_name, token_name, prompt_tokens,
                                   completion_tokens, quota, content, is_stream, elapsed_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                rusqlite::params![
                    log.created_at,
                    log.user_id,
                    log.channel_id,
                    log.model_name,
                    log.token_name,
                    log.prompt_tokens,
                    log.completion_tokens,
                    log.quota,
                    log.content,
                    log.is_stream,
                    log.elapsed_ms,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }
}

fn channel_from_row(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<Channel> {
    let config: Option<String> = row.get(offset + 8)?;
    Ok(Channel {
        id: row.get(offset)?,
        channel_type: ChannelType::from_i64(row.get(offset + 1)?),
        key: row.get(offset + 2)?,
        status: ChannelStatus::from_i64(row.get(offset + 3)?),
        name: row.get(offset + 4)?,
        base_url: row.get(offset + 5)?,
        used_quota: row.get(offset + 6)?,
        priority: row.get(offset + 7)?,
        config: config
            .as_deref()
            .and_then(|raw| serde_json::from_str::<ChannelConfig>(raw).ok())
            .unwrap_or_default(),
    })
}

fn model_from_row(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<ModelAbility> {
    let pricing: Option<String> = row.get(offset + 5)?;
    Ok(ModelAbility {
        channel_id: row.get(offset)?,
        name: row.get(offset + 1)?,
        mapped_name: row.get(offset + 2)?,
        enabled: row.get(offset + 3)?,
        priority: row.get(offset + 4)?,
        pricing: pricing
            .as_deref()
            .and_then(|raw| serde_json::from_str::<ModelPricing>(raw).ok()),
        tokenizer: row.get(offset + 6)?,
    })
}

fn token_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Token> {
    Ok(Token {
        id: row.get(0)?,
        user_id: row.get(1)?,
        key: row.get(2)?,
        name: row.get(3)?,
        status: TokenStatus::from_i64(row.get(4)?),
        expired_time: row.get(5)?,
        remain_quota: row.get(6)?,
        unlimited_quota: row.get(7)?,
        used_quota: row.get(8)?,
    })
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS channels (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            type INTEGER NOT NULL DEFAULT 0,
            key TEXT NOT NULL DEFAULT '',
            status INTEGER NOT NULL DEFAULT 1,
            name TEXT NOT NULL DEFAULT '',
            base_url TEXT,
            used_quota REAL NOT NULL DEFAULT 0,
            priority INTEGER NOT NULL DEFAULT 0,
            config TEXT
        );

        CREATE TABLE IF NOT EXISTS models (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            channel_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            mapped_name TEXT,
            enabled INTEGER NOT NULL DEFAULT 1,
            priority INTEGER,
            config TEXT,
            tokenizer TEXT,
            UNIQUE (channel_id, name)
        );
        CREATE INDEX IF NOT EXISTS idx_models_name ON models(name);

        CREATE TABLE IF NOT EXISTS tokens (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            key TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL DEFAULT '',
            status INTEGER NOT NULL DEFAULT 1,
            expired_time INTEGER NOT NULL DEFAULT -1,
            remain_quota REAL NOT NULL DEFAULT 0,
            unlimited_quota INTEGER NOT NULL DEFAULT 0,
            used_quota REAL NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            quota REAL NOT NULL DEFAULT 0,
            used_quota REAL NOT NULL DEFAULT 0,
            request_count INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at INTEGER NOT NULL,
            user_id INTEGER NOT NULL,
            channel_id INTEGER NOT NULL,
            model_name TEXT NOT NULL,
            token_name TEXT NOT NULL,
            prompt_tokens INTEGER NOT NULL,
            completion_tokens INTEGER NOT NULL,
            quota REAL NOT NULL,
            content TEXT NOT NULL,
            is_stream INTEGER NOT NULL,
            elapsed_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_logs_user_id ON logs(user_id);

        CREATE TABLE IF NOT EXISTS quota_reservations (
            reservation_id TEXT PRIMARY KEY NOT NULL,
            token_id INTEGER NOT NULL,
            amount REAL NOT NULL,
            ts_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_quota_reservations_ts_ms ON quota_reservations(ts_ms);",
    )?;
    Ok(())
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}
