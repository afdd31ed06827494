use super::json::with_suffix;
use super::models::{CommunityRecord, RegistrySnapshot, StoredKey, STATE_VERSION};
use super::StateStore;
use crate::error::{AppError, AppResult};
use crate::keys::{ClaimRecord, ClaimantId, KeyEntry, KeyFingerprint};
use crate::registry::{CommunityId, RoleId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, error, info};

pub type DbPool = Pool<Sqlite>;

#[derive(Debug, Clone, FromRow)]
struct CommunityRow {
    community_id: i64,
    role_id: i64,
    command: String,
    salt: String,
    one_per_member: bool,
    success_messages: String, // JSON array
}

#[derive(Debug, Clone, FromRow)]
struct KeyRow {
    community_id: i64,
    fingerprint: String,
    added_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow)]
struct ClaimRow {
    community_id: i64,
    fingerprint: String,
    claimant_id: i64,
    claimed_at: DateTime<Utc>,
}

/// SQLITE_CORRUPT (11) or SQLITE_NOTADB (26), including extended codes
fn is_corruption(error: &sqlx::Error) -> bool {
    let Some(db) = error.as_database_error() else {
        return false;
    };
    db.code()
        .and_then(|code| code.parse::<i32>().ok())
        .is_some_and(|code| matches!(code & 0xff, 11 | 26))
}

fn parse_fingerprint(hex: &str) -> AppResult<KeyFingerprint> {
    KeyFingerprint::from_hex(hex)
        .map_err(|e| AppError::persistence(format!("bad fingerprint in database: {}", e)))
}

/// Registry state in SQLite; each save is one transaction.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    /// Open (creating if needed) the database file and run migrations.
    ///
    /// A file SQLite reports as corrupt is moved to `<path>.corrupt` and the
    /// store starts empty. Any other failure is returned.
    pub async fn connect(path: &Path, max_connections: u32) -> AppResult<Self> {
        match Self::open(path, max_connections).await {
            Err(AppError::Database(e)) if is_corruption(&e) => {
                let quarantine = with_suffix(path, ".corrupt");
                error!(
                    "Database {} is corrupt ({}); moved to {}, starting with no communities",
                    path.display(),
                    e,
                    quarantine.display()
                );
                tokio::fs::rename(path, &quarantine).await?;
                Self::open(path, max_connections).await
            }
            other => other,
        }
    }

    async fn open(path: &Path, max_connections: u32) -> AppResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        if let Err(e) = init_db(&pool).await {
            pool.close().await;
            return Err(e);
        }
        info!("Database connected: {}", path.display());
        Ok(Self { pool })
    }

    pub async fn from_pool(pool: DbPool) -> AppResult<Self> {
        init_db(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn load(&self) -> AppResult<RegistrySnapshot> {
        let communities = sqlx::query_as::<_, CommunityRow>(
            "SELECT community_id, role_id, command, salt, one_per_member, success_messages \
             FROM communities ORDER BY community_id",
        )
        .fetch_all(&self.pool)
        .await?;

        let keys = sqlx::query_as::<_, KeyRow>(
            "SELECT community_id, fingerprint, added_at, expires_at FROM pool_keys ORDER BY fingerprint",
        )
        .fetch_all(&self.pool)
        .await?;

        let claims = sqlx::query_as::<_, ClaimRow>(
            "SELECT community_id, fingerprint, claimant_id, claimed_at FROM claims ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut records: BTreeMap<i64, CommunityRecord> = BTreeMap::new();
        for row in communities {
            records.insert(
                row.community_id,
                CommunityRecord {
                    community_id: CommunityId(row.community_id as u64),
                    role_id: RoleId(row.role_id as u64),
                    command: row.command,
                    salt: row.salt,
                    one_per_member: row.one_per_member,
                    success_messages: serde_json::from_str(&row.success_messages)
                        .unwrap_or_else(|_| crate::registry::default_success_messages()),
                    keys: Vec::new(),
                    claims: Vec::new(),
                },
            );
        }

        for row in keys {
            let Some(record) = records.get_mut(&row.community_id) else {
                continue;
            };
            record.keys.push(StoredKey {
                fingerprint: parse_fingerprint(&row.fingerprint)?,
                entry: KeyEntry::new(row.added_at, row.expires_at),
            });
        }

        for row in claims {
            let Some(record) = records.get_mut(&row.community_id) else {
                continue;
            };
            record.claims.push(ClaimRecord {
                fingerprint: parse_fingerprint(&row.fingerprint)?,
                claimant_id: ClaimantId(row.claimant_id as u64),
                claimed_at: row.claimed_at,
            });
        }

        debug!("Loaded {} communities from database", records.len());
        Ok(RegistrySnapshot {
            version: STATE_VERSION,
            communities: records.into_values().collect(),
        })
    }

    async fn save(&self, snapshot: &RegistrySnapshot) -> AppResult<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        for community in &snapshot.communities {
            let community_id = community.community_id.0 as i64;
            let messages = serde_json::to_string(&community.success_messages)?;

            sqlx::query(
                r#"
                INSERT INTO communities (community_id, role_id, command, salt, one_per_member, success_messages, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(community_id) DO UPDATE SET
                    role_id = excluded.role_id,
                    command = excluded.command,
                    one_per_member = excluded.one_per_member,
                    success_messages = excluded.success_messages,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(community_id)
            .bind(community.role_id.0 as i64)
            .bind(&community.command)
            .bind(&community.salt)
            .bind(community.one_per_member)
            .bind(&messages)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM pool_keys WHERE community_id = ?")
                .bind(community_id)
                .execute(&mut *tx)
                .await?;

            for key in &community.keys {
                sqlx::query(
                    "INSERT INTO pool_keys (community_id, fingerprint, added_at, expires_at) VALUES (?, ?, ?, ?)",
                )
                .bind(community_id)
                .bind(key.fingerprint.to_hex())
                .bind(key.entry.added_at)
                .bind(key.entry.expires_at)
                .execute(&mut *tx)
                .await?;
            }

            // Claims are append-only: existing rows are never touched
            for claim in &community.claims {
                sqlx::query(
                    "INSERT OR IGNORE INTO claims (community_id, fingerprint, claimant_id, claimed_at) VALUES (?, ?, ?, ?)",
                )
                .bind(community_id)
                .bind(claim.fingerprint.to_hex())
                .bind(claim.claimant_id.0 as i64)
                .bind(claim.claimed_at)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        debug!("Saved {} communities to database", snapshot.communities.len());
        Ok(())
    }

    fn describe(&self) -> String {
        "sqlite".to_string()
    }
}

#[cfg(test)]
pub async fn setup_test_db() -> SqliteStore {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");
    SqliteStore::from_pool(pool)
        .await
        .expect("Failed to init database")
}

/// Initialize database with migrations
pub async fn init_db(pool: &DbPool) -> AppResult<()> {
    info!("Running database migrations");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS communities (
            community_id INTEGER PRIMARY KEY,
            role_id INTEGER NOT NULL,
            command TEXT NOT NULL DEFAULT 'claim',
            salt TEXT NOT NULL,
            one_per_member BOOLEAN NOT NULL DEFAULT false,
            success_messages TEXT NOT NULL DEFAULT '[]',
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pool_keys (
            community_id INTEGER NOT NULL,
            fingerprint TEXT NOT NULL,
            added_at DATETIME NOT NULL,
            expires_at DATETIME,
            PRIMARY KEY (community_id, fingerprint)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS claims (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            community_id INTEGER NOT NULL,
            fingerprint TEXT NOT NULL,
            claimant_id INTEGER NOT NULL,
            claimed_at DATETIME NOT NULL,
            UNIQUE(community_id, fingerprint)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_claims_claimant ON claims(community_id, claimant_id)")
        .execute(pool)
        .await?;

    info!("Database migrations complete");
    Ok(())
}
