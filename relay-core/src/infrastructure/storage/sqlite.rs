use super::traits::{domain_matches, RelayStore};
use crate::domain::model::{Account, Host, HostStatus, RepoState};
use crate::foundation::{RelayError, Result, Tid, Uid};
use async_trait::async_trait;
use ipld_core::cid::Cid;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

/// SQLite-backed [`RelayStore`].
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|err| RelayError::Config(format!("database url: {err}")))?
            .create_if_missing(true);
        // In-memory databases are per-connection; keep the pool at one so
        // every query sees the same database.
        let max_connections = if url.contains("memory") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new().max_connections(max_connections).connect_with(options).await?;
        Ok(Self { pool })
    }

    /// Creates missing tables and indexes. Safe to run on every startup.
    pub async fn migrate(&self) -> Result<()> {
        const STATEMENTS: &[&str] = &[
            "CREATE TABLE IF NOT EXISTS host (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                hostname TEXT NOT NULL UNIQUE,
                ssl INTEGER NOT NULL DEFAULT 1,
                concurrency INTEGER,
                queue_depth INTEGER,
                account_limit INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                cursor INTEGER NOT NULL DEFAULT 0
            )",
            "CREATE TABLE IF NOT EXISTS account (
                uid INTEGER PRIMARY KEY AUTOINCREMENT,
                did TEXT NOT NULL UNIQUE,
                host_id INTEGER NOT NULL REFERENCES host(id),
                taken_down INTEGER NOT NULL DEFAULT 0
            )",
            "CREATE INDEX IF NOT EXISTS account_host_idx ON account(host_id)",
            "CREATE TABLE IF NOT EXISTS account_repo (
                uid INTEGER PRIMARY KEY,
                rev TEXT NOT NULL,
                data TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS domain_ban (
                domain TEXT PRIMARY KEY
            )",
        ];
        for statement in STATEMENTS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn host_from_row(row: &SqliteRow) -> Result<Host> {
    let status: String = row.try_get("status")?;
    Ok(Host {
        id: row.try_get::<i64, _>("id")? as u64,
        hostname: row.try_get("hostname")?,
        ssl: row.try_get("ssl")?,
        concurrency: row.try_get::<Option<i64>, _>("concurrency")?.map(|v| v as u32),
        queue_depth: row.try_get::<Option<i64>, _>("queue_depth")?.map(|v| v as u32),
        account_limit: row.try_get("account_limit")?,
        status: status.parse()?,
        cursor: row.try_get("cursor")?,
    })
}

fn account_from_row(row: &SqliteRow) -> Result<Account> {
    Ok(Account {
        uid: Uid(row.try_get::<i64, _>("uid")? as u64),
        did: row.try_get("did")?,
        host_id: row.try_get::<i64, _>("host_id")? as u64,
        taken_down: row.try_get("taken_down")?,
    })
}

#[async_trait]
impl RelayStore for SqliteStore {
    async fn upsert_host(&self, hostname: &str, ssl: bool, account_limit: i64) -> Result<Host> {
        sqlx::query("INSERT INTO host (hostname, ssl, account_limit) VALUES (?1, ?2, ?3) ON CONFLICT(hostname) DO NOTHING")
            .bind(hostname)
            .bind(ssl)
            .bind(account_limit)
            .execute(&self.pool)
            .await?;
        self.host_by_name(hostname)
            .await?
            .ok_or_else(|| RelayError::storage("sqlite", format!("host vanished after upsert: {hostname}")))
    }

    async fn host_by_name(&self, hostname: &str) -> Result<Option<Host>> {
        let row = sqlx::query("SELECT * FROM host WHERE hostname = ?1")
            .bind(hostname)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(host_from_row).transpose()
    }

    async fn list_hosts(&self) -> Result<Vec<Host>> {
        let rows = sqlx::query("SELECT * FROM host ORDER BY id").fetch_all(&self.pool).await?;
        rows.iter().map(host_from_row).collect()
    }

    async fn update_host_status(&self, host_id: u64, status: HostStatus) -> Result<()> {
        sqlx::query("UPDATE host SET status = ?1 WHERE id = ?2")
            .bind(status.as_str())
            .bind(host_id as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_host_cursor(&self, host_id: u64, cursor: i64) -> Result<()> {
        sqlx::query("UPDATE host SET cursor = ?1 WHERE id = ?2")
            .bind(cursor)
            .bind(host_id as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn account_by_did(&self, did: &str) -> Result<Option<Account>> {
        let row = sqlx::query("SELECT * FROM account WHERE did = ?1").bind(did).fetch_optional(&self.pool).await?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn create_account(&self, did: &str, host_id: u64) -> Result<Account> {
        sqlx::query("INSERT INTO account (did, host_id) VALUES (?1, ?2)")
            .bind(did)
            .bind(host_id as i64)
            .execute(&self.pool)
            .await?;
        self.account_by_did(did)
            .await?
            .ok_or_else(|| RelayError::storage("sqlite", format!("account vanished after insert: {did}")))
    }

    async fn account_count_for_host(&self, host_id: u64) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM account WHERE host_id = ?1")
            .bind(host_id as i64)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    async fn set_account_takedown(&self, uid: Uid, taken_down: bool) -> Result<()> {
        sqlx::query("UPDATE account SET taken_down = ?1 WHERE uid = ?2")
            .bind(taken_down)
            .bind(uid.0 as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn repo_state(&self, uid: Uid) -> Result<Option<RepoState>> {
        let row = sqlx::query("SELECT rev, data FROM account_repo WHERE uid = ?1")
            .bind(uid.0 as i64)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let rev: String = row.try_get("rev")?;
        let data: String = row.try_get("data")?;
        let data = Cid::try_from(data.as_str())
            .map_err(|err| RelayError::storage("sqlite", format!("stored data cid: {err}")))?;
        Ok(Some(RepoState { rev: Tid::parse(&rev)?, data }))
    }

    async fn put_repo_state(&self, uid: Uid, rev: &Tid, data: &Cid) -> Result<()> {
        sqlx::query(
            "INSERT INTO account_repo (uid, rev, data) VALUES (?1, ?2, ?3)
             ON CONFLICT(uid) DO UPDATE SET rev = excluded.rev, data = excluded.data",
        )
        .bind(uid.0 as i64)
        .bind(rev.as_str())
        .bind(data.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn add_domain_ban(&self, domain: &str) -> Result<()> {
        sqlx::query("INSERT INTO domain_ban (domain) VALUES (?1) ON CONFLICT(domain) DO NOTHING")
            .bind(domain)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn is_domain_banned(&self, hostname: &str) -> Result<bool> {
        let rows = sqlx::query("SELECT domain FROM domain_ban").fetch_all(&self.pool).await?;
        for row in rows {
            let banned: String = row.try_get("domain")?;
            if domain_matches(hostname, &banned) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
