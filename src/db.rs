use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;

/// A row from `unresolvable_domains`, oldest-retry-first candidates for
/// the scheduled sweep.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UnresolvableRow {
    pub domain: String,
    pub wildcard_ref: String,
    pub retry_count: i64,
    pub last_retry_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Pending insertion into `unresolvable_domains`.
#[derive(Debug, Clone)]
pub struct UnresolvableInsert {
    pub domain: String,
    pub wildcard_ref: String,
}

/// Embedded single-writer store. WAL keeps readers off the writer's
/// back; the pool is sized to the worker ceiling.
pub struct Db {
    pool: SqlitePool,
}

impl Db {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("invalid database url {}", url))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(opts)
            .await
            .context("failed to open database")?;
        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS wildcards (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 pattern TEXT NOT NULL UNIQUE,
                 program TEXT NOT NULL DEFAULT '',
                 created_at TEXT NOT NULL
             )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS discovered_domains (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 domain TEXT NOT NULL UNIQUE,
                 ip TEXT NOT NULL,
                 program TEXT NOT NULL DEFAULT '',
                 discovered_at TEXT NOT NULL
             )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS unresolvable_domains (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 domain TEXT NOT NULL UNIQUE,
                 wildcard_ref TEXT NOT NULL DEFAULT '',
                 retry_count INTEGER NOT NULL DEFAULT 0,
                 last_retry_at TEXT NOT NULL,
                 created_at TEXT NOT NULL
             )",
        )
        .execute(&self.pool)
        .await?;
        for idx in [
            "CREATE INDEX IF NOT EXISTS idx_wildcards_pattern ON wildcards(pattern)",
            "CREATE INDEX IF NOT EXISTS idx_discovered_domain ON discovered_domains(domain)",
            "CREATE INDEX IF NOT EXISTS idx_unresolvable_domain ON unresolvable_domains(domain)",
            "CREATE INDEX IF NOT EXISTS idx_unresolvable_retry ON unresolvable_domains(retry_count)",
            "CREATE INDEX IF NOT EXISTS idx_unresolvable_created ON unresolvable_domains(created_at)",
        ] {
            sqlx::query(idx).execute(&self.pool).await?;
        }
        Ok(())
    }

    // ---- wildcards ----

    pub async fn upsert_wildcards(&self, patterns: &[(String, String)]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        for (pattern, program) in patterns {
            sqlx::query(
                "INSERT INTO wildcards (pattern, program, created_at) VALUES (?, ?, ?)
                 ON CONFLICT(pattern) DO UPDATE SET program = excluded.program",
            )
            .bind(pattern)
            .bind(program)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Persisted patterns, used as the startup fallback when every
    /// source fails before the first successful refresh.
    pub async fn load_wildcards(&self) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query("SELECT pattern, program FROM wildcards")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>("pattern"), r.get::<String, _>("program")))
            .collect())
    }

    // ---- discovered domains ----

    pub async fn domain_known(&self, domain: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM discovered_domains WHERE domain = ? LIMIT 1")
            .bind(domain)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Insert-or-ignore; the unique constraint makes re-discovery
    /// idempotent. Returns whether a new row was written.
    pub async fn insert_discovered(&self, domain: &str, ip: &str, program: &str) -> Result<bool> {
        let res = sqlx::query(
            "INSERT OR IGNORE INTO discovered_domains (domain, ip, program, discovered_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(domain)
        .bind(ip)
        .bind(program)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Most recent discoveries, newest first, for warming the
    /// deduplicator on cold start.
    pub async fn recent_domains(&self, limit: i64) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT domain FROM discovered_domains ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.get::<String, _>("domain")).collect())
    }

    // ---- unresolvable domains ----

    pub async fn insert_unresolvables(&self, batch: &[UnresolvableInsert]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        for item in batch {
            sqlx::query(
                "INSERT OR IGNORE INTO unresolvable_domains
                     (domain, wildcard_ref, retry_count, last_retry_at, created_at)
                 VALUES (?, ?, 0, ?, ?)",
            )
            .bind(&item.domain)
            .bind(&item.wildcard_ref)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Drop rows that have sat in the table longer than `max_age`,
    /// regardless of retry outcome. Returns how many were purged.
    pub async fn purge_unresolvables_older_than(&self, max_age: Duration) -> Result<u64> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(max_age).unwrap_or_else(|_| ChronoDuration::days(3));
        let res = sqlx::query("DELETE FROM unresolvable_domains WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    /// Drop exhausted rows whose last retry is older than the hard TTL.
    pub async fn purge_exhausted_unresolvables(
        &self,
        max_retries: i64,
        hard_ttl: Duration,
    ) -> Result<u64> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(hard_ttl).unwrap_or_else(|_| ChronoDuration::days(7));
        let res = sqlx::query(
            "DELETE FROM unresolvable_domains WHERE retry_count > ? AND last_retry_at < ?",
        )
        .bind(max_retries)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    pub async fn select_unresolvables(&self, limit: i64) -> Result<Vec<UnresolvableRow>> {
        let rows = sqlx::query_as::<_, UnresolvableRow>(
            "SELECT domain, wildcard_ref, retry_count, last_retry_at, created_at
             FROM unresolvable_domains ORDER BY retry_count ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn delete_unresolvable(&self, domain: &str) -> Result<()> {
        sqlx::query("DELETE FROM unresolvable_domains WHERE domain = ?")
            .bind(domain)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn bump_unresolvable(&self, domain: &str) -> Result<()> {
        sqlx::query(
            "UPDATE unresolvable_domains SET retry_count = retry_count + 1, last_retry_at = ?
             WHERE domain = ?",
        )
        .bind(Utc::now())
        .bind(domain)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn wildcard_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM wildcards")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_db() -> Db {
        Db::connect("sqlite::memory:", 1).await.unwrap()
    }

    #[tokio::test]
    async fn discovered_insert_is_idempotent() {
        let db = memory_db().await;
        assert!(db.insert_discovered("api.example.com", "93.184.216.34", "acme").await.unwrap());
        assert!(!db.insert_discovered("api.example.com", "93.184.216.34", "acme").await.unwrap());
        assert!(db.domain_known("api.example.com").await.unwrap());
        assert!(!db.domain_known("other.example.com").await.unwrap());
    }

    #[tokio::test]
    async fn recent_domains_newest_first_with_limit() {
        let db = memory_db().await;
        for i in 0..5 {
            db.insert_discovered(&format!("h{}.example.com", i), "1.2.3.4", "").await.unwrap();
        }
        let recent = db.recent_domains(3).await.unwrap();
        assert_eq!(recent, vec!["h4.example.com", "h3.example.com", "h2.example.com"]);
    }

    #[tokio::test]
    async fn wildcard_upsert_keeps_pattern_unique() {
        let db = memory_db().await;
        db.upsert_wildcards(&[
            ("example.com".into(), "p1".into()),
            ("example.org".into(), "p2".into()),
        ])
        .await
        .unwrap();
        db.upsert_wildcards(&[("example.com".into(), "p3".into())]).await.unwrap();
        assert_eq!(db.wildcard_count().await.unwrap(), 2);
        let loaded = db.load_wildcards().await.unwrap();
        let com = loaded.iter().find(|(p, _)| p == "example.com").unwrap();
        assert_eq!(com.1, "p3");
    }

    #[tokio::test]
    async fn unresolvable_lifecycle() {
        let db = memory_db().await;
        db.insert_unresolvables(&[
            UnresolvableInsert { domain: "a.example.com".into(), wildcard_ref: "example.com".into() },
            UnresolvableInsert { domain: "b.example.com".into(), wildcard_ref: "example.com".into() },
        ])
        .await
        .unwrap();
        // duplicate insert is ignored
        db.insert_unresolvables(&[UnresolvableInsert {
            domain: "a.example.com".into(),
            wildcard_ref: "example.com".into(),
        }])
        .await
        .unwrap();

        let rows = db.select_unresolvables(10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.retry_count == 0));

        db.bump_unresolvable("a.example.com").await.unwrap();
        db.bump_unresolvable("a.example.com").await.unwrap();
        let rows = db.select_unresolvables(10).await.unwrap();
        // ordered by retry_count ascending
        assert_eq!(rows[0].domain, "b.example.com");
        assert_eq!(rows[1].domain, "a.example.com");
        assert_eq!(rows[1].retry_count, 2);

        db.delete_unresolvable("a.example.com").await.unwrap();
        assert_eq!(db.select_unresolvables(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn file_backed_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("rucert.db").display());
        {
            let db = Db::connect(&url, 2).await.unwrap();
            assert!(db.insert_discovered("api.example.com", "93.184.216.34", "acme").await.unwrap());
        }
        let db = Db::connect(&url, 2).await.unwrap();
        assert!(db.domain_known("api.example.com").await.unwrap());
    }

    #[tokio::test]
    async fn purge_by_age_and_exhaustion() {
        let db = memory_db().await;
        db.insert_unresolvables(&[
            UnresolvableInsert { domain: "old.example.com".into(), wildcard_ref: "example.com".into() },
            UnresolvableInsert { domain: "new.example.com".into(), wildcard_ref: "example.com".into() },
        ])
        .await
        .unwrap();
        // Backdate one row past the purge age.
        let old = Utc::now() - ChronoDuration::days(4);
        sqlx::query("UPDATE unresolvable_domains SET created_at = ? WHERE domain = ?")
            .bind(old)
            .bind("old.example.com")
            .execute(&db.pool)
            .await
            .unwrap();

        let purged = db
            .purge_unresolvables_older_than(Duration::from_secs(3 * 24 * 3600))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        let rows = db.select_unresolvables(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].domain, "new.example.com");

        // Exhausted + stale rows fall to the hard TTL purge.
        for _ in 0..6 {
            db.bump_unresolvable("new.example.com").await.unwrap();
        }
        let stale = Utc::now() - ChronoDuration::days(8);
        sqlx::query("UPDATE unresolvable_domains SET last_retry_at = ?")
            .bind(stale)
            .execute(&db.pool)
            .await
            .unwrap();
        let purged = db
            .purge_exhausted_unresolvables(5, Duration::from_secs(7 * 24 * 3600))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(db.select_unresolvables(10).await.unwrap().is_empty());
    }
}
