use chrono::Utc;
use mobc::{Manager, Pool};
use rusqlite::{params, Connection, Result as SqliteResult};
use std::path::Path;
use tracing::{debug, info};

use crate::models::{Repository, RepositorySettings, Result, SnowballConfig};

pub struct SqliteManager {
    db_path: String,
}

impl SqliteManager {
    pub fn new(db_path: String) -> Self {
        Self { db_path }
    }
}

#[async_trait::async_trait]
impl Manager for SqliteManager {
    type Connection = Connection;
    type Error = rusqlite::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        debug!("Opening database: {}", self.db_path);
        let conn = Connection::open(&self.db_path)?;

        // Some PRAGMA statements return a result row, so execute() fails
        // with ExecuteReturnedResults and we retry with query_row.
        let exec_pragma = |conn: &Connection, pragma: &str| -> std::result::Result<(), rusqlite::Error> {
            match conn.execute(pragma, []) {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::ExecuteReturnedResults) => {
                    conn.query_row(pragma, [], |_| Ok(()))
                }
                Err(e) => Err(e),
            }
        };

        exec_pragma(&conn, "PRAGMA journal_mode=WAL")?;
        exec_pragma(&conn, "PRAGMA synchronous=NORMAL")?;
        exec_pragma(&conn, "PRAGMA foreign_keys=ON")?;
        exec_pragma(&conn, "PRAGMA busy_timeout=5000")?;

        init_database(&conn)?;
        Ok(conn)
    }

    async fn check(&self, conn: Self::Connection) -> std::result::Result<Self::Connection, Self::Error> {
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(conn)
    }
}

pub type DbPool = Pool<SqliteManager>;

pub async fn create_db_pool(db_path: &str) -> Result<DbPool> {
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let manager = SqliteManager::new(db_path.to_string());
    let pool = Pool::builder().max_open(10).max_idle(5).build(manager);

    info!("✓ SQLite connection pool created: {}", db_path);
    Ok(pool)
}

fn init_database(conn: &Connection) -> SqliteResult<()> {
    create_repositories_table(conn)?;
    create_members_table(conn)?;
    create_forward_candidates_table(conn)?;
    create_snowball_events_table(conn)?;
    create_csv_imports_table(conn)?;
    create_admission_cycles_table(conn)?;
    create_indexes(conn)?;
    Ok(())
}

fn create_repositories_table(conn: &Connection) -> SqliteResult<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS repositories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            owner TEXT NOT NULL,
            visibility TEXT NOT NULL DEFAULT 'private',
            archived INTEGER NOT NULL DEFAULT 0,
            quality_threshold REAL NOT NULL,
            auto_approve INTEGER NOT NULL,
            allowed_domains TEXT NOT NULL DEFAULT '[]',
            blocked_domains TEXT NOT NULL DEFAULT '[]',
            max_emails_per_contributor INTEGER NOT NULL,
            snowball_enabled INTEGER NOT NULL,
            max_depth INTEGER NOT NULL,
            multiplier_target REAL NOT NULL,
            auto_add_threshold INTEGER NOT NULL,
            cooldown_hours INTEGER NOT NULL,
            max_growth_rate REAL NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
        [],
    )?;
    Ok(())
}

fn create_members_table(conn: &Connection) -> SqliteResult<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS members (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            repository_id INTEGER NOT NULL,
            email TEXT NOT NULL,
            domain TEXT NOT NULL,
            source TEXT NOT NULL,
            state TEXT NOT NULL,
            trust_score REAL NOT NULL DEFAULT 0,
            tags TEXT NOT NULL DEFAULT '',
            opens INTEGER NOT NULL DEFAULT 0,
            clicks INTEGER NOT NULL DEFAULT 0,
            replies INTEGER NOT NULL DEFAULT 0,
            forwards INTEGER NOT NULL DEFAULT 0,
            bounce_count INTEGER NOT NULL DEFAULT 0,
            complaint_count INTEGER NOT NULL DEFAULT 0,
            can_receive_digest INTEGER NOT NULL DEFAULT 1,
            can_receive_snowball INTEGER NOT NULL DEFAULT 1,
            can_be_shared INTEGER NOT NULL DEFAULT 0,
            added_by TEXT,
            added_at TEXT NOT NULL,
            verified_at TEXT,
            last_engagement_at TEXT,
            UNIQUE(repository_id, email)
        )
        "#,
        [],
    )?;
    Ok(())
}

fn create_forward_candidates_table(conn: &Connection) -> SqliteResult<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS forward_candidates (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            repository_id INTEGER NOT NULL,
            email TEXT NOT NULL,
            forwarder_count INTEGER NOT NULL DEFAULT 0,
            forwarders TEXT NOT NULL DEFAULT '[]',
            min_depth INTEGER NOT NULL,
            trust_score REAL NOT NULL DEFAULT 0,
            first_seen TEXT NOT NULL,
            last_seen TEXT NOT NULL,
            UNIQUE(repository_id, email)
        )
        "#,
        [],
    )?;
    Ok(())
}

fn create_snowball_events_table(conn: &Connection) -> SqliteResult<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS snowball_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            repository_id INTEGER NOT NULL,
            source_email TEXT NOT NULL,
            candidate_email TEXT NOT NULL,
            depth INTEGER NOT NULL,
            forwarder_count INTEGER NOT NULL,
            multiplier REAL NOT NULL,
            approved INTEGER NOT NULL,
            reason TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
        [],
    )?;
    Ok(())
}

fn create_csv_imports_table(conn: &Connection) -> SqliteResult<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS csv_imports (
            id TEXT PRIMARY KEY,
            repository_id INTEGER NOT NULL,
            filename TEXT NOT NULL,
            uploaded_by TEXT NOT NULL,
            status TEXT NOT NULL,
            total_rows INTEGER NOT NULL DEFAULT 0,
            valid_emails INTEGER NOT NULL DEFAULT 0,
            duplicate_emails INTEGER NOT NULL DEFAULT 0,
            invalid_emails INTEGER NOT NULL DEFAULT 0,
            processed_rows INTEGER NOT NULL DEFAULT 0,
            admitted_rows INTEGER NOT NULL DEFAULT 0,
            error_log TEXT NOT NULL DEFAULT '[]',
            started_at TEXT NOT NULL,
            finished_at TEXT
        )
        "#,
        [],
    )?;
    Ok(())
}

fn create_admission_cycles_table(conn: &Connection) -> SqliteResult<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS admission_cycles (
            repository_id INTEGER NOT NULL,
            cycle_start TEXT NOT NULL,
            base_size INTEGER NOT NULL,
            admitted INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (repository_id, cycle_start)
        )
        "#,
        [],
    )?;
    Ok(())
}

fn create_indexes(conn: &Connection) -> SqliteResult<()> {
    let indexes = [
        "CREATE INDEX IF NOT EXISTS idx_members_repo_state ON members(repository_id, state)",
        "CREATE INDEX IF NOT EXISTS idx_members_repo_email ON members(repository_id, email)",
        "CREATE INDEX IF NOT EXISTS idx_members_added_at ON members(repository_id, added_at)",
        "CREATE INDEX IF NOT EXISTS idx_candidates_repo_email ON forward_candidates(repository_id, email)",
        "CREATE INDEX IF NOT EXISTS idx_candidates_last_seen ON forward_candidates(last_seen)",
        "CREATE INDEX IF NOT EXISTS idx_events_repo ON snowball_events(repository_id, created_at)",
        "CREATE INDEX IF NOT EXISTS idx_imports_repo ON csv_imports(repository_id)",
    ];

    for index_sql in indexes.iter() {
        conn.execute(index_sql, [])?;
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct NewRepository {
    pub name: String,
    pub owner: String,
    pub visibility: String,
    pub settings: RepositorySettings,
    pub snowball: SnowballConfig,
}

pub async fn create_repository(pool: &DbPool, new: NewRepository) -> Result<Repository> {
    new.settings.validate()?;
    new.snowball.validate()?;

    let conn = pool.get().await?;
    let created_at = Utc::now();
    conn.execute(
        r#"
        INSERT INTO repositories (
            name, owner, visibility, archived,
            quality_threshold, auto_approve, allowed_domains, blocked_domains,
            max_emails_per_contributor,
            snowball_enabled, max_depth, multiplier_target, auto_add_threshold,
            cooldown_hours, max_growth_rate, created_at
        ) VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
        "#,
        params![
            new.name,
            new.owner,
            new.visibility,
            new.settings.quality_threshold,
            new.settings.auto_approve as i64,
            serde_json::to_string(&new.settings.allowed_domains)?,
            serde_json::to_string(&new.settings.blocked_domains)?,
            new.settings.max_emails_per_contributor as i64,
            new.snowball.enabled as i64,
            new.snowball.max_depth as i64,
            new.snowball.multiplier_target,
            new.snowball.auto_add_threshold as i64,
            new.snowball.cooldown_hours,
            new.snowball.max_growth_rate,
            created_at,
        ],
    )?;
    let id = conn.last_insert_rowid();

    Ok(Repository {
        id,
        name: new.name,
        owner: new.owner,
        visibility: new.visibility,
        archived: false,
        settings: new.settings,
        snowball: new.snowball,
        created_at,
    })
}

pub async fn get_repository(pool: &DbPool, id: i64) -> Result<Option<Repository>> {
    let conn = pool.get().await?;
    let mut stmt = conn.prepare(
        r#"
        SELECT id, name, owner, visibility, archived,
               quality_threshold, auto_approve, allowed_domains, blocked_domains,
               max_emails_per_contributor,
               snowball_enabled, max_depth, multiplier_target, auto_add_threshold,
               cooldown_hours, max_growth_rate, created_at
        FROM repositories WHERE id = ?1
        "#,
    )?;

    let mut rows = stmt.query(params![id])?;
    match rows.next()? {
        Some(row) => Ok(Some(map_repository_row(row)?)),
        None => Ok(None),
    }
}

fn map_repository_row(row: &rusqlite::Row<'_>) -> SqliteResult<Repository> {
    let allowed: String = row.get(7)?;
    let blocked: String = row.get(8)?;
    Ok(Repository {
        id: row.get(0)?,
        name: row.get(1)?,
        owner: row.get(2)?,
        visibility: row.get(3)?,
        archived: row.get::<_, i64>(4)? != 0,
        settings: RepositorySettings {
            quality_threshold: row.get(5)?,
            auto_approve: row.get::<_, i64>(6)? != 0,
            allowed_domains: serde_json::from_str(&allowed).unwrap_or_default(),
            blocked_domains: serde_json::from_str(&blocked).unwrap_or_default(),
            max_emails_per_contributor: row.get::<_, i64>(9)? as usize,
        },
        snowball: SnowballConfig {
            enabled: row.get::<_, i64>(10)? != 0,
            max_depth: row.get::<_, i64>(11)? as u32,
            multiplier_target: row.get(12)?,
            auto_add_threshold: row.get::<_, i64>(13)? as usize,
            cooldown_hours: row.get(14)?,
            max_growth_rate: row.get(15)?,
        },
        created_at: row.get(16)?,
    })
}

pub async fn update_repository_settings(
    pool: &DbPool,
    id: i64,
    settings: &RepositorySettings,
) -> Result<bool> {
    settings.validate()?;

    let conn = pool.get().await?;
    let changed = conn.execute(
        r#"
        UPDATE repositories SET
            quality_threshold = ?1,
            auto_approve = ?2,
            allowed_domains = ?3,
            blocked_domains = ?4,
            max_emails_per_contributor = ?5
        WHERE id = ?6
        "#,
        params![
            settings.quality_threshold,
            settings.auto_approve as i64,
            serde_json::to_string(&settings.allowed_domains)?,
            serde_json::to_string(&settings.blocked_domains)?,
            settings.max_emails_per_contributor as i64,
            id,
        ],
    )?;
    Ok(changed > 0)
}

pub async fn update_snowball_config(
    pool: &DbPool,
    id: i64,
    snowball: &SnowballConfig,
) -> Result<bool> {
    snowball.validate()?;

    let conn = pool.get().await?;
    let changed = conn.execute(
        r#"
        UPDATE repositories SET
            snowball_enabled = ?1,
            max_depth = ?2,
            multiplier_target = ?3,
            auto_add_threshold = ?4,
            cooldown_hours = ?5,
            max_growth_rate = ?6
        WHERE id = ?7
        "#,
        params![
            snowball.enabled as i64,
            snowball.max_depth as i64,
            snowball.multiplier_target,
            snowball.auto_add_threshold as i64,
            snowball.cooldown_hours,
            snowball.max_growth_rate,
            id,
        ],
    )?;
    Ok(changed > 0)
}

pub async fn archive_repository(pool: &DbPool, id: i64) -> Result<bool> {
    let conn = pool.get().await?;
    let changed = conn.execute(
        "UPDATE repositories SET archived = 1 WHERE id = ?1",
        params![id],
    )?;
    Ok(changed > 0)
}


#[cfg(test)]
mod tests {
    use super::testutil::{test_pool, test_repository};
    use super::*;

    #[tokio::test]
    async fn repository_round_trips() {
        let pool = test_pool().await;
        let repo = test_repository(&pool).await;

        let loaded = get_repository(&pool, repo.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "rust-jobs-weekly");
        assert_eq!(loaded.snowball.max_depth, 3);
        assert_eq!(loaded.settings.quality_threshold, 0.5);
        assert!(!loaded.archived);
    }

    #[tokio::test]
    async fn settings_update_rejects_out_of_range_threshold() {
        let pool = test_pool().await;
        let repo = test_repository(&pool).await;

        let mut settings = repo.settings.clone();
        settings.quality_threshold = 1.5;
        assert!(update_repository_settings(&pool, repo.id, &settings)
            .await
            .is_err());

        settings.quality_threshold = 0.8;
        assert!(update_repository_settings(&pool, repo.id, &settings)
            .await
            .unwrap());
        let loaded = get_repository(&pool, repo.id).await.unwrap().unwrap();
        assert_eq!(loaded.settings.quality_threshold, 0.8);
    }

    #[tokio::test]
    async fn snowball_update_rejects_zero_threshold() {
        let pool = test_pool().await;
        let repo = test_repository(&pool).await;

        let mut snowball = repo.snowball.clone();
        snowball.auto_add_threshold = 0;
        assert!(update_snowball_config(&pool, repo.id, &snowball)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn missing_repository_is_none() {
        let pool = test_pool().await;
        assert!(get_repository(&pool, 4242).await.unwrap().is_none());
    }
}
