use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::models::{
    EmploymentType, Filter, Job, QueueEntry, SubscriptionStatus, SwedishLocation, User,
    UserPreferences,
};

pub struct Database {
    conn: Connection,
    path: PathBuf,
}

/// What one ingestion batch wrote.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StoredBatch {
    pub jobs_added: usize,
    pub queued: usize,
}

/// A user due a digest today.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub user_id: i64,
    pub email: String,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        conn.pragma_update(None, "foreign_keys", true)?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", true)?;
        Ok(Self {
            conn,
            path: PathBuf::from(":memory:"),
        })
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// `--db` / `DIGEST_DB` wins, then the platform data dir.
    pub fn resolve_path(explicit: Option<PathBuf>) -> PathBuf {
        if let Some(path) = explicit {
            return path;
        }
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "digest") {
            proj_dirs.data_dir().join("digest.db")
        } else {
            PathBuf::from("digest.db")
        }
    }

    pub fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email TEXT NOT NULL UNIQUE COLLATE NOCASE,
                subscription_status TEXT NOT NULL DEFAULT 'trialing'
                    CHECK (subscription_status IN ('trialing', 'active', 'past_due', 'canceled', 'inactive')),
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS user_preferences (
                user_id INTEGER PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
                delivery_days TEXT NOT NULL DEFAULT '[1,2,3,4,5]',
                keywords_include TEXT NOT NULL DEFAULT '[]',
                keywords_exclude TEXT NOT NULL DEFAULT '[]',
                sources_enabled TEXT NOT NULL DEFAULT '[]',
                countries TEXT NOT NULL DEFAULT '[]',
                regions TEXT NOT NULL DEFAULT '[]',
                municipalities TEXT NOT NULL DEFAULT '[]',
                employment_types TEXT NOT NULL DEFAULT '["permanent","interim"]',
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                company TEXT NOT NULL DEFAULT '',
                url TEXT NOT NULL,
                source TEXT NOT NULL,
                country TEXT DEFAULT 'SE',
                municipality_code TEXT,
                lan_code TEXT,
                location_raw TEXT,
                employment_type TEXT CHECK (employment_type IN ('permanent', 'interim')),
                first_seen_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS user_job_queue (
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                queued_at TEXT NOT NULL,
                sent_at TEXT,
                PRIMARY KEY (user_id, job_id)
            );

            CREATE TABLE IF NOT EXISTS swedish_locations (
                municipality_code TEXT PRIMARY KEY,
                municipality_name TEXT NOT NULL,
                lan_code TEXT NOT NULL,
                lan_name TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_first_seen ON jobs(first_seen_at);
            CREATE INDEX IF NOT EXISTS idx_queue_unsent ON user_job_queue(user_id) WHERE sent_at IS NULL;
            "#,
        )?;
        Ok(())
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        let tables: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='user_job_queue'",
            [],
            |row| row.get(0),
        )?;
        if tables == 0 {
            return Err(anyhow!(
                "Database not initialized. Run 'digest init' first."
            ));
        }
        Ok(())
    }

    // --- User operations ---

    /// Creates the account together with its default preferences.
    pub fn create_user(
        &self,
        email: &str,
        status: SubscriptionStatus,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO users (email, subscription_status, created_at) VALUES (?1, ?2, ?3)",
            params![email.trim(), status.as_str(), now],
        )
        .with_context(|| format!("Failed to create user {}", email))?;
        let user_id = tx.last_insert_rowid();

        write_preferences(&tx, &UserPreferences::signup_defaults(user_id), now)?;
        tx.commit()?;
        Ok(user_id)
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        self.conn
            .query_row(
                "SELECT id, email, subscription_status, created_at FROM users WHERE email = ?1",
                [email.trim()],
                Self::row_to_user,
            )
            .optional()
            .context("Failed to load user")
    }

    pub fn set_subscription_status(&self, user_id: i64, status: SubscriptionStatus) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE users SET subscription_status = ?1 WHERE id = ?2",
            params![status.as_str(), user_id],
        )?;
        if changed == 0 {
            return Err(anyhow!("User #{} not found", user_id));
        }
        Ok(())
    }

    /// Removes the account; preferences and queue rows go with it.
    pub fn delete_user(&self, user_id: i64) -> Result<bool> {
        let changed = self.conn.execute("DELETE FROM users WHERE id = ?1", [user_id])?;
        Ok(changed > 0)
    }

    pub fn count_active_users(&self) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM users WHERE subscription_status IN ('active', 'trialing')",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn row_to_user(row: &rusqlite::Row) -> rusqlite::Result<User> {
        let status: String = row.get(2)?;
        Ok(User {
            id: row.get(0)?,
            email: row.get(1)?,
            subscription: status
                .parse::<SubscriptionStatus>()
                .map_err(|e| conversion_error(2, e.into()))?,
            created_at: row.get(3)?,
        })
    }

    // --- Preference operations ---

    pub fn get_preferences(&self, user_id: i64) -> Result<Option<UserPreferences>> {
        self.conn
            .query_row(
                "SELECT user_id, delivery_days, keywords_include, keywords_exclude,
                        sources_enabled, countries, regions, municipalities, employment_types
                 FROM user_preferences WHERE user_id = ?1",
                [user_id],
                Self::row_to_preferences,
            )
            .optional()
            .context("Failed to load preferences")
    }

    /// Validates, then stores. Returns the normalized preferences.
    pub fn save_preferences(
        &self,
        prefs: UserPreferences,
        now: DateTime<Utc>,
    ) -> Result<UserPreferences> {
        let prefs = prefs.validated()?;
        write_preferences(&self.conn, &prefs, now)?;
        Ok(prefs)
    }

    /// Preferences of every user that currently receives matches.
    pub fn subscribed_preferences(&self) -> Result<Vec<UserPreferences>> {
        let mut stmt = self.conn.prepare(
            "SELECT p.user_id, p.delivery_days, p.keywords_include, p.keywords_exclude,
                    p.sources_enabled, p.countries, p.regions, p.municipalities, p.employment_types
             FROM user_preferences p
             JOIN users u ON u.id = p.user_id
             WHERE u.subscription_status IN ('active', 'trialing')
             ORDER BY p.user_id",
        )?;
        let rows = stmt.query_map([], Self::row_to_preferences)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list subscribed preferences")
    }

    fn row_to_preferences(row: &rusqlite::Row) -> rusqlite::Result<UserPreferences> {
        Ok(UserPreferences {
            user_id: row.get(0)?,
            delivery_days: json_column::<BTreeSet<u8>>(row, 1)?,
            keywords_include: json_column::<Filter<String>>(row, 2)?,
            keywords_exclude: json_column::<Filter<String>>(row, 3)?,
            sources: json_column::<Filter<String>>(row, 4)?,
            countries: json_column::<Filter<String>>(row, 5)?,
            regions: json_column::<Filter<String>>(row, 6)?,
            municipalities: json_column::<Filter<String>>(row, 7)?,
            employment_types: json_column::<Filter<EmploymentType>>(row, 8)?,
        })
    }

    // --- Job operations ---

    pub fn is_seen(&self, job_id: &str) -> Result<bool> {
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM jobs WHERE id = ?1)",
            [job_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Jobs are immutable: a second insert of the same id is ignored.
    #[cfg(test)]
    pub fn insert_job(&self, job: &Job) -> Result<bool> {
        write_job(&self.conn, job)
    }

    /// Stores new jobs and their queue entries in one transaction.
    ///
    /// Either both land or neither does, so a failed batch can be retried
    /// without its jobs being taken as already seen.
    pub fn store_jobs_with_queue(
        &self,
        jobs: &[Job],
        entries: &[(i64, String)],
        now: DateTime<Utc>,
    ) -> Result<StoredBatch> {
        let tx = self.conn.unchecked_transaction()?;
        let mut batch = StoredBatch::default();
        for job in jobs {
            if write_job(&tx, job)? {
                batch.jobs_added += 1;
            }
        }
        batch.queued = write_queue_entries(&tx, entries, now)?;
        tx.commit()?;

        debug!(jobs = batch.jobs_added, queued = batch.queued, "job batch stored");
        Ok(batch)
    }

    pub fn get_job(&self, id: &str) -> Result<Option<Job>> {
        self.conn
            .query_row(
                &format!("{} WHERE id = ?1", JOB_COLUMNS),
                [id],
                Self::row_to_job,
            )
            .optional()
            .context("Failed to load job")
    }

    /// Jobs first seen at or after `since`, newest first.
    pub fn jobs_seen_since(&self, since: DateTime<Utc>) -> Result<Vec<Job>> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE first_seen_at >= ?1 ORDER BY first_seen_at DESC",
            JOB_COLUMNS
        ))?;
        let rows = stmt.query_map([since], Self::row_to_job)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list recent jobs")
    }

    pub fn list_jobs(&self, source: Option<&str>) -> Result<Vec<Job>> {
        let mut sql = String::from(JOB_COLUMNS);
        if source.is_some() {
            sql.push_str(" WHERE source = ?1");
        }
        sql.push_str(" ORDER BY first_seen_at DESC");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = if let Some(s) = source {
            stmt.query_map([s], Self::row_to_job)?
        } else {
            stmt.query_map([], Self::row_to_job)?
        };

        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list jobs")
    }

    pub fn delete_job(&self, id: &str) -> Result<bool> {
        let changed = self.conn.execute("DELETE FROM jobs WHERE id = ?1", [id])?;
        Ok(changed > 0)
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        let employment_type: Option<String> = row.get(9)?;
        let employment_type = employment_type
            .map(|s| s.parse::<EmploymentType>())
            .transpose()
            .map_err(|e| conversion_error(9, Box::new(e)))?;

        Ok(Job {
            id: row.get(0)?,
            title: row.get(1)?,
            company: row.get(2)?,
            url: row.get(3)?,
            source: row.get(4)?,
            country: row.get(5)?,
            municipality_code: row.get(6)?,
            region_code: row.get(7)?,
            location_raw: row.get(8)?,
            employment_type,
            first_seen_at: row.get(10)?,
        })
    }

    // --- Queue operations ---

    /// True if the user has any queue entry, delivered or not.
    pub fn has_queue_entries(&self, user_id: i64) -> Result<bool> {
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM user_job_queue WHERE user_id = ?1)",
            [user_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Inserts `(user, job)` pairs in one transaction, skipping pairs that
    /// already exist. Returns how many rows were actually added.
    pub fn insert_queue_entries(
        &self,
        entries: &[(i64, String)],
        queued_at: DateTime<Utc>,
    ) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let inserted = write_queue_entries(&tx, entries, queued_at)?;
        tx.commit()?;

        debug!(requested = entries.len(), inserted, "queue entries written");
        Ok(inserted)
    }

    pub fn queue_entries(&self, user_id: i64) -> Result<Vec<QueueEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT user_id, job_id, queued_at, sent_at FROM user_job_queue
             WHERE user_id = ?1 ORDER BY queued_at, job_id",
        )?;
        let rows = stmt.query_map([user_id], |row| {
            Ok(QueueEntry {
                user_id: row.get(0)?,
                job_id: row.get(1)?,
                queued_at: row.get(2)?,
                sent_at: row.get(3)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list queue entries")
    }

    pub fn unsent_jobs_for_user(&self, user_id: i64) -> Result<Vec<Job>> {
        let mut stmt = self.conn.prepare(
            "SELECT j.id, j.title, j.company, j.url, j.source, j.country, j.municipality_code,
                    j.lan_code, j.location_raw, j.employment_type, j.first_seen_at
             FROM user_job_queue q
             JOIN jobs j ON j.id = q.job_id
             WHERE q.user_id = ?1 AND q.sent_at IS NULL
             ORDER BY j.source, j.first_seen_at",
        )?;
        let rows = stmt.query_map([user_id], Self::row_to_job)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list unsent jobs")
    }

    /// Stamps still-unsent entries; already sent ones keep their timestamp.
    pub fn mark_queue_sent(
        &self,
        user_id: i64,
        job_ids: &[String],
        sent_at: DateTime<Utc>,
    ) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let mut updated = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE user_job_queue SET sent_at = ?1
                 WHERE user_id = ?2 AND job_id = ?3 AND sent_at IS NULL",
            )?;
            for job_id in job_ids {
                updated += stmt.execute(params![sent_at, user_id, job_id])?;
            }
        }
        tx.commit()?;
        Ok(updated)
    }

    pub fn dismiss_queue_entry(&self, user_id: i64, job_id: &str) -> Result<bool> {
        let changed = self.conn.execute(
            "DELETE FROM user_job_queue WHERE user_id = ?1 AND job_id = ?2",
            params![user_id, job_id],
        )?;
        Ok(changed > 0)
    }

    /// Subscribed users whose delivery days include `weekday` (1 = Monday).
    pub fn digest_recipients(&self, weekday: u8) -> Result<Vec<Recipient>> {
        let mut stmt = self.conn.prepare(
            "SELECT u.id, u.email, p.delivery_days
             FROM users u
             JOIN user_preferences p ON p.user_id = u.id
             WHERE u.subscription_status IN ('active', 'trialing')
             ORDER BY u.id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                Recipient {
                    user_id: row.get(0)?,
                    email: row.get(1)?,
                },
                json_column::<BTreeSet<u8>>(row, 2)?,
            ))
        })?;

        let mut recipients = Vec::new();
        for row in rows {
            let (recipient, days) = row?;
            if days.contains(&weekday) {
                recipients.push(recipient);
            }
        }
        Ok(recipients)
    }

    // --- Location lookup ---

    /// Swaps the whole lookup table for `locations`.
    pub fn replace_locations(&self, locations: &[SwedishLocation]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM swedish_locations", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO swedish_locations
                    (municipality_code, municipality_name, lan_code, lan_name)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for loc in locations {
                stmt.execute(params![
                    loc.municipality_code,
                    loc.municipality_name,
                    loc.lan_code,
                    loc.lan_name
                ])?;
            }
        }
        tx.commit()?;
        Ok(locations.len())
    }

    pub fn fetch_locations(&self) -> Result<Vec<SwedishLocation>> {
        let mut stmt = self.conn.prepare(
            "SELECT municipality_code, municipality_name, lan_code, lan_name
             FROM swedish_locations ORDER BY municipality_code",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(SwedishLocation {
                municipality_code: row.get(0)?,
                municipality_name: row.get(1)?,
                lan_code: row.get(2)?,
                lan_name: row.get(3)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to load locations")
    }
}

const JOB_COLUMNS: &str = "SELECT id, title, company, url, source, country, municipality_code,
        lan_code, location_raw, employment_type, first_seen_at
     FROM jobs";

fn write_preferences(conn: &Connection, prefs: &UserPreferences, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "INSERT INTO user_preferences
            (user_id, delivery_days, keywords_include, keywords_exclude, sources_enabled,
             countries, regions, municipalities, employment_types, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT (user_id) DO UPDATE SET
            delivery_days = excluded.delivery_days,
            keywords_include = excluded.keywords_include,
            keywords_exclude = excluded.keywords_exclude,
            sources_enabled = excluded.sources_enabled,
            countries = excluded.countries,
            regions = excluded.regions,
            municipalities = excluded.municipalities,
            employment_types = excluded.employment_types,
            updated_at = excluded.updated_at",
        params![
            prefs.user_id,
            serde_json::to_string(&prefs.delivery_days)?,
            serde_json::to_string(&prefs.keywords_include)?,
            serde_json::to_string(&prefs.keywords_exclude)?,
            serde_json::to_string(&prefs.sources)?,
            serde_json::to_string(&prefs.countries)?,
            serde_json::to_string(&prefs.regions)?,
            serde_json::to_string(&prefs.municipalities)?,
            serde_json::to_string(&prefs.employment_types)?,
            now,
        ],
    )
    .with_context(|| format!("Failed to save preferences for user #{}", prefs.user_id))?;
    Ok(())
}

fn write_job(conn: &Connection, job: &Job) -> Result<bool> {
    let inserted = conn
        .execute(
            "INSERT OR IGNORE INTO jobs
                (id, title, company, url, source, country, municipality_code, lan_code,
                 location_raw, employment_type, first_seen_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                job.id,
                job.title,
                job.company,
                job.url,
                job.source,
                job.country,
                job.municipality_code,
                job.region_code,
                job.location_raw,
                job.employment_type.map(|e| e.as_str()),
                job.first_seen_at,
            ],
        )
        .with_context(|| format!("Failed to store job {}", job.id))?;
    Ok(inserted > 0)
}

fn write_queue_entries(
    conn: &Connection,
    entries: &[(i64, String)],
    queued_at: DateTime<Utc>,
) -> Result<usize> {
    if entries.is_empty() {
        return Ok(0);
    }

    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO user_job_queue (user_id, job_id, queued_at)
         VALUES (?1, ?2, ?3)",
    )?;
    let mut inserted = 0;
    for (user_id, job_id) in entries {
        inserted += stmt
            .execute(params![user_id, job_id, queued_at])
            .with_context(|| format!("Failed to queue job {} for user #{}", job_id, user_id))?;
    }
    Ok(inserted)
}

fn json_column<T: serde::de::DeserializeOwned>(
    row: &rusqlite::Row,
    idx: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, Box::new(e)))
}

fn conversion_error(
    idx: usize,
    err: Box<dyn std::error::Error + Send + Sync + 'static>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err)
}
