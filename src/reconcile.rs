use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, info};

use crate::db::{Database, StoredBatch};
use crate::matcher::matches;
use crate::models::Job;

/// How far back bootstrap looks for jobs to queue.
pub const LOOKBACK_DAYS: i64 = 14;

pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// The identity the caller was authenticated as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: i64,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("user #{caller} may not reconcile the queue of user #{target}")]
    Forbidden { caller: i64, target: i64 },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub struct QueueReconciler<'a, C: Clock> {
    db: &'a Database,
    clock: C,
}

impl<'a, C: Clock> QueueReconciler<'a, C> {
    pub fn new(db: &'a Database, clock: C) -> Self {
        Self { db, clock }
    }

    /// Fills the caller's empty queue from the last `LOOKBACK_DAYS` of jobs.
    ///
    /// One-time: a user with any queue entry, sent or not, is left alone
    /// and 0 is returned. Missing preferences also give 0.
    pub fn bootstrap(&self, caller: &AuthenticatedUser) -> Result<usize, QueueError> {
        let user_id = caller.user_id;

        if self.db.has_queue_entries(user_id)? {
            debug!(user_id, "queue already populated, skipping bootstrap");
            return Ok(0);
        }

        let Some(prefs) = self.db.get_preferences(user_id)? else {
            debug!(user_id, "no preferences, nothing to bootstrap");
            return Ok(0);
        };

        let now = self.clock.now();
        let since = now - Duration::days(LOOKBACK_DAYS);
        let candidates = self.db.jobs_seen_since(since)?;

        let entries: Vec<(i64, String)> = candidates
            .iter()
            .filter(|job| matches(job, &prefs))
            .map(|job| (user_id, job.id.clone()))
            .collect();

        let inserted = self.db.insert_queue_entries(&entries, now)?;
        info!(
            user_id,
            candidates = candidates.len(),
            matched = entries.len(),
            inserted,
            "bootstrapped queue"
        );
        Ok(inserted)
    }

    /// As `bootstrap`, for callers that name the queue explicitly.
    pub fn bootstrap_for(
        &self,
        caller: &AuthenticatedUser,
        user_id: i64,
    ) -> Result<usize, QueueError> {
        if caller.user_id != user_id {
            return Err(QueueError::Forbidden {
                caller: caller.user_id,
                target: user_id,
            });
        }
        self.bootstrap(caller)
    }

    /// Stores freshly ingested jobs and queues them for every subscribed
    /// user they match. Jobs and queue rows commit together.
    pub fn queue_new_jobs(&self, jobs: &[Job]) -> Result<StoredBatch, QueueError> {
        if jobs.is_empty() {
            return Ok(StoredBatch::default());
        }

        let users = self.db.subscribed_preferences()?;
        let entries: Vec<(i64, String)> = users
            .iter()
            .flat_map(|prefs| {
                jobs.iter()
                    .filter(move |job| matches(job, prefs))
                    .map(move |job| (prefs.user_id, job.id.clone()))
            })
            .collect();

        let batch = self
            .db
            .store_jobs_with_queue(jobs, &entries, self.clock.now())?;
        info!(
            jobs = jobs.len(),
            users = users.len(),
            added = batch.jobs_added,
            queued = batch.queued,
            "queued new jobs"
        );
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EmploymentType, Filter, SubscriptionStatus, UserPreferences};
    use chrono::TimeZone;

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 8, 0, 0).unwrap()
    }

    fn job(id: &str, title: &str, age_days: i64) -> Job {
        Job {
            id: id.to_string(),
            title: title.to_string(),
            company: "Acme".to_string(),
            url: format!("https://example.com/{}", id),
            source: "wise".to_string(),
            country: Some("SE".to_string()),
            municipality_code: None,
            region_code: Some("01".to_string()),
            location_raw: None,
            employment_type: Some(EmploymentType::Permanent),
            first_seen_at: now() - Duration::days(age_days),
        }
    }

    fn setup() -> (Database, AuthenticatedUser) {
        let db = Database::open_in_memory().unwrap();
        db.init().unwrap();
        let user_id = db
            .create_user("anna@example.com", SubscriptionStatus::Trialing, now())
            .unwrap();

        let mut prefs = UserPreferences::unrestricted(user_id);
        prefs.keywords_include = Filter::from_values(["VP".to_string()]);
        prefs.keywords_exclude = Filter::from_values(["assistant".to_string()]);
        db.save_preferences(prefs, now()).unwrap();

        for j in [
            job("a", "VP of Sales", 1),
            job("b", "Assistant to the VP", 2),
            job("c", "VP Marketing", 13),
            job("d", "VP Finance", 15),
            job("e", "Backend Engineer", 0),
        ] {
            db.insert_job(&j).unwrap();
        }
        (db, AuthenticatedUser { user_id })
    }

    fn queued_ids(db: &Database, user_id: i64) -> Vec<String> {
        db.queue_entries(user_id)
            .unwrap()
            .into_iter()
            .map(|e| e.job_id)
            .collect()
    }

    #[test]
    fn test_bootstrap_queues_recent_matches() {
        let (db, caller) = setup();
        let reconciler = QueueReconciler::new(&db, FixedClock(now()));

        assert_eq!(reconciler.bootstrap(&caller).unwrap(), 2);
        assert_eq!(queued_ids(&db, caller.user_id), vec!["a", "c"]);
    }

    #[test]
    fn test_bootstrap_window_includes_its_first_day() {
        let (db, caller) = setup();
        db.insert_job(&job("x", "VP Operations", LOOKBACK_DAYS)).unwrap();
        let reconciler = QueueReconciler::new(&db, FixedClock(now()));

        assert_eq!(reconciler.bootstrap(&caller).unwrap(), 3);
        assert_eq!(queued_ids(&db, caller.user_id), vec!["a", "c", "x"]);
    }

    #[test]
    fn test_bootstrap_is_idempotent() {
        let (db, caller) = setup();
        let reconciler = QueueReconciler::new(&db, FixedClock(now()));

        assert_eq!(reconciler.bootstrap(&caller).unwrap(), 2);
        assert_eq!(reconciler.bootstrap(&caller).unwrap(), 0);
        assert_eq!(queued_ids(&db, caller.user_id).len(), 2);
    }

    #[test]
    fn test_sent_entries_still_block_bootstrap() {
        let (db, caller) = setup();
        db.insert_queue_entries(&[(caller.user_id, "e".to_string())], now())
            .unwrap();
        db.mark_queue_sent(caller.user_id, &["e".to_string()], now())
            .unwrap();

        let reconciler = QueueReconciler::new(&db, FixedClock(now()));
        assert_eq!(reconciler.bootstrap(&caller).unwrap(), 0);
        assert_eq!(queued_ids(&db, caller.user_id), vec!["e"]);
    }

    #[test]
    fn test_bootstrap_without_preferences_returns_zero() {
        let (db, _) = setup();
        let reconciler = QueueReconciler::new(&db, FixedClock(now()));
        let stranger = AuthenticatedUser { user_id: 999 };

        assert_eq!(reconciler.bootstrap(&stranger).unwrap(), 0);
    }

    #[test]
    fn test_bootstrap_with_no_recent_jobs_returns_zero() {
        let (db, caller) = setup();
        let later = now() + Duration::days(30);
        let reconciler = QueueReconciler::new(&db, FixedClock(later));

        assert_eq!(reconciler.bootstrap(&caller).unwrap(), 0);
        assert!(!db.has_queue_entries(caller.user_id).unwrap());
    }

    #[test]
    fn test_bootstrap_for_other_user_is_forbidden() {
        let (db, caller) = setup();
        let other = db.create_user("bo@example.com", SubscriptionStatus::Active, now()).unwrap();
        let reconciler = QueueReconciler::new(&db, FixedClock(now()));

        let err = reconciler.bootstrap_for(&caller, other).unwrap_err();
        assert!(matches!(err, QueueError::Forbidden { target, .. } if target == other));
        assert!(!db.has_queue_entries(other).unwrap());

        assert_eq!(reconciler.bootstrap_for(&caller, caller.user_id).unwrap(), 2);
    }

    #[test]
    fn test_queue_new_jobs_only_for_subscribers() {
        let (db, anna) = setup();
        let bo = db.create_user("bo@example.com", SubscriptionStatus::Active, now()).unwrap();
        db.save_preferences(UserPreferences::unrestricted(bo), now())
            .unwrap();
        let cleo = db.create_user("cleo@example.com", SubscriptionStatus::Canceled, now()).unwrap();
        db.save_preferences(UserPreferences::unrestricted(cleo), now())
            .unwrap();

        let fresh = job("f", "VP Nordics", 0);

        let reconciler = QueueReconciler::new(&db, FixedClock(now()));
        let batch = reconciler.queue_new_jobs(&[fresh.clone()]).unwrap();
        assert_eq!(batch.jobs_added, 1);
        assert_eq!(batch.queued, 2);
        assert_eq!(queued_ids(&db, anna.user_id), vec!["f"]);
        assert_eq!(queued_ids(&db, bo), vec!["f"]);
        assert!(queued_ids(&db, cleo).is_empty());

        // Replaying the same ingestion adds nothing.
        let replay = reconciler.queue_new_jobs(&[fresh]).unwrap();
        assert_eq!(replay, StoredBatch::default());
    }

    #[test]
    fn test_bootstrap_and_incremental_agree() {
        let (db, caller) = setup();
        let reconciler = QueueReconciler::new(&db, FixedClock(now()));
        let recent = db.jobs_seen_since(now() - Duration::days(LOOKBACK_DAYS)).unwrap();

        reconciler.queue_new_jobs(&recent).unwrap();
        let incremental = queued_ids(&db, caller.user_id);

        let (db2, caller2) = setup();
        QueueReconciler::new(&db2, FixedClock(now()))
            .bootstrap(&caller2)
            .unwrap();

        assert_eq!(incremental, queued_ids(&db2, caller2.user_id));
    }

    #[test]
    fn test_uniqueness_after_repeated_runs() {
        let (db, caller) = setup();
        let reconciler = QueueReconciler::new(&db, FixedClock(now()));
        let recent = db.jobs_seen_since(now() - Duration::days(LOOKBACK_DAYS)).unwrap();

        for _ in 0..3 {
            reconciler.bootstrap(&caller).unwrap();
            reconciler.queue_new_jobs(&recent).unwrap();
        }

        let mut ids = queued_ids(&db, caller.user_id);
        let total = ids.len();
        ids.dedup();
        assert_eq!(ids.len(), total);
    }
}
